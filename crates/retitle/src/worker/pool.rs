use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use super::executor::JobExecutor;
use crate::broker::{Broker, BrokerError};

/// How long a worker blocks on the broker before rechecking the shutdown flag.
const RECEIVE_WAIT: Duration = Duration::from_millis(100);

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    broker: Arc<dyn Broker>,
}

impl WorkerPool {
    /// Spawns `worker_count` threads pulling from the executor's broker.
    /// A count of zero starts one worker.
    pub fn start(executor: JobExecutor, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let broker = Arc::clone(executor.broker());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_executor = executor.clone();

            let handle = thread::spawn(move || {
                run_worker(worker_id, worker_executor, shutdown_flag);
            });

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            workers,
            shutdown,
            broker,
        }
    }

    /// Asks workers to stop after their current delivery. Undelivered tasks
    /// stay in the broker.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

fn run_worker(worker_id: usize, executor: JobExecutor, shutdown: Arc<AtomicBool>) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match executor.broker().receive(RECEIVE_WAIT) {
            Ok(Some(delivery)) => {
                debug!(
                    "Worker {} processing job {} (attempt {})",
                    worker_id, delivery.message.job_id, delivery.attempt
                );
                executor.process_delivery(delivery);
            }
            Ok(None) => continue,
            Err(BrokerError::Closed) => {
                debug!("Worker {} broker closed", worker_id);
                break;
            }
            Err(e) => {
                error!("Worker {} failed to receive: {}", worker_id, e);
                thread::sleep(RECEIVE_WAIT);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
