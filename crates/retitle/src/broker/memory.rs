use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use super::{Broker, BrokerError, Delivery, TaskMessage, TaskOptions};
use crate::status::JobId;

/// Upper bound on one blocking wait, so delayed tasks and expired leases are
/// noticed while a consumer is idle.
const POLL_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Envelope {
    message: TaskMessage,
    options: TaskOptions,
    attempt: u32,
}

#[derive(Debug)]
struct Delayed {
    due: Instant,
    seq: u64,
    envelope: Envelope,
}

// Min-heap on (due, seq).
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

#[derive(Debug)]
struct Lease {
    envelope: Envelope,
    expires: Instant,
}

#[derive(Debug, Default)]
struct State {
    delayed: BinaryHeap<Delayed>,
    leases: HashMap<u64, Lease>,
    /// Multiset of job ids currently sitting in the ready channel.
    ready: HashMap<JobId, usize>,
    next_seq: u64,
    next_lease: u64,
}

impl State {
    fn mark_ready(&mut self, job_id: JobId) {
        *self.ready.entry(job_id).or_insert(0) += 1;
    }

    fn unmark_ready(&mut self, job_id: JobId) {
        if let Some(count) = self.ready.get_mut(&job_id) {
            *count -= 1;
            if *count == 0 {
                self.ready.remove(&job_id);
            }
        }
    }
}

/// In-process broker: a crossbeam channel of ready tasks, a heap of tasks
/// waiting out their backoff and a table of in-flight leases.
pub struct MemoryBroker {
    ready_tx: Sender<Envelope>,
    ready_rx: Receiver<Envelope>,
    state: Mutex<State>,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = unbounded();
        Self {
            ready_tx,
            ready_rx,
            state: Mutex::new(State::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("broker state lock poisoned".to_string()))
    }

    fn enqueue_ready(&self, state: &mut State, envelope: Envelope) -> Result<(), BrokerError> {
        let job_id = envelope.message.job_id;
        self.ready_tx
            .send(envelope)
            .map_err(|_| BrokerError::Closed)?;
        state.mark_ready(job_id);
        Ok(())
    }

    /// Moves due delayed tasks to the ready channel and re-presents
    /// deliveries whose lease ran out.
    fn promote(&self, now: Instant) -> Result<(), BrokerError> {
        let mut state = self.lock()?;

        while state.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(delayed) = state.delayed.pop() {
                self.enqueue_ready(&mut state, delayed.envelope)?;
            }
        }

        let expired: Vec<u64> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            let Some(lease) = state.leases.remove(&lease_id) else {
                continue;
            };
            let mut envelope = lease.envelope;
            if envelope.attempt < envelope.options.max_attempts() {
                warn!(
                    "Lease expired for job {} (attempt {}), re-presenting",
                    envelope.message.job_id, envelope.attempt
                );
                envelope.attempt += 1;
                self.enqueue_ready(&mut state, envelope)?;
            } else {
                warn!(
                    "Lease expired for job {} on its last attempt, dropping task",
                    envelope.message.job_id
                );
            }
        }
        Ok(())
    }

    fn lease(&self, envelope: Envelope, now: Instant) -> Result<Delivery, BrokerError> {
        let mut state = self.lock()?;
        state.unmark_ready(envelope.message.job_id);
        state.next_lease += 1;
        let lease_id = state.next_lease;
        let delivery = Delivery::new(
            envelope.message,
            envelope.options.clone(),
            envelope.attempt,
            lease_id,
        );
        state.leases.insert(
            lease_id,
            Lease {
                expires: now + envelope.options.timeout,
                envelope,
            },
        );
        Ok(delivery)
    }
}

impl Broker for MemoryBroker {
    fn push(&self, message: TaskMessage, options: TaskOptions) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(BrokerError::Closed);
        }
        let mut state = self.lock()?;
        self.enqueue_ready(
            &mut state,
            Envelope {
                message,
                options,
                attempt: 1,
            },
        )?;
        debug!("Pushed task for job {}", message.job_id);
        Ok(())
    }

    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(BrokerError::Closed);
            }
            self.promote(Instant::now())?;

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            match self.ready_rx.recv_timeout(remaining.min(POLL_TICK)) {
                Ok(envelope) => return self.lease(envelope, Instant::now()).map(Some),
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(BrokerError::Closed),
            }
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if state.leases.remove(&delivery.lease_id()).is_none() {
            debug!(
                "Ignoring ack for job {}: lease {} no longer held",
                delivery.message.job_id,
                delivery.lease_id()
            );
        }
        Ok(())
    }

    fn nack(&self, delivery: Delivery) -> Result<bool, BrokerError> {
        let mut state = self.lock()?;
        let Some(lease) = state.leases.remove(&delivery.lease_id()) else {
            debug!(
                "Ignoring nack for job {}: lease {} no longer held",
                delivery.message.job_id,
                delivery.lease_id()
            );
            return Ok(false);
        };

        let mut envelope = lease.envelope;
        let Some(delay) = envelope.options.delay_after(envelope.attempt) else {
            warn!(
                "Job {} exhausted {} attempts, dropping task",
                envelope.message.job_id, envelope.attempt
            );
            return Ok(false);
        };
        envelope.attempt += 1;
        debug!(
            "Retrying job {} in {:?} (attempt {})",
            envelope.message.job_id, delay, envelope.attempt
        );
        state.next_seq += 1;
        let seq = state.next_seq;
        state.delayed.push(Delayed {
            due: Instant::now() + delay,
            seq,
            envelope,
        });
        Ok(true)
    }

    fn len(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.ready.values().sum::<usize>() + state.delayed.len() + state.leases.len(),
            Err(_) => 0,
        }
    }

    fn flush(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let dropped = self.ready_rx.try_iter().count() + state.delayed.len() + state.leases.len();
        state.delayed.clear();
        state.leases.clear();
        state.ready.clear();
        if dropped > 0 {
            warn!("Flushed {} tasks from broker", dropped);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn holds(&self, job_id: JobId) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.ready.contains_key(&job_id)
            || state.delayed.iter().any(|d| d.envelope.message.job_id == job_id)
            || state
                .leases
                .values()
                .any(|lease| lease.envelope.message.job_id == job_id)
    }
}
