//! In-memory collaborators that record calls and can be told to fail.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use retitle::client::{EvaluationContext, TitleVerdict};
use retitle::{Document, DocumentSystem, TitleEvaluator, UpstreamError};

/// A write made against the fake document system.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    UpdateTitle { document_id: i64, title: String },
    SetCustomField { document_id: i64, field: String, value: String },
}

type FetchHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct FakeDocuments {
    documents: Mutex<HashMap<i64, Document>>,
    calls: Mutex<Vec<Call>>,
    fetch_failures: Mutex<VecDeque<UpstreamError>>,
    update_failures: Mutex<VecDeque<UpstreamError>>,
    fetches: Mutex<u32>,
    fetch_hook: Mutex<Option<FetchHook>>,
}

impl FakeDocuments {
    pub fn insert(&self, document: Document) {
        self.documents.lock().unwrap().insert(document.id, document);
    }

    pub fn get(&self, document_id: i64) -> Option<Document> {
        self.documents.lock().unwrap().get(&document_id).cloned()
    }

    /// Changes the title behind the engine's back.
    pub fn retitle(&self, document_id: i64, title: &str) {
        if let Some(doc) = self.documents.lock().unwrap().get_mut(&document_id) {
            doc.title = Some(title.to_string());
        }
    }

    pub fn fail_next_fetch(&self, error: UpstreamError) {
        self.fetch_failures.lock().unwrap().push_back(error);
    }

    /// Runs `hook` inside the next `fetch`, before the document is returned.
    pub fn on_next_fetch(&self, hook: impl FnOnce() + Send + 'static) {
        *self.fetch_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_next_update(&self, error: UpstreamError) {
        self.update_failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn title_updates(&self, document_id: i64) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::UpdateTitle { document_id: id, .. } if *id == document_id))
            .count()
    }

    pub fn fetch_count(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }
}

impl DocumentSystem for FakeDocuments {
    fn fetch(&self, document_id: i64) -> Result<Document, UpstreamError> {
        *self.fetches.lock().unwrap() += 1;
        let hook = self.fetch_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(error) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.get(document_id).ok_or(UpstreamError::NotFound {
            what: format!("document {document_id}"),
        })
    }

    fn update_title(&self, document_id: i64, title: &str) -> Result<(), UpstreamError> {
        if let Some(error) = self.update_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut documents = self.documents.lock().unwrap();
        let doc = documents.get_mut(&document_id).ok_or(UpstreamError::NotFound {
            what: format!("document {document_id}"),
        })?;
        doc.title = Some(title.to_string());
        self.calls.lock().unwrap().push(Call::UpdateTitle {
            document_id,
            title: title.to_string(),
        });
        Ok(())
    }

    fn set_custom_field(&self, document_id: i64, field: &str, value: &str) -> Result<(), UpstreamError> {
        let mut documents = self.documents.lock().unwrap();
        let doc = documents.get_mut(&document_id).ok_or(UpstreamError::NotFound {
            what: format!("document {document_id}"),
        })?;
        doc.custom_fields
            .insert(field.trim().to_lowercase(), value.to_string());
        self.calls.lock().unwrap().push(Call::SetCustomField {
            document_id,
            field: field.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}

/// Evaluator answering from a script, then with a fallback verdict.
pub struct ScriptedEvaluator {
    script: Mutex<VecDeque<Result<TitleVerdict, UpstreamError>>>,
    fallback: Mutex<TitleVerdict>,
    calls: Mutex<u32>,
}

impl ScriptedEvaluator {
    pub fn new(fallback: TitleVerdict) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: Mutex::new(0),
        }
    }

    pub fn push(&self, answer: Result<TitleVerdict, UpstreamError>) {
        self.script.lock().unwrap().push_back(answer);
    }

    pub fn set_fallback(&self, verdict: TitleVerdict) {
        *self.fallback.lock().unwrap() = verdict;
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl TitleEvaluator for ScriptedEvaluator {
    fn evaluate(&self, _context: &EvaluationContext<'_>) -> Result<TitleVerdict, UpstreamError> {
        *self.calls.lock().unwrap() += 1;
        match self.script.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => Ok(self.fallback.lock().unwrap().clone()),
        }
    }
}
