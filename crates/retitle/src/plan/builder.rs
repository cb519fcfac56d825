use std::sync::Arc;

use tracing::{debug, info_span};

use super::eligibility::{self, Eligibility};
use super::{Plan, PlanDecision, PlanError, OCR_EXCERPT_CHARS};
use crate::client::{Document, DocumentSystem, EvaluationContext, TitleEvaluator, Verdict};
use crate::config::Settings;

/// Builds plans from the document system and the title evaluator.
#[derive(Clone)]
pub struct PlanBuilder {
    documents: Arc<dyn DocumentSystem>,
    evaluator: Arc<dyn TitleEvaluator>,
}

impl PlanBuilder {
    pub fn new(documents: Arc<dyn DocumentSystem>, evaluator: Arc<dyn TitleEvaluator>) -> Self {
        Self {
            documents,
            evaluator,
        }
    }

    /// Fetches the document and decides what to do with its title.
    ///
    /// Collaborator failures come back as [`PlanError::Upstream`] unchanged,
    /// so a timeout is never mistaken for a "no change" decision.
    pub fn build_plan(&self, document_id: i64, settings: &Settings) -> Result<Plan, PlanError> {
        let _span = info_span!("build_plan", document_id).entered();

        let document = {
            let _step = info_span!("fetch_document").entered();
            self.documents.fetch(document_id)?
        };

        self.decide(&document, settings)
    }

    /// Builds a plan without touching the record store or the document.
    pub fn dry_run(&self, document_id: i64, settings: &Settings) -> Result<Plan, PlanError> {
        self.build_plan(document_id, settings)
    }

    /// Decision for an already fetched document.
    pub fn decide(&self, document: &Document, settings: &Settings) -> Result<Plan, PlanError> {
        let eligibility = {
            let _step = info_span!("eligibility").entered();
            eligibility::evaluate(document, &settings.tags, settings.original_title_field())
        };
        if let Eligibility::Ineligible(reason) = eligibility {
            return Ok(plan_for(
                document,
                PlanDecision::Ineligible {
                    reason: reason.to_string(),
                },
                None,
            ));
        }

        let existing_title = document.existing_title();
        let verdict = {
            let _step = info_span!("evaluate_title").entered();
            self.evaluator.evaluate(&EvaluationContext {
                document,
                existing_title,
                prompt_char_limit: settings.llm.prompt_char_limit,
            })?
        };

        let decision = match verdict.verdict {
            Verdict::Keep => PlanDecision::NoChangeNeeded {
                reason: "LLM approved existing title".to_string(),
            },
            Verdict::Replace => {
                let title = verdict
                    .proposed_title
                    .as_deref()
                    .map(str::trim)
                    .filter(|title| !title.is_empty())
                    .ok_or_else(|| {
                        PlanError::InvalidResponse("evaluator proposed an empty title".to_string())
                    })?;
                match existing_title {
                    Some(existing) if existing.to_lowercase() == title.to_lowercase() => {
                        PlanDecision::NoChangeNeeded {
                            reason: "no improvement over existing title".to_string(),
                        }
                    }
                    Some(_) => PlanDecision::NewTitle {
                        title: title.to_string(),
                        confidence: verdict.confidence,
                        reason: "LLM flagged existing title".to_string(),
                    },
                    None => PlanDecision::NewTitle {
                        title: title.to_string(),
                        confidence: verdict.confidence,
                        reason: "missing existing title".to_string(),
                    },
                }
            }
        };

        debug!(document_id = document.id, decision = ?decision, "plan built");
        Ok(plan_for(document, decision, Some(verdict.raw_response)))
    }
}

fn plan_for(
    document: &Document,
    decision: PlanDecision,
    raw_response: Option<serde_json::Value>,
) -> Plan {
    Plan {
        document_id: document.id,
        decision,
        existing_title: document.existing_title().map(str::to_string),
        tags: document.tag_slugs(),
        correspondent: document.correspondent.clone(),
        ocr_excerpt: document
            .content
            .as_deref()
            .map(|content| content.chars().take(OCR_EXCERPT_CHARS).collect()),
        raw_response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Tag, TitleVerdict, UpstreamError};
    use serde_json::json;
    use std::sync::Mutex;

    struct OneDocument(Document);

    impl DocumentSystem for OneDocument {
        fn fetch(&self, document_id: i64) -> Result<Document, UpstreamError> {
            if document_id == self.0.id {
                Ok(self.0.clone())
            } else {
                Err(UpstreamError::NotFound {
                    what: format!("document {document_id}"),
                })
            }
        }

        fn update_title(&self, _: i64, _: &str) -> Result<(), UpstreamError> {
            panic!("plan building must not write");
        }

        fn set_custom_field(&self, _: i64, _: &str, _: &str) -> Result<(), UpstreamError> {
            panic!("plan building must not write");
        }
    }

    struct Scripted {
        verdict: Result<TitleVerdict, UpstreamError>,
        seen_titles: Mutex<Vec<Option<String>>>,
    }

    impl Scripted {
        fn replace(title: &str, confidence: Option<f64>) -> Self {
            Self::with(Ok(TitleVerdict {
                verdict: Verdict::Replace,
                proposed_title: Some(title.to_string()),
                confidence,
                raw_response: json!({"suggestion": {"title": title}}),
            }))
        }

        fn with(verdict: Result<TitleVerdict, UpstreamError>) -> Self {
            Self {
                verdict,
                seen_titles: Mutex::new(Vec::new()),
            }
        }
    }

    impl TitleEvaluator for Scripted {
        fn evaluate(&self, context: &EvaluationContext<'_>) -> Result<TitleVerdict, UpstreamError> {
            self.seen_titles
                .lock()
                .unwrap()
                .push(context.existing_title.map(str::to_string));
            self.verdict.clone()
        }
    }

    fn document(title: Option<&str>) -> Document {
        Document {
            id: 42,
            title: title.map(str::to_string),
            content: Some("x".repeat(1000)),
            tags: vec![Tag {
                id: 1,
                name: "Inbox".into(),
                slug: "inbox".into(),
            }],
            ..Default::default()
        }
    }

    fn builder(doc: Document, evaluator: Arc<Scripted>) -> PlanBuilder {
        PlanBuilder::new(Arc::new(OneDocument(doc)), evaluator)
    }

    #[test]
    fn test_new_title_for_untitled_document() {
        let evaluator = Arc::new(Scripted::replace("ACME Invoice 2024", Some(0.9)));
        let plan = builder(document(None), evaluator.clone())
            .build_plan(42, &Settings::default())
            .unwrap();

        assert_eq!(plan.proposed_title(), Some("ACME Invoice 2024"));
        assert_eq!(plan.confidence(), Some(0.9));
        assert_eq!(plan.reason(), "missing existing title");
        assert_eq!(plan.tags, vec!["inbox"]);
        assert_eq!(plan.ocr_excerpt.as_ref().map(|e| e.len()), Some(OCR_EXCERPT_CHARS));
        assert!(plan.raw_response.is_some());
        assert_eq!(*evaluator.seen_titles.lock().unwrap(), vec![None]);
    }

    #[test]
    fn test_existing_title_is_passed_to_evaluator() {
        let evaluator = Arc::new(Scripted::replace("Better", Some(0.8)));
        let plan = builder(document(Some(" scan_001 ")), evaluator.clone())
            .build_plan(42, &Settings::default())
            .unwrap();
        assert_eq!(plan.reason(), "LLM flagged existing title");
        assert_eq!(plan.existing_title.as_deref(), Some("scan_001"));
        assert_eq!(
            *evaluator.seen_titles.lock().unwrap(),
            vec![Some("scan_001".to_string())]
        );
    }

    #[test]
    fn test_keep_verdict_means_no_change() {
        let evaluator = Arc::new(Scripted::with(Ok(TitleVerdict {
            verdict: Verdict::Keep,
            proposed_title: None,
            confidence: Some(0.95),
            raw_response: json!({}),
        })));
        let plan = builder(document(Some("Good title")), evaluator)
            .build_plan(42, &Settings::default())
            .unwrap();
        assert!(matches!(plan.decision, PlanDecision::NoChangeNeeded { .. }));
        assert_eq!(plan.reason(), "LLM approved existing title");
    }

    #[test]
    fn test_same_title_ignoring_case_means_no_change() {
        let evaluator = Arc::new(Scripted::replace("  acme invoice ", Some(0.9)));
        let plan = builder(document(Some("ACME Invoice")), evaluator)
            .build_plan(42, &Settings::default())
            .unwrap();
        assert_eq!(plan.reason(), "no improvement over existing title");
    }

    #[test]
    fn test_empty_proposal_is_invalid() {
        let evaluator = Arc::new(Scripted::replace("   ", Some(0.9)));
        let err = builder(document(None), evaluator)
            .build_plan(42, &Settings::default())
            .unwrap_err();
        assert!(matches!(err, PlanError::InvalidResponse(_)));
    }

    #[test]
    fn test_ineligible_document_skips_evaluator() {
        let evaluator = Arc::new(Scripted::replace("unused", None));
        let mut settings = Settings::default();
        settings.tags.exclude = vec!["inbox".into()];
        let plan = builder(document(None), evaluator.clone())
            .build_plan(42, &settings)
            .unwrap();
        assert_eq!(
            plan.decision,
            PlanDecision::Ineligible {
                reason: "skip tag present".into()
            }
        );
        assert!(plan.raw_response.is_none());
        assert!(evaluator.seen_titles.lock().unwrap().is_empty());
    }

    #[test]
    fn test_upstream_errors_propagate_typed() {
        let evaluator = Arc::new(Scripted::with(Err(UpstreamError::Timeout {
            service: "llm",
            after: std::time::Duration::from_secs(300),
        })));
        let err = builder(document(None), evaluator)
            .build_plan(42, &Settings::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PlanError::Upstream(UpstreamError::Timeout { .. })
        ));
        assert!(err.is_retryable());

        let evaluator = Arc::new(Scripted::replace("x", None));
        let err = builder(document(None), evaluator)
            .build_plan(7, &Settings::default())
            .unwrap_err();
        assert!(matches!(err, PlanError::Upstream(UpstreamError::NotFound { .. })));
    }
}
