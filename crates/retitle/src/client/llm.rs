//! Title evaluator backed by an OpenAI-compatible chat-completions endpoint.
//!
//! Two calls per document at most: judge the existing title (when there is
//! one), then propose a replacement if the existing title was rejected or
//! missing. The model is asked for JSON only; a reply that does not parse is
//! asked for once more before giving up.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::{json, Map, Value};

use super::{
    map_status, map_transport_error, Document, EvaluationContext, TitleEvaluator, TitleVerdict,
    UpstreamError, Verdict,
};
use crate::config::LlmConfig;

const SERVICE: &str = "llm";
const JSON_ATTEMPTS: usize = 2;

const PROPOSE_INSTRUCTIONS: &str = "You generate concise, specific document titles. \
Respond ONLY with JSON in the format {\"title\":\"<title>\",\"confidence\":0-1}. \
Confidence must be a float between 0 and 1.";

const EVALUATE_INSTRUCTIONS: &str = "Decide if a proposed document title matches the content. \
No generic titles allowed. Respond ONLY with JSON in the format \
{\"decision\":\"GOOD|BAD\",\"acceptable\":true|false,\"confidence\":0-1}. \
Confidence must be a float between 0 and 1.";

pub struct OpenAiTitleEvaluator {
    http: Client,
    endpoint: String,
    token: Option<String>,
    model: String,
    timeout: Duration,
}

/// Parsed verdict on an existing title.
#[derive(Debug, Clone, PartialEq)]
struct Evaluation {
    acceptable: bool,
    confidence: Option<f64>,
    raw: Value,
}

/// Parsed title proposal.
#[derive(Debug, Clone, PartialEq)]
struct Suggestion {
    title: String,
    confidence: Option<f64>,
    raw: Value,
}

impl OpenAiTitleEvaluator {
    pub fn new(config: &LlmConfig) -> Result<Self, UpstreamError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Unavailable {
                service: SERVICE,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint: chat_endpoint(&config.base_url),
            token: config
                .api_token
                .clone()
                .filter(|token| !token.trim().is_empty()),
            model: config.model.clone(),
            timeout,
        })
    }

    fn post(&self, payload: &Value) -> Result<Value, UpstreamError> {
        let mut request = self.http.post(&self.endpoint).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|e| map_transport_error(SERVICE, self.timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let body: String = response.text().unwrap_or_default().chars().take(200).collect();
            return Err(map_status(SERVICE, status.as_u16(), body));
        }
        response
            .json::<Value>()
            .map_err(|e| map_transport_error(SERVICE, self.timeout, e))
    }

    /// Posts and insists on a JSON object reply.
    fn post_for_json(
        &self,
        payload: &Value,
        purpose: &str,
    ) -> Result<(Value, Map<String, Value>), UpstreamError> {
        let mut last_content = String::new();
        for attempt in 1..=JSON_ATTEMPTS {
            let raw = self.post(payload)?;
            let content = extract_content(&raw);
            if let Some(parsed) = parse_json_content(&content) {
                return Ok((raw, parsed));
            }
            log::warn!(
                "LLM {} returned non-JSON content on attempt {}/{}: {:?}",
                purpose,
                attempt,
                JSON_ATTEMPTS,
                truncate(&content, 200)
            );
            last_content = content;
        }
        Err(UpstreamError::InvalidResponse {
            service: SERVICE,
            message: format!(
                "non-JSON response for {purpose} after {JSON_ATTEMPTS} attempts: {:?}",
                truncate(&last_content, 200)
            ),
        })
    }

    fn evaluate_title(&self, title: &str, snippet: &str) -> Result<Evaluation, UpstreamError> {
        let payload = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": EVALUATE_INSTRUCTIONS },
                { "role": "user", "content": format!("Title: {title}\nDocument excerpt:\n{snippet}") },
            ],
        });
        let (raw, parsed) = self.post_for_json(&payload, "evaluate_title")?;
        let evaluation = parse_evaluation(raw, &parsed);
        log::debug!(
            "LLM evaluate_title acceptable={} confidence={:?}",
            evaluation.acceptable,
            evaluation.confidence
        );
        Ok(evaluation)
    }

    fn propose_title(&self, document: &Document, snippet: &str) -> Result<Suggestion, UpstreamError> {
        let context = document_context(document);
        let user_prompt = if context.is_empty() {
            format!("Document text snippet:\n{snippet}")
        } else {
            format!("{context}\nDocument text snippet:\n{snippet}")
        };
        let payload = json!({
            "model": self.model,
            "temperature": 0.3,
            "messages": [
                { "role": "system", "content": PROPOSE_INSTRUCTIONS },
                { "role": "user", "content": user_prompt },
            ],
        });
        let (raw, parsed) = self.post_for_json(&payload, "propose_title")?;
        let suggestion = parse_suggestion(raw, &parsed)?;
        log::debug!(
            "LLM propose_title => '{}' confidence={:?}",
            suggestion.title,
            suggestion.confidence
        );
        Ok(suggestion)
    }
}

impl TitleEvaluator for OpenAiTitleEvaluator {
    fn evaluate(&self, context: &EvaluationContext<'_>) -> Result<TitleVerdict, UpstreamError> {
        let content = context.document.content.as_deref().unwrap_or_default();
        let snippet = truncate(content, context.prompt_char_limit.max(1));

        let evaluation = match context.existing_title {
            Some(title) => Some(self.evaluate_title(title, snippet)?),
            None => None,
        };

        if let Some(evaluation) = evaluation.as_ref().filter(|e| e.acceptable) {
            return Ok(TitleVerdict {
                verdict: Verdict::Keep,
                proposed_title: None,
                confidence: evaluation.confidence,
                raw_response: json!({ "evaluation": evaluation.raw }),
            });
        }

        let suggestion = self.propose_title(context.document, snippet)?;
        Ok(TitleVerdict {
            verdict: Verdict::Replace,
            proposed_title: Some(suggestion.title),
            confidence: suggestion.confidence,
            raw_response: json!({
                "evaluation": evaluation.map(|e| e.raw),
                "suggestion": suggestion.raw,
            }),
        })
    }
}

/// `{base}/chat/completions`, unless the base already names the endpoint.
fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn document_context(document: &Document) -> String {
    let mut lines = Vec::new();
    if let Some(correspondent) = &document.correspondent {
        lines.push(format!("Correspondent: {correspondent}"));
    }
    if let Some(document_type) = &document.document_type {
        lines.push(format!("Document type: {document_type}"));
    }
    if let Some(created) = &document.created {
        lines.push(format!("Date: {created}"));
    }
    lines.join("\n")
}

fn extract_content(response: &Value) -> String {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn parse_json_content(content: &str) -> Option<Map<String, Value>> {
    let text = content.trim();
    if text.is_empty() {
        return None;
    }
    let mut candidates = vec![text.to_string()];
    if text.starts_with("```") {
        candidates.push(strip_code_fence(text));
    }
    candidates
        .iter()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

fn strip_code_fence(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.first().is_some_and(|line| line.starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|line| line.starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Accepts numbers or numeric strings and clamps to [0, 1].
fn normalize_confidence(value: Option<&Value>) -> Option<f64> {
    let confidence = match value? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if confidence.is_nan() {
        return None;
    }
    Some(confidence.clamp(0.0, 1.0))
}

fn parse_evaluation(raw: Value, parsed: &Map<String, Value>) -> Evaluation {
    let decision = parsed
        .get("decision")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_uppercase();
    let acceptable = match parsed.get("acceptable") {
        Some(Value::Bool(flag)) => *flag,
        _ => decision.starts_with("GOOD"),
    };
    Evaluation {
        acceptable,
        confidence: normalize_confidence(parsed.get("confidence")),
        raw,
    }
}

fn parse_suggestion(raw: Value, parsed: &Map<String, Value>) -> Result<Suggestion, UpstreamError> {
    let title = parsed
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .ok_or_else(|| UpstreamError::InvalidResponse {
            service: SERVICE,
            message: "LLM response missing 'title' field".to_string(),
        })?;
    Ok(Suggestion {
        title: title.to_string(),
        confidence: normalize_confidence(parsed.get("confidence")),
        raw,
    })
}

/// First `limit` characters of `text`, on a char boundary.
fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
