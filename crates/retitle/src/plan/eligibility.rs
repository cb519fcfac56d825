//! Tag-based eligibility rules. Pure functions over a fetched document.

use crate::client::Document;
use crate::config::TagRules;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(&'static str),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Evaluates the rules in order; the first one that fails names the reason.
pub fn evaluate(
    document: &Document,
    rules: &TagRules,
    original_title_field: Option<&str>,
) -> Eligibility {
    let verdict = check(document, rules, original_title_field);
    match &verdict {
        Eligibility::Eligible => log::debug!("Document {} passes tag filters", document.id),
        Eligibility::Ineligible(reason) => {
            log::debug!("Document {} rejected: {}", document.id, reason)
        }
    }
    verdict
}

fn check(
    document: &Document,
    rules: &TagRules,
    original_title_field: Option<&str>,
) -> Eligibility {
    if let Some(lock) = rules.lock.as_deref() {
        if document.has_tag(lock) {
            return Eligibility::Ineligible("locked");
        }
    }
    if rules.exclude.iter().any(|tag| document.has_tag(tag)) {
        return Eligibility::Ineligible("skip tag present");
    }
    if let Some(field) = original_title_field {
        if document.custom_field(field).is_some() {
            return Eligibility::Ineligible("original title already stored");
        }
    }
    let required = non_blank(&rules.require);
    if !required.iter().all(|tag| document.has_tag(tag)) {
        return Eligibility::Ineligible("missing required tag");
    }
    let include = non_blank(&rules.include);
    if !include.is_empty() && !include.iter().any(|tag| document.has_tag(tag)) {
        return Eligibility::Ineligible("no include tag");
    }
    if !document.has_content() {
        return Eligibility::Ineligible("no-content");
    }
    Eligibility::Eligible
}

fn non_blank(tags: &[String]) -> Vec<&str> {
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect()
}
