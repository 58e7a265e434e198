//! Rollups of the usage document by credential and by model.
//!
//! Both walks visit `apis -> models -> details` and silently skip any node
//! whose shape is wrong. Counters that are missing or not integers add zero,
//! and sums saturate at `i64::MAX`.

use std::collections::BTreeMap;

use crate::core::models::usage::{
    Count, Detail, KeyUsage, Loose, ModelTokenUsage, ModelUsage, TokenCounts, UsageDocument,
};

/// Every `(model name, model node)` pair reachable from the document.
fn models(usage: &UsageDocument) -> impl Iterator<Item = (&str, &ModelUsage)> {
    usage
        .apis
        .0
        .iter()
        .flat_map(|apis| apis.values())
        .filter_map(|api| api.0.as_ref())
        .filter_map(|api| api.models.0.as_ref())
        .flat_map(|models| models.iter())
        .filter_map(|(name, model)| model.0.as_ref().map(|m| (name.as_str(), m)))
}

fn details(model: &ModelUsage) -> Option<impl Iterator<Item = &Detail>> {
    model
        .details
        .0
        .as_ref()
        .map(|details| details.iter().filter_map(|d| d.0.as_ref()))
}

fn count(tokens: Option<&TokenCounts>, pick: fn(&TokenCounts) -> Option<i64>) -> i64 {
    tokens.and_then(pick).unwrap_or(0)
}

/// Sum requests, tokens and failures per `auth_index`.
pub fn aggregate_by_key(usage: &UsageDocument) -> BTreeMap<String, KeyUsage> {
    let mut aggregates: BTreeMap<String, KeyUsage> = BTreeMap::new();

    for (_, model) in models(usage) {
        let Some(details) = details(model) else {
            continue;
        };
        for detail in details {
            let auth_index = match detail.auth_index.0.as_deref() {
                Some(index) if !index.is_empty() => index,
                _ => continue,
            };
            let tokens = detail.tokens.0.as_ref();

            let entry = aggregates.entry(auth_index.to_string()).or_default();
            entry.requests = entry.requests.saturating_add(1);
            entry.tokens = entry.tokens.saturating_add(count(tokens, |t| t.total_tokens.get()));
            entry.input_tokens = entry
                .input_tokens
                .saturating_add(count(tokens, |t| t.input_tokens.get()));
            entry.output_tokens = entry
                .output_tokens
                .saturating_add(count(tokens, |t| t.output_tokens.get()));
            entry.cached_tokens = entry
                .cached_tokens
                .saturating_add(count(tokens, |t| t.cached_tokens.get()));
            if detail.failed.0 == Some(true) {
                entry.failed = entry.failed.saturating_add(1);
            }
        }
    }

    aggregates
}

/// Sum token spend and requests per model name.
///
/// A model appears as soon as its `details` is a list, even an empty one.
/// Details without a `tokens` object are not counted.
pub fn aggregate_by_model(usage: &UsageDocument) -> BTreeMap<String, ModelTokenUsage> {
    let mut aggregates: BTreeMap<String, ModelTokenUsage> = BTreeMap::new();

    for (name, model) in models(usage) {
        let Some(details) = details(model) else {
            continue;
        };
        let entry = aggregates.entry(name.to_string()).or_default();
        for detail in details {
            let Some(tokens) = detail.tokens.0.as_ref() else {
                continue;
            };
            let add =
                |sum: i64, field: &Loose<Count>| sum.saturating_add(field.get().unwrap_or(0));
            entry.input_tokens = add(entry.input_tokens, &tokens.input_tokens);
            entry.output_tokens = add(entry.output_tokens, &tokens.output_tokens);
            entry.cached_tokens = add(entry.cached_tokens, &tokens.cached_tokens);
            entry.total_tokens = add(entry.total_tokens, &tokens.total_tokens);
            entry.requests = entry.requests.saturating_add(1);
        }
    }

    aggregates
}
