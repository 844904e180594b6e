use crate::domain::contract::ExternalProposal;
use anyhow::Context;
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON body of a model reply: the inside of a markdown fence, or the outermost braces.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        // ```json ... ``` or ``` ... ```
        let mut inner = trimmed;
        if let Some(after_first) = inner.splitn(2, '\n').nth(1) {
            inner = after_first;
        }
        if let Some(end) = inner.rfind("```") {
            inner = &inner[..end];
        }
        return Some(inner.trim().to_string());
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(trimmed[start..=end].trim().to_string())
}

fn parse_value(text: &str) -> anyhow::Result<Value> {
    let json_str = extract_json(text).unwrap_or_else(|| text.trim().to_string());
    serde_json::from_str(&json_str)
        .with_context(|| format!("proposal text is not valid JSON: {json_str}"))
}

/// One classification proposal from raw reply text. Shape only; values are checked
/// by the guardrail validator.
pub fn parse_proposal(text: &str) -> anyhow::Result<ExternalProposal> {
    let value = parse_value(text)?;
    serde_json::from_value(value).context("proposal JSON does not match the proposal schema")
}

/// Proposals keyed by ticker, either as `{"stocks": {ticker: proposal}}` or a bare map.
pub fn parse_batch(text: &str) -> anyhow::Result<BTreeMap<String, ExternalProposal>> {
    let mut value = parse_value(text)?;
    if let Some(stocks) = value.get_mut("stocks") {
        value = stocks.take();
    }
    let batch: BTreeMap<String, ExternalProposal> =
        serde_json::from_value(value).context("batch JSON must map tickers to proposals")?;
    anyhow::ensure!(!batch.is_empty(), "batch contains no proposals");
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classification::Archetype;
    use crate::domain::model::ModelKey;

    const REPLY: &str = r#"{"type": "存股", "description": "穩定配息", "weights": {"dcf": 0.3, "per": 0, "pbr": 0.3, "div": 0.4, "capex": 0, "evEbitda": 0, "psr": 0}, "narrative": "dividend payer"}"#;

    #[test]
    fn extract_json_handles_fenced_blocks() {
        let fenced = format!("```json\n{REPLY}\n```\n");
        assert_eq!(extract_json(&fenced), Some(REPLY.to_string()));
    }

    #[test]
    fn extract_json_falls_back_to_braces() {
        let s = "Here is my answer: {\"a\":1} hope it helps";
        assert_eq!(extract_json(s), Some("{\"a\":1}".to_string()));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn parsed_proposal_goes_through_the_guardrail() {
        let proposal = parse_proposal(&format!("Sure.\n{REPLY}")).unwrap();
        assert_eq!(proposal.archetype.as_deref(), Some("存股"));

        let available = ModelKey::ALL.into_iter().map(|k| (k, true)).collect();
        let sanitized = proposal.validate_and_into_sanitized(&available).unwrap();
        assert_eq!(sanitized.archetype, Archetype::IncomeStock);
        assert!((sanitized.weights.get(ModelKey::Dividend) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn rejects_non_json_text() {
        assert!(parse_proposal("I cannot classify this stock.").is_err());
    }

    #[test]
    fn batch_accepts_wrapped_and_bare_maps() {
        let wrapped = format!(r#"{{"stocks": {{"2330": {REPLY}, "2317": {REPLY}}}}}"#);
        let batch = parse_batch(&wrapped).unwrap();
        assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["2317", "2330"]);

        let bare = format!(r#"{{"2412": {REPLY}}}"#);
        assert_eq!(parse_batch(&bare).unwrap().len(), 1);
        assert!(parse_batch(r#"{"stocks": {}}"#).is_err());
    }
}
