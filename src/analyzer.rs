//! Per-chunk model calls: prompt, charge, parse, validate, position.
//!
//! [`ChunkAnalyzer::analyze`] turns one [`Chunk`] into validated
//! [`Finding`]s positioned in the original transcript. Everything the model
//! can get wrong is handled as data:
//!
//! | Problem | Outcome |
//! |---------|---------|
//! | network, timeout, HTTP status | `ChunkTransport` |
//! | no JSON in the response | `ChunkMalformed` |
//! | unknown category, blank label, bad severity | finding dropped |
//! | quote not found in the chunk | finding dropped |
//! | more findings than the soft cap | lowest severity dropped |
//!
//! Budget: the estimated prompt tokens are reserved before the call unless
//! the caller already prepaid them; afterwards the provider-reported total
//! minus the prepaid amount is charged.

use std::sync::Arc;

use serde_json::Value;

use parley_core::models::{Barometer, Category, Chunk, Finding, Highlight, InsightSource, ProfileContext};
use parley_core::span::QuoteLocator;
use parley_core::summary::barometer_label;
use parley_core::{AnalysisError, Result};

use crate::budget::{estimate_tokens, TokenBudgetLedger};
use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::prompt::{self, PromptContext};

/// Per-run inputs shared by every chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkContext {
    pub total_chunks: usize,
    pub prompt: PromptContext,
}

/// Successful analysis of one chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkReport {
    pub chunk_index: usize,
    pub findings: Vec<Finding>,
    /// Raw findings discarded by validation or the soft cap.
    pub dropped: usize,
    pub tokens_charged: u64,
    /// The post-call charge failed; the findings are still usable.
    pub charge_error: Option<AnalysisError>,
}

/// Narrative produced by the summary call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmInsights {
    pub overall: String,
    pub strategic: String,
    pub barometer: Barometer,
}

pub struct ChunkAnalyzer {
    llm: Arc<dyn LlmClient>,
    ledger: Arc<TokenBudgetLedger>,
}

impl ChunkAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, ledger: Arc<TokenBudgetLedger>) -> Self {
        Self { llm, ledger }
    }

    /// Prompt-token estimate for a chunk, used for pre-charging.
    pub fn estimate_chunk_tokens(chunk: &Chunk, ctx: &ChunkContext) -> u64 {
        let user = prompt::chunk_user_prompt(chunk, ctx.total_chunks, &ctx.prompt);
        estimate_tokens(prompt::ANALYSIS_SYSTEM_PROMPT.len() + user.len())
    }

    /// Analyze one chunk. `prepaid` is the amount already reserved for it.
    pub async fn analyze(&self, chunk: &Chunk, ctx: &ChunkContext, prepaid: Option<u64>) -> Result<ChunkReport> {
        let mut report = ChunkReport {
            chunk_index: chunk.index,
            ..ChunkReport::default()
        };
        if chunk.text.trim().is_empty() {
            return Ok(report);
        }

        let user = prompt::chunk_user_prompt(chunk, ctx.total_chunks, &ctx.prompt);
        let request = ChatRequest::new(prompt::ANALYSIS_SYSTEM_PROMPT, user);
        let estimated = estimate_tokens(request.prompt_chars());

        let prepaid = match prepaid {
            Some(amount) => amount,
            None => {
                self.ledger.reserve_or_fail(estimated).await?;
                estimated
            }
        };

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| call_error(chunk.number(), e.to_string(), &e))?;

        let actual = billed_tokens(&response, estimated);
        report.tokens_charged = prepaid;
        match self.ledger.charge(actual.saturating_sub(prepaid)).await {
            Ok(_) => report.tokens_charged = prepaid.max(actual),
            Err(e) => report.charge_error = Some(e),
        }

        let raw = parse_findings(&response.content).map_err(|message| AnalysisError::ChunkMalformed {
            chunk_number: chunk.number(),
            message,
        })?;
        let total = raw.len();
        let cap = prompt::highlight_cap(&chunk.text, ctx.prompt.max_highlights_per_1000_words);
        report.findings = validate_findings(&raw, chunk, cap);
        report.dropped = total - report.findings.len();

        tracing::debug!(
            chunk = chunk.number(),
            kept = report.findings.len(),
            dropped = report.dropped,
            tokens = actual,
            "chunk analyzed"
        );
        Ok(report)
    }

    /// One extra call producing the narrative summary and barometer.
    pub async fn summarize(&self, highlights: &[Highlight], profile: Option<&ProfileContext>) -> Result<LlmInsights> {
        let user = prompt::summary_user_prompt(highlights, profile);
        let request = ChatRequest::new(prompt::SUMMARY_SYSTEM_PROMPT, user);
        let estimated = estimate_tokens(request.prompt_chars());
        self.ledger.reserve_or_fail(estimated).await?;

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| call_error(0, format!("summary call failed: {}", e), &e))?;
        let actual = billed_tokens(&response, estimated);
        let insights = parse_insights(&response.content).map_err(|message| AnalysisError::ChunkMalformed {
            chunk_number: 0,
            message,
        });
        self.ledger.charge(actual.saturating_sub(estimated)).await?;
        insights
    }
}

/// A reply that arrived but carried no usable content is malformed, not a
/// transport failure.
fn call_error(chunk_number: usize, message: String, err: &LlmError) -> AnalysisError {
    match err {
        LlmError::InvalidResponse(_) => AnalysisError::ChunkMalformed { chunk_number, message },
        _ => AnalysisError::ChunkTransport { chunk_number, message },
    }
}

/// Provider-reported total, or an estimate when the provider omits usage.
fn billed_tokens(response: &ChatResponse, prompt_estimate: u64) -> u64 {
    match response.usage {
        Some(usage) if usage.total_tokens > 0 => usage.total_tokens,
        _ => prompt_estimate + estimate_tokens(response.content.len()),
    }
}

/// Locate the JSON document in a model response.
///
/// Accepts bare JSON, JSON inside a fenced code block, or JSON embedded in
/// surrounding prose.
pub fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body = body.find("```").map(|end| &body[..end]).unwrap_or(body);
        if let Ok(value) = serde_json::from_str(body.trim()) {
            return Some(value);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// The raw finding objects in a model response.
pub fn parse_findings(content: &str) -> std::result::Result<Vec<Value>, String> {
    let value = extract_json(content).ok_or_else(|| "response contained no JSON".to_string())?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => {
            for key in ["findings", "highlights", "results"] {
                if let Some(Value::Array(items)) = obj.remove(key) {
                    return Ok(items);
                }
            }
            Err("JSON object has no findings array".to_string())
        }
        _ => Err("JSON is neither an object nor an array".to_string()),
    }
}

fn severity_of(value: Option<&Value>) -> Option<u8> {
    let n = match value? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (1..=3).contains(&n).then_some(n as u8)
}

fn text_of<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Validate raw findings, locate their quotes and apply the soft cap.
///
/// The result is ordered by position in the chunk.
pub fn validate_findings(raw: &[Value], chunk: &Chunk, cap: usize) -> Vec<Finding> {
    let mut locator = QuoteLocator::new(&chunk.text);
    let mut findings = Vec::new();

    for item in raw {
        let Some(obj) = item.as_object() else { continue };
        let Some(category) = text_of(obj, &["category", "type"]).and_then(Category::parse) else {
            continue;
        };
        let Some(label) = text_of(obj, &["label", "tactic", "name"]) else { continue };
        let Some(severity) = severity_of(obj.get("severity")) else { continue };
        let Some(quote) = text_of(obj, &["quote", "text", "excerpt"]) else { continue };
        let Some(local) = locator.locate(quote) else {
            tracing::debug!(chunk = chunk.number(), quote, "quote not found in chunk");
            continue;
        };

        findings.push(Finding {
            category,
            label: label.to_string(),
            quote: quote.to_string(),
            severity,
            explanation: text_of(obj, &["explanation", "reason", "rationale"])
                .unwrap_or_default()
                .to_string(),
            chunk_index: chunk.index,
            local,
            global: local.shift(chunk.start),
        });
    }

    if findings.len() > cap {
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.local.start.cmp(&b.local.start)));
        findings.truncate(cap);
    }
    findings.sort_by_key(|f| (f.local.start, f.local.end));
    findings
}

fn parse_insights(content: &str) -> std::result::Result<LlmInsights, String> {
    let value = extract_json(content).ok_or_else(|| "summary response contained no JSON".to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "summary response is not a JSON object".to_string())?;

    let overall = text_of(obj, &["overall", "summary"]).ok_or_else(|| "summary missing overall".to_string())?;
    let strategic = text_of(obj, &["strategic", "advice"]).unwrap_or_default();

    let barometer = obj
        .get("barometer")
        .and_then(Value::as_object)
        .ok_or_else(|| "summary missing barometer".to_string())?;
    let score = barometer
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| "barometer missing score".to_string())?
        .round()
        .clamp(0.0, 100.0) as u8;
    let label = text_of(barometer, &["label"])
        .map(|l| l.to_lowercase())
        .unwrap_or_else(|| barometer_label(score).to_string());

    Ok(LlmInsights {
        overall: overall.to_string(),
        strategic: strategic.to_string(),
        barometer: Barometer {
            score,
            label,
            rationale: text_of(barometer, &["rationale"]).unwrap_or_default().to_string(),
            source: InsightSource::Llm,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::llm::{LlmError, TokenUsage};
    use async_trait::async_trait;
    use parley_core::store::memory::InMemoryStore;
    use serde_json::json;

    const CHUNK_TEXT: &str = "Seller: You need to sign today, the offer expires tonight. \
                              Everyone in your industry already switched to us. \
                              Seller: Sign today or we walk.";

    fn chunk() -> Chunk {
        Chunk {
            index: 1,
            start: 500,
            end: 500 + CHUNK_TEXT.len(),
            text: CHUNK_TEXT.to_string(),
            overlap: 0,
        }
    }

    struct FixedLlm {
        reply: std::result::Result<String, LlmError>,
        total_tokens: u64,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: ChatRequest) -> std::result::Result<ChatResponse, LlmError> {
            self.reply.clone().map(|content| ChatResponse {
                content,
                usage: Some(TokenUsage {
                    prompt_tokens: self.total_tokens,
                    completion_tokens: 0,
                    total_tokens: self.total_tokens,
                }),
            })
        }
    }

    fn analyzer(reply: std::result::Result<String, LlmError>, total_tokens: u64, limit: u64) -> (ChunkAnalyzer, Arc<TokenBudgetLedger>) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(TokenBudgetLedger::new(
            store,
            &BudgetConfig {
                daily_token_limit: limit,
                lockout_hours: 24,
            },
        ));
        let llm = Arc::new(FixedLlm { reply, total_tokens });
        (ChunkAnalyzer::new(llm, ledger.clone()), ledger)
    }

    fn ctx() -> ChunkContext {
        ChunkContext {
            total_chunks: 3,
            prompt: PromptContext {
                max_highlights_per_1000_words: 100,
                ..PromptContext::default()
            },
        }
    }

    #[test]
    fn test_extract_json_variants() {
        assert!(extract_json(r#"{"findings":[]}"#).is_some());
        assert!(extract_json("Here you go:\n```json\n{\"findings\":[]}\n```\nDone.").is_some());
        assert!(extract_json("Sure! {\"findings\": []} Hope that helps.").is_some());
        assert!(extract_json("[{\"category\":\"manipulation\"}]").is_some());
        assert!(extract_json("I could not find anything.").is_none());
    }

    #[test]
    fn test_parse_findings_shapes() {
        assert_eq!(parse_findings(r#"{"findings":[{}, {}]}"#).unwrap().len(), 2);
        assert_eq!(parse_findings(r#"[{}]"#).unwrap().len(), 1);
        assert!(parse_findings(r#"{"answer": 42}"#).is_err());
        assert!(parse_findings("no json").is_err());
    }

    #[test]
    fn test_validation_drops_bad_findings() {
        let raw = vec![
            json!({"category": "manipulation", "label": "false urgency", "quote": "sign today", "severity": 2, "explanation": "deadline"}),
            json!({"category": "flattery", "label": "x", "quote": "sign today", "severity": 2}),
            json!({"category": "manipulation", "label": "  ", "quote": "sign today", "severity": 2}),
            json!({"category": "manipulation", "label": "x", "quote": "sign today", "severity": 7}),
            json!({"category": "manipulation", "label": "x", "quote": "not in the text", "severity": 1}),
            json!("just a string"),
        ];
        let findings = validate_findings(&raw, &chunk(), 10);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.category, Category::Manipulation);
        assert_eq!(f.explanation, "deadline");
        assert_eq!(&CHUNK_TEXT[f.local.start..f.local.end], "sign today");
        assert_eq!(f.global, f.local.shift(500));
    }

    #[test]
    fn test_repeated_quotes_map_to_successive_occurrences() {
        let raw = vec![
            json!({"category": "manipulation", "label": "urgency", "quote": "Sign today", "severity": 2}),
            json!({"category": "manipulation", "label": "urgency", "quote": "sign today", "severity": "3"}),
        ];
        let findings = validate_findings(&raw, &chunk(), 10);
        assert_eq!(findings.len(), 2);
        assert!(findings[0].local.start < findings[1].local.start);
        assert_eq!(findings[1].severity, 3);
    }

    #[test]
    fn test_soft_cap_keeps_most_severe() {
        let raw = vec![
            json!({"category": "cognitive_bias", "label": "social proof", "quote": "Everyone in your industry", "severity": 1}),
            json!({"category": "manipulation", "label": "ultimatum", "quote": "or we walk", "severity": 3}),
            json!({"category": "manipulation", "label": "urgency", "quote": "expires tonight", "severity": 2}),
        ];
        let findings = validate_findings(&raw, &chunk(), 2);
        let labels: Vec<&str> = findings.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["urgency", "ultimatum"]);
    }

    #[tokio::test]
    async fn test_analyze_charges_delta_after_prepay() {
        let reply = json!({"findings": [
            {"category": "manipulation", "label": "urgency", "quote": "offer expires tonight", "severity": 2, "explanation": "deadline"}
        ]})
        .to_string();
        let (analyzer, ledger) = analyzer(Ok(reply), 900, 1_000_000);

        let report = analyzer.analyze(&chunk(), &ctx(), Some(400)).await.unwrap();
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.tokens_charged, 900);
        assert!(report.charge_error.is_none());
        // Only the delta over the prepaid amount hits the ledger here.
        assert_eq!(ledger.usage_today().await.unwrap().tokens_used, 500);
    }

    #[tokio::test]
    async fn test_analyze_reserves_when_not_prepaid() {
        let (analyzer, ledger) = analyzer(Ok(r#"{"findings":[]}"#.to_string()), 1, 1_000_000);
        let expected = ChunkAnalyzer::estimate_chunk_tokens(&chunk(), &ctx());
        analyzer.analyze(&chunk(), &ctx(), None).await.unwrap();
        // Reported usage below the estimate charges nothing more.
        assert_eq!(ledger.usage_today().await.unwrap().tokens_used, expected);
    }

    #[tokio::test]
    async fn test_transport_failure_is_chunk_scoped() {
        let (analyzer, _) = analyzer(Err(LlmError::Timeout(60)), 0, 1_000_000);
        let err = analyzer.analyze(&chunk(), &ctx(), Some(10)).await.unwrap_err();
        assert_eq!(err.chunk_number(), Some(2));
        assert!(matches!(err, AnalysisError::ChunkTransport { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let (analyzer, _) = analyzer(Ok("I refuse.".to_string()), 50, 1_000_000);
        let err = analyzer.analyze(&chunk(), &ctx(), Some(10)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ChunkMalformed { chunk_number: 2, .. }));
    }

    #[tokio::test]
    async fn test_empty_provider_reply_is_malformed() {
        let reply = Err(LlmError::InvalidResponse("missing choices[0].message.content".to_string()));
        let (analyzer, _) = analyzer(reply, 0, 1_000_000);
        let err = analyzer.analyze(&chunk(), &ctx(), Some(10)).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ChunkMalformed { chunk_number: 2, .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_reserve_rejection_propagates() {
        let (analyzer, _) = analyzer(Ok(r#"{"findings":[]}"#.to_string()), 1, 5);
        let err = analyzer.analyze(&chunk(), &ctx(), None).await.unwrap_err();
        assert!(matches!(err, AnalysisError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_post_charge_failure_keeps_findings() {
        let reply = json!({"findings": [
            {"category": "manipulation", "label": "ultimatum", "quote": "or we walk", "severity": 3}
        ]})
        .to_string();
        let (analyzer, _) = analyzer(Ok(reply), 5_000, 1_000);
        let report = analyzer.analyze(&chunk(), &ctx(), Some(10)).await.unwrap();
        assert_eq!(report.findings.len(), 1);
        assert!(matches!(report.charge_error, Some(AnalysisError::BudgetExceeded { .. })));
    }

    #[tokio::test]
    async fn test_blank_chunk_skips_model() {
        let (analyzer, ledger) = analyzer(Err(LlmError::Network("unreachable".into())), 0, 1_000_000);
        let mut blank = chunk();
        blank.text = "   \n ".to_string();
        let report = analyzer.analyze(&blank, &ctx(), None).await.unwrap();
        assert!(report.findings.is_empty());
        assert_eq!(ledger.usage_today().await.unwrap().tokens_used, 0);
    }

    #[test]
    fn test_parse_insights() {
        let insights = parse_insights(
            r#"{"overall":"Pressure-heavy.","strategic":"Slow down.","barometer":{"score":81.4,"label":"Hostile","rationale":"Ultimatums."}}"#,
        )
        .unwrap();
        assert_eq!(insights.barometer.score, 81);
        assert_eq!(insights.barometer.label, "hostile");
        assert_eq!(insights.barometer.source, InsightSource::Llm);

        let fallback_label = parse_insights(r#"{"overall":"ok","barometer":{"score":10}}"#).unwrap();
        assert_eq!(fallback_label.barometer.label, "calm");
        assert!(parse_insights(r#"{"overall":"ok"}"#).is_err());
    }
}
