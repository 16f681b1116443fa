//! Trade decisions and the engine seam
//!
//! A decision engine is an opaque text-in/text-out component (in
//! production an LLM); this module owns the contract around it. Engine
//! output is parsed leniently - model output arrives wrapped in markdown
//! fences or chatty prose often enough that strict parsing would throw
//! away good decisions. Output that cannot be parsed at all degrades to
//! Hold, never to an error: a confused trader sits on its hands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A parsed trading decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "UPPERCASE")]
pub enum TradeDecision {
    Buy {
        symbol: String,
        quantity: u32,
        #[serde(default)]
        rationale: String,
    },
    Sell {
        symbol: String,
        quantity: u32,
        #[serde(default)]
        rationale: String,
    },
    Hold {
        #[serde(default)]
        rationale: String,
    },
}

impl TradeDecision {
    pub fn rationale(&self) -> &str {
        match self {
            Self::Buy { rationale, .. }
            | Self::Sell { rationale, .. }
            | Self::Hold { rationale } => rationale,
        }
    }
}

/// Produces a raw decision for one trader from its account report and the
/// market briefing. The returned text is expected to be JSON but is never
/// trusted to be.
#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(
        &self,
        trader_name: &str,
        strategy: &str,
        account_report: &Value,
        market_context: &Value,
    ) -> String;
}

/// Engine that always holds. Wired in by default so the floor runs
/// end-to-end without any model attached.
pub struct HoldEngine;

#[async_trait]
impl DecisionEngine for HoldEngine {
    async fn decide(&self, _: &str, _: &str, _: &Value, _: &Value) -> String {
        r#"{"decision": "HOLD", "rationale": "no decision engine attached"}"#.to_string()
    }
}

/// Parse engine output into a decision.
///
/// Tries, in order: the raw text, the text with markdown fences stripped,
/// and the substring between the first `{` and the last `}`. If none
/// parses, the whole raw text becomes the rationale of a Hold so the
/// unusable output stays visible in the transaction trail.
pub fn parse_decision(raw: &str) -> TradeDecision {
    for candidate in [raw.trim(), strip_fences(raw), extract_braces(raw)] {
        if candidate.is_empty() {
            continue;
        }
        if let Ok(decision) = serde_json::from_str::<TradeDecision>(candidate) {
            return normalize(decision);
        }
    }

    debug!("Unparseable decision, holding: {:?}", raw);
    TradeDecision::Hold {
        rationale: raw.trim().to_string(),
    }
}

/// Drop a leading ``` / ```json line and a trailing ``` line if present
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Widest brace-delimited substring, for decisions embedded in prose
fn extract_braces(raw: &str) -> &str {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => "",
    }
}

/// Symbols are uppercase everywhere else in the system
fn normalize(decision: TradeDecision) -> TradeDecision {
    match decision {
        TradeDecision::Buy {
            symbol,
            quantity,
            rationale,
        } => TradeDecision::Buy {
            symbol: symbol.to_uppercase(),
            quantity,
            rationale,
        },
        TradeDecision::Sell {
            symbol,
            quantity,
            rationale,
        } => TradeDecision::Sell {
            symbol: symbol.to_uppercase(),
            quantity,
            rationale,
        },
        hold => hold,
    }
}
