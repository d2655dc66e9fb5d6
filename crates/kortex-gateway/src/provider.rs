//! Provider-specific token-usage parsing.
//!
//! Cost accounting needs input/output token counts out of upstream
//! responses, and each provider reports them differently. Parsing is a
//! small strategy table keyed by the provider string from the backend
//! spec; unknown providers and unparseable bodies yield zero usage rather
//! than errors — accounting is best-effort and never blocks a response.

use axum::http::HeaderMap;
use serde_json::Value;

/// Token usage extracted from an upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Parse token usage from a response, selecting the format by provider.
///
/// - `openai` (and the empty/unknown provider): `usage.prompt_tokens` /
///   `usage.completion_tokens`
/// - `anthropic`: `X-Usage-Input-Tokens` / `X-Usage-Output-Tokens`
///   response headers first, body `usage.input_tokens` /
///   `usage.output_tokens` as fallback
/// - `cohere`: `meta.billed_units.*`, falling back to `meta.tokens.*`
pub fn parse_token_usage(provider: &str, headers: &HeaderMap, body: &[u8]) -> TokenUsage {
    match provider {
        "openai" | "" => parse_openai_usage(body),
        "anthropic" => parse_anthropic_usage(headers, body),
        "cohere" => parse_cohere_usage(body),
        _ => TokenUsage::default(),
    }
}

fn parse_json(body: &[u8]) -> Option<Value> {
    serde_json::from_slice(body).ok()
}

fn u64_at<'a>(value: &'a Value, path: &[&str]) -> Option<u64> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_u64()
}

/// OpenAI shape:
/// `{"usage": {"prompt_tokens": N, "completion_tokens": N}}`
fn parse_openai_usage(body: &[u8]) -> TokenUsage {
    let Some(json) = parse_json(body) else {
        return TokenUsage::default();
    };
    TokenUsage {
        input_tokens: u64_at(&json, &["usage", "prompt_tokens"]).unwrap_or(0),
        output_tokens: u64_at(&json, &["usage", "completion_tokens"]).unwrap_or(0),
    }
}

/// Anthropic shape: usage headers on newer API versions, else
/// `{"usage": {"input_tokens": N, "output_tokens": N}}`.
fn parse_anthropic_usage(headers: &HeaderMap, body: &[u8]) -> TokenUsage {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    };

    if let (Some(input), Some(output)) = (
        header_u64("x-usage-input-tokens"),
        header_u64("x-usage-output-tokens"),
    ) {
        return TokenUsage {
            input_tokens: input,
            output_tokens: output,
        };
    }

    let Some(json) = parse_json(body) else {
        return TokenUsage::default();
    };
    TokenUsage {
        input_tokens: u64_at(&json, &["usage", "input_tokens"]).unwrap_or(0),
        output_tokens: u64_at(&json, &["usage", "output_tokens"]).unwrap_or(0),
    }
}

/// Cohere shape:
/// `{"meta": {"billed_units": {"input_tokens": N, "output_tokens": N}}}`,
/// with `meta.tokens.*` as an older fallback.
fn parse_cohere_usage(body: &[u8]) -> TokenUsage {
    let Some(json) = parse_json(body) else {
        return TokenUsage::default();
    };

    let billed = TokenUsage {
        input_tokens: u64_at(&json, &["meta", "billed_units", "input_tokens"]).unwrap_or(0),
        output_tokens: u64_at(&json, &["meta", "billed_units", "output_tokens"]).unwrap_or(0),
    };
    if !billed.is_empty() {
        return billed;
    }

    TokenUsage {
        input_tokens: u64_at(&json, &["meta", "tokens", "input_tokens"]).unwrap_or(0),
        output_tokens: u64_at(&json, &["meta", "tokens", "output_tokens"]).unwrap_or(0),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
