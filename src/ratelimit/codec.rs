use std::collections::HashMap;

use crate::{
    error::{LimiterError, LimiterResult},
    ratelimit::engine::BucketState,
};

pub const CODEC_VERSION: &str = "1";
pub const FIELD_TOKENS: &str = "tokens";
pub const FIELD_TIMESTAMP: &str = "ts";
pub const FIELD_VERSION: &str = "v";

// Shortest round-trip text, so repeated cycles never drift. The Redis script
// writes the same fields with `%.17g`.
pub fn encode(state: &BucketState) -> Vec<(&'static str, String)> {
    vec![
        (FIELD_TOKENS, format!("{}", state.tokens)),
        (FIELD_TIMESTAMP, state.last_refill_ms.to_string()),
        (FIELD_VERSION, CODEC_VERSION.to_string()),
    ]
}

pub fn decode(fields: &HashMap<String, String>) -> LimiterResult<Option<BucketState>> {
    let tokens = fields.get(FIELD_TOKENS);
    let ts = fields.get(FIELD_TIMESTAMP);

    let (tokens, ts) = match (tokens, ts) {
        (None, None) => return Ok(None),
        (Some(tokens), Some(ts)) => (tokens, ts),
        _ => {
            return Err(LimiterError::Encoding(
                "bucket is missing the tokens or ts field".to_string(),
            ));
        }
    };

    if let Some(version) = fields.get(FIELD_VERSION) {
        if version != CODEC_VERSION {
            return Err(LimiterError::Encoding(format!(
                "unsupported codec version {version}"
            )));
        }
    }

    let tokens = tokens
        .trim()
        .parse::<f64>()
        .map_err(|e| LimiterError::Encoding(format!("tokens={tokens}: {e}")))?;
    if !tokens.is_finite() || tokens < 0.0 {
        return Err(LimiterError::Encoding(format!(
            "tokens out of range: {tokens}"
        )));
    }

    let last_refill_ms = ts
        .trim()
        .parse::<i64>()
        .map_err(|e| LimiterError::Encoding(format!("ts={ts}: {e}")))?;

    Ok(Some(BucketState {
        tokens,
        last_refill_ms,
    }))
}
