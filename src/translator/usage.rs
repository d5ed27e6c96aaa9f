use serde::Serialize;
use serde_json::Value;

use crate::{ExtProcError, Result};

/// Normalized token accounting for one exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    /// Set once the response leg finished and the counts are frozen.
    pub is_final: bool,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32, total_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
            is_final: false,
        }
    }

    /// Builds usage from raw JSON counts. Missing counts are zero and a
    /// missing total is the sum of input and output.
    pub fn from_counts(
        input: Option<&Value>,
        output: Option<&Value>,
        total: Option<&Value>,
    ) -> Result<Self> {
        let input_tokens = narrow_token_count(input)?;
        let output_tokens = narrow_token_count(output)?;
        let total_tokens = match total.filter(|value| !value.is_null()) {
            Some(total) => narrow_token_count(Some(total))?,
            None => input_tokens.checked_add(output_tokens).ok_or_else(|| {
                ExtProcError::Translation("total token count overflows u32".to_string())
            })?,
        };
        Ok(Self::new(input_tokens, output_tokens, total_tokens))
    }

    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Clamps negative counts to zero and narrows to `u32`; counts beyond
/// `u32::MAX` are a translation failure.
pub fn narrow_token_count(value: Option<&Value>) -> Result<u32> {
    let Some(value) = value else {
        return Ok(0);
    };
    let out_of_range =
        || ExtProcError::Translation(format!("token count {value} does not fit in u32"));
    match value {
        Value::Null => Ok(0),
        Value::Number(number) => {
            if let Some(n) = number.as_i64() {
                return u32::try_from(n.max(0)).map_err(|_| out_of_range());
            }
            if let Some(n) = number.as_u64() {
                return u32::try_from(n).map_err(|_| out_of_range());
            }
            let n = number.as_f64().unwrap_or(0.0);
            if n <= 0.0 {
                Ok(0)
            } else if n > f64::from(u32::MAX) {
                Err(out_of_range())
            } else {
                Ok(n as u32)
            }
        }
        other => Err(ExtProcError::Translation(format!(
            "token count must be a number, got {other}"
        ))),
    }
}

/// Reads an OpenAI `usage` object, accepting the `input_tokens`/`output_tokens`
/// aliases. `None` when the value is absent or null.
pub fn parse_openai_usage(value: Option<&Value>) -> Result<Option<TokenUsage>> {
    let Some(obj) = value.and_then(Value::as_object) else {
        return Ok(None);
    };
    TokenUsage::from_counts(
        obj.get("prompt_tokens").or_else(|| obj.get("input_tokens")),
        obj.get("completion_tokens")
            .or_else(|| obj.get("output_tokens")),
        obj.get("total_tokens"),
    )
    .map(Some)
}

pub fn openai_usage_value(usage: &TokenUsage) -> Value {
    serde_json::json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens,
    })
}
