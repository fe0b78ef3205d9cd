use serde_json::Value;
use tracing::warn;

use crate::model::END_OF_TURN;

/// Extracts the JSON the model was asked to emit.
///
/// Everything from the first end-of-turn marker onwards is dropped and the
/// remainder must be strict JSON; anything else yields `None`.
pub fn parse_structured(raw: &str) -> Option<Value> {
    let head = raw.split(END_OF_TURN).next().unwrap_or_default().trim();
    match serde_json::from_str(head) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "model output is not valid JSON");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn trailing_text_after_end_of_turn_is_discarded() {
        let parsed = parse_structured("{\"amount\": 100}<|im_end|>extra");
        assert_eq!(parsed, Some(json!({"amount": 100})));
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let parsed = parse_structured("\n  {\"payee\": \"An\"}  \n<|im_end|>");
        assert_eq!(parsed, Some(json!({"payee": "An"})));
    }

    #[test]
    fn non_json_yields_none() {
        assert_eq!(parse_structured("not json"), None);
        assert_eq!(parse_structured(""), None);
        assert_eq!(parse_structured("<|im_end|>{\"a\": 1}"), None);
    }

    #[test]
    fn no_lenient_repair_is_attempted() {
        assert_eq!(parse_structured("{\"amount\": 100,}"), None);
        assert_eq!(parse_structured("```json\n{\"amount\": 1}\n```"), None);
    }
}
