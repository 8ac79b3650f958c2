//! Message metadata: validation at the write boundary and accumulation across partial writes.
//!
//! A single assistant turn is usually written several times while it streams (tool calls
//! resume the same message). Usage counters and elapsed time are therefore summed across
//! writes instead of overwritten; every other key is last-writer-wins.

use crate::error::{ConversationError, ConversationResult};
use crate::model::MessagePart;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys that live only in dedicated columns and must never be copied into metadata.
pub const RESERVED_KEYS: &[&str] = &["id", "sessionId", "parentId", "path"];

/// Token counters reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.total_tokens.is_none()
            && self.reasoning_tokens.is_none()
            && self.cached_input_tokens.is_none()
    }
}

/// Wall-clock time spent producing a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl Timing {
    pub fn is_empty(&self) -> bool {
        self.elapsed_ms.is_none()
    }
}

/// Validated metadata bag: known accumulating fields plus open extension keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.total_usage.is_none() && self.timing.is_none() && self.extra.is_empty()
    }
}

/// Strip reserved keys and validate the remainder. Empty input yields `None`.
pub fn sanitize(raw: Option<Map<String, Value>>) -> ConversationResult<Option<MessageMetadata>> {
    let Some(mut map) = raw else {
        return Ok(None);
    };
    for key in RESERVED_KEYS {
        map.remove(*key);
    }
    if map.is_empty() {
        return Ok(None);
    }

    let metadata: MessageMetadata = serde_json::from_value(Value::Object(map))
        .map_err(|e| ConversationError::InvalidInput(format!("Invalid message metadata: {}", e)))?;
    Ok(non_empty(metadata))
}

fn sum_counter(prev: Option<u64>, next: Option<u64>) -> Option<u64> {
    match (prev, next) {
        (None, None) => None,
        (prev, next) => Some(prev.unwrap_or(0).saturating_add(next.unwrap_or(0))),
    }
}

/// Sum each usage counter across both sides; a counter absent on both sides stays absent.
pub fn merge_usage(prev: Option<&TokenUsage>, next: Option<&TokenUsage>) -> Option<TokenUsage> {
    let prev = prev.copied().unwrap_or_default();
    let next = next.copied().unwrap_or_default();
    let merged = TokenUsage {
        input_tokens: sum_counter(prev.input_tokens, next.input_tokens),
        output_tokens: sum_counter(prev.output_tokens, next.output_tokens),
        total_tokens: sum_counter(prev.total_tokens, next.total_tokens),
        reasoning_tokens: sum_counter(prev.reasoning_tokens, next.reasoning_tokens),
        cached_input_tokens: sum_counter(prev.cached_input_tokens, next.cached_input_tokens),
    };
    (!merged.is_empty()).then_some(merged)
}

pub fn merge_elapsed(prev: Option<&Timing>, next: Option<&Timing>) -> Option<Timing> {
    let merged = Timing {
        elapsed_ms: sum_counter(
            prev.and_then(|t| t.elapsed_ms),
            next.and_then(|t| t.elapsed_ms),
        ),
    };
    (!merged.is_empty()).then_some(merged)
}

/// Combine stored metadata with a newly sanitized write.
pub fn merge(
    prev: Option<MessageMetadata>,
    next: Option<MessageMetadata>,
) -> Option<MessageMetadata> {
    let (prev, next) = match (prev, next) {
        (None, None) => return None,
        (Some(only), None) | (None, Some(only)) => return non_empty(only),
        (Some(prev), Some(next)) => (prev, next),
    };

    let mut extra = prev.extra;
    for (key, value) in next.extra {
        extra.insert(key, value);
    }

    non_empty(MessageMetadata {
        total_usage: merge_usage(prev.total_usage.as_ref(), next.total_usage.as_ref()),
        timing: merge_elapsed(prev.timing.as_ref(), next.timing.as_ref()),
        extra,
    })
}

/// Carry manual-stop markers from the stored parts into a replacement part list.
pub fn preserve_stop_marker(existing: &[MessagePart], mut next: Vec<MessagePart>) -> Vec<MessagePart> {
    if next.iter().any(MessagePart::is_manual_stop) {
        return next;
    }
    next.extend(existing.iter().filter(|p| p.is_manual_stop()).cloned());
    next
}

fn non_empty(mut metadata: MessageMetadata) -> Option<MessageMetadata> {
    metadata.total_usage = metadata.total_usage.filter(|u| !u.is_empty());
    metadata.timing = metadata.timing.filter(|t| !t.is_empty());
    (!metadata.is_empty()).then_some(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Option<MessageMetadata> {
        match value {
            Value::Object(map) => sanitize(Some(map)).unwrap(),
            _ => panic!("metadata fixtures must be objects"),
        }
    }

    #[test]
    fn sanitize_drops_reserved_keys() {
        let m = meta(json!({
            "id": "m1",
            "sessionId": "s1",
            "parentId": "p",
            "path": "01",
            "model": "gpt"
        }))
        .unwrap();
        assert_eq!(m.extra.len(), 1);
        assert_eq!(m.extra["model"], json!("gpt"));
    }

    #[test]
    fn sanitize_of_only_reserved_keys_is_none() {
        assert!(meta(json!({"id": "m1", "path": "01"})).is_none());
        assert!(sanitize(None).unwrap().is_none());
        assert!(meta(json!({})).is_none());
    }

    #[test]
    fn sanitize_rejects_malformed_usage() {
        let raw = json!({"totalUsage": {"inputTokens": "lots"}});
        let Value::Object(map) = raw else { unreachable!() };
        assert!(matches!(
            sanitize(Some(map)),
            Err(ConversationError::InvalidInput(_))
        ));
    }

    #[test]
    fn usage_accumulates_across_writes() {
        let first = meta(json!({"totalUsage": {"inputTokens": 10}}));
        let second = meta(json!({"totalUsage": {"inputTokens": 5, "outputTokens": 7}}));
        let merged = merge(first, second).unwrap();
        let usage = merged.total_usage.unwrap();
        assert_eq!(usage.input_tokens, Some(15));
        assert_eq!(usage.output_tokens, Some(7));
        assert_eq!(usage.total_tokens, None);
    }

    #[test]
    fn elapsed_accumulates() {
        let merged = merge(
            meta(json!({"timing": {"elapsedMs": 1200}})),
            meta(json!({"timing": {"elapsedMs": 300}, "finishReason": "stop"})),
        )
        .unwrap();
        assert_eq!(merged.timing.unwrap().elapsed_ms, Some(1500));
        assert_eq!(merged.extra["finishReason"], json!("stop"));
    }

    #[test]
    fn extension_keys_are_last_writer_wins() {
        let merged = merge(
            meta(json!({"model": "a", "provider": "x"})),
            meta(json!({"model": "b"})),
        )
        .unwrap();
        assert_eq!(merged.extra["model"], json!("b"));
        assert_eq!(merged.extra["provider"], json!("x"));
        assert!(merged.total_usage.is_none());
    }

    #[test]
    fn empty_usage_objects_are_removed() {
        let merged = merge(
            meta(json!({"totalUsage": {}, "model": "a"})),
            meta(json!({"timing": {}})),
        )
        .unwrap();
        assert!(merged.total_usage.is_none());
        assert!(merged.timing.is_none());

        let serialized = serde_json::to_value(&merged).unwrap();
        assert_eq!(serialized, json!({"model": "a"}));
    }

    #[test]
    fn stop_marker_survives_replacement() {
        let existing = vec![
            MessagePart::text("partial"),
            MessagePart::ManualStop { reason: None },
        ];
        let next = preserve_stop_marker(&existing, vec![MessagePart::text("partial answer")]);
        assert_eq!(next.len(), 2);
        assert!(next[1].is_manual_stop());

        let already = preserve_stop_marker(
            &existing,
            vec![MessagePart::ManualStop {
                reason: Some("user".into()),
            }],
        );
        assert_eq!(already.len(), 1);
    }
}
