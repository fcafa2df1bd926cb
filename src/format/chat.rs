use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound chat-completion body. Only `model` and the message contents are
/// interpreted; everything else is carried through to the provider unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message content as clients actually send it. Variants are tried in order,
/// so a JSON string is always `Text` and a list of strings/objects is `Parts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Text(String),
    Object(Map<String, Value>),
}

impl ContentPart {
    fn into_text(self) -> String {
        match self {
            ContentPart::Text(text) => text,
            ContentPart::Object(mut obj) => {
                let is_text_part = obj.get("type").and_then(Value::as_str) == Some("text");
                match obj.remove("text") {
                    Some(Value::String(text)) if is_text_part => text,
                    text => {
                        if let Some(text) = text {
                            obj.insert("text".to_string(), text);
                        }
                        Value::Object(obj).to_string()
                    }
                }
            }
        }
    }
}

impl MessageContent {
    /// Flatten to the plain string form every provider accepts.
    pub fn into_text(self) -> String {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Parts(parts) => parts
                .into_iter()
                .map(ContentPart::into_text)
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Other(value) => value.to_string(),
        }
    }
}

impl ChatCompletionRequest {
    /// Replace every message's content with its string form. Messages are
    /// independent; absent content stays absent.
    pub fn sanitize(mut self) -> Self {
        for message in &mut self.messages {
            if let Some(content) = message.content.take() {
                message.content = Some(MessageContent::Text(content.into_text()));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_content_variants_decode_in_order() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "plain"},
                {"role": "user", "content": ["a", "b"]},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "user", "content": {"weird": true}},
                {"role": "assistant", "content": null}
            ]
        }));

        assert!(matches!(req.messages[0].content, Some(MessageContent::Text(_))));
        assert!(matches!(req.messages[1].content, Some(MessageContent::Parts(_))));
        assert!(matches!(req.messages[2].content, Some(MessageContent::Parts(_))));
        assert!(matches!(req.messages[3].content, Some(MessageContent::Other(_))));
        assert!(req.messages[4].content.is_none());
    }

    #[test]
    fn test_mixed_parts_join_with_newline() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}, "there"]}]
        }))
        .sanitize();

        assert_eq!(
            req.messages[0].content,
            Some(MessageContent::Text("hi\nthere".to_string()))
        );
    }

    #[test]
    fn test_non_text_objects_become_compact_json() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                "look:",
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]}]
        }))
        .sanitize();

        let Some(MessageContent::Text(text)) = &req.messages[0].content else {
            panic!("content not flattened");
        };
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("look:"));
        let object: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(object["type"], "image_url");
        assert!(!text.contains(": "), "expected compact JSON: {text}");
    }

    #[test]
    fn test_text_part_with_non_string_text_is_serialized() {
        let part = ContentPart::Object(
            json!({"type": "text", "text": 42})
                .as_object()
                .unwrap()
                .clone(),
        );
        let text = part.into_text();
        let round: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(round, json!({"type": "text", "text": 42}));
    }

    #[test]
    fn test_other_content_uses_json_description() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": 12.5}]
        }))
        .sanitize();
        assert_eq!(
            req.messages[0].content,
            Some(MessageContent::Text("12.5".to_string()))
        );
    }

    #[test]
    fn test_messages_sanitized_independently() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": ["x", "y"]}
            ]
        }))
        .sanitize();
        assert_eq!(
            req.messages[0].content,
            Some(MessageContent::Text("be brief".to_string()))
        );
        assert_eq!(
            req.messages[1].content,
            Some(MessageContent::Text("x\ny".to_string()))
        );
    }

    #[test]
    fn test_unknown_fields_survive_sanitize() {
        let req = parse(json!({
            "model": "gpt-4o",
            "temperature": 0.2,
            "max_tokens": 64,
            "messages": [{"role": "tool", "tool_call_id": "call_1", "content": ["ok"]}]
        }))
        .sanitize();

        let out = serde_json::to_value(&req).unwrap();
        assert_eq!(out["temperature"], 0.2);
        assert_eq!(out["max_tokens"], 64);
        assert_eq!(out["messages"][0]["tool_call_id"], "call_1");
        assert_eq!(out["messages"][0]["content"], "ok");
    }

    #[test]
    fn test_missing_model_is_rejected() {
        let result = serde_json::from_str::<ChatCompletionRequest>(r#"{"messages": []}"#);
        assert!(result.is_err());
    }
}
