use serde::Serialize;

use crate::store::ModelConfig;

/// `GET /v1/models` response body.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
    pub name: String,
}

impl From<&ModelConfig> for ModelInfo {
    fn from(model: &ModelConfig) -> Self {
        Self {
            id: model.model_id.clone(),
            object: "model",
            created: model.created_at.timestamp(),
            owned_by: model.provider.clone(),
            name: model.name.clone(),
        }
    }
}

impl ModelsResponse {
    pub fn from_models(models: &[ModelConfig]) -> Self {
        Self {
            object: "list",
            data: models.iter().map(ModelInfo::from).collect(),
        }
    }
}

/// OpenAI-style error envelope: `{"error": {"message", "type", ...}}`.
pub fn error_body(message: &str, error_type: &str, detail: Option<(&str, &str)>) -> String {
    let mut error = serde_json::json!({
        "message": message,
        "type": error_type,
    });
    if let Some((key, value)) = detail {
        error[key] = serde_json::Value::String(value.to_string());
    }
    serde_json::json!({ "error": error }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_response_shape() {
        let mut model = ModelConfig::new("gpt-4o", "openai", "https://api.openai.com/v1", "sk");
        model.name = "GPT-4o".to_string();
        let created = model.created_at.timestamp();

        let json = serde_json::to_value(ModelsResponse::from_models(&[model])).unwrap();
        assert_eq!(json["object"], "list");
        assert_eq!(json["data"][0]["id"], "gpt-4o");
        assert_eq!(json["data"][0]["object"], "model");
        assert_eq!(json["data"][0]["owned_by"], "openai");
        assert_eq!(json["data"][0]["name"], "GPT-4o");
        assert_eq!(json["data"][0]["created"], created);
    }

    #[test]
    fn test_error_body_with_detail() {
        let body = error_body("No route", "not_found", Some(("path", "/nope")));
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["error"]["message"], "No route");
        assert_eq!(json["error"]["type"], "not_found");
        assert_eq!(json["error"]["path"], "/nope");
    }

    #[test]
    fn test_error_body_without_detail() {
        let body = error_body("bad", "invalid_request_error", None);
        assert_eq!(
            body,
            r#"{"error":{"message":"bad","type":"invalid_request_error"}}"#
        );
    }
}
