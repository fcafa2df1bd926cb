use crate::error::{Error, Result};
use crate::store::{ModelConfig, ModelStore};

/// Look up the enabled configuration serving `model_id`.
///
/// Store failures surface as-is; a missing or disabled id is `ModelNotFound`.
pub fn resolve_model(store: &dyn ModelStore, model_id: &str) -> Result<ModelConfig> {
    store
        .find_enabled_model(model_id)?
        .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))
}

/// Models whose id, display name or provider contains `query` (ASCII case-insensitive).
/// An empty query keeps everything.
pub fn filter_models<'a>(models: &'a [ModelConfig], query: &str) -> Vec<&'a ModelConfig> {
    models
        .iter()
        .filter(|m| {
            query.is_empty()
                || contains_ignore_case(&m.model_id, query)
                || contains_ignore_case(&m.name, query)
                || contains_ignore_case(&m.provider, query)
        })
        .collect()
}

/// Shorten a secret for display: first four characters, then an ellipsis.
pub fn mask_key(api_key: &str) -> String {
    match api_key.char_indices().nth(4) {
        Some((idx, _)) => format!("{}…", &api_key[..idx]),
        None => "****".to_string(),
    }
}

/// Case-insensitive ASCII substring check without allocation. An empty needle always matches.
pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;

    fn model(model_id: &str, provider: &str, enabled: bool) -> ModelConfig {
        let mut m = ModelConfig::new(model_id, provider, "https://api.example.com/v1", "sk-test");
        m.enabled = enabled;
        m
    }

    #[test]
    fn test_resolve_enabled_model() {
        let store = JsonStore::in_memory();
        store.upsert_model(model("gpt-4o", "openai", true)).unwrap();

        let resolved = resolve_model(&store, "gpt-4o").unwrap();
        assert_eq!(resolved.provider, "openai");
    }

    #[test]
    fn test_resolve_is_exact_match() {
        let store = JsonStore::in_memory();
        store.upsert_model(model("gpt-4o", "openai", true)).unwrap();

        assert!(matches!(
            resolve_model(&store, "GPT-4O"),
            Err(Error::ModelNotFound(id)) if id == "GPT-4O"
        ));
        assert!(matches!(
            resolve_model(&store, "gpt-4"),
            Err(Error::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_skips_disabled() {
        let store = JsonStore::in_memory();
        store.upsert_model(model("llama3", "ollama", false)).unwrap();

        let err = resolve_model(&store, "llama3").unwrap_err();
        assert!(err.to_string().contains("\"llama3\""));
    }

    #[test]
    fn test_filter_models() {
        let models = vec![
            model("gpt-4o", "openai", true),
            model("deepseek-chat", "DeepSeek", true),
            model("llama3", "ollama", false),
        ];

        let ids: Vec<&str> = filter_models(&models, "deepseek")
            .iter()
            .map(|m| m.model_id.as_str())
            .collect();
        assert_eq!(ids, vec!["deepseek-chat"]);

        assert_eq!(filter_models(&models, "").len(), 3);
        assert_eq!(filter_models(&models, "OLLAMA").len(), 1);
        assert!(filter_models(&models, "mistral").is_empty());
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk-abcdef123"), "sk-a…");
        assert_eq!(mask_key("abc"), "****");
        assert_eq!(mask_key(""), "****");
    }

    #[test]
    fn test_contains_ignore_case() {
        assert!(contains_ignore_case("Claude-Sonnet", "sonnet"));
        assert!(!contains_ignore_case("gpt", "gpt-4o"));
        assert!(contains_ignore_case("anything", ""));
    }
}
