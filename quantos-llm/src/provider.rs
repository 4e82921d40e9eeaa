use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};

/// One chat provider endpoint. Providers are tried in configuration order;
/// the first with a usable key wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl ProviderConfig {
    pub fn is_usable(&self) -> bool {
        !self.api_key.trim().is_empty()
            && !self.base_url.trim().is_empty()
            && !self.model.trim().is_empty()
    }
}

/// Pick the first usable provider from an ordered list.
pub fn select_provider(providers: &[ProviderConfig]) -> Result<ProviderConfig> {
    providers
        .iter()
        .find(|p| p.is_usable())
        .cloned()
        .ok_or_else(|| {
            LlmError::NoProvider(format!(
                "none of the {} configured providers has an api key",
                providers.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(key: &str, model: &str) -> ProviderConfig {
        ProviderConfig {
            api_key: key.to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            model: model.to_string(),
        }
    }

    #[test]
    fn selects_first_provider_with_key() {
        let providers = vec![provider("", "gpt-4o-mini"), provider("sk-live", "deepseek-chat")];
        let picked = select_provider(&providers).expect("second provider has a key");
        assert_eq!(picked.model, "deepseek-chat");
    }

    #[test]
    fn errors_when_no_provider_usable() {
        let err = select_provider(&[provider("", "m")]).unwrap_err();
        assert!(err.to_string().contains("none of the 1"));
    }
}
