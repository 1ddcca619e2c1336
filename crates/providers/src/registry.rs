//! Model identifier parsing and provider construction.
//!
//! Model identifiers use the form `provider/model`; a bare model name
//! defaults to anthropic. Unknown vendors fall back to the OpenAI-compatible
//! transport pointed at a user-supplied base URL.

use std::sync::Arc;

use valet_domain::error::{Error, Result};

use crate::anthropic::AnthropicProvider;
use crate::auth::env_var_for_provider;
use crate::google::GoogleProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Split `"provider/model"` into its segments. A bare model name defaults
/// to the anthropic provider.
pub fn parse_model_id(model_id: &str) -> (String, String) {
    match model_id.split_once('/') {
        Some((provider, model)) => (provider.to_lowercase(), model.to_owned()),
        None => ("anthropic".to_owned(), model_id.to_owned()),
    }
}

/// Options influencing provider construction.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Explicit credential. Overrides env lookup.
    pub api_key: Option<String>,
    /// Base URL override; required for unknown vendors.
    pub base_url: Option<String>,
}

/// Resolve the credential for a provider: explicit literal first, then the
/// conventional environment variable.
pub fn resolve_api_key(provider: &str, explicit: Option<&str>) -> Option<String> {
    if let Some(key) = explicit {
        if !key.is_empty() {
            return Some(key.to_owned());
        }
    }
    env_var_for_provider(provider)
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
}

/// Instantiate the adapter matching a `provider/model` identifier.
pub fn build_provider(model_id: &str, opts: &ProviderOptions) -> Result<Arc<dyn LlmProvider>> {
    let (provider, model) = parse_model_id(model_id);
    let api_key = resolve_api_key(&provider, opts.api_key.as_deref());

    match provider.as_str() {
        "anthropic" => {
            let key = api_key.ok_or_else(|| {
                Error::Auth("anthropic: no API key (set ANTHROPIC_API_KEY)".into())
            })?;
            Ok(Arc::new(AnthropicProvider::new(
                model,
                key,
                opts.base_url.clone(),
            )?))
        }
        "google" | "gemini" | "google-gemini" => {
            let key = api_key
                .ok_or_else(|| Error::Auth("google: no API key (set GOOGLE_API_KEY)".into()))?;
            Ok(Arc::new(GoogleProvider::new(
                model,
                key,
                opts.base_url.clone(),
            )?))
        }
        "openai" => Ok(Arc::new(OpenAiCompatProvider::new(
            "openai",
            opts.base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            model,
            api_key,
        )?)),
        "openrouter" => Ok(Arc::new(OpenAiCompatProvider::new(
            "openrouter",
            opts.base_url
                .clone()
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            model,
            api_key,
        )?)),
        "ollama" => Ok(Arc::new(OpenAiCompatProvider::new(
            "ollama",
            opts.base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1".into()),
            model,
            api_key,
        )?)),
        other => {
            // Unknown vendor: OpenAI-compatible mode with an explicit base URL.
            let base_url = opts.base_url.clone().ok_or_else(|| {
                Error::Config(format!(
                    "unknown provider \"{other}\": supply a base URL for OpenAI-compatible mode"
                ))
            })?;
            tracing::warn!(provider = other, "unknown provider, using OpenAI-compatible mode");
            Ok(Arc::new(OpenAiCompatProvider::new(
                other.to_owned(),
                base_url,
                model,
                api_key,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_and_model() {
        assert_eq!(
            parse_model_id("openai/gpt-4o"),
            ("openai".into(), "gpt-4o".into())
        );
        assert_eq!(
            parse_model_id("bedrock/anthropic.claude-3-sonnet"),
            ("bedrock".into(), "anthropic.claude-3-sonnet".into())
        );
    }

    #[test]
    fn bare_model_defaults_to_anthropic() {
        assert_eq!(
            parse_model_id("claude-sonnet-4"),
            ("anthropic".into(), "claude-sonnet-4".into())
        );
    }

    #[test]
    fn unknown_provider_requires_base_url() {
        let err = build_provider("lmstudio/some-model", &ProviderOptions::default()).unwrap_err();
        assert!(err.to_string().contains("base URL"));

        let ok = build_provider(
            "lmstudio/some-model",
            &ProviderOptions {
                base_url: Some("http://localhost:1234/v1".into()),
                ..Default::default()
            },
        );
        assert!(ok.is_ok());
        assert_eq!(ok.unwrap().provider_id(), "lmstudio");
    }

    #[test]
    fn explicit_key_builds_anthropic() {
        let provider = build_provider(
            "anthropic/claude-sonnet-4",
            &ProviderOptions {
                api_key: Some("key".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(provider.provider_id(), "anthropic");
        assert_eq!(provider.model(), "claude-sonnet-4");
    }
}
