use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::traits::AiProvider;
use crate::services::settings::ProviderCredentials;

/// The supported upstream provider families. Routing over this enum keeps
/// "unknown model" an exhaustive branch instead of a string fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    OpenAi,
    Anthropic,
    Google,
}

/// Model-identifier prefix table. First match wins.
const MODEL_PREFIXES: &[(&str, ProviderFamily)] = &[
    ("gpt-", ProviderFamily::OpenAi),
    ("chatgpt-", ProviderFamily::OpenAi),
    ("o1", ProviderFamily::OpenAi),
    ("o3", ProviderFamily::OpenAi),
    ("o4", ProviderFamily::OpenAi),
    ("claude-", ProviderFamily::Anthropic),
    ("gemini-", ProviderFamily::Google),
];

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAi => "openai",
            ProviderFamily::Anthropic => "anthropic",
            ProviderFamily::Google => "google",
        }
    }

    /// Resolve a model identifier to its provider family by prefix match.
    pub fn for_model(model: &str) -> Result<Self, RoutingError> {
        MODEL_PREFIXES
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, family)| *family)
            .ok_or_else(|| RoutingError::UnknownModel(model.to_string()))
    }

    fn env_var(&self) -> &'static str {
        match self {
            ProviderFamily::OpenAi => "OPENAI_API_KEY",
            ProviderFamily::Anthropic => "ANTHROPIC_API_KEY",
            ProviderFamily::Google => "GEMINI_API_KEY",
        }
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No credential configured for provider {}", .0.as_str())]
    MissingCredential(ProviderFamily),

    #[error("No provider registered for family {}", .0.as_str())]
    UnregisteredFamily(ProviderFamily),
}

/// Per-request credential overrides, one per family (supplied out-of-band
/// by the caller, e.g. via headers). These take precedence over any
/// process-wide configured credential.
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub google: Option<String>,
}

impl CredentialOverrides {
    fn get(&self, family: ProviderFamily) -> Option<&str> {
        match family {
            ProviderFamily::OpenAi => self.openai.as_deref(),
            ProviderFamily::Anthropic => self.anthropic.as_deref(),
            ProviderFamily::Google => self.google.as_deref(),
        }
    }
}

pub struct ProviderRouter {
    providers: HashMap<ProviderFamily, Arc<dyn AiProvider>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Router with all built-in provider adapters registered.
    pub fn with_default_providers() -> Self {
        let mut router = Self::new();
        router.register(Arc::new(super::openai::OpenAiProvider::new()));
        router.register(Arc::new(super::anthropic::AnthropicProvider::new()));
        router.register(Arc::new(super::gemini::GeminiProvider::new()));
        router
    }

    pub fn register(&mut self, provider: Arc<dyn AiProvider>) {
        self.providers.insert(provider.family(), provider);
    }

    /// Resolve a model identifier to its registered provider client.
    pub fn resolve_provider(&self, model: &str) -> Result<Arc<dyn AiProvider>, RoutingError> {
        let family = ProviderFamily::for_model(model)?;
        self.providers
            .get(&family)
            .cloned()
            .ok_or(RoutingError::UnregisteredFamily(family))
    }

    /// Resolve the credential to use for a routed request. Precedence:
    /// per-request override, then settings, then process environment.
    /// Pure function of its inputs; nothing is cached across requests.
    pub fn resolve_credential(
        family: ProviderFamily,
        overrides: &CredentialOverrides,
        settings: &ProviderCredentials,
    ) -> Result<String, RoutingError> {
        if let Some(key) = overrides.get(family) {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        if let Some(key) = settings.get(family) {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        match std::env::var(family.env_var()) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(RoutingError::MissingCredential(family)),
        }
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_prefix_routes() {
        assert_eq!(
            ProviderFamily::for_model("gpt-4o-mini").unwrap(),
            ProviderFamily::OpenAi
        );
        assert_eq!(
            ProviderFamily::for_model("o1-preview").unwrap(),
            ProviderFamily::OpenAi
        );
        assert_eq!(
            ProviderFamily::for_model("claude-3-haiku-20240307").unwrap(),
            ProviderFamily::Anthropic
        );
        assert_eq!(
            ProviderFamily::for_model("gemini-2.5-flash").unwrap(),
            ProviderFamily::Google
        );
    }

    #[test]
    fn unknown_prefix_is_a_hard_failure() {
        let err = ProviderFamily::for_model("llama-x").unwrap_err();
        assert!(matches!(err, RoutingError::UnknownModel(m) if m == "llama-x"));
    }

    #[test]
    fn request_credential_wins_over_settings() {
        let overrides = CredentialOverrides {
            anthropic: Some("from-request".into()),
            ..Default::default()
        };
        let settings = ProviderCredentials {
            anthropic_api_key: Some("from-settings".into()),
            ..Default::default()
        };
        let key =
            ProviderRouter::resolve_credential(ProviderFamily::Anthropic, &overrides, &settings)
                .unwrap();
        assert_eq!(key, "from-request");
    }

    #[test]
    fn settings_credential_used_when_no_override() {
        let settings = ProviderCredentials {
            openai_api_key: Some("sk-settings".into()),
            ..Default::default()
        };
        let key = ProviderRouter::resolve_credential(
            ProviderFamily::OpenAi,
            &CredentialOverrides::default(),
            &settings,
        )
        .unwrap();
        assert_eq!(key, "sk-settings");
    }

    #[test]
    fn absent_everywhere_is_missing_credential() {
        // Guard against a key leaking in from the test environment.
        std::env::remove_var("GEMINI_API_KEY");
        let err = ProviderRouter::resolve_credential(
            ProviderFamily::Google,
            &CredentialOverrides::default(),
            &ProviderCredentials::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RoutingError::MissingCredential(ProviderFamily::Google)
        ));
    }
}
