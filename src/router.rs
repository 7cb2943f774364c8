//! Router: resolves a caller's requested model to a provider configuration

use crate::keys::{ApiKeyRecord, CredentialStore};
use crate::registry::ProviderRegistry;
use crate::{Error, ProviderConfig, Result};
use std::sync::Arc;

/// A routed request: who is calling and where it goes
#[derive(Debug, Clone)]
pub struct Route {
    pub caller: Arc<ApiKeyRecord>,
    pub provider: Arc<ProviderConfig>,
}

/// Stateless view over the credential store and provider registry
#[derive(Clone)]
pub struct Router {
    keys: Arc<CredentialStore>,
    registry: Arc<ProviderRegistry>,
}

impl Router {
    pub fn new(keys: Arc<CredentialStore>, registry: Arc<ProviderRegistry>) -> Self {
        Router { keys, registry }
    }

    /// Validate the key, check its allow-list, then resolve the model.
    ///
    /// An invalid key fails before anything about `model` is looked up.
    pub fn route(&self, api_key: &str, model: &str) -> Result<Route> {
        let caller = self.authenticate(api_key)?;
        self.authorize(caller, model)
    }

    /// Validate a presented key
    pub fn authenticate(&self, api_key: &str) -> Result<Arc<ApiKeyRecord>> {
        self.keys.validate(api_key)
    }

    /// Route an already authenticated caller
    pub fn authorize(&self, caller: Arc<ApiKeyRecord>, model: &str) -> Result<Route> {
        if !caller.allowed_models.permits(model) {
            return Err(Error::ForbiddenModel(model.to_string()));
        }
        let provider = self.registry.resolve(model)?;
        Ok(Route { caller, provider })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn keys(&self) -> &Arc<CredentialStore> {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::AllowedModels;
    use crate::ProviderType;

    fn router() -> Router {
        let registry = ProviderRegistry::new();
        registry
            .reload(vec![
                ProviderConfig::azure(
                    "gpt-4",
                    "https://contoso.openai.azure.com",
                    "azure-key",
                    "2023-07-01-preview",
                ),
                ProviderConfig::new("claude-3-opus", ProviderType::Anthropic, "ant-key"),
            ])
            .unwrap();
        Router::new(Arc::new(CredentialStore::in_memory()), Arc::new(registry))
    }

    #[test]
    fn test_allow_list_routing() {
        let router = router();
        let record = router
            .keys()
            .issue("openhands-instance-1", ["gpt-4"].into_iter().collect())
            .unwrap();

        let route = router.route(&record.key, "gpt-4").unwrap();
        assert_eq!(route.provider.provider_type, ProviderType::Azure);
        assert_eq!(route.caller.instance_name, "openhands-instance-1");

        assert!(matches!(
            router.route(&record.key, "claude-3-opus"),
            Err(Error::ForbiddenModel(m)) if m == "claude-3-opus"
        ));
    }

    #[test]
    fn test_forbidden_even_when_model_missing() {
        let router = router();
        let record = router
            .keys()
            .issue("a", ["gpt-4"].into_iter().collect())
            .unwrap();
        assert!(matches!(
            router.route(&record.key, "does-not-exist"),
            Err(Error::ForbiddenModel(_))
        ));
    }

    #[test]
    fn test_wildcard_sees_unknown_model() {
        let router = router();
        let record = router.keys().issue("a", AllowedModels::All).unwrap();
        assert!(router.route(&record.key, "claude-3-opus").is_ok());
        assert!(matches!(
            router.route(&record.key, "does-not-exist"),
            Err(Error::UnknownModel(_))
        ));
    }

    #[test]
    fn test_wildcard_tracks_registry_changes() {
        let router = router();
        let record = router.keys().issue("a", AllowedModels::All).unwrap();
        router
            .registry()
            .upsert(ProviderConfig::new("gemini-2.0-flash", ProviderType::Gemini, "g"))
            .unwrap();
        assert!(router.route(&record.key, "gemini-2.0-flash").is_ok());
    }

    #[test]
    fn test_invalid_key_checked_first() {
        let router = router();
        assert!(matches!(router.route("sk-nonexistent", "gpt-4"), Err(Error::InvalidKey)));
        assert!(matches!(
            router.route("sk-nonexistent", "does-not-exist"),
            Err(Error::InvalidKey)
        ));
    }
}
