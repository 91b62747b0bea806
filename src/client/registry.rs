use tracing::trace;

use crate::state::ClientState;
use crate::transport::{ApiDescriptor, System};

/// Where a call goes and which proofs it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub base_url: String,
    pub api: ApiDescriptor,
    /// The descriptor flagged `auth` for the active system, if any.
    pub auth_api: Option<ApiDescriptor>,
    pub system: Option<System>,
}

/// Joins with exactly one separating slash. An empty suffix leaves `base` as is.
pub fn join_url(base: &str, suffix: &str) -> String {
    let suffix = suffix.trim_start_matches('/');
    if base.is_empty() {
        return suffix.to_string();
    }
    let base = base.trim_end_matches('/');
    if suffix.is_empty() {
        return base.to_string();
    }
    format!("{base}/{suffix}")
}

pub fn api_base_url(system: &System, api: &ApiDescriptor) -> String {
    join_url(&system.domain, api.base_url.as_deref().unwrap_or(""))
}

#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    state: ClientState,
}

impl EndpointRegistry {
    pub fn new(state: ClientState) -> Self {
        Self { state }
    }

    /// Never fails: without an active system or a matching descriptor a
    /// default descriptor is synthesized and no proofs are requested.
    pub async fn resolve(&self, reducer_path: &str) -> Resolution {
        let Some(system) = self.state.active_system().await else {
            trace!(reducer_path = %reducer_path, "no active system");
            return Resolution {
                base_url: String::new(),
                api: ApiDescriptor::new(reducer_path),
                auth_api: None,
                system: None,
            };
        };

        let (api, base_url) = match self.state.system_api(&system.id, reducer_path).await {
            Some(api) => {
                let base_url = api_base_url(&system, &api);
                (api, base_url)
            }
            None => {
                trace!(reducer_path = %reducer_path, system = %system.id, "no descriptor registered");
                (ApiDescriptor::new(reducer_path), system.domain.clone())
            }
        };
        let auth_api = self.state.auth_api(&system.id).await;

        Resolution {
            base_url,
            api,
            auth_api,
            system: Some(system),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::policy::CapabilityPolicy;
    use crate::state::Commit;

    async fn registry_with(domain: &str, apis: Vec<ApiDescriptor>) -> EndpointRegistry {
        let state = ClientState::new();
        state
            .insert_system(System {
                id: "sys-1".into(),
                handle: "core".into(),
                domain: domain.into(),
            })
            .await;
        state.activate("sys-1").await;
        state
            .commit(Commit {
                apis,
                ..Commit::default()
            })
            .await;
        EndpointRegistry::new(state)
    }

    fn api(reducer_path: &str, base_url: &str) -> ApiDescriptor {
        ApiDescriptor {
            base_url: Some(base_url.into()),
            ..ApiDescriptor::new(reducer_path)
        }
    }

    #[test]
    fn join_url_uses_one_slash() {
        assert_eq!(join_url("http://h", "api/auth"), "http://h/api/auth");
        assert_eq!(join_url("http://h/", "/api/auth"), "http://h/api/auth");
        assert_eq!(join_url("http://h//", "//api/auth"), "http://h/api/auth");
        assert_eq!(join_url("http://h/", ""), "http://h");
        assert_eq!(join_url("", "login"), "login");
    }

    #[tokio::test]
    async fn no_active_system_yields_default_descriptor() {
        let registry = EndpointRegistry::new(ClientState::new());
        let resolution = registry.resolve("apiCrud").await;

        assert_eq!(resolution.base_url, "");
        assert_eq!(resolution.api, ApiDescriptor::new("apiCrud"));
        assert!(resolution.auth_api.is_none());
        assert!(resolution.system.is_none());
    }

    #[tokio::test]
    async fn unknown_descriptor_is_synthesized() {
        let registry = registry_with("http://localhost", vec![]).await;
        let resolution = registry.resolve("apiCrud").await;

        assert_eq!(resolution.base_url, "http://localhost");
        assert_eq!(resolution.api, ApiDescriptor::new("apiCrud"));
        assert!(resolution.system.is_some());
    }

    #[tokio::test]
    async fn resolves_base_url_and_auth_descriptor() {
        let auth = ApiDescriptor {
            auth: true,
            signature: CapabilityPolicy::for_operations(["login"]),
            ..api("apiAuth", "/api/auth")
        };
        let registry =
            registry_with("http://localhost/", vec![auth, api("apiCrud", "api/crud")]).await;

        let crud = registry.resolve("apiCrud").await;
        assert_eq!(crud.base_url, "http://localhost/api/crud");
        assert_eq!(crud.auth_api.as_ref().unwrap().reducer_path, "apiAuth");

        let auth = registry.resolve("apiAuth").await;
        assert_eq!(auth.base_url, "http://localhost/api/auth");
        assert_eq!(auth.auth_api.as_ref(), Some(&auth.api));
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let registry = registry_with("http://localhost", vec![api("apiCrud", "/api/crud")]).await;
        let first = registry.resolve("apiCrud").await;
        let second = registry.resolve("apiCrud").await;
        assert_eq!(first, second);
    }
}
