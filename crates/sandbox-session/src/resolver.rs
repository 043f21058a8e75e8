//! Find the sandbox a client-facing request refers to.
//!
//! A client may hold a remote id from an earlier execution while this
//! process no longer has (or never had) the session locally, e.g. after a
//! restart. The resolver prefers the registry and falls back to reconnecting
//! through the provider.

use std::sync::Arc;

use remote_sandbox_core::{SandboxProvider, SharedHandle};

use crate::SessionRegistry;

/// Reconnection resolver.
#[derive(Clone)]
pub struct ReconnectionResolver {
    registry: Arc<SessionRegistry>,
}

impl ReconnectionResolver {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    fn provider(&self) -> &Arc<dyn SandboxProvider> {
        self.registry.provider()
    }

    /// Best handle for a conversation.
    ///
    /// Local sessions come first ([`remote_sandbox_core::RuntimeKind::ALL`]
    /// order), then a reconnect by `remote_id`. Lookup failures are treated
    /// as "nothing found".
    pub async fn resolve(&self, conversation_id: &str, remote_id: Option<&str>) -> Option<SharedHandle> {
        if let Some(session) = self.registry.sessions_for(conversation_id).into_iter().next() {
            return Some(Arc::clone(session.handle()));
        }
        self.reconnect(remote_id?).await
    }

    /// Every handle for a conversation: all local sessions, plus the
    /// reconnected `remote_id` when it is not one of them.
    pub async fn resolve_all(&self, conversation_id: &str, remote_id: Option<&str>) -> Vec<SharedHandle> {
        let mut handles: Vec<SharedHandle> = self
            .registry
            .sessions_for(conversation_id)
            .into_iter()
            .map(|session| Arc::clone(session.handle()))
            .collect();

        let Some(remote_id) = remote_id else {
            return handles;
        };
        if handles.iter().any(|handle| handle.id() == remote_id) {
            return handles;
        }
        handles.extend(self.reconnect(remote_id).await);
        handles
    }

    async fn reconnect(&self, remote_id: &str) -> Option<SharedHandle> {
        match self.provider().get(remote_id).await {
            Ok(handle) => {
                tracing::debug!(remote_id, "Reconnected to sandbox");
                Some(handle)
            }
            Err(e) => {
                tracing::debug!(remote_id, "Sandbox not reachable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use remote_sandbox_core::{RuntimeKind, mock::MockProvider};

    use super::*;
    use crate::RegistryConfig;

    fn setup() -> (Arc<MockProvider>, Arc<SessionRegistry>, ReconnectionResolver) {
        let provider = Arc::new(MockProvider::new());
        let registry = SessionRegistry::new(
            Arc::clone(&provider) as Arc<dyn SandboxProvider>,
            RegistryConfig::default(),
        );
        let resolver = ReconnectionResolver::new(Arc::clone(&registry));
        (provider, registry, resolver)
    }

    #[tokio::test]
    async fn test_local_session_wins_over_remote_id() {
        let (provider, registry, resolver) = setup();
        let elsewhere = provider.create(RuntimeKind::Node, std::time::Duration::from_secs(60)).await.unwrap();
        let local = registry.acquire("c1", RuntimeKind::Python).await.unwrap();

        let handle = resolver.resolve("c1", Some(elsewhere.id())).await.unwrap();
        assert_eq!(handle.id(), local.remote_id());
    }

    #[tokio::test]
    async fn test_reconnects_by_remote_id() {
        let (provider, _registry, resolver) = setup();
        let remote = provider.create(RuntimeKind::Node, std::time::Duration::from_secs(60)).await.unwrap();

        let handle = resolver.resolve("unknown-conv", Some(remote.id())).await.unwrap();
        assert_eq!(handle.id(), remote.id());
    }

    #[tokio::test]
    async fn test_nothing_resolves() {
        let (provider, _registry, resolver) = setup();
        assert!(resolver.resolve("c1", None).await.is_none());
        assert!(resolver.resolve("c1", Some("sbx_missing")).await.is_none());

        let remote = provider.create(RuntimeKind::Node, std::time::Duration::from_secs(60)).await.unwrap();
        remote.stop().await.unwrap();
        assert!(resolver.resolve("c1", Some(remote.id())).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_all_merges_without_duplicates() {
        let (provider, registry, resolver) = setup();
        let node = registry.acquire("c1", RuntimeKind::Node).await.unwrap();
        let python = registry.acquire("c1", RuntimeKind::Python).await.unwrap();
        let extra = provider.create(RuntimeKind::Node, std::time::Duration::from_secs(60)).await.unwrap();

        let ids: Vec<String> = resolver
            .resolve_all("c1", Some(node.remote_id()))
            .await
            .iter()
            .map(|h| h.id().to_string())
            .collect();
        assert_eq!(ids, vec![node.remote_id().to_string(), python.remote_id().to_string()]);

        let ids: Vec<String> = resolver
            .resolve_all("c1", Some(extra.id()))
            .await
            .iter()
            .map(|h| h.id().to_string())
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[2], extra.id());
    }
}
