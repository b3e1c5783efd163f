// src/persistence.rs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::OidcProfile;
use crate::error::{OidcFedError, Result};
use crate::model::{
    now_epoch, CachedEntityInfo, FederationEntity, OidcAuthRequest, TrustChain,
    OPENID_PROVIDER,
};

/// The persistence contract the core consumes.
///
/// Every operation is atomic per call; multi-step consistency stays with
/// the core. Adapters back this with whatever storage the application
/// uses; [`InMemoryPersistence`] is the reference implementation.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// The federation entity published for `entity_type`, if any.
    async fn fetch_federation_entity(&self, entity_type: &str)
        -> Result<Option<FederationEntity>>;

    /// The federation entity with the given subject, if any.
    async fn fetch_federation_entity_by_subject(
        &self,
        subject: &str,
    ) -> Result<Option<FederationEntity>>;

    async fn store_federation_entity(&self, entity: FederationEntity)
        -> Result<FederationEntity>;

    /// The cached statement keyed by `(subject, issuer)`, if any.
    async fn fetch_entity_info(
        &self,
        subject: &str,
        issuer: &str,
    ) -> Result<Option<CachedEntityInfo>>;

    /// Upserts a cached statement.
    async fn store_entity_info(&self, info: CachedEntityInfo) -> Result<CachedEntityInfo>;

    /// Drops a cached statement ahead of its expiry.
    async fn invalidate_entity_info(&self, subject: &str, issuer: &str) -> Result<()>;

    /// The stored chain keyed by `(subject, trust_anchor, metadata_type)`.
    async fn fetch_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: &str,
    ) -> Result<Option<TrustChain>>;

    /// Upserts a chain. An existing row keeps its administrative `active`
    /// flag; there is no insert-or-leave-stale path.
    async fn store_trust_chain(&self, chain: TrustChain) -> Result<TrustChain>;

    /// Administratively disables a stored chain without deleting it. The
    /// core never re-enables or rebuilds a deactivated chain.
    async fn deactivate_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: &str,
    ) -> Result<()>;

    /// The provider chain for `subject` under `profile`, regardless of the
    /// anchor it was resolved through.
    async fn fetch_oidc_provider(
        &self,
        subject: &str,
        profile: OidcProfile,
    ) -> Result<Option<TrustChain>>;

    /// Stores an authorization request. `state` is unique; a duplicate is
    /// a conflict, never an overwrite.
    async fn store_oidc_auth_request(&self, request: OidcAuthRequest)
        -> Result<OidcAuthRequest>;

    /// The stored authorization request for `state`, if any. The token
    /// phase uses this to recover the PKCE verifier and the provider
    /// snapshots.
    async fn fetch_oidc_auth_request(&self, state: &str) -> Result<Option<OidcAuthRequest>>;
}

#[derive(Default)]
struct Store {
    federation_entities: HashMap<String, FederationEntity>,
    entity_infos: HashMap<(String, String), CachedEntityInfo>,
    trust_chains: HashMap<(String, String, String), TrustChain>,
    auth_requests: HashMap<String, OidcAuthRequest>,
}

/// An in-process adapter backed by `tokio` read-write locks.
///
/// Readers see consistent snapshots; writers serialise on the lock.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    store: Arc<RwLock<Store>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn fetch_federation_entity(
        &self,
        entity_type: &str,
    ) -> Result<Option<FederationEntity>> {
        let store = self.store.read().await;

        Ok(store
            .federation_entities
            .values()
            .find(|e| e.entity_type == entity_type)
            .cloned())
    }

    async fn fetch_federation_entity_by_subject(
        &self,
        subject: &str,
    ) -> Result<Option<FederationEntity>> {
        let store = self.store.read().await;

        Ok(store.federation_entities.get(subject).cloned())
    }

    async fn store_federation_entity(
        &self,
        entity: FederationEntity,
    ) -> Result<FederationEntity> {
        let mut store = self.store.write().await;

        store
            .federation_entities
            .insert(entity.subject.clone(), entity.clone());

        Ok(entity)
    }

    async fn fetch_entity_info(
        &self,
        subject: &str,
        issuer: &str,
    ) -> Result<Option<CachedEntityInfo>> {
        let store = self.store.read().await;

        Ok(store
            .entity_infos
            .get(&(subject.to_string(), issuer.to_string()))
            .cloned())
    }

    async fn store_entity_info(&self, mut info: CachedEntityInfo) -> Result<CachedEntityInfo> {
        let mut store = self.store.write().await;

        info.modified_at = now_epoch();
        store
            .entity_infos
            .insert((info.subject.clone(), info.issuer.clone()), info.clone());

        Ok(info)
    }

    async fn invalidate_entity_info(&self, subject: &str, issuer: &str) -> Result<()> {
        let mut store = self.store.write().await;

        store
            .entity_infos
            .remove(&(subject.to_string(), issuer.to_string()));

        Ok(())
    }

    async fn fetch_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: &str,
    ) -> Result<Option<TrustChain>> {
        let store = self.store.read().await;

        Ok(store
            .trust_chains
            .get(&(
                subject.to_string(),
                trust_anchor.to_string(),
                metadata_type.to_string(),
            ))
            .cloned())
    }

    async fn store_trust_chain(&self, mut chain: TrustChain) -> Result<TrustChain> {
        let mut store = self.store.write().await;

        let key = (
            chain.subject.clone(),
            chain.trust_anchor.clone(),
            chain.metadata_type.clone(),
        );

        if let Some(existing) = store.trust_chains.get(&key) {
            // Rebuilds refresh the row in place without resurrecting a
            // disabled provider.
            chain.active = existing.active;
            chain.created_at = existing.created_at;
        }

        chain.modified_at = now_epoch();
        store.trust_chains.insert(key, chain.clone());

        Ok(chain)
    }

    async fn deactivate_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: &str,
    ) -> Result<()> {
        let mut store = self.store.write().await;

        let key = (
            subject.to_string(),
            trust_anchor.to_string(),
            metadata_type.to_string(),
        );

        if let Some(chain) = store.trust_chains.get_mut(&key) {
            chain.active = false;
            chain.modified_at = now_epoch();
        }

        Ok(())
    }

    async fn fetch_oidc_provider(
        &self,
        subject: &str,
        _profile: OidcProfile,
    ) -> Result<Option<TrustChain>> {
        let store = self.store.read().await;

        Ok(store
            .trust_chains
            .values()
            .find(|tc| tc.subject == subject && tc.metadata_type == OPENID_PROVIDER)
            .cloned())
    }

    async fn store_oidc_auth_request(
        &self,
        request: OidcAuthRequest,
    ) -> Result<OidcAuthRequest> {
        let mut store = self.store.write().await;

        if store.auth_requests.contains_key(&request.state) {
            return Err(OidcFedError::ConflictingState(request.state));
        }

        store
            .auth_requests
            .insert(request.state.clone(), request.clone());

        Ok(request)
    }

    async fn fetch_oidc_auth_request(&self, state: &str) -> Result<Option<OidcAuthRequest>> {
        let store = self.store.read().await;

        Ok(store.auth_requests.get(state).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::model::{TrustChainStatus, OPENID_RELYING_PARTY};

    fn sample_chain(active: bool) -> TrustChain {
        let now = now_epoch();

        TrustChain {
            subject: "https://idp.example".to_string(),
            trust_anchor: "https://ta.example".to_string(),
            metadata_type: OPENID_PROVIDER.to_string(),
            chain: vec!["a.b.c".to_string(), "d.e.f".to_string()],
            parties_involved: vec![
                "https://idp.example".to_string(),
                "https://ta.example".to_string(),
            ],
            final_metadata: json!({"authorization_endpoint": "https://idp.example/authorize"}),
            exp: now + 3600,
            verified_trust_marks: vec![],
            status: TrustChainStatus::Valid,
            active,
            created_at: now,
            modified_at: now,
        }
    }

    #[tokio::test]
    async fn trust_chain_upsert_preserves_active_flag() {
        let persistence = InMemoryPersistence::new();

        let mut disabled = sample_chain(false);
        disabled = persistence.store_trust_chain(disabled).await.unwrap();
        assert!(!disabled.active);

        // A rebuild arrives with active=true but must not resurrect the row.
        let rebuilt = persistence.store_trust_chain(sample_chain(true)).await.unwrap();
        assert!(!rebuilt.active);
    }

    #[tokio::test]
    async fn auth_request_state_is_unique() {
        let persistence = InMemoryPersistence::new();

        let request = OidcAuthRequest {
            client_id: "https://rp.example".to_string(),
            state: "state-1".to_string(),
            endpoint: "https://idp.example/authorize".to_string(),
            provider: "https://idp.example".to_string(),
            provider_jwks: json!({"keys": []}),
            provider_configuration: json!({}),
            data: json!({"code_verifier": "secret"}),
            created_at: now_epoch(),
        };

        persistence
            .store_oidc_auth_request(request.clone())
            .await
            .unwrap();

        let conflict = persistence.store_oidc_auth_request(request.clone()).await;
        assert!(matches!(conflict, Err(OidcFedError::ConflictingState(_))));

        let fetched = persistence
            .fetch_oidc_auth_request("state-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.data["code_verifier"], "secret");
    }

    #[tokio::test]
    async fn federation_entity_lookup_by_type_and_subject() {
        let persistence = InMemoryPersistence::new();

        let entity = FederationEntity {
            subject: "https://rp.example".to_string(),
            jwks: json!({"keys": []}),
            metadata: json!({OPENID_RELYING_PARTY: {"client_id": "https://rp.example"}}),
            authority_hints: vec!["https://ta.example".to_string()],
            trust_marks: json!([]),
            trust_marks_issuers: json!({}),
            constraints: json!({}),
            entity_type: OPENID_RELYING_PARTY.to_string(),
            default_expire_minutes: 2880,
            default_signature_alg: "RS256".to_string(),
            active: true,
        };

        persistence.store_federation_entity(entity).await.unwrap();

        assert!(persistence
            .fetch_federation_entity(OPENID_RELYING_PARTY)
            .await
            .unwrap()
            .is_some());
        assert!(persistence
            .fetch_federation_entity_by_subject("https://rp.example")
            .await
            .unwrap()
            .is_some());
        assert!(persistence
            .fetch_federation_entity_by_subject("https://other.example")
            .await
            .unwrap()
            .is_none());
    }
}
