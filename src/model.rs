// src/model.rs

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Entity-type key of relying-party metadata.
pub const OPENID_RELYING_PARTY: &str = "openid_relying_party";

/// Entity-type key of provider metadata.
pub const OPENID_PROVIDER: &str = "openid_provider";

/// Entity-type key of federation-entity metadata.
pub const FEDERATION_ENTITY: &str = "federation_entity";

/// The default scope of every authorization request.
pub const SCOPE_OPENID: &str = "openid";

/// Wall-clock time as epoch seconds.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A persisted projection of a fetched entity statement, keyed by
/// `(subject, issuer)`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CachedEntityInfo {
    pub subject: String,
    pub issuer: String,
    pub iat: i64,
    pub exp: i64,
    /// The decoded statement payload.
    pub statement: Value,
    /// The original compact JWS.
    pub jwt: String,
    pub modified_at: i64,
}

impl CachedEntityInfo {
    pub fn is_expired(&self) -> bool {
        self.exp < now_epoch()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustChainStatus {
    Valid,
    Invalid,
}

/// A resolved chain of signed statements linking a subject to a trust
/// anchor for one metadata type.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrustChain {
    pub subject: String,
    pub trust_anchor: String,
    pub metadata_type: String,
    /// Subject-to-anchor ordered compact JWTs: the subject's own
    /// configuration, the ascending superior statements, the anchor's own
    /// configuration.
    pub chain: Vec<String>,
    /// Subject URLs in the same order as `chain`.
    pub parties_involved: Vec<String>,
    /// The subject's metadata of `metadata_type` after policy merging.
    pub final_metadata: Value,
    /// The minimum `exp` across all chain elements.
    pub exp: i64,
    pub verified_trust_marks: Vec<Value>,
    pub status: TrustChainStatus,
    /// Cleared by an administrator to disable the provider without
    /// deleting the row.
    pub active: bool,
    pub created_at: i64,
    pub modified_at: i64,
}

impl TrustChain {
    pub fn is_expired(&self) -> bool {
        self.exp < now_epoch()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// The relying party's own published identity.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FederationEntity {
    pub subject: String,
    /// The full key set, private material included.
    pub jwks: Value,
    /// Entity-type keyed metadata map.
    pub metadata: Value,
    pub authority_hints: Vec<String>,
    pub trust_marks: Value,
    pub trust_marks_issuers: Value,
    pub constraints: Value,
    pub entity_type: String,
    pub default_expire_minutes: i64,
    pub default_signature_alg: String,
    pub active: bool,
}

impl FederationEntity {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The metadata block published for `entity_type`, if any.
    pub fn metadata_value(&self, entity_type: &str) -> Option<&Value> {
        self.metadata.get(entity_type)
    }
}

/// A stored authorization request, keyed by its unique `state`.
///
/// Carries the PKCE `code_verifier` inside `data` together with snapshots
/// of the provider's keys and configuration, so the token phase can
/// operate on exactly what the user was redirected with.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OidcAuthRequest {
    pub client_id: String,
    pub state: String,
    pub endpoint: String,
    pub provider: String,
    pub provider_jwks: Value,
    pub provider_configuration: Value,
    pub data: Value,
    pub created_at: i64,
}

/// Progressive onboarding states of the well-known endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnboardingStep {
    /// No key material configured: only a fresh public JWK is returned.
    OnlyJwks,
    /// Keys configured but no trust marks: the self-assertion is returned
    /// for a federation authority to issue marks against.
    Intermediate,
    /// Keys and trust marks configured: the entity is persisted.
    Complete,
}

/// The outcome of a well-known request.
#[derive(Clone, Debug)]
pub struct WellKnownData {
    pub step: OnboardingStep,
    /// Pretty JSON or a compact JWS, depending on the requested mode.
    pub value: String,
}

impl WellKnownData {
    pub fn of(step: OnboardingStep, value: String) -> Self {
        Self { step, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cached_entity_info_expiry() {
        let now = now_epoch();

        let fresh = CachedEntityInfo {
            subject: "https://idp.example".to_string(),
            issuer: "https://idp.example".to_string(),
            iat: now - 60,
            exp: now + 3600,
            statement: json!({}),
            jwt: String::new(),
            modified_at: now,
        };
        assert!(!fresh.is_expired());

        let stale = CachedEntityInfo {
            exp: now - 1,
            ..fresh
        };
        assert!(stale.is_expired());
    }

    #[test]
    fn federation_entity_metadata_lookup() {
        let entity = FederationEntity {
            subject: "https://rp.example".to_string(),
            jwks: json!({"keys": []}),
            metadata: json!({OPENID_RELYING_PARTY: {"client_id": "https://rp.example"}}),
            authority_hints: vec![],
            trust_marks: json!([]),
            trust_marks_issuers: json!({}),
            constraints: json!({}),
            entity_type: OPENID_RELYING_PARTY.to_string(),
            default_expire_minutes: 2880,
            default_signature_alg: "RS256".to_string(),
            active: true,
        };

        assert_eq!(
            entity.metadata_value(OPENID_RELYING_PARTY).unwrap()["client_id"],
            "https://rp.example"
        );
        assert!(entity.metadata_value(OPENID_PROVIDER).is_none());
    }
}
