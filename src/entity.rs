// src/entity.rs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::AllowedTrustMark;
use crate::error::{OidcFedError, Result};
use crate::fetch::EntityFetcher;
use crate::jose::{JwkSet, JwtHelper};
use crate::model::FEDERATION_ENTITY;

/// The payload of an entity statement (self-issued or about a descendant).
///
/// Only the claims the core reasons about are typed; anything else passes
/// through `extra` untouched.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntityStatementPayload {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authority_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_policy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_marks: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One parsed and progressively verified entity configuration.
///
/// Validation outcomes accumulate on the instance that ran them; instances
/// are owned by the chain build that created them and are never shared.
#[derive(Clone, Debug)]
pub struct EntityConfiguration {
    jwt: String,
    header: Value,
    payload: EntityStatementPayload,
    jwk_set: JwkSet,
    kids: Vec<String>,
    valid: bool,
    /// Superiors whose self-assertion verified, in discovery order.
    verified_superiors: Vec<EntityConfiguration>,
    failed_superiors: Vec<String>,
    /// Issuer -> the statement that superior issued about this entity.
    verified_by_superiors: HashMap<String, String>,
    failed_by_superiors: Vec<String>,
    /// Descendant subject -> (statement JWT, statement payload).
    verified_descendant_statements: HashMap<String, (String, Value)>,
    failed_descendant_statements: HashMap<String, Value>,
    verified_trust_marks: Vec<Value>,
}

impl EntityConfiguration {
    /// Parses a compact JWS into an entity configuration.
    ///
    /// Enforces the structural invariants of a self-assertion: `iss ==
    /// sub`, a non-empty `jwks`, and `exp > iat`. The signature is NOT
    /// checked here; call [`validate_itself`](Self::validate_itself).
    pub fn parse(jwt: &str) -> Result<Self> {
        let decoded = JwtHelper::fast_parse(jwt)?;

        let payload: EntityStatementPayload = serde_json::from_value(decoded.payload)
            .map_err(|e| OidcFedError::Parse(format!("invalid entity statement: {e}")))?;

        if payload.iss != payload.sub {
            return Err(OidcFedError::InvalidEntityConfiguration {
                subject: payload.sub,
                reason: format!("iss {} differs from sub", payload.iss),
            });
        }

        if payload.exp <= payload.iat {
            return Err(OidcFedError::InvalidEntityConfiguration {
                subject: payload.sub,
                reason: "exp is not after iat".to_string(),
            });
        }

        let jwk_set = match &payload.jwks {
            Some(jwks) => JwkSet::from_value(jwks)?,
            None => {
                error!("missing jwks in the statement for {}", payload.sub);
                return Err(OidcFedError::MissingJwks(payload.sub));
            }
        };

        if jwk_set.is_empty() {
            error!("missing jwks in the statement for {}", payload.sub);
            return Err(OidcFedError::MissingJwks(payload.sub));
        }

        let kids = jwk_set.kids();

        Ok(Self {
            jwt: jwt.to_string(),
            header: decoded.header,
            payload,
            jwk_set,
            kids,
            valid: false,
            verified_superiors: Vec::new(),
            failed_superiors: Vec::new(),
            verified_by_superiors: HashMap::new(),
            failed_by_superiors: Vec::new(),
            verified_descendant_statements: HashMap::new(),
            failed_descendant_statements: HashMap::new(),
            verified_trust_marks: Vec::new(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.payload.sub
    }

    pub fn jwt(&self) -> &str {
        &self.jwt
    }

    pub fn header(&self) -> &Value {
        &self.header
    }

    pub fn payload(&self) -> &EntityStatementPayload {
        &self.payload
    }

    /// The payload as a JSON value, for persistence snapshots.
    pub fn payload_value(&self) -> Value {
        serde_json::to_value(&self.payload).unwrap_or_else(|_| Value::Null)
    }

    pub fn exp(&self) -> i64 {
        self.payload.exp
    }

    pub fn iat(&self) -> i64 {
        self.payload.iat
    }

    pub fn jwk_set(&self) -> &JwkSet {
        &self.jwk_set
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn verified_superiors(&self) -> &[EntityConfiguration] {
        &self.verified_superiors
    }

    /// The statement `issuer` issued about this entity, once verified.
    pub fn statement_by_superior(&self, issuer: &str) -> Option<&str> {
        self.verified_by_superiors.get(issuer).map(String::as_str)
    }

    /// Moves a verified superior out of this entity, handing ownership to
    /// the caller (the chain walk continues from it).
    pub fn take_superior(&mut self, subject: &str) -> Option<EntityConfiguration> {
        let pos = self
            .verified_superiors
            .iter()
            .position(|ec| ec.subject() == subject)?;

        Some(self.verified_superiors.remove(pos))
    }

    pub fn verified_trust_marks(&self) -> &[Value] {
        &self.verified_trust_marks
    }

    /// A numeric entry of the `constraints` claim, when published.
    pub fn constraint_u64(&self, key: &str) -> Option<u64> {
        self.payload
            .constraints
            .as_ref()
            .and_then(|c| c.get(key))
            .and_then(Value::as_u64)
    }

    /// The `federation_fetch_endpoint` advertised in the entity's
    /// `federation_entity` metadata.
    pub fn federation_fetch_endpoint(&self) -> Option<&str> {
        self.payload
            .metadata
            .get(FEDERATION_ENTITY)
            .and_then(|fe| fe.get("federation_fetch_endpoint"))
            .and_then(Value::as_str)
    }

    /// Verifies the stored JWS under the entity's own key set and records
    /// the outcome. Errors are logged, never propagated.
    pub fn validate_itself(&mut self, helper: &JwtHelper) -> bool {
        match helper.verify_jws(&self.jwt, &self.jwk_set) {
            Ok(valid) => {
                self.valid = valid;
                valid
            }
            Err(e) => {
                error!("self validation of {} failed: {e}", self.payload.sub);
                false
            }
        }
    }

    /// Verifies a statement this entity issued about a descendant: the
    /// statement's `kid` must be one of this entity's kids and its
    /// signature must verify under this entity's key set.
    pub fn validate_descendant(&self, jwt: &str, helper: &JwtHelper) -> Result<bool> {
        let decoded = JwtHelper::fast_parse(jwt)?;

        debug!("validate_descendant {}", decoded.payload);

        let kid = decoded
            .header
            .get("kid")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if !self.kids.iter().any(|k| k == kid) {
            return Err(OidcFedError::UnknownKid(kid.to_string()));
        }

        helper.verify_jws(jwt, &self.jwk_set)
    }

    /// Validates this entity with the statement a superior issued about it.
    ///
    /// The superior must self-validate, the statement must verify as one of
    /// the superior's descendants, and the `jwks` embedded in the statement
    /// must verify this entity's own self-assertion. Outcomes are recorded
    /// on both instances; the method never errors.
    pub fn validate_by_superior(
        &mut self,
        statement_jwt: &str,
        superior: &mut EntityConfiguration,
        helper: &JwtHelper,
    ) -> bool {
        let payload = JwtHelper::fast_parse_payload(statement_jwt).unwrap_or(Value::Null);

        let outcome: Result<bool> = (|| {
            if !superior.validate_itself(helper) {
                return Ok(false);
            }

            if !superior.validate_descendant(statement_jwt, helper)? {
                return Ok(false);
            }

            // The descendant keys as seen by the superior.
            let jwks = payload
                .get("jwks")
                .ok_or_else(|| OidcFedError::MissingJwks(self.payload.sub.clone()))?;
            let jwk_set = JwkSet::from_value(jwks)?;

            helper.verify_jws(&self.jwt, &jwk_set)
        })();

        match outcome {
            Ok(true) => {
                superior
                    .verified_descendant_statements
                    .insert(self.payload.sub.clone(), (statement_jwt.to_string(), payload));
                self.verified_by_superiors
                    .insert(superior.payload.sub.clone(), statement_jwt.to_string());
                self.valid = true;
                true
            }
            Ok(false) | Err(_) => {
                if let Err(e) = outcome {
                    warn!(
                        "{} failed validation with {}'s superior statement: {e}",
                        self.payload.sub, superior.payload.sub
                    );
                }
                superior
                    .failed_descendant_statements
                    .insert(self.payload.sub.clone(), payload);
                self.failed_by_superiors.push(superior.payload.sub.clone());
                false
            }
        }
    }

    /// Resolves this entity's superiors from its `authority_hints`.
    ///
    /// Hints already covered by `known` configurations are reused without a
    /// fetch; when `max_hints` is non-zero only the last `max_hints` hints
    /// are walked. Individual failures are logged and skipped, never fatal.
    /// Returns the verified superior subjects in discovery order.
    pub async fn get_superiors(
        &mut self,
        max_hints: usize,
        known: &[&EntityConfiguration],
        fetcher: &EntityFetcher,
        helper: &JwtHelper,
    ) -> Vec<String> {
        let mut hints = self.payload.authority_hints.clone();

        if max_hints > 0 && hints.len() > max_hints {
            let dropped = hints.len() - max_hints;
            warn!(
                "found {} authority hints but the maximum is {max_hints}; ignoring {}",
                hints.len(),
                hints[..dropped].join(", ")
            );
            hints = hints[dropped..].to_vec();
        }

        for known_ec in known {
            if let Some(pos) = hints.iter().position(|h| {
                h.trim_end_matches('/') == known_ec.subject().trim_end_matches('/')
            }) {
                info!(
                    "reusing cached entity configuration for {}",
                    known_ec.subject()
                );
                hints.remove(pos);
                self.verified_superiors.push((*known_ec).clone());
            }
        }

        for hint in hints {
            let jwt = match fetcher.get_entity_configuration(&hint).await {
                Ok(jwt) => jwt,
                Err(e) => {
                    warn!("get entity configuration for {hint}: {e}");
                    self.failed_superiors.push(hint);
                    continue;
                }
            };

            let mut ec = match EntityConfiguration::parse(&jwt) {
                Ok(ec) => ec,
                Err(e) => {
                    warn!("parse entity configuration for {hint}: {e}");
                    self.failed_superiors.push(hint);
                    continue;
                }
            };

            if ec.validate_itself(helper) {
                self.verified_superiors.push(ec);
            } else {
                self.failed_superiors.push(hint);
            }
        }

        self.verified_superiors
            .iter()
            .map(|ec| ec.subject().to_string())
            .collect()
    }

    /// Fetches and verifies the statements the given verified superiors
    /// issued about this entity.
    pub async fn validate_by_superiors(
        &mut self,
        subjects: &[String],
        fetcher: &EntityFetcher,
        helper: &JwtHelper,
    ) {
        for subject in subjects {
            if self.verified_by_superiors.contains_key(subject) {
                continue;
            }

            let Some(pos) = self
                .verified_superiors
                .iter()
                .position(|ec| ec.subject() == subject)
            else {
                continue;
            };

            let mut superior = self.verified_superiors.remove(pos);

            match superior.federation_fetch_endpoint() {
                None => {
                    warn!(
                        "missing federation_fetch_endpoint in federation_entity metadata \
                         for {} by {}",
                        self.payload.sub, subject
                    );
                    self.failed_by_superiors.push(subject.clone());
                }
                Some(endpoint) => {
                    let endpoint = endpoint.to_string();
                    info!("getting entity statement from {endpoint} for {}", self.payload.sub);

                    match fetcher
                        .get_entity_statement(&endpoint, &self.payload.sub)
                        .await
                    {
                        Ok(jwt) => {
                            self.validate_by_superior(&jwt, &mut superior, helper);
                        }
                        Err(e) => {
                            warn!("get entity statement from {endpoint}: {e}");
                            self.failed_by_superiors.push(subject.clone());
                        }
                    }
                }
            }

            self.verified_superiors.insert(pos, superior);
        }
    }

    /// Enforces the allowed-trust-marks policy: with a non-empty allow-list
    /// the entity must carry at least one mark whose `(id, iss)` pair is
    /// allow-listed and whose JWT verifies under the trust anchor's keys.
    pub fn validate_by_allowed_trust_marks(
        &mut self,
        allowed: &[AllowedTrustMark],
        trust_anchor: &EntityConfiguration,
        helper: &JwtHelper,
    ) -> bool {
        if allowed.is_empty() {
            return true;
        }

        let Some(marks) = self
            .payload
            .trust_marks
            .as_ref()
            .and_then(Value::as_array)
            .cloned()
        else {
            warn!(
                "{} doesn't have the trust marks claim in its entity configuration",
                self.payload.sub
            );
            return false;
        };

        for mark in &marks {
            let Some(mark_jwt) = mark.get("trust_mark").and_then(Value::as_str) else {
                continue;
            };

            let Ok(mark_payload) = JwtHelper::fast_parse_payload(mark_jwt) else {
                warn!("malformed trust mark on {}", self.payload.sub);
                continue;
            };

            let id = mark_payload
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let iss = mark_payload
                .get("iss")
                .and_then(Value::as_str)
                .unwrap_or_default();

            if !allowed
                .iter()
                .any(|a| a.id == id && a.trust_anchor == iss.trim_end_matches('/'))
            {
                continue;
            }

            match helper.verify_jws(mark_jwt, trust_anchor.jwk_set()) {
                Ok(true) => self.verified_trust_marks.push(mark.clone()),
                Ok(false) => warn!("trust mark {id} on {} has a bad signature", self.payload.sub),
                Err(e) => warn!("trust mark {id} on {} failed verification: {e}", self.payload.sub),
            }
        }

        !self.verified_trust_marks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::Algorithm;
    use serde_json::json;
    use std::time::Duration;

    use crate::config::SUPPORTED_SIGNING_ALGS;
    use crate::model::now_epoch;

    fn helper() -> JwtHelper {
        JwtHelper::new(
            Algorithm::RS256,
            SUPPORTED_SIGNING_ALGS.to_vec(),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn signed_ec(helper: &JwtHelper, subject: &str, jwks: &JwkSet, extra: Value) -> String {
        let now = now_epoch();
        let mut payload = json!({
            "iss": subject,
            "sub": subject,
            "iat": now,
            "exp": now + 3600,
            "jwks": jwks.public_only().to_value(),
        });
        if let (Value::Object(base), Value::Object(more)) = (&mut payload, extra) {
            base.extend(more);
        }
        helper.create_jws(&payload, jwks).unwrap()
    }

    #[test]
    fn parse_and_self_validate() {
        let helper = helper();
        let jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };

        let jwt = signed_ec(&helper, "https://idp.example", &jwks, json!({}));
        let mut ec = EntityConfiguration::parse(&jwt).unwrap();

        assert_eq!(ec.subject(), "https://idp.example");
        assert!(!ec.is_valid());
        assert!(ec.validate_itself(&helper));
        assert!(ec.is_valid());
    }

    #[test]
    fn parse_rejects_missing_jwks() {
        let helper = helper();
        let jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };

        let now = now_epoch();
        let payload = json!({
            "iss": "https://idp.example",
            "sub": "https://idp.example",
            "iat": now,
            "exp": now + 3600,
        });
        let jwt = helper.create_jws(&payload, &jwks).unwrap();

        assert!(matches!(
            EntityConfiguration::parse(&jwt),
            Err(OidcFedError::MissingJwks(_))
        ));
    }

    #[test]
    fn parse_rejects_issuer_subject_mismatch() {
        let helper = helper();
        let jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };

        let now = now_epoch();
        let payload = json!({
            "iss": "https://one.example",
            "sub": "https://two.example",
            "iat": now,
            "exp": now + 3600,
            "jwks": jwks.public_only().to_value(),
        });
        let jwt = helper.create_jws(&payload, &jwks).unwrap();

        assert!(matches!(
            EntityConfiguration::parse(&jwt),
            Err(OidcFedError::InvalidEntityConfiguration { .. })
        ));
    }

    #[test]
    fn validate_by_superior_records_both_sides() {
        let helper = helper();

        let leaf_jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };
        let superior_jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };

        let leaf_jwt = signed_ec(
            &helper,
            "https://idp.example",
            &leaf_jwks,
            json!({"authority_hints": ["https://ta.example"]}),
        );
        let superior_jwt = signed_ec(&helper, "https://ta.example", &superior_jwks, json!({}));

        let mut leaf = EntityConfiguration::parse(&leaf_jwt).unwrap();
        let mut superior = EntityConfiguration::parse(&superior_jwt).unwrap();

        // The statement the superior issues about the leaf.
        let now = now_epoch();
        let statement = helper
            .create_jws(
                &json!({
                    "iss": "https://ta.example",
                    "sub": "https://idp.example",
                    "iat": now,
                    "exp": now + 3600,
                    "jwks": leaf_jwks.public_only().to_value(),
                }),
                &superior_jwks,
            )
            .unwrap();

        assert!(leaf.validate_by_superior(&statement, &mut superior, &helper));
        assert!(leaf.is_valid());
        assert_eq!(
            leaf.statement_by_superior("https://ta.example"),
            Some(statement.as_str())
        );
        assert!(superior
            .verified_descendant_statements
            .contains_key("https://idp.example"));
    }

    #[test]
    fn validate_descendant_rejects_foreign_kid() {
        let helper = helper();

        let superior_jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };
        let other_jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };

        let superior_jwt = signed_ec(&helper, "https://ta.example", &superior_jwks, json!({}));
        let superior = EntityConfiguration::parse(&superior_jwt).unwrap();

        let statement = helper
            .create_jws(&json!({"iss": "https://ta.example"}), &other_jwks)
            .unwrap();

        assert!(matches!(
            superior.validate_descendant(&statement, &helper),
            Err(OidcFedError::UnknownKid(_))
        ));
    }

    #[test]
    fn allowed_trust_marks_enforced() {
        let helper = helper();

        let anchor_jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };
        let leaf_jwks = JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        };

        let mark_jwt = helper
            .create_jws(
                &json!({
                    "iss": "https://ta.example",
                    "sub": "https://idp.example",
                    "id": "https://ta.example/openid_provider/public",
                }),
                &anchor_jwks,
            )
            .unwrap();

        let anchor_jwt = signed_ec(&helper, "https://ta.example", &anchor_jwks, json!({}));
        let anchor = EntityConfiguration::parse(&anchor_jwt).unwrap();

        let leaf_jwt = signed_ec(
            &helper,
            "https://idp.example",
            &leaf_jwks,
            json!({"trust_marks": [
                {"id": "https://ta.example/openid_provider/public", "trust_mark": mark_jwt}
            ]}),
        );
        let mut leaf = EntityConfiguration::parse(&leaf_jwt).unwrap();

        let allowed = vec![AllowedTrustMark {
            id: "https://ta.example/openid_provider/public".to_string(),
            trust_anchor: "https://ta.example".to_string(),
        }];

        assert!(leaf.validate_by_allowed_trust_marks(&allowed, &anchor, &helper));
        assert_eq!(leaf.verified_trust_marks().len(), 1);

        // A mark outside the allow-list does not qualify.
        let mut other = EntityConfiguration::parse(&leaf_jwt).unwrap();
        let foreign = vec![AllowedTrustMark {
            id: "https://ta.example/other".to_string(),
            trust_anchor: "https://ta.example".to_string(),
        }];
        assert!(!other.validate_by_allowed_trust_marks(&foreign, &anchor, &helper));
    }
}
