// src/relying_party.rs

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::chain::TrustChainBuilder;
use crate::config::{OidcProfile, RelyingPartyConfig};
use crate::entity::EntityConfiguration;
use crate::error::{OidcFedError, Result};
use crate::fetch::{EntityFetcher, WELL_KNOWN_PATH};
use crate::jose::{Jwk, JwkSet, JwtHelper};
use crate::model::{
    now_epoch, CachedEntityInfo, FederationEntity, OidcAuthRequest, OnboardingStep, TrustChain,
    WellKnownData, OPENID_PROVIDER, OPENID_RELYING_PARTY, SCOPE_OPENID,
};
use crate::persistence::Persistence;
use crate::pkce::Pkce;

const SUPPORTED_GRANT_TYPES: [&str; 2] = ["refresh_token", "authorization_code"];
const SUPPORTED_RESPONSE_TYPES: [&str; 1] = ["code"];

/// The top-level federation API of the relying party.
///
/// Cheap to clone; operations may run in parallel across requests. Chain
/// builds targeting the same `(subject, anchor, metadata_type)` are
/// deduplicated so at most one is in flight per key.
#[derive(Clone)]
pub struct RelyingParty {
    inner: Arc<Inner>,
}

struct Inner {
    config: RelyingPartyConfig,
    persistence: Arc<dyn Persistence>,
    jwt_helper: JwtHelper,
    fetcher: EntityFetcher,
    chain_builds: Cache<String, Arc<TrustChain>>,
}

impl RelyingParty {
    pub fn new(
        config: RelyingPartyConfig,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        let jwt_helper = JwtHelper::new(
            config.default_signature_alg,
            config.allowed_signing_algs.clone(),
            config.http_timeout,
        )?;

        let fetcher = EntityFetcher::new(config.http_timeout, config.fetch_retries)?;

        // Completed builds linger briefly so a burst of authorize calls for
        // the same cold provider resolves the chain exactly once.
        let chain_builds = Cache::builder()
            .max_capacity(64)
            .time_to_live(Duration::from_secs(60))
            .build();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                persistence,
                jwt_helper,
                fetcher,
                chain_builds,
            }),
        })
    }

    pub fn config(&self) -> &RelyingPartyConfig {
        &self.inner.config
    }

    /// Builds the URL the user agent is redirected to in order to start an
    /// authorization flow at `provider`.
    ///
    /// Empty string arguments select defaults: the anchor comes from the
    /// provider map and then `default_trust_anchor`, the redirect URI from
    /// the registered list, `scope` is `openid`, `profile` is SPID and
    /// `prompt` is `consent login`.
    #[instrument(skip(self), err)]
    pub async fn get_authorize_url(
        &self,
        provider: &str,
        trust_anchor: &str,
        redirect_uri: &str,
        scope: &str,
        profile: &str,
        prompt: &str,
    ) -> Result<String> {
        let inner = &self.inner;
        let profile = OidcProfile::from_param(profile);

        let tc = self.get_oidc_provider(provider, trust_anchor, profile).await?;

        let provider_metadata = tc.final_metadata.clone();
        if provider_metadata.as_object().map_or(true, Map::is_empty) {
            return Err(OidcFedError::MissingMetadata(format!(
                "provider {} has empty metadata",
                tc.subject
            )));
        }

        let entity = inner
            .persistence
            .fetch_federation_entity(OPENID_RELYING_PARTY)
            .await?
            .filter(|e| e.is_active())
            .ok_or_else(|| {
                OidcFedError::MissingConfiguration(
                    "the relying party is not onboarded or is inactive".to_string(),
                )
            })?;

        let entity_metadata = entity
            .metadata_value(OPENID_RELYING_PARTY)
            .cloned()
            .ok_or_else(|| {
                OidcFedError::MissingConfiguration("entity metadata is empty".to_string())
            })?;

        let entity_jwks = JwkSet::from_value(&entity.jwks)?;
        if entity_jwks.is_empty() {
            return Err(OidcFedError::MissingConfiguration(
                "entity has an invalid or empty jwks".to_string(),
            ));
        }

        let provider_jwks = inner.jwt_helper.metadata_jwk_set(&provider_metadata).await?;

        let authz_endpoint = provider_metadata
            .get("authorization_endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OidcFedError::MissingMetadata(format!(
                    "provider {} publishes no authorization_endpoint",
                    tc.subject
                ))
            })?
            .to_string();

        let entity_redirect_uris: Vec<&str> = entity_metadata
            .get("redirect_uris")
            .and_then(Value::as_array)
            .map(|uris| uris.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        if entity_redirect_uris.is_empty() {
            return Err(OidcFedError::MissingConfiguration(
                "entity has no redirect_uris".to_string(),
            ));
        }

        let redirect_uri = if redirect_uri.is_empty() {
            entity_redirect_uris[0]
        } else if entity_redirect_uris.contains(&redirect_uri) {
            redirect_uri
        } else {
            warn!(
                "requested unknown redirect uri '{redirect_uri}', reverted to default '{}'",
                entity_redirect_uris[0]
            );
            entity_redirect_uris[0]
        };

        let scope = if scope.is_empty() { SCOPE_OPENID } else { scope };
        let prompt = if prompt.is_empty() { "consent login" } else { prompt };
        let acr = inner.config.acr_value(profile);

        let response_type = entity_metadata
            .get("response_types")
            .and_then(Value::as_array)
            .and_then(|types| types.first())
            .and_then(Value::as_str)
            .unwrap_or("code");

        let client_id = entity_metadata
            .get("client_id")
            .and_then(Value::as_str)
            .unwrap_or(&inner.config.client_id)
            .to_string();

        let nonce = Uuid::new_v4().to_string();
        let state = Uuid::new_v4().to_string();
        let iat = now_epoch();
        let pkce = Pkce::generate();

        let mut authz_data = Map::new();
        authz_data.insert("scope".to_string(), json!(scope));
        authz_data.insert("redirect_uri".to_string(), json!(redirect_uri));
        authz_data.insert("response_type".to_string(), json!(response_type));
        authz_data.insert("nonce".to_string(), json!(nonce));
        authz_data.insert("state".to_string(), json!(state));
        authz_data.insert("client_id".to_string(), json!(client_id));
        authz_data.insert("endpoint".to_string(), json!(authz_endpoint));
        authz_data.insert("acr_values".to_string(), json!(acr));
        authz_data.insert("iat".to_string(), json!(iat));
        authz_data.insert(
            "aud".to_string(),
            json!([tc.subject.clone(), authz_endpoint.clone()]),
        );
        authz_data.insert("claims".to_string(), requested_claims(profile));
        authz_data.insert("prompt".to_string(), json!(prompt));
        authz_data.insert(
            "code_verifier".to_string(),
            json!(pkce.code_verifier),
        );
        authz_data.insert(
            "code_challenge".to_string(),
            json!(pkce.code_challenge),
        );
        authz_data.insert(
            "code_challenge_method".to_string(),
            json!(pkce.code_challenge_method),
        );

        let auth_request = OidcAuthRequest {
            client_id: client_id.clone(),
            state: state.clone(),
            endpoint: authz_endpoint.clone(),
            provider: tc.subject.clone(),
            provider_jwks: provider_jwks.to_value(),
            provider_configuration: provider_metadata,
            data: Value::Object(authz_data.clone()),
            created_at: iat,
        };

        inner.persistence.store_oidc_auth_request(auth_request).await?;

        // The signed request object never carries the verifier.
        authz_data.remove("code_verifier");
        authz_data.insert("iss".to_string(), json!(client_id));
        authz_data.insert("sub".to_string(), json!(client_id));

        let request_object = inner
            .jwt_helper
            .create_jws(&Value::Object(authz_data.clone()), &entity_jwks)?;

        authz_data.insert("request".to_string(), json!(request_object));

        let url = build_url(&authz_endpoint, &authz_data)?;

        info!("starting authorization request to {}", tc.subject);

        Ok(url)
    }

    /// Serves the federation well-known document, entering the onboarding
    /// state machine while the relying party is not yet persisted.
    #[instrument(skip(self), err)]
    pub async fn get_well_known_data(
        &self,
        request_url: &str,
        json_mode: bool,
    ) -> Result<WellKnownData> {
        let sub = request_url
            .find(WELL_KNOWN_PATH)
            .map(|i| request_url[..i].trim_end_matches('/'))
            .ok_or_else(|| {
                OidcFedError::InvalidUrl(format!(
                    "{request_url} is not a {WELL_KNOWN_PATH} URL"
                ))
            })?;

        let client_id = self.inner.config.client_id.trim_end_matches('/');

        if sub != client_id {
            return Err(OidcFedError::MismatchedSubject {
                expected: client_id.to_string(),
                actual: sub.to_string(),
            });
        }

        match self
            .inner
            .persistence
            .fetch_federation_entity_by_subject(sub)
            .await?
        {
            Some(entity) => self.well_known_from_entity(&entity, json_mode),
            None => self.prepare_onboarding_data(sub, json_mode).await,
        }
    }

    /// Resolves `(provider, anchor)` into a usable trust chain: configured
    /// anchors only, stored chains when fresh, a deduplicated build
    /// otherwise. Disabled chains are never rebuilt.
    async fn get_oidc_provider(
        &self,
        provider: &str,
        trust_anchor: &str,
        profile: OidcProfile,
    ) -> Result<Arc<TrustChain>> {
        let inner = &self.inner;
        let provider = provider.trim_end_matches('/');

        if provider.is_empty() {
            warn!("authorize called without a provider");
            return Err(OidcFedError::MissingProvider);
        }

        let mut anchor = trust_anchor.trim_end_matches('/').to_string();

        if anchor.is_empty() {
            anchor = inner
                .config
                .providers(profile)
                .get(provider)
                .cloned()
                .unwrap_or_default();

            if anchor.is_empty() {
                anchor = inner.config.default_trust_anchor.clone();
            }
        }

        if !inner.config.trust_anchors.contains(&anchor) {
            warn!("refused authorize through unknown trust anchor {anchor}");
            return Err(OidcFedError::InvalidTrustAnchor(anchor));
        }

        match inner.persistence.fetch_oidc_provider(provider, profile).await? {
            None => {
                info!("trust chain not found for {provider}");
            }
            Some(tc) if !tc.is_active() => {
                warn!("trust chain for {provider} is disabled");
                return Err(OidcFedError::TrustChainDisabled {
                    subject: tc.subject,
                    modified_at: tc.modified_at,
                });
            }
            Some(tc) if tc.is_expired() => {
                warn!(
                    "trust chain for {provider} found but expired at {}; renewing it",
                    tc.exp
                );
            }
            Some(tc) => return Ok(Arc::new(tc)),
        }

        self.resolve_trust_chain(provider, &anchor, OPENID_PROVIDER).await
    }

    /// Runs one deduplicated chain build. Concurrent callers for the same
    /// key await the same in-flight future; a lingering result that has
    /// already expired is dropped and rebuilt once.
    async fn resolve_trust_chain(
        &self,
        subject: &str,
        anchor: &str,
        metadata_type: &str,
    ) -> Result<Arc<TrustChain>> {
        let key = format!("{subject}|{anchor}|{metadata_type}");

        for attempt in 0..2 {
            let inner = self.inner.clone();
            let subject = subject.to_string();
            let anchor = anchor.to_string();
            let metadata_type = metadata_type.to_string();

            let result = self
                .inner
                .chain_builds
                .try_get_with(key.clone(), async move {
                    inner
                        .build_and_store(&subject, &anchor, &metadata_type)
                        .await
                        .map(Arc::new)
                })
                .await;

            match result {
                Ok(chain) if chain.is_expired() && attempt == 0 => {
                    self.inner.chain_builds.invalidate(&key).await;
                }
                Ok(chain) => return Ok(chain),
                Err(shared) => return Err(OidcFedError::from_shared(shared)),
            }
        }

        Err(OidcFedError::InvalidTrustChain(format!(
            "the rebuilt chain for {subject} is already expired"
        )))
    }

    fn well_known_from_entity(
        &self,
        entity: &FederationEntity,
        json_mode: bool,
    ) -> Result<WellKnownData> {
        let jwk_set = JwkSet::from_value(&entity.jwks)?;
        let iat = now_epoch();

        let payload = json!({
            "iss": entity.subject,
            "sub": entity.subject,
            "iat": iat,
            "exp": iat + entity.default_expire_minutes * 60,
            "jwks": jwk_set.public_only().to_value(),
            "metadata": entity.metadata,
            "authority_hints": entity.authority_hints,
            "trust_marks": entity.trust_marks,
        });

        if json_mode {
            return Ok(WellKnownData::of(
                OnboardingStep::Complete,
                pretty(&payload)?,
            ));
        }

        let jws = self.inner.jwt_helper.create_jws(&payload, &jwk_set)?;

        Ok(WellKnownData::of(OnboardingStep::Complete, jws))
    }

    async fn prepare_onboarding_data(
        &self,
        sub: &str,
        json_mode: bool,
    ) -> Result<WellKnownData> {
        let inner = &self.inner;
        let configured_jwk = inner.config.jwk.trim();

        // Without key material the only useful output is a fresh key the
        // operator moves into configuration before restarting.
        if configured_jwk.is_empty() {
            let jwk = JwtHelper::create_rsa_key()?;

            info!("no jwk configured, generated key {:?}", jwk.kid);

            let body = serde_json::to_string_pretty(&jwk)
                .map_err(|e| OidcFedError::Parse(e.to_string()))?;

            return Ok(WellKnownData::of(OnboardingStep::OnlyJwks, body));
        }

        let jwk: Jwk = serde_json::from_str(configured_jwk)
            .map_err(|e| OidcFedError::Parse(format!("invalid configured jwk: {e}")))?;

        info!("configured jwk {:?}", jwk.kid);

        let jwk_set = JwkSet { keys: vec![jwk] };
        let public_jwks = jwk_set.public_only().to_value();

        let rp_metadata = json!({
            "jwks": public_jwks,
            "application_type": inner.config.application_type,
            "client_name": inner.config.application_name,
            "client_id": sub,
            "client_registration_types": ["automatic"],
            "contacts": inner.config.contacts,
            "grant_types": SUPPORTED_GRANT_TYPES,
            "response_types": SUPPORTED_RESPONSE_TYPES,
            "redirect_uris": inner.config.redirect_uris,
        });

        let metadata = json!({ OPENID_RELYING_PARTY: rp_metadata });
        let iat = now_epoch();

        let mut payload = json!({
            "iss": sub,
            "sub": sub,
            "iat": iat,
            "exp": iat + inner.config.default_expire_minutes * 60,
            "jwks": public_jwks,
            "metadata": metadata,
            "authority_hints": [inner.config.default_trust_anchor],
        });

        let trust_marks = inner
            .config
            .trust_marks
            .clone()
            .filter(|marks| marks.as_array().map_or(false, |m| !m.is_empty()));

        let step = match trust_marks {
            None => OnboardingStep::Intermediate,
            Some(marks) => {
                payload["trust_marks"] = marks.clone();

                // With the trust marks every element of the federation
                // entity is known, so the relying party can be persisted.
                let entity = FederationEntity {
                    subject: sub.to_string(),
                    jwks: jwk_set.to_value(),
                    metadata: payload["metadata"].clone(),
                    authority_hints: vec![inner.config.default_trust_anchor.clone()],
                    trust_marks: marks.clone(),
                    trust_marks_issuers: json!({}),
                    constraints: json!({}),
                    entity_type: OPENID_RELYING_PARTY.to_string(),
                    default_expire_minutes: inner.config.default_expire_minutes,
                    default_signature_alg: format!("{:?}", inner.config.default_signature_alg),
                    active: true,
                };

                inner.persistence.store_federation_entity(entity).await?;

                OnboardingStep::Complete
            }
        };

        if json_mode {
            return Ok(WellKnownData::of(step, pretty(&payload)?));
        }

        let jws = inner.jwt_helper.create_jws(&payload, &jwk_set)?;

        Ok(WellKnownData::of(step, jws))
    }
}

impl Inner {
    /// The build half of get-or-create: refuses disabled rows, resolves the
    /// anchor configuration through the entity-info cache, walks the chain
    /// and upserts the result — all bounded by the operation deadline.
    async fn build_and_store(
        &self,
        subject: &str,
        anchor: &str,
        metadata_type: &str,
    ) -> Result<TrustChain> {
        let operation = async {
            if let Some(existing) = self
                .persistence
                .fetch_trust_chain(subject, anchor, metadata_type)
                .await?
            {
                if !existing.is_active() {
                    return Err(OidcFedError::TrustChainDisabled {
                        subject: existing.subject,
                        modified_at: existing.modified_at,
                    });
                }
            }

            let ta_conf = self.trust_anchor_configuration(anchor).await?;

            let chain = TrustChainBuilder::new(
                subject,
                metadata_type,
                ta_conf,
                &self.jwt_helper,
                &self.fetcher,
            )
            .max_path_len(self.config.max_path_len)
            .max_authority_hints(self.config.max_authority_hints)
            .allowed_trust_marks(&self.config.allowed_trust_marks)
            .start()
            .await?;

            self.persistence.store_trust_chain(chain).await
        };

        tokio::time::timeout(self.config.operation_timeout, operation)
            .await
            .map_err(|_| {
                OidcFedError::DeadlineExceeded(format!(
                    "resolving the trust chain for {subject}"
                ))
            })?
    }

    /// The trust anchor's self-assertion, served from the entity-info
    /// cache while fresh and refetched (and upserted) once expired.
    async fn trust_anchor_configuration(&self, anchor: &str) -> Result<EntityConfiguration> {
        if let Some(info) = self.persistence.fetch_entity_info(anchor, anchor).await? {
            if !info.is_expired() {
                return EntityConfiguration::parse(&info.jwt);
            }
        }

        let jwt = self.fetcher.get_entity_configuration(anchor).await?;
        let ec = EntityConfiguration::parse(&jwt)?;

        let info = CachedEntityInfo {
            subject: anchor.to_string(),
            issuer: anchor.to_string(),
            iat: ec.iat(),
            exp: ec.exp(),
            statement: ec.payload_value(),
            jwt: ec.jwt().to_string(),
            modified_at: now_epoch(),
        };

        self.persistence.store_entity_info(info).await?;

        Ok(ec)
    }
}

/// The claims requested from the provider, per identity profile.
fn requested_claims(profile: OidcProfile) -> Value {
    match profile {
        OidcProfile::Spid => json!({
            "id_token": {
                "https://attributes.spid.gov.it/familyName": {"essential": true},
                "https://attributes.spid.gov.it/email": {"essential": true},
            },
            "userinfo": {
                "https://attributes.spid.gov.it/name": {},
                "https://attributes.spid.gov.it/familyName": {},
                "https://attributes.spid.gov.it/email": {},
                "https://attributes.spid.gov.it/fiscalNumber": {},
            },
        }),
        OidcProfile::Cie => json!({}),
    }
}

fn build_url(endpoint: &str, params: &Map<String, Value>) -> Result<String> {
    let mut url = Url::parse(endpoint).map_err(|e| OidcFedError::InvalidUrl(e.to_string()))?;

    {
        let mut pairs = url.query_pairs_mut();

        for (key, value) in params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.append_pair(key, &rendered);
        }
    }

    Ok(url.into())
}

fn pretty(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| OidcFedError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spid_claims_request_the_mandatory_attributes() {
        let claims = requested_claims(OidcProfile::Spid);

        assert_eq!(
            claims["id_token"]["https://attributes.spid.gov.it/familyName"]["essential"],
            true
        );
        assert!(claims["userinfo"]
            .as_object()
            .unwrap()
            .contains_key("https://attributes.spid.gov.it/fiscalNumber"));

        assert_eq!(requested_claims(OidcProfile::Cie), json!({}));
    }

    #[test]
    fn build_url_encodes_every_parameter() {
        let mut params = Map::new();
        params.insert("client_id".to_string(), json!("https://rp.example"));
        params.insert("aud".to_string(), json!(["https://idp.example"]));

        let url = build_url("https://idp.example/authorize", &params).unwrap();

        assert!(url.starts_with("https://idp.example/authorize?"));
        assert!(url.contains("client_id=https%3A%2F%2Frp.example"));
        assert!(url.contains("aud=%5B%22https%3A%2F%2Fidp.example%22%5D"));
    }
}
