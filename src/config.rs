// src/config.rs

use std::collections::HashMap;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use url::Url;

use crate::error::OidcFedError;

/// Signing algorithms a federation participant is allowed to use.
pub const SUPPORTED_SIGNING_ALGS: [Algorithm; 5] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Default self-assertion lifetime, in minutes (48 hours).
pub const DEFAULT_EXPIRE_MINUTES: i64 = 2880;

/// Default ACR requested when a profile has no configured value.
pub const DEFAULT_ACR_VALUE: &str = "https://www.spid.gov.it/SpidL2";

/// The identity profiles this relying party can start a flow for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OidcProfile {
    Spid,
    Cie,
}

impl OidcProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            OidcProfile::Spid => "spid",
            OidcProfile::Cie => "cie",
        }
    }

    /// Maps a request parameter to a profile. Empty or unknown values fall
    /// back to SPID, the original ecosystem default.
    pub fn from_param(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "cie" => OidcProfile::Cie,
            _ => OidcProfile::Spid,
        }
    }
}

/// An entry of the allowed-trust-marks list: the mark id together with the
/// anchor whose keys must verify it.
#[derive(Clone, Debug)]
pub struct AllowedTrustMark {
    pub id: String,
    pub trust_anchor: String,
}

/// The full configuration of the relying party.
///
/// Construct it through [`RelyingPartyConfigBuilder`]; `build()` validates
/// the cross-field constraints (anchor containment, algorithm allow-list).
#[derive(Clone)]
pub struct RelyingPartyConfig {
    /// The client identifier, also the `sub`/`iss` of the published
    /// self-assertion. A URL.
    pub client_id: String,
    pub application_name: String,
    /// OIDC application type, `web` unless overridden.
    pub application_type: String,
    pub contacts: Vec<String>,
    /// Registered redirect URIs. The first one is the default.
    pub redirect_uris: Vec<String>,
    /// The trust anchors this party recognises out-of-band.
    pub trust_anchors: Vec<String>,
    pub default_trust_anchor: String,
    /// Provider URL -> default anchor URL, per profile.
    pub spid_providers: HashMap<String, String>,
    pub cie_providers: HashMap<String, String>,
    /// Requested ACR per profile.
    pub acr_values: HashMap<OidcProfile, String>,
    /// Trust marks issued to this party (JSON array), if any.
    pub trust_marks: Option<serde_json::Value>,
    /// Stringified private JWK. Empty triggers the onboarding flow.
    pub jwk: String,
    pub default_expire_minutes: i64,
    pub default_signature_alg: Algorithm,
    pub allowed_signing_algs: Vec<Algorithm>,
    /// Authority hints considered per hop; later hints win. 0 disables the cap.
    pub max_authority_hints: usize,
    /// Upper bound on the subject-to-anchor walk length.
    pub max_path_len: usize,
    pub allowed_trust_marks: Vec<AllowedTrustMark>,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// Retries on transport errors, per fetch.
    pub fetch_retries: u32,
    /// Deadline bounding one whole chain resolution, downstream fetches
    /// included.
    pub operation_timeout: Duration,
}

impl RelyingPartyConfig {
    /// The ACR requested for `profile`.
    pub fn acr_value(&self, profile: OidcProfile) -> &str {
        self.acr_values
            .get(&profile)
            .map(String::as_str)
            .unwrap_or(DEFAULT_ACR_VALUE)
    }

    /// The provider map for `profile`.
    pub fn providers(&self, profile: OidcProfile) -> &HashMap<String, String> {
        match profile {
            OidcProfile::Spid => &self.spid_providers,
            OidcProfile::Cie => &self.cie_providers,
        }
    }
}

/// A builder for [`RelyingPartyConfig`].
#[derive(Default)]
pub struct RelyingPartyConfigBuilder {
    client_id: Option<String>,
    application_name: Option<String>,
    application_type: Option<String>,
    contacts: Vec<String>,
    redirect_uris: Vec<String>,
    trust_anchors: Vec<String>,
    default_trust_anchor: Option<String>,
    spid_providers: HashMap<String, String>,
    cie_providers: HashMap<String, String>,
    acr_values: HashMap<OidcProfile, String>,
    trust_marks: Option<serde_json::Value>,
    jwk: Option<String>,
    default_expire_minutes: Option<i64>,
    default_signature_alg: Option<Algorithm>,
    allowed_signing_algs: Vec<Algorithm>,
    max_authority_hints: Option<usize>,
    max_path_len: Option<usize>,
    allowed_trust_marks: Vec<AllowedTrustMark>,
    http_timeout: Option<Duration>,
    fetch_retries: Option<u32>,
    operation_timeout: Option<Duration>,
}

impl RelyingPartyConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the client identifier. Required; must be a valid URL.
    pub fn client_id(mut self, url: &str) -> std::result::Result<Self, OidcFedError> {
        Url::parse(url).map_err(|e| OidcFedError::InvalidUrl(e.to_string()))?;
        self.client_id = Some(url.trim_end_matches('/').to_string());
        Ok(self)
    }

    pub fn application_name(mut self, name: &str) -> Self {
        self.application_name = Some(name.to_string());
        self
    }

    pub fn application_type(mut self, value: &str) -> Self {
        self.application_type = Some(value.to_string());
        self
    }

    pub fn contacts<I: IntoIterator<Item = String>>(mut self, contacts: I) -> Self {
        self.contacts = contacts.into_iter().collect();
        self
    }

    /// Registers the redirect URIs. Required, non-empty.
    pub fn redirect_uris<I: IntoIterator<Item = String>>(mut self, uris: I) -> Self {
        self.redirect_uris = uris.into_iter().collect();
        self
    }

    /// Registers the recognised trust anchors. Required, non-empty.
    pub fn trust_anchors<I: IntoIterator<Item = String>>(mut self, anchors: I) -> Self {
        self.trust_anchors = anchors
            .into_iter()
            .map(|a| a.trim_end_matches('/').to_string())
            .collect();
        self
    }

    pub fn default_trust_anchor(mut self, anchor: &str) -> Self {
        self.default_trust_anchor = Some(anchor.trim_end_matches('/').to_string());
        self
    }

    pub fn spid_provider(mut self, provider: &str, anchor: &str) -> Self {
        self.spid_providers.insert(
            provider.trim_end_matches('/').to_string(),
            anchor.trim_end_matches('/').to_string(),
        );
        self
    }

    pub fn cie_provider(mut self, provider: &str, anchor: &str) -> Self {
        self.cie_providers.insert(
            provider.trim_end_matches('/').to_string(),
            anchor.trim_end_matches('/').to_string(),
        );
        self
    }

    pub fn acr_value(mut self, profile: OidcProfile, acr: &str) -> Self {
        self.acr_values.insert(profile, acr.to_string());
        self
    }

    /// Sets the trust marks issued to this party, as a JSON array.
    pub fn trust_marks(mut self, marks: serde_json::Value) -> Self {
        self.trust_marks = Some(marks);
        self
    }

    /// Sets the private JWK (stringified JSON). Leave unset to let the
    /// well-known endpoint drive onboarding.
    pub fn jwk(mut self, jwk: &str) -> Self {
        self.jwk = Some(jwk.to_string());
        self
    }

    pub fn default_expire_minutes(mut self, minutes: i64) -> Self {
        self.default_expire_minutes = Some(minutes);
        self
    }

    pub fn default_signature_alg(mut self, alg: Algorithm) -> Self {
        self.default_signature_alg = Some(alg);
        self
    }

    pub fn allowed_signing_algs(mut self, algs: Vec<Algorithm>) -> Self {
        self.allowed_signing_algs = algs;
        self
    }

    pub fn max_authority_hints(mut self, max: usize) -> Self {
        self.max_authority_hints = Some(max);
        self
    }

    pub fn max_path_len(mut self, max: usize) -> Self {
        self.max_path_len = Some(max);
        self
    }

    pub fn allowed_trust_mark(mut self, id: &str, trust_anchor: &str) -> Self {
        self.allowed_trust_marks.push(AllowedTrustMark {
            id: id.to_string(),
            trust_anchor: trust_anchor.trim_end_matches('/').to_string(),
        });
        self
    }

    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    pub fn fetch_retries(mut self, retries: u32) -> Self {
        self.fetch_retries = Some(retries);
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Consumes the builder and returns a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when required fields are missing, `redirect_uris`
    /// or `trust_anchors` is empty, the default anchor is not among the
    /// anchors, or the algorithm settings step outside the supported set.
    pub fn build(self) -> std::result::Result<RelyingPartyConfig, OidcFedError> {
        let client_id = self
            .client_id
            .ok_or_else(|| OidcFedError::MissingConfiguration("client_id".to_string()))?;

        if self.redirect_uris.is_empty() {
            return Err(OidcFedError::InvalidConfiguration(
                "redirect_uris must not be empty".to_string(),
            ));
        }

        if self.trust_anchors.is_empty() {
            return Err(OidcFedError::InvalidConfiguration(
                "trust_anchors must not be empty".to_string(),
            ));
        }

        let default_trust_anchor = match self.default_trust_anchor {
            Some(anchor) => anchor,
            None => self.trust_anchors[0].clone(),
        };

        if !self.trust_anchors.contains(&default_trust_anchor) {
            return Err(OidcFedError::InvalidConfiguration(format!(
                "default_trust_anchor {default_trust_anchor} is not among the trust_anchors"
            )));
        }

        let allowed_signing_algs = if self.allowed_signing_algs.is_empty() {
            SUPPORTED_SIGNING_ALGS.to_vec()
        } else {
            self.allowed_signing_algs
        };

        for alg in &allowed_signing_algs {
            if !SUPPORTED_SIGNING_ALGS.contains(alg) {
                return Err(OidcFedError::InvalidConfiguration(format!(
                    "signing algorithm {alg:?} is not supported"
                )));
            }
        }

        let default_signature_alg = self.default_signature_alg.unwrap_or(Algorithm::RS256);

        if !allowed_signing_algs.contains(&default_signature_alg) {
            return Err(OidcFedError::InvalidConfiguration(format!(
                "default signature algorithm {default_signature_alg:?} is not allowed"
            )));
        }

        Ok(RelyingPartyConfig {
            client_id,
            application_name: self.application_name.unwrap_or_default(),
            application_type: self
                .application_type
                .unwrap_or_else(|| "web".to_string()),
            contacts: self.contacts,
            redirect_uris: self.redirect_uris,
            trust_anchors: self.trust_anchors,
            default_trust_anchor,
            spid_providers: self.spid_providers,
            cie_providers: self.cie_providers,
            acr_values: self.acr_values,
            trust_marks: self.trust_marks,
            jwk: self.jwk.unwrap_or_default(),
            default_expire_minutes: self
                .default_expire_minutes
                .unwrap_or(DEFAULT_EXPIRE_MINUTES),
            default_signature_alg,
            allowed_signing_algs,
            max_authority_hints: self.max_authority_hints.unwrap_or(10),
            max_path_len: self.max_path_len.unwrap_or(10),
            allowed_trust_marks: self.allowed_trust_marks,
            http_timeout: self.http_timeout.unwrap_or(Duration::from_secs(10)),
            fetch_retries: self.fetch_retries.unwrap_or(2),
            operation_timeout: self
                .operation_timeout
                .unwrap_or(Duration::from_secs(30)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> RelyingPartyConfigBuilder {
        RelyingPartyConfigBuilder::new()
            .client_id("https://rp.example")
            .unwrap()
            .redirect_uris(vec!["https://rp.example/callback".to_string()])
            .trust_anchors(vec!["https://ta.example".to_string()])
    }

    #[test]
    fn build_with_defaults() {
        let config = minimal().build().unwrap();

        assert_eq!(config.client_id, "https://rp.example");
        assert_eq!(config.application_type, "web");
        assert_eq!(config.default_trust_anchor, "https://ta.example");
        assert_eq!(config.default_signature_alg, Algorithm::RS256);
        assert_eq!(config.default_expire_minutes, DEFAULT_EXPIRE_MINUTES);
        assert_eq!(config.max_authority_hints, 10);
        assert_eq!(config.acr_value(OidcProfile::Spid), DEFAULT_ACR_VALUE);
    }

    #[test]
    fn rejects_foreign_default_anchor() {
        let result = minimal()
            .default_trust_anchor("https://other.example")
            .build();

        assert!(matches!(
            result,
            Err(OidcFedError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_empty_redirect_uris() {
        let result = RelyingPartyConfigBuilder::new()
            .client_id("https://rp.example")
            .unwrap()
            .trust_anchors(vec!["https://ta.example".to_string()])
            .build();

        assert!(matches!(
            result,
            Err(OidcFedError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_disallowed_default_alg() {
        let result = minimal()
            .allowed_signing_algs(vec![Algorithm::ES256])
            .default_signature_alg(Algorithm::RS256)
            .build();

        assert!(matches!(
            result,
            Err(OidcFedError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn profile_from_param() {
        assert_eq!(OidcProfile::from_param("cie"), OidcProfile::Cie);
        assert_eq!(OidcProfile::from_param("CIE"), OidcProfile::Cie);
        assert_eq!(OidcProfile::from_param(""), OidcProfile::Spid);
        assert_eq!(OidcProfile::from_param("spid"), OidcProfile::Spid);
    }
}
