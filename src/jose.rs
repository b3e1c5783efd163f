// src/jose.rs

use std::time::Duration;

use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{OidcFedError, Result};

/// A single JSON Web Key as defined in RFC 7517.
///
/// Private RSA components are carried when present; unknown members pass
/// through untouched in `extra`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    // RSA members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
    // EC members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Jwk {
    /// Whether the key carries private material.
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// The public projection of this key.
    pub fn public_jwk(&self) -> Jwk {
        let mut jwk = self.clone();
        jwk.d = None;
        jwk.p = None;
        jwk.q = None;
        jwk.dp = None;
        jwk.dq = None;
        jwk.qi = None;
        jwk
    }

    /// Builds a verification key from the public components.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self.component(&self.n, "n")?;
                let e = self.component(&self.e, "e")?;
                Ok(DecodingKey::from_rsa_components(n, e)?)
            }
            "EC" => {
                let x = self.component(&self.x, "x")?;
                let y = self.component(&self.y, "y")?;
                Ok(DecodingKey::from_ec_components(x, y)?)
            }
            other => Err(OidcFedError::UnsupportedKeyType(other.to_string())),
        }
    }

    /// Builds a signing key from the private components.
    ///
    /// Only RSA keys are supported on the signing path; the private key is
    /// reassembled from its JWK components and handed to `jsonwebtoken` as
    /// PKCS#1 DER.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        if self.kty != "RSA" {
            return Err(OidcFedError::UnsupportedKeyType(format!(
                "cannot sign with a {} key",
                self.kty
            )));
        }

        let n = decode_biguint(self.component(&self.n, "n")?)?;
        let e = decode_biguint(self.component(&self.e, "e")?)?;
        let d = decode_biguint(self.component(&self.d, "d")?)?;

        let mut primes = Vec::new();
        if let (Some(p), Some(q)) = (&self.p, &self.q) {
            primes.push(decode_biguint(p)?);
            primes.push(decode_biguint(q)?);
        }

        let private_key = RsaPrivateKey::from_components(n, e, d, primes)
            .map_err(|e| OidcFedError::Key(format!("invalid RSA components: {e}")))?;

        let pkcs1_der = private_key
            .to_pkcs1_der()
            .map_err(|e| OidcFedError::Key(format!("PKCS#1 encoding failed: {e}")))?;

        Ok(EncodingKey::from_rsa_der(pkcs1_der.as_bytes()))
    }

    fn component<'a>(&self, value: &'a Option<String>, name: &str) -> Result<&'a str> {
        value.as_deref().ok_or_else(|| {
            OidcFedError::Key(format!("{} key missing '{name}' component", self.kty))
        })
    }
}

/// A JSON Web Key Set.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Parses a key set from either a complete `{"keys": […]}` object or a
    /// bare array of keys.
    pub fn from_value(value: &Value) -> Result<JwkSet> {
        let result = if value.is_array() {
            serde_json::from_value::<Vec<Jwk>>(value.clone()).map(|keys| JwkSet { keys })
        } else {
            serde_json::from_value::<JwkSet>(value.clone())
        };

        result.map_err(|e| OidcFedError::Parse(format!("invalid jwks: {e}")))
    }

    /// Parses a key set from its JSON string form.
    pub fn from_json(value: &str) -> Result<JwkSet> {
        let json: Value = serde_json::from_str(value)
            .map_err(|e| OidcFedError::Parse(format!("invalid jwks: {e}")))?;

        JwkSet::from_value(&json)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn first(&self) -> Option<&Jwk> {
        self.keys.first()
    }

    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    pub fn kids(&self) -> Vec<String> {
        self.keys.iter().filter_map(|k| k.kid.clone()).collect()
    }

    /// The key set with every private component stripped.
    pub fn public_only(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.iter().map(Jwk::public_jwk).collect(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Null)
    }
}

/// The two decoded halves of a compact JWT, unverified.
#[derive(Clone, Debug)]
pub struct DecodedJwt {
    pub header: Value,
    pub payload: Value,
}

/// All JOSE operations of the federation core.
///
/// Stateless apart from the signing policy taken from configuration; the
/// embedded HTTP client only serves `jwks_uri` retrievals.
#[derive(Clone)]
pub struct JwtHelper {
    default_alg: Algorithm,
    allowed_algs: Vec<Algorithm>,
    http_client: reqwest::Client,
}

impl JwtHelper {
    pub fn new(
        default_alg: Algorithm,
        allowed_algs: Vec<Algorithm>,
        http_timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(http_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            default_alg,
            allowed_algs,
            http_client,
        })
    }

    /// Decodes header and payload of a compact JWT without verifying it.
    pub fn fast_parse(jwt: &str) -> Result<DecodedJwt> {
        let mut parts = jwt.split('.');

        let header = parts
            .next()
            .ok_or_else(|| OidcFedError::Parse("empty JWT".to_string()))?;
        let payload = parts
            .next()
            .ok_or_else(|| OidcFedError::Parse("JWT has no payload segment".to_string()))?;

        Ok(DecodedJwt {
            header: decode_segment(header)?,
            payload: decode_segment(payload)?,
        })
    }

    /// Decodes only the payload of a compact JWT without verifying it.
    pub fn fast_parse_payload(jwt: &str) -> Result<Value> {
        Ok(Self::fast_parse(jwt)?.payload)
    }

    /// Signs `payload` with the first key of `jwks`, producing a compact JWS
    /// whose header carries `alg` and `kid`.
    pub fn create_jws(&self, payload: &Value, jwks: &JwkSet) -> Result<String> {
        let jwk = jwks
            .first()
            .ok_or_else(|| OidcFedError::MissingJwks("jwk set is empty".to_string()))?;

        let key = jwk.encoding_key()?;

        let mut header = Header::new(self.default_alg);
        header.kid = jwk.kid.clone();

        Ok(jsonwebtoken::encode(&header, payload, &key)?)
    }

    /// Verifies the signature of a compact JWS against `jwks`.
    ///
    /// The key is selected by the header `kid` (`UnknownKid` when absent
    /// from the set) and the header `alg` must be in the configured
    /// allow-list (`UnsupportedAlgorithm` otherwise). A well-formed token
    /// with a wrong signature yields `Ok(false)`.
    pub fn verify_jws(&self, jwt: &str, jwks: &JwkSet) -> Result<bool> {
        let header = decode_header(jwt)?;

        let kid = header
            .kid
            .ok_or_else(|| OidcFedError::UnknownKid("(no kid in header)".to_string()))?;

        let jwk = jwks
            .find(&kid)
            .ok_or_else(|| OidcFedError::UnknownKid(kid.clone()))?;

        if !self.allowed_algs.contains(&header.alg) {
            return Err(OidcFedError::UnsupportedAlgorithm(format!(
                "{:?}",
                header.alg
            )));
        }

        let key = jwk.decoding_key()?;

        // Signature check only; claim semantics are the caller's concern.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        match decode::<Value>(jwt, &key, &validation) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves the key set of a metadata block: embedded `jwks` wins,
    /// otherwise `jwks_uri` is downloaded.
    #[instrument(skip(self, metadata), err)]
    pub async fn metadata_jwk_set(&self, metadata: &Value) -> Result<JwkSet> {
        if let Some(jwks) = metadata.get("jwks") {
            return JwkSet::from_value(jwks);
        }

        if let Some(url) = metadata.get("jwks_uri").and_then(Value::as_str) {
            debug!("downloading jwks from {url}");

            let json: Value = self
                .http_client
                .get(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| {
                    OidcFedError::FetchFailed(format!("failed to download jwks from {url}: {e}"))
                })?
                .json()
                .await
                .map_err(|e| {
                    OidcFedError::FetchFailed(format!("failed to download jwks from {url}: {e}"))
                })?;

            return JwkSet::from_value(&json);
        }

        Err(OidcFedError::MissingJwks("no jwks in metadata".to_string()))
    }

    /// Generates a fresh 2048-bit RSA signing key with a random `kid`.
    pub fn create_rsa_key() -> Result<Jwk> {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|e| OidcFedError::Key(format!("RSA key generation failed: {e}")))?;

        let public_key = private_key.to_public_key();
        let primes = private_key.primes();

        Ok(Jwk {
            kty: "RSA".to_string(),
            kid: Some(Uuid::new_v4().to_string()),
            use_purpose: Some("sig".to_string()),
            alg: None,
            n: Some(URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be())),
            e: Some(URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be())),
            d: Some(URL_SAFE_NO_PAD.encode(private_key.d().to_bytes_be())),
            p: primes
                .first()
                .map(|p| URL_SAFE_NO_PAD.encode(p.to_bytes_be())),
            q: primes.get(1).map(|q| URL_SAFE_NO_PAD.encode(q.to_bytes_be())),
            dp: None,
            dq: None,
            qi: None,
            crv: None,
            x: None,
            y: None,
            extra: Map::new(),
        })
    }
}

fn decode_segment(segment: &str) -> Result<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| OidcFedError::Parse(format!("invalid base64url segment: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| OidcFedError::Parse(format!("invalid JSON in JWT segment: {e}")))
}

fn decode_biguint(component: &str) -> Result<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(component)
        .map_err(|e| OidcFedError::Key(format!("invalid base64url key component: {e}")))?;

    Ok(BigUint::from_bytes_be(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn helper() -> JwtHelper {
        JwtHelper::new(
            Algorithm::RS256,
            crate::config::SUPPORTED_SIGNING_ALGS.to_vec(),
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn key_set() -> JwkSet {
        JwkSet {
            keys: vec![JwtHelper::create_rsa_key().unwrap()],
        }
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let helper = helper();
        let jwks = key_set();

        let payload = json!({"iss": "https://rp.example", "sub": "https://rp.example"});
        let jws = helper.create_jws(&payload, &jwks).unwrap();

        assert!(helper.verify_jws(&jws, &jwks.public_only()).unwrap());

        let decoded = JwtHelper::fast_parse(&jws).unwrap();
        assert_eq!(decoded.header["alg"], "RS256");
        assert_eq!(
            decoded.header["kid"].as_str(),
            jwks.keys[0].kid.as_deref()
        );
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn verify_rejects_unknown_kid() {
        let helper = helper();
        let signer = key_set();
        let other = key_set();

        let jws = helper.create_jws(&json!({"a": 1}), &signer).unwrap();

        let result = helper.verify_jws(&jws, &other);
        assert!(matches!(result, Err(OidcFedError::UnknownKid(_))));
    }

    #[test]
    fn verify_rejects_disallowed_algorithm() {
        let jwks = key_set();
        let signing_helper = helper();
        let jws = signing_helper.create_jws(&json!({"a": 1}), &jwks).unwrap();

        let strict = JwtHelper::new(
            Algorithm::ES256,
            vec![Algorithm::ES256],
            Duration::from_secs(10),
        )
        .unwrap();

        let result = strict.verify_jws(&jws, &jwks);
        assert!(matches!(
            result,
            Err(OidcFedError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn verify_detects_forged_signature() {
        let helper = helper();
        let signer = key_set();
        // A key set with the signer's kid but somebody else's material.
        let mut forged = key_set();
        forged.keys[0].kid = signer.keys[0].kid.clone();

        let jws = helper.create_jws(&json!({"a": 1}), &signer).unwrap();

        assert!(!helper.verify_jws(&jws, &forged).unwrap());
    }

    #[test]
    fn jwk_set_parses_object_and_bare_array() {
        let object = json!({"keys": [{"kty": "RSA", "kid": "k1", "n": "AQ", "e": "AQAB"}]});
        let array = json!([{"kty": "RSA", "kid": "k1", "n": "AQ", "e": "AQAB"}]);

        assert_eq!(JwkSet::from_value(&object).unwrap().kids(), vec!["k1"]);
        assert_eq!(JwkSet::from_value(&array).unwrap().kids(), vec!["k1"]);
    }

    #[test]
    fn jwk_set_rejects_malformed_input() {
        assert!(matches!(
            JwkSet::from_value(&json!({"keys": "nope"})),
            Err(OidcFedError::Parse(_))
        ));
        assert!(matches!(
            JwkSet::from_json("not json"),
            Err(OidcFedError::Parse(_))
        ));
    }

    #[test]
    fn public_projection_strips_private_members() {
        let jwks = key_set();
        assert!(jwks.keys[0].is_private());

        let public = jwks.public_only();
        assert!(!public.keys[0].is_private());
        assert!(public.keys[0].p.is_none());
        assert!(public.keys[0].n.is_some());
        assert_eq!(public.keys[0].kid, jwks.keys[0].kid);
    }

    #[test]
    fn unknown_jwk_members_pass_through() {
        let value = json!({
            "kty": "RSA", "kid": "k1", "n": "AQ", "e": "AQAB",
            "x5t#S256": "thumb"
        });

        let jwk: Jwk = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(jwk.extra["x5t#S256"], "thumb");

        let round = serde_json::to_value(&jwk).unwrap();
        assert_eq!(round["x5t#S256"], "thumb");
    }

    #[test]
    fn ec_keys_are_rejected_for_signing() {
        let jwks = JwkSet::from_value(&json!([{
            "kty": "EC", "kid": "ec1", "crv": "P-256", "x": "AQ", "y": "AQ", "d": "AQ"
        }]))
        .unwrap();

        let result = helper().create_jws(&json!({"a": 1}), &jwks);
        assert!(matches!(result, Err(OidcFedError::UnsupportedKeyType(_))));
    }
}
