// src/lib.rs

//! OpenID Connect Federation Relying Party core for the Italian
//! public-identity ecosystem (SPID/CIE).
//!
//! The crate resolves trust chains from an OpenID Provider up to a
//! configured Trust Anchor, publishes the relying party's own federation
//! self-assertion (with progressive onboarding), and assembles signed
//! authorization requests. HTTP transport and persistence are injected
//! collaborators; see [`persistence::Persistence`].

pub mod chain;
pub mod config;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod jose;
pub mod model;
pub mod persistence;
pub mod pkce;
pub mod policy;
pub mod relying_party;

/// The public prelude for the `spid-oidc-rp` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::config::{
        AllowedTrustMark, OidcProfile, RelyingPartyConfig, RelyingPartyConfigBuilder,
    };
    pub use crate::error::OidcFedError;
    pub use crate::model::{OnboardingStep, TrustChain, WellKnownData};
    pub use crate::persistence::{InMemoryPersistence, Persistence};
    pub use crate::relying_party::RelyingParty;
    pub use jsonwebtoken::Algorithm;
}
