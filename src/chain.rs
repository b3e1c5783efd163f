// src/chain.rs

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::AllowedTrustMark;
use crate::entity::{EntityConfiguration, EntityStatementPayload};
use crate::error::{OidcFedError, Result};
use crate::fetch::EntityFetcher;
use crate::jose::JwtHelper;
use crate::model::{now_epoch, TrustChain, TrustChainStatus};
use crate::policy::apply_metadata_policy;

/// Builds a trust chain from a subject up to a trust anchor.
///
/// The walk starts from the subject's self-assertion and climbs the
/// authority hints, one verified statement per hop, until the anchor
/// vouches for the current entity. Single-superior failures are tolerated;
/// running out of candidates, exceeding the path bound or looping fails the
/// build.
pub struct TrustChainBuilder<'a> {
    subject: String,
    metadata_type: String,
    trust_anchor: EntityConfiguration,
    helper: &'a JwtHelper,
    fetcher: &'a EntityFetcher,
    max_path_len: usize,
    max_authority_hints: usize,
    allowed_trust_marks: &'a [AllowedTrustMark],
}

impl<'a> TrustChainBuilder<'a> {
    pub fn new(
        subject: &str,
        metadata_type: &str,
        trust_anchor: EntityConfiguration,
        helper: &'a JwtHelper,
        fetcher: &'a EntityFetcher,
    ) -> Self {
        Self {
            subject: subject.trim_end_matches('/').to_string(),
            metadata_type: metadata_type.to_string(),
            trust_anchor,
            helper,
            fetcher,
            max_path_len: 10,
            max_authority_hints: 10,
            allowed_trust_marks: &[],
        }
    }

    pub fn max_path_len(mut self, max: usize) -> Self {
        self.max_path_len = max;
        self
    }

    pub fn max_authority_hints(mut self, max: usize) -> Self {
        self.max_authority_hints = max;
        self
    }

    pub fn allowed_trust_marks(mut self, allowed: &'a [AllowedTrustMark]) -> Self {
        self.allowed_trust_marks = allowed;
        self
    }

    /// Runs the walk and assembles the resolved chain.
    #[instrument(skip(self), fields(subject = %self.subject, anchor = %self.trust_anchor.subject()))]
    pub async fn start(mut self) -> Result<TrustChain> {
        let helper = self.helper;
        let fetcher = self.fetcher;

        if !self.trust_anchor.is_valid() && !self.trust_anchor.validate_itself(helper) {
            return Err(OidcFedError::InvalidTrustChain(format!(
                "trust anchor {} self-assertion does not verify",
                self.trust_anchor.subject()
            )));
        }

        // The anchor may publish a tighter path bound than the local one.
        let mut max_path = self.max_path_len;
        if let Some(limit) = self.trust_anchor.constraint_u64("max_path_length") {
            max_path = max_path.min(limit as usize);
        }

        let jwt = self
            .fetcher
            .get_entity_configuration(&self.subject)
            .await
            .map_err(|e| {
                OidcFedError::InvalidTrustChain(format!(
                    "cannot fetch the configuration of {}: {e}",
                    self.subject
                ))
            })?;

        let mut subject_ec = EntityConfiguration::parse(&jwt)?;

        if !subject_ec.validate_itself(helper) {
            return Err(OidcFedError::InvalidTrustChain(format!(
                "self-assertion of {} does not verify",
                self.subject
            )));
        }

        if !subject_ec.validate_by_allowed_trust_marks(
            self.allowed_trust_marks,
            &self.trust_anchor,
            helper,
        ) {
            return Err(OidcFedError::InvalidTrustChain(format!(
                "{} carries no allowed trust mark",
                self.subject
            )));
        }

        let verified_trust_marks = subject_ec.verified_trust_marks().to_vec();
        let subject_metadata = subject_ec.payload().metadata.get(&self.metadata_type).cloned();

        let anchor_subject = self.trust_anchor.subject().trim_end_matches('/').to_string();

        let mut chain: Vec<String> = vec![subject_ec.jwt().to_string()];
        let mut parties: Vec<String> = vec![subject_ec.subject().to_string()];
        let mut exps: Vec<i64> = vec![subject_ec.exp()];
        // metadata_policy blocks in subject-to-anchor order.
        let mut policies: Vec<Option<Value>> = Vec::new();

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(self.subject.clone());

        let mut cur = subject_ec;
        let mut hops = 0;

        loop {
            hops += 1;
            if hops > max_path {
                return Err(OidcFedError::InvalidTrustChain(format!(
                    "path from {} exceeds the maximum length of {max_path}",
                    self.subject
                )));
            }

            let verified = cur
                .get_superiors(
                    self.max_authority_hints,
                    &[&self.trust_anchor],
                    fetcher,
                    helper,
                )
                .await;

            // The anchor vouching for the current entity terminates the walk.
            if let Some(anchor_key) = verified
                .iter()
                .find(|s| s.trim_end_matches('/') == anchor_subject)
                .cloned()
            {
                cur.validate_by_superiors(std::slice::from_ref(&anchor_key), fetcher, helper)
                    .await;

                if let Some(statement) = cur.statement_by_superior(&anchor_key) {
                    let statement = statement.to_string();
                    let payload = parse_statement(&statement)?;

                    exps.push(payload.exp);
                    policies.push(extract_policy(&payload, &self.metadata_type));
                    chain.push(statement);

                    chain.push(self.trust_anchor.jwt().to_string());
                    parties.push(self.trust_anchor.subject().to_string());
                    exps.push(self.trust_anchor.exp());

                    break;
                }

                warn!(
                    "the trust anchor did not vouch for {}; trying intermediates",
                    cur.subject()
                );
            }

            // Otherwise climb to the first verified superior that validates
            // the current entity and has not been walked yet.
            let mut advanced = false;

            for candidate in &verified {
                let normalized = candidate.trim_end_matches('/').to_string();
                if normalized == anchor_subject || visited.contains(&normalized) {
                    continue;
                }

                cur.validate_by_superiors(std::slice::from_ref(candidate), fetcher, helper)
                    .await;

                let Some(statement) = cur.statement_by_superior(candidate) else {
                    warn!("{candidate} did not vouch for {}", cur.subject());
                    continue;
                };

                let statement = statement.to_string();
                let payload = parse_statement(&statement)?;

                exps.push(payload.exp);
                policies.push(extract_policy(&payload, &self.metadata_type));
                chain.push(statement);

                let next = cur.take_superior(candidate).ok_or_else(|| {
                    OidcFedError::InvalidTrustChain(format!(
                        "superior {candidate} vanished during the walk"
                    ))
                })?;

                parties.push(next.subject().to_string());
                visited.insert(normalized);
                debug!("climbed from {} to {}", cur.subject(), next.subject());
                cur = next;
                advanced = true;
                break;
            }

            if !advanced {
                return Err(OidcFedError::InvalidTrustChain(format!(
                    "no verified path from {} to {anchor_subject}",
                    self.subject
                )));
            }
        }

        // Policies apply trust-anchor first, down to the subject.
        let mut final_metadata = subject_metadata.ok_or_else(|| {
            OidcFedError::MissingMetadata(format!(
                "{} publishes no metadata of type {}",
                self.subject, self.metadata_type
            ))
        })?;

        for policy in policies.iter().rev().flatten() {
            apply_metadata_policy(&mut final_metadata, policy)?;
        }

        if final_metadata.as_object().map_or(true, |m| m.is_empty()) {
            return Err(OidcFedError::MissingMetadata(format!(
                "merged metadata of type {} for {} is empty",
                self.metadata_type, self.subject
            )));
        }

        let exp = exps.iter().copied().min().unwrap_or(0);
        let now = now_epoch();

        info!(
            "trust chain for {} via {anchor_subject} resolved with {} parties",
            self.subject,
            parties.len()
        );

        Ok(TrustChain {
            subject: self.subject,
            trust_anchor: anchor_subject,
            metadata_type: self.metadata_type,
            chain,
            parties_involved: parties,
            final_metadata,
            exp,
            verified_trust_marks,
            status: TrustChainStatus::Valid,
            active: true,
            created_at: now,
            modified_at: now,
        })
    }
}

fn parse_statement(jwt: &str) -> Result<EntityStatementPayload> {
    let payload = JwtHelper::fast_parse_payload(jwt)?;

    let statement: EntityStatementPayload = serde_json::from_value(payload)
        .map_err(|e| OidcFedError::Parse(format!("invalid entity statement: {e}")))?;

    if statement.exp <= 0 {
        return Err(OidcFedError::InvalidTrustChain(format!(
            "statement issued by {} carries no expiry",
            statement.iss
        )));
    }

    Ok(statement)
}

fn extract_policy(statement: &EntityStatementPayload, metadata_type: &str) -> Option<Value> {
    statement
        .metadata_policy
        .as_ref()
        .and_then(|p| p.get(metadata_type))
        .cloned()
}
