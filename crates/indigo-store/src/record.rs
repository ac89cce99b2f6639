//! Credential record model.
//!
//! A [`CredentialRecord`] is persisted as one JSON document per credential.
//! The columns the store filters on (`kind`, `state`, `rotate_at`,
//! `expires_at`, `version`) are mirrored next to the document so due scans
//! and compare-and-swap never parse JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use indigo_vault::{CredentialKind, Envelope, Scope};

use crate::error::StoreError;

/// Lifecycle state of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Pending,
    Active,
    Rotating,
    Expired,
    Revoked,
}

impl CredentialState {
    pub const ALL: [CredentialState; 5] = [
        Self::Pending,
        Self::Active,
        Self::Rotating,
        Self::Expired,
        Self::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    /// Expired and Revoked admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Revoked)
    }

    /// States in which the record holds material a reader may receive.
    /// Rotating still serves the pre-rotation material.
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Active | Self::Rotating)
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::InvalidArgument(format!("unknown credential state: {s}")))
    }
}

/// Why a credential reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Normal end of life: `expires_at` passed without a successful rotation.
    Expired,
    /// Regeneration failed more times than the retry budget allows.
    RetriesExhausted,
    /// The stored envelope failed authentication.
    TamperDetected,
    /// An operator asked for the credential to be revoked.
    RevokedByOperator,
    /// Issuance never completed and the placeholder was reclaimed.
    IssuanceAbandoned,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::RetriesExhausted => "retries_exhausted",
            Self::TamperDetected => "tamper_detected",
            Self::RevokedByOperator => "revoked_by_operator",
            Self::IssuanceAbandoned => "issuance_abandoned",
        }
    }

    /// Whether this code records a failure rather than a normal expiry.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Expired | Self::RevokedByOperator)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Unique identifier (UUID v7).
    pub id: String,
    pub kind: CredentialKind,
    pub scope: Scope,
    /// Sealed material.  `None` while Pending and once tombstoned.
    pub ciphertext: Option<Envelope>,
    pub state: CredentialState,
    pub issued_at: DateTime<Utc>,
    pub rotate_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Optimistic concurrency stamp.  Starts at 1, bumped by every
    /// successful compare-and-swap.
    pub version: u64,
    /// Regeneration attempts spent in the current rotation cycle.
    #[serde(default)]
    pub attempt: u32,
    /// Earliest time the next regeneration attempt may run.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<ReasonCode>,
    #[serde(default)]
    pub reason_detail: Option<String>,
    /// Expiry reported by the identity provider for delegated kinds.
    #[serde(default)]
    pub upstream_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// A fresh Pending placeholder with a new id.
    pub fn pending(
        kind: CredentialKind,
        scope: Scope,
        issued_at: DateTime<Utc>,
        rotate_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let issued_at = to_store_precision(issued_at);
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            scope,
            ciphertext: None,
            state: CredentialState::Pending,
            issued_at,
            rotate_at: to_store_precision(rotate_at),
            expires_at: to_store_precision(expires_at),
            version: 1,
            attempt: 0,
            next_attempt_at: None,
            reason: None,
            reason_detail: None,
            upstream_expires_at: None,
            updated_at: issued_at,
        }
    }

    /// Additional authenticated data every envelope of this credential is
    /// bound to.
    pub fn aad(&self) -> Vec<u8> {
        credential_aad(&self.id, self.kind)
    }

    /// Whether the record is due for a scheduled evaluation at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && (self.rotate_at <= now || self.expires_at <= now)
    }

    /// `issued_at < rotate_at <= expires_at`.
    pub fn timestamps_are_ordered(&self) -> bool {
        self.issued_at < self.rotate_at && self.rotate_at <= self.expires_at
    }
}

/// AAD for credential `id` of `kind`.
pub fn credential_aad(id: &str, kind: CredentialKind) -> Vec<u8> {
    format!("indigo:{id}:{kind}").into_bytes()
}

/// Truncate to whole seconds, the precision the store keeps.
pub fn to_store_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}
