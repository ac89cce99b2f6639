//! The credential state machine.
//!
//! [`apply`] is pure: it validates one [`Transition`] against the current
//! record and returns the record that should replace it.  Persisting the
//! result through compare-and-swap is the engine's job.
//!
//! ```text
//!             Activate              BeginRotation
//!   Pending ───────────▶ Active ◀──────────────▶ Rotating ──┐ RecordFailure
//!      │                   │     CompleteRotation    │ ▲     │
//!      │ AbandonIssuance   │ Expire / Revoke         │ └─────┘
//!      ▼                   ▼                         ▼
//!   Revoked             Expired / Revoked     Expired / Revoked
//! ```
//!
//! Every move into a terminal state wipes the ciphertext, leaving a
//! tombstone with no recoverable payload.

use chrono::{DateTime, Utc};

use indigo_store::{CredentialRecord, CredentialState, ReasonCode, to_store_precision};
use indigo_vault::Envelope;

use crate::error::{LifecycleError, Result};
use crate::policy::Schedule;

/// A requested state change.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Pending → Active with the first sealed material.
    Activate {
        envelope: Envelope,
        schedule: Schedule,
        upstream_expires_at: Option<DateTime<Utc>>,
    },
    /// Active → Rotating.  Unless `forced`, only once `rotate_at` has passed.
    BeginRotation { forced: bool },
    /// Rotating → Active, replacing the material in the same write.
    CompleteRotation {
        envelope: Envelope,
        schedule: Schedule,
        upstream_expires_at: Option<DateTime<Utc>>,
    },
    /// Rotating → Rotating with one more attempt spent.
    RecordFailure {
        next_attempt_at: DateTime<Utc>,
        detail: String,
    },
    /// Rotating → Revoked once the retry budget is gone.
    RetriesExhausted { detail: String },
    /// Active/Rotating → Expired once `expires_at` has passed.
    Expire,
    /// Any non-terminal state → Revoked.
    Revoke {
        reason: ReasonCode,
        detail: Option<String>,
    },
    /// Pending → Revoked for a placeholder whose issuance never finished.
    AbandonIssuance,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::BeginRotation { .. } => "begin_rotation",
            Self::CompleteRotation { .. } => "complete_rotation",
            Self::RecordFailure { .. } => "record_failure",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Expire => "expire",
            Self::Revoke { .. } => "revoke",
            Self::AbandonIssuance => "abandon_issuance",
        }
    }
}

/// Compute the record that results from applying `transition` at `now`.
///
/// The returned record keeps the current `version`; the store assigns the
/// next one when the write commits.
pub fn apply(
    current: &CredentialRecord,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<CredentialRecord> {
    use CredentialState::*;

    let invalid = |t: &Transition| LifecycleError::InvalidTransition {
        id: current.id.clone(),
        from: current.state,
        transition: t.name(),
    };

    let mut next = current.clone();
    next.updated_at = to_store_precision(now);

    match (current.state, transition) {
        (
            Pending,
            Transition::Activate {
                envelope,
                schedule,
                upstream_expires_at,
            },
        ) => {
            next.state = Active;
            install(&mut next, envelope, schedule, upstream_expires_at);
        }

        (Active, t @ Transition::BeginRotation { forced }) => {
            let due = forced || now >= current.rotate_at;
            if !due || now >= current.expires_at {
                return Err(invalid(&t));
            }
            next.state = Rotating;
            next.attempt = 0;
            next.next_attempt_at = None;
        }

        (
            Rotating,
            Transition::CompleteRotation {
                envelope,
                schedule,
                upstream_expires_at,
            },
        ) => {
            next.state = Active;
            install(&mut next, envelope, schedule, upstream_expires_at);
        }

        (
            Rotating,
            Transition::RecordFailure {
                next_attempt_at,
                detail,
            },
        ) => {
            next.attempt = current.attempt.saturating_add(1);
            next.next_attempt_at = Some(to_store_precision(next_attempt_at));
            next.reason_detail = Some(detail);
        }

        (Rotating, Transition::RetriesExhausted { detail }) => {
            next.attempt = current.attempt.saturating_add(1);
            tombstone(&mut next, Revoked, ReasonCode::RetriesExhausted, Some(detail));
        }

        (Active | Rotating, t @ Transition::Expire) => {
            if now < current.expires_at {
                return Err(invalid(&t));
            }
            tombstone(&mut next, Expired, ReasonCode::Expired, None);
        }

        (Pending | Active | Rotating, Transition::Revoke { reason, detail }) => {
            tombstone(&mut next, Revoked, reason, detail);
        }

        (Pending, Transition::AbandonIssuance) => {
            tombstone(
                &mut next,
                Revoked,
                ReasonCode::IssuanceAbandoned,
                Some("issuance did not complete".into()),
            );
        }

        (_, t) => return Err(invalid(&t)),
    }

    Ok(next)
}

fn install(
    record: &mut CredentialRecord,
    envelope: Envelope,
    schedule: Schedule,
    upstream_expires_at: Option<DateTime<Utc>>,
) {
    record.ciphertext = Some(envelope);
    record.issued_at = schedule.issued_at;
    record.rotate_at = schedule.rotate_at;
    record.expires_at = schedule.expires_at;
    record.upstream_expires_at = upstream_expires_at.map(to_store_precision);
    record.attempt = 0;
    record.next_attempt_at = None;
    record.reason = None;
    record.reason_detail = None;
}

fn tombstone(
    record: &mut CredentialRecord,
    state: CredentialState,
    reason: ReasonCode,
    detail: Option<String>,
) {
    record.state = state;
    record.ciphertext = None;
    record.next_attempt_at = None;
    record.reason = Some(reason);
    record.reason_detail = detail;
}
