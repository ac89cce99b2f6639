//! Lifecycle event bus.
//!
//! The engine publishes a [`LifecycleEvent`] for every committed transition
//! (and for rotations that were deferred or failed) on a
//! [`tokio::sync::broadcast`] channel.  Events are wrapped in [`Arc`] so
//! fan-out to several subscribers does not clone the payload.
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! dropped.
//!
//! ```rust,no_run
//! # use indigo_lifecycle::events::{EventBus, LifecycleEvent};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(LifecycleEvent::Expired {
//!     credential_id: "0190...".into(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use indigo_store::ReasonCode;
use indigo_vault::CredentialKind;

/// Something that happened to a credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Issued {
        credential_id: String,
        kind: CredentialKind,
    },
    RotationStarted {
        credential_id: String,
        version: u64,
    },
    Rotated {
        credential_id: String,
        version: u64,
    },
    /// A rotation attempt failed and was charged to the retry budget.
    RotationFailed {
        credential_id: String,
        attempt: u32,
        error: String,
    },
    /// A rotation could not start or finish for reasons outside the
    /// credential (key outage) and will be retried without penalty.
    RotationDeferred {
        credential_id: String,
        reason: String,
    },
    Expired {
        credential_id: String,
    },
    Revoked {
        credential_id: String,
        reason: ReasonCode,
    },
}

impl LifecycleEvent {
    pub fn credential_id(&self) -> &str {
        match self {
            Self::Issued { credential_id, .. }
            | Self::RotationStarted { credential_id, .. }
            | Self::Rotated { credential_id, .. }
            | Self::RotationFailed { credential_id, .. }
            | Self::RotationDeferred { credential_id, .. }
            | Self::Expired { credential_id }
            | Self::Revoked { credential_id, .. } => credential_id,
        }
    }
}

/// Publish/subscribe bus for [`LifecycleEvent`]s.  Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<LifecycleEvent>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers; returns how many will see it.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "lifecycle event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Receive every event published from now on.  Nothing is replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LifecycleEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
