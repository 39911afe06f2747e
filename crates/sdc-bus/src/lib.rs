//! ---
//! sdc_section: "04-messaging-fanout"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "Topic-addressed publish/subscribe fan-out."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
//! In-process message bus.
//!
//! Subscriptions are keyed by (owner, token, subject); a publish delivers an
//! own copy of the envelope to every channel registered for that exact
//! subject string, regardless of owner. Delivery is a non-blocking push into
//! the subscriber's unbounded channel: the publisher never waits on consumer
//! processing.

#![warn(missing_docs)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Message wrapper delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier for deduplication and tracing.
    pub id: Uuid,
    /// Subject the envelope was published under.
    pub subject: String,
    /// Timestamp when the envelope was published.
    pub timestamp: DateTime<Utc>,
    /// Actual payload.
    pub body: JsonValue,
}

impl Envelope {
    /// Construct a new envelope around the provided payload.
    pub fn new(subject: impl Into<String>, body: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            timestamp: Utc::now(),
            body,
        }
    }
}

/// One delivery: the subscription token and subject it matched, plus the
/// envelope copy.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    /// Token the subscription was registered under.
    pub token: String,
    /// Matched subject.
    pub subject: String,
    /// The delivered envelope.
    pub envelope: Envelope,
}

/// Receiving half handed to a subscriber.
pub type BusReceiver = mpsc::UnboundedReceiver<BusEvent>;
/// Sending half stored in the subscription table.
pub type BusSender = mpsc::UnboundedSender<BusEvent>;

/// Subscription bookkeeping failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BusError {
    /// Unsubscribe of a (owner, token, subject) triple that is not
    /// registered.
    #[error("no subscription for owner '{owner}', token '{token}', subject '{subject}'")]
    NotFound {
        /// Subscription owner.
        owner: String,
        /// Subscription token.
        token: String,
        /// Subscribed subject.
        subject: String,
    },
}

type SubjectMap = HashMap<String, BusSender>;
type TokenMap = HashMap<String, SubjectMap>;

/// The shared bus. Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug, Default)]
pub struct MessageBus {
    subscriptions: RwLock<HashMap<String, TokenMap>>,
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener channel. Re-subscribing the same
    /// (owner, token, subject) replaces the previous channel.
    pub fn subscribe(
        &self,
        token: impl Into<String>,
        subject: impl Into<String>,
        owner: impl Into<String>,
        sender: BusSender,
    ) {
        let (token, subject, owner) = (token.into(), subject.into(), owner.into());
        info!(%owner, %token, %subject, "subscribe");
        self.subscriptions
            .write()
            .entry(owner)
            .or_default()
            .entry(token)
            .or_default()
            .insert(subject, sender);
    }

    /// Convenience wrapper around [`MessageBus::subscribe`] that creates the
    /// channel pair and returns the receiving half.
    pub fn subscribe_channel(
        &self,
        token: impl Into<String>,
        subject: impl Into<String>,
        owner: impl Into<String>,
    ) -> BusReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribe(token, subject, owner, sender);
        receiver
    }

    /// Deliver `body` to every subscription of `subject`. Returns the number
    /// of listeners reached. Channels whose receiver is gone are pruned.
    pub fn publish(&self, subject: &str, body: JsonValue) -> usize {
        let envelope = Envelope::new(subject, body);
        debug!(%subject, envelope = %envelope.id, "publish");
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscriptions = self.subscriptions.read();
            for (owner, tokens) in subscriptions.iter() {
                for (token, subjects) in tokens.iter() {
                    if let Some(sender) = subjects.get(subject) {
                        let event = BusEvent {
                            token: token.clone(),
                            subject: subject.to_owned(),
                            envelope: envelope.clone(),
                        };
                        if sender.send(event).is_ok() {
                            delivered += 1;
                        } else {
                            dead.push((owner.clone(), token.clone(), subject.to_owned()));
                        }
                    }
                }
            }
        }
        for (owner, token, subject) in dead {
            debug!(%owner, %token, %subject, "pruning closed subscription");
            let _ = self.unsubscribe(&token, &subject, &owner);
        }
        delivered
    }

    /// Remove one subscription. All parameters must match the values used
    /// for subscribe.
    pub fn unsubscribe(&self, token: &str, subject: &str, owner: &str) -> Result<(), BusError> {
        let mut subscriptions = self.subscriptions.write();
        let not_found = || BusError::NotFound {
            owner: owner.to_owned(),
            token: token.to_owned(),
            subject: subject.to_owned(),
        };
        let tokens = subscriptions.get_mut(owner).ok_or_else(not_found)?;
        let subjects = tokens.get_mut(token).ok_or_else(not_found)?;
        subjects.remove(subject).ok_or_else(not_found)?;
        if subjects.is_empty() {
            tokens.remove(token);
        }
        if tokens.is_empty() {
            subscriptions.remove(owner);
        }
        info!(%owner, %token, %subject, "unsubscribe");
        Ok(())
    }

    /// Remove every subscription of one owner. A no-op for unknown owners.
    pub fn unsubscribe_all(&self, owner: &str) {
        if self.subscriptions.write().remove(owner).is_some() {
            info!(%owner, "unsubscribed all");
        }
    }

    /// Enumerate (token, subject) pairs registered by one owner.
    pub fn subscriptions_of(&self, owner: &str) -> Vec<(String, String)> {
        let subscriptions = self.subscriptions.read();
        let mut pairs = Vec::new();
        if let Some(tokens) = subscriptions.get(owner) {
            for (token, subjects) in tokens.iter() {
                for subject in subjects.keys() {
                    pairs.push((token.clone(), subject.clone()));
                }
            }
        }
        pairs.sort();
        pairs
    }
}
