//! Cluster-shared state: room membership, offline mailboxes and presence.
//!
//! Each concern is a trait so the service can run against Redis (multi
//! instance) or process-local maps (single node, tests):
//!
//! - [`RedisStore`] - shared Redis, see [`redis`] for the key layout
//! - [`InMemoryStore`] - `DashMap`-backed
//!
//! None of these operations are atomic across keys or across traits.

pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

use crate::errors::ChatError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use common::types::{RoomId, UserId};
use std::collections::HashSet;
use std::sync::Arc;

/// The three store seams, as injected into the delivery service.
#[derive(Clone)]
pub struct Stores {
    pub membership: Arc<dyn MembershipStore>,
    pub mailbox: Arc<dyn MailboxStore>,
    pub presence: Arc<dyn PresenceStore>,
}

impl Stores {
    /// Use one backend for every concern.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: MembershipStore + MailboxStore + PresenceStore + 'static,
    {
        Self {
            membership: store.clone(),
            mailbox: store.clone(),
            presence: store,
        }
    }
}

/// Room identity -> member identities.
///
/// Membership is independent of connectivity: a disconnected user stays a
/// member until they leave or [`remove_user`](Self::remove_user) is called.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Add `user` to `room`. Returns `true` if the user was not already a
    /// member.
    async fn join(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError>;

    /// Remove `user` from `room`. Returns `true` if the user was a member.
    async fn leave(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError>;

    /// Snapshot of the members of `room`.
    async fn members(&self, room: &RoomId) -> Result<HashSet<UserId>, ChatError>;

    async fn member_count(&self, room: &RoomId) -> Result<usize, ChatError>;

    /// Rooms `user` belongs to.
    async fn rooms_of(&self, user: &UserId) -> Result<HashSet<RoomId>, ChatError>;

    /// Remove `user` from every room. Returns the rooms they left.
    async fn remove_user(&self, user: &UserId) -> Result<Vec<RoomId>, ChatError>;
}

/// Result of appending to a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxAppend {
    /// Entries queued after the append.
    pub pending: usize,
    /// Oldest entries dropped to stay within capacity.
    pub dropped: usize,
}

/// Per-user FIFO of envelopes awaiting a connection.
///
/// Bounded by a capacity (oldest dropped) and a retention window.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn append(&self, user: &UserId, envelope: &Envelope) -> Result<MailboxAppend, ChatError>;

    /// Remove and return every pending entry, oldest first.
    async fn drain(&self, user: &UserId) -> Result<Vec<Envelope>, ChatError>;

    /// Put drained but undelivered `envelopes` back at the head of the
    /// mailbox, ahead of anything queued since, keeping their order.
    async fn requeue_front(
        &self,
        user: &UserId,
        envelopes: &[Envelope],
    ) -> Result<MailboxAppend, ChatError>;

    async fn pending(&self, user: &UserId) -> Result<usize, ChatError>;
}

/// Result of one presence heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The instance was registered before this beat. `false` on the first
    /// beat, or after other instances reaped it as stale.
    pub known: bool,
    /// Stale instances removed by this beat.
    pub reaped: usize,
}

/// Cluster-wide user -> instances map.
///
/// A user may hold a connection on several instances at once and is online
/// while any live instance holds them. An instance is live while its last
/// heartbeat is within the presence TTL, so users of a crashed instance go
/// offline once its heartbeat lapses.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record that `user` is connected to `instance_id`. Counts as a
    /// heartbeat for the instance.
    async fn mark_online(&self, user: &UserId, instance_id: &str) -> Result<(), ChatError>;

    /// Remove `instance_id` from `user`'s instances. Returns `true` if the
    /// instance held the user and no live instance holds them now.
    async fn mark_offline(&self, user: &UserId, instance_id: &str) -> Result<bool, ChatError>;

    async fn is_online(&self, user: &UserId) -> Result<bool, ChatError>;

    /// Users held by at least one live instance.
    async fn online_count(&self) -> Result<usize, ChatError>;

    /// Mark `instance_id` alive and reap instances whose heartbeat lapsed.
    async fn heartbeat(&self, instance_id: &str) -> Result<Heartbeat, ChatError>;
}
