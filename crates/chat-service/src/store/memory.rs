//! Process-local store for single-node mode and tests.
//!
//! Uses sharded `DashMap`s; a guard on one map is always dropped before
//! another map is touched.

use super::{Heartbeat, MailboxAppend, MailboxStore, MembershipStore, PresenceStore};
use crate::config::DEFAULT_PRESENCE_TTL_SECONDS;
use crate::errors::ChatError;
use crate::protocol::Envelope;
use async_trait::async_trait;
use common::types::{RoomId, UserId};
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct MailboxEntry {
    expires_at: Instant,
    envelope: Envelope,
}

/// In-memory implementation of every store trait.
#[derive(Debug)]
pub struct InMemoryStore {
    room_members: DashMap<RoomId, HashSet<UserId>>,
    user_rooms: DashMap<UserId, HashSet<RoomId>>,
    mailboxes: DashMap<UserId, VecDeque<MailboxEntry>>,
    presence: DashMap<UserId, HashSet<String>>,
    heartbeats: DashMap<String, Instant>,
    mailbox_capacity: usize,
    mailbox_retention: Duration,
    presence_ttl: Duration,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(mailbox_capacity: usize, mailbox_retention: Duration) -> Self {
        Self {
            room_members: DashMap::new(),
            user_rooms: DashMap::new(),
            mailboxes: DashMap::new(),
            presence: DashMap::new(),
            heartbeats: DashMap::new(),
            mailbox_capacity: mailbox_capacity.max(1),
            mailbox_retention,
            presence_ttl: Duration::from_secs(DEFAULT_PRESENCE_TTL_SECONDS),
        }
    }

    /// Override how long an instance stays live without a heartbeat.
    #[must_use]
    pub fn with_presence_ttl(mut self, presence_ttl: Duration) -> Self {
        self.presence_ttl = presence_ttl;
        self
    }

    fn live_instances(&self, now: Instant) -> HashSet<String> {
        self.heartbeats
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) <= self.presence_ttl)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn trim_to_capacity(&self, mailbox: &mut VecDeque<MailboxEntry>) -> usize {
        let mut dropped = 0;
        while mailbox.len() > self.mailbox_capacity {
            mailbox.pop_front();
            dropped += 1;
        }
        dropped
    }
}

#[async_trait]
impl MembershipStore for InMemoryStore {
    async fn join(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError> {
        let added = self
            .room_members
            .entry(room.clone())
            .or_default()
            .insert(user.clone());
        self.user_rooms
            .entry(user.clone())
            .or_default()
            .insert(room.clone());
        Ok(added)
    }

    async fn leave(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError> {
        let removed = self
            .room_members
            .get_mut(room)
            .is_some_and(|mut members| members.remove(user));
        self.room_members
            .remove_if(room, |_, members| members.is_empty());

        if let Some(mut rooms) = self.user_rooms.get_mut(user) {
            rooms.remove(room);
        }
        self.user_rooms.remove_if(user, |_, rooms| rooms.is_empty());

        Ok(removed)
    }

    async fn members(&self, room: &RoomId) -> Result<HashSet<UserId>, ChatError> {
        Ok(self
            .room_members
            .get(room)
            .map(|members| members.clone())
            .unwrap_or_default())
    }

    async fn member_count(&self, room: &RoomId) -> Result<usize, ChatError> {
        Ok(self.room_members.get(room).map_or(0, |members| members.len()))
    }

    async fn rooms_of(&self, user: &UserId) -> Result<HashSet<RoomId>, ChatError> {
        Ok(self
            .user_rooms
            .get(user)
            .map(|rooms| rooms.clone())
            .unwrap_or_default())
    }

    async fn remove_user(&self, user: &UserId) -> Result<Vec<RoomId>, ChatError> {
        let rooms: Vec<RoomId> = self
            .user_rooms
            .remove(user)
            .map(|(_, rooms)| rooms.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            if let Some(mut members) = self.room_members.get_mut(room) {
                members.remove(user);
            }
            self.room_members
                .remove_if(room, |_, members| members.is_empty());
        }
        Ok(rooms)
    }
}

#[async_trait]
impl MailboxStore for InMemoryStore {
    async fn append(&self, user: &UserId, envelope: &Envelope) -> Result<MailboxAppend, ChatError> {
        let now = Instant::now();
        let mut mailbox = self.mailboxes.entry(user.clone()).or_default();

        mailbox.retain(|entry| entry.expires_at > now);
        mailbox.push_back(MailboxEntry {
            expires_at: now + self.mailbox_retention,
            envelope: envelope.clone(),
        });

        let dropped = self.trim_to_capacity(&mut mailbox);

        Ok(MailboxAppend {
            pending: mailbox.len(),
            dropped,
        })
    }

    async fn requeue_front(
        &self,
        user: &UserId,
        envelopes: &[Envelope],
    ) -> Result<MailboxAppend, ChatError> {
        let now = Instant::now();
        let mut mailbox = self.mailboxes.entry(user.clone()).or_default();

        mailbox.retain(|entry| entry.expires_at > now);
        for envelope in envelopes.iter().rev() {
            mailbox.push_front(MailboxEntry {
                expires_at: now + self.mailbox_retention,
                envelope: envelope.clone(),
            });
        }
        let dropped = self.trim_to_capacity(&mut mailbox);

        Ok(MailboxAppend {
            pending: mailbox.len(),
            dropped,
        })
    }

    async fn drain(&self, user: &UserId) -> Result<Vec<Envelope>, ChatError> {
        let now = Instant::now();
        Ok(self
            .mailboxes
            .remove(user)
            .map(|(_, entries)| {
                entries
                    .into_iter()
                    .filter(|entry| entry.expires_at > now)
                    .map(|entry| entry.envelope)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pending(&self, user: &UserId) -> Result<usize, ChatError> {
        let now = Instant::now();
        Ok(self.mailboxes.get(user).map_or(0, |entries| {
            entries.iter().filter(|entry| entry.expires_at > now).count()
        }))
    }
}

#[async_trait]
impl PresenceStore for InMemoryStore {
    async fn mark_online(&self, user: &UserId, instance_id: &str) -> Result<(), ChatError> {
        self.heartbeats
            .insert(instance_id.to_string(), Instant::now());
        self.presence
            .entry(user.clone())
            .or_default()
            .insert(instance_id.to_string());
        Ok(())
    }

    async fn mark_offline(&self, user: &UserId, instance_id: &str) -> Result<bool, ChatError> {
        let live = self.live_instances(Instant::now());
        let Some(mut instances) = self.presence.get_mut(user) else {
            return Ok(false);
        };
        if !instances.remove(instance_id) {
            return Ok(false);
        }
        instances.retain(|instance| live.contains(instance));
        drop(instances);

        Ok(self
            .presence
            .remove_if(user, |_, instances| instances.is_empty())
            .is_some())
    }

    async fn is_online(&self, user: &UserId) -> Result<bool, ChatError> {
        let live = self.live_instances(Instant::now());
        Ok(self
            .presence
            .get(user)
            .is_some_and(|instances| instances.iter().any(|i| live.contains(i))))
    }

    async fn online_count(&self) -> Result<usize, ChatError> {
        let live = self.live_instances(Instant::now());
        Ok(self
            .presence
            .iter()
            .filter(|entry| entry.value().iter().any(|i| live.contains(i)))
            .count())
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<Heartbeat, ChatError> {
        let now = Instant::now();
        let known = self
            .heartbeats
            .insert(instance_id.to_string(), now)
            .is_some();

        let stale: HashSet<String> = self
            .heartbeats
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > self.presence_ttl)
            .map(|entry| entry.key().clone())
            .collect();
        for instance in &stale {
            self.heartbeats
                .remove_if(instance, |_, seen| now.duration_since(*seen) > self.presence_ttl);
        }
        if !stale.is_empty() {
            self.presence.retain(|_, instances| {
                instances.retain(|instance| !stale.contains(instance));
                !instances.is_empty()
            });
        }

        Ok(Heartbeat {
            known,
            reaped: stale.len(),
        })
    }
}
