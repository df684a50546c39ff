//! Room membership tracker.
//!
//! Thin front over a [`MembershipStore`] that owns the logging and metrics
//! for membership changes. Membership never depends on connectivity: a
//! disconnect leaves every membership in place.

use crate::errors::ChatError;
use crate::observability::metrics;
use crate::store::MembershipStore;
use common::types::{RoomId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Clone)]
pub struct RoomMembershipTracker {
    store: Arc<dyn MembershipStore>,
}

impl RoomMembershipTracker {
    #[must_use]
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self { store }
    }

    /// Add `user` to `room`. Joining twice is a no-op.
    #[instrument(skip_all, fields(room_id = %room, user_id = %user))]
    pub async fn join(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError> {
        let added = self.store.join(room, user).await?;
        if added {
            metrics::record_membership("join");
            debug!(target: "chat.rooms", "User joined room");
        }
        Ok(added)
    }

    /// Remove `user` from `room`. Leaving a room one is not in is a no-op.
    #[instrument(skip_all, fields(room_id = %room, user_id = %user))]
    pub async fn leave(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError> {
        let removed = self.store.leave(room, user).await?;
        if removed {
            metrics::record_membership("leave");
            debug!(target: "chat.rooms", "User left room");
        }
        Ok(removed)
    }

    pub async fn members(&self, room: &RoomId) -> Result<HashSet<UserId>, ChatError> {
        self.store.members(room).await
    }

    pub async fn member_count(&self, room: &RoomId) -> Result<usize, ChatError> {
        self.store.member_count(room).await
    }

    pub async fn rooms_of(&self, user: &UserId) -> Result<HashSet<RoomId>, ChatError> {
        self.store.rooms_of(user).await
    }

    /// Account deletion: leave every room. Returns the rooms left.
    #[instrument(skip_all, fields(user_id = %user))]
    pub async fn remove_user(&self, user: &UserId) -> Result<Vec<RoomId>, ChatError> {
        let rooms = self.store.remove_user(user).await?;
        info!(
            target: "chat.rooms",
            rooms = rooms.len(),
            "Removed user from all rooms"
        );
        Ok(rooms)
    }
}
