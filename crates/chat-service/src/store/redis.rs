//! Redis-backed store shared by every instance.
//!
//! # Key Patterns
//!
//! - `chat:room:{room}:members` - SET of member user ids
//! - `chat:user:{user}:rooms` - SET of room ids (reverse index)
//! - `chat:mailbox:{user}` - LIST of envelope JSON, oldest first, with TTL
//! - `chat:presence:{user}` - SET of instance ids holding the user
//! - `chat:instance:{instance}:users` - SET of user ids (reverse index)
//! - `chat:instances` - ZSET instance id -> last heartbeat, unix millis
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of locking.

use super::lua_scripts;
use super::{Heartbeat, MailboxAppend, MailboxStore, MembershipStore, PresenceStore};
use crate::errors::ChatError;
use crate::observability::metrics;
use crate::protocol::Envelope;
use async_trait::async_trait;
use common::types::{RoomId, UserId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

const INSTANCES_KEY: &str = "chat:instances";
const PRESENCE_PREFIX: &str = "chat:presence:";
const INSTANCE_USERS_PREFIX: &str = "chat:instance:";
const INSTANCE_USERS_SUFFIX: &str = ":users";

fn room_members_key(room: &RoomId) -> String {
    format!("chat:room:{room}:members")
}

fn user_rooms_key(user: &UserId) -> String {
    format!("chat:user:{user}:rooms")
}

fn mailbox_key(user: &UserId) -> String {
    format!("chat:mailbox:{user}")
}

fn presence_key(user: &UserId) -> String {
    format!("{PRESENCE_PREFIX}{user}")
}

fn instance_users_key(instance_id: &str) -> String {
    format!("{INSTANCE_USERS_PREFIX}{instance_id}{INSTANCE_USERS_SUFFIX}")
}

fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run `fut`, record its latency and map a Redis error.
async fn timed<T, F>(operation: &'static str, fut: F) -> Result<T, ChatError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    metrics::record_redis_latency(operation, start.elapsed());
    result.map_err(|e| {
        warn!(
            target: "chat.store.redis",
            error = %e,
            operation = operation,
            "Redis operation failed"
        );
        ChatError::Redis(format!("{operation} failed: {e}"))
    })
}

fn parse_ids<T, E: std::fmt::Display>(
    raw: Vec<String>,
    parse: impl Fn(String) -> Result<T, E>,
) -> impl Iterator<Item = T> {
    raw.into_iter().filter_map(move |value| match parse(value) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(target: "chat.store.redis", error = %e, "Skipping invalid id in Redis");
            None
        }
    })
}

/// Redis implementation of every store trait.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    mailbox_append_script: Script,
    mailbox_drain_script: Script,
    mailbox_requeue_script: Script,
    presence_release_script: Script,
    presence_check_script: Script,
    presence_count_script: Script,
    presence_heartbeat_script: Script,
    mailbox_capacity: usize,
    mailbox_retention: Duration,
    presence_ttl: Duration,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Redis` if the URL is invalid or the connection
    /// fails.
    pub async fn connect(
        redis_url: &str,
        mailbox_capacity: usize,
        mailbox_retention: Duration,
        presence_ttl: Duration,
    ) -> Result<Self, ChatError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may contain credentials
            error!(target: "chat.store.redis", error = %e, "Failed to open Redis client");
            ChatError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "chat.store.redis", error = %e, "Failed to connect to Redis");
                ChatError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self::from_connection(
            connection,
            mailbox_capacity,
            mailbox_retention,
            presence_ttl,
        ))
    }

    /// Wrap an existing connection.
    #[must_use]
    pub fn from_connection(
        connection: MultiplexedConnection,
        mailbox_capacity: usize,
        mailbox_retention: Duration,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            connection,
            mailbox_append_script: Script::new(lua_scripts::MAILBOX_APPEND),
            mailbox_drain_script: Script::new(lua_scripts::MAILBOX_DRAIN),
            mailbox_requeue_script: Script::new(lua_scripts::MAILBOX_REQUEUE),
            presence_release_script: Script::new(lua_scripts::PRESENCE_RELEASE),
            presence_check_script: Script::new(lua_scripts::PRESENCE_CHECK),
            presence_count_script: Script::new(lua_scripts::PRESENCE_COUNT),
            presence_heartbeat_script: Script::new(lua_scripts::PRESENCE_HEARTBEAT),
            mailbox_capacity: mailbox_capacity.max(1),
            mailbox_retention,
            presence_ttl,
        }
    }

    /// Heartbeats older than this mark an instance as gone.
    fn liveness_cutoff(&self, now_millis: i64) -> i64 {
        let ttl = i64::try_from(self.presence_ttl.as_millis()).unwrap_or(i64::MAX);
        now_millis.saturating_sub(ttl)
    }
}

#[async_trait]
impl MembershipStore for RedisStore {
    #[instrument(skip_all, fields(room_id = %room))]
    async fn join(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError> {
        let mut conn = self.connection.clone();
        let (added, _): (i64, i64) = timed(
            "join",
            redis::pipe()
                .atomic()
                .sadd(room_members_key(room), user.as_str())
                .sadd(user_rooms_key(user), room.as_str())
                .query_async(&mut conn),
        )
        .await?;
        Ok(added > 0)
    }

    #[instrument(skip_all, fields(room_id = %room))]
    async fn leave(&self, room: &RoomId, user: &UserId) -> Result<bool, ChatError> {
        let mut conn = self.connection.clone();
        let (removed, _): (i64, i64) = timed(
            "leave",
            redis::pipe()
                .atomic()
                .srem(room_members_key(room), user.as_str())
                .srem(user_rooms_key(user), room.as_str())
                .query_async(&mut conn),
        )
        .await?;
        Ok(removed > 0)
    }

    async fn members(&self, room: &RoomId) -> Result<HashSet<UserId>, ChatError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = timed("smembers", conn.smembers(room_members_key(room))).await?;
        Ok(parse_ids(raw, |s| UserId::parse(s)).collect())
    }

    async fn member_count(&self, room: &RoomId) -> Result<usize, ChatError> {
        let mut conn = self.connection.clone();
        timed("scard", conn.scard(room_members_key(room))).await
    }

    async fn rooms_of(&self, user: &UserId) -> Result<HashSet<RoomId>, ChatError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = timed("smembers", conn.smembers(user_rooms_key(user))).await?;
        Ok(parse_ids(raw, |s| RoomId::parse(s)).collect())
    }

    #[instrument(skip_all)]
    async fn remove_user(&self, user: &UserId) -> Result<Vec<RoomId>, ChatError> {
        let rooms: Vec<RoomId> = self.rooms_of(user).await?.into_iter().collect();
        if rooms.is_empty() {
            return Ok(rooms);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for room in &rooms {
            pipe.srem(room_members_key(room), user.as_str()).ignore();
        }
        pipe.del(user_rooms_key(user)).ignore();

        let mut conn = self.connection.clone();
        timed::<(), _>("remove_user", pipe.query_async(&mut conn)).await?;

        debug!(
            target: "chat.store.redis",
            rooms = rooms.len(),
            "Removed user from all rooms"
        );
        Ok(rooms)
    }
}

#[async_trait]
impl MailboxStore for RedisStore {
    #[instrument(skip_all, fields(message_id = %envelope.message_id))]
    async fn append(&self, user: &UserId, envelope: &Envelope) -> Result<MailboxAppend, ChatError> {
        let json = envelope.to_json().map_err(|e| {
            error!(target: "chat.store.redis", error = %e, "Failed to encode mailbox entry");
            ChatError::Internal
        })?;

        let mut conn = self.connection.clone();
        let (pending, dropped): (i64, i64) = timed(
            "mailbox_append",
            self.mailbox_append_script
                .key(mailbox_key(user))
                .arg(json)
                .arg(self.mailbox_capacity)
                .arg(self.mailbox_retention.as_secs().max(1))
                .invoke_async(&mut conn),
        )
        .await?;

        if pending < 0 {
            return Err(ChatError::Redis(
                "mailbox append rejected its arguments".to_string(),
            ));
        }

        Ok(MailboxAppend {
            pending: usize::try_from(pending).unwrap_or(0),
            dropped: usize::try_from(dropped).unwrap_or(0),
        })
    }

    #[instrument(skip_all)]
    async fn drain(&self, user: &UserId) -> Result<Vec<Envelope>, ChatError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = timed(
            "mailbox_drain",
            self.mailbox_drain_script
                .key(mailbox_key(user))
                .invoke_async(&mut conn),
        )
        .await?;

        Ok(raw
            .iter()
            .filter_map(|json| match Envelope::from_json(json) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    metrics::record_decode_error("mailbox");
                    warn!(target: "chat.store.redis", error = %e, "Dropping undecodable mailbox entry");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip_all, fields(entries = envelopes.len()))]
    async fn requeue_front(
        &self,
        user: &UserId,
        envelopes: &[Envelope],
    ) -> Result<MailboxAppend, ChatError> {
        if envelopes.is_empty() {
            return Ok(MailboxAppend {
                pending: self.pending(user).await?,
                dropped: 0,
            });
        }

        let mut invocation = self.mailbox_requeue_script.key(mailbox_key(user));
        invocation
            .arg(self.mailbox_capacity)
            .arg(self.mailbox_retention.as_secs().max(1));
        for envelope in envelopes {
            let json = envelope.to_json().map_err(|e| {
                error!(target: "chat.store.redis", error = %e, "Failed to encode mailbox entry");
                ChatError::Internal
            })?;
            invocation.arg(json);
        }

        let mut conn = self.connection.clone();
        let (pending, dropped): (i64, i64) =
            timed("mailbox_requeue", invocation.invoke_async(&mut conn)).await?;

        if pending < 0 {
            return Err(ChatError::Redis(
                "mailbox requeue rejected its arguments".to_string(),
            ));
        }

        Ok(MailboxAppend {
            pending: usize::try_from(pending).unwrap_or(0),
            dropped: usize::try_from(dropped).unwrap_or(0),
        })
    }

    async fn pending(&self, user: &UserId) -> Result<usize, ChatError> {
        let mut conn = self.connection.clone();
        timed("llen", conn.llen(mailbox_key(user))).await
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn mark_online(&self, user: &UserId, instance_id: &str) -> Result<(), ChatError> {
        let mut conn = self.connection.clone();
        timed::<(), _>(
            "presence_acquire",
            redis::pipe()
                .atomic()
                .sadd(presence_key(user), instance_id)
                .ignore()
                .sadd(instance_users_key(instance_id), user.as_str())
                .ignore()
                .zadd(INSTANCES_KEY, instance_id, unix_millis())
                .ignore()
                .query_async(&mut conn),
        )
        .await
    }

    async fn mark_offline(&self, user: &UserId, instance_id: &str) -> Result<bool, ChatError> {
        let mut conn = self.connection.clone();
        let gone: i64 = timed(
            "presence_release",
            self.presence_release_script
                .key(presence_key(user))
                .key(instance_users_key(instance_id))
                .key(INSTANCES_KEY)
                .arg(user.as_str())
                .arg(instance_id)
                .arg(self.liveness_cutoff(unix_millis()))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(gone == 1)
    }

    async fn is_online(&self, user: &UserId) -> Result<bool, ChatError> {
        let mut conn = self.connection.clone();
        let online: i64 = timed(
            "presence_check",
            self.presence_check_script
                .key(presence_key(user))
                .key(INSTANCES_KEY)
                .arg(self.liveness_cutoff(unix_millis()))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(online == 1)
    }

    async fn online_count(&self) -> Result<usize, ChatError> {
        let mut conn = self.connection.clone();
        timed(
            "presence_count",
            self.presence_count_script
                .key(INSTANCES_KEY)
                .arg(self.liveness_cutoff(unix_millis()))
                .arg(INSTANCE_USERS_PREFIX)
                .arg(INSTANCE_USERS_SUFFIX)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<Heartbeat, ChatError> {
        let now = unix_millis();
        let mut conn = self.connection.clone();
        let (known, reaped): (i64, i64) = timed(
            "presence_heartbeat",
            self.presence_heartbeat_script
                .key(INSTANCES_KEY)
                .arg(now)
                .arg(instance_id)
                .arg(self.liveness_cutoff(now))
                .arg(INSTANCE_USERS_PREFIX)
                .arg(INSTANCE_USERS_SUFFIX)
                .arg(PRESENCE_PREFIX)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(Heartbeat {
            known: known == 1,
            reaped: usize::try_from(reaped).unwrap_or(0),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let room = RoomId::parse("group_42").unwrap();
        let user = UserId::parse("alice").unwrap();
        assert_eq!(room_members_key(&room), "chat:room:group_42:members");
        assert_eq!(user_rooms_key(&user), "chat:user:alice:rooms");
        assert_eq!(mailbox_key(&user), "chat:mailbox:alice");
        assert_eq!(presence_key(&user), "chat:presence:alice");
        assert_eq!(instance_users_key("chat-1"), "chat:instance:chat-1:users");
    }

    #[test]
    fn test_parse_ids_skips_invalid_entries() {
        let raw = vec!["alice".to_string(), "not valid".to_string(), "bob".to_string()];
        let mut ids: Vec<UserId> = parse_ids(raw, |s| UserId::parse(s)).collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![UserId::parse("alice").unwrap(), UserId::parse("bob").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStore::connect(
            "not-a-redis-url",
            10,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(ChatError::Redis(_))));
    }
}
