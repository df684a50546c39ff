//! Lua scripts for multi-step Redis operations that must not interleave.
//!
//! - Mailbox append and requeue: push, trim to capacity and refresh
//!   retention together so concurrent writers never leave a mailbox over
//!   capacity.
//! - Mailbox drain: read and delete together so an entry is consumed once.
//! - Presence release, check and heartbeat: read instance liveness and the
//!   user's instance set in one step.
//!
//! The presence scripts build per-instance and per-user keys from ARGV
//! prefixes, so they assume a single Redis node rather than a cluster.

/// Append to a bounded mailbox list.
///
/// Arguments:
/// - KEYS[1]: Mailbox list key (e.g., `chat:mailbox:{user}`)
/// - ARGV[1]: Envelope JSON
/// - ARGV[2]: Capacity (max entries kept)
/// - ARGV[3]: Retention in seconds
///
/// Returns: `{pending, dropped}`, or `{-1, 0}` on invalid arguments.
pub const MAILBOX_APPEND: &str = r#"
local capacity = tonumber(ARGV[2])
local retention = tonumber(ARGV[3])
if capacity == nil or capacity < 1 or retention == nil or retention < 1 then
    return {-1, 0}
end

local len = redis.call('RPUSH', KEYS[1], ARGV[1])
local dropped = 0
if len > capacity then
    dropped = len - capacity
    redis.call('LTRIM', KEYS[1], dropped, -1)
    len = capacity
end
redis.call('EXPIRE', KEYS[1], retention)
return {len, dropped}
"#;

/// Read and delete a mailbox in one step.
///
/// Arguments:
/// - KEYS[1]: Mailbox list key
///
/// Returns: every entry, oldest first (empty if none).
pub const MAILBOX_DRAIN: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1])
return entries
"#;

/// Push entries back onto the head of a mailbox, keeping their order.
///
/// Arguments:
/// - KEYS[1]: Mailbox list key
/// - ARGV[1]: Capacity
/// - ARGV[2]: Retention in seconds
/// - ARGV[3..]: Envelope JSON, oldest first
///
/// Returns: `{pending, dropped}`, or `{-1, 0}` on invalid arguments.
pub const MAILBOX_REQUEUE: &str = r#"
local capacity = tonumber(ARGV[1])
local retention = tonumber(ARGV[2])
if capacity == nil or capacity < 1 or retention == nil or retention < 1 then
    return {-1, 0}
end

for i = #ARGV, 3, -1 do
    redis.call('LPUSH', KEYS[1], ARGV[i])
end
local len = redis.call('LLEN', KEYS[1])
local dropped = 0
if len > capacity then
    dropped = len - capacity
    redis.call('LTRIM', KEYS[1], dropped, -1)
    len = capacity
end
redis.call('EXPIRE', KEYS[1], retention)
return {len, dropped}
"#;

/// Remove one instance from a user's presence set.
///
/// Instances in the set whose heartbeat is older than the cutoff are pruned
/// on the way.
///
/// Arguments:
/// - KEYS[1]: User presence set (e.g., `chat:presence:{user}`)
/// - KEYS[2]: Instance user set (e.g., `chat:instance:{id}:users`)
/// - KEYS[3]: Instance heartbeat sorted set (`chat:instances`)
/// - ARGV[1]: User identity
/// - ARGV[2]: Instance ID releasing the user
/// - ARGV[3]: Liveness cutoff, unix millis
///
/// Returns:
/// - 1: The instance held the user and no live instance holds them now
/// - 0: The instance did not hold the user, or another live one still does
pub const PRESENCE_RELEASE: &str = r#"
local removed = redis.call('SREM', KEYS[1], ARGV[2])
redis.call('SREM', KEYS[2], ARGV[1])
if removed == 0 then
    return 0
end

local live = 0
for _, instance in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local seen = redis.call('ZSCORE', KEYS[3], instance)
    if seen and tonumber(seen) >= tonumber(ARGV[3]) then
        live = live + 1
    else
        redis.call('SREM', KEYS[1], instance)
    end
end
if live == 0 then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// Whether any live instance holds a user.
///
/// Arguments:
/// - KEYS[1]: User presence set
/// - KEYS[2]: Instance heartbeat sorted set
/// - ARGV[1]: Liveness cutoff, unix millis
///
/// Returns: 1 if online, 0 otherwise.
pub const PRESENCE_CHECK: &str = r#"
for _, instance in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    local seen = redis.call('ZSCORE', KEYS[2], instance)
    if seen and tonumber(seen) >= tonumber(ARGV[1]) then
        return 1
    end
end
return 0
"#;

/// Count users held by live instances.
///
/// Arguments:
/// - KEYS[1]: Instance heartbeat sorted set
/// - ARGV[1]: Liveness cutoff, unix millis
/// - ARGV[2], ARGV[3]: Prefix and suffix of an instance user set key
///
/// Returns: distinct online users.
pub const PRESENCE_COUNT: &str = r#"
local live = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], '+inf')
if #live == 0 then
    return 0
end
local keys = {}
for i, instance in ipairs(live) do
    keys[i] = ARGV[2] .. instance .. ARGV[3]
end
return #redis.call('SUNION', unpack(keys))
"#;

/// Refresh an instance heartbeat and reap stale instances.
///
/// A reaped instance is removed from the presence set of every user it held.
///
/// Arguments:
/// - KEYS[1]: Instance heartbeat sorted set
/// - ARGV[1]: Now, unix millis
/// - ARGV[2]: Instance ID
/// - ARGV[3]: Liveness cutoff, unix millis
/// - ARGV[4], ARGV[5]: Prefix and suffix of an instance user set key
/// - ARGV[6]: Prefix of a user presence set key
///
/// Returns: `{known, reaped}` where `known` is 1 if the instance was
/// registered before this beat.
pub const PRESENCE_HEARTBEAT: &str = r#"
local known = 0
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    known = 1
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])

local stale = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[3])
for _, instance in ipairs(stale) do
    local users_key = ARGV[4] .. instance .. ARGV[5]
    for _, user in ipairs(redis.call('SMEMBERS', users_key)) do
        redis.call('SREM', ARGV[6] .. user, instance)
    end
    redis.call('DEL', users_key)
    redis.call('ZREM', KEYS[1], instance)
end
return {known, #stale}
"#;
