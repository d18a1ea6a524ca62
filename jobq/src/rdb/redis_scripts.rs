//! Redis Lua 脚本模块
//!
//! 与 hibiken/asynq Go 版本兼容的 Redis Lua 脚本，保证状态迁移的原子性
//! Redis Lua scripts compatible with hibiken/asynq, keeping state transitions atomic

use redis::Script;
use std::sync::LazyLock;

/// 入队任务脚本 - Go: enqueueCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:t:<task_id>
/// `KEYS[2]` -> asynq:{`<qname>`}:pending
/// `ARGV[1]` -> task message data
/// `ARGV[2]` -> task ID
/// `ARGV[3]` -> current unix time in nsec
/// Returns 1 if successfully enqueued, 0 if task ID already exists
pub(crate) static ENQUEUE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("EXISTS", KEYS[1]) == 1 then
            return 0
        end
        redis.call("HSET", KEYS[1],
                   "msg", ARGV[1],
                   "state", "pending",
                   "pending_since", ARGV[3])
        redis.call("LPUSH", KEYS[2], ARGV[2])
        return 1
    "#,
  )
});

/// 出队脚本 - Go: dequeueCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:pending
/// `KEYS[2]` -> asynq:{`<qname>`}:paused
/// `KEYS[3]` -> asynq:{`<qname>`}:active
/// `KEYS[4]` -> asynq:{`<qname>`}:lease
/// `ARGV[1]` -> lease expiration unix time
/// `ARGV[2]` -> task key prefix
pub(crate) static DEQUEUE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("EXISTS", KEYS[2]) == 0 then
            local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[3])
            if id then
                local key = ARGV[2] .. id
                redis.call("HSET", key, "state", "active")
                redis.call("HDEL", key, "pending_since")
                redis.call("ZADD", KEYS[4], ARGV[1], id)
                return redis.call("HGET", key, "msg")
            end
        end
        return nil
    "#,
  )
});

/// 完成任务脚本 - Go: doneCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:active
/// `KEYS[2]` -> asynq:{`<qname>`}:lease
/// `KEYS[3]` -> asynq:{`<qname>`}:t:<task_id>
/// `KEYS[4]` -> asynq:{`<qname>`}:processed:`<yyyy-mm-dd>`
/// `KEYS[5]` -> asynq:{`<qname>`}:processed
/// `ARGV[1]` -> task ID
/// `ARGV[2]` -> stats expiration timestamp
/// `ARGV[3]` -> max int64 value
pub(crate) static DONE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("DEL", KEYS[3]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        local n = redis.call("INCR", KEYS[4])
        if tonumber(n) == 1 then
            redis.call("EXPIREAT", KEYS[4], ARGV[2])
        end
        local total = redis.call("GET", KEYS[5])
        if tonumber(total) == tonumber(ARGV[3]) then
            redis.call("SET", KEYS[5], 1)
        else
            redis.call("INCR", KEYS[5])
        end
        return redis.status_reply("OK")
    "#,
  )
});

/// 标记完成并保留脚本 - Go: markAsCompleteCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:active
/// `KEYS[2]` -> asynq:{`<qname>`}:lease
/// `KEYS[3]` -> asynq:{`<qname>`}:completed
/// `KEYS[4]` -> asynq:{`<qname>`}:t:<task_id>
/// `KEYS[5]` -> asynq:{`<qname>`}:processed:`<yyyy-mm-dd>`
/// `KEYS[6]` -> asynq:{`<qname>`}:processed
/// `ARGV[1]` -> task ID
/// `ARGV[2]` -> stats expiration timestamp
/// `ARGV[3]` -> task expiration time in unix time
/// `ARGV[4]` -> task message data
/// `ARGV[5]` -> max int64 value
pub(crate) static MARK_AS_COMPLETE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1]) ~= 1 then
          return redis.error_reply("INTERNAL")
        end
        redis.call("HSET", KEYS[4], "msg", ARGV[4], "state", "completed")
        local n = redis.call("INCR", KEYS[5])
        if tonumber(n) == 1 then
            redis.call("EXPIREAT", KEYS[5], ARGV[2])
        end
        local total = redis.call("GET", KEYS[6])
        if tonumber(total) == tonumber(ARGV[5]) then
            redis.call("SET", KEYS[6], 1)
        else
            redis.call("INCR", KEYS[6])
        end
        return redis.status_reply("OK")
    "#,
  )
});

/// 重新入队脚本 - Go: requeueCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:active
/// `KEYS[2]` -> asynq:{`<qname>`}:lease
/// `KEYS[3]` -> asynq:{`<qname>`}:pending
/// `KEYS[4]` -> asynq:{`<qname>`}:t:<task_id>
/// `ARGV[1]` -> task ID
pub(crate) static REQUEUE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        redis.call("RPUSH", KEYS[3], ARGV[1])
        redis.call("HSET", KEYS[4], "state", "pending")
        return redis.status_reply("OK")
    "#,
  )
});

/// 重试任务脚本 - Go: retryCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:t:<task_id>
/// `KEYS[2]` -> asynq:{`<qname>`}:active
/// `KEYS[3]` -> asynq:{`<qname>`}:lease
/// `KEYS[4]` -> asynq:{`<qname>`}:retry
/// `KEYS[5]` -> asynq:{`<qname>`}:processed:`<yyyy-mm-dd>`
/// `KEYS[6]` -> asynq:{`<qname>`}:failed:`<yyyy-mm-dd>`
/// `KEYS[7]` -> asynq:{`<qname>`}:processed
/// `KEYS[8]` -> asynq:{`<qname>`}:failed
/// `ARGV[1]` -> task ID
/// `ARGV[2]` -> updated task message data
/// `ARGV[3]` -> retry at (unix timestamp)
/// `ARGV[4]` -> stats expiration timestamp
/// `ARGV[5]` -> max int64 value
pub(crate) static RETRY: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("ZREM", KEYS[3], ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
        redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "retry")
        local n = redis.call("INCR", KEYS[5])
        if tonumber(n) == 1 then
            redis.call("EXPIREAT", KEYS[5], ARGV[4])
        end
        local m = redis.call("INCR", KEYS[6])
        if tonumber(m) == 1 then
            redis.call("EXPIREAT", KEYS[6], ARGV[4])
        end
        local total = redis.call("GET", KEYS[7])
        if tonumber(total) == tonumber(ARGV[5]) then
            redis.call("SET", KEYS[7], 1)
            redis.call("SET", KEYS[8], 1)
        else
            redis.call("INCR", KEYS[7])
            redis.call("INCR", KEYS[8])
        end
        return redis.status_reply("OK")
    "#,
  )
});

/// 归档任务脚本 - Go: archiveCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:t:<task_id>
/// `KEYS[2]` -> asynq:{`<qname>`}:active
/// `KEYS[3]` -> asynq:{`<qname>`}:lease
/// `KEYS[4]` -> asynq:{`<qname>`}:archived
/// `KEYS[5]` -> asynq:{`<qname>`}:processed:`<yyyy-mm-dd>`
/// `KEYS[6]` -> asynq:{`<qname>`}:failed:`<yyyy-mm-dd>`
/// `KEYS[7]` -> asynq:{`<qname>`}:processed
/// `KEYS[8]` -> asynq:{`<qname>`}:failed
/// `KEYS[9]` -> asynq:{`<qname>`}:t:
/// `ARGV[1]` -> task ID
/// `ARGV[2]` -> updated task message data
/// `ARGV[3]` -> died_at UNIX timestamp
/// `ARGV[4]` -> cutoff timestamp (e.g., 90 days ago)
/// `ARGV[5]` -> max number of tasks in archive
/// `ARGV[6]` -> stats expiration timestamp
/// `ARGV[7]` -> max int64 value
pub(crate) static ARCHIVE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        if redis.call("ZREM", KEYS[3], ARGV[1]) == 0 then
          return redis.error_reply("NOT FOUND")
        end
        redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
        local old = redis.call("ZRANGE", KEYS[4], "-inf", ARGV[4], "BYSCORE")
        if #old > 0 then
            for _, id in ipairs(old) do
                redis.call("DEL", KEYS[9] .. id)
            end
            redis.call("ZREM", KEYS[4], unpack(old))
        end

        local extra = redis.call("ZRANGE", KEYS[4], 0, -ARGV[5])
        if #extra > 0 then
            for _, id in ipairs(extra) do
                redis.call("DEL", KEYS[9] .. id)
            end
            redis.call("ZREM", KEYS[4], unpack(extra))
        end

        redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "archived")
        local n = redis.call("INCR", KEYS[5])
        if tonumber(n) == 1 then
            redis.call("EXPIREAT", KEYS[5], ARGV[6])
        end
        local m = redis.call("INCR", KEYS[6])
        if tonumber(m) == 1 then
            redis.call("EXPIREAT", KEYS[6], ARGV[6])
        end
        local total = redis.call("GET", KEYS[7])
        if tonumber(total) == tonumber(ARGV[7]) then
            redis.call("SET", KEYS[7], 1)
            redis.call("SET", KEYS[8], 1)
        else
            redis.call("INCR", KEYS[7])
            redis.call("INCR", KEYS[8])
        end
        return redis.status_reply("OK")
    "#,
  )
});

/// 转发到期的重试任务 - Go: forwardCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:retry
/// `KEYS[2]` -> asynq:{`<qname>`}:pending
/// `ARGV[1]` -> current unix time in seconds
/// `ARGV[2]` -> task key prefix
/// `ARGV[3]` -> current unix time in nsec
/// Returns the number of forwarded tasks
pub(crate) static FORWARD: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 100)
        for _, id in ipairs(ids) do
            redis.call("LPUSH", KEYS[2], id)
            redis.call("ZREM", KEYS[1], id)
            redis.call("HSET", ARGV[2] .. id,
                       "state", "pending",
                       "pending_since", ARGV[3])
        end
        return table.getn(ids)
    "#,
  )
});

/// 删除过期的已完成任务 - Go: deleteExpiredCompletedTasksCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:completed
/// `ARGV[1]` -> current time in unix time
/// `ARGV[2]` -> task key prefix
/// `ARGV[3]` -> batch size
pub(crate) static DELETE_EXPIRED_COMPLETED: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
        for _, id in ipairs(ids) do
            redis.call("DEL", ARGV[2] .. id)
            redis.call("ZREM", KEYS[1], id)
        end
        return table.getn(ids)
    "#,
  )
});

/// 列出租约过期的任务 - Go: listLeaseExpiredCmd
/// `KEYS[1]` -> asynq:{`<qname>`}:lease
/// `ARGV[1]` -> cutoff in unix time
/// `ARGV[2]` -> task key prefix
pub(crate) static LIST_LEASE_EXPIRED: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        local res = {}
        local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
        for _, id in ipairs(ids) do
            local key = ARGV[2] .. id
            local v = redis.call("HGET", key, "msg")
            if v then
                table.insert(res, v)
            end
        end
        return res
    "#,
  )
});

/// 续租脚本 - Go: ExtendLease
/// `KEYS[1]` -> asynq:{`<qname>`}:lease
/// `ARGV[1]` -> new lease expiration unix time
/// `ARGV[2..]` -> task IDs
/// Returns the number of leases extended
pub(crate) static EXTEND_LEASE: LazyLock<Script> = LazyLock::new(|| {
  Script::new(
    r#"
        local n = 0
        for i = 2, #ARGV do
            n = n + redis.call("ZADD", KEYS[1], "XX", "CH", ARGV[1], ARGV[i])
        end
        return n
    "#,
  )
});
