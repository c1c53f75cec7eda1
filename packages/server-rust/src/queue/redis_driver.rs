//! Redis driver.
//!
//! Keys are `{app}:{env}:{queue}:{channel}`. Waiting, Failed and Timeout are
//! lists; Delayed and Reserved are sorted sets scored by unix milliseconds.
//! Members are `MsgPack`-encoded [`PersistedEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use keel_core::clock::{self, SharedClock};
use keel_core::codec;
use redis::aio::MultiplexedConnection;
use redis::Script;

use super::backoff::BackoffPolicy;
use super::driver::{ensure_reloadable, Driver};
use super::message::{Channel, PersistedEvent, QueueError, QueueInfo};

/// Moves due Delayed members to Waiting and expired Reserved members to
/// Timeout. KEYS: delayed, waiting, reserved, timeout. ARGV: now.
const MIGRATE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, m in ipairs(due) do
  redis.call('LPUSH', KEYS[2], m)
end
if #due > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, m in ipairs(expired) do
  redis.call('LPUSH', KEYS[4], m)
end
if #expired > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
end
return #due + #expired
";

/// Pops the oldest Waiting member into Reserved under a provisional
/// deadline. KEYS: waiting, reserved. ARGV: deadline.
const RESERVE: &str = r"
local m = redis.call('RPOP', KEYS[1])
if m then
  redis.call('ZADD', KEYS[2], ARGV[1], m)
end
return m
";

/// Removes Reserved member ARGV[1] and adds ARGV[4] to KEYS[2]. ARGV[2]
/// picks the placement: `tail` pushes onto the list tail, `head` puts it
/// back where the next pop finds it, `score` adds it to a sorted set
/// scored ARGV[3]. Returns 0 when the member was no longer Reserved.
/// KEYS: reserved, target.
const SETTLE: &str = r"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
  return 0
end
if ARGV[2] == 'tail' then
  redis.call('LPUSH', KEYS[2], ARGV[4])
elseif ARGV[2] == 'head' then
  redis.call('RPUSH', KEYS[2], ARGV[4])
else
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
end
return 1
";

/// Where [`SETTLE`] puts the member it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Behind everything already in the list.
    Tail,
    /// In front of the list, popped next.
    Head,
    /// Into a sorted set with this score.
    Scored(i64),
}

impl Placement {
    /// Script arguments: mode and score.
    #[must_use]
    pub fn args(self) -> (&'static str, i64) {
        match self {
            Self::Tail => ("tail", 0),
            Self::Head => ("head", 0),
            Self::Scored(score) => ("score", score),
        }
    }
}

/// Moves every member of list KEYS[1] onto list KEYS[2].
const DRAIN: &str = r"
local n = 0
while redis.call('RPOPLPUSH', KEYS[1], KEYS[2]) do
  n = n + 1
end
return n
";

/// Default reservation used between the reserving script and the real
/// handling deadline being written.
pub const DEFAULT_RESERVE_LEASE: Duration = Duration::from_secs(600);

/// Pause between empty reserve attempts.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Redis key of one channel under `prefix`.
#[must_use]
pub fn channel_key(prefix: &str, channel: Channel) -> String {
    format!("{prefix}:{}", channel.as_str())
}

/// Sorted-set score `delay` after `now_ms`, saturating.
#[must_use]
pub fn score_after(now_ms: i64, delay: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Driver over a single redis instance.
pub struct RedisDriver {
    conn: MultiplexedConnection,
    prefix: String,
    clock: SharedClock,
    poll_timeout: Duration,
    lease: Duration,
    backoff: BackoffPolicy,
    migrate: Script,
    reserve: Script,
    settle: Script,
    drain: Script,
}

impl RedisDriver {
    /// Connects to `url` and namespaces keys as `{app}:{env}:{queue}`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Redis`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str, app: &str, env: &str, queue: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: format!("{app}:{env}:{queue}"),
            clock: clock::system(),
            poll_timeout: Duration::from_secs(1),
            lease: DEFAULT_RESERVE_LEASE,
            backoff: BackoffPolicy::default(),
            migrate: Script::new(MIGRATE),
            reserve: Script::new(RESERVE),
            settle: Script::new(SETTLE),
            drain: Script::new(DRAIN),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Provisional Reserved deadline. A process that dies right after
    /// reserving leaves the member to time out after this long.
    #[must_use]
    pub fn with_reserve_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Redis key of one channel.
    #[must_use]
    pub fn key(&self, channel: Channel) -> String {
        channel_key(&self.prefix, channel)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn remove_reserved(&self, member: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(self.key(Channel::Reserved))
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Atomically replaces Reserved `member` with `next` in `target`.
    async fn settle(
        &self,
        member: &[u8],
        target: Channel,
        placement: Placement,
        next: &[u8],
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let (mode, score) = placement.args();
        self.settle
            .key(self.key(Channel::Reserved))
            .key(self.key(target))
            .arg(member)
            .arg(mode)
            .arg(score)
            .arg(next)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_reserve(&self) -> Result<Option<PersistedEvent>, QueueError> {
        let mut conn = self.conn.clone();
        self.migrate
            .key(self.key(Channel::Delayed))
            .key(self.key(Channel::Waiting))
            .key(self.key(Channel::Reserved))
            .key(self.key(Channel::Timeout))
            .arg(self.now_ms())
            .invoke_async::<_, i64>(&mut conn)
            .await?;

        let member: Option<Vec<u8>> = self
            .reserve
            .key(self.key(Channel::Waiting))
            .key(self.key(Channel::Reserved))
            .arg(score_after(self.now_ms(), self.lease))
            .invoke_async(&mut conn)
            .await?;
        let Some(member) = member else {
            return Ok(None);
        };

        let msg: PersistedEvent = codec::decode(&member)?;
        redis::cmd("ZADD")
            .arg(self.key(Channel::Reserved))
            .arg("XX")
            .arg(score_after(self.now_ms(), msg.handle_timeout))
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(Some(msg))
    }
}

#[async_trait]
impl Driver for RedisDriver {
    async fn push(&self, msg: &PersistedEvent, delay: Duration) -> Result<(), QueueError> {
        let member = codec::encode(msg)?;
        let mut conn = self.conn.clone();
        if delay.is_zero() {
            redis::cmd("LPUSH")
                .arg(self.key(Channel::Waiting))
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await?;
        } else {
            redis::cmd("ZADD")
                .arg(self.key(Channel::Delayed))
                .arg(score_after(self.now_ms(), delay))
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn pop(&self) -> Result<Option<PersistedEvent>, QueueError> {
        let give_up = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            if let Some(msg) = self.try_reserve().await? {
                return Ok(Some(msg));
            }
            let remaining = give_up.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(IDLE_POLL.min(remaining)).await;
        }
    }

    async fn ack(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        self.remove_reserved(&codec::encode(msg)?).await
    }

    async fn fail(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        let member = codec::encode(msg)?;
        self.settle(&member, Channel::Failed, Placement::Tail, &member).await
    }

    async fn retry(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        let backoff = self.backoff.delay(msg.attempts);
        let mut next = msg.clone();
        next.attempts += 1;
        next.backoff = backoff;
        let score = score_after(self.now_ms(), backoff.max(Duration::from_millis(1)));
        self.settle(
            &codec::encode(msg)?,
            Channel::Delayed,
            Placement::Scored(score),
            &codec::encode(&next)?,
        )
        .await
    }

    async fn release(&self, msg: &PersistedEvent) -> Result<(), QueueError> {
        let member = codec::encode(msg)?;
        self.settle(&member, Channel::Waiting, Placement::Head, &member).await
    }

    async fn reload(&self, channel: Channel) -> Result<u64, QueueError> {
        ensure_reloadable(channel)?;
        let mut conn = self.conn.clone();
        let moved: u64 = self
            .drain
            .key(self.key(channel))
            .key(self.key(Channel::Waiting))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn flush(&self, channel: Channel) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.key(channel))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn info(&self) -> Result<QueueInfo, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, reserved, failed, timeout): (u64, u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(self.key(Channel::Waiting))
            .cmd("ZCARD")
            .arg(self.key(Channel::Delayed))
            .cmd("ZCARD")
            .arg(self.key(Channel::Reserved))
            .cmd("LLEN")
            .arg(self.key(Channel::Failed))
            .cmd("LLEN")
            .arg(self.key(Channel::Timeout))
            .query_async(&mut conn)
            .await?;
        Ok(QueueInfo {
            waiting,
            delayed,
            reserved,
            failed,
            timeout,
        })
    }
}
