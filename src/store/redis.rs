//! Redis-backed counter store.
//!
//! Counters are stored as plain integer strings so they stay readable (and
//! provisionable) with `redis-cli`. The limiter must own its Redis database:
//! [`CounterStore::flush_data`] issues `FLUSHDB`.

use std::sync::Arc;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, Script};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{CounterStep, CounterStore, StoreError, StoreType};

/// Lua body of the write half of [`CounterStore::check_and_increment`].
///
/// KEYS are the (total, current) pairs of every step. The first `#KEYS` ARGV
/// entries hold the value each key had when it was read: `=<raw>` for a
/// present key, an empty string for an absent one. The remaining ARGV entries
/// are the new current values, one per step. Nothing is written unless every
/// key still holds what was read.
const COMPARE_AND_SET: &str = r#"
local n = #KEYS
for i = 1, n do
  local value = redis.call('GET', KEYS[i])
  local seen = ''
  if value then
    seen = '=' .. value
  end
  if seen ~= ARGV[i] then
    return 0
  end
end
local step = 1
for i = 2, n, 2 do
  redis.call('SET', KEYS[i], ARGV[n + step])
  step = step + 1
end
return 1
"#;

/// How many times a group increment is retried when another writer changes
/// one of its keys between the read and the write.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Counter store shared between instances through Redis.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    script: Arc<Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|err| StoreError::Unavailable(format!("redis client: {err}")))?;
        let mut manager = ConnectionManager::new(client)
            .await
            .map_err(|err| StoreError::Unavailable(format!("redis connect: {err}")))?;

        let pong: String = ::redis::cmd("PING")
            .query_async(&mut manager)
            .await
            .map_err(|err| unavailable("ping", err))?;
        if pong != "PONG" {
            return Err(StoreError::Unavailable(format!(
                "unexpected ping reply: {pong}"
            )));
        }

        info!("Connected to Redis counter store");

        Ok(Self {
            manager,
            script: Arc::new(Script::new(COMPARE_AND_SET)),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get_key(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|err| unavailable("get", err))?;

        match raw {
            Some(raw) => parse_counter(key, &raw),
            None => Err(StoreError::KeyNotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn set_key(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|err| unavailable("set", err))
    }

    async fn flush_data(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let reply: String = ::redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("flushdb", err))?;

        if reply != "OK" {
            return Err(StoreError::Unavailable(format!(
                "unexpected flushdb reply: {reply}"
            )));
        }
        debug!("Flushed Redis counter database");
        Ok(())
    }

    async fn check_and_increment(&self, steps: &[CounterStep]) -> Result<bool, StoreError> {
        if steps.is_empty() {
            return Ok(true);
        }

        let keys: Vec<&str> = steps
            .iter()
            .flat_map(|step| [step.total_key.as_str(), step.current_key.as_str()])
            .collect();
        let mut conn = self.manager.clone();

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let seen: Vec<Option<String>> = ::redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(|err| unavailable("mget", err))?;

            let Some(updated) = plan_increment(steps, &seen)? else {
                return Ok(false);
            };

            let mut invocation = self.script.prepare_invoke();
            for (key, value) in keys.iter().zip(&seen) {
                invocation.key(*key);
                match value {
                    Some(raw) => invocation.arg(format!("={raw}")),
                    None => invocation.arg(""),
                };
            }
            for value in &updated {
                invocation.arg(*value);
            }

            let written: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|err| unavailable("check_and_increment", err))?;
            if written == 1 {
                return Ok(true);
            }
            debug!(attempt = attempt, "Counters changed during increment, retrying");
        }

        warn!(
            attempts = MAX_CAS_ATTEMPTS,
            "Giving up on contended counter increment"
        );
        Err(StoreError::Unavailable(format!(
            "redis check_and_increment: counters kept changing after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    fn store_type(&self) -> StoreType {
        StoreType::Redis
    }
}

/// Parse a raw Redis string into a counter value.
fn parse_counter(key: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse::<i64>().map_err(|_| StoreError::ValueParse {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Decide a group increment from the raw values read for its keys.
///
/// `seen` holds the (total, current) values of every step in order. An absent
/// total falls back to the step's default and an absent current counts as 0.
/// Returns the new current value of every step, or `None` when any step would
/// pass its total.
fn plan_increment(
    steps: &[CounterStep],
    seen: &[Option<String>],
) -> Result<Option<Vec<i64>>, StoreError> {
    let mut updated = Vec::with_capacity(steps.len());
    for (step, values) in steps.iter().zip(seen.chunks(2)) {
        let total = match values.first().and_then(Option::as_deref) {
            Some(raw) => parse_counter(&step.total_key, raw)?,
            None => step.default_total,
        };
        let current = match values.get(1).and_then(Option::as_deref) {
            Some(raw) => parse_counter(&step.current_key, raw)?,
            None => 0,
        };
        match current.checked_add(step.amount) {
            Some(next) if next <= total => updated.push(next),
            _ => return Ok(None),
        }
    }
    Ok(Some(updated))
}

fn unavailable(op: &str, err: RedisError) -> StoreError {
    warn!(op = op, error = %err, "Redis operation failed");
    StoreError::Unavailable(format!("redis {op}: {err}"))
}
