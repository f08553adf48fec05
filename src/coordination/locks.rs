use std::time::Duration;

use anyhow::{Context, Result};
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, warn};

use super::{Extension, LeaseCapability};

/// Extend only if the key still belongs to `ARGV[1]`.
const EXTEND_SCRIPT: &str = r#"
    local val = redis.call('GET', KEYS[1])
    if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        return 1
    end
    return 0
"#;

/// Delete only if the key still belongs to `ARGV[1]`.
const RELEASE_SCRIPT: &str = r#"
    local val = redis.call('GET', KEYS[1])
    if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
        redis.call('DEL', KEYS[1])
        return 1
    end
    return 0
"#;

/// Redis-backed lease: `SET NX PX` to acquire, owner-checked Lua scripts to
/// extend and release.
///
/// The stored value is `<holder>:<unix_ts>`, so the scripts match on the
/// `<holder>:` prefix.
#[derive(Clone)]
pub struct RedisLease {
    pool: fred::clients::Pool,
    holder: String,
    command_timeout: Duration,
}

impl RedisLease {
    pub fn new(pool: fred::clients::Pool, holder: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            pool,
            holder: holder.into(),
            command_timeout,
        }
    }

    fn lock_value(&self) -> String {
        lock_value(&self.holder, chrono::Utc::now().timestamp())
    }
}

fn lock_value(holder: &str, timestamp: i64) -> String {
    format!("{holder}:{timestamp}")
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl LeaseCapability for RedisLease {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let value = self.lock_value();
        let set = self.pool.set::<Option<String>, _, _>(
            key,
            value.as_str(),
            Some(fred::types::Expiration::PX(ttl_millis(ttl))),
            Some(fred::types::SetOptions::NX),
            false,
        );
        let result = tokio::time::timeout(self.command_timeout, set)
            .await
            .with_context(|| format!("SET NX on {key} timed out"))?
            .with_context(|| format!("SET NX on {key} failed"))?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let acquired = result.is_some();
        debug!(%key, holder = %self.holder, acquired, "acquire");
        Ok(acquired)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<Extension> {
        let eval = self.pool.eval::<i64, _, _, _>(
            EXTEND_SCRIPT,
            vec![key.to_string()],
            vec![self.holder.clone(), ttl_millis(ttl).to_string()],
        );
        let extended = match tokio::time::timeout(self.command_timeout, eval).await {
            Ok(result) => result.context("lease extend script failed")?,
            Err(_) => {
                warn!(%key, holder = %self.holder, timeout = ?self.command_timeout, "lease extend timed out");
                return Ok(Extension::TimedOut);
            }
        };
        if extended == 1 {
            debug!(%key, holder = %self.holder, ?ttl, "lease extended");
            Ok(Extension::Extended)
        } else {
            warn!(%key, holder = %self.holder, "lease extend: key missing or owned by another holder");
            Ok(Extension::NotHeld)
        }
    }

    async fn release(&self, key: &str) -> Result<bool> {
        let eval = self.pool.eval::<i64, _, _, _>(
            RELEASE_SCRIPT,
            vec![key.to_string()],
            vec![self.holder.clone()],
        );
        let released = tokio::time::timeout(self.command_timeout, eval)
            .await
            .with_context(|| format!("lease release on {key} timed out"))?
            .context("lease release script failed")?;
        if released == 1 {
            debug!(%key, holder = %self.holder, "lease released");
        } else {
            warn!(%key, holder = %self.holder, "lease release: key missing or owned by another holder");
        }
        Ok(released == 1)
    }

    fn holder(&self) -> &str {
        &self.holder
    }
}
