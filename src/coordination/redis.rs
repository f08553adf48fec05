//! Redis / KeyDB client pool creation.
//!
//! Builds a [`fred::clients::Pool`] for the server described in
//! [`crate::config::RedisConfig`], optionally enabling TLS via `rustls` and
//! reading the password from an environment variable.

use anyhow::{bail, Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::RedisConfig;

/// Lease traffic is a handful of small commands per ttl; two connections
/// keep an extend from queueing behind a slow acquire.
const POOL_SIZE: usize = 2;

pub const DEFAULT_REDIS_PORT: u16 = 6379;

// ---------------------------------------------------------------------------
// Endpoint parsing
// ---------------------------------------------------------------------------

/// A Redis address as written by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisEndpoint {
    pub host: String,
    /// `None` when the address carried no port.
    pub port: Option<u16>,
    /// Set by a `rediss://` scheme.
    pub tls: bool,
}

/// Parse `[redis[s]://]host[:port][/db]`.  IPv6 hosts must be bracketed
/// when a port follows (`[::1]:6380`).
pub fn parse_endpoint(raw: &str) -> Result<RedisEndpoint> {
    let (tls, rest) = if let Some(rest) = raw.strip_prefix("rediss://") {
        (true, rest)
    } else {
        (false, raw.strip_prefix("redis://").unwrap_or(raw))
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        bail!("empty Redis endpoint: {raw:?}");
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .with_context(|| format!("unterminated IPv6 host in {raw:?}"))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => bail!("unexpected {tail:?} after IPv6 host in {raw:?}"),
        }
    } else if authority.matches(':').count() > 1 {
        // Bare IPv6 literal; no port.
        (authority, None)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let port = port
        .map(|p| p.parse::<u16>())
        .transpose()
        .with_context(|| format!("invalid port in Redis endpoint {raw:?}"))?;

    Ok(RedisEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Create a Redis connection pool from the application configuration.
///
/// `config.host` may itself be a full endpoint; a port or `rediss://`
/// scheme in it wins over `config.port` and `config.tls`.  The pool is
/// connected and PING-verified before being returned.  The client
/// reconnects on its own with exponential back-off; the lease controller
/// never sees more than failed commands while it does.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let endpoint = parse_endpoint(&config.host)?;
    let port = endpoint.port.unwrap_or(config.port);
    let tls = config.tls || endpoint.tls;

    let mut fred_config = FredConfig {
        server: ServerConfig::new_centralized(endpoint.host.as_str(), port),
        ..FredConfig::default()
    };
    if tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    fred_config.password = std::env::var(&config.auth_token_env).ok();

    let mut builder = Builder::from_config(fred_config);
    // Unlimited attempts, 100ms doubling up to 30s.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build Redis connection pool")?;
    pool.init()
        .await
        .with_context(|| format!("failed to connect to Redis at {}:{port}", endpoint.host))?;

    let _: String = pool
        .ping(None)
        .await
        .context("Redis PING failed after connect")?;

    tracing::info!(
        host = %endpoint.host,
        port,
        tls,
        pool_size = POOL_SIZE,
        "Redis pool ready"
    );
    Ok(pool)
}
