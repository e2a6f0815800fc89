use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::credentials::{provider_from_config, CacheCredential, CredentialProvider};
use super::CacheBackend;
use crate::config::CacheConfig;
use crate::utils::{SessionError, SessionResult, Tier};

const SCAN_BATCH: usize = 200;

struct LiveConnection {
    manager: ConnectionManager,
    credential: CacheCredential,
}

/// Redis implementation of [`CacheBackend`].
///
/// Connects lazily on first use. The credential is re-fetched and the
/// connection rebuilt whenever it is missing or close to expiry.
pub struct RedisBackend {
    url: String,
    endpoint: String,
    credentials: Box<dyn CredentialProvider>,
    refresh_margin: Duration,
    conn: Mutex<Option<LiveConnection>>,
}

impl RedisBackend {
    pub fn new(config: &CacheConfig) -> SessionResult<Self> {
        // Fail fast on a malformed URL
        redis::Client::open(config.url.as_str())
            .map_err(|e| SessionError::Config(format!("cache.url: {}", e)))?;

        let credentials = provider_from_config(&config.auth, config.op_timeout())?;
        Ok(Self::with_provider(config, credentials))
    }

    pub fn with_provider(config: &CacheConfig, credentials: Box<dyn CredentialProvider>) -> Self {
        Self {
            url: config.url.clone(),
            endpoint: strip_userinfo(&config.url),
            credentials,
            refresh_margin: Duration::from_secs(config.auth.refresh_margin_seconds),
            conn: Mutex::new(None),
        }
    }

    /// Server address with any credentials removed, safe to log
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connection(&self) -> SessionResult<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(live) = guard.as_ref() {
            if !live.credential.expires_within(self.refresh_margin) {
                return Ok(live.manager.clone());
            }
            debug!("Cache credential close to expiry, reconnecting");
        }

        let credential = self.credentials.fetch().await?;
        let url = url_with_credential(&self.url, &credential);
        let client = redis::Client::open(url.as_str())?;
        let manager = client.get_connection_manager().await?;
        info!("Connected to cache at {}", self.endpoint);

        *guard = Some(LiveConnection {
            manager: manager.clone(),
            credential,
        });
        Ok(manager)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> SessionResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> SessionResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<bool> {
        let mut conn = self.connection().await?;
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> SessionResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> SessionResult<Option<Duration>> {
        let mut conn = self.connection().await?;
        let secs = redis::cmd("TTL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await?;
        // -2 = missing, -1 = no expiry
        Ok(u64::try_from(secs).ok().map(Duration::from_secs))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> SessionResult<bool> {
        let mut conn = self.connection().await?;
        let updated = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> SessionResult<()> {
        let mut conn = self.connection().await?;
        let reply = redis::cmd("PING").query_async::<String>(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(SessionError::connectivity(
                Tier::Cache,
                format!("unexpected PING reply: {}", reply),
            ))
        }
    }
}

/// Escape glob metacharacters so the prefix matches literally in SCAN
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn split_scheme(url: &str) -> (&str, &str) {
    match url.find("://") {
        Some(idx) => (&url[..idx + 3], &url[idx + 3..]),
        None => ("", url),
    }
}

fn strip_userinfo(url: &str) -> String {
    let (scheme, rest) = split_scheme(url);
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Rebuild the connection URL with the credential as userinfo.
/// Credentials already present in the configured URL are kept when the
/// provider has none.
fn url_with_credential(url: &str, credential: &CacheCredential) -> String {
    let Some(password) = credential.password.as_deref() else {
        return url.to_string();
    };

    let bare = strip_userinfo(url);
    let (scheme, rest) = split_scheme(&bare);
    let user = credential
        .username
        .as_deref()
        .map(percent_encode)
        .unwrap_or_default();
    format!("{}{}:{}@{}", scheme, user, percent_encode(password), rest)
}
