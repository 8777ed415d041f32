//! Client identity and the client token
//!
//! Token wire format, kept for compatibility with existing clients:
//!
//! ```text
//! <writeIndex>@<unixTimestamp>#<clientId>
//! 3@1760000000#0f3a9c...   (clientId: 32 lowercase hex chars)
//! ```

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

const CLIENT_ID_LEN: usize = 32;

/// Stable identity of one client across requests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Derive an identity from request attributes.
    ///
    /// Without a session token the identity is shared by every client behind
    /// the same address and user agent, which only costs extra waits.
    pub fn from_request(ip: &str, user_agent: &str, session_token: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ip.as_bytes());
        hasher.update(b"\n");
        hasher.update(user_agent.as_bytes());
        hasher.update(b"\n");
        hasher.update(session_token.unwrap_or("").as_bytes());
        let digest = hasher.finalize();

        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex[..CLIENT_ID_LEN].to_string())
    }

    /// Accept an identity carried by a token.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == CLIENT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn token_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\d+)@(\d+)#([0-9a-f]{32})$").ok())
        .as_ref()
}

/// Correlates a client's next request with its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientToken {
    /// Write index of the state persisted for this client
    pub write_index: u64,
    /// Unix seconds when the token was issued
    pub timestamp: i64,
    pub client_id: ClientId,
}

impl ClientToken {
    pub fn new(write_index: u64, issued_at: DateTime<Utc>, client_id: ClientId) -> Self {
        Self {
            write_index,
            timestamp: issued_at.timestamp(),
            client_id,
        }
    }

    /// Parse the wire format. Malformed tokens yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let captures = token_pattern()?.captures(raw.trim())?;
        let write_index = captures[1].parse().ok()?;
        let timestamp = captures[2].parse().ok()?;
        let client_id = ClientId::parse(&captures[3])?;
        Some(Self {
            write_index,
            timestamp,
            client_id,
        })
    }

    /// True when the token was issued no longer than `ttl` before `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        now.timestamp().saturating_sub(self.timestamp) <= ttl
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.write_index, self.timestamp, self.client_id)
    }
}

/// Request attributes used to identify a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientRequest {
    pub ip: String,
    pub user_agent: String,
    pub session_token: Option<String>,
    /// Raw client token from the previous response, if any
    pub chronology_token: Option<String>,
}

impl ClientRequest {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    pub fn with_chronology_token(mut self, token: impl Into<String>) -> Self {
        self.chronology_token = Some(token.into());
        self
    }

    /// Identity derived from request attributes alone
    pub fn derived_client_id(&self) -> ClientId {
        ClientId::from_request(&self.ip, &self.user_agent, self.session_token.as_deref())
    }
}
