//! Session identities and tenant cleanup on session end.
//!
//! Authentication itself happens elsewhere; the identity provider opens a session here once a
//! user has signed in and receives an opaque token. Clients present the token as
//! `Authorization: Bearer <token>` or in the `ragdesk_session` cookie. Ending a session by
//! logout, explicit end, or idle expiry removes every collection the tenant owns first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, header};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::namespace::NamespaceManager;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "ragdesk_session";

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Tenant key used for collection naming; the user's email for signed-in users.
    pub tenant_id: String,
    /// Display name.
    pub name: String,
    /// Email address, empty for guests.
    pub email: String,
    /// Avatar URL.
    pub picture: Option<String>,
    /// Guests may chat against the global collection but may not upload.
    pub guest: bool,
}

impl Identity {
    /// Identity of a signed-in user, keyed by email.
    pub fn user(name: impl Into<String>, email: impl Into<String>, picture: Option<String>) -> Self {
        let email = email.into();
        Self {
            tenant_id: email.clone(),
            name: name.into(),
            email,
            picture,
            guest: false,
        }
    }

    /// Fresh guest identity with its own tenant key.
    pub fn guest() -> Self {
        Self {
            tenant_id: format!("guest-{}", Uuid::new_v4().simple()),
            name: "Guest".into(),
            email: String::new(),
            picture: None,
            guest: true,
        }
    }
}

struct SessionEntry {
    identity: Identity,
    last_seen: Instant,
}

/// In-memory session registry.
pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    idle_timeout: Duration,
}

impl SessionStore {
    /// Create a registry that expires sessions idle for longer than `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Open a session and return its token.
    pub fn open(&self, identity: Identity) -> String {
        let token = Uuid::new_v4().simple().to_string();
        tracing::info!(tenant = %identity.tenant_id, guest = identity.guest, "Session opened");
        self.sessions.insert(
            token.clone(),
            SessionEntry {
                identity,
                last_seen: Instant::now(),
            },
        );
        token
    }

    /// Identity for `token`, refreshing its idle timer. Idle sessions resolve to nothing.
    pub fn resolve(&self, token: &str) -> Option<Identity> {
        let mut entry = self.sessions.get_mut(token)?;
        let now = Instant::now();
        if now.duration_since(entry.last_seen) > self.idle_timeout {
            return None;
        }
        entry.last_seen = now;
        Some(entry.identity.clone())
    }

    /// Identity for `token` without touching its timer.
    pub fn peek(&self, token: &str) -> Option<Identity> {
        self.sessions
            .get(token)
            .map(|entry| entry.identity.clone())
    }

    /// Drop the session, returning who owned it.
    pub fn remove(&self, token: &str) -> Option<Identity> {
        self.sessions.remove(token).map(|(_, entry)| entry.identity)
    }

    /// Remove every session idle at `now`, returning their identities.
    pub fn take_idle(&self, now: Instant) -> Vec<Identity> {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > self.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        idle.into_iter()
            .filter_map(|token| self.remove(&token))
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are open.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Extract a session token from the `Authorization` header or the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// End the session behind `token`: end the tenant (collections, in-flight jobs, finished
/// statuses), then drop the session.
///
/// Returns the identity that was signed out. Cleanup failures are logged and never block the
/// session from ending.
pub async fn end_session(
    sessions: &SessionStore,
    namespace: &NamespaceManager,
    token: &str,
) -> Option<Identity> {
    let identity = sessions.peek(token)?;
    namespace.end_tenant(&identity.tenant_id).await;
    sessions.remove(token);
    tracing::info!(tenant = %identity.tenant_id, "Session ended");
    Some(identity)
}

/// Periodically end idle sessions, treating expiry as a session-end signal.
pub fn spawn_idle_sweeper(
    sessions: Arc<SessionStore>,
    namespace: NamespaceManager,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for identity in sessions.take_idle(Instant::now()) {
                tracing::info!(tenant = %identity.tenant_id, "Session expired");
                namespace.end_tenant(&identity.tenant_id).await;
            }
        }
    })
}
