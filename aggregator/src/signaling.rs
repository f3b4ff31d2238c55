//! Ephemeral, token-protected signaling sessions.
//!
//! A session is an in-memory pub/sub channel used by a client to exchange
//! peer-to-peer setup messages, independent of the aggregation engine but
//! with the same lifecycle discipline: TTL, disconnect cleanup, and auth on
//! every operation.

use crate::config::SignalingConfig;
use crate::emitter::{SendOutcome, send_with_retry};
use crate::errors::SignalingError;
use crate::metrics_defs::{SESSIONS_CREATED, SIGNALS_FANNED_OUT};
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Initiator and receiver; a third concurrent subscriber is a duplicate.
pub const MAX_SUBSCRIBERS: usize = 2;
const SIGNAL_CHANNEL_CAPACITY: usize = 32;
const TOKEN_BYTES: usize = 32;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
    /// Bearer secret, returned exactly once; the server retains only its
    /// digest.
    pub token: String,
    pub ice_servers: serde_json::Value,
    pub ttl_seconds: u64,
}

struct SignalSession {
    token_digest: [u8; 32],
    created_at: Instant,
    subscribers: Mutex<Vec<mpsc::Sender<serde_json::Value>>>,
    expiry: Mutex<Option<AbortHandle>>,
    /// Signals fanned out so far; gates the drain-after-traffic close.
    delivered: AtomicU64,
}

impl SignalSession {
    fn prune_closed(&self) {
        self.subscribers.lock().retain(|tx| !tx.is_closed());
    }

    fn close(&self) {
        if let Some(handle) = self.expiry.lock().take() {
            handle.abort();
        }
        // Dropping the senders ends every subscriber stream
        self.subscribers.lock().clear();
    }
}

pub struct SessionMap {
    sessions: Mutex<HashMap<String, Arc<SignalSession>>>,
    ttl: Duration,
    ice_servers: serde_json::Value,
}

impl SessionMap {
    pub fn new(config: &SignalingConfig) -> Self {
        Self::with_ttl(
            Duration::from_secs(config.ttl_seconds),
            config.ice_servers.clone(),
        )
    }

    pub fn with_ttl(ttl: Duration, ice_servers: serde_json::Value) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            ice_servers,
        }
    }

    /// Creates a session and arms its TTL timer.
    pub fn create(self: &Arc<Self>) -> SessionCreated {
        let session_id = Uuid::new_v4().to_string();
        let token = generate_token();

        let session = Arc::new(SignalSession {
            token_digest: token_digest(&token),
            created_at: Instant::now(),
            subscribers: Mutex::new(Vec::new()),
            expiry: Mutex::new(None),
            delivered: AtomicU64::new(0),
        });
        self.sessions.lock().insert(session_id.clone(), session.clone());

        let map = Arc::clone(self);
        let expiring_id = session_id.clone();
        let ttl = self.ttl;
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if map.expire(&expiring_id) {
                tracing::info!(session_id = %expiring_id, "signaling session expired");
            }
        });
        *session.expiry.lock() = Some(task.abort_handle());

        tracing::info!(session_id = %session_id, ttl_secs = self.ttl.as_secs(), "signaling session created");
        metrics::counter!(SESSIONS_CREATED.name).increment(1);

        SessionCreated {
            session_id,
            token,
            ice_servers: self.ice_servers.clone(),
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Registers a subscriber; the returned channel receives every signal
    /// posted after this point.
    pub fn subscribe(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<serde_json::Value>, SignalingError> {
        let session = self.authorized(session_id, token)?;

        let mut subscribers = session.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        if subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(SignalingError::SubscriberLimit);
        }

        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        subscribers.push(tx);
        Ok(rx)
    }

    /// Fans a payload out to every live subscriber; returns how many
    /// received it.
    pub async fn signal(
        &self,
        session_id: &str,
        token: &str,
        payload: serde_json::Value,
    ) -> Result<usize, SignalingError> {
        let session = self.authorized(session_id, token)?;

        let senders: Vec<_> = session.subscribers.lock().clone();
        let mut reached = 0;
        for tx in &senders {
            match send_with_retry(tx, payload.clone()).await {
                SendOutcome::Sent => reached += 1,
                SendOutcome::Closed => {}
                SendOutcome::Dropped => {
                    tracing::warn!(session_id, "slow signaling subscriber, dropping payload");
                }
            }
        }

        session.delivered.fetch_add(1, Ordering::SeqCst);
        session.prune_closed();
        metrics::counter!(SIGNALS_FANNED_OUT.name).increment(reached as u64);
        Ok(reached)
    }

    /// Called when a subscriber stream is dropped. Once the session has
    /// carried traffic and its last subscriber is gone, it is torn down
    /// early instead of waiting for the TTL.
    pub fn on_subscriber_gone(&self, session_id: &str) {
        let session = match self.sessions.lock().get(session_id) {
            Some(session) => session.clone(),
            None => return,
        };

        session.prune_closed();
        // The subscriber lock must be released before expire() re-locks it
        let drained = session.subscribers.lock().is_empty()
            && session.delivered.load(Ordering::SeqCst) > 0;
        if drained && self.expire(session_id) {
            tracing::info!(session_id, "signaling session drained after final message");
        }
    }

    /// Removes the session, cancels its TTL timer, and closes every
    /// subscriber stream. Returns whether the session was still live.
    pub fn expire(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.lock().remove(session_id) else {
            return false;
        };
        tracing::debug!(
            session_id,
            age_secs = session.created_at.elapsed().as_secs(),
            delivered = session.delivered.load(Ordering::SeqCst),
            "closing signaling session"
        );
        session.close();
        true
    }

    pub fn shutdown(&self) {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        for (session_id, session) in drained {
            tracing::debug!(session_id = %session_id, "closing signaling session on shutdown");
            session.close();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn authorized(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<Arc<SignalSession>, SignalingError> {
        let session = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or(SignalingError::NotFound)?;

        if !digests_match(&token_digest(token), &session.token_digest) {
            return Err(SignalingError::Unauthorized);
        }
        Ok(session)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn token_digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Fixed-length fold over all 32 bytes with no early exit, and the inputs
/// are digests rather than raw tokens, so the comparison leaks nothing
/// about the secret.
fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    fn test_map(ttl: Duration) -> Arc<SessionMap> {
        Arc::new(SessionMap::with_ttl(ttl, json!([{ "urls": ["stun:test"] }])))
    }

    #[test]
    fn digest_comparison_matches_equality() {
        let a = token_digest("token-a");
        assert!(digests_match(&a, &token_digest("token-a")));
        assert!(!digests_match(&a, &token_digest("token-b")));
        // Differing only in the last byte still mismatches
        let mut b = a;
        b[31] ^= 1;
        assert!(!digests_match(&a, &b));
    }

    #[tokio::test]
    async fn tokens_are_long_and_unique() {
        let map = test_map(Duration::from_secs(60));
        let a = map.create();
        let b = map.create();
        // 32 bytes hex-encoded: 256 bits of entropy
        assert_eq!(a.token.len(), 64);
        assert_ne!(a.token, b.token);
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.ttl_seconds, 60);
    }

    #[tokio::test]
    async fn signal_reaches_every_subscriber() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();

        let mut first = map.subscribe(&created.session_id, &created.token).unwrap();
        let mut second = map.subscribe(&created.session_id, &created.token).unwrap();

        let reached = map
            .signal(&created.session_id, &created.token, json!({"sdp": "offer"}))
            .await
            .unwrap();
        assert_eq!(reached, 2);

        assert_eq!(first.recv().await.unwrap()["sdp"], "offer");
        assert_eq!(second.recv().await.unwrap()["sdp"], "offer");
    }

    #[tokio::test]
    async fn auth_failures_are_loud() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();

        assert_eq!(
            map.subscribe(&created.session_id, "wrong-token").unwrap_err(),
            SignalingError::Unauthorized
        );
        assert_eq!(
            map.signal("no-such-session", &created.token, json!({}))
                .await
                .unwrap_err(),
            SignalingError::NotFound
        );
    }

    #[tokio::test]
    async fn third_concurrent_subscriber_is_rejected() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();

        let _first = map.subscribe(&created.session_id, &created.token).unwrap();
        let _second = map.subscribe(&created.session_id, &created.token).unwrap();
        assert_eq!(
            map.subscribe(&created.session_id, &created.token).unwrap_err(),
            SignalingError::SubscriberLimit
        );
    }

    #[tokio::test]
    async fn slot_frees_up_after_a_subscriber_drops() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();

        let first = map.subscribe(&created.session_id, &created.token).unwrap();
        let _second = map.subscribe(&created.session_id, &created.token).unwrap();
        drop(first);

        assert!(map.subscribe(&created.session_id, &created.token).is_ok());
    }

    #[tokio::test]
    async fn ttl_expiry_removes_the_session_and_closes_streams() {
        let map = test_map(Duration::from_millis(50));
        let created = map.create();
        let mut rx = map.subscribe(&created.session_id, &created.token).unwrap();

        sleep(Duration::from_millis(200)).await;

        assert!(map.is_empty());
        assert!(rx.recv().await.is_none());
        assert_eq!(
            map.signal(&created.session_id, &created.token, json!({}))
                .await
                .unwrap_err(),
            SignalingError::NotFound
        );
    }

    #[tokio::test]
    async fn session_drains_after_traffic_when_last_subscriber_leaves() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();

        let rx = map.subscribe(&created.session_id, &created.token).unwrap();
        map.signal(&created.session_id, &created.token, json!({"fin": true}))
            .await
            .unwrap();

        drop(rx);
        map.on_subscriber_gone(&created.session_id);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn idle_session_survives_subscriber_churn() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();

        let rx = map.subscribe(&created.session_id, &created.token).unwrap();
        drop(rx);
        // No signal was ever carried: the session waits for its TTL
        map.on_subscriber_gone(&created.session_id);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let map = test_map(Duration::from_secs(60));
        let created = map.create();
        let mut rx = map.subscribe(&created.session_id, &created.token).unwrap();

        map.shutdown();
        assert!(map.is_empty());
        assert!(rx.recv().await.is_none());
    }
}
