//! Registry of live relay sessions.
//!
//! Enforces the session limit and lets the server report what is still
//! running at shutdown. Each session registers once when accepted and
//! unregisters once when its teardown finishes.

use super::Flavor;
use apprelay_core::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct SessionRecord {
    flavor: Flavor,
    target: Option<String>,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub flavor: Flavor,
    pub target: Option<String>,
    pub started_at: DateTime<Utc>,
    pub age_secs: u64,
}

pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Register a new session, returning its id.
    pub async fn register(&self, flavor: Flavor, target: Option<String>) -> RelayResult<String> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(RelayError::Other(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }
        let id = generate_session_id();
        sessions.insert(
            id.clone(),
            SessionRecord {
                flavor,
                target,
                started: Instant::now(),
                started_at: Utc::now(),
            },
        );
        info!(session_id = %id, ?flavor, active = sessions.len(), "session registered");
        Ok(id)
    }

    /// Record the target once it is known (desktop sessions learn it late).
    pub async fn set_target(&self, id: &str, target: String) {
        if let Some(record) = self.sessions.write().await.get_mut(id) {
            record.target = Some(target);
        }
    }

    /// Remove a session. Returns false if it was not registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.remove(id) {
            Some(record) => {
                debug!(
                    session_id = %id,
                    age_secs = record.started.elapsed().as_secs(),
                    "session unregistered"
                );
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, r)| SessionInfo {
                id: id.clone(),
                flavor: r.flavor,
                target: r.target.clone(),
                started_at: r.started_at,
                age_secs: r.started.elapsed().as_secs(),
            })
            .collect()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Generate a random session ID (hex-encoded 16 bytes).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_limit_and_unregisters_once() {
        let registry = SessionRegistry::new(2);
        let a = registry.register(Flavor::ShellTerminal, Some("n1".into())).await.unwrap();
        let _b = registry.register(Flavor::FileTransfer, None).await.unwrap();
        assert!(registry.register(Flavor::RemoteDesktop, None).await.is_err());

        assert!(registry.unregister(&a).await);
        assert!(!registry.unregister(&a).await);
        assert_eq!(registry.count().await, 1);
        assert!(registry.register(Flavor::RemoteDesktop, None).await.is_ok());
    }

    #[tokio::test]
    async fn late_target() {
        let registry = SessionRegistry::new(4);
        let id = registry.register(Flavor::RemoteDesktop, None).await.unwrap();
        registry.set_target(&id, "node//x".into()).await;
        let list = registry.list().await;
        assert_eq!(list[0].target.as_deref(), Some("node//x"));
        assert_eq!(list[0].id.len(), 32);
    }
}
