//! Session registry

use crate::command::refspec::is_valid_ref_name;
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered and usable
    Active,
    /// Deregistered; in-flight work is being cancelled
    Terminated,
}

/// A registered sandbox session.
///
/// All identity fields are private and set once at registration, so no code
/// path can re-point a live session at a different branch.
#[derive(Debug)]
pub struct Session {
    id: String,
    assigned_branch: String,
    source_addr: Option<IpAddr>,
    created_at: i64,
    cancel: CancellationToken,
}

impl Session {
    fn new(id: String, assigned_branch: String, source_addr: Option<IpAddr>) -> Self {
        Self {
            id,
            assigned_branch,
            source_addr,
            created_at: chrono::Utc::now().timestamp_millis(),
            cancel: CancellationToken::new(),
        }
    }

    /// Session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The only branch this session may write to
    pub fn assigned_branch(&self) -> &str {
        &self.assigned_branch
    }

    /// Source address used to attribute intercepted traffic
    pub fn source_addr(&self) -> Option<IpAddr> {
        self.source_addr
    }

    /// Creation timestamp (unix millis)
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            SessionState::Terminated
        } else {
            SessionState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Resolves once the session has been deregistered.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token that fires on deregistration, for work that outlives a borrow.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            branch: self.assigned_branch.clone(),
            source_addr: self.source_addr,
            created_at: self.created_at,
            state: self.state(),
        }
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub branch: String,
    pub source_addr: Option<IpAddr>,
    pub created_at: i64,
    pub state: SessionState,
}

/// Session manager
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Session IDs indexed by source address
    by_addr: RwLock<HashMap<IpAddr, String>>,
}

impl SessionManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_addr: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session. Fails if the ID or source address is taken or the
    /// branch name is not a valid ref name.
    pub async fn register(
        &self,
        session_id: &str,
        branch: &str,
        source_addr: Option<IpAddr>,
    ) -> Result<Arc<Session>> {
        if session_id.is_empty() {
            return Err(Error::Session("session id must not be empty".to_string()));
        }
        if !is_valid_ref_name(branch) {
            return Err(Error::Session(format!("invalid branch name '{}'", branch)));
        }
        // Lookups canonicalize, so `::ffff:a.b.c.d` and `a.b.c.d` are one key
        let source_addr = source_addr.map(|addr| addr.to_canonical());

        let mut sessions = self.sessions.write().await;
        let mut by_addr = self.by_addr.write().await;

        if sessions.contains_key(session_id) {
            return Err(Error::Session(format!(
                "session '{}' is already registered",
                session_id
            )));
        }
        if let Some(addr) = source_addr {
            if let Some(owner) = by_addr.get(&addr) {
                return Err(Error::Session(format!(
                    "source address {} already belongs to session '{}'",
                    addr, owner
                )));
            }
            by_addr.insert(addr, session_id.to_string());
        }

        let session = Arc::new(Session::new(
            session_id.to_string(),
            branch.to_string(),
            source_addr,
        ));
        sessions.insert(session_id.to_string(), session.clone());

        tracing::info!(
            session = %session_id,
            branch = %branch,
            addr = ?source_addr,
            "Registered session"
        );

        Ok(session)
    }

    /// Deregister a session, cancelling all of its in-flight work.
    pub async fn deregister(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(session_id)?;
        if let Some(addr) = session.source_addr() {
            self.by_addr.write().await.remove(&addr);
        }
        session.cancel.cancel();

        tracing::info!(
            session = %session_id,
            branch = %session.assigned_branch(),
            "Deregistered session"
        );

        Some(session)
    }

    /// Get session by ID
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Get the session owning a source address
    pub async fn by_addr(&self, addr: IpAddr) -> Option<Arc<Session>> {
        let session_id = self.by_addr.read().await.get(&addr.to_canonical())?.clone();
        self.get(&session_id).await
    }

    /// Whether the session is still registered and active.
    pub async fn is_live(&self, session: &Session) -> bool {
        session.is_active() && self.sessions.read().await.contains_key(session.id())
    }

    /// All registered sessions
    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Deregister every session (shutdown).
    pub async fn deregister_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.deregister(&id).await.is_some() {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = SessionManager::new();
        let addr: IpAddr = "10.0.0.7".parse().unwrap();

        let session = manager
            .register("s1", "feature-a", Some(addr))
            .await
            .unwrap();
        assert_eq!(session.assigned_branch(), "feature-a");
        assert!(session.is_active());

        assert_eq!(manager.get("s1").await.unwrap().id(), "s1");
        assert_eq!(manager.by_addr(addr).await.unwrap().id(), "s1");
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_mapped_address_registration_canonicalized() {
        let manager = SessionManager::new();
        let mapped: IpAddr = "::ffff:10.0.0.7".parse().unwrap();
        let plain: IpAddr = "10.0.0.7".parse().unwrap();

        let session = manager.register("s1", "a", Some(mapped)).await.unwrap();
        assert_eq!(session.source_addr(), Some(plain));
        assert_eq!(manager.by_addr(plain).await.unwrap().id(), "s1");
        assert_eq!(manager.by_addr(mapped).await.unwrap().id(), "s1");
        // Both spellings name the same source
        assert!(manager.register("s2", "b", Some(plain)).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = SessionManager::new();
        manager.register("s1", "feature-a", None).await.unwrap();

        let err = manager.register("s1", "feature-b", None).await;
        assert!(err.is_err());
        // The original assignment is untouched
        assert_eq!(
            manager.get("s1").await.unwrap().assigned_branch(),
            "feature-a"
        );
    }

    #[tokio::test]
    async fn test_address_collision_rejected() {
        let manager = SessionManager::new();
        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        manager.register("s1", "a", Some(addr)).await.unwrap();
        assert!(manager.register("s2", "b", Some(addr)).await.is_err());
        assert!(manager.get("s2").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_branch_rejected() {
        let manager = SessionManager::new();
        assert!(manager.register("s1", "bad..name", None).await.is_err());
        assert!(manager.register("s1", "", None).await.is_err());
        assert!(manager.register("", "main", None).await.is_err());
    }

    #[tokio::test]
    async fn test_deregister_cancels() {
        let manager = SessionManager::new();
        let addr: IpAddr = "10.0.0.9".parse().unwrap();
        let session = manager.register("s1", "a", Some(addr)).await.unwrap();
        let token = session.cancellation_token();

        assert!(manager.is_live(&session).await);
        manager.deregister("s1").await.unwrap();

        assert!(token.is_cancelled());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!manager.is_live(&session).await);
        assert!(manager.by_addr(addr).await.is_none());
        assert!(manager.deregister("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_deregister_all() {
        let manager = SessionManager::new();
        manager.register("s1", "a", None).await.unwrap();
        manager.register("s2", "b", None).await.unwrap();
        assert_eq!(manager.deregister_all().await, 2);
        assert_eq!(manager.count().await, 0);
    }
}
