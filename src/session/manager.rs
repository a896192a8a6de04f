//! # Session Manager
//!
//! Keeps the REST-created purity sessions, enforces the concurrent session
//! limit and evicts sessions that have been idle too long.
//!
//! ## Thread Safety:
//! The map sits behind an `RwLock`; each session has its own `Mutex`, so
//! frames for different sessions are processed in parallel. A session mutex
//! can be held for a whole frame; [`SessionManager::summary`] waits on each
//! one and belongs on a blocking thread, while eviction skips sessions that
//! are busy.

use crate::config::AppConfig;
use crate::confirmation::Stage;
use crate::session::{PuritySession, SessionServices};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const SESSION_ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("maximum concurrent sessions ({0}) reached")]
    LimitReached(usize),

    #[error("session '{0}' already exists")]
    AlreadyExists(String),

    #[error("session '{0}' not found")]
    NotFound(String),
}

/// A session handle shared between the map and in-flight requests.
pub type SharedSession = Arc<Mutex<PuritySession>>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    /// Configured `max_concurrent_sessions`
    pub max_sessions: usize,
    /// Number of sessions currently in each stage; stages with none are absent
    pub stage_counts: HashMap<Stage, usize>,
}

/// Owner of every REST-created session, keyed by session id.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SharedSession>>,
    services: SessionServices,
}

impl SessionManager {
    pub fn new(services: SessionServices) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            services,
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Create a session with the current config.
    ///
    /// `session_id` defaults to the first 8 characters of a fresh UUID.
    pub fn create_session(
        &self,
        session_id: Option<String>,
        item_index: Option<u32>,
        config: &AppConfig,
    ) -> Result<(String, SharedSession), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let limit = config.performance.max_concurrent_sessions;
        if sessions.len() >= limit {
            return Err(SessionError::LimitReached(limit));
        }

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..SESSION_ID_LEN].to_string());
        if sessions.contains_key(&session_id) {
            return Err(SessionError::AlreadyExists(session_id));
        }

        let mut session = PuritySession::new(session_id.clone(), &self.services, config);
        if let Some(index) = item_index {
            session.set_item_index(index);
        }

        let shared = Arc::new(Mutex::new(session));
        sessions.insert(session_id.clone(), Arc::clone(&shared));
        info!(session_id = %session_id, active = sessions.len(), "Session created");

        Ok((session_id, shared))
    }

    /// Shared handle to a session. The caller locks it for as long as it needs.
    pub fn get_session(&self, session_id: &str) -> Result<SharedSession, SessionError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn remove_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.remove(session_id).is_none() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        info!(session_id = %session_id, "Session removed");
        Ok(())
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Ids of every live session, sorted.
    pub fn active_session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop sessions idle for longer than `max_idle`. Returns how many went.
    ///
    /// A session locked by a request in progress is not idle and is kept.
    pub fn cleanup_idle_sessions(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| match session.try_lock() {
            Ok(session) => session.idle_for() <= max_idle,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().idle_for() <= max_idle,
            Err(TryLockError::WouldBlock) => true,
        });

        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Evicted idle sessions");
        }
        removed
    }

    /// Count sessions per stage. Locks each session in turn, so it can wait
    /// behind a frame in progress.
    pub fn summary(&self, max_sessions: usize) -> SessionManagerSummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut stage_counts = HashMap::new();
        for session in sessions.values() {
            let stage = session.lock().unwrap_or_else(PoisonError::into_inner).stage();
            *stage_counts.entry(stage).or_insert(0) += 1;
        }

        SessionManagerSummary {
            total_sessions: sessions.len(),
            max_sessions,
            stage_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::rubbing::tests::RubbingScene;
    use std::thread;

    fn manager() -> SessionManager {
        let scene = Arc::new(RubbingScene::new((50.0, 50.0, 150.0, 150.0)));
        SessionManager::new(SessionServices {
            detector: scene,
            classifier: None,
        })
    }

    fn config_with_limit(limit: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = limit;
        config
    }

    #[test]
    fn test_create_and_lookup() {
        let manager = manager();
        let config = AppConfig::default();
        let (id, _) = manager.create_session(None, Some(4), &config).unwrap();
        assert_eq!(id.len(), 8);

        let session = manager.get_session(&id).unwrap();
        assert_eq!(session.lock().unwrap().item_index(), 4);
        assert_eq!(manager.active_session_count(), 1);

        assert_eq!(
            manager.create_session(Some(id.clone()), None, &config).err(),
            Some(SessionError::AlreadyExists(id.clone()))
        );

        manager.remove_session(&id).unwrap();
        assert_eq!(manager.get_session(&id).err(), Some(SessionError::NotFound(id.clone())));
        assert!(manager.remove_session(&id).is_err());
    }

    #[test]
    fn test_session_limit() {
        let manager = manager();
        let config = config_with_limit(2);
        manager.create_session(None, None, &config).unwrap();
        manager.create_session(None, None, &config).unwrap();
        assert_eq!(
            manager.create_session(None, None, &config).err(),
            Some(SessionError::LimitReached(2))
        );
    }

    #[test]
    fn test_idle_cleanup() {
        let manager = manager();
        let config = AppConfig::default();
        let (stale, _) = manager.create_session(Some("stale".into()), None, &config).unwrap();
        thread::sleep(Duration::from_millis(30));
        let (fresh, _) = manager.create_session(Some("fresh".into()), None, &config).unwrap();

        assert_eq!(manager.cleanup_idle_sessions(Duration::from_millis(20)), 1);
        assert!(manager.get_session(&stale).is_err());
        assert!(manager.get_session(&fresh).is_ok());
    }

    #[test]
    fn test_cleanup_skips_busy_sessions() {
        let manager = manager();
        let config = AppConfig::default();
        let (busy, session) = manager.create_session(Some("busy".into()), None, &config).unwrap();
        manager.create_session(Some("stale".into()), None, &config).unwrap();
        thread::sleep(Duration::from_millis(30));

        let _processing = session.lock().unwrap();
        assert_eq!(manager.cleanup_idle_sessions(Duration::from_millis(20)), 1);
        assert!(manager.get_session(&busy).is_ok());
        assert!(manager.get_session("stale").is_err());
    }

    #[test]
    fn test_summary_counts_stages() {
        let manager = manager();
        let config = AppConfig::default();
        manager.create_session(None, None, &config).unwrap();
        manager.create_session(None, None, &config).unwrap();

        let summary = manager.summary(10);
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.stage_counts.get(&Stage::Rubbing), Some(&2));
    }
}
