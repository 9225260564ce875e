//! In-memory session and file-index registry.

use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use uuid::Uuid;

pub const WORKING_DIRECTORY: &str = "/mnt/data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    #[serde(serialize_with = "crate::timestamp::as_epoch_secs")]
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(serialize_with = "crate::timestamp::as_epoch_secs")]
    pub created_at: SystemTime,
    #[serde(serialize_with = "crate::timestamp::as_epoch_secs")]
    pub last_activity: SystemTime,
    #[serde(serialize_with = "crate::timestamp::as_epoch_secs")]
    pub expires_at: SystemTime,
    pub pod_name: Option<String>,
    pub files: HashMap<String, FileInfo>,
    pub working_directory: String,
}

impl Session {
    fn new(ttl: Duration) -> Self {
        let now = SystemTime::now();
        Session {
            session_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
            pod_name: None,
            files: HashMap::new(),
            working_directory: WORKING_DIRECTORY.to_string(),
        }
    }
}

/// In-memory session/file registry. Not durable: a separate persistence
/// tier is expected to mirror changes out of band.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()), ttl })
    }

    pub async fn create(&self) -> Session {
        let session = Session::new(self.ttl);
        self.sessions.write().await.insert(session.session_id.clone(), session.clone());
        session
    }

    /// Checks expiry on every access rather than only in the periodic
    /// sweep, so a request arriving just past TTL sees `SessionExpired`
    /// instead of a session the sweep simply hasn't gotten to yet.
    pub async fn get(&self, session_id: &str) -> CoreResult<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get(session_id).ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        if session.expires_at <= SystemTime::now() {
            sessions.remove(session_id);
            return Err(CoreError::SessionExpired(session_id.to_string()));
        }
        Ok(session.clone())
    }

    /// Updates `last_activity`; every mutation in this module routes
    /// through this so the invariant holds without repeating it everywhere.
    pub async fn touch(&self, session_id: &str) -> CoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        if session.expires_at <= SystemTime::now() {
            sessions.remove(session_id);
            return Err(CoreError::SessionExpired(session_id.to_string()));
        }
        session.last_activity = SystemTime::now();
        Ok(())
    }

    pub async fn register_file(&self, session_id: &str, file: FileInfo) -> CoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        session.files.insert(file.filename.clone(), file);
        session.last_activity = SystemTime::now();
        Ok(())
    }

    pub async fn list_files(&self, session_id: &str) -> CoreResult<Vec<FileInfo>> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        Ok(session.files.values().cloned().collect())
    }

    pub async fn get_file(&self, session_id: &str, file_id: &str) -> CoreResult<FileInfo> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        session
            .files
            .values()
            .find(|f| f.id == file_id)
            .cloned()
            .ok_or_else(|| CoreError::InputFileError { id: file_id.to_string(), cause: "not found in session".to_string() })
    }

    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = SystemTime::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions.iter().filter(|(_, s)| s.expires_at <= now).map(|(id, _)| id.clone()).collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_updates_last_activity_on_every_mutation() {
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let session = registry.create().await;
        let first = registry.get(&session.session_id).await.unwrap().last_activity;

        tokio::time::sleep(Duration::from_millis(5)).await;
        registry
            .register_file(&session.session_id, FileInfo {
                id: "f1".into(),
                filename: "out.txt".into(),
                size: 3,
                mime: "text/plain".into(),
                created_at: SystemTime::now(),
            })
            .await
            .unwrap();

        let second = registry.get(&session.session_id).await.unwrap().last_activity;
        assert!(second > first);
    }

    #[tokio::test]
    async fn get_on_unknown_session_is_session_not_found() {
        let registry = SessionRegistry::new(Duration::from_secs(300));
        let err = registry.get("missing").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let registry = SessionRegistry::new(Duration::from_millis(1));
        let session = registry.create().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let expired = registry.sweep_expired().await;
        assert_eq!(expired, vec![session.session_id]);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn get_on_expired_session_is_session_expired_and_evicts_it() {
        let registry = SessionRegistry::new(Duration::from_millis(1));
        let session = registry.create().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = registry.get(&session.session_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SessionExpired);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn touch_on_expired_session_is_session_expired() {
        let registry = SessionRegistry::new(Duration::from_millis(1));
        let session = registry.create().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = registry.touch(&session.session_id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SessionExpired);
    }
}
