//! Session persistence
//!
//! Sessions and settings are upserted by key; the execution log is
//! append-only. Leases give one process at a time the right to write a
//! session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::executor::ExecutionRecord;

use super::types::{Session, SessionSettings};

/// Storage collaborator
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, session: &Session) -> Result<()>;

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Non-terminal session for (user, asset), if any
    async fn find_active(&self, user_id: &str, asset_id: &str) -> Result<Option<Session>>;

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>>;

    async fn save_settings(&self, user_id: &str, asset_id: &str, settings: &SessionSettings) -> Result<()>;

    async fn load_settings(&self, user_id: &str, asset_id: &str) -> Result<Option<SessionSettings>>;

    async fn append_executions(&self, records: &[ExecutionRecord]) -> Result<()>;

    async fn load_executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>>;

    /// Take or renew the write lease; false while another owner holds it
    async fn try_acquire_lease(&self, session_id: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, session_id: &str, owner: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn new(owner: &str, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self {
            owner: owner.to_string(),
            expires_at: Utc::now() + ttl,
        }
    }

    fn available_to(&self, owner: &str) -> bool {
        self.owner == owner || self.expires_at <= Utc::now()
    }
}

fn settings_key(user_id: &str, asset_id: &str) -> String {
    format!("{}__{}", user_id, asset_id)
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Session>,
    settings: DashMap<String, SessionSettings>,
    executions: DashMap<String, Vec<ExecutionRecord>>,
    leases: DashMap<String, Lease>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn find_active(&self, user_id: &str, asset_id: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .iter()
            .find(|s| s.user_id == user_id && s.asset_id == asset_id && s.status.is_active())
            .map(|s| s.value().clone()))
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| user_id.map_or(true, |u| s.user_id == u))
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn save_settings(&self, user_id: &str, asset_id: &str, settings: &SessionSettings) -> Result<()> {
        self.settings.insert(settings_key(user_id, asset_id), settings.clone());
        Ok(())
    }

    async fn load_settings(&self, user_id: &str, asset_id: &str) -> Result<Option<SessionSettings>> {
        Ok(self.settings.get(&settings_key(user_id, asset_id)).map(|s| s.value().clone()))
    }

    async fn append_executions(&self, records: &[ExecutionRecord]) -> Result<()> {
        for record in records {
            self.executions
                .entry(record.session_id.clone())
                .or_default()
                .push(record.clone());
        }
        Ok(())
    }

    async fn load_executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
        Ok(self.executions.get(session_id).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn try_acquire_lease(&self, session_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut entry = self
            .leases
            .entry(session_id.to_string())
            .or_insert_with(|| Lease::new(owner, ttl));
        if !entry.available_to(owner) {
            return Ok(false);
        }
        *entry = Lease::new(owner, ttl);
        Ok(true)
    }

    async fn release_lease(&self, session_id: &str, owner: &str) -> Result<()> {
        self.leases.remove_if(session_id, |_, lease| lease.owner == owner);
        Ok(())
    }
}

/// JSON files under one directory
///
/// ```text
/// <root>/sessions/<id>.json
/// <root>/settings/<user>__<asset>.json
/// <root>/executions/<session>.jsonl
/// <root>/leases/<session>.json
/// ```
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create the directory layout if missing
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["sessions", "settings", "executions", "leases"] {
            tokio::fs::create_dir_all(root.join(dir))
                .await
                .map_err(|e| Error::Persistence(format!("Failed to create {}: {}", root.join(dir).display(), e)))?;
        }
        debug!(root = %root.display(), "Session store opened");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{}.json", sanitize(session_id)))
    }

    fn settings_path(&self, user_id: &str, asset_id: &str) -> PathBuf {
        self.root
            .join("settings")
            .join(format!("{}.json", sanitize(&settings_key(user_id, asset_id))))
    }

    fn executions_path(&self, session_id: &str) -> PathBuf {
        self.root.join("executions").join(format!("{}.jsonl", sanitize(session_id)))
    }

    fn lease_path(&self, session_id: &str) -> PathBuf {
        self.root.join("leases").join(format!("{}.json", sanitize(session_id)))
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Persistence(format!("Failed to encode {}: {}", path.display(), e)))?;
        // Readers only ever see complete files
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to replace {}: {}", path.display(), e)))
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Persistence(format!("Corrupt record {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Persistence(format!("Failed to read {}: {}", path.display(), e))),
        }
    }

    async fn all_sessions(&self) -> Result<Vec<Session>> {
        let dir = self.root.join("sessions");
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to list {}: {}", dir.display(), e)))?;

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Persistence(format!("Failed to list {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_json::<Session>(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable session file"),
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }
}

/// Keep keys usable as file names
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_json(&self.session_path(&session.id), session).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.read_json(&self.session_path(session_id)).await
    }

    async fn find_active(&self, user_id: &str, asset_id: &str) -> Result<Option<Session>> {
        Ok(self
            .all_sessions()
            .await?
            .into_iter()
            .find(|s| s.user_id == user_id && s.asset_id == asset_id && s.status.is_active()))
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        Ok(self
            .all_sessions()
            .await?
            .into_iter()
            .filter(|s| user_id.map_or(true, |u| s.user_id == u))
            .collect())
    }

    async fn save_settings(&self, user_id: &str, asset_id: &str, settings: &SessionSettings) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_json(&self.settings_path(user_id, asset_id), settings).await
    }

    async fn load_settings(&self, user_id: &str, asset_id: &str) -> Result<Option<SessionSettings>> {
        self.read_json(&self.settings_path(user_id, asset_id)).await
    }

    async fn append_executions(&self, records: &[ExecutionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut by_session: std::collections::BTreeMap<&str, Vec<u8>> = std::collections::BTreeMap::new();
        for record in records {
            let buf = by_session.entry(record.session_id.as_str()).or_default();
            serde_json::to_writer(&mut *buf, record)
                .map_err(|e| Error::Persistence(format!("Failed to encode execution: {}", e)))?;
            buf.push(b'\n');
        }

        for (session_id, lines) in by_session {
            let path = self.executions_path(session_id);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| Error::Persistence(format!("Failed to open {}: {}", path.display(), e)))?;
            file.write_all(&lines)
                .await
                .map_err(|e| Error::Persistence(format!("Failed to append {}: {}", path.display(), e)))?;
            file.flush()
                .await
                .map_err(|e| Error::Persistence(format!("Failed to flush {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    async fn load_executions(&self, session_id: &str) -> Result<Vec<ExecutionRecord>> {
        let path = self.executions_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Persistence(format!("Failed to read {}: {}", path.display(), e))),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| Error::Persistence(format!("Corrupt execution line in {}: {}", path.display(), e)))
            })
            .collect()
    }

    async fn try_acquire_lease(&self, session_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let path = self.lease_path(session_id);
        if let Some(current) = self.read_json::<Lease>(&path).await? {
            if !current.available_to(owner) {
                return Ok(false);
            }
        }
        self.write_json(&path, &Lease::new(owner, ttl)).await?;
        Ok(true)
    }

    async fn release_lease(&self, session_id: &str, owner: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.lease_path(session_id);
        match self.read_json::<Lease>(&path).await? {
            Some(lease) if lease.owner == owner => tokio::fs::remove_file(&path)
                .await
                .map_err(|e| Error::Persistence(format!("Failed to remove {}: {}", path.display(), e))),
            _ => Ok(()),
        }
    }
}
