use crate::provider::RuntimeOptions;
use crate::shared::errors::StoreError;
use crate::shared::fs_atomic::{read_json_optional, write_json_atomic};
use crate::shared::ids::validate_identifier_value;
use crate::shared::logging::EventLog;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Per-session metadata kept next to the session gateway. A session is owned
/// by at most one workflow run at a time, recorded in `workflow_run_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub worktree_id: String,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub dismissed_at: Option<i64>,
    #[serde(default)]
    pub last_active_at: Option<i64>,
    #[serde(default)]
    pub runtime_options: Option<RuntimeOptions>,
}

impl SessionMeta {
    pub fn new(
        session_id: impl Into<String>,
        workspace_id: impl Into<String>,
        worktree_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            workspace_id: workspace_id.into(),
            worktree_id: worktree_id.into(),
            ..Self::default()
        }
    }

    /// The owning run id, ignoring blank values.
    pub fn owned_run_id(&self) -> Option<&str> {
        self.workflow_run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn is_owned_by(&self, run_id: &str) -> bool {
        self.owned_run_id() == Some(run_id)
    }
}

pub trait SessionMetaStore: Send + Sync {
    fn list(&self) -> Result<Vec<SessionMeta>, StoreError>;
    fn get(&self, session_id: &str) -> Result<Option<SessionMeta>, StoreError>;
    fn upsert(&self, meta: &SessionMeta) -> Result<(), StoreError>;
    fn delete(&self, session_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileSessionMetaStore {
    state_root: PathBuf,
    log: EventLog,
}

impl FileSessionMetaStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        let state_root = state_root.into();
        Self {
            log: EventLog::new(&state_root),
            state_root,
        }
    }

    fn meta_dir(&self) -> PathBuf {
        self.state_root.join("sessions/meta")
    }

    fn meta_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_identifier_value("session id", session_id).map_err(|reason| {
            StoreError::InvalidKey {
                key: session_id.to_string(),
                reason,
            }
        })?;
        Ok(self.meta_dir().join(format!("{session_id}.json")))
    }
}

impl SessionMetaStore for FileSessionMetaStore {
    fn list(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let dir = self.meta_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::read(&dir, source)),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::read(&dir, source))?;
            let path = entry.path();
            if is_json_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        // Unreadable records are skipped, not fatal.
        let mut metas = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json_optional::<SessionMeta>(&path) {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(err) => self.log.warn("sessions.meta_skipped", err.to_string()),
            }
        }
        Ok(metas)
    }

    fn get(&self, session_id: &str) -> Result<Option<SessionMeta>, StoreError> {
        read_json_optional(&self.meta_path(session_id)?)
    }

    fn upsert(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        write_json_atomic(&self.meta_path(&meta.session_id)?, meta)
    }

    fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let path = self.meta_path(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Delete {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

pub(crate) fn is_json_file(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|value| value.to_str()) == Some("json")
}
