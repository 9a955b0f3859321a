//! Flat-file persistence of committed sessions
//!
//! Layout in the data directory:
//! - `{id}_raw.npy` and `{id}_env.npy`: `(rows, channels)` f64 arrays
//! - `{id}_meta.json`: optional `{label, notes}`
//!
//! Every file is written to a temporary sibling and renamed into place. The
//! raw array marks a session as saved, so it is renamed last and a save that
//! fails partway removes whatever it already put down. Saves hold the store's
//! write lock and reads its read lock, so a reader never sees the raw array
//! of one save next to the envelope of another.

use crate::npy::{persist_to, read_npy_file, write_npy_temp};
use emg_core::{EmgError, EmgResult, SessionId, SessionMetadata, SessionSummary, SignalMatrix};
use parking_lot::RwLock;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const RAW_SUFFIX: &str = "_raw.npy";
const ENV_SUFFIX: &str = "_env.npy";
const META_SUFFIX: &str = "_meta.json";

/// A saved session read back from disk
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub raw: SignalMatrix,
    pub env: SignalMatrix,
}

pub struct SessionStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl SessionStore {
    /// Open (creating if needed) the store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> EmgResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            EmgError::storage(format!("cannot create data directory {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root,
            lock: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, id: &SessionId, suffix: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, suffix))
    }

    /// True if a raw array has been saved under `id`
    pub fn exists(&self, id: &SessionId) -> bool {
        self.path(id, RAW_SUFFIX).is_file()
    }

    /// Persist both arrays, overwriting any earlier save of `id`
    pub fn save(&self, id: &SessionId, raw: &SignalMatrix, env: &SignalMatrix) -> EmgResult<()> {
        self.save_session(id, raw, env, None)
    }

    /// Persist both arrays and, when given, the metadata record
    pub fn save_session(
        &self,
        id: &SessionId,
        raw: &SignalMatrix,
        env: &SignalMatrix,
        metadata: Option<&SessionMetadata>,
    ) -> EmgResult<()> {
        if raw.shape() != env.shape() {
            return Err(EmgError::ShapeMismatch {
                expected: format!("{:?}", raw.shape()),
                actual: format!("{:?}", env.shape()),
            });
        }

        let _guard = self.lock.write();
        let raw_tmp = write_npy_temp(&self.root, raw)?;
        let env_tmp = write_npy_temp(&self.root, env)?;
        let meta_tmp = metadata.map(|m| self.metadata_temp(m)).transpose()?;

        if let Err(e) = self.commit(id, raw_tmp, env_tmp, meta_tmp) {
            self.remove_partial(id);
            return Err(e);
        }

        debug!(session_id = %id, rows = raw.rows(), channels = raw.channel_count(), "Session written");
        Ok(())
    }

    /// Write the metadata record on its own
    pub fn save_metadata(&self, id: &SessionId, metadata: &SessionMetadata) -> EmgResult<()> {
        let _guard = self.lock.write();
        self.write_metadata(id, metadata)
    }

    /// Merge label/notes into a saved session's metadata; `NotFound` if not saved
    pub fn update_metadata(
        &self,
        id: &SessionId,
        label: Option<String>,
        notes: Option<String>,
    ) -> EmgResult<SessionMetadata> {
        let _guard = self.lock.write();
        if !self.exists(id) {
            return Err(EmgError::not_found(id.as_str()));
        }

        let mut metadata = self.read_metadata(id).unwrap_or_default();
        if let Some(label) = label {
            metadata.label = label;
        }
        if let Some(notes) = notes {
            metadata.notes = notes;
        }
        self.write_metadata(id, &metadata)?;
        Ok(metadata)
    }

    pub fn load_metadata(&self, id: &SessionId) -> Option<SessionMetadata> {
        let _guard = self.lock.read();
        self.read_metadata(id)
    }

    /// Saved sessions, newest first
    pub fn list(&self) -> EmgResult<Vec<SessionSummary>> {
        let _guard = self.lock.read();

        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            EmgError::storage(format!("cannot read data directory {}: {}", self.root.display(), e))
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(RAW_SUFFIX)) else {
                continue;
            };
            match SessionId::parse(stem) {
                Ok(id) => ids.push(id),
                Err(_) => debug!(file = stem, "Skipping file with invalid session id"),
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));

        Ok(ids
            .into_iter()
            .map(|id| {
                let metadata = self.read_metadata(&id).unwrap_or_default();
                SessionSummary {
                    id,
                    label: metadata.label,
                    notes: metadata.notes,
                }
            })
            .collect())
    }

    /// Every `decimation`-th row of both arrays; values below 1 mean every row
    pub fn load(&self, id: &SessionId, decimation: i64) -> EmgResult<StoredSession> {
        let _guard = self.lock.read();

        let raw_path = self.path(id, RAW_SUFFIX);
        let env_path = self.path(id, ENV_SUFFIX);
        if !raw_path.is_file() || !env_path.is_file() {
            return Err(EmgError::not_found(id.as_str()));
        }

        let raw = read_npy_file(&raw_path)?;
        let env = read_npy_file(&env_path)?;
        if raw.shape() != env.shape() {
            return Err(EmgError::storage(format!(
                "session {} has raw shape {:?} but envelope shape {:?}",
                id,
                raw.shape(),
                env.shape()
            )));
        }

        Ok(StoredSession {
            raw: raw.decimate(decimation),
            env: env.decimate(decimation),
        })
    }

    fn read_metadata(&self, id: &SessionId) -> Option<SessionMetadata> {
        let path = self.path(id, META_SUFFIX);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Ignoring unreadable metadata file");
                None
            }
        }
    }

    fn write_metadata(&self, id: &SessionId, metadata: &SessionMetadata) -> EmgResult<()> {
        persist_to(self.metadata_temp(metadata)?, &self.path(id, META_SUFFIX))
    }

    fn metadata_temp(&self, metadata: &SessionMetadata) -> EmgResult<NamedTempFile> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, metadata)
                .map_err(|e| EmgError::storage(format!("cannot encode metadata: {}", e)))?;
            writer.flush()?;
        }
        Ok(tmp)
    }

    /// Rename prepared files into place, raw array last
    fn commit(
        &self,
        id: &SessionId,
        raw: NamedTempFile,
        env: NamedTempFile,
        metadata: Option<NamedTempFile>,
    ) -> EmgResult<()> {
        remove_if_present(&self.path(id, RAW_SUFFIX))?;
        persist_to(env, &self.path(id, ENV_SUFFIX))?;
        if let Some(metadata) = metadata {
            persist_to(metadata, &self.path(id, META_SUFFIX))?;
        }
        persist_to(raw, &self.path(id, RAW_SUFFIX))
    }

    fn remove_partial(&self, id: &SessionId) {
        for suffix in [RAW_SUFFIX, ENV_SUFFIX, META_SUFFIX] {
            let path = self.path(id, suffix);
            if let Err(e) = remove_if_present(&path) {
                warn!(session_id = %id, path = %path.display(), error = %e, "Could not remove partial save");
            }
        }
    }
}

fn remove_if_present(path: &Path) -> EmgResult<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
