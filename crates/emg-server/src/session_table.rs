//! In-memory registry of sessions that have not been saved or discarded
//!
//! Save and discard are mutually exclusive per id. A save first marks the
//! entry as finalizing and takes its buffers; while finalizing, appends fail,
//! a second save sees `NotFound` and a discard does nothing. A successful
//! save removes the entry, a failed one puts the buffers back. Metadata that
//! arrives mid-save is held on the entry and handed back by
//! [`SessionTable::complete_finalize`].

use emg_core::{EmgError, EmgResult, SessionId, SessionMetadata, SessionState, SignalMatrix};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct PendingSession {
    raw: SignalMatrix,
    env: SignalMatrix,
    sample_rate: f64,
    state: SessionState,
    metadata: Option<SessionMetadata>,
    /// Metadata changed after the buffers were taken
    late_metadata: bool,
    finalizing: bool,
    last_activity: Instant,
}

/// Buffers taken out of the table by [`SessionTable::begin_finalize`]
#[derive(Debug, Clone)]
pub struct FinalizedSession {
    pub raw: SignalMatrix,
    pub env: SignalMatrix,
    pub metadata: Option<SessionMetadata>,
    pub sample_rate: f64,
}

/// Row of the pending-session listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub rows: usize,
    pub channels: usize,
    pub sample_rate: f64,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, PendingSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id.
    ///
    /// Ids colliding with a pending session or with anything `is_taken`
    /// reports (the durable store) are re-minted.
    pub fn open(
        &self,
        channels: usize,
        sample_rate: f64,
        is_taken: impl Fn(&SessionId) -> bool,
    ) -> SessionId {
        let mut sessions = self.sessions.lock();
        let mut id = SessionId::mint();
        while sessions.contains_key(&id) || is_taken(&id) {
            debug!(session_id = %id, "Session id collision, minting another");
            id = SessionId::mint();
        }

        sessions.insert(
            id.clone(),
            PendingSession {
                raw: SignalMatrix::empty(channels),
                env: SignalMatrix::empty(channels),
                sample_rate,
                state: SessionState::Open,
                metadata: None,
                late_metadata: false,
                finalizing: false,
                last_activity: Instant::now(),
            },
        );
        info!(session_id = %id, channels, sample_rate, "Session opened");
        id
    }

    pub fn mark_streaming(&self, id: &SessionId) -> EmgResult<()> {
        let mut sessions = self.sessions.lock();
        let entry = Self::live_entry(&mut sessions, id)?;
        entry.state = SessionState::Streaming;
        entry.last_activity = Instant::now();
        Ok(())
    }

    /// Append one filtered chunk; returns the accumulated row count.
    ///
    /// Fails with `NotFound` once the session has been finalized and with
    /// `ShapeMismatch` if the chunk width differs from the session's.
    pub fn append(&self, id: &SessionId, raw: &SignalMatrix, env: &SignalMatrix) -> EmgResult<usize> {
        if raw.shape() != env.shape() {
            return Err(EmgError::ShapeMismatch {
                expected: format!("{:?}", raw.shape()),
                actual: format!("{:?}", env.shape()),
            });
        }

        let mut sessions = self.sessions.lock();
        let entry = Self::live_entry(&mut sessions, id)?;
        entry.raw.append(raw)?;
        entry.env.append(env)?;
        entry.last_activity = Instant::now();
        Ok(entry.raw.rows())
    }

    /// The connection ended without a disposition.
    ///
    /// Also recorded while a save is in flight, so a save that then fails
    /// leaves the session where the orphan sweep can find it.
    pub fn mark_abandoned(&self, id: &SessionId) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(id) {
            entry.state = SessionState::Abandoned;
            entry.last_activity = Instant::now();
            if !entry.finalizing {
                info!(session_id = %id, rows = entry.raw.rows(), "Session abandoned, awaiting save or discard");
            }
        }
    }

    /// Merge label/notes into a session held in memory, including one being
    /// saved; false if the table does not know the id
    pub fn update_metadata(&self, id: &SessionId, label: Option<String>, notes: Option<String>) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        if entry.finalizing {
            entry.late_metadata = true;
        }

        let metadata = entry.metadata.get_or_insert_with(SessionMetadata::default);
        if let Some(label) = label {
            metadata.label = label;
        }
        if let Some(notes) = notes {
            metadata.notes = notes;
        }
        true
    }

    /// Take the buffers out for saving; `NotFound` if unknown or already finalizing
    pub fn begin_finalize(&self, id: &SessionId) -> EmgResult<FinalizedSession> {
        let mut sessions = self.sessions.lock();
        let entry = Self::live_entry(&mut sessions, id)?;
        entry.finalizing = true;
        entry.late_metadata = false;

        let channels = entry.raw.channel_count();
        Ok(FinalizedSession {
            raw: std::mem::replace(&mut entry.raw, SignalMatrix::empty(channels)),
            env: std::mem::replace(&mut entry.env, SignalMatrix::empty(channels)),
            metadata: entry.metadata.clone(),
            sample_rate: entry.sample_rate,
        })
    }

    /// Saving succeeded: forget the session.
    ///
    /// Returns the merged metadata if it changed while the save was running.
    pub fn complete_finalize(&self, id: &SessionId) -> Option<SessionMetadata> {
        let entry = self.sessions.lock().remove(id)?;
        debug!(session_id = %id, previous = %entry.state, "Session finalized");
        if entry.late_metadata {
            entry.metadata
        } else {
            None
        }
    }

    /// Saving failed: restore the buffers and make the session pending again
    pub fn abort_finalize(&self, id: &SessionId, taken: FinalizedSession) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(id) {
            entry.raw = taken.raw;
            entry.env = taken.env;
            entry.finalizing = false;
            entry.late_metadata = false;
            entry.last_activity = Instant::now();
        }
    }

    /// Drop a pending session; no-op (false) if unknown or being saved
    pub fn discard(&self, id: &SessionId) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(entry) if !entry.finalizing => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Present and not being finalized
    pub fn is_pending(&self, id: &SessionId) -> bool {
        self.sessions
            .lock()
            .get(id)
            .is_some_and(|entry| !entry.finalizing)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Abandoned sessions idle for longer than `grace`
    pub fn orphans(&self, grace: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        self.sessions
            .lock()
            .iter()
            .filter(|(_, entry)| {
                entry.state == SessionState::Abandoned
                    && !entry.finalizing
                    && now.duration_since(entry.last_activity) > grace
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pending sessions, oldest first
    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut listed: Vec<PendingInfo> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: id.clone(),
                state: entry.state,
                rows: entry.raw.rows(),
                channels: entry.raw.channel_count(),
                sample_rate: entry.sample_rate,
            })
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        listed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn live_entry<'a>(
        sessions: &'a mut HashMap<SessionId, PendingSession>,
        id: &SessionId,
    ) -> EmgResult<&'a mut PendingSession> {
        match sessions.get_mut(id) {
            Some(entry) if !entry.finalizing => Ok(entry),
            _ => Err(EmgError::not_found(id.as_str())),
        }
    }
}
