//! In-memory map from stream id to live transcode session.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use streamgate_common::StreamId;

use super::session::TranscodeSession;

/// Result of [`SessionRegistry::get_or_create`].
#[derive(Debug)]
pub enum Lookup {
    /// A live session already existed; attach to it.
    Existing(Arc<TranscodeSession>),
    /// This caller won the race and must launch the process.
    Created(Arc<TranscodeSession>),
}

impl Lookup {
    pub fn session(&self) -> &Arc<TranscodeSession> {
        match self {
            Lookup::Existing(s) | Lookup::Created(s) => s,
        }
    }
}

/// Session registry. The DashMap entry lock is the only critical section and
/// is never held across an await.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<StreamId, Arc<TranscodeSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live session for `id`, or insert the one built by `create`.
    ///
    /// Sessions that are stopping or finished are replaced.
    pub fn get_or_create<F>(&self, id: &StreamId, create: F) -> Lookup
    where
        F: FnOnce() -> Arc<TranscodeSession>,
    {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().status().is_live() {
                    Lookup::Existing(Arc::clone(entry.get()))
                } else {
                    let session = create();
                    entry.insert(Arc::clone(&session));
                    Lookup::Created(session)
                }
            }
            Entry::Vacant(entry) => {
                let session = create();
                entry.insert(Arc::clone(&session));
                Lookup::Created(session)
            }
        }
    }

    pub fn get(&self, id: &StreamId) -> Option<Arc<TranscodeSession>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Remove `session` if it is still the entry for its id.
    pub fn remove_if_same(&self, session: &Arc<TranscodeSession>) -> bool {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// Point-in-time copy of all entries.
    pub fn snapshot(&self) -> Vec<Arc<TranscodeSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
