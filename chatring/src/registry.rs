use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::fd::RawFd;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::command::ShardHandle;

/// Why a join request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// No session with the requested id exists.
    UnknownSession(u32),
}

/// Result of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The client was already a member of the target session.
    AlreadyMember,
    /// The client was added; the session is hosted by `shard`.
    Joined {
        shard: usize,
        /// Session the client was moved out of, if any.
        moved_from: Option<u32>,
    },
}

struct SessionState {
    /// Shard whose ring services every member of this session.
    shard: usize,
    members: BTreeSet<RawFd>,
}

struct Inner {
    sessions: BTreeMap<u32, SessionState>,
    clients: HashMap<RawFd, u32>,
}

/// Process-wide directory mapping session id → members and client → session.
///
/// All operations serialize under one mutex; hot-path work is limited to
/// membership adjustments and member-set snapshots. Ring submissions
/// implied by a membership change are never made here — callers post
/// commands to the owning shard's queue instead.
pub struct Registry {
    inner: Mutex<Inner>,
    shards: Vec<ShardHandle>,
}

impl Registry {
    /// Create the directory with one session per worker shard, ids
    /// assigned from zero in shard order.
    pub fn new(shards: Vec<ShardHandle>) -> Self {
        let mut sessions = BTreeMap::new();
        for (shard, _) in shards.iter().enumerate() {
            sessions.insert(
                shard as u32,
                SessionState {
                    shard,
                    members: BTreeSet::new(),
                },
            );
        }
        info!(sessions = shards.len(), "session registry initialized");
        Registry {
            inner: Mutex::new(Inner {
                sessions,
                clients: HashMap::new(),
            }),
            shards,
        }
    }

    /// Handle for posting commands to a shard's queue.
    pub fn shard_handle(&self, shard: usize) -> &ShardHandle {
        &self.shards[shard]
    }

    /// The id of the session with the fewest members; ties break toward
    /// the lowest id.
    pub fn next_available_session(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        let mut selected = 0;
        let mut min_members = usize::MAX;
        for (&id, session) in &inner.sessions {
            if session.members.len() < min_members {
                min_members = session.members.len();
                selected = id;
            }
        }
        selected
    }

    /// Move `fd` into `session_id`, removing it from any previous
    /// session. Joining the current session is a membership no-op.
    pub fn join(&self, fd: RawFd, session_id: u32) -> Result<JoinOutcome, JoinError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.sessions.contains_key(&session_id) {
            return Err(JoinError::UnknownSession(session_id));
        }

        let moved_from = match inner.clients.get(&fd) {
            Some(&current) if current == session_id => return Ok(JoinOutcome::AlreadyMember),
            Some(&current) => {
                if let Some(old) = inner.sessions.get_mut(&current) {
                    old.members.remove(&fd);
                }
                Some(current)
            }
            None => None,
        };

        let session = inner.sessions.get_mut(&session_id).unwrap();
        session.members.insert(fd);
        let shard = session.shard;
        let count = session.members.len();
        inner.clients.insert(fd, session_id);
        info!(fd, session_id, members = count, "client joined session");
        Ok(JoinOutcome::Joined { shard, moved_from })
    }

    /// Remove `fd` from its session, if any. Returns the session id and
    /// a snapshot of the remaining members. Removing an absent client is
    /// a no-op; empty sessions are retained for re-use.
    pub fn remove(&self, fd: RawFd) -> Option<(u32, Vec<RawFd>)> {
        let mut inner = self.inner.lock().unwrap();
        let session_id = inner.clients.remove(&fd)?;
        let remaining = match inner.sessions.get_mut(&session_id) {
            Some(session) => {
                session.members.remove(&fd);
                session.members.iter().copied().collect()
            }
            None => Vec::new(),
        };
        debug!(fd, session_id, remaining = remaining.len(), "client removed from session");
        Some((session_id, remaining))
    }

    /// Snapshot of a session's members. Taken under the mutex so sends
    /// can be issued after it is released.
    pub fn session_members(&self, session_id: u32) -> Vec<RawFd> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(&session_id)
            .map(|s| s.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The session a client currently belongs to.
    pub fn session_of(&self, fd: RawFd) -> Option<u32> {
        self.inner.lock().unwrap().clients.get(&fd).copied()
    }

    /// The shard hosting a session.
    #[allow(dead_code)]
    pub fn shard_of(&self, session_id: u32) -> Option<usize> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session_id)
            .map(|s| s.shard)
    }
}
