//! Backend registry: which backends exist, their role, group and health.
//!
//! State flags are written by the health checker and read by the pool and
//! routing code; nothing here calls back into a connection.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{BackendConfig, BackendInitialState, BackendRole};

/// Index of a backend in the registry
pub type BackendId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Not probed yet; usable
    Unknown,
    Up,
    Down,
    /// Administratively drained
    Maintaining,
}

#[derive(Debug)]
pub struct Backend {
    pub id: BackendId,
    pub addr: String,
    pub role: BackendRole,
    pub group: String,
    state: RwLock<BackendState>,
    consecutive_failures: AtomicU32,
    /// Sessions open against this backend, idle or checked out
    open_sessions: AtomicUsize,
}

impl Backend {
    pub fn new(id: BackendId, config: &BackendConfig) -> Self {
        let state = match config.state {
            BackendInitialState::Up => BackendState::Unknown,
            BackendInitialState::Maintaining => BackendState::Maintaining,
        };
        Self {
            id,
            addr: config.addr.clone(),
            role: config.role,
            group: config.group.clone(),
            state: RwLock::new(state),
            consecutive_failures: AtomicU32::new(0),
            open_sessions: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    pub fn set_state(&self, state: BackendState) {
        let mut current = self.state.write();
        if *current != state {
            info!(backend = %self.addr, from = ?*current, to = ?state, "Backend state changed");
            *current = state;
        }
    }

    /// May receive new sessions
    pub fn is_available(&self) -> bool {
        matches!(self.state(), BackendState::Up | BackendState::Unknown)
    }

    pub fn is_rw(&self) -> bool {
        self.role == BackendRole::Rw
    }

    /// Record a successful probe; returns true if the state changed
    pub fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        match self.state() {
            BackendState::Maintaining | BackendState::Up => false,
            _ => {
                self.set_state(BackendState::Up);
                true
            }
        }
    }

    /// Record a failed probe; returns true if the backend was just marked down
    pub fn record_failure(&self, threshold: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= threshold && matches!(self.state(), BackendState::Up | BackendState::Unknown) {
            warn!(backend = %self.addr, failures, "Backend marked down");
            self.set_state(BackendState::Down);
            return true;
        }
        false
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Reserve a session slot if fewer than `limit` are open
    pub fn try_reserve(&self, limit: usize) -> bool {
        self.open_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .open_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// All configured backends
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<Backend>>,
    /// Round-robin cursor for read-only picks
    ro_cursor: AtomicUsize,
}

impl BackendRegistry {
    pub fn new(configs: &[BackendConfig]) -> Self {
        Self {
            backends: configs
                .iter()
                .enumerate()
                .map(|(id, c)| Arc::new(Backend::new(id, c)))
                .collect(),
            ro_cursor: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, id: BackendId) -> Option<&Arc<Backend>> {
        self.backends.get(id)
    }

    pub fn all(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Distinct group names in declaration order
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for b in &self.backends {
            if !groups.contains(&b.group.as_str()) {
                groups.push(&b.group);
            }
        }
        groups
    }

    /// The read-write backend of a group
    pub fn rw_of(&self, group: &str) -> Option<BackendId> {
        self.backends
            .iter()
            .find(|b| b.group == group && b.is_rw() && b.is_available())
            .map(|b| b.id)
    }

    /// An available read-only backend of a group, falling back to the rw one
    pub fn ro_of(&self, group: &str) -> Option<BackendId> {
        let replicas: Vec<&Arc<Backend>> = self
            .backends
            .iter()
            .filter(|b| b.group == group && !b.is_rw() && b.is_available())
            .collect();
        if replicas.is_empty() {
            return self.rw_of(group);
        }
        let pick = self.ro_cursor.fetch_add(1, Ordering::Relaxed) % replicas.len();
        Some(replicas[pick].id)
    }

    /// Backend id by address
    pub fn find(&self, addr: &str) -> Option<BackendId> {
        self.backends.iter().find(|b| b.addr == addr).map(|b| b.id)
    }
}
