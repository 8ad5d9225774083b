//! Call session registry: which identities are currently in which call room.
//! Rooms are ephemeral; an entry exists only while at least one participant
//! remains. Each operation does its read-modify-write under one lock guard.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use shared::domain::{CallId, UserId};

#[derive(Default)]
pub struct CallRegistry {
    rooms: Mutex<HashMap<CallId, HashSet<UserId>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The identity was not in that room (or the room does not exist).
    NotJoined,
    /// Others remain; the room stays active.
    Remaining(usize),
    /// The identity was the last participant; the room has been destroyed.
    Emptied,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the identity to the room, creating it on first join.
    /// Returns false when the identity was already a participant.
    pub fn join(&self, call_id: &CallId, user_id: &UserId) -> bool {
        self.lock()
            .entry(call_id.clone())
            .or_default()
            .insert(user_id.clone())
    }

    pub fn leave(&self, call_id: &CallId, user_id: &UserId) -> LeaveOutcome {
        let mut rooms = self.lock();
        let Some(participants) = rooms.get_mut(call_id) else {
            return LeaveOutcome::NotJoined;
        };
        if !participants.remove(user_id) {
            return LeaveOutcome::NotJoined;
        }
        let remaining = participants.len();
        if remaining == 0 {
            rooms.remove(call_id);
            LeaveOutcome::Emptied
        } else {
            LeaveOutcome::Remaining(remaining)
        }
    }

    /// Disconnect cleanup: removes the identity from every room it is in and
    /// returns the rooms that emptied as a result.
    pub fn leave_all(&self, user_id: &UserId) -> Vec<CallId> {
        let mut rooms = self.lock();
        let mut emptied = Vec::new();
        rooms.retain(|call_id, participants| {
            if participants.remove(user_id) && participants.is_empty() {
                emptied.push(call_id.clone());
                return false;
            }
            true
        });
        emptied
    }

    pub fn participants(&self, call_id: &CallId) -> Vec<UserId> {
        self.lock()
            .get(call_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_calls(&self) -> Vec<CallId> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, HashSet<UserId>>> {
        match self.rooms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[path = "tests/calls_tests.rs"]
mod tests;
