/// Presence and typing state for one open conversation
///
/// Timers are modelled as deadlines: every method takes the current
/// `Instant`, so an expired state simply reads as idle on the next query.
use crate::backend::{PresenceState, TypingPayload};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypingState {
    Idle,
    Typing,
}

pub struct PresenceTracker {
    self_id: String,
    typing_window: Duration,
    typing_decay: Duration,
    /// Local user counts as typing until this deadline
    local_until: Option<Instant>,
    /// Remote user id -> typing indicator deadline
    remote_until: HashMap<String, Instant>,
    online: HashSet<String>,
}

impl PresenceTracker {
    pub fn new(self_id: &str, typing_window: Duration, typing_decay: Duration) -> Self {
        Self {
            self_id: self_id.to_string(),
            typing_window,
            typing_decay,
            local_until: None,
            remote_until: HashMap::new(),
            online: HashSet::new(),
        }
    }

    /// Record a local keystroke. Returns the payload to broadcast when the
    /// local user was not already typing; `None` while the signal is coalesced.
    pub fn on_local_input(&mut self, now: Instant) -> Option<TypingPayload> {
        let was_typing = self.is_local_typing(now);
        self.local_until = Some(now + self.typing_window);
        if was_typing {
            None
        } else {
            Some(TypingPayload {
                user_id: self.self_id.clone(),
            })
        }
    }

    /// Sending a message ends the local typing state
    pub fn on_local_send(&mut self) {
        self.local_until = None;
    }

    pub fn is_local_typing(&self, now: Instant) -> bool {
        self.local_until.map_or(false, |until| now < until)
    }

    /// Handle a typing broadcast. Own echoes are ignored. Returns true when
    /// the indicator was armed or re-armed.
    pub fn on_typing_broadcast(&mut self, payload: &TypingPayload, now: Instant) -> bool {
        if payload.user_id == self.self_id {
            return false;
        }
        self.remote_until.retain(|_, until| now < *until);
        self.remote_until
            .insert(payload.user_id.clone(), now + self.typing_decay);
        true
    }

    pub fn typing_state(&self, user_id: &str, now: Instant) -> TypingState {
        match self.remote_until.get(user_id) {
            Some(until) if now < *until => TypingState::Typing,
            _ => TypingState::Idle,
        }
    }

    /// Whether anyone other than the local user is typing
    pub fn is_typing(&self, now: Instant) -> bool {
        self.remote_until.values().any(|until| now < *until)
    }

    /// Remote users currently typing, sorted
    pub fn typing_users(&self, now: Instant) -> Vec<String> {
        let mut users: Vec<String> = self
            .remote_until
            .iter()
            .filter(|(_, until)| now < **until)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Replace the online set from a presence snapshot
    pub fn on_presence_sync(&mut self, state: &PresenceState) {
        self.online = state
            .values()
            .flatten()
            .filter_map(|meta| meta.user_id.clone())
            .collect();
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Whether any user other than self is online
    pub fn other_party_online(&self) -> bool {
        self.online.iter().any(|u| u != &self.self_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.online.iter().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PresenceMeta;

    const WINDOW: Duration = Duration::from_secs(3);

    fn tracker() -> PresenceTracker {
        PresenceTracker::new("u1", WINDOW, WINDOW)
    }

    fn typing(user: &str) -> TypingPayload {
        TypingPayload {
            user_id: user.to_string(),
        }
    }

    #[test]
    fn test_remote_typing_decays() {
        let mut tracker = tracker();
        let t = Instant::now();

        assert!(tracker.on_typing_broadcast(&typing("u2"), t));
        assert!(tracker.is_typing(t));
        assert!(tracker.is_typing(t + Duration::from_millis(2999)));
        assert!(!tracker.is_typing(t + WINDOW));
        assert!(!tracker.is_typing(t + WINDOW + Duration::from_millis(1)));
        assert_eq!(tracker.typing_state("u2", t + WINDOW), TypingState::Idle);
    }

    #[test]
    fn test_later_broadcast_rearms() {
        let mut tracker = tracker();
        let t = Instant::now();

        tracker.on_typing_broadcast(&typing("u2"), t);
        tracker.on_typing_broadcast(&typing("u2"), t + Duration::from_secs(2));

        assert!(tracker.is_typing(t + Duration::from_secs(4)));
        assert!(!tracker.is_typing(t + Duration::from_secs(5)));
        assert_eq!(tracker.typing_users(t + Duration::from_secs(4)), vec!["u2".to_string()]);
    }

    #[test]
    fn test_expired_typers_are_pruned() {
        let mut tracker = tracker();
        let t = Instant::now();

        tracker.on_typing_broadcast(&typing("u2"), t);
        tracker.on_typing_broadcast(&typing("u3"), t + Duration::from_secs(1));
        tracker.on_typing_broadcast(&typing("u4"), t + Duration::from_secs(5));

        assert_eq!(tracker.remote_until.len(), 1);
        assert_eq!(tracker.typing_users(t + Duration::from_secs(5)), vec!["u4".to_string()]);
    }

    #[test]
    fn test_own_broadcast_ignored() {
        let mut tracker = tracker();
        let t = Instant::now();
        assert!(!tracker.on_typing_broadcast(&typing("u1"), t));
        assert!(!tracker.is_typing(t));
    }

    #[test]
    fn test_local_broadcasts_are_coalesced() {
        let mut tracker = tracker();
        let t = Instant::now();

        assert!(tracker.on_local_input(t).is_some());
        assert!(tracker.on_local_input(t + Duration::from_secs(1)).is_none());
        assert!(tracker.on_local_input(t + Duration::from_secs(2)).is_none());

        // The window re-arms on every keystroke
        assert!(tracker.is_local_typing(t + Duration::from_millis(4500)));
        assert!(!tracker.is_local_typing(t + Duration::from_secs(5)));

        // Past the window the next keystroke broadcasts again
        assert!(tracker.on_local_input(t + Duration::from_secs(6)).is_some());

        tracker.on_local_send();
        assert!(!tracker.is_local_typing(t + Duration::from_secs(6)));
    }

    #[test]
    fn test_presence_is_a_set() {
        let mut tracker = tracker();
        let mut state = PresenceState::new();
        state.insert("a".to_string(), vec![PresenceMeta::online("u1")]);
        state.insert("b".to_string(), vec![PresenceMeta::online("u2"), PresenceMeta::online("u2")]);
        state.insert(
            "c".to_string(),
            vec![PresenceMeta {
                user_id: None,
                online_at: None,
            }],
        );

        tracker.on_presence_sync(&state);
        assert_eq!(tracker.online_users(), vec!["u1".to_string(), "u2".to_string()]);
        assert!(tracker.other_party_online());

        state.remove("b");
        tracker.on_presence_sync(&state);
        assert!(!tracker.is_online("u2"));
        assert!(tracker.is_online("u1"));
        assert!(!tracker.other_party_online());
    }
}
