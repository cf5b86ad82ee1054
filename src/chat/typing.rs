//! Typing presence.
//!
//! [`TypingTracker`] is the local `idle -> typing -> idle` machine: it is
//! driven by explicit instants so the session decides when to poll it.
//! [`RemoteTyping`] aggregates the signals of other participants.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::chat::core::ids::UserId;

/// Signal to broadcast after a local transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingSignal {
    /// `typing:start`
    Start,
    /// `typing:stop`
    Stop,
}

impl TypingSignal {
    /// Value of the `isTyping` flag on the wire.
    #[must_use]
    pub const fn is_typing(self) -> bool {
        matches!(self, Self::Start)
    }
}

/// Local typing state with an inactivity timeout.
#[derive(Clone, Debug)]
pub struct TypingTracker {
    inactivity: Duration,
    deadline: Option<Instant>,
}

impl TypingTracker {
    /// Idle tracker.
    #[must_use]
    pub const fn new(inactivity: Duration) -> Self {
        Self {
            inactivity,
            deadline: None,
        }
    }

    /// Whether the local user is typing.
    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.deadline.is_some()
    }

    /// When the typing state lapses without further input.
    #[must_use]
    pub const fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Record a change of the compose input.
    ///
    /// Emits [`TypingSignal::Start`] only on the idle to typing transition, and
    /// [`TypingSignal::Stop`] when the input is cleared while typing.
    pub fn on_input(&mut self, now: Instant, non_empty: bool) -> Option<TypingSignal> {
        if !non_empty {
            return self.force_idle();
        }
        let was_typing = self.is_typing();
        self.deadline = Some(now + self.inactivity);
        (!was_typing).then_some(TypingSignal::Start)
    }

    /// Lapse the typing state if its deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(TypingSignal::Stop)
            }
            _ => None,
        }
    }

    /// Go idle immediately, e.g. on blur or after a send.
    pub fn force_idle(&mut self) -> Option<TypingSignal> {
        self.deadline.take().map(|_| TypingSignal::Stop)
    }
}

/// Remote participants currently typing.
#[derive(Clone, Debug)]
pub struct RemoteTyping {
    viewer: UserId,
    typing: BTreeSet<UserId>,
}

impl RemoteTyping {
    /// Empty set; signals from `viewer` itself are ignored.
    #[must_use]
    pub const fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            typing: BTreeSet::new(),
        }
    }

    /// Apply a remote signal. Returns whether the set changed.
    pub fn apply(&mut self, user_id: UserId, is_typing: bool) -> bool {
        if user_id == self.viewer {
            return false;
        }
        if is_typing {
            self.typing.insert(user_id)
        } else {
            self.typing.remove(&user_id)
        }
    }

    /// Forget everyone, e.g. after switching conversation or reconnecting.
    pub fn clear(&mut self) {
        self.typing.clear();
    }

    /// Whether nobody is typing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.typing.is_empty()
    }

    /// Whether `user_id` is typing.
    #[must_use]
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.typing.contains(user_id)
    }

    /// Participants typing, in id order.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.typing.iter()
    }
}
