//! Per-session stream state machine.
//!
//! `INITIALIZING -> READY -> LAUNCHING -> LIVE`, with `ERROR` and `CLEANUP`
//! reachable from every working state and `CLEANUP -> INITIALIZING` as the
//! only way back. Every request is checked against the adjacency table
//! before guards run, and every attempt lands in a bounded history.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use livecast_common::Role;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Initializing,
    Ready,
    Launching,
    Live,
    Error,
    Cleanup,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Initializing => "INITIALIZING",
            StreamState::Ready => "READY",
            StreamState::Launching => "LAUNCHING",
            StreamState::Live => "LIVE",
            StreamState::Error => "ERROR",
            StreamState::Cleanup => "CLEANUP",
        };
        f.write_str(s)
    }
}

use StreamState::*;

const TRANSITIONS: &[(StreamState, StreamState)] = &[
    (Initializing, Ready),
    (Initializing, Error),
    (Initializing, Cleanup),
    (Ready, Launching),
    (Ready, Error),
    (Ready, Cleanup),
    (Launching, Live),
    (Launching, Error),
    (Launching, Cleanup),
    (Live, Error),
    (Live, Cleanup),
    (Error, Cleanup),
    (Cleanup, Error),
    (Cleanup, Initializing),
];

/// Facts the guards are evaluated against, sampled just before a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardContext {
    pub signaling_connected: bool,
    pub transport_connected: bool,
    pub local_tracks: usize,
    pub published_tracks: usize,
    /// The gateway has echoed this participant's role for the session.
    pub role_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Invalid,
    GuardFailed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub from: StreamState,
    pub to: StreamState,
    pub at: DateTime<Utc>,
    pub outcome: TransitionOutcome,
}

#[derive(Debug)]
pub struct StateMachine {
    state: StreamState,
    role: Role,
    history: VecDeque<TransitionRecord>,
    capacity: usize,
}

impl StateMachine {
    pub fn new(role: Role, capacity: usize) -> Self {
        Self {
            state: Initializing,
            role,
            history: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_allowed(from: StreamState, to: StreamState) -> bool {
        TRANSITIONS.contains(&(from, to))
    }

    /// Attempt a guarded transition. On failure the state is unchanged.
    pub fn transition(&mut self, to: StreamState, ctx: &GuardContext) -> Result<(), ClientError> {
        let from = self.state;
        if !Self::is_allowed(from, to) {
            self.record(from, to, TransitionOutcome::Invalid);
            return Err(ClientError::InvalidTransition { from, to });
        }
        if let Err(reason) = self.check_guard(to, ctx) {
            self.record(from, to, TransitionOutcome::GuardFailed(reason));
            return Err(ClientError::GuardFailed { from, to, reason });
        }
        self.apply(from, to);
        Ok(())
    }

    /// Transition without guards. Still bound by the adjacency table; used
    /// for the error and cleanup edges, which have no preconditions.
    pub fn force(&mut self, to: StreamState) -> Result<(), ClientError> {
        let from = self.state;
        if !Self::is_allowed(from, to) {
            self.record(from, to, TransitionOutcome::Invalid);
            return Err(ClientError::InvalidTransition { from, to });
        }
        self.apply(from, to);
        Ok(())
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.iter().cloned().collect()
    }

    fn check_guard(&self, to: StreamState, ctx: &GuardContext) -> Result<(), &'static str> {
        match (to, self.role) {
            (Ready, _) => {
                if !ctx.signaling_connected {
                    return Err("signaling not connected");
                }
                if !ctx.transport_connected {
                    return Err("media transport not connected");
                }
            }
            (Launching, Role::Host) => {
                if ctx.local_tracks == 0 {
                    return Err("no local tracks");
                }
                if !ctx.signaling_connected {
                    return Err("signaling not connected");
                }
            }
            (Launching, Role::Viewer) => {
                if !ctx.signaling_connected {
                    return Err("signaling not connected");
                }
            }
            (Live, Role::Host) => {
                if ctx.published_tracks == 0 {
                    return Err("no tracks published");
                }
            }
            (Live, Role::Viewer) => {
                if !ctx.role_confirmed {
                    return Err("gateway has not confirmed viewer role");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&mut self, from: StreamState, to: StreamState) {
        self.state = to;
        self.record(from, to, TransitionOutcome::Applied);
        tracing::debug!(%from, %to, role = %self.role, "stream transition");
    }

    fn record(&mut self, from: StreamState, to: StreamState, outcome: TransitionOutcome) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            at: Utc::now(),
            outcome,
        });
    }
}
