//! Reconnection: backoff between dial rounds and the snapshot a failing room
//! hands to the session supervisor.
//!
//! [`ReconnectState`] computes exponentially increasing delays with jitter.
//! A room dials a few times back to back, then sleeps for the next backoff
//! delay before starting another round, indefinitely unless
//! [`ReconnectConfig::max_attempts`] caps it.
//!
//! [`ReconnectRequest`] is what a room emits when its connection is beyond
//! saving. The supervisor builds a brand-new room from it; the failing room is
//! never patched in place.

use std::time::Duration;

use rand::Rng;

use crate::room::{RoomId, RoomSeed};
use crate::token::Token;

/// Backoff settings between dial rounds.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second dial round. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed round. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Maximum delay between rounds. Default: 30 s.
    pub max_delay: Duration,
    /// Rounds before giving up; `None` retries until cancelled. Default: `None`.
    pub max_attempts: Option<u32>,
    /// Jitter factor (0.0–1.0). Applied as ±jitter to the delay. Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: 0.25,
        }
    }
}

/// Tracks backoff rounds and computes the next delay.
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    /// Create a new state from the given config.
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Compute the next delay and advance the attempt counter.
    /// Returns `None` once a configured attempt cap is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }

        let base = self.current_delay;
        self.attempts = self.attempts.saturating_add(1);

        // Uniform in [base * (1 - jitter), base * (1 + jitter)]
        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Return the number of rounds so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Snapshot of a failed room, consumed by the session supervisor.
///
/// Immutable once created: the supervisor only reads it to seed the next
/// room generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Room identity.
    pub room_id: RoomId,
    /// Generation of the room that gave up. Stale requests are discarded.
    pub generation: u64,
    /// Last endpoint the room was connected to.
    pub server: String,
    /// Last port the room was connected to.
    pub port: u16,
    /// Token the room logged in with, reused while fresh.
    pub token: Token,
    /// Application id.
    pub aid: String,
    /// Application secret.
    pub secret: String,
    /// Login signature of the failed session.
    pub auth: String,
}

impl ReconnectRequest {
    /// Seed for the replacement room: same identity, endpoint and token.
    pub fn to_seed(&self) -> RoomSeed {
        RoomSeed {
            room_id: self.room_id,
            aid: self.aid.clone(),
            secret: self.secret.clone(),
            server: self.server.clone(),
            port: self.port,
            token: Some(self.token.clone()),
        }
    }
}
