// Chat flood control.
//
// Each player has a list of recent message timestamps. On every message the
// list is pruned to the sliding `interval` window and then:
//
// 1. Within `join_cooldown` of connecting, the message is blocked.
// 2. At or above `message_count` timestamps, the message is blocked.
// 3. Otherwise it is allowed and stamped. If that stamp reaches the ceiling,
//    every stored timestamp is pushed forward so the window only empties
//    after `cooldown`, and the caller is told to disable the sender's chat
//    input for that long.
//
// Blocked verdicts carry the time until the sender may speak again, which is
// always non-zero. The tracker knows nothing about admins; the server skips
// the check for them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use lockstep_protocol::ClientIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FloodLimits {
    pub interval: Duration,
    pub message_count: usize,
    pub cooldown: Duration,
    pub join_cooldown: Duration,
}

impl Default for FloodLimits {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            message_count: 5,
            cooldown: Duration::from_secs(15),
            join_cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloodVerdict {
    Allowed {
        /// Set when this message hit the ceiling.
        disable_chat_for: Option<Duration>,
    },
    Blocked {
        remaining: Duration,
    },
}

#[derive(Debug)]
pub struct FloodTracker {
    limits: FloodLimits,
    timestamps: HashMap<ClientIndex, Vec<Instant>>,
}

impl FloodTracker {
    pub fn new(limits: FloodLimits) -> Self {
        Self {
            limits,
            timestamps: HashMap::new(),
        }
    }

    pub fn limits(&self) -> FloodLimits {
        self.limits
    }

    pub fn check(&mut self, player: ClientIndex, joined_at: Instant, now: Instant) -> FloodVerdict {
        let limits = self.limits;
        let stamps = self.timestamps.entry(player).or_default();
        stamps.retain(|&t| t + limits.interval >= now);

        let join_deadline = joined_at + limits.join_cooldown;
        if now < join_deadline {
            return FloodVerdict::Blocked {
                remaining: join_deadline - now,
            };
        }

        if stamps.len() >= limits.message_count {
            let oldest = stamps.iter().min().copied().unwrap_or(now);
            let remaining = (oldest + limits.interval).saturating_duration_since(now);
            return FloodVerdict::Blocked {
                remaining: remaining.max(Duration::from_millis(1)),
            };
        }

        stamps.push(now);
        if stamps.len() >= limits.message_count {
            let extended = (now + limits.cooldown)
                .checked_sub(limits.interval)
                .unwrap_or(now);
            for t in stamps.iter_mut() {
                *t = extended;
            }
            return FloodVerdict::Allowed {
                disable_chat_for: Some(limits.cooldown),
            };
        }

        FloodVerdict::Allowed {
            disable_chat_for: None,
        }
    }

    pub fn remove(&mut self, player: ClientIndex) {
        self.timestamps.remove(&player);
    }
}

/// Whole seconds left, rounded up, for user-facing notices.
pub fn remaining_seconds(remaining: Duration) -> u64 {
    remaining.as_millis().div_ceil(1000) as u64
}
