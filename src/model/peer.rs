/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/model/peer.rs
*
* The peer record (spec §3, §4.8): one entry under `status.<identity>` of a
* peering object, tracking how recently an operator instance touched it and
* how long it claims to stay alive for.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub priority: i32,
    pub lifetime: i64,
    pub lastseen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.lastseen + ChronoDuration::seconds(self.lifetime)
    }

    /// A peer with `lifetime == 0` is an explicit "I'm gone" tombstone
    /// (written by keepalive on shutdown); it's dead immediately regardless
    /// of `lastseen`.
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.lifetime == 0 || self.deadline() <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_when_past_deadline() {
        let now = Utc::now();
        let peer = PeerRecord {
            priority: 0,
            lifetime: 60,
            lastseen: now - ChronoDuration::seconds(120),
        };
        assert!(peer.is_dead(now));
    }

    #[test]
    fn alive_within_lifetime() {
        let now = Utc::now();
        let peer = PeerRecord {
            priority: 0,
            lifetime: 60,
            lastseen: now - ChronoDuration::seconds(10),
        };
        assert!(!peer.is_dead(now));
    }

    #[test]
    fn zero_lifetime_is_always_dead() {
        let now = Utc::now();
        let peer = PeerRecord {
            priority: 0,
            lifetime: 0,
            lastseen: now,
        };
        assert!(peer.is_dead(now));
    }
}
