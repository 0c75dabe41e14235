//! Heuristics over the player sample of a status response.
//!
//! A sample is "fake" when it cannot be trusted as a list of real, distinct players:
//! decoy responses, missing entries, duplicates, or ids that are not UUIDs of a version
//! the game issues. Genuine samples also reveal the authentication mode: version-4 ids
//! come from the account service (online mode), version-3 ids are derived locally from
//! the player name (offline mode).
use std::collections::HashSet;
use std::net::SocketAddrV4;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{ClassifiedResult, OnlineMode, ServerStatus};

/// Description served to unauthenticated pings by servers hiding their player list.
pub const DECOY_DESCRIPTION: &str =
    "To protect the privacy of this server and its\nusers, you must log in once to see ping data.";

/// Placeholder name used for players hidden from the sample; its id need not be a UUID.
pub const ANONYMOUS_PLAYER_NAME: &str = "Anonymous Player";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub is_fake_sample: bool,
    pub online_mode: OnlineMode,
}

impl Verdict {
    fn fake(online_mode: OnlineMode) -> Self {
        Self {
            is_fake_sample: true,
            online_mode,
        }
    }
}

pub fn assess(status: &ServerStatus) -> Verdict {
    if status.description == DECOY_DESCRIPTION {
        return Verdict::fake(OnlineMode::Unknown);
    }

    let Some(sample) = status.players.as_ref().and_then(|p| p.sample.as_ref()) else {
        // nothing to judge
        return Verdict::fake(OnlineMode::Unknown);
    };

    let mut seen = HashSet::with_capacity(sample.len());
    let mut online_mode = OnlineMode::Unknown;
    // An unsupported UUID version marks the sample fake but the walk goes on,
    // so later ids can still reveal the mode.
    let mut is_fake_sample = false;

    for player in sample {
        let (Some(name), Some(id)) = (player.name.as_deref(), player.id.as_deref()) else {
            return Verdict::fake(online_mode);
        };

        let parsed = Uuid::parse_str(id).ok();
        let key = parsed.map_or_else(|| id.to_owned(), |uuid| uuid.hyphenated().to_string());
        if !seen.insert(key) {
            return Verdict::fake(online_mode);
        }

        let Some(uuid) = parsed else {
            if name == ANONYMOUS_PLAYER_NAME {
                continue;
            }
            return Verdict::fake(online_mode);
        };

        match uuid.get_version_num() {
            4 => online_mode = online_mode.merge(OnlineMode::Online),
            3 => online_mode = online_mode.merge(OnlineMode::Offline),
            _ => is_fake_sample = true,
        }
    }

    Verdict {
        is_fake_sample,
        online_mode,
    }
}

pub fn classify(
    status: ServerStatus,
    addr: SocketAddrV4,
    captured_at: OffsetDateTime,
) -> ClassifiedResult {
    let verdict = assess(&status);
    ClassifiedResult {
        status,
        addr,
        time: captured_at,
        is_fake_sample: verdict.is_fake_sample,
        is_online_mode: verdict.online_mode,
    }
}
