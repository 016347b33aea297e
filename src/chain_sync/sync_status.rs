// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::blocks::{TipsetHash, TipsetKey};
use crate::chain_sync::Error;
use crate::libp2p::PeerId;
use chrono::{DateTime, Utc};

/// Stage of one synchronization walk.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, strum::Display, strum::EnumString)]
pub enum SyncStage {
    /// No sync job is running.
    #[default]
    #[strum(to_string = "idle")]
    Idle,
    /// Walking backwards from the target head, fetching tipsets.
    #[strum(to_string = "in progress")]
    InProgress,
    /// The walk connected the target head to genesis.
    #[strum(to_string = "synced to genesis")]
    SyncedToGenesis,
    /// A block fetched for this walk failed validation.
    #[strum(to_string = "bad blocks")]
    BadBlocks,
    /// The walk aborted on an internal error.
    #[strum(to_string = "internal error")]
    InternalError,
}

/// Observable state of the current (or last) sync job.
#[derive(Clone, Debug, Default)]
pub struct SyncStatus {
    /// Peer the target head was announced by
    pub peer: Option<PeerId>,
    /// The target head being synced to
    pub head: Option<TipsetKey>,
    /// Hash of the tipset the job is waiting for
    pub next: Option<TipsetHash>,
    /// Hash of the last tipset stored
    pub last_loaded: Option<TipsetHash>,
    pub stage: SyncStage,
    pub error: Option<Error>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl SyncStatus {
    /// Resets the status for a fresh walk towards `head`.
    pub fn init(&mut self, peer: PeerId, head: TipsetKey) {
        *self = Self {
            peer: Some(peer),
            head: Some(head),
            stage: SyncStage::InProgress,
            start: Some(Utc::now()),
            ..Default::default()
        };
    }

    /// Closes the walk with its final stage.
    pub fn finish(&mut self, stage: SyncStage, error: Option<Error>) {
        self.stage = stage;
        self.error = error;
        self.end = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_display() {
        assert_eq!(SyncStage::Idle.to_string(), "idle");
        assert_eq!(SyncStage::SyncedToGenesis.to_string(), "synced to genesis");
    }

    #[test]
    fn init_resets_previous_run() {
        let mut status = SyncStatus::default();
        status.finish(SyncStage::InternalError, None);
        status.init(crate::libp2p::test_peer_id(1), TipsetKey::default());
        assert_eq!(status.stage, SyncStage::InProgress);
        assert!(status.error.is_none());
        assert!(status.end.is_none());
        assert!(status.start.is_some());
    }
}
