//! Configuration recognised by the node core.
//!
//! Plain serde structs with defaults matching the main network; each
//! section exposes a `sanitize` pass that clamps unworkable user values
//! instead of failing startup.

use crate::consensus::PowMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Election period arithmetic and committee sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", default)]
pub struct ElectionConfig {
    /// Snail blocks per election period.
    pub election_period_number: u64,
    /// Confirmation lag subtracted from the period end.
    pub snail_confirm_interval: u64,
    /// Tail of fast blocks granted past the last fruit of the window.
    pub election_switchover_number: u64,
    /// Smallest valid member count; also the members/backups split point.
    pub minimum_committee_number: usize,
    /// Number of lottery rounds, hence the largest possible draw.
    pub maximum_committee_number: u64,
    /// Minimum fruits a candidate must have mined inside the window.
    pub election_fruits_threshold: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        ElectionConfig {
            election_period_number: 180,
            snail_confirm_interval: 12,
            election_switchover_number: 9600,
            minimum_committee_number: 7,
            maximum_committee_number: 23,
            election_fruits_threshold: 100,
        }
    }
}

impl ElectionConfig {
    pub fn sanitize(mut self) -> Self {
        if self.election_period_number == 0 {
            tracing::warn!("sanitizing zero election period to 1");
            self.election_period_number = 1;
        }
        if self.snail_confirm_interval >= self.election_period_number {
            let fixed = self.election_period_number.saturating_sub(1);
            tracing::warn!(
                provided = self.snail_confirm_interval,
                updated = fixed,
                "sanitizing confirm interval to below the election period"
            );
            self.snail_confirm_interval = fixed;
        }
        self
    }
}

/// Fruit pool limits and journaling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", default)]
pub struct SnailPoolConfig {
    /// Journal of local fruits surviving node restarts; `None` disables.
    pub journal: Option<PathBuf>,
    /// Interval between journal rotations, in seconds (min 1).
    pub rejournal_secs: u64,
    /// Cap on fruits held in memory.
    pub fruit_count: u64,
    /// Run freshness and header verification on admission; the sign-hash
    /// integrity check always runs.
    pub full_validation: bool,
}

impl Default for SnailPoolConfig {
    fn default() -> Self {
        SnailPoolConfig {
            journal: Some(PathBuf::from("fruits.rlp")),
            rejournal_secs: 3600,
            fruit_count: 8192,
            full_validation: true,
        }
    }
}

impl SnailPoolConfig {
    pub fn sanitize(mut self) -> Self {
        if self.rejournal_secs < 1 {
            tracing::warn!(
                provided = self.rejournal_secs,
                updated = 1u64,
                "sanitizing invalid snailpool journal time"
            );
            self.rejournal_secs = 1;
        }
        if self.fruit_count == 0 {
            tracing::warn!("sanitizing zero fruit pool cap to the default");
            self.fruit_count = SnailPoolConfig::default().fruit_count;
        }
        self
    }

    pub fn rejournal(&self) -> Duration {
        Duration::from_secs(self.rejournal_secs)
    }
}

/// Snail sealer operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", default)]
pub struct SealerConfig {
    pub pow_mode: PowMode,
    /// Worker threads; 0 selects `max(1, cpus - 1)`, one core stays
    /// reserved for fast-chain work.
    pub threads: usize,
}

/// Top-level core configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", default)]
pub struct Config {
    pub election: ElectionConfig,
    pub snail_pool: SnailPoolConfig,
    pub sealer: SealerConfig,
    /// Single-node deployments keep only the first genesis member and
    /// never elect.
    pub single_node: bool,
}

impl Config {
    pub fn sanitize(self) -> Self {
        Config {
            election: self.election.sanitize(),
            snail_pool: self.snail_pool.sanitize(),
            sealer: self.sealer,
            single_node: self.single_node,
        }
    }
}
