// LNP Node Core Library implementing Lightning network channels
// and HTLC switching.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Operator-tunable configuration of the node core.

use std::time::Duration;

use crate::channel::bolt::Policy;

/// Configuration of the funding manager
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct FundingConfig {
    /// How long an unfinished channel reservation may stay idle before the
    /// zombie sweeper evicts it and errors the peer
    pub reservation_timeout: Duration,

    /// How often the zombie sweeper scans the reservation table
    pub zombie_sweep_interval: Duration,

    /// Maximum number of confirmations a remote peer may require from our
    /// funding before we reject the channel
    pub max_num_confs: u32,
}

impl Default for FundingConfig {
    fn default() -> Self {
        FundingConfig {
            reservation_timeout: Duration::from_secs(600),
            zombie_sweep_interval: Duration::from_secs(60),
            max_num_confs: 6,
        }
    }
}

/// Configuration of a channel link
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct LinkConfig {
    /// Number of batched updates which seals the batch with a
    /// `commitment_signed` regardless of the idle timer
    pub batch_limit: usize,

    /// Tail idle time after which a non-empty batch is sealed
    pub batch_idle: Duration,

    /// Interval of the keepalive pings sent over an idle connection
    pub ping_interval: Duration,

    /// Number of blocks before an outgoing HTLC expiry at which the link
    /// hands the channel over to the arbitrator
    pub expiry_safety_delta: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            batch_limit: 16,
            batch_idle: Duration::from_millis(50),
            ping_interval: Duration::from_secs(60),
            expiry_safety_delta: 3,
        }
    }
}

/// Configuration of the sweeper
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct SweepConfig {
    /// Blocks to wait for a published sweep to confirm before the first fee
    /// bump
    pub patience_blocks: u32,

    /// Blocks between subsequent fee bumps of an unconfirmed sweep
    pub bump_interval_blocks: u32,

    /// Fee rate multiplier applied on every bump, in percent (150 = 1.5×)
    pub bump_multiplier_percent: u32,

    /// Upper bound on the fee rate relative to the initial one, as a
    /// multiplier
    pub max_bump_multiplier: u32,

    /// Default fee rate for sweeps when no estimate is available, sat/kw
    pub default_feerate_per_kw: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            patience_blocks: 30,
            bump_interval_blocks: 10,
            bump_multiplier_percent: 150,
            max_bump_multiplier: 10,
            default_feerate_per_kw: 1000,
        }
    }
}

/// Top-level configuration of the node core
#[derive(Clone, PartialEq, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Config {
    /// Policy applied to inbound and outbound channel negotiation
    pub policy: Policy,

    /// Funding manager knobs
    pub funding: FundingConfig,

    /// Per-link knobs
    pub link: LinkConfig,

    /// Sweeper knobs
    pub sweep: SweepConfig,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert!(config.funding.reservation_timeout
            > config.funding.zombie_sweep_interval);
        assert!(config.sweep.bump_multiplier_percent > 100);
        assert!(config.sweep.max_bump_multiplier >= 1);
        assert!(config.link.batch_limit > 0);
    }
}
