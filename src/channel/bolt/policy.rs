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

use std::ops::Range;

use lnwire::{AcceptChannel, ChannelType, OpenChannel};

/// Limit for the maximum number of the accepted HTLCs towards some node
pub const BOLT3_MAX_ACCEPTED_HTLC_LIMIT: u16 = 483;

/// BOLT-3 dust limit
pub const BOLT3_DUST_LIMIT: u64 = 354;

/// Channel funding limit for nodes without `option_support_large_channel`
pub const MAX_FUNDING_SATOSHIS: u64 = (1 << 24) - 1;

/// Errors from [BOLT-2] policy validations for `open_channel` and
/// `accept_channel` messages.
///
/// [BOLT-2]: https://github.com/lightning/bolts/blob/master/02-peer-protocol.md
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Display,
    Error,
    StrictEncode,
    StrictDecode
)]
#[display(doc_comments)]
pub enum PolicyError {
    /// proposed `to_self_delay` value {proposed} is unreasonably large and
    /// exceeds node policy limit of {allowed_maximum}; rejecting the channel
    /// according to BOLT-2
    ToSelfDelayUnreasonablyLarge { proposed: u16, allowed_maximum: u16 },

    /// proposed limit for maximum accepted number of HTLCs {0} exceeds
    /// BOLT-3 requirement to be below 483; rejecting the channel according
    /// to BOLT-2
    MaxAcceptedHtlcLimitExceeded(u16),

    /// proposed fee rate {proposed} sat/kw is outside of the fee rate policy
    /// of the local node ({lowest_accepted}..{highest_accepted} sat/kw);
    /// rejecting the channel according to BOLT-2
    FeeRateUnreasonable {
        proposed: u32,
        lowest_accepted: u32,
        highest_accepted: u32,
    },

    /// proposed channel reserve limit {reserve} sat is less than dust limit
    /// {dust_limit} sat; rejecting the channel according to BOLT-2
    ChannelReserveLessDust { reserve: u64, dust_limit: u64 },

    /// dust limit {0} sat is less than protocol minimum requirement of 354
    /// sat; rejecting the channel according to BOLT-2
    DustLimitTooSmall(u64),

    /// offered channel funding of {proposed} sat is too small and less than
    /// {required_minimum} required by the node policy; rejecting the channel
    /// according to BOLT-2
    ChannelFundingTooSmall {
        proposed: u64,
        required_minimum: u64,
    },

    /// offered channel funding of {proposed} sat exceeds the maximum channel
    /// size of {allowed_maximum} accepted by the node policy; rejecting the
    /// channel
    ChannelFundingTooLarge {
        proposed: u64,
        allowed_maximum: u64,
    },

    /// HTLC minimum {proposed} is too large and exceeds node policy
    /// requirements ({allowed_maximum}); rejecting the channel according to
    /// BOLT-2
    HtlcMinimumTooLarge { proposed: u64, allowed_maximum: u64 },

    /// HTLC-in-flight maximum requirement of {proposed} is too small and
    /// does not match the node policy; the smallest requirement is
    /// {required_minimum}; rejecting the channel according to BOLT-2
    HtlcInFlightMaximumTooSmall {
        proposed: u64,
        required_minimum: u64,
    },

    /// requested {proposed} channel reserve is too large and exceeds local
    /// policy requirement of {allowed_maximum}; rejecting the channel
    /// according to BOLT-2
    ChannelReserveTooLarge { proposed: u64, allowed_maximum: u64 },

    /// maximum number of HTLCs {proposed} that can be accepted by the remote
    /// node is too small and does not match node policy requirement of
    /// {required_minimum}; rejecting the channel according to BOLT-2
    MaxAcceptedHtlcsTooSmall {
        proposed: u16,
        required_minimum: u16,
    },

    /// dust limit {proposed} sats exceeds node policy requirement of
    /// {allowed_maximum}; rejecting the channel according to BOLT-2
    DustLimitTooLarge { proposed: u64, allowed_maximum: u64 },

    /// minimum depth of {proposed} requested by the remote peer exceeds
    /// local policy limit of {allowed_maximum}; rejecting the channel
    /// according to BOLT-2
    UnreasonableMinDepth { proposed: u32, allowed_maximum: u32 },

    /// `channel_reserve_satoshis` ({channel_reserve}) is less than
    /// `dust_limit_satoshis` ({dust_limit}) within the `open_channel`
    /// message; rejecting the channel according to BOLT-2
    LocalDustExceedsRemoteReserve {
        channel_reserve: u64,
        dust_limit: u64,
    },

    /// `channel_reserve_satoshis` from the open_channel message
    /// ({channel_reserve}) is less than `dust_limit_satoshis`
    /// ({dust_limit}); rejecting the channel according to BOLT-2
    RemoteDustExceedsLocalReserve {
        channel_reserve: u64,
        dust_limit: u64,
    },

    /// the remote peer proposed channel type {0} which this node does not
    /// serve; rejecting the channel
    UnsupportedChannelType(ChannelType),
}

/// Policy to validate channel parameters proposed by a remote peer.
///
/// By default, a channel uses a reasonable default policy created by
/// [`Policy::default()`]. Channel creator may provide a custom policy
/// instead.
#[derive(Clone, Eq, PartialEq, Hash, Debug, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Policy {
    /// Reasonable limit to check value of `to_self_delay` required by a
    /// remote node, in blocks.
    pub to_self_delay_max: u16,

    /// Range of acceptable channel fees.
    pub feerate_per_kw_range: Range<u32>,

    /// Minimum funding transaction mining depth required from the remote
    /// node for a channel proposed by it.
    pub minimum_depth: u32,

    /// Maximum funding transaction mining depth which may be required by a
    /// remote node for a channel opened by a local node.
    pub maximum_depth: Option<u32>,

    /// Minimum funding for a channel accepted by this node.
    pub funding_satoshis_min: Option<u64>,

    /// Maximum channel size accepted by this node. When `None`, the BOLT-2
    /// limit applies unless `wumbo_channels` is set.
    pub funding_satoshis_max: Option<u64>,

    /// Whether channels above the 2²⁴-1 satoshi BOLT-2 limit
    /// (`option_support_large_channel`) are accepted.
    pub wumbo_channels: bool,

    /// The maximum acceptable limit on the value stored in a single HTLC.
    pub htlc_minimum_msat_max: Option<u64>,

    /// Minimum boundary for the upper limit of in-flight HTLC funds.
    pub max_htlc_value_in_flight_msat_min: Option<u64>,

    /// Maximum reserve for a channel from a local node required by the
    /// remote node in absolute value.
    pub channel_reserve_satoshis_max_abs: Option<u64>,

    /// Maximum reserve for a channel from a local node required by the
    /// remote node in percents from the channel funding.
    pub channel_reserve_satoshis_max_percent: Option<u8>,

    /// Minimum boundary to the limit of HTLCs offered to a remote peer.
    pub max_accepted_htlcs_min: Option<u16>,

    /// Maximum value for the dust limit required by a remote node.
    pub dust_limit_satoshis_max: Option<u64>,
}

impl Default for Policy {
    /// Sets reasonable values for the local node policies
    fn default() -> Policy {
        Policy {
            to_self_delay_max: 14 * 24 * 6,
            // normal operational range for the fees in bitcoin network
            feerate_per_kw_range: 253..25_000,
            // three blocks is enough to get sufficient security
            minimum_depth: 3,
            // six blocks provides the necessary security
            maximum_depth: Some(6),
            // no reason of spamming blockchain with channels < 20000 sats
            funding_satoshis_min: Some(20000),
            funding_satoshis_max: None,
            wumbo_channels: false,
            // HTLCs can be arbitrary small:
            htlc_minimum_msat_max: None,
            // we need to earn commissions on routing, so limiting HTLCs too
            // much does not make sense
            max_htlc_value_in_flight_msat_min: Some(10000),
            max_accepted_htlcs_min: Some(10),
            channel_reserve_satoshis_max_abs: None,
            // we do not want to over-collateralize our channels: the reserve
            // should not exceed 1% of funds in the channel
            channel_reserve_satoshis_max_percent: Some(1),
            dust_limit_satoshis_max: Some(546),
        }
    }
}

impl Policy {
    /// Maximum funding this policy accepts, combining the explicit limit
    /// with the wumbo flag
    pub fn effective_max_funding(&self) -> u64 {
        match (self.funding_satoshis_max, self.wumbo_channels) {
            (Some(limit), _) => limit,
            (None, true) => u64::MAX,
            (None, false) => MAX_FUNDING_SATOSHIS,
        }
    }

    fn validate_peer_params(
        &self,
        params: PeerParams,
    ) -> Result<(), PolicyError> {
        // if `to_self_delay` is unreasonably large.
        if params.to_self_delay > self.to_self_delay_max {
            return Err(PolicyError::ToSelfDelayUnreasonablyLarge {
                proposed: params.to_self_delay,
                allowed_maximum: self.to_self_delay_max,
            });
        }

        // if `max_accepted_htlcs` is greater than 483.
        if params.max_accepted_htlcs > BOLT3_MAX_ACCEPTED_HTLC_LIMIT {
            return Err(PolicyError::MaxAcceptedHtlcLimitExceeded(
                params.max_accepted_htlcs,
            ));
        }

        // if `dust_limit_satoshis` is greater than
        // `channel_reserve_satoshis`.
        if params.dust_limit_satoshis > params.channel_reserve_satoshis {
            return Err(PolicyError::ChannelReserveLessDust {
                reserve: params.channel_reserve_satoshis,
                dust_limit: params.dust_limit_satoshis,
            });
        }

        // if `dust_limit_satoshis` is smaller than 354 satoshis
        if params.dust_limit_satoshis < BOLT3_DUST_LIMIT {
            return Err(PolicyError::DustLimitTooSmall(
                params.dust_limit_satoshis,
            ));
        }

        // if we consider `htlc_minimum_msat` too large
        if let Some(limit) = self.htlc_minimum_msat_max {
            if params.htlc_minimum_msat > limit {
                return Err(PolicyError::HtlcMinimumTooLarge {
                    proposed: params.htlc_minimum_msat,
                    allowed_maximum: limit,
                });
            }
        }

        // if we consider `max_htlc_value_in_flight_msat` too small
        if let Some(limit) = self.max_htlc_value_in_flight_msat_min {
            if params.max_htlc_value_in_flight_msat < limit {
                return Err(PolicyError::HtlcInFlightMaximumTooSmall {
                    proposed: params.max_htlc_value_in_flight_msat,
                    required_minimum: limit,
                });
            }
        }

        // if we consider `channel_reserve_satoshis` too large in absolute
        // values
        if let Some(limit) = self.channel_reserve_satoshis_max_abs {
            if params.channel_reserve_satoshis > limit {
                return Err(PolicyError::ChannelReserveTooLarge {
                    proposed: params.channel_reserve_satoshis,
                    allowed_maximum: limit,
                });
            }
        }

        // if we consider `max_accepted_htlcs` too small
        if let Some(limit) = self.max_accepted_htlcs_min {
            if params.max_accepted_htlcs < limit {
                return Err(PolicyError::MaxAcceptedHtlcsTooSmall {
                    proposed: params.max_accepted_htlcs,
                    required_minimum: limit,
                });
            }
        }

        // if we consider `dust_limit_satoshis` too large
        if let Some(limit) = self.dust_limit_satoshis_max {
            if params.dust_limit_satoshis > limit {
                return Err(PolicyError::DustLimitTooLarge {
                    proposed: params.dust_limit_satoshis,
                    allowed_maximum: limit,
                });
            }
        }

        Ok(())
    }

    /// Validates parameters proposed by remote peer in `open_channel`
    /// message against the policy.
    ///
    /// # Returns
    /// [`PeerParams`] to use for constructing channel transactions which
    /// should be signed by the local node.
    pub fn validate_inbound(
        &self,
        open_channel: &OpenChannel,
    ) -> Result<PeerParams, PolicyError> {
        // only basic and static-remotekey channels are served; anchor
        // commitments require a CPFP carve-out this node does not implement
        if let Some(channel_type) = open_channel.channel_type {
            if channel_type.is_anchored() {
                return Err(PolicyError::UnsupportedChannelType(channel_type));
            }
        }

        // if we consider `feerate_per_kw` too small for timely processing or
        // unreasonably large.
        if !self
            .feerate_per_kw_range
            .contains(&open_channel.feerate_per_kw)
        {
            return Err(PolicyError::FeeRateUnreasonable {
                proposed: open_channel.feerate_per_kw,
                lowest_accepted: self.feerate_per_kw_range.start,
                highest_accepted: self.feerate_per_kw_range.end,
            });
        }

        // if `funding_satoshis` is too small
        if let Some(limit) = self.funding_satoshis_min {
            if open_channel.funding_satoshis < limit {
                return Err(PolicyError::ChannelFundingTooSmall {
                    proposed: open_channel.funding_satoshis,
                    required_minimum: limit,
                });
            }
        }

        // if `funding_satoshis` exceeds the maximum channel size
        let max_funding = self.effective_max_funding();
        if open_channel.funding_satoshis > max_funding {
            return Err(PolicyError::ChannelFundingTooLarge {
                proposed: open_channel.funding_satoshis,
                allowed_maximum: max_funding,
            });
        }

        // if we consider `channel_reserve_satoshis` too large in relative
        // values
        if let Some(percents) = self.channel_reserve_satoshis_max_percent {
            let limit =
                open_channel.funding_satoshis / 100 * percents as u64;
            if open_channel.channel_reserve_satoshis > limit {
                return Err(PolicyError::ChannelReserveTooLarge {
                    proposed: open_channel.channel_reserve_satoshis,
                    allowed_maximum: limit,
                });
            }
        }

        let peer_params = PeerParams::from(open_channel);
        self.validate_peer_params(peer_params)?;
        Ok(peer_params)
    }

    /// Confirms that parameters which were asked by a remote node via
    /// `accept_channel` message conform to our policy.
    ///
    /// # Arguments
    /// - `self`: local policy;
    /// - `our_params`: parameters proposed by the local node in
    ///   `open_channel` message;
    /// - `accept_channel`: BOLT-2 message received from the peer.
    ///
    /// # Returns
    /// [`PeerParams`] to use for constructing channel transactions which
    /// should be signed by the local node.
    pub fn confirm_outbound(
        &self,
        our_params: PeerParams,
        accept_channel: &AcceptChannel,
    ) -> Result<PeerParams, PolicyError> {
        // if `minimum_depth` is unreasonably large:
        //
        //     MAY reject the channel.
        if let Some(limit) = self.maximum_depth {
            if accept_channel.minimum_depth > limit {
                return Err(PolicyError::UnreasonableMinDepth {
                    proposed: accept_channel.minimum_depth,
                    allowed_maximum: limit,
                });
            }
        }

        // if `channel_reserve_satoshis` is less than `dust_limit_satoshis`
        // within the open_channel message:
        //
        //     MUST reject the channel.
        if accept_channel.channel_reserve_satoshis
            < our_params.dust_limit_satoshis
        {
            return Err(PolicyError::LocalDustExceedsRemoteReserve {
                channel_reserve: accept_channel.channel_reserve_satoshis,
                dust_limit: our_params.dust_limit_satoshis,
            });
        }

        // if `channel_reserve_satoshis` from the open_channel message is
        // less than `dust_limit_satoshis`:
        //
        //     MUST reject the channel.
        if our_params.channel_reserve_satoshis
            < accept_channel.dust_limit_satoshis
        {
            return Err(PolicyError::RemoteDustExceedsLocalReserve {
                channel_reserve: our_params.channel_reserve_satoshis,
                dust_limit: accept_channel.dust_limit_satoshis,
            });
        }

        let peer_params = PeerParams::from(accept_channel);
        self.validate_peer_params(peer_params)?;
        Ok(peer_params)
    }
}

/// Part of the channel configuration (and state, as it contains adjustable
/// fee) which must follow specific policies and be accepted or validated
/// basing on those policies and additional protocol-level requirements.
///
/// This information applies for both channel peers and is used in
/// constructing both sides of asymmetric transactions.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct CommonParams {
    /// Minimum depth of the funding transaction before the channel is
    /// considered open
    pub minimum_depth: u32,

    /// indicates the initial fee rate in satoshi per 1000-weight (i.e. 1/4
    /// the more normally-used 'satoshi per 1000 vbytes') that this side
    /// will pay for commitment and HTLC transactions, as described in
    /// BOLT #3 (this can be adjusted later with an update_fee message).
    pub feerate_per_kw: u32,

    /// The least-significant bit of `channel_flags`. Indicates whether the
    /// initiator of the funding flow wishes to advertise this channel
    /// publicly to the network, as detailed within BOLT #7.
    pub announce_channel: bool,

    /// Channel types are an explicit enumeration: for convenience of future
    /// definitions they reuse even feature bits, but they are not an
    /// arbitrary combination (they represent the persistent features which
    /// affect the channel operation).
    pub channel_type: ChannelType,
}

impl Default for CommonParams {
    /// Sets reasonable values for the common channel parameters used in
    /// constructing `open_channel` message.
    ///
    /// Usually this should not be used and instead the channel should be
    /// provided with custom parameters basing on the current state of the
    /// bitcoin mempool and hash rate.
    fn default() -> Self {
        CommonParams {
            minimum_depth: 3,
            feerate_per_kw: 256,
            announce_channel: true,
            channel_type: ChannelType::default(),
        }
    }
}

impl CommonParams {
    /// Extracts common parameters from the incoming `open_channel` message
    /// and local default requirement for the minimum depth.
    #[inline]
    pub fn with(open_channel: &OpenChannel, minimum_depth: u32) -> Self {
        CommonParams {
            minimum_depth,
            feerate_per_kw: open_channel.feerate_per_kw,
            announce_channel: open_channel.should_announce_channel(),
            channel_type: open_channel.channel_type.unwrap_or_default(),
        }
    }
}

/// Structure containing part of the channel state which must follow specific
/// policies and be accepted or validated basing on those policies and
/// additional protocol-level requirements.
///
/// This information applies only to one of the peers and is requested by the
/// other peer. It is used in constructing transactions which should be
/// signed by the node demanding these requirements.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct PeerParams {
    /// The threshold below which outputs on transactions broadcast by
    /// sender will be omitted
    pub dust_limit_satoshis: u64,

    /// The number of blocks which the counterparty will have to wait to
    /// claim on-chain funds if they broadcast a commitment transaction
    pub to_self_delay: u16,

    /// Indicates the smallest value HTLC this node will accept.
    pub htlc_minimum_msat: u64,

    /// The maximum inbound HTLC value in flight towards sender, in
    /// milli-satoshi
    pub max_htlc_value_in_flight_msat: u64,

    /// The minimum value unencumbered by HTLCs for the counterparty to keep
    /// in the channel
    pub channel_reserve_satoshis: u64,

    /// The maximum number of inbound HTLCs towards sender
    pub max_accepted_htlcs: u16,
}

impl Default for PeerParams {
    /// Sets reasonable values for the channel parameters requested from the
    /// other peer in sent `open_channel` or `accept_channel` messages
    fn default() -> Self {
        PeerParams {
            dust_limit_satoshis: BOLT3_DUST_LIMIT,
            to_self_delay: 144,
            htlc_minimum_msat: 1,
            max_htlc_value_in_flight_msat: 1_000_000_000,
            channel_reserve_satoshis: 10000,
            max_accepted_htlcs: BOLT3_MAX_ACCEPTED_HTLC_LIMIT,
        }
    }
}

impl From<&OpenChannel> for PeerParams {
    /// Extracts peer-specific parameters from the incoming `open_channel`
    /// message. These parameters are applied to the local node.
    #[inline]
    fn from(open_channel: &OpenChannel) -> Self {
        PeerParams {
            dust_limit_satoshis: open_channel.dust_limit_satoshis,
            to_self_delay: open_channel.to_self_delay,
            htlc_minimum_msat: open_channel.htlc_minimum_msat,
            max_htlc_value_in_flight_msat: open_channel
                .max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: open_channel.channel_reserve_satoshis,
            max_accepted_htlcs: open_channel.max_accepted_htlcs,
        }
    }
}

impl From<&AcceptChannel> for PeerParams {
    /// Extracts peer-specific parameters from the incoming `accept_channel`
    /// message. These parameters are applied to the local node.
    #[inline]
    fn from(accept_channel: &AcceptChannel) -> Self {
        PeerParams {
            dust_limit_satoshis: accept_channel.dust_limit_satoshis,
            to_self_delay: accept_channel.to_self_delay,
            htlc_minimum_msat: accept_channel.htlc_minimum_msat,
            max_htlc_value_in_flight_msat: accept_channel
                .max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: accept_channel.channel_reserve_satoshis,
            max_accepted_htlcs: accept_channel.max_accepted_htlcs,
        }
    }
}

#[cfg(test)]
mod test {
    use amplify::DumbDefault;

    use super::*;

    // Returns an open channel message passing the default policy.
    fn get_open_channel() -> OpenChannel {
        let mut open_channel = OpenChannel::dumb_default();
        open_channel.funding_satoshis = 1_000_000;
        open_channel.to_self_delay = 144;
        open_channel.max_accepted_htlcs = BOLT3_MAX_ACCEPTED_HTLC_LIMIT;
        open_channel.channel_reserve_satoshis = 10000;
        open_channel.max_htlc_value_in_flight_msat = 10000;
        open_channel.dust_limit_satoshis = BOLT3_DUST_LIMIT;
        open_channel.htlc_minimum_msat = 10;
        open_channel.feerate_per_kw = 256;

        open_channel
    }

    // Returns an accept channel message matching `get_open_channel`.
    fn get_accept_channel() -> AcceptChannel {
        let mut accept_channel = AcceptChannel::dumb_default();
        accept_channel.minimum_depth = 3;
        accept_channel.to_self_delay = 144;
        accept_channel.max_accepted_htlcs = BOLT3_MAX_ACCEPTED_HTLC_LIMIT;
        accept_channel.channel_reserve_satoshis = 10000;
        accept_channel.max_htlc_value_in_flight_msat = 10000;
        accept_channel.dust_limit_satoshis = BOLT3_DUST_LIMIT;
        accept_channel.htlc_minimum_msat = 10;

        accept_channel
    }

    #[test]
    fn accepts_reasonable_open_channel() {
        let policy = Policy::default();
        let open_channel = get_open_channel();
        let params = policy.validate_inbound(&open_channel).unwrap();
        assert_eq!(params, PeerParams::from(&open_channel));
    }

    #[test]
    fn to_self_delay_too_large() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();

        open_channel.to_self_delay = policy.to_self_delay_max + 1;

        let params = PeerParams::from(&open_channel);
        let error = policy.validate_peer_params(params);

        assert_eq!(
            error,
            Err(PolicyError::ToSelfDelayUnreasonablyLarge {
                proposed: params.to_self_delay,
                allowed_maximum: policy.to_self_delay_max,
            })
        );
    }

    #[test]
    fn max_accepted_htlc_limit_exceeded() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();

        open_channel.max_accepted_htlcs = BOLT3_MAX_ACCEPTED_HTLC_LIMIT + 1;

        let params = PeerParams::from(&open_channel);
        let error = policy.validate_peer_params(params);

        assert_eq!(
            error,
            Err(PolicyError::MaxAcceptedHtlcLimitExceeded(
                params.max_accepted_htlcs,
            ))
        );
    }

    #[test]
    fn channel_reserve_less_than_dust_limit() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();

        open_channel.channel_reserve_satoshis =
            open_channel.dust_limit_satoshis - 1;

        let params = PeerParams::from(&open_channel);
        let error = policy.validate_peer_params(params);

        assert_eq!(
            error,
            Err(PolicyError::ChannelReserveLessDust {
                dust_limit: params.dust_limit_satoshis,
                reserve: params.channel_reserve_satoshis,
            })
        );
    }

    #[test]
    fn dust_limit_is_too_small() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();

        open_channel.dust_limit_satoshis = BOLT3_DUST_LIMIT - 1;

        let params = PeerParams::from(&open_channel);
        let error = policy.validate_peer_params(params);

        assert_eq!(
            error,
            Err(PolicyError::DustLimitTooSmall(params.dust_limit_satoshis))
        );
    }

    #[test]
    fn unreasonable_feerate_on_inbound() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();
        open_channel.feerate_per_kw = policy.feerate_per_kw_range.end + 1;
        let error = policy.validate_inbound(&open_channel);
        assert_eq!(
            error,
            Err(PolicyError::FeeRateUnreasonable {
                proposed: open_channel.feerate_per_kw,
                lowest_accepted: policy.feerate_per_kw_range.start,
                highest_accepted: policy.feerate_per_kw_range.end,
            })
        );
    }

    #[test]
    fn channel_funding_too_small() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();
        let funding_satoshis_min = policy.funding_satoshis_min.unwrap();
        open_channel.funding_satoshis = funding_satoshis_min - 1;
        let error = policy.validate_inbound(&open_channel);
        assert_eq!(
            error,
            Err(PolicyError::ChannelFundingTooSmall {
                proposed: open_channel.funding_satoshis,
                required_minimum: funding_satoshis_min,
            })
        );
    }

    #[test]
    fn oversize_channel_needs_wumbo() {
        let mut policy = Policy::default();
        let mut open_channel = get_open_channel();
        open_channel.funding_satoshis = MAX_FUNDING_SATOSHIS + 1;
        open_channel.channel_reserve_satoshis =
            open_channel.funding_satoshis / 100;

        let error = policy.validate_inbound(&open_channel);
        assert_eq!(
            error,
            Err(PolicyError::ChannelFundingTooLarge {
                proposed: open_channel.funding_satoshis,
                allowed_maximum: MAX_FUNDING_SATOSHIS,
            })
        );

        policy.wumbo_channels = true;
        assert!(policy.validate_inbound(&open_channel).is_ok());

        // An explicit limit still binds wumbo nodes
        policy.funding_satoshis_max = Some(30_000_000);
        open_channel.funding_satoshis = 50_000_000;
        open_channel.channel_reserve_satoshis =
            open_channel.funding_satoshis / 100;
        assert_eq!(
            policy.validate_inbound(&open_channel),
            Err(PolicyError::ChannelFundingTooLarge {
                proposed: 50_000_000,
                allowed_maximum: 30_000_000,
            })
        );
    }

    #[test]
    fn anchor_channel_type_rejected() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();
        open_channel.channel_type =
            Some(ChannelType::AnchorOutputsStaticRemotekey);
        assert_eq!(
            policy.validate_inbound(&open_channel),
            Err(PolicyError::UnsupportedChannelType(
                ChannelType::AnchorOutputsStaticRemotekey
            ))
        );

        open_channel.channel_type = Some(ChannelType::StaticRemotekey);
        assert!(policy.validate_inbound(&open_channel).is_ok());
    }

    #[test]
    fn unreasonable_min_depth() {
        let policy = Policy::default();
        let open_channel = get_open_channel();
        let mut accept_channel = get_accept_channel();
        let maximum_depth = policy.maximum_depth.unwrap();
        accept_channel.minimum_depth = maximum_depth + 1;
        let params = PeerParams::from(&open_channel);
        let error = policy.confirm_outbound(params, &accept_channel);
        assert_eq!(
            error,
            Err(PolicyError::UnreasonableMinDepth {
                proposed: accept_channel.minimum_depth,
                allowed_maximum: maximum_depth,
            })
        );
    }

    #[test]
    fn local_dust_limit_exceeds_remote_reserve() {
        let policy = Policy::default();
        let open_channel = get_open_channel();
        let mut accept_channel = get_accept_channel();
        accept_channel.channel_reserve_satoshis =
            open_channel.dust_limit_satoshis - 1;
        let params = PeerParams::from(&open_channel);
        let error = policy.confirm_outbound(params, &accept_channel);
        assert_eq!(
            error,
            Err(PolicyError::LocalDustExceedsRemoteReserve {
                channel_reserve: accept_channel.channel_reserve_satoshis,
                dust_limit: params.dust_limit_satoshis,
            })
        );
    }

    #[test]
    fn remote_dust_limit_exceeds_local_reserve() {
        let policy = Policy::default();
        let mut open_channel = get_open_channel();
        let accept_channel = get_accept_channel();
        open_channel.channel_reserve_satoshis =
            accept_channel.dust_limit_satoshis - 1;
        let params = PeerParams::from(&open_channel);
        let error = policy.confirm_outbound(params, &accept_channel);
        assert_eq!(
            error,
            Err(PolicyError::RemoteDustExceedsLocalReserve {
                channel_reserve: params.channel_reserve_satoshis,
                dust_limit: accept_channel.dust_limit_satoshis,
            })
        );
    }
}
