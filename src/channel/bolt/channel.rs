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

//! The BOLT channel state machine.
//!
//! [`BoltChannel`] is the channel constructor extension owning the update
//! log, both commitment chains and the per-commitment secret chains. The
//! protocol operations (HTLC updates, the sign/revoke cycle and channel
//! re-establishment) are exposed on `Channel<BoltExt>`, which combines the
//! core with the HTLC and ordering extensions for commitment construction.

use amplify::{DumbDefault, Slice32, Wrapper};
use bitcoin::blockdata::{opcodes::all::*, script};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::PublicKey;
use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
use bitcoin::{Network, TxOut, Txid};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use bitcoin_scripts::{LockScript, PubkeyScript, WitnessScript};
use lnwire::{
    AcceptChannel, ActiveChannelId, ChannelId, ChannelReestablish,
    CommitmentSigned, FundingLocked, Messages, OpenChannel, RevokeAndAck,
    TempChannelId, UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc,
    UpdateFee, UpdateFulfillHtlc,
};
use secp256k1::ecdsa::Signature;
use secp256k1::{SecretKey, SECP256K1};
use wallet::lex_order::LexOrder;

use super::htlc::{commitment_fee, htlc_dust_threshold};
use super::keyset::{
    derive_pubkey, derive_revocation_pubkey, LocalKeyset, LocalPubkey,
    RemoteKeyset,
};
use super::policy::{CommonParams, PeerParams, Policy, PolicyError};
use super::updates::{
    ChainSide, Commitment, CommitmentChain, LogError, Originator,
    UpdateDetails, UpdateLog,
};
use super::{
    BoltExt, ChannelState, CommitmentView, Lifecycle, StagedHtlc, UpdateMsg,
};
use crate::channel::{
    funding, Channel, ChannelConstructor, ChannelExtension, Extension,
    Funding, PsbtFunding, TxGraph,
};
use crate::shachain::{self, ShaChainProducer, ShaChainStore, START_INDEX};
use crate::wallet::{segwit_sighash, ChannelSigner, SignError};
use crate::ErrorKind;

/// Number of blocks the HTLC expiry must stay ahead of the best height for
/// the HTLC to be accepted into the channel
pub const CLTV_EXPIRY_GRACE: u32 = 18;

/// Upper bound for CLTV expiry values, BOLT-2
pub const CLTV_EXPIRY_MAX: u32 = 500_000_000;

/// Channel errors which may be returned by the state machine operations.
// TODO: Split the protocol-violation part into a dedicated type once the
//       arbitrator interface settles.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// Error in channel funding: {0}
    #[from]
    Funding(funding::Error),

    /// Error reestablishing channel
    #[display(inner)]
    #[from]
    ChannelReestablish(ReestablishError),

    /// Policy errors happening during channel negotiation
    #[from]
    #[display(inner)]
    Policy(PolicyError),

    /// Signing error: {0}
    #[from]
    Sign(SignError),

    /// channel is in a state {current} incompatible with the requested
    /// operation
    LifecycleMismatch {
        current: Lifecycle,
        required: &'static [Lifecycle],
    },

    /// the channel does not have a permanent channel_id assigned yet
    NoChannelId,

    /// the channel must have a temporary channel id and not be active for
    /// the operation
    NoTemporaryId,

    /// HTLC amount {amount_msat} msat is below the minimum {htlc_minimum_msat}
    /// msat accepted by the peer
    BelowMinimum {
        amount_msat: u64,
        htlc_minimum_msat: u64,
    },

    /// HTLC amount is zero or not representable
    InvalidAmount,

    /// total HTLC value in flight {in_flight_msat} msat would exceed the
    /// limit of {max_htlc_value_in_flight_msat} msat
    ExceedsMaxInFlight {
        in_flight_msat: u64,
        max_htlc_value_in_flight_msat: u64,
    },

    /// the number of accepted HTLCs would exceed the negotiated limit of
    /// {max_accepted_htlcs}
    ExceedsMaxAccepted { max_accepted_htlcs: u16 },

    /// balance of {available_msat} msat is insufficient for an HTLC of
    /// {required_msat} msat after reserve and fees
    InsufficientBalance {
        available_msat: u64,
        required_msat: u64,
    },

    /// HTLC expiry {cltv_expiry} is too close to the current height
    /// {best_height}
    ExpiryTooSoon { cltv_expiry: u32, best_height: u32 },

    /// HTLC expiry {0} exceeds the maximum allowed absolute timelock value
    InvalidExpiry(u32),

    /// unknown HTLC index {0}
    UnknownHtlcIndex(u64),

    /// provided preimage does not match the hash lock of HTLC #{0}
    PreimageMismatch(u64),

    /// HTLC id {got} violates the strictly increasing id sequence; {expected}
    /// was expected
    HtlcIdViolation { expected: u64, got: u64 },

    /// proposed fee rate {proposed} sat/kw is below the minimum {minimum}
    /// sat/kw
    FeeTooLow { proposed: u32, minimum: u32 },

    /// `update_fee` is only allowed from the channel initiator
    UpdateFeeFromNonInitiator,

    /// no pending updates to commit into a new commitment
    NoUpdates,

    /// a new commitment can't be signed until the previous one is revoked by
    /// the remote peer
    UnackedCommitment,

    /// received a commitment while the previous local commitment is still
    /// not revoked
    CommitmentBeforeRevocation,

    /// initiator balance of {available_msat} msat cannot afford the
    /// commitment fee of {required_fee} sat
    CannotAffordFee {
        available_msat: u64,
        required_fee: u64,
    },

    /// invalid commitment transaction signature
    InvalidSignature,

    /// invalid signature for the HTLC transaction #{0}
    InvalidHtlcSignature(u64),

    /// number of HTLC signatures {got} does not match the number of
    /// commitment HTLC outputs {expected}
    WrongHtlcSignatureCount { expected: usize, got: usize },

    /// the revealed per-commitment secret does not match the advertised
    /// per-commitment point
    InvalidRevocation,

    /// revocation received out of order: {0}
    #[from]
    OutOfOrderRevocation(shachain::Error),

    /// received a revocation while no commitment is pending it
    UnexpectedRevocation,

    /// internal update log inconsistency: {0}
    #[from]
    Log(LogError),
}

impl Error {
    /// Classifies the error according to the recovery policy: errors which
    /// can cost funds translate into an immediate force-close intent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Policy(_)
            | Error::BelowMinimum { .. }
            | Error::ExceedsMaxInFlight { .. }
            | Error::ExceedsMaxAccepted { .. }
            | Error::InsufficientBalance { .. }
            | Error::ExpiryTooSoon { .. }
            | Error::FeeTooLow { .. }
            | Error::NoUpdates
            | Error::UnackedCommitment
            | Error::LifecycleMismatch { .. }
            | Error::NoChannelId
            | Error::NoTemporaryId => ErrorKind::PolicyRejection,

            Error::InvalidSignature
            | Error::InvalidHtlcSignature(_)
            | Error::WrongHtlcSignatureCount { .. }
            | Error::InvalidRevocation
            | Error::OutOfOrderRevocation(_)
            | Error::UnexpectedRevocation
            | Error::CommitmentBeforeRevocation
            | Error::HtlcIdViolation { .. }
            | Error::InvalidAmount
            | Error::InvalidExpiry(_)
            | Error::UpdateFeeFromNonInitiator
            | Error::CannotAffordFee { .. } => ErrorKind::ProtocolViolation,

            Error::Log(_) => ErrorKind::InvariantViolation,

            Error::UnknownHtlcIndex(_) | Error::PreimageMismatch(_) => {
                ErrorKind::NotFound
            }

            Error::Funding(_)
            | Error::Sign(_)
            | Error::ChannelReestablish(_) => ErrorKind::Transient,
        }
    }

    /// Detects whether the error must trigger a force-close of the channel
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvariantViolation | ErrorKind::ProtocolViolation
        )
    }
}

/// Errors during channel re-establishment
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum ReestablishError {
    /// requested to re-establish channel, but the local channel has no
    /// channel_id set meaning that the funding transaction was not
    /// published; failing the channel
    NoPermanentId,

    /// local channel id {local} does not match to the one provided by
    /// the remote peer ({remote}) during the channel reestablishment
    ChannelIdMismatch { remote: ChannelId, local: ChannelId },

    /// remote reports commitment number {claimed} incompatible with the
    /// local view {actual} of its chain; the channel state diverged
    /// irrecoverably
    CommitmentNumberMismatch { claimed: u64, actual: u64 },

    /// remote reports revocation number {claimed} incompatible with the
    /// {sent} revocations sent so far; possible local data loss — the
    /// channel must not be force-closed from this state
    RevocationNumberMismatch { claimed: u64, sent: u64 },
}

/// Channel direction
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[derive(StrictEncode, StrictDecode)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum Direction {
    /// Inbound channels accepted by the local node.
    ///
    /// Launched in response to received `open_channel` messages
    #[display("inbound")]
    Inbound,

    /// Outbound channels proposed to a remote node.
    ///
    /// Created by sending `open_channel` message
    #[display("outbound")]
    Outbound,
}

impl Direction {
    /// Detects if the channel is inbound
    #[inline]
    pub fn is_inbound(self) -> bool {
        self == Direction::Inbound
    }

    /// Detects if the channel is outbound
    #[inline]
    pub fn is_outbound(self) -> bool {
        self == Direction::Outbound
    }
}

/// HTLC which became locked in on both commitment chains and must now be
/// processed by the switch
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Forwardable {
    /// The original `update_add_htlc` carrying the onion packet
    pub add: UpdateAddHtlc,
}

/// Archived revoked remote commitment: everything the breach arbiter needs
/// to construct a justice transaction should this commitment ever appear
/// on-chain.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct RevokedCommitment {
    /// Height of the revoked commitment
    pub height: u64,
    /// Txid of the revoked commitment transaction
    pub txid: Option<Txid>,
    /// The disclosed per-commitment secret
    pub per_commitment_secret: SecretKey,
    /// The matching per-commitment point
    pub per_commitment_point: PublicKey,
    /// Balance of the remote at the revoked height, msat
    pub to_local_msat: u64,
    /// Balance of the local node at the revoked height, msat
    pub to_remote_msat: u64,
    /// HTLC outputs of the revoked commitment (directions relative to the
    /// remote node)
    pub htlcs: Vec<StagedHtlc>,
}

/// Action to take after processing a remote `channel_reestablish`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReestablishAction {
    /// Both sides agree on the channel state, no retransmission needed
    Synchronized,

    /// One or both of the last messages were lost in flight and must be
    /// retransmitted, revocation strictly before the commitment signature
    Retransmit {
        revocation: bool,
        commitment: bool,
    },
}

impl Channel<BoltExt> {
    /// Constructs the new channel which will check the negotiation process
    /// against the provided policy and use the given parameters for
    /// constructing `open_channel` (for outbound channels) and
    /// `accept_channel` (for inbound channels) messages.
    pub fn with(
        temp_channel_id: TempChannelId,
        chain_hash: Slice32,
        policy: Policy,
        common_params: CommonParams,
        local_params: PeerParams,
        local_keys: LocalKeyset,
    ) -> Self {
        let mut channel = Self::default();

        let core = channel.constructor_mut();
        core.set_temp_channel_id(temp_channel_id);
        core.set_chain_hash(chain_hash);
        core.set_policy(policy);
        core.set_common_params(common_params);
        core.set_local_params(local_params);
        core.set_local_keys(local_keys);

        channel
    }

    /// Sets channel policy.
    ///
    /// Can be used for changing the policy on the fly to enable accepting
    /// new `open_channel` - or follow-up `accept_channel` requests.
    #[inline]
    pub fn set_policy(&mut self, policy: Policy) {
        self.constructor_mut().set_policy(policy)
    }

    /// Sets common parameters for the channel.
    #[inline]
    pub fn set_common_params(&mut self, params: CommonParams) {
        self.constructor_mut().set_common_params(params)
    }

    /// Sets local parameters for the channel.
    #[inline]
    pub fn set_local_params(&mut self, params: PeerParams) {
        self.constructor_mut().set_local_params(params)
    }

    /// Returns active channel id, covering both temporary and final channel
    /// ids
    #[inline]
    pub fn active_channel_id(&self) -> ActiveChannelId {
        self.constructor().active_channel_id()
    }

    /// Returns [`ChannelId`], if the channel already assigned it
    #[inline]
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.active_channel_id().channel_id()
    }

    /// Returns [`ChannelId`], if the channel already assigned it — or errors
    /// otherwise.
    #[inline]
    pub fn try_channel_id(&self) -> Result<ChannelId, Error> {
        self.channel_id().ok_or(Error::NoChannelId)
    }

    /// Before the channel is assigned a final [`ChannelId`] returns
    /// [`TempChannelId`], and `None` after
    #[inline]
    pub fn temp_channel_id(&self) -> Option<TempChannelId> {
        self.active_channel_id().temp_channel_id()
    }

    /// Composes `open_channel` message used for proposing channel opening
    /// to a remote peer.
    pub fn compose_open_channel(
        &mut self,
        funding_sat: u64,
        push_msat: u64,
        policy: Policy,
        common_params: CommonParams,
        local_params: PeerParams,
        local_keys: LocalKeyset,
    ) -> Result<OpenChannel, Error> {
        self.set_funding_amount(funding_sat);
        self.constructor_mut().compose_open_channel(
            funding_sat,
            push_msat,
            policy,
            common_params,
            local_params,
            local_keys,
        )
    }

    /// Composes `accept_channel` message used for accepting a channel
    /// opening from a remote peer.
    pub fn compose_accept_channel(&mut self) -> Result<AcceptChannel, Error> {
        self.constructor_mut().compose_accept_channel()
    }

    /// Composes `funding_locked` message once the funding transaction
    /// reached its minimum depth
    #[inline]
    pub fn compose_funding_locked(&mut self) -> Result<FundingLocked, Error> {
        self.constructor_mut().compose_funding_locked()
    }

    /// Composes `channel_reestablish` reporting the local view of the
    /// channel state after a reconnection
    #[inline]
    pub fn compose_reestablish_channel(
        &mut self,
    ) -> Result<ChannelReestablish, Error> {
        self.constructor_mut().compose_reestablish_channel()
    }

    /// Chain hash of the blockchain the channel operates on
    #[inline]
    pub fn chain_hash(&self) -> Slice32 {
        self.constructor().chain_hash()
    }

    /// Tries to identify bitcoin network which the channel is based on.
    /// Returns `None` if the channel is using a non-bitcoin chain.
    pub fn network(&self) -> Option<Network> {
        let chain_hash = self.constructor().chain_hash();
        for network in [
            Network::Bitcoin,
            Network::Testnet,
            Network::Signet,
            Network::Regtest,
        ] {
            let genesis =
                bitcoin::blockdata::constants::genesis_block(network)
                    .block_hash();
            if genesis.into_inner() == chain_hash.to_inner() {
                return Some(network);
            }
        }
        None
    }

    /// Local funding multisig key
    #[inline]
    pub fn funding_pubkey(&self) -> PublicKey {
        self.constructor().local_keys().funding_pubkey.key
    }

    /// Script pubkey of the channel funding output
    #[inline]
    pub fn funding_script_pubkey(&self) -> PubkeyScript {
        let funding = self.funding();
        let core = self.constructor();
        PubkeyScript::ln_funding(
            funding.amount(),
            &core.local_keys().funding_pubkey,
            core.remote_keys().funding_pubkey,
        )
    }

    /// Current fee rate applied to newly constructed commitments
    #[inline]
    pub fn feerate_per_kw(&self) -> u32 {
        self.constructor().current_feerate()
    }

    /// Settled balance of the local node, msat
    #[inline]
    pub fn local_amount_msat(&self) -> u64 {
        self.constructor().local_amount_msat()
    }

    /// Settled balance of the remote node, msat
    #[inline]
    pub fn remote_amount_msat(&self) -> u64 {
        self.constructor().remote_amount_msat()
    }

    /// Offers a new HTLC to the remote peer (`AddHTLC` from the local
    /// side). Returns the composed `update_add_htlc` with the assigned id.
    /// The onion routing packet must have been constructed by the payment
    /// or forwarding logic.
    pub fn compose_add_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion_routing_packet: lnwire::OnionPacket,
    ) -> Result<UpdateAddHtlc, Error> {
        self.constructor_mut().compose_add_htlc(
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet,
        )
    }

    /// Processes an HTLC offered by the remote peer (`ReceiveHTLC`)
    #[inline]
    pub fn receive_htlc(
        &mut self,
        message: &UpdateAddHtlc,
    ) -> Result<u64, Error> {
        self.constructor_mut().receive_htlc(message)
    }

    /// Settles a remote-offered HTLC with its preimage (`SettleHTLC`)
    #[inline]
    pub fn settle_htlc(
        &mut self,
        htlc_id: u64,
        preimage: HashPreimage,
    ) -> Result<UpdateFulfillHtlc, Error> {
        self.constructor_mut().settle_htlc(htlc_id, preimage)
    }

    /// Fails a remote-offered HTLC (`FailHTLC`)
    #[inline]
    pub fn fail_htlc(
        &mut self,
        htlc_id: u64,
        reason: Vec<u8>,
    ) -> Result<UpdateFailHtlc, Error> {
        self.constructor_mut().fail_htlc(htlc_id, reason)
    }

    /// Fails a remote-offered HTLC whose onion could not be parsed
    #[inline]
    pub fn fail_htlc_malformed(
        &mut self,
        htlc_id: u64,
        sha256_of_onion: sha256::Hash,
        failure_code: u16,
    ) -> Result<UpdateFailMalformedHtlc, Error> {
        self.constructor_mut()
            .fail_htlc_malformed(htlc_id, sha256_of_onion, failure_code)
    }

    /// Processes a settle received from the remote for a locally-offered
    /// HTLC; returns the id and the preimage for circuit resolution
    #[inline]
    pub fn receive_settle(
        &mut self,
        message: &UpdateFulfillHtlc,
    ) -> Result<(u64, HashPreimage), Error> {
        self.constructor_mut().receive_settle(message)
    }

    /// Processes a fail received from the remote for a locally-offered HTLC
    #[inline]
    pub fn receive_fail(
        &mut self,
        message: &UpdateFailHtlc,
    ) -> Result<u64, Error> {
        self.constructor_mut().receive_fail(message)
    }

    /// Processes a malformed-HTLC failure received from the remote
    #[inline]
    pub fn receive_fail_malformed(
        &mut self,
        message: &UpdateFailMalformedHtlc,
    ) -> Result<u64, Error> {
        self.constructor_mut().receive_fail_malformed(message)
    }

    /// Initiates a commitment fee rate change (`UpdateFee`, initiator only)
    #[inline]
    pub fn update_fee(&mut self, feerate_per_kw: u32) -> Result<UpdateFee, Error> {
        self.constructor_mut().update_fee(feerate_per_kw)
    }

    /// Processes a fee rate change initiated by the remote
    #[inline]
    pub fn receive_update_fee(
        &mut self,
        message: &UpdateFee,
    ) -> Result<(), Error> {
        self.constructor_mut().receive_update_fee(message)
    }

    /// Updates the best known blockchain height used for expiry checks
    #[inline]
    pub fn set_best_height(&mut self, height: u32) {
        self.constructor_mut().set_best_height(height)
    }

    /// Stages the current chain tip for rendering, making the HTLC
    /// extension reproduce the exact commitment a force-close broadcasts
    pub fn stage_tip(&mut self, as_remote_node: bool) -> Result<(), Error> {
        let view = self.constructor().tip_view(as_remote_node);
        self.update_from_local(&UpdateMsg::Stage(view))
    }

    /// Signs the next remote commitment covering all pending updates
    /// (`SignNextCommitment`).
    ///
    /// The produced message must be persisted (it is stored in the remote
    /// chain tip) before it leaves the process.
    pub fn sign_next_commitment(
        &mut self,
        signer: &dyn ChannelSigner,
    ) -> Result<CommitmentSigned, Error> {
        let channel_id = self.try_channel_id()?;
        let (view, staged) = self.constructor_mut().stage_next_remote()?;
        self.update_from_local(&UpdateMsg::Stage(view.clone()))?;

        let result: Result<(Signature, Vec<Signature>, Txid), Error> = (|| {
            let graph = self.commitment_graph(true)?;
            let signature = signer.sign_commitment(&graph.commitment)?;

            let mut second_stage = graph.second_stage.clone();
            second_stage.sort_by_key(|(_, _, psbt)| {
                psbt.unsigned_tx.input[0].previous_output.vout
            });
            let mut htlc_signatures = Vec::with_capacity(second_stage.len());
            for (_, _, psbt) in &second_stage {
                htlc_signatures
                    .push(signer.sign_htlc(psbt, view.per_commitment_point)?);
            }

            let txid = graph.commitment.unsigned_tx.txid();
            Ok((signature, htlc_signatures, txid))
        })();

        match result {
            Ok((signature, htlc_signatures, txid)) => {
                self.constructor_mut().commit_remote(
                    view,
                    signature,
                    htlc_signatures.clone(),
                    txid,
                );
                Ok(CommitmentSigned {
                    channel_id,
                    signature,
                    htlc_signatures,
                })
            }
            Err(err) => {
                self.constructor_mut().unstage_remote(&staged);
                // Reset the extensions to the tip view so a later render
                // does not pick up the abandoned staging
                let _ = self.stage_tip(true);
                Err(err)
            }
        }
    }

    /// Processes a `commitment_signed` received from the remote peer
    /// (`ReceiveNewCommitment`), verifying the commitment and every HTLC
    /// signature against the locally constructed transactions.
    pub fn receive_new_commitment(
        &mut self,
        message: &CommitmentSigned,
    ) -> Result<(), Error> {
        let (view, staged) = self.constructor_mut().stage_next_local()?;
        self.update_from_local(&UpdateMsg::Stage(view.clone()))?;

        let result: Result<Txid, Error> = (|| {
            let graph = self.commitment_graph(false)?;

            let sighash = segwit_sighash(&graph.commitment, 0)?;
            let remote_funding = self.constructor().remote_keys().funding_pubkey;
            SECP256K1
                .verify_ecdsa(&sighash, &message.signature, &remote_funding)
                .map_err(|_| Error::InvalidSignature)?;

            let mut second_stage = graph.second_stage.clone();
            second_stage.sort_by_key(|(_, _, psbt)| {
                psbt.unsigned_tx.input[0].previous_output.vout
            });
            if second_stage.len() != message.htlc_signatures.len() {
                return Err(Error::WrongHtlcSignatureCount {
                    expected: second_stage.len(),
                    got: message.htlc_signatures.len(),
                });
            }
            let remote_htlc_pubkey = derive_pubkey(
                self.constructor().remote_keys().htlc_basepoint,
                view.per_commitment_point,
            );
            for ((_, index, psbt), signature) in
                second_stage.iter().zip(&message.htlc_signatures)
            {
                let sighash = segwit_sighash(psbt, 0)?;
                SECP256K1
                    .verify_ecdsa(&sighash, signature, &remote_htlc_pubkey)
                    .map_err(|_| Error::InvalidHtlcSignature(*index))?;
            }

            Ok(graph.commitment.unsigned_tx.txid())
        })();

        match result {
            Ok(txid) => {
                self.constructor_mut().commit_local(
                    view,
                    message.signature,
                    message.htlc_signatures.clone(),
                    txid,
                );
                Ok(())
            }
            Err(err) => {
                self.constructor_mut().unstage_local(&staged);
                let _ = self.stage_tip(false);
                Err(err)
            }
        }
    }

    /// Revokes the previous local commitment after a new one was received
    /// (`RevokeCurrentCommitment`)
    #[inline]
    pub fn revoke_current_commitment(
        &mut self,
    ) -> Result<RevokeAndAck, Error> {
        self.constructor_mut().revoke_current_commitment()
    }

    /// Processes a `revoke_and_ack` received from the remote peer
    /// (`ReceiveRevocation`); returns the set of HTLCs which became
    /// forwardable plus the archived revoked commitment for the
    /// retribution store.
    #[inline]
    pub fn receive_revocation(
        &mut self,
        message: &RevokeAndAck,
    ) -> Result<(Vec<Forwardable>, RevokedCommitment), Error> {
        self.constructor_mut().receive_revocation(message)
    }

    /// Processes the remote `channel_reestablish`, deciding which messages
    /// (if any) have to be retransmitted
    #[inline]
    pub fn verify_reestablish(
        &self,
        message: &ChannelReestablish,
    ) -> Result<ReestablishAction, Error> {
        self.constructor().verify_reestablish(message)
    }

    /// Reconstructs the byte-identical `commitment_signed` for the current
    /// remote chain tip, used on retransmission
    #[inline]
    pub fn retransmit_commitment(
        &self,
    ) -> Result<CommitmentSigned, Error> {
        self.constructor().retransmit_commitment()
    }

    /// Reconstructs the `revoke_and_ack` for the last revoked local
    /// commitment, used on retransmission
    #[inline]
    pub fn retransmit_revocation(&self) -> Result<RevokeAndAck, Error> {
        self.constructor().retransmit_revocation()
    }
}

/// The core of the lightning channel operating according to the BOLT
/// standards. This is the "channel constructor" used by the [`Channel`]
/// structure, owning the update log and both commitment chains.
///
/// The type should not be constructed directly or used from outside of the
/// library, but it's made public for allowing channel state access.
#[derive(Getters, Clone, PartialEq, Debug)]
pub struct BoltChannel {
    /// Current channel lifecycle stage
    #[getter(as_copy)]
    stage: Lifecycle,

    /// The chain_hash value denotes the exact blockchain that the opened
    /// channel will reside within.
    #[getter(as_copy)]
    chain_hash: Slice32,

    /// Channel id used by the channel; first temporary and later final
    #[getter(as_copy)]
    active_channel_id: ActiveChannelId,

    /// The policy for accepting remote node params
    #[getter(as_ref)]
    policy: Policy,

    /// Common parameters applying for both nodes
    #[getter(as_copy)]
    common_params: CommonParams,

    /// Channel parameters required to be met by the remote node when
    /// operating towards the local one
    #[getter(as_copy)]
    local_params: PeerParams,

    /// Channel parameters to be used towards the remote node
    #[getter(as_copy)]
    remote_params: PeerParams,

    /// Set of locally-derived keys for creating channel transactions
    local_keys: LocalKeyset,

    /// Set of remote-derived keys for creating channel transactions
    remote_keys: RemoteKeyset,

    /// Per-commitment point of the current remote commitment tip
    #[getter(as_copy)]
    remote_per_commitment_point: PublicKey,

    /// Per-commitment point for the next remote commitment
    #[getter(as_copy)]
    next_remote_per_commitment_point: PublicKey,

    /// Store of per-commitment secrets revealed by the remote
    #[getter(as_ref)]
    remote_secrets: ShaChainStore,

    /// The channel update log
    #[getter(as_ref)]
    log: UpdateLog,

    /// Local commitment chain
    #[getter(as_ref)]
    local_chain: CommitmentChain,

    /// Remote commitment chain
    #[getter(as_ref)]
    remote_chain: CommitmentChain,

    #[getter(as_copy)]
    next_local_htlc_id: u64,

    #[getter(as_copy)]
    next_remote_htlc_id: u64,

    #[getter(as_copy)]
    local_acked_index: Option<u64>,

    #[getter(as_copy)]
    best_height: u32,

    /// Keeps information about node directionality
    #[getter(as_copy)]
    direction: Direction,

    /// Commitment view staged for the next graph construction (transient)
    #[getter(skip)]
    staged: Option<CommitmentView>,
}

impl Default for BoltChannel {
    fn default() -> Self {
        let dumb_keys = RemoteKeyset::dumb_default();
        BoltChannel {
            stage: Lifecycle::Initial,
            chain_hash: default!(),
            active_channel_id: ActiveChannelId::random(),
            policy: default!(),
            common_params: default!(),
            local_params: default!(),
            remote_params: default!(),
            local_keys: LocalKeyset::dumb_default(),
            remote_keys: dumb_keys,
            remote_per_commitment_point: dumb_pubkey!(),
            next_remote_per_commitment_point: dumb_pubkey!(),
            remote_secrets: ShaChainStore::new(),
            log: UpdateLog::default(),
            local_chain: CommitmentChain::with(Commitment::initial(
                0,
                0,
                0,
                dumb_pubkey!(),
            )),
            remote_chain: CommitmentChain::with(Commitment::initial(
                0,
                0,
                0,
                dumb_pubkey!(),
            )),
            next_local_htlc_id: 0,
            next_remote_htlc_id: 0,
            local_acked_index: None,
            best_height: 0,
            direction: Direction::Outbound,
            staged: None,
        }
    }
}

impl BoltChannel {
    /// Producer of the local per-commitment secret chain
    fn shachain(&self) -> ShaChainProducer {
        ShaChainProducer::with(self.local_keys.shachain_seed)
    }

    /// Returns [`ChannelId`], if the channel already assigned it
    #[inline]
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.active_channel_id.channel_id()
    }

    /// Returns [`ChannelId`], if the channel already assigned it — or
    /// errors otherwise
    #[inline]
    pub fn try_channel_id(&self) -> Result<ChannelId, Error> {
        self.channel_id().ok_or(Error::NoChannelId)
    }

    /// Before the channel is assigned a final [`ChannelId`] returns
    /// [`TempChannelId`], and `None` after
    #[inline]
    pub fn temp_channel_id(&self) -> Option<TempChannelId> {
        self.active_channel_id.temp_channel_id()
    }

    /// Assigns channel a temporary id
    #[inline]
    pub fn set_temp_channel_id(&mut self, temp_channel_id: TempChannelId) {
        self.active_channel_id = ActiveChannelId::Temporary(temp_channel_id)
    }

    /// Assigns the final channel id out of the funding outpoint
    #[inline]
    pub fn assign_channel_id(&mut self, funding_txid: Txid, vout: u16) {
        self.active_channel_id = ActiveChannelId::with(funding_txid, vout);
    }

    /// Sets the channel chain hash
    #[inline]
    pub fn set_chain_hash(&mut self, chain_hash: Slice32) {
        self.chain_hash = chain_hash
    }

    /// Sets channel policy
    #[inline]
    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy
    }

    /// Sets common parameters for the channel
    #[inline]
    pub fn set_common_params(&mut self, params: CommonParams) {
        self.common_params = params
    }

    /// Sets local parameters for the channel
    #[inline]
    pub fn set_local_params(&mut self, params: PeerParams) {
        self.local_params = params
    }

    /// Sets local keys for the channel
    #[inline]
    pub fn set_local_keys(&mut self, keys: LocalKeyset) {
        self.local_keys = keys
    }

    /// Sets the lifecycle stage
    #[inline]
    pub fn set_stage(&mut self, stage: Lifecycle) {
        self.stage = stage
    }

    /// Updates the best known chain height
    #[inline]
    pub fn set_best_height(&mut self, height: u32) {
        self.best_height = height
    }

    /// Attaches the counterparty signature received during the funding
    /// dance to the initial local commitment, together with its rendered
    /// txid; required for force-closing from the initial state
    pub fn set_initial_signature(
        &mut self,
        signature: Signature,
        txid: Txid,
    ) {
        let tip = self.local_chain.tip_mut();
        if tip.height == 0 {
            tip.signature = Some(signature);
            tip.txid = Some(txid);
        }
    }

    /// Commitment view of the current chain tip, used for re-constructing
    /// the transaction a force-close broadcasts
    pub fn tip_view(&self, as_remote_node: bool) -> CommitmentView {
        let tip = if as_remote_node {
            self.remote_chain.tip()
        } else {
            self.local_chain.tip()
        };
        CommitmentView {
            as_remote_node,
            height: tip.height,
            to_local_msat: tip.to_local_msat,
            to_remote_msat: tip.to_remote_msat,
            feerate_per_kw: tip.feerate_per_kw,
            per_commitment_point: tip.per_commitment_point,
            htlcs: tip.htlcs.clone(),
        }
    }

    /// Settled local balance: the balance acknowledged on the local chain
    /// tip, msat
    pub fn local_amount_msat(&self) -> u64 {
        self.local_chain.tip().to_local_msat
    }

    /// Settled remote balance, msat
    pub fn remote_amount_msat(&self) -> u64 {
        self.local_chain.tip().to_remote_msat
    }

    /// Fee rate which will apply to the next constructed commitment
    pub fn current_feerate(&self) -> u32 {
        let next = self.remote_chain.height() + 1;
        self.log
            .feerate_at(ChainSide::Remote, next)
            .unwrap_or(self.remote_chain.tip().feerate_per_kw)
    }

    fn obscured_commitment_number(&self, height: u64) -> u64 {
        const LOWER_48_BITS: u64 = 0x00_00_FF_FF_FF_FF_FF_FF;

        let mut engine = sha256::Hash::engine();
        if self.direction.is_inbound() {
            engine.input(&self.remote_keys.payment_basepoint.serialize());
            engine.input(&self.local_keys.payment_basepoint.key.serialize());
        } else {
            engine.input(&self.local_keys.payment_basepoint.key.serialize());
            engine.input(&self.remote_keys.payment_basepoint.serialize());
        }
        let obscuring_hash = sha256::Hash::from_engine(engine);

        let mut buf = [0u8; 8];
        buf.copy_from_slice(&obscuring_hash[24..]);
        let obscuring_factor = u64::from_be_bytes(buf) & LOWER_48_BITS;

        (height & LOWER_48_BITS) ^ obscuring_factor
    }

    /// Initializes both commitment chains from the negotiated channel
    /// balances; called when the open dance reaches the accepted stage
    fn init_commitments(
        &mut self,
        local_amount_msat: u64,
        remote_amount_msat: u64,
    ) {
        let feerate = self.common_params.feerate_per_kw;
        self.local_chain = CommitmentChain::with(Commitment::initial(
            local_amount_msat,
            remote_amount_msat,
            feerate,
            self.shachain().point_at(0),
        ));
        self.remote_chain = CommitmentChain::with(Commitment::initial(
            remote_amount_msat,
            local_amount_msat,
            feerate,
            self.remote_keys.first_per_commitment_point,
        ));
        self.remote_per_commitment_point =
            self.remote_keys.first_per_commitment_point;
        self.next_remote_per_commitment_point =
            self.remote_keys.first_per_commitment_point;
    }

    fn compose_open_channel(
        &mut self,
        funding_sat: u64,
        push_msat: u64,
        policy: Policy,
        common_params: CommonParams,
        local_params: PeerParams,
        local_keyset: LocalKeyset,
    ) -> Result<OpenChannel, Error> {
        if self.stage != Lifecycle::Initial
            && self.stage != Lifecycle::Reestablishing
        {
            return Err(Error::LifecycleMismatch {
                current: self.stage,
                required: &[Lifecycle::Initial, Lifecycle::Reestablishing],
            });
        }

        self.direction = Direction::Outbound;
        self.policy = policy;
        self.common_params = common_params;
        self.local_params = local_params;
        self.local_keys = local_keyset.clone();
        self.stage = Lifecycle::Proposed;
        self.init_commitments(funding_sat * 1000 - push_msat, push_msat);

        Ok(OpenChannel {
            chain_hash: self.chain_hash,
            temporary_channel_id: self.temp_channel_id().expect(
                "initial channel state must always have a temporary channel id",
            ),
            funding_satoshis: funding_sat,
            push_msat,
            dust_limit_satoshis: local_params.dust_limit_satoshis,
            max_htlc_value_in_flight_msat: local_params
                .max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: local_params.channel_reserve_satoshis,
            htlc_minimum_msat: local_params.htlc_minimum_msat,
            feerate_per_kw: common_params.feerate_per_kw,
            to_self_delay: local_params.to_self_delay,
            max_accepted_htlcs: local_params.max_accepted_htlcs,
            funding_pubkey: local_keyset.funding_pubkey.key,
            revocation_basepoint: local_keyset.revocation_basepoint.key,
            payment_point: local_keyset.payment_basepoint.key,
            delayed_payment_basepoint: local_keyset
                .delayed_payment_basepoint
                .key,
            htlc_basepoint: local_keyset.htlc_basepoint.key,
            first_per_commitment_point: self.shachain().point_at(0),
            channel_flags: if common_params.announce_channel { 1 } else { 0 },
            shutdown_scriptpubkey: local_keyset.shutdown_scriptpubkey,
            channel_type: common_params.channel_type.into_option(),
            unknown_tlvs: none!(),
        })
    }

    fn compose_accept_channel(&mut self) -> Result<AcceptChannel, Error> {
        if self.stage != Lifecycle::Proposed
            && self.stage != Lifecycle::Reestablishing
        {
            return Err(Error::LifecycleMismatch {
                current: self.stage,
                required: &[Lifecycle::Proposed, Lifecycle::Reestablishing],
            });
        }

        self.stage = Lifecycle::Accepted;

        Ok(AcceptChannel {
            temporary_channel_id: self.temp_channel_id().expect(
                "channel in proposed state must have a temporary channel id",
            ),
            dust_limit_satoshis: self.local_params.dust_limit_satoshis,
            max_htlc_value_in_flight_msat: self
                .local_params
                .max_htlc_value_in_flight_msat,
            channel_reserve_satoshis: self
                .local_params
                .channel_reserve_satoshis,
            htlc_minimum_msat: self.local_params.htlc_minimum_msat,
            minimum_depth: self.policy.minimum_depth,
            to_self_delay: self.local_params.to_self_delay,
            max_accepted_htlcs: self.local_params.max_accepted_htlcs,
            funding_pubkey: self.local_keys.funding_pubkey.key,
            revocation_basepoint: self.local_keys.revocation_basepoint.key,
            payment_point: self.local_keys.payment_basepoint.key,
            delayed_payment_basepoint: self
                .local_keys
                .delayed_payment_basepoint
                .key,
            htlc_basepoint: self.local_keys.htlc_basepoint.key,
            first_per_commitment_point: self.shachain().point_at(0),
            shutdown_scriptpubkey: self
                .local_keys
                .shutdown_scriptpubkey
                .clone(),
            channel_type: self.common_params.channel_type.into_option(),
            unknown_tlvs: none!(),
        })
    }

    fn compose_funding_locked(&mut self) -> Result<FundingLocked, Error> {
        Ok(FundingLocked {
            channel_id: self.try_channel_id()?,
            next_per_commitment_point: self.shachain().point_at(1),
        })
    }

    fn compose_reestablish_channel(
        &mut self,
    ) -> Result<ChannelReestablish, Error> {
        let channel_id = self
            .channel_id()
            .ok_or(ReestablishError::NoPermanentId)?;
        self.stage = Lifecycle::Reestablishing;

        let last_secret = self
            .remote_secrets
            .min_index()
            .and_then(|index| self.remote_secrets.secret_at(index))
            .unwrap_or_default();

        Ok(ChannelReestablish {
            channel_id,
            next_commitment_number: self.local_chain.height() + 1,
            next_revocation_number: self.received_revocations(),
            your_last_per_commitment_secret: last_secret,
            my_current_per_commitment_point: self
                .shachain()
                .point_at(self.local_chain.height()),
        })
    }

    /// Number of revocations sent by the local node
    fn sent_revocations(&self) -> u64 {
        if self.local_chain.pending_revocation() {
            self.local_chain.height() - 1
        } else {
            self.local_chain.height()
        }
    }

    /// Number of revocations received from the remote node
    fn received_revocations(&self) -> u64 {
        if self.remote_chain.pending_revocation() {
            self.remote_chain.height() - 1
        } else {
            self.remote_chain.height()
        }
    }

    fn verify_reestablish(
        &self,
        message: &ChannelReestablish,
    ) -> Result<ReestablishAction, Error> {
        let channel_id =
            self.channel_id().ok_or(ReestablishError::NoPermanentId)?;
        if message.channel_id != channel_id {
            return Err(ReestablishError::ChannelIdMismatch {
                remote: message.channel_id,
                local: channel_id,
            }
            .into());
        }

        // What the remote expects us to sign next on its chain
        let remote_height = self.remote_chain.height();
        let commitment = match message.next_commitment_number {
            n if n == remote_height + 1 => false,
            n if n == remote_height && remote_height > 0 => true,
            n => {
                return Err(ReestablishError::CommitmentNumberMismatch {
                    claimed: n,
                    actual: remote_height,
                }
                .into())
            }
        };

        // What the remote expects us to revoke next on our chain
        let sent = self.sent_revocations();
        let revocation = match message.next_revocation_number {
            n if n == sent => false,
            n if n + 1 == sent => true,
            n => {
                return Err(ReestablishError::RevocationNumberMismatch {
                    claimed: n,
                    sent,
                }
                .into())
            }
        };

        if !commitment && !revocation {
            Ok(ReestablishAction::Synchronized)
        } else {
            Ok(ReestablishAction::Retransmit {
                revocation,
                commitment,
            })
        }
    }

    fn retransmit_commitment(&self) -> Result<CommitmentSigned, Error> {
        let tip = self.remote_chain.tip();
        let signature = tip.signature.ok_or(Error::NoUpdates)?;
        Ok(CommitmentSigned {
            channel_id: self.try_channel_id()?,
            signature,
            htlc_signatures: tip.htlc_signatures.clone(),
        })
    }

    fn retransmit_revocation(&self) -> Result<RevokeAndAck, Error> {
        let sent = self.sent_revocations();
        if sent == 0 {
            return Err(Error::UnexpectedRevocation);
        }
        let revoked_height = sent - 1;
        let secret = self.shachain().secret_key_at(revoked_height);
        Ok(RevokeAndAck {
            channel_id: self.try_channel_id()?,
            per_commitment_secret: secret,
            next_per_commitment_point: self
                .shachain()
                .point_at(self.local_chain.height() + 1),
        })
    }

    // === HTLC and fee update operations ===

    /// Millisatoshi available for a new locally-offered HTLC: the local
    /// balance on the remote chain tip minus pending adds, the required
    /// reserve and (for the initiator) the commitment fee.
    pub fn available_local_msat(&self) -> u64 {
        let tip = self.remote_chain.tip();
        let mut available = tip.to_remote_msat;
        for add in self.log.pending_adds(Originator::Local) {
            if self
                .log
                .add_entry(Originator::Local, add.htlc_id)
                .and_then(|entry| entry.remote_height)
                .is_none()
            {
                available = available.saturating_sub(add.amount_msat);
            }
        }
        let reserve_msat = self.remote_params.channel_reserve_satoshis * 1000;
        available = available.saturating_sub(reserve_msat);
        if self.direction.is_outbound() {
            let fee =
                commitment_fee(self.current_feerate(), tip.htlcs.len()) * 1000;
            available = available.saturating_sub(fee);
        }
        available
    }

    fn in_flight_msat(&self, originator: Originator) -> u64 {
        self.log
            .pending_adds(originator)
            .map(|add| add.amount_msat)
            .sum()
    }

    fn pending_add_count(&self, originator: Originator) -> usize {
        self.log.pending_adds(originator).count()
    }

    fn check_expiry(&self, cltv_expiry: u32) -> Result<(), Error> {
        if cltv_expiry >= CLTV_EXPIRY_MAX {
            return Err(Error::InvalidExpiry(cltv_expiry));
        }
        if cltv_expiry <= self.best_height + CLTV_EXPIRY_GRACE {
            return Err(Error::ExpiryTooSoon {
                cltv_expiry,
                best_height: self.best_height,
            });
        }
        Ok(())
    }

    fn compose_add_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion_routing_packet: lnwire::OnionPacket,
    ) -> Result<UpdateAddHtlc, Error> {
        if amount_msat == 0 {
            return Err(Error::InvalidAmount);
        }
        // The peer will not accept HTLCs below its advertised minimum
        if amount_msat < self.remote_params.htlc_minimum_msat {
            return Err(Error::BelowMinimum {
                amount_msat,
                htlc_minimum_msat: self.remote_params.htlc_minimum_msat,
            });
        }
        self.check_expiry(cltv_expiry)?;
        let in_flight = self.in_flight_msat(Originator::Local);
        if in_flight + amount_msat
            > self.remote_params.max_htlc_value_in_flight_msat
        {
            return Err(Error::ExceedsMaxInFlight {
                in_flight_msat: in_flight + amount_msat,
                max_htlc_value_in_flight_msat: self
                    .remote_params
                    .max_htlc_value_in_flight_msat,
            });
        }
        if self.pending_add_count(Originator::Local)
            >= self.remote_params.max_accepted_htlcs as usize
        {
            return Err(Error::ExceedsMaxAccepted {
                max_accepted_htlcs: self.remote_params.max_accepted_htlcs,
            });
        }
        let available = self.available_local_msat();
        if amount_msat > available {
            return Err(Error::InsufficientBalance {
                available_msat: available,
                required_msat: amount_msat,
            });
        }

        let htlc_id = self.next_local_htlc_id;
        self.next_local_htlc_id += 1;
        let message = UpdateAddHtlc {
            channel_id: self.try_channel_id()?,
            htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet,
            unknown_tlvs: none!(),
        };
        self.log
            .append(Originator::Local, UpdateDetails::Add(message.clone()));
        Ok(message)
    }

    fn receive_htlc(
        &mut self,
        message: &UpdateAddHtlc,
    ) -> Result<u64, Error> {
        if message.amount_msat == 0 {
            return Err(Error::InvalidAmount);
        }
        if message.htlc_id != self.next_remote_htlc_id {
            return Err(Error::HtlcIdViolation {
                expected: self.next_remote_htlc_id,
                got: message.htlc_id,
            });
        }
        if message.amount_msat < self.local_params.htlc_minimum_msat {
            return Err(Error::BelowMinimum {
                amount_msat: message.amount_msat,
                htlc_minimum_msat: self.local_params.htlc_minimum_msat,
            });
        }
        self.check_expiry(message.cltv_expiry)?;
        let in_flight = self.in_flight_msat(Originator::Remote);
        if in_flight + message.amount_msat
            > self.local_params.max_htlc_value_in_flight_msat
        {
            return Err(Error::ExceedsMaxInFlight {
                in_flight_msat: in_flight + message.amount_msat,
                max_htlc_value_in_flight_msat: self
                    .local_params
                    .max_htlc_value_in_flight_msat,
            });
        }
        if self.pending_add_count(Originator::Remote)
            >= self.local_params.max_accepted_htlcs as usize
        {
            return Err(Error::ExceedsMaxAccepted {
                max_accepted_htlcs: self.local_params.max_accepted_htlcs,
            });
        }
        // Remote spendable balance on the local chain
        let tip = self.local_chain.tip();
        let mut available = tip.to_remote_msat.saturating_sub(
            self.local_params.channel_reserve_satoshis * 1000,
        );
        available = available.saturating_sub(in_flight);
        if self.direction.is_inbound() {
            let fee =
                commitment_fee(self.current_feerate(), tip.htlcs.len()) * 1000;
            available = available.saturating_sub(fee);
        }
        if message.amount_msat > available {
            return Err(Error::InsufficientBalance {
                available_msat: available,
                required_msat: message.amount_msat,
            });
        }

        self.next_remote_htlc_id += 1;
        self.log
            .append(Originator::Remote, UpdateDetails::Add(message.clone()));
        Ok(message.htlc_id)
    }

    fn settle_htlc(
        &mut self,
        htlc_id: u64,
        preimage: HashPreimage,
    ) -> Result<UpdateFulfillHtlc, Error> {
        let add = self
            .log
            .add_entry(Originator::Remote, htlc_id)
            .ok_or(Error::UnknownHtlcIndex(htlc_id))?;
        let payment_hash = match &add.details {
            UpdateDetails::Add(add) => add.payment_hash,
            _ => unreachable!("add_entry returns only add entries"),
        };
        if payment_hash != HashLock::from(preimage) {
            return Err(Error::PreimageMismatch(htlc_id));
        }
        self.log.append_removal(Originator::Local, UpdateDetails::Settle {
            htlc_id,
            preimage,
        })?;
        Ok(UpdateFulfillHtlc {
            channel_id: self.try_channel_id()?,
            htlc_id,
            payment_preimage: preimage,
        })
    }

    fn fail_htlc(
        &mut self,
        htlc_id: u64,
        reason: Vec<u8>,
    ) -> Result<UpdateFailHtlc, Error> {
        if self.log.add_entry(Originator::Remote, htlc_id).is_none() {
            return Err(Error::UnknownHtlcIndex(htlc_id));
        }
        self.log.append_removal(Originator::Local, UpdateDetails::Fail {
            htlc_id,
            reason: reason.clone(),
        })?;
        Ok(UpdateFailHtlc {
            channel_id: self.try_channel_id()?,
            htlc_id,
            reason,
        })
    }

    fn fail_htlc_malformed(
        &mut self,
        htlc_id: u64,
        sha256_of_onion: sha256::Hash,
        failure_code: u16,
    ) -> Result<UpdateFailMalformedHtlc, Error> {
        if self.log.add_entry(Originator::Remote, htlc_id).is_none() {
            return Err(Error::UnknownHtlcIndex(htlc_id));
        }
        self.log.append_removal(
            Originator::Local,
            UpdateDetails::FailMalformed {
                htlc_id,
                sha256_of_onion,
                failure_code,
            },
        )?;
        Ok(UpdateFailMalformedHtlc {
            channel_id: self.try_channel_id()?,
            htlc_id,
            sha256_of_onion,
            failure_code,
        })
    }

    fn receive_settle(
        &mut self,
        message: &UpdateFulfillHtlc,
    ) -> Result<(u64, HashPreimage), Error> {
        let add = self
            .log
            .add_entry(Originator::Local, message.htlc_id)
            .ok_or(Error::UnknownHtlcIndex(message.htlc_id))?;
        let payment_hash = match &add.details {
            UpdateDetails::Add(add) => add.payment_hash,
            _ => unreachable!("add_entry returns only add entries"),
        };
        if payment_hash != HashLock::from(message.payment_preimage) {
            return Err(Error::PreimageMismatch(message.htlc_id));
        }
        self.log.append_removal(Originator::Remote, UpdateDetails::Settle {
            htlc_id: message.htlc_id,
            preimage: message.payment_preimage,
        })?;
        Ok((message.htlc_id, message.payment_preimage))
    }

    fn receive_fail(
        &mut self,
        message: &UpdateFailHtlc,
    ) -> Result<u64, Error> {
        self.log.append_removal(Originator::Remote, UpdateDetails::Fail {
            htlc_id: message.htlc_id,
            reason: message.reason.clone(),
        })?;
        Ok(message.htlc_id)
    }

    fn receive_fail_malformed(
        &mut self,
        message: &UpdateFailMalformedHtlc,
    ) -> Result<u64, Error> {
        self.log.append_removal(
            Originator::Remote,
            UpdateDetails::FailMalformed {
                htlc_id: message.htlc_id,
                sha256_of_onion: message.sha256_of_onion,
                failure_code: message.failure_code,
            },
        )?;
        Ok(message.htlc_id)
    }

    fn update_fee(
        &mut self,
        feerate_per_kw: u32,
    ) -> Result<UpdateFee, Error> {
        if !self.direction.is_outbound() {
            return Err(Error::UpdateFeeFromNonInitiator);
        }
        if feerate_per_kw < self.policy.feerate_per_kw_range.start {
            return Err(Error::FeeTooLow {
                proposed: feerate_per_kw,
                minimum: self.policy.feerate_per_kw_range.start,
            });
        }
        self.log
            .append(Originator::Local, UpdateDetails::Fee { feerate_per_kw });
        Ok(UpdateFee {
            channel_id: self.try_channel_id()?,
            feerate_per_kw,
        })
    }

    fn receive_update_fee(
        &mut self,
        message: &UpdateFee,
    ) -> Result<(), Error> {
        if !self.direction.is_inbound() {
            // Only the channel initiator may change the fee rate
            return Err(Error::UpdateFeeFromNonInitiator);
        }
        if message.feerate_per_kw < self.policy.feerate_per_kw_range.start {
            return Err(Error::FeeTooLow {
                proposed: message.feerate_per_kw,
                minimum: self.policy.feerate_per_kw_range.start,
            });
        }
        self.log.append(Originator::Remote, UpdateDetails::Fee {
            feerate_per_kw: message.feerate_per_kw,
        });
        Ok(())
    }

    // === Commitment staging and the sign/revoke cycle ===

    /// Computes the balance delta caused by the entries staged at `height`
    /// on chain `side`; returns owner/counterparty balances.
    fn balances_after(
        &self,
        side: ChainSide,
        height: u64,
        tip: &Commitment,
    ) -> (u64, u64) {
        let owner = match side {
            ChainSide::Local => Originator::Local,
            ChainSide::Remote => Originator::Remote,
        };
        let mut to_local = tip.to_local_msat;
        let mut to_remote = tip.to_remote_msat;
        for entry in self.log.entries() {
            if entry.height_on(side) != Some(height) {
                continue;
            }
            let amount = match &entry.details {
                UpdateDetails::Add(add) => add.amount_msat,
                UpdateDetails::Settle { htlc_id, .. }
                | UpdateDetails::Fail { htlc_id, .. }
                | UpdateDetails::FailMalformed { htlc_id, .. } => {
                    match self
                        .log
                        .add_entry(entry.originator.swapped(), *htlc_id)
                        .map(|add| &add.details)
                    {
                        Some(UpdateDetails::Add(add)) => add.amount_msat,
                        _ => continue,
                    }
                }
                UpdateDetails::Fee { .. } => continue,
            };
            let is_owner = entry.originator == owner;
            match (&entry.details, is_owner) {
                // New HTLC reduces the adder's balance
                (UpdateDetails::Add(_), true) => to_local -= amount,
                (UpdateDetails::Add(_), false) => to_remote -= amount,
                // Settlement moves the HTLC value to the settling party
                (UpdateDetails::Settle { .. }, true) => to_local += amount,
                (UpdateDetails::Settle { .. }, false) => to_remote += amount,
                // Failure refunds the offerer
                (UpdateDetails::Fail { .. }, true)
                | (UpdateDetails::FailMalformed { .. }, true) => {
                    to_remote += amount
                }
                (UpdateDetails::Fail { .. }, false)
                | (UpdateDetails::FailMalformed { .. }, false) => {
                    to_local += amount
                }
                (UpdateDetails::Fee { .. }, _) => {}
            }
        }
        (to_local, to_remote)
    }

    fn check_fee_affordability(
        &self,
        side: ChainSide,
        view: &CommitmentView,
    ) -> Result<(), Error> {
        let owner_dust = match side {
            ChainSide::Local => self.local_params.dust_limit_satoshis,
            ChainSide::Remote => self.remote_params.dust_limit_satoshis,
        };
        let untrimmed = view
            .htlcs
            .iter()
            .filter(|htlc| {
                htlc.amount_msat / 1000
                    >= htlc_dust_threshold(
                        htlc.direction,
                        owner_dust,
                        view.feerate_per_kw,
                    )
            })
            .count();
        let fee = commitment_fee(view.feerate_per_kw, untrimmed);
        // The initiator balance on this commitment
        let initiator_is_owner = match side {
            ChainSide::Local => self.direction.is_outbound(),
            ChainSide::Remote => self.direction.is_inbound(),
        };
        let initiator_msat = if initiator_is_owner {
            view.to_local_msat
        } else {
            view.to_remote_msat
        };
        if initiator_msat < fee * 1000 {
            return Err(Error::CannotAffordFee {
                available_msat: initiator_msat,
                required_fee: fee,
            });
        }
        Ok(())
    }

    /// Stages all pending updates into the next remote commitment,
    /// producing its view. Fails when the previous remote commitment is
    /// still unrevoked or there is nothing to sign.
    fn stage_next_remote(
        &mut self,
    ) -> Result<(CommitmentView, Vec<u64>), Error> {
        if self.remote_chain.pending_revocation() {
            return Err(Error::UnackedCommitment);
        }
        if !self.log.has_uncommitted(ChainSide::Remote) {
            return Err(Error::NoUpdates);
        }

        let height = self.remote_chain.height() + 1;
        let staged = self.log.stage_to(ChainSide::Remote, height);
        let tip = self.remote_chain.tip().clone();
        let (to_local, to_remote) =
            self.balances_after(ChainSide::Remote, height, &tip);
        let feerate = self
            .log
            .feerate_at(ChainSide::Remote, height)
            .unwrap_or(tip.feerate_per_kw);
        let view = CommitmentView {
            as_remote_node: true,
            height,
            to_local_msat: to_local,
            to_remote_msat: to_remote,
            feerate_per_kw: feerate,
            per_commitment_point: self.next_remote_per_commitment_point,
            htlcs: self.log.htlcs_at(ChainSide::Remote, height),
        };
        if let Err(err) = self.check_fee_affordability(ChainSide::Remote, &view)
        {
            self.log.unstage(ChainSide::Remote, &staged);
            return Err(err);
        }
        Ok((view, staged))
    }

    fn unstage_remote(&mut self, staged: &[u64]) {
        self.log.unstage(ChainSide::Remote, staged);
        self.staged = None;
    }

    fn unstage_local(&mut self, staged: &[u64]) {
        self.log.unstage(ChainSide::Local, staged);
        self.staged = None;
    }

    fn commit_remote(
        &mut self,
        view: CommitmentView,
        signature: Signature,
        htlc_signatures: Vec<Signature>,
        txid: Txid,
    ) {
        self.remote_chain.advance(Commitment {
            height: view.height,
            to_local_msat: view.to_local_msat,
            to_remote_msat: view.to_remote_msat,
            feerate_per_kw: view.feerate_per_kw,
            htlcs: view.htlcs,
            per_commitment_point: view.per_commitment_point,
            signature: Some(signature),
            htlc_signatures,
            txid: Some(txid),
        });
        self.remote_per_commitment_point = view.per_commitment_point;
        self.staged = None;
    }

    /// Stages the updates covered by a received `commitment_signed` into
    /// the next local commitment: all remote updates plus the local updates
    /// already acknowledged by the remote revocations.
    fn stage_next_local(
        &mut self,
    ) -> Result<(CommitmentView, Vec<u64>), Error> {
        if self.local_chain.pending_revocation() {
            return Err(Error::CommitmentBeforeRevocation);
        }
        let height = self.local_chain.height() + 1;
        let acked = self.local_acked_index;
        let staged =
            self.log.stage_filtered(ChainSide::Local, height, |entry| {
                entry.originator == Originator::Remote
                    || matches!(acked, Some(acked) if entry.index <= acked)
            });
        if staged.is_empty() {
            return Err(Error::NoUpdates);
        }
        let tip = self.local_chain.tip().clone();
        let (to_local, to_remote) =
            self.balances_after(ChainSide::Local, height, &tip);
        let feerate = self
            .log
            .feerate_at(ChainSide::Local, height)
            .unwrap_or(tip.feerate_per_kw);
        let view = CommitmentView {
            as_remote_node: false,
            height,
            to_local_msat: to_local,
            to_remote_msat: to_remote,
            feerate_per_kw: feerate,
            per_commitment_point: self.shachain().point_at(height),
            htlcs: self.log.htlcs_at(ChainSide::Local, height),
        };
        if let Err(err) = self.check_fee_affordability(ChainSide::Local, &view)
        {
            self.log.unstage(ChainSide::Local, &staged);
            return Err(err);
        }
        Ok((view, staged))
    }

    fn commit_local(
        &mut self,
        view: CommitmentView,
        signature: Signature,
        htlc_signatures: Vec<Signature>,
        txid: Txid,
    ) {
        self.local_chain.advance(Commitment {
            height: view.height,
            to_local_msat: view.to_local_msat,
            to_remote_msat: view.to_remote_msat,
            feerate_per_kw: view.feerate_per_kw,
            htlcs: view.htlcs,
            per_commitment_point: view.per_commitment_point,
            signature: Some(signature),
            htlc_signatures,
            txid: Some(txid),
        });
        self.staged = None;
    }

    fn revoke_current_commitment(&mut self) -> Result<RevokeAndAck, Error> {
        let channel_id = self.try_channel_id()?;
        let prior = self
            .local_chain
            .revoke_prior()
            .ok_or(Error::UnexpectedRevocation)?;
        let secret = self.shachain().secret_key_at(prior.height);
        self.log.compact(
            self.local_chain.revoked_height(),
            self.remote_chain.revoked_height(),
        );
        Ok(RevokeAndAck {
            channel_id,
            per_commitment_secret: secret,
            next_per_commitment_point: self
                .shachain()
                .point_at(self.local_chain.height() + 1),
        })
    }

    fn receive_revocation(
        &mut self,
        message: &RevokeAndAck,
    ) -> Result<(Vec<Forwardable>, RevokedCommitment), Error> {
        let prior = self
            .remote_chain
            .prior()
            .ok_or(Error::UnexpectedRevocation)?
            .clone();

        // The revealed secret must produce the previously advertised
        // per-commitment point
        let revealed_point = PublicKey::from_secret_key(
            SECP256K1,
            &message.per_commitment_secret,
        );
        if revealed_point != prior.per_commitment_point {
            return Err(Error::InvalidRevocation);
        }
        self.remote_secrets.provide(
            START_INDEX - prior.height,
            Slice32::from_inner(message.per_commitment_secret.secret_bytes()),
        )?;

        let revoked = self
            .remote_chain
            .revoke_prior()
            .expect("presence of prior checked above");
        self.next_remote_per_commitment_point =
            message.next_per_commitment_point;

        // The revocation acknowledges every local update signed into the
        // remote chain
        let remote_height = self.remote_chain.height();
        self.local_acked_index = self
            .log
            .entries()
            .iter()
            .filter(|entry| {
                entry.originator == Originator::Local
                    && matches!(entry.remote_height, Some(height) if height <= remote_height)
            })
            .map(|entry| entry.index)
            .max()
            .or(self.local_acked_index);

        // HTLCs locked in on both chains become forwardable exactly once
        let local_height = self.local_chain.height();
        let mut forwardable = vec![];
        let mut forwarded_ids = vec![];
        for entry in self.log.entries() {
            if entry.originator != Originator::Remote || entry.forwarded {
                continue;
            }
            let add = match &entry.details {
                UpdateDetails::Add(add) => add,
                _ => continue,
            };
            let committed_both = matches!(entry.remote_height, Some(height) if height <= remote_height)
                && matches!(entry.local_height, Some(height) if height <= local_height);
            if !committed_both {
                continue;
            }
            if self
                .log
                .removal_entry(Originator::Remote, add.htlc_id)
                .is_some()
            {
                continue;
            }
            forwardable.push(Forwardable { add: add.clone() });
            forwarded_ids.push(entry.index);
        }
        for entry in self.log.entries_mut() {
            if forwarded_ids.contains(&entry.index) {
                entry.forwarded = true;
            }
        }

        self.log.compact(
            self.local_chain.revoked_height(),
            self.remote_chain.revoked_height(),
        );

        let record = RevokedCommitment {
            height: revoked.height,
            txid: revoked.txid,
            per_commitment_secret: message.per_commitment_secret,
            per_commitment_point: revoked.per_commitment_point,
            to_local_msat: revoked.to_local_msat,
            to_remote_msat: revoked.to_remote_msat,
            htlcs: revoked.htlcs,
        };

        Ok((forwardable, record))
    }
}

impl Extension<BoltExt> for BoltChannel {
    fn identity(&self) -> BoltExt {
        BoltExt::Bolt3
    }

    fn update_from_local(&mut self, message: &UpdateMsg) -> Result<(), Error> {
        match message {
            UpdateMsg::Stage(view) => {
                self.staged = Some(view.clone());
            }
        }
        Ok(())
    }

    fn update_from_peer(&mut self, message: &Messages) -> Result<(), Error> {
        match message {
            Messages::OpenChannel(open_channel) => {
                self.stage = Lifecycle::Proposed;

                self.direction = Direction::Inbound;
                self.active_channel_id =
                    ActiveChannelId::from(open_channel.temporary_channel_id);

                // Policies
                self.remote_params =
                    self.policy.validate_inbound(open_channel)?;
                self.common_params = CommonParams::with(
                    open_channel,
                    self.policy.minimum_depth,
                );

                // Keys
                self.remote_keys = RemoteKeyset::from(open_channel);
                self.remote_per_commitment_point =
                    open_channel.first_per_commitment_point;

                self.init_commitments(
                    open_channel.push_msat,
                    open_channel.funding_satoshis * 1000
                        - open_channel.push_msat,
                );
            }
            Messages::AcceptChannel(accept_channel) => {
                self.stage = Lifecycle::Accepted;

                self.remote_params = self
                    .policy
                    .confirm_outbound(self.local_params, accept_channel)?;

                // Keys
                self.remote_keys = RemoteKeyset::from(accept_channel);
                self.remote_per_commitment_point =
                    accept_channel.first_per_commitment_point;

                // Re-derive the initial commitments now that the remote
                // first per-commitment point is known
                let tip = self.local_chain.tip();
                let (to_local, to_remote) =
                    (tip.to_local_msat, tip.to_remote_msat);
                self.init_commitments(to_local, to_remote);
            }
            Messages::FundingCreated(funding_created) => {
                self.stage = Lifecycle::Funding;

                self.active_channel_id = ActiveChannelId::with(
                    funding_created.funding_txid,
                    funding_created.funding_output_index,
                );
            }
            Messages::FundingSigned(funding_signed) => {
                self.stage = Lifecycle::Funded;

                self.active_channel_id =
                    ActiveChannelId::from(funding_signed.channel_id);
            }
            Messages::FundingLocked(funding_locked) => {
                self.stage = Lifecycle::Locked;
                self.next_remote_per_commitment_point =
                    funding_locked.next_per_commitment_point;
            }
            Messages::ChannelReestablish(_) => {
                self.stage = Lifecycle::Reestablishing;
            }
            // HTLC, fee and the sign/revoke cycle go through the explicit
            // state machine operations: the link must not feed them here
            _ => {}
        }
        Ok(())
    }

    fn load_state(&mut self, state: &ChannelState) {
        self.stage = state.stage;
        self.chain_hash = state.chain_hash;
        self.active_channel_id = state.active_channel_id;
        self.policy = state.policy.clone();
        self.common_params = state.common_params;
        self.local_params = state.local_params;
        self.remote_params = state.remote_params;
        self.local_keys = state.local_keys.clone();
        self.remote_keys = state.remote_keys.clone();
        self.remote_per_commitment_point = state.remote_per_commitment_point;
        self.next_remote_per_commitment_point =
            state.next_remote_per_commitment_point;
        self.remote_secrets = state.remote_secrets.clone();
        self.log = state.log.clone();
        self.local_chain = state.local_chain.clone();
        self.remote_chain = state.remote_chain.clone();
        self.next_local_htlc_id = state.next_local_htlc_id;
        self.next_remote_htlc_id = state.next_remote_htlc_id;
        self.local_acked_index = state.local_acked_index;
        self.best_height = state.best_height;
        self.direction = state.direction;
        self.staged = None;
    }

    fn store_state(&self, state: &mut ChannelState) {
        state.stage = self.stage;
        state.chain_hash = self.chain_hash;
        state.active_channel_id = self.active_channel_id;
        state.policy = self.policy.clone();
        state.common_params = self.common_params;
        state.local_params = self.local_params;
        state.remote_params = self.remote_params;
        state.local_keys = self.local_keys.clone();
        state.remote_keys = self.remote_keys.clone();
        state.remote_per_commitment_point = self.remote_per_commitment_point;
        state.next_remote_per_commitment_point =
            self.next_remote_per_commitment_point;
        state.remote_secrets = self.remote_secrets.clone();
        state.log = self.log.clone();
        state.local_chain = self.local_chain.clone();
        state.remote_chain = self.remote_chain.clone();
        state.next_local_htlc_id = self.next_local_htlc_id;
        state.next_remote_htlc_id = self.next_remote_htlc_id;
        state.local_acked_index = self.local_acked_index;
        state.best_height = self.best_height;
        state.direction = self.direction;
    }
}

impl ChannelExtension<BoltExt> for BoltChannel {
    #[inline]
    fn new() -> Box<dyn ChannelExtension<BoltExt>> {
        Box::new(BoltChannel::default())
    }

    fn build_graph(
        &self,
        tx_graph: &mut TxGraph,
        as_remote_node: bool,
    ) -> Result<(), Error> {
        // Render either the staged view, or (when no staging is active) the
        // current chain tip — the latter is what the arbitrator broadcasts.
        // NB: the tip fallback covers only the base outputs; commitments
        // carrying HTLCs must be staged with `Channel::stage_tip` so the
        // HTLC extension sees the same view.
        let tip_view;
        let view = match &self.staged {
            Some(view) if view.as_remote_node == as_remote_node => view,
            _ => {
                tip_view = self.tip_view(as_remote_node);
                &tip_view
            }
        };

        let obscured = self.obscured_commitment_number(view.height);
        tx_graph.cmt_version = 2;
        tx_graph.cmt_locktime =
            (0x20u32 << 24) | (obscured as u32 & 0x00FF_FFFF);
        tx_graph.cmt_sequence = (0x80u32 << 24) | (obscured >> 24) as u32;
        tx_graph.cmt_outs = Vec::with_capacity(2 + view.htlcs.len());

        let (owner_dust, to_self_delay) = if as_remote_node {
            (
                self.remote_params.dust_limit_satoshis,
                self.local_params.to_self_delay,
            )
        } else {
            (
                self.local_params.dust_limit_satoshis,
                self.remote_params.to_self_delay,
            )
        };
        let (owner_delayed_base, counter_revocation_base) = if as_remote_node {
            (
                self.remote_keys.delayed_payment_basepoint,
                self.local_keys.revocation_basepoint.key,
            )
        } else {
            (
                self.local_keys.delayed_payment_basepoint.key,
                self.remote_keys.revocation_basepoint,
            )
        };
        let (counter_payment_base, counter_static) = if as_remote_node {
            (
                self.local_keys.payment_basepoint.key,
                self.local_keys.static_remotekey,
            )
        } else {
            (
                self.remote_keys.payment_basepoint,
                self.remote_keys.static_remotekey,
            )
        };

        // Fee is always paid by the channel initiator
        let untrimmed = view
            .htlcs
            .iter()
            .filter(|htlc| {
                htlc.amount_msat / 1000
                    >= htlc_dust_threshold(
                        htlc.direction,
                        owner_dust,
                        view.feerate_per_kw,
                    )
            })
            .count();
        let fee = commitment_fee(view.feerate_per_kw, untrimmed);
        let initiator_is_owner = if as_remote_node {
            self.direction.is_inbound()
        } else {
            self.direction.is_outbound()
        };
        let (to_local_fee, to_remote_fee) = if initiator_is_owner {
            (fee, 0)
        } else {
            (0, fee)
        };

        let to_local_sat =
            (view.to_local_msat / 1000).saturating_sub(to_local_fee);
        let to_remote_sat =
            (view.to_remote_msat / 1000).saturating_sub(to_remote_fee);

        if to_local_sat >= owner_dust {
            let witness_script = WitnessScript::ln_to_local(
                to_local_sat,
                derive_revocation_pubkey(
                    counter_revocation_base,
                    view.per_commitment_point,
                ),
                derive_pubkey(owner_delayed_base, view.per_commitment_point),
                to_self_delay,
            );
            let txout = TxOut {
                value: to_local_sat,
                script_pubkey: witness_script.to_p2wsh().into_inner(),
            };
            let mut psbt_out = bitcoin::util::psbt::Output::default();
            psbt_out.witness_script = Some(witness_script.to_inner());
            tx_graph.cmt_outs.push((txout, psbt_out));
        }
        if to_remote_sat >= owner_dust {
            let remote_pubkey = if counter_static {
                counter_payment_base
            } else {
                derive_pubkey(counter_payment_base, view.per_commitment_point)
            };
            tx_graph.cmt_outs.push((
                TxOut::ln_to_remote(to_remote_sat, remote_pubkey),
                bitcoin::util::psbt::Output::default(),
            ));
        }

        Ok(())
    }
}

impl ChannelConstructor<BoltExt> for BoltChannel {
    fn enrich_funding(
        &self,
        psbt: &mut Psbt,
        funding: &Funding,
    ) -> Result<(), Error> {
        let vout = psbt
            .channel_funding_output()
            .ok_or(funding::Error::NoFundingOutput)?;
        psbt.outputs[vout].witness_script = Some(
            WitnessScript::ln_funding(
                funding.amount(),
                &self.local_keys.funding_pubkey,
                self.remote_keys.funding_pubkey,
            )
            .into_inner(),
        );
        psbt.unsigned_tx.output[vout].script_pubkey = PubkeyScript::ln_funding(
            funding.amount(),
            &self.local_keys.funding_pubkey,
            self.remote_keys.funding_pubkey,
        )
        .into_inner();
        psbt.outputs[vout].bip32_derivation =
            self.local_keys.funding_pubkey.to_bip32_derivation_map();
        Ok(())
    }
}

pub trait ScriptGenerators {
    fn ln_funding(
        amount: u64,
        local_pubkey: &LocalPubkey,
        remote_pubkey: PublicKey,
    ) -> Self;

    /// NB: We use argument named `local_delayedpubkey`, but in fact the
    /// source for this key is the key of the transaction owner, since we
    /// may generate a transaction which we will sign for the remote node.
    fn ln_to_local(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;

    /// NB: We use argument named `remote_pubkey`, but in fact the source
    /// for this key is the counterparty of the transaction owner.
    fn ln_to_remote(amount: u64, remote_pubkey: PublicKey) -> Self;
}

impl ScriptGenerators for LockScript {
    fn ln_funding(
        _: u64,
        local_pubkey: &LocalPubkey,
        remote_pubkey: PublicKey,
    ) -> Self {
        let pk = vec![
            local_pubkey.to_bitcoin_pk(),
            bitcoin::PublicKey::new(remote_pubkey),
        ]
        .lex_ordered();

        script::Builder::new()
            .push_int(2)
            .push_key(&pk[0])
            .push_key(&pk[1])
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
            .into()
    }

    fn ln_to_local(
        _: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_IF)
            .push_key(&bitcoin::PublicKey::new(revocationpubkey))
            .push_opcode(OP_ELSE)
            .push_int(to_self_delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_key(&bitcoin::PublicKey::new(local_delayedpubkey))
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
            .into()
    }

    fn ln_to_remote(_: u64, _: PublicKey) -> Self {
        unimplemented!("LockScript can't be generated for to_remote output")
    }
}

impl ScriptGenerators for WitnessScript {
    #[inline]
    fn ln_funding(
        amount: u64,
        local_pubkey: &LocalPubkey,
        remote_pubkey: PublicKey,
    ) -> Self {
        LockScript::ln_funding(amount, local_pubkey, remote_pubkey).into()
    }

    #[inline]
    fn ln_to_local(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        LockScript::ln_to_local(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .into()
    }

    #[inline]
    fn ln_to_remote(_: u64, _: PublicKey) -> Self {
        unimplemented!("WitnessScript can't be generated for to_remote output")
    }
}

impl ScriptGenerators for PubkeyScript {
    #[inline]
    fn ln_funding(
        amount: u64,
        local_pubkey: &LocalPubkey,
        remote_pubkey: PublicKey,
    ) -> Self {
        WitnessScript::ln_funding(amount, local_pubkey, remote_pubkey)
            .to_p2wsh()
    }

    #[inline]
    fn ln_to_local(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        WitnessScript::ln_to_local(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .to_p2wsh()
    }

    #[inline]
    fn ln_to_remote(_: u64, remote_pubkey: PublicKey) -> Self {
        bitcoin::PublicKey::new(remote_pubkey)
            .wpubkey_hash()
            .expect("We just generated non-compressed key")
            .into()
    }
}

impl ScriptGenerators for TxOut {
    #[inline]
    fn ln_funding(
        amount: u64,
        local_pubkey: &LocalPubkey,
        remote_pubkey: PublicKey,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: PubkeyScript::ln_funding(
                amount,
                local_pubkey,
                remote_pubkey,
            )
            .into(),
        }
    }

    #[inline]
    fn ln_to_local(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: PubkeyScript::ln_to_local(
                amount,
                revocationpubkey,
                local_delayedpubkey,
                to_self_delay,
            )
            .into(),
        }
    }

    #[inline]
    fn ln_to_remote(amount: u64, remote_pubkey: PublicKey) -> Self {
        TxOut {
            value: amount,
            script_pubkey: PubkeyScript::ln_to_remote(amount, remote_pubkey)
                .into(),
        }
    }
}

#[cfg(test)]
mod test {
    use amplify::Slice32;
    use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
    use bitcoin::{OutPoint, Transaction, TxOut};
    use secp256k1::SecretKey;
    use strict_encoding::{StrictDecode, StrictEncode};

    use super::*;
    use crate::wallet::MemoryChannelSigner;

    fn signer(tag: u8) -> MemoryChannelSigner {
        MemoryChannelSigner::with(
            SecretKey::from_slice(&[tag; 32]).unwrap(),
            SecretKey::from_slice(&[tag + 1; 32]).unwrap(),
            SecretKey::from_slice(&[tag + 2; 32]).unwrap(),
            SecretKey::from_slice(&[tag + 3; 32]).unwrap(),
            SecretKey::from_slice(&[tag + 4; 32]).unwrap(),
        )
    }

    fn keyset(signer: &MemoryChannelSigner, seed: u8) -> LocalKeyset {
        let basepoints = signer.basepoints();
        let local = |key| LocalPubkey {
            key,
            source: Default::default(),
        };
        LocalKeyset {
            funding_pubkey: local(basepoints[0]),
            payment_basepoint: local(basepoints[1]),
            delayed_payment_basepoint: local(basepoints[2]),
            revocation_basepoint: local(basepoints[3]),
            htlc_basepoint: local(basepoints[4]),
            shachain_seed: Slice32::from_inner([seed; 32]),
            shutdown_scriptpubkey: None,
            static_remotekey: false,
        }
    }

    fn policy() -> Policy {
        Policy {
            dust_limit_satoshis_max: Some(700),
            funding_satoshis_min: Some(100_000),
            ..Policy::default()
        }
    }

    fn peer_params() -> PeerParams {
        PeerParams {
            dust_limit_satoshis: 600,
            to_self_delay: 144,
            htlc_minimum_msat: 1000,
            max_htlc_value_in_flight_msat: 1_000_000_000,
            channel_reserve_satoshis: 10_000,
            max_accepted_htlcs: 30,
        }
    }

    fn common_params() -> CommonParams {
        CommonParams {
            minimum_depth: 3,
            feerate_per_kw: 6000,
            announce_channel: true,
            channel_type: Default::default(),
        }
    }

    struct Harness {
        alice: Channel<BoltExt>,
        bob: Channel<BoltExt>,
        alice_signer: MemoryChannelSigner,
        bob_signer: MemoryChannelSigner,
    }

    // Establishes a funded 1'000'000 sat channel: Alice holds 600'000,
    // Bob 400'000, feerate 6000 sat/kw, dust limit 600.
    fn establish() -> Harness {
        let alice_signer = signer(0x10);
        let bob_signer = signer(0x20);
        let alice_keys = keyset(&alice_signer, 0xa1);
        let bob_keys = keyset(&bob_signer, 0xb2);

        let temp_id = TempChannelId::random();
        let mut alice = Channel::<BoltExt>::with(
            temp_id,
            Slice32::default(),
            policy(),
            common_params(),
            peer_params(),
            alice_keys.clone(),
        );
        let open_channel = alice
            .compose_open_channel(
                1_000_000,
                400_000_000,
                policy(),
                common_params(),
                peer_params(),
                alice_keys,
            )
            .unwrap();

        let mut bob = Channel::<BoltExt>::with(
            temp_id,
            Slice32::default(),
            policy(),
            common_params(),
            peer_params(),
            bob_keys,
        );
        bob.update_from_peer(&Messages::OpenChannel(open_channel))
            .unwrap();
        let accept_channel = bob.compose_accept_channel().unwrap();
        alice
            .update_from_peer(&Messages::AcceptChannel(accept_channel))
            .unwrap();

        // Shared funding transaction paying into the 2-of-2
        let mut funding_psbt = Psbt::from_unsigned_tx(Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: 1_000_000,
                script_pubkey: Default::default(),
            }],
        })
        .unwrap();
        funding_psbt.set_channel_funding_output(0).unwrap();
        alice.set_funding(funding_psbt.clone()).unwrap();
        let outpoint = alice.funding().outpoint();
        alice
            .constructor_mut()
            .assign_channel_id(outpoint.txid, outpoint.vout as u16);
        bob.set_remote_funding(funding_psbt, outpoint).unwrap();
        bob.constructor_mut()
            .assign_channel_id(outpoint.txid, outpoint.vout as u16);

        // funding_locked exchange advertises the points for commitment 1
        let alice_locked = alice.compose_funding_locked().unwrap();
        let bob_locked = bob.compose_funding_locked().unwrap();
        alice
            .update_from_peer(&Messages::FundingLocked(bob_locked))
            .unwrap();
        bob.update_from_peer(&Messages::FundingLocked(alice_locked))
            .unwrap();
        alice.constructor_mut().set_stage(Lifecycle::Active);
        bob.constructor_mut().set_stage(Lifecycle::Active);
        alice.set_best_height(100);
        bob.set_best_height(100);

        Harness {
            alice,
            bob,
            alice_signer,
            bob_signer,
        }
    }

    fn preimage() -> HashPreimage {
        HashPreimage::from(Slice32::from_inner([0x01; 32]))
    }

    // Drives one full sign/revoke cycle from `from` to `to`, returning the
    // HTLCs which became forwardable on the `from` side.
    fn cycle(
        from: &mut Channel<BoltExt>,
        from_signer: &MemoryChannelSigner,
        to: &mut Channel<BoltExt>,
    ) -> Vec<Forwardable> {
        let commitment_signed = from.sign_next_commitment(from_signer).unwrap();
        to.receive_new_commitment(&commitment_signed).unwrap();
        let revocation = to.revoke_current_commitment().unwrap();
        let (forwardable, _revoked) =
            from.receive_revocation(&revocation).unwrap();
        forwardable
    }

    #[test]
    fn single_htlc_round_trip() {
        let mut h = establish();

        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        assert_eq!(add.htlc_id, 0);
        h.bob.receive_htlc(&add).unwrap();

        // Alice commits the add into Bob's chain, Bob revokes and signs
        // back; the HTLC locks in on both chains
        cycle(&mut h.alice, &h.alice_signer, &mut h.bob);
        let forwardable = cycle(&mut h.bob, &h.bob_signer, &mut h.alice);
        assert_eq!(forwardable.len(), 1);
        assert_eq!(forwardable[0].add.amount_msat, 100_000_000);

        // Both parties construct byte-identical commitment transactions
        assert_eq!(
            h.alice.constructor().remote_chain().tip().txid,
            h.bob.constructor().local_chain().tip().txid,
        );
        assert_eq!(
            h.alice.constructor().local_chain().tip().txid,
            h.bob.constructor().remote_chain().tip().txid,
        );

        // Bob settles with the preimage; two more cycles clear the HTLC
        let fulfill = h.bob.settle_htlc(0, preimage()).unwrap();
        let (settled_id, settled_preimage) =
            h.alice.receive_settle(&fulfill).unwrap();
        assert_eq!(settled_id, 0);
        assert_eq!(settled_preimage, preimage());

        cycle(&mut h.bob, &h.bob_signer, &mut h.alice);
        cycle(&mut h.alice, &h.alice_signer, &mut h.bob);

        // Final balances: 500'000 sat each
        assert_eq!(h.alice.local_amount_msat(), 500_000_000);
        assert_eq!(h.alice.remote_amount_msat(), 500_000_000);
        assert_eq!(h.bob.local_amount_msat(), 500_000_000);
        assert_eq!(h.bob.remote_amount_msat(), 500_000_000);

        // The settled HTLC left both commitment tips
        assert!(h.alice.constructor().local_chain().tip().htlcs.is_empty());
        assert!(h.alice.constructor().remote_chain().tip().htlcs.is_empty());
        assert!(h.bob.constructor().local_chain().tip().htlcs.is_empty());
        assert!(h.bob.constructor().remote_chain().tip().htlcs.is_empty());
    }

    #[test]
    fn commitment_includes_htlc_output() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();
        cycle(&mut h.alice, &h.alice_signer, &mut h.bob);

        // Bob's local commitment: to_local, to_remote and the HTLC output
        let commitment = h.bob.commitment_tx(false).unwrap();
        assert_eq!(commitment.unsigned_tx.output.len(), 3);
        let total: u64 = commitment
            .unsigned_tx
            .output
            .iter()
            .map(|out| out.value)
            .sum();
        // Total output value plus the commitment fee equals the funding
        let fee = commitment_fee(6000, 1);
        assert_eq!(total + fee, 1_000_000);
        assert!(commitment
            .unsigned_tx
            .output
            .iter()
            .any(|out| out.value == 100_000));
    }

    #[test]
    fn double_sign_requires_revocation() {
        let mut h = establish();
        h.alice
            .compose_add_htlc(
                50_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();

        h.alice.sign_next_commitment(&h.alice_signer).unwrap();
        // No second signature before the revocation arrives
        assert!(matches!(
            h.alice.sign_next_commitment(&h.alice_signer),
            Err(Error::UnackedCommitment)
        ));
    }

    #[test]
    fn sign_without_updates_rejected() {
        let mut h = establish();
        assert!(matches!(
            h.alice.sign_next_commitment(&h.alice_signer),
            Err(Error::NoUpdates)
        ));
    }

    #[test]
    fn add_htlc_policy_taxonomy() {
        let mut h = establish();

        assert!(matches!(
            h.alice.compose_add_htlc(
                500,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            ),
            Err(Error::BelowMinimum { .. })
        ));
        assert!(matches!(
            h.alice.compose_add_htlc(
                10_000_000,
                HashLock::from(preimage()),
                105,
                lnwire::UpdateAddHtlc::template_onion(),
            ),
            Err(Error::ExpiryTooSoon { .. })
        ));
        // The in-flight cap allows it, the spendable balance does not
        assert!(matches!(
            h.alice.compose_add_htlc(
                700_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            ),
            Err(Error::InsufficientBalance { .. })
        ));
        // Two smaller HTLCs together blow the in-flight limit
        h.alice
            .compose_add_htlc(
                400_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        assert!(matches!(
            h.alice.compose_add_htlc(
                650_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            ),
            Err(Error::ExceedsMaxInFlight { .. })
        ));
    }

    #[test]
    fn settle_taxonomy() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();

        assert!(matches!(
            h.bob.settle_htlc(7, preimage()),
            Err(Error::UnknownHtlcIndex(7))
        ));
        let wrong = HashPreimage::from(Slice32::from_inner([0xEE; 32]));
        assert!(matches!(
            h.bob.settle_htlc(0, wrong),
            Err(Error::PreimageMismatch(0))
        ));
        assert!(h.bob.settle_htlc(0, preimage()).is_ok());
    }

    #[test]
    fn update_fee_only_from_initiator() {
        let mut h = establish();
        // Bob is not the initiator
        assert!(matches!(
            h.bob.update_fee(7000),
            Err(Error::UpdateFeeFromNonInitiator)
        ));
        assert!(matches!(
            h.alice.update_fee(100),
            Err(Error::FeeTooLow { .. })
        ));

        let update = h.alice.update_fee(7000).unwrap();
        h.bob.receive_update_fee(&update).unwrap();
        cycle(&mut h.alice, &h.alice_signer, &mut h.bob);
        assert_eq!(
            h.bob.constructor().local_chain().tip().feerate_per_kw,
            7000
        );
    }

    #[test]
    fn retransmitted_commitment_is_byte_identical() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();

        // Alice signs height 1; the message is lost before Bob sees it
        let original = h.alice.sign_next_commitment(&h.alice_signer).unwrap();

        // On reconnect Bob still expects commitment number 1
        let bob_reestablish = h.bob.compose_reestablish_channel().unwrap();
        assert_eq!(bob_reestablish.next_commitment_number, 1);
        let action = h.alice.verify_reestablish(&bob_reestablish).unwrap();
        assert_eq!(action, ReestablishAction::Retransmit {
            revocation: false,
            commitment: true,
        });

        let retransmitted = h.alice.retransmit_commitment().unwrap();
        assert_eq!(retransmitted, original);

        // Bob processes the retransmission as if nothing happened
        h.bob.receive_new_commitment(&retransmitted).unwrap();
        let revocation = h.bob.revoke_current_commitment().unwrap();
        h.alice.receive_revocation(&revocation).unwrap();
    }

    #[test]
    fn synchronized_peers_need_no_retransmission() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();
        cycle(&mut h.alice, &h.alice_signer, &mut h.bob);
        cycle(&mut h.bob, &h.bob_signer, &mut h.alice);

        let bob_reestablish = h.bob.compose_reestablish_channel().unwrap();
        assert_eq!(
            h.alice.verify_reestablish(&bob_reestablish).unwrap(),
            ReestablishAction::Synchronized
        );
        let alice_reestablish =
            h.alice.compose_reestablish_channel().unwrap();
        assert_eq!(
            h.bob.verify_reestablish(&alice_reestablish).unwrap(),
            ReestablishAction::Synchronized
        );
    }

    #[test]
    fn invalid_revocation_rejected() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();

        let commitment_signed =
            h.alice.sign_next_commitment(&h.alice_signer).unwrap();
        h.bob.receive_new_commitment(&commitment_signed).unwrap();
        let mut revocation = h.bob.revoke_current_commitment().unwrap();
        // Tamper with the revealed secret
        revocation.per_commitment_secret =
            SecretKey::from_slice(&[0x42; 32]).unwrap();
        assert!(matches!(
            h.alice.receive_revocation(&revocation),
            Err(Error::InvalidRevocation)
        ));
    }

    #[test]
    fn invalid_commitment_signature_rejected() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();

        let mut commitment_signed =
            h.alice.sign_next_commitment(&h.alice_signer).unwrap();
        // Swap in a signature over garbage
        commitment_signed.signature = {
            let message =
                secp256k1::Message::from_slice(&[0x99; 32]).unwrap();
            SECP256K1.sign_ecdsa(
                &message,
                &SecretKey::from_slice(&[0x61; 32]).unwrap(),
            )
        };
        assert!(matches!(
            h.bob.receive_new_commitment(&commitment_signed),
            Err(Error::InvalidSignature)
        ));
        // The failed staging left no trace: a good retransmission passes
        let good = h.alice.retransmit_commitment().unwrap();
        h.bob.receive_new_commitment(&good).unwrap();
    }

    #[test]
    fn state_roundtrip() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();
        cycle(&mut h.alice, &h.alice_signer, &mut h.bob);
        cycle(&mut h.bob, &h.bob_signer, &mut h.alice);

        let serialized = h.alice.strict_serialize().unwrap();
        let restored =
            Channel::<BoltExt>::strict_deserialize(&serialized).unwrap();

        let mut original_state = ChannelState::dumb_default();
        h.alice.store_state(&mut original_state);
        let mut restored_state = ChannelState::dumb_default();
        restored.store_state(&mut restored_state);
        assert_eq!(original_state, restored_state);
    }

    #[test]
    fn receive_htlc_id_sequence_enforced() {
        let mut h = establish();
        let mut add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        add.htlc_id = 5;
        assert!(matches!(
            h.bob.receive_htlc(&add),
            Err(Error::HtlcIdViolation {
                expected: 0,
                got: 5
            })
        ));
    }

    #[test]
    fn revoked_commitment_carries_breach_material() {
        let mut h = establish();
        let add = h
            .alice
            .compose_add_htlc(
                100_000_000,
                HashLock::from(preimage()),
                140,
                lnwire::UpdateAddHtlc::template_onion(),
            )
            .unwrap();
        h.bob.receive_htlc(&add).unwrap();

        let commitment_signed =
            h.alice.sign_next_commitment(&h.alice_signer).unwrap();
        h.bob.receive_new_commitment(&commitment_signed).unwrap();
        let revocation = h.bob.revoke_current_commitment().unwrap();
        let (_, revoked) = h.alice.receive_revocation(&revocation).unwrap();

        assert_eq!(revoked.height, 0);
        // The secret matches the point the commitment was built for
        assert_eq!(
            PublicKey::from_secret_key(
                SECP256K1,
                &revoked.per_commitment_secret
            ),
            revoked.per_commitment_point
        );
    }
}
