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

//! HTLC switch: routes HTLC packets between channel links, maintains the
//! persistent circuit map and propagates settles and fails along the
//! reverse path.
//!
//! The switch runs as a single task with a command mailbox; links talk to
//! it through [`SwitchHandle`], the switch talks to links through their
//! own mailboxes. Packets accepted toward an outgoing link are never
//! redirected: failure to add results in an immediate fail-back.

mod circuit;
pub mod link;

use std::collections::HashMap;
use std::sync::Arc;

use amplify::Slice32;
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
pub use circuit::{Circuit, CircuitKey, CircuitMap};
use internet2::addr::NodeId;
pub use link::{Link, LinkCommand, LinkEvent, LinkHandle};
use lnwire::{
    ChannelId, FailureCode, FailureMessage, OnionPacket, PaymentOnion,
    UpdateAddHtlc,
};
use tokio::sync::{mpsc, oneshot};

use crate::persist::StoreError;

/// Forwarding parameters of one channel direction, the switch-side view of
/// a `channel_update`
#[derive(Copy, Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ForwardingPolicy {
    /// Flat fee charged per forwarded HTLC, msat
    pub base_fee_msat: u64,

    /// Proportional fee in millionths of the forwarded amount
    pub fee_rate_millionths: u64,

    /// Blocks subtracted from the incoming expiry towards the outgoing one
    pub cltv_expiry_delta: u16,

    /// Smallest HTLC the channel forwards, msat
    pub htlc_minimum_msat: u64,

    /// Largest HTLC the channel forwards, msat
    pub htlc_maximum_msat: u64,
}

impl Default for ForwardingPolicy {
    fn default() -> Self {
        ForwardingPolicy {
            base_fee_msat: 1000,
            fee_rate_millionths: 100,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1,
            htlc_maximum_msat: u64::MAX,
        }
    }
}

impl ForwardingPolicy {
    /// Fee required for forwarding `amount_msat` downstream:
    /// `base + ceil(amount × rate / 1e6)`
    pub fn fee_msat(&self, amount_msat: u64) -> u64 {
        let proportional = (amount_msat * self.fee_rate_millionths
            + 999_999)
            / 1_000_000;
        self.base_fee_msat + proportional
    }

    /// Combines two policies into the strictest of both; used for the
    /// non-strict forwarding rule where any channel to the same peer may
    /// carry the HTLC.
    pub fn strictest(self, other: ForwardingPolicy) -> ForwardingPolicy {
        ForwardingPolicy {
            base_fee_msat: self.base_fee_msat.max(other.base_fee_msat),
            fee_rate_millionths: self
                .fee_rate_millionths
                .max(other.fee_rate_millionths),
            cltv_expiry_delta: self
                .cltv_expiry_delta
                .max(other.cltv_expiry_delta),
            htlc_minimum_msat: self
                .htlc_minimum_msat
                .max(other.htlc_minimum_msat),
            htlc_maximum_msat: self
                .htlc_maximum_msat
                .min(other.htlc_maximum_msat),
        }
    }

    /// Validates a forwarding request against this policy
    pub fn check_forward(
        &self,
        incoming_amount_msat: u64,
        outgoing_amount_msat: u64,
        incoming_expiry: u32,
        outgoing_expiry: u32,
    ) -> Result<(), FailureCode> {
        if outgoing_amount_msat < self.htlc_minimum_msat {
            return Err(FailureCode::AmountBelowMinimum);
        }
        if outgoing_amount_msat > self.htlc_maximum_msat {
            return Err(FailureCode::TemporaryChannelFailure);
        }
        let required = outgoing_amount_msat + self.fee_msat(outgoing_amount_msat);
        if incoming_amount_msat < required {
            return Err(FailureCode::FeeInsufficient);
        }
        if incoming_expiry
            < outgoing_expiry + self.cltv_expiry_delta as u32
        {
            return Err(FailureCode::IncorrectCltvExpiry);
        }
        Ok(())
    }
}

/// One onion layer decoded for the local hop
#[derive(Clone, Debug)]
pub struct DecodedHop {
    /// Per-hop payload addressed to this node
    pub payload: PaymentOnion,

    /// Onion packet for the next hop; `None` when this node is the final
    /// hop
    pub next_packet: Option<OnionPacket>,

    /// Shared secret of this hop, needed for failure wrapping
    pub shared_secret: Slice32,
}

/// Onion processing seam: Sphinx decoding and failure-message encryption
/// are provided by the transport layer.
pub trait OnionProcessor: Send + Sync {
    /// Peels one onion layer of the HTLC addressed to the local node
    fn decode_hop(
        &self,
        add: &UpdateAddHtlc,
    ) -> Result<DecodedHop, FailureCode>;

    /// Constructs an encrypted failure reason originating at this hop
    fn construct_failure(
        &self,
        shared_secret: Slice32,
        failure: &FailureMessage,
    ) -> Vec<u8>;

    /// Adds this hop's encryption layer to a failure reason relayed from
    /// downstream
    fn relay_failure(
        &self,
        shared_secret: Slice32,
        reason: Vec<u8>,
    ) -> Vec<u8>;
}

/// Invoice knowledge consumed for final-hop validation; the invoice
/// producer and store are external.
pub trait PaymentRegistry: Send + Sync {
    /// Terms of an invoice issued for the payment hash, if known
    fn expected_payment(&self, payment_hash: HashLock)
        -> Option<InvoiceTerms>;

    /// Preimage for a known payment hash
    fn preimage(&self, payment_hash: HashLock) -> Option<HashPreimage>;
}

/// Terms of an issued invoice relevant for accepting the final hop
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InvoiceTerms {
    /// Invoiced amount; `None` for "any amount" invoices
    pub amount_msat: Option<u64>,

    /// Minimum CLTV delta the final HTLC must have over the chain tip
    pub min_final_cltv_delta: u32,

    /// Payment secret expected in the onion payload
    pub payment_secret: Option<Slice32>,
}

/// HTLC packet forwarded from an incoming link to the switch after onion
/// decoding
#[derive(Clone, Debug)]
pub struct ForwardPacket {
    /// The incoming HTLC slot
    pub incoming: CircuitKey,

    /// Peer owning the incoming channel
    pub incoming_peer: NodeId,

    /// The original add message
    pub add: UpdateAddHtlc,

    /// Decoded per-hop payload
    pub payload: PaymentOnion,

    /// Onion for the next hop (`None` at the final hop)
    pub next_packet: Option<OnionPacket>,

    /// Shared secret of the incoming hop
    pub shared_secret: Slice32,
}

/// Terminal event of an outgoing HTLC leg
#[derive(Clone, Debug)]
pub enum ResolutionEvent {
    /// The downstream peer settled with the preimage
    Settle(HashPreimage),

    /// The downstream peer failed with an encrypted reason
    Fail(Vec<u8>),

    /// The add could not be placed on the outgoing link
    AddFailed(FailureCode),
}

/// Commands processed by the switch task
pub enum SwitchCommand {
    /// Register a link so packets can be routed to it
    RegisterLink(LinkHandle),

    /// Remove a link (cooperative close or arbitrator takeover); in-flight
    /// circuits through it fail back with `TemporaryChannelFailure`
    UnregisterLink(ChannelId),

    /// Update the forwarding policy of a registered link
    UpdatePolicy(ChannelId, ForwardingPolicy),

    /// An HTLC became forwardable on an incoming link
    Forward(ForwardPacket),

    /// An outgoing leg reached a terminal state
    Resolve {
        outgoing: CircuitKey,
        event: ResolutionEvent,
    },

    /// An add handed to an outgoing link was rejected before any circuit
    /// was opened; fail the incoming leg immediately
    AddRejected {
        incoming: CircuitKey,
        shared_secret: Slice32,
        code: FailureCode,
    },

    /// Dispatch a locally originated payment
    Dispatch(DispatchPayment),

    /// Stop the switch loop
    Shutdown,
}

/// Locally originated payment dispatch.
///
/// Dropping the `response` receiver cancels the dispatch at the switch
/// boundary: the switch checks the channel before committing the packet to
/// an outgoing link.
pub struct DispatchPayment {
    /// Outgoing channel requested by the payment logic
    pub short_channel_id: u64,

    /// HTLC amount, msat
    pub amount_msat: u64,

    /// Payment hash
    pub payment_hash: HashLock,

    /// Absolute expiry of the first hop
    pub cltv_expiry: u32,

    /// Fully constructed payment onion
    pub onion: OnionPacket,

    /// Completion notification
    pub response: oneshot::Sender<Result<(), FailureCode>>,
}

/// Cloneable handle for submitting commands to the switch task
#[derive(Clone)]
pub struct SwitchHandle {
    commands: mpsc::Sender<SwitchCommand>,
}

impl SwitchHandle {
    /// Submits a command, awaiting mailbox capacity
    pub async fn send(&self, command: SwitchCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Submits a command without waiting; used from contexts which must
    /// not block
    pub fn try_send(
        &self,
        command: SwitchCommand,
    ) -> Result<(), SwitchCommand> {
        self.commands.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(cmd)
            | mpsc::error::TrySendError::Closed(cmd) => cmd,
        })
    }
}

struct RegisteredLink {
    handle: LinkHandle,
    policy: ForwardingPolicy,
}

/// The HTLC switch task state
pub struct Switch {
    commands: mpsc::Receiver<SwitchCommand>,
    links: HashMap<ChannelId, RegisteredLink>,
    by_scid: HashMap<u64, ChannelId>,
    circuits: Arc<CircuitMap>,
    onion: Arc<dyn OnionProcessor>,
    payments: Arc<dyn PaymentRegistry>,
    best_height: u32,
}

impl Switch {
    /// Creates the switch together with its command handle
    pub fn with(
        circuits: Arc<CircuitMap>,
        onion: Arc<dyn OnionProcessor>,
        payments: Arc<dyn PaymentRegistry>,
        mailbox_size: usize,
    ) -> (Switch, SwitchHandle) {
        let (tx, rx) = mpsc::channel(mailbox_size);
        (
            Switch {
                commands: rx,
                links: HashMap::new(),
                by_scid: HashMap::new(),
                circuits,
                onion,
                payments,
                best_height: 0,
            },
            SwitchHandle { commands: tx },
        )
    }

    /// Updates the chain tip used for final-hop expiry validation
    pub fn set_best_height(&mut self, height: u32) {
        self.best_height = height;
    }

    /// Runs the switch until shutdown. Packets belonging to the same
    /// circuit are processed in arrival order; there is no reordering
    /// inside the single mailbox.
    pub async fn run(mut self) {
        info!("HTLC switch started");
        while let Some(command) = self.commands.recv().await {
            match command {
                SwitchCommand::RegisterLink(handle) => {
                    self.register_link(handle)
                }
                SwitchCommand::UnregisterLink(channel_id) => {
                    self.unregister_link(channel_id).await
                }
                SwitchCommand::UpdatePolicy(channel_id, policy) => {
                    if let Some(link) = self.links.get_mut(&channel_id) {
                        link.policy = policy;
                    }
                }
                SwitchCommand::Forward(packet) => {
                    self.handle_forward(packet).await
                }
                SwitchCommand::Resolve { outgoing, event } => {
                    self.handle_resolution(outgoing, event).await
                }
                SwitchCommand::AddRejected {
                    incoming,
                    shared_secret,
                    code,
                } => self.fail_back(incoming, shared_secret, code).await,
                SwitchCommand::Dispatch(dispatch) => {
                    self.handle_dispatch(dispatch).await
                }
                SwitchCommand::Shutdown => break,
            }
        }
        info!("HTLC switch stopped");
    }

    fn register_link(&mut self, handle: LinkHandle) {
        debug!(
            "registering link for channel {} ({:?})",
            handle.channel_id, handle.short_channel_id
        );
        if let Some(scid) = handle.short_channel_id {
            self.by_scid.insert(scid, handle.channel_id);
        }
        self.links.insert(handle.channel_id, RegisteredLink {
            handle,
            policy: ForwardingPolicy::default(),
        });
    }

    async fn unregister_link(&mut self, channel_id: ChannelId) {
        debug!("unregistering link for channel {}", channel_id);
        if let Some(link) = self.links.remove(&channel_id) {
            if let Some(scid) = link.handle.short_channel_id {
                self.by_scid.remove(&scid);
            }
        }
    }

    /// Candidate outgoing channel for the requested short channel id: the
    /// requested channel when available, otherwise any channel to the same
    /// peer (non-strict forwarding). The applied policy is the strictest
    /// across all channels of that peer.
    fn select_outgoing(
        &self,
        short_channel_id: u64,
    ) -> Option<(&RegisteredLink, ForwardingPolicy)> {
        let channel_id = self.by_scid.get(&short_channel_id)?;
        let requested = self.links.get(channel_id)?;
        let peer = requested.handle.peer;
        let unified = self
            .links
            .values()
            .filter(|link| link.handle.peer == peer)
            .fold(requested.policy, |policy, link| {
                policy.strictest(link.policy)
            });
        let selected = self
            .links
            .values()
            .filter(|link| link.handle.peer == peer)
            .find(|link| !link.handle.sender.is_closed())
            .unwrap_or(requested);
        Some((selected, unified))
    }

    async fn fail_back(
        &self,
        incoming: CircuitKey,
        shared_secret: Slice32,
        code: FailureCode,
    ) {
        let reason = self
            .onion
            .construct_failure(shared_secret, &FailureMessage::with(code));
        if let Some(link) = self.links.get(&incoming.channel_id) {
            let _ = link
                .handle
                .sender
                .send(LinkCommand::FailHtlc {
                    htlc_id: incoming.htlc_id,
                    reason,
                })
                .await;
        } else {
            warn!(
                "can't fail back HTLC {}: the incoming link is gone",
                incoming
            );
        }
    }

    async fn handle_forward(&mut self, packet: ForwardPacket) {
        // Replays after a restart: if the circuit is already open the add
        // was forwarded before the crash
        if self.circuits.contains_incoming(packet.incoming) {
            trace!(
                "suppressing duplicate forward of {} (circuit exists)",
                packet.incoming
            );
            return;
        }

        match packet.payload.outgoing_channel() {
            Some(short_channel_id) => {
                self.forward_to_link(packet, short_channel_id.into()).await
            }
            None => self.accept_final(packet).await,
        }
    }

    async fn forward_to_link(
        &mut self,
        packet: ForwardPacket,
        short_channel_id: u64,
    ) {
        let (outgoing_channel, sender, policy) =
            match self.select_outgoing(short_channel_id) {
                Some((link, policy)) => (
                    link.handle.channel_id,
                    link.handle.sender.clone(),
                    policy,
                ),
                None => {
                    debug!(
                        "no link for short channel id {}; failing back",
                        short_channel_id
                    );
                    return self
                        .fail_back(
                            packet.incoming,
                            packet.shared_secret,
                            FailureCode::UnknownNextPeer,
                        )
                        .await;
                }
            };

        let outgoing_amount = packet.payload.amt_to_forward;
        let outgoing_expiry = packet.payload.outgoing_cltv_value;
        if let Err(code) = policy.check_forward(
            packet.add.amount_msat,
            outgoing_amount,
            packet.add.cltv_expiry,
            outgoing_expiry,
        ) {
            debug!(
                "forward of {} rejected by policy: {}",
                packet.incoming, code
            );
            return self
                .fail_back(packet.incoming, packet.shared_secret, code)
                .await;
        }

        let next_packet = match packet.next_packet {
            Some(onion) => onion,
            None => {
                // An intermediary payload without a next onion is a
                // malformed packet slipping through decode
                return self
                    .fail_back(
                        packet.incoming,
                        packet.shared_secret,
                        FailureCode::InvalidOnionHmac,
                    )
                    .await;
            }
        };

        let command = LinkCommand::SendHtlc {
            incoming: Some(packet.incoming),
            amount_msat: outgoing_amount,
            payment_hash: packet.add.payment_hash,
            cltv_expiry: outgoing_expiry,
            onion: next_packet,
            incoming_amount_msat: packet.add.amount_msat,
            incoming_expiry: packet.add.cltv_expiry,
            shared_secret: packet.shared_secret,
            outgoing_channel,
        };
        // Exclusive routing: once the packet is accepted towards the
        // outgoing link it is never redirected. A full mailbox means the
        // link is draining or congested — fail back instead of waiting.
        if sender.try_send(command).is_err() {
            self.fail_back(
                packet.incoming,
                packet.shared_secret,
                FailureCode::TemporaryChannelFailure,
            )
            .await;
        }
    }

    async fn accept_final(&mut self, packet: ForwardPacket) {
        let payment_hash = packet.add.payment_hash;
        let terms = match self.payments.expected_payment(payment_hash) {
            Some(terms) => terms,
            None => {
                return self
                    .fail_back(
                        packet.incoming,
                        packet.shared_secret,
                        FailureCode::IncorrectOrUnknownPaymentDetails,
                    )
                    .await
            }
        };

        // The onion commits to the final amount and expiry; both must agree
        // with the add and with the invoice
        if packet.payload.amt_to_forward != packet.add.amount_msat {
            return self
                .fail_back(
                    packet.incoming,
                    packet.shared_secret,
                    FailureCode::FinalIncorrectHtlcAmount,
                )
                .await;
        }
        if packet.payload.outgoing_cltv_value > packet.add.cltv_expiry {
            return self
                .fail_back(
                    packet.incoming,
                    packet.shared_secret,
                    FailureCode::FinalIncorrectCltvExpiry,
                )
                .await;
        }
        if let Some(amount_msat) = terms.amount_msat {
            if packet.add.amount_msat < amount_msat {
                return self
                    .fail_back(
                        packet.incoming,
                        packet.shared_secret,
                        FailureCode::IncorrectOrUnknownPaymentDetails,
                    )
                    .await;
            }
        }
        if packet.add.cltv_expiry
            < self.best_height + terms.min_final_cltv_delta
        {
            return self
                .fail_back(
                    packet.incoming,
                    packet.shared_secret,
                    FailureCode::FinalIncorrectCltvExpiry,
                )
                .await;
        }

        let preimage = match self.payments.preimage(payment_hash) {
            Some(preimage) => preimage,
            None => {
                return self
                    .fail_back(
                        packet.incoming,
                        packet.shared_secret,
                        FailureCode::IncorrectOrUnknownPaymentDetails,
                    )
                    .await
            }
        };

        if let Some(link) = self.links.get(&packet.incoming.channel_id) {
            let _ = link
                .handle
                .sender
                .send(LinkCommand::SettleHtlc {
                    htlc_id: packet.incoming.htlc_id,
                    preimage,
                })
                .await;
        }
    }

    async fn handle_resolution(
        &mut self,
        outgoing: CircuitKey,
        event: ResolutionEvent,
    ) {
        let circuit = match self.circuits.by_outgoing(outgoing) {
            Some(circuit) => circuit,
            None => {
                // A resolution for a locally dispatched payment or an
                // already-closed circuit
                trace!("no circuit for resolved HTLC {}", outgoing);
                return;
            }
        };

        match event {
            ResolutionEvent::Settle(preimage) => {
                if let Some(link) =
                    self.links.get(&circuit.incoming.channel_id)
                {
                    let _ = link
                        .handle
                        .sender
                        .send(LinkCommand::SettleHtlc {
                            htlc_id: circuit.incoming.htlc_id,
                            preimage,
                        })
                        .await;
                }
            }
            ResolutionEvent::Fail(reason) => {
                let wrapped = self
                    .onion
                    .relay_failure(circuit.shared_secret, reason);
                if let Some(link) =
                    self.links.get(&circuit.incoming.channel_id)
                {
                    let _ = link
                        .handle
                        .sender
                        .send(LinkCommand::FailHtlc {
                            htlc_id: circuit.incoming.htlc_id,
                            reason: wrapped,
                        })
                        .await;
                }
            }
            ResolutionEvent::AddFailed(code) => {
                self.fail_back(
                    circuit.incoming,
                    circuit.shared_secret,
                    code,
                )
                .await;
            }
        }

        if let Err(err) = self.circuits.close(outgoing) {
            error!("failed to close circuit {}: {}", outgoing, err);
        }
    }

    async fn handle_dispatch(&mut self, dispatch: DispatchPayment) {
        // Cancellation at the switch boundary: a dropped receiver means
        // the payment logic gave up
        if dispatch.response.is_closed() {
            debug!("payment dispatch canceled before routing");
            return;
        }
        let (channel_id, sender) =
            match self.select_outgoing(dispatch.short_channel_id) {
                Some((link, _)) => {
                    (link.handle.channel_id, link.handle.sender.clone())
                }
                None => {
                    let _ = dispatch
                        .response
                        .send(Err(FailureCode::UnknownNextPeer));
                    return;
                }
            };
        let command = LinkCommand::SendHtlc {
            incoming: None,
            amount_msat: dispatch.amount_msat,
            payment_hash: dispatch.payment_hash,
            cltv_expiry: dispatch.cltv_expiry,
            onion: dispatch.onion,
            incoming_amount_msat: 0,
            incoming_expiry: 0,
            shared_secret: Slice32::default(),
            outgoing_channel: channel_id,
        };
        if sender.try_send(command).is_err() {
            let _ = dispatch
                .response
                .send(Err(FailureCode::TemporaryChannelFailure));
        } else {
            let _ = dispatch.response.send(Ok(()));
        }
    }
}

/// Errors produced by the switch machinery
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SwitchError {
    /// persistence failure in the circuit map: {0}
    #[from]
    Store(StoreError),

    /// the switch mailbox is gone; the node is shutting down
    Disconnected,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forwarding_fee_rule() {
        // Scenario from the routing design: base=1000, rate=100 ppm,
        // cltv-delta=40; forwarding 10 000 units requires 11 001 incoming
        let policy = ForwardingPolicy {
            base_fee_msat: 1000,
            fee_rate_millionths: 100,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1,
            htlc_maximum_msat: u64::MAX,
        };
        assert_eq!(policy.fee_msat(10_000), 1001);

        assert_eq!(
            policy.check_forward(11_001, 10_000, 500_080, 500_040),
            Ok(())
        );
        assert_eq!(
            policy.check_forward(11_000, 10_000, 500_080, 500_040),
            Err(FailureCode::FeeInsufficient)
        );
        assert_eq!(
            policy.check_forward(11_001, 10_000, 500_079, 500_040),
            Err(FailureCode::IncorrectCltvExpiry)
        );
    }

    #[test]
    fn amount_bounds() {
        let policy = ForwardingPolicy {
            base_fee_msat: 0,
            fee_rate_millionths: 0,
            cltv_expiry_delta: 0,
            htlc_minimum_msat: 1000,
            htlc_maximum_msat: 100_000,
        };
        assert_eq!(
            policy.check_forward(999, 999, 100, 100),
            Err(FailureCode::AmountBelowMinimum)
        );
        assert_eq!(
            policy.check_forward(200_000, 200_000, 100, 100),
            Err(FailureCode::TemporaryChannelFailure)
        );
        assert_eq!(policy.check_forward(50_000, 50_000, 100, 100), Ok(()));
    }

    #[test]
    fn unified_policy_is_strictest() {
        let cheap = ForwardingPolicy {
            base_fee_msat: 100,
            fee_rate_millionths: 10,
            cltv_expiry_delta: 14,
            htlc_minimum_msat: 1,
            htlc_maximum_msat: 1_000_000,
        };
        let pricey = ForwardingPolicy {
            base_fee_msat: 2000,
            fee_rate_millionths: 500,
            cltv_expiry_delta: 80,
            htlc_minimum_msat: 1000,
            htlc_maximum_msat: 500_000,
        };
        let unified = cheap.strictest(pricey);
        assert_eq!(unified.base_fee_msat, 2000);
        assert_eq!(unified.fee_rate_millionths, 500);
        assert_eq!(unified.cltv_expiry_delta, 80);
        assert_eq!(unified.htlc_minimum_msat, 1000);
        assert_eq!(unified.htlc_maximum_msat, 500_000);
    }
}
