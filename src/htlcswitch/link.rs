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

//! Channel link: the single-task I/O loop owning one channel state machine.
//!
//! The link receives deserialized peer messages and switch packets through
//! its mailbox, drives the channel sign/revoke cycle with batching, and
//! persists every state transition before the covering network message
//! leaves the process. On reconnection it performs the idempotent
//! `channel_reestablish` retransmission dance. The arbitrator takes the
//! channel over by sending [`LinkCommand::Takeover`], which drains and
//! stops the loop.

use std::sync::Arc;

use amplify::{Slice32, Wrapper};
use bitcoin::hashes::{sha256, Hash};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use internet2::addr::NodeId;
use lightning_encoding::LightningEncode;
use lnwire::{
    ChannelId, FailureCode, Messages, OnionPacket, Pong, UpdateAddHtlc,
};
use tokio::sync::{mpsc, oneshot};

use super::{
    Circuit, CircuitKey, CircuitMap, ForwardPacket, OnionProcessor,
    ResolutionEvent, SwitchCommand, SwitchHandle,
};
use crate::channel::bolt::{
    BoltExt, ChainSide, Error as ChannelError, Originator, ReestablishAction,
    RevokedCommitment, UpdateDetails,
};
use crate::channel::{Channel, Extension};
use crate::config::LinkConfig;
use crate::persist::{encoded, Bucket, Store, StoreExt, StoreOp};
use crate::wallet::ChannelSigner;
use crate::ErrorKind;

/// Commands processed by a link task
pub enum LinkCommand {
    /// A deserialized message from the remote peer
    PeerMessage(Messages),

    /// Add an HTLC towards the peer: either a forward accepted by the
    /// switch (with `incoming` set) or a locally dispatched payment
    SendHtlc {
        incoming: Option<CircuitKey>,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion: OnionPacket,
        incoming_amount_msat: u64,
        incoming_expiry: u32,
        shared_secret: Slice32,
        outgoing_channel: ChannelId,
    },

    /// Settle a remote-offered HTLC (switch decision or exit-hop
    /// acceptance)
    SettleHtlc {
        htlc_id: u64,
        preimage: HashPreimage,
    },

    /// Fail a remote-offered HTLC with an encrypted reason
    FailHtlc { htlc_id: u64, reason: Vec<u8> },

    /// New chain tip
    BestHeight(u32),

    /// The peer reconnected: send `channel_reestablish`
    PeerReconnected,

    /// The arbitrator takes the channel over; the link drains its queue
    /// and hands the state machine out
    Takeover(oneshot::Sender<Box<Channel<BoltExt>>>),
}

/// Events emitted by a link towards the node orchestration layer
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// The channel reached the active state
    Active { channel_id: ChannelId },

    /// The channel must be force-closed; the arbitrator should take over
    ForceClose {
        channel_id: ChannelId,
        reason: String,
    },

    /// An HTLC expiry is within the safety window; preempts normal flow
    ExpiryThreat {
        channel_id: ChannelId,
        cltv_expiry: u32,
    },

    /// The remote requested a cooperative shutdown
    ShutdownRequested { channel_id: ChannelId },

    /// The remote proves we lost state; the channel must NOT be
    /// force-closed from here
    LocalDataLoss { channel_id: ChannelId },
}

/// Address of a link registered within the switch
#[derive(Clone)]
pub struct LinkHandle {
    pub channel_id: ChannelId,
    pub short_channel_id: Option<u64>,
    pub peer: NodeId,
    pub sender: mpsc::Sender<LinkCommand>,
}

/// Per-height forwarding package: the forwardable adds of one remote
/// revocation, persisted before processing and replayed idempotently after
/// a crash.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct FwdPackage {
    pub channel_id: ChannelId,
    pub height: u64,
    pub adds: Vec<UpdateAddHtlc>,
}

impl FwdPackage {
    fn storage_key(channel_id: ChannelId, height: u64) -> Vec<u8> {
        let mut key = channel_id.as_slice32().to_inner().to_vec();
        key.extend(height.to_be_bytes());
        key
    }
}

/// The channel link task
pub struct Link {
    cfg: LinkConfig,
    channel: Channel<BoltExt>,
    channel_id: ChannelId,
    short_channel_id: Option<u64>,
    peer: NodeId,
    signer: Arc<dyn ChannelSigner>,
    store: Arc<dyn Store>,
    circuits: Arc<CircuitMap>,
    onion: Arc<dyn OnionProcessor>,
    mailbox: mpsc::Receiver<LinkCommand>,
    sender: mpsc::Sender<LinkCommand>,
    peer_out: mpsc::Sender<Messages>,
    switch: SwitchHandle,
    events: mpsc::Sender<LinkEvent>,
    pending_updates: usize,
    failed: bool,
}

impl Link {
    /// Builds a link around an open (or restored) channel.
    #[allow(clippy::too_many_arguments)]
    pub fn with(
        cfg: LinkConfig,
        channel: Channel<BoltExt>,
        short_channel_id: Option<u64>,
        peer: NodeId,
        signer: Arc<dyn ChannelSigner>,
        store: Arc<dyn Store>,
        circuits: Arc<CircuitMap>,
        onion: Arc<dyn OnionProcessor>,
        peer_out: mpsc::Sender<Messages>,
        switch: SwitchHandle,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Link, ChannelError> {
        let channel_id = channel.try_channel_id()?;
        let (sender, mailbox) = mpsc::channel(64);
        Ok(Link {
            cfg,
            channel,
            channel_id,
            short_channel_id,
            peer,
            signer,
            store,
            circuits,
            onion,
            mailbox,
            sender,
            peer_out,
            switch,
            events,
            pending_updates: 0,
            failed: false,
        })
    }

    /// Handle for registering the link within the switch
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            channel_id: self.channel_id,
            short_channel_id: self.short_channel_id,
            peer: self.peer,
            sender: self.sender.clone(),
        }
    }

    /// Runs the link loop until takeover or node shutdown.
    pub async fn run(mut self) {
        debug!("link for channel {} started", self.channel_id);

        // Crash recovery: re-offer unprocessed forwarding packages; the
        // circuit map suppresses the ones already forwarded.
        self.replay_fwd_packages().await;

        loop {
            let idle = tokio::time::sleep(if self.pending_updates > 0 {
                self.cfg.batch_idle
            } else {
                // No batch to seal: only the keepalive matters
                self.cfg.ping_interval
            });
            tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(LinkCommand::Takeover(reply)) => {
                        // Drain whatever is already enqueued so the
                        // arbitrator sees the final state
                        while let Ok(next) = self.mailbox.try_recv() {
                            if let LinkCommand::PeerMessage(message) = next {
                                self.handle_peer_message(message).await;
                            }
                        }
                        debug!(
                            "link for channel {} handing over to arbitrator",
                            self.channel_id
                        );
                        let _ = reply.send(Box::new(self.channel));
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = idle => {
                    if self.pending_updates > 0 {
                        self.try_commit().await;
                    } else if !self.failed {
                        let _ = self
                            .peer_out
                            .send(Messages::Ping(lnwire::Ping {
                                pong_size: 0,
                                ignored: vec![],
                            }))
                            .await;
                    }
                }
            }
        }
        debug!("link for channel {} stopped", self.channel_id);
    }

    async fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::PeerMessage(message) => {
                self.handle_peer_message(message).await
            }
            LinkCommand::SendHtlc {
                incoming,
                amount_msat,
                payment_hash,
                cltv_expiry,
                onion,
                incoming_amount_msat,
                incoming_expiry,
                shared_secret,
                outgoing_channel: _,
            } => {
                self.handle_send_htlc(
                    incoming,
                    amount_msat,
                    payment_hash,
                    cltv_expiry,
                    onion,
                    incoming_amount_msat,
                    incoming_expiry,
                    shared_secret,
                )
                .await
            }
            LinkCommand::SettleHtlc { htlc_id, preimage } => {
                self.handle_settle(htlc_id, preimage).await
            }
            LinkCommand::FailHtlc { htlc_id, reason } => {
                self.handle_fail(htlc_id, reason).await
            }
            LinkCommand::BestHeight(height) => {
                self.channel.set_best_height(height);
                self.check_expiry_threats(height).await;
            }
            LinkCommand::PeerReconnected => self.handle_reconnect().await,
            LinkCommand::Takeover(_) => {
                unreachable!("takeover is intercepted in the run loop")
            }
        }
    }

    async fn handle_peer_message(&mut self, message: Messages) {
        if self.failed
            && !matches!(
                message,
                Messages::Error(_) | Messages::ChannelReestablish(_)
            )
        {
            // The machine refuses further updates after a fatal error
            return;
        }
        match message {
            Messages::UpdateAddHtlc(add) => {
                if let Err(err) = self.channel.receive_htlc(&add) {
                    self.channel_error(err).await;
                }
            }
            Messages::UpdateFulfillHtlc(fulfill) => {
                match self.channel.receive_settle(&fulfill) {
                    Ok((htlc_id, preimage)) => {
                        let outgoing =
                            CircuitKey::with(self.channel_id, htlc_id);
                        let _ = self
                            .switch
                            .send(SwitchCommand::Resolve {
                                outgoing,
                                event: ResolutionEvent::Settle(preimage),
                            })
                            .await;
                    }
                    Err(err) => self.channel_error(err).await,
                }
            }
            Messages::UpdateFailHtlc(fail) => {
                match self.channel.receive_fail(&fail) {
                    Ok(htlc_id) => {
                        let outgoing =
                            CircuitKey::with(self.channel_id, htlc_id);
                        let _ = self
                            .switch
                            .send(SwitchCommand::Resolve {
                                outgoing,
                                event: ResolutionEvent::Fail(fail.reason),
                            })
                            .await;
                    }
                    Err(err) => self.channel_error(err).await,
                }
            }
            Messages::UpdateFailMalformedHtlc(fail) => {
                match self.channel.receive_fail_malformed(&fail) {
                    Ok(htlc_id) => {
                        let code =
                            FailureCode::try_from(fail.failure_code)
                                .unwrap_or(
                                    FailureCode::TemporaryChannelFailure,
                                );
                        let outgoing =
                            CircuitKey::with(self.channel_id, htlc_id);
                        let _ = self
                            .switch
                            .send(SwitchCommand::Resolve {
                                outgoing,
                                event: ResolutionEvent::AddFailed(code),
                            })
                            .await;
                    }
                    Err(err) => self.channel_error(err).await,
                }
            }
            Messages::UpdateFee(update_fee) => {
                if let Err(err) = self.channel.receive_update_fee(&update_fee)
                {
                    self.channel_error(err).await;
                }
            }
            Messages::CommitmentSigned(commitment_signed) => {
                self.handle_commitment_signed(commitment_signed).await
            }
            Messages::RevokeAndAck(revoke) => {
                self.handle_revocation(revoke).await
            }
            Messages::ChannelReestablish(reestablish) => {
                self.handle_remote_reestablish(reestablish).await
            }
            Messages::FundingLocked(funding_locked) => {
                if let Err(err) = self
                    .channel
                    .update_from_peer(&Messages::FundingLocked(
                        funding_locked,
                    ))
                {
                    self.channel_error(err).await;
                } else {
                    let _ = self
                        .events
                        .send(LinkEvent::Active {
                            channel_id: self.channel_id,
                        })
                        .await;
                }
            }
            Messages::Shutdown(_) => {
                let _ = self
                    .events
                    .send(LinkEvent::ShutdownRequested {
                        channel_id: self.channel_id,
                    })
                    .await;
            }
            Messages::Ping(ping) => {
                let _ = self
                    .peer_out
                    .send(Messages::Pong(Pong::with(ping.pong_size)))
                    .await;
            }
            Messages::Pong(_) => {}
            Messages::Error(error) => {
                warn!(
                    "peer error on channel {}: {}",
                    self.channel_id, error
                );
                self.force_close(format!("peer error: {}", error)).await;
            }
            other => {
                trace!(
                    "link for {} ignoring message {}",
                    self.channel_id,
                    other
                );
            }
        }
    }

    async fn handle_commitment_signed(
        &mut self,
        message: lnwire::CommitmentSigned,
    ) {
        if let Err(err) = self.channel.receive_new_commitment(&message) {
            return self.channel_error(err).await;
        }
        // Persistence point: the new local commitment with its signatures
        // must be durable before the revocation leaves the process
        if !self.persist_channel().await {
            return;
        }
        match self.channel.revoke_current_commitment() {
            Ok(revocation) => {
                if !self.persist_channel().await {
                    return;
                }
                let _ = self
                    .peer_out
                    .send(Messages::RevokeAndAck(revocation))
                    .await;
                // The peer closed its half of the cycle; if we owe updates
                // the batch gets sealed right away
                self.try_commit().await;
            }
            Err(err) => self.channel_error(err).await,
        }
    }

    async fn handle_revocation(&mut self, message: lnwire::RevokeAndAck) {
        let (forwardable, revoked) =
            match self.channel.receive_revocation(&message) {
                Ok(result) => result,
                Err(err) => return self.channel_error(err).await,
            };

        // Single transaction: channel state, retribution record and the
        // forwarding package of this revocation
        let height = revoked.height;
        let package = FwdPackage {
            channel_id: self.channel_id,
            height,
            adds: forwardable
                .iter()
                .map(|forward| forward.add.clone())
                .collect(),
        };
        let ops = match self.revocation_ops(&revoked, &package) {
            Ok(ops) => ops,
            Err(err) => {
                return self.force_close(format!("store failure: {}", err)).await
            }
        };
        if let Err(err) = self.store.commit(ops) {
            return self.force_close(format!("store failure: {}", err)).await;
        }

        self.process_fwd_package(package).await;

        // Sign back any updates the revocation unblocked
        self.try_commit().await;
    }

    fn revocation_ops(
        &self,
        revoked: &RevokedCommitment,
        package: &FwdPackage,
    ) -> Result<Vec<StoreOp>, crate::persist::StoreError> {
        let mut retribution_key =
            self.channel_id.as_slice32().to_inner().to_vec();
        retribution_key.extend(revoked.height.to_be_bytes());
        Ok(vec![
            StoreOp::Put(
                Bucket::Channel,
                self.channel_id.as_slice32().to_inner().to_vec(),
                encoded(&self.channel)?,
            ),
            StoreOp::Put(
                Bucket::Retribution,
                retribution_key,
                encoded(revoked)?,
            ),
            StoreOp::Put(
                Bucket::FwdPkg,
                FwdPackage::storage_key(self.channel_id, package.height),
                encoded(package)?,
            ),
        ])
    }

    async fn process_fwd_package(&mut self, package: FwdPackage) {
        for add in &package.adds {
            self.route_forwardable(add.clone()).await;
        }
        if let Err(err) = self.store.delete_key(
            Bucket::FwdPkg,
            &FwdPackage::storage_key(self.channel_id, package.height),
        ) {
            warn!(
                "can't prune forwarding package {}/{}: {}",
                self.channel_id, package.height, err
            );
        }
    }

    async fn replay_fwd_packages(&mut self) {
        let packages = match self.store.list(Bucket::FwdPkg) {
            Ok(list) => list,
            Err(err) => {
                warn!("can't list forwarding packages: {}", err);
                return;
            }
        };
        for (_, raw) in packages {
            let package =
                match <FwdPackage as strict_encoding::StrictDecode>::strict_deserialize(raw) {
                    Ok(package) => package,
                    Err(err) => {
                        error!("corrupted forwarding package: {}", err);
                        continue;
                    }
                };
            if package.channel_id != self.channel_id {
                continue;
            }
            info!(
                "replaying forwarding package {}/{} after restart",
                package.channel_id, package.height
            );
            self.process_fwd_package(package).await;
        }
    }

    async fn route_forwardable(&mut self, add: UpdateAddHtlc) {
        let incoming = CircuitKey::with(self.channel_id, add.htlc_id);
        let decoded = match self.onion.decode_hop(&add) {
            Ok(decoded) => decoded,
            Err(code) => {
                // Unparsable onion: the offerer learns through
                // `update_fail_malformed_htlc` carrying the onion hash
                let onion_hash = sha256::Hash::hash(
                    &add.onion_routing_packet
                        .lightning_serialize()
                        .unwrap_or_default(),
                );
                match self.channel.fail_htlc_malformed(
                    add.htlc_id,
                    onion_hash,
                    code.into_u16(),
                ) {
                    Ok(message) => {
                        if !self.persist_channel().await {
                            return;
                        }
                        self.pending_updates += 1;
                        let _ = self
                            .peer_out
                            .send(Messages::UpdateFailMalformedHtlc(message))
                            .await;
                        self.maybe_commit().await;
                    }
                    Err(err) => self.channel_error(err).await,
                }
                return;
            }
        };
        let packet = ForwardPacket {
            incoming,
            incoming_peer: self.peer,
            add,
            payload: decoded.payload,
            next_packet: decoded.next_packet,
            shared_secret: decoded.shared_secret,
        };
        let _ = self.switch.send(SwitchCommand::Forward(packet)).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_send_htlc(
        &mut self,
        incoming: Option<CircuitKey>,
        amount_msat: u64,
        payment_hash: HashLock,
        cltv_expiry: u32,
        onion: OnionPacket,
        incoming_amount_msat: u64,
        incoming_expiry: u32,
        shared_secret: Slice32,
    ) {
        let add = match self.channel.compose_add_htlc(
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion,
        ) {
            Ok(add) => add,
            Err(err) => {
                debug!(
                    "channel {} can't take another HTLC: {}",
                    self.channel_id, err
                );
                if let Some(incoming) = incoming {
                    let _ = self
                        .switch
                        .send(SwitchCommand::AddRejected {
                            incoming,
                            shared_secret,
                            code: FailureCode::TemporaryChannelFailure,
                        })
                        .await;
                }
                if err.is_fatal() {
                    self.channel_error(err).await;
                }
                return;
            }
        };

        // The circuit must hit the disk before the add hits the wire
        if let Some(incoming) = incoming {
            let circuit = Circuit {
                incoming,
                outgoing: CircuitKey::with(self.channel_id, add.htlc_id),
                shared_secret,
                incoming_amount_msat,
                outgoing_amount_msat: amount_msat,
                incoming_expiry,
                outgoing_expiry: cltv_expiry,
            };
            if let Err(err) = self.circuits.open(circuit) {
                error!("can't persist circuit: {}", err);
                let _ = self
                    .switch
                    .send(SwitchCommand::AddRejected {
                        incoming,
                        shared_secret,
                        code: FailureCode::TemporaryChannelFailure,
                    })
                    .await;
                return;
            }
        }
        if !self.persist_channel().await {
            return;
        }
        self.pending_updates += 1;
        let _ = self.peer_out.send(Messages::UpdateAddHtlc(add)).await;
        self.maybe_commit().await;
    }

    async fn handle_settle(&mut self, htlc_id: u64, preimage: HashPreimage) {
        match self.channel.settle_htlc(htlc_id, preimage) {
            Ok(message) => {
                if !self.persist_channel().await {
                    return;
                }
                self.pending_updates += 1;
                let _ = self
                    .peer_out
                    .send(Messages::UpdateFulfillHtlc(message))
                    .await;
                self.maybe_commit().await;
            }
            Err(err) => self.channel_error(err).await,
        }
    }

    async fn handle_fail(&mut self, htlc_id: u64, reason: Vec<u8>) {
        match self.channel.fail_htlc(htlc_id, reason) {
            Ok(message) => {
                if !self.persist_channel().await {
                    return;
                }
                self.pending_updates += 1;
                let _ = self
                    .peer_out
                    .send(Messages::UpdateFailHtlc(message))
                    .await;
                self.maybe_commit().await;
            }
            Err(err) => self.channel_error(err).await,
        }
    }

    async fn maybe_commit(&mut self) {
        if self.pending_updates >= self.cfg.batch_limit {
            self.try_commit().await;
        }
    }

    /// Seals the current batch with a `commitment_signed` when the channel
    /// has uncommitted updates and the previous commitment was revoked.
    async fn try_commit(&mut self) {
        if self.failed {
            return;
        }
        match self.channel.sign_next_commitment(self.signer.as_ref()) {
            Ok(message) => {
                // Persistence point: our signature must be durable before
                // the wire sees it, so a crash retransmits byte-identically
                if !self.persist_channel().await {
                    return;
                }
                self.pending_updates = 0;
                let _ = self
                    .peer_out
                    .send(Messages::CommitmentSigned(message))
                    .await;
            }
            Err(ChannelError::NoUpdates)
            | Err(ChannelError::UnackedCommitment) => {
                // Nothing to sign yet, or the previous cycle is still open
            }
            Err(err) => self.channel_error(err).await,
        }
    }

    async fn handle_reconnect(&mut self) {
        match self.channel.compose_reestablish_channel() {
            Ok(message) => {
                let _ = self
                    .peer_out
                    .send(Messages::ChannelReestablish(message))
                    .await;
            }
            Err(err) => {
                warn!(
                    "channel {} can't compose reestablish: {}",
                    self.channel_id, err
                );
            }
        }
    }

    async fn handle_remote_reestablish(
        &mut self,
        message: lnwire::ChannelReestablish,
    ) {
        use crate::channel::bolt::ReestablishError;

        match self.channel.verify_reestablish(&message) {
            Ok(ReestablishAction::Synchronized) => {
                debug!("channel {} synchronized on reconnect", self.channel_id);
            }
            Ok(ReestablishAction::Retransmit {
                revocation,
                commitment,
            }) => {
                // BOLT-2 ordering: the lost revocation goes strictly before
                // the lost commitment signature
                if revocation {
                    match self.channel.retransmit_revocation() {
                        Ok(msg) => {
                            let _ = self
                                .peer_out
                                .send(Messages::RevokeAndAck(msg))
                                .await;
                        }
                        Err(err) => return self.channel_error(err).await,
                    }
                }
                if commitment {
                    match self.channel.retransmit_commitment() {
                        Ok(msg) => {
                            let _ = self
                                .peer_out
                                .send(Messages::CommitmentSigned(msg))
                                .await;
                        }
                        Err(err) => return self.channel_error(err).await,
                    }
                }
            }
            Err(ChannelError::ChannelReestablish(
                ReestablishError::RevocationNumberMismatch { claimed, sent },
            )) if claimed > sent => {
                // The peer knows revocations we never sent: we lost state.
                // Broadcasting our stale commitment would hand them a
                // penalty; stand down and wait for recovery.
                error!(
                    "channel {}: remote proves local data loss \
                     (claimed {} revocations, we sent {})",
                    self.channel_id, claimed, sent
                );
                self.failed = true;
                let _ = self
                    .events
                    .send(LinkEvent::LocalDataLoss {
                        channel_id: self.channel_id,
                    })
                    .await;
            }
            Err(err) => {
                self.force_close(format!(
                    "unrecoverable reestablish divergence: {}",
                    err
                ))
                .await;
            }
        }
    }

    /// Scans committed HTLCs for expiries within the safety window and
    /// raises the preemptive force-close trigger.
    async fn check_expiry_threats(&mut self, height: u32) {
        let deadline = height + self.cfg.expiry_safety_delta;
        let mut threat = None;
        for entry in self.channel.constructor().log().entries() {
            if let UpdateDetails::Add(add) = &entry.details {
                let committed = entry.height_on(ChainSide::Local).is_some()
                    || entry.height_on(ChainSide::Remote).is_some();
                let resolved = self
                    .channel
                    .constructor()
                    .log()
                    .removal_entry(entry.originator, add.htlc_id)
                    .is_some();
                // Outgoing HTLCs matter: when their timeout nears we must
                // claim on-chain before the downstream peer can
                if committed
                    && !resolved
                    && entry.originator == Originator::Local
                    && add.cltv_expiry <= deadline
                {
                    threat = Some(add.cltv_expiry);
                    break;
                }
            }
        }
        if let Some(cltv_expiry) = threat {
            warn!(
                "channel {}: HTLC expiry {} within safety window at height {}",
                self.channel_id, cltv_expiry, height
            );
            let _ = self
                .events
                .send(LinkEvent::ExpiryThreat {
                    channel_id: self.channel_id,
                    cltv_expiry,
                })
                .await;
        }
    }

    async fn persist_channel(&mut self) -> bool {
        let result = self.store.put_value(
            Bucket::Channel,
            &self.channel_id.as_slice32().to_inner(),
            &self.channel,
        );
        if let Err(err) = result {
            self.force_close(format!("persistence failure: {}", err)).await;
            return false;
        }
        true
    }

    async fn channel_error(&mut self, err: ChannelError) {
        match err.kind() {
            ErrorKind::PolicyRejection | ErrorKind::NotFound => {
                debug!("channel {} rejected update: {}", self.channel_id, err);
            }
            _ if err.is_fatal() => {
                self.force_close(err.to_string()).await;
            }
            _ => {
                warn!("channel {} transient error: {}", self.channel_id, err);
            }
        }
    }

    /// Fatal path: notify the peer, stop accepting updates and signal the
    /// arbitrator to take over and publish the latest local commitment.
    async fn force_close(&mut self, reason: String) {
        if self.failed {
            return;
        }
        self.failed = true;
        error!(
            "channel {} failing with force-close intent: {}",
            self.channel_id, reason
        );
        let _ = self
            .peer_out
            .send(Messages::Error(lnwire::Error::with(
                self.channel_id,
                &reason,
            )))
            .await;
        let _ = self
            .events
            .send(LinkEvent::ForceClose {
                channel_id: self.channel_id,
                reason,
            })
            .await;
    }
}

#[cfg(test)]
mod test {
    use amplify::DumbDefault;

    use super::*;
    use crate::persist::MemoryStore;

    #[test]
    fn fwd_package_roundtrip() {
        let store = MemoryStore::new();
        let mut add = UpdateAddHtlc::dumb_default();
        add.htlc_id = 3;
        add.amount_msat = 10_000_000;
        let package = FwdPackage {
            channel_id: ChannelId::dumb_default(),
            height: 7,
            adds: vec![add],
        };
        let key = FwdPackage::storage_key(package.channel_id, package.height);
        store.put_value(Bucket::FwdPkg, &key, &package).unwrap();
        let restored: FwdPackage = store
            .get_value(Bucket::FwdPkg, &key)
            .unwrap()
            .expect("package must persist");
        assert_eq!(restored, package);
    }

    #[test]
    fn fwd_package_key_is_height_scoped() {
        let channel_id = ChannelId::dumb_default();
        assert_ne!(
            FwdPackage::storage_key(channel_id, 1),
            FwdPackage::storage_key(channel_id, 2)
        );
    }
}
