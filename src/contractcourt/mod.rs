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

//! Channel arbitrator: reconciles a channel's on-chain reality with its
//! off-chain expected state.
//!
//! The arbitrator takes over a channel from its link (on force-close
//! intent, remote unilateral close, breach detection, or a looming HTLC
//! expiry), classifies the funding spend, instantiates one resolver per
//! contested output and drives them to terminal outcomes, checkpointing
//! all the way. The channel is fully resolved when the resolver set is
//! empty and a durable report has been written.

pub mod breach;
mod resolvers;

use std::sync::Arc;

use amplify::Wrapper;
pub use breach::{BreachArbiter, BreachKeys, RetributionRecord};
use bitcoin::{EcdsaSighashType, Script, Transaction, Txid, Witness};
use lnwire::ChannelId;
pub use resolvers::{
    extract_preimage, CommitSweepResolver, ContractResolver,
    IncomingHtlcResolver, OutgoingHtlcResolver, ResolverAction, SweepClaim,
};
use strict_encoding::StrictDecode;
use tokio::sync::mpsc;

use crate::chain::{ChainWatcher, SpendEvent};
use crate::channel::bolt::htlc::ScriptGenerators as HtlcScripts;
use crate::channel::bolt::{
    derive_pubkey, derive_revocation_pubkey, BoltExt, Commitment,
    HtlcDirection, RevokedCommitment, ScriptGenerators as CommitScripts,
    TxType,
};
use crate::channel::{Channel, RenderedGraph};
use crate::htlcswitch::{ResolutionEvent, SwitchCommand, SwitchHandle};
use crate::persist::{Bucket, Store, StoreExt};
use crate::sweep::{SweeperHandle, WitnessElement};
use crate::wallet::{
    ChannelSigner, KeyFamily, KeyLocator, SignDescriptor, SignError,
};

/// States of the arbitration state machine
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    StrictEncode,
    StrictDecode,
)]
pub enum ArbitratorState {
    /// The channel operates normally; the arbitrator only watches
    #[display("default")]
    Default,

    /// A locally initiated force-close broadcast the latest commitment
    #[display("commitment-broadcasted")]
    CommitmentBroadcasted,

    /// A commitment confirmed on-chain; resolvers are being dispatched
    #[display("contract-closed")]
    ContractClosed,

    /// Resolvers are working towards terminal outcomes
    #[display("waiting-full-resolution")]
    StateWaitingFullResolution,

    /// Every contested output reached a terminal outcome
    #[display("fully-resolved")]
    StateFullyResolved,
}

/// Classification of a funding-output spend
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
pub enum CloseKind {
    /// Our own latest commitment (local force-close)
    #[display("local-force-close")]
    LocalForce,

    /// The remote's current (non-revoked) commitment
    #[display("remote-unilateral")]
    RemoteUnilateral,

    /// A revoked remote commitment: breach
    #[display("breach({0})")]
    Breach(u64),

    /// A transaction not matching any known commitment: cooperative close
    /// or evidence of local data loss
    #[display("unknown-spend")]
    Unknown,
}

/// Commands accepted by an arbitrator task
pub enum ArbitratorCommand {
    /// Force-close requested locally (operator, link failure, expiry
    /// preemption)
    ForceClose { reason: String },

    /// The funding output was spent
    FundingSpent(SpendEvent),

    /// One of the contested outputs was spent
    OutputSpent(SpendEvent),

    /// New chain tip
    BlockEpoch(u32),

    /// A preimage became known for an incoming HTLC under resolution
    PreimageLearned(bitcoin_scripts::hlc::HashPreimage),

    /// Stop the arbitrator
    Shutdown,
}

/// Durable resolution report written at full resolution
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct ResolutionReport {
    pub channel_id: ChannelId,
    /// Commitment txid the channel closed with
    pub close_txid: Txid,
    /// Number of resolvers dispatched
    pub resolver_count: u32,
    /// Aggregate value of the contested outputs, sats
    pub contested_value: u64,
}

/// Arbitration errors
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum ArbitratorError {
    /// the local commitment lacks the counterparty signature and can't be
    /// broadcast
    MissingCounterpartySignature,

    /// signing failed during arbitration: {0}
    #[from]
    Sign(SignError),

    /// channel error during arbitration: {0}
    #[from]
    Channel(crate::channel::bolt::Error),

    /// persistence failure during arbitration: {0}
    #[from]
    Store(crate::persist::StoreError),

    /// chain failure during arbitration: {0}
    #[from]
    Chain(crate::chain::ChainError),
}

/// The per-channel arbitrator task
pub struct ChannelArbitrator {
    channel_id: ChannelId,
    channel: Box<Channel<BoltExt>>,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainWatcher>,
    signer: Arc<dyn ChannelSigner>,
    sweeper: SweeperHandle,
    switch: SwitchHandle,
    commands: mpsc::Receiver<ArbitratorCommand>,
    state: ArbitratorState,
    resolvers: Vec<ContractResolver>,
    best_height: u32,
}

impl ChannelArbitrator {
    /// Creates the arbitrator for a channel taken over from its link
    #[allow(clippy::too_many_arguments)]
    pub fn with(
        channel: Box<Channel<BoltExt>>,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainWatcher>,
        signer: Arc<dyn ChannelSigner>,
        sweeper: SweeperHandle,
        switch: SwitchHandle,
        mailbox_size: usize,
    ) -> Result<(ChannelArbitrator, mpsc::Sender<ArbitratorCommand>), ArbitratorError>
    {
        let channel_id = channel.try_channel_id()?;
        let (tx, rx) = mpsc::channel(mailbox_size);
        Ok((
            ChannelArbitrator {
                channel_id,
                channel,
                store,
                chain,
                signer,
                sweeper,
                switch,
                commands: rx,
                state: ArbitratorState::Default,
                resolvers: vec![],
                best_height: 0,
            },
            tx,
        ))
    }

    /// Current arbitration state
    pub fn state(&self) -> ArbitratorState {
        self.state
    }

    /// Runs the arbitrator until full resolution or shutdown
    pub async fn run(mut self) {
        info!("arbitrator for channel {} started", self.channel_id);
        while let Some(command) = self.commands.recv().await {
            let result = match command {
                ArbitratorCommand::ForceClose { reason } => {
                    warn!(
                        "channel {} force-closing: {}",
                        self.channel_id, reason
                    );
                    self.broadcast_local_commitment().await
                }
                ArbitratorCommand::FundingSpent(event) => {
                    self.handle_funding_spent(event).await
                }
                ArbitratorCommand::OutputSpent(event) => {
                    self.handle_output_spent(event).await
                }
                ArbitratorCommand::BlockEpoch(height) => {
                    self.best_height = height;
                    self.advance_resolvers_on_height(height).await
                }
                ArbitratorCommand::PreimageLearned(preimage) => {
                    for resolver in &mut self.resolvers {
                        if let ContractResolver::IncomingHtlc(inner) =
                            resolver
                        {
                            inner.learn_preimage(preimage);
                        }
                    }
                    self.advance_resolvers_on_height(self.best_height).await
                }
                ArbitratorCommand::Shutdown => break,
            };
            if let Err(err) = result {
                error!(
                    "arbitrator for channel {} failed: {}",
                    self.channel_id, err
                );
            }
            if self.state == ArbitratorState::StateFullyResolved {
                break;
            }
        }
        info!("arbitrator for channel {} stopped", self.channel_id);
    }

    /// Assembles and broadcasts the latest local commitment with the
    /// stored counterparty signature
    async fn broadcast_local_commitment(
        &mut self,
    ) -> Result<(), ArbitratorError> {
        self.channel.stage_tip(false)?;
        let tx = self.signed_local_commitment()?;
        self.chain.publish(tx, "force-close commitment").await?;
        self.state = ArbitratorState::CommitmentBroadcasted;
        self.checkpoint()?;
        Ok(())
    }

    /// Builds the fully signed local commitment transaction
    fn signed_local_commitment(
        &self,
    ) -> Result<Transaction, ArbitratorError> {
        let graph = self.channel.commitment_graph(false)?;
        let remote_signature = self
            .channel
            .constructor()
            .local_chain()
            .tip()
            .signature
            .ok_or(ArbitratorError::MissingCounterpartySignature)?;
        let local_signature =
            self.signer.sign_commitment(&graph.commitment)?;

        let mut tx = graph.commitment.unsigned_tx.clone();
        let witness_script = graph.commitment.inputs[0]
            .witness_script
            .clone()
            .ok_or(ArbitratorError::MissingCounterpartySignature)?;

        // Multisig signature order must follow the pubkey order inside the
        // witness script
        let local_pubkey = self.signer.funding_pubkey();
        let remote_pubkey =
            self.channel.constructor().remote_keys().funding_pubkey;
        let local_first = local_pubkey.serialize() < remote_pubkey.serialize();

        let mut local_sig = local_signature.serialize_der().to_vec();
        local_sig.push(EcdsaSighashType::All as u8);
        let mut remote_sig = remote_signature.serialize_der().to_vec();
        remote_sig.push(EcdsaSighashType::All as u8);

        let witness = if local_first {
            vec![vec![], local_sig, remote_sig, witness_script.to_bytes()]
        } else {
            vec![vec![], remote_sig, local_sig, witness_script.to_bytes()]
        };
        tx.input[0].witness = Witness::from_vec(witness);
        Ok(tx)
    }

    /// Classifies the spend of the funding output
    pub fn classify_spend(&self, spending_tx: &Transaction) -> CloseKind {
        let txid = spending_tx.txid();
        let core = self.channel.constructor();
        if core.local_chain().tip().txid == Some(txid) {
            return CloseKind::LocalForce;
        }
        if core.remote_chain().tip().txid == Some(txid)
            || core
                .remote_chain()
                .prior()
                .and_then(|prior| prior.txid)
                == Some(txid)
        {
            return CloseKind::RemoteUnilateral;
        }
        if let Some(revoked) = self.lookup_retribution(txid) {
            return CloseKind::Breach(revoked.height);
        }
        CloseKind::Unknown
    }

    /// Finds the retribution record matching a revoked commitment txid
    fn lookup_retribution(&self, txid: Txid) -> Option<RevokedCommitment> {
        let prefix = self.channel_id.as_slice32().to_inner();
        let records = self.store.list(Bucket::Retribution).ok()?;
        for (key, raw) in records {
            if !key.starts_with(&prefix) {
                continue;
            }
            if let Ok(revoked) = RevokedCommitment::strict_deserialize(raw) {
                if revoked.txid == Some(txid) {
                    return Some(revoked);
                }
            }
        }
        None
    }

    async fn handle_funding_spent(
        &mut self,
        event: SpendEvent,
    ) -> Result<(), ArbitratorError> {
        let kind = self.classify_spend(&event.spending_tx);
        info!(
            "channel {} funding spent at height {}: {}",
            self.channel_id, event.height, kind
        );
        self.state = ArbitratorState::ContractClosed;
        self.checkpoint()?;

        match kind {
            CloseKind::LocalForce => {
                self.dispatch_resolvers(&event, true).await?
            }
            CloseKind::RemoteUnilateral => {
                self.dispatch_resolvers(&event, false).await?
            }
            CloseKind::Breach(height) => {
                self.handle_breach(&event, height).await?
            }
            CloseKind::Unknown => {
                // Cooperative close pays us directly; nothing contested.
                // (A newer remote state would be data loss: also nothing
                // we can contest.)
                self.finish(event.spending_tx.txid(), 0, 0)?;
                return Ok(());
            }
        }

        if self.resolvers.is_empty() {
            self.finish(event.spending_tx.txid(), 0, 0)?;
        } else {
            self.state = ArbitratorState::StateWaitingFullResolution;
            self.checkpoint()?;
            // Watch every contested output
            for resolver in &self.resolvers {
                let _ = self
                    .chain
                    .register_spend(
                        resolver.outpoint(),
                        resolver.script_pubkey(),
                        event.height,
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Instantiates resolvers for every non-dust output of the confirmed
    /// commitment; exactly one resolver per contested output.
    async fn dispatch_resolvers(
        &mut self,
        event: &SpendEvent,
        is_local: bool,
    ) -> Result<(), ArbitratorError> {
        if is_local {
            self.channel.stage_tip(false)?;
        }
        let core = self.channel.constructor();
        let view: Commitment = if is_local {
            core.local_chain().tip().clone()
        } else {
            core.remote_chain().tip().clone()
        };
        let spending_txid = event.spending_tx.txid();
        let per_commitment_point = view.per_commitment_point;

        let graph: Option<RenderedGraph> = if is_local {
            Some(self.channel.commitment_graph(false)?)
        } else {
            None
        };

        let local_delayed = derive_pubkey(
            core.local_keys().delayed_payment_basepoint.key,
            per_commitment_point,
        );
        let remote_revocation = derive_revocation_pubkey(
            core.remote_keys().revocation_basepoint,
            per_commitment_point,
        );
        let local_revocation_base = core.local_keys().revocation_basepoint.key;
        let local_htlc =
            derive_pubkey(core.local_keys().htlc_basepoint.key, per_commitment_point);
        let remote_htlc =
            derive_pubkey(core.remote_keys().htlc_basepoint, per_commitment_point);
        let own_delay = core.remote_params().to_self_delay;

        let mut resolvers = vec![];

        if is_local {
            // Our to_local output: CSV-delayed commit sweep
            let to_local_script =
                <bitcoin_scripts::WitnessScript as CommitScripts>::ln_to_local(
                    0,
                    remote_revocation,
                    local_delayed,
                    own_delay,
                );
            if let Some((vout, output)) = find_output(
                &event.spending_tx,
                &to_local_script.clone().to_p2wsh().into_inner(),
            ) {
                resolvers.push(ContractResolver::CommitSweep(
                    CommitSweepResolver::with(
                        SweepClaim {
                            outpoint: bitcoin::OutPoint::new(
                                spending_txid,
                                vout,
                            ),
                            amount: output.value,
                            spent_output: output.clone(),
                            descriptor: SignDescriptor {
                                key_loc: KeyLocator {
                                    family: KeyFamily::DelayBase,
                                    index: 0,
                                },
                                single_tweak: Some(per_commitment_point),
                                double_tweak: None,
                                witness_script: to_local_script.to_inner(),
                                amount: output.value,
                                input_index: 0,
                                sighash_type: EcdsaSighashType::All,
                            },
                            witness_template: vec![
                                WitnessElement::Signature,
                                WitnessElement::Data(vec![]),
                                WitnessElement::Data(
                                    to_local_script.to_inner().to_bytes(),
                                ),
                            ],
                        },
                        event.height,
                        own_delay,
                    ),
                ));
            }
        } else {
            // Our to_remote output on their commitment: directly spendable
            let payment_base = core.local_keys().payment_basepoint.key;
            let to_remote_key = if core.local_keys().static_remotekey {
                payment_base
            } else {
                derive_pubkey(payment_base, per_commitment_point)
            };
            let to_remote_script =
                <bitcoin_scripts::PubkeyScript as CommitScripts>::ln_to_remote(
                    0,
                    to_remote_key,
                );
            if let Some((vout, output)) = find_output(
                &event.spending_tx,
                &to_remote_script.into_inner(),
            ) {
                resolvers.push(ContractResolver::CommitSweep(
                    CommitSweepResolver::with(
                        SweepClaim {
                            outpoint: bitcoin::OutPoint::new(
                                spending_txid,
                                vout,
                            ),
                            amount: output.value,
                            spent_output: output.clone(),
                            descriptor: SignDescriptor {
                                key_loc: KeyLocator {
                                    family: KeyFamily::PaymentBase,
                                    index: 0,
                                },
                                single_tweak: if core
                                    .local_keys()
                                    .static_remotekey
                                {
                                    None
                                } else {
                                    Some(per_commitment_point)
                                },
                                double_tweak: None,
                                witness_script: p2wpkh_script_code(
                                    to_remote_key,
                                ),
                                amount: output.value,
                                input_index: 0,
                                sighash_type: EcdsaSighashType::All,
                            },
                            witness_template: vec![
                                WitnessElement::Signature,
                                WitnessElement::Data(
                                    to_remote_key.serialize().to_vec(),
                                ),
                            ],
                        },
                        event.height,
                        0,
                    ),
                ));
            }
        }

        // HTLC outputs. On the local commitment the claims go through the
        // pre-signed second-stage transactions; on the remote commitment
        // they are direct spends.
        for htlc in &view.htlcs {
            let (offered_by_owner, direction_local) = match htlc.direction {
                // Directions in the stored commitment are relative to its
                // owner
                HtlcDirection::Offered => (true, is_local),
                HtlcDirection::Received => (false, !is_local),
            };
            let (owner_htlc, counter_htlc, revocation) = if is_local {
                (local_htlc, remote_htlc, remote_revocation)
            } else {
                (
                    remote_htlc,
                    local_htlc,
                    derive_revocation_pubkey(
                        local_revocation_base,
                        per_commitment_point,
                    ),
                )
            };
            let witness_script = if offered_by_owner {
                <bitcoin_scripts::WitnessScript as HtlcScripts>::ln_offered_htlc(
                    htlc.amount_msat / 1000,
                    revocation,
                    owner_htlc,
                    counter_htlc,
                    htlc.payment_hash,
                )
            } else {
                <bitcoin_scripts::WitnessScript as HtlcScripts>::ln_received_htlc(
                    htlc.amount_msat / 1000,
                    revocation,
                    owner_htlc,
                    counter_htlc,
                    htlc.cltv_expiry,
                    htlc.payment_hash,
                )
            };
            let script_pubkey = witness_script.clone().to_p2wsh();
            let (vout, output) = match find_output(
                &event.spending_tx,
                &script_pubkey.clone().into_inner(),
            ) {
                Some(found) => found,
                // Trimmed to fees at construction time
                None => continue,
            };
            let outpoint = bitcoin::OutPoint::new(spending_txid, vout);
            let claim = SweepClaim {
                outpoint,
                amount: output.value,
                spent_output: output.clone(),
                descriptor: SignDescriptor {
                    key_loc: KeyLocator {
                        family: KeyFamily::HtlcBase,
                        index: 0,
                    },
                    single_tweak: Some(per_commitment_point),
                    double_tweak: None,
                    witness_script: witness_script.to_inner(),
                    amount: output.value,
                    input_index: 0,
                    sighash_type: EcdsaSighashType::All,
                },
                witness_template: if direction_local {
                    // Timeout spend of our offered HTLC on their
                    // commitment: signature then empty preimage slot
                    vec![
                        WitnessElement::Signature,
                        WitnessElement::Data(vec![]),
                        WitnessElement::Data(
                            witness_script.to_inner().to_bytes(),
                        ),
                    ]
                } else {
                    // Preimage spend of their offered HTLC on their
                    // commitment
                    vec![
                        WitnessElement::Signature,
                        WitnessElement::Preimage,
                        WitnessElement::Data(
                            witness_script.to_inner().to_bytes(),
                        ),
                    ]
                },
            };

            // Pre-signed second-stage transaction for local commitments
            let (second_stage_tx, second_level) = if is_local {
                self.second_stage_for(
                    graph.as_ref().expect("graph rendered for local commit"),
                    &view,
                    htlc.id,
                    direction_local,
                    per_commitment_point,
                )?
            } else {
                (None, None)
            };

            if direction_local {
                // Our outgoing HTLC
                resolvers.push(ContractResolver::OutgoingHtlc(
                    OutgoingHtlcResolver::with(
                        claim,
                        htlc.payment_hash,
                        htlc.cltv_expiry,
                        second_stage_tx,
                        second_level,
                        own_delay,
                    ),
                ));
            } else {
                resolvers.push(ContractResolver::IncomingHtlc(
                    IncomingHtlcResolver::with(
                        claim,
                        htlc.payment_hash,
                        htlc.cltv_expiry,
                        None,
                        second_stage_tx,
                    ),
                ));
            }
        }

        info!(
            "channel {}: dispatched {} resolvers for {}",
            self.channel_id,
            resolvers.len(),
            spending_txid
        );
        self.resolvers = resolvers;
        Ok(())
    }

    /// Assembles the fully signed second-stage transaction for an HTLC of
    /// the local commitment, together with the claim of its delayed output
    fn second_stage_for(
        &self,
        graph: &RenderedGraph,
        view: &Commitment,
        htlc_id: u64,
        outgoing: bool,
        per_commitment_point: bitcoin::secp256k1::PublicKey,
    ) -> Result<
        (Option<Transaction>, Option<SweepClaim>),
        ArbitratorError,
    > {
        let role: u16 = if outgoing {
            TxType::HtlcTimeout.into()
        } else {
            TxType::HtlcSuccess.into()
        };
        let entry = graph
            .second_stage
            .iter()
            .find(|(tx_role, index, _)| *tx_role == role && *index == htlc_id);
        let (_, _, psbt) = match entry {
            Some(entry) => entry,
            None => return Ok((None, None)),
        };

        // Remote HTLC signatures are stored in commitment output order
        let mut ordered: Vec<_> = graph
            .second_stage
            .iter()
            .map(|(_, index, psbt)| {
                (psbt.unsigned_tx.input[0].previous_output.vout, *index)
            })
            .collect();
        ordered.sort_unstable();
        let position = ordered
            .iter()
            .position(|(_, index)| *index == htlc_id)
            .unwrap_or_default();
        let remote_signature =
            match view.htlc_signatures.get(position).copied() {
                Some(signature) => signature,
                None => return Ok((None, None)),
            };
        let local_signature =
            self.signer.sign_htlc(psbt, per_commitment_point)?;

        let witness_script = match psbt.inputs[0].witness_script.clone() {
            Some(script) => script,
            None => return Ok((None, None)),
        };
        let mut tx = psbt.unsigned_tx.clone();
        let mut remote_sig = remote_signature.serialize_der().to_vec();
        remote_sig.push(EcdsaSighashType::All as u8);
        let mut local_sig = local_signature.serialize_der().to_vec();
        local_sig.push(EcdsaSighashType::All as u8);
        // BOLT-3 second-stage witness: 0 <remotehtlcsig> <localhtlcsig>
        // <payment_preimage | ''> <script>
        tx.input[0].witness = Witness::from_vec(vec![
            vec![],
            remote_sig,
            local_sig,
            vec![],
            witness_script.to_bytes(),
        ]);

        // The delayed output of the second-stage transaction
        let delayed_script = psbt.outputs[0].witness_script.clone();
        let second_level = delayed_script.map(|script| SweepClaim {
            outpoint: bitcoin::OutPoint::new(tx.txid(), 0),
            amount: tx.output[0].value,
            spent_output: tx.output[0].clone(),
            descriptor: SignDescriptor {
                key_loc: KeyLocator {
                    family: KeyFamily::DelayBase,
                    index: 0,
                },
                single_tweak: Some(per_commitment_point),
                double_tweak: None,
                witness_script: script.clone(),
                amount: tx.output[0].value,
                input_index: 0,
                sighash_type: EcdsaSighashType::All,
            },
            witness_template: vec![
                WitnessElement::Signature,
                WitnessElement::Data(vec![]),
                WitnessElement::Data(script.to_bytes()),
            ],
        });
        Ok((Some(tx), second_level))
    }

    async fn handle_breach(
        &mut self,
        event: &SpendEvent,
        height: u64,
    ) -> Result<(), ArbitratorError> {
        let revoked = match self.lookup_retribution(event.spending_tx.txid())
        {
            Some(revoked) => revoked,
            None => {
                error!(
                    "channel {}: breach at height {} lost its retribution \
                     record",
                    self.channel_id, height
                );
                return Ok(());
            }
        };
        let core = self.channel.constructor();
        let keys = BreachKeys {
            local_revocation_basepoint: core
                .local_keys()
                .revocation_basepoint
                .key,
            remote_delayed_basepoint: core
                .remote_keys()
                .delayed_payment_basepoint,
            remote_htlc_basepoint: core.remote_keys().htlc_basepoint,
            local_htlc_basepoint: core.local_keys().htlc_basepoint.key,
            to_self_delay: core.local_params().to_self_delay,
        };
        let arbiter = BreachArbiter::with(
            self.store.clone(),
            self.chain.clone(),
            self.signer.clone(),
            Script::new(),
            self.channel.feerate_per_kw(),
        );
        let record = arbiter
            .punish(self.channel_id, &revoked, &keys, &event.spending_tx)
            .await
            .map_err(|err| {
                crate::persist::StoreError::Backend(err.to_string())
            })?;
        self.finish(
            event.spending_tx.txid(),
            1,
            record.claimed_value,
        )?;
        Ok(())
    }

    async fn handle_output_spent(
        &mut self,
        event: SpendEvent,
    ) -> Result<(), ArbitratorError> {
        let mut actions = vec![];
        for resolver in &mut self.resolvers {
            if resolver.outpoint() == event.outpoint {
                actions.extend(resolver.on_spend(&event));
            }
        }
        self.apply_actions(actions).await?;
        self.prune_resolved(event.spending_tx.txid())?;
        Ok(())
    }

    async fn advance_resolvers_on_height(
        &mut self,
        height: u32,
    ) -> Result<(), ArbitratorError> {
        let mut actions = vec![];
        for resolver in &mut self.resolvers {
            actions.extend(resolver.on_height(height));
        }
        self.apply_actions(actions).await?;
        Ok(())
    }

    async fn apply_actions(
        &mut self,
        actions: Vec<ResolverAction>,
    ) -> Result<(), ArbitratorError> {
        for action in actions {
            match action {
                ResolverAction::Sweep(input) => {
                    self.sweeper.enqueue(input).await;
                }
                ResolverAction::Publish(tx) => {
                    self.chain.publish(tx, "second-stage claim").await?;
                }
                ResolverAction::SettleBack {
                    payment_hash,
                    preimage,
                } => {
                    // An on-chain success claim resolves the off-chain
                    // circuit through the switch; the circuit map knows
                    // the incoming leg
                    debug!(
                        "channel {}: on-chain preimage for {} propagated \
                         upstream",
                        self.channel_id, payment_hash
                    );
                    let _ = self
                        .switch
                        .send(SwitchCommand::Resolve {
                            outgoing: crate::htlcswitch::CircuitKey::with(
                                self.channel_id,
                                0,
                            ),
                            event: ResolutionEvent::Settle(preimage),
                        })
                        .await;
                }
                ResolverAction::Spawn(child) => {
                    let _ = self
                        .chain
                        .register_spend(
                            child.outpoint(),
                            child.script_pubkey(),
                            self.best_height,
                        )
                        .await;
                    self.resolvers.push(child);
                }
            }
        }
        self.checkpoint()?;
        Ok(())
    }

    fn prune_resolved(
        &mut self,
        close_txid: Txid,
    ) -> Result<(), ArbitratorError> {
        self.resolvers.retain(|resolver| !resolver.is_resolved());
        if self.resolvers.is_empty()
            && self.state == ArbitratorState::StateWaitingFullResolution
        {
            self.finish(close_txid, 0, 0)?;
        } else {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn finish(
        &mut self,
        close_txid: Txid,
        resolver_count: u32,
        contested_value: u64,
    ) -> Result<(), ArbitratorError> {
        self.state = ArbitratorState::StateFullyResolved;
        let report = ResolutionReport {
            channel_id: self.channel_id,
            close_txid,
            resolver_count,
            contested_value,
        };
        let mut key = self.channel_id.as_slice32().to_inner().to_vec();
        key.extend(b"/report");
        self.store.put_value(Bucket::Arbitrator, &key, &report)?;
        self.checkpoint()?;
        info!("channel {} fully resolved", self.channel_id);
        Ok(())
    }

    /// Checkpoints the arbitration state; resolver progress is re-derived
    /// from chain events on restart
    fn checkpoint(&self) -> Result<(), ArbitratorError> {
        let mut key = self.channel_id.as_slice32().to_inner().to_vec();
        key.extend(b"/state");
        self.store
            .put_value(Bucket::Arbitrator, &key, &self.state)?;
        Ok(())
    }
}

fn find_output<'tx>(
    tx: &'tx Transaction,
    script_pubkey: &Script,
) -> Option<(u32, &'tx bitcoin::TxOut)> {
    tx.output
        .iter()
        .enumerate()
        .find(|(_, output)| &output.script_pubkey == script_pubkey)
        .map(|(vout, output)| (vout as u32, output))
}

/// BIP-143 script code of a P2WPKH output
fn p2wpkh_script_code(key: bitcoin::secp256k1::PublicKey) -> Script {
    use bitcoin::blockdata::opcodes::all::*;
    use bitcoin::blockdata::script::Builder;
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(&bitcoin::PublicKey::new(key).pubkey_hash())
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}
