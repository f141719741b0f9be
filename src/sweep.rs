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

//! Sweeper: aggregates mature contested outputs into batched sweep
//! transactions and manages their fee bumping.
//!
//! Inputs arrive from contract resolvers and the breach arbiter with their
//! timelock constraints; the sweeper batches the mature ones by fee
//! preference, produces one sweep transaction per batch, and RBF-bumps
//! unconfirmed sweeps on the configured cadence. A double spend of an
//! input (the counterparty claiming an HTLC via its preimage) drops the
//! input and triggers a re-plan of the batch.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{
    EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use tokio::sync::mpsc;

use crate::chain::{BlockEpoch, ChainError, ChainWatcher};
use crate::config::SweepConfig;
use crate::wallet::{ChannelSigner, SignDescriptor, SignError};

/// Flavor of a swept output, deciding its witness shape and urgency
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
)]
pub enum SweepKind {
    /// Commit `to_local` output after the CSV delay
    #[display("commit-sweep")]
    CommitSweep,

    /// Second-stage HTLC output after its CSV delay
    #[display("second-level")]
    SecondLevel,

    /// HTLC output swept through the timeout path (CLTV + CSV elapsed)
    #[display("htlc-timeout")]
    HtlcTimeout,

    /// Revoked commitment output claimed through the revocation path; no
    /// timelock but must confirm before the counterparty CSV elapses
    #[display("justice")]
    Justice,
}

/// Element of a witness stack template
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WitnessElement {
    /// Slot for the input signature, filled by the sweeper
    Signature,

    /// Slot for a payment preimage, substituted by the resolver once the
    /// preimage is known
    Preimage,

    /// Literal stack element (flow-control byte, pubkey, witness script);
    /// an empty vector pushes the empty element selecting an `OP_ELSE`
    /// branch
    Data(Vec<u8>),
}

/// One output queued for sweeping
#[derive(Clone, Debug)]
pub struct SweepInput {
    /// The output being swept
    pub outpoint: OutPoint,

    /// The output value, sats
    pub amount: u64,

    /// The spent output, needed for sighash computation
    pub spent_output: TxOut,

    /// Signing instructions
    pub descriptor: SignDescriptor,

    /// Witness template with the signature slot marked
    pub witness_template: Vec<WitnessElement>,

    /// First height at which the input is spendable (CSV/CLTV maturity);
    /// zero when immediately spendable
    pub mature_at: u32,

    /// Absolute locktime the sweep transaction must set for this input
    /// (HTLC timeout claims), zero otherwise
    pub locktime: u32,

    /// Sequence required on the input (CSV claims), `0xFFFF_FFFD` (RBF
    /// signalling) otherwise
    pub sequence: u32,

    /// Height before which the sweep should confirm; drives batching and
    /// urgency
    pub deadline: u32,

    /// Kind of the input
    pub kind: SweepKind,
}

/// Commands accepted by the sweeper task
pub enum SweepCommand {
    /// Queue an output for sweeping
    Enqueue(SweepInput),

    /// An input was spent by someone else (e.g. remote claimed the HTLC
    /// with its preimage); drop it and re-plan
    InputSpent(OutPoint),

    /// Stop the sweeper
    Shutdown,
}

/// Handle for feeding the sweeper
#[derive(Clone)]
pub struct SweeperHandle {
    commands: mpsc::Sender<SweepCommand>,
}

impl SweeperHandle {
    pub async fn enqueue(&self, input: SweepInput) -> bool {
        self.commands
            .send(SweepCommand::Enqueue(input))
            .await
            .is_ok()
    }

    pub async fn input_spent(&self, outpoint: OutPoint) -> bool {
        self.commands
            .send(SweepCommand::InputSpent(outpoint))
            .await
            .is_ok()
    }
}

/// Sweeper errors
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SweepError {
    /// signing failure while building the sweep: {0}
    #[from]
    Sign(SignError),

    /// chain interface failure: {0}
    #[from]
    Chain(ChainError),

    /// the sweep batch produced no spendable value after fees
    Uneconomical,
}

struct PublishedSweep {
    txid: Txid,
    inputs: Vec<SweepInput>,
    feerate_per_kw: u32,
    initial_feerate_per_kw: u32,
    published_at: u32,
    last_bump: u32,
}

/// The sweeper task
pub struct Sweeper {
    cfg: SweepConfig,
    chain: Arc<dyn ChainWatcher>,
    signer: Arc<dyn ChannelSigner>,
    /// Destination of swept funds, provided by the wallet
    sweep_script: Script,
    commands: mpsc::Receiver<SweepCommand>,
    pending: Vec<SweepInput>,
    published: HashMap<Txid, PublishedSweep>,
    best_height: u32,
}

impl Sweeper {
    pub fn with(
        cfg: SweepConfig,
        chain: Arc<dyn ChainWatcher>,
        signer: Arc<dyn ChannelSigner>,
        sweep_script: Script,
        mailbox_size: usize,
    ) -> (Sweeper, SweeperHandle) {
        let (tx, rx) = mpsc::channel(mailbox_size);
        (
            Sweeper {
                cfg,
                chain,
                signer,
                sweep_script,
                commands: rx,
                pending: vec![],
                published: HashMap::new(),
                best_height: 0,
            },
            SweeperHandle { commands: tx },
        )
    }

    /// Runs the sweeper, driven by block epochs and resolver requests
    pub async fn run(mut self) {
        let mut epochs = match self.chain.register_block_epochs().await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!("sweeper can't subscribe to block epochs: {}", err);
                return;
            }
        };
        info!("sweeper started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SweepCommand::Enqueue(input)) => {
                        debug!(
                            "sweeper: queued {} ({} sat, mature at {})",
                            input.kind, input.amount, input.mature_at
                        );
                        self.pending.push(input);
                        self.plan_and_publish().await;
                    }
                    Some(SweepCommand::InputSpent(outpoint)) => {
                        self.handle_double_spend(outpoint).await;
                    }
                    Some(SweepCommand::Shutdown) | None => break,
                },
                epoch = epochs.recv() => match epoch {
                    Some(BlockEpoch { height, .. }) => {
                        self.best_height = height;
                        self.plan_and_publish().await;
                        self.bump_stale().await;
                    }
                    None => break,
                }
            }
        }
        info!("sweeper stopped");
    }

    /// Groups mature inputs by urgency and publishes one sweep per batch
    async fn plan_and_publish(&mut self) {
        let height = self.best_height;
        let mature: Vec<SweepInput> = {
            let (mature, immature): (Vec<_>, Vec<_>) = self
                .pending
                .drain(..)
                .partition(|input| input.mature_at <= height);
            self.pending = immature;
            mature
        };
        if mature.is_empty() {
            return;
        }

        // Justice and short-deadline inputs sweep at an urgency premium;
        // the rest batch at the default rate
        let (urgent, normal): (Vec<_>, Vec<_>) =
            mature.into_iter().partition(|input| {
                input.kind == SweepKind::Justice
                    || input.deadline <= height + self.cfg.patience_blocks
            });

        for (batch, feerate) in [
            (urgent, self.cfg.default_feerate_per_kw * 10),
            (normal, self.cfg.default_feerate_per_kw),
        ] {
            if batch.is_empty() {
                continue;
            }
            match self.publish_batch(batch, feerate).await {
                Ok(txid) => info!("sweeper: published sweep {}", txid),
                Err(SweepError::Uneconomical) => {
                    debug!("sweeper: batch currently uneconomical; deferred")
                }
                Err(err) => error!("sweeper: publish failed: {}", err),
            }
        }
    }

    /// Builds, signs and publishes one sweep transaction
    async fn publish_batch(
        &mut self,
        inputs: Vec<SweepInput>,
        feerate_per_kw: u32,
    ) -> Result<Txid, SweepError> {
        let tx = self.build_sweep(&inputs, feerate_per_kw)?;
        let txid = tx.txid();
        self.chain.publish(tx, "sweep").await?;
        self.published.insert(txid, PublishedSweep {
            txid,
            inputs,
            feerate_per_kw,
            initial_feerate_per_kw: feerate_per_kw,
            published_at: self.best_height,
            last_bump: self.best_height,
        });
        Ok(txid)
    }

    /// Constructs and signs the sweep transaction spending all inputs into
    /// the wallet sweep script
    fn build_sweep(
        &self,
        inputs: &[SweepInput],
        feerate_per_kw: u32,
    ) -> Result<Transaction, SweepError> {
        let locktime = inputs
            .iter()
            .map(|input| input.locktime)
            .max()
            .unwrap_or_default();
        let total: u64 = inputs.iter().map(|input| input.amount).sum();
        // Rough weight: 4 units/byte base + witness; a P2WSH input with a
        // signature and script stays under 400 weight units
        let weight = 400 + 400 * inputs.len() as u64;
        let fee = weight * feerate_per_kw as u64 / 1000;
        if total <= fee + 330 {
            return Err(SweepError::Uneconomical);
        }

        let mut tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(locktime),
            input: inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.outpoint,
                    script_sig: none!(),
                    sequence: Sequence(input.sequence),
                    witness: empty!(),
                })
                .collect(),
            output: vec![TxOut {
                value: total - fee,
                script_pubkey: self.sweep_script.clone(),
            }],
        };

        for (index, input) in inputs.iter().enumerate() {
            let mut descriptor = input.descriptor.clone();
            descriptor.input_index = index;
            descriptor.sighash_type = EcdsaSighashType::All;
            let signature = self.signer.sign_sweep(
                &tx,
                &input.spent_output,
                &descriptor,
            )?;
            let mut element = signature.serialize_der().to_vec();
            element.push(EcdsaSighashType::All as u8);
            let witness: Vec<Vec<u8>> = input
                .witness_template
                .iter()
                .map(|part| match part {
                    WitnessElement::Signature => element.clone(),
                    // An unsubstituted preimage slot can't produce a valid
                    // witness; the resolver fills it before enqueueing
                    WitnessElement::Preimage => vec![],
                    WitnessElement::Data(data) => data.clone(),
                })
                .collect();
            tx.input[index].witness = Witness::from_vec(witness);
        }
        Ok(tx)
    }

    /// RBF-bumps sweeps unconfirmed past the configured patience
    async fn bump_stale(&mut self) {
        let height = self.best_height;
        let stale: Vec<Txid> = self
            .published
            .values()
            .filter(|sweep| {
                height
                    >= sweep.published_at + self.cfg.patience_blocks
                    && height
                        >= sweep.last_bump + self.cfg.bump_interval_blocks
            })
            .map(|sweep| sweep.txid)
            .collect();

        for txid in stale {
            let mut sweep = match self.published.remove(&txid) {
                Some(sweep) => sweep,
                None => continue,
            };
            let bumped = sweep.feerate_per_kw as u64
                * self.cfg.bump_multiplier_percent as u64
                / 100;
            let ceiling = sweep.initial_feerate_per_kw as u64
                * self.cfg.max_bump_multiplier as u64;
            let feerate = bumped.min(ceiling) as u32;
            if feerate <= sweep.feerate_per_kw {
                // Bump ceiling reached; keep waiting on the last version
                self.published.insert(txid, sweep);
                continue;
            }
            info!(
                "sweeper: RBF bumping {} from {} to {} sat/kw",
                txid, sweep.feerate_per_kw, feerate
            );
            sweep.feerate_per_kw = feerate;
            sweep.last_bump = height;
            let inputs = sweep.inputs.clone();
            match self.publish_batch(inputs, feerate).await {
                Ok(_) => {}
                Err(err) => {
                    error!("sweeper: bump of {} failed: {}", txid, err);
                    self.published.insert(txid, sweep);
                }
            }
        }
    }

    /// A third party spent one of our inputs: drop it everywhere and
    /// re-publish the affected sweeps without it
    async fn handle_double_spend(&mut self, outpoint: OutPoint) {
        self.pending.retain(|input| input.outpoint != outpoint);

        let affected: Vec<Txid> = self
            .published
            .iter()
            .filter(|(_, sweep)| {
                sweep.inputs.iter().any(|input| input.outpoint == outpoint)
            })
            .map(|(txid, _)| *txid)
            .collect();
        for txid in affected {
            if let Some(sweep) = self.published.remove(&txid) {
                warn!(
                    "sweeper: input {} of sweep {} was double-spent; \
                     re-planning",
                    outpoint, txid
                );
                let remaining: Vec<SweepInput> = sweep
                    .inputs
                    .into_iter()
                    .filter(|input| input.outpoint != outpoint)
                    .collect();
                self.pending.extend(remaining);
            }
        }
        self.plan_and_publish().await;
    }
}

#[cfg(test)]
mod test {
    use secp256k1::SecretKey;

    use super::*;
    use crate::wallet::{KeyFamily, KeyLocator, MemoryChannelSigner};

    fn signer() -> Arc<MemoryChannelSigner> {
        Arc::new(MemoryChannelSigner::with(
            SecretKey::from_slice(&[1u8; 32]).unwrap(),
            SecretKey::from_slice(&[2u8; 32]).unwrap(),
            SecretKey::from_slice(&[3u8; 32]).unwrap(),
            SecretKey::from_slice(&[4u8; 32]).unwrap(),
            SecretKey::from_slice(&[5u8; 32]).unwrap(),
        ))
    }

    fn sweep_input(amount: u64) -> SweepInput {
        let witness_script = Script::from(vec![0x51]);
        SweepInput {
            outpoint: OutPoint::null(),
            amount,
            spent_output: TxOut {
                value: amount,
                script_pubkey: witness_script.to_v0_p2wsh(),
            },
            descriptor: SignDescriptor {
                key_loc: KeyLocator {
                    family: KeyFamily::DelayBase,
                    index: 0,
                },
                single_tweak: None,
                double_tweak: None,
                witness_script: witness_script.clone(),
                amount,
                input_index: 0,
                sighash_type: EcdsaSighashType::All,
            },
            witness_template: vec![
                WitnessElement::Signature,
                WitnessElement::Data(witness_script.to_bytes()),
            ],
            mature_at: 0,
            locktime: 0,
            sequence: 0xFFFF_FFFD,
            deadline: u32::MAX,
            kind: SweepKind::CommitSweep,
        }
    }

    fn sweeper() -> Sweeper {
        struct NoChain;
        #[async_trait::async_trait]
        impl ChainWatcher for NoChain {
            async fn register_block_epochs(
                &self,
            ) -> Result<crate::chain::Subscription<BlockEpoch>, ChainError>
            {
                let (subscription, _tx, _cancel) =
                    crate::chain::Subscription::channel(1);
                Ok(subscription)
            }
            async fn register_confirmation(
                &self,
                _txid: Txid,
                _script: Script,
                _num_confs: u32,
                _start_height: u32,
            ) -> Result<
                crate::chain::Subscription<crate::chain::ConfirmationEvent>,
                ChainError,
            > {
                let (subscription, _tx, _cancel) =
                    crate::chain::Subscription::channel(1);
                Ok(subscription)
            }
            async fn register_spend(
                &self,
                _outpoint: OutPoint,
                _script: Script,
                _start_height: u32,
            ) -> Result<
                crate::chain::Subscription<crate::chain::SpendEvent>,
                ChainError,
            > {
                let (subscription, _tx, _cancel) =
                    crate::chain::Subscription::channel(1);
                Ok(subscription)
            }
            async fn publish(
                &self,
                _tx: Transaction,
                _label: &str,
            ) -> Result<(), ChainError> {
                Ok(())
            }
            async fn best_block(&self) -> Result<BlockEpoch, ChainError> {
                Err(ChainError::Transient(s!("no chain")))
            }
        }

        let (sweeper, _handle) = Sweeper::with(
            SweepConfig::default(),
            Arc::new(NoChain),
            signer(),
            Script::new(),
            8,
        );
        sweeper
    }

    #[test]
    fn sweep_tx_shape() {
        let sweeper = sweeper();
        let inputs = vec![sweep_input(100_000), sweep_input(50_000)];
        let tx = sweeper.build_sweep(&inputs, 1000).unwrap();
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 1);
        // Fee is deducted from the aggregate value
        assert!(tx.output[0].value < 150_000);
        assert!(tx.output[0].value > 140_000);
        // The signature replaced the empty witness template slot
        assert_eq!(tx.input[0].witness.len(), 2);
        assert!(!tx.input[0].witness.to_vec()[0].is_empty());
    }

    #[test]
    fn dust_batch_rejected() {
        let sweeper = sweeper();
        let inputs = vec![sweep_input(500)];
        assert!(matches!(
            sweeper.build_sweep(&inputs, 1000),
            Err(SweepError::Uneconomical)
        ));
    }

    #[test]
    fn locktime_covers_cltv_inputs() {
        let sweeper = sweeper();
        let mut timeout_input = sweep_input(80_000);
        timeout_input.locktime = 500_040;
        timeout_input.kind = SweepKind::HtlcTimeout;
        let tx = sweeper
            .build_sweep(&[timeout_input, sweep_input(70_000)], 1000)
            .unwrap();
        assert_eq!(tx.lock_time.0, 500_040);
    }
}
