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

//! Contract resolvers: one small persisted state machine per contested
//! output of a confirmed commitment transaction.
//!
//! Each resolver advances on chain events (heights, spends, sweep
//! confirmations) and produces actions: sweep requests towards the
//! sweeper, pre-signed second-stage publications, preimage settlements
//! back through the switch, and child resolvers for the delayed outputs
//! of second-stage transactions. A channel is fully resolved when every
//! resolver reports a terminal outcome.

use amplify::{Slice32, Wrapper};
use bitcoin::{OutPoint, Script, Transaction, TxOut};
use bitcoin_scripts::hlc::{HashLock, HashPreimage};

use crate::chain::SpendEvent;
use crate::sweep::{SweepInput, SweepKind, WitnessElement};
use crate::wallet::SignDescriptor;

/// Action requested by a resolver transition
pub enum ResolverAction {
    /// Hand the output to the sweeper
    Sweep(SweepInput),

    /// Publish a fully signed pre-built transaction (second-stage HTLC
    /// claims on the local commitment)
    Publish(Transaction),

    /// A preimage was learned on-chain; settle the matching incoming HTLC
    /// back through the switch
    SettleBack {
        payment_hash: HashLock,
        preimage: HashPreimage,
    },

    /// A second-stage transaction confirmed; resolve its delayed output
    /// with a child resolver
    Spawn(ContractResolver),
}

/// Static data of one sweepable claim
#[derive(Clone, Debug)]
pub struct SweepClaim {
    /// The contested output
    pub outpoint: OutPoint,

    /// Value of the output, sats
    pub amount: u64,

    /// The full spent output
    pub spent_output: TxOut,

    /// Signing instructions for the claim
    pub descriptor: SignDescriptor,

    /// Witness template with signature (and possibly preimage) slots
    pub witness_template: Vec<WitnessElement>,
}

/// Resolver of the commit `to_local` output: waits out the CSV delay and
/// sweeps
#[derive(Debug)]
pub struct CommitSweepResolver {
    pub claim: SweepClaim,
    /// Height of the commitment confirmation
    pub confirmation_height: u32,
    /// CSV delay of the output; zero for the directly spendable
    /// `to_remote` on the counterparty commitment
    pub csv_delay: u16,
    sweep_queued: bool,
    resolved: bool,
}

impl CommitSweepResolver {
    pub fn with(
        claim: SweepClaim,
        confirmation_height: u32,
        csv_delay: u16,
    ) -> CommitSweepResolver {
        CommitSweepResolver {
            claim,
            confirmation_height,
            csv_delay,
            sweep_queued: false,
            resolved: false,
        }
    }

    fn maturity(&self) -> u32 {
        self.confirmation_height + self.csv_delay as u32
    }

    fn on_height(&mut self, height: u32) -> Vec<ResolverAction> {
        if self.sweep_queued || self.resolved || height < self.maturity() {
            return vec![];
        }
        self.sweep_queued = true;
        let (sequence, kind) = if self.csv_delay > 0 {
            (self.csv_delay as u32, SweepKind::CommitSweep)
        } else {
            (0xFFFF_FFFD, SweepKind::CommitSweep)
        };
        vec![ResolverAction::Sweep(SweepInput {
            outpoint: self.claim.outpoint,
            amount: self.claim.amount,
            spent_output: self.claim.spent_output.clone(),
            descriptor: self.claim.descriptor.clone(),
            witness_template: self.claim.witness_template.clone(),
            mature_at: self.maturity(),
            locktime: 0,
            sequence,
            deadline: u32::MAX,
            kind,
        })]
    }
}

/// Resolver of an incoming HTLC output: claims through the success path
/// once the preimage is known, or stands down after the remote's timeout
/// claim.
#[derive(Debug)]
pub struct IncomingHtlcResolver {
    pub claim: SweepClaim,
    pub payment_hash: HashLock,
    pub cltv_expiry: u32,
    pub preimage: Option<HashPreimage>,
    /// Pre-signed HTLC-success transaction when the contested output sits
    /// on our own commitment
    pub success_tx: Option<Transaction>,
    claimed: bool,
    resolved: bool,
}

impl IncomingHtlcResolver {
    pub fn with(
        claim: SweepClaim,
        payment_hash: HashLock,
        cltv_expiry: u32,
        preimage: Option<HashPreimage>,
        success_tx: Option<Transaction>,
    ) -> IncomingHtlcResolver {
        IncomingHtlcResolver {
            claim,
            payment_hash,
            cltv_expiry,
            preimage,
            success_tx,
            claimed: false,
            resolved: false,
        }
    }

    /// Supplies a preimage learned after dispatch (invoice settled while
    /// the contract was already on-chain)
    pub fn learn_preimage(&mut self, preimage: HashPreimage) {
        if HashLock::from(preimage) == self.payment_hash {
            self.preimage = Some(preimage);
        }
    }

    fn on_height(&mut self, _height: u32) -> Vec<ResolverAction> {
        if self.claimed || self.resolved {
            return vec![];
        }
        let preimage = match self.preimage {
            Some(preimage) => preimage,
            // Without the preimage there is nothing to claim; the remote
            // takes the timeout path after expiry
            None => return vec![],
        };
        self.claimed = true;
        if let Some(tx) = self.success_tx.clone() {
            return vec![ResolverAction::Publish(tx)];
        }
        let template = self
            .claim
            .witness_template
            .iter()
            .map(|part| match part {
                WitnessElement::Preimage => {
                    WitnessElement::Data(preimage.as_ref().to_vec())
                }
                other => other.clone(),
            })
            .collect();
        vec![ResolverAction::Sweep(SweepInput {
            outpoint: self.claim.outpoint,
            amount: self.claim.amount,
            spent_output: self.claim.spent_output.clone(),
            descriptor: self.claim.descriptor.clone(),
            witness_template: template,
            mature_at: 0,
            locktime: 0,
            sequence: 0xFFFF_FFFD,
            deadline: self.cltv_expiry,
            kind: SweepKind::SecondLevel,
        })]
    }

    fn on_spend(&mut self, _event: &SpendEvent) -> Vec<ResolverAction> {
        // Either our claim confirmed or the remote took the timeout path;
        // both are terminal
        self.resolved = true;
        vec![]
    }
}

/// Resolver of an outgoing HTLC output: claims the timeout path after
/// expiry, or learns the preimage from the remote's on-chain success claim
/// and settles the upstream HTLC.
#[derive(Debug)]
pub struct OutgoingHtlcResolver {
    pub claim: SweepClaim,
    pub payment_hash: HashLock,
    pub cltv_expiry: u32,
    /// Pre-signed HTLC-timeout transaction when the contested output sits
    /// on our own commitment
    pub timeout_tx: Option<Transaction>,
    /// Child claim for the delayed output of the timeout transaction
    pub second_level: Option<SweepClaim>,
    pub csv_delay: u16,
    claimed: bool,
    resolved: bool,
}

impl OutgoingHtlcResolver {
    pub fn with(
        claim: SweepClaim,
        payment_hash: HashLock,
        cltv_expiry: u32,
        timeout_tx: Option<Transaction>,
        second_level: Option<SweepClaim>,
        csv_delay: u16,
    ) -> OutgoingHtlcResolver {
        OutgoingHtlcResolver {
            claim,
            payment_hash,
            cltv_expiry,
            timeout_tx,
            second_level,
            csv_delay,
            claimed: false,
            resolved: false,
        }
    }

    fn on_height(&mut self, height: u32) -> Vec<ResolverAction> {
        if self.claimed || self.resolved || height < self.cltv_expiry {
            return vec![];
        }
        self.claimed = true;
        if let Some(tx) = self.timeout_tx.clone() {
            return vec![ResolverAction::Publish(tx)];
        }
        vec![ResolverAction::Sweep(SweepInput {
            outpoint: self.claim.outpoint,
            amount: self.claim.amount,
            spent_output: self.claim.spent_output.clone(),
            descriptor: self.claim.descriptor.clone(),
            witness_template: self.claim.witness_template.clone(),
            mature_at: self.cltv_expiry,
            locktime: self.cltv_expiry,
            sequence: 0,
            deadline: u32::MAX,
            kind: SweepKind::HtlcTimeout,
        })]
    }

    fn on_spend(&mut self, event: &SpendEvent) -> Vec<ResolverAction> {
        if self.resolved {
            return vec![];
        }
        // The spend is either our own timeout claim or the remote's
        // success claim carrying the preimage
        if let Some(preimage) =
            extract_preimage(&event.spending_tx, self.payment_hash)
        {
            self.resolved = true;
            debug!(
                "outgoing HTLC {} settled on-chain by the remote; \
                 propagating the preimage upstream",
                self.claim.outpoint
            );
            return vec![ResolverAction::SettleBack {
                payment_hash: self.payment_hash,
                preimage,
            }];
        }
        // Our timeout claim confirmed. When it was a pre-signed
        // second-stage transaction its CSV-delayed output needs a child.
        self.resolved = true;
        match self.second_level.take() {
            Some(claim) => {
                let child = CommitSweepResolver::with(
                    claim,
                    event.height,
                    self.csv_delay,
                );
                vec![ResolverAction::Spawn(ContractResolver::SecondLevel(
                    child,
                ))]
            }
            None => vec![],
        }
    }
}

/// Scans a spending transaction's witnesses for a 32-byte preimage
/// matching the payment hash
pub fn extract_preimage(
    tx: &Transaction,
    payment_hash: HashLock,
) -> Option<HashPreimage> {
    for input in &tx.input {
        for element in input.witness.iter() {
            if element.len() != 32 {
                continue;
            }
            let mut raw = [0u8; 32];
            raw.copy_from_slice(element);
            let candidate = HashPreimage::from(Slice32::from_inner(raw));
            if HashLock::from(candidate) == payment_hash {
                return Some(candidate);
            }
        }
    }
    None
}

/// A resolver for one contested output
#[derive(Debug)]
pub enum ContractResolver {
    /// Commit `to_local` (or counterparty `to_remote`) output
    CommitSweep(CommitSweepResolver),

    /// Incoming HTLC output
    IncomingHtlc(IncomingHtlcResolver),

    /// Outgoing HTLC output
    OutgoingHtlc(OutgoingHtlcResolver),

    /// CSV-delayed output of a confirmed second-stage transaction
    SecondLevel(CommitSweepResolver),
}

impl ContractResolver {
    /// The contested outpoint this resolver owns
    pub fn outpoint(&self) -> OutPoint {
        match self {
            ContractResolver::CommitSweep(resolver)
            | ContractResolver::SecondLevel(resolver) => {
                resolver.claim.outpoint
            }
            ContractResolver::IncomingHtlc(resolver) => {
                resolver.claim.outpoint
            }
            ContractResolver::OutgoingHtlc(resolver) => {
                resolver.claim.outpoint
            }
        }
    }

    /// Whether the resolver reached a terminal outcome
    pub fn is_resolved(&self) -> bool {
        match self {
            ContractResolver::CommitSweep(resolver)
            | ContractResolver::SecondLevel(resolver) => resolver.resolved,
            ContractResolver::IncomingHtlc(resolver) => resolver.resolved,
            ContractResolver::OutgoingHtlc(resolver) => resolver.resolved,
        }
    }

    /// Advances the resolver on a new block height
    pub fn on_height(&mut self, height: u32) -> Vec<ResolverAction> {
        match self {
            ContractResolver::CommitSweep(resolver)
            | ContractResolver::SecondLevel(resolver) => {
                resolver.on_height(height)
            }
            ContractResolver::IncomingHtlc(resolver) => {
                resolver.on_height(height)
            }
            ContractResolver::OutgoingHtlc(resolver) => {
                resolver.on_height(height)
            }
        }
    }

    /// Advances the resolver on a spend of its outpoint
    pub fn on_spend(&mut self, event: &SpendEvent) -> Vec<ResolverAction> {
        match self {
            ContractResolver::CommitSweep(resolver)
            | ContractResolver::SecondLevel(resolver) => {
                // Any confirmed spend of the output terminates the
                // resolver: either our sweep confirmed or a revocation
                // claim beat us to it
                resolver.resolved = true;
                vec![]
            }
            ContractResolver::IncomingHtlc(resolver) => {
                resolver.on_spend(event)
            }
            ContractResolver::OutgoingHtlc(resolver) => {
                resolver.on_spend(event)
            }
        }
    }

    /// Script of the contested output, for spend registration
    pub fn script_pubkey(&self) -> Script {
        match self {
            ContractResolver::CommitSweep(resolver)
            | ContractResolver::SecondLevel(resolver) => {
                resolver.claim.spent_output.script_pubkey.clone()
            }
            ContractResolver::IncomingHtlc(resolver) => {
                resolver.claim.spent_output.script_pubkey.clone()
            }
            ContractResolver::OutgoingHtlc(resolver) => {
                resolver.claim.spent_output.script_pubkey.clone()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bitcoin::{EcdsaSighashType, PackedLockTime, Sequence, TxIn, Witness};

    use super::*;
    use crate::wallet::{KeyFamily, KeyLocator};

    fn claim(amount: u64) -> SweepClaim {
        let script = Script::from(vec![0x51]);
        SweepClaim {
            outpoint: OutPoint::null(),
            amount,
            spent_output: TxOut {
                value: amount,
                script_pubkey: script.to_v0_p2wsh(),
            },
            descriptor: SignDescriptor {
                key_loc: KeyLocator {
                    family: KeyFamily::DelayBase,
                    index: 0,
                },
                single_tweak: None,
                double_tweak: None,
                witness_script: script.clone(),
                amount,
                input_index: 0,
                sighash_type: EcdsaSighashType::All,
            },
            witness_template: vec![
                WitnessElement::Signature,
                WitnessElement::Data(script.to_bytes()),
            ],
        }
    }

    #[test]
    fn commit_sweep_waits_for_csv() {
        let mut resolver = ContractResolver::CommitSweep(
            CommitSweepResolver::with(claim(500_000), 700_000, 144),
        );
        // Before maturity nothing happens
        assert!(resolver.on_height(700_100).is_empty());
        // At maturity the sweep is requested exactly once
        let actions = resolver.on_height(700_144);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ResolverAction::Sweep(_)));
        assert!(resolver.on_height(700_145).is_empty());
    }

    #[test]
    fn outgoing_htlc_times_out() {
        let mut resolver = ContractResolver::OutgoingHtlc(
            OutgoingHtlcResolver::with(
                claim(100_000),
                HashLock::from(HashPreimage::random()),
                500_040,
                None,
                None,
                144,
            ),
        );
        assert!(resolver.on_height(500_039).is_empty());
        let actions = resolver.on_height(500_040);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ResolverAction::Sweep(input) => {
                assert_eq!(input.kind, SweepKind::HtlcTimeout);
                assert_eq!(input.locktime, 500_040);
                assert_eq!(input.sequence, 0);
            }
            _ => panic!("expected a sweep request"),
        }
    }

    #[test]
    fn outgoing_htlc_prefers_presigned_timeout() {
        let timeout_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(500_040),
            input: vec![],
            output: vec![],
        };
        let mut resolver = ContractResolver::OutgoingHtlc(
            OutgoingHtlcResolver::with(
                claim(100_000),
                HashLock::from(HashPreimage::random()),
                500_040,
                Some(timeout_tx.clone()),
                Some(claim(95_000)),
                144,
            ),
        );
        let actions = resolver.on_height(500_040);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ResolverAction::Publish(tx) => assert_eq!(*tx, timeout_tx),
            _ => panic!("expected a second-stage publication"),
        }
    }

    #[test]
    fn outgoing_htlc_learns_preimage_from_spend() {
        let preimage = HashPreimage::random();
        let payment_hash = HashLock::from(preimage);
        let mut resolver = ContractResolver::OutgoingHtlc(
            OutgoingHtlcResolver::with(
                claim(100_000),
                payment_hash,
                500_040,
                None,
                None,
                144,
            ),
        );

        let spending_tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Script::new(),
                sequence: Sequence(0),
                witness: Witness::from_vec(vec![
                    vec![0x30; 71],
                    preimage.as_ref().to_vec(),
                    vec![0x51],
                ]),
            }],
            output: vec![],
        };
        let event = SpendEvent {
            outpoint: OutPoint::null(),
            spending_tx,
            input_index: 0,
            height: 500_020,
        };
        let actions = resolver.on_spend(&event);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ResolverAction::SettleBack {
                preimage: found, ..
            } => assert_eq!(*found, preimage),
            _ => panic!("expected an upstream settle"),
        }
        assert!(resolver.is_resolved());
    }

    #[test]
    fn timeout_confirmation_spawns_second_level() {
        let mut resolver = ContractResolver::OutgoingHtlc(
            OutgoingHtlcResolver::with(
                claim(100_000),
                HashLock::from(HashPreimage::random()),
                500_040,
                None,
                Some(claim(95_000)),
                144,
            ),
        );
        let event = SpendEvent {
            outpoint: OutPoint::null(),
            spending_tx: Transaction {
                version: 2,
                lock_time: PackedLockTime(500_040),
                input: vec![],
                output: vec![],
            },
            input_index: 0,
            height: 500_050,
        };
        let actions = resolver.on_spend(&event);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ResolverAction::Spawn(ContractResolver::SecondLevel(child)) => {
                assert_eq!(child.confirmation_height, 500_050);
                assert_eq!(child.csv_delay, 144);
            }
            _ => panic!("expected a spawned child resolver"),
        }
    }

    #[test]
    fn incoming_htlc_waits_for_preimage() {
        let preimage = HashPreimage::random();
        let mut resolver = ContractResolver::IncomingHtlc(
            IncomingHtlcResolver::with(
                claim(100_000),
                HashLock::from(preimage),
                500_040,
                None,
                None,
            ),
        );
        assert!(resolver.on_height(500_000).is_empty());
        if let ContractResolver::IncomingHtlc(inner) = &mut resolver {
            inner.learn_preimage(preimage);
        }
        let actions = resolver.on_height(500_001);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ResolverAction::Sweep(_)));
    }
}
