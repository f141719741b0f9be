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

//! Breach arbiter: punishes the publication of a revoked commitment.
//!
//! When the arbitrator matches a funding spend against the retribution
//! store, the breach arbiter reconstructs the revocation key from the
//! disclosed per-commitment secret, builds a single justice transaction
//! claiming the remote output and every HTLC output through the
//! revocation path, records the retribution attempt and broadcasts at
//! high priority.

use std::sync::Arc;

use amplify::Wrapper;
use bitcoin::{
    EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence,
    Transaction, TxIn, TxOut, Witness,
};
use bitcoin_scripts::WitnessScript;
use lnwire::ChannelId;
use secp256k1::PublicKey;

use super::resolvers::SweepClaim;
use crate::chain::{ChainError, ChainWatcher};
use crate::channel::bolt::htlc::ScriptGenerators as HtlcScripts;
use crate::channel::bolt::{
    derive_pubkey, derive_revocation_pubkey, HtlcDirection,
    RevokedCommitment, ScriptGenerators as CommitScripts,
};
use crate::persist::{Bucket, Store, StoreError, StoreExt};
use crate::sweep::WitnessElement;
use crate::wallet::{
    ChannelSigner, KeyFamily, KeyLocator, SignDescriptor, SignError,
};

/// Weight estimate of a justice transaction input (revocation path spend)
const JUSTICE_INPUT_WEIGHT: u64 = 400;

/// Relay fee multiplier for justice transactions: confirmation races the
/// counterparty's CSV delay, so the fee is never the bottleneck
const JUSTICE_FEE_MULTIPLIER: u64 = 10;

/// Breach handling errors
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum BreachError {
    /// the spending transaction does not contain any recognizable output
    /// of the revoked commitment
    NothingToClaim,

    /// signing of the justice transaction failed: {0}
    #[from]
    Sign(SignError),

    /// persistence of the retribution record failed: {0}
    #[from]
    Store(StoreError),

    /// justice transaction broadcast failed: {0}
    #[from]
    Chain(ChainError),
}

/// Static channel keys the justice construction needs
#[derive(Clone, Debug)]
pub struct BreachKeys {
    /// Our revocation basepoint (the revoked commitment committed to it)
    pub local_revocation_basepoint: PublicKey,

    /// Remote delayed-payment basepoint (their `to_local` key source)
    pub remote_delayed_basepoint: PublicKey,

    /// Remote HTLC basepoint
    pub remote_htlc_basepoint: PublicKey,

    /// Our HTLC basepoint
    pub local_htlc_basepoint: PublicKey,

    /// The CSV delay imposed on the remote commitment outputs
    pub to_self_delay: u16,
}

/// Durable record of an in-progress retribution, written before the
/// justice broadcast so recovery is idempotent across restarts
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct RetributionRecord {
    pub channel_id: ChannelId,
    pub breach_height: u64,
    pub breach_txid: bitcoin::Txid,
    pub justice_txid: bitcoin::Txid,
    pub claimed_value: u64,
}

/// The breach arbiter
pub struct BreachArbiter {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainWatcher>,
    signer: Arc<dyn ChannelSigner>,
    /// Destination of the penalty funds
    sweep_script: Script,
    feerate_per_kw: u32,
}

impl BreachArbiter {
    pub fn with(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainWatcher>,
        signer: Arc<dyn ChannelSigner>,
        sweep_script: Script,
        feerate_per_kw: u32,
    ) -> BreachArbiter {
        BreachArbiter {
            store,
            chain,
            signer,
            sweep_script,
            feerate_per_kw,
        }
    }

    /// Identifies the claims available within a broadcast revoked
    /// commitment: the remote `to_local` output plus every HTLC output,
    /// all through the revocation path.
    pub fn identify_claims(
        &self,
        revoked: &RevokedCommitment,
        keys: &BreachKeys,
        breach_tx: &Transaction,
    ) -> Vec<SweepClaim> {
        let per_commitment_point = revoked.per_commitment_point;
        let revocation_pubkey = derive_revocation_pubkey(
            keys.local_revocation_basepoint,
            per_commitment_point,
        );
        let remote_delayed =
            derive_pubkey(keys.remote_delayed_basepoint, per_commitment_point);
        let remote_htlc =
            derive_pubkey(keys.remote_htlc_basepoint, per_commitment_point);
        let local_htlc =
            derive_pubkey(keys.local_htlc_basepoint, per_commitment_point);

        let breach_txid = breach_tx.txid();
        let mut claims = vec![];

        // Their to_local output: revocation branch of the delayed script
        let to_local_script = <WitnessScript as CommitScripts>::ln_to_local(
            0,
            revocation_pubkey,
            remote_delayed,
            keys.to_self_delay,
        );
        self.match_output(
            breach_tx,
            breach_txid,
            &to_local_script,
            // IF-branch: signature, OP_TRUE selector, script
            vec![
                WitnessElement::Signature,
                WitnessElement::Data(vec![0x01]),
                WitnessElement::Data(to_local_script.to_inner().to_bytes()),
            ],
            revoked,
            &mut claims,
        );

        // Every HTLC output of the revoked commitment; directions are
        // relative to the remote (the commitment owner)
        for htlc in &revoked.htlcs {
            let witness_script = match htlc.direction {
                HtlcDirection::Offered => {
                    <WitnessScript as HtlcScripts>::ln_offered_htlc(
                        htlc.amount_msat / 1000,
                        revocation_pubkey,
                        remote_htlc,
                        local_htlc,
                        htlc.payment_hash,
                    )
                }
                HtlcDirection::Received => {
                    <WitnessScript as HtlcScripts>::ln_received_htlc(
                        htlc.amount_msat / 1000,
                        revocation_pubkey,
                        remote_htlc,
                        local_htlc,
                        htlc.cltv_expiry,
                        htlc.payment_hash,
                    )
                }
            };
            self.match_output(
                breach_tx,
                breach_txid,
                &witness_script,
                // HTLC revocation path: signature, revocation key, script
                vec![
                    WitnessElement::Signature,
                    WitnessElement::Data(
                        revocation_pubkey.serialize().to_vec(),
                    ),
                    WitnessElement::Data(
                        witness_script.to_inner().to_bytes(),
                    ),
                ],
                revoked,
                &mut claims,
            );
        }

        claims
    }

    fn match_output(
        &self,
        breach_tx: &Transaction,
        breach_txid: bitcoin::Txid,
        witness_script: &WitnessScript,
        witness_template: Vec<WitnessElement>,
        revoked: &RevokedCommitment,
        claims: &mut Vec<SweepClaim>,
    ) {
        let script_pubkey = witness_script.clone().to_p2wsh();
        for (vout, output) in breach_tx.output.iter().enumerate() {
            if output.script_pubkey == script_pubkey.clone().into_inner() {
                claims.push(SweepClaim {
                    outpoint: OutPoint::new(breach_txid, vout as u32),
                    amount: output.value,
                    spent_output: output.clone(),
                    descriptor: SignDescriptor {
                        key_loc: KeyLocator {
                            family: KeyFamily::RevocationBase,
                            index: 0,
                        },
                        single_tweak: None,
                        double_tweak: Some(revoked.per_commitment_secret),
                        witness_script: witness_script.to_inner(),
                        amount: output.value,
                        input_index: 0,
                        sighash_type: EcdsaSighashType::All,
                    },
                    witness_template,
                });
                return;
            }
        }
    }

    /// Constructs the signed justice transaction claiming all outputs
    pub fn construct_justice_tx(
        &self,
        claims: &[SweepClaim],
    ) -> Result<Transaction, BreachError> {
        if claims.is_empty() {
            return Err(BreachError::NothingToClaim);
        }
        let total: u64 = claims.iter().map(|claim| claim.amount).sum();
        let weight = 400 + JUSTICE_INPUT_WEIGHT * claims.len() as u64;
        let fee = weight * self.feerate_per_kw as u64
            * JUSTICE_FEE_MULTIPLIER
            / 1000;
        let value = total.saturating_sub(fee);
        if value == 0 {
            return Err(BreachError::NothingToClaim);
        }

        let mut tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: claims
                .iter()
                .map(|claim| TxIn {
                    previous_output: claim.outpoint,
                    script_sig: none!(),
                    sequence: Sequence(0xFFFF_FFFD),
                    witness: empty!(),
                })
                .collect(),
            output: vec![TxOut {
                value,
                script_pubkey: self.sweep_script.clone(),
            }],
        };

        for (index, claim) in claims.iter().enumerate() {
            let mut descriptor = claim.descriptor.clone();
            descriptor.input_index = index;
            let signature = self.signer.sign_sweep(
                &tx,
                &claim.spent_output,
                &descriptor,
            )?;
            let mut element = signature.serialize_der().to_vec();
            element.push(EcdsaSighashType::All as u8);
            let witness: Vec<Vec<u8>> = claim
                .witness_template
                .iter()
                .map(|part| match part {
                    WitnessElement::Signature => element.clone(),
                    WitnessElement::Preimage => vec![],
                    WitnessElement::Data(data) => data.clone(),
                })
                .collect();
            tx.input[index].witness = Witness::from_vec(witness);
        }
        Ok(tx)
    }

    /// Full breach response: identify claims, persist the retribution
    /// record, then broadcast the justice transaction.
    pub async fn punish(
        &self,
        channel_id: ChannelId,
        revoked: &RevokedCommitment,
        keys: &BreachKeys,
        breach_tx: &Transaction,
    ) -> Result<RetributionRecord, BreachError> {
        let claims = self.identify_claims(revoked, keys, breach_tx);
        let justice_tx = self.construct_justice_tx(&claims)?;

        let record = RetributionRecord {
            channel_id,
            breach_height: revoked.height,
            breach_txid: breach_tx.txid(),
            justice_txid: justice_tx.txid(),
            claimed_value: claims.iter().map(|claim| claim.amount).sum(),
        };
        // The record goes to disk before the broadcast so a crash between
        // the two re-runs the same (idempotent) response
        let mut key = channel_id.as_slice32().to_inner().to_vec();
        key.extend(b"/justice");
        self.store.put_value(Bucket::Retribution, &key, &record)?;

        warn!(
            "breach on channel {}: claiming {} sat from revoked commitment \
             {} with justice tx {}",
            channel_id,
            record.claimed_value,
            revoked.height,
            record.justice_txid
        );
        self.chain.publish(justice_tx, "justice").await?;
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use amplify::Slice32;
    use bitcoin_scripts::hlc::{HashLock, HashPreimage};
    use secp256k1::{SecretKey, SECP256K1};

    use super::*;
    use crate::chain::{
        BlockEpoch, ConfirmationEvent, SpendEvent, Subscription,
    };
    use crate::channel::bolt::StagedHtlc;
    use crate::persist::MemoryStore;
    use crate::shachain::ShaChainProducer;
    use crate::wallet::MemoryChannelSigner;

    struct NoChain;
    #[async_trait::async_trait]
    impl ChainWatcher for NoChain {
        async fn register_block_epochs(
            &self,
        ) -> Result<Subscription<BlockEpoch>, ChainError> {
            let (subscription, _tx, _cancel) = Subscription::channel(1);
            Ok(subscription)
        }
        async fn register_confirmation(
            &self,
            _txid: bitcoin::Txid,
            _script: Script,
            _num_confs: u32,
            _start_height: u32,
        ) -> Result<Subscription<ConfirmationEvent>, ChainError> {
            let (subscription, _tx, _cancel) = Subscription::channel(1);
            Ok(subscription)
        }
        async fn register_spend(
            &self,
            _outpoint: OutPoint,
            _script: Script,
            _start_height: u32,
        ) -> Result<Subscription<SpendEvent>, ChainError> {
            let (subscription, _tx, _cancel) = Subscription::channel(1);
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

    fn keys_and_revoked() -> (BreachKeys, RevokedCommitment, MemoryChannelSigner)
    {
        let signer = MemoryChannelSigner::with(
            SecretKey::from_slice(&[1u8; 32]).unwrap(),
            SecretKey::from_slice(&[2u8; 32]).unwrap(),
            SecretKey::from_slice(&[3u8; 32]).unwrap(),
            SecretKey::from_slice(&[4u8; 32]).unwrap(),
            SecretKey::from_slice(&[5u8; 32]).unwrap(),
        );
        let producer =
            ShaChainProducer::with(Slice32::from_inner([7u8; 32]));
        let secret = producer.secret_key_at(5);
        let point = producer.point_at(5);
        let basepoints = signer.basepoints();
        let keys = BreachKeys {
            local_revocation_basepoint: basepoints[3],
            remote_delayed_basepoint: dumb_pubkey!(),
            remote_htlc_basepoint: dumb_pubkey!(),
            local_htlc_basepoint: basepoints[4],
            to_self_delay: 144,
        };
        let revoked = RevokedCommitment {
            height: 5,
            txid: None,
            per_commitment_secret: secret,
            per_commitment_point: point,
            to_local_msat: 400_000_000,
            to_remote_msat: 600_000_000,
            htlcs: vec![StagedHtlc {
                id: 0,
                direction: HtlcDirection::Offered,
                amount_msat: 100_000_000,
                payment_hash: HashLock::from(HashPreimage::random()),
                cltv_expiry: 500_040,
            }],
        };
        (keys, revoked, signer)
    }

    fn breach_tx(
        keys: &BreachKeys,
        revoked: &RevokedCommitment,
    ) -> Transaction {
        let revocation_pubkey = derive_revocation_pubkey(
            keys.local_revocation_basepoint,
            revoked.per_commitment_point,
        );
        let remote_delayed = derive_pubkey(
            keys.remote_delayed_basepoint,
            revoked.per_commitment_point,
        );
        let remote_htlc = derive_pubkey(
            keys.remote_htlc_basepoint,
            revoked.per_commitment_point,
        );
        let local_htlc = derive_pubkey(
            keys.local_htlc_basepoint,
            revoked.per_commitment_point,
        );
        let to_local = <WitnessScript as CommitScripts>::ln_to_local(
            0,
            revocation_pubkey,
            remote_delayed,
            keys.to_self_delay,
        );
        let htlc = &revoked.htlcs[0];
        let htlc_script = <WitnessScript as HtlcScripts>::ln_offered_htlc(
            htlc.amount_msat / 1000,
            revocation_pubkey,
            remote_htlc,
            local_htlc,
            htlc.payment_hash,
        );
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![],
            output: vec![
                TxOut {
                    value: revoked.to_local_msat / 1000,
                    script_pubkey: to_local.to_p2wsh().into_inner(),
                },
                TxOut {
                    value: htlc.amount_msat / 1000,
                    script_pubkey: htlc_script.to_p2wsh().into_inner(),
                },
                TxOut {
                    // Our own to_remote output; not claimable via penalty
                    value: revoked.to_remote_msat / 1000,
                    script_pubkey: Script::new(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn justice_claims_all_revoked_outputs() {
        let (keys, revoked, signer) = keys_and_revoked();
        let tx = breach_tx(&keys, &revoked);
        let store = Arc::new(MemoryStore::new());
        let arbiter = BreachArbiter::with(
            store.clone(),
            Arc::new(NoChain),
            Arc::new(signer),
            Script::new(),
            253,
        );

        let claims = arbiter.identify_claims(&revoked, &keys, &tx);
        // to_local plus one HTLC output; our own to_remote stays untouched
        assert_eq!(claims.len(), 2);

        let record = arbiter
            .punish(ChannelId::default(), &revoked, &keys, &tx)
            .await
            .unwrap();
        assert_eq!(
            record.claimed_value,
            revoked.to_local_msat / 1000 + 100_000
        );
        assert_eq!(record.breach_height, 5);

        // Idempotence: the retribution record survives for recovery
        let mut key =
            ChannelId::default().as_slice32().to_inner().to_vec();
        key.extend(b"/justice");
        let restored: RetributionRecord = store
            .get_value(Bucket::Retribution, &key)
            .unwrap()
            .expect("record must persist");
        assert_eq!(restored, record);
    }

    #[test]
    fn revocation_key_reconstruction_matches() {
        let (keys, revoked, signer) = keys_and_revoked();
        let reconstructed =
            signer.revocation_seckey(revoked.per_commitment_secret);
        let expected = derive_revocation_pubkey(
            keys.local_revocation_basepoint,
            revoked.per_commitment_point,
        );
        assert_eq!(
            PublicKey::from_secret_key(SECP256K1, &reconstructed),
            expected
        );
    }
}
