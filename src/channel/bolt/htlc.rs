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

//! HTLC channel extension: renders HTLC outputs of a commitment transaction
//! and the matching second-stage HTLC-success/HTLC-timeout transactions.

use amplify::Wrapper;
use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script;
use bitcoin::hashes::{ripemd160, Hash};
use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
use bitcoin::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin_scripts::hlc::HashLock;
use bitcoin_scripts::{LockScript, PubkeyScript, WitnessScript};
use secp256k1::PublicKey;

use super::keyset::{derive_pubkey, derive_revocation_pubkey};
use super::{
    BoltExt, ChannelState, CommitmentView, Error, HtlcDirection, PeerParams,
    TxType, UpdateMsg,
};
use crate::channel::bip69::ln_htlc_expiry_key;
use crate::channel::{ChannelExtension, Extension, GraphTx, TxGraph};

/// Weight of the commitment transaction base, BOLT-3
pub const COMMITMENT_TX_WEIGHT: u64 = 724;
/// Weight added to the commitment transaction per untrimmed HTLC, BOLT-3
pub const HTLC_OUTPUT_WEIGHT: u64 = 172;
/// Weight of the HTLC-timeout transaction, BOLT-3
pub const HTLC_TIMEOUT_WEIGHT: u64 = 663;
/// Weight of the HTLC-success transaction, BOLT-3
pub const HTLC_SUCCESS_WEIGHT: u64 = 703;

/// Fee of the second-stage HTLC-timeout transaction at the given rate
#[inline]
pub fn htlc_timeout_fee(feerate_per_kw: u32) -> u64 {
    HTLC_TIMEOUT_WEIGHT * feerate_per_kw as u64 / 1000
}

/// Fee of the second-stage HTLC-success transaction at the given rate
#[inline]
pub fn htlc_success_fee(feerate_per_kw: u32) -> u64 {
    HTLC_SUCCESS_WEIGHT * feerate_per_kw as u64 / 1000
}

/// Commitment transaction fee for the given rate and number of untrimmed
/// HTLCs; paid by the channel initiator
#[inline]
pub fn commitment_fee(feerate_per_kw: u32, untrimmed_htlcs: usize) -> u64 {
    (COMMITMENT_TX_WEIGHT + HTLC_OUTPUT_WEIGHT * untrimmed_htlcs as u64)
        * feerate_per_kw as u64
        / 1000
}

/// Dust threshold of an HTLC output on a commitment: the owner's dust limit
/// plus the fee of the second-stage transaction which would spend it
pub fn htlc_dust_threshold(
    direction: HtlcDirection,
    dust_limit: u64,
    feerate_per_kw: u32,
) -> u64 {
    match direction {
        HtlcDirection::Offered => dust_limit + htlc_timeout_fee(feerate_per_kw),
        HtlcDirection::Received => {
            dust_limit + htlc_success_fee(feerate_per_kw)
        }
    }
}

/// HTLC channel extension.
///
/// Keeps the static key material needed for rendering HTLC outputs and the
/// commitment view staged by the channel core for the commitment being
/// constructed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Htlc {
    staged: Option<CommitmentView>,

    local_params: PeerParams,
    remote_params: PeerParams,

    local_htlc_basepoint: PublicKey,
    remote_htlc_basepoint: PublicKey,
    local_revocation_basepoint: PublicKey,
    remote_revocation_basepoint: PublicKey,
    local_delayed_basepoint: PublicKey,
    remote_delayed_basepoint: PublicKey,
}

impl Default for Htlc {
    fn default() -> Self {
        Htlc {
            staged: None,
            local_params: Default::default(),
            remote_params: Default::default(),
            local_htlc_basepoint: dumb_pubkey!(),
            remote_htlc_basepoint: dumb_pubkey!(),
            local_revocation_basepoint: dumb_pubkey!(),
            remote_revocation_basepoint: dumb_pubkey!(),
            local_delayed_basepoint: dumb_pubkey!(),
            remote_delayed_basepoint: dumb_pubkey!(),
        }
    }
}

impl Extension<BoltExt> for Htlc {
    fn identity(&self) -> BoltExt {
        BoltExt::Htlc
    }

    fn update_from_peer(
        &mut self,
        message: &lnwire::Messages,
    ) -> Result<(), Error> {
        // Protocol validation of HTLC updates happens in the channel core
        // which owns the update log; here we only track the negotiated key
        // material.
        match message {
            lnwire::Messages::OpenChannel(open_channel) => {
                self.remote_htlc_basepoint = open_channel.htlc_basepoint;
                self.remote_revocation_basepoint =
                    open_channel.revocation_basepoint;
                self.remote_delayed_basepoint =
                    open_channel.delayed_payment_basepoint;
            }
            lnwire::Messages::AcceptChannel(accept_channel) => {
                self.remote_htlc_basepoint = accept_channel.htlc_basepoint;
                self.remote_revocation_basepoint =
                    accept_channel.revocation_basepoint;
                self.remote_delayed_basepoint =
                    accept_channel.delayed_payment_basepoint;
            }
            _ => {}
        }
        Ok(())
    }

    fn update_from_local(&mut self, message: &UpdateMsg) -> Result<(), Error> {
        match message {
            UpdateMsg::Stage(view) => {
                self.staged = Some(view.clone());
            }
        }
        Ok(())
    }

    fn load_state(&mut self, state: &ChannelState) {
        self.local_params = state.local_params;
        self.remote_params = state.remote_params;
        self.local_htlc_basepoint = state.local_keys.htlc_basepoint.key;
        self.remote_htlc_basepoint = state.remote_keys.htlc_basepoint;
        self.local_revocation_basepoint =
            state.local_keys.revocation_basepoint.key;
        self.remote_revocation_basepoint =
            state.remote_keys.revocation_basepoint;
        self.local_delayed_basepoint =
            state.local_keys.delayed_payment_basepoint.key;
        self.remote_delayed_basepoint =
            state.remote_keys.delayed_payment_basepoint;
        self.staged = None;
    }

    fn store_state(&self, _state: &mut ChannelState) {
        // The extension holds no authoritative state: the update log inside
        // the channel core is the source of truth for HTLCs, and the staged
        // view is transient.
    }
}

impl ChannelExtension<BoltExt> for Htlc {
    #[inline]
    fn new() -> Box<dyn ChannelExtension<BoltExt>>
    where
        Self: Sized,
    {
        Box::new(Htlc::default())
    }

    fn build_graph(
        &self,
        tx_graph: &mut TxGraph,
        as_remote_node: bool,
    ) -> Result<(), Error> {
        let view = match &self.staged {
            Some(view) if view.as_remote_node == as_remote_node => view,
            // Nothing staged for this side: commitment carries no HTLCs
            _ => return Ok(()),
        };

        let per_commitment_point = view.per_commitment_point;

        // Keys of the commitment owner
        let (owner_htlc_base, counter_htlc_base, counter_revocation_base) =
            if as_remote_node {
                (
                    self.remote_htlc_basepoint,
                    self.local_htlc_basepoint,
                    self.local_revocation_basepoint,
                )
            } else {
                (
                    self.local_htlc_basepoint,
                    self.remote_htlc_basepoint,
                    self.remote_revocation_basepoint,
                )
            };
        let owner_delayed_base = if as_remote_node {
            self.remote_delayed_basepoint
        } else {
            self.local_delayed_basepoint
        };
        let dust_limit = if as_remote_node {
            self.remote_params.dust_limit_satoshis
        } else {
            self.local_params.dust_limit_satoshis
        };
        let to_self_delay = if as_remote_node {
            self.local_params.to_self_delay
        } else {
            self.remote_params.to_self_delay
        };

        let revocation_pubkey = derive_revocation_pubkey(
            counter_revocation_base,
            per_commitment_point,
        );
        let owner_htlc_pubkey =
            derive_pubkey(owner_htlc_base, per_commitment_point);
        let counter_htlc_pubkey =
            derive_pubkey(counter_htlc_base, per_commitment_point);
        let owner_delayed_pubkey =
            derive_pubkey(owner_delayed_base, per_commitment_point);

        for htlc in &view.htlcs {
            let amount_sat = htlc.amount_msat / 1000;
            if amount_sat
                < htlc_dust_threshold(
                    htlc.direction,
                    dust_limit,
                    view.feerate_per_kw,
                )
            {
                // Trimmed: the value accrues to the miner fee
                continue;
            }

            let witness_script = match htlc.direction {
                HtlcDirection::Offered => WitnessScript::ln_offered_htlc(
                    amount_sat,
                    revocation_pubkey,
                    owner_htlc_pubkey,
                    counter_htlc_pubkey,
                    htlc.payment_hash,
                ),
                HtlcDirection::Received => WitnessScript::ln_received_htlc(
                    amount_sat,
                    revocation_pubkey,
                    owner_htlc_pubkey,
                    counter_htlc_pubkey,
                    htlc.cltv_expiry,
                    htlc.payment_hash,
                ),
            };
            let script_pubkey: PubkeyScript = witness_script.to_p2wsh();
            let txout = TxOut {
                value: amount_sat,
                script_pubkey: script_pubkey.clone().into(),
            };
            let mut psbt_out = bitcoin::util::psbt::Output::default();
            psbt_out.witness_script = Some(witness_script.to_inner());
            psbt_out.proprietary.insert(
                ln_htlc_expiry_key(),
                htlc.cltv_expiry.to_be_bytes().to_vec(),
            );
            tx_graph.cmt_outs.push((txout, psbt_out));

            // Second-stage transaction claiming the HTLC output
            let (tx_type, locktime, fee) = match htlc.direction {
                HtlcDirection::Offered => (
                    TxType::HtlcTimeout,
                    htlc.cltv_expiry,
                    htlc_timeout_fee(view.feerate_per_kw),
                ),
                HtlcDirection::Received => {
                    (TxType::HtlcSuccess, 0, htlc_success_fee(view.feerate_per_kw))
                }
            };
            let second_stage = Psbt::ln_htlc(
                amount_sat.saturating_sub(fee),
                OutPoint::null(),
                locktime,
                revocation_pubkey,
                owner_delayed_pubkey,
                to_self_delay,
            );
            let mut second_stage = second_stage;
            // The witness script of the *spent* output is needed to sign
            // the second-stage input
            second_stage.inputs[0].witness_script =
                Some(witness_script.to_inner());
            tx_graph.insert_tx(tx_type, htlc.id, GraphTx {
                psbt: second_stage,
                spends: script_pubkey.into(),
            });
        }

        Ok(())
    }
}

pub trait ScriptGenerators {
    fn ln_offered_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self;

    fn ln_received_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self;

    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;
}

impl ScriptGenerators for LockScript {
    fn ln_offered_htlc(
        _: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(
                &bitcoin::PublicKey::new(revocationpubkey).pubkey_hash(),
            )
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&bitcoin::PublicKey::new(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_NOTIF)
            .push_opcode(OP_DROP)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&bitcoin::PublicKey::new(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_HASH160)
            .push_slice(&ripemd160::Hash::hash(payment_hash.as_ref()))
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
            .into()
    }

    fn ln_received_htlc(
        _: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        script::Builder::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(
                &bitcoin::PublicKey::new(revocationpubkey).pubkey_hash(),
            )
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_key(&bitcoin::PublicKey::new(remote_htlcpubkey))
            .push_opcode(OP_SWAP)
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(&ripemd160::Hash::hash(payment_hash.as_ref()))
            .push_opcode(OP_EQUALVERIFY)
            .push_int(2)
            .push_opcode(OP_SWAP)
            .push_key(&bitcoin::PublicKey::new(local_htlcpubkey))
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(cltv_expiry as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_ENDIF)
            .into_script()
            .into()
    }

    fn ln_htlc_output(
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
}

impl ScriptGenerators for WitnessScript {
    #[inline]
    fn ln_offered_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        LockScript::ln_offered_htlc(
            amount,
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
        )
        .into()
    }

    #[inline]
    fn ln_received_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        LockScript::ln_received_htlc(
            amount,
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            cltv_expiry,
            payment_hash,
        )
        .into()
    }

    #[inline]
    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        LockScript::ln_htlc_output(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .into()
    }
}

impl ScriptGenerators for PubkeyScript {
    #[inline]
    fn ln_offered_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        WitnessScript::ln_offered_htlc(
            amount,
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
        )
        .to_p2wsh()
        .into()
    }

    #[inline]
    fn ln_received_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        WitnessScript::ln_received_htlc(
            amount,
            revocationpubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            cltv_expiry,
            payment_hash,
        )
        .to_p2wsh()
        .into()
    }

    #[inline]
    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        WitnessScript::ln_htlc_output(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        )
        .to_p2wsh()
        .into()
    }
}

impl ScriptGenerators for TxOut {
    #[inline]
    fn ln_offered_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: HashLock,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: PubkeyScript::ln_offered_htlc(
                amount,
                revocationpubkey,
                local_htlcpubkey,
                remote_htlcpubkey,
                payment_hash,
            )
            .into(),
        }
    }

    #[inline]
    fn ln_received_htlc(
        amount: u64,
        revocationpubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        cltv_expiry: u32,
        payment_hash: HashLock,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: PubkeyScript::ln_received_htlc(
                amount,
                revocationpubkey,
                local_htlcpubkey,
                remote_htlcpubkey,
                cltv_expiry,
                payment_hash,
            )
            .into(),
        }
    }

    #[inline]
    fn ln_htlc_output(
        amount: u64,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        TxOut {
            value: amount,
            script_pubkey: PubkeyScript::ln_htlc_output(
                amount,
                revocationpubkey,
                local_delayedpubkey,
                to_self_delay,
            )
            .into(),
        }
    }
}

pub trait TxGenerators {
    fn ln_htlc(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self;
}

impl TxGenerators for Transaction {
    /// NB: For HTLC-success transactions always set `cltv_expiry` parameter
    ///     to zero!
    fn ln_htlc(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        let txout = TxOut::ln_htlc_output(
            amount,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        );
        Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(cltv_expiry),
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: none!(),
                sequence: bitcoin::Sequence(0),
                witness: empty!(),
            }],
            output: vec![txout],
        }
    }
}

impl TxGenerators for Psbt {
    fn ln_htlc(
        amount: u64,
        outpoint: OutPoint,
        cltv_expiry: u32,
        revocationpubkey: PublicKey,
        local_delayedpubkey: PublicKey,
        to_self_delay: u16,
    ) -> Self {
        let mut psbt = Psbt::from_unsigned_tx(Transaction::ln_htlc(
            amount,
            outpoint,
            cltv_expiry,
            revocationpubkey,
            local_delayedpubkey,
            to_self_delay,
        ))
        .expect("Tx has empty sigs so PSBT creation does not fail");
        psbt.outputs[0].witness_script = Some(
            WitnessScript::ln_htlc_output(
                amount,
                revocationpubkey,
                local_delayedpubkey,
                to_self_delay,
            )
            .to_inner(),
        );
        psbt
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    macro_rules! pk {
        ($hex:expr) => {
            PublicKey::from_str($hex).unwrap()
        };
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    // Keys from the BOLT-3 appendix C test vectors
    fn local_htlcpubkey() -> PublicKey {
        pk!("030d417a46946384f88d5f3337267c5e579765875dc4daca813e21734b140639e7")
    }

    fn remote_htlcpubkey() -> PublicKey {
        pk!("0394854aa6eab5b2a8122cc726e9dded053a2184d88256816826d6231c068d4a5b")
    }

    fn revocation_pubkey() -> PublicKey {
        pk!("0212a140cd0c6539d07cd08dfe09984dec3251ea808b892efeac3ede9402bf2b19")
    }

    fn payment_hash() -> HashLock {
        HashLock::from_str(
            "0101010101010101010101010101010101010101010101010101010101010101",
        )
        .unwrap()
    }

    #[test]
    fn offered_htlc_script_structure() {
        let script = WitnessScript::ln_offered_htlc(
            0,
            revocation_pubkey(),
            local_htlcpubkey(),
            remote_htlcpubkey(),
            payment_hash(),
        );
        let bytes = script.to_inner().to_bytes();
        // Revocation path: DUP HASH160 <hash160(revocation_pubkey)>
        assert_eq!(&bytes[..3], &[0x76, 0xa9, 0x14]);
        let revocation_hash =
            bitcoin::PublicKey::new(revocation_pubkey()).pubkey_hash();
        assert!(contains(&bytes, revocation_hash.as_ref()));
        // Payment path commits to RIPEMD160 of the 32-byte hash lock
        let rip = ripemd160::Hash::hash(payment_hash().as_ref());
        assert!(contains(&bytes, rip.as_ref()));
        // Both HTLC pubkeys participate in the 2-of-2 timeout path
        assert!(contains(&bytes, &local_htlcpubkey().serialize()));
        assert!(contains(&bytes, &remote_htlcpubkey().serialize()));
    }

    #[test]
    fn received_htlc_script_structure() {
        let script = WitnessScript::ln_received_htlc(
            0,
            revocation_pubkey(),
            local_htlcpubkey(),
            remote_htlcpubkey(),
            500_040,
            payment_hash(),
        );
        let bytes = script.to_inner().to_bytes();
        let rip = ripemd160::Hash::hash(payment_hash().as_ref());
        assert!(contains(&bytes, rip.as_ref()));
        // CLTV branch present
        assert!(bytes.contains(&OP_CLTV.to_u8()));
    }

    #[test]
    fn dust_thresholds() {
        // 6000 sat/kw, offered: 354 + 663*6 = 354 + 3978/... fee = 3978
        assert_eq!(htlc_timeout_fee(6000), 3978);
        assert_eq!(htlc_success_fee(6000), 4218);
        assert_eq!(
            htlc_dust_threshold(HtlcDirection::Offered, 546, 6000),
            546 + 3978
        );
        assert_eq!(
            htlc_dust_threshold(HtlcDirection::Received, 546, 6000),
            546 + 4218
        );
    }

    #[test]
    fn commitment_fee_scales_with_htlcs() {
        assert_eq!(commitment_fee(6000, 0), 724 * 6);
        assert_eq!(commitment_fee(6000, 2), (724 + 2 * 172) * 6);
    }

    #[test]
    fn second_stage_tx_shape() {
        let psbt = Psbt::ln_htlc(
            95_000,
            OutPoint::null(),
            500_040,
            revocation_pubkey(),
            local_htlcpubkey(),
            144,
        );
        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.version, 2);
        assert_eq!(tx.lock_time.0, 500_040);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].sequence, bitcoin::Sequence(0));
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, 95_000);
        assert!(psbt.outputs[0].witness_script.is_some());
    }
}
