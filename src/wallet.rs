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

//! Wallet collaboration seam.
//!
//! The node core never touches on-chain funds directly: key derivation,
//! signing and UTXO management are delegated through the traits below. An
//! in-memory signer is provided for channel operation and tests; production
//! nodes back these traits with their wallet of choice.

use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, Script, Transaction, TxOut};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::channel::bolt::{derive_revocation_seckey, derive_seckey};

/// Families of keys derived for channel operation, one branch per purpose
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
#[repr(u8)]
pub enum KeyFamily {
    /// 2-of-2 funding multisig keys
    #[display("multisig")]
    Multisig = 0,

    /// Revocation base keys
    #[display("revocation-base")]
    RevocationBase = 1,

    /// HTLC base keys
    #[display("htlc-base")]
    HtlcBase = 2,

    /// Payment base keys
    #[display("payment-base")]
    PaymentBase = 3,

    /// Delayed payment base keys
    #[display("delay-base")]
    DelayBase = 4,

    /// Per-channel shachain seeds
    #[display("revocation-root")]
    RevocationRoot = 5,

    /// The static node identity key
    #[display("node-key")]
    NodeKey = 6,
}

/// Locator of a derived key within the wallet key tree
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
#[display("{family}/{index}")]
pub struct KeyLocator {
    pub family: KeyFamily,
    pub index: u32,
}

/// Instructions for producing one input signature: which key, which tweaks,
/// what script and value are being spent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignDescriptor {
    /// Key to sign with
    pub key_loc: KeyLocator,

    /// Per-commitment point for the BOLT-3 additive key tweak, when the
    /// spent output uses a tweaked key
    pub single_tweak: Option<PublicKey>,

    /// Per-commitment secret for the revocation-key derivation, when
    /// spending through the penalty path
    pub double_tweak: Option<SecretKey>,

    /// Witness script of the spent output
    pub witness_script: Script,

    /// Value of the spent output
    pub amount: u64,

    /// Index of the input being signed
    pub input_index: usize,

    /// Sighash flag to commit to
    pub sighash_type: EcdsaSighashType,
}

/// Signing errors
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum SignError {
    /// input #{0} which has to be signed is not present in the transaction
    NoSuchInput(usize),

    /// input #{0} does not provide the witness UTXO or witness script
    /// information required for signing
    IncompleteInput(usize),

    /// the wallet has no private key for {0}
    KeyNotFound(KeyLocator),

    /// sighash computation error: {0}
    SighashError(String),
}

/// Computes the BIP-143 sighash for a PSBT input using its witness UTXO and
/// witness script
pub fn segwit_sighash(
    psbt: &Psbt,
    input_index: usize,
) -> Result<Message, SignError> {
    let input = psbt
        .inputs
        .get(input_index)
        .ok_or(SignError::NoSuchInput(input_index))?;
    let witness_utxo = input
        .witness_utxo
        .as_ref()
        .ok_or(SignError::IncompleteInput(input_index))?;
    let witness_script = input
        .witness_script
        .as_ref()
        .ok_or(SignError::IncompleteInput(input_index))?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = cache
        .segwit_signature_hash(
            input_index,
            witness_script,
            witness_utxo.value,
            EcdsaSighashType::All,
        )
        .map_err(|err| SignError::SighashError(err.to_string()))?;
    Ok(Message::from_slice(sighash.as_ref())
        .expect("sighash is a valid 32-byte message"))
}

/// Computes the BIP-143 sighash over a raw transaction input spending the
/// given output
pub fn segwit_sighash_raw(
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    spent: &TxOut,
    sighash_type: EcdsaSighashType,
) -> Result<Message, SignError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .segwit_signature_hash(
            input_index,
            witness_script,
            spent.value,
            sighash_type,
        )
        .map_err(|err| SignError::SighashError(err.to_string()))?;
    Ok(Message::from_slice(sighash.as_ref())
        .expect("sighash is a valid 32-byte message"))
}

/// Per-channel signing capability handed to the channel state machine.
///
/// Signatures are deterministic (RFC 6979), which the re-establishment
/// protocol relies upon: retransmitting a `commitment_signed` must produce
/// byte-identical signatures.
pub trait ChannelSigner: Send {
    /// Public key of the local side of the funding multisig
    fn funding_pubkey(&self) -> PublicKey;

    /// Signs the commitment transaction input 0 with the funding key
    fn sign_commitment(&self, psbt: &Psbt) -> Result<Signature, SignError>;

    /// Signs a second-stage HTLC transaction with the local HTLC key tweaked
    /// by the given per-commitment point
    fn sign_htlc(
        &self,
        psbt: &Psbt,
        per_commitment_point: PublicKey,
    ) -> Result<Signature, SignError>;

    /// Signs a sweep transaction input according to the descriptor
    fn sign_sweep(
        &self,
        tx: &Transaction,
        spent: &TxOut,
        descriptor: &SignDescriptor,
    ) -> Result<Signature, SignError>;

    /// Reconstructs the revocation private key for a revoked remote
    /// commitment from its disclosed per-commitment secret
    fn revocation_seckey(
        &self,
        per_commitment_secret: SecretKey,
    ) -> SecretKey;
}

/// In-memory channel signer keeping all base secrets in process memory.
#[derive(Clone, Debug)]
pub struct MemoryChannelSigner {
    funding_key: SecretKey,
    payment_base: SecretKey,
    delayed_base: SecretKey,
    revocation_base: SecretKey,
    htlc_base: SecretKey,
}

impl MemoryChannelSigner {
    /// Constructs signer from the five channel base secrets
    pub fn with(
        funding_key: SecretKey,
        payment_base: SecretKey,
        delayed_base: SecretKey,
        revocation_base: SecretKey,
        htlc_base: SecretKey,
    ) -> MemoryChannelSigner {
        MemoryChannelSigner {
            funding_key,
            payment_base,
            delayed_base,
            revocation_base,
            htlc_base,
        }
    }

    /// Public basepoints matching the held secrets, in the order expected by
    /// `open_channel` composition: funding, payment, delayed, revocation,
    /// HTLC
    pub fn basepoints(&self) -> [PublicKey; 5] {
        [
            PublicKey::from_secret_key(SECP256K1, &self.funding_key),
            PublicKey::from_secret_key(SECP256K1, &self.payment_base),
            PublicKey::from_secret_key(SECP256K1, &self.delayed_base),
            PublicKey::from_secret_key(SECP256K1, &self.revocation_base),
            PublicKey::from_secret_key(SECP256K1, &self.htlc_base),
        ]
    }

    /// Base secret for the given key family
    pub fn base_secret(&self, family: KeyFamily) -> Option<SecretKey> {
        match family {
            KeyFamily::Multisig => Some(self.funding_key),
            KeyFamily::PaymentBase => Some(self.payment_base),
            KeyFamily::DelayBase => Some(self.delayed_base),
            KeyFamily::RevocationBase => Some(self.revocation_base),
            KeyFamily::HtlcBase => Some(self.htlc_base),
            _ => None,
        }
    }
}

impl ChannelSigner for MemoryChannelSigner {
    fn funding_pubkey(&self) -> PublicKey {
        PublicKey::from_secret_key(SECP256K1, &self.funding_key)
    }

    fn sign_commitment(&self, psbt: &Psbt) -> Result<Signature, SignError> {
        let sighash = segwit_sighash(psbt, 0)?;
        Ok(SECP256K1.sign_ecdsa(&sighash, &self.funding_key))
    }

    fn sign_htlc(
        &self,
        psbt: &Psbt,
        per_commitment_point: PublicKey,
    ) -> Result<Signature, SignError> {
        let sighash = segwit_sighash(psbt, 0)?;
        let htlc_key = derive_seckey(self.htlc_base, per_commitment_point);
        Ok(SECP256K1.sign_ecdsa(&sighash, &htlc_key))
    }

    fn sign_sweep(
        &self,
        tx: &Transaction,
        spent: &TxOut,
        descriptor: &SignDescriptor,
    ) -> Result<Signature, SignError> {
        let base = self
            .base_secret(descriptor.key_loc.family)
            .ok_or(SignError::KeyNotFound(descriptor.key_loc))?;
        let key = if let Some(secret) = descriptor.double_tweak {
            self.revocation_seckey(secret)
        } else if let Some(point) = descriptor.single_tweak {
            derive_seckey(base, point)
        } else {
            base
        };
        let sighash = segwit_sighash_raw(
            tx,
            descriptor.input_index,
            &descriptor.witness_script,
            spent,
            descriptor.sighash_type,
        )?;
        Ok(SECP256K1.sign_ecdsa(&sighash, &key))
    }

    fn revocation_seckey(
        &self,
        per_commitment_secret: SecretKey,
    ) -> SecretKey {
        derive_revocation_seckey(self.revocation_base, per_commitment_secret)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn signer() -> MemoryChannelSigner {
        MemoryChannelSigner::with(
            SecretKey::from_slice(&[1u8; 32]).unwrap(),
            SecretKey::from_slice(&[2u8; 32]).unwrap(),
            SecretKey::from_slice(&[3u8; 32]).unwrap(),
            SecretKey::from_slice(&[4u8; 32]).unwrap(),
            SecretKey::from_slice(&[5u8; 32]).unwrap(),
        )
    }

    #[test]
    fn deterministic_commitment_signatures() {
        use bitcoin::{OutPoint, PackedLockTime, Sequence, TxIn};

        let witness_script = Script::from(vec![0x51]);
        let tx = Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Script::new(),
                sequence: Sequence(0xFFFF_FFFF),
                witness: Default::default(),
            }],
            output: vec![TxOut {
                value: 90_000,
                script_pubkey: Script::new(),
            }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: 100_000,
            script_pubkey: witness_script.to_v0_p2wsh(),
        });
        psbt.inputs[0].witness_script = Some(witness_script);

        let signer = signer();
        let sig1 = signer.sign_commitment(&psbt).unwrap();
        let sig2 = signer.sign_commitment(&psbt).unwrap();
        // RFC 6979 determinism underpins idempotent retransmission
        assert_eq!(sig1, sig2);

        let sighash = segwit_sighash(&psbt, 0).unwrap();
        assert!(SECP256K1
            .verify_ecdsa(&sighash, &sig1, &signer.funding_pubkey())
            .is_ok());
    }

    #[test]
    fn incomplete_input_rejected() {
        let tx = Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![],
        };
        let psbt = Psbt::from_unsigned_tx(tx).unwrap();
        assert_eq!(
            segwit_sighash(&psbt, 0),
            Err(SignError::NoSuchInput(0))
        );
    }
}
