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

use std::io::{Read, Write};

use bitcoin::util::psbt::raw::ProprietaryKey;
use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use strict_encoding::{StrictDecode, StrictEncode};

pub const PSBT_LN_PROPRIETARY_PREFIX: &[u8] = b"LN";
pub const PSBT_OUT_LN_CHANNEL_FUNDING: u8 = 0x01;

#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum Error {
    /// no funding output found in the funding transaction. The funding
    /// output must be marked with a proprietary key having "LN" prefix and
    /// 0x01 subtype
    NoFundingOutput,

    /// funding transaction does not contain output #{0} specified as a
    /// funding outpoint
    WrongOutput(u16),
}

/// Information about channel funding
#[derive(Getters, Clone, PartialEq, Debug)]
pub struct Funding {
    /// PSBT containing full information about the funding of the channel.
    ///
    /// Channel is always funded with a single output, that is why we need a
    /// single PSBT. If channel needs to receive more funds, it will require
    /// a new funding transaction to be created, spending the previous
    /// funding transaction output.
    psbt: Psbt,

    // Cached information extracted from PSBT, which is the master data source
    #[getter(as_copy)]
    txid: Txid,

    #[getter(as_copy)]
    output: u16,

    #[getter(as_copy)]
    amount: u64,
}

impl Funding {
    /// Constructs empty funding information. Can be used only during the
    /// initial channel setup.
    #[inline]
    pub fn new() -> Funding {
        let mut psbt = Psbt::from_unsigned_tx(Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: 0,
                script_pubkey: Default::default(),
            }],
        })
        .expect("dumb manual PSBT creation");
        psbt.outputs[0]
            .proprietary
            .insert(ln_channel_funding_key(), vec![]);
        Funding::with(psbt).expect("dumb manual PSBT creation")
    }

    #[inline]
    pub fn with(psbt: Psbt) -> Result<Funding, Error> {
        psbt.extract_channel_funding()
    }

    /// Preliminary funding with the known amount but no final transaction
    /// yet; used between channel negotiation and funding construction.
    #[inline]
    pub fn preliminary(funding_amount: u64) -> Funding {
        let mut psbt = Psbt::from_unsigned_tx(Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: funding_amount,
                script_pubkey: Default::default(),
            }],
        })
        .expect("dumb manual PSBT creation");
        psbt.outputs[0]
            .proprietary
            .insert(ln_channel_funding_key(), vec![]);
        Funding::with(psbt).expect("dumb manual PSBT creation")
    }

    #[inline]
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.output as u32)
    }

    /// Re-targets the funding at an externally known outpoint.
    ///
    /// Used for channels funded by the remote party, where the local node
    /// learns the outpoint from `funding_created` but never holds the
    /// funding transaction itself.
    pub fn with_outpoint(mut self, outpoint: OutPoint) -> Funding {
        self.txid = outpoint.txid;
        self.output = outpoint.vout as u16;
        self
    }
}

impl Default for Funding {
    fn default() -> Self {
        Funding::new()
    }
}

impl StrictEncode for Funding {
    fn strict_encode<E: Write>(
        &self,
        mut e: E,
    ) -> Result<usize, strict_encoding::Error> {
        // The outpoint is encoded explicitly since for remote-funded
        // channels it is not derivable from the PSBT
        let mut len =
            bitcoin::consensus::serialize(&self.psbt).strict_encode(&mut e)?;
        len += self.txid.strict_encode(&mut e)?;
        len += self.output.strict_encode(&mut e)?;
        len += self.amount.strict_encode(&mut e)?;
        Ok(len)
    }
}

impl StrictDecode for Funding {
    fn strict_decode<D: Read>(
        mut d: D,
    ) -> Result<Self, strict_encoding::Error> {
        let raw = Vec::<u8>::strict_decode(&mut d)?;
        let psbt: Psbt =
            bitcoin::consensus::deserialize(&raw).map_err(|err| {
                strict_encoding::Error::DataIntegrityError(err.to_string())
            })?;
        Ok(Funding {
            psbt,
            txid: Txid::strict_decode(&mut d)?,
            output: u16::strict_decode(&mut d)?,
            amount: u64::strict_decode(&mut d)?,
        })
    }
}

fn ln_channel_funding_key() -> ProprietaryKey {
    ProprietaryKey {
        prefix: PSBT_LN_PROPRIETARY_PREFIX.to_vec(),
        subtype: PSBT_OUT_LN_CHANNEL_FUNDING,
        key: vec![],
    }
}

/// PSBT extension trait marking and locating the channel funding output
pub trait PsbtFunding: Sized {
    /// Finds the output marked as the channel funding
    fn channel_funding_output(&self) -> Option<usize>;

    /// Marks output `vout` as the channel funding output
    fn set_channel_funding_output(&mut self, vout: u16) -> Result<(), Error>;

    /// Returns the outpoint of the channel funding output
    fn channel_funding_outpoint(&self) -> Result<OutPoint, Error>;

    /// Converts the PSBT into the structured [`Funding`] information
    fn extract_channel_funding(self) -> Result<Funding, Error>;
}

impl PsbtFunding for Psbt {
    fn channel_funding_output(&self) -> Option<usize> {
        let funding_key = ln_channel_funding_key();
        self.outputs
            .iter()
            .enumerate()
            .find(|(_, output)| output.proprietary.contains_key(&funding_key))
            .map(|(index, _)| index)
    }

    fn set_channel_funding_output(&mut self, vout: u16) -> Result<(), Error> {
        self.outputs
            .get_mut(vout as usize)
            .map(|out| {
                out.proprietary.insert(ln_channel_funding_key(), vec![]);
            })
            .ok_or(Error::WrongOutput(vout))
    }

    fn channel_funding_outpoint(&self) -> Result<OutPoint, Error> {
        let vout =
            self.channel_funding_output().ok_or(Error::NoFundingOutput)?;
        Ok(OutPoint::new(self.unsigned_tx.txid(), vout as u32))
    }

    fn extract_channel_funding(self) -> Result<Funding, Error> {
        let vout =
            self.channel_funding_output().ok_or(Error::NoFundingOutput)?;
        let amount = self.unsigned_tx.output[vout].value;
        let txid = self.unsigned_tx.txid();
        Ok(Funding {
            psbt: self,
            txid,
            output: vout as u16,
            amount,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn funding_marker_roundtrip() {
        let mut psbt = Psbt::from_unsigned_tx(Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![
                TxOut {
                    value: 5000,
                    script_pubkey: Default::default(),
                },
                TxOut {
                    value: 1_000_000,
                    script_pubkey: Default::default(),
                },
            ],
        })
        .unwrap();

        assert_eq!(psbt.channel_funding_output(), None);
        psbt.set_channel_funding_output(1).unwrap();
        assert_eq!(psbt.channel_funding_output(), Some(1));

        let funding = psbt.extract_channel_funding().unwrap();
        assert_eq!(funding.amount(), 1_000_000);
        assert_eq!(funding.output(), 1);
        assert_eq!(funding.outpoint().vout, 1);
    }

    #[test]
    fn wrong_output_rejected() {
        let mut psbt = Psbt::from_unsigned_tx(Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![TxOut {
                value: 0,
                script_pubkey: Default::default(),
            }],
        })
        .unwrap();
        assert_eq!(
            psbt.set_channel_funding_output(3),
            Err(Error::WrongOutput(3))
        );
    }

    #[test]
    fn preliminary_funding_carries_amount() {
        let funding = Funding::preliminary(250_000);
        assert_eq!(funding.amount(), 250_000);
    }
}
