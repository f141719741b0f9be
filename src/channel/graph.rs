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

//! Transaction graph assembled by the channel extension pipeline: the
//! commitment transaction outputs plus second-stage transactions spending
//! them.
//!
//! Second-stage transactions are inserted before the commitment txid is
//! known; they reference the commitment output they spend by script, and
//! [`TxGraph::render`] patches their inputs once the commitment transaction
//! is final.

use std::collections::BTreeMap;

use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
use bitcoin::{Script, Transaction, TxIn, TxOut};

use super::{Funding, RenderedGraph};

pub trait TxRole: Clone + From<u16> + Into<u16> {}
pub trait TxIndex: Clone + From<u64> + Into<u64> {}

impl TxRole for u16 {}
impl TxIndex for u64 {}

/// Second-stage transaction stored in the graph
#[derive(Clone, PartialEq, Debug)]
pub struct GraphTx {
    /// The transaction itself, with its first input not yet bound to the
    /// commitment transaction
    pub psbt: Psbt,

    /// Script pubkey of the commitment output this transaction spends; used
    /// to bind the input once the commitment transaction is rendered
    pub spends: Script,
}

/// Channel transaction graph under construction
#[derive(Getters)]
pub struct TxGraph<'channel> {
    /// Read-only channel funding data
    funding: &'channel Funding,
    pub cmt_version: i32,
    pub cmt_locktime: u32,
    pub cmt_sequence: u32,
    /// Commitment outputs together with their PSBT output data (witness
    /// scripts, derivation info)
    pub cmt_outs: Vec<(TxOut, bitcoin::util::psbt::Output)>,
    #[getter(skip)]
    graph: BTreeMap<u16, BTreeMap<u64, GraphTx>>,
}

impl<'channel> TxGraph<'channel>
where
    Self: 'channel,
{
    pub fn from_funding(funding: &'channel Funding) -> TxGraph<'channel> {
        TxGraph {
            funding,
            cmt_version: 2,
            cmt_locktime: 0,
            cmt_sequence: 0,
            cmt_outs: vec![],
            graph: bmap! {},
        }
    }

    pub fn tx<R, I>(&self, role: R, index: I) -> Option<&GraphTx>
    where
        R: TxRole,
        I: TxIndex,
    {
        self.graph
            .get(&role.into())
            .and_then(|v| v.get(&index.into()))
    }

    pub fn insert_tx<R, I>(
        &mut self,
        role: R,
        index: I,
        tx: GraphTx,
    ) -> Option<GraphTx>
    where
        R: TxRole,
        I: TxIndex,
    {
        self.graph
            .entry(role.into())
            .or_insert_with(Default::default)
            .insert(index.into(), tx)
    }

    pub fn len(&self) -> usize {
        self.graph
            .iter()
            .fold(0usize, |sum, (_, map)| sum + map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn last_index<R>(&self, role: R) -> usize
    where
        R: TxRole,
    {
        match self.graph.get(&role.into()) {
            Some(map) => map.len(),
            None => 0usize,
        }
    }

    /// Renders the commitment transaction PSBT from the accumulated outputs
    pub fn render_cmt(&self) -> Psbt {
        let outputs = self
            .cmt_outs
            .iter()
            .map(|(txout, _)| txout.clone())
            .collect();
        let cmt_tx = Transaction {
            version: self.cmt_version,
            lock_time: bitcoin::PackedLockTime(self.cmt_locktime),
            input: vec![TxIn {
                previous_output: self.funding.outpoint(),
                script_sig: none!(),
                sequence: bitcoin::Sequence(self.cmt_sequence),
                witness: empty!(),
            }],
            output: outputs,
        };
        let mut psbt = Psbt::from_unsigned_tx(cmt_tx).expect(
            "PSBT construction fails only if script_sig and witness are not \
             empty; which is not the case here",
        );
        let funding_psbt = self.funding.psbt();
        let funding_output = self.funding.output() as usize;
        psbt.inputs[0].witness_utxo = Some(
            funding_psbt.unsigned_tx.output[funding_output].clone(),
        );
        psbt.inputs[0].witness_script =
            funding_psbt.outputs[funding_output].witness_script.clone();
        psbt.inputs[0].bip32_derivation = funding_psbt.outputs[funding_output]
            .bip32_derivation
            .clone();
        for (index, output) in psbt.outputs.iter_mut().enumerate() {
            *output = self.cmt_outs[index].1.clone();
        }
        psbt
    }

    /// Renders the full graph: the commitment transaction plus all
    /// second-stage transactions with their inputs bound to the commitment
    /// outputs they spend.
    pub fn render(&self) -> RenderedGraph {
        let commitment = self.render_cmt();
        let cmt_txid = commitment.unsigned_tx.txid();
        let second_stage = self
            .graph
            .iter()
            .flat_map(|(role, map)| {
                map.iter().map(move |(index, tx)| (*role, *index, tx))
            })
            .map(|(role, index, graph_tx)| {
                let mut psbt = graph_tx.psbt.clone();
                if let Some(vout) = commitment
                    .unsigned_tx
                    .output
                    .iter()
                    .position(|out| out.script_pubkey == graph_tx.spends)
                {
                    psbt.unsigned_tx.input[0].previous_output =
                        bitcoin::OutPoint::new(cmt_txid, vout as u32);
                    psbt.inputs[0].witness_utxo =
                        Some(commitment.unsigned_tx.output[vout].clone());
                }
                (role, index, psbt)
            })
            .collect();
        RenderedGraph {
            commitment,
            second_stage,
        }
    }
}
