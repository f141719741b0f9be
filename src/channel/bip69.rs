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

//! Deterministic commitment output ordering: BIP-69 lexicographic sorting
//! with the BOLT-3 CLTV tiebreak for otherwise identical HTLC outputs.

use bitcoin::util::psbt::raw::ProprietaryKey;

use super::funding::PSBT_LN_PROPRIETARY_PREFIX;
use crate::channel::bolt::{BoltExt, ChannelState, Error, UpdateMsg};
use crate::channel::{ChannelExtension, Extension, TxGraph};

/// Proprietary PSBT output key carrying the CLTV expiry of an HTLC output,
/// used as the ordering tiebreak between outputs with equal amount and
/// script.
pub const PSBT_OUT_LN_HTLC_EXPIRY: u8 = 0x02;

pub(super) fn ln_htlc_expiry_key() -> ProprietaryKey {
    ProprietaryKey {
        prefix: PSBT_LN_PROPRIETARY_PREFIX.to_vec(),
        subtype: PSBT_OUT_LN_HTLC_EXPIRY,
        key: vec![],
    }
}

/// Stateless modifier sorting commitment outputs into the canonical order.
///
/// Both parties must construct byte-identical commitment transactions, so
/// the output order can't depend on the insertion order of the extension
/// pipeline.
#[derive(Debug, Default)]
pub struct Bip69;

impl Extension<BoltExt> for Bip69 {
    #[inline]
    fn identity(&self) -> BoltExt {
        BoltExt::Bip69
    }

    #[inline]
    fn update_from_peer(&mut self, _: &lnwire::Messages) -> Result<(), Error> {
        // Nothing to do here: peers can't tell us anything that will be
        // related to the stateless lexicographic output ordering.
        Ok(())
    }

    #[inline]
    fn update_from_local(&mut self, _: &UpdateMsg) -> Result<(), Error> {
        // Nothing to do here
        Ok(())
    }

    fn load_state(&mut self, _state: &ChannelState) {
        // Nothing to do here
    }

    fn store_state(&self, _state: &mut ChannelState) {
        // Nothing to do here
    }
}

impl ChannelExtension<BoltExt> for Bip69 {
    #[inline]
    fn new() -> Box<dyn ChannelExtension<BoltExt>>
    where
        Self: Sized,
    {
        Box::new(Bip69::default())
    }

    fn build_graph(
        &self,
        tx_graph: &mut TxGraph,
        _as_remote_node: bool,
    ) -> Result<(), Error> {
        tx_graph.cmt_outs.sort_by(|(txout_a, psbtout_a), (txout_b, psbtout_b)| {
            txout_a
                .value
                .cmp(&txout_b.value)
                .then_with(|| {
                    txout_a
                        .script_pubkey
                        .as_bytes()
                        .cmp(txout_b.script_pubkey.as_bytes())
                })
                .then_with(|| {
                    let expiry_a =
                        psbtout_a.proprietary.get(&ln_htlc_expiry_key());
                    let expiry_b =
                        psbtout_b.proprietary.get(&ln_htlc_expiry_key());
                    expiry_a.cmp(&expiry_b)
                })
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bitcoin::{Script, TxOut};

    use super::*;
    use crate::channel::Funding;

    fn out(value: u64, script: &[u8]) -> (TxOut, bitcoin::util::psbt::Output) {
        (
            TxOut {
                value,
                script_pubkey: Script::from(script.to_vec()),
            },
            bitcoin::util::psbt::Output::default(),
        )
    }

    fn out_with_expiry(
        value: u64,
        script: &[u8],
        expiry: u32,
    ) -> (TxOut, bitcoin::util::psbt::Output) {
        let (txout, mut psbt_out) = out(value, script);
        psbt_out
            .proprietary
            .insert(ln_htlc_expiry_key(), expiry.to_be_bytes().to_vec());
        (txout, psbt_out)
    }

    #[test]
    fn orders_by_value_then_script() {
        let funding = Funding::preliminary(1_000_000);
        let mut graph = TxGraph::from_funding(&funding);
        graph.cmt_outs = vec![
            out(5000, &[0x51]),
            out(1000, &[0x52]),
            out(1000, &[0x51]),
        ];
        Bip69.build_graph(&mut graph, true).unwrap();
        assert_eq!(
            graph
                .cmt_outs
                .iter()
                .map(|(txout, _)| (txout.value, txout.script_pubkey.to_bytes()))
                .collect::<Vec<_>>(),
            vec![
                (1000, vec![0x51]),
                (1000, vec![0x52]),
                (5000, vec![0x51]),
            ]
        );
    }

    #[test]
    fn identical_outputs_ordered_by_expiry() {
        let funding = Funding::preliminary(1_000_000);
        let mut graph = TxGraph::from_funding(&funding);
        graph.cmt_outs = vec![
            out_with_expiry(1000, &[0x51], 144),
            out_with_expiry(1000, &[0x51], 100),
        ];
        Bip69.build_graph(&mut graph, true).unwrap();
        let expiries: Vec<_> = graph
            .cmt_outs
            .iter()
            .map(|(_, out)| {
                out.proprietary.get(&ln_htlc_expiry_key()).cloned().unwrap()
            })
            .collect();
        assert_eq!(
            expiries,
            vec![100u32.to_be_bytes().to_vec(), 144u32.to_be_bytes().to_vec()]
        );
    }
}
