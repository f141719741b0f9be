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

//! Generic channel framework.
//!
//! A channel is a set of *extensions* applied in strict order to construct
//! the channel transaction graph and to evolve the channel state:
//!
//! - the single *constructor* builds the base commitment transaction;
//! - *extenders* add outputs (HTLCs) together with their second-stage
//!   transactions;
//! - *modifiers* adjust the constructed graph without changing the output
//!   set (deterministic ordering, fee shaving).
//!
//! The concrete BOLT channel lives in [`bolt`]; the framework is kept
//! generic so that experimental channel types can reuse the machinery.

pub mod bip69;
pub mod bolt;
mod funding;
mod graph;

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::io::{Read, Write};

use amplify::DumbDefault;
use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
pub use funding::{Error as FundingError, Funding, PsbtFunding};
pub use graph::{GraphTx, TxGraph, TxIndex, TxRole};
use strict_encoding::{StrictDecode, StrictEncode};

/// Marker trait for creating channel extension nomenclatures, defining the
/// order in which extensions are applied to the channel transaction
/// structure.
///
/// Extension nomenclature is an enum with members convertible into `u16`
/// representation.
pub trait Nomenclature
where
    Self: Clone
        + Copy
        + PartialEq
        + Eq
        + PartialOrd
        + Ord
        + Hash
        + Debug
        + Display
        + Default
        + TryFrom<u16, Error = strict_encoding::Error>
        + Into<u16>,
{
    /// Serializable channel state shared by all extensions
    type State: State;
    /// Error type shared by all extensions of this nomenclature
    type Error: std::error::Error;
    /// Constructor type building the base commitment transaction
    type Constructor: ChannelConstructor<Self>;
    /// Messages received from the remote peer
    type PeerMessage;
    /// Local updates evolving the channel state without a peer message
    type UpdateMessage;

    /// Returns set of default channel extenders
    fn default_extenders() -> Vec<Box<dyn ChannelExtension<Self>>> {
        Vec::default()
    }

    /// Returns set of default channel modifiers
    fn default_modifiers() -> Vec<Box<dyn ChannelExtension<Self>>> {
        Vec::default()
    }

    /// Updates the channel extension structure from a peer message.
    /// Processed before each of the registered extensions gets
    /// [`Extension::update_from_peer`].
    fn update_from_peer(
        channel: &mut Channel<Self>,
        message: &Self::PeerMessage,
    ) -> Result<(), Self::Error>;
}

/// Trait for any data that can be used as a part of the channel state
pub trait State: StrictEncode + StrictDecode + DumbDefault {
    /// Extracts the funding information from the state
    fn to_funding(&self) -> Funding;
    /// Updates funding information in the state
    fn set_funding(&mut self, funding: &Funding);
}

/// A single functional unit of a channel, mutated by peer messages and local
/// updates and participating in state persistence.
pub trait Extension<N: Nomenclature> {
    /// Position of this extension within the nomenclature
    fn identity(&self) -> N;

    /// Updates extension state from the data taken from the message received
    /// from the remote peer
    fn update_from_peer(
        &mut self,
        message: &N::PeerMessage,
    ) -> Result<(), N::Error>;

    /// Updates extension state from some local data
    fn update_from_local(
        &mut self,
        message: &N::UpdateMessage,
    ) -> Result<(), N::Error>;

    /// Loads extension state from the persisted channel state
    fn load_state(&mut self, state: &N::State);

    /// Stores extension state into the persisted channel state
    fn store_state(&self, state: &mut N::State);
}

/// Channel extension adding to the constructed transaction graph
pub trait ChannelExtension<N>
where
    N: Nomenclature,
    Self: Extension<N>,
{
    /// Constructs boxed extension objects which can be inserted into the
    /// channel extension pipeline
    #[allow(clippy::new_ret_no_self)]
    fn new() -> Box<dyn ChannelExtension<N>>
    where
        Self: Sized;

    /// Applies state to the channel transaction graph.
    ///
    /// When `as_remote_node` is set the graph constructed is the one the
    /// *remote* node will broadcast (and the local node signs).
    fn build_graph(
        &self,
        tx_graph: &mut TxGraph,
        as_remote_node: bool,
    ) -> Result<(), N::Error>;
}

/// Channel constructor-specific methods
pub trait ChannelConstructor<N>
where
    N: Nomenclature,
    Self: ChannelExtension<N> + Default,
{
    /// Enriches the funding PSBT with the information required to construct
    /// the funding output (witness script, derivation paths)
    fn enrich_funding(
        &self,
        psbt: &mut Psbt,
        funding: &Funding,
    ) -> Result<(), N::Error>;
}

pub type ExtensionQueue<N> = BTreeMap<N, Box<dyn ChannelExtension<N>>>;

/// Channel operating as a three sets of extensions, where each set is
/// applied to construct the transaction graph and the state in a strict
/// order one after the other. The order of the extensions within each set
/// is defined by the concrete type implementing [`Nomenclature`] marker
/// trait, provided as a type parameter `N`.
#[derive(Getters)]
pub struct Channel<N>
where
    N: Nomenclature,
{
    /// Funding structure shared between all extensions: every output of the
    /// channel transaction graph ultimately spends the funding output.
    funding: Funding,

    /// Constructor extension building the base of the transaction graph.
    /// There can be only a single extension of this type.
    #[getter(as_mut)]
    constructor: N::Constructor,

    /// Extender extensions adding additional outputs to the transaction
    /// graph and the state data associated with these outputs (HTLCs,
    /// anchors etc).
    extenders: ExtensionQueue<N>,

    /// Modifier extensions which do not change the number of outputs, but
    /// may change their ordering or tweak individual inputs and outputs
    /// (like BIP-69 lexicographic ordering).
    modifiers: ExtensionQueue<N>,
}

impl<N> Channel<N>
where
    N: 'static + Nomenclature,
{
    /// Constructs channel with all used extensions
    pub fn new(
        constructor: N::Constructor,
        extenders: impl IntoIterator<Item = Box<dyn ChannelExtension<N>>>,
        modifiers: impl IntoIterator<Item = Box<dyn ChannelExtension<N>>>,
    ) -> Self {
        Self {
            funding: Funding::new(),
            constructor,
            extenders: extenders.into_iter().fold(
                ExtensionQueue::<N>::new(),
                |mut queue, e| {
                    queue.insert(e.identity(), e);
                    queue
                },
            ),
            modifiers: modifiers.into_iter().fold(
                ExtensionQueue::<N>::new(),
                |mut queue, e| {
                    queue.insert(e.identity(), e);
                    queue
                },
            ),
        }
    }

    /// Gets extender by extension identifier
    #[inline]
    pub fn extender(&self, id: N) -> Option<&dyn ChannelExtension<N>> {
        self.extenders.get(&id).map(Box::as_ref)
    }

    /// Gets modifier by extension identifier
    #[inline]
    pub fn modifier(&self, id: N) -> Option<&dyn ChannelExtension<N>> {
        self.modifiers.get(&id).map(Box::as_ref)
    }

    /// Adds a new extender to the channel.
    ///
    /// Will be effective only upon the next channel state update.
    #[inline]
    pub fn add_extender(&mut self, extension: Box<dyn ChannelExtension<N>>) {
        self.extenders.insert(extension.identity(), extension);
    }

    /// Adds a new modifier to the channel.
    ///
    /// Will be effective only upon the next channel state update.
    #[inline]
    pub fn add_modifier(&mut self, modifier: Box<dyn ChannelExtension<N>>) {
        self.modifiers.insert(modifier.identity(), modifier);
    }

    /// Constructs the current version of the commitment transaction graph:
    /// the commitment PSBT plus all second-stage transactions, with the
    /// second-stage inputs pointing at the rendered commitment outputs.
    pub fn commitment_graph(
        &self,
        as_remote_node: bool,
    ) -> Result<RenderedGraph, N::Error> {
        let mut tx_graph = TxGraph::from_funding(&self.funding);
        self.constructor.build_graph(&mut tx_graph, as_remote_node)?;
        self.extenders.iter().try_for_each(|(_, e)| {
            e.build_graph(&mut tx_graph, as_remote_node)
        })?;
        self.modifiers.iter().try_for_each(|(_, e)| {
            e.build_graph(&mut tx_graph, as_remote_node)
        })?;
        Ok(tx_graph.render())
    }

    /// Constructs the current version of the commitment transaction alone
    pub fn commitment_tx(
        &self,
        as_remote_node: bool,
    ) -> Result<Psbt, N::Error> {
        Ok(self.commitment_graph(as_remote_node)?.commitment)
    }

    #[inline]
    pub fn set_funding_amount(&mut self, amount: u64) {
        self.funding = Funding::preliminary(amount)
    }

    /// Replaces the preliminary funding with the final funding PSBT coming
    /// from the wallet, enriching it with the funding output details.
    pub fn set_funding(&mut self, mut psbt: Psbt) -> Result<(), N::Error>
    where
        N::Error: From<FundingError>,
    {
        self.constructor.enrich_funding(&mut psbt, &self.funding)?;
        self.funding = Funding::with(psbt)?;
        Ok(())
    }

    /// Sets funding for a channel funded by the remote party: the PSBT is
    /// a local stub carrying the funding amount while the outpoint comes
    /// from the peer's `funding_created`.
    pub fn set_remote_funding(
        &mut self,
        mut psbt: Psbt,
        outpoint: bitcoin::OutPoint,
    ) -> Result<(), N::Error>
    where
        N::Error: From<FundingError>,
    {
        self.constructor.enrich_funding(&mut psbt, &self.funding)?;
        self.funding = Funding::with(psbt)?.with_outpoint(outpoint);
        Ok(())
    }

    /// Constructs the first commitment transaction (called "refund
    /// transaction") taking given funding PSBT.
    #[inline]
    pub fn refund_tx(
        &mut self,
        funding_psbt: Psbt,
        as_remote_node: bool,
    ) -> Result<Psbt, N::Error>
    where
        N::Error: From<FundingError>,
    {
        self.set_funding(funding_psbt)?;
        self.commitment_tx(as_remote_node)
    }
}

/// Commitment transaction graph rendered into final PSBTs
#[derive(Clone, Debug)]
pub struct RenderedGraph {
    /// The commitment transaction
    pub commitment: Psbt,
    /// Second-stage transactions, tagged with their graph role and index,
    /// spending the commitment outputs
    pub second_stage: Vec<(u16, u64, Psbt)>,
}

impl<N> Default for Channel<N>
where
    N: 'static + Nomenclature + Default,
{
    fn default() -> Self {
        Channel::new(
            N::Constructor::default(),
            N::default_extenders(),
            N::default_modifiers(),
        )
    }
}

impl<N> StrictEncode for Channel<N>
where
    N: 'static + Nomenclature,
{
    fn strict_encode<E: Write>(
        &self,
        e: E,
    ) -> Result<usize, strict_encoding::Error> {
        let mut state = N::State::dumb_default();
        self.store_state(&mut state);
        state.strict_encode(e)
    }
}

impl<N> StrictDecode for Channel<N>
where
    N: 'static + Nomenclature + Default,
{
    fn strict_decode<D: Read>(d: D) -> Result<Self, strict_encoding::Error> {
        let state = N::State::strict_decode(d)?;
        let mut channel = Channel::default();
        channel.load_state(&state);
        Ok(channel)
    }
}

/// Channel is the extension to itself :) so it receives the same input as
/// any other extension and just forwards it to them
impl<N> Extension<N> for Channel<N>
where
    N: 'static + Nomenclature,
{
    fn identity(&self) -> N {
        N::default()
    }

    fn update_from_peer(
        &mut self,
        message: &N::PeerMessage,
    ) -> Result<(), N::Error> {
        N::update_from_peer(self, message)?;
        self.constructor.update_from_peer(message)?;
        self.extenders
            .iter_mut()
            .try_for_each(|(_, e)| e.update_from_peer(message))?;
        self.modifiers
            .iter_mut()
            .try_for_each(|(_, e)| e.update_from_peer(message))?;
        Ok(())
    }

    fn update_from_local(
        &mut self,
        message: &N::UpdateMessage,
    ) -> Result<(), N::Error> {
        self.constructor.update_from_local(message)?;
        self.extenders
            .iter_mut()
            .try_for_each(|(_, e)| e.update_from_local(message))?;
        self.modifiers
            .iter_mut()
            .try_for_each(|(_, e)| e.update_from_local(message))?;
        Ok(())
    }

    fn load_state(&mut self, state: &N::State) {
        self.funding = state.to_funding();
        self.constructor.load_state(state);
        for extension in self.extenders.values_mut() {
            extension.load_state(state);
        }
        for modifier in self.modifiers.values_mut() {
            modifier.load_state(state);
        }
    }

    fn store_state(&self, state: &mut N::State) {
        state.set_funding(&self.funding);
        self.constructor.store_state(state);
        for extension in self.extenders.values() {
            extension.store_state(state);
        }
        for modifier in self.modifiers.values() {
            modifier.store_state(state);
        }
    }
}

impl<N> ChannelExtension<N> for Channel<N>
where
    N: 'static + Nomenclature + Default,
{
    #[inline]
    fn new() -> Box<dyn ChannelExtension<N>> {
        Box::new(Channel::default())
    }

    fn build_graph(
        &self,
        tx_graph: &mut TxGraph,
        as_remote_node: bool,
    ) -> Result<(), N::Error> {
        self.constructor.build_graph(tx_graph, as_remote_node)?;
        self.extenders
            .iter()
            .try_for_each(|(_, e)| e.build_graph(tx_graph, as_remote_node))?;
        self.modifiers
            .iter()
            .try_for_each(|(_, e)| e.build_graph(tx_graph, as_remote_node))?;
        Ok(())
    }
}
