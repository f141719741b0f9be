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

//! Chain notification seam.
//!
//! The node core subscribes to block epochs, transaction confirmations and
//! outpoint spends, and publishes transactions, all through the
//! [`ChainWatcher`] trait. Implementations wrap a bitcoind connection, an
//! electrum server or a compact-block-filter backend; the core never talks
//! to the chain directly.

use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Script, Transaction, Txid};
use tokio::sync::{mpsc, oneshot};

/// Chain interface errors
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ChainError {
    /// chain backend is temporarily unavailable: {0}
    Transient(String),

    /// the subscription was canceled
    Canceled,

    /// transaction {0} was rejected by the chain backend: {1}
    Rejected(Txid, String),
}

/// New chain tip notification
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockEpoch {
    /// Height of the new chain tip
    pub height: u32,
    /// Hash of the new chain tip
    pub hash: BlockHash,
}

/// Transaction confirmation notification
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConfirmationEvent {
    /// The confirmed transaction id
    pub txid: Txid,
    /// Height of the block including the transaction
    pub height: u32,
    /// Hash of the block including the transaction
    pub block_hash: BlockHash,
    /// Position of the transaction within the block
    pub tx_index: u32,
}

/// Outpoint spend notification
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SpendEvent {
    /// The outpoint which was spent
    pub outpoint: OutPoint,
    /// The transaction spending it
    pub spending_tx: Transaction,
    /// Index of the input spending the outpoint
    pub input_index: u32,
    /// Height at which the spend confirmed
    pub height: u32,
}

/// A cancelable event subscription.
///
/// Dropping the subscription delivers the cancel signal to the watcher so
/// it can release the registration.
#[derive(Debug)]
pub struct Subscription<T> {
    events: mpsc::Receiver<T>,
    cancel: Option<oneshot::Sender<()>>,
}

impl<T> Subscription<T> {
    /// Pairs a new subscription with the sender half handed to the watcher
    /// implementation. The watcher must stop delivering once the returned
    /// cancel receiver fires.
    pub fn channel(
        buffer: usize,
    ) -> (Subscription<T>, mpsc::Sender<T>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(buffer);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            Subscription {
                events: rx,
                cancel: Some(cancel_tx),
            },
            tx,
            cancel_rx,
        )
    }

    /// Awaits the next event; `None` once the watcher side is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.events.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The watcher may already be gone; nothing to release then
            let _ = cancel.send(());
        }
    }
}

/// Chain notification and transaction publication interface consumed by the
/// funding manager, the arbitrators, the sweeper and the breach arbiter.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    /// Subscribes to new chain tips
    async fn register_block_epochs(
        &self,
    ) -> Result<Subscription<BlockEpoch>, ChainError>;

    /// Subscribes to the confirmation of `txid` (identified also by its
    /// script for light-client backends) reaching `num_confs` confirmations
    async fn register_confirmation(
        &self,
        txid: Txid,
        script: Script,
        num_confs: u32,
        start_height: u32,
    ) -> Result<Subscription<ConfirmationEvent>, ChainError>;

    /// Subscribes to any spend of `outpoint`
    async fn register_spend(
        &self,
        outpoint: OutPoint,
        script: Script,
        start_height: u32,
    ) -> Result<Subscription<SpendEvent>, ChainError>;

    /// Publishes a transaction to the network
    async fn publish(
        &self,
        tx: Transaction,
        label: &str,
    ) -> Result<(), ChainError>;

    /// Returns the current best block
    async fn best_block(&self) -> Result<BlockEpoch, ChainError>;
}
