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

//! Funding manager: drives the multi-message channel open dance from the
//! first `open_channel` to the funding confirmation, then hands the
//! channel over to a link.
//!
//! Every step is persisted as a reservation; reservations abandoned by the
//! peer are evicted by the periodic zombie sweeper which also errors the
//! peer. The `funding_locked` send is retried on every reconnect until the
//! exchange is persisted as completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use amplify::Wrapper;
use bitcoin::util::psbt::PartiallySignedTransaction as Psbt;
use internet2::addr::NodeId;
use lnwire::{
    AcceptChannel, ChannelId, FundingCreated, FundingLocked, FundingSigned,
    Messages, OpenChannel, ShortChannelId, TempChannelId,
};
use secp256k1::SECP256K1;

use crate::chain::{ChainWatcher, ConfirmationEvent};
use crate::channel::bolt::{
    BoltExt, CommonParams, Error as ChannelError, Lifecycle, LocalKeyset,
    PeerParams, Policy,
};
use crate::channel::{Channel, Extension, PsbtFunding};
use crate::config::FundingConfig;
use crate::persist::{Bucket, Store, StoreError, StoreExt};
use crate::wallet::{segwit_sighash, ChannelSigner, SignError};

/// Key under which the session key index counter persists
const SESSION_KEY_INDEX_KEY: &[u8] = b"next_session_key_index";

/// Funding manager errors
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// channel error during funding: {0}
    #[from]
    Channel(ChannelError),

    /// persistence error during funding: {0}
    #[from]
    Store(StoreError),

    /// signing error during funding: {0}
    #[from]
    Sign(SignError),

    /// no reservation for channel {0}
    UnknownReservation(TempChannelId),

    /// reservation for channel {0} is in state {1} incompatible with the
    /// received message
    WrongState(TempChannelId, ReservationState),

    /// remote peer requires {0} confirmations exceeding the local maximum
    /// of {1}
    TooManyConfirmations(u32, u32),

    /// funding signature from the remote peer does not verify
    InvalidFundingSignature,

    /// funding transaction lacks the marked channel funding output
    NoFundingOutput,
}

/// States of the channel open dance
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
pub enum ReservationState {
    /// `open_channel` sent, awaiting `accept_channel`
    #[display("await-accept")]
    AwaitAccept,

    /// `accept_channel` sent, awaiting `funding_created`
    #[display("await-funding-created")]
    AwaitFundingCreated,

    /// `funding_created` sent, awaiting `funding_signed`
    #[display("await-funding-signed")]
    AwaitFundingSigned,

    /// Funding transaction published, awaiting its confirmation
    #[display("await-confirmation")]
    AwaitConfirmation,

    /// Funding confirmed, awaiting the `funding_locked` exchange
    #[display("await-lock")]
    AwaitLock,

    /// Both peers locked; the channel is handed over to a link
    #[display("open")]
    Open,
}

/// Persisted funding reservation
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Reservation {
    pub temp_channel_id: TempChannelId,
    pub state: ReservationState,
    /// Unix timestamp of the last state transition; drives zombie eviction
    pub updated_at: u64,
    /// Whether our `funding_locked` was sent at least once
    pub locked_sent: bool,
    /// Whether the remote `funding_locked` was received
    pub remote_locked: bool,
    /// Short channel id assigned at confirmation
    pub short_channel_id: Option<ShortChannelId>,
}

/// Outcome of processing a funding-flow message
pub enum FundingEvent {
    /// Message to deliver to the peer
    Send(NodeId, Messages),

    /// The channel is fully open: hand it over to a link
    ChannelOpen {
        peer: NodeId,
        channel: Box<Channel<BoltExt>>,
        short_channel_id: ShortChannelId,
    },
}

struct PendingChannel {
    peer: NodeId,
    channel: Channel<BoltExt>,
    signer: Arc<dyn ChannelSigner>,
    reservation: Reservation,
    funding_psbt: Option<Psbt>,
}

/// The funding manager
pub struct FundingManager {
    cfg: FundingConfig,
    policy: Policy,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainWatcher>,
    pending: HashMap<TempChannelId, PendingChannel>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

impl FundingManager {
    pub fn with(
        cfg: FundingConfig,
        policy: Policy,
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainWatcher>,
    ) -> FundingManager {
        FundingManager {
            cfg,
            policy,
            store,
            chain,
            pending: HashMap::new(),
        }
    }

    /// Returns the session key index for the next channel reservation.
    ///
    /// Never returns zero and stays stable until [`Self::commit_session_key_index`]
    /// advances it, so a crashed open attempt re-derives the same keys.
    pub fn next_session_key_index(&self) -> Result<u32, Error> {
        let stored: Option<u32> =
            self.store.get_value(Bucket::Reservation, SESSION_KEY_INDEX_KEY)?;
        Ok(stored.unwrap_or(1).max(1))
    }

    /// Advances the session key index after the reservation committed
    pub fn commit_session_key_index(&self) -> Result<u32, Error> {
        let next = self.next_session_key_index()? + 1;
        self.store
            .put_value(Bucket::Reservation, SESSION_KEY_INDEX_KEY, &next)?;
        Ok(next)
    }

    fn persist_reservation(
        &self,
        reservation: &Reservation,
    ) -> Result<(), Error> {
        self.store.put_value(
            Bucket::Reservation,
            reservation.temp_channel_id.as_slice32().as_inner(),
            reservation,
        )?;
        Ok(())
    }

    fn remove_reservation(
        &self,
        temp_channel_id: TempChannelId,
    ) -> Result<(), Error> {
        self.store.delete_key(
            Bucket::Reservation,
            temp_channel_id.as_slice32().as_inner(),
        )?;
        Ok(())
    }

    /// Initiates an outbound channel: composes `open_channel` and creates
    /// the reservation in `await-accept`.
    #[allow(clippy::too_many_arguments)]
    pub fn open_channel(
        &mut self,
        peer: NodeId,
        funding_sat: u64,
        push_msat: u64,
        common_params: CommonParams,
        local_params: PeerParams,
        local_keys: LocalKeyset,
        signer: Arc<dyn ChannelSigner>,
    ) -> Result<FundingEvent, Error> {
        let temp_channel_id = TempChannelId::random();
        let mut channel = Channel::<BoltExt>::with(
            temp_channel_id,
            Default::default(),
            self.policy.clone(),
            common_params,
            local_params,
            local_keys.clone(),
        );
        let open_channel = channel.compose_open_channel(
            funding_sat,
            push_msat,
            self.policy.clone(),
            common_params,
            local_params,
            local_keys,
        )?;
        let reservation = Reservation {
            temp_channel_id,
            state: ReservationState::AwaitAccept,
            updated_at: unix_now(),
            locked_sent: false,
            remote_locked: false,
            short_channel_id: None,
        };
        self.persist_reservation(&reservation)?;
        self.commit_session_key_index()?;
        self.pending.insert(temp_channel_id, PendingChannel {
            peer,
            channel,
            signer,
            reservation,
            funding_psbt: None,
        });
        info!("funding: opened reservation {} to {}", temp_channel_id, peer);
        Ok(FundingEvent::Send(peer, Messages::OpenChannel(open_channel)))
    }

    /// Accepts an inbound `open_channel`, composing `accept_channel`
    pub fn accept_channel(
        &mut self,
        peer: NodeId,
        message: &OpenChannel,
        local_keys: LocalKeyset,
        signer: Arc<dyn ChannelSigner>,
    ) -> Result<FundingEvent, Error> {
        let temp_channel_id = message.temporary_channel_id;
        let mut channel = Channel::<BoltExt>::with(
            temp_channel_id,
            message.chain_hash,
            self.policy.clone(),
            Default::default(),
            PeerParams::default(),
            local_keys,
        );
        channel.set_funding_amount(message.funding_satoshis);
        channel.update_from_peer(&Messages::OpenChannel(message.clone()))?;
        let accept = channel.compose_accept_channel()?;
        let reservation = Reservation {
            temp_channel_id,
            state: ReservationState::AwaitFundingCreated,
            updated_at: unix_now(),
            locked_sent: false,
            remote_locked: false,
            short_channel_id: None,
        };
        self.persist_reservation(&reservation)?;
        self.commit_session_key_index()?;
        self.pending.insert(temp_channel_id, PendingChannel {
            peer,
            channel,
            signer,
            reservation,
            funding_psbt: None,
        });
        info!(
            "funding: accepting inbound reservation {} from {}",
            temp_channel_id, peer
        );
        Ok(FundingEvent::Send(peer, Messages::AcceptChannel(accept)))
    }

    /// Processes `accept_channel` on an outbound reservation. The wallet
    /// must have produced a funding PSBT paying to the channel multisig
    /// (with the funding output marked).
    pub fn funding_created(
        &mut self,
        message: &AcceptChannel,
        funding_psbt: Psbt,
    ) -> Result<FundingEvent, Error> {
        let temp_channel_id = message.temporary_channel_id;
        let pending = self
            .pending
            .get_mut(&temp_channel_id)
            .ok_or(Error::UnknownReservation(temp_channel_id))?;
        if pending.reservation.state != ReservationState::AwaitAccept {
            return Err(Error::WrongState(
                temp_channel_id,
                pending.reservation.state,
            ));
        }
        if message.minimum_depth > self.cfg.max_num_confs {
            return Err(Error::TooManyConfirmations(
                message.minimum_depth,
                self.cfg.max_num_confs,
            ));
        }

        pending
            .channel
            .update_from_peer(&Messages::AcceptChannel(message.clone()))?;
        pending.channel.set_funding(funding_psbt.clone())?;
        let outpoint = funding_psbt
            .channel_funding_outpoint()
            .map_err(|_| Error::NoFundingOutput)?;
        pending
            .channel
            .constructor_mut()
            .assign_channel_id(outpoint.txid, outpoint.vout as u16);

        // Sign the acceptor's initial commitment
        let remote_commitment = pending.channel.commitment_tx(true)?;
        let signature =
            pending.signer.sign_commitment(&remote_commitment)?;

        pending.funding_psbt = Some(funding_psbt);
        pending.reservation.state = ReservationState::AwaitFundingSigned;
        pending.reservation.updated_at = unix_now();
        let reservation = pending.reservation.clone();
        let peer = pending.peer;
        self.persist_reservation(&reservation)?;

        Ok(FundingEvent::Send(
            peer,
            Messages::FundingCreated(FundingCreated {
                temporary_channel_id: temp_channel_id,
                funding_txid: outpoint.txid,
                funding_output_index: outpoint.vout as u16,
                signature,
            }),
        ))
    }

    /// Processes `funding_created` on an inbound reservation: verifies the
    /// initiator's signature over our initial commitment and answers with
    /// `funding_signed`.
    pub fn funding_signed(
        &mut self,
        message: &FundingCreated,
    ) -> Result<FundingEvent, Error> {
        let temp_channel_id = message.temporary_channel_id;
        let pending = self
            .pending
            .get_mut(&temp_channel_id)
            .ok_or(Error::UnknownReservation(temp_channel_id))?;
        if pending.reservation.state != ReservationState::AwaitFundingCreated
        {
            return Err(Error::WrongState(
                temp_channel_id,
                pending.reservation.state,
            ));
        }

        pending
            .channel
            .update_from_peer(&Messages::FundingCreated(message.clone()))?;
        pending.channel.constructor_mut().assign_channel_id(
            message.funding_txid,
            message.funding_output_index,
        );

        // The funding transaction is the initiator's; construct a funding
        // stub carrying the amount, and re-target it at the real outpoint
        let mut stub = Psbt::from_unsigned_tx(bitcoin::Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime(0),
            input: vec![],
            output: vec![bitcoin::TxOut {
                value: pending.channel.funding().amount(),
                script_pubkey: Default::default(),
            }],
        })
        .expect("stub PSBT");
        stub.set_channel_funding_output(0)
            .map_err(|_| Error::NoFundingOutput)?;
        pending.channel.set_remote_funding(
            stub,
            bitcoin::OutPoint::new(
                message.funding_txid,
                message.funding_output_index as u32,
            ),
        )?;

        // Verify the initiator's signature over our initial commitment
        let local_commitment = pending.channel.commitment_tx(false)?;
        let sighash = segwit_sighash(&local_commitment, 0)?;
        let remote_funding =
            pending.channel.constructor().remote_keys().funding_pubkey;
        SECP256K1
            .verify_ecdsa(&sighash, &message.signature, &remote_funding)
            .map_err(|_| Error::InvalidFundingSignature)?;
        pending.channel.constructor_mut().set_initial_signature(
            message.signature,
            local_commitment.unsigned_tx.txid(),
        );

        // Sign the initiator's initial commitment back
        let remote_commitment = pending.channel.commitment_tx(true)?;
        let signature =
            pending.signer.sign_commitment(&remote_commitment)?;

        let channel_id =
            ChannelId::with(message.funding_txid, message.funding_output_index);
        pending.reservation.state = ReservationState::AwaitConfirmation;
        pending.reservation.updated_at = unix_now();
        let reservation = pending.reservation.clone();
        let peer = pending.peer;
        self.persist_reservation(&reservation)?;

        Ok(FundingEvent::Send(
            peer,
            Messages::FundingSigned(FundingSigned {
                channel_id,
                signature,
            }),
        ))
    }

    /// Processes `funding_signed` on an outbound reservation: verifies the
    /// acceptor's signature over our initial commitment and publishes the
    /// funding transaction. Returns the confirmation subscription the node
    /// task must poll and feed back into [`Self::funding_confirmed`].
    pub async fn funding_signed_publish(
        &mut self,
        temp_channel_id: TempChannelId,
        message: &FundingSigned,
    ) -> Result<crate::chain::Subscription<ConfirmationEvent>, Error> {
        let pending = self
            .pending
            .get_mut(&temp_channel_id)
            .ok_or(Error::UnknownReservation(temp_channel_id))?;
        if pending.reservation.state != ReservationState::AwaitFundingSigned
        {
            return Err(Error::WrongState(
                temp_channel_id,
                pending.reservation.state,
            ));
        }

        pending
            .channel
            .update_from_peer(&Messages::FundingSigned(message.clone()))?;

        let local_commitment = pending.channel.commitment_tx(false)?;
        let sighash = segwit_sighash(&local_commitment, 0)?;
        let remote_funding =
            pending.channel.constructor().remote_keys().funding_pubkey;
        SECP256K1
            .verify_ecdsa(&sighash, &message.signature, &remote_funding)
            .map_err(|_| Error::InvalidFundingSignature)?;
        pending.channel.constructor_mut().set_initial_signature(
            message.signature,
            local_commitment.unsigned_tx.txid(),
        );

        // Publish and wait for the negotiated depth
        let funding_tx = pending
            .funding_psbt
            .clone()
            .map(|psbt| psbt.extract_tx())
            .ok_or(Error::NoFundingOutput)?;
        let txid = funding_tx.txid();
        let script = pending.channel.funding_script_pubkey();
        self.chain
            .publish(funding_tx, "channel funding")
            .await
            .map_err(|err| {
                StoreError::Backend(format!("chain publish: {}", err))
            })?;
        let subscription = self
            .chain
            .register_confirmation(
                txid,
                script.into_inner(),
                pending.channel.constructor().common_params().minimum_depth,
                0,
            )
            .await
            .map_err(|err| {
                StoreError::Backend(format!("chain subscribe: {}", err))
            })?;

        pending.reservation.state = ReservationState::AwaitConfirmation;
        pending.reservation.updated_at = unix_now();
        let reservation = pending.reservation.clone();
        self.persist_reservation(&reservation)?;
        Ok(subscription)
    }

    /// Processes the funding confirmation: assigns the short channel id
    /// and composes `funding_locked` (retried on reconnect until the
    /// exchange completes).
    pub fn funding_confirmed(
        &mut self,
        temp_channel_id: TempChannelId,
        event: &ConfirmationEvent,
        funding_vout: u16,
    ) -> Result<FundingEvent, Error> {
        let pending = self
            .pending
            .get_mut(&temp_channel_id)
            .ok_or(Error::UnknownReservation(temp_channel_id))?;
        let short_channel_id = ShortChannelId::new(
            event.height,
            event.tx_index,
            funding_vout,
        )
        .unwrap_or_default();

        let funding_locked = pending.channel.compose_funding_locked()?;
        pending.reservation.state = ReservationState::AwaitLock;
        pending.reservation.short_channel_id = Some(short_channel_id);
        pending.reservation.locked_sent = true;
        pending.reservation.updated_at = unix_now();
        let reservation = pending.reservation.clone();
        let peer = pending.peer;
        self.persist_reservation(&reservation)?;
        Ok(FundingEvent::Send(
            peer,
            Messages::FundingLocked(funding_locked),
        ))
    }

    /// Re-sends `funding_locked` after a reconnection when the exchange
    /// has not completed yet
    pub fn retry_funding_locked(
        &mut self,
        peer: NodeId,
    ) -> Vec<FundingEvent> {
        let mut events = vec![];
        for pending in self.pending.values_mut() {
            if pending.peer == peer
                && pending.reservation.state == ReservationState::AwaitLock
                && pending.reservation.locked_sent
                && !pending.reservation.remote_locked
            {
                if let Ok(funding_locked) =
                    pending.channel.compose_funding_locked()
                {
                    events.push(FundingEvent::Send(
                        peer,
                        Messages::FundingLocked(funding_locked),
                    ));
                }
            }
        }
        events
    }

    /// Processes the remote `funding_locked`; once both sides locked the
    /// channel is open and ownership moves to a link.
    pub fn funding_locked(
        &mut self,
        temp_channel_id: TempChannelId,
        message: &FundingLocked,
    ) -> Result<FundingEvent, Error> {
        let mut pending = self
            .pending
            .remove(&temp_channel_id)
            .ok_or(Error::UnknownReservation(temp_channel_id))?;
        if pending.reservation.state != ReservationState::AwaitLock
            && pending.reservation.state != ReservationState::AwaitConfirmation
        {
            let state = pending.reservation.state;
            self.pending.insert(temp_channel_id, pending);
            return Err(Error::WrongState(temp_channel_id, state));
        }

        pending
            .channel
            .update_from_peer(&Messages::FundingLocked(message.clone()))?;
        pending.channel.constructor_mut().set_stage(Lifecycle::Active);
        pending.reservation.remote_locked = true;
        pending.reservation.state = ReservationState::Open;
        pending.reservation.updated_at = unix_now();
        self.persist_reservation(&pending.reservation)?;
        self.remove_reservation(temp_channel_id)?;

        let short_channel_id = pending
            .reservation
            .short_channel_id
            .unwrap_or_default();
        info!(
            "funding: channel {} open at {}",
            temp_channel_id, short_channel_id
        );
        Ok(FundingEvent::ChannelOpen {
            peer: pending.peer,
            channel: Box::new(pending.channel),
            short_channel_id,
        })
    }

    /// Evicts reservations idle for longer than the configured timeout.
    /// Returns the error messages to deliver to the respective peers.
    pub fn sweep_zombies(&mut self) -> Vec<(NodeId, Messages)> {
        let deadline = unix_now().saturating_sub(
            self.cfg.reservation_timeout.as_secs(),
        );
        let zombies: Vec<TempChannelId> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                pending.reservation.state != ReservationState::Open
                    && pending.reservation.updated_at < deadline
            })
            .map(|(id, _)| *id)
            .collect();

        let mut notifications = vec![];
        for temp_channel_id in zombies {
            if let Some(pending) = self.pending.remove(&temp_channel_id) {
                warn!(
                    "funding: evicting zombie reservation {} in state {}",
                    temp_channel_id, pending.reservation.state
                );
                if let Err(err) = self.remove_reservation(temp_channel_id) {
                    error!(
                        "funding: can't remove zombie reservation: {}",
                        err
                    );
                }
                notifications.push((
                    pending.peer,
                    Messages::Error(lnwire::Error::with(
                        ChannelId::from(temp_channel_id),
                        "funding reservation timed out",
                    )),
                ));
            }
        }
        notifications
    }

    /// Number of reservations currently pending
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::{BlockEpoch, ChainError, SpendEvent, Subscription};
    use crate::persist::MemoryStore;
    use async_trait::async_trait;
    use bitcoin::{OutPoint, Script, Transaction, Txid};

    struct DumbChain;

    #[async_trait]
    impl ChainWatcher for DumbChain {
        async fn register_block_epochs(
            &self,
        ) -> Result<Subscription<BlockEpoch>, ChainError> {
            let (subscription, _tx, _cancel) = Subscription::channel(1);
            Ok(subscription)
        }

        async fn register_confirmation(
            &self,
            _txid: Txid,
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
            Err(ChainError::Transient(s!("not implemented")))
        }
    }

    fn manager() -> FundingManager {
        let mut cfg = FundingConfig::default();
        cfg.reservation_timeout = std::time::Duration::from_secs(0);
        FundingManager::with(
            cfg,
            Policy::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(DumbChain),
        )
    }

    fn node_id(byte: u8) -> NodeId {
        let secret = secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        NodeId::from(secp256k1::PublicKey::from_secret_key(
            SECP256K1, &secret,
        ))
    }

    #[test]
    fn session_key_index_invariant() {
        let manager = manager();
        // Never returns zero, idempotent until committed
        assert_eq!(manager.next_session_key_index().unwrap(), 1);
        assert_eq!(manager.next_session_key_index().unwrap(), 1);
        manager.commit_session_key_index().unwrap();
        assert_eq!(manager.next_session_key_index().unwrap(), 2);
    }

    #[test]
    fn zombie_sweeper_evicts_and_errors_peer() {
        use amplify::DumbDefault;

        let mut manager = manager();
        let peer = node_id(9);
        let signer = Arc::new(crate::wallet::MemoryChannelSigner::with(
            secp256k1::SecretKey::from_slice(&[1u8; 32]).unwrap(),
            secp256k1::SecretKey::from_slice(&[2u8; 32]).unwrap(),
            secp256k1::SecretKey::from_slice(&[3u8; 32]).unwrap(),
            secp256k1::SecretKey::from_slice(&[4u8; 32]).unwrap(),
            secp256k1::SecretKey::from_slice(&[5u8; 32]).unwrap(),
        ));
        manager
            .open_channel(
                peer,
                1_000_000,
                0,
                CommonParams::default(),
                PeerParams::default(),
                LocalKeyset::dumb_default(),
                signer,
            )
            .unwrap();
        assert_eq!(manager.pending_count(), 1);

        // The reservation-timeout of zero makes it an immediate zombie
        let notifications = manager.sweep_zombies();
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, peer);
        assert!(matches!(notifications[0].1, Messages::Error(_)));

        // The session key index survives the eviction
        assert!(manager.next_session_key_index().unwrap() >= 2);
    }
}
