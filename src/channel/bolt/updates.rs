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

//! Append-only channel update log and the dual commitment chains.
//!
//! Every channel update (HTLC add, settle, fail, fee change) is a log entry
//! tagged with a monotonic index. An entry carries, per chain, the
//! commitment height at which it took effect; the content of any commitment
//! is a pure function of the log prefix selected by these heights. Entries
//! become irreversible once both chains have revoked past them, at which
//! point the log is compacted.

use bitcoin::hashes::sha256;
use bitcoin::Txid;
use bitcoin_scripts::hlc::HashPreimage;
use lnwire::UpdateAddHtlc;
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::{HtlcDirection, StagedHtlc};

/// Party which originated a channel update
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
pub enum Originator {
    /// Update proposed by the local node
    #[display("local")]
    Local,

    /// Update proposed by the remote peer
    #[display("remote")]
    Remote,
}

impl Originator {
    /// The other party
    pub fn swapped(self) -> Originator {
        match self {
            Originator::Local => Originator::Remote,
            Originator::Remote => Originator::Local,
        }
    }
}

/// Chain the update heights refer to
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
pub enum ChainSide {
    /// Commitment chain of the local node
    #[display("local-chain")]
    Local,

    /// Commitment chain of the remote node
    #[display("remote-chain")]
    Remote,
}

/// Payload of an update log entry
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub enum UpdateDetails {
    /// New HTLC offered by the originator; the full wire message is kept so
    /// that the onion packet survives restarts for later forwarding
    Add(UpdateAddHtlc),

    /// Settlement of HTLC `htlc_id` offered by the opposite party
    Settle {
        htlc_id: u64,
        preimage: HashPreimage,
    },

    /// Failure of HTLC `htlc_id` offered by the opposite party
    Fail { htlc_id: u64, reason: Vec<u8> },

    /// Failure of HTLC `htlc_id` with an unparsable onion
    FailMalformed {
        htlc_id: u64,
        sha256_of_onion: sha256::Hash,
        failure_code: u16,
    },

    /// Commitment fee rate change (only valid from the channel initiator)
    Fee { feerate_per_kw: u32 },
}

impl UpdateDetails {
    /// Id of the HTLC removed by this update, if it is a removal
    pub fn removes_htlc(&self) -> Option<u64> {
        match self {
            UpdateDetails::Settle { htlc_id, .. }
            | UpdateDetails::Fail { htlc_id, .. }
            | UpdateDetails::FailMalformed { htlc_id, .. } => Some(*htlc_id),
            _ => None,
        }
    }
}

/// Single entry of the channel update log
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LogEntry {
    /// Monotonic log index, unique within the channel
    pub index: u64,

    /// Party which originated the update
    pub originator: Originator,

    /// The update itself
    pub details: UpdateDetails,

    /// Height of the local commitment which first reflects this update
    pub local_height: Option<u64>,

    /// Height of the remote commitment which first reflects this update
    pub remote_height: Option<u64>,

    /// Set once the update was reported for forwarding (remote adds only);
    /// makes crash-replay idempotent together with the circuit map
    pub forwarded: bool,
}

impl LogEntry {
    /// Height of this entry on the requested chain
    pub fn height_on(&self, side: ChainSide) -> Option<u64> {
        match side {
            ChainSide::Local => self.local_height,
            ChainSide::Remote => self.remote_height,
        }
    }

    fn set_height_on(&mut self, side: ChainSide, height: u64) {
        let slot = match side {
            ChainSide::Local => &mut self.local_height,
            ChainSide::Remote => &mut self.remote_height,
        };
        if slot.is_none() {
            *slot = Some(height);
        }
    }
}

/// Errors of the update log consistency
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum LogError {
    /// log entry references HTLC #{0} which is not present in the log
    UnknownHtlc(u64),

    /// HTLC #{0} is already being removed by log entry #{1}
    AlreadyRemoved(u64, u64),
}

/// Append-only update log of a channel
#[derive(Clone, PartialEq, Eq, Debug, Default, StrictEncode, StrictDecode)]
pub struct UpdateLog {
    entries: Vec<LogEntry>,
    next_index: u64,
}

impl UpdateLog {
    /// Appends an update originated by `originator`, assigning it the next
    /// log index
    pub fn append(
        &mut self,
        originator: Originator,
        details: UpdateDetails,
    ) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        self.entries.push(LogEntry {
            index,
            originator,
            details,
            local_height: None,
            remote_height: None,
            forwarded: false,
        });
        index
    }

    /// All log entries in the order of their indexes
    #[inline]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[inline]
    pub fn entries_mut(&mut self) -> &mut [LogEntry] {
        &mut self.entries
    }

    /// Finds the add entry for HTLC `htlc_id` offered by `originator`
    pub fn add_entry(
        &self,
        originator: Originator,
        htlc_id: u64,
    ) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| {
            entry.originator == originator
                && matches!(
                    &entry.details,
                    UpdateDetails::Add(add) if add.htlc_id == htlc_id
                )
        })
    }

    /// Finds the removal (settle or fail) for HTLC `htlc_id` offered by
    /// `add_originator`
    pub fn removal_entry(
        &self,
        add_originator: Originator,
        htlc_id: u64,
    ) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| {
            entry.originator == add_originator.swapped()
                && entry.details.removes_htlc() == Some(htlc_id)
        })
    }

    /// Validates that a removal can be logged and appends it
    pub fn append_removal(
        &mut self,
        originator: Originator,
        details: UpdateDetails,
    ) -> Result<u64, LogError> {
        let htlc_id = details
            .removes_htlc()
            .expect("append_removal called with a non-removal update");
        let add_originator = originator.swapped();
        if self.add_entry(add_originator, htlc_id).is_none() {
            return Err(LogError::UnknownHtlc(htlc_id));
        }
        if let Some(prior) = self.removal_entry(add_originator, htlc_id) {
            return Err(LogError::AlreadyRemoved(htlc_id, prior.index));
        }
        Ok(self.append(originator, details))
    }

    /// Detects whether there are updates not yet committed to the given
    /// chain. Presence of such updates is the protocol precondition for
    /// sending a new `commitment_signed`.
    pub fn has_uncommitted(&self, side: ChainSide) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.height_on(side).is_none())
    }

    /// Assigns height `height` on chain `side` to every pending entry,
    /// returning the set of indexes which were staged
    pub fn stage_to(&mut self, side: ChainSide, height: u64) -> Vec<u64> {
        self.stage_filtered(side, height, |_| true)
    }

    /// Assigns height `height` on chain `side` to the pending entries
    /// selected by `predicate`, returning the set of staged indexes.
    ///
    /// Used on the local chain where updates originated by the local node
    /// may be staged only once the remote has acknowledged them.
    pub fn stage_filtered(
        &mut self,
        side: ChainSide,
        height: u64,
        predicate: impl Fn(&LogEntry) -> bool,
    ) -> Vec<u64> {
        let mut staged = vec![];
        for entry in &mut self.entries {
            if entry.height_on(side).is_none() && predicate(entry) {
                entry.set_height_on(side, height);
                staged.push(entry.index);
            }
        }
        staged
    }

    /// Reverts staging of the listed entries (used when commitment
    /// construction fails, e.g. on fee affordability)
    pub fn unstage(&mut self, side: ChainSide, indexes: &[u64]) {
        for entry in &mut self.entries {
            if indexes.contains(&entry.index) {
                match side {
                    ChainSide::Local => entry.local_height = None,
                    ChainSide::Remote => entry.remote_height = None,
                }
            }
        }
    }

    /// The set of HTLCs present in the commitment at `height` of chain
    /// `side`: adds whose height on the side is `<= height` without a
    /// removal applied at or before `height`.
    ///
    /// Directions are relative to the owner of the chain: on the local
    /// chain the HTLCs added by the local node are `Offered`.
    pub fn htlcs_at(&self, side: ChainSide, height: u64) -> Vec<StagedHtlc> {
        let owner = match side {
            ChainSide::Local => Originator::Local,
            ChainSide::Remote => Originator::Remote,
        };
        self.entries
            .iter()
            .filter_map(|entry| match &entry.details {
                UpdateDetails::Add(add) => {
                    let added_at = entry.height_on(side)?;
                    if added_at > height {
                        return None;
                    }
                    if let Some(removal) =
                        self.removal_entry(entry.originator, add.htlc_id)
                    {
                        if matches!(removal.height_on(side), Some(removed_at) if removed_at <= height)
                        {
                            return None;
                        }
                    }
                    let direction = if entry.originator == owner {
                        HtlcDirection::Offered
                    } else {
                        HtlcDirection::Received
                    };
                    Some(StagedHtlc {
                        id: add.htlc_id,
                        direction,
                        amount_msat: add.amount_msat,
                        payment_hash: add.payment_hash,
                        cltv_expiry: add.cltv_expiry,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Fee rate effective at `height` of chain `side`, if any fee update
    /// applies there
    pub fn feerate_at(&self, side: ChainSide, height: u64) -> Option<u32> {
        self.entries
            .iter()
            .filter_map(|entry| match entry.details {
                UpdateDetails::Fee { feerate_per_kw } => {
                    match entry.height_on(side) {
                        Some(applied) if applied <= height => {
                            Some((applied, entry.index, feerate_per_kw))
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .max_by_key(|(applied, index, _)| (*applied, *index))
            .map(|(_, _, feerate)| feerate)
    }

    /// Pending (not yet settled or failed) adds originated by `originator`,
    /// used for balance and in-flight limit checks
    pub fn pending_adds(
        &self,
        originator: Originator,
    ) -> impl Iterator<Item = &UpdateAddHtlc> {
        self.entries.iter().filter_map(move |entry| {
            match &entry.details {
                UpdateDetails::Add(add)
                    if entry.originator == originator
                        && self
                            .removal_entry(originator, add.htlc_id)
                            .is_none() =>
                {
                    Some(add)
                }
                _ => None,
            }
        })
    }

    /// Drops entries whose effect became irreversible: adds with removals
    /// applied and revoked on both chains, and superseded fee updates.
    ///
    /// `local_revoked` / `remote_revoked` are the highest *revoked* heights
    /// of the respective chains.
    pub fn compact(&mut self, local_revoked: u64, remote_revoked: u64) {
        let irreversible = |entry: &LogEntry| {
            matches!(entry.local_height, Some(height) if height <= local_revoked)
                && matches!(entry.remote_height, Some(height) if height <= remote_revoked)
        };

        let mut removed_ids = vec![];
        for entry in &self.entries {
            if let Some(htlc_id) = entry.details.removes_htlc() {
                if irreversible(entry) {
                    removed_ids.push((entry.originator.swapped(), htlc_id));
                }
            }
        }

        self.entries.retain(|entry| match &entry.details {
            UpdateDetails::Add(add) => !removed_ids
                .contains(&(entry.originator, add.htlc_id)),
            UpdateDetails::Settle { htlc_id, .. }
            | UpdateDetails::Fail { htlc_id, .. }
            | UpdateDetails::FailMalformed { htlc_id, .. } => !removed_ids
                .contains(&(entry.originator.swapped(), *htlc_id)),
            UpdateDetails::Fee { .. } => true,
        });

        // Fee updates: keep only the latest irreversible one (still needed
        // as the base fee rate) plus everything not yet irreversible.
        let latest_irreversible_fee = self
            .entries
            .iter()
            .filter(|entry| {
                matches!(entry.details, UpdateDetails::Fee { .. })
                    && irreversible(entry)
            })
            .map(|entry| entry.index)
            .max();
        if let Some(latest) = latest_irreversible_fee {
            self.entries.retain(|entry| {
                !matches!(entry.details, UpdateDetails::Fee { .. })
                    || entry.index >= latest
            });
        }
    }
}

/// Snapshot of one commitment transaction: the deterministic output of the
/// update-log prefix applied at its height.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Commitment {
    /// Commitment number, monotonically increasing from zero
    pub height: u64,

    /// Balance of the chain owner before fee deduction, millisatoshi
    pub to_local_msat: u64,

    /// Balance of the counterparty before fee deduction, millisatoshi
    pub to_remote_msat: u64,

    /// Fee rate this commitment pays
    pub feerate_per_kw: u32,

    /// HTLCs included at this height, directions relative to the owner
    pub htlcs: Vec<StagedHtlc>,

    /// Per-commitment point of the owner for this height
    pub per_commitment_point: PublicKey,

    /// Counterparty's signature over this commitment: received for the
    /// local chain, produced by us for the remote chain (kept for
    /// byte-identical retransmission)
    pub signature: Option<Signature>,

    /// Counterparty's signatures over the HTLC transactions, in commitment
    /// output order
    pub htlc_signatures: Vec<Signature>,

    /// Txid of the rendered commitment transaction
    pub txid: Option<Txid>,
}

impl Commitment {
    /// Initial commitment (height 0) for a freshly funded channel
    pub fn initial(
        to_local_msat: u64,
        to_remote_msat: u64,
        feerate_per_kw: u32,
        per_commitment_point: PublicKey,
    ) -> Commitment {
        Commitment {
            height: 0,
            to_local_msat,
            to_remote_msat,
            feerate_per_kw,
            htlcs: vec![],
            per_commitment_point,
            signature: None,
            htlc_signatures: vec![],
            txid: None,
        }
    }

    /// Looks up an included HTLC by its direction and id
    pub fn htlc(
        &self,
        direction: HtlcDirection,
        htlc_id: u64,
    ) -> Option<&StagedHtlc> {
        self.htlcs
            .iter()
            .find(|htlc| htlc.direction == direction && htlc.id == htlc_id)
    }
}

/// One commitment chain: the current tip plus the not-yet-revoked prior
/// commitment.
///
/// The chains of the two parties may differ by at most one height at any
/// instant; a present `prior` means the owner still owes a revocation for
/// it.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct CommitmentChain {
    tip: Commitment,
    prior: Option<Commitment>,
}

impl CommitmentChain {
    /// Creates the chain out of the initial commitment
    pub fn with(initial: Commitment) -> CommitmentChain {
        CommitmentChain {
            tip: initial,
            prior: None,
        }
    }

    /// The current chain tip
    #[inline]
    pub fn tip(&self) -> &Commitment {
        &self.tip
    }

    /// Mutable access to the chain tip, used for attaching the initial
    /// commitment signatures during the funding dance
    #[inline]
    pub fn tip_mut(&mut self) -> &mut Commitment {
        &mut self.tip
    }

    /// The unrevoked prior commitment, if any
    #[inline]
    pub fn prior(&self) -> Option<&Commitment> {
        self.prior.as_ref()
    }

    /// Height of the chain tip
    #[inline]
    pub fn height(&self) -> u64 {
        self.tip.height
    }

    /// Detects whether the chain owner still owes a revocation
    #[inline]
    pub fn pending_revocation(&self) -> bool {
        self.prior.is_some()
    }

    /// Advances the chain with a newly signed commitment; the previous tip
    /// becomes the unrevoked prior.
    ///
    /// Panics when the prior is still unrevoked: the caller must enforce
    /// the sign/revoke alternation before advancing.
    pub fn advance(&mut self, next: Commitment) {
        debug_assert_eq!(next.height, self.tip.height + 1);
        assert!(
            self.prior.is_none(),
            "commitment chain advanced before the prior was revoked"
        );
        self.prior = Some(std::mem::replace(&mut self.tip, next));
    }

    /// Drops the prior commitment after its revocation; returns it for
    /// archival (retribution store, forwarding packages).
    pub fn revoke_prior(&mut self) -> Option<Commitment> {
        self.prior.take()
    }

    /// The highest revoked height: every commitment below the prior (or the
    /// tip, when no revocation is pending) has been revoked.
    pub fn revoked_height(&self) -> u64 {
        match &self.prior {
            Some(prior) => prior.height.saturating_sub(1),
            None => self.tip.height.saturating_sub(1),
        }
    }
}

#[cfg(test)]
mod test {
    use amplify::DumbDefault;
    use lnwire::ChannelId;

    use super::*;

    fn add_update(htlc_id: u64, amount_msat: u64) -> UpdateDetails {
        let mut add = UpdateAddHtlc::dumb_default();
        add.channel_id = ChannelId::dumb_default();
        add.htlc_id = htlc_id;
        add.amount_msat = amount_msat;
        add.cltv_expiry = 500_000;
        UpdateDetails::Add(add)
    }

    #[test]
    fn commitment_content_is_prefix_function() {
        let mut log = UpdateLog::default();
        log.append(Originator::Local, add_update(0, 100_000));
        log.append(Originator::Remote, add_update(0, 50_000));

        // Nothing staged yet: no HTLCs at any height
        assert!(log.htlcs_at(ChainSide::Remote, 1).is_empty());
        assert!(log.has_uncommitted(ChainSide::Remote));

        log.stage_to(ChainSide::Remote, 1);
        assert!(!log.has_uncommitted(ChainSide::Remote));

        let htlcs = log.htlcs_at(ChainSide::Remote, 1);
        assert_eq!(htlcs.len(), 2);
        // On the remote chain the remote's own add is "offered"
        assert_eq!(
            htlcs
                .iter()
                .find(|h| h.direction == HtlcDirection::Offered)
                .unwrap()
                .amount_msat,
            50_000
        );

        // The same prefix on the local chain swaps directions
        log.stage_to(ChainSide::Local, 1);
        let htlcs = log.htlcs_at(ChainSide::Local, 1);
        assert_eq!(
            htlcs
                .iter()
                .find(|h| h.direction == HtlcDirection::Offered)
                .unwrap()
                .amount_msat,
            100_000
        );
    }

    #[test]
    fn removal_excludes_from_later_heights() {
        let mut log = UpdateLog::default();
        log.append(Originator::Local, add_update(0, 100_000));
        log.stage_to(ChainSide::Remote, 1);

        log.append_removal(Originator::Remote, UpdateDetails::Settle {
            htlc_id: 0,
            preimage: HashPreimage::random(),
        })
        .unwrap();
        log.stage_to(ChainSide::Remote, 2);

        assert_eq!(log.htlcs_at(ChainSide::Remote, 1).len(), 1);
        assert!(log.htlcs_at(ChainSide::Remote, 2).is_empty());
    }

    #[test]
    fn double_removal_rejected() {
        let mut log = UpdateLog::default();
        log.append(Originator::Local, add_update(7, 100_000));
        let first = log
            .append_removal(Originator::Remote, UpdateDetails::Fail {
                htlc_id: 7,
                reason: vec![],
            })
            .unwrap();
        assert_eq!(
            log.append_removal(Originator::Remote, UpdateDetails::Fail {
                htlc_id: 7,
                reason: vec![],
            }),
            Err(LogError::AlreadyRemoved(7, first))
        );
        assert_eq!(
            log.append_removal(Originator::Remote, UpdateDetails::Fail {
                htlc_id: 8,
                reason: vec![],
            }),
            Err(LogError::UnknownHtlc(8))
        );
    }

    #[test]
    fn fee_update_applies_from_staged_height() {
        let mut log = UpdateLog::default();
        log.append(Originator::Local, UpdateDetails::Fee {
            feerate_per_kw: 5000,
        });
        assert_eq!(log.feerate_at(ChainSide::Remote, 5), None);
        log.stage_to(ChainSide::Remote, 3);
        assert_eq!(log.feerate_at(ChainSide::Remote, 2), None);
        assert_eq!(log.feerate_at(ChainSide::Remote, 3), Some(5000));
        assert_eq!(log.feerate_at(ChainSide::Remote, 7), Some(5000));
    }

    #[test]
    fn compaction_preserves_live_entries() {
        let mut log = UpdateLog::default();
        log.append(Originator::Local, add_update(0, 100_000));
        log.append(Originator::Local, add_update(1, 200_000));
        log.stage_to(ChainSide::Remote, 1);
        log.stage_to(ChainSide::Local, 1);

        log.append_removal(Originator::Remote, UpdateDetails::Settle {
            htlc_id: 0,
            preimage: HashPreimage::random(),
        })
        .unwrap();
        log.stage_to(ChainSide::Remote, 2);
        log.stage_to(ChainSide::Local, 2);

        // Both chains revoked through height 2: the settled pair is gone,
        // the live add stays
        log.compact(2, 2);
        assert_eq!(log.entries().len(), 1);
        assert!(matches!(
            &log.entries()[0].details,
            UpdateDetails::Add(add) if add.htlc_id == 1
        ));

        // Unrevoked chains keep everything
        let mut log2 = UpdateLog::default();
        log2.append(Originator::Local, add_update(0, 100_000));
        log2.stage_to(ChainSide::Remote, 1);
        log2.append_removal(Originator::Remote, UpdateDetails::Settle {
            htlc_id: 0,
            preimage: HashPreimage::random(),
        })
        .unwrap();
        log2.compact(0, 0);
        assert_eq!(log2.entries().len(), 2);
    }

    #[test]
    fn chain_alternation_enforced() {
        let point = dumb_pubkey!();
        let mut chain = CommitmentChain::with(Commitment::initial(
            600_000_000,
            400_000_000,
            6000,
            point,
        ));
        assert_eq!(chain.height(), 0);
        assert!(!chain.pending_revocation());

        let mut next = chain.tip().clone();
        next.height = 1;
        chain.advance(next);
        assert!(chain.pending_revocation());
        assert_eq!(chain.revoked_height(), 0);
        // revoked_height is saturating at the initial state
        let revoked = chain.revoke_prior().unwrap();
        assert_eq!(revoked.height, 0);
        assert!(!chain.pending_revocation());
    }
}
