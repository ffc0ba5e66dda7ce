//! Derived index records.
//!
//! Both records evolve strictly `{absent} -> {initialized} -> {updated}*`:
//! they are created on first reference, mutated by later events, and never
//! deleted. Every mutator here is monotone. Counters only grow (saturating
//! at `u64::MAX`), registered keys are never removed, and the event log and
//! membership sets never hold duplicates.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::SubspaceId;

// ---------------------------------------------------------------------------
// SubspaceCausality
// ---------------------------------------------------------------------------

/// Per-subspace causality counters, an approximation of a Lamport clock
/// keyed by application-defined causality keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubspaceCausality {
    /// The subspace this record belongs to. Also the document key.
    pub subspace_id: SubspaceId,
    /// Causality key id to counter.
    #[serde(default)]
    pub keys: BTreeMap<u32, u64>,
    /// Operation name to causality key id, as declared by the creation
    /// event's `ops` tag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ops: BTreeMap<String, u32>,
    /// Ids of events seen for this subspace, first-seen order, no duplicates.
    #[serde(default)]
    pub events: Vec<String>,
    /// Unix seconds when the record was initialized.
    pub created: i64,
    /// Unix seconds of the last update.
    pub updated: i64,
}

impl SubspaceCausality {
    /// An empty record for `subspace_id`.
    pub const fn new(subspace_id: SubspaceId, now: i64) -> Self {
        Self {
            subspace_id,
            keys: BTreeMap::new(),
            ops: BTreeMap::new(),
            events: Vec::new(),
            created: now,
            updated: now,
        }
    }

    /// Whether `event_id` is already in the event log.
    pub fn has_event(&self, event_id: &str) -> bool {
        self.events.iter().any(|id| id == event_id)
    }

    /// Append `event_id` to the log unless present. Returns true if added.
    pub fn record_event(&mut self, event_id: &str) -> bool {
        if self.has_event(event_id) {
            return false;
        }
        self.events.push(event_id.to_owned());
        true
    }

    /// Register `key` with a zero counter. An existing counter is untouched.
    pub fn register_key(&mut self, key: u32) {
        self.keys.entry(key).or_insert(0);
    }

    /// Register operation `name` as causality key `key`.
    ///
    /// The first declaration of a name wins; later ones never remap it.
    pub fn register_operation(&mut self, name: &str, key: u32) {
        self.register_key(key);
        if !name.is_empty() {
            self.ops.entry(name.to_owned()).or_insert(key);
        }
    }

    /// Counter for `key`, 0 when unregistered.
    pub fn counter(&self, key: u32) -> u64 {
        self.keys.get(&key).copied().unwrap_or(0)
    }

    /// Increment a registered key and return its new value.
    ///
    /// Returns `None` without registering anything if `key` is unknown.
    pub fn increment(&mut self, key: u32) -> Option<u64> {
        let counter = self.keys.get_mut(&key)?;
        *counter = counter.saturating_add(1);
        Some(*counter)
    }
}

// ---------------------------------------------------------------------------
// UserStats
// ---------------------------------------------------------------------------

/// A vote direction read from the `vote` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ballot {
    /// `vote=yes`
    Yes,
    /// `vote=no`
    No,
}

impl Ballot {
    /// Parse a `vote` tag value. Anything other than `yes`/`no` is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            _ => None,
        }
    }
}

/// Vote counts at one granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    /// Every vote, including those with no recognised direction.
    pub total_votes: u64,
    /// Votes tagged `yes`.
    pub yes_votes: u64,
    /// Votes tagged `no`.
    pub no_votes: u64,
}

impl VoteTally {
    /// Count one vote.
    pub const fn record(&mut self, ballot: Option<Ballot>) {
        self.total_votes = self.total_votes.saturating_add(1);
        match ballot {
            Some(Ballot::Yes) => self.yes_votes = self.yes_votes.saturating_add(1),
            Some(Ballot::No) => self.no_votes = self.no_votes.saturating_add(1),
            None => {}
        }
    }
}

/// A user's voting history, overall and per subspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteStats {
    /// Votes across all subspaces.
    pub total_votes: u64,
    /// `yes` votes across all subspaces.
    pub yes_votes: u64,
    /// `no` votes across all subspaces.
    pub no_votes: u64,
    /// Per-subspace tallies.
    #[serde(default)]
    pub subspace_votes: BTreeMap<String, VoteTally>,
}

impl VoteStats {
    /// The overall tally as a [`VoteTally`].
    pub const fn overall(&self) -> VoteTally {
        VoteTally {
            total_votes: self.total_votes,
            yes_votes: self.yes_votes,
            no_votes: self.no_votes,
        }
    }

    /// Count one vote in `subspace` at both granularities.
    pub fn record(&mut self, subspace: &str, ballot: Option<Ballot>) {
        let mut overall = self.overall();
        overall.record(ballot);
        self.total_votes = overall.total_votes;
        self.yes_votes = overall.yes_votes;
        self.no_votes = overall.no_votes;
        self.subspace_votes
            .entry(subspace.to_owned())
            .or_default()
            .record(ballot);
    }
}

/// One accepted invitation, recorded on the inviter's document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitedUser {
    /// The user who accepted.
    #[serde(rename = "user_id")]
    pub invitee: String,
    /// The subspace they joined.
    #[serde(rename = "subspace_id")]
    pub subspace: String,
    /// Unix seconds when the acceptance was processed.
    pub timestamp: i64,
}

/// Invitations a user has issued that were accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteStats {
    /// Accepted invitations across all subspaces.
    pub total_invited: u64,
    /// Accepted invitations per subspace.
    #[serde(default)]
    pub subspace_invited: BTreeMap<String, u64>,
    /// Acceptance records per subspace, in arrival order.
    #[serde(default)]
    pub invited_users: BTreeMap<String, Vec<InvitedUser>>,
}

impl InviteStats {
    /// Record that `invitee` accepted an invitation into `subspace`.
    pub fn record(&mut self, invitee: &str, subspace: &str, timestamp: i64) {
        self.total_invited = self.total_invited.saturating_add(1);
        let per_subspace = self
            .subspace_invited
            .entry(subspace.to_owned())
            .or_insert(0);
        *per_subspace = per_subspace.saturating_add(1);
        self.invited_users
            .entry(subspace.to_owned())
            .or_default()
            .push(InvitedUser {
                invitee: invitee.to_owned(),
                subspace: subspace.to_owned(),
                timestamp,
            });
    }
}

/// Per-user activity rollup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    /// The user id (author key). Stored as the document key, not a field.
    #[serde(skip)]
    pub user_id: String,
    /// Kind to event count, across all subspaces.
    #[serde(default)]
    pub total_stats: BTreeMap<u32, u64>,
    /// Subspace id to kind to event count.
    #[serde(default)]
    pub subspace_stats: BTreeMap<String, BTreeMap<u32, u64>>,
    /// Subspaces this user created.
    #[serde(default)]
    pub created_subspaces: BTreeSet<String>,
    /// Subspaces this user joined.
    #[serde(default)]
    pub joined_subspaces: BTreeSet<String>,
    /// Voting history, absent until the first vote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_stats: Option<VoteStats>,
    /// Accepted invitations this user issued, absent until the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_stats: Option<InviteStats>,
    /// Unix seconds of the last update.
    pub last_updated: i64,
}

impl UserStats {
    /// An empty rollup for `user_id`.
    pub fn new(user_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_owned(),
            last_updated: now,
            ..Self::default()
        }
    }

    /// Count one event of `kind`, optionally inside `subspace`.
    pub fn record_kind(&mut self, kind: u32, subspace: Option<&str>) {
        bump(&mut self.total_stats, kind);
        if let Some(sid) = subspace {
            bump(self.subspace_stats.entry(sid.to_owned()).or_default(), kind);
        }
    }

    /// Total events of `kind` across all subspaces.
    pub fn total(&self, kind: u32) -> u64 {
        self.total_stats.get(&kind).copied().unwrap_or(0)
    }

    /// Sum of all event counts.
    pub fn event_count(&self) -> u64 {
        self.total_stats
            .values()
            .fold(0_u64, |acc, n| acc.saturating_add(*n))
    }

    /// Whether the user joined `subspace`.
    pub fn has_joined(&self, subspace: &str) -> bool {
        self.joined_subspaces.contains(subspace)
    }

    /// Whether the user created or joined `subspace`.
    pub fn participates_in(&self, subspace: &str) -> bool {
        self.has_joined(subspace) || self.created_subspaces.contains(subspace)
    }

    /// Count a vote, creating the vote stats on first use.
    pub fn record_vote(&mut self, subspace: &str, ballot: Option<Ballot>) {
        self.vote_stats
            .get_or_insert_with(VoteStats::default)
            .record(subspace, ballot);
    }

    /// Credit this user with an accepted invitation.
    pub fn record_invite(&mut self, invitee: &str, subspace: &str, timestamp: i64) {
        self.invite_stats
            .get_or_insert_with(InviteStats::default)
            .record(invitee, subspace, timestamp);
    }
}

fn bump(counts: &mut BTreeMap<u32, u64>, kind: u32) {
    let n = counts.entry(kind).or_insert(0);
    *n = n.saturating_add(1);
}
