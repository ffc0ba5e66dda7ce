//! User activity aggregator.
//!
//! Owns one [`UserStats`] document per user. Every event updates its
//! author's rollup; an invite acceptance also credits the inviter, as a
//! second read-modify-write against the inviter's document that runs only
//! after the author's document is written and its lock released.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::Utc;
use crelay_db::DocumentStore;
use crelay_types::{ActivityEvent, Ballot, InviteStats, ProtocolKinds, UserStats, tags};
use tokio_util::sync::CancellationToken;

use crate::error::{DerivedIndex, DerivedUpdateError, RelayError};
use crate::locks::KeyedLocks;
use crate::typed::{check, collect, fetch, persist};

/// Result of crediting an inviter for an invite acceptance.
#[derive(Debug)]
pub enum InviterCredit {
    /// The event is not an invite acceptance with an inviter.
    NotApplicable,
    /// The inviter's document was updated.
    Credited {
        /// The credited user.
        inviter: String,
    },
    /// The inviter's document could not be updated. Already logged.
    Failed(DerivedUpdateError),
}

/// What a call to [`ActivityAggregator::update`] did.
#[derive(Debug)]
pub struct ActivityUpdate {
    /// The author's statistics as written.
    pub stats: UserStats,
    /// Outcome of the inviter credit.
    pub inviter: InviterCredit,
}

/// Ordering for [`ActivityAggregator::top_users`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ranking {
    /// Events of every kind.
    #[default]
    TotalEvents,
    /// Votes cast, across all subspaces.
    Votes,
    /// Accepted invitations issued.
    Invites,
    /// Events of one kind.
    Kind(u32),
}

impl Ranking {
    /// Parse `total_events`, `votes`, `invites` or `kind:<n>`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "total_events" => Some(Self::TotalEvents),
            "votes" => Some(Self::Votes),
            "invites" => Some(Self::Invites),
            other => other
                .strip_prefix("kind:")
                .and_then(|kind| kind.parse().ok())
                .map(Self::Kind),
        }
    }

    /// The score `stats` is ranked by.
    pub fn score(self, stats: &UserStats) -> u64 {
        match self {
            Self::TotalEvents => stats.event_count(),
            Self::Votes => stats
                .vote_stats
                .as_ref()
                .map_or(0, |votes| votes.total_votes),
            Self::Invites => stats
                .invite_stats
                .as_ref()
                .map_or(0, |invites| invites.total_invited),
            Self::Kind(kind) => stats.total(kind),
        }
    }
}

/// Maintains per-user activity statistics.
pub struct ActivityAggregator {
    store: Arc<dyn DocumentStore>,
    kinds: ProtocolKinds,
    locks: KeyedLocks,
}

impl ActivityAggregator {
    /// Create an aggregator over `store`.
    pub fn new(store: Arc<dyn DocumentStore>, kinds: ProtocolKinds) -> Self {
        Self {
            store,
            kinds,
            locks: KeyedLocks::new(),
        }
    }

    /// Statistics for `user_id`, if any event by or crediting them was seen.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Format`] if the stored document is invalid,
    /// [`RelayError::Store`] on I/O failure, and [`RelayError::Cancelled`]
    /// if `cancel` has fired.
    pub async fn get(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<UserStats>, RelayError> {
        check(cancel)?;
        fetch(&*self.store, user_id).await
    }

    /// Invitations issued by `user_id` that were accepted.
    ///
    /// # Errors
    ///
    /// Same as [`ActivityAggregator::get`].
    pub async fn invites(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<InviteStats>, RelayError> {
        Ok(self
            .get(user_id, cancel)
            .await?
            .and_then(|stats| stats.invite_stats))
    }

    /// Users who joined subspace `id`. Creators who never joined are not
    /// included; see [`ActivityAggregator::participants`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] on I/O failure and
    /// [`RelayError::Cancelled`] if `cancel` fires mid-scan.
    pub async fn users_by_subspace(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserStats>, RelayError> {
        self.query(|stats| stats.has_joined(id), cancel).await
    }

    /// Users who created or joined subspace `id`.
    ///
    /// # Errors
    ///
    /// Same as [`ActivityAggregator::users_by_subspace`].
    pub async fn participants(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserStats>, RelayError> {
        self.query(|stats| stats.participates_in(id), cancel).await
    }

    /// The first `n` users ordered by `ranking`, highest score first. Ties
    /// are broken by user id. Users scoring zero are included last.
    ///
    /// # Errors
    ///
    /// Same as [`ActivityAggregator::users_by_subspace`].
    pub async fn top_users(
        &self,
        n: usize,
        ranking: Ranking,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserStats>, RelayError> {
        let mut users = self.query(|_| true, cancel).await?;
        users.sort_by(|a, b| {
            Reverse(ranking.score(a))
                .cmp(&Reverse(ranking.score(b)))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users.truncate(n);
        Ok(users)
    }

    /// Every user document accepted by `predicate`.
    ///
    /// # Errors
    ///
    /// Same as [`ActivityAggregator::users_by_subspace`].
    pub async fn query<P>(
        &self,
        predicate: P,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserStats>, RelayError>
    where
        P: FnMut(&UserStats) -> bool,
    {
        check(cancel)?;
        collect(&*self.store, predicate, cancel).await
    }

    /// Apply `event` to its author's statistics, then credit the inviter of
    /// an invite acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Format`] if the event has no author or the
    /// stored document is invalid, [`RelayError::Store`] on I/O failure, and
    /// [`RelayError::Cancelled`] if `cancel` fires before the author's
    /// document is written. A failed inviter credit is reported in
    /// [`ActivityUpdate::inviter`], not as an error.
    pub async fn update(
        &self,
        event: &ActivityEvent,
        cancel: &CancellationToken,
    ) -> Result<ActivityUpdate, RelayError> {
        check(cancel)?;
        event.validate()?;
        let now = Utc::now().timestamp();
        let subspace = event.subspace();

        let stats = {
            let _guard = self.locks.lock(&event.pubkey).await;
            check(cancel)?;
            let mut stats = fetch::<UserStats>(&*self.store, &event.pubkey)
                .await?
                .unwrap_or_else(|| UserStats::new(&event.pubkey, now));
            stats.record_kind(event.kind, subspace);
            if let Some(sid) = subspace {
                self.apply_subspace_kind(&mut stats, event, sid);
            }
            stats.last_updated = now;
            check(cancel)?;
            persist(&*self.store, &stats).await?;
            stats
        };

        let inviter = match (subspace, self.inviter_of(event)) {
            (Some(sid), Some(inviter)) => {
                match self.credit_inviter(inviter, &event.pubkey, sid, now, cancel).await {
                    Ok(()) => InviterCredit::Credited {
                        inviter: inviter.to_owned(),
                    },
                    Err(source) => {
                        let error = DerivedUpdateError {
                            index: DerivedIndex::InviterCredit,
                            event_id: event.id.clone(),
                            source,
                        };
                        error.log();
                        InviterCredit::Failed(error)
                    }
                }
            }
            _ => InviterCredit::NotApplicable,
        };

        Ok(ActivityUpdate { stats, inviter })
    }

    fn apply_subspace_kind(&self, stats: &mut UserStats, event: &ActivityEvent, sid: &str) {
        let kind = event.kind;
        if kind == self.kinds.subspace_create {
            stats.created_subspaces.insert(sid.to_owned());
        } else if kind == self.kinds.subspace_join {
            stats.joined_subspaces.insert(sid.to_owned());
        } else if kind == self.kinds.vote {
            let ballot = event.tag_value(tags::VOTE).and_then(Ballot::parse);
            stats.record_vote(sid, ballot);
        }
    }

    fn inviter_of<'a>(&self, event: &'a ActivityEvent) -> Option<&'a str> {
        if event.kind != self.kinds.invite_accept {
            return None;
        }
        event
            .tag_value(tags::INVITER)
            .filter(|inviter| !inviter.is_empty())
    }

    async fn credit_inviter(
        &self,
        inviter: &str,
        invitee: &str,
        sid: &str,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let _guard = self.locks.lock(inviter).await;
        check(cancel)?;
        let mut stats = fetch::<UserStats>(&*self.store, inviter)
            .await?
            .unwrap_or_else(|| UserStats::new(inviter, now));
        stats.record_invite(invitee, sid, now);
        stats.last_updated = now;
        persist(&*self.store, &stats).await
    }
}
