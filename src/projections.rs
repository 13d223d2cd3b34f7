use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use susu_ledger_core::{
    Account, AccountId, AccrualPeriod, EventId, EventQuery, EventType, GroupId, LedgerEvent, MemberId, Money,
    NewEvent, Posting, StorageBackend,
};

use crate::{
    error::LedgerError,
    shares::MemberShare,
    tax::{tax_year_of, years_spanned},
};

/// Interest and cash movements attributed to one member in one calendar year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxBucket {
    pub member_id: MemberId,
    pub tax_year: i32,
    pub interest: Money,
    pub contributions: Money,
    pub withdrawals: Money,
    pub event_ids: BTreeSet<EventId>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl TaxBucket {
    fn new(member_id: MemberId, tax_year: i32, at: OffsetDateTime) -> Self {
        Self {
            member_id,
            tax_year,
            interest: Money::ZERO,
            contributions: Money::ZERO,
            withdrawals: Money::ZERO,
            event_ids: BTreeSet::new(),
            last_updated: at,
        }
    }
}

/// A member's equity in one group split by where it came from.
///
/// `principal` moves with contributions and payouts, `earnings` with interest
/// accruals and `fees` with fees charged; corrections move whichever part the
/// corrected event moved. The member's equity balance equals
/// `principal + earnings - fees`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSplit {
    pub group_id: GroupId,
    pub member_id: MemberId,
    pub principal: Money,
    pub earnings: Money,
    pub fees: Money,
}

impl MemberSplit {
    fn new(group_id: GroupId, member_id: MemberId) -> Self {
        Self {
            group_id,
            member_id,
            principal: Money::ZERO,
            earnings: Money::ZERO,
            fees: Money::ZERO,
        }
    }
}

/// Where a member stands in one group: the equity balance split into its
/// sources, plus the current tax year's movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberPosition {
    pub group_id: GroupId,
    pub member_id: MemberId,
    pub principal: Money,
    pub earnings: Money,
    pub fees: Money,
    pub balance: Money,
    pub tax_year: i32,
    pub interest_ytd: Money,
    pub contributions_ytd: Money,
    pub withdrawals_ytd: Money,
}

/// What a correction chain ultimately corrects.
#[derive(Debug, Clone, Copy)]
struct Origin {
    event_type: EventType,
    accrual: Option<AccrualPeriod>,
}

enum Change {
    Share { group: GroupId, member: MemberId, delta: Decimal },
    Earnings { group: GroupId, member: MemberId, amount: Money },
    Fee { group: GroupId, member: MemberId, amount: Money },
    Contribution { member: MemberId, year: i32, amount: Money },
    Withdrawal { member: MemberId, year: i32, amount: Money },
    Interest { member: MemberId, year: i32, amount: Money },
}

#[derive(Default)]
struct ProjectionState {
    shares: BTreeMap<(GroupId, MemberId), MemberShare>,
    buckets: BTreeMap<(MemberId, i32), TaxBucket>,
    splits: BTreeMap<(GroupId, MemberId), MemberSplit>,
    origins: HashMap<EventId, Origin>,
    applied: HashSet<EventId>,
}

/// Rebuildable caches derived from the event log: member shares, tax
/// buckets and account metadata.
pub struct ProjectionCache {
    storage: Arc<dyn StorageBackend>,
    accounts: RwLock<HashMap<AccountId, Account>>,
    state: RwLock<ProjectionState>,
    stale: AtomicBool,
}

impl ProjectionCache {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            accounts: RwLock::new(HashMap::new()),
            state: RwLock::new(ProjectionState::default()),
            stale: AtomicBool::new(false),
        }
    }

    /// Account metadata, read through to storage on a miss. Accounts never
    /// change type, so cached entries stay valid.
    pub fn account(&self, account_id: &str) -> Result<Account, LedgerError> {
        if let Some(account) = self.accounts.read().unwrap_or_else(PoisonError::into_inner).get(account_id) {
            return Ok(account.clone());
        }
        let account = self.storage.get_account(account_id)?;
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.id.clone(), account.clone());
        Ok(account)
    }

    pub fn forget_group(&self, group_id: &str) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, account| account.group_id.as_ref() != group_id);
    }

    /// The root type and accrual window of the event a correction chain
    /// ends at.
    pub fn origin_of(&self, event_id: EventId) -> Option<(EventType, Option<AccrualPeriod>)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.origins.get(&event_id).map(|o| (o.event_type, o.accrual))
    }

    /// Works out what `events` would change without touching any cache, so
    /// a batch that cannot be projected is refused before it is stored.
    pub fn check(&self, events: &[NewEvent]) -> Result<(), LedgerError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            let origin = origin_for(&state, event.corrects, event.event_type, event.accrual);
            for posting in &event.postings {
                let account = self.account(&posting.account_id)?;
                if let Some(member) = &account.member_id {
                    changes_for(event.timestamp, event.accrual, origin, &account, member, posting)?;
                }
            }
        }
        Ok(())
    }

    /// Folds events that are already stored into the caches. A failure marks
    /// the caches stale instead of failing the commit; `refresh` replays the
    /// log before they are read again.
    pub fn record_committed(&self, events: &[LedgerEvent]) {
        if let Err(e) = self.apply(events) {
            self.stale.store(true, Ordering::SeqCst);
            tracing::error!(error = %e, events = events.len(), "Projection update failed, caches marked stale");
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Replays the event log if an earlier update left the caches stale.
    pub fn refresh(&self) -> Result<(), LedgerError> {
        if self.is_stale() {
            self.rebuild()?;
        }
        Ok(())
    }

    pub fn apply(&self, events: &[LedgerEvent]) -> Result<(), LedgerError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            self.apply_event(&mut state, event)?;
        }
        Ok(())
    }

    /// Discards every projection and replays all groups in commit order.
    pub fn rebuild(&self) -> Result<usize, LedgerError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        self.stale.store(false, Ordering::SeqCst);
        match self.replay() {
            Ok((fresh, replayed)) => {
                *state = fresh;
                tracing::info!(replayed, "Projections rebuilt from event log");
                Ok(replayed)
            }
            Err(e) => {
                self.stale.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn replay(&self) -> Result<(ProjectionState, usize), LedgerError> {
        let mut fresh = ProjectionState::default();
        let mut replayed = 0;

        for group_id in self.storage.list_groups()? {
            let mut events = self.storage.load_events(&group_id, &EventQuery::default())?;
            events.sort_by_key(|e| e.sequence);
            for event in &events {
                self.apply_event(&mut fresh, event)?;
            }
            replayed += events.len();
        }
        Ok((fresh, replayed))
    }

    pub fn member_share(&self, group_id: &str, member_id: &str) -> Option<MemberShare> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.shares.get(&(Arc::from(group_id), Arc::from(member_id))).cloned()
    }

    pub fn member_shares(&self, group_id: &str) -> Vec<MemberShare> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .shares
            .values()
            .filter(|s| s.group_id.as_ref() == group_id)
            .cloned()
            .collect()
    }

    pub fn tax_bucket(&self, member_id: &str, tax_year: i32) -> Option<TaxBucket> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.buckets.get(&(Arc::from(member_id), tax_year)).cloned()
    }

    pub fn member_split(&self, group_id: &str, member_id: &str) -> Option<MemberSplit> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.splits.get(&(Arc::from(group_id), Arc::from(member_id))).cloned()
    }

    pub fn member_splits(&self, group_id: &str) -> Vec<MemberSplit> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .splits
            .values()
            .filter(|s| s.group_id.as_ref() == group_id)
            .cloned()
            .collect()
    }

    fn apply_event(&self, state: &mut ProjectionState, event: &LedgerEvent) -> Result<(), LedgerError> {
        if state.applied.contains(&event.id) {
            return Ok(());
        }

        let origin = origin_for(state, event.corrects, event.event_type, event.accrual);

        let mut changes = Vec::new();
        for posting in &event.postings {
            let account = self.account(&posting.account_id)?;
            if let Some(member) = &account.member_id {
                changes.extend(changes_for(event.timestamp, event.accrual, origin, &account, member, posting)?);
            }
        }

        for change in changes {
            match change {
                Change::Share { group, member, delta } => {
                    split(state, &group, &member).principal += Money::rounded(delta);
                    state
                        .shares
                        .entry((group.clone(), member.clone()))
                        .or_insert_with(|| MemberShare::new(group, member))
                        .record(event.timestamp, event.sequence, delta);
                }
                Change::Earnings { group, member, amount } => {
                    split(state, &group, &member).earnings += amount;
                }
                Change::Fee { group, member, amount } => {
                    split(state, &group, &member).fees += amount;
                }
                Change::Contribution { member, year, amount } => {
                    bucket(state, member, year, event.timestamp).contributions += amount;
                }
                Change::Withdrawal { member, year, amount } => {
                    bucket(state, member, year, event.timestamp).withdrawals += amount;
                }
                Change::Interest { member, year, amount } => {
                    let bucket = bucket(state, member, year, event.timestamp);
                    bucket.interest += amount;
                    bucket.event_ids.insert(event.id);
                }
            }
        }

        state.origins.insert(event.id, origin);
        state.applied.insert(event.id);
        Ok(())
    }
}

fn origin_for(
    state: &ProjectionState,
    corrects: Option<EventId>,
    event_type: EventType,
    accrual: Option<AccrualPeriod>,
) -> Origin {
    match corrects {
        Some(original) => state.origins.get(&original).copied().unwrap_or(Origin {
            event_type: EventType::Correction,
            accrual: None,
        }),
        None => Origin { event_type, accrual },
    }
}

fn split<'a>(state: &'a mut ProjectionState, group: &GroupId, member: &MemberId) -> &'a mut MemberSplit {
    state
        .splits
        .entry((group.clone(), member.clone()))
        .or_insert_with(|| MemberSplit::new(group.clone(), member.clone()))
}

fn bucket(state: &mut ProjectionState, member: MemberId, year: i32, at: OffsetDateTime) -> &mut TaxBucket {
    let bucket = state
        .buckets
        .entry((member.clone(), year))
        .or_insert_with(|| TaxBucket::new(member, year, at));
    bucket.last_updated = bucket.last_updated.max(at);
    bucket
}

fn changes_for(
    timestamp: OffsetDateTime,
    accrual: Option<AccrualPeriod>,
    origin: Origin,
    account: &Account,
    member: &MemberId,
    posting: &Posting,
) -> Result<Vec<Change>, LedgerError> {
    let amount = if posting.side == account.normal_side() {
        posting.amount
    } else {
        -posting.amount
    };
    let year = tax_year_of(timestamp);

    let changes = match origin.event_type {
        EventType::Contribution => vec![
            Change::Share { group: account.group_id.clone(), member: member.clone(), delta: amount.amount() },
            Change::Contribution { member: member.clone(), year, amount },
        ],
        EventType::Payout => vec![
            Change::Share { group: account.group_id.clone(), member: member.clone(), delta: amount.amount() },
            Change::Withdrawal { member: member.clone(), year, amount: -amount },
        ],
        EventType::InterestAccrual => {
            let period = origin.accrual.or(accrual);
            let mut changes = vec![Change::Earnings { group: account.group_id.clone(), member: member.clone(), amount }];
            changes.extend(
                split_by_year(period, timestamp, amount)?
                    .into_iter()
                    .map(|(year, amount)| Change::Interest { member: member.clone(), year, amount }),
            );
            changes
        }
        EventType::Fee => vec![Change::Fee { group: account.group_id.clone(), member: member.clone(), amount: -amount }],
        EventType::Correction => Vec::new(),
    };
    Ok(changes)
}

/// Splits an accrued amount across the calendar years its window covers,
/// pro rata by elapsed seconds. Without a window the whole amount lands in
/// the year of `fallback`.
pub fn split_by_year(
    period: Option<AccrualPeriod>,
    fallback: OffsetDateTime,
    amount: Money,
) -> Result<Vec<(i32, Money)>, LedgerError> {
    let spans = match period {
        Some(period) => years_spanned(&period)?,
        None => Vec::new(),
    };
    if spans.is_empty() {
        return Ok(vec![(tax_year_of(fallback), amount)]);
    }
    let weights: Vec<Decimal> = spans.iter().map(|(_, secs)| Decimal::from(*secs)).collect();
    let parts = amount.allocate(&weights)?;
    Ok(spans.into_iter().map(|(year, _)| year).zip(parts).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use susu_ledger_core::{AccountType, NewEvent};
    use susu_ledger_memory::InMemoryStorage;
    use time::macros::datetime;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<InMemoryStorage>, ProjectionCache) {
        let storage = Arc::new(InMemoryStorage::new());
        storage.create_group("g1", datetime!(2024-01-01 0:00 UTC)).unwrap();
        for account in [
            Account::new("g1", AccountType::Asset, None),
            Account::new("g1", AccountType::Expense, None),
            Account::new("g1", AccountType::Revenue, None),
            Account::new("g1", AccountType::Equity, Some("alice")),
        ] {
            storage.create_account(&account).unwrap();
        }
        let cache = ProjectionCache::new(storage.clone());
        (storage, cache)
    }

    #[test]
    fn test_split_by_year_is_pro_rata() {
        let period = AccrualPeriod::new(datetime!(2024-12-22 0:00 UTC), datetime!(2025-01-11 0:00 UTC));
        let parts = split_by_year(period, datetime!(2025-01-11 0:00 UTC), money("2.00")).unwrap();
        assert_eq!(parts, vec![(2024, money("1.00")), (2025, money("1.00"))]);

        let parts = split_by_year(None, datetime!(2024-03-01 0:00 UTC), money("2.00")).unwrap();
        assert_eq!(parts, vec![(2024, money("2.00"))]);

        // One day either side of a full year: the cents stay where the time was
        let wide = AccrualPeriod::new(datetime!(2023-12-31 0:00 UTC), datetime!(2025-01-02 0:00 UTC));
        let parts = split_by_year(wide, datetime!(2025-01-02 0:00 UTC), money("0.03")).unwrap();
        assert_eq!(parts, vec![(2023, Money::ZERO), (2024, money("0.03")), (2025, Money::ZERO)]);

        let parts = split_by_year(wide, datetime!(2025-01-02 0:00 UTC), money("-0.03")).unwrap();
        assert!(parts.iter().all(|(_, part)| !part.is_positive()));
        assert_eq!(parts.iter().map(|(_, part)| *part).sum::<Money>(), money("-0.03"));
    }

    #[test]
    fn test_contribution_and_accrual_feed_projections() {
        let (storage, cache) = setup();
        let period = AccrualPeriod::new(datetime!(2024-12-22 0:00 UTC), datetime!(2025-01-11 0:00 UTC)).unwrap();
        let events = storage
            .append_events(
                "g1",
                &[
                    NewEvent::new(
                        EventType::Contribution,
                        datetime!(2024-12-01 0:00 UTC),
                        "Contribution",
                        vec![Posting::debit("g1:asset", money("100.00")), Posting::credit("g1:equity:alice", money("100.00"))],
                    ),
                    NewEvent::new(
                        EventType::InterestAccrual,
                        period.end,
                        "Interest",
                        vec![Posting::debit("g1:expense", money("4.00")), Posting::credit("g1:equity:alice", money("4.00"))],
                    )
                    .covering(period),
                ],
            )
            .unwrap();
        cache.apply(&events).unwrap();
        // Applying twice is harmless.
        cache.apply(&events).unwrap();

        let share = cache.member_share("g1", "alice").unwrap();
        assert_eq!(share.entries().len(), 1);

        let y2024 = cache.tax_bucket("alice", 2024).unwrap();
        assert_eq!(y2024.contributions, money("100.00"));
        assert_eq!(y2024.interest, money("2.00"));
        assert_eq!(cache.tax_bucket("alice", 2025).unwrap().interest, money("2.00"));
        assert!(y2024.event_ids.contains(&events[1].id));
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let (storage, cache) = setup();
        let events = storage
            .append_events(
                "g1",
                &[NewEvent::new(
                    EventType::Contribution,
                    datetime!(2024-02-01 0:00 UTC),
                    "Contribution",
                    vec![Posting::debit("g1:asset", money("10.00")), Posting::credit("g1:equity:alice", money("10.00"))],
                )],
            )
            .unwrap();
        cache.apply(&events).unwrap();
        let before = cache.tax_bucket("alice", 2024);

        assert_eq!(cache.rebuild().unwrap(), 1);
        assert_eq!(cache.tax_bucket("alice", 2024), before);
        assert_eq!(cache.member_shares("g1").len(), 1);
    }

    #[test]
    fn test_member_split_tracks_principal_earnings_and_fees() {
        let (storage, cache) = setup();
        let events = storage
            .append_events(
                "g1",
                &[
                    NewEvent::new(
                        EventType::Contribution,
                        datetime!(2024-02-01 0:00 UTC),
                        "Contribution",
                        vec![Posting::debit("g1:asset", money("100.00")), Posting::credit("g1:equity:alice", money("100.00"))],
                    ),
                    NewEvent::new(
                        EventType::InterestAccrual,
                        datetime!(2024-03-01 0:00 UTC),
                        "Interest",
                        vec![Posting::debit("g1:expense", money("4.00")), Posting::credit("g1:equity:alice", money("4.00"))],
                    ),
                    NewEvent::new(
                        EventType::Fee,
                        datetime!(2024-03-02 0:00 UTC),
                        "Fee",
                        vec![Posting::debit("g1:equity:alice", money("1.50")), Posting::credit("g1:revenue", money("1.50"))],
                    ),
                ],
            )
            .unwrap();
        cache.apply(&events).unwrap();

        // Reversing the accrual takes the earnings back out
        let reversal = storage
            .append_events(
                "g1",
                &[NewEvent::new(
                    EventType::Correction,
                    datetime!(2024-03-03 0:00 UTC),
                    "Reversal",
                    vec![Posting::debit("g1:equity:alice", money("4.00")), Posting::credit("g1:expense", money("4.00"))],
                )
                .correcting(events[1].id)],
            )
            .unwrap();
        cache.apply(&reversal).unwrap();

        let split = cache.member_split("g1", "alice").unwrap();
        assert_eq!(split.principal, money("100.00"));
        assert_eq!(split.earnings, Money::ZERO);
        assert_eq!(split.fees, money("1.50"));
        assert_eq!(cache.member_splits("g1"), vec![split]);
    }

    #[test]
    fn test_check_refuses_unprojectable_events() {
        let (_storage, cache) = setup();
        let period = AccrualPeriod::new(datetime!(9999-06-01 0:00 UTC), datetime!(9999-07-01 0:00 UTC)).unwrap();
        let event = NewEvent::new(
            EventType::InterestAccrual,
            period.end,
            "Interest",
            vec![Posting::debit("g1:expense", money("1.00")), Posting::credit("g1:equity:alice", money("1.00"))],
        )
        .covering(period);

        assert!(matches!(cache.check(&[event]), Err(LedgerError::InvalidPeriod(_))));

        let stray = NewEvent::new(
            EventType::Contribution,
            datetime!(2024-02-01 0:00 UTC),
            "Contribution",
            vec![Posting::debit("g1:asset", money("1.00")), Posting::credit("g1:equity:bob", money("1.00"))],
        );
        assert!(cache.check(&[stray]).is_err());
    }

    #[test]
    fn test_failed_update_marks_cache_stale_until_refreshed() {
        let (storage, cache) = setup();
        let good = storage
            .append_events(
                "g1",
                &[NewEvent::new(
                    EventType::Contribution,
                    datetime!(2024-02-01 0:00 UTC),
                    "Contribution",
                    vec![Posting::debit("g1:asset", money("10.00")), Posting::credit("g1:equity:alice", money("10.00"))],
                )],
            )
            .unwrap();

        // Simulate an update that could not be folded in
        let mut unknown = good.clone();
        unknown[0].postings[1].account_id = Arc::from("g1:equity:ghost");
        cache.record_committed(&unknown);
        assert!(cache.is_stale());
        assert_eq!(cache.tax_bucket("alice", 2024), None);

        cache.refresh().unwrap();
        assert!(!cache.is_stale());
        assert_eq!(cache.tax_bucket("alice", 2024).unwrap().contributions, money("10.00"));

        // A fresh cache is left alone
        cache.refresh().unwrap();
        assert_eq!(cache.member_shares("g1").len(), 1);
    }
}
