//! In-memory storage backend for susu-ledger.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use susu_ledger_core::{
    Account, AccountId, EventCursor, EventId, EventQuery, GroupId, LedgerEvent, Money, NewEvent,
    PostingRecord, ReportStatus, Side, StorageBackend, StorageError, TaxReport,
};

struct GroupData {
    accounts: BTreeMap<AccountId, LedgerStore>,
    events: BTreeMap<EventCursor, LedgerEvent>,
    next_sequence: u64,
}

impl GroupData {
    fn new() -> Self {
        Self {
            accounts: BTreeMap::new(),
            events: BTreeMap::new(),
            next_sequence: 1,
        }
    }

    fn touches_member(&self, event: &LedgerEvent, member_id: &str) -> bool {
        event.postings.iter().any(|p| {
            self.accounts
                .get(&p.account_id)
                .and_then(|store| store.account.member_id.as_deref())
                == Some(member_id)
        })
    }
}

#[derive(Default)]
struct State {
    groups: BTreeMap<GroupId, GroupData>,
    event_index: HashMap<EventId, (GroupId, EventCursor)>,
    account_index: HashMap<AccountId, GroupId>,
    tax_reports: Vec<TaxReport>,
}

/// Keeps the whole ledger behind one `RwLock`; a batch append takes the write
/// lock once, so readers see either none or all of it.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageBackend for InMemoryStorage {
    fn create_group(&self, group_id: &str, _created_at: OffsetDateTime) -> Result<(), StorageError> {
        let mut state = self.write();
        if state.groups.contains_key(group_id) {
            return Err(StorageError::GroupAlreadyExists(group_id.to_string()));
        }
        state.groups.insert(Arc::from(group_id), GroupData::new());
        tracing::debug!(group_id, "Group created");
        Ok(())
    }

    fn group_exists(&self, group_id: &str) -> Result<bool, StorageError> {
        Ok(self.read().groups.contains_key(group_id))
    }

    fn list_groups(&self) -> Result<Vec<GroupId>, StorageError> {
        Ok(self.read().groups.keys().cloned().collect())
    }

    fn delete_group(&self, group_id: &str) -> Result<(), StorageError> {
        let mut state = self.write();
        let group = state.groups.get(group_id)
            .ok_or_else(|| StorageError::GroupNotFound(group_id.to_string()))?;
        if !group.events.is_empty() {
            return Err(StorageError::GroupHasEvents(group_id.to_string()));
        }
        state.groups.remove(group_id);
        state.account_index.retain(|_, g| g.as_ref() != group_id);
        tracing::debug!(group_id, "Group deleted");
        Ok(())
    }

    fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        let mut state = self.write();
        if state.account_index.contains_key(&account.id) {
            return Err(StorageError::AccountAlreadyExists(account.id.to_string()));
        }
        let group = state.groups.get_mut(&account.group_id)
            .ok_or_else(|| StorageError::GroupNotFound(account.group_id.to_string()))?;
        group.accounts.insert(account.id.clone(), LedgerStore::new(account.clone()));
        state.account_index.insert(account.id.clone(), account.group_id.clone());
        Ok(())
    }

    fn get_account(&self, account_id: &str) -> Result<Account, StorageError> {
        let state = self.read();
        let store = lookup_account(&state, account_id)?;
        Ok(store.account.clone())
    }

    fn list_accounts(&self, group_id: &str) -> Result<Vec<Account>, StorageError> {
        let state = self.read();
        let group = state.groups.get(group_id)
            .ok_or_else(|| StorageError::GroupNotFound(group_id.to_string()))?;
        Ok(group.accounts.values().map(|s| s.account.clone()).collect())
    }

    fn append_events(&self, group_id: &str, events: &[NewEvent]) -> Result<Vec<LedgerEvent>, StorageError> {
        let mut state = self.write();
        let State { groups, event_index, .. } = &mut *state;
        let group = groups.get_mut(group_id)
            .ok_or_else(|| StorageError::GroupNotFound(group_id.to_string()))?;

        // Every referenced account must exist before anything is written.
        for event in events {
            for posting in &event.postings {
                if !group.accounts.contains_key(&posting.account_id) {
                    return Err(StorageError::AccountNotFound(posting.account_id.to_string()));
                }
            }
        }

        let recorded_at = OffsetDateTime::now_utc();
        let mut committed = Vec::with_capacity(events.len());
        for new_event in events {
            let event = LedgerEvent {
                id: Uuid::new_v4(),
                group_id: Arc::from(group_id),
                sequence: group.next_sequence,
                event_type: new_event.event_type,
                timestamp: new_event.timestamp,
                description: new_event.description.clone(),
                corrects: new_event.corrects,
                accrual: new_event.accrual,
                postings: new_event.postings.clone(),
                recorded_at,
            };
            group.next_sequence += 1;

            let cursor = EventCursor::from(&event);
            for posting in &event.postings {
                if let Some(store) = group.accounts.get_mut(&posting.account_id) {
                    store.add_entry(cursor, event.id, posting.side, posting.amount);
                }
            }
            event_index.insert(event.id, (event.group_id.clone(), cursor));
            group.events.insert(cursor, event.clone());
            tracing::debug!(group_id, event_id = %event.id, sequence = event.sequence, "Event appended");
            committed.push(event);
        }

        Ok(committed)
    }

    fn get_event(&self, event_id: EventId) -> Result<LedgerEvent, StorageError> {
        let state = self.read();
        let (group_id, cursor) = state.event_index.get(&event_id)
            .ok_or(StorageError::EventNotFound(event_id))?;
        state.groups.get(group_id)
            .and_then(|g| g.events.get(cursor))
            .cloned()
            .ok_or(StorageError::EventNotFound(event_id))
    }

    fn load_events(&self, group_id: &str, query: &EventQuery) -> Result<Vec<LedgerEvent>, StorageError> {
        let state = self.read();
        let group = state.groups.get(group_id)
            .ok_or_else(|| StorageError::GroupNotFound(group_id.to_string()))?;

        let lower = match (query.after, query.filter.from_time) {
            (Some(after), _) => Bound::Excluded(after),
            (None, Some(from)) => Bound::Included(EventCursor { timestamp: from, sequence: 0 }),
            (None, None) => Bound::Unbounded,
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        let filter = &query.filter;

        let events = group.events.range((lower, Bound::Unbounded))
            .map(|(_, e)| e)
            .take_while(|e| filter.to_time.map_or(true, |to| e.timestamp <= to))
            .filter(|e| filter.matches_time(e.timestamp))
            .filter(|e| filter.event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| filter.member_id.as_deref().map_or(true, |m| group.touches_member(e, m)))
            .take(limit)
            .cloned()
            .collect();

        Ok(events)
    }

    fn account_postings(&self, account_id: &str, as_of: Option<OffsetDateTime>) -> Result<Vec<PostingRecord>, StorageError> {
        let state = self.read();
        let store = lookup_account(&state, account_id)?;
        Ok(store.postings(as_of))
    }

    fn cached_balance(&self, account_id: &str) -> Result<Decimal, StorageError> {
        let state = self.read();
        let store = lookup_account(&state, account_id)?;
        Ok(store.running_total)
    }

    fn insert_tax_report(&self, report: &TaxReport) -> Result<(), StorageError> {
        let mut state = self.write();
        if state.tax_reports.iter().any(|r| r.id == report.id) {
            return Err(StorageError::Other(format!("tax report already stored: {}", report.id)));
        }
        state.tax_reports.push(report.clone());
        tracing::debug!(member_id = %report.member_id, tax_year = report.tax_year, version = report.version, "Tax report stored");
        Ok(())
    }

    fn list_tax_reports(&self, member_id: &str, tax_year: Option<i32>) -> Result<Vec<TaxReport>, StorageError> {
        let state = self.read();
        let mut reports: Vec<TaxReport> = state.tax_reports.iter()
            .filter(|r| r.member_id.as_ref() == member_id)
            .filter(|r| tax_year.map_or(true, |y| r.tax_year == y))
            .cloned()
            .collect();
        reports.sort_by_key(|r| (r.tax_year, r.version));
        Ok(reports)
    }

    fn finalize_tax_report(&self, report_id: Uuid, finalized_at: OffsetDateTime) -> Result<TaxReport, StorageError> {
        let mut state = self.write();
        let report = state.tax_reports.iter_mut()
            .find(|r| r.id == report_id)
            .ok_or(StorageError::ReportNotFound(report_id))?;
        if report.status == ReportStatus::Final {
            return Err(StorageError::ReportAlreadyFinal(report_id));
        }
        report.status = ReportStatus::Final;
        report.finalized_at = Some(finalized_at);
        tracing::debug!(report_id = %report_id, "Tax report finalized");
        Ok(report.clone())
    }
}

fn lookup_account<'a>(state: &'a State, account_id: &str) -> Result<&'a LedgerStore, StorageError> {
    state.account_index.get(account_id)
        .and_then(|group_id| state.groups.get(group_id))
        .and_then(|group| group.accounts.get(account_id))
        .ok_or_else(|| StorageError::AccountNotFound(account_id.to_string()))
}

struct LedgerStore {
    account: Account,
    entries: BTreeMap<EventCursor, Vec<(EventId, Side, Money)>>,
    running_total: Decimal,
}

impl LedgerStore {
    fn new(account: Account) -> Self {
        Self {
            account,
            entries: BTreeMap::new(),
            running_total: Decimal::ZERO,
        }
    }

    fn add_entry(&mut self, cursor: EventCursor, event_id: EventId, side: Side, amount: Money) {
        self.running_total += self.account.signed(side, amount.amount());
        self.entries.entry(cursor).or_default().push((event_id, side, amount));
    }

    fn postings(&self, as_of: Option<OffsetDateTime>) -> Vec<PostingRecord> {
        let upper = match as_of {
            Some(ts) => Bound::Included(EventCursor { timestamp: ts, sequence: u64::MAX }),
            None => Bound::Unbounded,
        };
        self.entries.range((Bound::Unbounded, upper))
            .flat_map(|(cursor, entries)| {
                entries.iter().map(move |(event_id, side, amount)| PostingRecord {
                    event_id: *event_id,
                    sequence: cursor.sequence,
                    timestamp: cursor.timestamp,
                    side: *side,
                    amount: *amount,
                })
            })
            .collect()
    }
}
