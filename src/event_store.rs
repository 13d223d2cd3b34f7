use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use time::OffsetDateTime;

use susu_ledger_core::{
    AccrualPeriod, EventCursor, EventFilter, EventId, EventQuery, EventType, GroupId, LedgerEvent, NewEvent,
    Posting, StorageBackend,
};

use crate::{
    error::LedgerError,
    projections::ProjectionCache,
    tax::{years_spanned, tax_year_of, ReportingGate},
    validator::PostingValidator,
};

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// One mutex per group, created on first use.
#[derive(Default)]
struct GroupLocks(Mutex<HashMap<GroupId, Arc<Mutex<()>>>>);

impl GroupLocks {
    fn get(&self, group_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(Arc::from(group_id)).or_default().clone()
    }
}

/// Append-only event log: validation, per-group serialized commits and
/// projection maintenance.
pub struct EventStore {
    storage: Arc<dyn StorageBackend>,
    projections: Arc<ProjectionCache>,
    gate: Arc<ReportingGate>,
    locks: GroupLocks,
    page_size: usize,
}

impl EventStore {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        projections: Arc<ProjectionCache>,
        gate: Arc<ReportingGate>,
        page_size: usize,
    ) -> Self {
        Self {
            storage,
            projections,
            gate,
            locks: GroupLocks::default(),
            page_size: page_size.max(1),
        }
    }

    /// Runs `f` while holding the group's commit lock.
    pub fn with_group_lock<T>(&self, group_id: &str, f: impl FnOnce() -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        let lock = self.locks.get(group_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    pub fn propose_event(
        &self,
        group_id: &str,
        event_type: EventType,
        timestamp: OffsetDateTime,
        description: &str,
        postings: Vec<Posting>,
    ) -> Result<LedgerEvent, LedgerError> {
        let event = NewEvent::new(event_type, timestamp, description, postings);
        self.commit(group_id, vec![event])?
            .pop()
            .ok_or_else(|| LedgerError::EmptyEvent(0))
    }

    pub fn commit(&self, group_id: &str, events: Vec<NewEvent>) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.with_group_lock(group_id, || self.commit_locked(group_id, &events))
    }

    /// Validates and appends a batch; the caller holds the group lock.
    /// Either every event commits or none does.
    pub(crate) fn commit_locked(&self, group_id: &str, events: &[NewEvent]) -> Result<Vec<LedgerEvent>, LedgerError> {
        let result = self.validate_and_append(group_id, events);
        match &result {
            Ok(committed) => {
                for event in committed {
                    metrics::counter!("ledger_events_committed_total", 1, "type" => event.event_type.as_str());
                    tracing::info!(
                        group_id,
                        event_id = %event.id,
                        sequence = event.sequence,
                        event_type = %event.event_type,
                        "Event committed"
                    );
                }
            }
            Err(e) => {
                metrics::counter!("ledger_events_rejected_total", 1, "reason" => e.reason());
                tracing::warn!(group_id, error = %e, "Event rejected");
            }
        }
        result
    }

    fn validate_and_append(&self, group_id: &str, events: &[NewEvent]) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.projections.refresh()?;
        if !self.storage.group_exists(group_id)? {
            return Err(LedgerError::GroupNotFound(group_id.to_string()));
        }
        for event in events {
            PostingValidator::validate(group_id, &event.postings, |id| self.projections.account(id))?;
        }
        self.projections.check(events)?;

        // Anything that moves interest waits for report generation and is
        // checked against the years already reported.
        let windows = events.iter().map(|e| self.interest_window(e)).collect::<Result<Vec<_>, _>>()?;
        let _gate = windows.iter().any(Option::is_some).then(|| self.gate.enter());
        for (event, window) in events.iter().zip(&windows) {
            if let Some(years) = window {
                self.check_reported_years(event, years)?;
            }
        }

        let committed = self.storage.append_events(group_id, events)?;
        self.projections.record_committed(&committed);
        Ok(committed)
    }

    pub fn get_event(&self, event_id: EventId) -> Result<LedgerEvent, LedgerError> {
        Ok(self.storage.get_event(event_id)?)
    }

    /// Commits a `correction` referencing `original`. The original is left
    /// untouched.
    pub fn correct_event(
        &self,
        original: EventId,
        timestamp: OffsetDateTime,
        description: &str,
        postings: Vec<Posting>,
    ) -> Result<LedgerEvent, LedgerError> {
        let original_event = self.storage.get_event(original)?;
        let group_id = original_event.group_id.clone();
        let correction = NewEvent::new(EventType::Correction, timestamp, description, postings).correcting(original);

        self.with_group_lock(&group_id, || {
            let mut committed = self.commit_locked(&group_id, std::slice::from_ref(&correction))?;
            committed.pop().ok_or_else(|| LedgerError::EmptyEvent(0))
        })
    }

    /// Commits a correction that swaps every side of the original's postings.
    pub fn reverse_event(&self, original: EventId, timestamp: OffsetDateTime) -> Result<LedgerEvent, LedgerError> {
        let original_event = self.storage.get_event(original)?;
        let postings = original_event.postings.iter().map(Posting::reversed).collect();
        let description = format!("Reversal of {}", original);
        self.correct_event(original, timestamp, &description, postings)
    }

    /// The tax years an event would move interest in, or `None` when it
    /// moves no interest. Corrections follow what they correct.
    fn interest_window(&self, event: &NewEvent) -> Result<Option<Vec<i32>>, LedgerError> {
        let origin = match event.corrects {
            Some(original) => self.projections.origin_of(original),
            None => Some((event.event_type, event.accrual)),
        };
        match origin {
            Some((EventType::InterestAccrual, accrual)) => accrual_years(accrual.or(event.accrual), event.timestamp).map(Some),
            _ => Ok(None),
        }
    }

    /// Refuses an event that would move a member's interest in a year that
    /// already has a report.
    fn check_reported_years(&self, event: &NewEvent, years: &[i32]) -> Result<(), LedgerError> {
        for posting in &event.postings {
            let account = self.projections.account(&posting.account_id)?;
            let Some(member) = account.member_id else { continue };
            for year in years {
                if !self.storage.list_tax_reports(&member, Some(*year))?.is_empty() {
                    return Err(LedgerError::PeriodAlreadyReported {
                        member: member.to_string(),
                        year: *year,
                    });
                }
            }
        }
        Ok(())
    }

    /// A lazy, finite listing of the group's events ordered by timestamp
    /// then sequence. Each call starts from the current store state.
    pub fn list_events(&self, group_id: &str, filter: EventFilter) -> Result<EventStream, LedgerError> {
        if !self.storage.group_exists(group_id)? {
            return Err(LedgerError::GroupNotFound(group_id.to_string()));
        }
        Ok(EventStream {
            storage: self.storage.clone(),
            group_id: Arc::from(group_id),
            filter,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        })
    }
}

fn accrual_years(accrual: Option<AccrualPeriod>, fallback: OffsetDateTime) -> Result<Vec<i32>, LedgerError> {
    match accrual {
        Some(period) => Ok(years_spanned(&period)?.into_iter().map(|(year, _)| year).collect()),
        None => Ok(vec![tax_year_of(fallback)]),
    }
}

/// Keyset-paginated iterator over a group's events.
pub struct EventStream {
    storage: Arc<dyn StorageBackend>,
    group_id: GroupId,
    filter: EventFilter,
    page_size: usize,
    buffer: VecDeque<LedgerEvent>,
    after: Option<EventCursor>,
    exhausted: bool,
}

impl Iterator for EventStream {
    type Item = Result<LedgerEvent, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.buffer.pop_front() {
            return Some(Ok(event));
        }
        if self.exhausted {
            return None;
        }

        let query = EventQuery {
            filter: self.filter.clone(),
            after: self.after,
            limit: Some(self.page_size),
        };
        match self.storage.load_events(&self.group_id, &query) {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                self.after = page.last().map(EventCursor::from).or(self.after);
                self.buffer.extend(page);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e.into()))
            }
        }
    }
}
