use std::{collections::BTreeMap, sync::Arc};

use time::OffsetDateTime;
use uuid::Uuid;

use susu_ledger_core::{
    Account, AccountId, AccountType, BalanceSheet, EventFilter, EventId, EventType, GroupId, LedgerEvent, Money,
    NewEvent, Posting, StorageBackend, TaxReport,
};

use crate::{
    error::LedgerError,
    event_store::{EventStore, EventStream, DEFAULT_PAGE_SIZE},
    interest::{AccrualOutcome, InterestAllocator},
    projections::{MemberPosition, ProjectionCache, TaxBucket},
    projector::BalanceProjector,
    reconcile::{ReconciliationReport, ReconciliationService},
    registry::AccountRegistry,
    shares::MemberShare,
    tax::{tax_year_of, ReportingGate, TaxReportGenerator},
    time_source::TimeSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSettings {
    /// Events fetched per storage round trip by lazy listings.
    pub page_size: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Entry point for the surrounding application.
pub struct Ledger {
    storage: Arc<dyn StorageBackend>,
    time_source: TimeSource,
    registry: AccountRegistry,
    projections: Arc<ProjectionCache>,
    event_store: Arc<EventStore>,
    projector: Arc<BalanceProjector>,
    allocator: InterestAllocator,
    reports: Arc<TaxReportGenerator>,
    reconciler: ReconciliationService,
}

impl Ledger {
    /// Wires the components over `storage` and rebuilds every projection
    /// from the stored event log.
    pub fn new(storage: Arc<dyn StorageBackend>, settings: LedgerSettings, time_source: TimeSource) -> Result<Self, LedgerError> {
        let gate = Arc::new(ReportingGate::default());
        let projections = Arc::new(ProjectionCache::new(storage.clone()));
        let event_store = Arc::new(EventStore::new(
            storage.clone(),
            projections.clone(),
            gate.clone(),
            settings.page_size,
        ));
        let projector = Arc::new(BalanceProjector::new(storage.clone()));
        let reports = Arc::new(TaxReportGenerator::new(
            storage.clone(),
            projections.clone(),
            time_source.clone(),
            gate,
        ));
        let allocator = InterestAllocator::new(event_store.clone(), projections.clone());
        let reconciler = ReconciliationService::new(storage.clone(), projector.clone(), settings.page_size);

        let ledger = Self {
            registry: AccountRegistry::new(storage.clone()),
            storage,
            time_source,
            projections,
            event_store,
            projector,
            allocator,
            reports,
            reconciler,
        };
        ledger.rebuild_projections()?;
        Ok(ledger)
    }

    pub fn time_source(&self) -> &TimeSource {
        &self.time_source
    }

    /// Registers a group and seeds its pool cash, interest expense and fee
    /// income accounts.
    pub fn open_group(&self, group_id: &str) -> Result<Vec<Account>, LedgerError> {
        self.storage.create_group(group_id, self.time_source.now())?;
        let accounts = self.registry.seed_group_chart(group_id)?;
        tracing::info!(group_id, "Group opened");
        Ok(accounts)
    }

    /// Only groups without committed events can be deleted.
    pub fn delete_group(&self, group_id: &str) -> Result<(), LedgerError> {
        self.storage.delete_group(group_id)?;
        self.projections.forget_group(group_id);
        tracing::info!(group_id, "Group deleted");
        Ok(())
    }

    pub fn list_groups(&self) -> Result<Vec<GroupId>, LedgerError> {
        Ok(self.storage.list_groups()?)
    }

    pub fn create_account(&self, group_id: &str, account_type: AccountType, member_id: Option<&str>) -> Result<Account, LedgerError> {
        self.registry.create_account(group_id, account_type, member_id)
    }

    pub fn list_accounts(&self, group_id: &str) -> Result<Vec<Account>, LedgerError> {
        self.registry.list_accounts(group_id)
    }

    pub fn propose_event(
        &self,
        group_id: &str,
        event_type: EventType,
        timestamp: OffsetDateTime,
        description: &str,
        postings: Vec<Posting>,
    ) -> Result<LedgerEvent, LedgerError> {
        self.event_store.propose_event(group_id, event_type, timestamp, description, postings)
    }

    pub fn get_event(&self, event_id: EventId) -> Result<LedgerEvent, LedgerError> {
        self.event_store.get_event(event_id)
    }

    pub fn correct_event(
        &self,
        original: EventId,
        timestamp: OffsetDateTime,
        description: &str,
        postings: Vec<Posting>,
    ) -> Result<LedgerEvent, LedgerError> {
        self.event_store.correct_event(original, timestamp, description, postings)
    }

    pub fn reverse_event(&self, original: EventId, timestamp: OffsetDateTime) -> Result<LedgerEvent, LedgerError> {
        self.event_store.reverse_event(original, timestamp)
    }

    pub fn list_events(&self, group_id: &str, filter: EventFilter) -> Result<EventStream, LedgerError> {
        self.event_store.list_events(group_id, filter)
    }

    /// Debits pool cash and credits the member's equity.
    pub fn record_contribution(&self, group_id: &str, member_id: &str, amount: Money, timestamp: OffsetDateTime) -> Result<LedgerEvent, LedgerError> {
        require_positive(amount)?;
        let cash = self.registry.group_account(group_id, AccountType::Asset)?;
        let equity = self.registry.ensure_member_account(group_id, member_id)?;
        self.event_store.propose_event(
            group_id,
            EventType::Contribution,
            timestamp,
            &format!("Contribution from {}", member_id),
            vec![Posting::debit(cash.id, amount), Posting::credit(equity.id, amount)],
        )
    }

    /// Debits the member's equity and credits pool cash. Refused when the
    /// pool holds less than `amount`.
    pub fn record_payout(&self, group_id: &str, member_id: &str, amount: Money, timestamp: OffsetDateTime) -> Result<LedgerEvent, LedgerError> {
        require_positive(amount)?;
        let cash = self.registry.group_account(group_id, AccountType::Asset)?;

        self.event_store.with_group_lock(group_id, || {
            let available = self.projector.account_balance(&cash, None)?;
            if available < amount {
                metrics::counter!("ledger_events_rejected_total", 1, "reason" => "insufficient_funds");
                tracing::warn!(group_id, member_id, available = %available, requested = %amount, "Payout refused");
                return Err(LedgerError::InsufficientFunds {
                    account: cash.id.clone(),
                    available,
                    requested: amount,
                });
            }
            let equity = self.registry.ensure_member_account(group_id, member_id)?;
            let payout = NewEvent::new(
                EventType::Payout,
                timestamp,
                format!("Payout to {}", member_id),
                vec![Posting::debit(equity.id, amount), Posting::credit(cash.id.clone(), amount)],
            );
            let mut committed = self.event_store.commit_locked(group_id, std::slice::from_ref(&payout))?;
            committed.pop().ok_or(LedgerError::EmptyEvent(0))
        })
    }

    /// Debits the member's equity and credits the group's fee income.
    pub fn record_fee(&self, group_id: &str, member_id: &str, amount: Money, timestamp: OffsetDateTime) -> Result<LedgerEvent, LedgerError> {
        require_positive(amount)?;
        let income = self.registry.group_account(group_id, AccountType::Revenue)?;
        let equity = self.registry.ensure_member_account(group_id, member_id)?;
        self.event_store.propose_event(
            group_id,
            EventType::Fee,
            timestamp,
            &format!("Fee charged to {}", member_id),
            vec![Posting::debit(equity.id, amount), Posting::credit(income.id, amount)],
        )
    }

    pub fn run_interest_accrual(
        &self,
        group_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        total_interest: Money,
    ) -> Result<AccrualOutcome, LedgerError> {
        self.allocator.run(group_id, period_start, period_end, total_interest)
    }

    pub fn get_account_balance(&self, account_id: &str, as_of: Option<OffsetDateTime>) -> Result<Money, LedgerError> {
        self.projector.get_account_balance(account_id, as_of)
    }

    pub fn get_member_balance(&self, member_id: &str, group_id: &str, as_of: Option<OffsetDateTime>) -> Result<Money, LedgerError> {
        self.ensure_group(group_id)?;
        self.projector.get_member_balance(member_id, group_id, as_of)
    }

    pub fn get_group_balance_sheet(&self, group_id: &str, as_of: Option<OffsetDateTime>) -> Result<BalanceSheet, LedgerError> {
        self.ensure_group(group_id)?;
        let as_of = as_of.unwrap_or_else(|| self.time_source.now());
        self.projector.balance_sheet(group_id, as_of)
    }

    /// Events touching the member's accounts in `[from_time, to_time]`.
    pub fn get_member_statement(
        &self,
        member_id: &str,
        group_id: &str,
        from_time: OffsetDateTime,
        to_time: OffsetDateTime,
    ) -> Result<EventStream, LedgerError> {
        self.event_store.list_events(
            group_id,
            EventFilter {
                from_time: Some(from_time),
                to_time: Some(to_time),
                event_type: None,
                member_id: Some(Arc::from(member_id)),
            },
        )
    }

    pub fn member_share(&self, group_id: &str, member_id: &str) -> Option<MemberShare> {
        self.refresh_projections();
        self.projections.member_share(group_id, member_id)
    }

    pub fn tax_bucket(&self, member_id: &str, tax_year: i32) -> Option<TaxBucket> {
        self.refresh_projections();
        self.projections.tax_bucket(member_id, tax_year)
    }

    /// The member's principal, earnings and fees in the group alongside the
    /// replayed equity balance and the current tax year's movements.
    pub fn get_member_position(&self, member_id: &str, group_id: &str) -> Result<MemberPosition, LedgerError> {
        self.ensure_group(group_id)?;
        self.projections.refresh()?;
        let equity = self.registry.member_account(group_id, member_id)?;
        let balance = self.projector.account_balance(&equity, None)?;
        let split = self.projections.member_split(group_id, member_id);
        let tax_year = tax_year_of(self.time_source.now());
        let bucket = self.projections.tax_bucket(member_id, tax_year);

        Ok(MemberPosition {
            group_id: Arc::from(group_id),
            member_id: Arc::from(member_id),
            principal: split.as_ref().map_or(Money::ZERO, |s| s.principal),
            earnings: split.as_ref().map_or(Money::ZERO, |s| s.earnings),
            fees: split.as_ref().map_or(Money::ZERO, |s| s.fees),
            balance,
            tax_year,
            interest_ytd: bucket.as_ref().map_or(Money::ZERO, |b| b.interest),
            contributions_ytd: bucket.as_ref().map_or(Money::ZERO, |b| b.contributions),
            withdrawals_ytd: bucket.as_ref().map_or(Money::ZERO, |b| b.withdrawals),
        })
    }

    pub fn generate_tax_report(&self, member_id: &str, tax_year: i32) -> Result<TaxReport, LedgerError> {
        self.reports.generate(member_id, tax_year)
    }

    pub fn finalize_tax_report(&self, report_id: Uuid) -> Result<TaxReport, LedgerError> {
        self.reports.finalize(report_id)
    }

    pub fn list_tax_reports(&self, member_id: &str, tax_year: Option<i32>) -> Result<Vec<TaxReport>, LedgerError> {
        self.reports.list_reports(member_id, tax_year)
    }

    pub fn reconcile_group(&self, group_id: &str) -> Result<ReconciliationReport, LedgerError> {
        self.ensure_group(group_id)?;
        self.reconciler.reconcile(group_id, self.time_source.now())
    }

    pub fn reconcile_against(&self, group_id: &str, external: &BTreeMap<AccountId, Money>) -> Result<ReconciliationReport, LedgerError> {
        self.ensure_group(group_id)?;
        self.reconciler.reconcile_against(group_id, external, self.time_source.now())
    }

    /// Discards member shares and tax buckets and replays the event log.
    pub fn rebuild_projections(&self) -> Result<usize, LedgerError> {
        self.projections.rebuild()
    }

    fn refresh_projections(&self) {
        if let Err(e) = self.projections.refresh() {
            tracing::error!(error = %e, "Projection refresh failed");
        }
    }

    fn ensure_group(&self, group_id: &str) -> Result<(), LedgerError> {
        if self.storage.group_exists(group_id)? {
            Ok(())
        } else {
            Err(LedgerError::GroupNotFound(group_id.to_string()))
        }
    }
}

fn require_positive(amount: Money) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(format!("amount must be positive, got {}", amount)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use susu_ledger_memory::InMemoryStorage;
    use time::macros::datetime;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn ledger() -> Ledger {
        let ledger = Ledger::new(
            Arc::new(InMemoryStorage::new()),
            LedgerSettings::default(),
            TimeSource::mock(datetime!(2024-06-01 0:00 UTC)),
        )
        .unwrap();
        ledger.open_group("g1").unwrap();
        ledger
    }

    #[test]
    fn test_payout_needs_pool_cash() {
        let ledger = ledger();
        ledger
            .record_contribution("g1", "alice", money("100.00"), datetime!(2024-01-01 0:00 UTC))
            .unwrap();

        let result = ledger.record_payout("g1", "bob", money("100.01"), datetime!(2024-01-02 0:00 UTC));
        match result {
            Err(LedgerError::InsufficientFunds { available, requested, .. }) => {
                assert_eq!(available, money("100.00"));
                assert_eq!(requested, money("100.01"));
            }
            other => panic!("Expected InsufficientFunds, got {:?}", other),
        }

        ledger
            .record_payout("g1", "bob", money("100.00"), datetime!(2024-01-02 0:00 UTC))
            .unwrap();
        assert_eq!(ledger.get_account_balance("g1:asset", None).unwrap(), Money::ZERO);
        assert_eq!(ledger.get_member_balance("bob", "g1", None).unwrap(), money("-100.00"));
    }

    #[test]
    fn test_fee_moves_equity_to_income() {
        let ledger = ledger();
        ledger
            .record_contribution("g1", "alice", money("20.00"), datetime!(2024-01-01 0:00 UTC))
            .unwrap();
        ledger
            .record_fee("g1", "alice", money("2.50"), datetime!(2024-01-03 0:00 UTC))
            .unwrap();

        assert_eq!(ledger.get_member_balance("alice", "g1", None).unwrap(), money("17.50"));
        assert_eq!(ledger.get_account_balance("g1:revenue", None).unwrap(), money("2.50"));
        assert!(ledger.get_group_balance_sheet("g1", None).unwrap().is_balanced());
    }

    #[test]
    fn test_group_with_events_is_archival_only() {
        let ledger = ledger();
        ledger.open_group("empty").unwrap();
        ledger.delete_group("empty").unwrap();
        assert!(matches!(
            ledger.get_group_balance_sheet("empty", None),
            Err(LedgerError::GroupNotFound(_))
        ));

        ledger
            .record_contribution("g1", "alice", money("1.00"), datetime!(2024-01-01 0:00 UTC))
            .unwrap();
        assert!(matches!(ledger.delete_group("g1"), Err(LedgerError::GroupHasEvents(_))));
    }

    #[test]
    fn test_negative_contribution_rejected() {
        let ledger = ledger();
        let result = ledger.record_contribution("g1", "alice", money("-5.00"), datetime!(2024-01-01 0:00 UTC));
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
        assert_eq!(ledger.list_events("g1", EventFilter::default()).unwrap().count(), 0);
        assert_eq!(ledger.list_accounts("g1").unwrap().len(), 3);
    }

    #[test]
    fn test_accrual_split_across_year_end() {
        let ledger = ledger();
        ledger.time_source().set(datetime!(2025-06-01 0:00 UTC));
        ledger
            .record_contribution("g1", "alice", money("100.00"), datetime!(2024-12-01 0:00 UTC))
            .unwrap();
        ledger
            .run_interest_accrual("g1", datetime!(2024-12-22 0:00 UTC), datetime!(2025-01-11 0:00 UTC), money("2.00"))
            .unwrap();

        assert_eq!(ledger.tax_bucket("alice", 2024).unwrap().interest, money("1.00"));
        assert_eq!(ledger.tax_bucket("alice", 2025).unwrap().interest, money("1.00"));
    }

    #[test]
    fn test_member_position_splits_principal_and_earnings() {
        let ledger = ledger();
        ledger
            .record_contribution("g1", "alice", money("100.00"), datetime!(2024-01-01 0:00 UTC))
            .unwrap();
        ledger
            .record_contribution("g1", "bob", money("100.00"), datetime!(2024-01-01 0:00 UTC))
            .unwrap();
        ledger
            .run_interest_accrual("g1", datetime!(2024-02-01 0:00 UTC), datetime!(2024-03-01 0:00 UTC), money("3.00"))
            .unwrap();
        ledger
            .record_fee("g1", "alice", money("0.50"), datetime!(2024-03-02 0:00 UTC))
            .unwrap();
        ledger
            .record_payout("g1", "alice", money("20.00"), datetime!(2024-03-05 0:00 UTC))
            .unwrap();

        let position = ledger.get_member_position("alice", "g1").unwrap();
        assert_eq!(position.principal, money("80.00"));
        assert_eq!(position.earnings, money("1.50"));
        assert_eq!(position.fees, money("0.50"));
        assert_eq!(position.balance, money("81.00"));
        assert_eq!(position.balance, position.principal + position.earnings - position.fees);
        assert_eq!(position.tax_year, 2024);
        assert_eq!(position.interest_ytd, money("1.50"));
        assert_eq!(position.contributions_ytd, money("100.00"));
        assert_eq!(position.withdrawals_ytd, money("20.00"));

        assert!(matches!(
            ledger.get_member_position("carol", "g1"),
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_raw_accrual_into_reported_year_refused() {
        let ledger = ledger();
        ledger.time_source().set(datetime!(2025-06-01 0:00 UTC));
        ledger
            .record_contribution("g1", "alice", money("100.00"), datetime!(2024-01-01 0:00 UTC))
            .unwrap();
        let report = ledger.generate_tax_report("alice", 2024).unwrap();

        let late = ledger.propose_event(
            "g1",
            EventType::InterestAccrual,
            datetime!(2024-12-31 0:00 UTC),
            "Late interest",
            vec![Posting::debit("g1:expense", money("1.00")), Posting::credit("g1:equity:alice", money("1.00"))],
        );
        assert!(matches!(late, Err(LedgerError::PeriodAlreadyReported { year: 2024, .. })));
        assert_eq!(ledger.generate_tax_report("alice", 2024).unwrap().checksum, report.checksum);

        // The open year still takes interest
        ledger
            .propose_event(
                "g1",
                EventType::InterestAccrual,
                datetime!(2025-01-31 0:00 UTC),
                "Interest",
                vec![Posting::debit("g1:expense", money("1.00")), Posting::credit("g1:equity:alice", money("1.00"))],
            )
            .unwrap();
        assert_eq!(ledger.tax_bucket("alice", 2025).unwrap().interest, money("1.00"));
    }
}
