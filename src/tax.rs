use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use time::{Date, Month, OffsetDateTime, UtcOffset};
use uuid::Uuid;

use susu_ledger_core::{AccrualPeriod, EventId, Money, ReportStatus, StorageBackend, StorageError, TaxReport};

use crate::{error::LedgerError, projections::ProjectionCache, time_source::TimeSource};

/// Calendar year (UTC) a timestamp falls in.
pub fn tax_year_of(ts: OffsetDateTime) -> i32 {
    ts.to_offset(UtcOffset::UTC).year()
}

/// `[Jan 1 of year, Jan 1 of year + 1)` in UTC.
pub fn year_bounds(year: i32) -> Result<(OffsetDateTime, OffsetDateTime), LedgerError> {
    let invalid = |e: String| LedgerError::InvalidPeriod(format!("tax year {}: {}", year, e));
    let next = year.checked_add(1).ok_or_else(|| invalid("out of range".to_string()))?;
    let start = Date::from_calendar_date(year, Month::January, 1).map_err(|e| invalid(e.to_string()))?;
    let end = Date::from_calendar_date(next, Month::January, 1).map_err(|e| invalid(e.to_string()))?;
    Ok((start.midnight().assume_utc(), end.midnight().assume_utc()))
}

/// Calendar years overlapped by an accrual window with the whole seconds of
/// overlap in each, ascending. Years with no whole second of overlap are
/// left out.
pub fn years_spanned(period: &AccrualPeriod) -> Result<Vec<(i32, i64)>, LedgerError> {
    let mut spans = Vec::new();
    let mut year = tax_year_of(period.start);
    loop {
        let (start, end) = year_bounds(year)?;
        if start >= period.end {
            break;
        }
        let seconds = period.overlap_seconds(start, end);
        if seconds > 0 {
            spans.push((year, seconds));
        }
        year += 1;
    }
    Ok(spans)
}

/// Serializes report generation against accrual commits so no accrual lands
/// in a year while its report is being written.
#[derive(Default)]
pub struct ReportingGate(Mutex<()>);

impl ReportingGate {
    pub fn enter(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize)]
struct ChecksumPayload<'a> {
    member_id: &'a str,
    tax_year: i32,
    total_interest: Money,
    total_contributions: Money,
    total_withdrawals: Money,
    event_ids: &'a [EventId],
}

fn checksum(payload: &ChecksumPayload<'_>) -> Result<String, LedgerError> {
    let bytes = serde_json::to_vec(payload).map_err(|e| LedgerError::Storage(StorageError::Other(e.to_string())))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub struct TaxReportGenerator {
    storage: Arc<dyn StorageBackend>,
    projections: Arc<ProjectionCache>,
    time_source: TimeSource,
    gate: Arc<ReportingGate>,
}

impl TaxReportGenerator {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        projections: Arc<ProjectionCache>,
        time_source: TimeSource,
        gate: Arc<ReportingGate>,
    ) -> Self {
        Self {
            storage,
            projections,
            time_source,
            gate,
        }
    }

    pub fn list_reports(&self, member_id: &str, tax_year: Option<i32>) -> Result<Vec<TaxReport>, LedgerError> {
        Ok(self.storage.list_tax_reports(member_id, tax_year)?)
    }

    /// Produces the next version of the member's report for a closed year.
    ///
    /// A year without interest yields a zero-amount report.
    pub fn generate(&self, member_id: &str, tax_year: i32) -> Result<TaxReport, LedgerError> {
        let (_, closes_at) = year_bounds(tax_year)?;
        let now = self.time_source.now();
        if closes_at > now {
            return Err(LedgerError::PeriodNotClosed {
                year: tax_year,
                closes_at,
            });
        }

        let _gate = self.gate.enter();
        self.projections.refresh()?;

        let existing = self.storage.list_tax_reports(member_id, Some(tax_year))?;
        if existing.iter().any(|r| r.status == ReportStatus::Final) {
            return Err(LedgerError::PeriodFinalized {
                member: member_id.to_string(),
                year: tax_year,
            });
        }
        let previous = existing.into_iter().last();

        let (total_interest, total_contributions, total_withdrawals, event_ids) =
            match self.projections.tax_bucket(member_id, tax_year) {
                Some(bucket) => (
                    bucket.interest,
                    bucket.contributions,
                    bucket.withdrawals,
                    bucket.event_ids.into_iter().collect::<Vec<_>>(),
                ),
                None => (Money::ZERO, Money::ZERO, Money::ZERO, Vec::new()),
            };

        let checksum = checksum(&ChecksumPayload {
            member_id,
            tax_year,
            total_interest,
            total_contributions,
            total_withdrawals,
            event_ids: &event_ids,
        })?;

        let report = TaxReport {
            id: Uuid::new_v4(),
            member_id: Arc::from(member_id),
            tax_year,
            version: previous.as_ref().map_or(1, |p| p.version + 1),
            total_interest,
            total_contributions,
            total_withdrawals,
            event_ids,
            generated_at: now,
            checksum: Arc::from(checksum),
            supersedes: previous.map(|p| p.id),
            status: ReportStatus::Draft,
            finalized_at: None,
        };
        self.storage.insert_tax_report(&report)?;

        metrics::counter!("ledger_tax_reports_generated_total", 1);
        tracing::info!(member_id, tax_year, version = report.version, total_interest = %report.total_interest, "Tax report generated");
        Ok(report)
    }

    /// Freezes a draft report. Later generation for its member and year is
    /// refused.
    pub fn finalize(&self, report_id: Uuid) -> Result<TaxReport, LedgerError> {
        let _gate = self.gate.enter();
        let report = self.storage.finalize_tax_report(report_id, self.time_source.now())?;
        metrics::counter!("ledger_tax_reports_finalized_total", 1);
        tracing::info!(member_id = %report.member_id, tax_year = report.tax_year, version = report.version, "Tax report finalized");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_year_bounds() {
        let (start, end) = year_bounds(2024).unwrap();
        assert_eq!(start, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(end, datetime!(2025-01-01 0:00 UTC));
        assert!(year_bounds(i32::MAX).is_err());
    }

    #[test]
    fn test_tax_year_uses_utc() {
        assert_eq!(tax_year_of(datetime!(2025-01-01 0:30 +01:00)), 2024);
    }

    #[test]
    fn test_years_spanned() {
        let period = AccrualPeriod::new(datetime!(2023-12-31 0:00 UTC), datetime!(2025-01-02 0:00 UTC)).unwrap();
        let years: Vec<i32> = years_spanned(&period).unwrap().into_iter().map(|(y, _)| y).collect();
        assert_eq!(years, vec![2023, 2024, 2025]);

        let inside = AccrualPeriod::new(datetime!(2024-03-01 0:00 UTC), datetime!(2024-04-01 0:00 UTC)).unwrap();
        assert_eq!(years_spanned(&inside).unwrap(), vec![(2024, 31 * 86_400)]);

        let ends_on_boundary = AccrualPeriod::new(datetime!(2024-12-01 0:00 UTC), datetime!(2025-01-01 0:00 UTC)).unwrap();
        assert_eq!(years_spanned(&ends_on_boundary).unwrap().len(), 1);
    }

    #[test]
    fn test_final_report_freezes_the_year() {
        let storage: Arc<dyn StorageBackend> = Arc::new(susu_ledger_memory::InMemoryStorage::new());
        let projections = Arc::new(ProjectionCache::new(storage.clone()));
        let generator = TaxReportGenerator::new(
            storage,
            projections,
            TimeSource::mock(datetime!(2025-02-01 0:00 UTC)),
            Arc::new(ReportingGate::default()),
        );

        let first = generator.generate("alice", 2024).unwrap();
        let second = generator.generate("alice", 2024).unwrap();
        assert_eq!(first.status, ReportStatus::Draft);
        assert_eq!(second.supersedes, Some(first.id));

        let finalized = generator.finalize(second.id).unwrap();
        assert_eq!(finalized.status, ReportStatus::Final);
        assert_eq!(finalized.finalized_at, Some(datetime!(2025-02-01 0:00 UTC)));
        assert_eq!(finalized.checksum, first.checksum);

        assert!(matches!(generator.generate("alice", 2024), Err(LedgerError::PeriodFinalized { year: 2024, .. })));
        assert!(matches!(generator.finalize(second.id), Err(LedgerError::ReportAlreadyFinal(_))));
        assert!(matches!(generator.finalize(Uuid::new_v4()), Err(LedgerError::ReportNotFound(_))));
        assert_eq!(generator.list_reports("alice", Some(2024)).unwrap().len(), 2);
    }
}
