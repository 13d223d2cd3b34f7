use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use susu_ledger_core::{
    Account, AccountId, AccountType, BalanceSheet, EventFilter, EventId, EventType, LedgerEvent, Money, Posting,
    StorageError, TaxReport,
};

use crate::{
    error::LedgerError, interest::AccrualOutcome, ledger::Ledger, projections::MemberPosition,
    reconcile::ReconciliationReport,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/groups", post(open_group))
        .route("/groups/:group_id", delete(delete_group))
        .route("/groups/:group_id/accounts", post(create_account))
        .route("/groups/:group_id/events", post(propose_event).get(list_events))
        .route("/groups/:group_id/contributions", post(record_contribution))
        .route("/groups/:group_id/payouts", post(record_payout))
        .route("/groups/:group_id/fees", post(record_fee))
        .route("/groups/:group_id/interest-accruals", post(run_interest_accrual))
        .route("/groups/:group_id/balance-sheet", get(balance_sheet))
        .route("/groups/:group_id/members/:member_id/balance", get(member_balance))
        .route("/groups/:group_id/members/:member_id/statement", get(member_statement))
        .route("/groups/:group_id/members/:member_id/position", get(member_position))
        .route("/groups/:group_id/reconciliation", get(reconcile_group).post(reconcile_against))
        .route("/accounts/:account_id/balance", get(account_balance))
        .route("/events/:event_id", get(get_event))
        .route("/events/:event_id/corrections", post(correct_event))
        .route("/events/:event_id/reversal", post(reverse_event))
        .route("/members/:member_id/tax-reports", get(list_tax_reports))
        .route("/members/:member_id/tax-reports/:year", post(generate_tax_report))
        .route("/tax-reports/:report_id/finalize", post(finalize_tax_report))
        .route("/admin/rebuild-projections", post(rebuild_projections))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            LedgerError::InvalidAmount(_)
            | LedgerError::UnbalancedEvent { .. }
            | LedgerError::EmptyEvent(_)
            | LedgerError::CrossGroupPosting { .. }
            | LedgerError::InvalidPeriod(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::DuplicateAccount(_)
            | LedgerError::GroupHasEvents(_)
            | LedgerError::PeriodAlreadyReported { .. }
            | LedgerError::InsufficientFunds { .. }
            | LedgerError::NoEligibleRecipients { .. }
            | LedgerError::PeriodNotClosed { .. }
            | LedgerError::PeriodFinalized { .. }
            | LedgerError::ReportAlreadyFinal(_)
            | LedgerError::ReconciliationMismatch { .. }
            | LedgerError::Storage(StorageError::GroupAlreadyExists(_)) => StatusCode::CONFLICT,
            LedgerError::GroupNotFound(_)
            | LedgerError::AccountNotFound(_)
            | LedgerError::EventNotFound(_)
            | LedgerError::ReportNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for an end user.
    fn message(&self) -> String {
        match &self.0 {
            LedgerError::UnbalancedEvent { debits, credits } => format!(
                "This action would leave the books unbalanced: debits total {} but credits total {}.",
                debits, credits
            ),
            LedgerError::EmptyEvent(_) => "A transaction needs at least one debit and one credit.".to_string(),
            LedgerError::CrossGroupPosting { .. } => "A transaction can only move money within one group.".to_string(),
            LedgerError::InvalidAmount(detail) => format!("The amount is not valid: {}.", detail),
            LedgerError::InsufficientFunds { available, requested, .. } => format!(
                "The group pool holds {} which is not enough to pay out {}.",
                available, requested
            ),
            LedgerError::NoEligibleRecipients { .. } => {
                "No member held a balance during this period, so interest cannot be shared.".to_string()
            }
            LedgerError::PeriodNotClosed { year, .. } => {
                format!("The {} tax year has not ended yet, so its report cannot be generated.", year)
            }
            LedgerError::PeriodAlreadyReported { year, .. } => {
                format!("The {} tax year has already been reported and cannot receive more interest.", year)
            }
            LedgerError::PeriodFinalized { year, .. } => {
                format!("The {} tax report is final and can no longer be regenerated.", year)
            }
            LedgerError::ReportAlreadyFinal(_) => "This tax report is already final.".to_string(),
            LedgerError::GroupHasEvents(_) => "A group with recorded transactions can only be archived.".to_string(),
            LedgerError::StorageUnavailable(_) => "The ledger is temporarily unavailable, please retry.".to_string(),
            LedgerError::Storage(StorageError::GroupAlreadyExists(_)) => "This group already exists.".to_string(),
            LedgerError::Storage(_) => "An internal error occurred.".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                success: false,
                error: self.message(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn health() -> &'static str {
    "OK"
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct OpenGroupRequest {
    group_id: String,
}

async fn open_group(State(state): State<AppState>, Json(req): Json<OpenGroupRequest>) -> ApiResult<Vec<Account>> {
    Ok(Json(state.ledger.open_group(&req.group_id)?))
}

async fn delete_group(State(state): State<AppState>, Path(group_id): Path<String>) -> Result<StatusCode, ApiError> {
    state.ledger.delete_group(&group_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CreateAccountRequest {
    account_type: AccountType,
    member_id: Option<String>,
}

async fn create_account(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<Account> {
    Ok(Json(state.ledger.create_account(&group_id, req.account_type, req.member_id.as_deref())?))
}

#[derive(Deserialize)]
struct ProposeEventRequest {
    event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(default)]
    description: String,
    postings: Vec<Posting>,
}

async fn propose_event(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<ProposeEventRequest>,
) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.propose_event(
        &group_id,
        req.event_type,
        req.timestamp,
        &req.description,
        req.postings,
    )?))
}

async fn list_events(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(filter): Query<EventFilter>,
) -> ApiResult<Vec<LedgerEvent>> {
    let events = state
        .ledger
        .list_events(&group_id, filter)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(events))
}

async fn get_event(State(state): State<AppState>, Path(event_id): Path<EventId>) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.get_event(event_id)?))
}

#[derive(Deserialize)]
struct CorrectionRequest {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    #[serde(default)]
    description: String,
    postings: Vec<Posting>,
}

async fn correct_event(
    State(state): State<AppState>,
    Path(event_id): Path<EventId>,
    Json(req): Json<CorrectionRequest>,
) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.correct_event(event_id, req.timestamp, &req.description, req.postings)?))
}

#[derive(Deserialize)]
struct ReversalRequest {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

async fn reverse_event(
    State(state): State<AppState>,
    Path(event_id): Path<EventId>,
    Json(req): Json<ReversalRequest>,
) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.reverse_event(event_id, req.timestamp)?))
}

#[derive(Deserialize)]
struct MemberMovementRequest {
    member_id: String,
    amount: Money,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

async fn record_contribution(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<MemberMovementRequest>,
) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.record_contribution(&group_id, &req.member_id, req.amount, req.timestamp)?))
}

async fn record_payout(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<MemberMovementRequest>,
) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.record_payout(&group_id, &req.member_id, req.amount, req.timestamp)?))
}

async fn record_fee(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<MemberMovementRequest>,
) -> ApiResult<LedgerEvent> {
    Ok(Json(state.ledger.record_fee(&group_id, &req.member_id, req.amount, req.timestamp)?))
}

#[derive(Deserialize)]
struct AccrualRequest {
    #[serde(with = "time::serde::rfc3339")]
    period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    period_end: OffsetDateTime,
    total_interest: Money,
}

async fn run_interest_accrual(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<AccrualRequest>,
) -> ApiResult<AccrualOutcome> {
    Ok(Json(state.ledger.run_interest_accrual(
        &group_id,
        req.period_start,
        req.period_end,
        req.total_interest,
    )?))
}

#[derive(Deserialize)]
struct AsOfQuery {
    #[serde(default, with = "time::serde::rfc3339::option")]
    as_of: Option<OffsetDateTime>,
}

async fn balance_sheet(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(q): Query<AsOfQuery>,
) -> ApiResult<BalanceSheet> {
    Ok(Json(state.ledger.get_group_balance_sheet(&group_id, q.as_of)?))
}

#[derive(Serialize)]
struct BalanceResponse {
    balance: Money,
}

async fn account_balance(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(q): Query<AsOfQuery>,
) -> ApiResult<BalanceResponse> {
    let balance = state.ledger.get_account_balance(&account_id, q.as_of)?;
    Ok(Json(BalanceResponse { balance }))
}

async fn member_balance(
    State(state): State<AppState>,
    Path((group_id, member_id)): Path<(String, String)>,
    Query(q): Query<AsOfQuery>,
) -> ApiResult<BalanceResponse> {
    let balance = state.ledger.get_member_balance(&member_id, &group_id, q.as_of)?;
    Ok(Json(BalanceResponse { balance }))
}

#[derive(Deserialize)]
struct StatementQuery {
    #[serde(with = "time::serde::rfc3339")]
    from_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    to_time: OffsetDateTime,
}

async fn member_statement(
    State(state): State<AppState>,
    Path((group_id, member_id)): Path<(String, String)>,
    Query(q): Query<StatementQuery>,
) -> ApiResult<Vec<LedgerEvent>> {
    let events = state
        .ledger
        .get_member_statement(&member_id, &group_id, q.from_time, q.to_time)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(events))
}

async fn member_position(
    State(state): State<AppState>,
    Path((group_id, member_id)): Path<(String, String)>,
) -> ApiResult<MemberPosition> {
    Ok(Json(state.ledger.get_member_position(&member_id, &group_id)?))
}

async fn generate_tax_report(
    State(state): State<AppState>,
    Path((member_id, year)): Path<(String, i32)>,
) -> ApiResult<TaxReport> {
    Ok(Json(state.ledger.generate_tax_report(&member_id, year)?))
}

async fn finalize_tax_report(State(state): State<AppState>, Path(report_id): Path<Uuid>) -> ApiResult<TaxReport> {
    Ok(Json(state.ledger.finalize_tax_report(report_id)?))
}

#[derive(Deserialize)]
struct TaxReportQuery {
    year: Option<i32>,
}

async fn list_tax_reports(
    State(state): State<AppState>,
    Path(member_id): Path<String>,
    Query(q): Query<TaxReportQuery>,
) -> ApiResult<Vec<TaxReport>> {
    Ok(Json(state.ledger.list_tax_reports(&member_id, q.year)?))
}

async fn reconcile_group(State(state): State<AppState>, Path(group_id): Path<String>) -> ApiResult<ReconciliationReport> {
    Ok(Json(state.ledger.reconcile_group(&group_id)?))
}

#[derive(Deserialize)]
struct ExternalTotalsRequest {
    external: BTreeMap<AccountId, Money>,
}

async fn reconcile_against(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<ExternalTotalsRequest>,
) -> ApiResult<ReconciliationReport> {
    Ok(Json(state.ledger.reconcile_against(&group_id, &req.external)?))
}

#[derive(Serialize)]
struct RebuildResponse {
    replayed: usize,
}

async fn rebuild_projections(State(state): State<AppState>) -> ApiResult<RebuildResponse> {
    let replayed = state.ledger.rebuild_projections()?;
    Ok(Json(RebuildResponse { replayed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let unbalanced = ApiError(LedgerError::UnbalancedEvent {
            debits: Money::from_minor(5000),
            credits: Money::from_minor(4999),
        });
        assert_eq!(unbalanced.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(unbalanced.message().contains("unbalanced"));

        assert_eq!(
            ApiError(LedgerError::StorageUnavailable("locked".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError(LedgerError::GroupNotFound("g".into())).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError(LedgerError::PeriodNotClosed {
                year: 2024,
                closes_at: OffsetDateTime::UNIX_EPOCH,
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError(LedgerError::ReportNotFound(Uuid::nil())).status(), StatusCode::NOT_FOUND);
        let finalized = ApiError(LedgerError::PeriodFinalized {
            member: "alice".into(),
            year: 2024,
        });
        assert_eq!(finalized.status(), StatusCode::CONFLICT);
        assert!(finalized.message().contains("final"));
    }
}
