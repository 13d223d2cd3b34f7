//! SQLite storage backend for susu-ledger.

use std::{
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rusqlite::{params, params_from_iter, types::Value, Connection, ErrorCode, OptionalExtension};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use susu_ledger_core::{
    Account, AccountType, AccrualPeriod, EventId, EventQuery, EventType, GroupId, LedgerEvent,
    Money, NewEvent, Posting, PostingRecord, ReportStatus, Side, StorageBackend, StorageError, TaxReport,
};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                account_type TEXT NOT NULL,
                member_id TEXT,
                cached_balance TEXT NOT NULL DEFAULT '0',
                FOREIGN KEY (group_id) REFERENCES groups(id)
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                ts INTEGER NOT NULL,
                description TEXT NOT NULL,
                corrects TEXT,
                accrual_start INTEGER,
                accrual_end INTEGER,
                recorded_at INTEGER NOT NULL,
                UNIQUE (group_id, sequence),
                FOREIGN KEY (group_id) REFERENCES groups(id)
            );

            CREATE TABLE IF NOT EXISTS postings (
                event_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                side TEXT NOT NULL,
                amount TEXT NOT NULL,
                ts INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                PRIMARY KEY (event_id, position),
                FOREIGN KEY (event_id) REFERENCES events(id),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE TABLE IF NOT EXISTS tax_reports (
                id TEXT PRIMARY KEY,
                member_id TEXT NOT NULL,
                tax_year INTEGER NOT NULL,
                version INTEGER NOT NULL,
                total_interest TEXT NOT NULL,
                total_contributions TEXT NOT NULL,
                total_withdrawals TEXT NOT NULL,
                generated_at INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                supersedes TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                finalized_at INTEGER,
                UNIQUE (member_id, tax_year, version)
            );

            CREATE TABLE IF NOT EXISTS tax_report_events (
                report_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                PRIMARY KEY (report_id, event_id),
                FOREIGN KEY (report_id) REFERENCES tax_reports(id)
            );

            CREATE INDEX IF NOT EXISTS idx_events_order
                ON events(group_id, ts, sequence);

            CREATE INDEX IF NOT EXISTS idx_postings_account
                ON postings(account_id, ts, sequence);
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn next_sequence(conn: &Connection, group_id: &str) -> Result<u64, StorageError> {
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE group_id = ?1",
                params![group_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        u64::try_from(seq).map_err(|_| StorageError::Corrupt(format!("negative sequence in group {}", group_id)))
    }

    fn read_postings(conn: &Connection, event_id: &str) -> Result<Vec<Posting>, StorageError> {
        let mut stmt = conn
            .prepare("SELECT account_id, side, amount FROM postings WHERE event_id = ?1 ORDER BY position")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(db_err)?;

        let mut postings = Vec::new();
        for row in rows {
            let (account_id, side, amount) = row.map_err(db_err)?;
            postings.push(Posting {
                account_id: Arc::from(account_id.as_str()),
                side: Side::from_str(&side).map_err(StorageError::Corrupt)?,
                amount: str_to_money(&amount)?,
            });
        }
        Ok(postings)
    }

    fn read_event(conn: &Connection, row: EventRow) -> Result<LedgerEvent, StorageError> {
        let postings = Self::read_postings(conn, &row.id)?;
        let accrual = match (row.accrual_start, row.accrual_end) {
            (Some(start), Some(end)) => AccrualPeriod::new(nanos_to_ts(start)?, nanos_to_ts(end)?),
            _ => None,
        };
        Ok(LedgerEvent {
            id: str_to_uuid(&row.id)?,
            group_id: Arc::from(row.group_id.as_str()),
            sequence: u64::try_from(row.sequence).map_err(|_| StorageError::Corrupt(format!("negative sequence for {}", row.id)))?,
            event_type: EventType::from_str(&row.event_type).map_err(StorageError::Corrupt)?,
            timestamp: nanos_to_ts(row.ts)?,
            description: Arc::from(row.description.as_str()),
            corrects: row.corrects.as_deref().map(str_to_uuid).transpose()?,
            accrual,
            postings,
            recorded_at: nanos_to_ts(row.recorded_at)?,
        })
    }

    fn read_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, Option<String>)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }
}

struct EventRow {
    id: String,
    group_id: String,
    sequence: i64,
    event_type: String,
    ts: i64,
    description: String,
    corrects: Option<String>,
    accrual_start: Option<i64>,
    accrual_end: Option<i64>,
    recorded_at: i64,
}

const EVENT_COLUMNS: &str =
    "e.id, e.group_id, e.sequence, e.event_type, e.ts, e.description, e.corrects, e.accrual_start, e.accrual_end, e.recorded_at";

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        sequence: row.get(2)?,
        event_type: row.get(3)?,
        ts: row.get(4)?,
        description: row.get(5)?,
        corrects: row.get(6)?,
        accrual_start: row.get(7)?,
        accrual_end: row.get(8)?,
        recorded_at: row.get(9)?,
    })
}

fn db_err(e: rusqlite::Error) -> StorageError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen | ErrorCode::SystemIoFailure
            ) =>
        {
            StorageError::Unavailable(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn ts_to_nanos(ts: OffsetDateTime) -> Result<i64, StorageError> {
    i64::try_from(ts.unix_timestamp_nanos())
        .map_err(|_| StorageError::Other(format!("timestamp out of range: {}", ts)))
}

fn nanos_to_ts(nanos: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| StorageError::Corrupt(format!("invalid timestamp {}: {}", nanos, e)))
}

fn read_tax_reports(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Vec<TaxReport>, StorageError> {
    let sql = format!(
        "SELECT id, member_id, tax_year, version, total_interest, total_contributions, total_withdrawals, generated_at, checksum, supersedes, status, finalized_at
         FROM tax_reports
         WHERE {}
         ORDER BY tax_year, version",
        filter
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(args, |row| {
            Ok((
                (
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, u32>(3)?,
                ),
                (
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ),
                (
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<i64>>(11)?,
                ),
            ))
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;

    let mut reports = Vec::with_capacity(rows.len());
    for ((id, member, year, version), (interest, contributions, withdrawals), (generated_at, checksum, supersedes, status, finalized_at)) in rows {
        let mut event_stmt = conn
            .prepare("SELECT event_id FROM tax_report_events WHERE report_id = ?1 ORDER BY event_id")
            .map_err(db_err)?;
        let event_ids = event_stmt
            .query_map(params![id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?
            .iter()
            .map(|e| str_to_uuid(e))
            .collect::<Result<Vec<_>, _>>()?;

        reports.push(TaxReport {
            id: str_to_uuid(&id)?,
            member_id: Arc::from(member.as_str()),
            tax_year: year,
            version,
            total_interest: str_to_money(&interest)?,
            total_contributions: str_to_money(&contributions)?,
            total_withdrawals: str_to_money(&withdrawals)?,
            event_ids,
            generated_at: nanos_to_ts(generated_at)?,
            checksum: Arc::from(checksum.as_str()),
            supersedes: supersedes.as_deref().map(str_to_uuid).transpose()?,
            status: ReportStatus::from_str(&status).map_err(StorageError::Corrupt)?,
            finalized_at: finalized_at.map(nanos_to_ts).transpose()?,
        });
    }
    Ok(reports)
}

fn str_to_money(s: &str) -> Result<Money, StorageError> {
    Money::from_str(s).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn str_to_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Corrupt(format!("invalid decimal {}: {}", s, e)))
}

fn str_to_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("invalid id {}: {}", s, e)))
}

fn to_account(raw: (String, String, String, Option<String>)) -> Result<Account, StorageError> {
    let (id, group_id, account_type, member_id) = raw;
    Ok(Account {
        id: Arc::from(id.as_str()),
        group_id: Arc::from(group_id.as_str()),
        account_type: AccountType::from_str(&account_type).map_err(StorageError::Corrupt)?,
        member_id: member_id.map(|m| Arc::from(m.as_str())),
    })
}

impl StorageBackend for SqliteStorage {
    fn create_group(&self, group_id: &str, created_at: OffsetDateTime) -> Result<(), StorageError> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO groups (id, created_at) VALUES (?1, ?2)",
                params![group_id, ts_to_nanos(created_at)?],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(StorageError::GroupAlreadyExists(group_id.to_string()));
        }
        tracing::debug!(group_id, "SQLite group created");
        Ok(())
    }

    fn group_exists(&self, group_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM groups WHERE id = ?1",
            params![group_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn list_groups(&self) -> Result<Vec<GroupId>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM groups ORDER BY id").map_err(db_err)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).map_err(db_err)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(Arc::from(row.map_err(db_err)?.as_str()));
        }
        Ok(result)
    }

    fn delete_group(&self, group_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let events: i64 = tx
            .query_row("SELECT COUNT(*) FROM events WHERE group_id = ?1", params![group_id], |r| r.get(0))
            .map_err(db_err)?;
        if events > 0 {
            return Err(StorageError::GroupHasEvents(group_id.to_string()));
        }
        tx.execute("DELETE FROM accounts WHERE group_id = ?1", params![group_id]).map_err(db_err)?;
        let deleted = tx.execute("DELETE FROM groups WHERE id = ?1", params![group_id]).map_err(db_err)?;
        if deleted == 0 {
            return Err(StorageError::GroupNotFound(group_id.to_string()));
        }
        tx.commit().map_err(db_err)?;
        tracing::debug!(group_id, "SQLite group deleted");
        Ok(())
    }

    fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        let conn = self.conn();
        let group_exists: bool = conn
            .query_row("SELECT COUNT(*) > 0 FROM groups WHERE id = ?1", params![account.group_id.as_ref()], |r| r.get(0))
            .map_err(db_err)?;
        if !group_exists {
            return Err(StorageError::GroupNotFound(account.group_id.to_string()));
        }
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO accounts (id, group_id, account_type, member_id) VALUES (?1, ?2, ?3, ?4)",
                params![
                    account.id.as_ref(),
                    account.group_id.as_ref(),
                    account.account_type.as_str(),
                    account.member_id.as_deref()
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(StorageError::AccountAlreadyExists(account.id.to_string()));
        }
        Ok(())
    }

    fn get_account(&self, account_id: &str) -> Result<Account, StorageError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                "SELECT id, group_id, account_type, member_id FROM accounts WHERE id = ?1",
                params![account_id],
                Self::read_account,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::AccountNotFound(account_id.to_string()))?;
        to_account(raw)
    }

    fn list_accounts(&self, group_id: &str) -> Result<Vec<Account>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, group_id, account_type, member_id FROM accounts WHERE group_id = ?1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt.query_map(params![group_id], Self::read_account).map_err(db_err)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(to_account(row.map_err(db_err)?)?);
        }
        Ok(result)
    }

    fn append_events(&self, group_id: &str, events: &[NewEvent]) -> Result<Vec<LedgerEvent>, StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;

        let group_exists: bool = tx
            .query_row("SELECT COUNT(*) > 0 FROM groups WHERE id = ?1", params![group_id], |r| r.get(0))
            .map_err(db_err)?;
        if !group_exists {
            return Err(StorageError::GroupNotFound(group_id.to_string()));
        }

        let recorded_at = OffsetDateTime::now_utc();
        let mut committed = Vec::with_capacity(events.len());

        // Dropping `tx` on any early return rolls the whole batch back.
        for new_event in events {
            let sequence = Self::next_sequence(&tx, group_id)?;
            let event = LedgerEvent {
                id: Uuid::new_v4(),
                group_id: Arc::from(group_id),
                sequence,
                event_type: new_event.event_type,
                timestamp: new_event.timestamp,
                description: new_event.description.clone(),
                corrects: new_event.corrects,
                accrual: new_event.accrual,
                postings: new_event.postings.clone(),
                recorded_at,
            };
            let event_id = event.id.to_string();
            let ts = ts_to_nanos(event.timestamp)?;

            tx.execute(
                "INSERT INTO events (id, group_id, sequence, event_type, ts, description, corrects, accrual_start, accrual_end, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event_id,
                    group_id,
                    sequence as i64,
                    event.event_type.as_str(),
                    ts,
                    event.description.as_ref(),
                    event.corrects.map(|c| c.to_string()),
                    event.accrual.map(|a| ts_to_nanos(a.start)).transpose()?,
                    event.accrual.map(|a| ts_to_nanos(a.end)).transpose()?,
                    ts_to_nanos(recorded_at)?
                ],
            )
            .map_err(db_err)?;

            for (position, posting) in event.postings.iter().enumerate() {
                let raw = tx
                    .query_row(
                        "SELECT id, group_id, account_type, member_id FROM accounts WHERE id = ?1 AND group_id = ?2",
                        params![posting.account_id.as_ref(), group_id],
                        Self::read_account,
                    )
                    .optional()
                    .map_err(db_err)?
                    .ok_or_else(|| StorageError::AccountNotFound(posting.account_id.to_string()))?;
                let account = to_account(raw)?;

                tx.execute(
                    "INSERT INTO postings (event_id, position, account_id, side, amount, ts, sequence) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        event_id,
                        position as i64,
                        posting.account_id.as_ref(),
                        posting.side.as_str(),
                        posting.amount.to_string(),
                        ts,
                        sequence as i64
                    ],
                )
                .map_err(db_err)?;

                let cached: String = tx
                    .query_row("SELECT cached_balance FROM accounts WHERE id = ?1", params![posting.account_id.as_ref()], |r| r.get(0))
                    .map_err(db_err)?;
                let updated = str_to_decimal(&cached)? + account.signed(posting.side, posting.amount.amount());
                tx.execute(
                    "UPDATE accounts SET cached_balance = ?1 WHERE id = ?2",
                    params![updated.to_string(), posting.account_id.as_ref()],
                )
                .map_err(db_err)?;
            }

            tracing::debug!(group_id, event_id = %event.id, sequence, "SQLite event appended");
            committed.push(event);
        }

        tx.commit().map_err(db_err)?;
        Ok(committed)
    }

    fn get_event(&self, event_id: EventId) -> Result<LedgerEvent, StorageError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM events e WHERE e.id = ?1", EVENT_COLUMNS),
                params![event_id.to_string()],
                event_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or(StorageError::EventNotFound(event_id))?;
        Self::read_event(&conn, row)
    }

    fn load_events(&self, group_id: &str, query: &EventQuery) -> Result<Vec<LedgerEvent>, StorageError> {
        let conn = self.conn();
        let group_exists: bool = conn
            .query_row("SELECT COUNT(*) > 0 FROM groups WHERE id = ?1", params![group_id], |r| r.get(0))
            .map_err(db_err)?;
        if !group_exists {
            return Err(StorageError::GroupNotFound(group_id.to_string()));
        }

        let mut sql = format!("SELECT {} FROM events e WHERE e.group_id = ?", EVENT_COLUMNS);
        let mut values: Vec<Value> = vec![Value::Text(group_id.to_string())];

        if let Some(after) = query.after {
            let ts = ts_to_nanos(after.timestamp)?;
            sql.push_str(" AND (e.ts > ? OR (e.ts = ? AND e.sequence > ?))");
            values.push(Value::Integer(ts));
            values.push(Value::Integer(ts));
            values.push(Value::Integer(after.sequence as i64));
        }
        if let Some(from) = query.filter.from_time {
            sql.push_str(" AND e.ts >= ?");
            values.push(Value::Integer(ts_to_nanos(from)?));
        }
        if let Some(to) = query.filter.to_time {
            sql.push_str(" AND e.ts <= ?");
            values.push(Value::Integer(ts_to_nanos(to)?));
        }
        if let Some(event_type) = query.filter.event_type {
            sql.push_str(" AND e.event_type = ?");
            values.push(Value::Text(event_type.as_str().to_string()));
        }
        if let Some(member_id) = &query.filter.member_id {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM postings p JOIN accounts a ON a.id = p.account_id
                   WHERE p.event_id = e.id AND a.member_id = ?)",
            );
            values.push(Value::Text(member_id.to_string()));
        }
        sql.push_str(" ORDER BY e.ts, e.sequence");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        let rows: Vec<EventRow> = {
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let mapped = stmt.query_map(params_from_iter(values), event_row).map_err(db_err)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(db_err)?
        };

        rows.into_iter().map(|row| Self::read_event(&conn, row)).collect()
    }

    fn account_postings(&self, account_id: &str, as_of: Option<OffsetDateTime>) -> Result<Vec<PostingRecord>, StorageError> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row("SELECT COUNT(*) > 0 FROM accounts WHERE id = ?1", params![account_id], |row| row.get(0))
            .map_err(db_err)?;
        if !exists {
            return Err(StorageError::AccountNotFound(account_id.to_string()));
        }

        let upper = match as_of {
            Some(ts) => ts_to_nanos(ts)?,
            None => i64::MAX,
        };
        let mut stmt = conn
            .prepare(
                "SELECT event_id, sequence, ts, side, amount FROM postings
                 WHERE account_id = ?1 AND ts <= ?2
                 ORDER BY ts, sequence, position",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![account_id, upper], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?;

        let mut result = Vec::new();
        for row in rows {
            let (event_id, sequence, ts, side, amount) = row.map_err(db_err)?;
            result.push(PostingRecord {
                event_id: str_to_uuid(&event_id)?,
                sequence: u64::try_from(sequence).map_err(|_| StorageError::Corrupt(format!("negative sequence for {}", event_id)))?,
                timestamp: nanos_to_ts(ts)?,
                side: Side::from_str(&side).map_err(StorageError::Corrupt)?,
                amount: str_to_money(&amount)?,
            });
        }
        Ok(result)
    }

    fn cached_balance(&self, account_id: &str) -> Result<Decimal, StorageError> {
        let conn = self.conn();
        let cached: String = conn
            .query_row("SELECT cached_balance FROM accounts WHERE id = ?1", params![account_id], |r| r.get(0))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::AccountNotFound(account_id.to_string()))?;
        str_to_decimal(&cached)
    }

    fn insert_tax_report(&self, report: &TaxReport) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let report_id = report.id.to_string();
        tx.execute(
            "INSERT INTO tax_reports (id, member_id, tax_year, version, total_interest, total_contributions, total_withdrawals, generated_at, checksum, supersedes, status, finalized_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                report_id,
                report.member_id.as_ref(),
                report.tax_year,
                report.version,
                report.total_interest.to_string(),
                report.total_contributions.to_string(),
                report.total_withdrawals.to_string(),
                ts_to_nanos(report.generated_at)?,
                report.checksum.as_ref(),
                report.supersedes.map(|s| s.to_string()),
                report.status.as_str(),
                report.finalized_at.map(ts_to_nanos).transpose()?
            ],
        )
        .map_err(db_err)?;
        for event_id in &report.event_ids {
            tx.execute(
                "INSERT INTO tax_report_events (report_id, event_id) VALUES (?1, ?2)",
                params![report_id, event_id.to_string()],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        tracing::debug!(member_id = %report.member_id, tax_year = report.tax_year, version = report.version, "SQLite tax report stored");
        Ok(())
    }

    fn list_tax_reports(&self, member_id: &str, tax_year: Option<i32>) -> Result<Vec<TaxReport>, StorageError> {
        let conn = self.conn();
        read_tax_reports(
            &conn,
            "member_id = ?1 AND (?2 IS NULL OR tax_year = ?2)",
            params![member_id, tax_year],
        )
    }

    fn finalize_tax_report(&self, report_id: Uuid, finalized_at: OffsetDateTime) -> Result<TaxReport, StorageError> {
        let conn = self.conn();
        let id = report_id.to_string();
        let status: Option<String> = conn
            .query_row("SELECT status FROM tax_reports WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        match status.as_deref().map(ReportStatus::from_str).transpose().map_err(StorageError::Corrupt)? {
            None => return Err(StorageError::ReportNotFound(report_id)),
            Some(ReportStatus::Final) => return Err(StorageError::ReportAlreadyFinal(report_id)),
            Some(ReportStatus::Draft) => {}
        }

        conn.execute(
            "UPDATE tax_reports SET status = ?1, finalized_at = ?2 WHERE id = ?3",
            params![ReportStatus::Final.as_str(), ts_to_nanos(finalized_at)?, id],
        )
        .map_err(db_err)?;
        tracing::debug!(report_id = %report_id, "SQLite tax report finalized");

        read_tax_reports(&conn, "id = ?1", params![id])?
            .pop()
            .ok_or(StorageError::ReportNotFound(report_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use susu_ledger_core::EventFilter;
    use time::macros::datetime;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn seeded() -> (SqliteStorage, Account, Account) {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.create_group("g1", datetime!(2024-01-01 0:00 UTC)).unwrap();
        let cash = Account::new("g1", AccountType::Asset, None);
        let equity = Account::new("g1", AccountType::Equity, Some("alice"));
        storage.create_account(&cash).unwrap();
        storage.create_account(&equity).unwrap();
        (storage, cash, equity)
    }

    fn contribution(cash: &Account, equity: &Account, amount: &str, ts: OffsetDateTime) -> NewEvent {
        NewEvent::new(
            EventType::Contribution,
            ts,
            "Contribution",
            vec![Posting::debit(cash.id.clone(), money(amount)), Posting::credit(equity.id.clone(), money(amount))],
        )
    }

    #[test]
    fn test_sqlite_basic_operations() {
        let (storage, cash, equity) = seeded();
        let events = storage
            .append_events("g1", &[contribution(&cash, &equity, "1000.00", datetime!(2024-01-02 12:30 UTC))])
            .unwrap();

        let loaded = storage.get_event(events[0].id).unwrap();
        assert_eq!(loaded.postings, events[0].postings);
        assert_eq!(loaded.timestamp, datetime!(2024-01-02 12:30 UTC));
        assert_eq!(loaded.sequence, 1);

        assert_eq!(storage.cached_balance(&cash.id).unwrap(), dec!(1000.00));
        assert_eq!(storage.cached_balance(&equity.id).unwrap(), dec!(1000.00));
        assert_eq!(storage.account_postings(&cash.id, None).unwrap().len(), 1);
        assert_eq!(storage.get_account(&equity.id).unwrap(), equity);
    }

    #[test]
    fn test_sqlite_batch_rollback() {
        let (storage, cash, equity) = seeded();
        let orphan = NewEvent::new(
            EventType::Fee,
            datetime!(2024-01-03 0:00 UTC),
            "Fee",
            vec![Posting::debit(equity.id.clone(), money("5.00")), Posting::credit("g1:revenue", money("5.00"))],
        );
        let result = storage.append_events("g1", &[
            contribution(&cash, &equity, "500.00", datetime!(2024-01-02 0:00 UTC)),
            orphan,
        ]);

        assert!(matches!(result, Err(StorageError::AccountNotFound(_))));
        assert_eq!(storage.cached_balance(&cash.id).unwrap(), Decimal::ZERO, "Balance should be 0 after rollback");
        assert!(storage.load_events("g1", &EventQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_member_filter_and_paging() {
        let (storage, cash, equity) = seeded();
        let bob = Account::new("g1", AccountType::Equity, Some("bob"));
        storage.create_account(&bob).unwrap();
        storage.append_events("g1", &[
            contribution(&cash, &equity, "10.00", datetime!(2024-01-01 0:00 UTC)),
            contribution(&cash, &bob, "20.00", datetime!(2024-01-02 0:00 UTC)),
            contribution(&cash, &equity, "30.00", datetime!(2024-01-03 0:00 UTC)),
        ]).unwrap();

        let alice_only = storage.load_events("g1", &EventQuery {
            filter: EventFilter { member_id: Some(Arc::from("alice")), ..EventFilter::default() },
            ..EventQuery::default()
        }).unwrap();
        assert_eq!(alice_only.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 3]);

        let first = storage.load_events("g1", &EventQuery { limit: Some(2), ..EventQuery::default() }).unwrap();
        assert_eq!(first.len(), 2);
        let rest = storage.load_events("g1", &EventQuery {
            after: first.last().map(Into::into),
            limit: Some(2),
            ..EventQuery::default()
        }).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].sequence, 3);
    }

    #[test]
    fn test_sqlite_tax_report_round_trip() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let report = TaxReport {
            id: Uuid::new_v4(),
            member_id: Arc::from("alice"),
            tax_year: 2024,
            version: 1,
            total_interest: money("12.34"),
            total_contributions: money("100.00"),
            total_withdrawals: Money::ZERO,
            event_ids: vec![Uuid::nil()],
            generated_at: datetime!(2025-01-02 0:00 UTC),
            checksum: Arc::from("abc"),
            supersedes: None,
            status: ReportStatus::Draft,
            finalized_at: None,
        };
        storage.insert_tax_report(&report).unwrap();

        assert_eq!(storage.list_tax_reports("alice", Some(2024)).unwrap(), vec![report.clone()]);
        assert!(storage.list_tax_reports("alice", Some(2023)).unwrap().is_empty());

        let finalized = storage.finalize_tax_report(report.id, datetime!(2025-01-03 0:00 UTC)).unwrap();
        assert_eq!(finalized.status, ReportStatus::Final);
        assert_eq!(finalized.finalized_at, Some(datetime!(2025-01-03 0:00 UTC)));
        assert_eq!(finalized.event_ids, report.event_ids);
        assert!(matches!(
            storage.finalize_tax_report(report.id, datetime!(2025-01-04 0:00 UTC)),
            Err(StorageError::ReportAlreadyFinal(_))
        ));
        assert!(matches!(
            storage.finalize_tax_report(Uuid::new_v4(), datetime!(2025-01-04 0:00 UTC)),
            Err(StorageError::ReportNotFound(_))
        ));
    }

    #[test]
    fn test_sqlite_group_lifecycle() {
        let (storage, cash, equity) = seeded();
        assert!(matches!(
            storage.create_group("g1", datetime!(2024-01-01 0:00 UTC)),
            Err(StorageError::GroupAlreadyExists(_))
        ));
        storage.append_events("g1", &[contribution(&cash, &equity, "1.00", datetime!(2024-01-01 0:00 UTC))]).unwrap();
        assert!(matches!(storage.delete_group("g1"), Err(StorageError::GroupHasEvents(_))));
        assert_eq!(storage.list_groups().unwrap(), vec![Arc::<str>::from("g1")]);
    }
}
