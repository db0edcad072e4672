use chrono::{DateTime, Utc};
use expenseflow_core::{
    AuditAction, AuditEntry, ExpenseId, MatchRecord, MatchStatus, RecordStatus, TenantId,
    TransactionId,
};
use expenseflow_match::{RuleOverrides, RunSummary, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Pool, Sqlite};
use std::path::Path;
use uuid::Uuid;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    // Record columns are kept as text so malformed imports survive to
    // validation, where they are counted and skipped.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            date TEXT NOT NULL,
            merchant TEXT NOT NULL DEFAULT '',
            description TEXT,
            status TEXT NOT NULL DEFAULT 'unmatched',
            match_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bank_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'unmatched',
            match_id TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matches (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            expense_id INTEGER NOT NULL,
            transaction_id INTEGER NOT NULL,
            scores TEXT NOT NULL,
            confidence REAL NOT NULL,
            tier TEXT NOT NULL,
            status TEXT NOT NULL,
            strategy TEXT NOT NULL,
            warnings TEXT NOT NULL,
            features TEXT NOT NULL,
            created_at TEXT NOT NULL,
            reviewed_at TEXT,
            FOREIGN KEY (expense_id) REFERENCES expenses(id),
            FOREIGN KEY (transaction_id) REFERENCES bank_transactions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one live match per expense and per transaction.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_live_expense
         ON matches(expense_id) WHERE status != 'rejected'",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_matches_live_transaction
         ON matches(transaction_id) WHERE status != 'rejected'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT,
            tenant_id TEXT NOT NULL,
            action TEXT NOT NULL,
            match_id TEXT,
            expense_id INTEGER NOT NULL,
            transaction_id INTEGER NOT NULL,
            status_before TEXT NOT NULL,
            status_after TEXT NOT NULL,
            details TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS match_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            match_id TEXT NOT NULL,
            features TEXT NOT NULL,
            confirmed INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matching_rules (
            tenant_id TEXT PRIMARY KEY,
            overrides TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_runs (
            run_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            started_at TEXT NOT NULL,
            matches_found INTEGER NOT NULL,
            auto_confirmed INTEGER NOT NULL,
            pending_review INTEGER NOT NULL,
            summary TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub(crate) fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn corrupt(what: &str, value: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what} '{value}': {e}"))
}

// ── Records ──────────────────────────────────────────────────────────────────

/// An expense as imported; every field is stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExpense {
    pub tenant_id: String,
    pub amount: String,
    pub currency: String,
    pub date: String,
    pub merchant: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBankTransaction {
    pub tenant_id: String,
    pub amount: String,
    pub currency: String,
    pub date: String,
    pub description: String,
}

pub async fn insert_expense(pool: &DbPool, expense: &NewExpense) -> Result<ExpenseId, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO expenses (tenant_id, amount, currency, date, merchant, description)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&expense.tenant_id)
    .bind(&expense.amount)
    .bind(&expense.currency)
    .bind(&expense.date)
    .bind(&expense.merchant)
    .bind(&expense.description)
    .execute(pool)
    .await?;

    Ok(ExpenseId(result.last_insert_rowid()))
}

pub async fn insert_bank_transaction(
    pool: &DbPool,
    tx: &NewBankTransaction,
) -> Result<TransactionId, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO bank_transactions (tenant_id, amount, currency, date, description)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&tx.tenant_id)
    .bind(&tx.amount)
    .bind(&tx.currency)
    .bind(&tx.date)
    .bind(&tx.description)
    .execute(pool)
    .await?;

    Ok(TransactionId(result.last_insert_rowid()))
}

// ── Matches ──────────────────────────────────────────────────────────────────

const MATCH_COLUMNS: &str = "id, run_id, tenant_id, expense_id, transaction_id, scores, \
     confidence, tier, status, strategy, warnings, features, created_at";

type MatchRow = (
    String,
    String,
    String,
    i64,
    i64,
    String,
    f64,
    String,
    String,
    String,
    String,
    String,
    String,
);

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| corrupt("uuid", value, e))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", value, e))
}

fn match_from_row(row: MatchRow) -> Result<MatchRecord, StoreError> {
    let (
        id,
        run_id,
        tenant_id,
        expense_id,
        transaction_id,
        scores,
        confidence,
        tier,
        status,
        strategy,
        warnings,
        features,
        created_at,
    ) = row;

    Ok(MatchRecord {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        tenant_id: TenantId(tenant_id),
        expense_id: ExpenseId(expense_id),
        transaction_id: TransactionId(transaction_id),
        scores: serde_json::from_str(&scores)?,
        confidence,
        tier: tier.parse().map_err(StoreError::Corrupt)?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        strategy: strategy.parse().map_err(StoreError::Corrupt)?,
        warnings: serde_json::from_str(&warnings)?,
        features: serde_json::from_str(&features)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

pub(crate) async fn insert_match<'e, E>(executor: E, record: &MatchRecord) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO matches (id, run_id, tenant_id, expense_id, transaction_id, scores,
            confidence, tier, status, strategy, warnings, features, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.id.to_string())
    .bind(record.run_id.to_string())
    .bind(&record.tenant_id.0)
    .bind(record.expense_id.0)
    .bind(record.transaction_id.0)
    .bind(serde_json::to_string(&record.scores)?)
    .bind(record.confidence)
    .bind(record.tier.as_str())
    .bind(record.status.as_str())
    .bind(record.strategy.as_str())
    .bind(serde_json::to_string(&record.warnings)?)
    .bind(serde_json::to_string(&record.features)?)
    .bind(record.created_at.to_rfc3339())
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn get_match(pool: &DbPool, match_id: Uuid) -> Result<MatchRecord, StoreError> {
    let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?");
    let row = sqlx::query_as::<_, MatchRow>(&sql)
        .bind(match_id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;

    match row {
        Some(row) => match_from_row(row),
        None => Err(StoreError::NotFound(format!("match {match_id}"))),
    }
}

/// Matches of `tenant`, strongest first, optionally filtered by status and
/// a confidence floor.
pub async fn list_matches(
    pool: &DbPool,
    tenant: &TenantId,
    status: Option<MatchStatus>,
    min_confidence: Option<f64>,
) -> Result<Vec<MatchRecord>, StoreError> {
    let sql = format!(
        "SELECT {MATCH_COLUMNS} FROM matches
         WHERE tenant_id = ? AND (? IS NULL OR status = ?) AND confidence >= ?
         ORDER BY confidence DESC, created_at, id"
    );
    let status = status.map(MatchStatus::as_str);
    let rows = sqlx::query_as::<_, MatchRow>(&sql)
        .bind(&tenant.0)
        .bind(status)
        .bind(status)
        .bind(min_confidence.unwrap_or(0.0))
        .fetch_all(pool)
        .await
        .map_err(db_err)?;

    rows.into_iter().map(match_from_row).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Confirm,
    Reject,
}

/// Applies a reviewer's decision. Confirming is only possible from the
/// review queue; rejecting also undoes an auto-confirmed match and returns
/// both records to the unmatched pool. The outcome is kept as history for
/// the learned strategy.
pub async fn review_match(
    pool: &DbPool,
    match_id: Uuid,
    decision: ReviewDecision,
    reviewed_at: DateTime<Utc>,
) -> Result<MatchRecord, StoreError> {
    let mut tx = pool.begin().await.map_err(db_err)?;

    let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?");
    let row = sqlx::query_as::<_, MatchRow>(&sql)
        .bind(match_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
    let mut record = match row {
        Some(row) => match_from_row(row)?,
        None => return Err(StoreError::NotFound(format!("match {match_id}"))),
    };

    let (next, action) = match (decision, record.status) {
        (ReviewDecision::Confirm, MatchStatus::PendingReview) => {
            (MatchStatus::Confirmed, AuditAction::MatchConfirmed)
        }
        (ReviewDecision::Reject, MatchStatus::PendingReview | MatchStatus::AutoConfirmed) => {
            (MatchStatus::Rejected, AuditAction::MatchRejected)
        }
        (_, current) => {
            return Err(StoreError::Conflict(format!(
                "match {match_id} is already {current}"
            )))
        }
    };

    let before = record.status.record_status();
    let after = next.record_status();
    let link = (next != MatchStatus::Rejected).then(|| match_id.to_string());

    sqlx::query("UPDATE matches SET status = ?, reviewed_at = ? WHERE id = ?")
        .bind(next.as_str())
        .bind(reviewed_at.to_rfc3339())
        .bind(match_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    sqlx::query("UPDATE expenses SET status = ?, match_id = ? WHERE id = ?")
        .bind(after.as_str())
        .bind(&link)
        .bind(record.expense_id.0)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    sqlx::query("UPDATE bank_transactions SET status = ?, match_id = ? WHERE id = ?")
        .bind(after.as_str())
        .bind(&link)
        .bind(record.transaction_id.0)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

    sqlx::query(
        "INSERT INTO match_history (tenant_id, match_id, features, confirmed, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&record.tenant_id.0)
    .bind(match_id.to_string())
    .bind(serde_json::to_string(&record.features)?)
    .bind(next == MatchStatus::Confirmed)
    .bind(reviewed_at.to_rfc3339())
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    let entry = AuditEntry {
        run_id: None,
        tenant_id: record.tenant_id.clone(),
        action,
        match_id: Some(record.id),
        expense_id: record.expense_id,
        transaction_id: record.transaction_id,
        status_before: before,
        status_after: after,
        details: serde_json::json!({
            "previous_status": record.status,
            "confidence": record.confidence,
            "tier": record.tier,
        }),
        created_at: reviewed_at,
    };
    insert_audit(&mut *tx, &entry).await?;

    tx.commit().await.map_err(db_err)?;

    record.status = next;
    Ok(record)
}

// ── Audit ────────────────────────────────────────────────────────────────────

pub(crate) async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO match_audit_log (run_id, tenant_id, action, match_id, expense_id,
            transaction_id, status_before, status_after, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.run_id.map(|id| id.to_string()))
    .bind(&entry.tenant_id.0)
    .bind(entry.action.as_str())
    .bind(entry.match_id.map(|id| id.to_string()))
    .bind(entry.expense_id.0)
    .bind(entry.transaction_id.0)
    .bind(entry.status_before.as_str())
    .bind(entry.status_after.as_str())
    .bind(serde_json::to_string(&entry.details)?)
    .bind(entry.created_at.to_rfc3339())
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

type AuditRow = (
    Option<String>,
    String,
    String,
    Option<String>,
    i64,
    i64,
    String,
    String,
    String,
    String,
);

/// Audit stream of `tenant` in the order it was written.
pub async fn list_audit(pool: &DbPool, tenant: &TenantId) -> Result<Vec<AuditEntry>, StoreError> {
    let rows = sqlx::query_as::<_, AuditRow>(
        "SELECT run_id, tenant_id, action, match_id, expense_id, transaction_id,
                status_before, status_after, details, created_at
         FROM match_audit_log WHERE tenant_id = ? ORDER BY id",
    )
    .bind(&tenant.0)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    rows.into_iter()
        .map(|row| -> Result<AuditEntry, StoreError> {
            let (run_id, tenant_id, action, match_id, expense_id, transaction_id, before, after, details, created_at) =
                row;
            Ok(AuditEntry {
                run_id: run_id.as_deref().map(parse_uuid).transpose()?,
                tenant_id: TenantId(tenant_id),
                action: serde_json::from_value::<AuditAction>(serde_json::Value::String(action))?,
                match_id: match_id.as_deref().map(parse_uuid).transpose()?,
                expense_id: ExpenseId(expense_id),
                transaction_id: TransactionId(transaction_id),
                status_before: before.parse::<RecordStatus>().map_err(StoreError::Corrupt)?,
                status_after: after.parse::<RecordStatus>().map_err(StoreError::Corrupt)?,
                details: serde_json::from_str(&details)?,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .collect()
}

// ── Rules & runs ─────────────────────────────────────────────────────────────

pub async fn save_overrides(
    pool: &DbPool,
    tenant: &TenantId,
    overrides: &RuleOverrides,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO matching_rules (tenant_id, overrides, updated_at)
         VALUES (?, ?, datetime('now'))
         ON CONFLICT(tenant_id) DO UPDATE SET
            overrides = excluded.overrides,
            updated_at = excluded.updated_at",
    )
    .bind(&tenant.0)
    .bind(serde_json::to_string(overrides)?)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn delete_overrides(pool: &DbPool, tenant: &TenantId) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM matching_rules WHERE tenant_id = ?")
        .bind(&tenant.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent runs of `tenant`, newest first.
pub async fn list_runs(
    pool: &DbPool,
    tenant: &TenantId,
    limit: u32,
) -> Result<Vec<RunSummary>, StoreError> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT summary FROM reconciliation_runs
         WHERE tenant_id = ? ORDER BY started_at DESC LIMIT ?",
    )
    .bind(&tenant.0)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    rows.into_iter()
        .map(|(summary,)| serde_json::from_str(&summary).map_err(StoreError::from))
        .collect()
}
