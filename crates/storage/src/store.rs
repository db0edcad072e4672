use async_trait::async_trait;
use expenseflow_core::{
    AuditEntry, DateRange, FeatureVector, HistoricalOutcome, MatchRecord, RawBankTransaction,
    RawExpense, RecordStatus, TenantId,
};
use expenseflow_match::{
    in_range, is_open_status, ReconciliationStore, RuleOverrides, RunSummary, StoreError,
};
use sqlx::SqliteConnection;
use std::path::Path;
use tracing::warn;

use crate::db::{create_db, db_err, insert_audit, insert_match, DbPool};

/// [`ReconciliationStore`] backed by the SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = create_db(path).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Why a record could not be claimed: gone, or already taken.
async fn missing_or_taken(
    conn: &mut SqliteConnection,
    table: &str,
    label: &str,
    id: i64,
    tenant: &TenantId,
) -> StoreError {
    let sql = format!("SELECT status FROM {table} WHERE id = ? AND tenant_id = ?");
    match sqlx::query_as::<_, (String,)>(&sql)
        .bind(id)
        .bind(&tenant.0)
        .fetch_optional(conn)
        .await
    {
        Ok(Some((status,))) => StoreError::Conflict(format!("{label} {id} is {status}")),
        Ok(None) => StoreError::NotFound(format!("{label} {id}")),
        Err(e) => db_err(e),
    }
}

#[async_trait]
impl ReconciliationStore for SqliteStore {
    async fn load_expenses(
        &self,
        tenant: &TenantId,
        range: Option<DateRange>,
    ) -> Result<Vec<RawExpense>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, String, String, Option<String>, String)>(
            "SELECT id, tenant_id, amount, currency, date, merchant, description, status
             FROM expenses WHERE tenant_id = ? ORDER BY id",
        )
        .bind(&tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, tenant_id, amount, currency, date, merchant, description, status)| RawExpense {
                    id,
                    tenant_id,
                    amount,
                    currency,
                    date,
                    merchant,
                    description,
                    status,
                },
            )
            .filter(|e| is_open_status(&e.status) && in_range(&e.date, range.as_ref()))
            .collect())
    }

    async fn load_transactions(
        &self,
        tenant: &TenantId,
        range: Option<DateRange>,
    ) -> Result<Vec<RawBankTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, String, String, String)>(
            "SELECT id, tenant_id, amount, currency, date, description, status
             FROM bank_transactions WHERE tenant_id = ? ORDER BY id",
        )
        .bind(&tenant.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(id, tenant_id, amount, currency, date, description, status)| RawBankTransaction {
                    id,
                    tenant_id,
                    amount,
                    currency,
                    date,
                    description,
                    status,
                },
            )
            .filter(|t| is_open_status(&t.status) && in_range(&t.date, range.as_ref()))
            .collect())
    }

    async fn load_history(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<Vec<HistoricalOutcome>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, bool)>(
            "SELECT id, features, confirmed FROM match_history
             WHERE tenant_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(&tenant.0)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, features, confirmed)| {
                match serde_json::from_str::<FeatureVector>(&features) {
                    Ok(features) => Some(HistoricalOutcome {
                        id,
                        features,
                        confirmed,
                    }),
                    Err(e) => {
                        warn!(history_id = id, "skipping unreadable history row: {e}");
                        None
                    }
                }
            })
            .collect())
    }

    async fn load_overrides(&self, tenant: &TenantId) -> Result<Option<RuleOverrides>, StoreError> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT overrides FROM matching_rules WHERE tenant_id = ?",
        )
        .bind(&tenant.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn persist_match(&self, record: &MatchRecord, audit: &AuditEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let next = record.status.record_status();
        let link = record.id.to_string();

        for (table, label, id) in [
            ("expenses", "expense", record.expense_id.0),
            ("bank_transactions", "transaction", record.transaction_id.0),
        ] {
            let sql = format!(
                "UPDATE {table} SET status = ?, match_id = ?
                 WHERE id = ? AND tenant_id = ? AND status = ?"
            );
            let claimed = sqlx::query(&sql)
                .bind(next.as_str())
                .bind(&link)
                .bind(id)
                .bind(&record.tenant_id.0)
                .bind(RecordStatus::Unmatched.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
            if claimed == 0 {
                // Dropping `tx` rolls back the other claim.
                return Err(missing_or_taken(&mut tx, table, label, id, &record.tenant_id).await);
            }
        }

        insert_match(&mut *tx, record).await?;
        insert_audit(&mut *tx, audit).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        insert_audit(&self.pool, entry).await
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO reconciliation_runs
                (run_id, tenant_id, started_at, matches_found, auto_confirmed, pending_review, summary)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(summary.run_id.to_string())
        .bind(&summary.tenant_id.0)
        .bind(summary.started_at.to_rfc3339())
        .bind(summary.matches_found as i64)
        .bind(summary.auto_confirmed as i64)
        .bind(summary.pending_review as i64)
        .bind(serde_json::to_string(summary)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
