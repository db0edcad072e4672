use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use expenseflow_core::{DateRange, MatchRecord, MatchStatus, TenantId};
use expenseflow_match::{
    AssignmentMode, HttpRateSource, MatchConfig, RateSource, Reconciler, RuleOverrides, RunReport,
    RunRequest, StaticRates,
};
use expenseflow_storage::{DbPool, ReviewDecision, SqliteStore};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::import;

pub async fn import_expenses(
    pool: &DbPool,
    path: &Path,
    tenant: &str,
    default_currency: &str,
) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let rows = import::read_expenses(file, tenant, default_currency)?;
    for row in &rows {
        expenseflow_storage::insert_expense(pool, row).await?;
    }
    tracing::info!(count = rows.len(), tenant, "imported expenses from {}", path.display());
    Ok(rows.len())
}

pub async fn import_transactions(
    pool: &DbPool,
    path: &Path,
    tenant: &str,
    default_currency: &str,
) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let rows = import::read_bank_transactions(file, tenant, default_currency)?;
    for row in &rows {
        expenseflow_storage::insert_bank_transaction(pool, row).await?;
    }
    tracing::info!(count = rows.len(), tenant, "imported bank transactions from {}", path.display());
    Ok(rows.len())
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub as_of: Option<NaiveDate>,
    pub optimal: bool,
}

impl RunOptions {
    fn range(&self) -> Result<Option<DateRange>> {
        match (self.from, self.to) {
            (None, None) => Ok(None),
            (Some(from), Some(to)) if from <= to => Ok(Some(DateRange::new(from, to))),
            (Some(from), Some(to)) => anyhow::bail!("--from {from} is after --to {to}"),
            _ => anyhow::bail!("--from and --to must be given together"),
        }
    }
}

async fn reconcile_with<R: RateSource + 'static>(
    store: Arc<SqliteStore>,
    rates: R,
    config: MatchConfig,
    request: &RunRequest,
) -> RunReport {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = Reconciler::new(store, Arc::new(rates), config)
        .run(request, &cancel)
        .await;
    watcher.abort();
    report
}

pub async fn reconcile(
    pool: &DbPool,
    config: &AppConfig,
    tenant: &str,
    options: &RunOptions,
) -> Result<RunReport> {
    let mut matching = config.matching.clone();
    if options.optimal {
        matching.assignment = AssignmentMode::Optimal;
    }

    let as_of = options.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let mut request = RunRequest::new(TenantId(tenant.to_string()), as_of);
    if let Some(range) = options.range()? {
        request = request.with_range(range);
    }

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let report = match &config.rate_url {
        Some(url) => reconcile_with(store, HttpRateSource::new(url.as_str()), matching, &request).await,
        None => reconcile_with(store, StaticRates::fallback_table(), matching, &request).await,
    };
    Ok(report)
}

pub fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let s = &report.summary;
    if !report.success {
        println!(
            "Run {} failed: {}",
            s.run_id,
            report.failure_reason.as_deref().unwrap_or("unknown")
        );
        return Ok(());
    }

    println!("Run {} ({} ms)", s.run_id, report.processing_time_ms);
    println!(
        "  expenses {:>5}   transactions {:>5}   skipped {:>3}",
        s.expenses_considered, s.transactions_considered, s.skipped_records
    );
    println!(
        "  matched  {:>5}   auto-confirmed {:>3}   pending {:>3}   rate {:.0}%",
        s.matches_found,
        s.auto_confirmed,
        s.pending_review,
        s.match_rate() * 100.0
    );
    for m in &report.matches {
        print_match(m);
    }
    for r in &s.recommendations {
        println!("  * {r}");
    }
    Ok(())
}

fn print_match(m: &MatchRecord) {
    let warnings: Vec<&str> = m.warnings.iter().map(|w| w.as_str()).collect();
    println!(
        "  {}  expense {:>6} <-> tx {:>6}  {:.3} {:<6} {:<14} {:<7} {}",
        m.id,
        m.expense_id.0,
        m.transaction_id.0,
        m.confidence,
        m.tier.as_str(),
        m.status.as_str(),
        m.strategy.as_str(),
        warnings.join(",")
    );
}

pub async fn list_matches(
    pool: &DbPool,
    tenant: &str,
    status: Option<MatchStatus>,
    min_confidence: Option<f64>,
) -> Result<()> {
    let matches = expenseflow_storage::list_matches(
        pool,
        &TenantId(tenant.to_string()),
        status,
        min_confidence,
    )
    .await?;
    if matches.is_empty() {
        println!("No matches.");
    }
    for m in &matches {
        print_match(m);
    }
    Ok(())
}

pub async fn review(pool: &DbPool, match_id: Uuid, decision: ReviewDecision) -> Result<()> {
    let record = expenseflow_storage::review_match(pool, match_id, decision, Utc::now()).await?;
    tracing::info!(%match_id, status = %record.status, "review recorded");
    print_match(&record);
    Ok(())
}

pub async fn list_runs(pool: &DbPool, tenant: &str, limit: u32) -> Result<()> {
    let runs = expenseflow_storage::list_runs(pool, &TenantId(tenant.to_string()), limit).await?;
    for s in &runs {
        println!(
            "{}  {}  matched {:>4}/{:<4} auto {:>4} pending {:>4}",
            s.run_id,
            s.started_at.format("%Y-%m-%d %H:%M"),
            s.matches_found,
            s.expenses_considered,
            s.auto_confirmed,
            s.pending_review
        );
    }
    Ok(())
}

pub async fn set_rules(pool: &DbPool, tenant: &str, overrides: &RuleOverrides) -> Result<()> {
    // Reject overrides that would not merge into a valid configuration.
    MatchConfig::default().with_overrides(overrides)?;
    expenseflow_storage::save_overrides(pool, &TenantId(tenant.to_string()), overrides).await?;
    Ok(())
}

pub async fn clear_rules(pool: &DbPool, tenant: &str) -> Result<()> {
    expenseflow_storage::delete_overrides(pool, &TenantId(tenant.to_string())).await?;
    Ok(())
}
