use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use expenseflow_core::{
    AuditEntry, BankTransaction, Currency, DateRange, ExpenseRecord, MatchProposal, MatchRecord,
    RecordError, RecordStatus, TenantId,
};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::alias::MerchantAliasIndex;
use crate::candidates::{generate_candidates, Candidate};
use crate::config::MatchConfig;
use crate::currency::{CurrencyNormalizer, RateSource};
use crate::engine::{ScoringContext, StrategyEngine};
use crate::resolver::resolve;
use crate::store::ReconciliationStore;
use crate::summary::{RunReport, RunSummary};

pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tenant_id: TenantId,
    pub date_range: Option<DateRange>,
    /// Date exchange rates are looked up for.
    pub as_of: NaiveDate,
}

impl RunRequest {
    pub fn new(tenant_id: TenantId, as_of: NaiveDate) -> Self {
        Self {
            tenant_id,
            date_range: None,
            as_of,
        }
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }
}

/// Matches a tenant's open expenses against its open bank transactions.
pub struct Reconciler<S, R> {
    store: Arc<S>,
    rates: Arc<R>,
    config: MatchConfig,
    engine: Arc<StrategyEngine>,
}

impl<S, R> Reconciler<S, R>
where
    S: ReconciliationStore,
    R: RateSource,
{
    pub fn new(store: Arc<S>, rates: Arc<R>, config: MatchConfig) -> Self {
        Self {
            store,
            rates,
            config,
            engine: Arc::new(StrategyEngine::default()),
        }
    }

    pub fn with_engine(mut self, engine: StrategyEngine) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Runs to completion and always returns a report. Failures to load the
    /// initial record sets and cancellation yield `success: false` with
    /// nothing persisted.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, tenant = %request.tenant_id);
        self.execute(run_id, request, cancel).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid, request: &RunRequest, cancel: &CancellationToken) -> RunReport {
        let started = Instant::now();
        let tenant = &request.tenant_id;
        let mut summary = RunSummary::new(run_id, tenant.clone(), Utc::now());
        info!(range = ?request.date_range, "Reconciliation started");

        // Load
        let raw_expenses = match self.store.load_expenses(tenant, request.date_range).await {
            Ok(rows) => rows,
            Err(e) => return failure(summary, started, format!("failed to load expenses: {e}")),
        };
        let tx_range = request
            .date_range
            .map(|r| r.widened(self.config.candidate_date_window_days.max(0) as u64));
        let raw_transactions = match self.store.load_transactions(tenant, tx_range).await {
            Ok(rows) => rows,
            Err(e) => return failure(summary, started, format!("failed to load transactions: {e}")),
        };

        let (mut expenses, skipped_expenses) = validate_rows(raw_expenses, ExpenseRecord::validate);
        let (mut transactions, skipped_transactions) =
            validate_rows(raw_transactions, BankTransaction::validate);
        expenses.retain(|e| &e.tenant_id == tenant && e.status == RecordStatus::Unmatched);
        transactions.retain(|t| &t.tenant_id == tenant && t.status == RecordStatus::Unmatched);
        expenses.sort_by_key(|e| e.id);
        transactions.sort_by_key(|t| t.id);

        summary.skipped_records = skipped_expenses + skipped_transactions;
        summary.expenses_considered = expenses.len();
        summary.transactions_considered = transactions.len();

        // Per-run snapshots
        let config = self.tenant_config(tenant).await;
        let history = match self.store.load_history(tenant, config.history_limit).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Match history unavailable; learned strategy disabled for this run");
                Vec::new()
            }
        };

        let currencies: BTreeSet<Currency> = expenses
            .iter()
            .map(|e| e.amount.currency.clone())
            .chain(transactions.iter().map(|t| t.amount.currency.clone()))
            .collect();
        let normalizer = CurrencyNormalizer::build(
            self.rates.as_ref(),
            config.reporting_currency.clone(),
            currencies,
            request.as_of,
            Duration::from_millis(config.rate_timeout_ms),
        )
        .await;

        let mut work: Vec<(usize, Vec<Candidate>)> = Vec::with_capacity(expenses.len());
        for (i, expense) in expenses.iter().enumerate() {
            if normalizer.magnitude(&expense.amount).is_none() {
                summary.unconvertible_expenses += 1;
                warn!(expense_id = %expense.id, currency = %expense.amount.currency, "No exchange rate; expense left unmatched");
                continue;
            }
            let candidates = generate_candidates(expense, &transactions, &normalizer, &config);
            summary.candidates_considered += candidates.len();
            if !candidates.is_empty() {
                work.push((i, candidates));
            }
        }

        let pool = &transactions;
        let aliases = MerchantAliasIndex::build(
            work.iter().flat_map(|(i, candidates)| {
                let merchant = expenses[*i].merchant.as_str();
                candidates
                    .iter()
                    .map(move |c| (merchant, pool[c.index].description.as_str()))
            }),
            config.alias_threshold,
        );
        debug!(clusters = aliases.len(), "Merchant alias index built");

        if cancel.is_cancelled() {
            return failure(summary, started, CANCELLED.to_string());
        }

        // Score
        let concurrency = config.concurrency.max(1);
        let ctx = Arc::new(ScoringContext::new(config.clone(), normalizer, aliases, history, transactions));
        let expenses = Arc::new(expenses);
        let mut scored: Vec<(usize, Vec<MatchProposal>)> = stream::iter(work)
            .map(|(i, candidates)| {
                let ctx = Arc::clone(&ctx);
                let expenses = Arc::clone(&expenses);
                let engine = Arc::clone(&self.engine);
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let scored = tokio::task::spawn_blocking(move || {
                        engine.score_expense(&expenses[i], &candidates, &ctx)
                    })
                    .await;
                    match scored {
                        Ok(proposals) => Some((i, proposals)),
                        Err(e) => {
                            error!(error = %e, "Scoring worker failed; expense skipped");
                            Some((i, Vec::new()))
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        if cancel.is_cancelled() {
            return failure(summary, started, CANCELLED.to_string());
        }
        scored.sort_by_key(|(i, _)| *i);

        // Aggregate and resolve
        let mut surviving: Vec<MatchProposal> = Vec::new();
        for (_, proposals) in scored {
            summary.proposals_generated += proposals.len();
            let out = aggregate(proposals, &config);
            summary.proposals_vetoed += out.vetoed.len();
            surviving.extend(out.proposals);
        }
        let resolution = resolve(surviving, &config);
        summary.conflicts_rejected = resolution.rejected.len();

        // Persist
        let created_at = Utc::now();
        let mut matches: Vec<MatchRecord> = Vec::with_capacity(resolution.accepted_len());
        for (proposal, status) in resolution.accepted() {
            let record = MatchRecord::from_proposal(proposal, status, tenant.clone(), run_id, created_at);
            let audit = AuditEntry::for_created_match(&record);
            match self.store.persist_match(&record, &audit).await {
                Ok(()) => {
                    summary.record_match(&record);
                    matches.push(record);
                }
                Err(e) => {
                    summary.persist_failures += 1;
                    warn!(
                        expense_id = %record.expense_id,
                        transaction_id = %record.transaction_id,
                        error = %e,
                        "Failed to persist match; dropped from this run"
                    );
                }
            }
        }
        for proposal in &resolution.rejected {
            let entry = AuditEntry::for_rejected_proposal(proposal, tenant.clone(), run_id, created_at);
            if let Err(e) = self.store.append_audit(&entry).await {
                warn!(expense_id = %proposal.expense_id, error = %e, "Failed to audit rejected proposal");
            }
        }

        summary.finalize();
        if let Err(e) = self.store.record_run(&summary).await {
            warn!(error = %e, "Failed to record run summary");
        }

        let processing_time_ms = elapsed_ms(started);
        info!(
            expenses = summary.expenses_considered,
            transactions = summary.transactions_considered,
            candidates = summary.candidates_considered,
            matches = summary.matches_found,
            auto_confirmed = summary.auto_confirmed,
            pending_review = summary.pending_review,
            skipped = summary.skipped_records,
            persist_failures = summary.persist_failures,
            processing_time_ms,
            "Reconciliation finished"
        );

        RunReport {
            success: true,
            failure_reason: None,
            summary,
            matches,
            processing_time_ms,
        }
    }

    async fn tenant_config(&self, tenant: &TenantId) -> MatchConfig {
        match self.store.load_overrides(tenant).await {
            Ok(Some(overrides)) => match self.config.with_overrides(&overrides) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Ignoring invalid tenant overrides");
                    self.config.clone()
                }
            },
            Ok(None) => self.config.clone(),
            Err(e) => {
                warn!(error = %e, "Tenant overrides unavailable; using defaults");
                self.config.clone()
            }
        }
    }
}

fn validate_rows<Raw, T>(rows: Vec<Raw>, validate: fn(Raw) -> Result<T, RecordError>) -> (Vec<T>, usize) {
    let mut valid = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        match validate(row) {
            Ok(record) => valid.push(record),
            Err(e) => {
                skipped += 1;
                warn!(error = %e, "Skipping malformed record");
            }
        }
    }
    (valid, skipped)
}

fn failure(mut summary: RunSummary, started: Instant, reason: String) -> RunReport {
    error!(reason = %reason, "Reconciliation aborted");
    summary.recommendations.clear();
    RunReport {
        success: false,
        failure_reason: Some(reason),
        summary,
        matches: Vec::new(),
        processing_time_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
