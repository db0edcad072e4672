use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use expenseflow_core::{
    AuditAction, ConfidenceTier, Currency, ExpenseId, FeatureVector, HistoricalOutcome, MatchStatus,
    RawBankTransaction, RawExpense, StrategyKind, TenantId, TransactionId, Warning,
};
use expenseflow_match::{
    AssignmentMode, MatchConfig, MemoryStore, RateError, RateSource, Reconciler, RuleOverrides,
    RunReport, RunRequest, StaticRates,
};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

const TENANT: &str = "acme";

fn expense(id: i64, amount: &str, currency: &str, date: &str, merchant: &str) -> RawExpense {
    RawExpense {
        id,
        tenant_id: TENANT.into(),
        amount: amount.into(),
        currency: currency.into(),
        date: date.into(),
        merchant: merchant.into(),
        description: None,
        status: "unmatched".into(),
    }
}

fn tx(id: i64, amount: &str, currency: &str, date: &str, description: &str) -> RawBankTransaction {
    RawBankTransaction {
        id,
        tenant_id: TENANT.into(),
        amount: amount.into(),
        currency: currency.into(),
        date: date.into(),
        description: description.into(),
        status: "unmatched".into(),
    }
}

fn request() -> RunRequest {
    RunRequest::new(TenantId(TENANT.into()), NaiveDate::from_ymd_opt(2024, 3, 31).unwrap())
}

/// A rate provider that is always down, forcing the built-in fallback table.
struct UnreachableRates;

#[async_trait]
impl RateSource for UnreachableRates {
    async fn get_rate(&self, from: &Currency, to: &Currency, _: NaiveDate) -> Result<Decimal, RateError> {
        Err(RateError::Timeout(from.clone(), to.clone()))
    }
}

async fn run_with<R: RateSource + 'static>(store: &Arc<MemoryStore>, rates: R, config: MatchConfig) -> RunReport {
    Reconciler::new(Arc::clone(store), Arc::new(rates), config)
        .run(&request(), &CancellationToken::new())
        .await
}

async fn run(store: &Arc<MemoryStore>) -> RunReport {
    run_with(store, StaticRates::fallback_table(), MatchConfig::default()).await
}

fn pairs(report: &RunReport) -> BTreeSet<(i64, i64)> {
    report
        .matches
        .iter()
        .map(|m| (m.expense_id.0, m.transaction_id.0))
        .collect()
}

#[tokio::test]
async fn scenario_a_exact_match_is_auto_confirmed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-01", "Uber"));
    store.insert_transaction(tx(10, "-100.00", "PLN", "2024-03-01", "UBER *TRIP"));

    let report = run(&store).await;
    assert!(report.success);
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.strategy, StrategyKind::Exact);
    assert_eq!(m.confidence, 1.0);
    assert_eq!(m.tier, ConfidenceTier::Exact);
    assert_eq!(m.status, MatchStatus::AutoConfirmed);
    assert!(m.warnings.is_empty());

    assert_eq!(store.expense_status(ExpenseId(1)).as_deref(), Some("matched"));
    assert_eq!(store.transaction_status(TransactionId(10)).as_deref(), Some("matched"));
    let audit = store.audit_log();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::MatchCreated);
    assert_eq!(audit[0].details["strategy"], "exact");
}

#[tokio::test]
async fn scenario_b_weak_merchant_goes_to_review() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "250.00", "EUR", "2024-03-01", "Hotel Marriott"));
    store.insert_transaction(tx(10, "-255.00", "EUR", "2024-03-03", "PAYMENT 0042"));

    let report = run(&store).await;
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.strategy, StrategyKind::Fuzzy);
    assert!(m.scores.amount >= 0.8 && m.scores.amount <= 0.95, "amount {}", m.scores.amount);
    assert!((m.scores.date - 0.7).abs() < 1e-9);
    assert!(m.confidence < 0.8, "confidence {}", m.confidence);
    assert!(matches!(m.tier, ConfidenceTier::Medium | ConfidenceTier::High));
    assert_eq!(m.status, MatchStatus::PendingReview);
    assert_eq!(store.expense_status(ExpenseId(1)).as_deref(), Some("pending_review"));
}

#[tokio::test]
async fn scenario_b_strong_merchant_is_auto_confirmed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "250.00", "EUR", "2024-03-01", "Marriott"));
    store.insert_transaction(tx(10, "-255.00", "EUR", "2024-03-03", "MARRIOTT WARSAW"));

    let report = run(&store).await;
    let m = &report.matches[0];
    assert_eq!(m.strategy, StrategyKind::Fuzzy);
    assert_eq!(m.tier, ConfidenceTier::High);
    assert!(m.confidence >= 0.8);
    assert_eq!(m.status, MatchStatus::AutoConfirmed);
}

#[tokio::test]
async fn scenario_c_stronger_expense_wins_contested_transaction() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-02", "Uber"));
    store.insert_expense(expense(2, "100.00", "PLN", "2024-03-06", "Bolt"));
    store.insert_transaction(tx(10, "-100.00", "PLN", "2024-03-01", "UBER *TRIP"));

    let report = run(&store).await;
    assert_eq!(pairs(&report), BTreeSet::from([(1, 10)]));
    assert_eq!(report.summary.conflicts_rejected, 1);
    assert_eq!(store.expense_status(ExpenseId(2)).as_deref(), Some("unmatched"));

    let rejected: Vec<_> = store
        .audit_log()
        .into_iter()
        .filter(|a| a.action == AuditAction::ProposalRejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].expense_id, ExpenseId(2));
    assert_eq!(rejected[0].transaction_id, TransactionId(10));
}

#[tokio::test]
async fn scenario_d_incompatible_currency_is_never_auto_confirmed() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-01", "Uber"));
    store.insert_transaction(tx(10, "-4000", "JPY", "2024-03-01", "UBER *TRIP"));
    let rates = StaticRates::fallback_table().with_rate("JPY", "PLN", Decimal::new(25, 3));

    let report = run_with(&store, rates, MatchConfig::default()).await;
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.scores.currency, 0.5);
    assert!(m.warnings.contains(&Warning::CurrencyConversion));
    assert_eq!(m.status, MatchStatus::PendingReview);
    assert_eq!(report.summary.warnings[&Warning::CurrencyConversion], 1);
    assert!(report
        .summary
        .recommendations
        .iter()
        .any(|r| r.contains("exchange rates")));
}

#[tokio::test]
async fn currency_without_any_rate_yields_no_match() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-01", "Uber"));
    store.insert_transaction(tx(10, "-4000", "JPY", "2024-03-01", "UBER *TRIP"));

    let report = run(&store).await;
    assert!(report.success);
    assert!(report.matches.is_empty());
}

#[tokio::test]
async fn accepted_matches_are_one_to_one() {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=5 {
        store.insert_expense(expense(id, "50.00", "PLN", "2024-03-10", "Orlen"));
    }
    for id in 10..13 {
        store.insert_transaction(tx(id, "-50.00", "PLN", "2024-03-10", "ORLEN STACJA"));
    }

    for mode in [AssignmentMode::Greedy, AssignmentMode::Optimal] {
        let fresh = Arc::new(MemoryStore::new());
        for id in 1..=5 {
            fresh.insert_expense(expense(id, "50.00", "PLN", "2024-03-10", "Orlen"));
        }
        for id in 10..13 {
            fresh.insert_transaction(tx(id, "-50.00", "PLN", "2024-03-10", "ORLEN STACJA"));
        }
        let config = MatchConfig {
            assignment: mode,
            ..MatchConfig::default()
        };
        let report = run_with(&fresh, StaticRates::fallback_table(), config).await;
        let expenses: BTreeSet<_> = report.matches.iter().map(|m| m.expense_id).collect();
        let txs: BTreeSet<_> = report.matches.iter().map(|m| m.transaction_id).collect();
        assert_eq!(report.matches.len(), 3);
        assert_eq!(expenses.len(), 3);
        assert_eq!(txs.len(), 3);
    }

    // Greedy tie-breaking is by id, so the lowest expense ids win.
    let report = run(&store).await;
    let expenses: BTreeSet<i64> = report.matches.iter().map(|m| m.expense_id.0).collect();
    assert_eq!(expenses, BTreeSet::from([1, 2, 3]));
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let merchants = ["Uber", "Orlen", "Marriott", "Starbucks", "Ikea", "Lot Airlines"];
    for (i, merchant) in merchants.iter().enumerate() {
        let id = i as i64 + 1;
        let day = 1 + i as u32 * 3;
        store.insert_expense(expense(
            id,
            &format!("{}.00", 40 + id * 15),
            "PLN",
            &format!("2024-03-{day:02}"),
            merchant,
        ));
        store.insert_transaction(tx(
            100 + id,
            &format!("-{}.50", 40 + id * 15),
            "PLN",
            &format!("2024-03-{:02}", day + (i as u32 % 3)),
            &format!("{} POS {}", merchant.to_uppercase(), 1000 + id),
        ));
    }
    store
}

#[tokio::test]
async fn identical_inputs_give_identical_matches() {
    let first = run(&seeded_store()).await;
    let second = run(&seeded_store()).await;
    let key = |r: &RunReport| {
        r.matches
            .iter()
            .map(|m| (m.expense_id, m.transaction_id, m.status, m.strategy, m.confidence.to_bits()))
            .collect::<Vec<_>>()
    };
    assert!(!first.matches.is_empty());
    assert_eq!(key(&first), key(&second));
}

#[tokio::test]
async fn all_scores_stay_in_unit_interval() {
    let report = run(&seeded_store()).await;
    for m in &report.matches {
        for s in [m.confidence, m.scores.amount, m.scores.date, m.scores.merchant, m.scores.keyword, m.scores.currency] {
            assert!((0.0..=1.0).contains(&s), "score {s} out of range");
        }
    }
}

#[tokio::test]
async fn rerun_without_new_records_creates_nothing() {
    let store = seeded_store();
    let first = run(&store).await;
    assert!(!first.matches.is_empty());
    let second = run(&store).await;
    assert!(second.success);
    assert!(second.matches.is_empty());
    assert_eq!(store.matches().len(), first.matches.len());
}

fn monotonicity_store() -> Arc<MemoryStore> {
    // Amounts a factor of three apart, so each expense only ever sees its own
    // counterpart; quality degrades with the index.
    let store = Arc::new(MemoryStore::new());
    let descriptions = ["ACME", "ACME CORP", "ACM SHOP", "ZETA", "QQQ", "XX"];
    for i in 0..6_i64 {
        let base = 100 * 3_i64.pow(i as u32);
        store.insert_expense(expense(i + 1, &format!("{base}.00"), "PLN", "2024-03-01", "Acme"));
        let paid = base as f64 * (1.0 + 0.03 * i as f64);
        store.insert_transaction(tx(
            10 + i,
            &format!("-{paid:.2}"),
            "PLN",
            &format!("2024-03-{:02}", 1 + 2 * i),
            descriptions[i as usize],
        ));
    }
    store
}

#[tokio::test]
async fn raising_the_threshold_never_adds_matches() {
    let mut previous = usize::MAX;
    for threshold in [0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9] {
        let config = MatchConfig {
            min_match_threshold: threshold,
            ..MatchConfig::default()
        };
        let report = run_with(&monotonicity_store(), StaticRates::fallback_table(), config).await;
        let count = report.matches.len();
        assert!(count <= previous, "threshold {threshold}: {count} > {previous}");
        previous = count;
    }
}

#[tokio::test]
async fn persistence_failure_drops_only_that_match() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-01", "Uber"));
    store.insert_expense(expense(2, "300.00", "PLN", "2024-03-05", "Ikea"));
    store.insert_transaction(tx(10, "-100.00", "PLN", "2024-03-01", "UBER *TRIP"));
    store.insert_transaction(tx(11, "-300.00", "PLN", "2024-03-05", "IKEA KRAKOW"));
    store.fail_persist_for(ExpenseId(1));

    let report = run(&store).await;
    assert!(report.success);
    assert_eq!(pairs(&report), BTreeSet::from([(2, 11)]));
    assert_eq!(report.summary.persist_failures, 1);
    assert_eq!(report.summary.matches_found, 1);
    assert_eq!(store.expense_status(ExpenseId(1)).as_deref(), Some("unmatched"));
    assert!(report
        .summary
        .recommendations
        .iter()
        .any(|r| r.contains("storage health")));
}

#[tokio::test]
async fn tenant_overrides_raise_the_bar() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "250.00", "EUR", "2024-03-01", "Hotel Marriott"));
    store.insert_transaction(tx(10, "-255.00", "EUR", "2024-03-03", "PAYMENT 0042"));
    store.set_overrides(
        &TenantId(TENANT.into()),
        RuleOverrides {
            min_match_threshold: Some(0.9),
            ..Default::default()
        },
    );

    let report = run(&store).await;
    assert!(report.success);
    assert!(report.matches.is_empty());
}

#[tokio::test]
async fn other_tenants_are_invisible() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-01", "Uber"));
    let mut foreign = tx(10, "-100.00", "PLN", "2024-03-01", "UBER *TRIP");
    foreign.tenant_id = "globex".into();
    store.insert_transaction(foreign);

    let report = run(&store).await;
    assert!(report.matches.is_empty());
    assert_eq!(report.summary.transactions_considered, 0);
}

#[tokio::test]
async fn fallback_rates_do_not_block_same_currency_auto_confirm() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "EUR", "2024-03-01", "Uber"));
    store.insert_transaction(tx(10, "-100.00", "EUR", "2024-03-01", "UBER *TRIP"));

    let report = run_with(&store, UnreachableRates, MatchConfig::default()).await;
    assert!(report.success);
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.strategy, StrategyKind::Exact);
    assert!(m.warnings.is_empty(), "warnings: {:?}", m.warnings);
    assert_eq!(m.status, MatchStatus::AutoConfirmed);
}

#[tokio::test]
async fn fallback_rates_still_flag_cross_currency_pairs() {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "EUR", "2024-03-01", "Uber"));
    store.insert_transaction(tx(10, "-430.00", "PLN", "2024-03-01", "UBER *TRIP"));

    let report = run_with(&store, UnreachableRates, MatchConfig::default()).await;
    assert!(report.success);
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert!(m.warnings.contains(&Warning::FallbackExchangeRate));
    assert!(m.warnings.contains(&Warning::CurrencyConversion));
    assert_eq!(m.status, MatchStatus::PendingReview);
}

fn confirmed_history(store: &MemoryStore, count: i64) {
    for id in 0..count {
        store.add_history(
            &TenantId(TENANT.into()),
            HistoricalOutcome {
                id,
                features: FeatureVector::default(),
                confirmed: true,
            },
        );
    }
}

fn loosely_related_pair() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_expense(expense(1, "100.00", "PLN", "2024-03-01", "Office Depot"));
    store.insert_transaction(tx(10, "-100.00", "PLN", "2024-03-03", "ACME STATIONERY"));
    store
}

#[tokio::test]
async fn learned_strategy_takes_over_once_history_is_large_enough() {
    let config = MatchConfig::default();
    let store = loosely_related_pair();
    confirmed_history(&store, config.learned_min_history as i64);

    let report = run_with(&store, StaticRates::fallback_table(), config).await;
    assert!(report.success);
    assert_eq!(report.matches.len(), 1);
    let m = &report.matches[0];
    assert_eq!(m.strategy, StrategyKind::Learned);
    assert_eq!(m.confidence, 1.0);
    assert_eq!(m.status, MatchStatus::AutoConfirmed);
}

#[tokio::test]
async fn learned_strategy_stays_idle_below_min_history() {
    let config = MatchConfig::default();
    let store = loosely_related_pair();
    confirmed_history(&store, config.learned_min_history as i64 - 1);

    let report = run_with(&store, StaticRates::fallback_table(), config).await;
    assert!(report.success);
    assert!(report.matches.iter().all(|m| m.strategy != StrategyKind::Learned));
}
