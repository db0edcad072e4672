use std::collections::BTreeMap;

use expenseflow_core::{
    clamp_unit, BankTransaction, ComponentScores, ConfidenceTier, ExpenseId, ExpenseRecord,
    FeatureVector, MatchProposal, StrategyKind, TransactionId,
};

use crate::candidates::Candidate;
use crate::engine::ScoringContext;
use crate::learned::knn_confidence;
use crate::similarity::{
    amount_score, currency_score, date_score, extract_keywords, keyword_score, text_score,
};

/// Expense-side inputs computed once and shared by every pair.
#[derive(Debug, Clone)]
pub struct ExpenseProfile<'a> {
    pub expense: &'a ExpenseRecord,
    /// Magnitude in the reporting currency.
    pub amount: f64,
    pub search_text: String,
    pub keywords: Vec<String>,
}

impl<'a> ExpenseProfile<'a> {
    pub fn new(expense: &'a ExpenseRecord, amount: f64, keyword_limit: usize) -> Self {
        let search_text = expense.search_text();
        let keywords = extract_keywords(&search_text, keyword_limit);
        Self {
            expense,
            amount,
            search_text,
            keywords,
        }
    }

    /// Merchant name, or the description when no merchant was captured.
    fn label(&self) -> &str {
        if self.expense.merchant.is_empty() {
            &self.expense.description
        } else {
            &self.expense.merchant
        }
    }
}

/// Component scores and derived facts for one (expense, candidate) pair,
/// computed once and shared by all strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct PairEvaluation {
    /// Position of the transaction in the run's pool.
    pub index: usize,
    pub transaction_id: TransactionId,
    pub scores: ComponentScores,
    pub expense_amount: f64,
    pub transaction_amount: f64,
    pub amount_variance: f64,
    pub date_gap_days: i64,
    pub cross_currency: bool,
    pub fallback_rate: bool,
    pub features: FeatureVector,
}

impl PairEvaluation {
    pub fn evaluate(expense: &ExpenseProfile<'_>, candidate: &Candidate, ctx: &ScoringContext) -> Self {
        let tx: &BankTransaction = &ctx.transactions[candidate.index];
        let config = &ctx.config;
        let expense_ccy = &expense.expense.amount.currency;
        let tx_ccy = &tx.amount.currency;

        let tx_keywords = extract_keywords(&tx.description, config.keyword_limit);
        let scores = ComponentScores {
            amount: amount_score(expense.amount, candidate.amount, config.amount_tolerance),
            date: date_score(candidate.date_gap_days),
            merchant: text_score(expense.label(), &tx.description, Some(&ctx.aliases)),
            keyword: keyword_score(&expense.keywords, &tx_keywords),
            currency: currency_score(expense_ccy, tx_ccy, &config.compatible_currencies),
        }
        .clamped();

        let cross_currency = expense_ccy != tx_ccy;
        let features = FeatureVector::new(
            &scores,
            expense.amount,
            candidate.amount,
            candidate.date_gap_days,
            expense.label().chars().count(),
            tx.description.chars().count(),
        );

        PairEvaluation {
            index: candidate.index,
            transaction_id: tx.id,
            scores,
            expense_amount: expense.amount,
            transaction_amount: candidate.amount,
            amount_variance: candidate.amount_variance,
            date_gap_days: candidate.date_gap_days,
            cross_currency,
            fallback_rate: cross_currency
                && (ctx.normalizer.is_fallback(expense_ccy) || ctx.normalizer.is_fallback(tx_ccy)),
            features,
        }
    }

    pub fn to_proposal(&self, expense_id: ExpenseId, confidence: f64, strategy: StrategyKind) -> MatchProposal {
        let confidence = clamp_unit(confidence);
        MatchProposal {
            expense_id,
            transaction_id: self.transaction_id,
            scores: self.scores,
            confidence,
            tier: ConfidenceTier::from_score(confidence),
            strategy,
            warnings: Default::default(),
            amount_variance: self.amount_variance,
            date_gap_days: self.date_gap_days,
            cross_currency: self.cross_currency,
            fallback_rate: self.fallback_rate,
            features: self.features,
        }
    }
}

/// One way of turning scored pairs into proposals.
pub trait MatchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn propose(
        &self,
        expense: &ExpenseProfile<'_>,
        pairs: &[PairEvaluation],
        ctx: &ScoringContext,
    ) -> Vec<MatchProposal>;
}

/// Same amount, same day, near-identical merchant text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactStrategy;

impl MatchStrategy for ExactStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Exact
    }

    fn propose(
        &self,
        expense: &ExpenseProfile<'_>,
        pairs: &[PairEvaluation],
        ctx: &ScoringContext,
    ) -> Vec<MatchProposal> {
        let config = &ctx.config;
        pairs
            .iter()
            .filter(|p| {
                (p.expense_amount - p.transaction_amount).abs() <= config.exact_amount_epsilon
                    && p.date_gap_days == 0
                    && p.scores.merchant >= config.exact_merchant_threshold
            })
            .map(|p| p.to_proposal(expense.expense.id, 1.0, StrategyKind::Exact))
            .collect()
    }
}

/// Weighted combination of all components over the text-ranked candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyStrategy;

impl MatchStrategy for FuzzyStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fuzzy
    }

    fn propose(
        &self,
        expense: &ExpenseProfile<'_>,
        pairs: &[PairEvaluation],
        ctx: &ScoringContext,
    ) -> Vec<MatchProposal> {
        let by_index: BTreeMap<usize, &PairEvaluation> = pairs.iter().map(|p| (p.index, p)).collect();
        let order: Vec<usize> = pairs.iter().map(|p| p.index).collect();
        ctx.text_index
            .rank(&expense.search_text, &order, ctx.config.fuzzy_search_limit)
            .into_iter()
            .filter_map(|i| by_index.get(&i))
            .map(|p| {
                let confidence = ctx.config.weights.combine(&p.scores);
                p.to_proposal(expense.expense.id, confidence, StrategyKind::Fuzzy)
            })
            .collect()
    }
}

/// Averaged heuristic checks, discounted against fuzzy matching.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternStrategy;

impl PatternStrategy {
    /// Recurring-transaction detection. Not implemented; contributes nothing.
    fn recurring_score(&self, _pair: &PairEvaluation) -> f64 {
        0.0
    }
}

impl MatchStrategy for PatternStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pattern
    }

    fn propose(
        &self,
        expense: &ExpenseProfile<'_>,
        pairs: &[PairEvaluation],
        ctx: &ScoringContext,
    ) -> Vec<MatchProposal> {
        pairs
            .iter()
            .map(|p| {
                let checks = [self.recurring_score(p), p.scores.amount, p.scores.merchant, p.scores.date];
                let mean = checks.iter().sum::<f64>() / checks.len() as f64;
                p.to_proposal(expense.expense.id, mean * ctx.config.pattern_discount, StrategyKind::Pattern)
            })
            .collect()
    }
}

/// Nearest-neighbour vote over the tenant's reviewed matches. Defers to the
/// fuzzy strategy until enough history exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct LearnedStrategy;

impl LearnedStrategy {
    pub fn is_active(&self, ctx: &ScoringContext) -> bool {
        !ctx.history.is_empty() && ctx.history.len() >= ctx.config.learned_min_history
    }
}

impl MatchStrategy for LearnedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Learned
    }

    fn propose(
        &self,
        expense: &ExpenseProfile<'_>,
        pairs: &[PairEvaluation],
        ctx: &ScoringContext,
    ) -> Vec<MatchProposal> {
        if !self.is_active(ctx) {
            return FuzzyStrategy.propose(expense, pairs, ctx);
        }
        pairs
            .iter()
            .filter_map(|p| {
                knn_confidence(&p.features, &ctx.history, ctx.config.learned_k)
                    .map(|c| p.to_proposal(expense.expense.id, c, StrategyKind::Learned))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::currency::{CurrencyNormalizer, RateOrigin};
    use chrono::NaiveDate;
    use expenseflow_core::{Currency, HistoricalOutcome, Money, RecordStatus, TenantId};
    use rust_decimal::Decimal;

    fn ccy(s: &str) -> Currency {
        Currency::new(s).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn expense(cents: i64, currency: &str, day: u32, merchant: &str) -> ExpenseRecord {
        ExpenseRecord {
            id: ExpenseId(1),
            tenant_id: TenantId("acme".into()),
            amount: Money::new(Decimal::new(cents, 2), ccy(currency)),
            date: date(day),
            merchant: merchant.into(),
            description: String::new(),
            status: RecordStatus::Unmatched,
        }
    }

    fn tx(id: i64, cents: i64, currency: &str, day: u32, description: &str) -> BankTransaction {
        BankTransaction {
            id: TransactionId(id),
            tenant_id: TenantId("acme".into()),
            amount: Money::new(Decimal::new(-cents, 2), ccy(currency)),
            date: date(day),
            description: description.into(),
            status: RecordStatus::Unmatched,
        }
    }

    fn evaluate_all<'a>(e: &'a ExpenseRecord, ctx: &ScoringContext) -> (ExpenseProfile<'a>, Vec<PairEvaluation>) {
        let amount = ctx.normalizer.magnitude(&e.amount).unwrap();
        let profile = ExpenseProfile::new(e, amount, ctx.config.keyword_limit);
        let pairs = crate::candidates::generate_candidates(e, &ctx.transactions, &ctx.normalizer, &ctx.config)
            .iter()
            .map(|c| PairEvaluation::evaluate(&profile, c, ctx))
            .collect();
        (profile, pairs)
    }

    #[test]
    fn exact_fires_on_identical_pair() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "PLN", 1, "UBER *TRIP")]);
        let e = expense(10000, "PLN", 1, "Uber");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        let proposals = ExactStrategy.propose(&profile, &pairs, &ctx);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].confidence, 1.0);
        assert_eq!(proposals[0].tier, ConfidenceTier::Exact);
        assert_eq!(proposals[0].transaction_id, TransactionId(5));
    }

    #[test]
    fn exact_requires_same_day() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "PLN", 2, "UBER")]);
        let e = expense(10000, "PLN", 1, "Uber");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        assert!(ExactStrategy.propose(&profile, &pairs, &ctx).is_empty());
    }

    #[test]
    fn fuzzy_combines_weighted_components() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 25500, "EUR", 3, "SOMETHING ELSE")]);
        let ctx = ScoringContext {
            normalizer: CurrencyNormalizer::identity(ccy("EUR")),
            ..ctx
        };
        let e = expense(25000, "EUR", 1, "Hotel Marriott");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        let p = &FuzzyStrategy.propose(&profile, &pairs, &ctx)[0];
        assert!((p.scores.date - 0.7).abs() < 1e-9);
        assert!(p.scores.amount >= 0.8 && p.scores.amount < 0.95);
        assert!(p.confidence < 0.8, "confidence {}", p.confidence);
        assert_eq!(p.strategy, StrategyKind::Fuzzy);
    }

    #[test]
    fn pattern_is_discounted_average_with_zero_recurring_check() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "PLN", 1, "UBER")]);
        let e = expense(10000, "PLN", 1, "Uber");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        let p = &PatternStrategy.propose(&profile, &pairs, &ctx)[0];
        // (0 + 1 + 1 + 1) / 4 * 0.8
        assert!((p.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn learned_falls_back_to_fuzzy_without_history() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "PLN", 1, "UBER")]);
        let e = expense(10000, "PLN", 1, "Uber");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        let proposals = LearnedStrategy.propose(&profile, &pairs, &ctx);
        assert_eq!(proposals[0].strategy, StrategyKind::Fuzzy);
    }

    #[test]
    fn learned_votes_once_history_is_large_enough() {
        let mut ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "PLN", 1, "UBER")]);
        let e = expense(10000, "PLN", 1, "Uber");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        ctx.history = (0..10)
            .map(|i| HistoricalOutcome {
                id: i,
                features: pairs[0].features,
                confirmed: false,
            })
            .collect();
        let proposals = LearnedStrategy.propose(&profile, &pairs, &ctx);
        assert_eq!(proposals[0].strategy, StrategyKind::Learned);
        assert_eq!(proposals[0].confidence, 0.0);
    }

    #[test]
    fn learned_activates_exactly_at_min_history() {
        let mut ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "PLN", 1, "UBER")]);
        let e = expense(10000, "PLN", 1, "Uber");
        let (profile, pairs) = evaluate_all(&e, &ctx);
        let min = ctx.config.learned_min_history as i64;
        let outcomes = |n: i64| -> Vec<HistoricalOutcome> {
            (0..n)
                .map(|i| HistoricalOutcome {
                    id: i,
                    features: pairs[0].features,
                    confirmed: true,
                })
                .collect()
        };

        ctx.history = outcomes(min - 1);
        assert!(!LearnedStrategy.is_active(&ctx));
        let below = LearnedStrategy.propose(&profile, &pairs, &ctx);
        let fuzzy = FuzzyStrategy.propose(&profile, &pairs, &ctx);
        assert_eq!(below[0].strategy, StrategyKind::Fuzzy);
        assert_eq!(below[0].confidence, fuzzy[0].confidence);

        ctx.history = outcomes(min);
        assert!(LearnedStrategy.is_active(&ctx));
        let at = LearnedStrategy.propose(&profile, &pairs, &ctx);
        assert_eq!(at[0].strategy, StrategyKind::Learned);
        assert_eq!(at[0].confidence, 1.0);
    }

    #[test]
    fn same_currency_pair_ignores_fallback_rate() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 10000, "EUR", 1, "UBER")]);
        let ctx = ScoringContext {
            normalizer: CurrencyNormalizer::identity(ccy("PLN")).with_rate(ccy("EUR"), Decimal::new(4, 0), RateOrigin::Fallback),
            ..ctx
        };
        let e = expense(10000, "EUR", 1, "Uber");
        let (_, pairs) = evaluate_all(&e, &ctx);
        assert!(!pairs[0].cross_currency);
        assert!(!pairs[0].fallback_rate);
    }

    #[test]
    fn cross_currency_pair_is_flagged() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(5, 2500, "EUR", 1, "UBER")]);
        let ctx = ScoringContext {
            normalizer: CurrencyNormalizer::identity(ccy("PLN")).with_rate(ccy("EUR"), Decimal::new(4, 0), RateOrigin::Fallback),
            ..ctx
        };
        let e = expense(10000, "PLN", 1, "Uber");
        let (_, pairs) = evaluate_all(&e, &ctx);
        assert!(pairs[0].cross_currency);
        assert!(pairs[0].fallback_rate);
        assert_eq!(pairs[0].scores.currency, 0.8);
        assert_eq!(pairs[0].scores.amount, 1.0);
    }
}
