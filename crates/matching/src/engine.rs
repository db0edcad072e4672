use std::cmp::Ordering;
use std::collections::BTreeMap;

use expenseflow_core::{BankTransaction, ExpenseRecord, HistoricalOutcome, MatchProposal, TransactionId};
use tracing::debug;

use crate::alias::MerchantAliasIndex;
use crate::candidates::Candidate;
use crate::config::MatchConfig;
use crate::currency::CurrencyNormalizer;
use crate::search::TextIndex;
use crate::strategy::{
    ExactStrategy, ExpenseProfile, FuzzyStrategy, LearnedStrategy, MatchStrategy, PairEvaluation,
    PatternStrategy,
};

/// Everything a scoring worker reads. Built once per run, never mutated
/// afterwards, and shared between workers.
#[derive(Debug, Clone)]
pub struct ScoringContext {
    pub config: MatchConfig,
    pub normalizer: CurrencyNormalizer,
    pub aliases: MerchantAliasIndex,
    pub text_index: TextIndex,
    pub history: Vec<HistoricalOutcome>,
    pub transactions: Vec<BankTransaction>,
}

impl ScoringContext {
    pub fn new(
        config: MatchConfig,
        normalizer: CurrencyNormalizer,
        aliases: MerchantAliasIndex,
        history: Vec<HistoricalOutcome>,
        transactions: Vec<BankTransaction>,
    ) -> Self {
        let text_index = TextIndex::build(&transactions);
        Self {
            config,
            normalizer,
            aliases,
            text_index,
            history,
            transactions,
        }
    }

    /// Context over `transactions` with only the reporting currency
    /// convertible, no aliases and no history.
    pub fn for_pool(config: MatchConfig, transactions: Vec<BankTransaction>) -> Self {
        let normalizer = CurrencyNormalizer::identity(config.reporting_currency.clone());
        Self::new(config, normalizer, MerchantAliasIndex::default(), Vec::new(), transactions)
    }
}

/// Runs the strategies in priority order for one expense and keeps the best
/// proposal per transaction.
pub struct StrategyEngine {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl Default for StrategyEngine {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ExactStrategy),
            Box::new(FuzzyStrategy),
            Box::new(PatternStrategy),
            Box::new(LearnedStrategy),
        ])
    }
}

impl StrategyEngine {
    pub fn new(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { strategies }
    }

    /// Top-K proposals for `expense` at or above the minimum threshold,
    /// ranked by descending confidence. Stops consulting strategies once one
    /// produces a near-certain match.
    pub fn score_expense(
        &self,
        expense: &ExpenseRecord,
        candidates: &[Candidate],
        ctx: &ScoringContext,
    ) -> Vec<MatchProposal> {
        let config = &ctx.config;
        let Some(amount) = ctx.normalizer.magnitude(&expense.amount) else {
            return Vec::new();
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let profile = ExpenseProfile::new(expense, amount, config.keyword_limit);
        let pairs: Vec<PairEvaluation> = candidates
            .iter()
            .map(|c| PairEvaluation::evaluate(&profile, c, ctx))
            .collect();

        let mut best: BTreeMap<TransactionId, MatchProposal> = BTreeMap::new();
        for strategy in &self.strategies {
            let proposals = strategy.propose(&profile, &pairs, ctx);
            let mut top = 0.0_f64;
            let mut kept = 0usize;
            for proposal in proposals {
                if proposal.confidence < config.min_match_threshold {
                    continue;
                }
                top = top.max(proposal.confidence);
                kept += 1;
                match best.get(&proposal.transaction_id) {
                    Some(existing) if existing.confidence >= proposal.confidence => {}
                    _ => {
                        best.insert(proposal.transaction_id, proposal);
                    }
                }
            }
            debug!(
                expense_id = %expense.id,
                strategy = %strategy.kind(),
                kept,
                top,
                "Strategy evaluated"
            );
            if top >= config.early_stop_confidence {
                break;
            }
        }

        let mut ranked: Vec<MatchProposal> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then(a.transaction_id.cmp(&b.transaction_id))
        });
        ranked.truncate(config.top_k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::generate_candidates;
    use chrono::NaiveDate;
    use expenseflow_core::{Currency, ExpenseId, Money, RecordStatus, StrategyKind, TenantId};
    use rust_decimal::Decimal;

    fn ccy(s: &str) -> Currency {
        Currency::new(s).unwrap()
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn expense(cents: i64, day: u32, merchant: &str) -> ExpenseRecord {
        ExpenseRecord {
            id: ExpenseId(1),
            tenant_id: TenantId("acme".into()),
            amount: Money::new(Decimal::new(cents, 2), ccy("PLN")),
            date: date(day),
            merchant: merchant.into(),
            description: String::new(),
            status: RecordStatus::Unmatched,
        }
    }

    fn tx(id: i64, cents: i64, day: u32, description: &str) -> BankTransaction {
        BankTransaction {
            id: TransactionId(id),
            tenant_id: TenantId("acme".into()),
            amount: Money::new(Decimal::new(-cents, 2), ccy("PLN")),
            date: date(day),
            description: description.into(),
            status: RecordStatus::Unmatched,
        }
    }

    fn score(e: &ExpenseRecord, ctx: &ScoringContext) -> Vec<MatchProposal> {
        let candidates = generate_candidates(e, &ctx.transactions, &ctx.normalizer, &ctx.config);
        StrategyEngine::default().score_expense(e, &candidates, ctx)
    }

    #[test]
    fn exact_match_stops_early() {
        let ctx = ScoringContext::for_pool(
            MatchConfig::default(),
            vec![tx(1, 10000, 1, "UBER *TRIP"), tx(2, 10100, 2, "UBER *TRIP")],
        );
        let proposals = score(&expense(10000, 1, "Uber"), &ctx);
        assert_eq!(proposals[0].transaction_id, TransactionId(1));
        assert_eq!(proposals[0].strategy, StrategyKind::Exact);
        assert_eq!(proposals[0].confidence, 1.0);
        // Later strategies never ran, so the second candidate has no proposal.
        assert_eq!(proposals.len(), 1);
    }

    #[test]
    fn keeps_best_strategy_per_transaction() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(1, 10100, 2, "UBER")]);
        let proposals = score(&expense(10000, 1, "Uber"), &ctx);
        assert_eq!(proposals.len(), 1);
        // Fuzzy beats the discounted pattern score.
        assert_eq!(proposals[0].strategy, StrategyKind::Fuzzy);
    }

    #[test]
    fn drops_proposals_below_minimum() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![tx(1, 15000, 28, "ORLEN STACJA")]);
        assert!(score(&expense(10000, 1, "Marriott"), &ctx).is_empty());
    }

    #[test]
    fn returns_at_most_top_k_in_descending_order() {
        let pool: Vec<BankTransaction> = (0..8).map(|i| tx(i, 10000 + i * 100, 2, "UBER")).collect();
        let ctx = ScoringContext::for_pool(MatchConfig::default(), pool);
        let proposals = score(&expense(10000, 1, "Uber"), &ctx);
        assert_eq!(proposals.len(), 5);
        assert!(proposals.windows(2).all(|w| w[0].confidence >= w[1].confidence));
        assert_eq!(proposals[0].transaction_id, TransactionId(0));
    }

    #[test]
    fn no_candidates_no_proposals() {
        let ctx = ScoringContext::for_pool(MatchConfig::default(), vec![]);
        assert!(score(&expense(10000, 1, "Uber"), &ctx).is_empty());
    }
}
