//! Expense to bank-transaction matching: similarity scoring, candidate
//! selection, matching strategies, conflict resolution and run orchestration.

pub mod aggregate;
pub mod alias;
pub mod candidates;
pub mod config;
pub mod currency;
pub mod engine;
pub mod learned;
pub mod reconciler;
pub mod resolver;
pub mod search;
pub mod similarity;
pub mod store;
pub mod strategy;
pub mod summary;
pub(crate) mod util;

pub use aggregate::{aggregate, Aggregated, Veto};
pub use alias::MerchantAliasIndex;
pub use candidates::{generate_candidates, Candidate};
pub use config::{AssignmentMode, ConfigError, MatchConfig, RuleOverrides, ScoreWeights};
pub use currency::{CurrencyNormalizer, HttpRateSource, RateError, RateOrigin, RateSource, StaticRates};
pub use engine::{ScoringContext, StrategyEngine};
pub use reconciler::{Reconciler, RunRequest, CANCELLED};
pub use resolver::{auto_confirm_eligible, resolve, Resolution};
pub use search::TextIndex;
pub use store::{in_range, is_open_status, MemoryStore, ReconciliationStore, StoreError};
pub use strategy::{
    ExactStrategy, FuzzyStrategy, LearnedStrategy, MatchStrategy, PairEvaluation, PatternStrategy,
};
pub use summary::{RunReport, RunSummary};
