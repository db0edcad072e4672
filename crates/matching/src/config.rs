use expenseflow_core::{ComponentScores, Currency};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid matching configuration: {0}")]
    Invalid(String),
}

/// Relative importance of each similarity dimension. Weights need not sum to
/// one; the combined score is normalised by their total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub amount: f64,
    pub date: f64,
    pub merchant: f64,
    #[serde(default)]
    pub keyword: f64,
    #[serde(default)]
    pub currency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            amount: 0.40,
            date: 0.25,
            merchant: 0.25,
            keyword: 0.05,
            currency: 0.05,
        }
    }
}

impl ScoreWeights {
    /// The simpler amount/date/vendor split, expressed in five-way form.
    pub fn three_way() -> Self {
        Self {
            amount: 0.50,
            date: 0.25,
            merchant: 0.25,
            keyword: 0.0,
            currency: 0.0,
        }
    }

    pub fn total(&self) -> f64 {
        self.amount + self.date + self.merchant + self.keyword + self.currency
    }

    pub fn combine(&self, s: &ComponentScores) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = self.amount * s.amount
            + self.date * s.date
            + self.merchant * s.merchant
            + self.keyword * s.keyword
            + self.currency * s.currency;
        expenseflow_core::clamp_unit(weighted / total)
    }

    fn validate(&self, label: &str) -> Result<(), ConfigError> {
        let all = [self.amount, self.date, self.merchant, self.keyword, self.currency];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(format!("{label}: weights must be non-negative")));
        }
        if self.total() <= 0.0 {
            return Err(ConfigError::Invalid(format!("{label}: weights must not all be zero")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMode {
    /// Score-sorted first-come acceptance.
    #[default]
    Greedy,
    /// Maximum total confidence (Hungarian algorithm).
    Optimal,
}

/// Per-tenant adjustments stored alongside the tenant's data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleOverrides {
    /// Replaces the weight set the fuzzy strategy combines components with.
    pub fuzzy_weights: Option<ScoreWeights>,
    pub min_match_threshold: Option<f64>,
    pub auto_confirm_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchConfig {
    pub reporting_currency: Currency,

    // Similarity primitives
    pub amount_tolerance: f64,
    pub compatible_currencies: Vec<(Currency, Currency)>,
    pub alias_threshold: f64,
    pub keyword_limit: usize,

    // Candidate generation
    pub candidate_amount_tolerance: f64,
    pub candidate_date_window_days: i64,
    pub max_candidates_per_expense: usize,

    // Strategies
    pub weights: ScoreWeights,
    pub exact_amount_epsilon: f64,
    pub exact_merchant_threshold: f64,
    pub fuzzy_search_limit: usize,
    pub pattern_discount: f64,
    pub learned_min_history: usize,
    pub learned_k: usize,
    pub history_limit: usize,
    pub min_match_threshold: f64,
    pub early_stop_confidence: f64,
    pub top_k: usize,

    // Aggregation and business rules
    pub rank_penalty: f64,
    pub agreement_bonus: f64,
    pub hard_floor: f64,
    pub max_amount_variance: f64,
    pub warn_amount_variance: f64,
    pub max_date_gap_days: i64,
    pub warn_date_gap_days: i64,
    pub min_currency_compatibility: f64,

    // Resolution
    pub auto_confirm_threshold: f64,
    pub assignment: AssignmentMode,

    // Execution
    pub concurrency: usize,
    pub rate_timeout_ms: u64,
}

fn ccy(code: &str) -> Currency {
    Currency::new(code).expect("built-in currency code is valid")
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            reporting_currency: ccy("PLN"),
            amount_tolerance: 0.02,
            compatible_currencies: vec![
                (ccy("PLN"), ccy("EUR")),
                (ccy("PLN"), ccy("USD")),
                (ccy("EUR"), ccy("USD")),
            ],
            alias_threshold: 0.8,
            keyword_limit: 10,
            candidate_amount_tolerance: 0.5,
            candidate_date_window_days: 30,
            max_candidates_per_expense: 50,
            weights: ScoreWeights::default(),
            exact_amount_epsilon: 0.01,
            exact_merchant_threshold: 0.95,
            fuzzy_search_limit: 20,
            pattern_discount: 0.8,
            learned_min_history: 10,
            learned_k: 5,
            history_limit: 1000,
            min_match_threshold: 0.4,
            early_stop_confidence: 0.95,
            top_k: 5,
            rank_penalty: 0.1,
            agreement_bonus: 1.1,
            hard_floor: 0.3,
            max_amount_variance: 0.5,
            warn_amount_variance: 0.2,
            max_date_gap_days: 30,
            warn_date_gap_days: 14,
            min_currency_compatibility: 0.5,
            auto_confirm_threshold: 0.8,
            assignment: AssignmentMode::Greedy,
            concurrency: 4,
            rate_timeout_ms: 3_000,
        }
    }
}

impl MatchConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config: MatchConfig = toml::from_str(toml_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate("weights")?;
        let unit = [
            ("amount_tolerance", self.amount_tolerance),
            ("alias_threshold", self.alias_threshold),
            ("exact_merchant_threshold", self.exact_merchant_threshold),
            ("pattern_discount", self.pattern_discount),
            ("min_match_threshold", self.min_match_threshold),
            ("early_stop_confidence", self.early_stop_confidence),
            ("rank_penalty", self.rank_penalty),
            ("hard_floor", self.hard_floor),
            ("min_currency_compatibility", self.min_currency_compatibility),
            ("auto_confirm_threshold", self.auto_confirm_threshold),
        ];
        for (name, v) in unit {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")));
            }
        }
        if self.amount_tolerance <= 0.0 {
            return Err(ConfigError::Invalid("amount_tolerance must be positive".into()));
        }
        if self.agreement_bonus < 1.0 {
            return Err(ConfigError::Invalid("agreement_bonus must be at least 1.0".into()));
        }
        if self.top_k == 0 || self.learned_k == 0 || self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "top_k, learned_k and concurrency must be at least 1".into(),
            ));
        }
        if self.candidate_date_window_days < 0 || self.max_date_gap_days < 0 {
            return Err(ConfigError::Invalid("day windows must not be negative".into()));
        }
        Ok(())
    }

    /// Run configuration with a tenant's overrides layered on top.
    pub fn with_overrides(&self, overrides: &RuleOverrides) -> Result<MatchConfig, ConfigError> {
        let mut merged = self.clone();
        if let Some(w) = overrides.fuzzy_weights {
            merged.weights = w;
        }
        if let Some(t) = overrides.min_match_threshold {
            merged.min_match_threshold = t;
        }
        if let Some(t) = overrides.auto_confirm_threshold {
            merged.auto_confirm_threshold = t;
        }
        merged.validate()?;
        Ok(merged)
    }
}
