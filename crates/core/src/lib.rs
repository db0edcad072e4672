pub mod matching;
pub mod money;
pub mod period;
pub mod record;

pub use matching::{
    clamp_unit, AuditAction, AuditEntry, ComponentScores, ConfidenceTier, FeatureVector,
    HistoricalOutcome, MatchProposal, MatchRecord, MatchStatus, StrategyKind, Warning,
    FEATURE_COUNT,
};
pub use money::{decimal_to_f64, parse_amount, Currency, Money};
pub use period::{days_apart, DateRange};
pub use record::{
    parse_date, BankTransaction, ExpenseId, ExpenseRecord, RawBankTransaction, RawExpense,
    RecordError, RecordStatus, TenantId, TransactionId,
};
