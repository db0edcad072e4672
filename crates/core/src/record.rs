use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::money::{parse_amount, Currency, Money};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExpenseId(pub i64);

impl fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Matching status carried by both expenses and bank transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Unmatched,
    PendingReview,
    Matched,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Unmatched => "unmatched",
            RecordStatus::PendingReview => "pending_review",
            RecordStatus::Matched => "matched",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unmatched" => Ok(RecordStatus::Unmatched),
            "pending_review" => Ok(RecordStatus::PendingReview),
            "matched" => Ok(RecordStatus::Matched),
            other => Err(format!("Unknown record status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("Record {0}: invalid amount '{1}'")]
    InvalidAmount(i64, String),
    #[error("Record {0}: amount must be non-zero")]
    ZeroAmount(i64),
    #[error("Record {0}: invalid date '{1}'")]
    InvalidDate(i64, String),
    #[error("Record {0}: invalid currency '{1}'")]
    InvalidCurrency(i64, String),
    #[error("Record {0}: invalid status '{1}'")]
    InvalidStatus(i64, String),
    #[error("Record {0}: missing tenant")]
    MissingTenant(i64),
}

/// An expense row as stored by the capture pipeline, before any field has
/// been checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExpense {
    pub id: i64,
    pub tenant_id: String,
    pub amount: String,
    pub currency: String,
    pub date: String,
    pub merchant: String,
    pub description: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseRecord {
    pub id: ExpenseId,
    pub tenant_id: TenantId,
    /// Always positive; expenses are claimed costs.
    pub amount: Money,
    pub date: NaiveDate,
    pub merchant: String,
    pub description: String,
    pub status: RecordStatus,
}

impl ExpenseRecord {
    pub fn validate(raw: RawExpense) -> Result<ExpenseRecord, RecordError> {
        let id = raw.id;
        let tenant_id = non_empty_tenant(id, &raw.tenant_id)?;
        let amount = parse_amount(&raw.amount)
            .ok_or_else(|| RecordError::InvalidAmount(id, raw.amount.clone()))?
            .round_dp(2);
        if amount.is_zero() {
            return Err(RecordError::ZeroAmount(id));
        }
        let currency = Currency::new(&raw.currency)
            .ok_or_else(|| RecordError::InvalidCurrency(id, raw.currency.clone()))?;
        let date = parse_date(&raw.date).ok_or_else(|| RecordError::InvalidDate(id, raw.date.clone()))?;
        let status = raw
            .status
            .parse::<RecordStatus>()
            .map_err(|_| RecordError::InvalidStatus(id, raw.status.clone()))?;

        Ok(ExpenseRecord {
            id: ExpenseId(id),
            tenant_id,
            amount: Money::new(amount.abs(), currency),
            date,
            merchant: raw.merchant.trim().to_string(),
            description: raw.description.unwrap_or_default().trim().to_string(),
            status,
        })
    }

    /// Merchant and description joined, used for text search.
    pub fn search_text(&self) -> String {
        if self.description.is_empty() {
            self.merchant.clone()
        } else {
            format!("{} {}", self.merchant, self.description)
        }
    }
}

/// A bank statement line as imported, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBankTransaction {
    pub id: i64,
    pub tenant_id: String,
    pub amount: String,
    pub currency: String,
    pub date: String,
    pub description: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    /// Signed; negative amounts are debits.
    pub amount: Money,
    pub date: NaiveDate,
    pub description: String,
    pub status: RecordStatus,
}

impl BankTransaction {
    pub fn validate(raw: RawBankTransaction) -> Result<BankTransaction, RecordError> {
        let id = raw.id;
        let tenant_id = non_empty_tenant(id, &raw.tenant_id)?;
        let amount = parse_amount(&raw.amount)
            .ok_or_else(|| RecordError::InvalidAmount(id, raw.amount.clone()))?
            .round_dp(2);
        if amount.is_zero() {
            return Err(RecordError::ZeroAmount(id));
        }
        let currency = Currency::new(&raw.currency)
            .ok_or_else(|| RecordError::InvalidCurrency(id, raw.currency.clone()))?;
        let date = parse_date(&raw.date).ok_or_else(|| RecordError::InvalidDate(id, raw.date.clone()))?;
        let status = raw
            .status
            .parse::<RecordStatus>()
            .map_err(|_| RecordError::InvalidStatus(id, raw.status.clone()))?;

        Ok(BankTransaction {
            id: TransactionId(id),
            tenant_id,
            amount: Money::new(amount, currency),
            date,
            description: raw.description.trim().to_string(),
            status,
        })
    }

    pub fn is_debit(&self) -> bool {
        self.amount.amount.is_sign_negative()
    }
}

fn non_empty_tenant(id: i64, tenant: &str) -> Result<TenantId, RecordError> {
    let tenant = tenant.trim();
    if tenant.is_empty() {
        Err(RecordError::MissingTenant(id))
    } else {
        Ok(TenantId(tenant.to_string()))
    }
}

/// ISO dates first, then the common day/month layouts seen in bank exports.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    ["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%m/%d/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}
