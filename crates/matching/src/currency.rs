use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use expenseflow_core::{decimal_to_f64, Currency, Money};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RateError {
    #[error("No rate available for {0}/{1}")]
    Unavailable(Currency, Currency),
    #[error("Rate lookup for {0}/{1} timed out")]
    Timeout(Currency, Currency),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid rate: {0}")]
    Invalid(String),
}

/// Abstraction over an exchange-rate provider.
/// Returns the multiplicative rate converting one unit of `from` into `to`.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn get_rate(
        &self,
        from: &Currency,
        to: &Currency,
        as_of: NaiveDate,
    ) -> Result<Decimal, RateError>;
}

// ── Static table (tests, offline use, built-in fallback) ─────────────────────

#[derive(Debug, Clone, Default)]
pub struct StaticRates {
    rates: HashMap<(Currency, Currency), Decimal>,
}

impl StaticRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        if let (Some(f), Some(t)) = (Currency::new(from), Currency::new(to)) {
            self.rates.insert((f, t), rate);
        }
        self
    }

    /// The documented PLN/EUR/USD defaults used when no fresher rate exists.
    pub fn fallback_table() -> Self {
        Self::new()
            .with_rate("EUR", "PLN", Decimal::new(430, 2))
            .with_rate("USD", "PLN", Decimal::new(400, 2))
            .with_rate("EUR", "USD", Decimal::new(108, 2))
    }

    /// Direct rate, or the reciprocal of the reverse pair.
    pub fn lookup(&self, from: &Currency, to: &Currency) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        if let Some(r) = self.rates.get(&(from.clone(), to.clone())) {
            return Some(*r);
        }
        self.rates
            .get(&(to.clone(), from.clone()))
            .filter(|r| !r.is_zero())
            .map(|r| Decimal::ONE / *r)
    }
}

#[async_trait]
impl RateSource for StaticRates {
    async fn get_rate(
        &self,
        from: &Currency,
        to: &Currency,
        _as_of: NaiveDate,
    ) -> Result<Decimal, RateError> {
        self.lookup(from, to)
            .ok_or_else(|| RateError::Unavailable(from.clone(), to.clone()))
    }
}

// ── HTTP provider (Frankfurter-compatible API) ───────────────────────────────

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, f64>,
}

pub struct HttpRateSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRateSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn get_rate(
        &self,
        from: &Currency,
        to: &Currency,
        as_of: NaiveDate,
    ) -> Result<Decimal, RateError> {
        let url = format!("{}/{}?from={}&to={}", self.base_url, as_of, from, to);
        let body: RatesResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let rate = body
            .rates
            .get(to.as_str())
            .copied()
            .ok_or_else(|| RateError::Unavailable(from.clone(), to.clone()))?;
        Decimal::from_f64(rate)
            .filter(|r| r.is_sign_positive() && !r.is_zero())
            .ok_or_else(|| RateError::Invalid(rate.to_string()))
    }
}

// ── Per-run snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOrigin {
    Source,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRate {
    pub rate: Decimal,
    pub origin: RateOrigin,
}

/// Converts amounts into the reporting currency using rates fetched once at
/// the start of a run. Immutable after construction.
#[derive(Debug, Clone)]
pub struct CurrencyNormalizer {
    reporting: Currency,
    rates: BTreeMap<Currency, ExchangeRate>,
}

impl CurrencyNormalizer {
    /// A normalizer that only knows the reporting currency.
    pub fn identity(reporting: Currency) -> Self {
        Self {
            reporting,
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, currency: Currency, rate: Decimal, origin: RateOrigin) -> Self {
        self.rates.insert(currency, ExchangeRate { rate, origin });
        self
    }

    /// Fetches one rate per distinct currency. A failed or slow lookup falls
    /// back to the built-in table; currencies missing from both stay
    /// unconvertible for this run.
    pub async fn build<I>(
        source: &dyn RateSource,
        reporting: Currency,
        currencies: I,
        as_of: NaiveDate,
        timeout: Duration,
    ) -> Self
    where
        I: IntoIterator<Item = Currency>,
    {
        let fallback = StaticRates::fallback_table();
        let mut normalizer = Self::identity(reporting.clone());

        for currency in currencies {
            if currency == reporting || normalizer.rates.contains_key(&currency) {
                continue;
            }
            let fetched = match tokio::time::timeout(
                timeout,
                source.get_rate(&currency, &reporting, as_of),
            )
            .await
            {
                Ok(Ok(rate)) if rate > Decimal::ZERO => Ok(rate),
                Ok(Ok(rate)) => Err(RateError::Invalid(rate.to_string())),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(RateError::Timeout(currency.clone(), reporting.clone())),
            };

            match fetched {
                Ok(rate) => {
                    debug!(%currency, %reporting, %rate, "Exchange rate fetched");
                    normalizer.rates.insert(
                        currency,
                        ExchangeRate { rate, origin: RateOrigin::Source },
                    );
                }
                Err(e) => match fallback.lookup(&currency, &reporting) {
                    Some(rate) => {
                        warn!(%currency, %reporting, error = %e, "Using fallback exchange rate");
                        normalizer.rates.insert(
                            currency,
                            ExchangeRate { rate, origin: RateOrigin::Fallback },
                        );
                    }
                    None => {
                        warn!(%currency, %reporting, error = %e, "No exchange rate; records in this currency cannot be compared");
                    }
                },
            }
        }

        normalizer
    }

    pub fn reporting(&self) -> &Currency {
        &self.reporting
    }

    pub fn rate(&self, currency: &Currency) -> Option<Decimal> {
        if *currency == self.reporting {
            Some(Decimal::ONE)
        } else {
            self.rates.get(currency).map(|r| r.rate)
        }
    }

    pub fn is_fallback(&self, currency: &Currency) -> bool {
        self.rates
            .get(currency)
            .is_some_and(|r| r.origin == RateOrigin::Fallback)
    }

    /// Signed amount in the reporting currency.
    pub fn convert(&self, money: &Money) -> Option<Decimal> {
        self.rate(&money.currency).map(|r| money.amount * r)
    }

    /// Absolute amount in the reporting currency, as used by scoring.
    pub fn magnitude(&self, money: &Money) -> Option<f64> {
        self.convert(money).map(|d| decimal_to_f64(d.abs()))
    }
}
