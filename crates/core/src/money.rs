use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Three-letter ISO 4217 currency code, always stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Option<Self> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Some(Currency(code.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s).ok_or_else(|| format!("Invalid currency code: '{s}'"))
    }
}

impl TryFrom<String> for Currency {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.0
    }
}

/// An amount tagged with its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Money {
            amount: amount.round_dp(2),
            currency,
        }
    }

    pub fn abs(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.amount, self.currency)
    }
}

/// Lossy conversion used by the scoring code, which works in `f64`.
pub fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Parses user-entered amounts: tolerates currency symbols, accounting-style
/// parentheses for negatives and either decimal convention. When both `.`
/// and `,` appear the later one is the decimal separator; a lone comma
/// followed by one or two digits is a decimal comma. Thousands groups must
/// be three digits wide.
pub fn parse_amount(s: &str) -> Option<Decimal> {
    let s = s.trim();
    let (negative, s) = if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        (true, &s[1..s.len() - 1])
    } else {
        (false, s)
    };
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&canonical_number(&cleaned)?).ok()?;
    Some(if negative { -value } else { value })
}

/// Rewrites `cleaned` with `.` as the only separator.
fn canonical_number(cleaned: &str) -> Option<String> {
    let (sign, body) = match cleaned.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", cleaned.strip_prefix('+').unwrap_or(cleaned)),
    };

    let (decimal, group) = match (body.rfind('.'), body.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => (',', '.'),
        (None, Some(comma)) if body.matches(',').count() == 1 && (1..=2).contains(&(body.len() - comma - 1)) => {
            (',', '.')
        }
        _ => ('.', ','),
    };

    let (integer, fraction) = match body.rfind(decimal) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    if fraction.is_some_and(|f| f.contains([',', '.'])) {
        return None;
    }
    if integer.contains(group) {
        let mut groups = integer.split(group);
        let lead = groups.next()?;
        if lead.is_empty() || lead.len() > 3 || groups.any(|g| g.len() != 3) {
            return None;
        }
    }

    let mut out = String::with_capacity(cleaned.len());
    out.push_str(sign);
    out.extend(integer.chars().filter(|c| *c != group));
    if let Some(fraction) = fraction {
        out.push('.');
        out.push_str(fraction);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_is_normalized_to_upper_case() {
        assert_eq!(Currency::new("pln").unwrap().as_str(), "PLN");
        assert_eq!(Currency::new(" eur ").unwrap().to_string(), "EUR");
    }

    #[test]
    fn currency_rejects_bad_codes() {
        assert!(Currency::new("").is_none());
        assert!(Currency::new("EURO").is_none());
        assert!(Currency::new("E1R").is_none());
    }

    #[test]
    fn money_display_has_two_decimals() {
        let m = Money::new(Decimal::new(1005, 1), Currency::new("PLN").unwrap());
        assert_eq!(m.to_string(), "100.50 PLN");
    }

    #[test]
    fn parse_amount_variants() {
        assert_eq!(parse_amount("100.00"), Some(Decimal::new(10000, 2)));
        assert_eq!(parse_amount("-255.00"), Some(Decimal::new(-25500, 2)));
        assert_eq!(parse_amount("1,250.50"), Some(Decimal::new(125050, 2)));
        assert_eq!(parse_amount("(42.10)"), Some(Decimal::new(-4210, 2)));
        assert_eq!(parse_amount("$9.99"), Some(Decimal::new(999, 2)));
    }

    #[test]
    fn parse_amount_decimal_comma() {
        assert_eq!(parse_amount("12,50"), Some(Decimal::new(1250, 2)));
        assert_eq!(parse_amount("-7,5"), Some(Decimal::new(-75, 1)));
        assert_eq!(parse_amount("1.234,56"), Some(Decimal::new(123456, 2)));
        assert_eq!(parse_amount("1,234.56"), Some(Decimal::new(123456, 2)));
        assert_eq!(parse_amount("(1.234,56 €)"), Some(Decimal::new(-123456, 2)));
        assert_eq!(parse_amount("1,250"), Some(Decimal::new(1250, 0)));
        assert_eq!(parse_amount("2,500,000"), Some(Decimal::new(2500000, 0)));
    }

    #[test]
    fn parse_amount_rejects_misplaced_separators() {
        assert_eq!(parse_amount("12;50"), None);
        assert_eq!(parse_amount("1,2,3"), None);
        assert_eq!(parse_amount("12,34,56.00"), None);
        assert_eq!(parse_amount("1.234,56.7"), None);
        assert_eq!(parse_amount("1.234.567"), None);
    }

    #[test]
    fn parse_amount_rejects_garbage() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("12.3.4"), None);
    }

    #[test]
    fn currency_serde_roundtrip_validates() {
        let c: Currency = serde_json::from_str("\"usd\"").unwrap();
        assert_eq!(c.as_str(), "USD");
        assert!(serde_json::from_str::<Currency>("\"dollars\"").is_err());
    }
}
