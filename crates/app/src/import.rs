use expenseflow_storage::{NewBankTransaction, NewExpense};
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Missing required column: {0}")]
    MissingColumn(&'static str),
}

/// Column positions resolved from a header row. Header names are matched
/// case-insensitively against a few common spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    date: usize,
    amount: usize,
    currency: Option<usize>,
    merchant: Option<usize>,
    description: Option<usize>,
}

const DATE: &[&str] = &["date", "transaction_date", "booking_date", "posted"];
const AMOUNT: &[&str] = &["amount", "value", "total"];
const CURRENCY: &[&str] = &["currency", "ccy"];
const MERCHANT: &[&str] = &["merchant", "vendor", "payee"];
const DESCRIPTION: &[&str] = &["description", "details", "memo", "title"];

fn find(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_lowercase().replace([' ', '-'], "_");
        names.contains(&h.as_str())
    })
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, ImportError> {
        Ok(Columns {
            date: find(headers, DATE).ok_or(ImportError::MissingColumn("date"))?,
            amount: find(headers, AMOUNT).ok_or(ImportError::MissingColumn("amount"))?,
            currency: find(headers, CURRENCY),
            merchant: find(headers, MERCHANT),
            description: find(headers, DESCRIPTION),
        })
    }
}

/// One data row, fields copied verbatim. Short rows yield empty fields so
/// that validation during a run can reject and count them.
struct Row {
    date: String,
    amount: String,
    currency: String,
    merchant: String,
    description: Option<String>,
}

fn read_rows<R: Read>(reader: R, default_currency: &str) -> Result<Vec<Row>, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = Columns::resolve(reader.headers()?)?;

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let field = |col: Option<usize>| col.and_then(|c| record.get(c)).unwrap_or_default().to_string();

        let currency = field(columns.currency);
        rows.push(Row {
            date: field(Some(columns.date)),
            amount: field(Some(columns.amount)),
            currency: if currency.is_empty() {
                default_currency.to_string()
            } else {
                currency
            },
            merchant: field(columns.merchant),
            description: Some(field(columns.description)).filter(|d| !d.is_empty()),
        });
    }
    Ok(rows)
}

/// Expenses from a CSV with at least `date` and `amount` columns.
pub fn read_expenses<R: Read>(
    reader: R,
    tenant: &str,
    default_currency: &str,
) -> Result<Vec<NewExpense>, ImportError> {
    Ok(read_rows(reader, default_currency)?
        .into_iter()
        .map(|row| NewExpense {
            tenant_id: tenant.to_string(),
            amount: row.amount,
            currency: row.currency,
            date: row.date,
            merchant: row.merchant,
            description: row.description,
        })
        .collect())
}

/// Bank statement lines. Without a description column the merchant/payee
/// column is used as the description.
pub fn read_bank_transactions<R: Read>(
    reader: R,
    tenant: &str,
    default_currency: &str,
) -> Result<Vec<NewBankTransaction>, ImportError> {
    Ok(read_rows(reader, default_currency)?
        .into_iter()
        .map(|row| NewBankTransaction {
            tenant_id: tenant.to_string(),
            amount: row.amount,
            currency: row.currency,
            date: row.date,
            description: row.description.unwrap_or(row.merchant),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_expenses_by_header_name() {
        let data = "Merchant,Amount,Date,Currency,Notes\n\
                    Uber,100.00,2024-03-01,PLN,airport\n\
                    Hotel Marriott,250.00,2024-03-05,,\n";
        let rows = read_expenses(data.as_bytes(), "acme", "EUR").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].merchant, "Uber");
        assert_eq!(rows[0].amount, "100.00");
        assert_eq!(rows[0].currency, "PLN");
        assert_eq!(rows[0].tenant_id, "acme");
        assert_eq!(rows[1].currency, "EUR");
        assert_eq!(rows[1].description, None);
    }

    #[test]
    fn bank_rows_fall_back_to_payee() {
        let data = "Booking Date,Payee,Amount\n2024-03-01,UBER *TRIP,-100.00\n";
        let rows = read_bank_transactions(data.as_bytes(), "acme", "PLN").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "UBER *TRIP");
        assert_eq!(rows[0].date, "2024-03-01");
    }

    #[test]
    fn malformed_rows_are_kept_verbatim() {
        let data = "date,amount,description\nyesterday,12;50,COFFEE\n2024-03-02\n,,\n";
        let rows = read_bank_transactions(data.as_bytes(), "acme", "PLN").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, "yesterday");
        assert_eq!(rows[0].amount, "12;50");
        assert_eq!(rows[1].amount, "");
        assert_eq!(rows[1].description, "");
    }

    #[test]
    fn missing_amount_column_is_an_error() {
        let err = read_expenses("date,merchant\n2024-03-01,Uber\n".as_bytes(), "acme", "PLN")
            .unwrap_err();
        assert!(matches!(err, ImportError::MissingColumn("amount")));
    }
}
