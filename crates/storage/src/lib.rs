pub mod db;
pub mod store;

pub use db::{
    create_db, delete_overrides, get_match, insert_bank_transaction, insert_expense, list_audit,
    list_matches, list_runs, review_match, save_overrides, DbPool, NewBankTransaction, NewExpense,
    ReviewDecision,
};
pub use store::SqliteStore;
