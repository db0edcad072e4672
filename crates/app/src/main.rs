use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use expenseflow_core::MatchStatus;
use expenseflow_match::{RuleOverrides, ScoreWeights};
use expenseflow_storage::ReviewDecision;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;
mod config;
mod import;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "expenseflow", version, about = "Reconcile expenses against bank transactions")]
struct Cli {
    /// Config file (default: expenseflow.toml in the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tenant whose records are used
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load records from a CSV file with a header row
    Import {
        #[arg(value_enum)]
        kind: ImportKind,
        path: PathBuf,
    },
    /// Match open expenses against open bank transactions
    Run {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Date exchange rates are looked up for (default: today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Maximise total confidence instead of greedy assignment
        #[arg(long)]
        optimal: bool,
        #[arg(long)]
        json: bool,
    },
    /// List stored matches, strongest first
    Matches {
        #[arg(long)]
        status: Option<MatchStatus>,
        #[arg(long)]
        min_confidence: Option<f64>,
    },
    /// Confirm or reject a stored match
    Review {
        match_id: Uuid,
        #[arg(value_enum)]
        decision: Decision,
    },
    /// Show recent run summaries
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Manage the tenant's matching overrides
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ImportKind {
    Expenses,
    Transactions,
}

#[derive(Clone, Copy, ValueEnum)]
enum Decision {
    Confirm,
    Reject,
}

#[derive(Subcommand)]
enum RulesAction {
    Set {
        #[arg(long)]
        min_threshold: Option<f64>,
        #[arg(long)]
        auto_confirm: Option<f64>,
        /// Fuzzy weights as amount,date,merchant,keyword,currency
        #[arg(long, value_delimiter = ',', num_args = 5)]
        weights: Option<Vec<f64>>,
    },
    Clear,
}

fn fuzzy_weights(values: &[f64]) -> Option<ScoreWeights> {
    match *values {
        [amount, date, merchant, keyword, currency] => Some(ScoreWeights {
            amount,
            date,
            merchant,
            keyword,
            currency,
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let tenant = config.tenant(cli.tenant.as_deref());

    let db_path = config.database_path()?;
    let db = expenseflow_storage::create_db(&db_path).await?;
    tracing::debug!("using database {}", db_path.display());

    match cli.command {
        Command::Import { kind, path } => {
            let currency = config.default_currency();
            let count = match kind {
                ImportKind::Expenses => commands::import_expenses(&db, &path, &tenant, &currency).await?,
                ImportKind::Transactions => {
                    commands::import_transactions(&db, &path, &tenant, &currency).await?
                }
            };
            println!("Imported {count} row(s) for tenant {tenant}");
        }
        Command::Run {
            from,
            to,
            as_of,
            optimal,
            json,
        } => {
            let options = commands::RunOptions {
                from,
                to,
                as_of,
                optimal,
            };
            let report = commands::reconcile(&db, &config, &tenant, &options).await?;
            commands::print_report(&report, json)?;
            if !report.success {
                std::process::exit(1);
            }
        }
        Command::Matches {
            status,
            min_confidence,
        } => commands::list_matches(&db, &tenant, status, min_confidence).await?,
        Command::Review { match_id, decision } => {
            let decision = match decision {
                Decision::Confirm => ReviewDecision::Confirm,
                Decision::Reject => ReviewDecision::Reject,
            };
            commands::review(&db, match_id, decision).await?;
        }
        Command::Runs { limit } => commands::list_runs(&db, &tenant, limit).await?,
        Command::Rules { action } => match action {
            RulesAction::Set {
                min_threshold,
                auto_confirm,
                weights,
            } => {
                let overrides = RuleOverrides {
                    fuzzy_weights: weights.as_deref().and_then(fuzzy_weights),
                    min_match_threshold: min_threshold,
                    auto_confirm_threshold: auto_confirm,
                };
                commands::set_rules(&db, &tenant, &overrides).await?;
                println!("Rules saved for tenant {tenant}");
            }
            RulesAction::Clear => {
                commands::clear_rules(&db, &tenant).await?;
                println!("Rules cleared for tenant {tenant}");
            }
        },
    }

    Ok(())
}
