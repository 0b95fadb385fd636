//! Card Issuer CLI
//!
//! Operator commands against the issuer ledger.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cards_issuer::{IssuerConfig, IssuerDatabase, IssuerMetrics, IssuerService, LedgerIssuerDatabase};
use cards_ledger::{MemoryLedgerStore, PgLedgerStore};

/// Card Issuer CLI
#[derive(Parser, Debug)]
#[command(name = "issuer")]
#[command(about = "Card issuer ledger operations")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load money onto a cardholder's account
    LoadMoney {
        /// Card id of the cardholder
        cardholder: String,
        /// Amount to load
        amount: Decimal,
        /// Currency code
        currency: String,
    },
    /// Print the balance of an account as JSON
    Balance {
        /// Card id
        card_id: String,
        /// Currency code
        currency: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = IssuerConfig::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("{}", e));
    }

    let db: Arc<dyn IssuerDatabase> = match &config.database {
        Some(database) => {
            let store = PgLedgerStore::connect(&database.url, database.max_connections).await?;
            store.migrate().await?;
            Arc::new(LedgerIssuerDatabase::new(store))
        }
        None => {
            info!("DATABASE_URL not set, using in-memory ledger");
            Arc::new(LedgerIssuerDatabase::new(MemoryLedgerStore::new()))
        }
    };

    let metrics = Arc::new(IssuerMetrics::new());
    let service = IssuerService::new(db, config.currencies.clone(), metrics.clone());

    match args.command {
        Command::LoadMoney {
            cardholder,
            amount,
            currency,
        } => {
            service.load_money(&cardholder, amount, &currency).await?;
            println!("Successfully loaded {} {} to {}", amount, currency, cardholder);
        }
        Command::Balance { card_id, currency } => {
            let balance = service.balance(&card_id, &currency).await?;
            println!("{}", serde_json::to_string_pretty(&balance)?);
        }
    }

    info!(metrics = %serde_json::to_string(&metrics.snapshot())?, "Done");
    Ok(())
}
