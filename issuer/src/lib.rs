//! Card Issuer
//!
//! Loads money onto cards, authorises card transactions against the derived
//! balance and settles presentments into the double-entry ledger.

pub mod config;
pub mod db;
pub mod metrics;
pub mod service;

pub use config::{DatabaseConfig, IssuerConfig};
pub use db::{require_account, IssuerDatabase, LedgerIssuerDatabase};
pub use metrics::{IssuerMetrics, MetricsSnapshot, SharedMetrics};
pub use service::{AuthorisationRequest, IssuerService};
