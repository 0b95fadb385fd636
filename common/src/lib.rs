//! Card Issuer Common Types
//!
//! Shared types used across the card issuer ledger: identifiers, monetary
//! types and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
