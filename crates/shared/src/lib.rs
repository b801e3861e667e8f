#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Condominium Licensing Shared Types and Utilities
//!
//! Typed identifiers, status enums and database helpers shared by the
//! licensing engine and the reconciliation worker.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
