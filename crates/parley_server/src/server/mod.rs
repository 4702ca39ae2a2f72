#![forbid(unsafe_code)]

pub mod backend;
pub mod connection;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod reconcile;
pub mod session;
pub mod state;

#[cfg(test)]
mod ledger_tests;
