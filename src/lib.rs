//! Wallet transaction engine
//!
//! Takes transaction requests from a multi-chain wallet through their whole
//! lifecycle: validation and gas estimation, user approval, nonce allocation,
//! signing, broadcast and tracking until the network confirms or drops them.

pub mod api;
pub mod chain;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod tracker;
pub mod tx;

#[cfg(test)]
mod test_utils;

pub use controller::TransactionController;
pub use error::{TxError, TxResult};
