//! EVM transaction manager
//!
//! Delivers caller-submitted transactions to EVM chains from submission to
//! finality: nonce assignment, fee estimation and escalation, signing,
//! broadcast, periodic resend, receipt tracking, reorg recovery and
//! retention of terminal records.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod tx;
pub mod txm;

#[cfg(test)]
mod testing;
