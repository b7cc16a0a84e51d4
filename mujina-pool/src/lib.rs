//! A multi-chain Stratum mining pool.
//!
//! One [`pool::Pool`] serves one chain on one port. It pulls work from an
//! upstream [`node::MiningNode`], fans jobs out to connected miners, checks
//! their shares and reports everything to the accounting collaborators.

pub mod accounting;
pub mod config;
pub mod error;
pub mod events;
pub mod hostpool;
pub mod job;
pub mod node;
pub mod pool;
pub mod rpc;
pub mod stratum;
pub mod tracing;
pub mod vardiff;
