//! The miner-facing side: framed connections and the TCP listener.

pub mod conn;
pub mod server;
