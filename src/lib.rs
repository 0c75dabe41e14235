//! Library crate for slp-census: an internet-wide Minecraft Server List Ping scanner.
pub mod classify;
pub mod codec;
pub mod config;
pub mod ranges;
pub mod scanner;
pub mod session;
pub mod store;
pub mod types;
