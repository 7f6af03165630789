//! drift-core — shared types, wire codec, and configuration.
//! All other drift crates depend on this one.

pub mod config;
pub mod types;
pub mod wire;

pub use types::ResultInfo;
pub use wire::{DfgetStatus, PieceResult, SupernodeRecord};
