//! Umbrella crate for TableHub.
//!
//! This crate is intentionally small: it re-exports the engine and protocol
//! crates so downstream code can depend on a single crate name (`tablehub`).

pub use tablehub_engine as engine;
pub use tablehub_protocol as protocol;
