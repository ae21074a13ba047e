//! Shared foundations for IndexPilot: tunable knobs, validated identifiers,
//! the core entity types, the database adapter contract, and small
//! concurrency utilities. Everything that crosses a crate boundary is a typed
//! record defined here or in the owning crate.
pub mod backoff;
pub mod db;
pub mod env;
pub mod identifier;
pub mod knobs;
pub mod plan;
pub mod shutdown;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
