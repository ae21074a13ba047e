//! Test doubles shared across the workspace.
mod fake_db;

pub use fake_db::{
    FakeDb,
    ScriptedDdl,
};
