//! Adapters: SQLite persistence and reference execution backends.

pub mod mock;
pub mod shell;
pub mod sqlite;

pub use mock::{MockAdapter, MockResponse};
pub use shell::{ShellAdapter, ShellBlockAgent};
