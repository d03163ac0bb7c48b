//! Library target for the `vodgrab` package.
//!
//! The primary deliverable of this package is the `vodgrab` CLI binary
//! (`src/main.rs`). Argument parsing, key mapping and progress formatting
//! live here so they can be tested without a terminal.

pub mod cli;
pub mod error;
pub mod input;
pub mod logging;
pub mod render;

#[doc(hidden)]
pub use vodgrab_engine;

pub use error::AppError;
