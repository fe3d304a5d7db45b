//! Arancini dynamic binary translator runtime.
//!
//! Guest x86-64 code is lifted into IR chunks (`arancini-x86` /
//! `arancini-ir`), lowered onto the host ISA by an [`output`] backend,
//! cached by guest PC, and executed in place of the guest by the
//! [`exec`] layer. Translated blocks chain to one another at run time so
//! hot paths stay inside emitted code.

#![warn(missing_docs)]

mod config;
mod error;

pub mod dbt;
pub mod exec;
pub mod output;
pub mod txlat;

pub use config::TranslationConfig;
pub use error::{BackendError, ExecutionError, TranslationError};
