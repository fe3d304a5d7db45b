//! The dynamic translation engine: translation objects, the PC-indexed
//! cache, block chaining, and runtime helpers.

pub mod helpers;

mod cache;
mod engine;
mod translation;

pub use cache::TranslationCache;
pub use engine::TranslationEngine;
pub use translation::{call_native, Translation};
