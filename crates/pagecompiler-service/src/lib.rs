//! Asynchronous, de-duplicated page compilation with a cost-bounded result cache.
//!
//! See [`compiler::PageCompiler`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod compiler;
pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

pub use compiler::{
    CompileDriver, Compiled, CompilerEvent, ControllerState, Lookup, PageCompiler,
};
pub use error::{CompileError, CompileResult, LifecycleError};
