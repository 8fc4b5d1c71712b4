//! Analyses of the Tempo WCET estimator.
//!
//! Every pass implements the same three-step contract: validate its input attributes, run,
//! then drop whatever private state it accumulated. The orchestrator drives passes in the
//! order the configuration lists them; passes communicate exclusively through attributes on
//! the shared program model.

pub mod cache;
pub mod config;
pub mod ipet;
pub mod passes;
pub mod pipeline;

use std::time::Instant;

use tempo_core::Program;

// RE-EXPORTS
// ================================================================================================

pub use cache::{Cac, Chmc, DCacheAnalysis, ICacheAnalysis};
pub use config::{ArchitectureConfig, CacheConfig, CacheKind, MemoryConfig, ReplacementPolicy};
pub use ipet::{IpetAnalysis, SolverKind};
pub use passes::{CodeLine, DataAddressCheck, DotPrint, DummyAnalysis, SimplePrint};
pub use pipeline::PipelineAnalysis;

// ANALYSIS CONTRACT
// ================================================================================================

/// Common interface of every analysis step.
///
/// `check_input_attributes` verifies everything the pass reads is present, `perform` runs the
/// pass, and `remove_private_attributes` discards internal state that must not outlive it.
/// Results only ever flow between passes as attributes on the program.
pub trait Analysis {
    /// Name used in diagnostics (matches the configuration directive).
    fn name(&self) -> &'static str;

    /// Checks that all required input attributes are attached to the program.
    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError>;

    /// Performs the analysis.
    fn perform(&mut self, program: &mut Program) -> Result<(), AnalysisError>;

    /// Removes all private attributes of this pass.
    fn remove_private_attributes(&mut self, _program: &mut Program) {}
}

/// Runs one pass through its full check/perform/cleanup protocol, logging its wall-clock time
/// when `log_time` is set. Any error aborts the whole analysis.
pub fn check_perform_cleanup(
    analysis: &mut dyn Analysis,
    program: &mut Program,
    log_time: bool,
) -> Result<(), AnalysisError> {
    let started = Instant::now();
    analysis.check_input_attributes(program)?;
    let result = analysis.perform(program);
    analysis.remove_private_attributes(program);
    result?;
    if log_time {
        tracing::info!(
            pass = analysis.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis done"
        );
    }
    Ok(())
}

// ERRORS
// ================================================================================================

/// Failure of one analysis pass. All of them are fatal: the orchestrator aborts and no
/// partial WCET is ever reported.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A required input attribute is missing or malformed.
    #[error("{pass}: {msg}")]
    Input { pass: &'static str, msg: String },

    /// The requested configuration is outside what the pass supports.
    #[error("{pass}: {msg}")]
    Unsupported { pass: &'static str, msg: String },

    /// Internal invariant breach; treated as a bug in the pass.
    #[error("{pass}: internal error: {msg}")]
    Internal { pass: &'static str, msg: String },

    #[error(transparent)]
    Solver(#[from] ipet::SolverError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub fn input(pass: &'static str, msg: impl Into<String>) -> Self {
        Self::Input { pass, msg: msg.into() }
    }

    pub fn unsupported(pass: &'static str, msg: impl Into<String>) -> Self {
        Self::Unsupported { pass, msg: msg.into() }
    }

    pub fn internal(pass: &'static str, msg: impl Into<String>) -> Self {
        Self::Internal { pass, msg: msg.into() }
    }
}
