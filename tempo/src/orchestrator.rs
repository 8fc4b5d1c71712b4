//! Sequential execution of the configured passes over the in-memory program.

use std::fs;
use std::path::PathBuf;

use tempo_analysis::{
    check_perform_cleanup, Analysis, AnalysisError, CodeLine, DCacheAnalysis, DataAddressCheck,
    DotPrint, DummyAnalysis, ICacheAnalysis, IpetAnalysis, PipelineAnalysis, SimplePrint,
};
use tempo_core::context::{compute_contexts, ContextError};
use tempo_core::serialization::{read_program, write_program, ReadError};
use tempo_core::{check_program, CheckError, Program};

use crate::config::{Config, PassConfig, PassKind};

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("cannot read {path}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot load program: {0}")]
    Deserialize(#[from] ReadError),
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("bad entry point name '{0}'")]
    BadEntryPoint(String),
    #[error("no program loaded; an input_file or a previous pass must provide one")]
    NoProgram,
    #[error("{pass} needs a cache configured at level {level}")]
    MissingCacheLevel { pass: &'static str, level: u32 },
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

// ORCHESTRATOR
// ================================================================================================

/// Runs every configured pass in order.
///
/// A pass with an `input_file` replaces the current program (re-checked and re-contextized);
/// an `ENTRYPOINT` pass selects the entry function and rebuilds the context substrate from
/// scratch. Passes with `keepresults=off` run on a throwaway clone, so their attributes never
/// leak into later passes. Any failure is fatal: no partial result survives.
pub fn execute(config: &Config, log_time: bool) -> Result<(), OrchestratorError> {
    let mut program: Option<Program> = None;

    for pass in &config.passes {
        if let Some(input) = &pass.common.input_file {
            let path = config.input_output_dir.join(input);
            let text = fs::read_to_string(&path)
                .map_err(|source| OrchestratorError::ReadInput { path: path.clone(), source })?;
            let mut loaded = read_program(&text)?;
            if loaded.entry_point().is_some() {
                check_program(&loaded)?;
                compute_contexts(&mut loaded)?;
            }
            tracing::info!(path = %path.display(), "program loaded");
            program = Some(loaded);
        }

        if let PassKind::EntryPoint { name } = &pass.kind {
            let current = program.as_mut().ok_or(OrchestratorError::NoProgram)?;
            current
                .set_entry_point(name)
                .ok_or_else(|| OrchestratorError::BadEntryPoint(name.clone()))?;
            check_program(current)?;
            compute_contexts(current)?;
            tracing::info!(entry = %name, "analysis entry point selected");
        }

        let current = program.as_mut().ok_or(OrchestratorError::NoProgram)?;

        // Passes that must not leak results run on a clone; the original stays pristine.
        let mut scratch;
        let target: &mut Program = if pass.common.keep_results {
            current
        } else {
            scratch = current.clone();
            &mut scratch
        };

        if !matches!(pass.kind, PassKind::EntryPoint { .. }) {
            let mut analysis = build_analysis(config, pass)?;
            check_perform_cleanup(analysis.as_mut(), target, log_time)?;
        }

        if let Some(output) = &pass.common.output_file {
            let path = config.input_output_dir.join(output);
            fs::write(&path, write_program(target))
                .map_err(|source| OrchestratorError::WriteOutput { path: path.clone(), source })?;
            tracing::info!(path = %path.display(), "program written");
        }
    }

    Ok(())
}

/// Instantiates the analysis object for one directive.
fn build_analysis(
    config: &Config,
    pass: &PassConfig,
) -> Result<Box<dyn Analysis>, OrchestratorError> {
    let architecture = &config.architecture;
    Ok(match &pass.kind {
        PassKind::EntryPoint { .. } => unreachable!("handled by the orchestrator"),
        PassKind::ICache { level, must, persistence, may, keep_age } => {
            let cache = architecture.cache_at(true, *level).ok_or(
                OrchestratorError::MissingCacheLevel { pass: "ICACHE", level: *level },
            )?;
            Box::new(ICacheAnalysis::new(cache, *must, *persistence, *may, *keep_age))
        },
        PassKind::DCache { level, must, persistence, may } => {
            let cache = architecture.cache_at(false, *level).ok_or(
                OrchestratorError::MissingCacheLevel { pass: "DCACHE", level: *level },
            )?;
            Box::new(DCacheAnalysis::new(
                architecture.arch,
                cache,
                *must,
                *persistence,
                *may,
            )?)
        },
        PassKind::DataAddress { stack_pointer } => {
            Box::new(DataAddressCheck::new(architecture.arch, *stack_pointer))
        },
        PassKind::Pipeline => Box::new(PipelineAnalysis::new(architecture)),
        PassKind::Ipet { solver, pipeline, attach_wcet_info, generate_node_freq } => {
            Box::new(IpetAnalysis::new(
                architecture,
                *solver,
                *pipeline,
                *attach_wcet_info,
                *generate_node_freq,
            ))
        },
        PassKind::DotPrint => Box::new(DotPrint::new(config.input_output_dir.clone())),
        PassKind::SimplePrint {
            print_call_graph,
            print_loop_nests,
            print_cfg,
            print_wcet_info,
        } => Box::new(SimplePrint {
            print_call_graph: *print_call_graph,
            print_loop_nests: *print_loop_nests,
            print_cfg: *print_cfg,
            print_wcet_info: *print_wcet_info,
        }),
        PassKind::CodeLine { binary_file, addr2line_command } => {
            Box::new(CodeLine::new(binary_file, addr2line_command))
        },
        PassKind::Dummy => Box::new(DummyAnalysis),
    })
}
