use std::path::PathBuf;
use std::process::Command;

use tempo_core::walker::reachable_nodes;
use tempo_core::{names, AttrValue, NodeRef, Program};

use crate::{Analysis, AnalysisError};

const PASS: &str = "CODELINE";

// CODE LINE MAPPING
// ================================================================================================

/// Maps every instruction back to its source location with `addr2line`.
///
/// One child process resolves all addresses in a single batch; the `file:line` answers come
/// back in argument order and land as a `CodeLine` attribute on each instruction.
pub struct CodeLine {
    binary: PathBuf,
    addr2line: String,
}

impl CodeLine {
    pub fn new(binary: impl Into<PathBuf>, addr2line: impl Into<String>) -> Self {
        Self { binary: binary.into(), addr2line: addr2line.into() }
    }

    fn resolve(&self, addresses: &[u64]) -> Result<Vec<String>, AnalysisError> {
        let mut command = Command::new(&self.addr2line);
        command.arg("-e").arg(&self.binary);
        for addr in addresses {
            command.arg(format!("{addr:#x}"));
        }

        let output = command.output().map_err(|e| {
            AnalysisError::input(PASS, format!("cannot run {}: {e}", self.addr2line))
        })?;
        if !output.status.success() {
            return Err(AnalysisError::input(
                PASS,
                format!("{} exited with {}", self.addr2line, output.status),
            ));
        }

        let lines: Vec<String> =
            String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect();
        if lines.len() < addresses.len() {
            return Err(AnalysisError::input(
                PASS,
                format!(
                    "{} resolved {} of {} addresses",
                    self.addr2line,
                    lines.len(),
                    addresses.len()
                ),
            ));
        }
        Ok(lines)
    }
}

impl Analysis for CodeLine {
    fn name(&self) -> &'static str {
        PASS
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        for node_ref in reachable_nodes(program) {
            for instr in program.cfg(node_ref.cfg).node(node_ref.node).instructions() {
                if !instr.has_address() {
                    return Err(AnalysisError::input(
                        PASS,
                        "instructions should have addresses attached",
                    ));
                }
            }
        }
        Ok(())
    }

    fn perform(&mut self, program: &mut Program) -> Result<(), AnalysisError> {
        let mut sites: Vec<(NodeRef, usize)> = Vec::new();
        let mut addresses = Vec::new();
        for node_ref in reachable_nodes(program) {
            let node = program.cfg(node_ref.cfg).node(node_ref.node);
            for (index, instr) in node.instructions().iter().enumerate() {
                if let Some(addr) = instr.address() {
                    sites.push((node_ref, index));
                    addresses.push(addr);
                }
            }
        }
        if addresses.is_empty() {
            return Ok(());
        }

        let lines = self.resolve(&addresses)?;
        for ((node_ref, index), line) in sites.into_iter().zip(lines) {
            program.cfg_mut(node_ref.cfg).node_mut(node_ref.node).instructions_mut()[index]
                .attrs_mut()
                .set_plain(names::CODE_LINE, AttrValue::Str(line));
        }
        Ok(())
    }
}
