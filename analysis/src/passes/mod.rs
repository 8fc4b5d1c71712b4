//! Reporting and utility passes driven by the same contract as the analyses.

mod codeline;
mod dot;
mod simple;

pub use codeline::CodeLine;
pub use dot::DotPrint;
pub use simple::SimplePrint;

use std::collections::BTreeSet;

use tempo_core::walker::reachable_nodes;
use tempo_core::{names, Arch, AttrValue, Program};

use crate::{Analysis, AnalysisError};

// DUMMY ANALYSIS
// ================================================================================================

/// Does nothing; exercises the pass protocol and the surrounding orchestration.
pub struct DummyAnalysis;

impl Analysis for DummyAnalysis {
    fn name(&self) -> &'static str {
        "DUMMYANALYSIS"
    }

    fn check_input_attributes(&mut self, _program: &Program) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn perform(&mut self, _program: &mut Program) -> Result<(), AnalysisError> {
        tracing::debug!("dummy analysis ran");
        Ok(())
    }
}

// DATA ADDRESS CHECK
// ================================================================================================

/// Validates the data-address information the loader attached: every load and store of a
/// reachable node must carry at least one address range outside the code segment, in every
/// context of its CFG. Range synthesis itself happens in the loader; the stack-pointer seed
/// is recorded for diagnostics only.
pub struct DataAddressCheck {
    arch: Arch,
    stack_pointer: u64,
}

impl DataAddressCheck {
    pub fn new(arch: Arch, stack_pointer: u64) -> Self {
        Self { arch, stack_pointer }
    }
}

impl Analysis for DataAddressCheck {
    fn name(&self) -> &'static str {
        "DATAADDRESS"
    }

    fn check_input_attributes(&mut self, program: &Program) -> Result<(), AnalysisError> {
        if program.contexts().is_none() {
            return Err(AnalysisError::input("DATAADDRESS", "contexts are not computed"));
        }
        Ok(())
    }

    fn perform(&mut self, program: &mut Program) -> Result<(), AnalysisError> {
        tracing::debug!(sp = format_args!("{:#x}", self.stack_pointer), "checking data addresses");
        let mut segments = BTreeSet::new();
        for node_ref in reachable_nodes(program) {
            let cfg = program.cfg(node_ref.cfg);
            for instr in cfg.node(node_ref.node).instructions() {
                if !self.arch.is_load(instr.code()) && !self.arch.is_store(instr.code()) {
                    continue;
                }
                for &ctx in cfg.context_list() {
                    let infos = instr
                        .attrs()
                        .get_in_ctx(names::ADDRESS, ctx)
                        .or_else(|| instr.attrs().get_plain(names::ADDRESS))
                        .and_then(AttrValue::as_address)
                        .unwrap_or(&[]);
                    let mut has_data = false;
                    for info in infos {
                        if info.segment != "code" {
                            has_data = true;
                            segments.insert(info.segment.clone());
                        }
                    }
                    if !has_data {
                        return Err(AnalysisError::input(
                            "DATAADDRESS",
                            format!(
                                "memory access '{}' in '{}' has no data address range",
                                instr.code(),
                                cfg.name()
                            ),
                        ));
                    }
                }
            }
        }
        tracing::debug!(?segments, "data segments referenced");
        Ok(())
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::arch::Target;
    use tempo_core::attributes::{AddressInfo, AddressRange};
    use tempo_core::cfg::{Cfg, Instruction, Node};
    use tempo_core::context::compute_contexts;

    fn program_with(instr: Instruction) -> Program {
        let mut program = Program::new("test");
        let mut cfg = Cfg::new("main");
        cfg.add_node(Node::basic(vec![instr]));
        cfg.finalize();
        program.add_cfg(cfg);
        program.set_entry_point("main").unwrap();
        compute_contexts(&mut program).unwrap();
        program
    }

    #[test]
    fn store_without_data_range_is_fatal() {
        let mut bad = Instruction::new("sw $2, 0($3)");
        bad.set_address(0x100);
        let mut program = program_with(bad);
        let mut pass = DataAddressCheck::new(Arch::new(Target::Mips, true), 0x7fff_0000);
        assert!(pass.perform(&mut program).is_err());
    }

    #[test]
    fn store_with_data_range_passes() {
        let mut good = Instruction::new("sw $2, 0($3)");
        good.attrs_mut().set_plain(
            names::ADDRESS,
            AttrValue::Address(vec![
                AddressInfo { segment: "code".into(), ranges: vec![AddressRange::new(0x100, 4)] },
                AddressInfo { segment: "stack".into(), ranges: vec![AddressRange::new(0x7000, 4)] },
            ]),
        );
        let mut program = program_with(good);
        let mut pass = DataAddressCheck::new(Arch::new(Target::Mips, true), 0x7fff_0000);
        assert!(pass.perform(&mut program).is_ok());
    }
}
