use crate::attributes::{names, AttrMap, AttrValue};

// INSTRUCTION
// ================================================================================================

/// One machine instruction of a basic block.
///
/// The textual form is kept as produced by the loader (opcode followed by a comma-separated
/// operand list); architecture-specific predicates over it live in [`crate::arch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    code: String,
    attrs: AttrMap,
}

impl Instruction {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into(), attrs: AttrMap::new() }
    }

    /// Returns the full textual form of the instruction.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the opcode mnemonic (the first whitespace-separated token).
    pub fn opcode(&self) -> &str {
        self.code.split_whitespace().next().unwrap_or("")
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut AttrMap {
        &mut self.attrs
    }

    /// Returns the address of the instruction itself (the first range of the `code` segment of
    /// its address attribute), if attached.
    pub fn address(&self) -> Option<u64> {
        let infos = self.attrs.get_plain(names::ADDRESS)?.as_address()?;
        infos
            .iter()
            .find(|info| info.segment == "code")
            .and_then(|info| info.ranges.first())
            .map(|range| range.start)
    }

    /// Returns true when the instruction carries an address attribute.
    pub fn has_address(&self) -> bool {
        self.address().is_some()
    }

    /// Sets the address attribute to a single code range.
    pub fn set_address(&mut self, addr: u64) {
        use crate::attributes::{AddressInfo, AddressRange};
        self.attrs.set_plain(
            names::ADDRESS,
            AttrValue::Address(vec![AddressInfo {
                segment: "code".into(),
                ranges: vec![AddressRange::new(addr, 4)],
            }]),
        );
    }
}
