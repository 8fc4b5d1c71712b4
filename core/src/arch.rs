//! Compact architecture model for the supported targets.
//!
//! The analyses only need a handful of facts about an instruction: whether it is real code or
//! assembler filler, whether it touches data memory, how long its execute stage takes, which
//! registers it reads and writes, and which functional unit it occupies. All of it is derived
//! from the textual form kept in [`crate::cfg::Instruction`].

use std::fmt;

// TARGET
// ================================================================================================

/// Supported instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Mips,
    Arm,
}

impl Target {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "MIPS" => Some(Self::Mips),
            "ARM" => Some(Self::Arm),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mips => f.write_str("MIPS"),
            Self::Arm => f.write_str("ARM"),
        }
    }
}

/// Functional units of the modeled in-order scalar pipeline.
pub const FU_ALU: &str = "alu";
pub const FU_MULDIV: &str = "muldiv";
pub const FU_MEM: &str = "mem";

const MIPS_LOADS: &[&str] = &[
    "lb", "lbu", "lh", "lhu", "lw", "lwl", "lwr", "ll", "lwc1", "l.s", "l.d", "ldc1",
];
const MIPS_STORES: &[&str] = &[
    "sb", "sh", "sw", "swl", "swr", "sc", "swc1", "s.s", "s.d", "sdc1",
];

// ARCH
// ================================================================================================

/// Architecture queries for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    target: Target,
    big_endian: bool,
}

impl Arch {
    pub fn new(target: Target, big_endian: bool) -> Self {
        Self { target, big_endian }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    // INSTRUCTION PREDICATES
    // --------------------------------------------------------------------------------------------

    /// True for real machine instructions; assembler directives and raw data words are not
    /// fetched and carry no timing.
    pub fn is_code(&self, code: &str) -> bool {
        let op = opcode(code);
        !op.is_empty() && !op.starts_with('.')
    }

    pub fn is_nop(&self, code: &str) -> bool {
        opcode(code) == "nop"
    }

    pub fn is_load(&self, code: &str) -> bool {
        let op = opcode(code);
        match self.target {
            Target::Mips => MIPS_LOADS.contains(&op),
            Target::Arm => op.starts_with("ldr") || op.starts_with("ldm") || op == "pop",
        }
    }

    pub fn is_store(&self, code: &str) -> bool {
        let op = opcode(code);
        match self.target {
            Target::Mips => MIPS_STORES.contains(&op),
            Target::Arm => op.starts_with("str") || op.starts_with("stm") || op == "push",
        }
    }

    // TIMING
    // --------------------------------------------------------------------------------------------

    /// Execute-stage latency in cycles. Unknown opcodes take a single cycle on the ALU.
    pub fn latency(&self, code: &str) -> u32 {
        let op = opcode(code);
        match self.target {
            Target::Mips => match op {
                "mult" | "multu" | "mul" => 6,
                "div" | "divu" => 34,
                "mfhi" | "mflo" => 2,
                _ => 1,
            },
            Target::Arm => match op {
                "mul" | "mla" | "smull" | "umull" => 4,
                "sdiv" | "udiv" => 12,
                _ => 1,
            },
        }
    }

    /// Functional units the instruction occupies during its execute stage.
    pub fn functional_units(&self, code: &str) -> Vec<&'static str> {
        let op = opcode(code);
        let muldiv = match self.target {
            Target::Mips => {
                matches!(op, "mult" | "multu" | "mul" | "div" | "divu" | "mfhi" | "mflo")
            },
            Target::Arm => {
                matches!(op, "mul" | "mla" | "smull" | "umull" | "sdiv" | "udiv")
            },
        };
        if muldiv {
            vec![FU_MULDIV]
        } else if self.is_load(code) || self.is_store(code) {
            vec![FU_MEM]
        } else {
            vec![FU_ALU]
        }
    }

    // REGISTER DEPENDENCIES
    // --------------------------------------------------------------------------------------------

    /// Registers (and memory, for loads) the instruction reads.
    pub fn inputs(&self, code: &str) -> Vec<String> {
        let regs = operand_registers(code, self.target);
        let mut inputs: Vec<String> = if self.is_store(code) {
            // Stores read every register operand.
            regs
        } else if regs.is_empty() {
            Vec::new()
        } else {
            // The first register operand is the destination for everything else.
            regs[1..].to_vec()
        };
        if self.is_load(code) {
            inputs.push("mem".into());
        }
        inputs
    }

    /// Registers (and memory, for stores) the instruction writes.
    pub fn outputs(&self, code: &str) -> Vec<String> {
        if self.is_store(code) {
            return vec!["mem".into()];
        }
        if is_branch(code, self.target) {
            return Vec::new();
        }
        operand_registers(code, self.target).into_iter().take(1).collect()
    }
}

// HELPERS
// ================================================================================================

fn opcode(code: &str) -> &str {
    code.split_whitespace().next().unwrap_or("")
}

fn is_branch(code: &str, target: Target) -> bool {
    let op = opcode(code);
    match target {
        Target::Mips => {
            op == "j" || op == "jr" || op == "jal" || op == "jalr" || op.starts_with('b')
        },
        Target::Arm => op == "b" || op == "bl" || op == "bx" || op.starts_with("b."),
    }
}

/// Extracts the register operands of an instruction, in operand order. Registers inside
/// addressing expressions such as `0($3)` or `[r2, #4]` are included; immediates and labels
/// are not.
fn operand_registers(code: &str, target: Target) -> Vec<String> {
    let operands = match code.split_once(char::is_whitespace) {
        Some((_, rest)) => rest,
        None => return Vec::new(),
    };
    let mut regs = Vec::new();
    let mut current = String::new();
    let mut in_reg = false;
    for c in operands.chars().chain(std::iter::once(',')) {
        if in_reg {
            if c.is_ascii_alphanumeric() || c == '.' {
                current.push(c);
                continue;
            }
            if is_register(&current, target) {
                regs.push(current.clone());
            }
            current.clear();
            in_reg = false;
        }
        match target {
            Target::Mips if c == '$' => {
                current.push(c);
                in_reg = true;
            },
            Target::Arm if c.is_ascii_alphabetic() => {
                current.push(c);
                in_reg = true;
            },
            _ => {},
        }
    }
    regs
}

fn is_register(token: &str, target: Target) -> bool {
    match target {
        Target::Mips => token.starts_with('$') && token.len() > 1,
        Target::Arm => {
            let lower = token.to_ascii_lowercase();
            matches!(lower.as_str(), "sp" | "lr" | "pc" | "fp" | "ip")
                || (lower.starts_with('r')
                    && lower[1..].chars().all(|c| c.is_ascii_digit())
                    && lower.len() > 1)
        },
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mips_predicates() {
        let arch = Arch::new(Target::Mips, true);
        assert!(arch.is_load("lw $2, 0($3)"));
        assert!(arch.is_store("sw $2, 4($sp)"));
        assert!(!arch.is_load("addu $2, $3, $4"));
        assert!(arch.is_code("addu $2, $3, $4"));
        assert!(!arch.is_code(".word 12345"));
        assert!(arch.is_nop("nop"));
    }

    #[test]
    fn mips_register_extraction() {
        let arch = Arch::new(Target::Mips, true);
        assert_eq!(arch.outputs("lw $2, 0($3)"), vec!["$2"]);
        assert_eq!(arch.inputs("lw $2, 0($3)"), vec!["$3", "mem"]);
        assert_eq!(arch.inputs("addu $2, $3, $4"), vec!["$3", "$4"]);
        assert_eq!(arch.outputs("sw $2, 0($3)"), vec!["mem"]);
        assert!(arch.outputs("beq $2, $3, .L4").is_empty());
    }

    #[test]
    fn arm_predicates() {
        let arch = Arch::new(Target::Arm, false);
        assert!(arch.is_load("ldr r1, [r2, #4]"));
        assert!(arch.is_store("str r1, [sp]"));
        assert_eq!(arch.inputs("ldr r1, [r2, #4]"), vec!["r2", "mem"]);
        assert_eq!(arch.outputs("add r0, r1, r2"), vec!["r0"]);
    }

    #[test]
    fn latency_defaults_to_one() {
        let arch = Arch::new(Target::Mips, true);
        assert_eq!(arch.latency("addu $2, $3, $4"), 1);
        assert!(arch.latency("div $2, $3") > 1);
    }
}
