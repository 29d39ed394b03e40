//! Per-architecture instruction analyzers.
//!
//! Each analyzer looks at one decoded instruction at a time and reports how many
//! bytes of stack it allocates and whether it transfers control to another
//! function. The function builder folds those effects into a `Function`.

use serde::{Deserialize, Serialize};

use crate::model::{Callsite, Symbol};

pub mod andes;
pub mod arm;
pub mod riscv;

pub use andes::AndesAnalyzer;
pub use arm::ArmAnalyzer;
pub use riscv::RiscvAnalyzer;

/// Size of one general purpose register on every supported target.
pub const WORD_SIZE: u64 = 4;

// Example: "   44d94:  f893 0068   ldrb.w  r0, [r3, #104]  ; 0x68"
// There is always a tab between the raw bytes and the mnemonic.
lazy_regex!(fn instruction_line = concat!(
    r"^(?P<address>[0-9A-Fa-f]+):\s+(?P<words>[0-9A-Fa-f ]+)\t",
    r"\s*(?P<opcode>\S+)(\s+(?P<operand>[^;]*))?",
));

/// One disassembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    /// Raw instruction bytes as printed by the disassembler (e.g. `fc 42`).
    pub words: String,
    pub opcode: String,
    /// Operand text with any trailing `;` comment removed.
    pub operand: String,
}

impl Instruction {
    pub fn new(address: u64, opcode: &str, operand: &str) -> Self {
        Self {
            address,
            words: String::new(),
            opcode: opcode.to_string(),
            operand: operand.to_string(),
        }
    }

    pub fn with_words(mut self, words: &str) -> Self {
        self.words = words.to_string();
        self
    }
}

/// What a single instruction contributes to its function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionEffect {
    pub stack_delta: u64,
    pub callsite: Option<Callsite>,
}

impl InstructionEffect {
    pub fn stack(bytes: u64) -> Self {
        Self { stack_delta: bytes, callsite: None }
    }

    pub fn call(callsite: Option<Callsite>) -> Self {
        Self { stack_delta: 0, callsite }
    }
}

/// Trait implemented by the per-architecture analyzers.
pub trait InstructionAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Analyze one instruction of the function described by `symbol`.
    fn analyze_instruction(&self, symbol: &Symbol, insn: &Instruction) -> InstructionEffect;

    /// Parse one disassembly line.
    ///
    /// Returns `None` for anything that is not an instruction, including
    /// instructions at or past `function_end`.
    fn parse_instruction(&self, line: &str, function_end: Option<u64>) -> Option<Instruction> {
        parse_instruction_line(line, function_end)
    }

    /// Fold every instruction into the stack frame size and the callsite list.
    fn analyze_function(
        &self,
        symbol: &Symbol,
        instructions: &[Instruction],
    ) -> (u64, Vec<Callsite>) {
        let mut stack_frame = 0;
        let mut callsites = Vec::new();
        for insn in instructions {
            let effect = self.analyze_instruction(symbol, insn);
            stack_frame += effect.stack_delta;
            callsites.extend(effect.callsite);
        }
        (stack_frame, callsites)
    }
}

/// Supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Arm,
    Riscv,
    Andes,
}

impl Architecture {
    /// Detect the architecture from the disassembler's `file format` header line.
    pub fn detect(header: &str) -> Option<Self> {
        if header.contains("nds") {
            Some(Self::Andes)
        } else if header.contains("arm") {
            Some(Self::Arm)
        } else if header.contains("riscv") {
            Some(Self::Riscv)
        } else {
            None
        }
    }

    pub fn analyzer(self) -> &'static dyn InstructionAnalyzer {
        match self {
            Self::Arm => &ArmAnalyzer,
            Self::Riscv => &RiscvAnalyzer,
            Self::Andes => &AndesAnalyzer,
        }
    }
}

pub(crate) fn parse_instruction_line(line: &str, function_end: Option<u64>) -> Option<Instruction> {
    let caps = instruction_line().captures(line)?;
    let address = u64::from_str_radix(&caps["address"], 16).ok()?;
    if function_end.is_some_and(|end| address >= end) {
        return None;
    }
    Some(Instruction {
        address,
        words: caps["words"].to_string(),
        opcode: caps["opcode"].trim().to_string(),
        operand: caps.name("operand").map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
    })
}

/// Turn a direct branch into a callsite unless it stays inside the function.
///
/// Targets strictly inside `(address, address + size)` are loops and
/// conditionals. A branch back to the entry point is a self call.
pub(crate) fn direct_branch(
    symbol: &Symbol,
    address: u64,
    target: u64,
    is_tail: bool,
) -> Option<Callsite> {
    if symbol.strictly_contains(target) {
        None
    } else {
        Some(Callsite::direct(address, target, is_tail))
    }
}

pub(crate) fn parse_hex(text: &str) -> Option<u64> {
    u64::from_str_radix(text, 16).ok()
}

/// Stack bytes pushed by a comma separated register list.
pub(crate) fn register_list_bytes(list: &str) -> u64 {
    list.split(',').count() as u64 * WORD_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instruction_and_strips_comment() {
        let line = "2000:\tb508\t\tpush\t{r3, lr} ; malformed comments,; r0, r1";
        let insn = parse_instruction_line(line, None).expect("instruction");
        assert_eq!(insn.address, 0x2000);
        assert_eq!(insn.words, "b508");
        assert_eq!(insn.opcode, "push");
        assert_eq!(insn.operand, "{r3, lr}");
    }

    #[test]
    fn instruction_past_function_end_is_rejected() {
        assert!(parse_instruction_line("1008:\t4770\t\tbx\tlr", Some(0x1008)).is_none());
        assert!(parse_instruction_line("1006:\t4770\t\tbx\tlr", Some(0x1008)).is_some());
    }

    #[test]
    fn function_heads_are_not_instructions() {
        assert!(parse_instruction_line("00001000 <hook_task>:", None).is_none());
        assert!(parse_instruction_line("...", None).is_none());
    }

    #[test]
    fn detects_architecture_from_header() {
        assert_eq!(
            Architecture::detect("ec.RW.elf:     file format elf32-littlearm"),
            Some(Architecture::Arm)
        );
        assert_eq!(
            Architecture::detect("ec.RW.elf:     file format elf32-nds32le"),
            Some(Architecture::Andes)
        );
        assert_eq!(
            Architecture::detect("ec.RW.elf:     file format elf32-littleriscv"),
            Some(Architecture::Riscv)
        );
        assert_eq!(Architecture::detect("ec.elf:     file format elf64-x86-64"), None);
    }
}
