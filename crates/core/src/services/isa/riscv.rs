use super::{direct_branch, parse_hex, Instruction, InstructionAnalyzer, InstructionEffect};
use crate::model::{Callsite, Symbol};

const CONDITION_CODES: &str = "eqz|nez|lez|gez|ltz|gtz|gt|le|gtu|leu|eq|ne|ge|lt|ltu|geu";

lazy_regex!(fn jump_opcode = format!(r"^(?:b(?:{CONDITION_CODES})|j|jr)$"));
lazy_regex!(fn call_opcode = r"^(?:jal|jalr)$");
// Examples: "8009b318 <set_state_prl_hr>", "ra,800a4394 <power_get_signals>",
// "t0,t1,80080300 <data_loop>"
lazy_regex!(fn call_operand = r"^(?:\w(?:\w|\d\d),){0,2}([0-9A-Fa-f]+)\s+<([^>]+)>$");
// Example: "a5"
lazy_regex!(fn indirect_operand = r"^(?:t\d+|s\d+|a\d+$)");
lazy_regex!(fn addi_opcode = r"^addi$");
// Example: "sp,sp,-32"
lazy_regex!(fn stack_alloc_operand = r"^sp,sp,-(\d+)$");

/// Analyzer for RISC-V disassembly.
#[derive(Debug, Default, Clone, Copy)]
pub struct RiscvAnalyzer;

impl InstructionAnalyzer for RiscvAnalyzer {
    fn name(&self) -> &'static str {
        "riscv"
    }

    fn analyze_instruction(&self, symbol: &Symbol, insn: &Instruction) -> InstructionEffect {
        let is_jump = jump_opcode().is_match(&insn.opcode);
        let is_call = call_opcode().is_match(&insn.opcode);

        if is_jump || is_call {
            let callsite = match call_operand().captures(&insn.operand) {
                Some(caps) => parse_hex(&caps[1])
                    .and_then(|target| direct_branch(symbol, insn.address, target, is_jump)),
                None if indirect_operand().is_match(&insn.operand) => {
                    Some(Callsite::indirect(insn.address, is_jump))
                }
                None => None,
            };
            return InstructionEffect::call(callsite);
        }

        if addi_opcode().is_match(&insn.opcode) {
            if let Some(caps) = stack_alloc_operand().captures(&insn.operand) {
                return InstructionEffect::stack(caps[1].parse().unwrap_or(0));
            }
        }
        InstructionEffect::default()
    }
}
