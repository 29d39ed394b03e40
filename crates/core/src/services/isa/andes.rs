use super::{
    direct_branch, parse_hex, register_list_bytes, Instruction, InstructionAnalyzer,
    InstructionEffect, WORD_SIZE,
};
use crate::model::{Callsite, Symbol};

const CONDITION_CODES: &str = "eq|eqz|gez|gtz|lez|ltz|ne|nez|eqc|nec|nezs|nes|eqs";

lazy_regex!(fn jump_opcode = format!(r"^(?:b(?:{CONDITION_CODES})|j|jr|jr.|jrnez)\d{{0,2}}$"));
lazy_regex!(fn call_opcode = r"^(?:jal|jral|jral.|jralnez|beqzal|bltzal|bgezal)\d?$");
lazy_regex!(fn call_operand = r"^([0-9A-Fa-f]+)\s+<([^>]+)>$");
// $lp holds the return address and is left out.
lazy_regex!(fn indirect_operand = r"^(?:\$r\d+|\$fp|\$gp|\$ta|\$sp|\$pc)$");
lazy_regex!(fn lwi_opcode = r"^lwi\.\w\w$");
lazy_regex!(fn lwi_pc_operand = r"^\$pc, \[([^\]]+)\]");
lazy_regex!(fn push_opcode = r"^push\d+$");
// Example: "$r10, #16    ! {$r6~$r10, $fp, $gp, $lp}"
lazy_regex!(fn push_operand = r"^\$r\d+, #\d+    ! \{([^\]]+)\}");
lazy_regex!(fn smw_opcode = r"^smw(?:\.\w\w|\.\w\w\w)$");
// Example: "$r6, [$sp], $r10, #0x2    ! {$r6~$r10, $lp}"
lazy_regex!(fn smw_operand = concat!(
    r"^(?:\$r\d+|\$\wp), \[\$\wp\], (?:\$r\d+|\$\wp), ",
    r"#\d\w\d    ! \{([^\]]+)\}",
));
lazy_regex!(fn register_range = r"^\$r(\d+)~\$r(\d+)");

/// Analyzer for Andes (NDS32) disassembly.
#[derive(Debug, Default, Clone, Copy)]
pub struct AndesAnalyzer;

impl InstructionAnalyzer for AndesAnalyzer {
    fn name(&self) -> &'static str {
        "andes"
    }

    fn analyze_instruction(&self, symbol: &Symbol, insn: &Instruction) -> InstructionEffect {
        let opcode = insn.opcode.as_str();
        let operand = insn.operand.as_str();
        let is_jump = jump_opcode().is_match(opcode);
        let is_call = call_opcode().is_match(opcode);

        if is_jump || is_call {
            let callsite = match call_operand().captures(operand) {
                Some(caps) => parse_hex(&caps[1])
                    .and_then(|target| direct_branch(symbol, insn.address, target, is_jump)),
                None if indirect_operand().is_match(operand) => {
                    Some(Callsite::indirect(insn.address, is_jump))
                }
                None => None,
            };
            InstructionEffect::call(callsite)
        } else if lwi_opcode().is_match(opcode) {
            // "lwi $pc, [$sp], xx" is a return.
            let loads_pc = lwi_pc_operand().captures(operand).is_some_and(|caps| &caps[1] != "$sp");
            if loads_pc {
                InstructionEffect::call(Some(Callsite::indirect(insn.address, true)))
            } else {
                InstructionEffect::default()
            }
        } else if push_opcode().is_match(opcode) {
            // Example: "fc 20    push25 $r8, #0    ! {$r6~$r8, $fp, $gp, $lp}"
            match push_operand().captures(operand) {
                Some(caps) => InstructionEffect::stack(
                    push_imm_bytes(&insn.words) + register_group_bytes(&caps[1]),
                ),
                None => InstructionEffect::default(),
            }
        } else if smw_opcode().is_match(opcode) {
            match smw_operand().captures(operand) {
                Some(caps) => InstructionEffect::stack(register_group_bytes(&caps[1])),
                None => InstructionEffect::default(),
            }
        } else {
            InstructionEffect::default()
        }
    }
}

/// Extra bytes reserved by `push25`: `sp = sp - (imm5u << 3)`.
///
/// The immediate lives in the second instruction byte.
fn push_imm_bytes(words: &str) -> u64 {
    let imm5u = words.split(' ').nth(1).and_then(parse_hex).unwrap_or(0);
    (imm5u << 3) & 0xff
}

/// Bytes for a register group such as `$r6~$r10, $fp, $gp, $lp`.
///
/// A leading `$rX~$rY` range stands for `Y - X + 1` registers.
fn register_group_bytes(group: &str) -> u64 {
    let listed = register_list_bytes(group);
    match register_range().captures(group) {
        Some(caps) => {
            let first: u64 = caps[1].parse().unwrap_or(0);
            let last: u64 = caps[2].parse().unwrap_or(0);
            listed + last.saturating_sub(first) * WORD_SIZE
        }
        None => listed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push25_counts_immediate_and_register_range() {
        let symbol = Symbol::function(0x1000, 0x15c, "hook_task");
        let insn = Instruction::new(0x1000, "push25", "$r10, #16    ! {$r6~$r10, $fp, $gp, $lp}")
            .with_words("fc 42");
        assert_eq!(AndesAnalyzer.analyze_instruction(&symbol, &insn).stack_delta, 48);

        let insn = Instruction::new(0x2000, "push25", "$r6, #0    ! {$r6, $fp, $gp, $lp}")
            .with_words("fc 00");
        assert_eq!(AndesAnalyzer.analyze_instruction(&symbol, &insn).stack_delta, 16);
    }

    #[test]
    fn smw_counts_register_group() {
        let symbol = Symbol::function(0x1000, 0x15c, "hook_task");
        let insn =
            Instruction::new(0x1000, "smw.adm", "$r6, [$sp], $r10, #0x2    ! {$r6~$r10, $lp}");
        assert_eq!(AndesAnalyzer.analyze_instruction(&symbol, &insn).stack_delta, 24);
    }

    #[test]
    fn branches_calls_and_indirect_jumps() {
        let symbol = Symbol::function(0x2000, 0x51c, "console_task");

        let insn = Instruction::new(0x2002, "jal", "1000 <hook_task>");
        assert_eq!(
            AndesAnalyzer.analyze_instruction(&symbol, &insn).callsite,
            Some(Callsite::direct(0x2002, 0x1000, false))
        );

        let insn = Instruction::new(0x1006, "bnezs8", "100929de <flash_command_write>");
        assert_eq!(
            AndesAnalyzer.analyze_instruction(&symbol, &insn).callsite,
            Some(Callsite::direct(0x1006, 0x1009_29de, true))
        );

        let insn = Instruction::new(0x200a, "jral5", "$r0");
        assert_eq!(
            AndesAnalyzer.analyze_instruction(&symbol, &insn).callsite,
            Some(Callsite::indirect(0x200a, false))
        );

        // Conditional branch without a symbolic target.
        let insn = Instruction::new(0x1008, "bne", "$r6, $r0, 2af6a");
        assert_eq!(AndesAnalyzer.analyze_instruction(&symbol, &insn), InstructionEffect::default());
    }

    #[test]
    fn lwi_pc_from_stack_is_a_return() {
        let symbol = Symbol::function(0x2000, 0x51c, "console_task");
        let ret = Instruction::new(0x2010, "lwi.bi", "$pc, [$sp], #4");
        assert_eq!(AndesAnalyzer.analyze_instruction(&symbol, &ret).callsite, None);
        let jump = Instruction::new(0x2014, "lwi.bi", "$pc, [$r3], #4");
        assert_eq!(
            AndesAnalyzer.analyze_instruction(&symbol, &jump).callsite,
            Some(Callsite::indirect(0x2014, true))
        );
    }
}
