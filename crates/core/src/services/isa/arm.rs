use tracing::warn;

use super::{
    direct_branch, parse_hex, register_list_bytes, Instruction, InstructionAnalyzer,
    InstructionEffect,
};
use crate::model::{Callsite, Symbol};

/// Condition code suffixes (the empty "always" suffix is handled by `?`).
const CONDITION_CODES: &str = "eq|ne|cs|hs|cc|lo|mi|pl|vs|vc|hi|ls|ge|lt|gt|le";

lazy_regex!(fn jump_opcode = format!(r"^(?:b|bx)(?:{CONDITION_CODES})?(?:\.\w)?$"));
lazy_regex!(fn call_opcode = format!(r"^(?:bl|blx)(?:{CONDITION_CODES})?(?:\.\w)?$"));
lazy_regex!(fn cbz_opcode = r"^(?:cbz|cbnz)(?:\.\w)?$");
// Example: "53f90 <get_time+0x18>"
lazy_regex!(fn call_operand = r"^([0-9A-Fa-f]+)\s+<([^>]+)>$");
// Example: "r0, 1009bcbe <host_cmd_motion_sense+0x1d2>"
lazy_regex!(fn cbz_operand = r"^[^,]+,\s+([0-9A-Fa-f]+)\s+<([^>]+)>$");
// lr is left out: branching through it is a return.
lazy_regex!(fn indirect_operand = r"^(?:r\d+|sb|sl|fp|ip|sp|pc$)");
lazy_regex!(fn ldr_opcode = r"^ldr(?:\.\w)?$");
// Example: "pc, [sp], #4"
lazy_regex!(fn ldr_pc_operand = r"^pc, \[([^\]]+)\]");
lazy_regex!(fn push_opcode = r"^push$");
lazy_regex!(fn stm_opcode = r"^stmdb$");
lazy_regex!(fn sub_opcode = r"^sub(?:s|w)?(?:\.\w)?$");
lazy_regex!(fn sub_operand = r"^sp[^#]+#(\d+)");

/// Analyzer for ARM (Thumb-2 and classic) disassembly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArmAnalyzer;

impl ArmAnalyzer {
    fn branch(&self, symbol: &Symbol, insn: &Instruction) -> Option<InstructionEffect> {
        let is_jump = jump_opcode().is_match(&insn.opcode);
        let is_call = call_opcode().is_match(&insn.opcode);
        let is_cbz = cbz_opcode().is_match(&insn.opcode);
        if !(is_jump || is_call || is_cbz) {
            return None;
        }

        let is_tail = is_jump || is_cbz;
        let operand = if is_cbz { cbz_operand() } else { call_operand() };
        let callsite = match operand.captures(&insn.operand) {
            Some(caps) => parse_hex(&caps[1])
                .and_then(|target| direct_branch(symbol, insn.address, target, is_tail)),
            // cbz/cbnz always carry an immediate.
            None if !is_cbz && indirect_operand().is_match(&insn.operand) => {
                Some(Callsite::indirect(insn.address, is_tail))
            }
            None => None,
        };
        Some(InstructionEffect::call(callsite))
    }
}

impl InstructionAnalyzer for ArmAnalyzer {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn analyze_instruction(&self, symbol: &Symbol, insn: &Instruction) -> InstructionEffect {
        if let Some(effect) = self.branch(symbol, insn) {
            return effect;
        }

        let opcode = insn.opcode.as_str();
        let operand = insn.operand.as_str();
        if ldr_opcode().is_match(opcode) {
            // "ldr pc, [sp], #4" pops the return address.
            let loads_pc = ldr_pc_operand().captures(operand).is_some_and(|caps| &caps[1] != "sp");
            if loads_pc {
                return InstructionEffect::call(Some(Callsite::indirect(insn.address, true)));
            }
        } else if push_opcode().is_match(opcode) {
            // Example: "{r4, r5, r6, r7, lr}"
            return InstructionEffect::stack(register_list_bytes(operand));
        } else if sub_opcode().is_match(opcode) {
            match sub_operand().captures(operand) {
                Some(caps) => return InstructionEffect::stack(caps[1].parse().unwrap_or(0)),
                None if operand.starts_with("sp") => {
                    warn!(
                        address = insn.address,
                        function = %symbol.name,
                        operand,
                        "unhandled stack pointer subtraction"
                    );
                }
                None => {}
            }
        } else if stm_opcode().is_match(opcode) {
            // Example: "sp!, {r4, r5, r6, r7, r8, r9, lr}"
            if operand.starts_with("sp!") {
                let registers = operand.split_once(',').map(|(_, rest)| rest).unwrap_or("");
                return InstructionEffect::stack(register_list_bytes(registers));
            }
        }
        InstructionEffect::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(address: u64, opcode: &str, operand: &str) -> Instruction {
        Instruction::new(address, opcode, operand)
    }

    #[test]
    fn opcode_classes() {
        for op in ["b", "bx", "beq", "bxne", "b.n", "b.w", "ble.w", "bxle"] {
            assert!(jump_opcode().is_match(op), "{op} should be a jump");
        }
        assert!(!jump_opcode().is_match("bl"));
        assert!(!jump_opcode().is_match("blx"));

        for op in ["bl", "blx", "bleq", "blxgt.n"] {
            assert!(call_opcode().is_match(op), "{op} should be a call");
        }
        assert!(!call_opcode().is_match("ble"));

        for op in ["cbz", "cbnz", "cbz.n", "cbnz.w"] {
            assert!(cbz_opcode().is_match(op));
        }
        assert!(!cbz_opcode().is_match("cbn"));

        assert!(push_opcode().is_match("push"));
        assert!(!push_opcode().is_match("pushal"));
        assert!(stm_opcode().is_match("stmdb"));
        assert!(!stm_opcode().is_match("lstm"));
        for op in ["sub", "subs", "subw", "sub.w", "subs.w"] {
            assert!(sub_opcode().is_match(op));
        }
    }

    #[test]
    fn operand_patterns() {
        let caps = call_operand().captures("53f90 <get_time+0x18>").expect("call operand");
        assert_eq!(&caps[1], "53f90");
        assert_eq!(&caps[2], "get_time+0x18");

        let caps = cbz_operand().captures("r6, 53f90 <get+0x0>").expect("cbz operand");
        assert_eq!(&caps[1], "53f90");

        assert_eq!(&sub_operand().captures("sp, sp, #1668   ; 0x684").expect("sub")[1], "1668");
        assert_eq!(&sub_operand().captures("sp, #1668").expect("sub")[1], "1668");
        assert!(sub_operand().captures("sl, #1668").is_none());
    }

    #[test]
    fn analyze_function_collects_frame_and_callsites() {
        let symbol = Symbol::function(0x10, 0x100, "foo");
        let instructions = vec![
            insn(0x10, "push", "{r4, r5, r6, r7, lr}"),
            insn(0x12, "subw", "sp, sp, #16\t; 0x10"),
            insn(0x16, "movs", "lr, r1"),
            insn(0x18, "beq.n", "26 <foo+0x26>"),
            insn(0x1a, "bl", "30 <foo+0x30>"),
            insn(0x1e, "bl", "deadbeef <bar>"),
            insn(0x22, "blx", "0 <woo>"),
            insn(0x26, "push", "{r1}"),
            insn(0x28, "stmdb", "sp!, {r4, r5, r6, r7, r8, r9, lr}"),
            insn(0x2c, "stmdb", "sp!, {r4}"),
            insn(0x30, "stmdb", "sp, {r4}"),
            insn(0x34, "bx.n", "10 <foo>"),
            insn(0x36, "bx.n", "r3"),
            insn(0x38, "ldr", "pc, [r10]"),
        ];

        let (frame, callsites) = ArmAnalyzer.analyze_function(&symbol, &instructions);

        assert_eq!(frame, 72);
        assert_eq!(
            callsites,
            vec![
                Callsite::direct(0x1e, 0xdeadbeef, false),
                Callsite::direct(0x22, 0x0, false),
                Callsite::direct(0x34, 0x10, true),
                Callsite::indirect(0x36, true),
                Callsite::indirect(0x38, true),
            ]
        );
    }

    #[test]
    fn returns_are_not_indirect_calls() {
        let symbol = Symbol::function(0x1000, 0x20, "foo");
        assert_eq!(
            ArmAnalyzer.analyze_instruction(&symbol, &insn(0x1004, "bx", "lr")),
            InstructionEffect::default()
        );
        assert_eq!(
            ArmAnalyzer.analyze_instruction(&symbol, &insn(0x1006, "ldr", "pc, [sp], #4")),
            InstructionEffect::default()
        );
    }

    #[test]
    fn unknown_size_keeps_every_direct_branch() {
        let symbol = Symbol::function(0x1000, 0, "foo");
        let effect =
            ArmAnalyzer.analyze_instruction(&symbol, &insn(0x1004, "b.n", "1010 <foo+0x10>"));
        assert_eq!(effect.callsite, Some(Callsite::direct(0x1004, 0x1010, true)));
    }
}
