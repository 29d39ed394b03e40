//! Function builder: splits `objdump -d` text into functions.
//!
//! The parser alternates between looking for a function head
//! (`<address> <name>:` naming a function symbol) and consuming that
//! function's instruction lines. The first line that is not an in-bounds
//! instruction ends the body and is looked at again as a possible head.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::model::{Function, FunctionMap, Symbol};
use crate::services::isa::{Architecture, Instruction, InstructionAnalyzer};

// Example: "08028c8c <motion_lid_calc>:"
lazy_regex!(fn function_head = r"^(?P<address>[0-9A-Fa-f]+)\s+<(?P<name>[^>]+)>:$");

#[derive(Debug, Error)]
pub enum DisassemblyError {
    #[error("Unsupported architecture in disassembly header: {0:?}")]
    UnsupportedArchitecture(String),
    #[error("Function {name} at {address:#x} has no instructions")]
    EmptyFunction { name: String, address: u64 },
    #[error("Function at {address:#x} appears twice in the disassembly")]
    DuplicateFunction { address: u64 },
}

/// Result of parsing a whole disassembly.
#[derive(Debug, Clone)]
pub struct Disassembly {
    pub architecture: Architecture,
    pub functions: FunctionMap,
}

struct PendingFunction<'s> {
    symbol: &'s Symbol,
    end: Option<u64>,
    instructions: Vec<Instruction>,
}

/// Parse the disassembly text into a function map with resolved callees.
///
/// The architecture is taken from the first non-empty line (objdump's
/// `file format` header).
pub fn analyze_disassembly(
    disasm_text: &str,
    symbols: &[Symbol],
) -> Result<Disassembly, DisassemblyError> {
    let lines: Vec<&str> = disasm_text.lines().map(str::trim).collect();
    let header = lines.iter().find(|line| !line.is_empty()).copied().unwrap_or_default();
    let architecture = Architecture::detect(header)
        .ok_or_else(|| DisassemblyError::UnsupportedArchitecture(header.to_string()))?;
    let analyzer = architecture.analyzer();
    info!(arch = analyzer.name(), "detected architecture");

    // Several symbols may share an address; any of them will do.
    let symbol_map: HashMap<u64, &Symbol> = symbols.iter().map(|s| (s.address, s)).collect();

    let mut functions = FunctionMap::new();
    let mut current: Option<PendingFunction<'_>> = None;
    let mut index = 0;
    while index < lines.len() {
        let line = lines[index];
        match current.take() {
            None => {
                if let Some(symbol) = detect_head(line, &symbol_map) {
                    if index + 1 == lines.len() {
                        return Err(DisassemblyError::EmptyFunction {
                            name: symbol.name.clone(),
                            address: symbol.address,
                        });
                    }
                    trace!(name = %symbol.name, address = symbol.address, "function head");
                    current = Some(PendingFunction {
                        symbol,
                        end: symbol.end(),
                        instructions: Vec::new(),
                    });
                }
            }
            Some(mut pending) => {
                let instruction = analyzer.parse_instruction(line, pending.end);
                let parsed = instruction.is_some();
                pending.instructions.extend(instruction);

                if parsed && index + 1 < lines.len() {
                    current = Some(pending);
                } else {
                    finish_function(analyzer, pending, &mut functions)?;
                    // The terminating line may be the next function head.
                    if !parsed {
                        continue;
                    }
                }
            }
        }
        index += 1;
    }

    resolve_callees(&mut functions);
    info!(functions = functions.len(), "built function map");
    Ok(Disassembly { architecture, functions })
}

/// Function symbol named by a head line, if the line is one.
fn detect_head<'s>(line: &str, symbol_map: &HashMap<u64, &'s Symbol>) -> Option<&'s Symbol> {
    let caps = function_head().captures(line)?;
    let address = u64::from_str_radix(&caps["address"], 16).ok()?;
    symbol_map.get(&address).copied().filter(|symbol| symbol.is_function())
}

fn finish_function(
    analyzer: &dyn InstructionAnalyzer,
    pending: PendingFunction<'_>,
    functions: &mut FunctionMap,
) -> Result<(), DisassemblyError> {
    let symbol = pending.symbol;
    if pending.instructions.is_empty() {
        return Err(DisassemblyError::EmptyFunction {
            name: symbol.name.clone(),
            address: symbol.address,
        });
    }
    if functions.contains_key(&symbol.address) {
        return Err(DisassemblyError::DuplicateFunction { address: symbol.address });
    }

    let (stack_frame, callsites) = analyzer.analyze_function(symbol, &pending.instructions);
    debug!(
        name = %symbol.name,
        stack_frame,
        callsites = callsites.len(),
        instructions = pending.instructions.len(),
        "analyzed function"
    );
    functions.insert(
        symbol.address,
        Function::new(symbol.address, symbol.name.clone(), stack_frame, callsites),
    );
    Ok(())
}

/// Point every callsite whose target is a known function at that function.
pub fn resolve_callees(functions: &mut FunctionMap) {
    let known: BTreeSet<u64> = functions.keys().copied().collect();
    for function in functions.values_mut() {
        for callsite in &mut function.callsites {
            callsite.callee = callsite.target.filter(|target| known.contains(target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Callsite;

    fn symbols() -> Vec<Symbol> {
        vec![
            Symbol::function(0x1000, 0x15c, "hook_task"),
            Symbol::function(0x2000, 0x51c, "console_task"),
            Symbol::object(0x3200, 0x124, "__just_data"),
            Symbol::function(0x4000, 0x11c, "touchpad_calc"),
        ]
    }

    fn expected(hook_frame: u64, console_frame: u64) -> FunctionMap {
        let mut map = FunctionMap::new();
        map.insert(
            0x1000,
            Function::new(
                0x1000,
                "hook_task",
                hook_frame,
                vec![Callsite::direct(0x1006, 0x1009_29de, true)],
            ),
        );
        map.insert(
            0x2000,
            Function::new(
                0x2000,
                "console_task",
                console_frame,
                vec![
                    Callsite::direct(0x2002, 0x1000, false).with_callee(Some(0x1000)),
                    Callsite::direct(0x2006, 0x53968, true),
                ],
            ),
        );
        map.insert(0x4000, Function::new(0x4000, "touchpad_calc", 0, Vec::new()));
        map
    }

    #[test]
    fn arm_disassembly() {
        let text = "\n\
            build/{BOARD}/RW/ec.RW.elf:     file format elf32-littlearm\n\
            Disassembly of section .text:\n\
            \n\
            00000900 <wook_task>:\n\
            \t...\n\
            00001000 <hook_task>:\n\
            \x20  1000:\tdead beef\tfake\n\
            \x20  1004:\t4770\t\tbx\tlr\n\
            \x20  1006:\tb113\tcbz\tr3, 100929de <flash_command_write>\n\
            \x20  1008:\t00015cfc\t.word\t0x00015cfc\n\
            00002000 <console_task>:\n\
            \x20  2000:\tb508\t\tpush\t{r3, lr} ; malformed comments,; r0, r1 \n\
            \x20  2002:\tf00e fcc5\tbl\t1000 <hook_task>\n\
            \x20  2006:\tf00e bd3b\tb.w\t53968 <get_program_memory_addr>\n\
            \x20  200a:\tdead beef\tfake\n\
            00004000 <touchpad_calc>:\n\
            \x20  4000:\t4770\t\tbx\tlr\n\
            00010000 <look_task>:";

        let disasm = analyze_disassembly(text, &symbols()).expect("disassembly");
        assert_eq!(disasm.architecture, Architecture::Arm);
        assert_eq!(disasm.functions, expected(0, 8));
    }

    #[test]
    fn andes_disassembly() {
        let text = "\n\
            build/{BOARD}/RW/ec.RW.elf:     file format elf32-nds32le\n\
            Disassembly of section .text:\n\
            \n\
            00000900 <wook_task>:\n\
            \x20  ...\n\
            00001000 <hook_task>:\n\
            \x20  1000:   fc 42\tpush25 $r10, #16    ! {$r6~$r10, $fp, $gp, $lp}\n\
            \x20  1004:   47 70\t\tmovi55 $r0, #1\n\
            \x20  1006:   b1 13\tbnezs8 100929de <flash_command_write>\n\
            \x20  1008:   00 01 5c fc\tbne    $r6, $r0, 2af6a\n\
            00002000 <console_task>:\n\
            \x20  2000:   fc 00\t\tpush25 $r6, #0    ! {$r6, $fp, $gp, $lp} \n\
            \x20  2002:   f0 0e fc c5\tjal   1000 <hook_task>\n\
            \x20  2006:   f0 0e bd 3b\tj  53968 <get_program_memory_addr>\n\
            \x20  200a:   de ad be ef\tswi.gp $r0, [ + #-11036]\n\
            00004000 <touchpad_calc>:\n\
            \x20  4000:   47 70\t\tmovi55 $r0, #1\n\
            00010000 <look_task>:";

        let disasm = analyze_disassembly(text, &symbols()).expect("disassembly");
        assert_eq!(disasm.architecture, Architecture::Andes);
        assert_eq!(disasm.functions, expected(48, 16));
    }

    #[test]
    fn riscv_disassembly_with_unknown_size() {
        let symbols = vec![
            Symbol::function(0x8008_0000, 0, "main"),
            Symbol::function(0x8008_0100, 0x20, "helper"),
        ];
        let text = "\nec.elf:     file format elf32-littleriscv\n\n\
            80080000 <main>:\n\
            80080000:\t1101                \taddi\tsp,sp,-32\n\
            80080002:\t2021                \tjal\tra,80080100 <helper>\n\
            80080006:\t8082                \tjalr\ta5\n\
            \n\
            80080100 <helper>:\n\
            80080100:\t8082                \tret\n";

        let disasm = analyze_disassembly(text, &symbols).expect("disassembly");
        let main = &disasm.functions[&0x8008_0000];
        assert_eq!(main.stack_frame, 32);
        assert_eq!(
            main.callsites,
            vec![
                Callsite::direct(0x8008_0002, 0x8008_0100, false).with_callee(Some(0x8008_0100)),
                Callsite::indirect(0x8008_0006, false),
            ]
        );
        assert_eq!(disasm.functions[&0x8008_0100].stack_frame, 0);
    }

    #[test]
    fn rejects_unknown_architecture() {
        let err = analyze_disassembly("\nfoo.elf:     file format elf64-x86-64\n", &symbols())
            .expect_err("x86 is unsupported");
        assert!(matches!(err, DisassemblyError::UnsupportedArchitecture(_)));
    }

    #[test]
    fn head_on_last_line_is_an_empty_function() {
        let text = "file format elf32-littlearm\n00001000 <hook_task>:";
        let err = analyze_disassembly(text, &symbols()).expect_err("empty function");
        assert!(matches!(err, DisassemblyError::EmptyFunction { address: 0x1000, .. }));
    }

    #[test]
    fn head_without_instructions_is_an_empty_function() {
        let text = "file format elf32-littlearm\n00001000 <hook_task>:\n\
                    00002000 <console_task>:\n2000:\tb508\t\tpush\t{r3, lr}\n";
        let err = analyze_disassembly(text, &symbols()).expect_err("empty function");
        assert!(matches!(err, DisassemblyError::EmptyFunction { address: 0x1000, .. }));
    }

    #[test]
    fn duplicate_function_is_rejected() {
        let text = "file format elf32-littlearm\n\
            00001000 <hook_task>:\n1000:\tb508\t\tpush\t{r3, lr}\n\
            00001000 <hook_task>:\n1000:\tb508\t\tpush\t{r3, lr}\n";
        let err = analyze_disassembly(text, &symbols()).expect_err("duplicate");
        assert!(matches!(err, DisassemblyError::DuplicateFunction { address: 0x1000 }));
    }
}
