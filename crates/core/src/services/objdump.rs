//! Parsers for the symbol table (`objdump -t`) and read-only data
//! (`objdump -s -j .rodata`) dumps.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Endian;
use crate::model::{Symbol, SymbolKind};

// Example: "10093064 g     F .text  0000015c .hidden hook_task"
lazy_regex!(fn symbol_line = concat!(
    r"^(?P<address>[0-9A-Fa-f]+)\s+[lwg]\s+((?P<type>[OF])\s+)?",
    r"\S+\s+(?P<size>[0-9A-Fa-f]+)\s+(\S+\s+)?(?P<name>\S+)$",
));

/// Bytes covered by one row of the rodata dump.
const RODATA_ROW_BYTES: u64 = 16;
const RODATA_ROW_WORDS: usize = 4;

/// Errors raised while reading the textual inputs of an analysis.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Rodata dump is not contiguous: expected row at {expected:#x}, found {found:#x}")]
    RodataNotContiguous { expected: u64, found: u64 },
    #[error("Malformed rodata row: {line:?}")]
    MalformedRodata { line: String },
    #[error("Routine {routine} of task {task} is not in the symbol table")]
    UnresolvedRoutine { task: String, routine: String },
    #[error("Routine {routine} is defined by more than one symbol")]
    DuplicateRoutine { routine: String },
    #[error("Routine of task {task} at {address:#x} was not found in the disassembly")]
    MissingRoutineFunction { task: String, address: u64 },
}

/// Parse symbol table text. Lines that are not symbols are skipped.
///
/// Symbols without a type letter are treated as objects.
pub fn parse_symbol_text(symbol_text: &str) -> Vec<Symbol> {
    let symbols: Vec<Symbol> = symbol_text
        .lines()
        .filter_map(|line| {
            let caps = symbol_line().captures(line.trim())?;
            let address = u64::from_str_radix(&caps["address"], 16).ok()?;
            let size = u64::from_str_radix(&caps["size"], 16).ok()?;
            let kind = match caps.name("type").map(|m| m.as_str()) {
                Some("F") => SymbolKind::Function,
                _ => SymbolKind::Object,
            };
            Some(Symbol::new(address, kind, size, &caps["name"]))
        })
        .collect();
    debug!(symbols = symbols.len(), "parsed symbol table");
    symbols
}

/// Contents of the `.rodata` section as 32-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rodata {
    pub base: u64,
    pub words: Vec<u32>,
}

impl Rodata {
    pub fn new(base: u64, words: Vec<u32>) -> Self {
        Self { base, words }
    }

    /// Word stored at `address`, if the address is inside the dump.
    pub fn word_at(&self, address: u64) -> Option<u32> {
        let offset = address.checked_sub(self.base)?;
        let index = usize::try_from(offset / 4).ok()?;
        self.words.get(index).copied()
    }
}

/// Parse a rodata hex dump.
///
/// Example rows:
/// ```text
///  8018ab0 00040048 00010000 10020000 4b8e0108  ...H........K...
///  100a7294 00000000 00000000 01000000           ............
/// ```
/// Rows must follow each other without gaps. Blank word columns read as zero.
pub fn parse_rodata_text(rodata_text: &str, endian: Endian) -> Result<Rodata, InputError> {
    let mut base = None;
    let mut next_row = 0;
    let mut words = Vec::new();

    for line in rodata_text.lines() {
        let line = line.trim();
        let Some(space) = line.find(' ') else {
            continue;
        };
        let Ok(address) = u64::from_str_radix(&line[..space], 16) else {
            continue;
        };

        if base.is_none() {
            base = Some(address);
        } else if address != next_row {
            return Err(InputError::RodataNotContiguous { expected: next_row, found: address });
        }

        for column in 0..RODATA_ROW_WORDS {
            let start = (space + 1 + column * 9).min(line.len());
            let end = (space + 9 + column * 9).min(line.len());
            let text = line.get(start..end).unwrap_or("").trim();
            let printed = if text.is_empty() {
                0
            } else {
                u32::from_str_radix(text, 16)
                    .map_err(|_| InputError::MalformedRodata { line: line.to_string() })?
            };
            words.push(endian.decode_dump_word(printed));
        }
        next_row = address + RODATA_ROW_BYTES;
    }

    let base = base.unwrap_or_default();
    debug!(base, words = words.len(), "parsed rodata");
    Ok(Rodata { base, words })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_symbol_table() {
        let text = "0 g     F .text  e8 Foo\n\
                    0000dead  w    F .text  000000e8 .hidden Bar\n\
                    deadbeef l     O .bss   00000004 .hidden Woooo\n\
                    deadbee g     O .rodata        00000008 __Hooo_ooo\n\
                    deadbee g       .rodata        00000000 __foo_doo_coo_end\n\
                    SYMBOL TABLE:\n";
        assert_eq!(
            parse_symbol_text(text),
            vec![
                Symbol::function(0x0, 0xe8, "Foo"),
                Symbol::function(0xdead, 0xe8, "Bar"),
                Symbol::object(0xdeadbeef, 0x4, "Woooo"),
                Symbol::object(0xdeadbee, 0x8, "__Hooo_ooo"),
                Symbol::object(0xdeadbee, 0x0, "__foo_doo_coo_end"),
            ]
        );
    }

    #[test]
    fn parses_little_endian_rodata() {
        let text = "\nContents of section .rodata:\n \
                    20000 dead1000 00100000 dead2000 00200000  He..f.He..s.\n";
        let rodata = parse_rodata_text(text, Endian::Little).expect("rodata");
        assert_eq!(
            rodata,
            Rodata::new(0x20000, vec![0x0010adde, 0x00001000, 0x0020adde, 0x00002000])
        );
    }

    #[test]
    fn big_endian_rodata_and_short_rows() {
        let text = " 100a7280 00000001 00000002 00000003 00000004  ................\n \
                    100a7290 00000005 00000006                    ........\n";
        let rodata = parse_rodata_text(text, Endian::Big).expect("rodata");
        assert_eq!(rodata.base, 0x100a7280);
        assert_eq!(rodata.words, vec![1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(rodata.word_at(0x100a7294), Some(6));
        assert_eq!(rodata.word_at(0x100a7200), None);
        assert_eq!(rodata.word_at(0x100a72a0), None);
    }

    #[test]
    fn gap_in_rodata_is_an_error() {
        let text = " 20000 00000000 00000000 00000000 00000000  ................\n \
                    20020 00000000 00000000 00000000 00000000  ................\n";
        let err = parse_rodata_text(text, Endian::Little).expect_err("gap");
        assert!(matches!(
            err,
            InputError::RodataNotContiguous { expected: 0x20010, found: 0x20020 }
        ));
    }
}
