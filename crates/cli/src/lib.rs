use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use stack_analyzer_core::services::tasks::Section;

pub mod commands;

/// Read a UTF-8 input file (pre-dumped disassembly, symbol table, ...).
pub fn read_text(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {what} at {}", path.display()))
}

/// Parse the `--section` argument.
pub fn parse_section(value: &str) -> Result<Section, String> {
    match value.to_ascii_lowercase().as_str() {
        "ro" => Ok(Section::Ro),
        "rw" => Ok(Section::Rw),
        other => Err(format!("unknown section '{other}' (expected ro or rw)")),
    }
}

/// Compute the SHA-256 hash of a file and return it as a hex string.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open image for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read image for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    Ok(format!("{:x}", digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_names_are_case_insensitive() {
        assert_eq!(parse_section("RO"), Ok(Section::Ro));
        assert_eq!(parse_section("rw"), Ok(Section::Rw));
        assert!(parse_section("bss").unwrap_err().contains("bss"));
    }
}
