use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Extra stack consumed by the exception context switch.
///
/// The default covers a Cortex-M with the FPU enabled.
pub const DEFAULT_EXCEPTION_FRAME_SIZE: u64 = 224;

/// Environment variable overriding the objdump binary.
pub const OBJDUMP_ENV: &str = "STACK_ANALYZER_OBJDUMP";
/// Environment variable overriding the addr2line binary.
pub const ADDR2LINE_ENV: &str = "STACK_ANALYZER_ADDR2LINE";

/// Byte order of the analyzed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Convert a word as printed by `objdump -s` into its numeric value.
    ///
    /// The dump prints raw memory bytes, so little-endian targets need a swap.
    pub fn decode_dump_word(self, printed: u32) -> u32 {
        match self {
            Endian::Little => printed.swap_bytes(),
            Endian::Big => printed,
        }
    }
}

/// Serializable analyzer configuration.
///
/// Every field is optional so a config file only has to mention what it overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Path to the objdump binary (e.g. a cross toolchain's `arm-none-eabi-objdump`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objdump: Option<PathBuf>,
    /// Path to the addr2line binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr2line: Option<PathBuf>,
    #[serde(default)]
    pub rodata_endian: Endian,
    /// Used only when the annotation document does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_frame_size: Option<u64>,
}

impl AnalyzerConfig {
    /// Resolve the objdump path: explicit override, then config, then env, then `objdump`.
    pub fn objdump_path(&self, flag: Option<&Path>) -> PathBuf {
        resolve_tool(flag, self.objdump.as_deref(), OBJDUMP_ENV, "objdump")
    }

    /// Resolve the addr2line path with the same precedence as [`Self::objdump_path`].
    pub fn addr2line_path(&self, flag: Option<&Path>) -> PathBuf {
        resolve_tool(flag, self.addr2line.as_deref(), ADDR2LINE_ENV, "addr2line")
    }

    /// Exception frame size when the annotation document is silent.
    pub fn fallback_exception_frame_size(&self) -> u64 {
        self.exception_frame_size.unwrap_or(DEFAULT_EXCEPTION_FRAME_SIZE)
    }
}

fn resolve_tool(flag: Option<&Path>, configured: Option<&Path>, env: &str, bare: &str) -> PathBuf {
    flag.or(configured)
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(env).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(bare))
}

/// Load an analyzer config from disk (YAML or JSON based on extension).
pub fn load_analyzer_config(path: &Path) -> Result<AnalyzerConfig> {
    let body = std::fs::read(path)
        .with_context(|| format!("Failed to read analyzer config at {}", path.display()))?;
    let config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_slice(&body).context("Failed to parse analyzer config JSON")?
    } else {
        serde_yaml::from_slice(&body).context("Failed to parse analyzer config YAML")?
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_swaps_dump_words() {
        assert_eq!(Endian::Little.decode_dump_word(0xdead1000), 0x0010adde);
        assert_eq!(Endian::Big.decode_dump_word(0xdead1000), 0xdead1000);
    }

    #[test]
    fn explicit_flag_wins_over_config() {
        let config = AnalyzerConfig {
            objdump: Some(PathBuf::from("/opt/cross/bin/objdump")),
            ..AnalyzerConfig::default()
        };
        assert_eq!(config.objdump_path(None), PathBuf::from("/opt/cross/bin/objdump"));
        assert_eq!(
            config.objdump_path(Some(Path::new("/usr/bin/llvm-objdump"))),
            PathBuf::from("/usr/bin/llvm-objdump")
        );
    }

    #[test]
    fn empty_yaml_config_uses_defaults() {
        let config: AnalyzerConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config.rodata_endian, Endian::Little);
        assert_eq!(config.fallback_exception_frame_size(), DEFAULT_EXCEPTION_FRAME_SIZE);
    }
}
