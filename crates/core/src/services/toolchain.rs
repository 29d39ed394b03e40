//! Adapters for the external binutils collaborators (`objdump`, `addr2line`)
//! and the per-run source location cache.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

// Example: "driver/accel_kionix.c:321 (discriminator 3)"
lazy_regex!(fn location_line = r"^(?P<path>[^:]+):(?P<linenum>\d+)(\s+\(discriminator\s+\d+\))?$");

/// Location strings addr2line prints when it has no debug info for an address.
const UNKNOWN_LOCATIONS: [&str; 3] = ["??:0", "??:?", ":?"];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}")]
    ExitStatus { tool: String, status: ExitStatus },
    #[error("Malformed addr2line output for {address:#x}: {detail}")]
    MalformedLocation { address: u64, detail: String },
}

/// One frame of source provenance for an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineInfo {
    pub function: String,
    /// Absolute source path.
    pub path: PathBuf,
    pub line: u64,
}

impl LineInfo {
    pub fn new(function: impl Into<String>, path: impl Into<PathBuf>, line: u64) -> Self {
        Self { function: function.into(), path: path.into(), line }
    }
}

/// Frames for one address, `None` where debug info is missing.
pub type Frames = Vec<Option<LineInfo>>;

/// Source-location collaborator.
///
/// Returns one entry per frame, `None` for frames without debug info. With
/// `resolve_inline` the innermost frame comes first and its callers follow.
pub trait SourceLocator {
    fn locate(&self, address: u64, resolve_inline: bool) -> Result<Frames, ToolError>;
}

/// Locator that knows nothing; every address maps to a single unknown frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLocator;

impl SourceLocator for NullLocator {
    fn locate(&self, _address: u64, _resolve_inline: bool) -> Result<Frames, ToolError> {
        Ok(vec![None])
    }
}

/// `addr2line -f -e <elf> <address> [-i]`
#[derive(Debug, Clone)]
pub struct Addr2Line {
    program: PathBuf,
    elf: PathBuf,
}

impl Addr2Line {
    pub fn new(program: impl Into<PathBuf>, elf: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), elf: elf.into() }
    }
}

impl SourceLocator for Addr2Line {
    fn locate(&self, address: u64, resolve_inline: bool) -> Result<Frames, ToolError> {
        let mut args = vec!["-f".to_string(), "-e".to_string(), self.elf.display().to_string()];
        args.push(format!("{address:x}"));
        if resolve_inline {
            args.push("-i".to_string());
        }
        let output = run_tool(&self.program, &args)?;
        parse_addr2line_output(address, &output)
    }
}

/// Parse addr2line output: `function\nlocation\n` pairs, one per frame.
pub fn parse_addr2line_output(address: u64, output: &str) -> Result<Frames, ToolError> {
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    if lines.len() < 2 || lines.len() % 2 != 0 {
        return Err(ToolError::MalformedLocation {
            address,
            detail: format!("expected function/location pairs, got {} lines", lines.len()),
        });
    }

    lines
        .chunks(2)
        .map(|pair| {
            let (function, location) = (pair[0], pair[1]);
            if UNKNOWN_LOCATIONS.contains(&location) {
                return Ok(None);
            }
            let caps =
                location_line().captures(location).ok_or_else(|| ToolError::MalformedLocation {
                    address,
                    detail: format!("unrecognized location {location:?}"),
                })?;
            let line = caps["linenum"].parse().map_err(|_| ToolError::MalformedLocation {
                address,
                detail: format!("line number out of range in {location:?}"),
            })?;
            Ok(Some(LineInfo::new(function, absolute_path(caps["path"].trim()), line)))
        })
        .collect()
}

/// Memoizes source locations per `(address, resolve_inline)`.
///
/// Owned by the pipeline driver for the duration of one run.
pub struct LocationCache {
    locator: Box<dyn SourceLocator>,
    entries: HashMap<(u64, bool), Frames>,
}

impl LocationCache {
    pub fn new(locator: Box<dyn SourceLocator>) -> Self {
        Self { locator, entries: HashMap::new() }
    }

    /// All frames for `address`.
    pub fn locate(&mut self, address: u64, resolve_inline: bool) -> Result<Frames, ToolError> {
        let key = (address, resolve_inline);
        if let Some(hit) = self.entries.get(&key) {
            trace!(address, resolve_inline, "location cache hit");
            return Ok(hit.clone());
        }
        let frames = self.locator.locate(address, resolve_inline)?;
        self.entries.insert(key, frames.clone());
        Ok(frames)
    }

    /// Outermost location of `address`, without inline resolution.
    pub fn primary(&mut self, address: u64) -> Result<Option<LineInfo>, ToolError> {
        Ok(self.locate(address, false)?.into_iter().next().flatten())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `objdump` invocations needed by the analysis.
#[derive(Debug, Clone)]
pub struct Objdump {
    program: PathBuf,
    elf: PathBuf,
}

impl Objdump {
    pub fn new(program: impl Into<PathBuf>, elf: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), elf: elf.into() }
    }

    pub fn disassemble(&self) -> Result<String, ToolError> {
        self.run(&["-d"])
    }

    pub fn symbol_table(&self) -> Result<String, ToolError> {
        self.run(&["-t"])
    }

    pub fn rodata(&self) -> Result<String, ToolError> {
        self.run(&["-s", "-j", ".rodata"])
    }

    fn run(&self, flags: &[&str]) -> Result<String, ToolError> {
        let mut args: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        args.push(self.elf.display().to_string());
        run_tool(&self.program, &args)
    }
}

fn run_tool(program: &Path, args: &[String]) -> Result<String, ToolError> {
    let tool = program.display().to_string();
    debug!(tool = %tool, ?args, "running tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ToolError::Spawn { tool: tool.clone(), source })?;
    if !output.status.success() {
        return Err(ToolError::ExitStatus { tool, status: output.status });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Resolve `path` to its canonical form, symlinks included.
///
/// Paths that do not exist on this machine are made absolute against the
/// working directory with `.`/`..` components dropped lexically.
pub fn absolute_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Display `path` relative to `base` when it lies beneath it.
pub fn display_relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}
