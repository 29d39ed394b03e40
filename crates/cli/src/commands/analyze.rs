use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use stack_analyzer_core::config::{load_analyzer_config, AnalyzerConfig};
use stack_analyzer_core::services::analysis::{
    AnalysisOptions, AnalysisOutcome, AnalysisRequest, StackAnalyzer,
};
use stack_analyzer_core::services::annotation::AnnotationDocument;
use stack_analyzer_core::services::isa::Architecture;
use stack_analyzer_core::services::objdump::{parse_rodata_text, parse_symbol_text, Rodata};
use stack_analyzer_core::services::report::{default_base_dir, AnalysisReport};
use stack_analyzer_core::services::tasks::{load_task_list, resolve_tasks, Section};
use stack_analyzer_core::services::toolchain::{
    Addr2Line, LocationCache, NullLocator, Objdump, SourceLocator,
};

use crate::{read_text, sha256_file};

/// Inputs of the `analyze` command.
///
/// `disassembly`, `symbols` and `rodata` replace the corresponding objdump
/// invocation when set, so the pipeline can run without a toolchain.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub elf: Option<PathBuf>,
    pub tasks: PathBuf,
    pub annotation: Option<PathBuf>,
    pub section: Section,
    pub objdump: Option<PathBuf>,
    pub addr2line: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub disassembly: Option<PathBuf>,
    pub symbols: Option<PathBuf>,
    pub rodata: Option<PathBuf>,
    pub no_source_lines: bool,
    pub json: bool,
}

/// JSON form of an analysis run.
#[derive(Debug, Serialize)]
pub struct AnalyzeJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_sha256: Option<String>,
    pub architecture: Architecture,
    pub section: Section,
    pub report: AnalysisReport,
}

/// Run the full pipeline and print the report to stdout.
pub fn analyze_command(options: &AnalyzeOptions) -> Result<()> {
    let outcome = run_analysis(options)?;

    if options.json {
        let image_sha256 = match options.elf.as_deref() {
            Some(elf) if elf.is_file() => Some(sha256_file(elf)?),
            _ => None,
        };
        let body = AnalyzeJson {
            image: options.elf.as_ref().map(|elf| elf.display().to_string()),
            image_sha256,
            architecture: outcome.architecture,
            section: options.section,
            report: outcome.report,
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    print!("{}", outcome.report.render(&default_base_dir()));
    Ok(())
}

/// Load every input named by `options` and run the analysis.
pub fn run_analysis(options: &AnalyzeOptions) -> Result<AnalysisOutcome> {
    let config = match options.config.as_deref() {
        Some(path) => load_analyzer_config(path)?,
        None => AnalyzerConfig::default(),
    };
    let objdump = options
        .elf
        .as_ref()
        .map(|elf| Objdump::new(config.objdump_path(options.objdump.as_deref()), elf));

    let disassembly = match options.disassembly.as_deref() {
        Some(path) => read_text(path, "disassembly")?,
        None => require_image(objdump.as_ref(), "--disassembly")?
            .disassemble()
            .context("Failed to disassemble image")?,
    };
    let symbol_text = match options.symbols.as_deref() {
        Some(path) => read_text(path, "symbol table")?,
        None => require_image(objdump.as_ref(), "--symbols")?
            .symbol_table()
            .context("Failed to dump symbol table")?,
    };
    let rodata = match (options.rodata.as_deref(), objdump.as_ref()) {
        (Some(path), _) => {
            parse_rodata_text(&read_text(path, "rodata dump")?, config.rodata_endian)
                .with_context(|| format!("Failed to parse rodata dump at {}", path.display()))?
        }
        (None, Some(objdump)) => {
            let text = objdump.rodata().context("Failed to dump .rodata")?;
            parse_rodata_text(&text, config.rodata_endian)
                .context("Failed to parse .rodata dump")?
        }
        (None, None) => Rodata::default(),
    };

    let symbols = parse_symbol_text(&symbol_text);
    info!(symbols = symbols.len(), "loaded symbol table");

    let specs = load_task_list(&options.tasks, options.section)?;
    let tasks = resolve_tasks(&specs, &symbols).context("Failed to resolve task routines")?;

    let annotation = match options.annotation.as_deref() {
        Some(path) if !path.exists() => {
            warn!(
                path = %path.display(),
                "annotation file not found; continuing without annotations"
            );
            None
        }
        Some(path) => Some(
            AnnotationDocument::load(path)
                .with_context(|| format!("Failed to load annotation file {}", path.display()))?,
        ),
        None => None,
    };

    let mut locations = LocationCache::new(source_locator(options, &config));
    let request = AnalysisRequest {
        disassembly: &disassembly,
        symbols: &symbols,
        rodata: &rodata,
        tasks: &tasks,
        annotation: annotation.as_ref(),
        options: AnalysisOptions { exception_frame_size: config.exception_frame_size },
    };
    let outcome =
        StackAnalyzer::new(&mut locations).run(&request).context("Stack analysis failed")?;
    Ok(outcome)
}

fn require_image<'a>(objdump: Option<&'a Objdump>, flag: &str) -> Result<&'a Objdump> {
    objdump.ok_or_else(|| anyhow!("--elf is required unless {flag} is given"))
}

fn source_locator(options: &AnalyzeOptions, config: &AnalyzerConfig) -> Box<dyn SourceLocator> {
    if options.no_source_lines {
        return Box::new(NullLocator);
    }
    match options.elf.as_deref() {
        Some(elf) => {
            Box::new(Addr2Line::new(config.addr2line_path(options.addr2line.as_deref()), elf))
        }
        None => {
            warn!("no --elf given; source locations are unavailable");
            Box::new(NullLocator)
        }
    }
}

