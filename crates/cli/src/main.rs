use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use stack_analyzer::commands::{analyze_command, check_annotation_command, AnalyzeOptions};
use stack_analyzer::parse_section;
use stack_analyzer_core::services::tasks::Section;
use tracing_subscriber::EnvFilter;

/// Static worst-case stack usage analyzer for firmware images.
///
/// This CLI is a thin wrapper around `stack-analyzer-core`. All substantive
/// logic lives in the library so it can be tested thoroughly and reused from
/// build integrations.
#[derive(Parser, Debug)]
#[command(
    name = "stack-analyzer",
    version,
    about = "Static worst-case stack usage analyzer for firmware images",
    long_about = None
)]
struct Cli {
    /// Increase log verbosity (-v for info, -vv for debug). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the worst-case stack usage of every task.
    ///
    /// This will:
    /// - Disassemble the image and dump its symbol table and `.rodata`.
    /// - Apply the annotation file, if present.
    /// - Print one call trace per task plus unresolved callsites and signatures.
    Analyze {
        /// Firmware image (ELF). Required unless every dump is given explicitly.
        #[arg(long)]
        elf: Option<PathBuf>,

        /// Task list (YAML or JSON) naming each task's routine and stack size.
        #[arg(long)]
        tasks: PathBuf,

        /// Annotation file. A missing file is reported and ignored.
        #[arg(long)]
        annotation: Option<PathBuf>,

        /// Image section whose task list is used (`ro` or `rw`).
        #[arg(long, default_value = "rw", value_parser = parse_section)]
        section: Section,

        /// objdump binary for the target toolchain.
        #[arg(long)]
        objdump: Option<PathBuf>,

        /// addr2line binary for the target toolchain.
        #[arg(long)]
        addr2line: Option<PathBuf>,

        /// Analyzer config file (YAML or JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pre-dumped `objdump -d` output to use instead of running objdump.
        #[arg(long)]
        disassembly: Option<PathBuf>,

        /// Pre-dumped `objdump -t` output.
        #[arg(long)]
        symbols: Option<PathBuf>,

        /// Pre-dumped `objdump -s -j .rodata` output.
        #[arg(long)]
        rodata: Option<PathBuf>,

        /// Skip addr2line; every location is reported as unknown.
        #[arg(long, default_value_t = false)]
        no_source_lines: bool,

        /// Emit JSON instead of the text report.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Decode an annotation file and list its invalid signatures.
    CheckAnnotation {
        /// Annotation file to check.
        path: PathBuf,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Analyze {
            elf,
            tasks,
            annotation,
            section,
            objdump,
            addr2line,
            config,
            disassembly,
            symbols,
            rodata,
            no_source_lines,
            json,
        } => analyze_command(&AnalyzeOptions {
            elf,
            tasks,
            annotation,
            section,
            objdump,
            addr2line,
            config,
            disassembly,
            symbols,
            rodata,
            no_source_lines,
            json,
        })?,
        Command::CheckAnnotation { path, json } => check_annotation_command(&path, json)?,
    }

    Ok(())
}

/// Logs go to stderr so the report on stdout stays clean.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("stack_analyzer={level},stack_analyzer_core={level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
