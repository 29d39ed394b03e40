use thiserror::Error;
use tracing::{info, warn};

use crate::config::DEFAULT_EXCEPTION_FRAME_SIZE;
use crate::model::{FunctionMap, Symbol, Task};
use crate::services::annotation::{
    AnnotationDocument, AnnotationLoadError, AnnotationResolver, AnnotationRules,
};
use crate::services::disasm::{analyze_disassembly, DisassemblyError};
use crate::services::editor::apply_annotations;
use crate::services::isa::Architecture;
use crate::services::objdump::{InputError, Rodata};
use crate::services::report::{AnalysisReport, ReportBuilder};
use crate::services::toolchain::{LocationCache, ToolError};
use crate::services::usage::analyze_call_graph;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Disassembly(#[from] DisassemblyError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Annotation(#[from] AnnotationLoadError),
    #[error(transparent)]
    Input(#[from] InputError),
}

/// Options for one analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnalysisOptions {
    /// Used when the annotation document does not set `exception_frame_size`.
    pub exception_frame_size: Option<u64>,
}

/// Everything the pipeline reads, already dumped to text or parsed.
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub disassembly: &'a str,
    pub symbols: &'a [Symbol],
    pub rodata: &'a Rodata,
    /// Tasks with resolved routine addresses.
    pub tasks: &'a [Task],
    pub annotation: Option<&'a AnnotationDocument>,
    pub options: AnalysisOptions,
}

/// Result of a run: the report plus the analyzed graph for callers that
/// want more than the per-task view.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub architecture: Architecture,
    pub functions: FunctionMap,
    pub report: AnalysisReport,
}

/// Coordinator for the pipeline: build functions, resolve and apply
/// annotations, compute usage, assemble the report.
pub struct StackAnalyzer<'a> {
    pub locations: &'a mut LocationCache,
}

impl<'a> StackAnalyzer<'a> {
    pub fn new(locations: &'a mut LocationCache) -> Self {
        Self { locations }
    }

    pub fn run(&mut self, request: &AnalysisRequest<'_>) -> Result<AnalysisOutcome, AnalysisError> {
        let disassembly = analyze_disassembly(request.disassembly, request.symbols)?;
        let mut functions = disassembly.functions;

        for task in request.tasks {
            match task.routine_address {
                Some(address) if functions.contains_key(&address) => {}
                address => {
                    return Err(InputError::MissingRoutineFunction {
                        task: task.name.clone(),
                        address: address.unwrap_or_default(),
                    }
                    .into());
                }
            }
        }

        let rules = match request.annotation {
            Some(document) => AnnotationRules::load(document, request.symbols, request.rodata)?,
            None => AnnotationRules::default(),
        };
        let resolved =
            AnnotationResolver::new(request.symbols, &functions, self.locations).resolve(&rules)?;
        if !resolved.failed.is_empty() {
            warn!(failed = resolved.failed.len(), "some annotation signatures were not resolved");
        }

        let remove_paths = apply_annotations(&mut functions, &resolved);
        info!(remove_paths = remove_paths.len(), "applied annotations");

        let cycles = analyze_call_graph(&mut functions, &remove_paths);
        if !cycles.is_empty() {
            warn!(cycles = cycles.len(), "call graph has cycles; usage inside them is approximate");
        }

        let exception_frame_size = exception_frame_size(request.annotation, &request.options);
        let report = ReportBuilder::new(&functions, self.locations, exception_frame_size).build(
            request.tasks,
            &resolved.failed,
            &cycles,
        )?;
        info!(tasks = report.tasks.len(), locations = self.locations.len(), "analysis complete");

        Ok(AnalysisOutcome { architecture: disassembly.architecture, functions, report })
    }
}

/// Annotation document first, then the configured fallback, then the default.
pub fn exception_frame_size(
    annotation: Option<&AnnotationDocument>,
    options: &AnalysisOptions,
) -> u64 {
    annotation
        .and_then(|document| document.exception_frame_size)
        .or(options.exception_frame_size)
        .unwrap_or(DEFAULT_EXCEPTION_FRAME_SIZE)
}
