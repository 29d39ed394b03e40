//! Report model and its text rendering.
//!
//! The report is plain data (serializable for `--json`); [`AnalysisReport::render`]
//! produces the human-readable text.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{FunctionMap, Task};
use crate::services::annotation::FailedSignature;
use crate::services::toolchain::{display_relative, LineInfo, LocationCache, ToolError};

const CALLSITE_INDENT: &str = "        ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub exception_frame_size: u64,
    pub tasks: Vec<TaskReport>,
    pub unresolved_indirect: Vec<IndirectCallsiteReport>,
    pub failed_signatures: Vec<FailedSignature>,
    /// Function names of each call cycle.
    pub cycles: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub routine: String,
    /// Worst-case usage of the routine, without the exception frame.
    pub stack_usage: u64,
    pub max_size: u64,
    pub allocated_size: u64,
    pub call_trace: Vec<TraceHop>,
}

/// One function on a worst-case path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHop {
    pub function: String,
    pub address: u64,
    pub stack_frame: u64,
    pub location: Option<LineInfo>,
    /// Callsites leading to the next hop.
    pub callsites: Vec<CallsiteTrace>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallsiteTrace {
    /// Edge added by an annotation.
    Annotation,
    Instruction(InlineStack),
}

/// Inline frames of one instruction, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineStack {
    pub address: u64,
    pub frames: Vec<Option<LineInfo>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectCallsiteReport {
    pub function: String,
    pub callsites: Vec<InlineStack>,
}

impl InlineStack {
    fn sort_key(&self) -> Option<(u64, &Path)> {
        self.frames.first().and_then(Option::as_ref).map(|info| (info.line, info.path.as_path()))
    }

    fn render(&self, out: &mut String, prefix: &str, base: &Path) {
        let texts: Vec<String> =
            self.frames.iter().rev().map(|frame| frame_text(frame.as_ref(), base)).collect();
        let Some((outermost, inner)) = texts.split_first() else {
            let _ = writeln!(out, "{prefix}-> ??[??:0] {:x}", self.address);
            return;
        };
        let _ = writeln!(out, "{prefix}-> {outermost} {:x}", self.address);
        for (depth, text) in inner.iter().enumerate() {
            let _ = writeln!(out, "{prefix}   {}- {text}", "  ".repeat(depth));
        }
    }
}

impl CallsiteTrace {
    fn sort_key(&self) -> Option<(u64, &Path)> {
        match self {
            CallsiteTrace::Annotation => None,
            CallsiteTrace::Instruction(stack) => stack.sort_key(),
        }
    }
}

fn frame_text(frame: Option<&LineInfo>, base: &Path) -> String {
    match frame {
        Some(info) => {
            format!("{}[{}:{}]", info.function, display_relative(&info.path, base), info.line)
        }
        None => "??[??:0]".to_string(),
    }
}

fn location_text(location: Option<&LineInfo>, base: &Path) -> String {
    match location {
        Some(info) => format!("[{}:{}]", display_relative(&info.path, base), info.line),
        None => "[??:0]".to_string(),
    }
}

/// Unknown locations sort first, then by line and path.
fn compare_keys(a: Option<(u64, &Path)>, b: Option<(u64, &Path)>) -> Ordering {
    a.cmp(&b)
}

impl AnalysisReport {
    /// Render the report as text, showing paths relative to `base` when beneath it.
    pub fn render(&self, base: &Path) -> String {
        let mut out = String::new();
        for task in &self.tasks {
            let _ = writeln!(
                out,
                "Task: {}, Max size: {} ({} + {}), Allocated size: {}",
                task.name,
                task.max_size,
                task.stack_usage,
                self.exception_frame_size,
                task.allocated_size
            );
            out.push_str("Call Trace:\n");
            for hop in &task.call_trace {
                let _ = writeln!(
                    out,
                    "    {} ({}) {} {:x}",
                    hop.function,
                    hop.stack_frame,
                    location_text(hop.location.as_ref(), base),
                    hop.address
                );
                for callsite in &hop.callsites {
                    match callsite {
                        CallsiteTrace::Annotation => {
                            let _ = writeln!(out, "{CALLSITE_INDENT}-> [annotation]");
                        }
                        CallsiteTrace::Instruction(stack) => {
                            stack.render(&mut out, CALLSITE_INDENT, base)
                        }
                    }
                }
            }
        }

        out.push_str("Unresolved indirect callsites:\n");
        for entry in &self.unresolved_indirect {
            let _ = writeln!(out, "    In function {}:", entry.function);
            for stack in &entry.callsites {
                stack.render(&mut out, CALLSITE_INDENT, base);
            }
        }

        out.push_str("Unresolved annotation signatures:\n");
        for failed in &self.failed_signatures {
            let _ = writeln!(out, "    {}: {}", failed.render(base), failed.kind);
        }

        if !self.cycles.is_empty() {
            out.push_str("There are cycles in the following function sets:\n");
            for cycle in &self.cycles {
                let _ = writeln!(out, "[{}]", cycle.join(", "));
            }
        }
        out
    }
}

/// Assembles an [`AnalysisReport`] from an analyzed function map.
pub struct ReportBuilder<'a> {
    functions: &'a FunctionMap,
    locations: &'a mut LocationCache,
    exception_frame_size: u64,
}

impl<'a> ReportBuilder<'a> {
    pub fn new(
        functions: &'a FunctionMap,
        locations: &'a mut LocationCache,
        exception_frame_size: u64,
    ) -> Self {
        Self { functions, locations, exception_frame_size }
    }

    /// Build the report. Every task routine must be a key of the function map.
    pub fn build(
        mut self,
        tasks: &[Task],
        failed: &BTreeSet<FailedSignature>,
        cycles: &[BTreeSet<u64>],
    ) -> Result<AnalysisReport, ToolError> {
        let functions: &'a FunctionMap = self.functions;
        let mut task_reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            let Some(routine) = task.routine_address.and_then(|address| functions.get(&address))
            else {
                continue;
            };
            let stack_usage = routine.stack_max_usage.unwrap_or(routine.stack_frame);
            let path = routine.stack_max_path.clone().unwrap_or_else(|| vec![routine.address]);
            task_reports.push(TaskReport {
                name: task.name.clone(),
                routine: task.routine_name.clone(),
                stack_usage,
                max_size: stack_usage + self.exception_frame_size,
                allocated_size: task.stack_max_size,
                call_trace: self.call_trace(&path)?,
            });
        }

        let mut unresolved_indirect = Vec::new();
        for function in functions.values() {
            let addresses: Vec<u64> = function
                .callsites
                .iter()
                .filter(|c| c.is_indirect())
                .filter_map(|c| c.address)
                .collect();
            if addresses.is_empty() {
                continue;
            }
            let mut callsites = Vec::with_capacity(addresses.len());
            for address in addresses {
                callsites.push(self.inline_stack(address)?);
            }
            callsites.sort_by(|a, b| compare_keys(a.sort_key(), b.sort_key()));
            unresolved_indirect
                .push(IndirectCallsiteReport { function: function.name.clone(), callsites });
        }

        let cycles = cycles
            .iter()
            .map(|cycle| {
                cycle
                    .iter()
                    .map(|address| {
                        functions
                            .get(address)
                            .map_or_else(|| format!("{address:x}"), |f| f.name.clone())
                    })
                    .collect()
            })
            .collect();

        Ok(AnalysisReport {
            exception_frame_size: self.exception_frame_size,
            tasks: task_reports,
            unresolved_indirect,
            failed_signatures: failed.iter().cloned().collect(),
            cycles,
        })
    }

    fn call_trace(&mut self, path: &[u64]) -> Result<Vec<TraceHop>, ToolError> {
        let functions: &'a FunctionMap = self.functions;
        let mut hops = Vec::with_capacity(path.len());
        for (depth, address) in path.iter().enumerate() {
            let Some(function) = functions.get(address) else {
                continue;
            };
            let mut callsites = Vec::new();
            if let Some(next) = path.get(depth + 1) {
                for callsite in function.callsites.iter().filter(|c| c.callee == Some(*next)) {
                    callsites.push(match callsite.address {
                        None => CallsiteTrace::Annotation,
                        Some(address) => CallsiteTrace::Instruction(self.inline_stack(address)?),
                    });
                }
                callsites.sort_by(|a, b| compare_keys(a.sort_key(), b.sort_key()));
            }
            hops.push(TraceHop {
                function: function.name.clone(),
                address: function.address,
                stack_frame: function.stack_frame,
                location: self.locations.primary(function.address)?,
                callsites,
            });
        }
        Ok(hops)
    }

    fn inline_stack(&mut self, address: u64) -> Result<InlineStack, ToolError> {
        Ok(InlineStack { address, frames: self.locations.locate(address, true)? })
    }
}

/// Directory report paths are shown relative to by default.
pub fn default_base_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Callsite, Function};
    use crate::services::annotation::{AnnotationErrorKind, Signature};
    use crate::services::toolchain::{Frames, NullLocator, SourceLocator};

    struct InlineLocator;

    impl SourceLocator for InlineLocator {
        fn locate(&self, address: u64, resolve_inline: bool) -> Result<Frames, ToolError> {
            Ok(match (address, resolve_inline) {
                (0x1000, false) => vec![Some(LineInfo::new("hook_task", "/src/hook.c", 10))],
                (0x2002, true) => vec![
                    Some(LineInfo::new("inner", "/src/console.c", 40)),
                    Some(LineInfo::new("console_task", "/src/console.c", 12)),
                ],
                (0x2006, true) => vec![Some(LineInfo::new("console_task", "/src/console.c", 7))],
                _ => vec![None],
            })
        }
    }

    fn functions() -> FunctionMap {
        let mut hook = Function::new(0x1000, "hook_task", 32, Vec::new());
        hook.stack_max_usage = Some(32);
        hook.stack_max_path = Some(vec![0x1000]);
        let mut console = Function::new(
            0x2000,
            "console_task",
            16,
            vec![
                Callsite::direct(0x2002, 0x1000, false).with_callee(Some(0x1000)),
                Callsite::direct(0x2006, 0x1000, true).with_callee(Some(0x1000)),
                Callsite::annotated(0x1000),
                Callsite::indirect(0x200a, false),
            ],
        );
        console.stack_max_usage = Some(48);
        console.stack_max_path = Some(vec![0x2000, 0x1000]);
        FunctionMap::from([(0x1000, hook), (0x2000, console)])
    }

    #[test]
    fn renders_trace_with_inline_stacks() {
        let functions = functions();
        let mut locations = LocationCache::new(Box::new(InlineLocator));
        let tasks = vec![Task::new("CONSOLE", "console_task", 460).with_routine_address(0x2000)];
        let failed = BTreeSet::from([
            FailedSignature::unresolved(Signature::named("zed"), AnnotationErrorKind::Ambiguous),
            FailedSignature::unresolved(
                Signature::new("task_unk", Some(PathBuf::from("/src/a.c")), None),
                AnnotationErrorKind::NotFound,
            ),
            FailedSignature::invalid("touchpad?calc["),
        ]);
        let cycles = vec![BTreeSet::from([0x1000, 0x2000])];

        let report = ReportBuilder::new(&functions, &mut locations, 64)
            .build(&tasks, &failed, &cycles)
            .expect("report");

        let expected = "\
Task: CONSOLE, Max size: 112 (48 + 64), Allocated size: 460
Call Trace:
    console_task (16) [??:0] 2000
        -> [annotation]
        -> console_task[console.c:7] 2006
        -> console_task[console.c:12] 2002
           - inner[console.c:40]
    hook_task (32) [hook.c:10] 1000
Unresolved indirect callsites:
    In function console_task:
        -> ??[??:0] 200a
Unresolved annotation signatures:
    touchpad?calc[: invalid signature
    task_unk[a.c]: function is not found
    zed: signature is ambiguous
There are cycles in the following function sets:
[hook_task, console_task]
";
        assert_eq!(report.render(Path::new("/src")), expected);
    }

    #[test]
    fn cycle_section_is_omitted_without_cycles() {
        let functions = functions();
        let mut locations = LocationCache::new(Box::new(NullLocator));
        let tasks = vec![Task::new("HOOKS", "hook_task", 2048).with_routine_address(0x1000)];

        let report = ReportBuilder::new(&functions, &mut locations, 224)
            .build(&tasks, &BTreeSet::new(), &[])
            .expect("report");
        let text = report.render(Path::new("/"));

        assert!(text.starts_with("Task: HOOKS, Max size: 256 (32 + 224), Allocated size: 2048\n"));
        assert!(text.ends_with("Unresolved annotation signatures:\n"));
        assert!(!text.contains("cycles"));
    }

    #[test]
    fn paths_outside_base_stay_absolute() {
        let info = LineInfo::new("f", "/other/x.c", 3);
        assert_eq!(frame_text(Some(&info), Path::new("/src")), "f[/other/x.c:3]");
        assert_eq!(location_text(None, Path::new("/src")), "[??:0]");
    }

    #[test]
    fn report_serializes_to_json() {
        let functions = functions();
        let mut locations = LocationCache::new(Box::new(NullLocator));
        let tasks = vec![Task::new("HOOKS", "hook_task", 2048).with_routine_address(0x1000)];
        let report = ReportBuilder::new(&functions, &mut locations, 64)
            .build(&tasks, &BTreeSet::new(), &[])
            .expect("report");

        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["tasks"][0]["max_size"], 96);
        assert_eq!(value["unresolved_indirect"][0]["callsites"][0]["address"], 0x200a);
    }
}
