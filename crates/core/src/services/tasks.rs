//! Task list loading and routine resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{Symbol, Task};
use crate::services::objdump::InputError;

/// Firmware image section whose task table is analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Ro,
    #[default]
    Rw,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Ro => f.write_str("ro"),
            Section::Rw => f.write_str("rw"),
        }
    }
}

/// One entry of the task table as exported by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub routine: String,
    pub stack_size: u64,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, routine: impl Into<String>, stack_size: u64) -> Self {
        Self { name: name.into(), routine: routine.into(), stack_size }
    }
}

/// Task list document: either a flat list or per-section lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskListDocument {
    Flat(Vec<TaskSpec>),
    Sections {
        #[serde(default)]
        ro: Vec<TaskSpec>,
        #[serde(default)]
        rw: Vec<TaskSpec>,
    },
}

impl TaskListDocument {
    /// Tasks of `section`. A flat list applies to every section.
    pub fn into_section(self, section: Section) -> Vec<TaskSpec> {
        match (self, section) {
            (TaskListDocument::Flat(tasks), _) => tasks,
            (TaskListDocument::Sections { ro, .. }, Section::Ro) => ro,
            (TaskListDocument::Sections { rw, .. }, Section::Rw) => rw,
        }
    }
}

/// Load a task list from disk (YAML or JSON based on extension).
pub fn load_task_list(path: &Path, section: Section) -> Result<Vec<TaskSpec>> {
    let body = std::fs::read(path)
        .with_context(|| format!("Failed to read task list at {}", path.display()))?;
    let document: TaskListDocument = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_slice(&body).context("Failed to parse task list JSON")?
    } else {
        serde_yaml::from_slice(&body).context("Failed to parse task list YAML")?
    };
    Ok(document.into_section(section))
}

/// Resolve each task's routine name to a symbol address.
///
/// Routine names must match exactly one symbol.
pub fn resolve_tasks(specs: &[TaskSpec], symbols: &[Symbol]) -> Result<Vec<Task>, InputError> {
    let mut routines: BTreeMap<&str, Option<u64>> =
        specs.iter().map(|spec| (spec.routine.as_str(), None)).collect();

    for symbol in symbols {
        if let Some(slot) = routines.get_mut(symbol.name.as_str()) {
            if slot.is_some() {
                return Err(InputError::DuplicateRoutine { routine: symbol.name.clone() });
            }
            *slot = Some(symbol.address);
        }
    }

    specs
        .iter()
        .map(|spec| {
            let address = routines.get(spec.routine.as_str()).copied().flatten().ok_or_else(|| {
                InputError::UnresolvedRoutine {
                    task: spec.name.clone(),
                    routine: spec.routine.clone(),
                }
            })?;
            Ok(Task::new(&spec.name, &spec.routine, spec.stack_size).with_routine_address(address))
        })
        .collect()
}
