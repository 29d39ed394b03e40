use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use stack_analyzer_core::services::annotation::AnnotationDocument;

/// Summary of an annotation document as printed by `check-annotation`.
#[derive(Debug, Serialize)]
pub struct AnnotationCheck {
    pub add_rules: usize,
    pub remove_rules: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_frame_size: Option<u64>,
    pub invalid_signatures: Vec<String>,
}

impl AnnotationCheck {
    pub fn from_document(document: &AnnotationDocument) -> Self {
        Self {
            add_rules: document.add.len(),
            remove_rules: document.remove.len(),
            exception_frame_size: document.exception_frame_size,
            invalid_signatures: document.invalid_signatures().into_iter().collect(),
        }
    }
}

/// Decode an annotation document and list its invalid signatures.
///
/// Invalid signatures are reported but do not fail the command; only a
/// document that cannot be decoded at all does.
pub fn check_annotation_command(path: &Path, json: bool) -> Result<()> {
    let document = AnnotationDocument::load(path)
        .with_context(|| format!("Failed to load annotation file {}", path.display()))?;
    let check = AnnotationCheck::from_document(&document);

    if json {
        println!("{}", serde_json::to_string_pretty(&check)?);
        return Ok(());
    }

    println!("Annotation: {}", path.display());
    println!("  Add rules: {}", check.add_rules);
    println!("  Remove rules: {}", check.remove_rules);
    if let Some(size) = check.exception_frame_size {
        println!("  Exception frame size: {size}");
    }
    if check.invalid_signatures.is_empty() {
        println!("Invalid signatures: (none)");
        return Ok(());
    }

    println!("Invalid signatures:");
    for signature in &check.invalid_signatures {
        println!("- {signature}");
    }

    Ok(())
}
