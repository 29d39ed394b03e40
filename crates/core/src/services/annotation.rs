//! Annotation resolver.
//!
//! Annotations correct the statically recovered call graph:
//!
//! ```yaml
//! add:
//!   # edges static analysis cannot see (function pointers, tables)
//!   motion_lid_calc[common/motion_lid.c]:
//!     - get_range.lto.2501
//!     - {name: __deferred_funcs, stride: 4}
//! remove:
//!   # call sequences that never happen
//!   - [task_a, [task_b, task_c], task_d]
//!   - panic
//! exception_frame_size: 64
//! ```
//!
//! The document is decoded once into [`AnnotationDocument`]. Signatures are
//! then expanded into [`AnnotationRules`] and finally mapped onto concrete
//! functions by [`AnnotationResolver`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{FunctionMap, Symbol};
use crate::services::objdump::Rodata;
use crate::services::toolchain::{absolute_path, display_relative, LocationCache, ToolError};

// Example: "get_range.lto.2501[driver/accel_kionix.c:327]"
lazy_regex!(fn signature_text = r"^(?P<name>[^\[]+)(\[(?P<path>[^:]+)(:(?P<linenum>\d+))?\])?$");
// Example: "SHA256_transform.constprop.28"
lazy_regex!(fn function_prefix = r"^(?P<name>[_A-Za-z0-9]+)([^_A-Za-z0-9].*)?$");

/// Strip a compiler-added suffix such as `.constprop.28` or `.lto.573`.
///
/// Returns `None` if the name does not start with a C identifier.
pub fn strip_compiler_suffix(name: &str) -> Option<&str> {
    function_prefix().captures(name).and_then(|caps| caps.name("name")).map(|m| m.as_str().trim())
}

#[derive(Debug, Error)]
pub enum AnnotationLoadError {
    #[error("Failed to read annotation file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse annotation document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid annotation document: {0}")]
    InvalidDocument(String),
    #[error("Array slot at {address:#x} is outside the rodata dump")]
    RodataOutOfRange { address: u64 },
    #[error("Cannot find function for address {address:#x}")]
    UnknownPointer { address: u64 },
}

/// Why an annotation signature could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationErrorKind {
    Invalid,
    NotFound,
    Ambiguous,
}

impl fmt::Display for AnnotationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnnotationErrorKind::Invalid => "invalid signature",
            AnnotationErrorKind::NotFound => "function is not found",
            AnnotationErrorKind::Ambiguous => "signature is ambiguous",
        })
    }
}

/// Annotation signature: `name`, `name[path]` or `name[path:line]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    /// Absolute source path.
    pub path: Option<PathBuf>,
    pub line: Option<u64>,
}

impl Signature {
    pub fn new(name: impl Into<String>, path: Option<PathBuf>, line: Option<u64>) -> Self {
        Self { name: name.into(), path, line }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, None, None)
    }

    /// Parse and normalize signature text.
    ///
    /// Compiler suffixes are stripped from the name and the path is made absolute.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = signature_text().captures(text.trim())?;
        let name = strip_compiler_suffix(caps["name"].trim())?;
        let path = caps.name("path").map(|m| absolute_path(m.as_str().trim()));
        let line = match caps.name("linenum") {
            Some(m) => Some(m.as_str().parse().ok()?),
            None => None,
        };
        Some(Self::new(name, path, line))
    }

    /// Render with the path shown relative to `base` when beneath it.
    pub fn render(&self, base: &Path) -> String {
        self.format_with(|path| display_relative(path, base))
    }

    fn format_with(&self, show_path: impl Fn(&Path) -> String) -> String {
        match (&self.path, self.line) {
            (None, _) => self.name.clone(),
            (Some(path), None) => format!("{}[{}]", self.name, show_path(path)),
            (Some(path), Some(line)) => format!("{}[{}:{}]", self.name, show_path(path), line),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_with(|path| path.display().to_string()))
    }
}

/// A signature as written in the document, decoded up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureSpec {
    Parsed(Signature),
    Invalid(String),
}

impl SignatureSpec {
    pub fn decode(text: &str) -> Self {
        match Signature::parse(text) {
            Some(signature) => SignatureSpec::Parsed(signature),
            None => SignatureSpec::Invalid(text.to_string()),
        }
    }

    fn invalid_text(&self) -> Option<&str> {
        match self {
            SignatureSpec::Parsed(_) => None,
            SignatureSpec::Invalid(text) => Some(text),
        }
    }
}

/// Destinations read from a pointer table between `name` and `name_end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayExpansion {
    pub name: String,
    pub stride: u64,
    #[serde(default)]
    pub offset: u64,
}

impl fmt::Display for ArrayExpansion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{name: {}, stride: {}, offset: {}}}", self.name, self.stride, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTarget {
    Signature(SignatureSpec),
    Array(ArrayExpansion),
}

/// `source` may call every target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRule {
    pub source: SignatureSpec,
    pub targets: Vec<AddTarget>,
}

/// Call sequence that never happens. Each node lists alternative signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveRule {
    pub nodes: Vec<Vec<SignatureSpec>>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    add: Option<BTreeMap<String, Vec<RawAddTarget>>>,
    #[serde(default)]
    remove: Option<Vec<RawRemovePath>>,
    #[serde(default)]
    exception_frame_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAddTarget {
    Signature(String),
    Array(ArrayExpansion),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRemovePath {
    Single(String),
    Path(Vec<RawRemoveNode>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRemoveNode {
    Signature(String),
    Alternatives(Vec<String>),
}

/// Decoded annotation document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationDocument {
    pub add: Vec<AddRule>,
    pub remove: Vec<RemoveRule>,
    pub exception_frame_size: Option<u64>,
}

impl AnnotationDocument {
    /// Decode a YAML (or JSON) annotation document. The top level must be a mapping.
    pub fn from_yaml_str(text: &str) -> Result<Self, AnnotationLoadError> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)?;
        if !value.is_mapping() {
            return Err(AnnotationLoadError::InvalidDocument(
                "top level must be a mapping".to_string(),
            ));
        }
        let raw: RawDocument = serde_yaml::from_value(value)
            .map_err(|e| AnnotationLoadError::InvalidDocument(e.to_string()))?;
        Ok(Self::from_raw(raw))
    }

    pub fn load(path: &Path) -> Result<Self, AnnotationLoadError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| AnnotationLoadError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&text)
    }

    fn from_raw(raw: RawDocument) -> Self {
        let add = raw
            .add
            .unwrap_or_default()
            .into_iter()
            .map(|(source, targets)| AddRule {
                source: SignatureSpec::decode(&source),
                targets: targets
                    .into_iter()
                    .map(|target| match target {
                        RawAddTarget::Signature(text) => {
                            AddTarget::Signature(SignatureSpec::decode(&text))
                        }
                        RawAddTarget::Array(array) => AddTarget::Array(array),
                    })
                    .collect(),
            })
            .collect();

        let remove = raw
            .remove
            .unwrap_or_default()
            .into_iter()
            .map(|path| {
                let nodes = match path {
                    RawRemovePath::Single(text) => vec![RawRemoveNode::Signature(text)],
                    RawRemovePath::Path(nodes) => nodes,
                };
                let nodes = nodes
                    .into_iter()
                    .map(|node| {
                        let texts: BTreeSet<String> = match node {
                            RawRemoveNode::Signature(text) => BTreeSet::from([text]),
                            RawRemoveNode::Alternatives(texts) => texts.into_iter().collect(),
                        };
                        texts.iter().map(|text| SignatureSpec::decode(text)).collect()
                    })
                    .collect();
                RemoveRule { nodes }
            })
            .collect();

        Self { add, remove, exception_frame_size: raw.exception_frame_size }
    }

    /// Signature texts that cannot be parsed, without consulting the image.
    pub fn invalid_signatures(&self) -> BTreeSet<String> {
        let mut invalid = BTreeSet::new();
        for rule in &self.add {
            if let Some(text) = rule.source.invalid_text() {
                invalid.insert(text.to_string());
                continue;
            }
            for target in &rule.targets {
                match target {
                    AddTarget::Signature(spec) => {
                        invalid.extend(spec.invalid_text().map(str::to_string))
                    }
                    AddTarget::Array(array) if array.stride == 0 => {
                        invalid.insert(array.to_string());
                    }
                    AddTarget::Array(_) => {}
                }
            }
        }
        for rule in &self.remove {
            for spec in rule.nodes.iter().flatten() {
                invalid.extend(spec.invalid_text().map(str::to_string));
            }
        }
        invalid
    }
}

/// Normalized rules: array directives expanded, remove paths multiplied out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationRules {
    pub add: BTreeMap<Signature, BTreeSet<Signature>>,
    pub remove: Vec<Vec<Signature>>,
    pub invalid: BTreeSet<String>,
}

impl AnnotationRules {
    /// Expand a decoded document against the image's symbols and rodata.
    ///
    /// A rule with an invalid source is skipped. A remove path with any
    /// invalid signature is dropped, but every node is still checked so that
    /// all invalid texts get reported.
    pub fn load(
        document: &AnnotationDocument,
        symbols: &[Symbol],
        rodata: &Rodata,
    ) -> Result<Self, AnnotationLoadError> {
        let mut rules = AnnotationRules::default();

        for rule in &document.add {
            let source = match &rule.source {
                SignatureSpec::Parsed(signature) => signature,
                SignatureSpec::Invalid(text) => {
                    rules.invalid.insert(text.clone());
                    continue;
                }
            };
            for target in &rule.targets {
                let expanded = match target {
                    AddTarget::Signature(SignatureSpec::Parsed(signature)) => {
                        vec![signature.clone()]
                    }
                    AddTarget::Signature(SignatureSpec::Invalid(text)) => {
                        rules.invalid.insert(text.clone());
                        continue;
                    }
                    AddTarget::Array(array) => match expand_array(array, symbols, rodata)? {
                        Some(signatures) => signatures,
                        None => {
                            rules.invalid.insert(array.to_string());
                            continue;
                        }
                    },
                };
                rules.add.entry(source.clone()).or_default().extend(expanded);
            }
        }

        for rule in &document.remove {
            if rule.nodes.is_empty() {
                continue;
            }
            let mut paths: Vec<Vec<Signature>> = vec![Vec::new()];
            let mut broken = false;
            for node in &rule.nodes {
                let mut alternatives = BTreeSet::new();
                for spec in node {
                    match spec {
                        SignatureSpec::Parsed(signature) => {
                            alternatives.insert(signature.clone());
                        }
                        SignatureSpec::Invalid(text) => {
                            rules.invalid.insert(text.clone());
                            broken = true;
                        }
                    }
                }
                if broken {
                    continue;
                }
                paths = cross_extend(&paths, alternatives.iter().cloned());
            }
            if !broken {
                rules.remove.extend(paths);
            }
        }

        debug!(
            add = rules.add.len(),
            remove = rules.remove.len(),
            invalid = rules.invalid.len(),
            "loaded annotation rules"
        );
        Ok(rules)
    }

    /// Every signature mentioned by a rule.
    pub fn signatures(&self) -> BTreeSet<Signature> {
        let mut signatures = BTreeSet::new();
        for (source, targets) in &self.add {
            signatures.insert(source.clone());
            signatures.extend(targets.iter().cloned());
        }
        for path in &self.remove {
            signatures.extend(path.iter().cloned());
        }
        signatures
    }
}

/// Append every alternative to every prefix.
fn cross_extend<T: Clone>(
    prefixes: &[Vec<T>],
    alternatives: impl IntoIterator<Item = T> + Clone,
) -> Vec<Vec<T>> {
    prefixes
        .iter()
        .flat_map(|prefix| {
            alternatives.clone().into_iter().map(move |item| {
                let mut path = prefix.clone();
                path.push(item);
                path
            })
        })
        .collect()
}

/// Read function pointers between the bound symbols `name` and `name_end`.
///
/// Returns `Ok(None)` when the directive cannot be expanded (missing bound,
/// zero stride or an offset past the address space).
fn expand_array(
    array: &ArrayExpansion,
    symbols: &[Symbol],
    rodata: &Rodata,
) -> Result<Option<Vec<Signature>>, AnnotationLoadError> {
    let end_name = format!("{}_end", array.name);
    let begin = symbols.iter().rev().find(|s| s.name == array.name).map(|s| s.address);
    let end = symbols.iter().rev().find(|s| s.name == end_name).map(|s| s.address);
    let (Some(begin), Some(end)) = (begin, end) else {
        return Ok(None);
    };
    let Ok(stride) = usize::try_from(array.stride) else {
        return Ok(None);
    };
    if stride == 0 {
        return Ok(None);
    }

    let Some(first) = begin.checked_add(array.offset) else {
        return Ok(None);
    };

    let mut signatures = Vec::new();
    for slot in (first..end).step_by(stride) {
        let word = rodata
            .word_at(slot)
            .ok_or(AnnotationLoadError::RodataOutOfRange { address: slot })?;
        // Thumb pointers carry the mode in the low bit.
        let pointer = u64::from(word & !1);
        let symbol = symbols
            .iter()
            .find(|s| s.address == pointer)
            .ok_or(AnnotationLoadError::UnknownPointer { address: pointer })?;
        let name = strip_compiler_suffix(&symbol.name).unwrap_or(&symbol.name);
        signatures.push(Signature::named(name));
    }
    Ok(Some(signatures))
}

/// Groups a path-less signature may resolve to. Unlocated functions are
/// skipped as soon as any group has a source path.
fn path_less_candidates(groups: &SignatureGroups) -> Vec<&Vec<u64>> {
    if groups.keys().any(Option::is_some) {
        groups.iter().filter(|(path, _)| path.is_some()).map(|(_, group)| group).collect()
    } else {
        groups.values().collect()
    }
}

/// A signature that could not be used, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailedSignature {
    pub kind: AnnotationErrorKind,
    /// Text as written for invalid signatures, normalized text otherwise.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl FailedSignature {
    pub fn invalid(text: impl Into<String>) -> Self {
        Self { kind: AnnotationErrorKind::Invalid, text: text.into(), signature: None }
    }

    pub fn unresolved(signature: Signature, kind: AnnotationErrorKind) -> Self {
        Self { kind, text: signature.to_string(), signature: Some(signature) }
    }

    pub fn render(&self, base: &Path) -> String {
        match &self.signature {
            Some(signature) => signature.render(base),
            None => self.text.clone(),
        }
    }
}

/// Annotations mapped onto concrete functions (by address).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAnnotation {
    /// Extra (caller, callee) edges.
    pub add_edges: BTreeSet<(u64, u64)>,
    /// Forbidden call sequences, deduplicated, in rule order.
    pub remove_paths: Vec<Vec<u64>>,
    /// Indirect callsite addresses accounted for by an add rule.
    pub eliminated: BTreeSet<u64>,
    pub failed: BTreeSet<FailedSignature>,
}

/// Functions each signature names, and the signatures that named none.
pub type SignatureMapping =
    (BTreeMap<Signature, Vec<u64>>, BTreeMap<Signature, AnnotationErrorKind>);

type SignatureGroups = BTreeMap<Option<PathBuf>, Vec<u64>>;

/// `(function, callsite)` addresses of indirect calls, by source location.
type IndirectCallsites = BTreeMap<Signature, BTreeSet<(u64, u64)>>;

/// Maps annotation signatures onto the functions of one image.
pub struct AnnotationResolver<'a> {
    symbols: &'a [Symbol],
    functions: &'a FunctionMap,
    locations: &'a mut LocationCache,
}

impl<'a> AnnotationResolver<'a> {
    pub fn new(
        symbols: &'a [Symbol],
        functions: &'a FunctionMap,
        locations: &'a mut LocationCache,
    ) -> Self {
        Self { symbols, functions, locations }
    }

    /// Map each signature to the functions it names.
    ///
    /// Functions sharing a name are grouped by the source path of their
    /// entry point. A path-less signature needs exactly one located group;
    /// functions without debug info are only used when no group is located.
    /// The line number of a signature plays no part here.
    pub fn map_signatures(
        &mut self,
        signatures: &BTreeSet<Signature>,
    ) -> Result<SignatureMapping, ToolError> {
        let symbols: &'a [Symbol] = self.symbols;
        let functions: &'a FunctionMap = self.functions;
        let mut by_name: BTreeMap<&'a str, BTreeSet<u64>> = BTreeMap::new();
        for symbol in symbols.iter().filter(|s| s.is_function()) {
            if let Some(name) = strip_compiler_suffix(&symbol.name) {
                if functions.contains_key(&symbol.address) {
                    by_name.entry(name).or_default().insert(symbol.address);
                }
            }
        }

        // Resolved lazily: every lookup may cost an addr2line run.
        let mut groups_by_name: BTreeMap<&str, SignatureGroups> = BTreeMap::new();
        let mut mapped = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for signature in signatures {
            let Some((&name, addresses)) = by_name.get_key_value(signature.name.as_str()) else {
                errors.insert(signature.clone(), AnnotationErrorKind::NotFound);
                continue;
            };

            if !groups_by_name.contains_key(name) {
                let mut groups = SignatureGroups::new();
                for &address in addresses {
                    let path = self.locations.primary(address)?.map(|info| info.path);
                    groups.entry(path).or_default().push(address);
                }
                groups_by_name.insert(name, groups);
            }
            let groups = &groups_by_name[name];

            let group = match &signature.path {
                None => {
                    let candidates = path_less_candidates(groups);
                    if candidates.len() > 1 {
                        errors.insert(signature.clone(), AnnotationErrorKind::Ambiguous);
                        continue;
                    }
                    candidates.into_iter().next()
                }
                Some(path) => groups
                    .iter()
                    .find(|(group_path, _)| group_path.as_deref() == Some(path.as_path()))
                    .map(|(_, group)| group),
            };
            match group {
                Some(group) => {
                    mapped.insert(signature.clone(), group.clone());
                }
                None => {
                    errors.insert(signature.clone(), AnnotationErrorKind::NotFound);
                }
            }
        }
        Ok((mapped, errors))
    }

    /// Resolve all rules into edges, paths, eliminated callsites and failures.
    pub fn resolve(&mut self, rules: &AnnotationRules) -> Result<ResolvedAnnotation, ToolError> {
        let (mapped, mut errors) = self.map_signatures(&rules.signatures())?;
        let indirect = self.indirect_callsites()?;

        let mut resolved = ResolvedAnnotation::default();
        for (source, targets) in &rules.add {
            let mut sources: BTreeSet<u64> =
                mapped.get(source).into_iter().flatten().copied().collect();
            // The source may name the location of an indirect call rather than a function.
            if let Some(callsites) = indirect.get(source) {
                for &(function, callsite) in callsites {
                    sources.insert(function);
                    resolved.eliminated.insert(callsite);
                }
                errors.remove(source);
            }

            for target in targets {
                let Some(callees) = mapped.get(target) else {
                    continue;
                };
                for &caller in &sources {
                    for &callee in callees {
                        resolved.add_edges.insert((caller, callee));
                    }
                }
            }
        }

        for path in &rules.remove {
            let mut expanded: Vec<Vec<u64>> = vec![Vec::new()];
            let mut complete = true;
            for signature in path {
                match mapped.get(signature) {
                    Some(functions) => {
                        expanded = cross_extend(&expanded, functions.iter().copied())
                    }
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }
            for candidate in expanded {
                if !resolved.remove_paths.contains(&candidate) {
                    resolved.remove_paths.push(candidate);
                }
            }
        }

        resolved.failed.extend(rules.invalid.iter().map(FailedSignature::invalid));
        resolved.failed.extend(
            errors
                .into_iter()
                .map(|(signature, kind)| FailedSignature::unresolved(signature, kind)),
        );

        info!(
            add_edges = resolved.add_edges.len(),
            remove_paths = resolved.remove_paths.len(),
            eliminated = resolved.eliminated.len(),
            failed = resolved.failed.len(),
            "resolved annotations"
        );
        Ok(resolved)
    }

    /// Indirect callsites keyed by the full signature of their source location.
    fn indirect_callsites(&mut self) -> Result<IndirectCallsites, ToolError> {
        let mut indirect = IndirectCallsites::new();
        for function in self.functions.values() {
            for callsite in function.callsites.iter().filter(|c| c.is_indirect()) {
                let Some(address) = callsite.address else {
                    continue;
                };
                let Some(info) = self.locations.primary(address)? else {
                    continue;
                };
                let Some(name) = strip_compiler_suffix(&info.function) else {
                    continue;
                };
                let signature = Signature::new(name, Some(info.path.clone()), Some(info.line));
                indirect.entry(signature).or_default().insert((function.address, address));
            }
        }
        Ok(indirect)
    }
}
