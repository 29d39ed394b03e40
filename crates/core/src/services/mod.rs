//! Analysis services, leaf-first: instruction analyzers, function builder,
//! annotation resolver, call-graph editor, usage engine and report.

/// Declare a function returning a process-wide compiled regex.
macro_rules! lazy_regex {
    ($vis:vis fn $name:ident = $pattern:expr) => {
        $vis fn $name() -> &'static regex::Regex {
            static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
            RE.get_or_init(|| regex::Regex::new(&$pattern).expect("valid regex pattern"))
        }
    };
}

pub mod analysis;
pub mod annotation;
pub mod disasm;
pub mod editor;
pub mod isa;
pub mod objdump;
pub mod report;
pub mod tasks;
pub mod toolchain;
pub mod usage;
