//! Core data model (IR) for the stack analysis.
//!
//! - `Symbol`: one row of the image's symbol table.
//! - `Callsite` / `Function`: the call graph, stored as an address-keyed arena.
//! - `Task`: a scheduler task whose entry routine is analyzed.
//!
//! Callsites refer to their callee by address, never by reference, so the
//! (usually cyclic) call graph can live in a single `FunctionMap`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of a symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Data object (`O` in the symbol table).
    Object,
    /// Function (`F` in the symbol table).
    Function,
}

/// Symbol table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub address: u64,
    pub kind: SymbolKind,
    pub size: u64,
    pub name: String,
}

impl Symbol {
    pub fn new(address: u64, kind: SymbolKind, size: u64, name: impl Into<String>) -> Self {
        Self { address, kind, size, name: name.into() }
    }

    pub fn function(address: u64, size: u64, name: impl Into<String>) -> Self {
        Self::new(address, SymbolKind::Function, size, name)
    }

    pub fn object(address: u64, size: u64, name: impl Into<String>) -> Self {
        Self::new(address, SymbolKind::Object, size, name)
    }

    pub fn is_function(&self) -> bool {
        self.kind == SymbolKind::Function
    }

    /// End bound of the symbol, if its size is known.
    pub fn end(&self) -> Option<u64> {
        if self.size > 0 {
            Some(self.address + self.size)
        } else {
            None
        }
    }

    /// True if `target` lies strictly after the entry point and before the end.
    ///
    /// Unknown-size symbols contain nothing.
    pub fn strictly_contains(&self, target: u64) -> bool {
        match self.end() {
            Some(end) => self.address < target && target < end,
            None => false,
        }
    }
}

/// A point in a function that may transfer control to another function.
///
/// At least one of `address` / `target` is always present: disassembled
/// callsites carry an address, annotation edges carry only a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callsite {
    pub address: Option<u64>,
    pub target: Option<u64>,
    pub is_tail: bool,
    /// Address of the resolved callee in the `FunctionMap`.
    pub callee: Option<u64>,
}

impl Callsite {
    /// Direct call or jump with an immediate target.
    pub fn direct(address: u64, target: u64, is_tail: bool) -> Self {
        Self { address: Some(address), target: Some(target), is_tail, callee: None }
    }

    /// Call or jump through a register; the target is unknown.
    pub fn indirect(address: u64, is_tail: bool) -> Self {
        Self { address: Some(address), target: None, is_tail, callee: None }
    }

    /// Edge injected by an `add` annotation. It has no instruction behind it.
    pub fn annotated(callee: u64) -> Self {
        Self { address: None, target: Some(callee), is_tail: false, callee: Some(callee) }
    }

    pub fn with_callee(mut self, callee: Option<u64>) -> Self {
        self.callee = callee;
        self
    }

    /// Target-less callsite that static analysis could not follow.
    pub fn is_indirect(&self) -> bool {
        self.target.is_none()
    }
}

/// A function recovered from the disassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub address: u64,
    pub name: String,
    /// Bytes of stack the function itself allocates.
    pub stack_frame: u64,
    pub callsites: Vec<Callsite>,
    /// Worst-case stack usage, filled in by the usage engine.
    pub stack_max_usage: Option<u64>,
    /// Function addresses along the worst-case path, starting at this function.
    pub stack_max_path: Option<Vec<u64>>,
}

impl Function {
    pub fn new(
        address: u64,
        name: impl Into<String>,
        stack_frame: u64,
        callsites: Vec<Callsite>,
    ) -> Self {
        Self {
            address,
            name: name.into(),
            stack_frame,
            callsites,
            stack_max_usage: None,
            stack_max_path: None,
        }
    }
}

/// Address-keyed arena of every function in the image.
///
/// Ordered by address so every traversal and report is deterministic.
pub type FunctionMap = BTreeMap<u64, Function>;

/// Scheduler task with its entry routine and allocated stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub routine_name: String,
    pub stack_max_size: u64,
    pub routine_address: Option<u64>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        routine_name: impl Into<String>,
        stack_max_size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            routine_name: routine_name.into(),
            stack_max_size,
            routine_address: None,
        }
    }

    pub fn with_routine_address(mut self, address: u64) -> Self {
        self.routine_address = Some(address);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_contains_excludes_entry_and_end() {
        let sym = Symbol::function(0x10, 0x100, "foo");
        assert!(!sym.strictly_contains(0x10));
        assert!(sym.strictly_contains(0x11));
        assert!(sym.strictly_contains(0x10f));
        assert!(!sym.strictly_contains(0x110));
    }

    #[test]
    fn zero_size_symbol_contains_nothing() {
        let sym = Symbol::function(0x10, 0, "foo");
        assert_eq!(sym.end(), None);
        assert!(!sym.strictly_contains(0x11));
    }

    #[test]
    fn annotated_callsite_is_resolved_and_not_indirect() {
        let site = Callsite::annotated(0x2000);
        assert_eq!(site.address, None);
        assert_eq!(site.callee, Some(0x2000));
        assert!(!site.is_indirect());
        assert!(Callsite::indirect(0x1002, true).is_indirect());
    }
}
