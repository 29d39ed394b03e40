//! Call-graph editor: applies resolved annotations to the function map.

use std::collections::BTreeSet;

use tracing::debug;

use crate::model::{Callsite, FunctionMap};
use crate::services::annotation::ResolvedAnnotation;

/// Apply `add` edges, drop short remove paths and eliminated indirect
/// callsites, and return the remove paths the usage engine still has to
/// honor.
///
/// Remove paths of one or two functions are enforced here by deleting
/// callsites. Longer paths are kept only if every edge along them still
/// exists after editing.
pub fn apply_annotations(
    functions: &mut FunctionMap,
    resolved: &ResolvedAnnotation,
) -> Vec<Vec<u64>> {
    apply_edits(functions, &resolved.add_edges, &resolved.remove_paths, &resolved.eliminated)
}

pub fn apply_edits(
    functions: &mut FunctionMap,
    add_edges: &BTreeSet<(u64, u64)>,
    remove_paths: &[Vec<u64>],
    eliminated: &BTreeSet<u64>,
) -> Vec<Vec<u64>> {
    for &(caller, callee) in add_edges {
        if let Some(function) = functions.get_mut(&caller) {
            function.callsites.push(Callsite::annotated(callee));
        }
    }

    let short_paths: BTreeSet<&[u64]> =
        remove_paths.iter().filter(|path| path.len() <= 2).map(Vec::as_slice).collect();

    let mut edges = BTreeSet::new();
    let mut dropped = 0usize;
    for function in functions.values_mut() {
        let caller = function.address;
        let before = function.callsites.len();
        function.callsites.retain(|callsite| {
            if let Some(callee) = callsite.callee {
                if short_paths.contains([callee].as_slice())
                    || short_paths.contains([caller, callee].as_slice())
                {
                    return false;
                }
            }
            let eliminated_here =
                callsite.address.is_some_and(|address| eliminated.contains(&address));
            !(callsite.is_indirect() && eliminated_here)
        });
        dropped += before - function.callsites.len();
        edges.extend(
            function
                .callsites
                .iter()
                .filter_map(|callsite| callsite.callee)
                .map(|callee| (caller, callee)),
        );
    }

    let remaining: Vec<Vec<u64>> = remove_paths
        .iter()
        .filter(|path| path.len() >= 3)
        .filter(|path| path.windows(2).all(|pair| edges.contains(&(pair[0], pair[1]))))
        .cloned()
        .collect();

    debug!(added = add_edges.len(), dropped, remaining = remaining.len(), "edited call graph");
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Function;

    #[test]
    fn applies_edges_and_simple_removals() {
        let mut functions = FunctionMap::new();
        functions.insert(
            0x1000,
            Function::new(
                0x1000,
                "hook_task",
                0,
                vec![Callsite::direct(0x1002, 0x1000, false).with_callee(Some(0x1000))],
            ),
        );
        functions.insert(
            0x2000,
            Function::new(
                0x2000,
                "console_task",
                0,
                vec![
                    Callsite::direct(0x2002, 0x1000, false).with_callee(Some(0x1000)),
                    Callsite::indirect(0x2006, true),
                ],
            ),
        );
        functions.insert(0x4000, Function::new(0x4000, "touchpad_calc", 0, Vec::new()));

        let add_edges = BTreeSet::from([
            (0x2000, 0x2000),
            (0x2000, 0x4000),
            (0x4000, 0x1000),
            (0x4000, 0x2000),
        ]);
        let remove_paths = vec![
            vec![0x1000],
            vec![0x2000, 0x2000],
            vec![0x4000, 0x1000],
            vec![0x2000, 0x4000, 0x2000],
            vec![0x4000, 0x1000, 0x4000],
        ];
        let eliminated = BTreeSet::from([0x2006]);

        let remaining = apply_edits(&mut functions, &add_edges, &remove_paths, &eliminated);

        assert!(functions[&0x1000].callsites.is_empty());
        assert_eq!(functions[&0x2000].callsites, vec![Callsite::annotated(0x4000)]);
        assert_eq!(functions[&0x4000].callsites, vec![Callsite::annotated(0x2000)]);
        assert_eq!(remaining, vec![vec![0x2000, 0x4000, 0x2000]]);
    }

    #[test]
    fn unresolved_indirect_callsites_survive() {
        let mut functions = FunctionMap::new();
        functions.insert(
            0x1000,
            Function::new(
                0x1000,
                "f",
                0,
                vec![Callsite::indirect(0x1002, false), Callsite::direct(0x1006, 0xdead, true)],
            ),
        );

        let remove_paths = [vec![0x1000, 0x2000, 0x3000]];
        let remaining =
            apply_edits(&mut functions, &BTreeSet::new(), &remove_paths, &BTreeSet::new());

        assert_eq!(functions[&0x1000].callsites.len(), 2);
        assert!(remaining.is_empty());
    }
}
