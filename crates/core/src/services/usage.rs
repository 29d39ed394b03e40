//! Max-stack-usage engine.
//!
//! Walks the call graph over *states*: a function plus, for every remove
//! path still in play, how long a prefix of that path the current call chain
//! ends with. Reaching the full length of a remove path means the chain is
//! annotated as impossible, so that state contributes nothing.
//!
//! The walk is Tarjan's SCC algorithm driven by an explicit work stack, so
//! deep call graphs never recurse on the host stack. Results are memoized
//! per state, including states inside a cycle; such cycles are reported
//! and the numbers for them are approximate.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::model::FunctionMap;

type Positions = Rc<[usize]>;
type StateId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct State {
    function: u64,
    positions: Positions,
}

/// Advance every remove-path position past `function`.
///
/// Returns `None` if some path is now matched completely.
fn advance_positions(
    remove_paths: &[Vec<u64>],
    positions: &[usize],
    function: u64,
) -> Option<Positions> {
    let mut next = Vec::with_capacity(positions.len());
    for (path, &position) in remove_paths.iter().zip(positions) {
        if path.get(position) == Some(&function) {
            let extended = position + 1;
            if extended == path.len() {
                return None;
            }
            next.push(extended);
        } else {
            next.push(fallback_position(&path[..position], path, function));
        }
    }
    Some(next.into())
}

/// Longest suffix of `matched + [function]` that is also a prefix of `path`.
///
/// Only proper suffixes need checking: the whole sequence is known not to match.
fn fallback_position(matched: &[u64], path: &[u64], function: u64) -> usize {
    let mut suffix = matched.to_vec();
    suffix.push(function);
    (1..suffix.len())
        .map(|offset| suffix.len() - offset)
        .find(|&length| path[..length] == suffix[suffix.len() - length..])
        .unwrap_or(0)
}

struct Frame {
    state: StateId,
    /// Positions handed to callees, `None` if this state is cut off.
    next_positions: Option<Positions>,
    callsite: usize,
    lowlink: usize,
    usage: u64,
    best: Option<StateId>,
    self_loop: bool,
    /// Callee being explored, with whether it is reached by a tail call.
    pending: Option<(StateId, bool)>,
}

#[derive(Default)]
struct Traversal {
    states: Vec<State>,
    ids: HashMap<State, StateId>,
    index: Vec<Option<usize>>,
    on_stack: Vec<bool>,
    done: Vec<Option<(u64, Option<StateId>)>>,
    next_index: usize,
    scc_stack: Vec<StateId>,
    cycles: Vec<Vec<StateId>>,
}

impl Traversal {
    fn intern(&mut self, state: State) -> StateId {
        if let Some(&id) = self.ids.get(&state) {
            return id;
        }
        let id = self.states.len();
        self.states.push(state.clone());
        self.ids.insert(state, id);
        self.index.push(None);
        self.on_stack.push(false);
        self.done.push(None);
        id
    }

    fn enter(
        &mut self,
        functions: &FunctionMap,
        remove_paths: &[Vec<u64>],
        state: StateId,
    ) -> Frame {
        let index = self.next_index;
        self.next_index += 1;
        self.index[state] = Some(index);
        self.scc_stack.push(state);
        self.on_stack[state] = true;

        let State { function, positions } = &self.states[state];
        let next_positions = advance_positions(remove_paths, positions, *function);
        let usage = match (&next_positions, functions.get(function)) {
            (Some(_), Some(f)) => f.stack_frame,
            _ => 0,
        };
        Frame {
            state,
            next_positions,
            callsite: 0,
            lowlink: index,
            usage,
            best: None,
            self_loop: false,
            pending: None,
        }
    }

    /// Fold a finished or in-progress callee into the caller's best usage.
    fn consider(&self, frame: &mut Frame, stack_frame: u64, callee: StateId, is_tail: bool) {
        let Some((sub_usage, _)) = self.done[callee] else {
            return;
        };
        let usage = if is_tail { stack_frame.max(sub_usage) } else { stack_frame + sub_usage };
        if usage > frame.usage {
            frame.usage = usage;
            frame.best = Some(callee);
        }
    }

    /// Close the frame's SCC if it is a root and memoize its result.
    fn leave(&mut self, frame: &Frame) {
        let own_index = self.index[frame.state].unwrap_or_default();
        if frame.lowlink == own_index {
            let mut group = Vec::new();
            while let Some(member) = self.scc_stack.pop() {
                self.on_stack[member] = false;
                if member == frame.state {
                    break;
                }
                group.push(member);
            }
            if !group.is_empty() || frame.self_loop {
                group.push(frame.state);
                self.cycles.push(group);
            }
        }
        self.done[frame.state] = Some((frame.usage, frame.best));
    }

    fn max_path(&self, start: StateId) -> Vec<u64> {
        let mut path = vec![self.states[start].function];
        let mut next = self.done[start].and_then(|(_, best)| best);
        while let Some(state) = next {
            path.push(self.states[state].function);
            next = self.done[state].and_then(|(_, best)| best);
        }
        path
    }
}

/// Compute `stack_max_usage` and `stack_max_path` for every function.
///
/// `remove_paths` are the paths left over by the call-graph editor. Returns
/// the distinct sets of functions that form call cycles.
pub fn analyze_call_graph(
    functions: &mut FunctionMap,
    remove_paths: &[Vec<u64>],
) -> Vec<BTreeSet<u64>> {
    let initial: Positions = vec![0; remove_paths.len()].into();
    let mut traversal = Traversal::default();
    let mut results: Vec<(u64, u64, Vec<u64>)> = Vec::new();
    let mut finished: BTreeSet<u64> = BTreeSet::new();

    let roots: Vec<u64> = functions.keys().copied().collect();
    for root in roots {
        if finished.contains(&root) {
            continue;
        }
        let root_state = traversal.intern(State { function: root, positions: Rc::clone(&initial) });
        if traversal.index[root_state].is_some() {
            continue;
        }

        let mut stack = vec![traversal.enter(functions, remove_paths, root_state)];
        while let Some(mut frame) = stack.pop() {
            let function = &functions[&traversal.states[frame.state].function];

            if let Some((child, is_tail)) = frame.pending.take() {
                traversal.consider(&mut frame, function.stack_frame, child, is_tail);
            }

            let mut descend = None;
            if let Some(next_positions) = frame.next_positions.clone() {
                while frame.callsite < function.callsites.len() {
                    let callsite = &function.callsites[frame.callsite];
                    frame.callsite += 1;
                    let Some(callee) =
                        callsite.callee.filter(|callee| functions.contains_key(callee))
                    else {
                        continue;
                    };
                    let successor = traversal
                        .intern(State { function: callee, positions: Rc::clone(&next_positions) });
                    match traversal.index[successor] {
                        None => {
                            frame.pending = Some((successor, callsite.is_tail));
                            descend = Some(successor);
                            break;
                        }
                        Some(index) if traversal.on_stack[successor] => {
                            frame.lowlink = frame.lowlink.min(index);
                            if successor == frame.state {
                                frame.self_loop = true;
                            }
                        }
                        Some(_) => {}
                    }
                    traversal.consider(
                        &mut frame,
                        function.stack_frame,
                        successor,
                        callsite.is_tail,
                    );
                }
            }

            if let Some(child) = descend {
                stack.push(frame);
                let child_frame = traversal.enter(functions, remove_paths, child);
                stack.push(child_frame);
                continue;
            }

            traversal.leave(&frame);
            if traversal.states[frame.state].positions.iter().all(|&p| p == 0) {
                let address = function.address;
                trace!(address, usage = frame.usage, "function usage settled");
                results.push((address, frame.usage, traversal.max_path(frame.state)));
                finished.insert(address);
            }
            if let Some(parent) = stack.last_mut() {
                parent.lowlink = parent.lowlink.min(frame.lowlink);
            }
        }
    }

    for (address, usage, path) in results {
        if let Some(function) = functions.get_mut(&address) {
            function.stack_max_usage = Some(usage);
            function.stack_max_path = Some(path);
        }
    }

    let mut cycles: Vec<BTreeSet<u64>> = Vec::new();
    for group in &traversal.cycles {
        let cycle: BTreeSet<u64> =
            group.iter().map(|&state| traversal.states[state].function).collect();
        if !cycles.contains(&cycle) {
            cycles.push(cycle);
        }
    }
    debug!(states = traversal.states.len(), cycles = cycles.len(), "analyzed call graph");
    cycles
}
