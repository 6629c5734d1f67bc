//! Control Flow Joins
//!
//! Combines alias graph states of diverging paths (if/else, switch, select,
//! lazy logical operators and loops) and checks that a loop iteration leaves
//! outer variables the way it found them.

use usprache_ast::SrcLoc;

use crate::alias_graph::{AliasGraph, GraphState, NodeId, VariableState};
use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;

/// Outcome of analyzing one branch.
#[derive(Clone, Debug)]
pub struct BranchState {
    /// Graph state at the end of the branch.
    pub state: GraphState,
    /// Whether the branch ends in return, break, continue or halt.
    pub terminal: bool,
}

/// Joins the non-terminal branches of a conditional construct.
///
/// Returns `None` when every branch is terminal, meaning code after the
/// construct is unreachable. A variable moved on some paths only is reported
/// as [`ErrorKind::ConditionalMove`] and considered not moved afterwards.
pub fn merge_branches(
    graph: &AliasGraph,
    branches: Vec<BranchState>,
    diagnostics: &mut Diagnostics,
    loc: SrcLoc,
) -> Option<GraphState> {
    let live: Vec<GraphState> = branches
        .into_iter()
        .filter(|b| !b.terminal)
        .map(|b| b.state)
        .collect();
    match live.len() {
        0 => None,
        1 => live.into_iter().next(),
        n => {
            tracing::debug!(paths = n, %loc, "merge branches");
            let merged = graph.merge(&live, VariableState::Initialized);
            for id in merged.partially_moved {
                if graph.is_root_variable(id) {
                    diagnostics.report(
                        ErrorKind::ConditionalMove(graph.name(id).to_string()),
                        loc,
                    );
                }
            }
            Some(merged.state)
        }
    }
}

/// Break and continue states collected while analyzing a loop body.
#[derive(Debug)]
pub struct LoopFrame {
    /// Scope depth of the loop body; jumps destroy everything at or below it.
    pub scope_depth: usize,
    pub breaks: Vec<GraphState>,
    pub continues: Vec<GraphState>,
}

impl LoopFrame {
    pub fn new(scope_depth: usize) -> Self {
        Self {
            scope_depth,
            breaks: Vec::new(),
            continues: Vec::new(),
        }
    }
}

/// State after a loop: the union of every way out of it. Variables moved on
/// some exits only remain moved, since code after the loop cannot rely on them.
pub fn merge_loop_exits(graph: &AliasGraph, exits: &[GraphState]) -> Option<GraphState> {
    match exits.len() {
        0 => None,
        1 => Some(exits[0].clone()),
        n => {
            tracing::debug!(paths = n, "merge loop exits");
            Some(graph.merge(exits, VariableState::Moved).state)
        }
    }
}

/// Compares the state at the end of one iteration with the state at loop
/// entry. Outer variables must not be moved, and, when `check_pollution` is
/// set, must not have gained new inner references.
pub fn check_loop_iteration(
    graph: &AliasGraph,
    before: &GraphState,
    after: &GraphState,
    check_pollution: bool,
    diagnostics: &mut Diagnostics,
    loc: SrcLoc,
) {
    for (id, state_before) in before.iter() {
        if !graph.is_root_variable(id) {
            continue;
        }
        let Some(state_after) = after.get(id) else {
            continue;
        };
        if state_before.state != VariableState::Moved && state_after.state == VariableState::Moved {
            diagnostics.report(
                ErrorKind::OuterVariableMoveInsideLoop(graph.name(id).to_string()),
                loc,
            );
        }
        if !check_pollution {
            continue;
        }
        for &inner in graph.inner_nodes(id) {
            let old_targets: Vec<NodeId> = before
                .get(inner)
                .map(|s| s.outgoing.iter().map(|e| e.node).collect())
                .unwrap_or_default();
            let Some(new_state) = after.get(inner) else {
                continue;
            };
            for edge in &new_state.outgoing {
                if !old_targets.contains(&edge.node) {
                    diagnostics.report(
                        ErrorKind::ReferencePollutionOfOuterLoopVariable(
                            graph.name(id).to_string(),
                            graph.name(edge.node).to_string(),
                        ),
                        loc,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usprache_ast::Mutability;

    fn codes(d: &Diagnostics) -> Vec<&'static str> {
        d.errors().iter().map(|e| e.code()).collect()
    }

    #[test]
    fn test_all_terminal_branches_are_unreachable() {
        let g = AliasGraph::new();
        let mut d = Diagnostics::new();
        let branches = vec![
            BranchState { state: g.snapshot(), terminal: true },
            BranchState { state: g.snapshot(), terminal: true },
        ];
        assert!(merge_branches(&g, branches, &mut d, SrcLoc::at(1, 1)).is_none());
    }

    #[test]
    fn test_terminal_branch_does_not_cause_conditional_move() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let base = g.snapshot();
        g.set_variable_state(x, VariableState::Moved);
        let moved = g.snapshot();
        let mut d = Diagnostics::new();
        let merged = merge_branches(
            &g,
            vec![
                BranchState { state: moved, terminal: true },
                BranchState { state: base, terminal: false },
            ],
            &mut d,
            SrcLoc::at(1, 1),
        )
        .unwrap();
        assert!(d.is_empty());
        assert_eq!(merged.get(x).map(|s| s.state), Some(VariableState::Initialized));
    }

    #[test]
    fn test_conditional_move_reported_for_whole_variables_only() {
        let mut g = AliasGraph::new();
        let s = g.add_variable("s", &[Mutability::Imut], VariableState::Initialized);
        g.child(s, 0, "s.f", &[]);
        let base = g.snapshot();
        g.set_variable_state(s, VariableState::Moved);
        let moved = g.snapshot();
        let mut d = Diagnostics::new();
        merge_branches(
            &g,
            vec![
                BranchState { state: moved, terminal: false },
                BranchState { state: base, terminal: false },
            ],
            &mut d,
            SrcLoc::at(7, 3),
        );
        assert_eq!(codes(&d), vec!["ConditionalMove"]);
        assert_eq!(d.errors()[0].src_loc, SrcLoc::at(7, 3));
    }

    #[test]
    fn test_loop_exit_keeps_possible_moves() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let before = g.snapshot();
        g.set_variable_state(x, VariableState::Moved);
        let broke = g.snapshot();
        let merged = merge_loop_exits(&g, &[before, broke]).unwrap();
        assert_eq!(merged.get(x).map(|s| s.state), Some(VariableState::Moved));
    }

    #[test]
    fn test_iteration_check_finds_moves_and_pollution() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let y = g.add_variable("y", &[], VariableState::Initialized);
        let s = g.add_variable("s", &[Mutability::Imut], VariableState::Initialized);
        let before = g.snapshot();
        g.set_variable_state(x, VariableState::Moved);
        g.add_edge(y, g.inner_nodes(s)[0], Mutability::Imut);
        let after = g.snapshot();

        let mut d = Diagnostics::new();
        check_loop_iteration(&g, &before, &after, true, &mut d, SrcLoc::at(1, 1));
        assert_eq!(
            codes(&d),
            vec!["OuterVariableMoveInsideLoop", "ReferencePollutionOfOuterLoopVariable"]
        );
        assert_eq!(
            d.errors()[1].kind,
            ErrorKind::ReferencePollutionOfOuterLoopVariable("s".into(), "y".into())
        );

        let mut quiet = Diagnostics::new();
        check_loop_iteration(&g, &before, &after, false, &mut quiet, SrcLoc::at(1, 1));
        assert_eq!(codes(&quiet), vec!["OuterVariableMoveInsideLoop"]);
    }
}
