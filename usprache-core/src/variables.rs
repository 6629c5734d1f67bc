#![forbid(unsafe_code)]

//! Variable lifecycle: access, move and destruction.

use usprache_ast::{Mutability, SrcLoc};

use crate::alias_graph::{AliasGraph, NodeId, NodeKind, VariableState};
use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;

/// Reports access through a moved variable. Returns whether the access is
/// to live storage.
pub fn check_accessible(
    graph: &AliasGraph,
    node: NodeId,
    diagnostics: &mut Diagnostics,
    loc: SrcLoc,
) -> bool {
    let root = graph.root(node);
    if graph.variable_state(root) == Some(VariableState::Moved) {
        diagnostics.report(
            ErrorKind::AccessingMovedVariable(graph.name(root).to_string()),
            loc,
        );
        return false;
    }
    true
}

/// Marks storage as written.
pub fn mark_initialized(graph: &mut AliasGraph, node: NodeId) {
    let root = graph.root(node);
    if graph.variable_state(root) == Some(VariableState::Uninitialized) {
        graph.set_variable_state(root, VariableState::Initialized);
    }
}

/// Moves a whole variable into a fresh temporary value.
///
/// The references held by the variable go with the value. Returns `None`
/// when the move is rejected; the variable then keeps its state.
pub fn move_out(
    graph: &mut AliasGraph,
    variable: NodeId,
    diagnostics: &mut Diagnostics,
    loc: SrcLoc,
) -> Option<NodeId> {
    let name = graph.name(variable).to_string();
    match graph.variable_state(variable) {
        Some(VariableState::Moved) => {
            diagnostics.report(ErrorKind::AccessingMovedVariable(name), loc);
            return None;
        }
        None => return None,
        _ => {}
    }
    if graph.has_references(variable) {
        diagnostics.report(ErrorKind::MovedVariableHasReferences(name), loc);
        return None;
    }

    let tags: Vec<Mutability> = graph
        .inner_nodes(variable)
        .iter()
        .map(|n| match graph.kind(*n) {
            NodeKind::Reference(m) => m,
            NodeKind::Variable => Mutability::Imut,
        })
        .collect();
    let value = graph.add_variable(&name, &tags, VariableState::Initialized);
    graph.transfer_inner(variable, value);
    for inner in graph.inner_nodes(variable).to_vec() {
        graph.bypass(inner);
    }
    graph.set_variable_state(variable, VariableState::Moved);
    tracing::debug!(%name, %loc, "variable moved");
    Some(value)
}

/// Ends the life of a node. Variables still aliased at this point are
/// reported; moved variables have nothing left to check.
pub fn destroy(graph: &mut AliasGraph, node: NodeId, diagnostics: &mut Diagnostics, loc: SrcLoc) {
    if !graph.is_live(node) {
        return;
    }
    if graph.kind(node) == NodeKind::Variable
        && graph.variable_state(node) != Some(VariableState::Moved)
        && graph.has_references(node)
    {
        diagnostics.report(
            ErrorKind::DestroyedVariableStillHasReferences(graph.name(node).to_string()),
            loc,
        );
    }
    graph.remove_node(node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_move_transfers_inner_references() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let s = g.add_variable("s", &[Mutability::Mut], VariableState::Initialized);
        g.add_edge(x, g.inner_nodes(s)[0], Mutability::Mut);

        let mut d = Diagnostics::new();
        let moved = move_out(&mut g, s, &mut d, SrcLoc::at(1, 1)).unwrap();
        assert!(d.is_empty());
        assert_eq!(g.variable_state(s), Some(VariableState::Moved));
        let targets: BTreeSet<_> = g.outgoing(g.inner_nodes(moved)[0]).map(|e| e.node).collect();
        assert_eq!(targets, BTreeSet::from([x]));
        assert_eq!(g.outgoing(g.inner_nodes(s)[0]).count(), 0);

        assert!(!check_accessible(&g, s, &mut d, SrcLoc::at(2, 1)));
        assert!(move_out(&mut g, s, &mut d, SrcLoc::at(3, 1)).is_none());
        let codes: Vec<_> = d.errors().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["AccessingMovedVariable", "AccessingMovedVariable"]);
    }

    #[test]
    fn test_move_of_referenced_variable_is_rejected() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let r = g.add_reference("r", Mutability::Imut);
        g.try_add_edge(x, r, Mutability::Imut).unwrap();
        let mut d = Diagnostics::new();
        assert!(move_out(&mut g, x, &mut d, SrcLoc::at(1, 1)).is_none());
        assert_eq!(d.errors()[0].code(), "MovedVariableHasReferences");
        assert_eq!(g.variable_state(x), Some(VariableState::Initialized));
    }

    #[test]
    fn test_destroying_moved_variable_is_silent() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let mut d = Diagnostics::new();
        move_out(&mut g, x, &mut d, SrcLoc::at(1, 1));
        destroy(&mut g, x, &mut d, SrcLoc::at(2, 1));
        assert!(d.is_empty());
        assert!(!g.is_live(x));
    }

    #[test]
    fn test_first_write_initializes() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Uninitialized);
        let f = g.child(x, 0, "x.f", &[]);
        mark_initialized(&mut g, f);
        assert_eq!(g.variable_state(x), Some(VariableState::Initialized));
    }
}
