#![forbid(unsafe_code)]

use usprache_ast::SrcLoc;

use crate::alias_graph::{AliasGraph, NodeId};
use crate::diagnostics::Diagnostics;
use crate::variables;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    /// Local storage, including value params.
    Value,
    /// Named reference, including reference params.
    Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub node: NodeId,
    pub kind: BindingKind,
    pub mutable: bool,
    /// Declared in the body rather than received as a param.
    pub local: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Function,
    Block,
    LoopBody,
}

#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    names: Vec<(String, Binding)>,
    /// Nodes destroyed when the scope ends, in declaration order.
    owned: Vec<NodeId>,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            names: Vec::new(),
            owned: Vec::new(),
        }
    }

    pub fn owned(&self) -> &[NodeId] {
        &self.owned
    }
}

#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ScopeKind) {
        self.scopes.push(Scope::new(kind));
    }

    pub fn pop(&mut self) -> Option<Scope> {
        self.scopes.pop()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Binds a name in the innermost scope. Owned bindings die with the scope.
    pub fn declare(&mut self, name: &str, binding: Binding, owned: bool) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.push((name.to_string(), binding));
            if owned {
                scope.owned.push(binding.node);
            }
        }
    }

    /// Keeps an unnamed node alive until the innermost scope ends.
    pub fn own(&mut self, node: NodeId) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.owned.push(node);
        }
    }

    /// Innermost binding of `name`.
    pub fn lookup(&self, name: &str) -> Option<Binding> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|s| s.names.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, b)| *b)
    }

    /// Every visible binding, innermost first.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, Binding)> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|s| s.names.iter().rev())
            .map(|(n, b)| (n.as_str(), *b))
    }

    /// Owned nodes of scopes at `depth` and deeper, innermost last-declared
    /// first.
    pub fn owned_from(&self, depth: usize) -> Vec<NodeId> {
        self.scopes
            .iter()
            .skip(depth)
            .rev()
            .flat_map(|s| s.owned.iter().rev().copied())
            .collect()
    }
}

/// Destroys the nodes of a finished scope in reverse declaration order.
pub fn destroy_scope(graph: &mut AliasGraph, scope: &Scope, diagnostics: &mut Diagnostics, loc: SrcLoc) {
    for &node in scope.owned.iter().rev() {
        variables::destroy(graph, node, diagnostics, loc);
    }
}

/// Destroys everything owned by scopes from `depth` inward without popping
/// them, for jumps leaving those scopes.
pub fn destroy_scopes_from(
    graph: &mut AliasGraph,
    scopes: &ScopeStack,
    depth: usize,
    diagnostics: &mut Diagnostics,
    loc: SrcLoc,
) {
    for node in scopes.owned_from(depth) {
        variables::destroy(graph, node, diagnostics, loc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alias_graph::VariableState;

    fn value(node: NodeId) -> Binding {
        Binding {
            node,
            kind: BindingKind::Value,
            mutable: true,
            local: true,
        }
    }

    #[test]
    fn test_lookup_prefers_innermost() {
        let mut g = AliasGraph::new();
        let outer = g.add_variable("x", &[], VariableState::Initialized);
        let inner = g.add_variable("x", &[], VariableState::Initialized);
        let mut s = ScopeStack::new();
        s.push(ScopeKind::Function);
        s.declare("x", value(outer), true);
        s.push(ScopeKind::Block);
        s.declare("x", value(inner), true);
        assert_eq!(s.lookup("x").map(|b| b.node), Some(inner));
        s.pop();
        assert_eq!(s.lookup("x").map(|b| b.node), Some(outer));
        assert_eq!(s.lookup("y"), None);
    }

    #[test]
    fn test_owned_from_orders_innermost_last_first() {
        let mut g = AliasGraph::new();
        let a = g.add_variable("a", &[], VariableState::Initialized);
        let b = g.add_variable("b", &[], VariableState::Initialized);
        let c = g.add_variable("c", &[], VariableState::Initialized);
        let mut s = ScopeStack::new();
        s.push(ScopeKind::Function);
        s.declare("a", value(a), true);
        s.push(ScopeKind::LoopBody);
        s.declare("b", value(b), true);
        s.own(c);
        assert_eq!(s.owned_from(1), vec![c, b]);
        assert_eq!(s.owned_from(0), vec![c, b, a]);
    }

    #[test]
    fn test_destroy_scope_reports_live_references() {
        let mut g = AliasGraph::new();
        let x = g.add_variable("x", &[], VariableState::Initialized);
        let r = g.add_reference("r", usprache_ast::Mutability::Imut);
        g.try_add_edge(x, r, usprache_ast::Mutability::Imut).unwrap();

        let mut s = ScopeStack::new();
        s.push(ScopeKind::Function);
        s.declare("r", Binding { node: r, kind: BindingKind::Reference, mutable: false, local: true }, true);
        s.push(ScopeKind::Block);
        s.declare("x", value(x), true);
        let scope = s.pop().unwrap();

        let mut d = Diagnostics::new();
        destroy_scope(&mut g, &scope, &mut d, SrcLoc::at(4, 1));
        assert_eq!(d.errors()[0].code(), "DestroyedVariableStillHasReferences");
        assert!(!g.is_live(x));
    }
}
