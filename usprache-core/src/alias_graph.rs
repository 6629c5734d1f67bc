#![forbid(unsafe_code)]

//! Alias graph of one function body.
//!
//! Nodes are variables (storage) and references. An edge goes from a
//! reference to the node it aliases. Node identity lives in an append-only
//! arena; the mutable part (lifecycle and edges) is a [`GraphState`] that can
//! be snapshotted and restored around branches.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use usprache_ast::Mutability;

use crate::tags::tag_letter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Variable,
    Reference(Mutability),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VariableState {
    Uninitialized,
    #[default]
    Initialized,
    Moved,
}

#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    /// Sub-object parent and the parent tag of each of this node's tags.
    pub parent: Option<(NodeId, Vec<usize>)>,
    /// Variable holding this inner reference node.
    pub owner: Option<NodeId>,
    /// Inner reference nodes, one per tag of the variable's type.
    pub inner: Vec<NodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub node: NodeId,
    pub mutability: Mutability,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeState {
    pub state: VariableState,
    /// References aliasing this node.
    pub incoming: BTreeSet<Edge>,
    /// Nodes this reference aliases.
    pub outgoing: BTreeSet<Edge>,
}

/// Lifecycle and edges of every live node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphState {
    nodes: BTreeMap<NodeId, NodeState>,
}

impl GraphState {
    pub fn get(&self, id: NodeId) -> Option<&NodeState> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeState)> {
        self.nodes.iter().map(|(id, s)| (*id, s))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Result of joining control-flow paths.
#[derive(Debug)]
pub struct MergedState {
    pub state: GraphState,
    /// Nodes moved on some paths only.
    pub partially_moved: Vec<NodeId>,
}

/// Returned when an edge would break the "one mutable or many immutable"
/// rule. Carries the name of the protected node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtectionViolation {
    pub name: String,
}

#[derive(Debug, Default)]
pub struct AliasGraph {
    infos: Vec<NodeInfo>,
    children: HashMap<(NodeId, usize), NodeId>,
    children_of: HashMap<NodeId, Vec<NodeId>>,
    state: GraphState,
}

impl AliasGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, info: NodeInfo, state: VariableState) -> NodeId {
        let id = NodeId(self.infos.len() as u32);
        self.infos.push(info);
        self.state.nodes.insert(
            id,
            NodeState {
                state,
                ..NodeState::default()
            },
        );
        id
    }

    /// Adds a variable with one inner reference node per tag.
    pub fn add_variable(
        &mut self,
        name: &str,
        tags: &[Mutability],
        state: VariableState,
    ) -> NodeId {
        let id = self.push(
            NodeInfo {
                name: name.to_string(),
                kind: NodeKind::Variable,
                parent: None,
                owner: None,
                inner: Vec::new(),
            },
            state,
        );
        let inner = tags
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                self.push(
                    NodeInfo {
                        name: format!("{name}'{}", tag_letter(i)),
                        kind: NodeKind::Reference(m),
                        parent: None,
                        owner: Some(id),
                        inner: Vec::new(),
                    },
                    VariableState::Initialized,
                )
            })
            .collect();
        self.infos[id.index()].inner = inner;
        tracing::trace!(?id, name, tags = tags.len(), "add variable node");
        id
    }

    pub fn add_reference(&mut self, name: &str, mutability: Mutability) -> NodeId {
        let id = self.push(
            NodeInfo {
                name: name.to_string(),
                kind: NodeKind::Reference(mutability),
                parent: None,
                owner: None,
                inner: Vec::new(),
            },
            VariableState::Initialized,
        );
        tracing::trace!(?id, name, %mutability, "add reference node");
        id
    }

    /// Node of a sub-object, created on first access.
    pub fn child(&mut self, parent: NodeId, member: usize, name: &str, tag_map: &[usize]) -> NodeId {
        let id = match self.children.get(&(parent, member)) {
            Some(&id) => id,
            None => {
                let kind = self.infos[parent.index()].kind;
                let id = NodeId(self.infos.len() as u32);
                self.infos.push(NodeInfo {
                    name: name.to_string(),
                    kind,
                    parent: Some((parent, tag_map.to_vec())),
                    owner: None,
                    inner: Vec::new(),
                });
                self.children.insert((parent, member), id);
                self.children_of.entry(parent).or_default().push(id);
                id
            }
        };
        if !self.state.contains(id) {
            let state = self.variable_state(parent).unwrap_or_default();
            self.state.nodes.insert(
                id,
                NodeState {
                    state,
                    ..NodeState::default()
                },
            );
        }
        id
    }

    pub fn info(&self, id: NodeId) -> &NodeInfo {
        &self.infos[id.index()]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.infos[id.index()].name
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.infos[id.index()].kind
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.state.contains(id)
    }

    /// Whether this is a whole variable rather than a sub-object or an inner
    /// reference node.
    pub fn is_root_variable(&self, id: NodeId) -> bool {
        let info = self.info(id);
        info.kind == NodeKind::Variable && info.parent.is_none() && info.owner.is_none()
    }

    pub fn root(&self, mut id: NodeId) -> NodeId {
        while let Some((parent, _)) = &self.infos[id.index()].parent {
            id = *parent;
        }
        id
    }

    pub fn inner_nodes(&self, id: NodeId) -> &[NodeId] {
        &self.infos[id.index()].inner
    }

    pub fn variable_state(&self, id: NodeId) -> Option<VariableState> {
        self.state.get(id).map(|s| s.state)
    }

    pub fn set_variable_state(&mut self, id: NodeId, state: VariableState) {
        if let Some(s) = self.state.nodes.get_mut(&id) {
            s.state = state;
        }
        for child in self.live_children(id) {
            self.set_variable_state(child, state);
        }
    }

    fn live_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children_of
            .get(&id)
            .map(|c| c.iter().copied().filter(|c| self.is_live(*c)).collect())
            .unwrap_or_default()
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = Edge> + '_ {
        self.state
            .get(id)
            .into_iter()
            .flat_map(|s| s.incoming.iter().copied())
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = Edge> + '_ {
        self.state
            .get(id)
            .into_iter()
            .flat_map(|s| s.outgoing.iter().copied())
    }

    /// Whether references alias this node, one of its sub-objects, or one of
    /// the objects containing it.
    pub fn has_references(&self, id: NodeId) -> bool {
        self.has_edges(id, false)
    }

    pub fn has_mutable_references(&self, id: NodeId) -> bool {
        self.has_edges(id, true)
    }

    fn has_edges(&self, id: NodeId, mutable_only: bool) -> bool {
        let direct = |n: NodeId| {
            self.incoming(n)
                .any(|e| !mutable_only || e.mutability.is_mut())
        };
        if self.has_edges_below(id, &direct) {
            return true;
        }
        let mut current = self.info(id).parent.as_ref().map(|(p, _)| *p);
        while let Some(p) = current {
            if direct(p) {
                return true;
            }
            current = self.info(p).parent.as_ref().map(|(p, _)| *p);
        }
        false
    }

    fn has_edges_below(&self, id: NodeId, direct: &impl Fn(NodeId) -> bool) -> bool {
        direct(id)
            || self
                .live_children(id)
                .into_iter()
                .any(|c| self.has_edges_below(c, direct))
    }

    /// Adds an edge without any check. No-op for dead nodes and self edges.
    pub fn add_edge(&mut self, referent: NodeId, reference: NodeId, mutability: Mutability) {
        if referent == reference || !self.is_live(referent) || !self.is_live(reference) {
            return;
        }
        if let Some(s) = self.state.nodes.get_mut(&referent) {
            s.incoming.insert(Edge {
                node: reference,
                mutability,
            });
        }
        if let Some(s) = self.state.nodes.get_mut(&reference) {
            s.outgoing.insert(Edge {
                node: referent,
                mutability,
            });
        }
        tracing::trace!(?referent, ?reference, %mutability, "add edge");
    }

    /// Adds an edge if it keeps the referent either mutably aliased once or
    /// immutably aliased any number of times. On violation nothing is added.
    pub fn try_add_edge(
        &mut self,
        referent: NodeId,
        reference: NodeId,
        mutability: Mutability,
    ) -> Result<(), ProtectionViolation> {
        let exists = self.state.get(referent).is_some_and(|s| {
            s.incoming.contains(&Edge {
                node: reference,
                mutability,
            })
        });
        if referent == reference || exists {
            return Ok(());
        }
        let conflict = if mutability.is_mut() {
            self.has_references(referent)
        } else {
            self.has_mutable_references(referent)
        };
        if conflict {
            return Err(ProtectionViolation {
                name: self.name(referent).to_string(),
            });
        }
        self.add_edge(referent, reference, mutability);
        Ok(())
    }

    /// Drops all edges of a node, connecting every reference to it directly
    /// to whatever it aliased.
    pub fn bypass(&mut self, id: NodeId) {
        let Some(state) = self.state.nodes.get_mut(&id) else {
            return;
        };
        let incoming = std::mem::take(&mut state.incoming);
        let outgoing = std::mem::take(&mut state.outgoing);
        for e in &incoming {
            if let Some(s) = self.state.nodes.get_mut(&e.node) {
                s.outgoing.retain(|o| o.node != id);
            }
        }
        for e in &outgoing {
            if let Some(s) = self.state.nodes.get_mut(&e.node) {
                s.incoming.retain(|i| i.node != id);
            }
        }
        for r in &incoming {
            for t in &outgoing {
                self.add_edge(t.node, r.node, r.mutability);
            }
        }
    }

    /// Removes a node together with its inner nodes and sub-objects.
    pub fn remove_node(&mut self, id: NodeId) {
        if !self.is_live(id) {
            return;
        }
        for inner in self.info(id).inner.clone() {
            self.remove_node(inner);
        }
        for child in self.live_children(id) {
            self.remove_node(child);
        }
        // References to a sub-object of a reference fall back to the whole
        // referent.
        if let Some((parent, _)) = self.info(id).parent.clone() {
            let targets: Vec<Edge> = self.outgoing(parent).collect();
            let references: Vec<Edge> = self.incoming(id).collect();
            for r in &references {
                for t in &targets {
                    self.add_edge(t.node, r.node, r.mutability);
                }
            }
        }
        self.bypass(id);
        self.state.nodes.remove(&id);
        tracing::trace!(?id, "remove node");
    }

    /// Variables reachable from a node through references.
    pub fn accessible_variables(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        let mut visited = BTreeSet::new();
        self.collect_variables(id, &mut out, &mut visited);
        out
    }

    fn collect_variables(
        &self,
        id: NodeId,
        out: &mut BTreeSet<NodeId>,
        visited: &mut BTreeSet<NodeId>,
    ) {
        if !visited.insert(id) {
            return;
        }
        match self.kind(id) {
            NodeKind::Variable => {
                out.insert(id);
            }
            NodeKind::Reference(_) => {
                let targets: Vec<NodeId> = self.outgoing(id).map(|e| e.node).collect();
                for t in targets {
                    self.collect_variables(t, out, visited);
                }
                if let Some((parent, _)) = &self.info(id).parent {
                    self.collect_variables(*parent, out, visited);
                }
            }
        }
    }

    /// Inner reference nodes holding the references of the given tag of
    /// whatever this node designates.
    pub fn inner_of(&self, id: NodeId, tag: usize) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        let mut visited = BTreeSet::new();
        self.collect_inner(id, tag, &mut out, &mut visited);
        out
    }

    fn collect_inner(
        &self,
        id: NodeId,
        tag: usize,
        out: &mut BTreeSet<NodeId>,
        visited: &mut BTreeSet<(NodeId, usize)>,
    ) {
        if !visited.insert((id, tag)) {
            return;
        }
        let info = self.info(id);
        if let Some((parent, map)) = &info.parent {
            if let Some(&parent_tag) = map.get(tag) {
                self.collect_inner(*parent, parent_tag, out, visited);
            }
            return;
        }
        if info.kind == NodeKind::Variable {
            if let Some(&n) = info.inner.get(tag) {
                out.insert(n);
            }
            return;
        }
        let targets: Vec<NodeId> = self.outgoing(id).map(|e| e.node).collect();
        for t in targets {
            self.collect_inner(t, tag, out, visited);
        }
    }

    /// Copies the references held by `from`'s inner nodes into `to`'s.
    pub fn transfer_inner(&mut self, from: NodeId, to: NodeId) {
        let from_inner = self.info(from).inner.clone();
        let to_inner = self.info(to).inner.clone();
        for (f, t) in from_inner.iter().zip(&to_inner) {
            let targets: Vec<Edge> = self.outgoing(*f).collect();
            for e in targets {
                self.add_edge(e.node, *t, e.mutability);
            }
        }
    }

    pub fn snapshot(&self) -> GraphState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: GraphState) {
        self.state = state;
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Joins the states of several paths. Nodes moved on every path stay
    /// moved; nodes moved on only some get `partial`.
    pub fn merge(&self, paths: &[GraphState], partial: VariableState) -> MergedState {
        let mut merged = GraphState::default();
        let mut partially_moved = Vec::new();
        let ids: BTreeSet<NodeId> = paths.iter().flat_map(|p| p.nodes.keys().copied()).collect();
        for id in ids {
            let present: Vec<&NodeState> = paths.iter().filter_map(|p| p.get(id)).collect();
            let moved = present
                .iter()
                .filter(|s| s.state == VariableState::Moved)
                .count();
            let state = if moved == present.len() {
                VariableState::Moved
            } else if moved > 0 {
                partially_moved.push(id);
                partial
            } else if present.iter().any(|s| s.state == VariableState::Uninitialized) {
                VariableState::Uninitialized
            } else {
                VariableState::Initialized
            };
            let mut node = NodeState {
                state,
                ..NodeState::default()
            };
            for s in present {
                node.incoming.extend(s.incoming.iter().copied());
                node.outgoing.extend(s.outgoing.iter().copied());
            }
            merged.nodes.insert(id, node);
        }
        // Edges to nodes absent from the merged state cannot survive.
        let live: BTreeSet<NodeId> = merged.nodes.keys().copied().collect();
        for node in merged.nodes.values_mut() {
            node.incoming.retain(|e| live.contains(&e.node));
            node.outgoing.retain(|e| live.contains(&e.node));
        }
        MergedState {
            state: merged,
            partially_moved,
        }
    }
}
