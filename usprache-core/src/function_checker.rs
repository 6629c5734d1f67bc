#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use usprache_ast::{
    Block, Expr, ExprKind, FunctionDecl, Initializer, Mutability, ReturnDecl, SrcLoc, Stmt,
    StmtKind, TypeId, TypeTable,
};

use crate::alias_graph::{AliasGraph, NodeId, NodeKind, VariableState};
use crate::config::AnalysisConfig;
use crate::control_flow::{self, BranchState, LoopFrame};
use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::linker::{self, CallArgument, CallResult};
use crate::notation::{FunctionReferenceNotation, ParamReference, ParamTag};
use crate::scopes::{self, Binding, BindingKind, ScopeKind, ScopeStack};
use crate::tags::{ReferenceTag, TagModel};
use crate::variables;

/// Signature data of a function as seen from its callers.
#[derive(Debug)]
pub(crate) struct Callee<'a> {
    pub decl: &'a FunctionDecl,
    pub notation: FunctionReferenceNotation,
}

/// Read-only data shared by every function analysis of a program.
#[derive(Debug)]
pub(crate) struct ProgramContext<'a> {
    pub types: &'a TypeTable,
    pub model: &'a TagModel,
    pub callees: HashMap<&'a str, Callee<'a>>,
    pub config: &'a AnalysisConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flow {
    Continues,
    /// Control never reaches the next statement.
    Terminal,
}

/// What an expression evaluates to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operand {
    /// Named storage or a sub-object of it, including named references.
    Place { node: NodeId, mutable: bool },
    /// Temporary reference produced by the expression.
    Reference(NodeId),
    /// Temporary value.
    Value(NodeId),
    /// Nothing worth tracking.
    Void,
}

/// Walks one function body over an alias graph.
pub(crate) struct FunctionChecker<'a> {
    ctx: &'a ProgramContext<'a>,
    function: &'a FunctionDecl,
    notation: &'a FunctionReferenceNotation,
    graph: AliasGraph,
    scopes: ScopeStack,
    temporaries: Vec<Vec<NodeId>>,
    loops: Vec<LoopFrame>,
    /// Variable node standing for each param: the caller's object for
    /// reference params, the local copy for value params.
    params: Vec<NodeId>,
    /// Synthetic nodes standing for what the caller passed in.
    param_sources: BTreeMap<NodeId, ParamReference>,
    unsafe_depth: usize,
    diagnostics: Diagnostics,
}

impl<'a> FunctionChecker<'a> {
    pub fn new(
        ctx: &'a ProgramContext<'a>,
        function: &'a FunctionDecl,
        notation: &'a FunctionReferenceNotation,
    ) -> Self {
        Self {
            ctx,
            function,
            notation,
            graph: AliasGraph::new(),
            scopes: ScopeStack::new(),
            temporaries: Vec::new(),
            loops: Vec::new(),
            params: Vec::new(),
            param_sources: BTreeMap::new(),
            unsafe_depth: 0,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn check(mut self) -> Diagnostics {
        let function = self.function;
        let Some(body) = &function.body else {
            return self.diagnostics;
        };
        let span = tracing::debug_span!("check_function", name = %function.name);
        let _guard = span.enter();

        self.scopes.push(ScopeKind::Function);
        self.declare_params();
        if self.block(body, ScopeKind::Block) == Flow::Continues {
            self.finish(body.end_loc);
        }
        tracing::debug!(errors = self.diagnostics.len(), "function checked");
        self.diagnostics
    }

    fn tags(&self, ty: TypeId) -> Vec<Mutability> {
        self.ctx.model.tags(ty).to_vec()
    }

    fn declare_params(&mut self) {
        let function = self.function;
        for (index, param) in function.params.iter().enumerate() {
            let tags = self.tags(param.ty);
            let variable = self
                .graph
                .add_variable(&param.name, &tags, VariableState::Initialized);
            for (tag, &mutability) in tags.iter().enumerate() {
                let tag_ref = ReferenceTag::from_index(tag).unwrap_or(ReferenceTag::Continuous);
                let source = self.graph.add_variable(
                    &format!("{}'{}", param.name, tag_ref),
                    &[],
                    VariableState::Initialized,
                );
                self.param_sources
                    .insert(source, ParamReference::inner(index, tag_ref));
                let inner = self.graph.inner_nodes(variable)[tag];
                self.graph.add_edge(source, inner, mutability);
            }
            self.params.push(variable);

            match param.reference {
                Some(mutability) => {
                    self.param_sources
                        .insert(variable, ParamReference::reference(index));
                    let reference = self.graph.add_reference(&param.name, mutability);
                    self.graph.add_edge(variable, reference, mutability);
                    let binding = Binding {
                        node: reference,
                        kind: BindingKind::Reference,
                        mutable: mutability.is_mut(),
                        local: false,
                    };
                    self.scopes.declare(&param.name, binding, false);
                }
                None => {
                    let binding = Binding {
                        node: variable,
                        kind: BindingKind::Value,
                        mutable: param.mutability.is_mut(),
                        local: false,
                    };
                    self.scopes.declare(&param.name, binding, true);
                }
            }
        }
    }

    // Statements

    fn block(&mut self, block: &Block, kind: ScopeKind) -> Flow {
        self.scopes.push(kind);
        if block.is_unsafe {
            self.unsafe_depth += 1;
        }
        let mut flow = Flow::Continues;
        for stmt in &block.stmts {
            if self.statement(stmt) == Flow::Terminal {
                flow = Flow::Terminal;
                break;
            }
        }
        if block.is_unsafe {
            self.unsafe_depth -= 1;
        }
        self.pop_scope(flow, block.end_loc);
        flow
    }

    fn pop_scope(&mut self, flow: Flow, loc: SrcLoc) {
        if let Some(scope) = self.scopes.pop() {
            // After a jump the state is discarded; the jump destroyed the
            // scope's variables itself.
            if flow == Flow::Continues {
                scopes::destroy_scope(&mut self.graph, &scope, &mut self.diagnostics, loc);
            }
        }
    }

    fn statement(&mut self, stmt: &Stmt) -> Flow {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::Var {
                name,
                ty,
                mutability,
                init,
            } => {
                let tags = self.tags(*ty);
                let node = match init {
                    Initializer::Uninitialized => {
                        self.graph
                            .add_variable(name, &tags, VariableState::Uninitialized)
                    }
                    Initializer::Default => {
                        self.graph
                            .add_variable(name, &tags, VariableState::Initialized)
                    }
                    Initializer::Expr(init) => {
                        self.begin_temporaries();
                        let op = self.expr(init);
                        let value = self.value_of(op, init.ty, init.loc);
                        let node = self
                            .graph
                            .add_variable(name, &tags, VariableState::Initialized);
                        self.graph.transfer_inner(value, node);
                        self.end_temporaries(loc);
                        node
                    }
                };
                let binding = Binding {
                    node,
                    kind: BindingKind::Value,
                    mutable: mutability.is_mut(),
                    local: true,
                };
                self.scopes.declare(name, binding, true);
                Flow::Continues
            }
            StmtKind::Ref {
                name,
                mutability,
                init,
                ..
            } => {
                self.begin_temporaries();
                let op = self.expr(init);
                let reference = self.graph.add_reference(name, *mutability);
                self.bind_reference(op, reference, *mutability, init.loc);
                self.end_temporaries(loc);
                let binding = Binding {
                    node: reference,
                    kind: BindingKind::Reference,
                    mutable: mutability.is_mut(),
                    local: true,
                };
                self.scopes.declare(name, binding, true);
                Flow::Continues
            }
            StmtKind::Expr(e) => {
                self.begin_temporaries();
                self.expr(e);
                self.end_temporaries(loc);
                Flow::Continues
            }
            StmtKind::Assign { target, value, op } => {
                self.begin_temporaries();
                self.assign(target, value, op.is_some(), loc);
                self.end_temporaries(loc);
                Flow::Continues
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.condition(cond);
                let base = self.graph.snapshot();
                let mut branches = Vec::with_capacity(2);
                let flow = self.block(then_block, ScopeKind::Block);
                branches.push(self.branch_state(flow));
                self.graph.restore(base);
                let flow = match else_block {
                    Some(block) => self.block(block, ScopeKind::Block),
                    None => Flow::Continues,
                };
                branches.push(self.branch_state(flow));
                let end = else_block.as_ref().unwrap_or(then_block).end_loc;
                self.join(branches, end)
            }
            StmtKind::Switch {
                value,
                cases,
                default,
            } => {
                self.condition(value);
                let base = self.graph.snapshot();
                let mut branches = Vec::with_capacity(cases.len() + 1);
                for case in cases {
                    self.graph.restore(base.clone());
                    let flow = self.block(case, ScopeKind::Block);
                    branches.push(self.branch_state(flow));
                }
                self.graph.restore(base);
                let flow = match default {
                    Some(block) => self.block(block, ScopeKind::Block),
                    None => Flow::Continues,
                };
                branches.push(self.branch_state(flow));
                let end = default.as_ref().or(cases.last()).map_or(loc, |b| b.end_loc);
                self.join(branches, end)
            }
            StmtKind::While { cond, body } => self.run_loop(Some(cond), body),
            StmtKind::Loop(body) => self.run_loop(None, body),
            StmtKind::Break => self.jump(true, loc),
            StmtKind::Continue => self.jump(false, loc),
            StmtKind::Return(value) => {
                self.return_statement(value.as_ref(), loc);
                Flow::Terminal
            }
            StmtKind::Halt => Flow::Terminal,
            StmtKind::Block(block) => self.block(block, ScopeKind::Block),
            StmtKind::With {
                name,
                mutability,
                reference,
                expr,
                body,
            } => self.with_statement(name, *mutability, *reference, expr, body, loc),
            StmtKind::Yield(value) => {
                self.begin_temporaries();
                let function = self.function;
                if let (Some(value), Some(coroutine)) = (value, &function.coroutine) {
                    let op = self.expr(value);
                    let allowed = self.notation.all_return_inner_references();
                    self.check_escape(op, &coroutine.yields, value.ty, &allowed, None, value.loc);
                } else if let Some(value) = value {
                    self.expr(value);
                }
                self.check_suspension(loc);
                self.end_temporaries(loc);
                Flow::Continues
            }
        }
    }

    fn branch_state(&self, flow: Flow) -> BranchState {
        BranchState {
            state: self.graph.snapshot(),
            terminal: flow == Flow::Terminal,
        }
    }

    fn join(&mut self, branches: Vec<BranchState>, loc: SrcLoc) -> Flow {
        match control_flow::merge_branches(&self.graph, branches, &mut self.diagnostics, loc) {
            Some(state) => {
                self.graph.restore(state);
                Flow::Continues
            }
            None => Flow::Terminal,
        }
    }

    fn condition(&mut self, cond: &Expr) {
        self.begin_temporaries();
        let op = self.expr(cond);
        self.value_of(op, cond.ty, cond.loc);
        self.end_temporaries(cond.loc);
    }

    /// Analyzes a loop once. The condition of a `while` is part of every
    /// iteration, and the state right after it is the exit taken when the
    /// condition is false.
    fn run_loop(&mut self, cond: Option<&Expr>, body: &Block) -> Flow {
        let end_loc = body.end_loc;
        let before = self.graph.snapshot();
        let skipped = cond.map(|cond| {
            self.condition(cond);
            self.graph.snapshot()
        });
        self.loops.push(LoopFrame::new(self.scopes.depth()));
        let flow = self.block(body, ScopeKind::LoopBody);
        let Some(frame) = self.loops.pop() else {
            return flow;
        };

        let mut iteration_ends = frame.continues;
        if flow == Flow::Continues {
            iteration_ends.push(self.graph.snapshot());
        }
        let check_pollution = self.ctx.config.check_loop_pollution;
        for end in &iteration_ends {
            control_flow::check_loop_iteration(
                &self.graph,
                &before,
                end,
                check_pollution,
                &mut self.diagnostics,
                end_loc,
            );
        }
        let mut exits = frame.breaks;
        if let Some(skipped) = skipped {
            exits.insert(0, skipped);
        }
        tracing::debug!(exits = exits.len(), %end_loc, "loop analyzed");
        match control_flow::merge_loop_exits(&self.graph, &exits) {
            Some(state) => {
                self.graph.restore(state);
                Flow::Continues
            }
            None => Flow::Terminal,
        }
    }

    fn jump(&mut self, is_break: bool, loc: SrcLoc) -> Flow {
        let Some(depth) = self.loops.last().map(|f| f.scope_depth) else {
            return Flow::Terminal;
        };
        scopes::destroy_scopes_from(
            &mut self.graph,
            &self.scopes,
            depth,
            &mut self.diagnostics,
            loc,
        );
        let state = self.graph.snapshot();
        if let Some(frame) = self.loops.last_mut() {
            if is_break {
                frame.breaks.push(state);
            } else {
                frame.continues.push(state);
            }
        }
        Flow::Terminal
    }

    fn with_statement(
        &mut self,
        name: &str,
        mutability: Mutability,
        reference: bool,
        expr: &Expr,
        body: &Block,
        loc: SrcLoc,
    ) -> Flow {
        self.scopes.push(ScopeKind::Block);
        self.begin_temporaries();
        let op = self.expr(expr);
        let binding = if reference {
            let node = self.graph.add_reference(name, mutability);
            self.bind_reference(op, node, mutability, expr.loc);
            // Temporaries of the expression live as long as the binding.
            for temporary in self.temporaries.pop().unwrap_or_default() {
                self.scopes.own(temporary);
            }
            Binding {
                node,
                kind: BindingKind::Reference,
                mutable: mutability.is_mut(),
                local: true,
            }
        } else {
            let value = self.value_of(op, expr.ty, expr.loc);
            let node = self.graph.add_variable(
                name,
                &self.tags(expr.ty),
                VariableState::Initialized,
            );
            self.graph.transfer_inner(value, node);
            self.end_temporaries(loc);
            Binding {
                node,
                kind: BindingKind::Value,
                mutable: mutability.is_mut(),
                local: true,
            }
        };
        self.scopes.declare(name, binding, true);
        let flow = self.block(body, ScopeKind::Block);
        self.pop_scope(flow, body.end_loc);
        flow
    }

    fn assign(&mut self, target: &Expr, value: &Expr, compound: bool, loc: SrcLoc) {
        let value_op = self.expr(value);
        let value_node = self.value_of(value_op, value.ty, value.loc);
        let target_op = self.expr(target);
        let strong_update = !compound
            && matches!(target_op, Operand::Place { node, .. } if self.graph.is_root_variable(node));
        let target_node = self.reference_to(target_op, Mutability::Mut, target.loc);
        if compound {
            return;
        }
        if let (true, Operand::Place { node: place, .. }) = (strong_update, target_op) {
            // The whole variable is overwritten, its old references are gone.
            for inner in self.graph.inner_nodes(place).to_vec() {
                self.graph.bypass(inner);
            }
        }
        let sources: Vec<NodeId> = self.graph.inner_nodes(value_node).to_vec();
        for (tag, source) in sources.into_iter().enumerate() {
            let targets = self.graph.inner_of(target_node, tag);
            let referents: Vec<(NodeId, Mutability)> = self
                .graph
                .outgoing(source)
                .map(|e| (e.node, e.mutability))
                .collect();
            for dst in targets {
                for &(referent, mutability) in &referents {
                    self.link(referent, dst, mutability, loc);
                }
            }
        }
    }

    fn return_statement(&mut self, value: Option<&Expr>, loc: SrcLoc) {
        self.begin_temporaries();
        if let Some(value) = value {
            let op = self.expr(value);
            let function = self.function;
            if let Some(coroutine) = &function.coroutine {
                let allowed = self.notation.all_return_inner_references();
                self.check_escape(op, &coroutine.yields, value.ty, &allowed, None, value.loc);
            } else if let Some(ret) = &function.ret {
                let notation = self.notation;
                self.check_escape(
                    op,
                    ret,
                    value.ty,
                    &notation.return_references,
                    Some(notation.return_inner_references.as_slice()),
                    value.loc,
                );
            } else {
                self.value_of(op, value.ty, value.loc);
            }
        }
        self.end_temporaries(loc);
        self.finish(loc);
    }

    /// Leaves the function: destroys every live scope, then checks what the
    /// body stored into reference params.
    fn finish(&mut self, loc: SrcLoc) {
        scopes::destroy_scopes_from(&mut self.graph, &self.scopes, 0, &mut self.diagnostics, loc);
        self.check_param_pollution(loc);
    }

    // Escape checks

    fn is_allowed(&self, variable: NodeId, allowed: &BTreeSet<ParamReference>) -> bool {
        let root = self.graph.root(variable);
        let Some(source) = self.param_sources.get(&root) else {
            return false;
        };
        allowed.contains(source)
            || (source.is_inner()
                && allowed.contains(&ParamReference::inner(
                    source.param,
                    ReferenceTag::Continuous,
                )))
    }

    fn reaches_only(&self, node: NodeId, allowed: &BTreeSet<ParamReference>) -> bool {
        self.graph
            .accessible_variables(node)
            .into_iter()
            .all(|v| self.is_allowed(v, allowed))
    }

    /// Checks a value leaving the function through `return` or `yield`.
    /// `inner_allowed` gives per-tag sets for values; `None` applies
    /// `allowed` to every tag.
    fn check_escape(
        &mut self,
        op: Operand,
        decl: &ReturnDecl,
        ty: TypeId,
        allowed: &BTreeSet<ParamReference>,
        inner_allowed: Option<&[BTreeSet<ParamReference>]>,
        loc: SrcLoc,
    ) {
        match decl.reference {
            Some(mutability) => {
                let node = self.reference_to(op, mutability, loc);
                if !self.reaches_only(node, allowed) {
                    self.diagnostics
                        .report(ErrorKind::ReturningUnallowedReference, loc);
                }
            }
            None => {
                let value = self.value_of(op, ty, loc);
                let empty = BTreeSet::new();
                let inner = self.graph.inner_nodes(value).to_vec();
                for (tag, node) in inner.into_iter().enumerate() {
                    let allowed = match inner_allowed {
                        Some(sets) => sets.get(tag).unwrap_or(&empty),
                        None => allowed,
                    };
                    if !self.reaches_only(node, allowed) {
                        self.diagnostics
                            .report(ErrorKind::ReturningUnallowedReference, loc);
                        return;
                    }
                }
            }
        }
    }

    fn pollution_allowed(&self, param: usize, tag: usize, source: ParamReference) -> bool {
        self.notation.pollution.iter().any(|p| {
            let dst_matches = p.dst.param == param
                && match p.dst.tag {
                    ParamTag::Inner(ReferenceTag::Letter(t)) => t as usize == tag,
                    ParamTag::Inner(ReferenceTag::Continuous) => true,
                    ParamTag::Reference => false,
                };
            let src_matches = p.src == source
                || (p.src.param == source.param
                    && p.src.tag == ParamTag::Inner(ReferenceTag::Continuous)
                    && source.is_inner());
            dst_matches && src_matches
        })
    }

    /// Every reference stored into a reference param's inner references must
    /// be licensed by a pollution entry of the notation.
    fn check_param_pollution(&mut self, loc: SrcLoc) {
        let function = self.function;
        for (index, param) in function.params.iter().enumerate() {
            if param.reference.is_none() {
                continue;
            }
            let Some(&variable) = self.params.get(index) else {
                continue;
            };
            let inner = self.graph.inner_nodes(variable).to_vec();
            for (tag, node) in inner.into_iter().enumerate() {
                let own = ParamReference::inner(
                    index,
                    ReferenceTag::from_index(tag).unwrap_or(ReferenceTag::Continuous),
                );
                let polluted = self.graph.accessible_variables(node).into_iter().any(|v| {
                    match self.param_sources.get(&self.graph.root(v)) {
                        Some(source) if *source == own => false,
                        Some(source) => !self.pollution_allowed(index, tag, *source),
                        None => true,
                    }
                });
                if polluted {
                    self.diagnostics
                        .report(ErrorKind::UnallowedReferencePollution, loc);
                }
            }
        }
    }

    /// At a coroutine suspension point every named reference must stay
    /// within locals or params captured by the coroutine object.
    fn check_suspension(&mut self, loc: SrcLoc) {
        if self.function.coroutine.is_none() {
            return;
        }
        let allowed = self.notation.all_return_inner_references();
        let references: Vec<NodeId> = self
            .scopes
            .bindings()
            .filter(|(_, b)| b.kind == BindingKind::Reference && b.local)
            .map(|(_, b)| b.node)
            .collect();
        for reference in references {
            let escapes = self.graph.accessible_variables(reference).into_iter().any(|v| {
                let root = self.graph.root(v);
                self.param_sources.contains_key(&root) && !self.is_allowed(root, &allowed)
            });
            if escapes {
                self.diagnostics
                    .report(ErrorKind::UnallowedReferencePollution, loc);
            }
        }
    }

    // Temporaries

    fn begin_temporaries(&mut self) {
        self.temporaries.push(Vec::new());
    }

    /// Destroys the temporaries of a full expression, newest first.
    fn end_temporaries(&mut self, loc: SrcLoc) {
        let Some(frame) = self.temporaries.pop() else {
            return;
        };
        for node in frame.into_iter().rev() {
            variables::destroy(&mut self.graph, node, &mut self.diagnostics, loc);
        }
    }

    fn temporary(&mut self, node: NodeId) {
        if let Some(frame) = self.temporaries.last_mut() {
            frame.push(node);
        }
    }

    /// Moves a temporary out of the current frame into the innermost scope.
    fn keep_alive(&mut self, node: NodeId) {
        let Some(frame) = self.temporaries.last_mut() else {
            return;
        };
        if let Some(pos) = frame.iter().position(|n| *n == node) {
            frame.remove(pos);
            self.scopes.own(node);
        }
    }

    // Expressions

    fn link(&mut self, referent: NodeId, reference: NodeId, mutability: Mutability, loc: SrcLoc) {
        if let Err(violation) = self.graph.try_add_edge(referent, reference, mutability) {
            if self.unsafe_depth == 0 {
                self.diagnostics
                    .report(ErrorKind::ReferenceProtectionError(violation.name), loc);
            }
        }
    }

    fn new_value(&mut self, name: &str, ty: TypeId) -> NodeId {
        let tags = self.tags(ty);
        let node = self
            .graph
            .add_variable(name, &tags, VariableState::Initialized);
        self.temporary(node);
        node
    }

    /// Temporary reference to whatever the operand designates.
    fn reference_to(&mut self, op: Operand, mutability: Mutability, loc: SrcLoc) -> NodeId {
        match op {
            Operand::Place { node, .. } => {
                let name = self.graph.name(node).to_string();
                let reference = self.graph.add_reference(&name, mutability);
                self.temporary(reference);
                if variables::check_accessible(&self.graph, node, &mut self.diagnostics, loc) {
                    if mutability.is_mut() {
                        variables::mark_initialized(&mut self.graph, node);
                    }
                    self.link(node, reference, mutability, loc);
                }
                reference
            }
            Operand::Reference(node) | Operand::Value(node) => node,
            Operand::Void => {
                let node = self
                    .graph
                    .add_variable("temp", &[], VariableState::Initialized);
                self.temporary(node);
                node
            }
        }
    }

    /// Temporary value holding a copy of the operand.
    fn value_of(&mut self, op: Operand, ty: TypeId, loc: SrcLoc) -> NodeId {
        match op {
            Operand::Value(node) => node,
            Operand::Void => self.new_value("temp", ty),
            Operand::Place { .. } | Operand::Reference(_) => {
                let source = self.reference_to(op, Mutability::Imut, loc);
                let name = self.ctx.types.name(ty).to_string();
                let value = self.new_value(&name, ty);
                let tags = self.tags(ty);
                for (tag, &mutability) in tags.iter().enumerate() {
                    let dst = self.graph.inner_nodes(value)[tag];
                    for referent in self.graph.inner_of(source, tag) {
                        self.link(referent, dst, mutability, loc);
                    }
                }
                value
            }
        }
    }

    /// Points a named reference at the operand. Temporary values bound this
    /// way live until the end of the enclosing scope.
    fn bind_reference(
        &mut self,
        op: Operand,
        reference: NodeId,
        mutability: Mutability,
        loc: SrcLoc,
    ) {
        match op {
            Operand::Place { node, .. } => {
                if !variables::check_accessible(&self.graph, node, &mut self.diagnostics, loc) {
                    return;
                }
                let root = self.graph.root(node);
                self.keep_alive(root);
                if mutability.is_mut() {
                    variables::mark_initialized(&mut self.graph, node);
                }
                self.link(node, reference, mutability, loc);
            }
            Operand::Reference(node) => self.link(node, reference, mutability, loc),
            Operand::Value(node) => {
                self.keep_alive(node);
                self.link(node, reference, mutability, loc);
            }
            Operand::Void => {}
        }
    }

    fn node_of(op: Operand) -> Option<NodeId> {
        match op {
            Operand::Place { node, .. } | Operand::Reference(node) | Operand::Value(node) => {
                Some(node)
            }
            Operand::Void => None,
        }
    }

    fn expr(&mut self, e: &Expr) -> Operand {
        match &e.kind {
            ExprKind::Literal => Operand::Void,
            ExprKind::Name(name) => match self.scopes.lookup(name) {
                Some(binding) => Operand::Place {
                    node: binding.node,
                    mutable: binding.mutable,
                },
                None => Operand::Void,
            },
            ExprKind::Field { base, field } => self.field(base, *field, e.loc),
            ExprKind::TupleElement { base, index } => {
                let base_op = self.expr(base);
                let tags = self.ctx.model.member_tags(base.ty, *index).to_vec();
                self.member(base_op, *index, &format!("{}", index), &tags, e.loc)
            }
            ExprKind::Index { base, index } => {
                let base_op = self.expr(base);
                let index_op = self.expr(index);
                self.value_of(index_op, index.ty, index.loc);
                base_op
            }
            ExprKind::Call { function, args } => self.call(function, args, e.loc),
            ExprKind::StructInit(fields) => self.struct_init(e.ty, fields, e.loc),
            ExprKind::TupleInit(elements) => {
                let name = self.ctx.types.name(e.ty).to_string();
                let value = self.new_value(&name, e.ty);
                for (index, element) in elements.iter().enumerate() {
                    let tags = self.ctx.model.member_tags(e.ty, index).to_vec();
                    self.store_member(value, element, &tags);
                }
                Operand::Value(value)
            }
            ExprKind::ArrayInit(elements) => {
                let name = self.ctx.types.name(e.ty).to_string();
                let value = self.new_value(&name, e.ty);
                let tags: Vec<usize> = (0..self.graph.inner_nodes(value).len()).collect();
                for element in elements {
                    self.store_member(value, element, &tags);
                }
                Operand::Value(value)
            }
            ExprKind::Move(name) => self.move_variable(name, e.loc),
            ExprKind::Take(operand) => match &operand.kind {
                ExprKind::Name(name) => self.move_variable(name, e.loc),
                _ => {
                    self.expr(operand);
                    self.diagnostics
                        .report(ErrorKind::ExpectedReferenceValue, e.loc);
                    Operand::Void
                }
            },
            ExprKind::Unary { operand, .. } => {
                let op = self.expr(operand);
                self.value_of(op, operand.ty, operand.loc);
                Operand::Void
            }
            ExprKind::Modify { target, .. } => {
                let op = self.expr(target);
                self.reference_to(op, Mutability::Mut, target.loc);
                Operand::Void
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.expr(lhs);
                self.value_of(l, lhs.ty, lhs.loc);
                if op.is_lazy() {
                    let skipped = self.graph.snapshot();
                    let r = self.expr(rhs);
                    self.value_of(r, rhs.ty, rhs.loc);
                    let evaluated = self.branch_state(Flow::Continues);
                    let branches = vec![
                        BranchState {
                            state: skipped,
                            terminal: false,
                        },
                        evaluated,
                    ];
                    self.join(branches, e.loc);
                } else {
                    let r = self.expr(rhs);
                    self.value_of(r, rhs.ty, rhs.loc);
                }
                Operand::Void
            }
            ExprKind::Select {
                cond,
                then_expr,
                else_expr,
            } => self.select(cond, then_expr, else_expr, e.ty, e.loc),
            ExprKind::Await(operand) => {
                let op = self.expr(operand);
                let awaited = self.value_of(op, operand.ty, operand.loc);
                self.check_suspension(e.loc);
                let name = self.ctx.types.name(e.ty).to_string();
                let result = self.new_value(&name, e.ty);
                let sources: Vec<(NodeId, Mutability)> = self
                    .graph
                    .inner_nodes(awaited)
                    .iter()
                    .flat_map(|n| self.graph.outgoing(*n).map(|e| (e.node, e.mutability)))
                    .collect();
                for dst in self.graph.inner_nodes(result).to_vec() {
                    for &(referent, mutability) in &sources {
                        self.graph.add_edge(referent, dst, mutability);
                    }
                }
                Operand::Value(result)
            }
        }
    }

    fn field(&mut self, base: &Expr, field: usize, loc: SrcLoc) -> Operand {
        let base_op = self.expr(base);
        let types = self.ctx.types;
        let Some(decl) = types.struct_decl(base.ty).and_then(|s| s.fields.get(field)) else {
            return base_op;
        };
        let tags = self.ctx.model.member_tags(base.ty, field).to_vec();
        match decl.reference {
            Some(mutability) => {
                // Reading a reference field needs read access to the struct.
                let source = self.reference_to(base_op, Mutability::Imut, loc);
                let name = format!("{}.{}", self.graph.name(source), decl.name);
                let reference = self.graph.add_reference(&name, mutability);
                self.temporary(reference);
                for &tag in &tags {
                    for referent in self.graph.inner_of(source, tag) {
                        self.link(referent, reference, mutability, loc);
                    }
                }
                Operand::Reference(reference)
            }
            None => self.member(base_op, field, &decl.name, &tags, loc),
        }
    }

    /// Sub-object access on a struct or tuple operand.
    fn member(
        &mut self,
        base_op: Operand,
        member: usize,
        member_name: &str,
        tags: &[usize],
        loc: SrcLoc,
    ) -> Operand {
        let Some(base) = Self::node_of(base_op) else {
            return Operand::Void;
        };
        if !variables::check_accessible(&self.graph, base, &mut self.diagnostics, loc) {
            return Operand::Void;
        }
        let mutable = match base_op {
            Operand::Place { mutable, .. } => mutable,
            Operand::Reference(node) => {
                matches!(self.graph.kind(node), NodeKind::Reference(Mutability::Mut))
            }
            _ => true,
        };
        let name = format!("{}.{}", self.graph.name(base), member_name);
        let node = self.graph.child(base, member, &name, tags);
        Operand::Place { node, mutable }
    }

    fn struct_init(&mut self, ty: TypeId, fields: &[Expr], loc: SrcLoc) -> Operand {
        let types = self.ctx.types;
        let name = types.name(ty).to_string();
        let value = self.new_value(&name, ty);
        let decl = types.struct_decl(ty);
        for (index, init) in fields.iter().enumerate() {
            let tags = self.ctx.model.member_tags(ty, index).to_vec();
            let reference = decl
                .and_then(|d| d.fields.get(index))
                .and_then(|f| f.reference);
            match reference {
                Some(mutability) => {
                    let op = self.expr(init);
                    let target = self.reference_to(op, mutability, init.loc);
                    for &tag in &tags {
                        if let Some(&dst) = self.graph.inner_nodes(value).get(tag) {
                            self.link(target, dst, mutability, loc);
                        }
                    }
                }
                None => self.store_member(value, init, &tags),
            }
        }
        Operand::Value(value)
    }

    /// Evaluates a member initializer and moves its references into the
    /// owner's tags.
    fn store_member(&mut self, owner: NodeId, init: &Expr, tags: &[usize]) {
        let op = self.expr(init);
        let member = self.value_of(op, init.ty, init.loc);
        let member_inner = self.graph.inner_nodes(member).to_vec();
        let owner_inner = self.graph.inner_nodes(owner).to_vec();
        for (source, &tag) in member_inner.iter().zip(tags) {
            let Some(&dst) = owner_inner.get(tag) else {
                continue;
            };
            let referents: Vec<(NodeId, Mutability)> = self
                .graph
                .outgoing(*source)
                .map(|e| (e.node, e.mutability))
                .collect();
            for (referent, mutability) in referents {
                self.graph.add_edge(referent, dst, mutability);
            }
        }
    }

    fn move_variable(&mut self, name: &str, loc: SrcLoc) -> Operand {
        match self.scopes.lookup(name) {
            Some(binding) if binding.kind == BindingKind::Value && binding.mutable => {
                match variables::move_out(&mut self.graph, binding.node, &mut self.diagnostics, loc)
                {
                    Some(value) => {
                        self.temporary(value);
                        Operand::Value(value)
                    }
                    None => Operand::Void,
                }
            }
            _ => {
                self.diagnostics
                    .report(ErrorKind::ExpectedReferenceValue, loc);
                Operand::Void
            }
        }
    }

    fn call(&mut self, function: &str, args: &[Expr], loc: SrcLoc) -> Operand {
        let ctx = self.ctx;
        let Some(callee) = ctx.callees.get(function) else {
            tracing::debug!(function, "call to unknown function");
            for arg in args {
                let op = self.expr(arg);
                self.value_of(op, arg.ty, arg.loc);
            }
            return Operand::Void;
        };

        let mut actual = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let op = self.expr(arg);
            let node = match callee.decl.params.get(index).and_then(|p| p.reference) {
                Some(mutability) => self.reference_to(op, mutability, arg.loc),
                None => self.value_of(op, arg.ty, arg.loc),
            };
            actual.push(CallArgument {
                node,
                tag_count: ctx.model.inner_references(arg.ty).count(),
            });
        }

        let name = format!("{function} result");
        let (result, operand) = match &callee.decl.ret {
            Some(ret) => match ret.reference {
                Some(mutability) => {
                    let node = self.graph.add_reference(&name, mutability);
                    self.temporary(node);
                    (CallResult::Reference(node), Operand::Reference(node))
                }
                None => {
                    let node = self.new_value(&name, ret.ty);
                    (CallResult::Value(node), Operand::Value(node))
                }
            },
            None => (CallResult::None, Operand::Void),
        };

        tracing::debug!(function, args = args.len(), %loc, "link call");
        let mut call_diagnostics = Diagnostics::new();
        linker::link_call(
            &mut self.graph,
            &callee.notation,
            &actual,
            result,
            &mut call_diagnostics,
            loc,
        );
        for error in call_diagnostics.into_errors() {
            let trusted = self.unsafe_depth > 0
                && matches!(error.kind, ErrorKind::ReferenceProtectionError(_));
            if !trusted {
                self.diagnostics.push(error);
            }
        }
        operand
    }

    /// Both operands are evaluated from the same state with their own
    /// temporaries, which die right after the join.
    fn select(
        &mut self,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
        ty: TypeId,
        loc: SrcLoc,
    ) -> Operand {
        let c = self.expr(cond);
        self.value_of(c, cond.ty, cond.loc);

        let base = self.graph.snapshot();
        self.begin_temporaries();
        let then_op = self.expr(then_expr);
        let then_state = self.branch_state(Flow::Continues);
        let then_temps = self.temporaries.pop().unwrap_or_default();
        self.graph.restore(base);
        self.begin_temporaries();
        let else_op = self.expr(else_expr);
        let else_state = self.branch_state(Flow::Continues);
        let else_temps = self.temporaries.pop().unwrap_or_default();
        self.join(vec![then_state, else_state], loc);

        let results = [(then_op, then_expr), (else_op, else_expr)];
        let by_reference = results
            .iter()
            .all(|(op, _)| matches!(op, Operand::Place { .. } | Operand::Reference(_)));
        let operand = if by_reference {
            let all_mutable = results.iter().all(|(op, _)| match op {
                Operand::Place { mutable, .. } => *mutable,
                Operand::Reference(node) => {
                    matches!(self.graph.kind(*node), NodeKind::Reference(Mutability::Mut))
                }
                _ => false,
            });
            let mutability = if all_mutable {
                Mutability::Mut
            } else {
                Mutability::Imut
            };
            let reference = self.graph.add_reference("select result", mutability);
            self.temporary(reference);
            for (op, e) in results {
                if let Some(node) = Self::node_of(op) {
                    self.link(node, reference, mutability, e.loc);
                }
            }
            Operand::Reference(reference)
        } else {
            let name = self.ctx.types.name(ty).to_string();
            let value = self.new_value(&name, ty);
            let frames = [then_temps, else_temps];
            for ((op, e), temps) in results.into_iter().zip(frames) {
                self.temporaries.push(temps);
                let branch_value = self.value_of(op, e.ty, e.loc);
                self.graph.transfer_inner(branch_value, value);
                self.end_temporaries(loc);
            }
            return Operand::Value(value);
        };
        for temps in [then_temps, else_temps] {
            self.temporaries.push(temps);
            self.end_temporaries(loc);
        }
        operand
    }
}
