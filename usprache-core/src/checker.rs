#![forbid(unsafe_code)]

use std::collections::HashMap;

use rayon::prelude::*;
use usprache_ast::{Block, Expr, ExprKind, FunctionDecl, Initializer, Program, StmtKind, TypeId};

use crate::config::AnalysisConfig;
use crate::diagnostics::Diagnostics;
use crate::error::CodeBuilderError;
use crate::function_checker::{Callee, FunctionChecker, ProgramContext};
use crate::notation::{self, FunctionReferenceNotation};
use crate::tags::TagModel;

/// Reference checker for a whole program.
///
/// Builds the tag model and the reference notation of every function, then
/// checks every function body independently. Errors are collected, never
/// thrown: one bad function does not hide problems in the others.
#[derive(Debug, Default)]
pub struct Checker {
    config: AnalysisConfig,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn check_program(&self, program: &Program) -> Result<(), Vec<CodeBuilderError>> {
        let diagnostics = self.analyze(program);
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(diagnostics.into_errors())
        }
    }

    /// Runs every check and returns the sorted, deduplicated error list.
    pub fn analyze(&self, program: &Program) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let model = TagModel::build(&program.types, &mut diagnostics);

        let notations: Vec<Option<FunctionReferenceNotation>> = program
            .functions
            .iter()
            .map(|f| notation::build_notation(f, &program.types, &model, &mut diagnostics))
            .collect();

        let mut callees = HashMap::new();
        for (f, n) in program.functions.iter().zip(&notations) {
            let notation = n
                .clone()
                .unwrap_or_else(|| notation::default_notation(f, &model));
            callees.insert(f.name.as_str(), Callee { decl: f, notation });
        }
        let ctx = ProgramContext {
            types: &program.types,
            model: &model,
            callees,
            config: &self.config,
        };

        let bodies: Vec<(&FunctionDecl, &FunctionReferenceNotation)> = program
            .functions
            .iter()
            .zip(&notations)
            .filter_map(|(f, n)| n.as_ref().map(|n| (f, n)))
            .filter(|(f, _)| has_resolved_signature(f, &model) && has_resolved_body(f, &model))
            .collect();

        let check = |(f, n): &(&FunctionDecl, &FunctionReferenceNotation)| {
            let errors = FunctionChecker::new(&ctx, f, n).check();
            wrap_template_errors(f, errors)
        };
        let results: Vec<Diagnostics> = if self.config.parallel {
            bodies.par_iter().map(check).collect()
        } else {
            bodies.iter().map(check).collect()
        };
        for result in results {
            diagnostics.extend(result);
        }

        diagnostics.normalize();
        if let Some(max) = self.config.max_errors {
            diagnostics.truncate(max);
        }
        tracing::info!(
            functions = bodies.len(),
            errors = diagnostics.len(),
            "reference check finished"
        );
        diagnostics
    }
}

/// Bodies whose signature still has an unknown number of inner references
/// cannot be analyzed yet.
fn has_resolved_signature(f: &FunctionDecl, model: &TagModel) -> bool {
    let params = f
        .params
        .iter()
        .all(|p| model.inner_references(p.ty).is_resolved());
    let ret = f
        .ret
        .as_ref()
        .is_none_or(|r| model.inner_references(r.ty).is_resolved());
    if !(params && ret) {
        tracing::debug!(function = %f.name, "skipping body with unresolved signature");
    }
    params && ret
}

/// Bodies mentioning a type with an unknown number of inner references are
/// checked per instantiation instead.
fn has_resolved_body(f: &FunctionDecl, model: &TagModel) -> bool {
    let Some(body) = &f.body else {
        return false;
    };
    let mut resolved = true;
    visit_block(body, &mut |ty| {
        resolved &= model.inner_references(ty).is_resolved();
    });
    if !resolved {
        tracing::debug!(function = %f.name, "skipping body with unresolved local types");
    }
    resolved
}

fn visit_block(block: &Block, f: &mut impl FnMut(TypeId)) {
    for stmt in &block.stmts {
        match &stmt.kind {
            StmtKind::Var { ty, init, .. } => {
                f(*ty);
                if let Initializer::Expr(e) = init {
                    visit_expr(e, f);
                }
            }
            StmtKind::Ref { ty, init, .. } => {
                f(*ty);
                visit_expr(init, f);
            }
            StmtKind::Expr(e) => visit_expr(e, f),
            StmtKind::Assign { target, value, .. } => {
                visit_expr(target, f);
                visit_expr(value, f);
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                visit_expr(cond, f);
                visit_block(then_block, f);
                if let Some(b) = else_block {
                    visit_block(b, f);
                }
            }
            StmtKind::Switch {
                value,
                cases,
                default,
            } => {
                visit_expr(value, f);
                for b in cases.iter().chain(default) {
                    visit_block(b, f);
                }
            }
            StmtKind::While { cond, body } => {
                visit_expr(cond, f);
                visit_block(body, f);
            }
            StmtKind::Loop(b) | StmtKind::Block(b) => visit_block(b, f),
            StmtKind::With { expr, body, .. } => {
                visit_expr(expr, f);
                visit_block(body, f);
            }
            StmtKind::Return(Some(e)) | StmtKind::Yield(Some(e)) => visit_expr(e, f),
            StmtKind::Return(None)
            | StmtKind::Yield(None)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Halt => {}
        }
    }
}

fn visit_expr(e: &Expr, f: &mut impl FnMut(TypeId)) {
    f(e.ty);
    match &e.kind {
        ExprKind::Literal | ExprKind::Name(_) | ExprKind::Move(_) => {}
        ExprKind::Field { base, .. } | ExprKind::TupleElement { base, .. } => visit_expr(base, f),
        ExprKind::Index { base, index } => {
            visit_expr(base, f);
            visit_expr(index, f);
        }
        ExprKind::Call { args, .. }
        | ExprKind::StructInit(args)
        | ExprKind::TupleInit(args)
        | ExprKind::ArrayInit(args) => {
            for arg in args {
                visit_expr(arg, f);
            }
        }
        ExprKind::Take(operand)
        | ExprKind::Await(operand)
        | ExprKind::Unary { operand, .. }
        | ExprKind::Modify {
            target: operand, ..
        } => visit_expr(operand, f),
        ExprKind::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        ExprKind::Select {
            cond,
            then_expr,
            else_expr,
        } => {
            visit_expr(cond, f);
            visit_expr(then_expr, f);
            visit_expr(else_expr, f);
        }
    }
}

fn wrap_template_errors(f: &FunctionDecl, errors: Diagnostics) -> Diagnostics {
    let Some(template) = &f.template else {
        return errors;
    };
    if errors.is_empty() {
        return errors;
    }
    let mut wrapped = Diagnostics::new();
    wrapped.push(CodeBuilderError::template_context(
        errors.into_errors(),
        template.template_name.clone(),
        template.parameters.clone(),
        f.loc,
        template.loc,
    ));
    wrapped
}
