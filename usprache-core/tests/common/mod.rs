#![allow(dead_code)]

use usprache_ast::{
    Block, Expr, FieldDecl, Mutability, Program, ProgramBuilder, Stmt, StructDecl, TypeId,
};
use usprache_core::{AnalysisConfig, Checker, CodeBuilderError, Diagnostics};

pub use Mutability::{Imut, Mut};

/// Builder preloaded with the fundamental types the tests use.
pub struct Fixture {
    pub b: ProgramBuilder,
    pub i32_ty: TypeId,
    pub bool_ty: TypeId,
}

impl Fixture {
    pub fn new() -> Self {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.fundamental("i32");
        let bool_ty = b.fundamental("bool");
        Self { b, i32_ty, bool_ty }
    }

    /// `struct Holder { &imut i32 r }`, one implicit tag.
    pub fn holder(&mut self) -> TypeId {
        let i32_ty = self.i32_ty;
        self.b.structure(StructDecl::new(
            "Holder",
            vec![FieldDecl::reference("r", i32_ty, Imut)],
        ))
    }

    /// `struct Pair { i32 x; i32 y }`, no tags.
    pub fn pair(&mut self) -> TypeId {
        let i32_ty = self.i32_ty;
        self.b.structure(StructDecl::new(
            "Pair",
            vec![FieldDecl::value("x", i32_ty), FieldDecl::value("y", i32_ty)],
        ))
    }

    pub fn int(&self, name: &str) -> Expr {
        Expr::name(name, self.i32_ty)
    }

    pub fn flag(&self) -> Expr {
        Expr::name("b", self.bool_ty)
    }

    /// `var i32 mut <name> = 0;`
    pub fn local(&self, name: &str) -> Stmt {
        Stmt::var(name, self.i32_ty, Mut, Expr::literal(self.i32_ty))
    }

    pub fn build(self) -> Program {
        self.b.build()
    }
}

pub fn body(stmts: Vec<Stmt>) -> Block {
    Block::new(stmts)
}

pub fn analyze(program: &Program) -> Diagnostics {
    Checker::new().analyze(program)
}

pub fn analyze_with(program: &Program, config: AnalysisConfig) -> Diagnostics {
    Checker::with_config(config).analyze(program)
}

pub fn codes(program: &Program) -> Vec<&'static str> {
    analyze(program).errors().iter().map(CodeBuilderError::code).collect()
}
