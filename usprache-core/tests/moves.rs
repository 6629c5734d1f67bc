mod common;

use common::*;
use proptest::prelude::*;
use usprache_ast::{Block, Expr, FunctionDecl, Program, Stmt};
use usprache_core::ErrorKind;

#[test]
fn test_move_of_referenced_variable() {
    let mut fx = Fixture::new();
    let i32_ty = fx.i32_ty;
    let stmts = vec![
        fx.local("x"),
        Stmt::reference("r", i32_ty, Imut, fx.int("x")),
        Stmt::var("y", i32_ty, Mut, Expr::move_var("x", i32_ty)).at(4, 4),
    ];
    fx.b.function(FunctionDecl::new("main").body(body(stmts)));

    let d = analyze(&fx.build());
    assert_eq!(d.len(), 1);
    assert_eq!(d.errors()[0].kind, ErrorKind::MovedVariableHasReferences("x".into()));
}

#[test]
fn test_move_needs_mutable_value() {
    let mut fx = Fixture::new();
    let i32_ty = fx.i32_ty;
    let stmts = vec![
        Stmt::var("x", i32_ty, Imut, Expr::literal(i32_ty)),
        fx.local("y"),
        Stmt::reference("r", i32_ty, Mut, fx.int("y")),
        Stmt::expr(Expr::move_var("x", i32_ty).at(5, 4)),
        Stmt::expr(Expr::move_var("r", i32_ty).at(6, 4)),
        Stmt::expr(Expr::take(Expr::literal(i32_ty)).at(7, 4)),
    ];
    fx.b.function(FunctionDecl::new("main").body(body(stmts)));

    let d = analyze(&fx.build());
    let lines: Vec<u32> = d.errors().iter().map(|e| e.src_loc.line).collect();
    assert_eq!(lines, vec![5, 6, 7]);
    assert!(d.errors().iter().all(|e| e.kind == ErrorKind::ExpectedReferenceValue));
}

#[test]
fn test_moved_struct_takes_its_references_along() {
    let mut fx = Fixture::new();
    let holder = fx.holder();
    let stmts = vec![
        fx.local("x"),
        Stmt::var("h", holder, Mut, Expr::struct_init(holder, vec![fx.int("x")])),
        Stmt::var("h2", holder, Imut, Expr::move_var("h", holder)),
        Stmt::expr(Expr::increment(fx.int("x").at(5, 6))).at(5, 4),
    ];
    fx.b.function(FunctionDecl::new("main").body(body(stmts)));

    let d = analyze(&fx.build());
    assert_eq!(d.len(), 1);
    assert_eq!(d.errors()[0].kind, ErrorKind::ReferenceProtectionError("x".into()));
    assert_eq!(d.errors()[0].src_loc.line, 5);
}

#[test]
fn test_destroying_referenced_variable() {
    let mut fx = Fixture::new();
    let holder = fx.holder();
    let stmts = vec![
        fx.local("y"),
        Stmt::var("h", holder, Mut, Expr::struct_init(holder, vec![fx.int("y")])),
        Stmt::block(Block::new(vec![
            fx.local("z"),
            Stmt::assign(
                Expr::name("h", holder),
                Expr::struct_init(holder, vec![fx.int("z")]),
            ),
        ])
        .ends_at(6, 4)),
    ];
    fx.b.function(FunctionDecl::new("main").body(body(stmts)));

    let d = analyze(&fx.build());
    assert_eq!(d.len(), 1);
    assert_eq!(
        d.errors()[0].kind,
        ErrorKind::DestroyedVariableStillHasReferences("z".into())
    );
    assert_eq!(d.errors()[0].src_loc.line, 6);
}

/// Moves `x`, runs `padding` unrelated declarations, then touches `x`.
fn move_then_access(access: usize, padding: usize) -> Program {
    let mut fx = Fixture::new();
    let i32_ty = fx.i32_ty;
    let mut stmts = vec![
        fx.local("x"),
        Stmt::var("moved", i32_ty, Imut, Expr::move_var("x", i32_ty)),
    ];
    for i in 0..padding {
        stmts.push(fx.local(&format!("pad{i}")));
    }
    stmts.push(match access {
        0 => Stmt::var("read", i32_ty, Imut, fx.int("x")),
        1 => Stmt::assign(fx.int("x"), Expr::literal(i32_ty)),
        _ => Stmt::expr(Expr::move_var("x", i32_ty)),
    });
    fx.b.function(FunctionDecl::new("main").body(body(stmts)));
    fx.build()
}

proptest! {
    #[test]
    fn prop_access_after_move_is_reported(access in 0usize..3, padding in 0usize..4) {
        let d = analyze(&move_then_access(access, padding));
        prop_assert_eq!(d.len(), 1);
        prop_assert_eq!(&d.errors()[0].kind, &ErrorKind::AccessingMovedVariable("x".into()));
    }
}
