mod common;

use common::*;
use usprache_ast::{
    Block, Expr, FunctionDecl, ParamDecl, Program, RawNotation, ReturnDecl, Stmt, TypeId, UnaryOp,
};
use usprache_core::{AnalysisConfig, ErrorKind};

fn looping(stmts: impl FnOnce(&mut Fixture) -> Vec<Stmt>) -> Program {
    let mut fx = Fixture::new();
    let stmts = stmts(&mut fx);
    let bool_ty = fx.bool_ty;
    fx.b.function(
        FunctionDecl::new("main")
            .param(ParamDecl::value("b", bool_ty, Imut))
            .body(body(stmts)),
    );
    fx.build()
}

fn move_x(fx: &Fixture) -> Stmt {
    Stmt::expr(Expr::move_var("x", fx.i32_ty))
}

#[test]
fn test_move_of_outer_variable_in_loop_body() {
    let program = looping(|fx| {
        vec![
            fx.local("x"),
            Stmt::while_loop(fx.flag(), Block::new(vec![move_x(fx)]).ends_at(5, 4)).at(3, 4),
        ]
    });
    let d = analyze(&program);
    assert_eq!(d.len(), 1);
    assert_eq!(
        d.errors()[0].kind,
        ErrorKind::OuterVariableMoveInsideLoop("x".into())
    );
    assert_eq!(d.errors()[0].src_loc.line, 5);
}

#[test]
fn test_move_inside_condition_repeats_every_iteration() {
    let program = looping(|fx| {
        let bool_ty = fx.bool_ty;
        vec![
            Stmt::var("c", bool_ty, Mut, Expr::literal(bool_ty)),
            Stmt::while_loop(
                Expr::move_var("c", bool_ty),
                Block::new(vec![]).ends_at(4, 4),
            )
            .at(3, 4),
        ]
    });
    let d = analyze(&program);
    assert_eq!(d.len(), 1);
    assert_eq!(
        d.errors()[0].kind,
        ErrorKind::OuterVariableMoveInsideLoop("c".into())
    );
    assert_eq!(d.errors()[0].src_loc.line, 4);
}

#[test]
fn test_condition_state_is_the_exit_state() {
    // The condition moved `c`, so reading it after the loop is an error.
    let program = looping(|fx| {
        let bool_ty = fx.bool_ty;
        vec![
            Stmt::var("c", bool_ty, Mut, Expr::literal(bool_ty)),
            Stmt::while_loop(
                Expr::move_var("c", bool_ty),
                Block::new(vec![Stmt::break_loop()]),
            ),
            Stmt::expr(Expr::unary(UnaryOp::Not, Expr::name("c", bool_ty).at(5, 9))).at(5, 4),
        ]
    });
    let d = analyze(&program);
    assert_eq!(d.len(), 1);
    assert_eq!(d.errors()[0].kind, ErrorKind::AccessingMovedVariable("c".into()));
    assert_eq!(d.errors()[0].src_loc.line, 5);
}

#[test]
fn test_move_followed_by_break() {
    let program = looping(|fx| {
        vec![
            fx.local("x"),
            Stmt::while_loop(fx.flag(), Block::new(vec![move_x(fx), Stmt::break_loop()])),
        ]
    });
    assert_eq!(codes(&program), Vec::<&str>::new());
}

#[test]
fn test_move_before_continue() {
    let program = looping(|fx| {
        vec![
            fx.local("x"),
            Stmt::while_loop(
                fx.flag(),
                Block::new(vec![Stmt::if_then(
                    fx.flag(),
                    Block::new(vec![move_x(fx), Stmt::continue_loop()]),
                )]),
            ),
        ]
    });
    assert_eq!(codes(&program), vec!["OuterVariableMoveInsideLoop"]);
}

#[test]
fn test_loop_local_variables_may_move() {
    let program = looping(|fx| {
        let i32_ty = fx.i32_ty;
        vec![Stmt::while_loop(
            fx.flag(),
            Block::new(vec![
                fx.local("x"),
                move_x(fx),
                Stmt::var("y", i32_ty, Imut, Expr::literal(i32_ty)),
                Stmt::break_loop(),
            ]),
        )]
    });
    assert_eq!(codes(&program), Vec::<&str>::new());
}

#[test]
fn test_break_destroys_loop_locals() {
    let program = looping(|fx| {
        let holder = fx.holder();
        vec![
            fx.local("x"),
            Stmt::var("h", holder, Mut, Expr::struct_init(holder, vec![fx.int("x")])),
            Stmt::infinite_loop(Block::new(vec![
                fx.local("z"),
                Stmt::assign(
                    Expr::name("h", holder),
                    Expr::struct_init(holder, vec![fx.int("z")]),
                ),
                Stmt::break_loop().at(7, 8),
            ])),
        ]
    });
    let codes = codes(&program);
    assert!(codes.contains(&"DestroyedVariableStillHasReferences"));
}

#[test]
fn test_infinite_loop_without_break_ends_the_function() {
    let program = looping(|fx| {
        vec![
            fx.local("x"),
            Stmt::infinite_loop(Block::new(vec![Stmt::expr(Expr::increment(fx.int("x")))])),
            move_x(fx),
            move_x(fx),
        ]
    });
    assert_eq!(codes(&program), Vec::<&str>::new());
}

fn outer_pollution() -> Program {
    looping(|fx| {
        let holder = fx.holder();
        vec![
            fx.local("x"),
            fx.local("y"),
            Stmt::var("h", holder, Mut, Expr::struct_init(holder, vec![fx.int("x")])),
            Stmt::while_loop(
                fx.flag(),
                Block::new(vec![Stmt::assign(
                    Expr::name("h", holder),
                    Expr::struct_init(holder, vec![fx.int("y")]),
                )]),
            ),
        ]
    })
}

#[test]
fn test_loop_pollutes_outer_variable() {
    let d = analyze(&outer_pollution());
    assert_eq!(d.len(), 1);
    assert_eq!(
        d.errors()[0].kind,
        ErrorKind::ReferencePollutionOfOuterLoopVariable("h".into(), "y".into())
    );
}

#[test]
fn test_loop_pollution_check_can_be_disabled() {
    let config = AnalysisConfig::from_toml_str("check_loop_pollution = false").unwrap();
    assert!(analyze_with(&outer_pollution(), config).is_empty());
}

/// `fn link(Holder &mut h, i32 &imut y) : bool` with `'0a <- 1_'`.
fn link_fn(fx: &mut Fixture) -> (FunctionDecl, TypeId) {
    let holder = fx.holder();
    let f = FunctionDecl::new("link")
        .param(ParamDecl::reference("h", holder, Mut))
        .param(ParamDecl::reference("y", fx.i32_ty, Imut))
        .returns(ReturnDecl::value(fx.bool_ty))
        .notation(RawNotation::new().pollution("0a", "1_", Imut));
    (f, holder)
}

#[test]
fn test_pollution_inside_condition() {
    let mut fx = Fixture::new();
    let (link, holder) = link_fn(&mut fx);
    let bool_ty = fx.bool_ty;
    let stmts = vec![
        fx.local("x"),
        fx.local("y"),
        Stmt::var("h", holder, Mut, Expr::struct_init(holder, vec![fx.int("x")])),
        Stmt::while_loop(
            Expr::call("link", vec![Expr::name("h", holder), fx.int("y")], bool_ty),
            Block::new(vec![]).ends_at(6, 4),
        ),
    ];
    fx.b.function(link);
    fx.b.function(FunctionDecl::new("main").body(body(stmts)));

    let d = analyze(&fx.build());
    assert_eq!(d.len(), 1);
    assert_eq!(
        d.errors()[0].kind,
        ErrorKind::ReferencePollutionOfOuterLoopVariable("h".into(), "y".into())
    );
    assert_eq!(d.errors()[0].src_loc.line, 6);
}
