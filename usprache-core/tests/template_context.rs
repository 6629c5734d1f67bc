mod common;

use common::*;
use usprache_ast::{Expr, FunctionDecl, Program, ReturnDecl, SrcLoc, Stmt};
use usprache_core::{Checker, ErrorKind};

fn instantiated_program() -> Program {
    let mut fx = Fixture::new();
    let i32_ty = fx.i32_ty;
    let body_stmts = vec![
        fx.local("x"),
        Stmt::ret(Some(fx.int("x").at(12, 15))).at(12, 8),
    ];
    fx.b.function(
        FunctionDecl::new("Get</i32/>")
            .returns(ReturnDecl::reference(i32_ty, Imut))
            .body(body(body_stmts))
            .instantiated_from("Get", "</ i32 />", SrcLoc::at(30, 4))
            .at(10, 4),
    );
    fx.build()
}

#[test]
fn test_errors_of_instantiation_are_wrapped() {
    let errors = Checker::new()
        .check_program(&instantiated_program())
        .unwrap_err();
    assert_eq!(errors.len(), 1);

    let outer = &errors[0];
    assert_eq!(outer.kind, ErrorKind::TemplateContext("Get".into()));
    assert_eq!(outer.src_loc, SrcLoc::at(30, 4));
    let context = outer.template_context.as_deref().unwrap();
    assert_eq!(context.parameters_description, "</ i32 />");
    assert_eq!(context.template_declaration_src_loc, SrcLoc::at(10, 4));
    assert_eq!(context.errors.len(), 1);
    assert_eq!(context.errors[0].code(), "ReturningUnallowedReference");
    assert_eq!(context.errors[0].src_loc.line, 12);
}

#[test]
fn test_nested_codes_are_searchable() {
    let d = analyze(&instantiated_program());
    assert!(d.has_code("TemplateContext"));
    assert!(d.has_code("ReturningUnallowedReference"));
    assert!(!d.has_code("ConditionalMove"));
}

#[test]
fn test_serialized_form() {
    let d = analyze(&instantiated_program());
    let json = serde_json::to_value(d.errors()).unwrap();
    let outer = &json[0];
    assert_eq!(outer["error_code"], "TemplateContext");
    assert_eq!(outer["src_loc"]["line"], 30);
    assert_eq!(outer["text"], "Required from here: Get");

    let inner = &outer["template_context"]["errors"][0];
    assert_eq!(inner["error_code"], "ReturningUnallowedReference");
    assert_eq!(inner["text"], "Returning unallowed reference.");
    assert!(inner.get("template_context").is_none());
}

#[test]
fn test_clean_instantiation_produces_nothing() {
    let mut fx = Fixture::new();
    let stmts = vec![fx.local("x"), Stmt::expr(Expr::increment(fx.int("x")))];
    fx.b.function(
        FunctionDecl::new("Touch</i32/>")
            .body(body(stmts))
            .instantiated_from("Touch", "</ i32 />", SrcLoc::at(3, 1)),
    );
    assert!(analyze(&fx.build()).is_empty());
}
