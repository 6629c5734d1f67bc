#![forbid(unsafe_code)]

use std::fmt;

use miette::Diagnostic;
use serde::{Serialize, Serializer, ser::SerializeStruct};
use thiserror::Error;
use usprache_ast::SrcLoc;

/// Every diagnostic the reference checker can produce.
///
/// The variant name is the stable error code; the message is free text.
#[derive(Clone, Debug, Error, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    #[error("Reference protection check for variable \"{0}\" failed.")]
    ReferenceProtectionError(String),
    #[error("Destroyed variable \"{0}\" still has reference(s).")]
    DestroyedVariableStillHasReferences(String),
    #[error("Accessing moved variable \"{0}\".")]
    AccessingMovedVariable(String),
    #[error("Moved variable \"{0}\" has reference(s).")]
    MovedVariableHasReferences(String),
    #[error("Expected reference value.")]
    ExpectedReferenceValue,
    #[error("Variable \"{0}\" moved not in all if-else branches.")]
    ConditionalMove(String),
    #[error("Outer loop variable \"{0}\" move inside loop.")]
    OuterVariableMoveInsideLoop(String),
    #[error("Reference pollution for outer variables inside loop. \"{0}\" polluted by \"{1}\".")]
    ReferencePollutionOfOuterLoopVariable(String, String),
    #[error("Returning unallowed reference.")]
    ReturningUnallowedReference,
    #[error("Unallowed reference pollution.")]
    UnallowedReferencePollution,
    #[error("Reference self-pollution.")]
    SelfReferencePollution,
    #[error("Pollution of arg reference.")]
    ArgReferencePollution,
    #[error("Value is not a reference. Expected a reference param, got \"{0}\".")]
    ValueIsNotReference(String),
    #[error("Expected reference notation for field \"{0}\".")]
    ExpectedReferenceNotation(String),
    #[error("Reference field \"{0}\" has a type with other references inside.")]
    ReferenceFieldOfTypeWithReferencesInside(String),
    #[error("Mismatch in count of inner reference tags. Expected {0}, got {1}.")]
    InnerReferenceTagCountMismatch(usize, usize),
    #[error("Invalid inner reference tag name \"{0}\". Expected letters in range a-z.")]
    InvalidInnerReferenceTagName(String),
    #[error(
        "Reference tag \"{0}\" is not used. Make sure there are no gaps in reference tags of the struct."
    )]
    UnusedReferenceTag(String),
    #[error("Reference tag \"{0}\" points both to mutable and immutable references.")]
    MixingMutableAndImmutableReferencesInSameReferenceTag(String),
    #[error("Reference tag number {0} is out of range of type {1} ({2}).")]
    ReferenceTagOutOfRange(usize, String, usize),
    #[error("Invalid param number \"{0}\".")]
    InvalidParamNumber(String),
    #[error("Param number {0} is out of range ({1}).")]
    ParamNumberOutOfRange(usize, usize),
    #[error("Required from here: {0}")]
    TemplateContext(String),
}

impl ErrorKind {
    /// Stable machine-readable name of the error.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ReferenceProtectionError(_) => "ReferenceProtectionError",
            ErrorKind::DestroyedVariableStillHasReferences(_) => {
                "DestroyedVariableStillHasReferences"
            }
            ErrorKind::AccessingMovedVariable(_) => "AccessingMovedVariable",
            ErrorKind::MovedVariableHasReferences(_) => "MovedVariableHasReferences",
            ErrorKind::ExpectedReferenceValue => "ExpectedReferenceValue",
            ErrorKind::ConditionalMove(_) => "ConditionalMove",
            ErrorKind::OuterVariableMoveInsideLoop(_) => "OuterVariableMoveInsideLoop",
            ErrorKind::ReferencePollutionOfOuterLoopVariable(..) => {
                "ReferencePollutionOfOuterLoopVariable"
            }
            ErrorKind::ReturningUnallowedReference => "ReturningUnallowedReference",
            ErrorKind::UnallowedReferencePollution => "UnallowedReferencePollution",
            ErrorKind::SelfReferencePollution => "SelfReferencePollution",
            ErrorKind::ArgReferencePollution => "ArgReferencePollution",
            ErrorKind::ValueIsNotReference(_) => "ValueIsNotReference",
            ErrorKind::ExpectedReferenceNotation(_) => "ExpectedReferenceNotation",
            ErrorKind::ReferenceFieldOfTypeWithReferencesInside(_) => {
                "ReferenceFieldOfTypeWithReferencesInside"
            }
            ErrorKind::InnerReferenceTagCountMismatch(..) => "InnerReferenceTagCountMismatch",
            ErrorKind::InvalidInnerReferenceTagName(_) => "InvalidInnerReferenceTagName",
            ErrorKind::UnusedReferenceTag(_) => "UnusedReferenceTag",
            ErrorKind::MixingMutableAndImmutableReferencesInSameReferenceTag(_) => {
                "MixingMutableAndImmutableReferencesInSameReferenceTag"
            }
            ErrorKind::ReferenceTagOutOfRange(..) => "ReferenceTagOutOfRange",
            ErrorKind::InvalidParamNumber(_) => "InvalidParamNumber",
            ErrorKind::ParamNumberOutOfRange(..) => "ParamNumberOutOfRange",
            ErrorKind::TemplateContext(_) => "TemplateContext",
        }
    }
}

/// Errors produced while checking one template instantiation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TemplateErrorsContext {
    pub errors: Vec<CodeBuilderError>,
    pub context_name: String,
    pub parameters_description: String,
    pub template_declaration_src_loc: SrcLoc,
}

/// A located diagnostic.
#[derive(Clone, Debug, Error, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[error("{kind}")]
pub struct CodeBuilderError {
    pub kind: ErrorKind,
    pub src_loc: SrcLoc,
    pub template_context: Option<Box<TemplateErrorsContext>>,
}

impl CodeBuilderError {
    pub fn new(kind: ErrorKind, src_loc: SrcLoc) -> Self {
        Self {
            kind,
            src_loc,
            template_context: None,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn text(&self) -> String {
        self.kind.to_string()
    }

    /// Wraps errors of a template instantiation into a single context record
    /// located at the point of instantiation.
    pub fn template_context(
        errors: Vec<CodeBuilderError>,
        context_name: impl Into<String>,
        parameters_description: impl Into<String>,
        declaration_loc: SrcLoc,
        instantiation_loc: SrcLoc,
    ) -> Self {
        let context_name = context_name.into();
        Self {
            kind: ErrorKind::TemplateContext(context_name.clone()),
            src_loc: instantiation_loc,
            template_context: Some(Box::new(TemplateErrorsContext {
                errors,
                context_name,
                parameters_description: parameters_description.into(),
                template_declaration_src_loc: declaration_loc,
            })),
        }
    }

    /// Calls `f` on this error and on every error nested in template contexts.
    pub fn visit(&self, f: &mut impl FnMut(&CodeBuilderError)) {
        f(self);
        if let Some(ctx) = &self.template_context {
            for e in &ctx.errors {
                e.visit(f);
            }
        }
    }
}

impl Serialize for CodeBuilderError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.template_context.is_some() { 4 } else { 3 };
        let mut s = serializer.serialize_struct("CodeBuilderError", fields)?;
        s.serialize_field("error_code", self.code())?;
        s.serialize_field("src_loc", &self.src_loc)?;
        s.serialize_field("text", &self.text())?;
        if let Some(ctx) = &self.template_context {
            s.serialize_field("template_context", ctx)?;
        }
        s.end()
    }
}

struct Code(&'static str);

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "usprache::{}", self.0)
    }
}

impl Diagnostic for CodeBuilderError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(Code(self.kind.code())))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.template_context.as_ref().map(|ctx| {
            Box::new(format!(
                "in instantiation of {}{} declared at {}",
                ctx.context_name, ctx.parameters_description, ctx.template_declaration_src_loc
            )) as Box<dyn fmt::Display + 'a>
        })
    }

    fn related<'a>(&'a self) -> Option<Box<dyn Iterator<Item = &'a dyn Diagnostic> + 'a>> {
        self.template_context.as_ref().map(|ctx| {
            Box::new(ctx.errors.iter().map(|e| e as &dyn Diagnostic))
                as Box<dyn Iterator<Item = &'a dyn Diagnostic> + 'a>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_matches_variant_name() {
        let e = CodeBuilderError::new(
            ErrorKind::ReferenceProtectionError("x".into()),
            SrcLoc::at(3, 4),
        );
        assert_eq!(e.code(), "ReferenceProtectionError");
        assert_eq!(
            e.text(),
            "Reference protection check for variable \"x\" failed."
        );
    }

    #[test]
    fn test_diagnostic_code_is_namespaced() {
        let e = CodeBuilderError::new(ErrorKind::ExpectedReferenceValue, SrcLoc::at(1, 1));
        let code = Diagnostic::code(&e).map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("usprache::ExpectedReferenceValue"));
    }

    #[test]
    fn test_template_context_exposes_nested_errors() {
        let inner = CodeBuilderError::new(ErrorKind::ReturningUnallowedReference, SrcLoc::at(10, 2));
        let outer = CodeBuilderError::template_context(
            vec![inner.clone()],
            "Get",
            "</ i32 />",
            SrcLoc::at(9, 1),
            SrcLoc::at(30, 5),
        );
        assert_eq!(outer.code(), "TemplateContext");
        assert_eq!(outer.src_loc, SrcLoc::at(30, 5));
        assert_eq!(outer.related().map(|r| r.count()), Some(1));

        let mut seen = Vec::new();
        outer.visit(&mut |e| seen.push(e.code()));
        assert_eq!(seen, vec!["TemplateContext", "ReturningUnallowedReference"]);
    }
}
