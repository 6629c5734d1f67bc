//! Function reference notation.
//!
//! A notation tells the call-site linker which references flow between the
//! args of a call (pollution) and which arg references the result aliases.

use std::collections::BTreeSet;
use std::fmt;

use usprache_ast::{FunctionDecl, Mutability, RawNotation, SrcLoc, TypeTable};

use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::tags::{InnerReferenceSet, ReferenceTag, TagModel};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamTag {
    /// The param itself, which must be a reference param.
    Reference,
    Inner(ReferenceTag),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamReference {
    pub param: usize,
    pub tag: ParamTag,
}

impl ParamReference {
    pub fn reference(param: usize) -> Self {
        Self {
            param,
            tag: ParamTag::Reference,
        }
    }

    pub fn inner(param: usize, tag: ReferenceTag) -> Self {
        Self {
            param,
            tag: ParamTag::Inner(tag),
        }
    }

    pub fn is_inner(&self) -> bool {
        matches!(self.tag, ParamTag::Inner(_))
    }
}

impl fmt::Display for ParamReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            ParamTag::Reference => write!(f, "{}_", self.param),
            ParamTag::Inner(tag) => write!(f, "{}{}", self.param, tag),
        }
    }
}

/// `dst`'s inner references may start pointing to whatever `src` points to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferencePollution {
    pub dst: ParamReference,
    pub src: ParamReference,
    pub src_mutability: Mutability,
}

/// Normalized reference notation. Two notations are equal iff they describe
/// the same relation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FunctionReferenceNotation {
    pub pollution: BTreeSet<ReferencePollution>,
    pub return_references: BTreeSet<ParamReference>,
    /// One set per inner reference tag of the return type.
    pub return_inner_references: Vec<BTreeSet<ParamReference>>,
}

impl FunctionReferenceNotation {
    /// Merges entries that differ only in mutability into the mutable one.
    pub fn normalize(&mut self) {
        let mutable: BTreeSet<(ParamReference, ParamReference)> = self
            .pollution
            .iter()
            .filter(|p| p.src_mutability.is_mut())
            .map(|p| (p.dst, p.src))
            .collect();
        self.pollution
            .retain(|p| p.src_mutability.is_mut() || !mutable.contains(&(p.dst, p.src)));
    }

    /// Every reference stored by the result, in any inner tag.
    pub fn all_return_inner_references(&self) -> BTreeSet<ParamReference> {
        self.return_inner_references
            .iter()
            .flatten()
            .copied()
            .collect()
    }
}

/// Whether a value of function type `src` may be used where `dst` is
/// expected: `dst` must license every pollution and returned reference that
/// `src` produces.
pub fn is_notation_compatible(
    src: &FunctionReferenceNotation,
    dst: &FunctionReferenceNotation,
) -> bool {
    let pollution_ok = src.pollution.iter().all(|p| {
        dst.pollution.contains(p)
            || (!p.src_mutability.is_mut()
                && dst.pollution.contains(&ReferencePollution {
                    src_mutability: Mutability::Mut,
                    ..*p
                }))
    });
    let returns_ok = src.return_references.is_subset(&dst.return_references);
    let inner_ok = src
        .return_inner_references
        .iter()
        .enumerate()
        .all(|(i, set)| match dst.return_inner_references.get(i) {
            Some(d) => set.is_subset(d),
            None => set.is_empty(),
        });
    pollution_ok && returns_ok && inner_ok
}

/// Notation of a function declared without one: the result may alias any
/// reference param, nothing else flows.
pub fn default_notation(function: &FunctionDecl, model: &TagModel) -> FunctionReferenceNotation {
    let return_references = match &function.ret {
        Some(ret) if ret.reference.is_some() => function
            .params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_reference())
            .map(|(i, _)| ParamReference::reference(i))
            .collect(),
        _ => BTreeSet::new(),
    };
    let return_tags = function
        .ret
        .as_ref()
        .filter(|r| r.reference.is_none())
        .map(|r| model.tags(r.ty).len())
        .unwrap_or(0);
    FunctionReferenceNotation {
        pollution: BTreeSet::new(),
        return_references,
        return_inner_references: vec![BTreeSet::new(); return_tags],
    }
}

/// Builds the notation of a function from its raw form.
///
/// Returns `None` when the notation cannot be parsed; the function's body is
/// then not analyzed. Semantically invalid entries are reported and dropped.
pub fn build_notation(
    function: &FunctionDecl,
    types: &TypeTable,
    model: &TagModel,
    diagnostics: &mut Diagnostics,
) -> Option<FunctionReferenceNotation> {
    let Some(raw) = &function.notation else {
        return Some(default_notation(function, model));
    };
    let parser = NotationParser {
        function,
        types,
        model,
        loc: if raw.loc == SrcLoc::default() {
            function.loc
        } else {
            raw.loc
        },
    };
    parser.build(raw, diagnostics)
}

struct NotationParser<'a> {
    function: &'a FunctionDecl,
    types: &'a TypeTable,
    model: &'a TagModel,
    loc: SrcLoc,
}

impl NotationParser<'_> {
    fn build(
        &self,
        raw: &RawNotation,
        diagnostics: &mut Diagnostics,
    ) -> Option<FunctionReferenceNotation> {
        let mut notation = default_notation(self.function, self.model);
        let mut failed = false;

        notation.pollution.clear();
        for entry in &raw.pollution {
            let (Some(dst), Some(src)) = (
                self.param_reference(&entry.dst, diagnostics),
                self.param_reference(&entry.src, diagnostics),
            ) else {
                failed = true;
                continue;
            };
            if !dst.is_inner() {
                diagnostics.report(ErrorKind::ArgReferencePollution, self.loc);
                continue;
            }
            if dst == src {
                diagnostics.report(ErrorKind::SelfReferencePollution, self.loc);
                continue;
            }
            notation.pollution.insert(ReferencePollution {
                dst,
                src,
                src_mutability: entry.mutability,
            });
        }

        if let Some(refs) = &raw.return_references {
            notation.return_references.clear();
            for text in refs {
                match self.param_reference(text, diagnostics) {
                    Some(r) => {
                        notation.return_references.insert(r);
                    }
                    None => failed = true,
                }
            }
        }

        if let Some(inner) = &raw.return_inner_references {
            let expected = self
                .function
                .ret
                .as_ref()
                .filter(|r| r.reference.is_none())
                .map(|r| self.model.inner_references(r.ty));
            if let Some(InnerReferenceSet::Resolved(tags)) = expected {
                if tags.len() != inner.len() {
                    diagnostics.report(
                        ErrorKind::InnerReferenceTagCountMismatch(tags.len(), inner.len()),
                        self.loc,
                    );
                }
            }
            let mut sets = Vec::with_capacity(inner.len());
            for tag_refs in inner {
                let mut set = BTreeSet::new();
                for text in tag_refs {
                    match self.param_reference(text, diagnostics) {
                        Some(r) => {
                            set.insert(r);
                        }
                        None => failed = true,
                    }
                }
                sets.push(set);
            }
            notation.return_inner_references = sets;
        }

        if failed {
            return None;
        }
        notation.normalize();
        Some(notation)
    }

    /// Parses `"<digit><tag>"` where tag is `_`, a letter or `...`.
    fn param_reference(&self, text: &str, diagnostics: &mut Diagnostics) -> Option<ParamReference> {
        let mut chars = text.chars();
        let Some(param) = chars.next().and_then(|c| c.to_digit(10)) else {
            diagnostics.report(ErrorKind::InvalidParamNumber(text.to_string()), self.loc);
            return None;
        };
        let param = param as usize;
        let rest = chars.as_str();

        let params = &self.function.params;
        if param >= params.len() {
            diagnostics.report(
                ErrorKind::ParamNumberOutOfRange(param, params.len()),
                self.loc,
            );
            return None;
        }

        let tag = match rest {
            "_" => ParamTag::Reference,
            "..." => ParamTag::Inner(ReferenceTag::Continuous),
            _ => {
                let mut letters = rest.chars();
                match (letters.next().and_then(ReferenceTag::from_letter), letters.next()) {
                    (Some(tag), None) => ParamTag::Inner(tag),
                    _ => {
                        diagnostics.report(
                            ErrorKind::InvalidInnerReferenceTagName(rest.to_string()),
                            self.loc,
                        );
                        return None;
                    }
                }
            }
        };

        let declared = &params[param];
        match tag {
            ParamTag::Reference if !declared.is_reference() => {
                diagnostics.report(
                    ErrorKind::ValueIsNotReference(declared.name.clone()),
                    self.loc,
                );
                return None;
            }
            ParamTag::Inner(ReferenceTag::Letter(index)) => {
                let count = self.model.inner_references(declared.ty).count();
                if let Some(count) = count.filter(|&c| index as usize >= c) {
                    diagnostics.report(
                        ErrorKind::ReferenceTagOutOfRange(
                            index as usize,
                            self.types.name(declared.ty).to_string(),
                            count,
                        ),
                        self.loc,
                    );
                    return None;
                }
            }
            _ => {}
        }
        Some(ParamReference { param, tag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usprache_ast::{FieldDecl, ParamDecl, ProgramBuilder, ReturnDecl, StructDecl};

    struct Fixture {
        types: TypeTable,
        model: TagModel,
        i32_ty: usprache_ast::TypeId,
        s: usprache_ast::TypeId,
    }

    fn fixture() -> Fixture {
        let mut b = ProgramBuilder::new();
        let i32_ty = b.fundamental("i32");
        let s = b.structure(StructDecl::new(
            "S",
            vec![FieldDecl::reference("x", i32_ty, Mutability::Mut)],
        ));
        let program = b.build();
        let mut d = Diagnostics::new();
        let model = TagModel::build(&program.types, &mut d);
        Fixture {
            types: program.types,
            model,
            i32_ty,
            s,
        }
    }

    fn push_fn(fx: &Fixture) -> FunctionDecl {
        FunctionDecl::new("Push")
            .param(ParamDecl::reference("s", fx.s, Mutability::Mut))
            .param(ParamDecl::reference("x", fx.i32_ty, Mutability::Mut))
    }

    fn build(fx: &Fixture, f: &FunctionDecl) -> (Option<FunctionReferenceNotation>, Diagnostics) {
        let mut d = Diagnostics::new();
        let n = build_notation(f, &fx.types, &fx.model, &mut d);
        (n, d)
    }

    #[test]
    fn test_default_notation_returns_all_reference_params() {
        let fx = fixture();
        let f = FunctionDecl::new("Pick")
            .param(ParamDecl::reference("a", fx.i32_ty, Mutability::Imut))
            .param(ParamDecl::value("b", fx.i32_ty, Mutability::Imut))
            .param(ParamDecl::reference("c", fx.i32_ty, Mutability::Imut))
            .returns(ReturnDecl::reference(fx.i32_ty, Mutability::Imut));
        let (n, d) = build(&fx, &f);
        assert!(d.is_empty());
        let n = n.unwrap();
        assert!(n.pollution.is_empty());
        assert_eq!(
            n.return_references,
            BTreeSet::from([ParamReference::reference(0), ParamReference::reference(2)])
        );
    }

    #[test]
    fn test_pollution_parses() {
        let fx = fixture();
        let f = push_fn(&fx).notation(RawNotation::new().pollution("0a", "1_", Mutability::Mut));
        let (n, d) = build(&fx, &f);
        assert!(d.is_empty());
        let n = n.unwrap();
        let p = n.pollution.iter().next().unwrap();
        assert_eq!(p.dst, ParamReference::inner(0, ReferenceTag::Letter(0)));
        assert_eq!(p.src, ParamReference::reference(1));
        assert_eq!(p.src.to_string(), "1_");
    }

    #[test]
    fn test_unparsable_notation_skips_function() {
        let fx = fixture();
        for (text, code) in [
            ("x_", "InvalidParamNumber"),
            ("5a", "ParamNumberOutOfRange"),
            ("0A", "InvalidInnerReferenceTagName"),
            ("0ab", "InvalidInnerReferenceTagName"),
            ("0c", "ReferenceTagOutOfRange"),
        ] {
            let f = push_fn(&fx).notation(RawNotation::new().pollution(text, "1_", Mutability::Mut));
            let (n, d) = build(&fx, &f);
            assert!(n.is_none(), "{text}");
            assert_eq!(d.errors()[0].code(), code, "{text}");
        }
    }

    #[test]
    fn test_invalid_pollution_entries_are_dropped() {
        let fx = fixture();
        let f = push_fn(&fx).notation(
            RawNotation::new()
                .pollution("0_", "1_", Mutability::Mut)
                .pollution("0a", "0a", Mutability::Mut)
                .pollution("0a", "1_", Mutability::Imut),
        );
        let (n, d) = build(&fx, &f);
        let codes: Vec<_> = d.errors().iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["ArgReferencePollution", "SelfReferencePollution"]);
        assert_eq!(n.unwrap().pollution.len(), 1);
    }

    #[test]
    fn test_reference_tag_on_value_param() {
        let fx = fixture();
        let f = FunctionDecl::new("F")
            .param(ParamDecl::value("s", fx.s, Mutability::Imut))
            .returns(ReturnDecl::reference(fx.i32_ty, Mutability::Imut))
            .notation(RawNotation::new().return_references(["0_"]));
        let (n, d) = build(&fx, &f);
        assert!(n.is_none());
        assert_eq!(d.errors()[0].code(), "ValueIsNotReference");
    }

    #[test]
    fn test_return_inner_count_must_match() {
        let fx = fixture();
        let f = FunctionDecl::new("Make")
            .param(ParamDecl::reference("x", fx.i32_ty, Mutability::Mut))
            .returns(ReturnDecl::value(fx.s))
            .notation(RawNotation::new().return_inner(["0_"]).return_inner(["0_"]));
        let (_, d) = build(&fx, &f);
        assert_eq!(
            d.errors()[0].kind,
            ErrorKind::InnerReferenceTagCountMismatch(1, 2)
        );
    }

    #[test]
    fn test_normalization_prefers_mutable_entry() {
        let fx = fixture();
        let a = push_fn(&fx).notation(
            RawNotation::new()
                .pollution("0a", "1_", Mutability::Imut)
                .pollution("0a", "1_", Mutability::Mut),
        );
        let b = push_fn(&fx).notation(RawNotation::new().pollution("0a", "1_", Mutability::Mut));
        assert_eq!(build(&fx, &a).0, build(&fx, &b).0);
    }

    #[test]
    fn test_compatibility_is_containment() {
        let fx = fixture();
        let none = build(&fx, &push_fn(&fx).notation(RawNotation::new())).0.unwrap();
        let imut = build(
            &fx,
            &push_fn(&fx).notation(RawNotation::new().pollution("0a", "1_", Mutability::Imut)),
        )
        .0
        .unwrap();
        let mutable = build(
            &fx,
            &push_fn(&fx).notation(RawNotation::new().pollution("0a", "1_", Mutability::Mut)),
        )
        .0
        .unwrap();
        assert!(is_notation_compatible(&none, &imut));
        assert!(is_notation_compatible(&imut, &mutable));
        assert!(!is_notation_compatible(&mutable, &imut));
        assert!(!is_notation_compatible(&imut, &none));
    }
}
