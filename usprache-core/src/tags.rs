//! Inner reference tags of types.
//!
//! A type carries one tag per independent group of references stored inside
//! its values. Struct fields map their own tags (or, for reference fields,
//! the single reference) onto the struct's tags; tuples concatenate element
//! tags and arrays share the tags of their element.

use std::collections::HashMap;
use std::fmt;

use usprache_ast::{InnerReferenceCount, Mutability, StructDecl, TypeId, TypeKind, TypeTable};

use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;

pub const MAX_REFERENCE_TAGS: usize = 26;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceTag {
    /// `a`..=`z`, stored as 0..=25.
    Letter(u8),
    /// Every tag of the type, whatever their number turns out to be.
    Continuous,
}

impl ReferenceTag {
    pub fn from_letter(c: char) -> Option<Self> {
        c.is_ascii_lowercase().then(|| ReferenceTag::Letter(c as u8 - b'a'))
    }

    pub fn from_index(index: usize) -> Option<Self> {
        (index < MAX_REFERENCE_TAGS).then_some(ReferenceTag::Letter(index as u8))
    }

    pub fn index(self) -> Option<usize> {
        match self {
            ReferenceTag::Letter(i) => Some(i as usize),
            ReferenceTag::Continuous => None,
        }
    }
}

impl fmt::Display for ReferenceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceTag::Letter(i) => write!(f, "{}", (b'a' + i) as char),
            ReferenceTag::Continuous => f.write_str("..."),
        }
    }
}

pub fn tag_letter(index: usize) -> String {
    ReferenceTag::from_index(index)
        .map(|t| t.to_string())
        .unwrap_or_else(|| index.to_string())
}

/// Parses a run of tag letters like `"ab"` into tag indices.
/// On failure returns the offending text.
pub fn parse_tag_letters(text: &str) -> Result<Vec<usize>, String> {
    text.chars()
        .map(|c| {
            ReferenceTag::from_letter(c)
                .and_then(ReferenceTag::index)
                .ok_or_else(|| text.to_string())
        })
        .collect()
}

/// Inner reference tags of a type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InnerReferenceSet {
    /// One entry per tag, in tag order.
    Resolved(Vec<Mutability>),
    /// Depends on template arguments not known yet. Never treated as empty
    /// by validation.
    Unresolved,
}

impl InnerReferenceSet {
    pub fn empty() -> Self {
        InnerReferenceSet::Resolved(Vec::new())
    }

    pub fn count(&self) -> Option<usize> {
        match self {
            InnerReferenceSet::Resolved(tags) => Some(tags.len()),
            InnerReferenceSet::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, InnerReferenceSet::Resolved(_))
    }

    /// Resolved tags, or nothing for unresolved sets.
    pub fn tags(&self) -> &[Mutability] {
        match self {
            InnerReferenceSet::Resolved(tags) => tags,
            InnerReferenceSet::Unresolved => &[],
        }
    }
}

/// How the members of a struct or tuple map onto its tags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberLayout {
    /// For every member, the owner tag of each of the member's own tags.
    /// A reference field has exactly one entry.
    pub member_tags: Vec<Vec<usize>>,
}

#[derive(Clone, Debug, Default)]
pub struct TagModel {
    sets: Vec<InnerReferenceSet>,
    layouts: HashMap<TypeId, MemberLayout>,
}

static UNRESOLVED: InnerReferenceSet = InnerReferenceSet::Unresolved;

impl TagModel {
    /// Computes tags of every type in the table, reporting malformed struct
    /// tag declarations.
    pub fn build(types: &TypeTable, diagnostics: &mut Diagnostics) -> Self {
        let mut builder = ModelBuilder {
            types,
            diagnostics,
            sets: vec![None; types.len()],
            in_progress: vec![false; types.len()],
            layouts: HashMap::new(),
        };
        for (id, _) in types.iter() {
            builder.compute(id);
        }
        let sets = builder
            .sets
            .into_iter()
            .map(|s| s.unwrap_or(InnerReferenceSet::Unresolved))
            .collect();
        TagModel {
            sets,
            layouts: builder.layouts,
        }
    }

    pub fn inner_references(&self, ty: TypeId) -> &InnerReferenceSet {
        self.sets.get(ty.index()).unwrap_or(&UNRESOLVED)
    }

    pub fn tags(&self, ty: TypeId) -> &[Mutability] {
        self.inner_references(ty).tags()
    }

    /// Owner tags of the given member's own tags. Empty for members without
    /// references and for types without a layout.
    pub fn member_tags(&self, ty: TypeId, member: usize) -> &[usize] {
        self.layouts
            .get(&ty)
            .and_then(|l| l.member_tags.get(member))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

struct ModelBuilder<'a> {
    types: &'a TypeTable,
    diagnostics: &'a mut Diagnostics,
    sets: Vec<Option<InnerReferenceSet>>,
    in_progress: Vec<bool>,
    layouts: HashMap<TypeId, MemberLayout>,
}

impl ModelBuilder<'_> {
    fn compute(&mut self, id: TypeId) -> InnerReferenceSet {
        let i = id.index();
        if i >= self.sets.len() {
            return InnerReferenceSet::Unresolved;
        }
        if let Some(set) = &self.sets[i] {
            return set.clone();
        }
        // Only reachable through reference fields, whose referenced type
        // contributes no tags to the struct.
        if self.in_progress[i] {
            return InnerReferenceSet::empty();
        }
        self.in_progress[i] = true;

        let types = self.types;
        let set = match types.get(id).map(|d| &d.kind) {
            None => InnerReferenceSet::Unresolved,
            Some(TypeKind::Fundamental) => InnerReferenceSet::empty(),
            Some(TypeKind::Struct(decl)) => self.compute_struct(id, decl),
            Some(TypeKind::Tuple(elements)) => self.compute_tuple(id, elements),
            Some(TypeKind::Array { element, .. }) => self.compute(*element),
            Some(TypeKind::Dependent(InnerReferenceCount::Resolved(tags))) => {
                InnerReferenceSet::Resolved(tags.clone())
            }
            Some(TypeKind::Dependent(InnerReferenceCount::Unresolved)) => {
                InnerReferenceSet::Unresolved
            }
            Some(TypeKind::Coroutine {
                inner_references, ..
            }) => InnerReferenceSet::Resolved(inner_references.clone()),
        };

        self.in_progress[i] = false;
        self.sets[i] = Some(set.clone());
        set
    }

    fn compute_tuple(&mut self, id: TypeId, elements: &[TypeId]) -> InnerReferenceSet {
        let mut tags = Vec::new();
        let mut member_tags = Vec::with_capacity(elements.len());
        for element in elements {
            match self.compute(*element) {
                InnerReferenceSet::Unresolved => return InnerReferenceSet::Unresolved,
                InnerReferenceSet::Resolved(element_tags) => {
                    member_tags.push((tags.len()..tags.len() + element_tags.len()).collect());
                    tags.extend(element_tags);
                }
            }
        }
        self.layouts.insert(id, MemberLayout { member_tags });
        InnerReferenceSet::Resolved(tags)
    }

    fn compute_struct(&mut self, id: TypeId, decl: &StructDecl) -> InnerReferenceSet {
        // Fields that contribute tags, with the mutability of each of their own tags.
        let mut sources: Vec<(usize, Vec<Mutability>)> = Vec::new();
        let mut unresolved = false;

        for (index, field) in decl.fields.iter().enumerate() {
            let field_set = self.compute(field.ty);
            match field.reference {
                Some(mutability) => {
                    if field_set.count().is_some_and(|c| c > 0) {
                        self.diagnostics.report(
                            ErrorKind::ReferenceFieldOfTypeWithReferencesInside(field.name.clone()),
                            field.loc,
                        );
                    }
                    sources.push((index, vec![mutability]));
                }
                None => match field_set {
                    InnerReferenceSet::Unresolved => unresolved = true,
                    InnerReferenceSet::Resolved(tags) if !tags.is_empty() => {
                        sources.push((index, tags))
                    }
                    InnerReferenceSet::Resolved(_) => {
                        if let Some(text) = &field.tags {
                            self.diagnostics.report(
                                ErrorKind::InnerReferenceTagCountMismatch(0, text.chars().count()),
                                field.loc,
                            );
                        }
                    }
                },
            }
        }
        if unresolved {
            return InnerReferenceSet::Unresolved;
        }

        let implicit = sources.len() == 1;
        let mut tag_mutability: Vec<Option<Mutability>> = Vec::new();
        let mut member_tags = vec![Vec::new(); decl.fields.len()];

        for (index, expected) in sources {
            let field = &decl.fields[index];
            let letters = match &field.tags {
                Some(text) => match parse_tag_letters(text) {
                    Ok(letters) => letters,
                    Err(bad) => {
                        self.diagnostics
                            .report(ErrorKind::InvalidInnerReferenceTagName(bad), field.loc);
                        continue;
                    }
                },
                None if implicit => (0..expected.len()).collect(),
                None => {
                    self.diagnostics.report(
                        ErrorKind::ExpectedReferenceNotation(field.name.clone()),
                        field.loc,
                    );
                    continue;
                }
            };
            if letters.len() != expected.len() {
                self.diagnostics.report(
                    ErrorKind::InnerReferenceTagCountMismatch(expected.len(), letters.len()),
                    field.loc,
                );
                continue;
            }
            for (&tag, &mutability) in letters.iter().zip(&expected) {
                if tag_mutability.len() <= tag {
                    tag_mutability.resize(tag + 1, None);
                }
                match tag_mutability[tag] {
                    None => tag_mutability[tag] = Some(mutability),
                    Some(previous) if previous != mutability => {
                        self.diagnostics.report(
                            ErrorKind::MixingMutableAndImmutableReferencesInSameReferenceTag(
                                tag_letter(tag),
                            ),
                            field.loc,
                        );
                        tag_mutability[tag] = Some(Mutability::Mut);
                    }
                    Some(_) => {}
                }
            }
            member_tags[index] = letters;
        }

        let mut tags = Vec::with_capacity(tag_mutability.len());
        for (tag, mutability) in tag_mutability.into_iter().enumerate() {
            match mutability {
                Some(m) => tags.push(m),
                None => {
                    self.diagnostics
                        .report(ErrorKind::UnusedReferenceTag(tag_letter(tag)), decl.loc);
                    tags.push(Mutability::Imut);
                }
            }
        }

        if let Some(declared) = &decl.tags {
            match parse_tag_letters(declared) {
                Ok(letters) if letters.len() != tags.len() => self.diagnostics.report(
                    ErrorKind::InnerReferenceTagCountMismatch(tags.len(), letters.len()),
                    decl.loc,
                ),
                Ok(_) => {}
                Err(bad) => self
                    .diagnostics
                    .report(ErrorKind::InvalidInnerReferenceTagName(bad), decl.loc),
            }
        }

        tracing::trace!(name = %decl.name, tags = tags.len(), "struct reference tags");
        self.layouts.insert(id, MemberLayout { member_tags });
        InnerReferenceSet::Resolved(tags)
    }
}
