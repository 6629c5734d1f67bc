//! Error collection for one analysis run.

use std::collections::HashSet;

use usprache_ast::SrcLoc;

use crate::error::{CodeBuilderError, ErrorKind};

/// Ordered, append-only error sink.
///
/// Analysis never stops at the first problem; every check reports here and
/// carries on with the least surprising state.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    errors: Vec<CodeBuilderError>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, kind: ErrorKind, loc: SrcLoc) {
        tracing::trace!(code = kind.code(), %loc, "diagnostic");
        self.errors.push(CodeBuilderError::new(kind, loc));
    }

    pub fn push(&mut self, error: CodeBuilderError) {
        self.errors.push(error);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.errors.extend(other.errors);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[CodeBuilderError] {
        &self.errors
    }

    /// Stable-sorts by location and drops exact duplicates.
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.errors.retain(|e| seen.insert(e.clone()));
        self.errors.sort_by_key(|e| e.src_loc);
    }

    pub fn truncate(&mut self, max: usize) {
        self.errors.truncate(max);
    }

    pub fn into_errors(self) -> Vec<CodeBuilderError> {
        self.errors
    }

    pub fn has_code(&self, code: &str) -> bool {
        let mut found = false;
        for e in &self.errors {
            e.visit(&mut |e| found |= e.code() == code);
        }
        found
    }
}
