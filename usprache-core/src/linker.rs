#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use usprache_ast::{Mutability, SrcLoc};

use crate::alias_graph::{AliasGraph, NodeId, NodeKind};
use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::notation::{FunctionReferenceNotation, ParamReference, ParamTag};
use crate::tags::ReferenceTag;

/// An evaluated argument of a call.
#[derive(Clone, Debug)]
pub struct CallArgument {
    /// Reference node for reference params, temporary value otherwise.
    pub node: NodeId,
    /// Tag count of the argument's type, if known.
    pub tag_count: Option<usize>,
}

/// Node receiving the result of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallResult {
    None,
    Reference(NodeId),
    Value(NodeId),
}

/// Applies a callee's notation at a call site: adds the pollution edges
/// between arguments and links the result to the argument references it may
/// alias. Entries that do not fit the actual arguments are reported and
/// skipped.
pub fn link_call(
    graph: &mut AliasGraph,
    notation: &FunctionReferenceNotation,
    args: &[CallArgument],
    result: CallResult,
    diagnostics: &mut Diagnostics,
    loc: SrcLoc,
) {
    let mut linker = Linker {
        graph,
        args,
        diagnostics,
        loc,
    };

    for pollution in &notation.pollution {
        let (Some(dst), Some(src)) = (linker.expand(pollution.dst), linker.expand(pollution.src))
        else {
            continue;
        };
        for &d in &dst {
            for &s in &src {
                linker.link(s, d, pollution.src_mutability);
            }
        }
    }

    match result {
        CallResult::None => {}
        CallResult::Reference(node) => {
            let mutability = match linker.graph.kind(node) {
                NodeKind::Reference(m) => m,
                NodeKind::Variable => Mutability::Imut,
            };
            for &r in &notation.return_references {
                let Some(sources) = linker.expand(r) else {
                    continue;
                };
                for s in sources {
                    linker.link(s, node, mutability);
                }
            }
        }
        CallResult::Value(node) => {
            let inner = linker.graph.inner_nodes(node).to_vec();
            for (tag, refs) in notation.return_inner_references.iter().enumerate() {
                let Some(&dst) = inner.get(tag) else {
                    continue;
                };
                let mutability = match linker.graph.kind(dst) {
                    NodeKind::Reference(m) => m,
                    NodeKind::Variable => Mutability::Imut,
                };
                for &r in refs {
                    let Some(sources) = linker.expand(r) else {
                        continue;
                    };
                    for s in sources {
                        linker.link(s, dst, mutability);
                    }
                }
            }
        }
    }
}

struct Linker<'a> {
    graph: &'a mut AliasGraph,
    args: &'a [CallArgument],
    diagnostics: &'a mut Diagnostics,
    loc: SrcLoc,
}

impl Linker<'_> {
    /// Nodes designated by a param reference at this call site. A continuous
    /// tag covers every tag of the actual argument, possibly none. Inner tags
    /// of an argument whose tag count is unknown do not fit it.
    fn expand(&mut self, r: ParamReference) -> Option<BTreeSet<NodeId>> {
        let Some(arg) = self.args.get(r.param) else {
            self.diagnostics
                .report(ErrorKind::UnallowedReferencePollution, self.loc);
            return None;
        };
        let ParamTag::Inner(tag) = r.tag else {
            return Some(BTreeSet::from([arg.node]));
        };
        let Some(count) = arg.tag_count else {
            tracing::warn!(param = r.param, "argument with unresolved inner references");
            self.diagnostics
                .report(ErrorKind::UnallowedReferencePollution, self.loc);
            return None;
        };
        match tag {
            ReferenceTag::Letter(tag) => {
                let tag = tag as usize;
                if tag >= count {
                    self.diagnostics
                        .report(ErrorKind::UnallowedReferencePollution, self.loc);
                    return None;
                }
                Some(self.graph.inner_of(arg.node, tag))
            }
            ReferenceTag::Continuous => {
                Some(
                    (0..count)
                        .flat_map(|tag| self.graph.inner_of(arg.node, tag))
                        .collect(),
                )
            }
        }
    }

    fn link(&mut self, referent: NodeId, reference: NodeId, mutability: Mutability) {
        if let Err(violation) = self.graph.try_add_edge(referent, reference, mutability) {
            self.diagnostics
                .report(ErrorKind::ReferenceProtectionError(violation.name), self.loc);
        }
    }
}
