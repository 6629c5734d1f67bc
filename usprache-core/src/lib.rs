#![forbid(unsafe_code)]

//! Reference checking for Ü programs.
//!
//! Every function body is walked over an alias graph of variables and
//! references. The checker enforces that a variable is either mutably
//! referenced once or immutably referenced any number of times, tracks
//! moves, and verifies that what a function does with references matches
//! its declared reference notation.

pub mod alias_graph;
pub mod checker;
pub mod config;
pub mod control_flow;
pub mod diagnostics;
pub mod error;
mod function_checker;
pub mod linker;
pub mod notation;
pub mod scopes;
pub mod tags;
pub mod variables;

pub use checker::Checker;
pub use config::{AnalysisConfig, ConfigError};
pub use diagnostics::Diagnostics;
pub use error::{CodeBuilderError, ErrorKind, TemplateErrorsContext};
pub use notation::{
    FunctionReferenceNotation, ParamReference, ParamTag, ReferencePollution, build_notation,
    default_notation, is_notation_compatible,
};
pub use tags::{InnerReferenceSet, ReferenceTag, TagModel};
