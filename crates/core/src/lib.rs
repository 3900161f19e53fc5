//! Geosite domain lists, resolved and rendered as Surge rule sets.
//!
//! The pipeline is pure and runs in one direction:
//!
//! 1. [`parse_list_text`] / [`parse_lists`] turn list source into [`SourceEntry`]s.
//! 2. [`resolve_all`] flattens includes and affiliations into [`ResolvedList`]s.
//! 3. [`emit`] renders a resolved list as Surge rules, converting regexps with
//!    [`transpile`] under a [`Mode`].
//! 4. [`stats`] summarises any of the above.

mod consts;
mod emit;
mod error;
mod models;
mod parser;
mod resolver;
pub mod stats;
mod transpiler;

use std::collections::BTreeMap;

pub use emit::{EmitOptions, EmitReport, Emitted, NativeRule, OnUnsupported, RegexCounts, RegexIssue, emit};
pub use error::{Error, ErrorKind, Result};
pub use models::{DomainRule, IncludeRule, ResolvedList, RuleKind, SourceEntry, SourceLocation};
pub use parser::{normalize_list_name, parse_list_text, parse_lists};
pub use resolver::{resolve_all, resolve_one};
pub use transpiler::{Mode, NativeKind, ParseModeError, Status, TranspileResult, transpile};

/// Parse and resolve a whole set of lists in one go.
///
/// ```
/// use geosite_core::build_resolved_lists;
///
/// let lists = build_resolved_lists([("a", "include:b\na.com"), ("b", "b.com")]).unwrap();
/// assert_eq!(lists["A"].entries.len(), 2);
/// ```
pub fn build_resolved_lists<I, K, V>(sources: I) -> Result<BTreeMap<String, ResolvedList>>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    resolve_all(&parse_lists(sources)?)
}
