//! Include resolution.
//!
//! Every list name seen anywhere (a parsed list or an affiliation target) is a
//! node. Rules attach to their own list and to each affiliated list; include
//! directives become filtered edges. Nodes are resolved post-order with an
//! explicit stack, so cycles are reported with their full path and deep
//! include chains never recurse.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use exn::OptionExt;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::models::{DomainRule, IncludeRule, ResolvedList, RuleKind, SourceEntry};
use crate::parser::normalize_list_name;

/// An include edge with its attribute filter.
#[derive(Debug)]
struct Inclusion {
    target: String,
    must_attrs: Vec<String>,
    ban_attrs: Vec<String>,
}
impl Inclusion {
    fn admits(&self, rule: &DomainRule) -> bool {
        if self.must_attrs.is_empty() && self.ban_attrs.is_empty() {
            return true;
        }
        if rule.attrs.is_empty() {
            return self.must_attrs.is_empty();
        }
        self.must_attrs.iter().all(|attr| rule.has_attr(attr)) && !self.ban_attrs.iter().any(|attr| rule.has_attr(attr))
    }
}
impl From<&IncludeRule> for Inclusion {
    fn from(include: &IncludeRule) -> Self {
        Self {
            target: include.source_list.clone(),
            must_attrs: include.must_attrs.clone(),
            ban_attrs: include.ban_attrs.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Node {
    rules: Vec<Arc<DomainRule>>,
    inclusions: Vec<Inclusion>,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: BTreeMap<String, Node>,
}
impl Graph {
    fn build(parsed: &BTreeMap<String, Vec<SourceEntry>>) -> Result<Self> {
        let mut graph = Self::default();
        for name in parsed.keys() {
            graph.nodes.entry(normalize_list_name(name)?).or_default();
        }
        for (name, entries) in parsed {
            let name = normalize_list_name(name)?;
            for entry in entries {
                match entry {
                    SourceEntry::Include(include) => graph.node_mut(&name).inclusions.push(include.into()),
                    SourceEntry::Rule(rule) => {
                        let rule = Arc::new(rule.clone());
                        for affiliation in &rule.affiliations {
                            graph.node_mut(affiliation).rules.push(Arc::clone(&rule));
                        }
                        graph.node_mut(&name).rules.push(rule);
                    },
                }
            }
        }
        Ok(graph)
    }

    fn node_mut(&mut self, name: &str) -> &mut Node {
        self.nodes.entry(name.to_string()).or_default()
    }

    fn node(&self, name: &str) -> Result<&Node> {
        self.nodes.get(name).ok_or_raise(|| ErrorKind::UnknownList(name.to_string()))
    }

    /// Resolve `root` and everything it (transitively) includes into `resolved`.
    fn resolve_from<'g>(&'g self, root: &'g str, resolved: &mut BTreeMap<String, ResolvedList>) -> Result<()> {
        if resolved.contains_key(root) {
            return Ok(());
        }
        // (list, index of the next inclusion to visit)
        let mut stack: Vec<(&'g str, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let (name, index) = *frame;
            frame.1 += 1;
            let node = self.node(name)?;

            let Some(inclusion) = node.inclusions.get(index) else {
                stack.pop();
                let list = merge(name, node, resolved);
                resolved.insert(name.to_string(), list);
                continue;
            };
            let target = inclusion.target.as_str();
            if resolved.contains_key(target) {
                continue;
            }
            if !self.nodes.contains_key(target) {
                exn::bail!(ErrorKind::MissingInclude { list: name.to_string(), target: target.to_string() });
            }
            if stack.iter().any(|(ancestor, _)| *ancestor == target) {
                let mut path: Vec<String> = stack.iter().map(|(ancestor, _)| (*ancestor).to_string()).collect();
                path.push(target.to_string());
                exn::bail!(ErrorKind::CircularInclusion(path));
            }
            stack.push((target, 0));
        }
        Ok(())
    }
}

/// Own rules first, then each inclusion in declaration order; a later rule
/// with the same `plain` key replaces an earlier one. Keying by `plain` in a
/// `BTreeMap` leaves the result sorted.
fn merge(name: &str, node: &Node, resolved: &BTreeMap<String, ResolvedList>) -> ResolvedList {
    let mut rough: BTreeMap<String, Arc<DomainRule>> = BTreeMap::new();
    for rule in &node.rules {
        rough.insert(rule.plain.clone(), Arc::clone(rule));
    }
    for inclusion in &node.inclusions {
        let Some(included) = resolved.get(&inclusion.target) else {
            continue;
        };
        for entry in included.entries.iter().filter(|entry| inclusion.admits(entry)) {
            rough.insert(entry.plain.clone(), Arc::clone(entry));
        }
    }
    ResolvedList { name: name.to_string(), entries: elide_redundant(&rough) }
}

fn elide_redundant(rough: &BTreeMap<String, Arc<DomainRule>>) -> Vec<Arc<DomainRule>> {
    let domains: HashSet<&str> = rough
        .values()
        .filter(|rule| rule.kind == RuleKind::Domain && rule.attrs.is_empty())
        .map(|rule| rule.value.as_str())
        .collect();
    rough.values().filter(|rule| !is_redundant(rule, &domains)).cloned().collect()
}

/// Whether an attribute-less `domain` or `full` rule is already covered by a
/// shorter attribute-less `domain` rule.
fn is_redundant(rule: &DomainRule, domains: &HashSet<&str>) -> bool {
    if !rule.attrs.is_empty() {
        return false;
    }
    let mut parent = match rule.kind {
        // A full rule behaves as if it had a leading dot, so its own value is
        // the first parent checked.
        RuleKind::Full if domains.contains(rule.value.as_str()) => return true,
        RuleKind::Full | RuleKind::Domain => rule.value.as_str(),
        RuleKind::Keyword | RuleKind::Regexp => return false,
    };
    while let Some((_, rest)) = parent.split_once('.') {
        if domains.contains(rest) {
            return true;
        }
        parent = rest;
    }
    false
}

/// Resolve every list, keyed by canonical list name.
///
/// Any missing include target or inclusion cycle aborts the whole run.
#[instrument(skip(parsed), fields(lists = parsed.len(), resolved))]
pub fn resolve_all(parsed: &BTreeMap<String, Vec<SourceEntry>>) -> Result<BTreeMap<String, ResolvedList>> {
    let graph = Graph::build(parsed)?;
    let mut resolved = BTreeMap::new();
    for name in graph.nodes.keys() {
        graph.resolve_from(name, &mut resolved)?;
    }
    tracing::Span::current().record("resolved", resolved.len());
    Ok(resolved)
}

/// Resolve everything and return the one list asked for.
pub fn resolve_one(parsed: &BTreeMap<String, Vec<SourceEntry>>, list_name: &str) -> Result<ResolvedList> {
    let name = normalize_list_name(list_name)?;
    let mut resolved = resolve_all(parsed)?;
    resolved.remove(&name).ok_or_raise(|| ErrorKind::UnknownList(name))
}
