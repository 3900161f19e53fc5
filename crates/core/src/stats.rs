//! Counts over source, resolved and emitted lists.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::emit::{Emitted, RegexCounts, RegexIssue};
use crate::models::{DomainRule, ResolvedList, RuleKind, SourceEntry};
use crate::transpiler::Mode;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceCounts {
    pub domain: usize,
    pub full: usize,
    pub keyword: usize,
    pub regexp: usize,
    pub include: usize,
    pub affiliations: usize,
    pub attributes: usize,
}
impl SourceCounts {
    #[must_use]
    pub fn from_entries(entries: &[SourceEntry]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry {
                SourceEntry::Include(include) => {
                    counts.include += 1;
                    counts.attributes += include.attrs.len();
                },
                SourceEntry::Rule(rule) => {
                    *counts.kind_mut(rule.kind) += 1;
                    counts.affiliations += rule.affiliations.len();
                    counts.attributes += rule.attrs.len();
                },
            }
        }
        counts
    }

    fn kind_mut(&mut self, kind: RuleKind) -> &mut usize {
        match kind {
            RuleKind::Domain => &mut self.domain,
            RuleKind::Full => &mut self.full,
            RuleKind::Keyword => &mut self.keyword,
            RuleKind::Regexp => &mut self.regexp,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.domain += other.domain;
        self.full += other.full;
        self.keyword += other.keyword;
        self.regexp += other.regexp;
        self.include += other.include;
        self.affiliations += other.affiliations;
        self.attributes += other.attributes;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedCounts {
    pub rules: usize,
    pub domain: usize,
    pub full: usize,
    pub keyword: usize,
    pub regexp: usize,
}
impl ResolvedCounts {
    #[must_use]
    pub fn from_entries(entries: &[Arc<DomainRule>]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            counts.rules += 1;
            match entry.kind {
                RuleKind::Domain => counts.domain += 1,
                RuleKind::Full => counts.full += 1,
                RuleKind::Keyword => counts.keyword += 1,
                RuleKind::Regexp => counts.regexp += 1,
            }
        }
        counts
    }

    fn merge(&mut self, other: &Self) {
        self.rules += other.rules;
        self.domain += other.domain;
        self.full += other.full;
        self.keyword += other.keyword;
        self.regexp += other.regexp;
    }
}

/// How many resolved entries carry each attribute.
#[must_use]
pub fn count_filter_attrs(entries: &[Arc<DomainRule>]) -> BTreeMap<String, usize> {
    let mut attrs = BTreeMap::new();
    for attr in entries.iter().flat_map(|entry| entry.attrs.iter()) {
        *attrs.entry(attr.clone()).or_insert(0) += 1;
    }
    attrs
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilterStats {
    pub attrs: BTreeMap<String, usize>,
}

/// The emitted size of a list under one mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModeStats {
    pub rules: usize,
    /// UTF-8 length of the emitted text.
    pub bytes: usize,
    pub regex: RegexCounts,
    pub unsupported: Vec<RegexIssue>,
}
impl From<&Emitted> for ModeStats {
    fn from(emitted: &Emitted) -> Self {
        Self {
            rules: emitted.lines.len(),
            bytes: emitted.text.len(),
            regex: emitted.report.regex,
            unsupported: emitted.report.unsupported.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListStats {
    pub name: String,
    pub source: SourceCounts,
    pub resolved: ResolvedCounts,
    pub filters: FilterStats,
    pub modes: BTreeMap<Mode, ModeStats>,
}
impl ListStats {
    /// `source` is empty for lists that only exist as affiliation targets.
    #[must_use]
    pub fn new<'a>(
        source: &[SourceEntry],
        resolved: &ResolvedList,
        emitted: impl IntoIterator<Item = (Mode, &'a Emitted)>,
    ) -> Self {
        Self {
            name: resolved.name.clone(),
            source: SourceCounts::from_entries(source),
            resolved: ResolvedCounts::from_entries(&resolved.entries),
            filters: FilterStats { attrs: count_filter_attrs(&resolved.entries) },
            modes: emitted.into_iter().map(|(mode, emitted)| (mode, ModeStats::from(emitted))).collect(),
        }
    }
}

/// Per-mode totals; the issue lists stay with each list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModeTotals {
    pub rules: usize,
    pub bytes: usize,
    pub regex: RegexCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalStats {
    pub lists: usize,
    pub source: SourceCounts,
    pub resolved: ResolvedCounts,
    pub modes: BTreeMap<Mode, ModeTotals>,
}
impl GlobalStats {
    #[must_use]
    pub fn aggregate(lists: &[ListStats]) -> Self {
        let mut global = Self {
            lists: lists.len(),
            source: SourceCounts::default(),
            resolved: ResolvedCounts::default(),
            modes: Mode::ALL.into_iter().map(|mode| (mode, ModeTotals::default())).collect(),
        };
        for list in lists {
            global.source.merge(&list.source);
            global.resolved.merge(&list.resolved);
            for (mode, stats) in &list.modes {
                let totals = global.modes.entry(*mode).or_default();
                totals.rules += stats.rules;
                totals.bytes += stats.bytes;
                totals.regex.merge(&stats.regex);
            }
        }
        global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{EmitOptions, emit};
    use crate::parser::parse_list_text;
    use crate::resolver::resolve_all;

    #[test]
    fn test_list_and_global_stats() {
        let text = "a.com @cn\nfull:b.com &OTHER @cn @ads\nkeyword:c\nregexp:^[a-z]+\\.d\\.com$\ninclude:other @cn";
        let entries = parse_list_text("demo", text).unwrap();
        let counts = SourceCounts::from_entries(&entries);
        assert_eq!(
            counts,
            SourceCounts { domain: 1, full: 1, keyword: 1, regexp: 1, include: 1, affiliations: 1, attributes: 4 }
        );

        let parsed = BTreeMap::from([("DEMO".to_string(), entries.clone())]);
        let resolved = resolve_all(&parsed).unwrap();
        let demo = &resolved["DEMO"];
        assert_eq!(count_filter_attrs(&demo.entries), BTreeMap::from([("ads".to_string(), 1), ("cn".to_string(), 2)]));

        let emitted: Vec<(Mode, Emitted)> = Mode::ALL
            .into_iter()
            .map(|mode| (mode, emit(demo, &EmitOptions::with_mode(mode)).unwrap()))
            .collect();
        let stats = ListStats::new(&entries, demo, emitted.iter().map(|(mode, emitted)| (*mode, emitted)));
        assert_eq!(stats.resolved, ResolvedCounts { rules: 4, domain: 1, full: 1, keyword: 1, regexp: 1 });
        assert_eq!(stats.modes[&Mode::Strict].rules, 3);
        assert_eq!(stats.modes[&Mode::Strict].unsupported.len(), 1);
        assert_eq!(stats.modes[&Mode::Balanced].rules, 4);
        assert_eq!(stats.modes[&Mode::Balanced].bytes, emitted[1].1.text.len());

        let other = ListStats::new(&[], &resolved["OTHER"], std::iter::empty());
        let global = GlobalStats::aggregate(&[stats, other]);
        assert_eq!(global.lists, 2);
        assert_eq!(global.source, counts);
        assert_eq!(global.resolved.rules, 5);
        assert_eq!(global.modes[&Mode::Full].regex.widened, 1);
        assert_eq!(global.modes[&Mode::Strict].regex.unsupported, 1);
    }
}
