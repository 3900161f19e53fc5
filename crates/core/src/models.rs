//! Source entries and resolved lists.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

/// Where a rule came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceLocation {
    /// Canonical (uppercase) name of the list the line belongs to.
    pub list: String,
    /// 1-based line number.
    pub line: usize,
}

/// The four kinds of domain-matching rule in the list DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RuleKind {
    /// Matches the domain and all of its subdomains.
    Domain,
    /// Matches the exact domain only.
    Full,
    /// Matches any domain containing the value.
    Keyword,
    /// Matches domains against a regular expression.
    Regexp,
}
impl RuleKind {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Full => "full",
            Self::Keyword => "keyword",
            Self::Regexp => "regexp",
        }
    }
}
impl Display for RuleKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// A single domain-matching rule.
///
/// `attrs` is always sorted ascending, and `plain` is the canonical
/// `type:value[:@attr,...]` key used for deduplication and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DomainRule {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: RuleKind,
    pub value: String,
    pub attrs: Vec<String>,
    pub affiliations: Vec<String>,
    pub plain: String,
    pub source: SourceLocation,
}
impl DomainRule {
    pub(crate) fn new(
        kind: RuleKind,
        value: String,
        mut attrs: Vec<String>,
        affiliations: Vec<String>,
        source: SourceLocation,
    ) -> Self {
        attrs.sort();
        attrs.dedup();
        let plain = Self::plain_key(kind, &value, &attrs);
        Self { kind, value, attrs, affiliations, plain, source }
    }

    fn plain_key(kind: RuleKind, value: &str, attrs: &[String]) -> String {
        if attrs.is_empty() {
            return format!("{kind}:{value}");
        }
        let attrs = attrs.iter().map(|attr| format!("@{attr}")).collect::<Vec<_>>().join(",");
        format!("{kind}:{value}:{attrs}")
    }

    /// Whether the rule carries the given attribute.
    #[must_use]
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.binary_search_by(|candidate| candidate.as_str().cmp(attr)).is_ok()
    }
}

/// Renders the rule back to a line of list source.
///
/// ```
/// use geosite_core::parse_list_text;
///
/// let entries = parse_list_text("demo", "full:Example.COM @cn &other").unwrap();
/// assert_eq!(entries[0].to_string(), "full:example.com @cn &OTHER");
/// ```
impl Display for DomainRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.kind, self.value)?;
        for attr in &self.attrs {
            write!(f, " @{attr}")?;
        }
        for affiliation in &self.affiliations {
            write!(f, " &{affiliation}")?;
        }
        Ok(())
    }
}

/// An `include:` directive, pulling (a filtered view of) another list in.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IncludeRule {
    /// Canonical (uppercase) name of the included list.
    pub source_list: String,
    /// All attribute modifiers, sorted, as written (ban attributes keep their `-`).
    pub attrs: Vec<String>,
    /// Attributes an included entry must carry.
    pub must_attrs: Vec<String>,
    /// Attributes an included entry must not carry.
    pub ban_attrs: Vec<String>,
    pub source: SourceLocation,
}
impl IncludeRule {
    pub(crate) fn new(source_list: String, mut attrs: Vec<String>, source: SourceLocation) -> Self {
        attrs.sort();
        let (ban, must): (Vec<_>, Vec<_>) = attrs.iter().cloned().partition(|attr| attr.starts_with('-'));
        let ban_attrs = ban.into_iter().map(|attr| attr[1..].to_string()).collect();
        Self { source_list, attrs, must_attrs: must, ban_attrs, source }
    }
}
impl Display for IncludeRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "include:{}", self.source_list.to_lowercase())?;
        for attr in &self.attrs {
            write!(f, " @{attr}")?;
        }
        Ok(())
    }
}

/// One parsed line of list source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEntry {
    Rule(DomainRule),
    Include(IncludeRule),
}
impl SourceEntry {
    #[must_use]
    pub fn source(&self) -> &SourceLocation {
        match self {
            Self::Rule(rule) => &rule.source,
            Self::Include(include) => &include.source,
        }
    }
}
impl Display for SourceEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Rule(rule) => rule.fmt(f),
            Self::Include(include) => include.fmt(f),
        }
    }
}

/// A fully resolved list: includes flattened, attributes filtered, redundant
/// entries dropped and the remainder sorted by `plain`.
///
/// Entries are shared between every list that includes them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedList {
    pub name: String,
    pub entries: Vec<Arc<DomainRule>>,
}
impl ResolvedList {
    /// Every attribute used by at least one entry, sorted and deduplicated.
    #[must_use]
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.entries.iter().flat_map(|entry| entry.attrs.iter().cloned()).collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// A view of this list containing only entries tagged with `attr`.
    #[must_use]
    pub fn filtered(&self, attr: &str) -> Self {
        Self {
            name: self.name.clone(),
            entries: self.entries.iter().filter(|entry| entry.has_attr(attr)).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> SourceLocation {
        SourceLocation { list: "DEMO".to_string(), line: 1 }
    }

    #[test]
    fn test_plain_key_without_attrs() {
        let rule = DomainRule::new(RuleKind::Domain, "example.com".to_string(), vec![], vec![], location());
        assert_eq!(rule.plain, "domain:example.com");
    }

    #[test]
    fn test_plain_key_sorts_attrs() {
        let attrs = vec!["cn".to_string(), "ads".to_string()];
        let rule = DomainRule::new(RuleKind::Full, "a.example.com".to_string(), attrs, vec![], location());
        assert_eq!(rule.attrs, ["ads", "cn"]);
        assert_eq!(rule.plain, "full:a.example.com:@ads,@cn");
        assert!(rule.has_attr("cn"));
        assert!(!rule.has_attr("us"));
    }

    #[test]
    fn test_include_partitions_ban_attrs() {
        let attrs = vec!["-ads".to_string(), "cn".to_string()];
        let include = IncludeRule::new("GOOGLE".to_string(), attrs, location());
        assert_eq!(include.must_attrs, ["cn"]);
        assert_eq!(include.ban_attrs, ["ads"]);
        assert_eq!(include.to_string(), "include:google @-ads @cn");
    }

    #[test]
    fn test_filters_and_filtered_view() {
        let entries = vec![
            Arc::new(DomainRule::new(RuleKind::Domain, "a.com".to_string(), vec!["cn".to_string()], vec![], location())),
            Arc::new(DomainRule::new(RuleKind::Domain, "b.com".to_string(), vec![], vec![], location())),
            Arc::new(DomainRule::new(
                RuleKind::Domain,
                "c.com".to_string(),
                vec!["ads".to_string(), "cn".to_string()],
                vec![],
                location(),
            )),
        ];
        let list = ResolvedList { name: "DEMO".to_string(), entries };
        assert_eq!(list.filters(), ["ads", "cn"]);
        let cn = list.filtered("cn");
        assert_eq!(cn.entries.len(), 2);
        assert!(list.filtered("us").entries.is_empty());
    }
}
