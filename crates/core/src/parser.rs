//! List source parsing.
//!
//! One rule per line. Text from the first `#` is a comment. The first
//! whitespace-separated token is the rule, every following token is a
//! modifier: `@attr` attaches an attribute, `&LIST` makes the rule also belong
//! to another list.
//!
//! ```text
//! # comment
//! example.com                 # implicit domain rule
//! full:www.example.com @cn
//! keyword:tracker &ADS
//! regexp:^cdn\d+\.example\.com$
//! include:other @cn @-ads     # entries of OTHER tagged cn, but not ads
//! ```

use std::collections::BTreeMap;

use regex::Regex;
use regex_syntax::ast::{ErrorKind as AstErrorKind, parse::Parser as AstParser};
use tracing::instrument;

use crate::consts;
use crate::error::{ErrorKind, Result};
use crate::models::{DomainRule, IncludeRule, RuleKind, SourceEntry, SourceLocation};

type LineResult<T> = std::result::Result<T, String>;

/// Canonicalize a list name: trimmed, uppercased, `[A-Z0-9!-]+`.
///
/// ```
/// use geosite_core::normalize_list_name;
///
/// assert_eq!(normalize_list_name(" category-ads-all ").unwrap(), "CATEGORY-ADS-ALL");
/// assert!(normalize_list_name("not/a/list").is_err());
/// ```
pub fn normalize_list_name(name: &str) -> Result<String> {
    let normalized = name.trim().to_uppercase();
    if !consts::LIST_NAME.is_match(&normalized) {
        exn::bail!(ErrorKind::InvalidListName(name.to_string()));
    }
    Ok(normalized)
}

/// Parse the source text of a single list.
///
/// The parse aborts on the first malformed line; there are no partial results.
#[instrument(skip(content), fields(content_size = content.len(), entries))]
pub fn parse_list_text(list_name: &str, content: &str) -> Result<Vec<SourceEntry>> {
    let list = normalize_list_name(list_name)?;
    let mut entries = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = index + 1;
        let stripped = strip_comment(raw).trim();
        if stripped.is_empty() {
            continue;
        }
        let source = SourceLocation { list: list.clone(), line };
        let entry = parse_line(stripped, source).map_err(|reason| ErrorKind::Parse {
            list: list.clone(),
            line,
            reason,
        })?;
        entries.push(entry);
    }
    tracing::Span::current().record("entries", entries.len());
    Ok(entries)
}

/// Parse every list of a `file name → source text` map, keyed by canonical
/// list name.
pub fn parse_lists<I, K, V>(sources: I) -> Result<BTreeMap<String, Vec<SourceEntry>>>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut parsed = BTreeMap::new();
    for (name, content) in sources {
        let name = name.as_ref();
        let entries = parse_list_text(name, content.as_ref())?;
        parsed.insert(normalize_list_name(name)?, entries);
    }
    Ok(parsed)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(index) => &line[..index],
        None => line,
    }
}

fn parse_line(line: &str, source: SourceLocation) -> LineResult<SourceEntry> {
    let mut parts = line.split_whitespace();
    let token = parts.next().ok_or_else(|| "empty line".to_string())?;

    let mut attrs = Vec::new();
    let mut affiliations = Vec::new();
    for part in parts {
        if let Some(attr) = part.strip_prefix('@') {
            let attr = attr.to_lowercase();
            if !consts::ATTRIBUTE.is_match(&attr) {
                return Err(format!("invalid attribute: {attr:?}"));
            }
            attrs.push(attr);
        } else if let Some(affiliation) = part.strip_prefix('&') {
            let affiliation = affiliation.to_uppercase();
            if !consts::LIST_NAME.is_match(&affiliation) {
                return Err(format!("invalid affiliation: {affiliation:?}"));
            }
            affiliations.push(affiliation);
        } else {
            return Err(format!("invalid attribute/affiliation: {part:?}"));
        }
    }

    let Some((prefix, value)) = token.split_once(':') else {
        return domain_rule(RuleKind::Domain, token.to_lowercase(), attrs, affiliations, source);
    };
    match prefix.to_lowercase().as_str() {
        "include" => {
            if !affiliations.is_empty() {
                return Err(format!("affiliation is not allowed for include:{value:?}"));
            }
            let target = value.to_uppercase();
            if !consts::LIST_NAME.is_match(&target) {
                return Err(format!("invalid include list name: {value:?}"));
            }
            Ok(SourceEntry::Include(IncludeRule::new(target, attrs, source)))
        },
        "regexp" => {
            validate_regex(value)?;
            let rule = DomainRule::new(RuleKind::Regexp, value.to_string(), attrs, affiliations, source);
            Ok(SourceEntry::Rule(rule))
        },
        "domain" => domain_rule(RuleKind::Domain, value.to_lowercase(), attrs, affiliations, source),
        "full" => domain_rule(RuleKind::Full, value.to_lowercase(), attrs, affiliations, source),
        "keyword" => domain_rule(RuleKind::Keyword, value.to_lowercase(), attrs, affiliations, source),
        other => Err(format!("invalid type: {other:?}")),
    }
}

fn domain_rule(
    kind: RuleKind,
    value: String,
    attrs: Vec<String>,
    affiliations: Vec<String>,
    source: SourceLocation,
) -> LineResult<SourceEntry> {
    if !consts::DOMAIN_VALUE.is_match(&value) {
        return Err(format!("invalid domain: {value:?}"));
    }
    Ok(SourceEntry::Rule(DomainRule::new(kind, value, attrs, affiliations, source)))
}

/// Only confirms the pattern compiles. Look-around assertions and
/// backreferences are valid in the upstream regex dialect but not in ours, so
/// those are let through for the transpiler to classify.
fn validate_regex(pattern: &str) -> LineResult<()> {
    let translated = translate_upstream_syntax(pattern);
    let Err(err) = Regex::new(&translated) else {
        return Ok(());
    };
    match AstParser::new().parse(&translated) {
        Err(ast)
            if matches!(ast.kind(), AstErrorKind::UnsupportedLookAround | AstErrorKind::UnsupportedBackreference) =>
        {
            Ok(())
        },
        _ => Err(format!("invalid regexp {pattern:?}: {err}")),
    }
}

/// Rewrite upstream-only syntax into a pattern our regex engine parses, for
/// validation only. Braces that are not quantifiers are literals, `[^]`
/// matches anything and `[]` matches nothing. `\cX` is a control character,
/// named backreferences become empty groups and unknown letter escapes are
/// the letter itself. Inside a class `[`, `&` and `~` are plain characters.
fn translate_upstream_syntax(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len());
    let mut in_class = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                let Some(&next) = chars.get(i + 1) else {
                    out.push('\\');
                    break;
                };
                i += 2;
                match next {
                    'c' if chars.get(i).is_some_and(char::is_ascii_alphabetic) => {
                        out.push_str(&format!("\\x{{{:02x}}}", u32::from(chars[i]) % 32));
                        i += 1;
                    },
                    'k' if !in_class && chars.get(i) == Some(&'<') => {
                        match chars[i..].iter().position(|&c| c == '>') {
                            Some(close) => {
                                out.push_str("(?:)");
                                i += close + 1;
                            },
                            None => out.push('k'),
                        }
                    },
                    'b' if in_class => out.push_str("\\x{08}"),
                    letter if letter.is_ascii_alphabetic() && !consts::ESCAPE_LETTERS.contains(letter) => {
                        out.push(letter);
                    },
                    _ => {
                        out.push('\\');
                        out.push(next);
                    },
                }
                continue;
            },
            '[' if in_class => out.push_str("\\["),
            '&' | '~' if in_class => {
                out.push('\\');
                out.push(c);
            },
            '[' if chars.get(i + 1) == Some(&'^') && chars.get(i + 2) == Some(&']') => {
                out.push_str("(?s:.)");
                i += 3;
                continue;
            },
            '[' if chars.get(i + 1) == Some(&']') => {
                out.push_str(r"(?:\b\B)");
                i += 2;
                continue;
            },
            '[' => {
                in_class = true;
                out.push('[');
            },
            ']' if in_class => {
                in_class = false;
                out.push(']');
            },
            '{' if !in_class => match quantifier_len(&chars[i..]) {
                Some(len) => {
                    out.extend(&chars[i..i + len]);
                    i += len;
                    continue;
                },
                None => out.push_str("\\{"),
            },
            '}' if !in_class => out.push_str("\\}"),
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// Length of a `{n}`, `{n,}` or `{n,m}` quantifier at the start of `chars`.
fn quantifier_len(chars: &[char]) -> Option<usize> {
    let digits = |from: usize| chars[from..].iter().take_while(|c| c.is_ascii_digit()).count();
    let min = digits(1);
    if min == 0 {
        return None;
    }
    let mut end = 1 + min;
    if chars.get(end) == Some(&',') {
        end += 1 + digits(end + 1);
    }
    (chars.get(end) == Some(&'}')).then_some(end + 1)
}
