//! Regexp to Surge domain rule conversion.
//!
//! Surge has no regular expressions, only exact, suffix, keyword and glob
//! domain rules. Three anchored shapes convert directly; everything else is
//! approximated by a character walk that turns the pattern into a glob, and how
//! much approximation is tolerated depends on the [`Mode`].

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use derive_more::{Display as DeriveDisplay, Error};
use regex::{Captures, Regex};

use crate::consts;

const SUFFIX_IDIOM: [char; 6] = ['(', '^', '|', '\\', '.', ')'];

/// How far a regexp may be approximated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Mode {
    /// Only conversions that match exactly the same domains.
    Strict,
    /// Heuristic globs are allowed; patterns the walk cannot handle are dropped.
    #[default]
    Balanced,
    /// Never drop a pattern; fall back to a literal suffix or a match-all glob.
    Full,
}
impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Strict, Mode::Balanced, Mode::Full];

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Balanced => "balanced",
            Self::Full => "full",
        }
    }
}
impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no [`Mode`].
#[derive(Debug, DeriveDisplay, Error, Clone, PartialEq, Eq)]
#[display("unknown mode: {_0:?}")]
pub struct ParseModeError(#[error(not(source))] String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "balanced" => Ok(Self::Balanced),
            "full" => Ok(Self::Full),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// How faithful a conversion is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Status {
    /// Matches exactly the same domains.
    Lossless,
    /// Matches a superset of the domains.
    Widened,
    /// No rule was produced.
    Unsupported,
}

/// Surge domain rule types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NativeKind {
    #[cfg_attr(feature = "serde", serde(rename = "DOMAIN"))]
    Exact,
    #[cfg_attr(feature = "serde", serde(rename = "DOMAIN-SUFFIX"))]
    Suffix,
    #[cfg_attr(feature = "serde", serde(rename = "DOMAIN-KEYWORD"))]
    Keyword,
    #[cfg_attr(feature = "serde", serde(rename = "DOMAIN-WILDCARD"))]
    Wildcard,
}
impl NativeKind {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "DOMAIN",
            Self::Suffix => "DOMAIN-SUFFIX",
            Self::Keyword => "DOMAIN-KEYWORD",
            Self::Wildcard => "DOMAIN-WILDCARD",
        }
    }
}
impl Display for NativeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Outcome of converting one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranspileResult {
    pub status: Status,
    pub rules: Vec<(NativeKind, String)>,
    /// Diagnostic only; never branch on it.
    pub reason: Option<&'static str>,
}
impl TranspileResult {
    fn lossless(kind: NativeKind, value: String) -> Self {
        Self { status: Status::Lossless, rules: vec![(kind, value)], reason: None }
    }

    fn widened(kind: NativeKind, value: String, reason: &'static str) -> Self {
        Self { status: Status::Widened, rules: vec![(kind, value)], reason: Some(reason) }
    }

    fn unsupported(reason: &'static str) -> Self {
        Self { status: Status::Unsupported, rules: Vec::new(), reason: Some(reason) }
    }
}

/// Convert a domain-anchored regexp into Surge rules.
///
/// ```
/// use geosite_core::{Mode, NativeKind, Status, transpile};
///
/// let result = transpile(r"(^|\.)netflix\.com$", Mode::Strict);
/// assert_eq!(result.status, Status::Lossless);
/// assert_eq!(result.rules, [(NativeKind::Suffix, "netflix.com".to_string())]);
/// ```
#[must_use]
pub fn transpile(pattern: &str, mode: Mode) -> TranspileResult {
    if let Some(domain) = capture_domain(&consts::EXACT_SHAPE, pattern) {
        return TranspileResult::lossless(NativeKind::Exact, domain);
    }
    if let Some(domain) = capture_domain(&consts::SUFFIX_SHAPE, pattern) {
        return TranspileResult::lossless(NativeKind::Suffix, domain);
    }
    if mode == Mode::Strict {
        return TranspileResult::unsupported("Pattern is not losslessly representable in Surge domain rules.");
    }
    if let Some(domain) = capture_domain(&consts::REPEATED_SUBDOMAIN_SHAPE, pattern) {
        return TranspileResult::widened(
            NativeKind::Suffix,
            domain,
            "Converted repeated subdomain regexp to DOMAIN-SUFFIX.",
        );
    }

    if consts::ADVANCED_TOKENS.is_match(pattern) {
        return match mode {
            Mode::Full => downgrade(
                pattern,
                "Advanced regexp token downgraded to literal domain suffix.",
                "Advanced regexp token downgraded to match-all wildcard in full mode.",
            ),
            Mode::Strict | Mode::Balanced => {
                TranspileResult::unsupported("Pattern uses advanced regexp tokens that cannot be safely converted.")
            },
        };
    }

    if let Some(glob) = wildcard_from_regex(pattern) {
        return TranspileResult::widened(
            NativeKind::Wildcard,
            glob,
            "Regex converted to heuristic DOMAIN-WILDCARD pattern.",
        );
    }
    match mode {
        Mode::Full => downgrade(
            pattern,
            "Regex downgraded to literal domain suffix fallback.",
            "Regex downgraded to match-all wildcard in full mode.",
        ),
        Mode::Strict | Mode::Balanced => {
            TranspileResult::unsupported("Unable to convert regexp into a valid Surge domain pattern.")
        },
    }
}

fn capture_domain(shape: &Regex, pattern: &str) -> Option<String> {
    shape.captures(pattern).and_then(|captures| captures.get(1)).map(|domain| unescape_domain(domain.as_str()))
}

fn unescape_domain(escaped: &str) -> String {
    escaped.replace(r"\.", ".").to_lowercase()
}

/// The `full` mode fallback: a literal suffix if the pattern ends in one,
/// otherwise match everything.
fn downgrade(pattern: &str, tail_reason: &'static str, wildcard_reason: &'static str) -> TranspileResult {
    match literal_tail(pattern) {
        Some(tail) => TranspileResult::widened(NativeKind::Suffix, tail, tail_reason),
        None => TranspileResult::widened(NativeKind::Wildcard, "*".to_string(), wildcard_reason),
    }
}

fn literal_tail(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let body = body.strip_suffix('$').unwrap_or(body);
    capture_domain(&consts::LITERAL_TAIL, body)
}

fn is_domain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Walk the pattern left to right, keeping literal domain characters and
/// collapsing every other construct into `*`. Groups and classes are skipped
/// whole, quantifier included.
fn wildcard_from_regex(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut glob = String::with_capacity(pattern.len());
    let mut index = 0;
    while index < chars.len() {
        match chars[index] {
            '^' | '$' => {},
            '(' if chars[index..].starts_with(&SUFFIX_IDIOM) => {
                glob.push_str("*.");
                index += SUFFIX_IDIOM.len() - 1;
            },
            '\\' => match chars.get(index + 1) {
                None => glob.push('*'),
                Some(&escaped) => {
                    index += 1;
                    match escaped {
                        '.' | '-' => glob.push(escaped),
                        'd' | 'w' | 's' | 'D' | 'W' | 'S' => glob.push('*'),
                        c if is_domain_char(c) => glob.push(c),
                        _ => glob.push('*'),
                    }
                },
            },
            '[' => {
                index = consume_quantifier(&chars, find_class_end(&chars, index + 1)?);
                glob.push('*');
            },
            '(' => {
                index = consume_quantifier(&chars, find_group_end(&chars, index + 1)?);
                glob.push('*');
            },
            '{' => {
                index = find_char(&chars, index + 1, '}')?;
                glob.push('*');
            },
            '|' | '?' | '+' | '*' => glob.push('*'),
            c if c == '.' || is_domain_char(c) => glob.push(c),
            _ => glob.push('*'),
        }
        index += 1;
    }

    let glob = normalize_wildcard(&glob);
    if !glob.contains('.') || !glob.chars().any(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(glob.to_lowercase())
}

fn normalize_wildcard(raw: &str) -> String {
    let glob = consts::STAR_RUN.replace_all(raw, "*");
    let glob = glob.replace("?*", "*").replace("*?", "*");
    let glob = consts::DOT_RUN.replace_all(&glob, ".");
    let glob = consts::LEADING_WILDCARD
        .replace(&glob, |captures: &Captures| if captures[0].contains('.') { "*." } else { "*" });
    glob.trim_matches('.').to_string()
}

fn find_char(chars: &[char], start: usize, needle: char) -> Option<usize> {
    chars.iter().skip(start).position(|&c| c == needle).map(|offset| start + offset)
}

fn find_class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut escaped = false;
    for (index, &c) in chars.iter().enumerate().skip(start) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ']' => return Some(index),
            _ => {},
        }
    }
    None
}

fn find_group_end(chars: &[char], start: usize) -> Option<usize> {
    let mut escaped = false;
    let mut depth = 1usize;
    for (index, &c) in chars.iter().enumerate().skip(start) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            },
            _ => {},
        }
    }
    None
}

/// Index of the last character of the quantifier following `end`, or `end`
/// itself if there is none.
fn consume_quantifier(chars: &[char], end: usize) -> usize {
    match chars.get(end + 1) {
        Some('?' | '+' | '*') => end + 1,
        Some('{') => find_char(chars, end + 2, '}').unwrap_or(end),
        _ => end,
    }
}
