use regex::Regex;
use std::sync::LazyLock;

macro_rules! regex {
    ($name:ident, $regex:expr) => {
        pub(crate) static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($regex).unwrap());
    };
}

/// Letters with an escape meaning in the upstream regex dialect.
pub(crate) const ESCAPE_LETTERS: &str = "bBdDwWsSnrtfvxu";

// A dot-joined run of at least two labels, with the dots regex-escaped.
const ESCAPED_LABELS: &str = r"([a-z0-9-]+(?:\\\.[a-z0-9-]+)+)";

// List source charsets.
regex!(DOMAIN_VALUE, r"^[a-z0-9.-]+$");
regex!(ATTRIBUTE, r"^[a-z0-9!-]+$");
regex!(LIST_NAME, r"^[A-Z0-9!-]+$");

// `^label(\.label)+$`
regex!(EXACT_SHAPE, format!(r"(?i)^\^{ESCAPED_LABELS}\$$").as_str());
// `(^|\.)label(\.label)+$`
regex!(SUFFIX_SHAPE, format!(r"(?i)^\(\^\|\\\.\){ESCAPED_LABELS}\$$").as_str());
// `^(.+\.)*label(\.label)+$`
regex!(REPEATED_SUBDOMAIN_SHAPE, format!(r"(?i)^\^\(\.\+\\\.\)\*{ESCAPED_LABELS}\$$").as_str());
// Look-around assertions and backreferences.
regex!(ADVANCED_TOKENS, r"\(\?<?[=!]|\\[1-9]|\\k<");
// A literal label run immediately before the end of the pattern body.
regex!(LITERAL_TAIL, format!(r"(?i){ESCAPED_LABELS}$").as_str());

// Wildcard clean-up.
regex!(STAR_RUN, r"\*{2,}");
regex!(DOT_RUN, r"\.{2,}");
regex!(LEADING_WILDCARD, r"^[*.]+");
