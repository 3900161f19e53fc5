//! Surge rule-set emission.

use std::collections::HashSet;
use std::fmt::{Display, Formatter, Result as FmtResult};

use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::models::{DomainRule, ResolvedList, RuleKind, SourceLocation};
use crate::transpiler::{Mode, NativeKind, Status, transpile};

/// What to do with a regexp that cannot be converted under the chosen mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnUnsupported {
    /// Leave it out of the output and record it in the report.
    #[default]
    Skip,
    /// Fail the whole emit.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitOptions {
    pub mode: Mode,
    pub on_unsupported: OnUnsupported,
    /// Drop repeated `(type, value)` pairs, keeping the first.
    pub dedupe: bool,
}
impl Default for EmitOptions {
    fn default() -> Self {
        Self { mode: Mode::default(), on_unsupported: OnUnsupported::default(), dedupe: true }
    }
}
impl EmitOptions {
    #[must_use]
    pub fn with_mode(mode: Mode) -> Self {
        Self { mode, ..Self::default() }
    }
}

/// One rendered Surge rule and the source line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NativeRule {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: NativeKind,
    pub value: String,
    pub source: SourceLocation,
}
impl Display for NativeRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{},{}", self.kind, self.value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegexCounts {
    pub total: usize,
    pub lossless: usize,
    pub widened: usize,
    pub unsupported: usize,
}
impl RegexCounts {
    fn record(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Lossless => self.lossless += 1,
            Status::Widened => self.widened += 1,
            Status::Unsupported => self.unsupported += 1,
        }
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.lossless += other.lossless;
        self.widened += other.widened;
        self.unsupported += other.unsupported;
    }
}

/// A regexp that was widened or dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegexIssue {
    pub pattern: String,
    pub source: SourceLocation,
    pub reason: String,
    pub mode: Mode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EmitReport {
    pub regex: RegexCounts,
    pub widened: Vec<RegexIssue>,
    pub unsupported: Vec<RegexIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emitted {
    pub rules: Vec<NativeRule>,
    /// `TYPE,value` for each rule.
    pub lines: Vec<String>,
    /// `lines` joined with `\n`, no trailing newline.
    pub text: String,
    pub report: EmitReport,
}

/// Render a resolved list as Surge rules.
///
/// Non-regexp rules map one to one (`domain` to `DOMAIN-SUFFIX`, `full` to
/// `DOMAIN`, `keyword` to `DOMAIN-KEYWORD`); regexps go through [`transpile`].
#[instrument(skip(list, options), fields(list = %list.name, mode = %options.mode, lines))]
pub fn emit(list: &ResolvedList, options: &EmitOptions) -> Result<Emitted> {
    let mut rules = Vec::with_capacity(list.entries.len());
    let mut report = EmitReport::default();

    for entry in &list.entries {
        let kind = match entry.kind {
            RuleKind::Domain => NativeKind::Suffix,
            RuleKind::Full => NativeKind::Exact,
            RuleKind::Keyword => NativeKind::Keyword,
            RuleKind::Regexp => {
                emit_regexp(&list.name, entry, options, &mut report, &mut rules)?;
                continue;
            },
        };
        rules.push(NativeRule { kind, value: entry.value.clone(), source: entry.source.clone() });
    }

    if options.dedupe {
        let mut seen = HashSet::new();
        rules.retain(|rule| seen.insert((rule.kind, rule.value.clone())));
    }
    let lines: Vec<String> = rules.iter().map(ToString::to_string).collect();
    let text = lines.join("\n");
    tracing::Span::current().record("lines", lines.len());
    Ok(Emitted { rules, lines, text, report })
}

fn emit_regexp(
    list: &str,
    entry: &DomainRule,
    options: &EmitOptions,
    report: &mut EmitReport,
    rules: &mut Vec<NativeRule>,
) -> Result<()> {
    let result = transpile(&entry.value, options.mode);
    report.regex.record(result.status);
    let issue = |fallback: &str| RegexIssue {
        pattern: entry.value.clone(),
        source: entry.source.clone(),
        reason: result.reason.unwrap_or(fallback).to_string(),
        mode: options.mode,
    };

    match result.status {
        Status::Unsupported => {
            let issue = issue("Unsupported regex pattern.");
            tracing::debug!(
                list,
                line = entry.source.line,
                pattern = %entry.value,
                reason = %issue.reason,
                "Regexp not converted"
            );
            if options.on_unsupported == OnUnsupported::Error {
                exn::bail!(ErrorKind::UnsupportedRegex {
                    list: list.to_string(),
                    line: entry.source.line,
                    pattern: entry.value.clone(),
                    reason: issue.reason,
                });
            }
            report.unsupported.push(issue);
            return Ok(());
        },
        Status::Widened => report.widened.push(issue("Regex widened during conversion.")),
        Status::Lossless => {},
    }
    rules.extend(result.rules.iter().map(|(kind, value)| NativeRule {
        kind: *kind,
        value: value.clone(),
        source: entry.source.clone(),
    }));
    Ok(())
}
