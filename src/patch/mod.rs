//! Token/value patching of line-oriented configuration files.
//!
//! [`ConfigPatcher::apply`] is a pure function over a [`ConfigDocument`]:
//! it never touches the filesystem or the network. Reading the original,
//! securing backups and writing the result are the caller's job (see
//! [`crate::sync::RemoteFileSync`]), so a failed patch can never leave a
//! half-written file behind.
//!
//! # Matching
//!
//! Every line is decomposed by one [`LineGrammar`]. A directive matches a
//! line when the line's key equals the directive's token exactly and the
//! line's delimiter is `=`, `:` or the directive's own literal delimiter.
//!
//! * The first matching line is rewritten as `token<delimiter>value`, with
//!   any comment marker and indentation removed.
//! * Later commented lines for the same token are dropped so the file does
//!   not keep a stale commented copy next to the active entry.
//! * Later active lines for the same token are left exactly as they are and
//!   reported as duplicates.
//!
//! Directives that match nothing follow their [`NotFoundPolicy`].
//!
//! # Example
//!
//! ```rust
//! use crucible::patch::{ConfigDocument, ConfigPatcher, PatchDirective};
//!
//! let doc = ConfigDocument::from_text("libvirtd.conf", "#listen_tcp = 1\nauth_tcp = \"sasl\"\n");
//! let directives = vec![
//!     PatchDirective::new("listen_tcp", "1"),
//!     PatchDirective::new("auth_tcp", "\"none\""),
//! ];
//!
//! let (patched, report) = ConfigPatcher::new().apply(&doc, &directives).unwrap();
//! assert_eq!(patched.to_text(), "listen_tcp = 1\nauth_tcp = \"none\"\n");
//! assert!(report.changed);
//! ```

mod document;
mod grammar;

pub use document::ConfigDocument;
pub use grammar::{LineGrammar, LineMatch};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info_span, warn, Span};

use crate::error::{Error, Result};

/// Delimiter used when rewriting or appending a line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    /// Reuse the delimiter found in the matched line, spacing included
    #[default]
    Discovered,
    /// Reuse the found delimiter with its surrounding blanks removed
    Strip,
    /// Use this text
    Literal(String),
}

impl Delimiter {
    /// Interpret the optional delimiter argument of a directive.
    ///
    /// Nothing means [`Delimiter::Discovered`] and the word `strip` means
    /// [`Delimiter::Strip`]; anything else is taken literally.
    pub fn parse(arg: Option<&str>) -> Self {
        match arg {
            None | Some("") => Delimiter::Discovered,
            Some("strip") => Delimiter::Strip,
            Some(other) => Delimiter::Literal(other.to_string()),
        }
    }

    fn literal(&self) -> Option<&str> {
        match self {
            Delimiter::Literal(l) => Some(l),
            _ => None,
        }
    }

    /// Text to write when rewriting a line whose delimiter was `found`.
    ///
    /// A literal that only differs from the found delimiter in spacing keeps
    /// the file's existing spacing.
    fn resolve<'a>(&'a self, found: &'a str) -> &'a str {
        match self {
            Delimiter::Discovered => found,
            Delimiter::Strip => found.trim(),
            Delimiter::Literal(l) => {
                let core = l.trim();
                if !core.is_empty() && core == found.trim() {
                    found
                } else {
                    l
                }
            }
        }
    }

    /// Text to write when appending a new line.
    fn for_append(&self) -> &str {
        match self {
            Delimiter::Literal(l) => l,
            Delimiter::Discovered | Delimiter::Strip => "=",
        }
    }
}

/// What to do when no line matches a directive's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotFoundPolicy {
    /// Leave the document alone
    #[default]
    Ignore,
    /// Add `token<delimiter>value` at the end of the document
    Append,
    /// Fail the whole patch
    Fail,
}

impl FromStr for NotFoundPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ignore" => Ok(NotFoundPolicy::Ignore),
            "append" => Ok(NotFoundPolicy::Append),
            "fail" => Ok(NotFoundPolicy::Fail),
            _ => Err(Error::InvalidInput(format!(
                "Invalid not-found policy '{}'. Valid policies: ignore, append, fail",
                s
            ))),
        }
    }
}

impl fmt::Display for NotFoundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotFoundPolicy::Ignore => "ignore",
            NotFoundPolicy::Append => "append",
            NotFoundPolicy::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// A requested token/value change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDirective {
    /// Key to look for
    pub token: String,
    /// Value to set
    pub value: String,
    /// Delimiter to write
    #[serde(default)]
    pub delimiter: Delimiter,
    /// Behaviour when the token is absent
    #[serde(default)]
    pub not_found: NotFoundPolicy,
}

impl PatchDirective {
    /// Directive with the discovered delimiter and the `ignore` policy
    pub fn new(token: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            value: value.into(),
            delimiter: Delimiter::Discovered,
            not_found: NotFoundPolicy::Ignore,
        }
    }

    /// Set the delimiter
    pub fn delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set a literal delimiter
    pub fn literal(self, delimiter: impl Into<String>) -> Self {
        self.delimiter(Delimiter::Literal(delimiter.into()))
    }

    /// Set the not-found policy
    pub fn not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.not_found = policy;
        self
    }

    /// Whether a line decomposed as `m` is an entry for this directive.
    fn matches(&self, m: &LineMatch) -> bool {
        if m.key != self.token {
            return false;
        }
        let core = m.delimiter.trim();
        if core == "=" || core == ":" {
            return true;
        }
        self.delimiter
            .literal()
            .map(|l| l.trim() == core)
            .unwrap_or(false)
    }

    fn rewrite(&self, m: &LineMatch) -> String {
        format!(
            "{}{}{}\n",
            self.token,
            self.delimiter.resolve(&m.delimiter),
            self.value
        )
    }

    fn appended(&self) -> String {
        format!("{}{}{}\n", self.token, self.delimiter.for_append(), self.value)
    }

    fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(Error::InvalidInput("directive token is empty".into()));
        }
        if self
            .token
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == ':' || c == '#')
        {
            return Err(Error::InvalidInput(format!(
                "token '{}' contains whitespace, '=', ':' or '#'",
                self.token
            )));
        }
        if self.value.contains('\n') || self.value.contains('\r') {
            return Err(Error::InvalidInput(format!(
                "value for '{}' spans more than one line",
                self.token
            )));
        }
        if let Delimiter::Literal(l) = &self.delimiter {
            if l.is_empty() || l.contains('\n') || l.contains('\r') {
                return Err(Error::InvalidInput(format!(
                    "invalid delimiter {:?} for '{}'",
                    l, self.token
                )));
            }
        }
        Ok(())
    }
}

/// A rewritten line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineChange {
    /// 1-based line number in the input document
    pub line: usize,
    /// Token that matched
    pub token: String,
    /// Original line
    pub before: String,
    /// Replacement line
    pub after: String,
}

/// What a patch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    /// Name of the patched document
    pub file: String,
    /// First matches, rewritten in place
    pub rewritten: Vec<LineChange>,
    /// Lines added for `append` directives
    pub appended: Vec<String>,
    /// Commented duplicates removed (1-based line number, text)
    pub dropped: Vec<(usize, String)>,
    /// Active duplicates left untouched (1-based line number, text)
    pub duplicates: Vec<(usize, String)>,
    /// Tokens that matched nothing under the `ignore` policy
    pub ignored: Vec<String>,
    /// Whether the output differs from the input
    pub changed: bool,
}

impl PatchReport {
    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{}: {} rewritten, {} appended, {} dropped, {} duplicate(s), {} not found",
            self.file,
            self.rewritten.len(),
            self.appended.len(),
            self.dropped.len(),
            self.duplicates.len(),
            self.ignored.len()
        )
    }
}

/// Applies directive sets to documents.
#[derive(Debug, Clone)]
pub struct ConfigPatcher {
    span: Span,
}

impl Default for ConfigPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigPatcher {
    /// Create a patcher logging under its own span
    pub fn new() -> Self {
        Self {
            span: info_span!("config_patcher"),
        }
    }

    /// Log under `span` instead
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Apply `directives` to `document`.
    ///
    /// Returns the patched document and a report. With a `fail` directive
    /// left unmatched nothing is produced and every such token is listed in
    /// [`Error::PatchNotFound`].
    pub fn apply(
        &self,
        document: &ConfigDocument,
        directives: &[PatchDirective],
    ) -> Result<(ConfigDocument, PatchReport)> {
        let _enter = self.span.enter();

        let mut seen = HashSet::new();
        for directive in directives {
            directive.validate()?;
            if !seen.insert(directive.token.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "token '{}' appears in more than one directive",
                    directive.token
                )));
            }
        }

        // One grammar per distinct literal, so that adding a directive never
        // changes how another directive's lines are split.
        let mut grammars: Vec<(Option<&str>, LineGrammar)> = Vec::new();
        let mut grammar_of = Vec::with_capacity(directives.len());
        for directive in directives {
            let literal = directive.delimiter.literal();
            let slot = match grammars.iter().position(|(l, _)| *l == literal) {
                Some(slot) => slot,
                None => {
                    grammars.push((literal, LineGrammar::new(literal)?));
                    grammars.len() - 1
                }
            };
            grammar_of.push(slot);
        }

        let mut satisfied = vec![false; directives.len()];
        let mut output = Vec::with_capacity(document.len() + directives.len());
        let mut report = PatchReport {
            file: document.name().to_string(),
            ..PatchReport::default()
        };

        for (index, line) in document.lines().iter().enumerate() {
            let line_no = index + 1;
            let mut parsed: Vec<Option<Option<LineMatch>>> = vec![None; grammars.len()];
            let mut hit = None;
            for (position, directive) in directives.iter().enumerate() {
                let slot = grammar_of[position];
                let m = parsed[slot].get_or_insert_with(|| grammars[slot].1.parse(line));
                if let Some(m) = m {
                    if directive.matches(m) {
                        hit = Some((position, m.clone()));
                        break;
                    }
                }
            }

            let Some((position, m)) = hit else {
                output.push(line.clone());
                continue;
            };
            let directive = &directives[position];

            if !satisfied[position] {
                satisfied[position] = true;
                let after = directive.rewrite(&m);
                debug!(
                    file = %document.name(),
                    line = line_no,
                    token = %directive.token,
                    "Rewriting entry"
                );
                report.rewritten.push(LineChange {
                    line: line_no,
                    token: directive.token.clone(),
                    before: line.clone(),
                    after: after.clone(),
                });
                output.push(after);
            } else if m.is_commented() {
                debug!(
                    file = %document.name(),
                    line = line_no,
                    token = %directive.token,
                    "Dropping commented duplicate"
                );
                report.dropped.push((line_no, line.clone()));
            } else {
                warn!(
                    file = %document.name(),
                    line = line_no,
                    token = %directive.token,
                    "Token already set earlier in the file, leaving duplicate untouched"
                );
                report.duplicates.push((line_no, line.clone()));
                output.push(line.clone());
            }
        }

        let missing: Vec<String> = directives
            .iter()
            .zip(&satisfied)
            .filter(|(d, done)| !**done && d.not_found == NotFoundPolicy::Fail)
            .map(|(d, _)| d.token.clone())
            .collect();
        if !missing.is_empty() {
            return Err(Error::PatchNotFound {
                file: document.name().to_string(),
                tokens: missing,
            });
        }

        let mut patched = document.with_lines(output);
        for (directive, done) in directives.iter().zip(&satisfied) {
            if *done {
                continue;
            }
            match directive.not_found {
                NotFoundPolicy::Append => {
                    let line = directive.appended();
                    debug!(file = %document.name(), token = %directive.token, "Appending entry");
                    report.appended.push(line.clone());
                    patched.push_line(line);
                }
                NotFoundPolicy::Ignore => {
                    debug!(file = %document.name(), token = %directive.token, "Token not found, ignoring");
                    report.ignored.push(directive.token.clone());
                }
                NotFoundPolicy::Fail => {}
            }
        }

        report.changed = patched.lines() != document.lines();
        Ok((patched, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn doc(lines: &[&str]) -> ConfigDocument {
        ConfigDocument::from_lines("test.conf", lines.iter().copied())
    }

    fn apply(d: &ConfigDocument, directives: &[PatchDirective]) -> ConfigDocument {
        ConfigPatcher::new().apply(d, directives).unwrap().0
    }

    #[test]
    fn test_delimiter_parse() {
        assert_eq!(Delimiter::parse(None), Delimiter::Discovered);
        assert_eq!(Delimiter::parse(Some("strip")), Delimiter::Strip);
        assert_eq!(Delimiter::parse(Some(" ")), Delimiter::Literal(" ".into()));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Append".parse::<NotFoundPolicy>().unwrap(), NotFoundPolicy::Append);
        assert!("sometimes".parse::<NotFoundPolicy>().is_err());
    }

    #[test]
    fn test_discovered_delimiter_keeps_spacing() {
        let result = apply(&doc(&["foo : 1\n"]), &[PatchDirective::new("foo", "2")]);
        assert_eq!(result.lines(), &["foo : 2\n"]);
    }

    #[test]
    fn test_strip_delimiter() {
        let directive = PatchDirective::new("foo", "2").delimiter(Delimiter::Strip);
        let result = apply(&doc(&["foo = 1\n"]), &[directive]);
        assert_eq!(result.lines(), &["foo=2\n"]);
    }

    #[test]
    fn test_literal_replaces_different_delimiter() {
        let directive = PatchDirective::new("foo", "2").literal(":");
        let result = apply(&doc(&["foo = 1\n"]), &[directive]);
        assert_eq!(result.lines(), &["foo:2\n"]);
    }

    #[test]
    fn test_substring_keys_do_not_match() {
        let d = doc(&["foobar = 1\n", "xfoo = 1\n", "foo_bar=1\n"]);
        let (result, report) = ConfigPatcher::new()
            .apply(&d, &[PatchDirective::new("foo", "9")])
            .unwrap();
        assert_eq!(result, d);
        assert!(!report.changed);
        assert_eq!(report.ignored, vec!["foo".to_string()]);
    }

    #[test]
    fn test_indented_entry_is_unindented() {
        let result = apply(&doc(&["   # foo = 1\n"]), &[PatchDirective::new("foo", "2")]);
        assert_eq!(result.lines(), &["foo = 2\n"]);
    }

    #[test]
    fn test_space_delimited_hosts_entry() {
        let directive = PatchDirective::new("10.0.0.12", "compute2")
            .literal(" ")
            .not_found(NotFoundPolicy::Append);
        let d = doc(&["127.0.0.1 localhost\n", "10.0.0.12 old-name\n"]);
        let result = apply(&d, &[directive.clone()]);
        assert_eq!(result.lines(), &["127.0.0.1 localhost\n", "10.0.0.12 compute2\n"]);

        let d = doc(&["127.0.0.1 localhost"]);
        let result = apply(&d, &[directive]);
        assert_eq!(result.to_text(), "127.0.0.1 localhost\n10.0.0.12 compute2\n");
    }

    #[test]
    fn test_blank_delimiter_requires_literal() {
        let d = doc(&["foo 1\n"]);
        let result = apply(&d, &[PatchDirective::new("foo", "2")]);
        assert_eq!(result, d);
    }

    #[test]
    fn test_crlf_line_rewritten_with_lf() {
        let result = apply(&doc(&["foo = 1\r\n"]), &[PatchDirective::new("foo", "2")]);
        assert_eq!(result.lines(), &["foo = 2\n"]);
    }

    #[test]
    fn test_fail_lists_every_missing_token() {
        let d = doc(&["bar = 2\n"]);
        let err = ConfigPatcher::new()
            .apply(
                &d,
                &[
                    PatchDirective::new("a", "1").not_found(NotFoundPolicy::Fail),
                    PatchDirective::new("bar", "3").not_found(NotFoundPolicy::Fail),
                    PatchDirective::new("b", "1").not_found(NotFoundPolicy::Fail),
                ],
            )
            .unwrap_err();
        match err {
            Error::PatchNotFound { file, tokens } => {
                assert_eq!(file, "test.conf");
                assert_eq!(tokens, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_appended_lines_follow_directive_order() {
        let d = doc(&["x = 0\n"]);
        let result = apply(
            &d,
            &[
                PatchDirective::new("b", "2").not_found(NotFoundPolicy::Append),
                PatchDirective::new("a", "1").not_found(NotFoundPolicy::Append),
            ],
        );
        assert_eq!(result.lines(), &["x = 0\n", "b=2\n", "a=1\n"]);
    }

    #[test]
    fn test_rejects_duplicate_and_bad_tokens() {
        let patcher = ConfigPatcher::new();
        let d = doc(&[]);
        assert!(patcher
            .apply(&d, &[PatchDirective::new("a", "1"), PatchDirective::new("a", "2")])
            .is_err());
        assert!(patcher.apply(&d, &[PatchDirective::new("", "1")]).is_err());
        assert!(patcher.apply(&d, &[PatchDirective::new("a b", "1")]).is_err());
        assert!(patcher.apply(&d, &[PatchDirective::new("a", "1\n2")]).is_err());
    }

    #[test]
    fn test_report_records_rewrites() {
        let d = doc(&["#listen_tcp = 1\n", "listen_tls = 0\n"]);
        let (_, report) = ConfigPatcher::new()
            .apply(
                &d,
                &[
                    PatchDirective::new("listen_tcp", "1"),
                    PatchDirective::new("listen_tls", "0"),
                ],
            )
            .unwrap();
        assert_eq!(report.rewritten.len(), 2);
        assert_eq!(report.rewritten[0].line, 1);
        assert_eq!(report.rewritten[0].after, "listen_tcp = 1\n");
        assert!(report.changed);
        assert!(report.summary().contains("2 rewritten"));
    }

    #[test]
    fn test_unchanged_when_already_set() {
        let d = doc(&["listen_tls = 0\n"]);
        let (_, report) = ConfigPatcher::new()
            .apply(&d, &[PatchDirective::new("listen_tls", "0")])
            .unwrap();
        assert!(!report.changed);
    }
}
