//! The single line grammar shared by every patch operation.
//!
//! A line decomposes into
//!
//! ```text
//! <indent><comment marker><key><delimiter><value><terminator>
//! ```
//!
//! where the comment marker is one or more `#` each followed by optional
//! blanks, the key is a run of characters other than whitespace, `=`, `:`
//! and `#`, and the delimiter is `=`, `:` or one of the caller's literal
//! delimiters, together with the blanks around it. Lines that do not fit
//! this shape (blank lines, section headers, prose comments) yield no match
//! and are always passed through untouched.

use regex::Regex;

use crate::error::{Error, Result};

/// The parsed decomposition of one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    /// Leading blanks before anything else
    pub indent: String,
    /// Comment marker including its trailing blanks, if the line is commented
    pub comment: Option<String>,
    /// The key, compared exactly against directive tokens
    pub key: String,
    /// Delimiter text exactly as found, surrounding blanks included
    pub delimiter: String,
    /// Everything after the delimiter up to the terminator
    pub value: String,
    /// `"\n"`, `"\r\n"` or empty for an unterminated final line
    pub terminator: String,
}

impl LineMatch {
    /// Whether the line was commented out
    pub fn is_commented(&self) -> bool {
        self.comment.is_some()
    }
}

/// Compiled line grammar for one set of literal delimiters.
#[derive(Debug, Clone)]
pub struct LineGrammar {
    regex: Regex,
}

impl LineGrammar {
    /// Build the grammar recognising `=`, `:` and every given literal.
    ///
    /// Longer literals are tried first so that `==` is not read as `=`
    /// followed by a value starting with `=`.
    pub fn new<'a>(literals: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut extra: Vec<&str> = literals
            .into_iter()
            .map(|l| l.trim_matches(|c| c == ' ' || c == '\t'))
            .filter(|l| !l.is_empty() && *l != "=" && *l != ":")
            .collect();
        extra.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        extra.dedup();

        let mut alternatives: Vec<String> = extra.iter().map(|l| regex::escape(l)).collect();
        alternatives.push("=".to_string());
        alternatives.push(":".to_string());

        // A blank-only literal (e.g. a single space) is covered by allowing an
        // empty core between the blanks; callers decide whether to accept it.
        let pattern = format!(
            r"^(?P<indent>[ \t]*)(?P<comment>(?:#[ \t]*)+)?(?P<key>[^\s=:#]+)(?P<delim>[ \t]*(?:{})[ \t]*|[ \t]+)(?P<value>[^\r\n]*?)(?P<eol>\r?\n)?$",
            alternatives.join("|")
        );

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::InvalidInput(format!("invalid delimiter set: {}", e)))?;
        Ok(Self { regex })
    }

    /// Decompose `line`, which may carry its own terminator.
    pub fn parse(&self, line: &str) -> Option<LineMatch> {
        let caps = self.regex.captures(line)?;
        let text = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or("");

        Some(LineMatch {
            indent: text("indent").to_string(),
            comment: caps.name("comment").map(|m| m.as_str().to_string()),
            key: text("key").to_string(),
            delimiter: text("delim").to_string(),
            value: text("value").to_string(),
            terminator: text("eol").to_string(),
        })
    }
}
