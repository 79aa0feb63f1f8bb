//! Line-preserving text documents.

use similar::TextDiff;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// An ordered sequence of raw lines, each keeping its own terminator.
///
/// `from_text` followed by `to_text` reproduces the input byte for byte,
/// including a missing final newline and `\r\n` endings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDocument {
    name: String,
    lines: Vec<String>,
}

impl ConfigDocument {
    /// Split `text` into lines, keeping terminators.
    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        Self {
            name: name.into(),
            lines: text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }

    /// Build a document from already-split lines.
    pub fn from_lines<I, S>(name: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Decode raw file content; config files must be UTF-8.
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let text = std::str::from_utf8(bytes).map_err(|e| {
            Error::InvalidInput(format!("'{}' is not valid UTF-8: {}", name, e))
        })?;
        Ok(Self::from_text(name, text))
    }

    /// Read a document from a local file, named after its path.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::file_io(path, e))?;
        Self::from_bytes(path.display().to_string(), &bytes)
    }

    /// Name used in reports and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw lines
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Number of lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the document has no lines
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Concatenate the lines back into file content
    pub fn to_text(&self) -> String {
        self.lines.concat()
    }

    /// Append a line, terminating the current last line first if needed
    pub fn push_line(&mut self, line: impl Into<String>) {
        if let Some(last) = self.lines.last_mut() {
            if !last.ends_with('\n') {
                last.push('\n');
            }
        }
        self.lines.push(line.into());
    }

    pub(crate) fn with_lines(&self, lines: Vec<String>) -> Self {
        Self {
            name: self.name.clone(),
            lines,
        }
    }

    /// Unified diff from `self` to `other`, empty when they are equal
    pub fn unified_diff(&self, other: &ConfigDocument) -> String {
        let old = self.to_text();
        let new = other.to_text();
        if old == new {
            return String::new();
        }
        TextDiff::from_lines(&old, &new)
            .unified_diff()
            .context_radius(3)
            .header(&format!("{}.bak", self.name), &other.name)
            .to_string()
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            f.write_str(line)?;
        }
        Ok(())
    }
}
