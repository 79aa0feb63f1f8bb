//! Brand-new flat files built from ordered fields.
//!
//! Used for files that are easier to write from scratch than to patch, such
//! as an NFS exports line:
//!
//! ```rust
//! use crucible::generate::GeneratedFile;
//!
//! let mut file = GeneratedFile::new(["/var/lib/nova/instances", "10.0.0.0/24", "(rw,sync)"]);
//! file.merge(1..=2).unwrap();
//! assert_eq!(file.render(), "/var/lib/nova/instances   10.0.0.0/24(rw,sync)\n");
//! ```

use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, info_span, Span};

use crate::error::{Error, Result};

/// Padding placed between fields
pub const FIELD_SEPARATOR: &str = "   ";

/// Ordered fields of a generated file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedFile {
    fields: Vec<String>,
}

impl GeneratedFile {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Join the fields in `range` into one field with nothing between them.
    ///
    /// The range is inclusive and must lie inside the field list.
    pub fn merge(&mut self, range: RangeInclusive<usize>) -> Result<()> {
        let (start, end) = (*range.start(), *range.end());
        if start > end || end >= self.fields.len() {
            return Err(Error::InvalidInput(format!(
                "cannot merge fields {}..={} of {}",
                start,
                end,
                self.fields.len()
            )));
        }
        let merged: String = self.fields.drain(start..=end).collect();
        self.fields.insert(start, merged);
        Ok(())
    }

    /// File content: fields padded apart, newline terminated
    pub fn render(&self) -> String {
        let mut content = self.fields.join(FIELD_SEPARATOR);
        content.push('\n');
        content
    }
}

/// Writes [`GeneratedFile`]s to the local filesystem.
#[derive(Debug, Clone)]
pub struct GeneratedFileWriter {
    span: Span,
}

impl Default for GeneratedFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratedFileWriter {
    pub fn new() -> Self {
        Self {
            span: info_span!("generated_file_writer"),
        }
    }

    /// Log under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Write `file` to `path`, replacing whatever is there.
    pub fn write(&self, path: &Path, file: &GeneratedFile) -> Result<PathBuf> {
        let _enter = self.span.enter();
        let content = file.render();
        write_atomic(path, content.as_bytes())?;
        debug!(path = %path.display(), fields = file.fields().len(), "Generated file");
        Ok(path.to_path_buf())
    }
}

/// Write `content` to `path` through a temporary file in the same directory.
///
/// Readers see either the old content or the new content, never a mix.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::file_io(parent, e))?;
    temp.write_all(content)
        .and_then(|_| temp.flush())
        .map_err(|e| Error::file_io(path, e))?;
    temp.persist(path).map_err(|e| Error::file_io(path, e.error))?;
    Ok(())
}
