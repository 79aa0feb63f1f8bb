//! INI files describing what to patch.
//!
//! Each section names one remote file and the values to set in it:
//!
//! ```ini
//! [libvirtd]
//! filename = libvirtd.conf
//! filepath = /etc/libvirt
//! listen_tls = 0
//! listen_tcp = 1
//! auth_tcp = "none"
//! ```
//!
//! `filename` and `filepath` are metadata and never become directives. Key
//! case and order are kept as written.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Error, Result};
use crate::patch::{Delimiter, NotFoundPolicy, PatchDirective};

/// Key holding the file name of a section's target
pub const FILENAME_KEY: &str = "filename";

/// Key holding the directory of a section's target
pub const FILEPATH_KEY: &str = "filepath";

/// One `[section]` of an INI file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSection {
    name: String,
    entries: IndexMap<String, String>,
}

impl IniSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// All entries, metadata included, in file order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries that are not metadata
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries().filter(|(k, _)| !is_metadata(k))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// Remote path of the file this section patches, from `filepath` and
    /// `filename`.
    ///
    /// A `filename` that is already absolute is used as is.
    pub fn remote_path(&self) -> Option<PathBuf> {
        let filename = self.get(FILENAME_KEY)?;
        let filename = Path::new(filename);
        if filename.is_absolute() {
            return Some(filename.to_path_buf());
        }
        let dir = self.get(FILEPATH_KEY)?;
        Some(Path::new(dir).join(filename))
    }

    /// Directives setting every non-metadata key of the section.
    pub fn directives(&self, delimiter: &Delimiter, not_found: NotFoundPolicy) -> Vec<PatchDirective> {
        self.values()
            .map(|(key, value)| {
                PatchDirective::new(key, value)
                    .delimiter(delimiter.clone())
                    .not_found(not_found)
            })
            .collect()
    }
}

fn is_metadata(key: &str) -> bool {
    key.eq_ignore_ascii_case(FILENAME_KEY) || key.eq_ignore_ascii_case(FILEPATH_KEY)
}

/// Sections of an INI file, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniFile {
    sections: IndexMap<String, IniSection>,
}

impl IniFile {
    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_io(path, e))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse INI text.
    ///
    /// Blank lines and lines starting with `#` or `;` are skipped. A key is
    /// separated from its value by the first `=` or `:`. A repeated key
    /// keeps its last value.
    pub fn parse(content: &str) -> Result<Self> {
        let mut sections: IndexMap<String, IniSection> = IndexMap::new();
        let mut current: Option<String> = None;

        for (index, line) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim();
                if name.is_empty() {
                    return Err(Error::Config(format!("empty section name at line {}", line_no)));
                }
                sections
                    .entry(name.to_string())
                    .or_insert_with(|| IniSection::new(name));
                current = Some(name.to_string());
                continue;
            }

            let Some(section) = current.as_ref().and_then(|name| sections.get_mut(name)) else {
                return Err(Error::Config(format!(
                    "entry outside of any section at line {}",
                    line_no
                )));
            };

            let Some(split) = line.find(['=', ':']) else {
                return Err(Error::Config(format!(
                    "expected 'key = value' at line {}",
                    line_no
                )));
            };
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            if key.is_empty() {
                return Err(Error::Config(format!("missing key at line {}", line_no)));
            }

            if section.insert(key, value).is_some() {
                warn!(section = %section.name(), key = %key, line = line_no, "Duplicate key, keeping the last value");
            }
        }

        Ok(Self { sections })
    }

    /// Section `name`, or a config error naming it
    pub fn section(&self, name: &str) -> Result<&IniSection> {
        self.sections
            .get(name)
            .ok_or_else(|| Error::Config(format!("no section [{}]", name)))
    }

    pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.values()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
# migration settings
[libvirtd]
filename = libvirtd.conf
filepath = /etc/libvirt
listen_tls = 0
listen_tcp = 1
auth_tcp = "none"

[nova]
filename: /etc/nova/nova.conf
live_migration_flag = VIR_MIGRATE_UNDEFINE_SOURCE,VIR_MIGRATE_PEER2PEER
"#;

    #[test]
    fn test_parse_sections_in_order() {
        let ini = IniFile::parse(SAMPLE).unwrap();
        let names: Vec<_> = ini.sections().map(|s| s.name()).collect();
        assert_eq!(names, vec!["libvirtd", "nova"]);

        let libvirtd = ini.section("libvirtd").unwrap();
        assert_eq!(libvirtd.get("auth_tcp"), Some("\"none\""));
        let keys: Vec<_> = libvirtd.values().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["listen_tls", "listen_tcp", "auth_tcp"]);
    }

    #[test]
    fn test_remote_path() {
        let ini = IniFile::parse(SAMPLE).unwrap();
        assert_eq!(
            ini.section("libvirtd").unwrap().remote_path(),
            Some(PathBuf::from("/etc/libvirt/libvirtd.conf"))
        );
        assert_eq!(
            ini.section("nova").unwrap().remote_path(),
            Some(PathBuf::from("/etc/nova/nova.conf"))
        );
    }

    #[test]
    fn test_directives_skip_metadata() {
        let ini = IniFile::parse(SAMPLE).unwrap();
        let directives = ini
            .section("libvirtd")
            .unwrap()
            .directives(&Delimiter::Literal("=".into()), NotFoundPolicy::Append);
        assert_eq!(directives.len(), 3);
        assert_eq!(directives[0].token, "listen_tls");
        assert_eq!(directives[0].not_found, NotFoundPolicy::Append);
    }

    #[test]
    fn test_value_keeps_later_separators() {
        let ini = IniFile::parse("[s]\nurl = http://host:80/x\n").unwrap();
        assert_eq!(ini.section("s").unwrap().get("url"), Some("http://host:80/x"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(IniFile::parse("key = 1\n"), Err(Error::Config(_))));
        assert!(IniFile::parse("[s]\njust words\n").is_err());
        assert!(IniFile::parse("[]\n").is_err());
        assert!(IniFile::parse("[s]\n").unwrap().section("t").is_err());
    }
}
