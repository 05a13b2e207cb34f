//! Scenario manifest
//!
//! Plain text, one scenario identifier per line. Surrounding whitespace is
//! trimmed; blank lines and lines starting with `#` are ignored.

use std::path::Path;

use crate::error::{HarnessError, HarnessResult};

/// Ordered list of scenario identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    /// Parse manifest text.
    ///
    /// # Errors
    /// `Manifest` (with the 1-based line number) when an entry contains
    /// whitespace.
    pub fn parse(text: &str) -> HarnessResult<Self> {
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            if entry.chars().any(char::is_whitespace) {
                return Err(HarnessError::Manifest {
                    line: index + 1,
                    reason: format!("'{entry}' is not a single scenario identifier"),
                });
            }
            entries.push(entry.to_string());
        }
        Ok(Self { entries })
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Manifest of the given ids, in order.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Scenario ids in run order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Number of entries, counting repeats.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is enabled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_and_comment_lines() {
        let manifest = Manifest::parse(
            "# nightly suite\nstart_stop\n\n  counters  \n#roi_reset\nstart_reset\n",
        )
        .unwrap();
        assert_eq!(manifest.entries(), ["start_stop", "counters", "start_reset"]);
    }

    #[test]
    fn test_empty_manifest() {
        assert!(Manifest::parse("").unwrap().is_empty());
        assert!(Manifest::parse("\n# nothing yet\n   \n").unwrap().is_empty());
    }

    #[test]
    fn test_entry_with_arguments_is_rejected() {
        let err = Manifest::parse("start_stop\ncounters BL99:Det:N1\n").unwrap_err();
        match err {
            HarnessError::Manifest { line, .. } => assert_eq!(line, 2),
            other => panic!("expected manifest error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/run_tests.txt")).unwrap_err();
        assert!(matches!(err, HarnessError::Io(_)));
    }
}
