use crate::FilesError;
use std::fmt;
use std::path::{Component, Path};
use vault_types::NonEmptyText;

/// Name fragments that must never appear in a blob path.
///
/// Blob paths are generated by the document store, so anything resembling traversal, a hidden
/// system directory or an executable is either a bug or an attack.
const FORBIDDEN_PATH_PATTERNS: &[&str] = &[
    "..", ".git/", ".ssh/", ".exe", ".dll", ".so", ".dylib", // cspell:ignore dylib
    ".sh", ".bash", ".bat", ".cmd", ".ps1", ".app",
];

const MAX_PATH_LEN: usize = 512;

/// A validated, relative, forward-slash separated blob path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobPath(NonEmptyText);

impl BlobPath {
    /// Validates `input` as a blob path.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::InvalidPath`] if the path is empty, absolute, longer than 512
    /// bytes, contains `.`/`..` components, backslashes, or any forbidden pattern.
    pub fn new(input: impl AsRef<str>) -> Result<Self, FilesError> {
        let raw = input.as_ref();
        let text = NonEmptyText::new(raw)
            .map_err(|_| FilesError::InvalidPath("blob path cannot be empty".into()))?;
        let value = text.as_str();

        if value != raw {
            return Err(FilesError::InvalidPath(format!(
                "blob path must not carry surrounding whitespace: '{}'",
                raw
            )));
        }
        if value.len() > MAX_PATH_LEN {
            return Err(FilesError::InvalidPath(format!(
                "blob path exceeds {} bytes",
                MAX_PATH_LEN
            )));
        }
        if value.contains('\\') || value.contains('\0') {
            return Err(FilesError::InvalidPath(format!(
                "blob path contains an illegal character: '{}'",
                value
            )));
        }
        if let Some(pattern) = FORBIDDEN_PATH_PATTERNS
            .iter()
            .find(|p| value.to_ascii_lowercase().contains(*p))
        {
            return Err(FilesError::InvalidPath(format!(
                "blob path contains forbidden pattern '{}': '{}'",
                pattern, value
            )));
        }

        let all_normal = Path::new(value)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !all_normal || value.ends_with('/') || value.contains("//") {
            return Err(FilesError::InvalidPath(format!(
                "blob path must be relative with plain segments: '{}'",
                value
            )));
        }

        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Path segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.as_str().split('/')
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_generated_document_paths() {
        let path = BlobPath::new("documents/aa/bb/v12.enc").unwrap();
        assert_eq!(path.segments().collect::<Vec<_>>(), ["documents", "aa", "bb", "v12.enc"]);
    }

    #[test]
    fn test_rejects_traversal_and_absolute_paths() {
        for bad in [
            "",
            "/etc/passwd",
            "documents/../secrets",
            "./documents/a",
            "documents//a",
            "documents/a/",
            "documents\\a",
            " documents/a",
        ] {
            assert!(
                matches!(BlobPath::new(bad), Err(FilesError::InvalidPath(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_rejects_executable_names() {
        assert!(BlobPath::new("documents/a/payload.exe").is_err());
        assert!(BlobPath::new("documents/a/RUN.SH").is_err());
    }
}
