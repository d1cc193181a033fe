//! Error types for the high-level API.

use std::fmt;
use std::path::{Path, PathBuf};

use hdfkit_format::error::{ErrorCategory, Feature, FormatError};

/// What went wrong, without the context of where.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Format(FormatError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path} not found")]
    NotFound { path: String, siblings: Vec<String> },
    #[error("{0} is not a dataset")]
    NotADataset(String),
    #[error("{0} is not a group")]
    NotAGroup(String),
    #[error("expected {expected} elements for the given shape, got {actual}")]
    Shape { expected: u64, actual: u64 },
    #[error("{what} cannot be read as {requested}")]
    Type { what: String, requested: &'static str },
}

impl From<FormatError> for ErrorKind {
    fn from(e: FormatError) -> Self {
        match e {
            FormatError::NotFound { name, siblings } => ErrorKind::NotFound {
                path: name,
                siblings,
            },
            FormatError::NotAGroup(path) => ErrorKind::NotAGroup(path),
            FormatError::ShapeMismatch { expected, actual } => ErrorKind::Shape { expected, actual },
            other => ErrorKind::Format(other),
        }
    }
}

/// An error with the operation, file and object it happened in.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    operation: &'static str,
    file: Option<PathBuf>,
    object: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            operation: "",
            file: None,
            object: None,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    /// The underlying format error, if this came from parsing.
    pub fn format_error(&self) -> Option<&FormatError> {
        match &self.kind {
            ErrorKind::Format(e) => Some(e),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match &self.kind {
            ErrorKind::Format(e) => e.category(),
            ErrorKind::Io(_) => ErrorCategory::Io,
            ErrorKind::NotFound { .. } | ErrorKind::NotADataset(_) | ErrorKind::NotAGroup(_) => {
                ErrorCategory::NotFound
            }
            ErrorKind::Shape { .. } | ErrorKind::Type { .. } => ErrorCategory::Usage,
        }
    }

    /// Human-readable hints for getting past this error. Never empty.
    pub fn suggestions(&self) -> Vec<String> {
        let mut out = Vec::new();
        match &self.kind {
            ErrorKind::NotFound { siblings, .. } => {
                if siblings.is_empty() {
                    out.push("the parent group is empty; check the path from the root".to_string());
                } else {
                    out.push(format!("the parent group contains: {}", siblings.join(", ")));
                }
                out.push("paths are case sensitive and use '/' separators".to_string());
            }
            ErrorKind::NotADataset(_) => {
                out.push("use File::group for groups; Group::datasets lists the datasets".to_string())
            }
            ErrorKind::NotAGroup(_) => {
                out.push("an intermediate path component names a dataset, not a group".to_string())
            }
            ErrorKind::Format(FormatError::UnsupportedFeature(feature)) => {
                out.push(unsupported_hint(feature));
            }
            ErrorKind::Type { .. } => {
                out.push("use Dataset::read to get untyped values, or check Dataset::datatype".to_string())
            }
            _ => {}
        }
        out.extend(category_hints(self.category()).iter().map(|s| s.to_string()));
        out
    }

    fn with_operation(mut self, operation: &'static str) -> Self {
        if self.operation.is_empty() {
            self.operation = operation;
        }
        self
    }

    fn with_file(mut self, file: &Path) -> Self {
        if self.file.is_none() {
            self.file = Some(file.to_path_buf());
        }
        self
    }

    fn with_object(mut self, object: &str) -> Self {
        if self.object.is_none() {
            self.object = Some(object.to_string());
        }
        self
    }
}

fn unsupported_hint(feature: &Feature) -> String {
    match feature {
        Feature::Filter(id) => {
            format!("rewrite the file without filter {id}, e.g. `h5repack -f NONE`")
        }
        Feature::DenseLinks | Feature::DenseAttributes => {
            "repack the file with compact groups, e.g. `h5repack --latest` with small link counts".to_string()
        }
        other => format!("the file uses {other}; convert it to a layout without them"),
    }
}

fn category_hints(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Signature => &[
            "check that this is an HDF5 file; it must contain \\x89HDF\\r\\n\\x1a\\n at offset 0, 512, 1024, ...",
            "files with a large user block need a bigger FileAccessProps::signature_search_limit",
        ],
        ErrorCategory::Version => &["the file uses a newer structure version; rewrite it with an older library version bound"],
        ErrorCategory::Corruption => &[
            "the file may be truncated or damaged; compare its size with the source copy",
            "open with FileAccessProps::new().debug(true) to trace where parsing stops",
        ],
        ErrorCategory::NotFound => &["Group::children lists what a group contains"],
        ErrorCategory::Unsupported => &["this structure is valid HDF5 but not supported by hdfkit"],
        ErrorCategory::Decode => &["the stored bytes could not be decoded; the data may be damaged"],
        ErrorCategory::Usage => &["check the arguments against the dataset's shape and datatype"],
        ErrorCategory::Io => &["check that the path exists and is readable"],
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.operation.is_empty() {
            write!(f, "{}: ", self.operation)?;
        }
        write!(f, "{}", self.kind)?;
        if let Some(object) = &self.object {
            write!(f, " (object {object})")?;
        }
        if let Some(file) = &self.file {
            write!(f, " (file {})", file.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Format(e) => Some(e),
            ErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::new(e.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attach context to errors at API boundaries. The innermost context wins.
pub trait ResultExt<T> {
    fn during(self, operation: &'static str) -> Result<T>;
    fn in_file(self, file: Option<&Path>) -> Result<T>;
    fn at_object(self, object: &str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|e| e.into().with_operation(operation))
    }

    fn in_file(self, file: Option<&Path>) -> Result<T> {
        self.map_err(|e| match file {
            Some(f) => e.into().with_file(f),
            None => e.into(),
        })
    }

    fn at_object(self, object: &str) -> Result<T> {
        self.map_err(|e| e.into().with_object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_kept_innermost_first() {
        let r: Result<()> = Err(FormatError::InvalidBTreeSignature { address: 96 }.into());
        let e = r
            .during("read")
            .at_object("/a/b")
            .during("open")
            .in_file(Some(Path::new("x.h5")))
            .unwrap_err();
        assert_eq!(e.operation(), "read");
        assert_eq!(e.object(), Some("/a/b"));
        assert_eq!(e.category(), ErrorCategory::Corruption);
        let text = e.to_string();
        assert!(text.starts_with("read: "));
        assert!(text.contains("/a/b") && text.contains("x.h5"));
    }

    #[test]
    fn every_category_has_suggestions() {
        let errors: Vec<Error> = vec![
            FormatError::SignatureNotFound { searched_up_to: 8 }.into(),
            FormatError::UnsupportedSuperblockVersion(9).into(),
            FormatError::CyclicContinuation { address: 0 }.into(),
            FormatError::UnsupportedFeature(Feature::Filter(4)).into(),
            FormatError::Decompression("bad".into()).into(),
            FormatError::InvalidSelection("bad".into()).into(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into(),
            ErrorKind::NotADataset("/g".into()).into(),
        ];
        for e in errors {
            assert!(!e.suggestions().is_empty(), "{e}");
        }
    }

    #[test]
    fn not_found_lists_siblings() {
        let e: Error = FormatError::NotFound {
            name: "/data/tempx".into(),
            siblings: vec!["temp".into(), "pressure".into()],
        }
        .into();
        assert!(matches!(e.kind(), ErrorKind::NotFound { .. }));
        assert_eq!(e.category(), ErrorCategory::NotFound);
        assert!(e.suggestions()[0].contains("temp, pressure"));
    }
}
