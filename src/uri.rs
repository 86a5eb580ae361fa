//! Workspace and document URIs
//!
//! A workspace root names a repository at a revision; a document URI adds
//! the file path as the fragment:
//!
//! ```text
//! git://github.com/gorilla/mux?0a192a19          workspace root
//! git://github.com/gorilla/mux?0a192a19#mux.go   document
//! ```

use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProxyError, Result};

/// A repository at a specific revision
///
/// Two roots are equal iff scheme, host, path and revision are equal. The
/// path is canonicalized on parse (no trailing `/`, no `.git` suffix) so
/// that equivalent spellings map to the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceRoot {
    scheme: String,
    host: String,
    path: String,
    rev: String,
}

impl WorkspaceRoot {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        path: impl AsRef<str>,
        rev: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: canonical_repo_path(path.as_ref()),
            rev: rev.into(),
        }
    }

    /// Parse a workspace root; a fragment (file path) is rejected
    pub fn parse(input: &str) -> Result<Self> {
        let document = DocumentUri::parse(input)?;
        if !document.path.is_empty() {
            return Err(ProxyError::InvalidUri {
                uri: input.to_string(),
                message: "workspace root must not name a file".to_string(),
            });
        }
        Ok(document.root)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Repository path on the host, e.g. `/gorilla/mux`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn rev(&self) -> &str {
        &self.rev
    }

    /// Host-qualified repository name, e.g. `github.com/gorilla/mux`
    pub fn repo(&self) -> String {
        format!("{}{}", self.host, self.path)
    }

    /// URL a client would clone the repository from
    pub fn clone_url(&self) -> String {
        format!("https://{}{}", self.host, self.path)
    }

    /// URI of a file inside this workspace
    pub fn with_file_path(&self, path: &str) -> DocumentUri {
        DocumentUri {
            root: self.clone(),
            path: path.trim_start_matches('/').to_string(),
        }
    }
}

impl fmt::Display for WorkspaceRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path)?;
        if !self.rev.is_empty() {
            write!(f, "?{}", self.rev)?;
        }
        Ok(())
    }
}

impl FromStr for WorkspaceRoot {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkspaceRoot {
    type Error = ProxyError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<WorkspaceRoot> for String {
    fn from(root: WorkspaceRoot) -> Self {
        root.to_string()
    }
}

/// Characters escaped in the fragment; `%` and `#` so that paths round-trip
const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// A file inside a workspace
///
/// The file path is held decoded (`a b.go`, not `a%20b.go`) and is
/// percent-encoded again when the URI is displayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentUri {
    root: WorkspaceRoot,
    path: String,
}

impl DocumentUri {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |message: String| ProxyError::InvalidUri {
            uri: input.to_string(),
            message,
        };

        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?;
        let path = canonical_repo_path(url.path());
        if path.is_empty() {
            return Err(invalid("missing repository path".to_string()));
        }

        let file_path = percent_decode_str(url.fragment().unwrap_or_default())
            .decode_utf8()
            .map_err(|e| invalid(format!("file path is not UTF-8: {}", e)))?;

        Ok(Self {
            root: WorkspaceRoot {
                scheme: url.scheme().to_string(),
                host: host.to_string(),
                path,
                rev: url.query().unwrap_or_default().to_string(),
            },
            path: file_path.trim_start_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.root
    }

    /// File path relative to the workspace root (no leading `/`)
    pub fn file_path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root, utf8_percent_encode(&self.path, FRAGMENT))
    }
}

impl FromStr for DocumentUri {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn canonical_repo_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
