//! Shared types for git-source-sync

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{GitError, validate_git_ref};

/// Length of a hex-encoded SHA-256 digest.
const SOURCE_ID_LEN: usize = 64;

/// Manifest path used when a source does not configure one.
const DEFAULT_MANIFEST: &str = ".manifest";

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0}")]
    InvalidCharacter(char),
    #[error("expected {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Errors raised while loading or validating a source descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source url cannot be empty")]
    EmptyUrl,
    #[error("invalid branch: {0}")]
    InvalidBranch(#[source] GitError),
    #[error("invalid extension filter: {0:?}")]
    InvalidExtension(String),
    #[error("failed to read source file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse source descriptor: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable identity of a source: hex-encoded SHA-256 of its remote URL.
///
/// Branch and authentication do not participate, so every source that points
/// at the same remote shares one clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(String);

impl SourceId {
    /// Derive the identity for a remote URL.
    pub fn from_url(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Returns the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for SourceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.len() != SOURCE_ID_LEN {
            return Err(ParseError::InvalidLength {
                expected: SOURCE_ID_LEN,
                actual: s.len(),
            });
        }

        for c in s.chars() {
            if !c.is_ascii_digit() && !('a'..='f').contains(&c) {
                return Err(ParseError::InvalidCharacter(c));
            }
        }

        Ok(SourceId(s.to_string()))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to authenticate against a source's remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAuth {
    /// In-memory SSH key pair. The public key is optional; libssh2 derives it
    /// from the private key when absent.
    Ssh {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        private_key: String,
    },
    /// Access token sent as the password of user `git`.
    Token { value: String },
    /// No credentials beyond the username embedded in the URL.
    #[default]
    None,
}

impl SourceAuth {
    /// Short label safe to log (never includes secrets).
    pub fn kind(&self) -> &'static str {
        match self {
            SourceAuth::Ssh { .. } => "ssh",
            SourceAuth::Token { .. } => "token",
            SourceAuth::None => "none",
        }
    }
}

/// A git repository serving as a content source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Remote URL, compared byte-for-byte against the clone's remotes.
    pub url: String,
    /// Tracked branch.
    pub branch: String,
    /// Branch to anchor the tracking ref on when the tracked branch does not
    /// exist on the remote yet. Defaults to `branch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub auth: SourceAuth,
    /// Content directories, relative to the repository root.
    #[serde(default)]
    pub directories: BTreeSet<PathBuf>,
    /// File extensions to include, without the leading dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Glob patterns excluded from bundles.
    #[serde(default)]
    pub bundle_ignore: Vec<String>,
}

fn default_manifest() -> PathBuf {
    PathBuf::from(DEFAULT_MANIFEST)
}

impl SourceDescriptor {
    /// Creates a descriptor with no auth and no bundle filters.
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            base_branch: None,
            auth: SourceAuth::None,
            directories: BTreeSet::new(),
            extensions: Vec::new(),
            manifest: default_manifest(),
            bundle_ignore: Vec::new(),
        }
    }

    pub fn with_auth(mut self, auth: SourceAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_base_branch(mut self, base_branch: impl Into<String>) -> Self {
        self.base_branch = Some(base_branch.into());
        self
    }

    pub fn with_directories<I, P>(mut self, directories: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.directories = directories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = manifest.into();
        self
    }

    pub fn with_bundle_ignore<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bundle_ignore = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Identity of this source.
    pub fn source_id(&self) -> SourceId {
        SourceId::from_url(&self.url)
    }

    /// The branch the tracking ref falls back to on first sync.
    pub fn base_branch(&self) -> &str {
        self.base_branch.as_deref().unwrap_or(&self.branch)
    }

    /// Check the descriptor and normalise the extension filter.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        validate_git_ref(&self.branch, "branch").map_err(ConfigError::InvalidBranch)?;
        if let Some(base) = &self.base_branch {
            validate_git_ref(base, "base_branch").map_err(ConfigError::InvalidBranch)?;
        }

        let mut extensions = Vec::with_capacity(self.extensions.len());
        for ext in &self.extensions {
            let normalized = ext.trim().trim_start_matches('.').to_ascii_lowercase();
            if normalized.is_empty() || normalized.contains(['/', '\\']) {
                return Err(ConfigError::InvalidExtension(ext.clone()));
            }
            extensions.push(normalized);
        }
        self.extensions = extensions;

        Ok(self)
    }

    /// Parse and validate a descriptor from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let descriptor: SourceDescriptor = serde_json::from_str(json)?;
        descriptor.validate()
    }

    /// Load and validate a descriptor from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }
}
