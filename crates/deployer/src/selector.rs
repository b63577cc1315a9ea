use std::{
    fs, io,
    path::{Path, PathBuf},
};

use common::config::Config;
use derive_more::{Display, Error, From};
use regex::Regex;
use tracing::{debug, warn};

/// Package selection errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum SelectError {
    /// Package directory does not exist.
    #[display(fmt = "package directory {} does not exist", "_0.display()")]
    #[from(ignore)]
    NotFound(#[error(ignore)] PathBuf),

    /// Package name pattern is not a valid regular expression.
    #[display(fmt = "invalid package name pattern: {}", _0)]
    InvalidPattern(regex::Error),

    /// IO-related error.
    Io(io::Error),
}

/// Directory selected for packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageCandidate {
    /// Directory name, which is also the package name.
    pub name: String,

    /// Path to the package directory.
    pub source_path: PathBuf,
}

/// Rule used to decide which directories are packages.
#[derive(Debug)]
pub(crate) enum Filter {
    /// Keep only explicitly named packages.
    Allowed(Vec<String>),

    /// Keep packages whose whole name matches the expression.
    Pattern(Regex),
}

impl Filter {
    /// Create a filter from an explicit allow-list and a pattern.
    ///
    /// Non-empty allow-list takes precedence, in which case the pattern is not even compiled.
    pub(crate) fn new(pattern: &str, allowed: &[String]) -> Result<Self, SelectError> {
        if !allowed.is_empty() {
            return Ok(Self::Allowed(allowed.to_vec()));
        }

        Ok(Self::Pattern(Regex::new(&format!("^(?:{pattern})$"))?))
    }

    /// Create a filter from the provided configuration.
    pub(crate) fn from_config(config: &Config) -> Result<Self, SelectError> {
        Self::new(config.package_name_pattern(), &config.allowed_packages)
    }

    /// Check if a directory name passes the filter.
    pub(crate) fn matches(&self, name: &str) -> bool {
        match self {
            Self::Allowed(names) => names.iter().any(|allowed| allowed == name),
            Self::Pattern(regex) => regex.is_match(name),
        }
    }
}

/// List immediate subdirectories of `root` that pass the `filter`, sorted by name.
///
/// An empty result is not an error, the caller decides whether there is anything to do.
pub(crate) fn select(root: &Path, filter: &Filter) -> Result<Vec<PackageCandidate>, SelectError> {
    if !root.is_dir() {
        return Err(SelectError::NotFound(root.to_path_buf()));
    }

    let mut candidates = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let source_path = entry.path();

        // Follows symlinks, so linked package directories are kept.
        if !source_path.is_dir() {
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!(path = %source_path.display(), "skipping directory with non-unicode name");
            continue;
        };

        if filter.matches(&name) {
            candidates.push(PackageCandidate { name, source_path });
        } else {
            debug!(%name, "directory does not match package filter");
        }
    }

    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(candidates)
}
