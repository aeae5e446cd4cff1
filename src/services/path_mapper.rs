//! src/services/path_mapper.rs
//!
//! Translates local library paths into remote destination paths using an
//! ordered list of prefix rewrite rules. Rules can be reloaded at runtime;
//! readers always see one immutable snapshot.

use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};
use thiserror::Error;
use tracing::info;

/// One `{local, remote}` prefix pair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PathRule {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("no path mapping covers `{0}`")]
    Unmapped(PathBuf),
    #[error("path `{0}` contains `.` or `..` segments")]
    NotNormalized(PathBuf),
}

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("reading path mappings from `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("parsing path mappings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable set of prefix rules.
#[derive(Clone, Debug, Default)]
pub struct PathMapper {
    rules: Vec<PathRule>,
}

impl PathMapper {
    /// Build a mapper, dropping rules with an empty side.
    pub fn new(rules: Vec<PathRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter(|rule| !rule.local.trim().is_empty() && !rule.remote.trim().is_empty())
            .collect();
        Self { rules }
    }

    /// Parse the `[{"local": "/media", "remote": "/Emby"}]` form.
    pub fn from_json(raw: &str) -> Result<Self, RuleLoadError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let rules: Vec<PathRule> = serde_json::from_str(raw)?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[PathRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Map `local` onto its remote path.
    ///
    /// The rule with the longest local prefix (counted in path components)
    /// wins; on a tie the earlier rule is kept. Matching is component-wise,
    /// so `/media` does not cover `/media2/x`. Paths with `.` or `..`
    /// segments are refused rather than resolved.
    pub fn map(&self, local: &Path) -> Result<String, MapError> {
        if !is_normalized(local) {
            return Err(MapError::NotNormalized(local.to_path_buf()));
        }
        let mut best: Option<(usize, &PathRule, &Path)> = None;
        for rule in &self.rules {
            let prefix = Path::new(&rule.local);
            let Ok(rest) = local.strip_prefix(prefix) else {
                continue;
            };
            let depth = prefix.components().count();
            if best.is_none_or(|(best_depth, _, _)| depth > best_depth) {
                best = Some((depth, rule, rest));
            }
        }

        let (_, rule, rest) = best.ok_or_else(|| MapError::Unmapped(local.to_path_buf()))?;
        Ok(join_remote(&rule.remote, rest))
    }
}

/// True when `path` has no `.` or `..` segments.
pub fn is_normalized(path: &Path) -> bool {
    path.components()
        .all(|component| !matches!(component, Component::CurDir | Component::ParentDir))
}

/// Append `rest` to a remote prefix using `/` separators.
fn join_remote(remote_prefix: &str, rest: &Path) -> String {
    let base = remote_prefix.trim_end_matches('/');
    let tail = rest
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    match (base.is_empty(), tail.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => base.to_string(),
        (_, false) => format!("{}/{}", base, tail),
    }
}

/// Shared, reloadable handle to the current [`PathMapper`].
#[derive(Clone, Debug)]
pub struct RuleStore {
    current: Arc<RwLock<Arc<PathMapper>>>,
    inline: String,
    file: Option<PathBuf>,
}

impl RuleStore {
    /// Load rules from `file` when given, otherwise from the inline JSON.
    pub fn load(inline: impl Into<String>, file: Option<PathBuf>) -> Result<Self, RuleLoadError> {
        let inline = inline.into();
        let mapper = read_rules(&inline, file.as_deref())?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(mapper))),
            inline,
            file,
        })
    }

    pub fn from_mapper(mapper: PathMapper) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(mapper))),
            inline: String::new(),
            file: None,
        }
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<PathMapper> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, mapper: PathMapper) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(mapper);
    }

    /// Re-read the configured source and swap it in. On error the previous
    /// snapshot stays active.
    pub fn reload(&self) -> Result<usize, RuleLoadError> {
        let mapper = read_rules(&self.inline, self.file.as_deref())?;
        let count = mapper.rules().len();
        self.replace(mapper);
        info!(rules = count, "path mappings reloaded");
        Ok(count)
    }
}

fn read_rules(inline: &str, file: Option<&Path>) -> Result<PathMapper, RuleLoadError> {
    match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            PathMapper::from_json(&raw)
        }
        None => PathMapper::from_json(inline),
    }
}
