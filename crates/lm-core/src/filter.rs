//! Include/exclude filtering and link-candidate classification.
//!
//! Globs are compiled to anchored regular expressions:
//! `**` matches across separators, `*` and `?` stay within one component.
//! A glob without a `/` matches at any depth (`*.nfo` excludes every nfo).
//! Directories pass an include glob when they lead towards its literal
//! prefix, so `Movies/**` keeps the `Movies` directory itself.

use regex::Regex;
use std::collections::HashSet;

use crate::config::FilterConfig;
use crate::error::{Error, Result};
use crate::model::{is_within, EntryKind};

/// How the reconciler should treat a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    /// Filtered out; no inventory entry may exist for it.
    Excluded,
    /// A directory, mirrored to preserve tree shape.
    Mirror,
    /// A recognized file that gets a symlink.
    Link,
    /// A file that is tracked in the inventory but never linked.
    Track,
}

impl PathClass {
    /// Whether this class produces link operations.
    pub fn materializes(&self) -> bool {
        matches!(self, PathClass::Mirror | PathClass::Link)
    }
}

#[derive(Debug, Clone)]
struct IncludeRule {
    re: Regex,
    /// Components before the first wildcard; `None` for floating globs.
    anchor: Option<String>,
}

impl IncludeRule {
    fn admits(&self, path: &str, kind: EntryKind) -> bool {
        if self.re.is_match(path) {
            return true;
        }
        if kind != EntryKind::Directory {
            return false;
        }
        match &self.anchor {
            None => true,
            Some(anchor) => is_within(anchor, path),
        }
    }
}

/// Compiled form of [`FilterConfig`].
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Vec<IncludeRule>,
    exclude: Vec<Regex>,
    extensions: HashSet<String>,
    skip_dir_names: HashSet<String>,
}

impl PathFilter {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let include = config
            .include
            .iter()
            .map(|g| {
                Ok(IncludeRule {
                    re: glob_to_regex(g)?,
                    anchor: literal_anchor(g),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let exclude = config
            .exclude
            .iter()
            .map(|g| glob_to_regex(g))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            include,
            exclude,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            skip_dir_names: config.skip_dir_names.iter().cloned().collect(),
        })
    }

    /// Include globs, when present, must match; exclude globs must not.
    pub fn is_excluded(&self, path: &str, kind: EntryKind) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|r| r.admits(path, kind)) {
            return true;
        }
        self.exclude.iter().any(|re| re.is_match(path))
    }

    pub fn classify(&self, path: &str, kind: EntryKind) -> PathClass {
        if self.is_excluded(path, kind) {
            return PathClass::Excluded;
        }
        match kind {
            EntryKind::Directory => PathClass::Mirror,
            EntryKind::File if self.is_link_candidate(path) => PathClass::Link,
            EntryKind::File => PathClass::Track,
        }
    }

    /// Recognized extension and no skipped directory among the ancestors.
    pub fn is_link_candidate(&self, path: &str) -> bool {
        let mut components: Vec<&str> = path.split('/').collect();
        let Some(name) = components.pop() else {
            return false;
        };
        if components.iter().any(|c| self.skip_dir_names.contains(*c)) {
            return false;
        }
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        self.extensions.is_empty() || self.extensions.contains(&ext.to_lowercase())
    }
}

fn literal_anchor(glob: &str) -> Option<String> {
    let glob = glob.trim_start_matches('/');
    if !glob.contains('/') {
        return None;
    }
    let literal: Vec<&str> = glob
        .split('/')
        .take_while(|c| !c.contains(['*', '?']))
        .collect();
    Some(literal.join("/"))
}

/// Translate a glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let glob = glob.trim_start_matches('/');
    let mut pattern = String::from("^");
    if !glob.contains('/') {
        pattern.push_str("(?:.*/)?");
    }

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    pattern.push_str("(?:.*/)?");
                } else {
                    pattern.push_str(".*");
                }
            }
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    // A matching directory also covers everything beneath it.
    pattern.push_str("(?:/.*)?$");

    Regex::new(&pattern).map_err(|e| Error::Validation(format!("invalid glob '{glob}': {e}")))
}
