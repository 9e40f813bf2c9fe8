// SPDX-License-Identifier: Apache-2.0

//! Resolution of configured file patterns into watchable directories and
//! filename matchers.
//!
//! A file spec is `prefix + time_pattern + suffix` where the time pattern is
//! a strftime-style template. The template is translated into a regular
//! expression for matching filenames, and materialized against the current
//! local time to decide which file is the active time bucket.

use chrono::{DateTime, Datelike, Local, Timelike};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::FileSpecConfig;

#[derive(Error, Debug)]
pub enum PatternError {
    #[error("invalid filename matcher for prefix '{prefix}': {source}")]
    Matcher {
        prefix: String,
        source: regex::Error,
    },
}

/// Translate a strftime-style time pattern into a regular expression
/// fragment. `%Y` matches four digits, `%m`/`%d`/`%H`/`%M` match two; any
/// other `%X` escape stands for the literal character `X`. Non-escape
/// characters match literally.
pub fn translate_time_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str("[0-9]{4}"),
            Some('m') | Some('d') | Some('H') | Some('M') => out.push_str("[0-9]{2}"),
            Some(other) => out.push_str(&regex::escape(&other.to_string())),
            // a trailing '%' matches itself
            None => out.push_str(&regex::escape("%")),
        }
    }

    out
}

/// Materialize a time pattern against a wall-clock instant. Supports the
/// same escape set as [`translate_time_pattern`]; unknown escapes emit the
/// escaped character literally.
pub fn materialize_time_pattern(pattern: &str, now: &DateTime<Local>) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", now.year())),
            Some('m') => out.push_str(&format!("{:02}", now.month())),
            Some('d') => out.push_str(&format!("{:02}", now.day())),
            Some('H') => out.push_str(&format!("{:02}", now.hour())),
            Some('M') => out.push_str(&format!("{:02}", now.minute())),
            Some(other) => out.push(other),
            None => out.push('%'),
        }
    }

    out
}

/// A resolved file pattern: the directory to watch, the filename matcher,
/// and the destination topic.
#[derive(Debug)]
pub struct FileSpec {
    /// Directory containing this pattern's files
    pub dir: PathBuf,
    /// Filename (basename) prefix
    pub name_prefix: String,
    /// Filename suffix, empty when not configured
    pub suffix: String,
    /// Configured strftime-style time pattern
    pub time_pattern: String,
    /// Destination topic
    pub topic: String,
    matcher: Regex,
}

impl FileSpec {
    pub fn from_config(config: &FileSpecConfig) -> Result<Arc<Self>, PatternError> {
        // Split the configured path prefix into the directory to watch and
        // the basename prefix. A prefix ending in '/' means "every matching
        // name in this directory".
        let (dir, name_prefix) = if config.prefix.ends_with('/') {
            (PathBuf::from(&config.prefix), String::new())
        } else {
            let p = Path::new(&config.prefix);
            let dir = p
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (dir, name)
        };

        let suffix = config.suffix.clone().unwrap_or_default();

        let expr = format!(
            "^{}{}{}$",
            regex::escape(&name_prefix),
            translate_time_pattern(&config.time_pattern),
            regex::escape(&suffix)
        );
        let matcher = Regex::new(&expr).map_err(|source| PatternError::Matcher {
            prefix: config.prefix.clone(),
            source,
        })?;

        Ok(Arc::new(Self {
            dir,
            name_prefix,
            suffix,
            time_pattern: config.time_pattern.clone(),
            topic: config.topic.clone(),
            matcher,
        }))
    }

    /// Whether a basename belongs to this pattern.
    pub fn matches(&self, file_name: &str) -> bool {
        self.matcher.is_match(file_name)
    }

    /// The basename this pattern designates as the active time bucket at
    /// `now`.
    pub fn current_name(&self, now: &DateTime<Local>) -> String {
        format!(
            "{}{}{}",
            self.name_prefix,
            materialize_time_pattern(&self.time_pattern, now),
            self.suffix
        )
    }
}

/// All resolved file specs, indexed for event-time matching.
#[derive(Debug)]
pub struct PatternRegistry {
    specs: Vec<Arc<FileSpec>>,
}

impl PatternRegistry {
    pub fn new(configs: &[FileSpecConfig]) -> Result<Self, PatternError> {
        let specs = configs
            .iter()
            .map(FileSpec::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[Arc<FileSpec>] {
        &self.specs
    }

    /// Unique directories to watch, in configuration order.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for spec in &self.specs {
            if !dirs.contains(&spec.dir) {
                dirs.push(spec.dir.clone());
            }
        }
        dirs
    }

    /// Find the first registered spec that claims `path`. Multiple specs may
    /// share a directory; the first match wins.
    pub fn match_path(&self, path: &Path) -> Option<Arc<FileSpec>> {
        let dir = path.parent()?;
        let name = path.file_name()?.to_str()?;

        self.specs
            .iter()
            .find(|spec| spec.dir == dir && spec.matches(name))
            .cloned()
    }
}
