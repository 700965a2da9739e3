//! Identifier grammar for pools, datasets and snapshots.
//!
//! Every identifier is checked here before it is placed on a driver command
//! line. A path component starts with an alphanumeric character and continues
//! with alphanumerics or `_ - . :`; datasets join components with `/`; a full
//! snapshot is `<dataset>@<name>`. Remote-shell hosts and login names have
//! their own grammars so they can never be read as client options.

use crate::error::{ReplError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Which grammar an identifier is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    /// A pool name: a single component.
    Pool,
    /// A dataset path: `/`-separated components.
    Dataset,
    /// A bare snapshot name (the part after `@`).
    Snapshot,
    /// A full snapshot reference `<dataset>@<name>`.
    FullSnapshot,
    /// A remote-shell host name or address.
    Host,
    /// A remote-shell login name.
    User,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NameKind::Pool => "pool",
            NameKind::Dataset => "dataset",
            NameKind::Snapshot => "snapshot",
            NameKind::FullSnapshot => "full snapshot",
            NameKind::Host => "host",
            NameKind::User => "user",
        };
        f.write_str(s)
    }
}

fn component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]*$").expect("static pattern"))
}

fn dataset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]*(/[A-Za-z0-9][A-Za-z0-9_.:\-]*)*$")
            .expect("static pattern")
    })
}

fn host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9:\[][A-Za-z0-9_.:%\[\]\-]*$").expect("static pattern"))
}

fn user_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("static pattern"))
}

fn invalid(kind: NameKind, name: &str, reason: impl Into<String>) -> ReplError {
    ReplError::InvalidName {
        kind,
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Validate `name` against the grammar for `kind`.
pub fn validate(name: &str, kind: NameKind) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(kind, name, "name cannot be empty"));
    }
    match kind {
        NameKind::Pool | NameKind::Snapshot => {
            if !component_re().is_match(name) {
                return Err(invalid(
                    kind,
                    name,
                    "must start with an alphanumeric character and contain only \
                     alphanumerics, underscores, hyphens, periods or colons",
                ));
            }
        }
        NameKind::Dataset => {
            if !dataset_re().is_match(name) {
                return Err(invalid(
                    kind,
                    name,
                    "each '/'-separated component must start with an alphanumeric character \
                     and contain only alphanumerics, underscores, hyphens, periods or colons",
                ));
            }
        }
        NameKind::FullSnapshot => {
            split_snapshot(name)?;
        }
        NameKind::Host => {
            if !host_re().is_match(name) {
                return Err(invalid(
                    kind,
                    name,
                    "must be a host name or address: no leading '-', whitespace, '@' \
                     or control characters",
                ));
            }
        }
        NameKind::User => {
            if !user_re().is_match(name) {
                return Err(invalid(
                    kind,
                    name,
                    "must start with an alphanumeric character or underscore and contain \
                     only alphanumerics, underscores, hyphens or periods",
                ));
            }
        }
    }
    Ok(())
}

/// Split a full snapshot reference on its last `@` and validate both halves.
///
/// Returns `(dataset, snapshot_name)`.
pub fn split_snapshot(full: &str) -> Result<(&str, &str)> {
    if full.is_empty() {
        return Err(invalid(NameKind::FullSnapshot, full, "name cannot be empty"));
    }
    if full.matches('@').count() != 1 {
        return Err(invalid(
            NameKind::FullSnapshot,
            full,
            "expected exactly one '@' (format: dataset@snapshot)",
        ));
    }
    let (dataset, snapshot) = full
        .rsplit_once('@')
        .ok_or_else(|| invalid(NameKind::FullSnapshot, full, "missing '@'"))?;
    validate(dataset, NameKind::Dataset)?;
    validate(snapshot, NameKind::Snapshot)?;
    Ok((dataset, snapshot))
}

/// Dataset part of a source argument that may be a dataset or `dataset@snap`.
pub fn dataset_of(source: &str) -> &str {
    match source.split_once('@') {
        Some((dataset, _)) => dataset,
        None => source,
    }
}

/// Bare snapshot name of an inventory entry, if it has one.
pub fn bare_name(entry: &str) -> Option<&str> {
    entry.rsplit_once('@').map(|(_, name)| name)
}
