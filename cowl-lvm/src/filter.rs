//! Building and auditing the LVM device filter.
//!
//! The wanted filter accepts each in-use PV by its stable link, anchored on
//! both ends, and rejects everything else:
//!
//! ```text
//! ["a|^/dev/mapper/360014059618ff1e$|", "r|.*|"]
//! ```
//!
//! [`analyze`] compares a host's configured filter against the wanted one
//! and advises whether to configure it, replace a non-canonical but
//! equivalent one, or leave it alone. A filter that names the right
//! devices through unstable names (`/dev/sdb2`, `/dev/dm-3`, a changing
//! link) is detected by resolving literal paths on both sides: when the
//! resolved sets match, rewriting to the stable form is safe and needs no
//! operator decision.

use std::fs;
use std::path::PathBuf;

use crate::{Error, Result};

/// Catch-all reject item terminating every filter.
const REJECT_ALL: &str = "r|.*|";

/// What to do about the currently configured filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Action {
    /// No filter is configured; install the wanted one.
    Configure,
    /// A filter exists but differs from the canonical form; replacing it
    /// needs an operator decision.
    Recommend,
    /// The configured filter is equivalent to the wanted one.
    Unneeded,
}

/// Outcome of [`analyze`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advice {
    /// Recommended action.
    pub action: Action,
    /// The filter to install, when `action` is not [`Action::Unneeded`].
    pub filter: Option<Vec<String>>,
}

/// Builds the canonical filter for the given stable device links.
///
/// Devices are sorted so the filter is comparable across hosts.
pub fn build_filter<S: AsRef<str>>(devices: &[S]) -> Vec<String> {
    let mut paths: Vec<&str> = devices.iter().map(AsRef::as_ref).collect();
    paths.sort_unstable();
    paths.dedup();

    let mut items: Vec<String> = paths.iter().map(|p| format!("a|^{p}$|")).collect();
    items.push(REJECT_ALL.to_owned());
    items
}

/// Judges `current` against the canonical `wanted` filter.
///
/// An absent filter yields [`Action::Configure`]; the same items in any
/// order yield [`Action::Unneeded`]. A current filter that names the same
/// devices as the wanted one through unstable names (resolved item sets
/// equal, see [`resolve_devices`]) also yields [`Action::Configure`]:
/// rewriting it to the stable form cannot change behavior. Anything else
/// that still parses yields [`Action::Recommend`] with the wanted filter
/// attached; items that do not parse fail with [`Error::InvalidFilter`].
pub fn analyze(current: &[String], wanted: &[String]) -> Result<Advice> {
    if current.is_empty() {
        return Ok(Advice {
            action: Action::Configure,
            filter: Some(wanted.to_vec()),
        });
    }

    let current_items: Vec<FilterItem> = current
        .iter()
        .map(|item| parse_item(item))
        .collect::<Result<_>>()?;

    let mut cur: Vec<&String> = current.iter().collect();
    let mut want: Vec<&String> = wanted.iter().collect();
    cur.sort_unstable();
    want.sort_unstable();
    if cur == want {
        return Ok(Advice {
            action: Action::Unneeded,
            filter: None,
        });
    }

    // The filter may be correct but written with unstable names; if both
    // sides resolve to the same device set the rewrite is unambiguous.
    let wanted_items: Vec<FilterItem> = wanted
        .iter()
        .map(|item| parse_item(item))
        .collect::<Result<_>>()?;
    let mut resolved_current = resolve_devices(&current_items);
    let mut resolved_wanted = resolve_devices(&wanted_items);
    sort_items(&mut resolved_current);
    sort_items(&mut resolved_wanted);
    if resolved_current == resolved_wanted {
        return Ok(Advice {
            action: Action::Configure,
            filter: Some(wanted.to_vec()),
        });
    }

    Ok(Advice {
        action: Action::Recommend,
        filter: Some(wanted.to_vec()),
    })
}

/// Resolves anchored literal device paths in accept items to their
/// canonical targets.
///
/// Only `^<path>$` patterns with no regex constructs qualify — wild
/// cards, missing anchors and reject items pass through unchanged, as
/// does any path the filesystem cannot resolve. Links and device-mapper
/// aliases thereby compare equal to the device they name.
pub fn resolve_devices(items: &[FilterItem]) -> Vec<FilterItem> {
    items
        .iter()
        .map(|item| {
            let Some(path) = literal_device_path(item) else {
                return item.clone();
            };
            match fs::canonicalize(&path) {
                Ok(resolved) => FilterItem {
                    accept: item.accept,
                    pattern: format!("^{}$", resolved.display()),
                },
                Err(_) => item.clone(),
            }
        })
        .collect()
}

/// The literal path of an accept item, when its pattern is a fully
/// anchored path free of regex constructs.
fn literal_device_path(item: &FilterItem) -> Option<PathBuf> {
    if !item.accept {
        return None;
    }
    let inner = item.pattern.strip_prefix('^')?.strip_suffix('$')?;
    if !inner.starts_with('/') {
        return None;
    }
    if inner
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '(' | ')' | '{' | '}' | '+' | '|' | '\\' | '^' | '$'))
    {
        return None;
    }
    Some(PathBuf::from(inner))
}

fn sort_items(items: &mut [FilterItem]) {
    items.sort_by(|a, b| (a.accept, &a.pattern).cmp(&(b.accept, &b.pattern)));
}

/// One parsed filter item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterItem {
    /// `true` to accept, `false` to reject.
    pub accept: bool,
    /// The regex between the delimiters.
    pub pattern: String,
}

/// Parses an `a|regex|` / `r|regex|` item.
///
/// The delimiter is whatever character follows the action and must close
/// the item; an empty pattern, a missing delimiter, or an unknown action
/// are all invalid.
pub fn parse_item(item: &str) -> Result<FilterItem> {
    let mut chars = item.chars();
    let accept = match chars.next() {
        Some('a') => true,
        Some('r') => false,
        _ => return Err(Error::InvalidFilter(item.to_owned())),
    };
    let Some(delimiter) = chars.next() else {
        return Err(Error::InvalidFilter(item.to_owned()));
    };
    let rest: String = chars.collect();
    let Some(pattern) = rest.strip_suffix(delimiter) else {
        return Err(Error::InvalidFilter(item.to_owned()));
    };
    if pattern.is_empty() {
        return Err(Error::InvalidFilter(item.to_owned()));
    }
    Ok(FilterItem {
        accept,
        pattern: pattern.to_owned(),
    })
}
