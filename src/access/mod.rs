//! Per-user and per-group allow lists of signal and control names
//!
//! Layout under the access directory:
//!
//! ```text
//! 0.DEFAULT_ACCESS/allowed_signals    applies to every user
//! groups/<group>/allowed_signals
//! users/<user>/allowed_controls
//! ```
//!
//! Each file lists one name per line; `#` starts a comment.

use crate::error::{BrokerError, BrokerResult, NameKind};
use crate::secure::{SecureStore, FILE_MODE};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

const DEFAULT_ACCESS: &str = "0.DEFAULT_ACCESS";
const SIGNALS_FILE: &str = "allowed_signals";
const CONTROLS_FILE: &str = "allowed_controls";

/// Signal and control names granted to an identity
pub type Access = (Vec<String>, Vec<String>);

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]{0,31}$").expect("static regex is valid")
    })
}

/// Reject names that could escape the access directory
fn validate_name(kind: &str, name: &str) -> BrokerResult<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(BrokerError::InvalidArgument(format!(
            "invalid {} name: {:?}",
            kind, name
        )))
    }
}

fn parse_names(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Allow-list store
pub struct AccessLists {
    dir: PathBuf,
    store: Arc<dyn SecureStore>,
    all_signals: BTreeSet<String>,
    all_controls: BTreeSet<String>,
}

impl AccessLists {
    /// Lists rooted at `dir`, restricted to the names the platform exposes
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<dyn SecureStore>,
        all_signals: impl IntoIterator<Item = String>,
        all_controls: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            store,
            all_signals: all_signals.into_iter().collect(),
            all_controls: all_controls.into_iter().collect(),
        }
    }

    fn group_dir(&self, group: &str) -> BrokerResult<PathBuf> {
        if group.is_empty() {
            return Ok(self.dir.join(DEFAULT_ACCESS));
        }
        validate_name("group", group)?;
        Ok(self.dir.join("groups").join(group))
    }

    fn user_dir(&self, user: &str) -> BrokerResult<PathBuf> {
        validate_name("user", user)?;
        Ok(self.dir.join("users").join(user))
    }

    /// Read one list file; a missing or quarantined file contributes nothing
    fn read_list(&self, path: &Path) -> BrokerResult<Vec<String>> {
        match self.store.read_file(path, FILE_MODE) {
            Ok(file) => Ok(parse_names(&file.contents)),
            Err(e) if e.is_not_found() || e.is_quarantined() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_access(&self, dir: &Path) -> BrokerResult<(BTreeSet<String>, BTreeSet<String>)> {
        let signals = self.read_list(&dir.join(SIGNALS_FILE))?;
        let controls = self.read_list(&dir.join(CONTROLS_FILE))?;
        Ok((
            self.restrict(signals, &self.all_signals),
            self.restrict(controls, &self.all_controls),
        ))
    }

    fn restrict(&self, names: Vec<String>, exposed: &BTreeSet<String>) -> BTreeSet<String> {
        names
            .into_iter()
            .filter(|name| {
                let known = exposed.contains(name);
                if !known {
                    tracing::debug!("Ignoring access list entry for unknown name {}", name);
                }
                known
            })
            .collect()
    }

    /// Every name the platform exposes
    pub fn get_all_access(&self) -> Access {
        (
            self.all_signals.iter().cloned().collect(),
            self.all_controls.iter().cloned().collect(),
        )
    }

    /// Effective access for a user: the default list, the user's own list
    /// and every group's list, combined by union.
    ///
    /// `root` is granted every exposed name.
    pub fn get_user_access(&self, user: &str, groups: &[String]) -> BrokerResult<Access> {
        if user == "root" {
            return Ok(self.get_all_access());
        }

        let (mut signals, mut controls) = self.read_access(&self.dir.join(DEFAULT_ACCESS))?;
        let mut dirs = Vec::with_capacity(groups.len() + 1);
        match self.user_dir(user) {
            Ok(dir) => dirs.push(dir),
            Err(e) => tracing::warn!("Skipping user access list: {}", e),
        }
        for group in groups {
            match self.group_dir(group) {
                Ok(dir) if !group.is_empty() => dirs.push(dir),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping group access list: {}", e),
            }
        }

        for dir in dirs {
            let (more_signals, more_controls) = self.read_access(&dir)?;
            signals.extend(more_signals);
            controls.extend(more_controls);
        }
        Ok((signals.into_iter().collect(), controls.into_iter().collect()))
    }

    /// Access list of one group; the empty name addresses the default list
    pub fn get_group_access(&self, group: &str) -> BrokerResult<Access> {
        let (signals, controls) = self.read_access(&self.group_dir(group)?)?;
        Ok((signals.into_iter().collect(), controls.into_iter().collect()))
    }

    /// Replace a group's access list.
    ///
    /// Affects later authorization checks only; open sessions keep the
    /// names they were granted.
    pub fn set_group_access(
        &self,
        group: &str,
        signals: &[String],
        controls: &[String],
    ) -> BrokerResult<()> {
        let unknown_signals: Vec<&String> = signals
            .iter()
            .filter(|name| !self.all_signals.contains(*name))
            .collect();
        if !unknown_signals.is_empty() {
            return Err(BrokerError::access_denied(
                NameKind::Signals,
                unknown_signals.into_iter().cloned(),
            ));
        }
        let unknown_controls: Vec<&String> = controls
            .iter()
            .filter(|name| !self.all_controls.contains(*name))
            .collect();
        if !unknown_controls.is_empty() {
            return Err(BrokerError::access_denied(
                NameKind::Controls,
                unknown_controls.into_iter().cloned(),
            ));
        }

        let dir = self.group_dir(group)?;
        self.store.make_dirs(&self.dir)?;
        if !group.is_empty() {
            self.store.make_dirs(&self.dir.join("groups"))?;
        }
        self.store.make_dirs(&dir)?;
        self.store
            .make_file(&dir.join(SIGNALS_FILE), &format_names(signals), FILE_MODE)?;
        self.store
            .make_file(&dir.join(CONTROLS_FILE), &format_names(controls), FILE_MODE)?;

        tracing::info!(
            "Updated access list for {}: {} signal(s), {} control(s)",
            if group.is_empty() { DEFAULT_ACCESS } else { group },
            signals.len(),
            controls.len()
        );
        Ok(())
    }
}

fn format_names(names: &[String]) -> String {
    let mut contents = String::new();
    for name in names {
        contents.push_str(name);
        contents.push('\n');
    }
    contents
}
