//! Secure filesystem primitives
//!
//! Every directory and file the broker trusts must be owned by the broker's
//! user and group and carry exact permission bits. Anything failing
//! verification is renamed aside to `<path>-<uuid>-INVALID` and never read,
//! so a local user cannot pre-stage state at a predictable path.

use chrono::{DateTime, Utc};
use nix::unistd::{getgid, getuid};
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, DirBuilder, Metadata, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Mode of every directory created by the broker
pub const DIR_MODE: u32 = 0o700;

/// Mode of private state files
pub const FILE_MODE: u32 = 0o600;

/// Reason a path failed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    Symlink { target: Option<PathBuf> },
    NotDirectory,
    NotRegularFile,
    WrongPermissions(u32),
    WrongUserOwner(u32),
    WrongGroupOwner(u32),
    Malformed(String),
}

impl Defect {
    /// Follow-up detail naming the offending value, if any
    fn detail(&self) -> Option<String> {
        match self {
            Defect::Symlink { target: Some(target) } => {
                Some(format!("the symbolic link points to {}", target.display()))
            }
            Defect::WrongPermissions(mode) => Some(format!("the wrong permissions were {:#o}", mode)),
            Defect::WrongUserOwner(uid) => Some(format!("the wrong user owner was {}", uid)),
            Defect::WrongGroupOwner(gid) => Some(format!("the wrong group owner was {}", gid)),
            Defect::Malformed(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::Symlink { .. } => write!(f, "is a symbolic link"),
            Defect::NotDirectory => write!(f, "is not a directory"),
            Defect::NotRegularFile => write!(f, "is not a regular file"),
            Defect::WrongPermissions(_) => write!(f, "has wrong permissions"),
            Defect::WrongUserOwner(_) => write!(f, "has wrong user owner"),
            Defect::WrongGroupOwner(_) => write!(f, "has wrong group owner"),
            Defect::Malformed(_) => write!(f, "has malformed contents"),
        }
    }
}

/// Errors from the secure store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} {} and was renamed to {}", .path.display(), .defect, .renamed.display())]
    Quarantined {
        path: PathBuf,
        renamed: PathBuf,
        defect: Defect,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self, StoreError::Quarantined { .. })
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Contents of a file that passed verification
#[derive(Debug, Clone)]
pub struct SecureFile {
    pub contents: String,

    /// Inode change time, used as the file's creation time
    pub changed: SystemTime,
}

/// Check-or-quarantine filesystem operations
pub trait SecureStore: Send + Sync {
    /// Ensure `path` is a broker-owned directory with mode 0700.
    ///
    /// Anything else found at `path` is quarantined and replaced by a fresh
    /// directory.
    fn make_dirs(&self, path: &Path) -> Result<(), StoreError>;

    /// Atomically replace `path` with `contents`, created with `mode`.
    fn make_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), StoreError>;

    /// Read a file after verifying its type, owner and `mode`.
    ///
    /// A file failing verification is quarantined and
    /// [`StoreError::Quarantined`] is returned.
    fn read_file(&self, path: &Path, mode: u32) -> Result<SecureFile, StoreError>;

    /// Rename `path` aside, logging why. Returns the new path.
    fn quarantine(&self, path: &Path, defect: &Defect) -> Result<PathBuf, StoreError>;

    /// Remove a file; a missing file is not an error.
    fn remove_file(&self, path: &Path) -> Result<(), StoreError>;

    /// Remove a directory tree; a missing directory is not an error.
    fn remove_tree(&self, path: &Path) -> Result<(), StoreError>;
}

/// [`SecureStore`] backed by the local filesystem
#[derive(Debug, Clone)]
pub struct SecureFs {
    uid: u32,
    gid: u32,
}

impl SecureFs {
    /// Store expecting ownership by the current process's user and group
    pub fn new() -> Self {
        Self::with_owner(getuid().as_raw(), getgid().as_raw())
    }

    /// Store expecting ownership by an explicit user and group
    pub fn with_owner(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    fn check_attributes(&self, meta: &Metadata, mode: u32) -> Option<Defect> {
        let actual = meta.mode() & 0o7777;
        if actual != mode {
            Some(Defect::WrongPermissions(actual))
        } else if meta.uid() != self.uid {
            Some(Defect::WrongUserOwner(meta.uid()))
        } else if meta.gid() != self.gid {
            Some(Defect::WrongGroupOwner(meta.gid()))
        } else {
            None
        }
    }

    fn reject(&self, path: &Path, defect: Defect, meta: Option<&Metadata>) -> StoreError {
        if let Some(meta) = meta {
            let changed: DateTime<Utc> = change_time(meta).into();
            tracing::warn!(
                "{} (uid {}, gid {}) was last changed at {}",
                path.display(),
                meta.uid(),
                meta.gid(),
                changed.to_rfc3339()
            );
        }
        match self.quarantine(path, &defect) {
            Ok(renamed) => StoreError::Quarantined {
                path: path.to_path_buf(),
                renamed,
                defect,
            },
            Err(e) => e,
        }
    }
}

impl Default for SecureFs {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureStore for SecureFs {
    fn make_dirs(&self, path: &Path) -> Result<(), StoreError> {
        let defect = match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => Some(Defect::Symlink {
                target: fs::read_link(path).ok(),
            }),
            Ok(meta) if !meta.is_dir() => Some(Defect::NotDirectory),
            Ok(meta) => self.check_attributes(&meta, DIR_MODE),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return create_private_dir(path);
            }
            Err(e) => return Err(io_error(path, e)),
        };

        if let Some(defect) = defect {
            self.quarantine(path, &defect)?;
            create_private_dir(path)?;
        }
        Ok(())
    }

    fn make_file(&self, path: &Path, contents: &str, mode: u32) -> Result<(), StoreError> {
        let temp = temp_path(path);
        let result = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode)
                .custom_flags(nix::libc::O_NOFOLLOW)
                .open(&temp)?;
            // The umask may have stripped bits from the requested mode
            file.set_permissions(Permissions::from_mode(mode))?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp, path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(io_error(path, e));
        }
        Ok(())
    }

    fn read_file(&self, path: &Path, mode: u32) -> Result<SecureFile, StoreError> {
        let mut file = match OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NOFOLLOW | nix::libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(nix::libc::ELOOP) => {
                let defect = Defect::Symlink {
                    target: fs::read_link(path).ok(),
                };
                return Err(self.reject(path, defect, None));
            }
            Err(e) => return Err(io_error(path, e)),
        };

        // fstat on the open descriptor so the checks apply to what is read
        let meta = file.metadata().map_err(|e| io_error(path, e))?;
        let defect = if meta.is_file() {
            self.check_attributes(&meta, mode)
        } else {
            Some(Defect::NotRegularFile)
        };
        if let Some(defect) = defect {
            return Err(self.reject(path, defect, Some(&meta)));
        }

        let mut contents = String::new();
        if let Err(e) = file.read_to_string(&mut contents) {
            if e.kind() == io::ErrorKind::InvalidData {
                let defect = Defect::Malformed("file is not valid UTF-8".to_string());
                return Err(self.reject(path, defect, Some(&meta)));
            }
            return Err(io_error(path, e));
        }

        Ok(SecureFile {
            contents,
            changed: change_time(&meta),
        })
    }

    fn quarantine(&self, path: &Path, defect: &Defect) -> Result<PathBuf, StoreError> {
        let renamed = quarantine_path(path);
        tracing::warn!(
            "{} {}, it will be renamed to {}",
            path.display(),
            defect,
            renamed.display()
        );
        if let Some(detail) = defect.detail() {
            tracing::warn!("{}", detail);
        }
        fs::rename(path, &renamed).map_err(|e| io_error(path, e))?;
        Ok(renamed)
    }

    fn remove_file(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(path, e)),
            _ => Ok(()),
        }
    }

    fn remove_tree(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(path, e)),
            _ => Ok(()),
        }
    }
}

fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    DirBuilder::new()
        .mode(DIR_MODE)
        .create(path)
        .map_err(|e| io_error(path, e))?;
    fs::set_permissions(path, Permissions::from_mode(DIR_MODE)).map_err(|e| io_error(path, e))
}

/// `<path>-<uuid>-INVALID`
fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!("-{}-INVALID", Uuid::new_v4()));
    PathBuf::from(name)
}

/// Hidden sibling used for write-then-rename
fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

fn change_time(meta: &Metadata) -> SystemTime {
    let secs = u64::try_from(meta.ctime()).unwrap_or(0);
    let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
    UNIX_EPOCH + Duration::new(secs, nanos)
}
