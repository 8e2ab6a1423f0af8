//! Path and parameter guard
//!
//! Every filesystem path and free-form parameter that could reach a
//! subprocess argument vector or a filesystem mutation passes through here
//! first. The policy is whitelist-or-reject: nothing is escaped or rewritten
//! into something acceptable.
//!
//! Paths are resolved (symlinks followed, `..` collapsed by the OS) *before*
//! the allowed-root check, so `uploads/../../etc/passwd` and a symlink
//! pointing outside the roots are both rejected.

use crate::error::{GuardError, GuardResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Longest single filename component accepted
const MAX_FILENAME_BYTES: usize = 255;

/// A path that passed [`PathGuard`] validation
///
/// Only this module can construct one, so holding a `ValidatedPath` proves the
/// canonical form sits under one of the guard's allowed roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath {
    canonical: PathBuf,
    root: PathBuf,
}

impl ValidatedPath {
    /// Canonical absolute path
    pub fn as_path(&self) -> &Path {
        &self.canonical
    }

    /// Allowed root the path resolved under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to its root, for logs and client-facing names
    pub fn relative(&self) -> &Path {
        self.canonical
            .strip_prefix(&self.root)
            .unwrap_or(self.canonical.as_path())
    }
}

impl AsRef<Path> for ValidatedPath {
    fn as_ref(&self) -> &Path {
        &self.canonical
    }
}

/// What kind of filesystem object a validated path may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    File { must_exist: bool },
    Directory,
}

/// Validates paths against a fixed set of allowed roots
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    /// Build a guard over the given roots
    ///
    /// Roots must already exist; they are canonicalised once here.
    pub fn new<I, P>(roots: I) -> GuardResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical_roots = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let canonical = root.canonicalize().map_err(|e| {
                GuardError::Internal(format!(
                    "Allowed root {} cannot be resolved: {}",
                    root.display(),
                    e
                ))
            })?;
            if !canonical.is_dir() {
                return Err(GuardError::Internal(format!(
                    "Allowed root {} is not a directory",
                    root.display()
                )));
            }
            canonical_roots.push(canonical);
        }

        if canonical_roots.is_empty() {
            return Err(GuardError::Internal("PathGuard needs at least one root".to_string()));
        }

        Ok(Self {
            roots: canonical_roots,
        })
    }

    /// Canonical allowed roots
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Validate a file path
    ///
    /// Relative inputs resolve against the first root. With `must_exist`, the
    /// path must name an existing regular file. Without it, the path may not
    /// exist yet, but if it does it must be a regular file.
    pub fn validate(&self, raw_path: impl AsRef<Path>, must_exist: bool) -> GuardResult<ValidatedPath> {
        self.check(raw_path.as_ref(), Expect::File { must_exist })
    }

    /// Validate an existing directory under one of the roots
    pub fn validate_dir(&self, raw_path: impl AsRef<Path>) -> GuardResult<ValidatedPath> {
        self.check(raw_path.as_ref(), Expect::Directory)
    }

    fn check(&self, raw: &Path, expect: Expect) -> GuardResult<ValidatedPath> {
        if raw.as_os_str().is_empty() {
            return Err(GuardError::Security("empty path".to_string()));
        }
        let raw_str = raw
            .to_str()
            .ok_or_else(|| GuardError::Security("path is not valid UTF-8".to_string()))?;
        if raw_str.contains('\0') {
            return Err(GuardError::Security("path contains NUL byte".to_string()));
        }

        let absolute = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.roots[0].join(raw)
        };

        let resolved = resolve(&absolute)?;

        if resolved
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(GuardError::Security(format!(
                "traversal marker survives resolution: {}",
                raw_str
            )));
        }

        let root = self
            .roots
            .iter()
            .find(|root| resolved.starts_with(root))
            .cloned()
            .ok_or_else(|| {
                GuardError::Security(format!("{} resolves outside the allowed roots", raw_str))
            })?;

        let metadata = fs::metadata(&resolved).ok();
        match expect {
            Expect::File { must_exist } => match metadata {
                Some(meta) if !meta.is_file() => {
                    return Err(GuardError::Security(format!("{} is not a regular file", raw_str)));
                }
                None if must_exist => {
                    return Err(GuardError::Security(format!("{} does not exist", raw_str)));
                }
                _ => {}
            },
            Expect::Directory => match metadata {
                Some(meta) if meta.is_dir() => {}
                _ => {
                    return Err(GuardError::Security(format!(
                        "{} is not an existing directory",
                        raw_str
                    )));
                }
            },
        }

        Ok(ValidatedPath {
            canonical: resolved,
            root,
        })
    }
}

/// Resolve a path the OS way, tolerating a missing tail
///
/// Existing paths are canonicalised directly. Otherwise the deepest existing
/// ancestor is canonicalised and the missing tail re-appended; the tail must
/// consist only of normal components.
fn resolve(absolute: &Path) -> GuardResult<PathBuf> {
    let unresolvable = || GuardError::Security(format!("{} cannot be resolved", absolute.display()));

    if fs::symlink_metadata(absolute).is_ok() {
        return absolute.canonicalize().map_err(|_| unresolvable());
    }

    let mut existing = absolute;
    while fs::symlink_metadata(existing).is_err() {
        existing = existing.parent().ok_or_else(unresolvable)?;
    }

    let tail = absolute.strip_prefix(existing).map_err(|_| unresolvable())?;
    if tail.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(GuardError::Security(format!(
            "traversal marker in missing path: {}",
            absolute.display()
        )));
    }

    let mut resolved = existing.canonicalize().map_err(|_| unresolvable())?;
    resolved.push(tail);
    Ok(resolved)
}

/// Accept only an opaque job/file identifier (hyphenated UUID v4)
///
/// Returns the canonical lowercase form.
pub fn validate_identifier(value: &str, kind: &str) -> GuardResult<String> {
    let invalid = || GuardError::Validation(format!("invalid {} identifier", kind));

    if value.len() != 36 {
        return Err(invalid());
    }
    let id = Uuid::try_parse(value).map_err(|_| invalid())?;
    if id.get_version_num() != 4 {
        return Err(invalid());
    }
    Ok(id.hyphenated().to_string())
}

/// Whitelist check for a closed set of values
///
/// Non-alphanumeric characters are stripped from both the input and the
/// whitelist entries before comparing; that is the only normalisation.
/// The returned value is always the whitelist's own spelling.
pub fn validate_enum<'a>(value: &str, allowed_set: &[&'a str]) -> GuardResult<&'a str> {
    let stripped = strip_non_alphanumeric(value);
    if stripped.is_empty() {
        return Err(GuardError::Validation("empty value".to_string()));
    }

    allowed_set
        .iter()
        .copied()
        .find(|allowed| strip_non_alphanumeric(allowed) == stripped)
        .ok_or_else(|| {
            GuardError::Validation(format!(
                "unsupported value. Supported: {}",
                allowed_set.join(", ")
            ))
        })
}

fn strip_non_alphanumeric(value: &str) -> String {
    value.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Accept a single, plain filename component
pub fn validate_filename(value: &str) -> GuardResult<String> {
    if value.is_empty() {
        return Err(GuardError::Security("empty filename".to_string()));
    }
    if value.len() > MAX_FILENAME_BYTES {
        return Err(GuardError::Security("filename too long".to_string()));
    }
    if value.starts_with('.') {
        return Err(GuardError::Security("hidden or relative filename".to_string()));
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        return Err(GuardError::Security("filename contains separators".to_string()));
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(value.to_string()),
        _ => Err(GuardError::Security("filename is not a single component".to_string())),
    }
}
