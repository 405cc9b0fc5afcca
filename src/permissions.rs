//! Addon directory permission model: inspection against an ownership/mode policy and
//! best-effort repair with post-repair verification.
//!
//! Both halves share one tree walker. Symlinks are never followed and never touched;
//! only directories and regular files take part in a verdict or a repair.

use crate::identity::{IdentityResolver, SystemIdentity};
use nix::errno::Errno;
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::unistd::AccessFlags;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use walkdir::WalkDir;

pub const DEFAULT_MAX_REPORTED_FILES: usize = 50;
const INSPECT_WORKERS: usize = 4;
const ROOT_LABEL: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionPolicy {
    pub owner: String,
    pub group: String,
    #[serde(serialize_with = "serialize_mode")]
    pub dir_mode: u32,
    #[serde(serialize_with = "serialize_mode")]
    pub file_mode: u32,
    pub max_reported_files: usize,
}

fn serialize_mode<S: serde::Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_mode(*mode))
}

impl PermissionPolicy {
    /// Identity problems with the policy itself. Reported once at load time; inspection
    /// and repair still run and surface the consequences per item.
    pub fn policy_warnings(&self, identity: &dyn IdentityResolver) -> Vec<String> {
        let mut warnings = Vec::new();
        if identity.uid_of(&self.owner).is_none() {
            warnings.push(format!(
                "permissions.owner '{}' does not resolve to a system user",
                self.owner
            ));
        }
        if identity.gid_of(&self.group).is_none() {
            warnings.push(format!(
                "permissions.group '{}' does not resolve to a system group",
                self.group
            ));
        }
        warnings
    }

    fn expected_mode(&self, is_dir: bool) -> u32 {
        if is_dir {
            self.dir_mode
        } else {
            self.file_mode
        }
    }
}

/// Accepts `755`, `0755` and `0o755`.
pub fn parse_mode(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|ch| ('0'..='7').contains(&ch)) {
        return Err(format!("'{raw}' is not an octal mode"));
    }
    let mode = u32::from_str_radix(digits, 8).map_err(|err| format!("'{raw}': {err}"))?;
    if mode > 0o7777 {
        return Err(format!("'{raw}' exceeds 7777"));
    }
    Ok(mode)
}

pub fn format_mode(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Ok,
    Warning,
    Error,
    PartiallyFixed,
    NotFound,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::PartiallyFixed => "partially_fixed",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryVerdict {
    pub path: String,
    pub status: VerdictStatus,
    /// Absent for `not_found` and when the directory itself could not be stat'ed.
    #[serde(flatten)]
    pub details: Option<PermissionDetails>,
    pub error: Option<String>,
}

impl DirectoryVerdict {
    fn not_found(path: &Path) -> Self {
        Self {
            path: path.to_string_lossy().to_string(),
            status: VerdictStatus::NotFound,
            details: None,
            error: Some(format!("directory does not exist: {}", path.display())),
        }
    }

    fn failed(path: &Path, message: String) -> Self {
        Self {
            path: path.to_string_lossy().to_string(),
            status: VerdictStatus::Error,
            details: None,
            error: Some(message),
        }
    }

    pub fn inconsistent_files(&self) -> Vec<String> {
        self.details
            .as_ref()
            .map(|details| details.inconsistent_files.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionDetails {
    pub owner: String,
    pub group: String,
    pub mode: String,
    pub expected_dir_mode: String,
    pub expected_file_mode: String,
    pub owner_readable: bool,
    pub owner_writable: bool,
    pub owner_executable: bool,
    pub group_readable: bool,
    pub group_writable: bool,
    pub group_executable: bool,
    pub others_readable: bool,
    pub others_writable: bool,
    pub others_executable: bool,
    /// Effective access of this process, as `access(2)` reports it.
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub is_odoo_owner: bool,
    pub is_odoo_group: bool,
    pub dir_mode_ok: bool,
    pub current_user: Option<String>,
    pub current_user_in_odoo_group: bool,
    pub files_checked: usize,
    pub files_consistent: bool,
    pub inconsistent_files: Vec<String>,
    pub inconsistent_total: usize,
}

/// Expected numeric identities, resolved once per inspection or repair.
#[derive(Debug, Clone, Copy)]
struct ExpectedIds {
    uid: Option<u32>,
    gid: Option<u32>,
}

impl ExpectedIds {
    fn resolve(policy: &PermissionPolicy, identity: &dyn IdentityResolver) -> Self {
        Self {
            uid: identity.uid_of(&policy.owner),
            gid: identity.gid_of(&policy.group),
        }
    }

    fn owner_matches(&self, metadata: &fs::Metadata) -> bool {
        self.uid == Some(metadata.uid())
    }

    fn group_matches(&self, metadata: &fs::Metadata) -> bool {
        self.gid == Some(metadata.gid())
    }
}

fn entry_complies(metadata: &fs::Metadata, policy: &PermissionPolicy, ids: ExpectedIds) -> bool {
    let mode = metadata.mode() & 0o7777;
    ids.owner_matches(metadata)
        && ids.group_matches(metadata)
        && mode == policy.expected_mode(metadata.is_dir())
}

trait TreeVisitor {
    /// Called for every directory and regular file below the root.
    fn entry(&mut self, path: &Path, relative: &str, metadata: &fs::Metadata);
    fn failure(&mut self, relative: &str, operation: &'static str, err: &io::Error);
    /// A directory that could not be listed is listed once more when this returns true.
    fn relist(&mut self, _dir: &Path) -> bool {
        false
    }
}

fn relative_label(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ROOT_LABEL.to_string(),
        Ok(rel) => rel.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

/// Depth-first walk below `root` with siblings in file-name order. Errors are reported
/// to the visitor and the walk continues with the next entry.
fn walk_tree(root: &Path, visitor: &mut dyn TreeVisitor) {
    walk_below(root, root, visitor);
}

fn walk_below(root: &Path, start: &Path, visitor: &mut dyn TreeVisitor) {
    let walker = WalkDir::new(start)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // Without link following, iteration only fails on listing a directory.
                let dir = err.path().unwrap_or(start).to_path_buf();
                let err = io::Error::from(err);
                if err.kind() == io::ErrorKind::NotFound {
                    continue;
                }
                if visitor.relist(&dir) {
                    walk_below(root, &dir, visitor);
                } else {
                    visitor.failure(&relative_label(root, &dir), "read_dir", &err);
                }
                continue;
            }
        };
        if !(entry.file_type().is_dir() || entry.file_type().is_file()) {
            continue;
        }
        let relative = relative_label(root, entry.path());
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = io::Error::from(err);
                // Removed between listing and stat.
                if err.kind() != io::ErrorKind::NotFound {
                    visitor.failure(&relative, "stat", &err);
                }
                continue;
            }
        };
        if metadata.is_dir() || metadata.is_file() {
            visitor.entry(entry.path(), &relative, &metadata);
        }
    }
}

fn describe_io_error(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::PermissionDenied => format!("permission denied ({err})"),
        io::ErrorKind::NotFound => format!("no longer exists ({err})"),
        _ => err.to_string(),
    }
}

struct InspectVisitor<'a> {
    policy: &'a PermissionPolicy,
    ids: ExpectedIds,
    checked: usize,
    mismatched: Vec<String>,
    first_error: Option<String>,
}

impl TreeVisitor for InspectVisitor<'_> {
    fn entry(&mut self, _path: &Path, relative: &str, metadata: &fs::Metadata) {
        self.checked += 1;
        if !entry_complies(metadata, self.policy, self.ids) {
            self.mismatched.push(relative.to_string());
        }
    }

    fn failure(&mut self, relative: &str, operation: &'static str, err: &io::Error) {
        tracing::warn!(entry = relative, operation, error = %err, "inspection walk error");
        if self.first_error.is_none() {
            self.first_error = Some(format!(
                "{operation} failed for {relative}: {}",
                describe_io_error(err)
            ));
        }
    }
}

fn has_access(path: &Path, flag: AccessFlags) -> bool {
    nix::unistd::access(path, flag).is_ok()
}

/// Compute the verdict for one addon path. Never mutates the filesystem and never
/// fails: every OS error becomes part of the returned verdict.
pub fn inspect_directory(
    path: &Path,
    policy: &PermissionPolicy,
    identity: &dyn IdentityResolver,
) -> DirectoryVerdict {
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => metadata,
        Ok(_) => return DirectoryVerdict::not_found(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return DirectoryVerdict::not_found(path);
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to stat addon directory");
            return DirectoryVerdict::failed(
                path,
                format!("failed to stat {}: {}", path.display(), describe_io_error(&err)),
            );
        }
    };

    let ids = ExpectedIds::resolve(policy, identity);
    let mode = metadata.mode() & 0o7777;
    let owner = identity
        .user_name(metadata.uid())
        .unwrap_or_else(|| metadata.uid().to_string());
    let group = identity
        .group_name(metadata.gid())
        .unwrap_or_else(|| metadata.gid().to_string());
    let is_odoo_owner = ids.owner_matches(&metadata);
    let is_odoo_group = ids.group_matches(&metadata);
    let dir_mode_ok = mode == policy.dir_mode;

    let membership = identity.members_of(&policy.group);
    let current_user = identity.current_user();
    let current_user_in_odoo_group = current_user
        .as_deref()
        .map(|user| membership.contains(user))
        .unwrap_or(false);

    let mut visitor = InspectVisitor {
        policy,
        ids,
        checked: 0,
        mismatched: Vec::new(),
        first_error: None,
    };
    walk_tree(path, &mut visitor);
    let InspectVisitor {
        checked,
        mut mismatched,
        first_error,
        ..
    } = visitor;
    mismatched.sort();
    let inconsistent_total = mismatched.len();
    mismatched.truncate(policy.max_reported_files.max(1));

    let directory_ok = is_odoo_owner && is_odoo_group && dir_mode_ok;
    let status = if first_error.is_some() {
        VerdictStatus::Error
    } else if directory_ok && inconsistent_total == 0 {
        VerdictStatus::Ok
    } else {
        VerdictStatus::Warning
    };
    tracing::debug!(
        path = %path.display(),
        status = status.as_str(),
        checked,
        inconsistent_total,
        "inspected addon directory"
    );

    DirectoryVerdict {
        path: path.to_string_lossy().to_string(),
        status,
        details: Some(PermissionDetails {
            owner,
            group,
            mode: format_mode(mode),
            expected_dir_mode: format_mode(policy.dir_mode),
            expected_file_mode: format_mode(policy.file_mode),
            owner_readable: mode & 0o400 != 0,
            owner_writable: mode & 0o200 != 0,
            owner_executable: mode & 0o100 != 0,
            group_readable: mode & 0o040 != 0,
            group_writable: mode & 0o020 != 0,
            group_executable: mode & 0o010 != 0,
            others_readable: mode & 0o004 != 0,
            others_writable: mode & 0o002 != 0,
            others_executable: mode & 0o001 != 0,
            readable: has_access(path, AccessFlags::R_OK),
            writable: has_access(path, AccessFlags::W_OK),
            executable: has_access(path, AccessFlags::X_OK),
            is_odoo_owner,
            is_odoo_group,
            dir_mode_ok,
            current_user,
            current_user_in_odoo_group,
            files_checked: checked,
            files_consistent: inconsistent_total == 0,
            inconsistent_files: mismatched,
            inconsistent_total,
        }),
        error: first_error,
    }
}

/// Filesystem mutations performed by a repair.
pub trait PermissionOps: Send + Sync {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPermissionOps;

impl PermissionOps for SystemPermissionOps {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))
    }

    /// Refuses to act through a symlink that replaced a walked entry.
    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let bits = Mode::from_bits_truncate(mode as nix::sys::stat::mode_t);
        match fchmodat(None, path, bits, FchmodatFlags::NoFollowSymlink) {
            Ok(()) => Ok(()),
            // Symlinks always land here; older libc also reports it for regular entries.
            Err(Errno::EOPNOTSUPP) => {
                if fs::symlink_metadata(path)?.file_type().is_symlink() {
                    return Err(io::Error::from(Errno::EOPNOTSUPP));
                }
                fs::set_permissions(path, fs::Permissions::from_mode(mode))
            }
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairFailure {
    pub path: String,
    pub operation: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixResult {
    pub path: String,
    pub success: bool,
    pub status: VerdictStatus,
    pub fixed_count: usize,
    pub failed_count: usize,
    pub remaining_inconsistent_files: Vec<String>,
    pub failures: Vec<RepairFailure>,
    pub error: Option<String>,
}

struct RepairVisitor<'a> {
    policy: &'a PermissionPolicy,
    ids: ExpectedIds,
    ops: &'a dyn PermissionOps,
    fixed: usize,
    failed: usize,
    failures: Vec<RepairFailure>,
    opened_dirs: HashSet<PathBuf>,
}

impl RepairVisitor<'_> {
    fn record(&mut self, relative: &str, operation: &str, message: String) {
        tracing::warn!(entry = relative, operation, message = %message, "repair step failed");
        self.failures.push(RepairFailure {
            path: relative.to_string(),
            operation: operation.to_string(),
            message,
        });
    }

    fn chown_failure_message(&self, relative: &str, err: &io::Error) -> String {
        let target = format!("{}:{}", self.policy.owner, self.policy.group);
        match err.kind() {
            io::ErrorKind::PermissionDenied => format!(
                "permission denied: changing ownership of {relative} to {target} requires elevated privileges"
            ),
            io::ErrorKind::NotFound => format!("{relative} disappeared during repair"),
            _ => format!("failed to change ownership of {relative} to {target}: {err}"),
        }
    }

    fn chmod_failure_message(&self, relative: &str, mode: u32, err: &io::Error) -> String {
        let mode = format_mode(mode);
        match err.kind() {
            io::ErrorKind::PermissionDenied => format!(
                "permission denied: changing mode of {relative} to {mode} requires ownership or elevated privileges"
            ),
            io::ErrorKind::NotFound => format!("{relative} disappeared during repair"),
            _ => format!("failed to change mode of {relative} to {mode}: {err}"),
        }
    }

    fn unresolved_identity_message(&self) -> String {
        match (self.ids.uid, self.ids.gid) {
            (None, _) => format!(
                "expected owner '{}' does not resolve to a system user",
                self.policy.owner
            ),
            _ => format!(
                "expected group '{}' does not resolve to a system group",
                self.policy.group
            ),
        }
    }

    /// Bring one item in line with policy. Only differing attributes are touched, so a
    /// compliant item costs nothing and is not counted.
    fn fix_item(&mut self, path: &Path, relative: &str, metadata: &fs::Metadata) {
        let mut changed = false;
        let mut failed = false;

        if !(self.ids.owner_matches(metadata) && self.ids.group_matches(metadata)) {
            match (self.ids.uid, self.ids.gid) {
                (Some(uid), Some(gid)) => match self.ops.chown(path, uid, gid) {
                    Ok(()) => changed = true,
                    Err(err) => {
                        failed = true;
                        let message = self.chown_failure_message(relative, &err);
                        self.record(relative, "chown", message);
                    }
                },
                _ => {
                    failed = true;
                    let message = self.unresolved_identity_message();
                    self.record(relative, "chown", message);
                }
            }
        }

        // chown may clear setuid/setgid bits, so compare against the current mode.
        let current_mode = if changed {
            fs::symlink_metadata(path)
                .map(|fresh| fresh.mode())
                .unwrap_or_else(|_| metadata.mode())
        } else {
            metadata.mode()
        } & 0o7777;
        let desired = self.policy.expected_mode(metadata.is_dir());
        if current_mode != desired {
            match self.ops.chmod(path, desired) {
                Ok(()) => changed = true,
                Err(err) => {
                    failed = true;
                    let message = self.chmod_failure_message(relative, desired, &err);
                    self.record(relative, "chmod", message);
                }
            }
        }

        if changed && metadata.is_dir() {
            self.opened_dirs.insert(path.to_path_buf());
        }
        if failed {
            self.failed += 1;
        } else if changed {
            self.fixed += 1;
        }
    }
}

impl TreeVisitor for RepairVisitor<'_> {
    fn entry(&mut self, path: &Path, relative: &str, metadata: &fs::Metadata) {
        self.fix_item(path, relative, metadata);
    }

    fn failure(&mut self, relative: &str, operation: &'static str, err: &io::Error) {
        self.failed += 1;
        self.record(relative, operation, format!("{relative}: {}", describe_io_error(err)));
    }

    /// The listing may have failed on the mode this visitor has just corrected.
    fn relist(&mut self, dir: &Path) -> bool {
        self.opened_dirs.remove(dir)
    }
}

/// Apply policy to an addon path and everything below it, then re-inspect. The
/// re-inspection, not the operation count, decides success.
pub fn repair_directory(
    path: &Path,
    policy: &PermissionPolicy,
    identity: &dyn IdentityResolver,
    ops: &dyn PermissionOps,
) -> FixResult {
    let path_text = path.to_string_lossy().to_string();
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => metadata,
        _ => {
            tracing::warn!(path = %path_text, "repair requested for missing directory");
            return FixResult {
                path: path_text,
                success: false,
                status: VerdictStatus::NotFound,
                fixed_count: 0,
                failed_count: 0,
                remaining_inconsistent_files: Vec::new(),
                failures: Vec::new(),
                error: Some(format!("directory not found: {}", path.display())),
            };
        }
    };

    tracing::info!(path = %path_text, owner = %policy.owner, group = %policy.group, "repairing addon directory");
    let mut visitor = RepairVisitor {
        policy,
        ids: ExpectedIds::resolve(policy, identity),
        ops,
        fixed: 0,
        failed: 0,
        failures: Vec::new(),
        opened_dirs: HashSet::new(),
    };
    visitor.fix_item(path, ROOT_LABEL, &metadata);
    walk_tree(path, &mut visitor);
    let RepairVisitor {
        fixed,
        failed,
        failures,
        ..
    } = visitor;

    let verdict = inspect_directory(path, policy, identity);
    let status = match verdict.status {
        VerdictStatus::Ok => VerdictStatus::Ok,
        VerdictStatus::NotFound => VerdictStatus::NotFound,
        VerdictStatus::Error => VerdictStatus::Error,
        VerdictStatus::Warning | VerdictStatus::PartiallyFixed => VerdictStatus::PartiallyFixed,
    };
    let success = status == VerdictStatus::Ok;
    let error = if success {
        None
    } else if let Some(message) = verdict.error.clone() {
        Some(message)
    } else if failed > 0 {
        Some(format!("{failed} item(s) could not be fixed"))
    } else {
        Some("directory still deviates from policy after repair".to_string())
    };
    tracing::info!(
        path = %path_text,
        status = status.as_str(),
        fixed,
        failed,
        "repair finished"
    );

    FixResult {
        path: path_text,
        success,
        status,
        fixed_count: fixed,
        failed_count: failed,
        remaining_inconsistent_files: verdict.inconsistent_files(),
        failures,
        error,
    }
}

/// At most one inspection or repair in flight per path; different paths never block
/// each other.
#[derive(Debug, Default)]
pub struct PathLocks {
    inner: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn with_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let lock = Arc::clone(self.map().entry(key.clone()).or_default());
        let result = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f()
        };
        drop(lock);
        let mut map = self.map();
        // Last holder out removes the entry; a waiter still owns a clone.
        if map.get(&key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            map.remove(&key);
        }
        result
    }

    fn map(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<Mutex<()>>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Shared entry point for the CLI and the dashboard server.
pub struct PermissionEngine {
    identity: Box<dyn IdentityResolver>,
    ops: Box<dyn PermissionOps>,
    locks: PathLocks,
}

impl PermissionEngine {
    pub fn new(identity: Box<dyn IdentityResolver>, ops: Box<dyn PermissionOps>) -> Self {
        Self {
            identity,
            ops,
            locks: PathLocks::default(),
        }
    }

    pub fn system() -> Self {
        Self::new(
            Box::new(SystemIdentity::default()),
            Box::new(SystemPermissionOps),
        )
    }

    pub fn identity(&self) -> &dyn IdentityResolver {
        self.identity.as_ref()
    }

    pub fn inspect(&self, path: &Path, policy: &PermissionPolicy) -> DirectoryVerdict {
        self.locks
            .with_lock(path, || inspect_directory(path, policy, self.identity()))
    }

    /// Verdicts in input order. Paths are inspected by up to four workers at a time.
    pub fn inspect_all(&self, paths: &[PathBuf], policy: &PermissionPolicy) -> Vec<DirectoryVerdict> {
        let mut verdicts = Vec::with_capacity(paths.len());
        for batch in paths.chunks(INSPECT_WORKERS) {
            thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|path| (path, scope.spawn(move || self.inspect(path, policy))))
                    .collect();
                for (path, handle) in handles {
                    verdicts.push(handle.join().unwrap_or_else(|_| {
                        DirectoryVerdict::failed(path, "inspection worker panicked".to_string())
                    }));
                }
            });
        }
        verdicts
    }

    pub fn repair(&self, path: &Path, policy: &PermissionPolicy) -> FixResult {
        self.locks.with_lock(path, || {
            repair_directory(path, policy, self.identity(), self.ops.as_ref())
        })
    }
}
