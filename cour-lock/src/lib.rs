//! Named advisory locks over pathnames.
//!
//! A [`Locker`] guards a file by name through one of four backends:
//! dotlock (`<path>.lock` taken via an NFS-safe hitching post), kernel
//! record locks, an external helper program, or a null backend for
//! `/dev/null`. Lock acquisition retries on conflict according to the
//! configured schedule, and lockers are reentrant: nested `lock` calls
//! are counted and only the final `unlock` releases the file.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod dotlock;
mod external;
mod kernel;

use dotlock::DotLock;
use external::ExternalLock;
use kernel::KernelLock;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lock conflict")]
    Conflict,

    #[error("lock not held")]
    NotHeld,

    #[error("refusing to lock unsafe file")]
    BadFile,

    #[error("lock file tampered with")]
    BadLock,

    #[error("external locker could not be run")]
    ExtFail,

    #[error("external locker killed by signal")]
    ExtKilled,

    #[error("external locker failed")]
    ExtErr,

    #[error("permission denied")]
    Permission,

    /// Transient; consumed by the retry loop, never surfaced.
    #[error("resource busy")]
    Again,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
    Shared,
    Exclusive,
    /// Like shared, but used by probes that may skip locking entirely.
    Optimistic,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockerKind {
    Dotlock,
    Kernel,
    External,
    Null,
}

pub const DEFAULT_RETRY_COUNT: u32 = 10;
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(1);
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(600);
pub const DEFAULT_EXTERNAL_PROGRAM: &str = "dotlock";

/// Configuration passed to [`Locker::create`].
#[derive(Clone, Debug)]
pub struct LockerHints {
    pub kind: LockerKind,
    /// `Some` enables the retry loop.
    pub retry: Option<(u32, Duration)>,
    /// `Some` enables breaking locks older than the given age.
    pub expire_time: Option<Duration>,
    /// Record our pid in dotlocks and break locks of dead processes.
    pub check_pid: bool,
    /// Helper program for [`LockerKind::External`].
    pub external_program: Option<PathBuf>,
}

impl Default for LockerHints {
    fn default() -> LockerHints {
        LockerHints {
            kind: LockerKind::Dotlock,
            retry: Some((DEFAULT_RETRY_COUNT, DEFAULT_RETRY_SLEEP)),
            expire_time: None,
            check_pid: false,
            external_program: None,
        }
    }
}

enum Backend {
    Dot(DotLock),
    Kernel(KernelLock),
    External(ExternalLock),
    Null,
}

/// Compare the file as seen by name against the file as opened.
/// Symlinks, hard-link farms and mid-check replacements all show up as a
/// disagreement.
fn stat_check(path: &Path, opened: &std::fs::File, links: u64) -> Result<()> {
    let by_name = std::fs::symlink_metadata(path)?;
    let by_fd = opened.metadata()?;
    let ok = by_name.file_type().is_file()
        && by_fd.file_type().is_file()
        && by_name.nlink() == links
        && by_name.dev() == by_fd.dev()
        && by_name.ino() == by_fd.ino()
        && by_name.mode() == by_fd.mode()
        && by_name.nlink() == by_fd.nlink()
        && by_name.uid() == by_fd.uid()
        && by_name.gid() == by_fd.gid()
        && by_name.rdev() == by_fd.rdev();
    if ok {
        Ok(())
    } else {
        Err(Error::BadLock)
    }
}

/// Refuse to lock anything but a plain file with a single link whose
/// name and descriptor agree.
fn check_file_permissions(path: &Path) -> Result<()> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    stat_check(path, &file, 1).map_err(|e| match e {
        Error::BadLock => Error::BadFile,
        other => other,
    })
}

/// Resolve symlinks in `path`; when the leaf does not exist yet, resolve
/// the parent and keep the leaf name.
fn unroll_symlink(path: &Path) -> std::io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let parent = match path.parent() {
                Some(p) if p.components().next().is_some() => p,
                _ => return Ok(path.to_path_buf()),
            };
            let leaf = path.file_name().map(PathBuf::from).unwrap_or_default();
            let mut resolved = std::fs::canonicalize(parent)?;
            resolved.push(leaf);
            Ok(resolved)
        }
        Err(e) => Err(e),
    }
}

pub struct Locker {
    file: PathBuf,
    refcnt: u32,
    mode: LockMode,
    retry: Option<(u32, Duration)>,
    backend: Backend,
}

impl Locker {
    pub async fn create(file: impl AsRef<Path>, hints: LockerHints) -> Result<Locker> {
        let resolved = unroll_symlink(file.as_ref())?;

        let kind = if resolved == Path::new("/dev/null") {
            LockerKind::Null
        } else {
            hints.kind
        };

        let backend = match kind {
            LockerKind::Dotlock => match DotLock::new(&resolved, &hints) {
                Some(dot) => Backend::Dot(dot),
                // Unwritable spool directory: fall back to kernel locks.
                None => Backend::Kernel(KernelLock::new()),
            },
            LockerKind::Kernel => Backend::Kernel(KernelLock::new()),
            LockerKind::External => Backend::External(ExternalLock::new(
                hints
                    .external_program
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTERNAL_PROGRAM)),
                &hints,
            )),
            LockerKind::Null => Backend::Null,
        };

        Ok(Locker {
            file: resolved,
            refcnt: 0,
            mode: LockMode::Exclusive,
            retry: hints.retry,
            backend,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn kind(&self) -> LockerKind {
        match self.backend {
            Backend::Dot(_) => LockerKind::Dotlock,
            Backend::Kernel(_) => LockerKind::Kernel,
            Backend::External(_) => LockerKind::External,
            Backend::Null => LockerKind::Null,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.refcnt > 0
    }

    pub async fn lock(&mut self) -> Result<()> {
        self.lock_mode(LockMode::Exclusive).await
    }

    pub async fn lock_mode(&mut self, mode: LockMode) -> Result<()> {
        match &self.backend {
            Backend::Dot(_) | Backend::External(_) => check_file_permissions(&self.file)?,
            _ => {}
        }

        if self.refcnt > 0 {
            self.refcnt += 1;
            if mode == self.mode {
                return Ok(());
            }
        }
        self.mode = mode;

        let (mut retries, sleep) = match self.retry {
            Some((count, sleep)) => (count.max(1), sleep),
            None => (1, Duration::ZERO),
        };
        let rc = loop {
            let rc = match &mut self.backend {
                Backend::Dot(dot) => dot.lock(&self.file, mode).await,
                Backend::Kernel(k) => k.lock(&self.file, mode),
                Backend::External(e) => e.lock(&self.file, true).await,
                Backend::Null => Ok(()),
            };
            retries -= 1;
            match rc {
                Err(Error::Again) if retries > 0 => {
                    tracing::debug!(file = %self.file.display(), "lock busy, retrying");
                    tokio::time::sleep(sleep).await;
                }
                other => break other,
            }
        };
        match rc {
            Ok(()) => {
                self.refcnt += 1;
                Ok(())
            }
            Err(Error::Again) => Err(Error::Conflict),
            Err(e) => Err(e),
        }
    }

    pub async fn unlock(&mut self) -> Result<()> {
        if self.refcnt == 0 {
            return Err(Error::NotHeld);
        }
        if !matches!(self.backend, Backend::Null) {
            check_file_permissions(&self.file)?;
        }
        self.refcnt -= 1;
        if self.refcnt > 0 {
            return Ok(());
        }
        match &mut self.backend {
            Backend::Dot(dot) => dot.unlock(),
            Backend::Kernel(k) => k.unlock(),
            Backend::External(e) => e.lock(&self.file, false).await,
            Backend::Null => Ok(()),
        }
    }

    /// Force the reference count down and release the file.
    pub async fn remove_lock(&mut self) -> Result<()> {
        self.refcnt = 1;
        self.unlock().await
    }

    /// Refresh the dotlock mtime so expiry-based breakers leave a live
    /// lock alone. A no-op for other backends.
    pub async fn touch(&mut self) -> Result<()> {
        match &self.backend {
            Backend::Dot(dot) => {
                if self.refcnt == 0 {
                    return Err(Error::NotHeld);
                }
                dot.touch()
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cour-lock-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    fn hints_no_retry() -> LockerHints {
        LockerHints {
            retry: Some((1, Duration::from_millis(1))),
            ..LockerHints::default()
        }
    }

    #[tokio::test]
    async fn dotlock_creates_and_removes_lock_file() {
        let dir = scratch_dir("basic");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"").unwrap();
        let mut locker = Locker::create(&target, hints_no_retry()).await.unwrap();
        locker.lock().await.unwrap();
        assert!(dir.join("mailbox.lock").exists());
        locker.unlock().await.unwrap();
        assert!(!dir.join("mailbox.lock").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn second_locker_conflicts() {
        let dir = scratch_dir("conflict");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"").unwrap();
        let mut a = Locker::create(&target, hints_no_retry()).await.unwrap();
        let mut b = Locker::create(&target, hints_no_retry()).await.unwrap();
        a.lock().await.unwrap();
        assert!(matches!(b.lock().await, Err(Error::Conflict)));
        a.unlock().await.unwrap();
        b.lock().await.unwrap();
        b.unlock().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn reentrant_unlock_releases_only_at_zero() {
        let dir = scratch_dir("reent");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"").unwrap();
        let mut locker = Locker::create(&target, hints_no_retry()).await.unwrap();
        locker.lock().await.unwrap();
        locker.lock().await.unwrap();
        locker.unlock().await.unwrap();
        assert!(dir.join("mailbox.lock").exists());
        locker.unlock().await.unwrap();
        assert!(!dir.join("mailbox.lock").exists());
        assert!(matches!(locker.unlock().await, Err(Error::NotHeld)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn stale_pid_lock_is_broken() {
        let dir = scratch_dir("stalepid");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"").unwrap();
        // No live process carries a pid this large on Linux.
        std::fs::write(dir.join("mailbox.lock"), b"99999999\n").unwrap();
        let mut locker = Locker::create(
            &target,
            LockerHints {
                check_pid: true,
                retry: Some((3, Duration::from_millis(10))),
                ..LockerHints::default()
            },
        )
        .await
        .unwrap();
        locker.lock().await.unwrap();
        locker.unlock().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn expired_lock_is_broken() {
        let dir = scratch_dir("expire");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"").unwrap();
        std::fs::write(dir.join("mailbox.lock"), b"").unwrap();
        let mut locker = Locker::create(
            &target,
            LockerHints {
                expire_time: Some(Duration::ZERO),
                retry: Some((3, Duration::from_millis(10))),
                ..LockerHints::default()
            },
        )
        .await
        .unwrap();
        // mtime of "now" is already older than a zero expiry.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        locker.lock().await.unwrap();
        locker.unlock().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn dev_null_uses_null_backend() {
        let mut locker = Locker::create("/dev/null", LockerHints::default())
            .await
            .unwrap();
        assert_eq!(locker.kind(), LockerKind::Null);
        locker.lock().await.unwrap();
        locker.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn symlinked_target_locks_the_real_file() {
        let dir = scratch_dir("symlink");
        let real = dir.join("real");
        let link = dir.join("link");
        std::fs::write(&real, b"").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let mut locker = Locker::create(&link, hints_no_retry()).await.unwrap();
        locker.lock().await.unwrap();
        assert!(dir.join("real.lock").exists());
        locker.unlock().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn kernel_lock_round_trip() {
        let dir = scratch_dir("kernel");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"contents").unwrap();
        let mut locker = Locker::create(
            &target,
            LockerHints {
                kind: LockerKind::Kernel,
                ..hints_no_retry()
            },
        )
        .await
        .unwrap();
        locker.lock().await.unwrap();
        locker.unlock().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
