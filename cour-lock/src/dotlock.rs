use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::{stat_check, Error, LockMode, LockerHints, Result};

const DOTLOCK_SUFFIX: &str = ".lock";

/// `<path>.lock` taken through an NFS hitching post.
///
/// A unique post file is created `O_EXCL`, hard-linked to the dotlock
/// name, and the link is verified by comparing the post's link count and
/// identity against the freshly opened lock file. The verification, not
/// the link call's return value, is what makes this correct over NFS.
pub struct DotLock {
    dotlock: PathBuf,
    check_pid: bool,
    expire_time: Option<Duration>,
}

impl DotLock {
    /// Returns `None` when the spool directory is not writable, in which
    /// case the caller falls back to kernel locking.
    pub fn new(file: &Path, hints: &LockerHints) -> Option<DotLock> {
        let dir = match file.parent() {
            Some(p) if p.as_os_str().is_empty() => Path::new("."),
            Some(p) => p,
            None => Path::new("."),
        };
        let writable = nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok();
        if !writable {
            return None;
        }
        let mut dotlock = file.as_os_str().to_os_string();
        dotlock.push(DOTLOCK_SUFFIX);
        Some(DotLock {
            dotlock: PathBuf::from(dotlock),
            check_pid: hints.check_pid,
            expire_time: hints.expire_time,
        })
    }

    fn expire_stale(&self) {
        let mut stale = false;
        let mut file = match std::fs::File::open(&self.dotlock) {
            Ok(f) => f,
            Err(_) => return,
        };
        if self.check_pid {
            let mut buf = String::new();
            if file.read_to_string(&mut buf).is_ok() && !buf.is_empty() {
                match buf.trim().parse::<i32>() {
                    Ok(pid) if pid > 0 => {
                        if kill(Pid::from_raw(pid), None).is_err() {
                            // Holder is gone.
                            stale = true;
                        }
                    }
                    // Corrupt contents: break the lock.
                    _ => stale = true,
                }
            }
        }
        if let Some(expire) = self.expire_time {
            if let Ok(meta) = file.metadata() {
                if let Ok(mtime) = meta.modified() {
                    let age = SystemTime::now()
                        .duration_since(mtime)
                        .unwrap_or(Duration::ZERO);
                    if age > expire {
                        stale = true;
                    }
                }
            }
        }
        if stale {
            tracing::debug!(lock = %self.dotlock.display(), "breaking stale dotlock");
            let _ = std::fs::remove_file(&self.dotlock);
        }
    }

    fn hitching_post_name(&self, file: &Path) -> Result<PathBuf> {
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let mut name = file.as_os_str().to_os_string();
        name.push(format!(".{}.{}.{}", std::process::id(), now, host));
        Ok(PathBuf::from(name))
    }

    pub async fn lock(&mut self, file: &Path, _mode: LockMode) -> Result<()> {
        self.expire_stale();

        let post = self.hitching_post_name(file)?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&post)
        {
            Ok(f) => drop(f),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(Error::Again),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = std::fs::hard_link(&post, &self.dotlock) {
            let _ = std::fs::remove_file(&post);
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(Error::Again);
            }
            return Err(e.into());
        }

        let lock_file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.dotlock)
        {
            Ok(f) => f,
            Err(e) => {
                let _ = std::fs::remove_file(&post);
                return Err(e.into());
            }
        };

        // The post must now have two links and be the very file we just
        // opened through the dotlock name.
        let verified = stat_check(&post, &lock_file, 2);
        let _ = std::fs::remove_file(&post);
        verified?;

        if self.check_pid {
            let mut f = lock_file;
            let _ = write!(f, "{}", std::process::id());
        }
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.dotlock) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotHeld),
            Err(e) => Err(e.into()),
        }
    }

    pub fn touch(&self) -> Result<()> {
        // Rewriting the current contents refreshes the mtime without
        // disturbing the pid record.
        let contents = std::fs::read(&self.dotlock).map_err(|_| Error::NotHeld)?;
        std::fs::write(&self.dotlock, contents)?;
        Ok(())
    }
}
