use std::os::fd::AsRawFd;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;

use crate::{Error, LockMode, Result};

/// Whole-file `fcntl` record lock. Read lock for shared and optimistic
/// modes, write lock for exclusive.
pub struct KernelLock {
    file: Option<std::fs::File>,
}

impl KernelLock {
    pub fn new() -> KernelLock {
        KernelLock { file: None }
    }

    fn flock(kind: i16) -> libc::flock {
        libc::flock {
            l_type: kind,
            l_whence: libc::SEEK_SET as i16,
            l_start: 0,
            l_len: 0, // whole file
            l_pid: 0,
        }
    }

    pub fn lock(&mut self, path: &Path, mode: LockMode) -> Result<()> {
        let kind = match mode {
            LockMode::Shared | LockMode::Optimistic => libc::F_RDLCK as i16,
            LockMode::Exclusive => libc::F_WRLCK as i16,
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let fl = Self::flock(kind);
        match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl)) {
            Ok(_) => {
                self.file = Some(file);
                Ok(())
            }
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EACCES) => Err(Error::Again),
            Err(e) => Err(Error::Io(e.into())),
        }
    }

    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            let fl = Self::flock(libc::F_UNLCK as i16);
            match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&fl)) {
                Ok(_) => Ok(()),
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EACCES) => {
                    Err(Error::Again)
                }
                Err(e) => Err(Error::Io(e.into())),
            }
        } else {
            Ok(())
        }
    }
}
