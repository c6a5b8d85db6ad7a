use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, LockerHints, Result};

// Helper exit codes, shared with the standalone dotlock program.
const EX_OK: i32 = 0;
const EX_ERROR: i32 = 1;
const EX_NEXIST: i32 = 2;
const EX_EXIST: i32 = 3;
const EX_PERM: i32 = 4;
const EX_EXEC_FAILED: i32 = 127;

/// Locking delegated to a setuid helper:
/// `<helper> [-f<minutes>] [-r<retries>] [-u] <file>`.
pub struct ExternalLock {
    program: PathBuf,
    expire_time: Option<Duration>,
    retry_count: Option<u32>,
}

impl ExternalLock {
    pub fn new(program: PathBuf, hints: &LockerHints) -> ExternalLock {
        ExternalLock {
            program,
            expire_time: hints.expire_time,
            retry_count: hints.retry.map(|(count, _)| count),
        }
    }

    pub async fn lock(&mut self, file: &Path, acquire: bool) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.program);
        if let Some(expire) = self.expire_time {
            let minutes = (expire.as_secs() / 60).max(1);
            cmd.arg(format!("-f{}", minutes));
        }
        if let Some(retries) = self.retry_count {
            cmd.arg(format!("-r{}", retries));
        }
        if !acquire {
            cmd.arg("-u");
        }
        cmd.arg(file);

        let status = match cmd.status().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(program = %self.program.display(), error = %e,
                    "cannot spawn external locker");
                return Err(Error::ExtFail);
            }
        };

        match status.code() {
            None => Err(Error::ExtKilled),
            Some(EX_OK) => Ok(()),
            Some(EX_NEXIST) => Err(Error::NotHeld),
            Some(EX_EXIST) => Err(Error::Conflict),
            Some(EX_PERM) => Err(Error::Permission),
            Some(EX_EXEC_FAILED) => Err(Error::ExtFail),
            Some(EX_ERROR) | Some(_) => Err(Error::ExtErr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn fake_helper(dir: &Path, exit_code: i32) -> PathBuf {
        let path = dir.join("fake-dotlock");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nexit {}", exit_code).unwrap();
        drop(f);
        let mut perm = std::fs::metadata(&path).unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&path, perm).unwrap();
        path
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cour-lock-ext-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[tokio::test]
    async fn exit_codes_map_to_errors() {
        let dir = scratch_dir("codes");
        let target = dir.join("mailbox");
        std::fs::write(&target, b"").unwrap();
        for (code, check) in [
            (EX_OK, None),
            (EX_NEXIST, Some("lock not held")),
            (EX_EXIST, Some("lock conflict")),
            (EX_PERM, Some("permission denied")),
            (EX_ERROR, Some("external locker failed")),
        ] {
            let helper = fake_helper(&dir, code);
            let mut ext = ExternalLock::new(helper, &LockerHints::default());
            let res = ext.lock(&target, true).await;
            match check {
                None => assert!(res.is_ok()),
                Some(msg) => assert_eq!(res.unwrap_err().to_string(), msg),
            }
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn missing_helper_is_exec_failure() {
        let mut ext = ExternalLock::new(
            PathBuf::from("/nonexistent/helper"),
            &LockerHints::default(),
        );
        assert!(matches!(
            ext.lock(Path::new("/tmp/x"), true).await,
            Err(Error::ExtFail)
        ));
    }
}
