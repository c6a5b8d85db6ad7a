use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::observable::{MailboxEvent, Observable};
use crate::property::SUBSCRIPTION_FILE_NAME;
use crate::registrar::{detect_format, MailboxFormat};

/// Shell-style match: `*` spans any run, `?` one character. Neither
/// crosses a `/`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Shortest first keeps the common prefix-directory case
                // cheap.
                matches(&p[1..], n)
                    || (!n.is_empty() && n[0] != b'/' && matches(p, &n[1..]))
            }
            (Some(b'?'), Some(&c)) if c != b'/' => matches(&p[1..], &n[1..]),
            (Some(&a), Some(&b)) if a == b => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// One mailbox (or intermediate directory) found by [`Folder::list`].
#[derive(Clone, Debug)]
pub struct FolderEntry {
    /// Name relative to the folder root.
    pub name: String,
    pub path: PathBuf,
    pub format: Option<MailboxFormat>,
    pub is_dir: bool,
    pub depth: usize,
}

/// A directory of mailboxes.
///
/// Enumeration recurses with a device+inode visited set, so symlink
/// loops terminate; maildirs count as leaves and their structural
/// subdirectories are never reported as mailboxes.
pub struct Folder {
    path: PathBuf,
    observable: Arc<Observable>,
}

impl Folder {
    pub fn new(path: impl AsRef<Path>) -> Folder {
        Folder {
            path: path.as_ref().to_path_buf(),
            observable: Arc::new(Observable::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn observable(&self) -> Arc<Observable> {
        self.observable.clone()
    }

    /// Enumerate mailboxes whose relative name matches `pattern` under
    /// `reference` (a subdirectory name, empty for the root).
    pub async fn list(&self, reference: &str, pattern: &str) -> Result<Vec<FolderEntry>> {
        let root = if reference.is_empty() {
            self.path.clone()
        } else {
            self.path.join(reference)
        };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![(root.clone(), String::new(), 0usize)];

        while let Some((dir, prefix, depth)) = stack.pop() {
            let meta = match tokio::fs::metadata(&dir).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !seen.insert((meta.dev(), meta.ino())) {
                tracing::debug!(dir = %dir.display(), "directory cycle skipped");
                continue;
            }
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if file_name.starts_with('.') || crate::maildir::reserved_name(&file_name) {
                    continue;
                }
                let rel = if prefix.is_empty() {
                    file_name.clone()
                } else {
                    format!("{}/{}", prefix, file_name)
                };
                let path = entry.path();
                let format = detect_format(&path, 1).await?;
                let is_dir = tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if glob_match(pattern, &rel) && (format.is_some() || is_dir) {
                    out.push(FolderEntry {
                        name: rel.clone(),
                        path: path.clone(),
                        format,
                        is_dir,
                        depth,
                    });
                }
                // Descend into plain directories only; a maildir is a
                // mailbox, not a branch.
                if is_dir && format != Some(MailboxFormat::Maildir) {
                    stack.push((path, rel, depth + 1));
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn subscription_path(&self) -> PathBuf {
        self.path.join(SUBSCRIPTION_FILE_NAME)
    }

    /// Names listed in `.mu-subscr`, one per line.
    pub async fn subscriptions(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.subscription_path()).await {
            Ok(text) => Ok(text
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn subscribe(&self, name: &str) -> Result<()> {
        let mut subs = self.subscriptions().await?;
        if !subs.iter().any(|s| s == name) {
            subs.push(name.to_string());
            self.write_subscriptions(&subs).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let mut subs = self.subscriptions().await?;
        let before = subs.len();
        subs.retain(|s| s != name);
        if subs.len() != before {
            self.write_subscriptions(&subs).await?;
        }
        Ok(())
    }

    async fn write_subscriptions(&self, subs: &[String]) -> Result<()> {
        let mut text = String::new();
        for s in subs {
            text.push_str(s);
            text.push('\n');
        }
        tokio::fs::write(self.subscription_path(), text).await?;
        Ok(())
    }

    /// Remove the folder directory tree, telling observers first.
    pub async fn destroy(self) -> Result<()> {
        self.observable.notify(&MailboxEvent::FolderDestroy);
        tokio::fs::remove_dir_all(&self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_semantics() {
        assert!(glob_match("*", "INBOX"));
        assert!(glob_match("IN*", "INBOX"));
        assert!(glob_match("?NBOX", "INBOX"));
        assert!(glob_match("lists/*", "lists/rust"));
        assert!(!glob_match("*", "lists/rust"));
        assert!(!glob_match("IN*", "OUTBOX"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
    }

    fn scratch(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cour-folder-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[tokio::test]
    async fn lists_mailboxes_and_skips_maildir_guts() {
        let root = scratch("list");
        std::fs::write(root.join("inbox"), b"From joe Wed Dec  2 05:53:22 1992\n\nx\n")
            .unwrap();
        for sub in ["cur", "new", "tmp"] {
            std::fs::create_dir_all(root.join("box").join(sub)).unwrap();
        }
        let folder = Folder::new(&root);
        let entries = folder.list("", "*").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["box", "inbox"]);
        assert_eq!(entries[0].format, Some(MailboxFormat::Maildir));
        assert_eq!(entries[1].format, Some(MailboxFormat::Mbox));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn symlink_cycles_terminate() {
        let root = scratch("cycle");
        std::fs::create_dir_all(root.join("a")).unwrap();
        let loop_link = root.join("a").join("loop");
        if !loop_link.exists() {
            std::os::unix::fs::symlink(&root, &loop_link).unwrap();
        }
        let folder = Folder::new(&root);
        // Termination is the assertion here.
        folder.list("", "*").await.unwrap();
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn subscription_round_trip() {
        let root = scratch("subscr");
        let folder = Folder::new(&root);
        folder.subscribe("INBOX").await.unwrap();
        folder.subscribe("lists/rust").await.unwrap();
        folder.subscribe("INBOX").await.unwrap();
        assert_eq!(
            folder.subscriptions().await.unwrap(),
            vec!["INBOX".to_string(), "lists/rust".to_string()]
        );
        folder.unsubscribe("INBOX").await.unwrap();
        assert_eq!(
            folder.subscriptions().await.unwrap(),
            vec!["lists/rust".to_string()]
        );
        std::fs::remove_dir_all(&root).unwrap();
    }
}
