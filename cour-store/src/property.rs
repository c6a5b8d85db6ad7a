use std::path::{Path, PathBuf};

use crate::error::Result;

/// Format-lineage version written to `.mu-prop`. Stores whose recorded
/// version is at or below 3.10 (or missing) still use the legacy
/// maildir attribute letters and get fixed up on load.
pub const PROP_VERSION: &str = "3.17";

pub const PROP_FILE_NAME: &str = ".mu-prop";
pub const SUBSCRIPTION_FILE_NAME: &str = ".mu-subscr";

/// A `key: value` side-channel file (`.mu-prop`).
pub struct PropertyFile {
    path: PathBuf,
    entries: Vec<(String, String)>,
    existed: bool,
    dirty: bool,
}

impl PropertyFile {
    pub async fn load(path: impl AsRef<Path>) -> Result<PropertyFile> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();
        let existed = match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                for line in text.lines() {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once(':') {
                        entries.push((key.trim().to_string(), value.trim().to_string()));
                    }
                }
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(PropertyFile {
            path,
            entries,
            existed,
            dirty: false,
        })
    }

    /// Whether the file was present when the mailbox was opened.
    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => {
                if entry.1 != value {
                    entry.1 = value.to_string();
                    self.dirty = true;
                }
            }
            None => {
                self.entries.push((key.to_string(), value.to_string()));
                self.dirty = true;
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub async fn save(&mut self) -> Result<()> {
        if !self.dirty && self.existed {
            return Ok(());
        }
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        }
        tokio::fs::write(&self.path, out).await?;
        self.existed = true;
        self.dirty = false;
        Ok(())
    }
}

/// Compare two dotted version strings numerically, component-wise.
pub fn version_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|c| {
                c.chars()
                    .take_while(|ch| ch.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let x = va.get(i).copied().unwrap_or(0);
        let y = vb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// The legacy-attribute gate: a store needs fixing when its property
/// file exists but records no version, or a version at or below 3.10.
pub fn needs_attribute_fixup(prop: &PropertyFile) -> bool {
    if !prop.existed() {
        return false;
    }
    match prop.get("version") {
        None => true,
        Some(v) => version_cmp(v, "3.10") != std::cmp::Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("cour-prop-{}-{}", std::process::id(), tag));
        p
    }

    #[tokio::test]
    async fn load_set_save_round_trip() {
        let path = scratch("rt");
        let _ = std::fs::remove_file(&path);
        let mut prop = PropertyFile::load(&path).await.unwrap();
        assert!(!prop.existed());
        prop.set("version", PROP_VERSION);
        prop.set("uid-validity", "12345");
        prop.save().await.unwrap();

        let prop = PropertyFile::load(&path).await.unwrap();
        assert!(prop.existed());
        assert_eq!(prop.get("version"), Some(PROP_VERSION));
        assert_eq!(prop.get("uid-validity"), Some("12345"));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn fixup_gate() {
        let path = scratch("gate");
        let _ = std::fs::remove_file(&path);
        // Absent file: not a legacy store.
        let prop = PropertyFile::load(&path).await.unwrap();
        assert!(!needs_attribute_fixup(&prop));

        std::fs::write(&path, "version: 3.10\n").unwrap();
        let prop = PropertyFile::load(&path).await.unwrap();
        assert!(needs_attribute_fixup(&prop));

        std::fs::write(&path, "version: 3.9.17\n").unwrap();
        let prop = PropertyFile::load(&path).await.unwrap();
        assert!(needs_attribute_fixup(&prop));

        std::fs::write(&path, "version: 3.11\n").unwrap();
        let prop = PropertyFile::load(&path).await.unwrap();
        assert!(!needs_attribute_fixup(&prop));

        // Present but versionless: fix it up.
        std::fs::write(&path, "uid-validity: 77\n").unwrap();
        let prop = PropertyFile::load(&path).await.unwrap();
        assert!(needs_attribute_fixup(&prop));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn version_ordering() {
        use std::cmp::Ordering::*;
        assert_eq!(version_cmp("3.10", "3.10"), Equal);
        assert_eq!(version_cmp("3.9", "3.10"), Less);
        assert_eq!(version_cmp("3.10.90", "3.10"), Greater);
    }
}
