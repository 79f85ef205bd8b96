//! Files kept under the agent's state directory.

use crate::event::Category;
use std::io::Write;
use std::path::{Path, PathBuf};

/// State-directory layout.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Buffer snapshot for one category.
    pub fn buffer_snapshot(&self, category: Category) -> PathBuf {
        self.root.join(format!("buffer-{}.json", category.route()))
    }

    /// Byte offset of the next unread line in a category's inbox.
    pub fn inbox_position(&self, category: Category) -> PathBuf {
        self.root.join(format!("inbox-{}.pos", category.route()))
    }

    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join("agent.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Each category has its own inbox file, so each is read through its own cursor.
pub fn inbox_file_name(category: Category) -> String {
    format!("inbox-{}.jsonl", category.route())
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// file. The data is synced before the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted() {
        let p = StatePaths::new(PathBuf::from("/var/lib/vitals-agent"));
        assert_eq!(
            p.buffer_snapshot(Category::Feeding),
            PathBuf::from("/var/lib/vitals-agent/buffer-feedings.json")
        );
        assert_eq!(inbox_file_name(Category::Vitals), "inbox-vitals.jsonl");
        assert_eq!(
            p.inbox_position(Category::Feeding),
            PathBuf::from("/var/lib/vitals-agent/inbox-feedings.pos")
        );
        assert_eq!(p.status(), PathBuf::from("/var/lib/vitals-agent/status.json"));
        assert_eq!(p.lock(), PathBuf::from("/var/lib/vitals-agent/agent.lock"));
        assert_eq!(p.logs_dir(), PathBuf::from("/var/lib/vitals-agent/logs"));
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        write_atomic(&path, b"{\"first\": true, \"padding\": \"xxxxxxxx\"}").unwrap();
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        // No temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn atomic_write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("status.json");
        assert!(write_atomic(&path, b"{}").is_err());
    }
}
