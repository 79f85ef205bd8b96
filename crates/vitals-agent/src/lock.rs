//! Single-instance lock on the state directory.
//!
//! The lock file holds the pid of the agent that owns the state directory,
//! so a refused start can say who is in the way.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Exclusive ownership of a state directory. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl StateLock {
    /// Take the lock at `path` without waiting.
    pub async fn acquire(path: PathBuf) -> AgentResult<Self> {
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| AgentError::Lock(format!("lock task: {e}")))?
    }

    fn acquire_blocking(path: PathBuf) -> AgentResult<Self> {
        let fail = |what: &str, e: &dyn std::fmt::Display| {
            AgentError::Lock(format!("{what} {}: {e}", path.display()))
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| fail("state dir for", &e))?;
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| fail("open", &e))?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((mut file, errno)) if errno == Errno::EWOULDBLOCK => {
                let owner = read_owner(&mut file)
                    .map(|pid| format!("pid {pid}"))
                    .unwrap_or_else(|| "another process".to_string());
                return Err(AgentError::Lock(format!(
                    "state directory is in use by {owner} (lock {})",
                    path.display()
                )));
            }
            Err((_, errno)) => return Err(fail("flock", &errno)),
        };

        record_owner(&mut locked).map_err(|e| fail("record pid in", &e))?;
        debug!(path = %path.display(), pid = std::process::id(), "state lock acquired");
        Ok(Self {
            path,
            _file: locked,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn record_owner(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

/// Pid recorded by the current owner, if the file holds one.
fn read_owner(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}
