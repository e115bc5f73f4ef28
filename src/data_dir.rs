use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "COURSEDEX_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The `env_override` value (normally `COURSEDEX_DATA_DIR`)
    /// 3. The XDG data directory (~/.local/share/coursedex/)
    pub fn resolve(
        explicit: Option<&Path>,
        env_override: Option<&str>,
    ) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Some(val) = env_override {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("coursedex")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join("config.redb")
    }

    /// Chunk checkpoint written by `coursedex preprocess`.
    pub fn chunks_file(&self) -> PathBuf {
        self.root.join("chunks.json")
    }

    /// Directory holding the persisted vector index.
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("coursedex.lock")
    }

    /// Take the single-writer lock for preprocessing and indexing runs.
    pub fn lock(&self) -> Result<WriterLock> {
        WriterLock::acquire(self.lock_file())
    }
}

/// Exclusive lock held while a run rewrites the checkpoint or index.
///
/// Backed by a lock file created with create-new semantics, holding the
/// owner's pid and removed on drop. Where `/proc` is available, a lock whose
/// owner is no longer running is reclaimed.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    pub fn acquire(path: PathBuf) -> Result<Self> {
        match Self::create(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            other => return other.map(|()| Self { path }).map_err(Error::Io),
        }

        let owner = lock_owner(&path);
        if let Some(pid) = owner
            && !process_alive(pid)
        {
            tracing::warn!(pid, path = %path.display(), "removing stale lock");
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
            match Self::create(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let holder = match lock_owner(&path) {
            Some(pid) => format!("process {pid}"),
            None => "another run".to_string(),
        };
        Err(Error::Storage(format!(
            "{holder} holds {}; wait for it or remove the file if it is stale",
            path.display()
        )))
    }

    fn create(path: &Path) -> std::io::Result<()> {
        let mut file =
            OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())
    }
}

fn lock_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `pid` is running. Assumed alive when `/proc` is unavailable.
fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if pid == std::process::id() || !proc_root.join("self").exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
