//! Local-filesystem ESM backend: state in a JSON file, exclusion through an
//! OS-level file lock.
//!
//! The lock file carries JSON metadata about the holder so that contention
//! errors can say who is in the way. The lock is advisory on unix (flock)
//! and mandatory on windows (LockFileEx); either way it dies with the
//! process, so a crashed run never wedges the state.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::JsonMap;

use super::{EsmBackend, EsmConfig, EsmError, EsmGuard};

const LOCK_METADATA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct LockMetadata {
  version: u32,
  pid: u32,
  run_name: String,
  started_at_unix: u64,
}

/// Backend storing enforced state under the run's cache directory.
pub struct LocalBackend;

#[async_trait]
impl EsmBackend for LocalBackend {
  fn name(&self) -> &'static str {
    "local"
  }

  async fn enter(&self, config: &EsmConfig) -> Result<Box<dyn EsmGuard>, EsmError> {
    std::fs::create_dir_all(&config.cache_dir)?;

    let lock_path = config.cache_dir.join(format!("{}.lock", config.run_name));
    let state_path = config.cache_dir.join(format!("{}.state.json", config.run_name));

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(contention_error(config, &lock_path));
      }
      return Err(err.into());
    }

    write_lock_metadata(&file, config)?;
    debug!(run = %config.run_name, lock = %lock_path.display(), "acquired enforced-state lock");

    Ok(Box::new(LocalGuard {
      _lock: file,
      state_path,
    }))
  }
}

struct LocalGuard {
  // Held for its lock; releases on drop.
  _lock: File,
  state_path: PathBuf,
}

#[async_trait]
impl EsmGuard for LocalGuard {
  async fn get_state(&mut self) -> Result<Option<JsonMap>, EsmError> {
    match std::fs::read(&self.state_path) {
      Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn set_state(&mut self, state: &JsonMap) -> Result<(), EsmError> {
    let tmp = self.state_path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
    std::fs::rename(&tmp, &self.state_path)?;
    Ok(())
  }

  async fn exit(self: Box<Self>, had_error: bool) -> Result<(), EsmError> {
    debug!(state = %self.state_path.display(), had_error, "released enforced-state lock");
    Ok(())
  }
}

fn contention_error(config: &EsmConfig, lock_path: &std::path::Path) -> EsmError {
  let detail = match read_lock_metadata(lock_path) {
    Some(meta) => format!(
      "held by PID {} since unix timestamp {} (lock file: {})",
      meta.pid,
      meta.started_at_unix,
      lock_path.display()
    ),
    None => format!("lock file: {}", lock_path.display()),
  };
  EsmError::Locked {
    run_name: config.run_name.clone(),
    detail,
  }
}

fn read_lock_metadata(lock_path: &std::path::Path) -> Option<LockMetadata> {
  let mut contents = String::new();
  File::open(lock_path).ok()?.read_to_string(&mut contents).ok()?;
  serde_json::from_str(&contents).ok()
}

fn write_lock_metadata(file: &File, config: &EsmConfig) -> Result<(), EsmError> {
  let metadata = LockMetadata {
    version: LOCK_METADATA_VERSION,
    pid: std::process::id(),
    run_name: config.run_name.clone(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
  };

  file.set_len(0)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer_pretty(&mut writer, &metadata)?;
  io::Write::flush(&mut writer)?;
  Ok(())
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
