//! On-disk hand-off of a container's delegates from ADD to DEL.
//!
//! ADD and DEL run as unrelated processes, so the file `<dir>/<containerID>`
//! is the only thing that carries the delegate list across. Its presence is
//! also the token that decides which of several concurrent DELs does the work.

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, fsync, mkdir, write};
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::config::{check_delegates, Delegate};
use crate::error::{MultusError, Result};

/// Persists delegate sets under a single directory
#[derive(Debug, Clone)]
pub struct DelegateStore {
    dir: PathBuf,
}

impl DelegateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `container_id`'s delegates
    pub fn path_for(&self, container_id: &str) -> Result<PathBuf> {
        validate_container_id(container_id)?;
        Ok(self.dir.join(container_id))
    }

    /// Serialize `delegates` and write them owner-only under `container_id`.
    ///
    /// The file is written to a private temporary name first and renamed into
    /// place, so a reader never observes a partial set.
    pub fn save(&self, container_id: &str, delegates: &[Delegate]) -> Result<()> {
        let path = self.path_for(container_id)?;
        let data = serde_json::to_vec(delegates).map_err(|e| {
            MultusError::persistence(
                "failed to serialize delegates",
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;

        self.ensure_dir()?;

        let tmp = self.claim_path(container_id, "tmp");
        write_owner_only(&tmp, &data).map_err(|e| {
            MultusError::persistence(format!("failed to write {}", tmp.display()), e)
        })?;

        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(MultusError::persistence(
                format!("failed to store delegates at {}", path.display()),
                e,
            ));
        }

        debug!("Saved {} delegates to {}", delegates.len(), path.display());
        Ok(())
    }

    /// Read the stored bytes for `container_id` and remove the file.
    ///
    /// The file is first renamed to a unique claim name. Rename is atomic, so
    /// when several callers race exactly one gets the bytes and the rest see a
    /// NotFound persistence error.
    pub fn consume_and_remove(&self, container_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(container_id)?;
        let claim = self.claim_path(container_id, "consumed");

        fs::rename(&path, &claim).map_err(|e| {
            MultusError::persistence(format!("failed to read {}", path.display()), e)
        })?;

        let data = fs::read(&claim);
        let removed = fs::remove_file(&claim);

        let data = data.map_err(|e| {
            MultusError::persistence(format!("failed to read {}", claim.display()), e)
        })?;
        removed.map_err(|e| {
            MultusError::persistence(format!("failed to remove {}", claim.display()), e)
        })?;

        debug!("Consumed delegates stored at {}", path.display());
        Ok(data)
    }

    /// Consume the stored set and decode it back into delegates
    pub fn load(&self, container_id: &str) -> Result<Vec<Delegate>> {
        let data = self.consume_and_remove(container_id)?;

        let raw: Vec<serde_json::Value> = serde_json::from_slice(&data).map_err(|e| {
            MultusError::persistence(
                format!("corrupt delegate set for {}", container_id),
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;

        check_delegates(raw)
    }

    fn claim_path(&self, container_id: &str, suffix: &str) -> PathBuf {
        self.dir
            .join(format!(".{}.{}.{}", container_id, Uuid::new_v4().simple(), suffix))
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                MultusError::persistence(format!("failed to create {}", parent.display()), e)
            })?;
        }

        match mkdir(self.dir.as_path(), Mode::S_IRWXU) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(errno) => Err(MultusError::persistence(
                format!("failed to create {}", self.dir.display()),
                io::Error::from(errno),
            )),
        }
    }
}

/// Reject IDs that would escape the storage directory
fn validate_container_id(container_id: &str) -> Result<()> {
    if container_id.is_empty()
        || container_id == "."
        || container_id == ".."
        || container_id.contains('/')
        || container_id.contains('\0')
    {
        return Err(MultusError::config(format!(
            "invalid container ID {:?}",
            container_id
        )));
    }
    Ok(())
}

fn write_owner_only(path: &Path, data: &[u8]) -> io::Result<()> {
    let fd = open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )?;

    let result = write_all(fd, data).and_then(|()| fsync(fd).map_err(io::Error::from));
    close(fd)?;

    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    result
}

fn write_all(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match write(fd, data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn delegates() -> Vec<Delegate> {
        let mut sriov = Delegate::new("sriov", None);
        sriov
            .extra
            .insert("if0".to_string(), serde_json::json!("enp1s0"));
        vec![Delegate::new("flannel", Some(true)), sriov]
    }

    #[test]
    fn test_save_then_consume_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(tmp.path().join("multus"));

        store.save("abc123", &delegates()).unwrap();
        let bytes = store.consume_and_remove("abc123").unwrap();
        let decoded: Vec<Delegate> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, delegates());

        let err = store.consume_and_remove("abc123").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_owner_only_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(tmp.path().join("multus"));
        store.save("abc123", &delegates()).unwrap();

        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = fs::metadata(store.path_for("abc123").unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn test_no_stray_files_left() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(tmp.path());

        store.save("abc123", &delegates()).unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);

        store.load("abc123").unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_resave_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(tmp.path());

        store.save("abc123", &delegates()).unwrap();
        store.save("abc123", &delegates()[..1]).unwrap();
        assert_eq!(store.load("abc123").unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_container_ids() {
        let store = DelegateStore::new("/nonexistent");
        for id in ["", ".", "..", "../etc/passwd", "a/b"] {
            let err = store.save(id, &delegates()).unwrap_err();
            assert!(matches!(err, MultusError::Config(_)), "{:?}", id);
        }
    }

    #[test]
    fn test_corrupt_set() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DelegateStore::new(tmp.path());
        fs::write(tmp.path().join("abc123"), b"not json").unwrap();

        let err = store.load("abc123").unwrap_err();
        assert!(matches!(err, MultusError::Persistence { .. }));
        assert!(!err.is_not_found());
    }
}
