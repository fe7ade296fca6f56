//! Temp-file lifecycle for downloads.
//!
//! Preallocates the body file (posix_fallocate on unix when available, else
//! set_len), supports concurrent offset writes from the IO workers, and
//! renames into place once every segment has landed.

use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writer over a preallocated temp file. Clones share one descriptor; each
/// `write_at` is independent (pwrite-style), so segment writers never race
/// on a cursor.
#[derive(Clone)]
pub struct PreallocatedFile {
    file: Arc<File>,
    path: PathBuf,
}

impl PreallocatedFile {
    /// Creates (truncating) and preallocates `size` bytes at `path`.
    pub fn create(path: &Path, size: u64) -> io::Result<Self> {
        // Recreate from scratch to dodge stale-permission leftovers.
        let _ = std::fs::remove_file(path);
        let mut opts = File::options();
        opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let file = opts.open(path)?;
        preallocate(&file, size)?;
        Ok(Self { file: Arc::new(file), path: path.to_path_buf() })
    }

    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let n = self.file.write_at(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "zero-length write"));
            }
            written += n;
        }
        Ok(())
    }

    /// Seek-and-write fallback; not safe for concurrent use.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = self.file.try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn preallocate(file: &File, size: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        let r = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size)
}

/// Sets a file's modification (and access) time to `mtime` seconds.
#[cfg(unix)]
pub fn apply_mtime(path: &Path, mtime: i64) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let times = [
        libc::timeval { tv_sec: mtime as libc::time_t, tv_usec: 0 },
        libc::timeval { tv_sec: mtime as libc::time_t, tv_usec: 0 },
    ];
    let r = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_mtime(_path: &Path, _mtime: i64) -> io::Result<()> {
    Ok(())
}

/// Sets a file's permission bits.
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Modification time of a local file in whole seconds.
pub fn local_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Permission bits of a local file.
#[cfg(unix)]
pub fn local_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn local_mode(_meta: &std::fs::Metadata) -> u32 {
    0o664
}
