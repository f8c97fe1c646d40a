//! Filesystem backend adapter
//!
//! Abstracts the features that differ between backing filesystems:
//! checkpoints, cloneable range copies, hole punching, whole-fs sync and
//! allocation hints. The adapter is a tagged variant with default fallback
//! paths: a buffered (or sparse) copy replaces reflink, writing zeros
//! replaces hole punching, and checkpoints are only offered by backends that
//! can take them.
//!
//! - [`Backend::Generic`]: any POSIX filesystem. No checkpoints; mounts with
//!   this backend write the `nosnap` marker and rely on journal replay alone.
//! - [`Backend::SnapDir`]: checkpoint-capable. Snapshots `current/` by
//!   recursive copy into a sibling directory, which keeps the
//!   checkpoint/rollback cycle exercised on filesystems without native
//!   snapshots. Selected for btrfs, or when forced by debug config.

use objectfs_common::{Error, Result};
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

const COPY_BUF: usize = 128 * 1024;

/// btrfs magic in `statfs.f_type`
const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;

#[cfg(target_os = "linux")]
#[repr(C)]
struct CloneRangeArg {
    src_fd: i64,
    src_offset: u64,
    src_length: u64,
    dest_offset: u64,
}

#[cfg(target_os = "linux")]
const FICLONERANGE: libc::c_ulong = 0x4020_940D;

/// Capability-tagged filesystem adapter
pub enum Backend {
    Generic(BackendShared),
    SnapDir(BackendShared),
}

/// State common to every backend variant
pub struct BackendShared {
    basedir: PathBuf,
    basedir_fd: File,
}

impl Backend {
    /// Detect the backing filesystem under `basedir` and build the matching
    /// adapter. `force_snapdir` selects the checkpoint-capable variant
    /// regardless of filesystem type.
    pub fn detect(basedir: &Path, force_snapdir: bool) -> Result<Self> {
        let basedir_fd = File::open(basedir)?;
        let f_type = statfs_type(&basedir_fd)?;
        let shared = BackendShared {
            basedir: basedir.to_path_buf(),
            basedir_fd,
        };
        if force_snapdir || f_type == BTRFS_SUPER_MAGIC {
            debug!(f_type, force_snapdir, "using snapdir backend");
            Ok(Self::SnapDir(shared))
        } else {
            debug!(f_type, "using generic backend");
            Ok(Self::Generic(shared))
        }
    }

    fn shared(&self) -> &BackendShared {
        match self {
            Self::Generic(s) | Self::SnapDir(s) => s,
        }
    }

    /// True when this backend can create and roll back checkpoints
    #[must_use]
    pub fn can_checkpoint(&self) -> bool {
        matches!(self, Self::SnapDir(_))
    }

    fn current_dir(&self) -> PathBuf {
        self.shared().basedir.join("current")
    }

    /// Create the `current/` directory if it does not exist
    pub fn create_current(&self) -> Result<()> {
        let cur = self.current_dir();
        match fs::create_dir(&cur) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List checkpoint names present under the base directory
    pub fn list_checkpoints(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.shared().basedir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != "current" {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Take a checkpoint of `current/` under `name`
    pub fn create_checkpoint(&self, name: &str) -> Result<()> {
        match self {
            Self::Generic(_) => Err(Error::NotSupported("checkpoints".into())),
            Self::SnapDir(s) => {
                let dst = s.basedir.join(name);
                if dst.exists() {
                    return Err(Error::Io(std::io::Error::from(
                        std::io::ErrorKind::AlreadyExists,
                    )));
                }
                let staging = s.basedir.join(format!(".{name}.tmp"));
                if staging.exists() {
                    fs::remove_dir_all(&staging)?;
                }
                copy_dir_recursive(&self.current_dir(), &staging)?;
                fs::rename(&staging, &dst)?;
                debug!(name, "created checkpoint");
                Ok(())
            }
        }
    }

    /// Wait for a checkpoint to reach stable storage
    pub fn sync_checkpoint(&self, _name: &str) -> Result<()> {
        match self {
            Self::Generic(_) => Err(Error::NotSupported("checkpoints".into())),
            Self::SnapDir(_) => self.syncfs(),
        }
    }

    /// Destroy a checkpoint
    pub fn destroy_checkpoint(&self, name: &str) -> Result<()> {
        match self {
            Self::Generic(_) => Err(Error::NotSupported("checkpoints".into())),
            Self::SnapDir(s) => {
                fs::remove_dir_all(s.basedir.join(name))?;
                Ok(())
            }
        }
    }

    /// Replace `current/` with the contents of checkpoint `name`
    pub fn rollback_to(&self, name: &str) -> Result<()> {
        match self {
            Self::Generic(_) => Err(Error::NotSupported("checkpoints".into())),
            Self::SnapDir(s) => {
                let cur = self.current_dir();
                let src = s.basedir.join(name);
                if !src.is_dir() {
                    return Err(Error::Io(std::io::Error::from(
                        std::io::ErrorKind::NotFound,
                    )));
                }
                if cur.exists() {
                    fs::remove_dir_all(&cur)?;
                }
                copy_dir_recursive(&src, &cur)?;
                self.syncfs()?;
                debug!(name, "rolled current/ back to checkpoint");
                Ok(())
            }
        }
    }

    /// Force every dirty buffer of the backing filesystem to stable storage
    pub fn syncfs(&self) -> Result<()> {
        let fd = self.shared().basedir_fd.as_raw_fd();
        #[cfg(target_os = "linux")]
        {
            if unsafe { libc::syncfs(fd) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            return Ok(());
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = fd;
            unsafe { libc::sync() };
            Ok(())
        }
    }

    /// Copy `len` bytes from `srcoff` in `from` to `dstoff` in `to`,
    /// preferring a reflink, then a sparse copy that skips holes, then a
    /// plain buffered copy.
    pub fn clone_range(
        &self,
        from: &File,
        to: &File,
        srcoff: u64,
        len: u64,
        dstoff: u64,
    ) -> Result<u64> {
        if len == 0 {
            return Ok(0);
        }
        #[cfg(target_os = "linux")]
        {
            if reflink_range(from, to, srcoff, len, dstoff).is_ok() {
                trace!(srcoff, len, dstoff, "clone_range via reflink");
                return Ok(len);
            }
        }
        match sparse_copy_range(from, to, srcoff, len, dstoff) {
            Ok(n) => Ok(n),
            Err(Error::NotSupported(_)) => copy_range(from, to, srcoff, len, dstoff),
            Err(e) => Err(e),
        }
    }

    /// Punch a hole; the caller falls back to writing zeros when the
    /// filesystem cannot.
    pub fn punch_hole(&self, file: &File, offset: u64, len: u64) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let r = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            };
            if r == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                return Err(Error::NotSupported("hole punch".into()));
            }
            return Err(err.into());
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (file, offset, len);
            Err(Error::NotSupported("hole punch".into()))
        }
    }

    /// Pass an expected-write-size hint to the filesystem. Advisory: errors
    /// other than I/O failures are swallowed by the caller.
    pub fn set_alloc_hint(&self, file: &File, hint: u64) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            if hint == 0 {
                return Ok(());
            }
            let r = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_KEEP_SIZE,
                    0,
                    hint as libc::off_t,
                )
            };
            if r == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EOPNOTSUPP) | Some(libc::EINVAL)) {
                return Err(Error::NotSupported("alloc hint".into()));
            }
            return Err(err.into());
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (file, hint);
            Err(Error::NotSupported("alloc hint".into()))
        }
    }
}

fn statfs_type(file: &File) -> Result<i64> {
    #[cfg(target_os = "linux")]
    {
        let mut st: libc::statfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstatfs(file.as_raw_fd(), &mut st) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(st.f_type as i64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = file;
        Ok(0)
    }
}

#[cfg(target_os = "linux")]
fn reflink_range(from: &File, to: &File, srcoff: u64, len: u64, dstoff: u64) -> Result<()> {
    let arg = CloneRangeArg {
        src_fd: i64::from(from.as_raw_fd()),
        src_offset: srcoff,
        src_length: len,
        dest_offset: dstoff,
    };
    let r = unsafe { libc::ioctl(to.as_raw_fd(), FICLONERANGE, &arg) };
    if r == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

/// Copy only the allocated extents of the source range, using
/// `SEEK_DATA`/`SEEK_HOLE` to skip holes. The destination is extended to
/// cover the full range so tail holes read back as zeros.
fn sparse_copy_range(from: &File, to: &File, srcoff: u64, len: u64, dstoff: u64) -> Result<u64> {
    #[cfg(target_os = "linux")]
    {
        let fd = from.as_raw_fd();
        let end = srcoff + len;
        let mut pos = srcoff;
        let mut written = 0u64;
        while pos < end {
            let data = unsafe { libc::lseek64(fd, pos as libc::off64_t, libc::SEEK_DATA) };
            if data < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ENXIO) => break, // only holes remain
                    Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => {
                        return Err(Error::NotSupported("seek-data".into()));
                    }
                    _ => return Err(err.into()),
                }
            }
            let data = data as u64;
            if data >= end {
                break;
            }
            let hole = unsafe { libc::lseek64(fd, data as libc::off64_t, libc::SEEK_HOLE) };
            if hole < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            let chunk_end = (hole as u64).min(end);
            written += copy_range(from, to, data, chunk_end - data, dstoff + (data - srcoff))?;
            pos = chunk_end;
        }
        // make sure the destination covers the whole range
        let dst_len = to.metadata()?.len();
        if dst_len < dstoff + len {
            to.set_len(dstoff + len)?;
        }
        Ok(written)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (from, to, srcoff, len, dstoff);
        Err(Error::NotSupported("seek-data".into()))
    }
}

/// Plain buffered copy of a byte range between two files
fn copy_range(from: &File, to: &File, srcoff: u64, len: u64, dstoff: u64) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF];
    let mut pos = 0u64;
    while pos < len {
        let want = ((len - pos) as usize).min(COPY_BUF);
        let got = from.read_at(&mut buf[..want], srcoff + pos)?;
        if got == 0 {
            return Err(Error::corrupt(format!(
                "short read copying range at {}",
                srcoff + pos
            )));
        }
        to.write_all_at(&buf[..got], dstoff + pos)?;
        pos += got as u64;
    }
    Ok(pos)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    copy_dir_attrs(src, dst);
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let to = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_recursive(&entry.path(), &to)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), &to)?;
            copy_file_attrs(&entry.path(), &to);
        }
        // symlinks are not part of the store layout
    }
    Ok(())
}

/// Checkpoints must preserve replay guards and inline attributes, which live
/// in xattrs that `fs::copy` does not carry over.
fn copy_file_attrs(src: &Path, dst: &Path) {
    let names = match xattr::list(src) {
        Ok(n) => n,
        Err(_) => return,
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(src, &name) {
            if let Err(e) = xattr::set(dst, &name, &value) {
                warn!(?name, error = %e, "checkpoint xattr copy failed");
            }
        }
    }
}

fn copy_dir_attrs(src: &Path, dst: &Path) {
    copy_file_attrs(src, dst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapdir(base: &Path) -> Backend {
        Backend::detect(base, true).unwrap()
    }

    #[test]
    fn test_generic_has_no_checkpoints() {
        let dir = tempdir().unwrap();
        let b = Backend::detect(dir.path(), false).unwrap();
        if !b.can_checkpoint() {
            assert!(matches!(
                b.create_checkpoint("snap_1"),
                Err(Error::NotSupported(_))
            ));
        }
    }

    #[test]
    fn test_snapdir_checkpoint_cycle() {
        let dir = tempdir().unwrap();
        let b = snapdir(dir.path());
        b.create_current().unwrap();
        fs::write(dir.path().join("current/a"), b"one").unwrap();

        b.create_checkpoint("snap_1").unwrap();
        fs::write(dir.path().join("current/a"), b"two").unwrap();
        fs::write(dir.path().join("current/b"), b"new").unwrap();

        assert_eq!(b.list_checkpoints().unwrap(), vec!["snap_1".to_string()]);
        b.rollback_to("snap_1").unwrap();
        assert_eq!(fs::read(dir.path().join("current/a")).unwrap(), b"one");
        assert!(!dir.path().join("current/b").exists());

        b.destroy_checkpoint("snap_1").unwrap();
        assert!(b.list_checkpoints().unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_preserves_xattrs() {
        let dir = tempdir().unwrap();
        let b = snapdir(dir.path());
        b.create_current().unwrap();
        let f = dir.path().join("current/obj");
        fs::write(&f, b"payload").unwrap();
        if xattr::set(&f, "user.test.guard", b"g1").is_err() {
            return; // filesystem without user xattrs
        }
        b.create_checkpoint("snap_2").unwrap();
        let copied = xattr::get(dir.path().join("snap_2/obj"), "user.test.guard").unwrap();
        assert_eq!(copied.as_deref(), Some(&b"g1"[..]));
    }

    #[test]
    fn test_clone_range_copies_bytes() {
        let dir = tempdir().unwrap();
        let b = Backend::detect(dir.path(), false).unwrap();
        let src_path = dir.path().join("src");
        let dst_path = dir.path().join("dst");
        fs::write(&src_path, b"0123456789abcdef").unwrap();
        let src = File::open(&src_path).unwrap();
        let dst = File::create(&dst_path).unwrap();

        b.clone_range(&src, &dst, 4, 8, 0).unwrap();
        assert_eq!(fs::read(&dst_path).unwrap(), b"456789ab");
    }

    #[test]
    fn test_clone_range_zero_len_is_noop() {
        let dir = tempdir().unwrap();
        let b = Backend::detect(dir.path(), false).unwrap();
        let src = File::create(dir.path().join("s")).unwrap();
        let dst = File::create(dir.path().join("d")).unwrap();
        assert_eq!(b.clone_range(&src, &dst, 0, 0, 0).unwrap(), 0);
    }
}
