//! C-ABI surface for host filesystem extensions.
//!
//! Every function takes an opaque handle created by [`agentfs_open`] and
//! returns an [`AgentFsResult`] carrying a success flag and, on failure,
//! the stable errno for the error kind. Buffers and strings handed out to
//! the caller are owned allocations released through
//! [`agentfs_free_buffer`] / [`agentfs_free_string`]; nothing returned
//! borrows into the filesystem.

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use crate::config::MountConfig;
use crate::error::FsError;
use crate::overlay::AgentFs;

/// Status returned by every call.
#[repr(C)]
pub struct AgentFsResult {
    pub success: bool,
    pub error_code: i32,
}

impl AgentFsResult {
    fn ok() -> Self {
        AgentFsResult {
            success: true,
            error_code: 0,
        }
    }

    fn err(e: &FsError) -> Self {
        AgentFsResult {
            success: false,
            error_code: e.errno(),
        }
    }

    fn einval() -> Self {
        AgentFsResult {
            success: false,
            error_code: libc::EINVAL,
        }
    }
}

/// `stat`-style attributes marshalled across the ABI.
#[repr(C)]
pub struct AgentFsStat {
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[repr(C)]
pub struct AgentFsStatFs {
    pub bytes_used: u64,
    pub inodes: u64,
}

/// Borrow a UTF-8 string argument, or bail with EINVAL.
///
/// # Safety
/// `ptr` must be null or a valid NUL-terminated C string.
unsafe fn utf8_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Open a filesystem from a JSON [`MountConfig`] and return an owned
/// handle, or null when the config is invalid or the mount is refused.
///
/// # Safety
/// `config_json` must be a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn agentfs_open(config_json: *const c_char) -> *mut AgentFs {
    let Some(config_json) = utf8_arg(config_json) else {
        return ptr::null_mut();
    };
    let Ok(config) = serde_json::from_str::<MountConfig>(config_json) else {
        return ptr::null_mut();
    };
    match AgentFs::open(&config) {
        Ok(fs) => Box::into_raw(Box::new(fs)),
        Err(e) => {
            tracing::warn!("open failed: {e}");
            ptr::null_mut()
        }
    }
}

/// Release a handle returned by [`agentfs_open`].
///
/// # Safety
/// `fs` must be null or a handle previously returned by [`agentfs_open`]
/// that has not been closed yet.
#[no_mangle]
pub unsafe extern "C" fn agentfs_close(fs: *mut AgentFs) {
    if !fs.is_null() {
        drop(Box::from_raw(fs));
    }
}

unsafe fn with_fs<F>(fs: *const AgentFs, f: F) -> AgentFsResult
where
    F: FnOnce(&AgentFs) -> crate::Result<()>,
{
    let Some(fs) = fs.as_ref() else {
        return AgentFsResult::einval();
    };
    match f(fs) {
        Ok(()) => AgentFsResult::ok(),
        Err(e) => AgentFsResult::err(&e),
    }
}

fn fill_stat(out: &mut AgentFsStat, stat: &crate::FileStat) {
    out.ino = stat.ino;
    out.mode = stat.mode;
    out.uid = stat.uid;
    out.gid = stat.gid;
    out.nlink = stat.nlink;
    out.size = stat.size;
    out.atime = stat.atime;
    out.mtime = stat.mtime;
    out.ctime = stat.ctime;
}

/// # Safety
/// `fs` must be a live handle; `path` a valid C string; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn agentfs_stat(
    fs: *const AgentFs,
    path: *const c_char,
    out: *mut AgentFsStat,
) -> AgentFsResult {
    let (Some(path), Some(out)) = (utf8_arg(path), out.as_mut()) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| {
        let stat = fs.stat(path)?;
        fill_stat(out, &stat);
        Ok(())
    })
}

/// # Safety
/// `fs` must be a live handle; `path` a valid C string; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn agentfs_lstat(
    fs: *const AgentFs,
    path: *const c_char,
    out: *mut AgentFsStat,
) -> AgentFsResult {
    let (Some(path), Some(out)) = (utf8_arg(path), out.as_mut()) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| {
        let stat = fs.lstat(path)?;
        fill_stat(out, &stat);
        Ok(())
    })
}

/// Read up to `len` bytes at `offset` into a freshly-owned buffer. The
/// buffer (possibly shorter than `len` at EOF) is released with
/// [`agentfs_free_buffer`].
///
/// # Safety
/// `fs` must be a live handle; `path` a valid C string; `out_buf` and
/// `out_len` writable.
#[no_mangle]
pub unsafe extern "C" fn agentfs_pread(
    fs: *const AgentFs,
    path: *const c_char,
    offset: u64,
    len: u64,
    out_buf: *mut *mut u8,
    out_len: *mut u64,
) -> AgentFsResult {
    let (Some(path), false, false) = (utf8_arg(path), out_buf.is_null(), out_len.is_null()) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| {
        let data = fs.read(path, offset, len)?;
        let boxed = data.into_boxed_slice();
        *out_len = boxed.len() as u64;
        *out_buf = Box::into_raw(boxed) as *mut u8;
        Ok(())
    })
}

/// Release a buffer returned by [`agentfs_pread`].
///
/// # Safety
/// `(buf, len)` must be exactly a pair returned by [`agentfs_pread`] that
/// has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn agentfs_free_buffer(buf: *mut u8, len: u64) {
    if !buf.is_null() {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            buf,
            len as usize,
        )));
    }
}

/// # Safety
/// `fs` must be a live handle; `path` a valid C string; `data` must point
/// at `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn agentfs_pwrite(
    fs: *const AgentFs,
    path: *const c_char,
    offset: u64,
    data: *const u8,
    len: u64,
) -> AgentFsResult {
    let Some(path) = utf8_arg(path) else {
        return AgentFsResult::einval();
    };
    if data.is_null() && len > 0 {
        return AgentFsResult::einval();
    }
    let data = if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, len as usize)
    };
    with_fs(fs, |fs| fs.write(path, offset, data).map(|_| ()))
}

/// # Safety
/// `fs` must be a live handle; `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn agentfs_truncate(
    fs: *const AgentFs,
    path: *const c_char,
    size: u64,
) -> AgentFsResult {
    let Some(path) = utf8_arg(path) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.truncate(path, size))
}

/// # Safety
/// `fs` must be a live handle; `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn agentfs_mkdir(
    fs: *const AgentFs,
    path: *const c_char,
    mode: u32,
) -> AgentFsResult {
    let Some(path) = utf8_arg(path) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.mkdir(path, mode).map(|_| ()))
}

/// Kind-dispatching removal: directories must be empty.
///
/// # Safety
/// `fs` must be a live handle; `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn agentfs_remove(
    fs: *const AgentFs,
    path: *const c_char,
) -> AgentFsResult {
    let Some(path) = utf8_arg(path) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.remove(path))
}

/// # Safety
/// `fs` must be a live handle; `src` and `dst` valid C strings.
#[no_mangle]
pub unsafe extern "C" fn agentfs_rename(
    fs: *const AgentFs,
    src: *const c_char,
    dst: *const c_char,
) -> AgentFsResult {
    let (Some(src), Some(dst)) = (utf8_arg(src), utf8_arg(dst)) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.rename(src, dst))
}

/// # Safety
/// `fs` must be a live handle; `target` and `linkpath` valid C strings.
#[no_mangle]
pub unsafe extern "C" fn agentfs_symlink(
    fs: *const AgentFs,
    target: *const c_char,
    linkpath: *const c_char,
) -> AgentFsResult {
    let (Some(target), Some(linkpath)) = (utf8_arg(target), utf8_arg(linkpath)) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.symlink(target, linkpath).map(|_| ()))
}

/// Return the symlink target as an owned C string, released with
/// [`agentfs_free_string`].
///
/// # Safety
/// `fs` must be a live handle; `path` a valid C string; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn agentfs_readlink(
    fs: *const AgentFs,
    path: *const c_char,
    out: *mut *mut c_char,
) -> AgentFsResult {
    let (Some(path), false) = (utf8_arg(path), out.is_null()) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| {
        let target = fs.readlink(path)?;
        let cstr = CString::new(target)
            .map_err(|_| FsError::InvalidArgument("target contains NUL".to_string()))?;
        *out = cstr.into_raw();
        Ok(())
    })
}

/// Directory listing as a JSON array of names in lexicographic order,
/// released with [`agentfs_free_string`]. Names only; attributes are a
/// `stat` away and deliberately not duplicated here.
///
/// # Safety
/// `fs` must be a live handle; `path` a valid C string; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn agentfs_readdir(
    fs: *const AgentFs,
    path: *const c_char,
    out_json_names: *mut *mut c_char,
) -> AgentFsResult {
    let (Some(path), false) = (utf8_arg(path), out_json_names.is_null()) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| {
        let entries = fs.readdir(path)?;
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        let json = serde_json::to_string(&names)
            .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let cstr = CString::new(json)
            .map_err(|_| FsError::InvalidArgument("name contains NUL".to_string()))?;
        *out_json_names = cstr.into_raw();
        Ok(())
    })
}

/// Release a string returned by [`agentfs_readlink`] or
/// [`agentfs_readdir`].
///
/// # Safety
/// `s` must be null or a string previously returned by this library that
/// has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn agentfs_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// # Safety
/// `fs` must be a live handle; `path` and `name` valid C strings; `value`
/// must point at `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn agentfs_setxattr(
    fs: *const AgentFs,
    path: *const c_char,
    name: *const c_char,
    value: *const u8,
    len: u64,
) -> AgentFsResult {
    let (Some(path), Some(name)) = (utf8_arg(path), utf8_arg(name)) else {
        return AgentFsResult::einval();
    };
    if value.is_null() && len > 0 {
        return AgentFsResult::einval();
    }
    let value = if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(value, len as usize)
    };
    with_fs(fs, |fs| fs.setxattr(path, name, value))
}

/// # Safety
/// `fs` must be a live handle; `path` and `name` valid C strings.
#[no_mangle]
pub unsafe extern "C" fn agentfs_removexattr(
    fs: *const AgentFs,
    path: *const c_char,
    name: *const c_char,
) -> AgentFsResult {
    let (Some(path), Some(name)) = (utf8_arg(path), utf8_arg(name)) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.removexattr(path, name))
}

/// # Safety
/// `fs` must be a live handle; `path` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn agentfs_fsync(
    fs: *const AgentFs,
    path: *const c_char,
) -> AgentFsResult {
    let Some(path) = utf8_arg(path) else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| fs.fsync(path))
}

/// # Safety
/// `fs` must be a live handle; `out` writable.
#[no_mangle]
pub unsafe extern "C" fn agentfs_statfs(
    fs: *const AgentFs,
    out: *mut AgentFsStatFs,
) -> AgentFsResult {
    let Some(out) = out.as_mut() else {
        return AgentFsResult::einval();
    };
    with_fs(fs, |fs| {
        let stats = fs.statfs()?;
        out.bytes_used = stats.bytes_used;
        out.inodes = stats.inodes;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn open_memory() -> *mut AgentFs {
        let config = CString::new(r#"{"path": ":memory:"}"#).unwrap();
        unsafe { agentfs_open(config.as_ptr()) }
    }

    #[test]
    fn test_open_write_read_close() {
        let fs = open_memory();
        assert!(!fs.is_null());
        let path = CString::new("/hello.txt").unwrap();

        unsafe {
            let payload = b"hi there";
            // Implicit creation is not part of pwrite; create via mkdir-less
            // write_file through the safe API first.
            (*fs).write_file("/hello.txt", payload).unwrap();

            let mut buf: *mut u8 = ptr::null_mut();
            let mut len: u64 = 0;
            let result = agentfs_pread(fs, path.as_ptr(), 0, 64, &mut buf, &mut len);
            assert!(result.success);
            assert_eq!(std::slice::from_raw_parts(buf, len as usize), payload);
            agentfs_free_buffer(buf, len);

            let mut stat = std::mem::zeroed::<AgentFsStat>();
            let result = agentfs_stat(fs, path.as_ptr(), &mut stat);
            assert!(result.success);
            assert_eq!(stat.size, payload.len() as u64);

            agentfs_close(fs);
        }
    }

    #[test]
    fn test_missing_path_maps_to_enoent() {
        let fs = open_memory();
        let path = CString::new("/nope").unwrap();
        unsafe {
            let mut stat = std::mem::zeroed::<AgentFsStat>();
            let result = agentfs_stat(fs, path.as_ptr(), &mut stat);
            assert!(!result.success);
            assert_eq!(result.error_code, libc::ENOENT);
            agentfs_close(fs);
        }
    }

    #[test]
    fn test_readdir_returns_sorted_json_names() {
        let fs = open_memory();
        unsafe {
            (*fs).mkdir("/b", 0o755).unwrap();
            (*fs).write_file("/a", b"x").unwrap();

            let path = CString::new("/").unwrap();
            let mut out: *mut c_char = ptr::null_mut();
            let result = agentfs_readdir(fs, path.as_ptr(), &mut out);
            assert!(result.success);
            let json = CStr::from_ptr(out).to_str().unwrap();
            let names: Vec<String> = serde_json::from_str(json).unwrap();
            assert_eq!(names, vec!["a", "b"]);
            agentfs_free_string(out);
            agentfs_close(fs);
        }
    }

    #[test]
    fn test_null_arguments_are_einval() {
        unsafe {
            let result = agentfs_stat(ptr::null(), ptr::null(), ptr::null_mut());
            assert!(!result.success);
            assert_eq!(result.error_code, libc::EINVAL);
        }
    }
}
