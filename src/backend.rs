//! The filesystem a server exposes.
//!
//! [`SftpBackend`] is implemented by the application. The server only
//! ever passes it normalised requests: open flags from any protocol
//! version become an [`OpenOptions`], rename flags a [`RenameFlags`].

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use async_trait::async_trait;
use snafu::prelude::*;

use crate::attrs::Attrs;
use crate::proto::*;

#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum FsError {
    /// A failure with an explicit SFTP status
    #[snafu(display("{code:?}: {msg}"))]
    Fs { code: StatusCode, msg: String },

    #[snafu(display("{source}"))]
    Io { source: std::io::Error },
}

pub type FsResult<T> = core::result::Result<T, FsError>;

impl FsError {
    pub fn new(code: StatusCode) -> Self {
        FsError::Fs { code, msg: code.message().into() }
    }

    pub fn with_msg(code: StatusCode, msg: impl Into<String>) -> Self {
        FsError::Fs { code, msg: msg.into() }
    }

    pub fn unsupported() -> Self {
        Self::new(StatusCode::SSH_FX_OP_UNSUPPORTED)
    }

    /// The status to report. Codes newer than the peer's version are
    /// downgraded when the status is sent.
    pub fn status_code(&self) -> StatusCode {
        use std::io::ErrorKind::*;
        match self {
            FsError::Fs { code, .. } => *code,
            FsError::Io { source } => match source.kind() {
                NotFound => StatusCode::SSH_FX_NO_SUCH_FILE,
                PermissionDenied => StatusCode::SSH_FX_PERMISSION_DENIED,
                AlreadyExists => StatusCode::SSH_FX_FILE_ALREADY_EXISTS,
                NotADirectory => StatusCode::SSH_FX_NOT_A_DIRECTORY,
                IsADirectory => StatusCode::SSH_FX_FILE_IS_A_DIRECTORY,
                DirectoryNotEmpty => StatusCode::SSH_FX_DIR_NOT_EMPTY,
                ReadOnlyFilesystem => StatusCode::SSH_FX_WRITE_PROTECT,
                StorageFull => StatusCode::SSH_FX_NO_SPACE_ON_FILESYSTEM,
                InvalidInput => StatusCode::SSH_FX_INVALID_PARAMETER,
                Unsupported => StatusCode::SSH_FX_OP_UNSUPPORTED,
                _ => StatusCode::SSH_FX_FAILURE,
            },
        }
    }

    pub fn message(&self) -> String {
        match self {
            FsError::Fs { msg, .. } => msg.clone(),
            FsError::Io { source } => source.to_string(),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(source: std::io::Error) -> Self {
        FsError::Io { source }
    }
}

impl From<StatusCode> for FsError {
    fn from(code: StatusCode) -> Self {
        FsError::new(code)
    }
}

/// How a file is opened, independent of protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    /// Every write goes to the end of the file, ignoring its offset.
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    /// Fail if the file exists
    pub exclusive: bool,
    pub text: bool,
}

impl OpenOptions {
    /// Normalises the version specific open flags.
    pub fn from_request(open: &Open, version: u32) -> FsResult<Self> {
        let f = open.pflags;
        if version <= 4 {
            return Ok(OpenOptions {
                read: f & SSH_FXF_READ != 0,
                write: f & SSH_FXF_WRITE != 0,
                append: f & SSH_FXF_APPEND != 0,
                create: f & SSH_FXF_CREAT != 0,
                truncate: f & SSH_FXF_TRUNC != 0,
                exclusive: f & SSH_FXF_EXCL != 0,
                text: f & SSH_FXF_TEXT != 0,
            });
        }

        let access = open.desired_access.unwrap_or(0);
        let (create, truncate, exclusive) = match f & SSH_FXF_ACCESS_DISPOSITION {
            SSH_FXF_CREATE_NEW => (true, false, true),
            SSH_FXF_CREATE_TRUNCATE => (true, true, false),
            SSH_FXF_OPEN_EXISTING => (false, false, false),
            SSH_FXF_OPEN_OR_CREATE => (true, false, false),
            SSH_FXF_TRUNCATE_EXISTING => (false, true, false),
            d => {
                debug!("Bad open disposition {d}");
                return Err(FsError::with_msg(
                    StatusCode::SSH_FX_INVALID_PARAMETER,
                    "Bad disposition",
                ));
            }
        };
        Ok(OpenOptions {
            read: access & ACE4_READ_DATA != 0,
            write: access & (ACE4_WRITE_DATA | ACE4_APPEND_DATA) != 0,
            append: f & (SSH_FXF_APPEND_DATA | SSH_FXF_APPEND_DATA_ATOMIC) != 0,
            create,
            truncate,
            exclusive,
            text: f & SSH_FXF_TEXT_MODE != 0,
        })
    }

    pub fn read() -> Self {
        OpenOptions { read: true, ..Default::default() }
    }

    /// Write, creating or truncating
    pub fn write() -> Self {
        OpenOptions { write: true, create: true, truncate: true, ..Default::default() }
    }

    /// Encodes as open request flags for `version`, returning
    /// `(desired_access, pflags)`.
    pub fn to_request(&self, version: u32) -> (Option<u32>, u32) {
        if version <= 4 {
            let mut f = 0;
            for (b, v) in [
                (self.read, SSH_FXF_READ),
                (self.write, SSH_FXF_WRITE),
                (self.append, SSH_FXF_APPEND),
                (self.create, SSH_FXF_CREAT),
                (self.truncate, SSH_FXF_TRUNC),
                (self.exclusive, SSH_FXF_EXCL),
                (self.text, SSH_FXF_TEXT),
            ] {
                if b {
                    f |= v
                }
            }
            return (None, f);
        }

        let mut access = 0;
        if self.read {
            access |= ACE4_READ_DATA
        }
        if self.write {
            access |= ACE4_WRITE_DATA
        }
        if self.append {
            access |= ACE4_APPEND_DATA
        }
        let mut f = match (self.create, self.truncate, self.exclusive) {
            (true, _, true) => SSH_FXF_CREATE_NEW,
            (true, true, false) => SSH_FXF_CREATE_TRUNCATE,
            (true, false, false) => SSH_FXF_OPEN_OR_CREATE,
            (false, true, _) => SSH_FXF_TRUNCATE_EXISTING,
            (false, false, _) => SSH_FXF_OPEN_EXISTING,
        };
        if self.append {
            f |= SSH_FXF_APPEND_DATA
        }
        if self.text {
            f |= SSH_FXF_TEXT_MODE
        }
        (Some(access), f)
    }
}

/// Rename behaviour. Versions 3 and 4 never overwrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenameFlags {
    pub overwrite: bool,
    pub atomic: bool,
    pub native: bool,
}

impl From<Option<u32>> for RenameFlags {
    fn from(f: Option<u32>) -> Self {
        let f = f.unwrap_or(0);
        RenameFlags {
            overwrite: f & SSH_FXF_RENAME_OVERWRITE != 0,
            atomic: f & SSH_FXF_RENAME_ATOMIC != 0,
            native: f & SSH_FXF_RENAME_NATIVE != 0,
        }
    }
}

impl RenameFlags {
    pub fn bits(&self) -> u32 {
        let mut f = 0;
        if self.overwrite {
            f |= SSH_FXF_RENAME_OVERWRITE
        }
        if self.atomic {
            f |= SSH_FXF_RENAME_ATOMIC
        }
        if self.native {
            f |= SSH_FXF_RENAME_NATIVE
        }
        f
    }
}

/// An open file.
///
/// The server tracks the file position and only seeks when a request's
/// offset differs from it.
#[async_trait]
pub trait BackendFile: Send + Sync + 'static {
    async fn seek(&mut self, pos: u64) -> FsResult<()>;

    /// Reads up to `len` bytes at the current position. An empty result
    /// is end of file.
    async fn read(&mut self, len: u32) -> FsResult<Vec<u8>>;

    /// Writes all of `data` at the current position.
    async fn write(&mut self, data: &[u8]) -> FsResult<()>;

    /// Current length, used for append writes.
    async fn len(&mut self) -> FsResult<u64>;

    async fn stat(&mut self) -> FsResult<Attrs>;

    async fn set_stat(&mut self, attrs: &Attrs) -> FsResult<()>;

    /// Byte range lock. The server records granted locks per handle, the
    /// default only records them.
    async fn lock(&mut self, _offset: u64, _length: u64, _mask: u32) -> FsResult<()> {
        Ok(())
    }

    async fn unlock(&mut self, _offset: u64, _length: u64) -> FsResult<()> {
        Ok(())
    }

    /// Called exactly once, when the client closes the handle or the
    /// session ends.
    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// Filesystem operations for a server session
///
/// Paths are as sent by the client, the implementation decides how they
/// are resolved and confined.
#[async_trait]
pub trait SftpBackend: Send + Sync + 'static {
    type File: BackendFile;

    async fn open(&self, path: &str, opts: &OpenOptions, attrs: &Attrs) -> FsResult<Self::File>;

    /// Entry names of a directory, read once when it is opened.
    async fn list_dir(&self, path: &str) -> FsResult<Vec<String>>;

    /// `follow` is false for `LSTAT`.
    async fn stat(&self, path: &str, follow: bool) -> FsResult<Attrs>;

    async fn set_stat(&self, path: &str, attrs: &Attrs) -> FsResult<()>;

    async fn mkdir(&self, path: &str, attrs: &Attrs) -> FsResult<()>;

    async fn rmdir(&self, path: &str) -> FsResult<()>;

    async fn remove(&self, path: &str) -> FsResult<()>;

    async fn rename(&self, old: &str, new: &str, flags: RenameFlags) -> FsResult<()>;

    async fn read_link(&self, path: &str) -> FsResult<String>;

    async fn symlink(&self, link_path: &str, target: &str) -> FsResult<()>;

    /// Version 6 `LINK`. Hard links are unsupported unless implemented.
    async fn link(&self, new_link: &str, existing: &str, symlink: bool) -> FsResult<()> {
        if symlink {
            self.symlink(new_link, existing).await
        } else {
            Err(FsError::unsupported())
        }
    }

    /// Canonical absolute form of `path`, which need not exist.
    async fn real_path(&self, path: &str) -> FsResult<String>;

    /// Vendor `EXTENDED` requests, returning the `EXTENDED_REPLY` data.
    async fn extended(&self, request: &str, _data: &[u8]) -> FsResult<Vec<u8>> {
        debug!("Unsupported extension {request}");
        Err(FsError::unsupported())
    }
}

/// Joins compose paths for version 6 `REALPATH`. An absolute part
/// replaces what came before.
pub fn compose_path<'a>(base: &str, parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut p = base.to_string();
    for part in parts {
        if part.starts_with('/') || p.is_empty() {
            p = part.to_string();
        } else {
            if !p.ends_with('/') {
                p.push('/');
            }
            p.push_str(part);
        }
    }
    p
}

/// Lexically normalises an absolute path, resolving `.` and `..`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = vec![];
    for c in path.split('/') {
        match c {
            "" | "." => (),
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(pflags: u32, access: Option<u32>) -> Open<'static> {
        Open { filename: "f".into(), desired_access: access, pflags, attrs: Attrs::default() }
    }

    #[test]
    fn v3_flags() {
        let o = OpenOptions::from_request(
            &open(SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC, None),
            3,
        )
        .unwrap();
        assert_eq!(o, OpenOptions::write());
        assert_eq!(o.to_request(3), (None, SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC));
    }

    #[test]
    fn v5_dispositions() {
        let o = OpenOptions::from_request(
            &open(SSH_FXF_CREATE_NEW | SSH_FXF_APPEND_DATA, Some(ACE4_WRITE_DATA)),
            5,
        )
        .unwrap();
        assert!(o.write && o.create && o.exclusive && o.append && !o.read);

        let o = OpenOptions::from_request(&open(SSH_FXF_OPEN_EXISTING, Some(ACE4_READ_DATA)), 6)
            .unwrap();
        assert_eq!(o, OpenOptions::read());

        let e = OpenOptions::from_request(&open(7, Some(ACE4_READ_DATA)), 5).unwrap_err();
        assert_eq!(e.status_code(), StatusCode::SSH_FX_INVALID_PARAMETER);
    }

    #[test]
    fn v5_request_roundtrip() {
        for o in [OpenOptions::read(), OpenOptions::write()] {
            let (access, f) = o.to_request(6);
            let back = OpenOptions::from_request(&open(f, access), 6).unwrap();
            assert_eq!(back, o);
        }
    }

    #[test]
    fn io_error_codes() {
        let e = FsError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(e.status_code(), StatusCode::SSH_FX_NO_SUCH_FILE);
        let e = FsError::from(std::io::Error::from(std::io::ErrorKind::DirectoryNotEmpty));
        assert_eq!(e.status_code(), StatusCode::SSH_FX_DIR_NOT_EMPTY);
    }

    #[test]
    fn paths() {
        assert_eq!(compose_path("/a", ["b", "c"]), "/a/b/c");
        assert_eq!(compose_path("/a", ["/x", "y"]), "/x/y");
        assert_eq!(normalize_path("/a/./b/../c/"), "/a/c");
        assert_eq!(normalize_path("/.."), "/");
    }
}
