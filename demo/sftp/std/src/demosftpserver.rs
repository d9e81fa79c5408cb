use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use sunset_sftp::backend::{compose_path, normalize_path};
use sunset_sftp::{
    Attrs, BackendFile, FileTime, FsError, FsResult, OpenOptions, RenameFlags, SftpBackend,
    StatusCode,
};

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

/// Serves a local directory. Client paths are resolved lexically below
/// `root`, symlinks inside it are followed by the OS.
pub struct DemoFs {
    root: PathBuf,
}

impl DemoFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn local(&self, path: &str) -> PathBuf {
        let p = Self::virtual_path(path);
        self.root.join(p.trim_start_matches('/'))
    }

    /// Client paths are relative to `/`
    fn virtual_path(path: &str) -> String {
        normalize_path(&compose_path("/", [path]))
    }
}

fn meta_attrs(m: &std::fs::Metadata) -> Attrs {
    let mut b = Attrs::builder()
        .size(m.len())
        .allocation_size(m.blocks() * 512)
        .uid_gid(m.uid(), m.gid())
        .permissions(m.mode())
        .link_count(m.nlink() as u32)
        .ctime(FileTime::with_nanos(m.ctime(), m.ctime_nsec() as u32));
    if let Ok(t) = m.accessed() {
        b = b.atime(t.into());
    }
    if let Ok(t) = m.modified() {
        b = b.mtime(t.into());
    }
    if let Ok(t) = m.created() {
        b = b.createtime(t.into());
    }
    b.build()
}

pub struct DemoFile {
    file: fs::File,
}

#[async_trait]
impl BackendFile for DemoFile {
    async fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.file.seek(std::io::SeekFrom::Start(pos)).await?;
        Ok(())
    }

    async fn read(&mut self, len: u32) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        let n = self.file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn len(&mut self) -> FsResult<u64> {
        Ok(self.file.metadata().await?.len())
    }

    async fn stat(&mut self) -> FsResult<Attrs> {
        Ok(meta_attrs(&self.file.metadata().await?))
    }

    async fn set_stat(&mut self, attrs: &Attrs) -> FsResult<()> {
        if let Some(size) = attrs.size {
            self.file.set_len(size).await?;
        }
        if let Some(perm) = attrs.permissions {
            self.file.set_permissions(std::fs::Permissions::from_mode(perm & 0o7777)).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        self.file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl SftpBackend for DemoFs {
    type File = DemoFile;

    async fn open(&self, path: &str, opts: &OpenOptions, attrs: &Attrs) -> FsResult<DemoFile> {
        let local = self.local(path);
        debug!("open {local:?} {opts:?}");
        let mut o = fs::OpenOptions::new();
        o.read(opts.read)
            .write(opts.write || opts.append)
            .append(opts.append)
            .truncate(opts.truncate);
        if opts.exclusive {
            o.create_new(true);
        } else {
            o.create(opts.create);
        }
        if let Some(perm) = attrs.permissions {
            o.mode(perm & 0o7777);
        }
        let file = o.open(&local).await?;
        if file.metadata().await?.is_dir() {
            return Err(FsError::new(StatusCode::SSH_FX_FILE_IS_A_DIRECTORY));
        }
        Ok(DemoFile { file })
    }

    async fn list_dir(&self, path: &str) -> FsResult<Vec<String>> {
        let mut rd = fs::read_dir(self.local(path)).await?;
        let mut names = vec![];
        while let Some(e) = rd.next_entry().await? {
            match e.file_name().into_string() {
                Ok(n) => names.push(n),
                Err(n) => warn!("Skipping non-UTF8 name {n:?}"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, path: &str, follow: bool) -> FsResult<Attrs> {
        let local = self.local(path);
        let m = if follow {
            fs::metadata(local).await?
        } else {
            fs::symlink_metadata(local).await?
        };
        Ok(meta_attrs(&m))
    }

    async fn set_stat(&self, path: &str, attrs: &Attrs) -> FsResult<()> {
        let local = self.local(path);
        if let Some(size) = attrs.size {
            let f = fs::OpenOptions::new().write(true).open(&local).await?;
            f.set_len(size).await?;
        }
        if let Some(perm) = attrs.permissions {
            fs::set_permissions(&local, std::fs::Permissions::from_mode(perm & 0o7777)).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str, attrs: &Attrs) -> FsResult<()> {
        let local = self.local(path);
        fs::create_dir(&local).await?;
        if let Some(perm) = attrs.permissions {
            fs::set_permissions(&local, std::fs::Permissions::from_mode(perm & 0o7777)).await?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        Ok(fs::remove_dir(self.local(path)).await?)
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        Ok(fs::remove_file(self.local(path)).await?)
    }

    async fn rename(&self, old: &str, new: &str, flags: RenameFlags) -> FsResult<()> {
        let new = self.local(new);
        // std rename always replaces
        if !flags.overwrite && fs::symlink_metadata(&new).await.is_ok() {
            return Err(FsError::new(StatusCode::SSH_FX_FILE_ALREADY_EXISTS));
        }
        Ok(fs::rename(self.local(old), new).await?)
    }

    async fn read_link(&self, path: &str) -> FsResult<String> {
        let target = fs::read_link(self.local(path)).await?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| FsError::with_msg(StatusCode::SSH_FX_FAILURE, "Non-UTF8 link target"))
    }

    async fn symlink(&self, link_path: &str, target: &str) -> FsResult<()> {
        Ok(fs::symlink(target, self.local(link_path)).await?)
    }

    async fn link(&self, new_link: &str, existing: &str, symlink: bool) -> FsResult<()> {
        if symlink {
            self.symlink(new_link, existing).await
        } else {
            Ok(fs::hard_link(self.local(existing), self.local(new_link)).await?)
        }
    }

    async fn real_path(&self, path: &str) -> FsResult<String> {
        Ok(Self::virtual_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confined() {
        let fs = DemoFs::new("/srv/files");
        assert_eq!(fs.local("../../etc/passwd"), PathBuf::from("/srv/files/etc/passwd"));
        assert_eq!(fs.local("/a/./b"), PathBuf::from("/srv/files/a/b"));
        assert_eq!(fs.local("."), PathBuf::from("/srv/files/"));
    }
}
