//! An in-memory filesystem backend for tests.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::attrs::{Attrs, FileTime, S_IFDIR, S_IFLNK, S_IFREG};
use crate::backend::*;
use crate::proto::StatusCode;

const MTIME: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

type Tree = BTreeMap<String, Node>;

#[derive(Default)]
struct Counters {
    seeks: AtomicUsize,
    closes: AtomicUsize,
    /// Largest read a file returns, emulating servers that send short
    /// reads
    read_limit: AtomicU32,
    reads: AtomicUsize,
    /// Reads after this many return half of what was asked
    short_after: AtomicUsize,
}

/// Cloning shares the same tree.
#[derive(Clone)]
pub struct MemFs {
    tree: Arc<Mutex<Tree>>,
    counters: Arc<Counters>,
}

fn err(code: StatusCode) -> FsError {
    FsError::new(code)
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".into(),
        Some(i) => path[..i].into(),
    }
}

fn lock(tree: &Mutex<Tree>) -> MutexGuard<'_, Tree> {
    tree.lock().unwrap_or_else(|e| e.into_inner())
}

fn children(tree: &Tree, dir: &str) -> Vec<String> {
    let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
    tree.range(prefix.clone()..)
        .map(|(k, _)| k)
        .take_while(|k| k.starts_with(&prefix))
        .filter_map(|k| {
            let rest = &k[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn node_attrs(node: &Node) -> Attrs {
    let b = Attrs::builder()
        .uid_gid(1000, 1000)
        .owner_group("sunset", "users")
        .atime(FileTime::new(MTIME))
        .mtime(FileTime::with_nanos(MTIME, 500))
        .ctime(FileTime::new(MTIME))
        .link_count(1);
    match node {
        Node::File(d) => b
            .permissions(S_IFREG | 0o644)
            .size(d.len() as u64)
            .allocation_size(d.len().next_multiple_of(4096) as u64)
            .mime_type("application/octet-stream")
            .build(),
        Node::Dir => b.permissions(S_IFDIR | 0o755).size(0).build(),
        Node::Symlink(t) => b.permissions(S_IFLNK | 0o777).size(t.len() as u64).build(),
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut tree = Tree::new();
        tree.insert("/".into(), Node::Dir);
        let counters = Counters {
            read_limit: AtomicU32::new(u32::MAX),
            short_after: AtomicUsize::new(usize::MAX),
            ..Default::default()
        };
        MemFs { tree: Arc::new(Mutex::new(tree)), counters: Arc::new(counters) }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        lock(&self.tree)
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.tree().insert(normalize_path(path), Node::File(data.to_vec()));
    }

    pub fn add_dir(&self, path: &str) {
        self.tree().insert(normalize_path(path), Node::Dir);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.tree().get(&normalize_path(path)) {
            Some(Node::File(d)) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree().contains_key(&normalize_path(path))
    }

    pub fn seek_count(&self) -> usize {
        self.counters.seeks.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn set_read_limit(&self, limit: u32) {
        self.counters.read_limit.store(limit, Ordering::SeqCst)
    }

    pub fn short_reads_after(&self, n: usize) {
        self.counters.short_after.store(n, Ordering::SeqCst)
    }

    /// Resolves symlinks in the final component.
    fn follow(tree: &Tree, path: &str) -> FsResult<String> {
        let mut p = normalize_path(path);
        for _ in 0..8 {
            match tree.get(&p) {
                Some(Node::Symlink(t)) => p = normalize_path(&compose_path(&parent(&p), [t.as_str()])),
                Some(_) => return Ok(p),
                None => return Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
            }
        }
        Err(err(StatusCode::SSH_FX_LINK_LOOP))
    }

    fn check_parent(tree: &Tree, path: &str) -> FsResult<()> {
        match tree.get(&parent(path)) {
            Some(Node::Dir) => Ok(()),
            Some(_) => Err(err(StatusCode::SSH_FX_NOT_A_DIRECTORY)),
            None => Err(err(StatusCode::SSH_FX_NO_SUCH_PATH)),
        }
    }
}

pub struct MemFile {
    tree: Arc<Mutex<Tree>>,
    counters: Arc<Counters>,
    path: String,
    pos: u64,
}

impl MemFile {
    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> T) -> FsResult<T> {
        match lock(&self.tree).get_mut(&self.path) {
            Some(Node::File(d)) => Ok(f(d)),
            _ => Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
        }
    }
}

#[async_trait]
impl BackendFile for MemFile {
    async fn seek(&mut self, pos: u64) -> FsResult<()> {
        self.counters.seeks.fetch_add(1, Ordering::SeqCst);
        self.pos = pos;
        Ok(())
    }

    async fn read(&mut self, len: u32) -> FsResult<Vec<u8>> {
        let mut len = len.min(self.counters.read_limit.load(Ordering::SeqCst));
        let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if n >= self.counters.short_after.load(Ordering::SeqCst) {
            len = (len / 2).max(1);
        }
        let len = len as usize;
        let pos = self.pos as usize;
        let out = self.with_data(|d| {
            let start = pos.min(d.len());
            let end = (start + len).min(d.len());
            d[start..end].to_vec()
        })?;
        self.pos += out.len() as u64;
        Ok(out)
    }

    async fn write(&mut self, data: &[u8]) -> FsResult<()> {
        let pos = self.pos as usize;
        self.with_data(|d| {
            if d.len() < pos + data.len() {
                d.resize(pos + data.len(), 0);
            }
            d[pos..pos + data.len()].copy_from_slice(data);
        })?;
        self.pos += data.len() as u64;
        Ok(())
    }

    async fn len(&mut self) -> FsResult<u64> {
        self.with_data(|d| d.len() as u64)
    }

    async fn stat(&mut self) -> FsResult<Attrs> {
        self.with_data(|d| node_attrs(&Node::File(d.clone())))
    }

    async fn set_stat(&mut self, attrs: &Attrs) -> FsResult<()> {
        if let Some(size) = attrs.size {
            self.with_data(|d| d.resize(size as usize, 0))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl SftpBackend for MemFs {
    type File = MemFile;

    async fn open(&self, path: &str, opts: &OpenOptions, _attrs: &Attrs) -> FsResult<MemFile> {
        let mut tree = self.tree();
        let mut path = normalize_path(path);
        if let Ok(p) = Self::follow(&tree, &path) {
            path = p;
        }
        match tree.get_mut(&path) {
            Some(Node::Dir) => return Err(err(StatusCode::SSH_FX_FILE_IS_A_DIRECTORY)),
            Some(_) if opts.exclusive => return Err(err(StatusCode::SSH_FX_FILE_ALREADY_EXISTS)),
            Some(Node::File(d)) => {
                if opts.truncate {
                    d.clear()
                }
            }
            Some(Node::Symlink(_)) => return Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
            None if !opts.create => return Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
            None => {
                Self::check_parent(&tree, &path)?;
                tree.insert(path.clone(), Node::File(vec![]));
            }
        }
        Ok(MemFile { tree: self.tree.clone(), counters: self.counters.clone(), path, pos: 0 })
    }

    async fn list_dir(&self, path: &str) -> FsResult<Vec<String>> {
        let tree = self.tree();
        let path = Self::follow(&tree, path)?;
        match tree.get(&path) {
            Some(Node::Dir) => Ok(children(&tree, &path)),
            _ => Err(err(StatusCode::SSH_FX_NOT_A_DIRECTORY)),
        }
    }

    async fn stat(&self, path: &str, follow: bool) -> FsResult<Attrs> {
        let tree = self.tree();
        let path = if follow { Self::follow(&tree, path)? } else { normalize_path(path) };
        tree.get(&path).map(node_attrs).ok_or_else(|| err(StatusCode::SSH_FX_NO_SUCH_FILE))
    }

    async fn set_stat(&self, path: &str, attrs: &Attrs) -> FsResult<()> {
        let mut tree = self.tree();
        let path = Self::follow(&tree, path)?;
        match (tree.get_mut(&path), attrs.size) {
            (Some(Node::File(d)), Some(size)) => d.resize(size as usize, 0),
            (Some(_), _) => (),
            (None, _) => return Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str, _attrs: &Attrs) -> FsResult<()> {
        let mut tree = self.tree();
        let path = normalize_path(path);
        if tree.contains_key(&path) {
            return Err(err(StatusCode::SSH_FX_FILE_ALREADY_EXISTS));
        }
        Self::check_parent(&tree, &path)?;
        tree.insert(path, Node::Dir);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let mut tree = self.tree();
        let path = normalize_path(path);
        match tree.get(&path) {
            Some(Node::Dir) if path == "/" => Err(err(StatusCode::SSH_FX_PERMISSION_DENIED)),
            Some(Node::Dir) => {
                if !children(&tree, &path).is_empty() {
                    return Err(err(StatusCode::SSH_FX_DIR_NOT_EMPTY));
                }
                tree.remove(&path);
                Ok(())
            }
            Some(_) => Err(err(StatusCode::SSH_FX_NOT_A_DIRECTORY)),
            None => Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
        }
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let mut tree = self.tree();
        let path = normalize_path(path);
        match tree.get(&path) {
            Some(Node::Dir) => Err(err(StatusCode::SSH_FX_FILE_IS_A_DIRECTORY)),
            Some(_) => {
                tree.remove(&path);
                Ok(())
            }
            None => Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
        }
    }

    async fn rename(&self, old: &str, new: &str, flags: RenameFlags) -> FsResult<()> {
        let mut tree = self.tree();
        let (old, new) = (normalize_path(old), normalize_path(new));
        if !tree.contains_key(&old) {
            return Err(err(StatusCode::SSH_FX_NO_SUCH_FILE));
        }
        if tree.contains_key(&new) && !flags.overwrite {
            return Err(err(StatusCode::SSH_FX_FILE_ALREADY_EXISTS));
        }
        Self::check_parent(&tree, &new)?;
        let prefix = format!("{old}/");
        let moved: Vec<String> =
            tree.keys().filter(|k| **k == old || k.starts_with(&prefix)).cloned().collect();
        for k in moved {
            if let Some(n) = tree.remove(&k) {
                tree.insert(format!("{new}{}", &k[old.len()..]), n);
            }
        }
        Ok(())
    }

    async fn read_link(&self, path: &str) -> FsResult<String> {
        match self.tree().get(&normalize_path(path)) {
            Some(Node::Symlink(t)) => Ok(t.clone()),
            Some(_) => Err(FsError::with_msg(StatusCode::SSH_FX_FAILURE, "Not a link")),
            None => Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
        }
    }

    async fn symlink(&self, link_path: &str, target: &str) -> FsResult<()> {
        let mut tree = self.tree();
        let link_path = normalize_path(link_path);
        if tree.contains_key(&link_path) {
            return Err(err(StatusCode::SSH_FX_FILE_ALREADY_EXISTS));
        }
        Self::check_parent(&tree, &link_path)?;
        tree.insert(link_path, Node::Symlink(target.into()));
        Ok(())
    }

    async fn link(&self, new_link: &str, existing: &str, symlink: bool) -> FsResult<()> {
        if symlink {
            return self.symlink(new_link, existing).await;
        }
        // a copy stands in for a hard link
        let mut tree = self.tree();
        let node = tree.get(&normalize_path(existing)).cloned();
        match node {
            Some(n @ Node::File(_)) => {
                tree.insert(normalize_path(new_link), n);
                Ok(())
            }
            Some(_) => Err(err(StatusCode::SSH_FX_FILE_IS_A_DIRECTORY)),
            None => Err(err(StatusCode::SSH_FX_NO_SUCH_FILE)),
        }
    }

    async fn real_path(&self, path: &str) -> FsResult<String> {
        Ok(normalize_path(path))
    }

    async fn extended(&self, request: &str, data: &[u8]) -> FsResult<Vec<u8>> {
        match request {
            "echo@sunset" => Ok(data.to_vec()),
            _ => Err(FsError::unsupported()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::FileType;

    #[tokio::test]
    async fn listing_is_direct_children() {
        let fs = MemFs::new();
        fs.add_dir("/a");
        fs.add_file("/a/x", b"1");
        fs.add_dir("/a/b");
        fs.add_file("/a/b/y", b"2");
        fs.add_file("/z", b"3");
        assert_eq!(fs.list_dir("/").await.unwrap(), ["a", "z"]);
        assert_eq!(fs.list_dir("/a").await.unwrap(), ["b", "x"]);
        assert_eq!(fs.stat("/a", true).await.unwrap().kind(), FileType::Directory);
    }

    #[tokio::test]
    async fn rename_moves_subtree() {
        let fs = MemFs::new();
        fs.add_dir("/a");
        fs.add_file("/a/x", b"1");
        fs.rename("/a", "/b", RenameFlags::default()).await.unwrap();
        assert_eq!(fs.contents("/b/x").unwrap(), b"1");
        assert!(!fs.exists("/a/x"));
    }
}
