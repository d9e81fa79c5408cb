//! Server side table of open files and directories.
//!
//! Handles are random tokens. A token is never issued twice within a
//! table, including tokens of handles already closed, so a stale handle
//! can't alias a newer open.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{BackendFile, FsError, FsResult, OpenOptions};
use crate::error::{Error, Result};
use crate::opaquefilehandle::{HandleToken, OpaqueFileHandle};
use crate::proto::{FileHandle, StatusCode};

/// An open file and the position the backend is at.
#[derive(Debug)]
pub struct OpenFile<F> {
    pub file: F,
    pub path: String,
    pub options: OpenOptions,
    /// Backend file position, the next read or write without a seek
    /// happens here.
    pub pos: u64,
    /// Ranges granted by `BLOCK`, released by `UNBLOCK` or close.
    pub locks: Vec<ByteRangeLock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRangeLock {
    pub offset: u64,
    /// Zero locks to the end of file
    pub length: u64,
    pub mask: u32,
}

/// Position after a failed seek, read or write. Forces the next access
/// to seek.
const UNKNOWN_POS: u64 = u64::MAX;

impl<F: BackendFile> OpenFile<F> {
    async fn seek_to(&mut self, offset: u64) -> FsResult<()> {
        if self.pos != offset {
            trace!("{} seek {} -> {offset}", self.path, self.pos);
            self.pos = UNKNOWN_POS;
            self.file.seek(offset).await?;
            self.pos = offset;
        }
        Ok(())
    }

    /// Reads at `offset`, seeking only when it differs from the current
    /// position. Empty at end of file.
    pub async fn read_at(&mut self, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        self.seek_to(offset).await?;
        match self.file.read(len).await {
            Ok(data) => {
                self.pos += data.len() as u64;
                Ok(data)
            }
            Err(e) => {
                self.pos = UNKNOWN_POS;
                Err(e)
            }
        }
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> FsResult<()> {
        self.seek_to(offset).await?;
        match self.file.write(data).await {
            Ok(()) => {
                self.pos += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.pos = UNKNOWN_POS;
                Err(e)
            }
        }
    }
}

impl<F> OpenFile<F> {
    /// Removes the lock exactly matching a range, returning whether
    /// there was one.
    pub fn remove_lock(&mut self, offset: u64, length: u64) -> bool {
        let before = self.locks.len();
        self.locks.retain(|l| !(l.offset == offset && l.length == length));
        self.locks.len() != before
    }
}

/// An open directory, listed when opened and paged through by READDIR.
#[derive(Debug)]
pub struct OpenDir {
    pub path: String,
    entries: Vec<String>,
    cursor: usize,
}

impl OpenDir {
    /// The next page of at most `count` names. Empty at the end.
    pub fn next_page(&mut self, count: usize) -> &[String] {
        let start = self.cursor;
        let end = (start + count).min(self.entries.len());
        self.cursor = end;
        &self.entries[start..end]
    }

    /// Entries not yet returned
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.cursor
    }
}

#[derive(Debug)]
pub enum OpenResource<F> {
    File(OpenFile<F>),
    Dir(OpenDir),
}

/// Shared entry, locked for the duration of one operation.
pub type ResourceRef<F> = Arc<AsyncMutex<OpenResource<F>>>;

struct TableInner<F, K> {
    open: HashMap<K, ResourceRef<F>>,
    retired: HashSet<K>,
}

pub struct HandleTable<F, K = HandleToken> {
    inner: Mutex<TableInner<F, K>>,
}

impl<F, K> Default for HandleTable<F, K>
where
    F: BackendFile,
    K: OpaqueFileHandle,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F, K> HandleTable<F, K>
where
    F: BackendFile,
    K: OpaqueFileHandle,
{
    pub fn new() -> Self {
        Self { inner: Mutex::new(TableInner { open: HashMap::new(), retired: HashSet::new() }) }
    }

    // Never held across an await
    fn lock(&self) -> MutexGuard<'_, TableInner<F, K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, res: OpenResource<F>) -> Result<K> {
        let mut inner = self.lock();
        // A collision of 128 random bits is not expected, but retry anyway
        for _ in 0..4 {
            let k = K::generate()?;
            if inner.open.contains_key(&k) || inner.retired.contains(&k) {
                continue;
            }
            inner.open.insert(k.clone(), Arc::new(AsyncMutex::new(res)));
            trace!("new handle {k:?}, {} open", inner.open.len());
            return Ok(k);
        }
        Err(Error::bug())
    }

    pub fn open_file(&self, file: F, path: &str, options: OpenOptions) -> Result<K> {
        self.insert(OpenResource::File(OpenFile {
            file,
            path: path.into(),
            options,
            pos: 0,
            locks: vec![],
        }))
    }

    /// Takes a snapshot of `entries` that pass `filter`.
    pub fn open_dir(
        &self,
        path: &str,
        entries: Vec<String>,
        filter: impl Fn(&str) -> bool,
    ) -> Result<K> {
        let entries = entries.into_iter().filter(|e| filter(e)).collect();
        self.insert(OpenResource::Dir(OpenDir { path: path.into(), entries, cursor: 0 }))
    }

    /// Looks up a client supplied handle. Unknown and closed handles give
    /// `INVALID_HANDLE`.
    pub fn resolve(&self, handle: &FileHandle) -> FsResult<ResourceRef<F>> {
        let k = K::from_file_handle(handle).map_err(|_| FsError::new(StatusCode::SSH_FX_INVALID_HANDLE))?;
        self.lock()
            .open
            .get(&k)
            .cloned()
            .ok_or_else(|| FsError::new(StatusCode::SSH_FX_INVALID_HANDLE))
    }

    /// Removes a handle and closes its file.
    ///
    /// Later lookups fail immediately. Operations already holding the
    /// resource finish before the backend close.
    pub async fn close(&self, handle: &FileHandle<'_>) -> FsResult<()> {
        let k = K::from_file_handle(handle).map_err(|_| FsError::new(StatusCode::SSH_FX_INVALID_HANDLE))?;
        let res = {
            let mut inner = self.lock();
            let res = inner.open.remove(&k);
            if res.is_some() {
                inner.retired.insert(k.clone());
            }
            res
        };
        let res = res.ok_or_else(|| FsError::new(StatusCode::SSH_FX_INVALID_HANDLE))?;
        trace!("closing handle {k:?}");
        Self::close_resource(res).await
    }

    /// Forgets a handle without closing its file, for a backend file that
    /// has already been closed by other means. The token stays retired.
    pub fn free(&self, handle: &FileHandle<'_>) -> FsResult<()> {
        let k = K::from_file_handle(handle).map_err(|_| FsError::new(StatusCode::SSH_FX_INVALID_HANDLE))?;
        let mut inner = self.lock();
        if inner.open.remove(&k).is_none() {
            debug!("free of unknown handle {k:?}");
            return Err(FsError::new(StatusCode::SSH_FX_INVALID_HANDLE));
        }
        inner.retired.insert(k);
        Ok(())
    }

    async fn close_resource(res: ResourceRef<F>) -> FsResult<()> {
        let mut res = res.lock().await;
        match &mut *res {
            OpenResource::File(f) => f.file.close().await,
            OpenResource::Dir(_) => Ok(()),
        }
    }

    /// Closes every remaining handle, at session end.
    pub async fn close_all(&self) {
        let all: Vec<_> = {
            let mut inner = self.lock();
            let TableInner { open, retired } = &mut *inner;
            open.drain()
                .map(|(k, r)| {
                    retired.insert(k);
                    r
                })
                .collect()
        };
        if !all.is_empty() {
            debug!("closing {} handles left open", all.len());
        }
        for r in all {
            if let Err(e) = Self::close_resource(r).await {
                warn!("Error closing at session end: {e}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::Attrs;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountClose(Arc<AtomicUsize>);

    #[async_trait]
    impl BackendFile for CountClose {
        async fn seek(&mut self, _pos: u64) -> FsResult<()> {
            Ok(())
        }
        async fn read(&mut self, _len: u32) -> FsResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn write(&mut self, _data: &[u8]) -> FsResult<()> {
            Ok(())
        }
        async fn len(&mut self) -> FsResult<u64> {
            Ok(0)
        }
        async fn stat(&mut self) -> FsResult<Attrs> {
            Ok(Attrs::default())
        }
        async fn set_stat(&mut self, _attrs: &Attrs) -> FsResult<()> {
            Ok(())
        }
        async fn close(&mut self) -> FsResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn invalid(r: FsResult<impl Sized>) -> bool {
        matches!(r, Err(e) if e.status_code() == StatusCode::SSH_FX_INVALID_HANDLE)
    }

    #[tokio::test]
    async fn close_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let t: HandleTable<CountClose> = HandleTable::new();
        let k = t.open_file(CountClose(closes.clone()), "/a", OpenOptions::read()).unwrap();
        let fh = k.to_file_handle();
        assert!(t.resolve(&fh).is_ok());
        t.close(&fh).await.unwrap();
        assert!(invalid(t.close(&fh).await));
        assert!(invalid(t.resolve(&fh)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_closes_files() {
        let closes = Arc::new(AtomicUsize::new(0));
        let t: HandleTable<CountClose> = HandleTable::new();
        let a = t.open_file(CountClose(closes.clone()), "/a", OpenOptions::read()).unwrap();
        let b = t.open_file(CountClose(closes.clone()), "/b", OpenOptions::write()).unwrap();
        t.open_dir("/", vec!["x".into()], |_| true).unwrap();
        assert_ne!(a, b);
        assert_eq!(t.len(), 3);
        t.close_all().await;
        assert!(t.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(invalid(t.resolve(&a.to_file_handle())));
    }

    #[tokio::test]
    async fn foreign_handle_rejected() {
        let t: HandleTable<CountClose> = HandleTable::new();
        let fh = FileHandle(crate::sshwire::BinString(b"not a handle"));
        assert!(invalid(t.resolve(&fh)));
    }

    #[tokio::test]
    async fn dir_paging_and_filter() {
        let t: HandleTable<CountClose> = HandleTable::new();
        let names = (0..5).map(|i| format!("f{i}")).chain(["skip".to_string()]).collect();
        let filter = |n: &str| n != "skip";
        let k = t.open_dir("/d", names, filter).unwrap();
        let r = t.resolve(&k.to_file_handle()).unwrap();
        let mut r = r.lock().await;
        let OpenResource::Dir(d) = &mut *r else { panic!() };
        assert_eq!(d.next_page(2), ["f0", "f1"]);
        assert_eq!(d.next_page(2), ["f2", "f3"]);
        assert_eq!(d.remaining(), 1);
        assert_eq!(d.next_page(2), ["f4"]);
        assert!(d.next_page(2).is_empty());
        assert_eq!(d.remaining(), 0);
    }

    #[tokio::test]
    async fn free_skips_backend_close() {
        let closes = Arc::new(AtomicUsize::new(0));
        let t: HandleTable<CountClose> = HandleTable::new();
        let a = t.open_file(CountClose(closes.clone()), "/a", OpenOptions::read()).unwrap();
        let b = t.open_file(CountClose(closes.clone()), "/b", OpenOptions::read()).unwrap();
        t.free(&a.to_file_handle()).unwrap();
        assert!(invalid(t.free(&a.to_file_handle())));
        assert!(invalid(t.resolve(&a.to_file_handle())));
        // the other handle is unaffected
        assert!(t.resolve(&b.to_file_handle()).is_ok());
        t.close_all().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lock_ranges() {
        let t: HandleTable<CountClose> = HandleTable::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let k = t.open_file(CountClose(closes), "/a", OpenOptions::write()).unwrap();
        let r = t.resolve(&k.to_file_handle()).unwrap();
        let mut r = r.lock().await;
        let OpenResource::File(f) = &mut *r else { panic!() };
        f.locks.push(ByteRangeLock { offset: 0, length: 10, mask: 0 });
        assert!(!f.remove_lock(0, 5));
        assert!(f.remove_lock(0, 10));
        assert!(f.locks.is_empty());
    }
}
