//! SFTP client.
//!
//! [`SftpClient`] matches responses to requests by id, so any number of
//! requests can be outstanding and the server may answer them in any
//! order. A single task reads responses and hands each to whoever awaits
//! its id.

use crate::attrs::{valid_attr_flags, Attrs};
use crate::backend::{compose_path, OpenOptions, RenameFlags};
use crate::config::{
    ClientConfig, MAX_PACKET_LEN, OUTPUT_QUEUE_DEPTH, SFTP_VERSION_MAX, SFTP_VERSION_MIN,
};
use crate::error::{Error, Result};
use crate::proto::{self, *};
use crate::sftphandler::{SftpOutputPipe, SftpOutputProducer};
use crate::sftpsource::{read_packet, SftpSource};
use crate::sshwire::{BinString, ParseContext};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

enum Slot {
    /// A caller is waiting
    Waiting(oneshot::Sender<Vec<u8>>),
    /// Arrived before anyone asked for it
    Ready(Vec<u8>),
    /// Nobody will ask, drop it on arrival
    Discarded,
}

#[derive(Default)]
struct Slots {
    map: HashMap<u32, Slot>,
    closed: bool,
}

/// Matches response frames to request ids.
pub struct Correlator {
    next_id: AtomicU32,
    slots: Mutex<Slots>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub(crate) fn starting_at(id: u32) -> Self {
        Correlator { next_id: AtomicU32::new(id), slots: Mutex::new(Slots::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ids increase by one and wrap at `u32::MAX`.
    pub fn next_request_id(&self) -> ReqId {
        ReqId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Waits for the response frame to request `id`.
    ///
    /// Fails with [`Error::ConnectionLost`] if the channel closes first.
    pub async fn await_response(&self, id: ReqId) -> Result<Vec<u8>> {
        let rx = {
            let mut slots = self.lock();
            match slots.map.remove(&id.0) {
                Some(Slot::Ready(frame)) => return Ok(frame),
                Some(Slot::Waiting(tx)) if !tx.is_closed() => {
                    slots.map.insert(id.0, Slot::Waiting(tx));
                    return Err(Error::BadUsage { msg: "Response is already awaited" });
                }
                _ => (),
            }
            if slots.closed {
                return Err(Error::ConnectionLost);
            }
            let (tx, rx) = oneshot::channel();
            slots.map.insert(id.0, Slot::Waiting(tx));
            rx
        };
        rx.await.map_err(|_| Error::ConnectionLost)
    }

    /// The response to `id` won't be awaited.
    pub fn discard(&self, id: ReqId) {
        let mut slots = self.lock();
        match slots.map.remove(&id.0) {
            // already here
            Some(Slot::Ready(_)) => (),
            _ if slots.closed => (),
            _ => {
                slots.map.insert(id.0, Slot::Discarded);
            }
        }
    }

    /// Passes a response frame to its waiter, or holds it.
    pub(crate) fn deliver(&self, id: ReqId, frame: Vec<u8>) {
        let mut slots = self.lock();
        match slots.map.remove(&id.0) {
            Some(Slot::Waiting(tx)) => {
                if tx.send(frame).is_err() {
                    debug!("Waiter for {id:?} went away");
                }
            }
            Some(Slot::Discarded) => trace!("Dropping discarded response {id:?}"),
            Some(Slot::Ready(_)) => {
                warn!("Second response for {id:?}, keeping the later");
                slots.map.insert(id.0, Slot::Ready(frame));
            }
            None => {
                debug!("Holding response {id:?} until it is awaited");
                slots.map.insert(id.0, Slot::Ready(frame));
            }
        }
    }

    /// No more responses will arrive. Current and later waiters fail,
    /// responses already held can still be claimed.
    pub(crate) fn close(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        slots.map.retain(|_, s| matches!(s, Slot::Ready(_)));
    }

    /// Number of ids awaited or held
    pub fn pending(&self) -> usize {
        self.lock().map.len()
    }
}

/// A handle the server returned for an open file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle(Vec<u8>);

impl RemoteHandle {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn wire(&self) -> FileHandle<'_> {
        FileHandle(BinString(&self.0))
    }
}

/// An entry of a directory listing, or a resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub filename: String,
    /// Only sent by version 3 servers, for display
    pub longname: String,
    pub attrs: Attrs,
}

impl From<NameEntry<'_>> for DirEntry {
    fn from(n: NameEntry<'_>) -> Self {
        DirEntry {
            filename: n.filename.0.into_owned(),
            longname: n.longname.0.into_owned(),
            attrs: n.attrs,
        }
    }
}

/// One block read by [`SftpClient::await_data`]
#[derive(Debug)]
pub struct ReadData {
    pub data: Vec<u8>,
    /// The server said this block reached end of file, version 6 only.
    pub eof: bool,
}

fn status_error(st: Status) -> Error {
    Error::Status { code: st.code, msg: st.message.into_owned() }
}

fn unexpected<T>(p: &SftpPacket) -> Result<T> {
    warn!("Unexpected response {:?}", p.sftp_num());
    Err(Error::PacketWrong)
}

fn expect_ok(p: SftpPacket) -> Result<()> {
    match p {
        SftpPacket::Status(_, st) if st.code == StatusCode::SSH_FX_OK => Ok(()),
        SftpPacket::Status(_, st) => Err(status_error(st)),
        p => unexpected(&p),
    }
}

fn expect_handle(p: SftpPacket) -> Result<RemoteHandle> {
    match p {
        SftpPacket::Handle(_, h) => Ok(RemoteHandle(h.handle.0 .0.to_vec())),
        SftpPacket::Status(_, st) => Err(status_error(st)),
        p => unexpected(&p),
    }
}

fn expect_attrs(p: SftpPacket) -> Result<Attrs> {
    match p {
        SftpPacket::Attrs(_, a) => Ok(a.attrs),
        SftpPacket::Status(_, st) => Err(status_error(st)),
        p => unexpected(&p),
    }
}

/// `None` for an `EOF` status
fn expect_data(p: SftpPacket) -> Result<Option<ReadData>> {
    match p {
        SftpPacket::Data(_, d) => {
            Ok(Some(ReadData { data: d.data.0.to_vec(), eof: d.eof.unwrap_or(false) }))
        }
        SftpPacket::Status(_, st) if st.code == StatusCode::SSH_FX_EOF => Ok(None),
        SftpPacket::Status(_, st) => Err(status_error(st)),
        p => unexpected(&p),
    }
}

/// `None` for an `EOF` status, otherwise the entries and whether the
/// server flagged the end of the listing.
fn expect_names(p: SftpPacket) -> Result<Option<(Vec<DirEntry>, bool)>> {
    match p {
        SftpPacket::Name(_, n) => {
            let eol = n.end_of_list.unwrap_or(false);
            Ok(Some((n.entries.into_iter().map(DirEntry::from).collect(), eol)))
        }
        SftpPacket::Status(_, st) if st.code == StatusCode::SSH_FX_EOF => Ok(None),
        SftpPacket::Status(_, st) => Err(status_error(st)),
        p => unexpected(&p),
    }
}

fn expect_one_name(p: SftpPacket) -> Result<DirEntry> {
    match expect_names(p)? {
        Some((mut entries, _)) if entries.len() == 1 => Ok(entries.remove(0)),
        Some((entries, _)) => {
            warn!("Expected one name, got {}", entries.len());
            Err(Error::PacketWrong)
        }
        None => Err(Error::PacketWrong),
    }
}

/// What the server sent in `VERSION`
struct Negotiated {
    ctx: ParseContext,
    extensions: Vec<(String, Vec<u8>)>,
    supported: Option<Supported>,
}

/// An SFTP client session.
///
/// Methods take `&self`, so requests from several tasks (or joined
/// futures) are outstanding together.
pub struct SftpClient {
    correlator: Arc<Correlator>,
    out: SftpOutputProducer,
    config: ClientConfig,
    extensions: Vec<(String, Vec<u8>)>,
    supported: Option<Supported>,
    /// Handles obtained and not yet closed
    handles: Mutex<HashSet<RemoteHandle>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
}

impl SftpClient {
    /// Starts a session over a channel, negotiating the version.
    ///
    /// Tasks are spawned to write requests and read responses, so this
    /// must run within a tokio runtime.
    pub async fn new<R, W>(mut input: R, output: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let requested = config.version.clamp(SFTP_VERSION_MIN, SFTP_VERSION_MAX);
        let pipe = SftpOutputPipe::new(OUTPUT_QUEUE_DEPTH);
        let (mut consumer, out) = pipe.split(output, ParseContext::default());
        let writer = tokio::spawn(async move { consumer.receive_task().await });

        let init = Init { version: requested, extensions: vec![] };
        out.send_request(&SftpPacket::Init(init)).await?;
        let frame = read_packet(&mut input, MAX_PACKET_LEN).await?;
        let Negotiated { ctx, extensions, supported } = Self::negotiated(&frame, requested)?;
        info!("SFTP version {} negotiated", ctx.version);

        let correlator = Arc::new(Correlator::new());
        let reader = tokio::spawn(Self::reader_task(input, correlator.clone()));

        Ok(SftpClient {
            correlator,
            out: out.with_context(ctx),
            config,
            extensions,
            supported,
            handles: Mutex::new(HashSet::new()),
            reader,
            writer,
        })
    }

    fn negotiated(frame: &[u8], requested: u32) -> Result<Negotiated> {
        let ctx = ParseContext::default();
        let mut source = SftpSource::new(frame, &ctx);
        let SftpPacket::Version(v) = SftpPacket::decode_response(&mut source)? else {
            error!("Server didn't reply with VERSION");
            return Err(Error::PacketWrong);
        };
        if v.version < SFTP_VERSION_MIN || v.version > requested {
            error!("Server chose version {}, we asked for {requested}", v.version);
            return Err(Error::NoVersionOverlap { version: v.version });
        }

        let mut ctx = ParseContext::new(v.version);
        let mut supported = None;
        for e in v.extensions.iter() {
            debug!("Server extension {}", e.name);
            let layout = match e.name {
                EXT_SUPPORTED2 => 6,
                // a supported2 takes precedence
                EXT_SUPPORTED if supported.is_none() => 5,
                _ => continue,
            };
            match Supported::from_bytes(e.data.0, layout) {
                Ok(s) => supported = Some(s),
                Err(err) => warn!("Ignoring bad {} extension: {err}", e.name),
            }
        }
        if v.version >= 5 {
            if let Some(s) = &supported {
                ctx.supported_attrs = Some(s.attribute_mask);
                ctx.supported_attr_bits = Some(s.attribute_bits);
            }
        }
        let extensions =
            v.extensions.iter().map(|e| (e.name.to_string(), e.data.0.to_vec())).collect();
        Ok(Negotiated { ctx, extensions, supported })
    }

    /// Passes every response frame to the correlator until the channel ends.
    async fn reader_task<R>(mut input: R, correlator: Arc<Correlator>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match read_packet(&mut input, MAX_PACKET_LEN).await {
                Ok(f) => f,
                Err(Error::ConnectionLost) => {
                    debug!("Server closed the channel");
                    break;
                }
                Err(e) => {
                    error!("Reading response failed: {e}");
                    break;
                }
            };
            if frame.len() < SFTP_MINIMUM_PACKET_LEN {
                error!("Response too short for a request id, {} bytes", frame.len());
                break;
            }
            let ctx = ParseContext::default();
            let id = match SftpSource::new(&frame, &ctx).peek_packet_req_id() {
                Ok(id) => ReqId(id),
                Err(e) => {
                    error!("Bad response: {e}");
                    break;
                }
            };
            correlator.deliver(id, frame);
        }
        correlator.close();
    }

    /// Ends the session and waits for the server to close its side.
    ///
    /// Handles still open are closed by the server.
    pub async fn shutdown(self) -> Result<()> {
        let SftpClient { out, writer, reader, .. } = self;
        drop(out);
        let written = writer.await.map_err(|e| {
            error!("Writer task failed: {e}");
            Error::ConnectionLost
        })?;
        if let Err(e) = reader.await {
            error!("Reader task failed: {e}");
        }
        written
    }

    /// The negotiated protocol version
    pub fn version(&self) -> u32 {
        self.out.ctx().version
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Data of an extension the server sent in `VERSION`
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.extensions.iter().find(|(n, _)| n == name).map(|(_, d)| d.as_slice())
    }

    /// The server's `supported` or `supported2` capabilities
    pub fn supported(&self) -> Option<&Supported> {
        self.supported.as_ref()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    fn handles(&self) -> MutexGuard<'_, HashSet<RemoteHandle>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Local check, a handle this client doesn't hold never goes out.
    fn check(&self, handle: &RemoteHandle) -> Result<()> {
        if self.handles().contains(handle) {
            Ok(())
        } else {
            debug!("Handle {:?} isn't open", handle);
            Err(Error::BadHandle)
        }
    }

    /// Sends the request built for a fresh id, returning that id.
    async fn send<'p>(&self, build: impl FnOnce(ReqId) -> SftpPacket<'p>) -> Result<ReqId> {
        let id = self.correlator.next_request_id();
        self.out.send_request(&build(id)).await?;
        Ok(id)
    }

    async fn call<'p>(&self, build: impl FnOnce(ReqId) -> SftpPacket<'p>) -> Result<Vec<u8>> {
        let id = self.send(build).await?;
        self.correlator.await_response(id).await
    }

    fn decode<'f>(&self, frame: &'f [u8]) -> Result<SftpPacket<'f>> {
        let mut source = SftpSource::new(frame, self.out.ctx());
        Ok(SftpPacket::decode_response(&mut source)?)
    }

    fn stat_flags(&self) -> Option<u32> {
        Some(valid_attr_flags(self.version()))
    }

    pub async fn open(&self, path: &str, options: OpenOptions) -> Result<RemoteHandle> {
        self.open_with_attrs(path, options, Attrs::default()).await
    }

    /// Opens with initial attributes for a created file.
    pub async fn open_with_attrs(
        &self,
        path: &str,
        options: OpenOptions,
        attrs: Attrs,
    ) -> Result<RemoteHandle> {
        let (desired_access, pflags) = options.to_request(self.version());
        let frame = self
            .call(|id| {
                SftpPacket::Open(id, Open { filename: path.into(), desired_access, pflags, attrs })
            })
            .await?;
        let handle = expect_handle(self.decode(&frame)?)?;
        self.handles().insert(handle.clone());
        Ok(handle)
    }

    /// Opens for writing, creating or truncating.
    pub async fn create(&self, path: &str) -> Result<RemoteHandle> {
        self.open(path, OpenOptions::write()).await
    }

    /// Closes a file or directory handle. It can't be used afterwards
    /// even if the server reports an error.
    pub async fn close(&self, handle: &RemoteHandle) -> Result<()> {
        if !self.handles().remove(handle) {
            return Err(Error::BadHandle);
        }
        let frame =
            self.call(|id| SftpPacket::Close(id, Close { handle: handle.wire() })).await?;
        expect_ok(self.decode(&frame)?)
    }

    /// Reads up to `len` bytes. `None` at end of file.
    pub async fn read(&self, handle: &RemoteHandle, offset: u64, len: u32) -> Result<Option<Vec<u8>>> {
        let id = self.send_read(handle, offset, len).await?;
        Ok(self.await_data(id).await?.map(|r| r.data))
    }

    /// Sends a `READ` without waiting, see [`await_data`](Self::await_data).
    pub async fn send_read(&self, handle: &RemoteHandle, offset: u64, len: u32) -> Result<ReqId> {
        self.check(handle)?;
        self.send(|id| SftpPacket::Read(id, proto::Read { handle: handle.wire(), offset, len })).await
    }

    pub async fn await_data(&self, id: ReqId) -> Result<Option<ReadData>> {
        let frame = self.correlator.await_response(id).await?;
        expect_data(self.decode(&frame)?)
    }

    pub async fn write(&self, handle: &RemoteHandle, offset: u64, data: &[u8]) -> Result<()> {
        let id = self.send_write(handle, offset, data).await?;
        self.await_status(id).await
    }

    /// Sends a `WRITE` without waiting, see [`await_status`](Self::await_status).
    pub async fn send_write(&self, handle: &RemoteHandle, offset: u64, data: &[u8]) -> Result<ReqId> {
        self.check(handle)?;
        self.send(|id| {
            SftpPacket::Write(id, proto::Write { handle: handle.wire(), offset, data: BinString(data) })
        })
        .await
    }

    pub async fn await_status(&self, id: ReqId) -> Result<()> {
        let frame = self.correlator.await_response(id).await?;
        expect_ok(self.decode(&frame)?)
    }

    /// Follows symbolic links
    pub async fn stat(&self, path: &str) -> Result<Attrs> {
        let flags = self.stat_flags();
        let frame = self.call(|id| SftpPacket::Stat(id, Stat { path: path.into(), flags })).await?;
        expect_attrs(self.decode(&frame)?)
    }

    pub async fn lstat(&self, path: &str) -> Result<Attrs> {
        let flags = self.stat_flags();
        let frame = self.call(|id| SftpPacket::LStat(id, LStat { path: path.into(), flags })).await?;
        expect_attrs(self.decode(&frame)?)
    }

    pub async fn fstat(&self, handle: &RemoteHandle) -> Result<Attrs> {
        self.check(handle)?;
        let flags = self.stat_flags();
        let frame =
            self.call(|id| SftpPacket::FStat(id, FStat { handle: handle.wire(), flags })).await?;
        expect_attrs(self.decode(&frame)?)
    }

    pub async fn setstat(&self, path: &str, attrs: Attrs) -> Result<()> {
        let frame = self.call(|id| SftpPacket::SetStat(id, SetStat { path: path.into(), attrs })).await?;
        expect_ok(self.decode(&frame)?)
    }

    pub async fn fsetstat(&self, handle: &RemoteHandle, attrs: Attrs) -> Result<()> {
        self.check(handle)?;
        let frame = self
            .call(|id| SftpPacket::FSetStat(id, FSetStat { handle: handle.wire(), attrs }))
            .await?;
        expect_ok(self.decode(&frame)?)
    }

    pub async fn opendir(&self, path: &str) -> Result<RemoteHandle> {
        let frame = self.call(|id| SftpPacket::OpenDir(id, OpenDir { path: path.into() })).await?;
        let handle = expect_handle(self.decode(&frame)?)?;
        self.handles().insert(handle.clone());
        Ok(handle)
    }

    /// The next batch of entries, `None` once the listing is exhausted.
    pub async fn readdir(&self, handle: &RemoteHandle) -> Result<Option<Vec<DirEntry>>> {
        Ok(self.readdir_page(handle).await?.map(|(entries, _)| entries))
    }

    async fn readdir_page(&self, handle: &RemoteHandle) -> Result<Option<(Vec<DirEntry>, bool)>> {
        self.check(handle)?;
        let frame = self.call(|id| SftpPacket::ReadDir(id, ReadDir { handle: handle.wire() })).await?;
        expect_names(self.decode(&frame)?)
    }

    /// Lists a whole directory.
    ///
    /// Stops without another request when a version 6 server flags the
    /// end of the list.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let handle = self.opendir(path).await?;
        let listed: Result<Vec<DirEntry>> = async {
            let mut all = vec![];
            while let Some((entries, end)) = self.readdir_page(&handle).await? {
                all.extend(entries);
                if end {
                    break;
                }
            }
            Ok(all)
        }
        .await;
        let closed = self.close(&handle).await;
        let all = listed?;
        closed?;
        Ok(all)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let frame = self.call(|id| SftpPacket::Remove(id, Remove { filename: path.into() })).await?;
        expect_ok(self.decode(&frame)?)
    }

    pub async fn mkdir(&self, path: &str, attrs: Attrs) -> Result<()> {
        let frame = self.call(|id| SftpPacket::MkDir(id, MkDir { path: path.into(), attrs })).await?;
        expect_ok(self.decode(&frame)?)
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let frame = self.call(|id| SftpPacket::RmDir(id, RmDir { path: path.into() })).await?;
        expect_ok(self.decode(&frame)?)
    }

    /// Canonical absolute form of `path`
    pub async fn realpath(&self, path: &str) -> Result<String> {
        let frame = self
            .call(|id| {
                SftpPacket::RealPath(id, RealPath { path: path.into(), control: None, compose: vec![] })
            })
            .await?;
        Ok(expect_one_name(self.decode(&frame)?)?.filename)
    }

    /// Resolves `path` with `compose` appended, asking the server to stat
    /// it according to `control` (`SSH_FXP_REALPATH_*`).
    ///
    /// Before version 6 the paths are composed locally and `control` has
    /// no effect.
    pub async fn realpath_with(&self, path: &str, control: u8, compose: &[&str]) -> Result<DirEntry> {
        let frame = if self.version() >= 6 {
            self.call(|id| {
                SftpPacket::RealPath(
                    id,
                    RealPath {
                        path: path.into(),
                        control: Some(control),
                        compose: compose.iter().map(|&c| Filename::from(c)).collect(),
                    },
                )
            })
            .await?
        } else {
            let path = compose_path(path, compose.iter().copied());
            self.call(|id| {
                SftpPacket::RealPath(
                    id,
                    RealPath { path: path.into(), control: None, compose: vec![] },
                )
            })
            .await?
        };
        expect_one_name(self.decode(&frame)?)
    }

    /// Flags are only sent from version 5, earlier servers never overwrite.
    pub async fn rename(&self, oldpath: &str, newpath: &str, flags: RenameFlags) -> Result<()> {
        let frame = self
            .call(|id| {
                SftpPacket::Rename(
                    id,
                    Rename { oldpath: oldpath.into(), newpath: newpath.into(), flags: Some(flags.bits()) },
                )
            })
            .await?;
        expect_ok(self.decode(&frame)?)
    }

    /// Target of a symbolic link
    pub async fn readlink(&self, path: &str) -> Result<String> {
        let frame = self.call(|id| SftpPacket::ReadLink(id, ReadLink { path: path.into() })).await?;
        Ok(expect_one_name(self.decode(&frame)?)?.filename)
    }

    /// Creates `linkpath` pointing at `targetpath`. Version 6 servers are
    /// sent a `LINK` instead of `SYMLINK`.
    pub async fn symlink(&self, linkpath: &str, targetpath: &str) -> Result<()> {
        if self.version() >= 6 {
            return self.link(linkpath, targetpath, true).await;
        }
        let frame = self
            .call(|id| {
                SftpPacket::Symlink(
                    id,
                    Symlink { linkpath: linkpath.into(), targetpath: targetpath.into() },
                )
            })
            .await?;
        expect_ok(self.decode(&frame)?)
    }

    /// Version 6 hard or symbolic link
    pub async fn link(&self, new_link_path: &str, existing_path: &str, symlink: bool) -> Result<()> {
        let frame = self
            .call(|id| {
                SftpPacket::Link(
                    id,
                    Link {
                        new_link_path: new_link_path.into(),
                        existing_path: existing_path.into(),
                        symlink,
                    },
                )
            })
            .await?;
        expect_ok(self.decode(&frame)?)
    }

    /// Version 6 byte range lock
    pub async fn block(&self, handle: &RemoteHandle, offset: u64, length: u64, mask: u32) -> Result<()> {
        self.check(handle)?;
        let frame = self
            .call(|id| SftpPacket::Block(id, Block { handle: handle.wire(), offset, length, mask }))
            .await?;
        expect_ok(self.decode(&frame)?)
    }

    pub async fn unblock(&self, handle: &RemoteHandle, offset: u64, length: u64) -> Result<()> {
        self.check(handle)?;
        let frame = self
            .call(|id| SftpPacket::Unblock(id, Unblock { handle: handle.wire(), offset, length }))
            .await?;
        expect_ok(self.decode(&frame)?)
    }

    /// A vendor extension request. A plain `OK` status gives empty data.
    pub async fn extended(&self, request: &str, data: &[u8]) -> Result<Vec<u8>> {
        let frame = self.call(|id| SftpPacket::Extended(id, Extended { request, data })).await?;
        match self.decode(&frame)? {
            SftpPacket::ExtendedReply(_, r) => Ok(r.data.to_vec()),
            p => expect_ok(p).map(|()| vec![]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftplog::init_test_log;

    fn frame(id: u32) -> Vec<u8> {
        let ctx = ParseContext::new(3);
        SftpPacket::Status(ReqId(id), Status::new(StatusCode::SSH_FX_OK, ""))
            .encode_response(&ctx)
            .unwrap()
    }

    #[tokio::test]
    async fn responses_out_of_order() {
        init_test_log();
        let c = Arc::new(Correlator::new());
        let a = c.next_request_id();
        let b = c.next_request_id();
        assert_ne!(a, b);

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.await_response(a).await })
        };
        tokio::task::yield_now().await;
        // b arrives first and nobody waits for it yet
        c.deliver(b, frame(b.0));
        c.deliver(a, frame(a.0));
        assert_eq!(waiter.await.unwrap().unwrap(), frame(a.0));
        assert_eq!(c.await_response(b).await.unwrap(), frame(b.0));
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let c = Arc::new(Correlator::new());
        let a = c.next_request_id();
        let b = c.next_request_id();
        c.deliver(b, frame(b.0));
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.await_response(a).await })
        };
        tokio::task::yield_now().await;
        c.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::ConnectionLost)));
        // held before the close
        assert!(c.await_response(b).await.is_ok());
        let later = c.next_request_id();
        assert!(matches!(c.await_response(later).await, Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn discarded_responses_dropped() {
        let c = Correlator::new();
        let a = c.next_request_id();
        c.discard(a);
        c.deliver(a, frame(a.0));
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn ids_wrap() {
        let c = Correlator::starting_at(u32::MAX);
        assert_eq!(c.next_request_id(), ReqId(u32::MAX));
        assert_eq!(c.next_request_id(), ReqId(0));
    }
}
