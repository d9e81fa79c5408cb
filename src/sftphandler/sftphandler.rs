use crate::attrs::{valid_attr_flags, Attrs};
use crate::backend::{
    compose_path, BackendFile, FsError, FsResult, OpenOptions, RenameFlags, SftpBackend,
};
use crate::config::{
    ServerConfig, MAX_CONCURRENT_REQUESTS, MAX_PACKET_LEN, OUTPUT_QUEUE_DEPTH,
    SFTP_VERSION_MAX, SFTP_VERSION_MIN,
};
use crate::error::{Error, Result, TrapBug};
use crate::handles::{ByteRangeLock, HandleTable, OpenResource};
use crate::opaquefilehandle::{HandleToken, OpaqueFileHandle};
use crate::proto::{self, *};
use crate::sftphandler::sftpoutputchannelhandler::{SftpOutputPipe, SftpOutputProducer};
use crate::sftpsource::{read_packet, SftpSource};
use crate::sshwire::{BinString, ParseContext, WireError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

/// Successful outcome of a request, before it is encoded.
#[derive(Debug)]
enum Reply {
    Ok,
    Handle(HandleToken),
    Data { data: Vec<u8>, eof: Option<bool> },
    Name { entries: Vec<NameReply>, end_of_list: Option<bool> },
    Attrs(Attrs),
    Extended(Vec<u8>),
}

#[derive(Debug)]
struct NameReply {
    filename: String,
    longname: String,
    attrs: Attrs,
}

impl Reply {
    /// A `NAME` with a single path, as for `REALPATH` and `READLINK`.
    fn single_name(path: String, attrs: Attrs, version: u32) -> Self {
        let longname = if version <= 3 { path.clone() } else { String::new() };
        Reply::Name { entries: vec![NameReply { filename: path, longname, attrs }], end_of_list: None }
    }
}

/// Per connection state, shared by the tasks processing its requests.
struct Session<B: SftpBackend> {
    backend: Arc<B>,
    config: ServerConfig,
    handles: HandleTable<B::File>,
    ctx: ParseContext,
    /// Bytes written so far, charged against `config.upload_quota`
    uploaded: AtomicU64,
    out: SftpOutputProducer,
}

/// Serves the SFTP subsystem for one connection.
///
/// The backend does the file operations, `SftpHandler` takes care of
/// version negotiation, handles, and replying exactly once to every
/// request.
pub struct SftpHandler<B: SftpBackend> {
    backend: Arc<B>,
    config: ServerConfig,
}

impl<B: SftpBackend> SftpHandler<B> {
    pub fn new(backend: B, config: ServerConfig) -> Self {
        Self::new_shared(Arc::new(backend), config)
    }

    /// A backend shared with other connections.
    pub fn new_shared(backend: Arc<B>, config: ServerConfig) -> Self {
        SftpHandler { backend, config }
    }

    /// Processes requests from `input` until the client closes it.
    ///
    /// Requests run concurrently, responses are written whole to `output`
    /// as they complete. When the input ends, outstanding requests are
    /// finished and any handles left open are closed.
    ///
    /// A clean end of input returns `Ok`. Protocol violations that leave
    /// no request to answer, such as a first packet other than `INIT`,
    /// end the session with an error.
    pub async fn process_loop<R, W>(&self, mut input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let pipe = SftpOutputPipe::new(OUTPUT_QUEUE_DEPTH);
        let (mut consumer, producer) = pipe.split(output, ParseContext::default());
        let (served, written) =
            tokio::join!(self.serve(&mut input, producer), consumer.receive_task());
        if let Err(e) = &written {
            warn!("SFTP output failed: {e}");
        }
        served.and(written)
    }

    async fn serve<R>(&self, input: &mut R, out: SftpOutputProducer) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let version = self.negotiate(input, &out).await?;

        let ctx = ParseContext::new(version);
        let session = Arc::new(Session {
            backend: self.backend.clone(),
            config: self.config.clone(),
            handles: HandleTable::new(),
            out: out.with_context(ctx.clone()),
            ctx,
            uploaded: AtomicU64::new(0),
        });
        drop(out);

        let mut tasks = JoinSet::new();
        let res = Self::request_loop(input, &session, &mut tasks).await;
        if let Err(e) = &res {
            error!("Ending SFTP session: {e}");
        }

        while let Some(r) = tasks.join_next().await {
            if let Err(e) = r {
                error!("Request task failed: {e}");
            }
        }
        session.handles.close_all().await;
        res
    }

    /// Handles `INIT`, returning the negotiated version.
    async fn negotiate<R>(&self, input: &mut R, out: &SftpOutputProducer) -> Result<u32>
    where
        R: AsyncRead + Unpin,
    {
        let frame = read_packet(input, MAX_PACKET_LEN).await?;
        let ctx = ParseContext::default();
        let mut source = SftpSource::new(&frame, &ctx);
        if !source.peek_packet_type()?.is_init() {
            error!("First packet is {:?}, not INIT", source.peek_packet_type()?);
            return Err(Error::NotInitialized);
        }
        let SftpPacket::Init(init) = SftpPacket::decode_request(&mut source)? else {
            return Error::bug_msg("INIT type decoded as another packet");
        };
        for e in init.extensions.iter() {
            debug!("Client extension {}", e.name);
        }

        if init.version < SFTP_VERSION_MIN {
            error!("Client version {} is too old", init.version);
            return Err(Error::NoVersionOverlap { version: init.version });
        }
        let max = self.config.max_version.clamp(SFTP_VERSION_MIN, SFTP_VERSION_MAX);
        let version = init.version.min(max);
        info!("SFTP version {version} negotiated, client offered {}", init.version);

        let versions = (SFTP_VERSION_MIN..=max).map(|v| v.to_string()).collect::<Vec<_>>().join(",");
        let supported = self.supported(version).to_bytes(version)?;
        let mut extensions = vec![
            ExtPair { name: EXT_NEWLINE, data: BinString(b"\n") },
            ExtPair { name: EXT_VERSIONS, data: BinString(versions.as_bytes()) },
        ];
        if version >= 5 {
            extensions.push(ExtPair { name: Supported::ext_name(version), data: BinString(&supported) });
        }
        out.send_packet(&SftpPacket::Version(Version { version, extensions })).await?;
        Ok(version)
    }

    fn supported(&self, version: u32) -> Supported {
        Supported {
            attribute_mask: valid_attr_flags(version),
            attribute_bits: 0,
            open_flags: SSH_FXF_ACCESS_DISPOSITION
                | SSH_FXF_APPEND_DATA
                | SSH_FXF_APPEND_DATA_ATOMIC
                | SSH_FXF_TEXT_MODE,
            access_mask: ACE4_READ_DATA
                | ACE4_WRITE_DATA
                | ACE4_APPEND_DATA
                | ACE4_READ_ATTRIBUTES
                | ACE4_WRITE_ATTRIBUTES,
            max_read_size: self.config.max_read_len,
            // only unlocked opens, BLOCK accepts any mask
            open_block_vector: 0x0001,
            block_vector: 0xffff,
            attrib_extensions: vec![],
            extensions: vec![],
        }
    }

    /// Reads requests and spawns a task for each.
    async fn request_loop<R>(
        input: &mut R,
        session: &Arc<Session<B>>,
        tasks: &mut JoinSet<()>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
        loop {
            let frame = match read_packet(input, MAX_PACKET_LEN).await {
                Ok(f) => f,
                Err(Error::ConnectionLost) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if frame.len() < SFTP_MINIMUM_PACKET_LEN {
                error!("Packet too short for a request id, {} bytes", frame.len());
                return Err(Error::PacketWrong);
            }
            let num = SftpSource::new(&frame, &session.ctx).peek_packet_type()?;
            if num.is_init() {
                error!("Repeated INIT");
                return Err(Error::AlreadyInitialized);
            }
            if num.is_response() {
                error!("Client sent a response packet {num:?}");
                return Err(Error::PacketWrong);
            }

            let permit = permits.clone().acquire_owned().await.trap()?;
            let s = session.clone();
            tasks.spawn(async move {
                s.dispatch(frame).await;
                drop(permit);
            });

            while let Some(r) = tasks.try_join_next() {
                if let Err(e) = r {
                    error!("Request task failed: {e}");
                }
            }
        }
    }
}

impl<B: SftpBackend> Session<B> {
    fn version(&self) -> u32 {
        self.ctx.version
    }

    /// Decodes and runs one request, then sends its one response.
    async fn dispatch(&self, frame: Vec<u8>) {
        let mut source = SftpSource::new(&frame, &self.ctx);
        // frame length was checked by the reader
        let req_id = ReqId(source.peek_packet_req_id().unwrap_or_default());

        let res = match SftpPacket::decode_request(&mut source) {
            Ok(p) => {
                debug!("Handling request {req_id:?} {:?}", p.sftp_num());
                self.handle(p).await
            }
            Err(WireError::UnknownPacket { number }) => {
                debug!("Unknown request type {number}");
                Err(FsError::unsupported())
            }
            Err(e) => {
                warn!("Bad request {req_id:?}: {e}");
                Err(FsError::with_msg(StatusCode::SSH_FX_BAD_MESSAGE, e.to_string()))
            }
        };

        let sent = match res {
            Ok(reply) => self.send_reply(req_id, reply).await,
            Err(e) => {
                debug!("Request {req_id:?} failed: {e}");
                self.out.send_status(req_id, e.status_code(), &e.message()).await
            }
        };
        if let Err(e) = sent {
            warn!("Couldn't send response to {req_id:?}: {e}");
        }
    }

    async fn send_reply(&self, req_id: ReqId, reply: Reply) -> Result<()> {
        match reply {
            Reply::Ok => {
                self.out.send_status(req_id, StatusCode::SSH_FX_OK, StatusCode::SSH_FX_OK.message()).await
            }
            Reply::Handle(k) => {
                let handle = proto::Handle { handle: k.to_file_handle() };
                self.out.send_packet(&SftpPacket::Handle(req_id, handle)).await
            }
            Reply::Data { data, eof } => {
                let data = Data { data: BinString(&data), eof };
                self.out.send_packet(&SftpPacket::Data(req_id, data)).await
            }
            Reply::Name { entries, end_of_list } => {
                let entries = entries
                    .into_iter()
                    .map(|n| NameEntry {
                        filename: n.filename.into(),
                        longname: n.longname.into(),
                        attrs: n.attrs,
                    })
                    .collect();
                self.out.send_packet(&SftpPacket::Name(req_id, Name { entries, end_of_list })).await
            }
            Reply::Attrs(attrs) => {
                self.out.send_packet(&SftpPacket::Attrs(req_id, ResponseAttributes { attrs })).await
            }
            Reply::Extended(data) => {
                let reply = ExtendedReply { data: &data };
                self.out.send_packet(&SftpPacket::ExtendedReply(req_id, reply)).await
            }
        }
    }

    /// Requests that only exist from version 6
    fn require_v6(&self) -> FsResult<()> {
        if self.version() >= 6 {
            Ok(())
        } else {
            Err(FsError::unsupported())
        }
    }

    async fn handle(&self, request: SftpPacket<'_>) -> FsResult<Reply> {
        let b = &self.backend;
        match request {
            SftpPacket::Open(_, open) => self.open(open).await,
            SftpPacket::Close(_, close) => {
                self.handles.close(&close.handle).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::Read(_, read) => self.read(read).await,
            SftpPacket::Write(_, write) => self.write(write).await,
            SftpPacket::LStat(_, st) => Ok(Reply::Attrs(b.stat(st.path.as_str(), false).await?)),
            SftpPacket::Stat(_, st) => Ok(Reply::Attrs(b.stat(st.path.as_str(), true).await?)),
            SftpPacket::FStat(_, st) => {
                let res = self.handles.resolve(&st.handle)?;
                let mut res = res.lock().await;
                let attrs = match &mut *res {
                    OpenResource::File(f) => f.file.stat().await?,
                    OpenResource::Dir(d) => b.stat(&d.path, true).await?,
                };
                Ok(Reply::Attrs(attrs))
            }
            SftpPacket::SetStat(_, st) => {
                b.set_stat(st.path.as_str(), &st.attrs).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::FSetStat(_, st) => {
                let res = self.handles.resolve(&st.handle)?;
                let mut res = res.lock().await;
                match &mut *res {
                    OpenResource::File(f) => f.file.set_stat(&st.attrs).await?,
                    OpenResource::Dir(d) => b.set_stat(&d.path, &st.attrs).await?,
                }
                Ok(Reply::Ok)
            }
            SftpPacket::OpenDir(_, od) => {
                let path = od.path.as_str();
                let entries = b.list_dir(path).await?;
                let filter = self.config.name_filter.as_ref();
                let k = self
                    .handles
                    .open_dir(path, entries, |n| filter.map_or(true, |f| f.matches(n)))
                    .map_err(|e| FsError::with_msg(StatusCode::SSH_FX_FAILURE, e.to_string()))?;
                Ok(Reply::Handle(k))
            }
            SftpPacket::ReadDir(_, rd) => self.read_dir(rd).await,
            SftpPacket::Remove(_, r) => {
                b.remove(r.filename.as_str()).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::MkDir(_, m) => {
                b.mkdir(m.path.as_str(), &m.attrs).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::RmDir(_, r) => {
                b.rmdir(r.path.as_str()).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::RealPath(_, rp) => self.real_path(rp).await,
            SftpPacket::Rename(_, r) => {
                let flags = RenameFlags::from(r.flags);
                b.rename(r.oldpath.as_str(), r.newpath.as_str(), flags).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::ReadLink(_, rl) => {
                let target = b.read_link(rl.path.as_str()).await?;
                Ok(Reply::single_name(target, Attrs::default(), self.version()))
            }
            SftpPacket::Symlink(_, sl) => {
                // replaced by LINK
                if self.version() >= 6 {
                    return Err(FsError::unsupported());
                }
                b.symlink(sl.linkpath.as_str(), sl.targetpath.as_str()).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::Link(_, l) => {
                self.require_v6()?;
                b.link(l.new_link_path.as_str(), l.existing_path.as_str(), l.symlink).await?;
                Ok(Reply::Ok)
            }
            SftpPacket::Block(_, bl) => self.block(bl).await,
            SftpPacket::Unblock(_, ub) => self.unblock(ub).await,
            SftpPacket::Extended(_, ext) => {
                debug!("Extended request {}", ext.request);
                Ok(Reply::Extended(b.extended(ext.request, ext.data).await?))
            }
            p => {
                // INIT and responses are rejected before dispatch
                error!("Unexpected packet {:?}", p.sftp_num());
                Err(FsError::new(StatusCode::SSH_FX_BAD_MESSAGE))
            }
        }
    }

    async fn open(&self, open: Open<'_>) -> FsResult<Reply> {
        let opts = OpenOptions::from_request(&open, self.version())?;
        let path = open.filename.as_str();
        debug!("open {path} {opts:?}");
        let file = self.backend.open(path, &opts, &open.attrs).await?;
        let k = self
            .handles
            .open_file(file, path, opts)
            .map_err(|e| FsError::with_msg(StatusCode::SSH_FX_FAILURE, e.to_string()))?;
        Ok(Reply::Handle(k))
    }

    async fn read(&self, read: proto::Read<'_>) -> FsResult<Reply> {
        let res = self.handles.resolve(&read.handle)?;
        let mut res = res.lock().await;
        let OpenResource::File(f) = &mut *res else {
            return Err(FsError::new(StatusCode::SSH_FX_INVALID_HANDLE));
        };
        if !f.options.read {
            return Err(FsError::with_msg(
                StatusCode::SSH_FX_PERMISSION_DENIED,
                "Handle not open for reading",
            ));
        }

        let len = read.len.min(self.config.max_read_len);
        let data = f.read_at(read.offset, len).await?;
        if data.is_empty() {
            return Err(FsError::new(StatusCode::SSH_FX_EOF));
        }

        let eof = if self.version() >= 6 {
            let pos = f.pos;
            Some(f.file.len().await.map(|l| pos >= l).unwrap_or(false))
        } else {
            None
        };
        Ok(Reply::Data { data, eof })
    }

    async fn write(&self, write: proto::Write<'_>) -> FsResult<Reply> {
        let res = self.handles.resolve(&write.handle)?;
        let mut res = res.lock().await;
        let OpenResource::File(f) = &mut *res else {
            return Err(FsError::new(StatusCode::SSH_FX_INVALID_HANDLE));
        };
        if !f.options.write {
            return Err(FsError::with_msg(
                StatusCode::SSH_FX_PERMISSION_DENIED,
                "Handle not open for writing",
            ));
        }

        let data = write.data.0;
        let len = data.len() as u64;
        self.charge_quota(len)?;

        let r = if f.options.append {
            // the requested offset is ignored
            match f.file.len().await {
                Ok(end) => f.write_at(end, data).await,
                Err(e) => Err(e),
            }
        } else {
            f.write_at(write.offset, data).await
        };
        if r.is_err() {
            self.refund_quota(len);
        }
        r?;
        Ok(Reply::Ok)
    }

    fn charge_quota(&self, len: u64) -> FsResult<()> {
        let Some(quota) = self.config.upload_quota else {
            return Ok(());
        };
        self.uploaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|total| *total <= quota)
            })
            .map(|_| ())
            .map_err(|used| {
                debug!("Upload quota exceeded, {used} of {quota} used, {len} more");
                FsError::new(StatusCode::SSH_FX_QUOTA_EXCEEDED)
            })
    }

    fn refund_quota(&self, len: u64) {
        if self.config.upload_quota.is_some() {
            self.uploaded.fetch_sub(len, Ordering::SeqCst);
        }
    }

    async fn read_dir(&self, rd: ReadDir<'_>) -> FsResult<Reply> {
        let res = self.handles.resolve(&rd.handle)?;
        let mut res = res.lock().await;
        let OpenResource::Dir(d) = &mut *res else {
            return Err(FsError::new(StatusCode::SSH_FX_INVALID_HANDLE));
        };

        let version = self.version();
        let mut entries = vec![];
        // a page where every entry is skipped doesn't end the listing
        while entries.is_empty() {
            let names = d.next_page(self.config.readdir_page.max(1)).to_vec();
            if names.is_empty() {
                return Err(FsError::new(StatusCode::SSH_FX_EOF));
            }
            for filename in names {
                let full = compose_path(&d.path, [filename.as_str()]);
                match self.backend.stat(&full, false).await {
                    Ok(attrs) => {
                        let longname =
                            if version <= 3 { attrs.longname(&filename) } else { String::new() };
                        entries.push(NameReply { filename, longname, attrs })
                    }
                    Err(e) => debug!("Skipping {full}: {e}"),
                }
            }
        }
        let end_of_list = (version >= 6).then(|| d.remaining() == 0);
        Ok(Reply::Name { entries, end_of_list })
    }

    async fn real_path(&self, rp: RealPath<'_>) -> FsResult<Reply> {
        let path = compose_path(rp.path.as_str(), rp.compose.iter().map(|c| c.as_str()));
        let real = self.backend.real_path(&path).await?;
        let attrs = match rp.control.unwrap_or(SSH_FXP_REALPATH_NO_CHECK) {
            SSH_FXP_REALPATH_NO_CHECK => Attrs::default(),
            SSH_FXP_REALPATH_STAT_IF => self.backend.stat(&real, true).await.unwrap_or_default(),
            SSH_FXP_REALPATH_STAT_ALWAYS => self.backend.stat(&real, true).await?,
            c => {
                return Err(FsError::with_msg(
                    StatusCode::SSH_FX_INVALID_PARAMETER,
                    format!("Bad realpath control {c}"),
                ))
            }
        };
        Ok(Reply::single_name(real, attrs, self.version()))
    }

    async fn block(&self, bl: Block<'_>) -> FsResult<Reply> {
        self.require_v6()?;
        let res = self.handles.resolve(&bl.handle)?;
        let mut res = res.lock().await;
        let OpenResource::File(f) = &mut *res else {
            return Err(FsError::new(StatusCode::SSH_FX_INVALID_HANDLE));
        };
        f.file.lock(bl.offset, bl.length, bl.mask).await?;
        f.locks.push(ByteRangeLock { offset: bl.offset, length: bl.length, mask: bl.mask });
        Ok(Reply::Ok)
    }

    async fn unblock(&self, ub: Unblock<'_>) -> FsResult<Reply> {
        self.require_v6()?;
        let res = self.handles.resolve(&ub.handle)?;
        let mut res = res.lock().await;
        let OpenResource::File(f) = &mut *res else {
            return Err(FsError::new(StatusCode::SSH_FX_INVALID_HANDLE));
        };
        if !f.remove_lock(ub.offset, ub.length) {
            return Err(FsError::new(StatusCode::SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK));
        }
        f.file.unlock(ub.offset, ub.length).await?;
        Ok(Reply::Ok)
    }
}
