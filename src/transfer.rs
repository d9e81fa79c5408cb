//! Pipelined file transfers.
//!
//! Reads are kept in flight up to a window sized from the transport's
//! flow control window, and writes up to a bounded count. Data is
//! delivered strictly in file order.

use crate::backend::OpenOptions;
use crate::client::{RemoteHandle, SftpClient};
use crate::error::{Error, Result};
use crate::proto::ReqId;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

/// Stops a running transfer from another task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How an upload treats an existing remote file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadMode {
    /// Create or truncate
    #[default]
    Overwrite,
    /// Writes go after the current end of the remote file, at explicit
    /// offsets from the remote length found when opening.
    Append,
    /// Continue a partial upload. The local input is skipped up to the
    /// remote file's length.
    Resume,
}

/// A READ in flight
struct PendingRead {
    id: ReqId,
    offset: u64,
    len: u32,
}

/// Runs transfers for a client, tuned from its [`ClientConfig`](crate::ClientConfig).
pub struct Transfer<'c> {
    client: &'c SftpClient,
    block_size: u32,
    write_window: usize,
    cancel: CancelToken,
}

impl<'c> Transfer<'c> {
    pub fn new(client: &'c SftpClient) -> Self {
        let config = client.config();
        let mut block_size = config.block_size.max(1);
        if let Some(max) = client.supported().map(|s| s.max_read_size).filter(|&m| m > 0) {
            block_size = block_size.min(max);
        }
        Transfer {
            client,
            block_size,
            write_window: config.write_window(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!("Transfer cancelled");
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn discard_reads(&self, queue: &mut VecDeque<PendingRead>) {
        for r in queue.drain(..) {
            self.client.correlator().discard(r.id);
        }
    }

    fn discard_writes(&self, queue: &mut VecDeque<ReqId>) {
        for id in queue.drain(..) {
            self.client.correlator().discard(id);
        }
    }

    /// Copies from `offset` to the end of file, or `len` bytes, into `out`.
    /// Returns the number of bytes copied.
    ///
    /// The first block is read alone. If the server returns less than
    /// asked, that becomes the block size. A short read later in the file
    /// is completed before any following data is delivered.
    pub async fn read_to<W>(
        &self,
        handle: &RemoteHandle,
        offset: u64,
        len: Option<u64>,
        out: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let end = len.map(|l| offset.saturating_add(l));
        let mut pos = offset;
        let mut block = self.block_size;

        let first = match end {
            Some(e) => (e - pos).min(block as u64) as u32,
            None => block,
        };
        if first == 0 {
            return Ok(0);
        }
        self.check_cancel()?;
        let id = self.client.send_read(handle, pos, first).await?;
        let Some(d) = self.client.await_data(id).await? else {
            return Ok(0);
        };
        let n = d.data.len();
        if n == 0 {
            return Ok(0);
        }
        if n < first as usize {
            debug!("Server returned {n} of {first}, using that block size");
            block = n as u32;
        }
        out.write_all(&d.data).await?;
        pos += n as u64;
        if d.eof {
            out.flush().await?;
            return Ok(pos - offset);
        }

        let window = self.client.config().read_window(block);
        trace!("Read window {window} of {block} bytes");
        let mut queue = VecDeque::new();
        let res = self.read_pipelined(handle, pos, end, block, window, &mut queue, out).await;
        self.discard_reads(&mut queue);
        let pos = res?;
        out.flush().await?;
        Ok(pos - offset)
    }

    /// Returns the final position
    async fn read_pipelined<W>(
        &self,
        handle: &RemoteHandle,
        mut pos: u64,
        end: Option<u64>,
        block: u32,
        window: usize,
        queue: &mut VecDeque<PendingRead>,
        out: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut next = pos;
        let mut posting = true;
        loop {
            self.check_cancel()?;
            while posting && queue.len() < window {
                let len = match end {
                    Some(e) if next >= e => break,
                    Some(e) => (e - next).min(block as u64) as u32,
                    None => block,
                };
                let id = self.client.send_read(handle, next, len).await?;
                queue.push_back(PendingRead { id, offset: next, len });
                next += len as u64;
            }

            let Some(r) = queue.pop_front() else {
                return Ok(pos);
            };
            debug_assert_eq!(r.offset, pos);
            let Some(d) = self.client.await_data(r.id).await? else {
                trace!("EOF at {pos}");
                return Ok(pos);
            };
            out.write_all(&d.data).await?;
            pos += d.data.len() as u64;
            let mut eof = d.eof;

            // fill in a short read before anything later
            let block_end = r.offset + r.len as u64;
            while !eof && pos < block_end {
                let len = (block_end - pos) as u32;
                trace!("Short read, {len} more at {pos}");
                match self.client.await_data(self.client.send_read(handle, pos, len).await?).await? {
                    Some(d) if !d.data.is_empty() => {
                        out.write_all(&d.data).await?;
                        pos += d.data.len() as u64;
                        eof = d.eof;
                    }
                    _ => eof = true,
                }
            }
            if eof {
                // anything still queued is past the end
                posting = false;
                self.discard_reads(queue);
            }
        }
    }

    /// Writes everything from `input` starting at `offset`, returning the
    /// number of bytes written.
    ///
    /// Writes are sent in order with a bounded number outstanding, each
    /// acknowledgement is checked.
    pub async fn write_from<R>(&self, handle: &RemoteHandle, offset: u64, input: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut queue = VecDeque::new();
        let res = self.write_pipelined(handle, offset, input, &mut queue).await;
        self.discard_writes(&mut queue);
        res.map(|pos| pos - offset)
    }

    async fn write_pipelined<R>(
        &self,
        handle: &RemoteHandle,
        mut pos: u64,
        input: &mut R,
        queue: &mut VecDeque<ReqId>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.block_size as usize];
        loop {
            self.check_cancel()?;
            let n = read_full(input, &mut buf).await?;
            if n == 0 {
                break;
            }
            let id = self.client.send_write(handle, pos, &buf[..n]).await?;
            queue.push_back(id);
            pos += n as u64;
            if queue.len() >= self.write_window {
                if let Some(id) = queue.pop_front() {
                    self.client.await_status(id).await?;
                }
            }
        }
        while let Some(id) = queue.pop_front() {
            self.client.await_status(id).await?;
        }
        Ok(pos)
    }

    /// Downloads `path` into `out`, starting at `offset` to resume a
    /// partial copy.
    pub async fn download<W>(&self, path: &str, offset: u64, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let handle = self.client.open(path, OpenOptions::read()).await?;
        let res: Result<u64> = async {
            if offset > 0 {
                let size = self.client.fstat(&handle).await?.size.unwrap_or(0);
                if offset > size {
                    return Err(Error::BadResume { offset, len: size });
                }
            }
            self.read_to(&handle, offset, None, out).await
        }
        .await;
        let closed = self.client.close(&handle).await;
        let n = res?;
        closed?;
        info!("Downloaded {n} bytes from {path}");
        Ok(n)
    }

    /// Uploads all of `input` to `path`.
    pub async fn upload<R>(&self, input: &mut R, path: &str, mode: UploadMode) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        // No append flag for Append. Pipelined writes must land at their offsets.
        let options = match mode {
            UploadMode::Overwrite => OpenOptions::write(),
            UploadMode::Append | UploadMode::Resume => {
                OpenOptions { write: true, create: true, ..Default::default() }
            }
        };
        let handle = self.client.open(path, options).await?;
        let res: Result<u64> = async {
            let offset = match mode {
                UploadMode::Overwrite => 0,
                UploadMode::Append | UploadMode::Resume => {
                    self.client.fstat(&handle).await?.size.unwrap_or(0)
                }
            };
            if mode == UploadMode::Resume && offset > 0 {
                let mut skip = (&mut *input).take(offset);
                let skipped = tokio::io::copy(&mut skip, &mut tokio::io::sink()).await?;
                if skipped < offset {
                    return Err(Error::BadResume { offset, len: skipped });
                }
                debug!("Resuming upload at {offset}");
            }
            self.write_from(&handle, offset, input).await
        }
        .await;
        let closed = self.client.close(&handle).await;
        let n = res?;
        closed?;
        info!("Uploaded {n} bytes to {path}");
        Ok(n)
    }
}

/// Fills `buf` unless the input ends first.
async fn read_full<R: AsyncRead + Unpin>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        let r = input.read(&mut buf[n..]).await?;
        if r == 0 {
            break;
        }
        n += r;
    }
    Ok(n)
}

impl SftpClient {
    /// Downloads a whole file with the default pipeline settings.
    pub async fn download<W>(&self, path: &str, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        Transfer::new(self).download(path, 0, out).await
    }

    /// Uploads to a created or truncated file with the default pipeline
    /// settings.
    pub async fn upload<R>(&self, input: &mut R, path: &str) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        Transfer::new(self).upload(input, path, UploadMode::Overwrite).await
    }
}
