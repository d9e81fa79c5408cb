use crate::error::{Error, Result, TrapBug};
use crate::proto::{ReqId, SftpPacket, Status, StatusCode};
use crate::sshwire::ParseContext;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

/// Serialises complete frames from any number of tasks onto one writer.
///
/// Producers send whole frames, so two packets never interleave on the
/// wire. The pipe is used by the server for responses and by the client
/// for requests.
pub struct SftpOutputPipe {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl SftpOutputPipe {
    /// `depth` frames may be queued before producers wait.
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        SftpOutputPipe { tx, rx }
    }

    /// Get a Consumer and Producer pair so that any task can send frames
    /// to the output without a mutable borrow of it.
    ///
    /// The [`SftpOutputConsumer`] needs to be running for frames to reach
    /// the writer.
    pub fn split<W>(
        self,
        writer: W,
        ctx: ParseContext,
    ) -> (SftpOutputConsumer<W>, SftpOutputProducer)
    where
        W: AsyncWrite + Unpin,
    {
        (
            SftpOutputConsumer { rx: self.rx, writer },
            SftpOutputProducer { tx: self.tx, ctx },
        )
    }
}

pub struct SftpOutputConsumer<W> {
    rx: mpsc::Receiver<Vec<u8>>,
    writer: W,
}

impl<W: AsyncWrite + Unpin> SftpOutputConsumer<W> {
    /// Run it to start the piping. Returns once every producer has been
    /// dropped and the queue is drained.
    pub async fn receive_task(&mut self) -> Result<()> {
        debug!("Running SftpOutput Consumer task");
        while let Some(frame) = self.rx.recv().await {
            trace!("Output Consumer: writes {} bytes", frame.len());
            self.writer.write_all(&frame).await?;
            // drain whatever else is already queued before flushing
            while let Ok(frame) = self.rx.try_recv() {
                self.writer.write_all(&frame).await?;
            }
            self.writer.flush().await?;
        }
        debug!("Output Consumer finished");
        // the peer sees end of file
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[derive(Clone)]
pub struct SftpOutputProducer {
    tx: mpsc::Sender<Vec<u8>>,
    ctx: ParseContext,
}

impl SftpOutputProducer {
    /// Context used to encode packets
    pub fn ctx(&self) -> &ParseContext {
        &self.ctx
    }

    /// A producer for the same output encoding with a different context,
    /// once a version has been negotiated.
    pub fn with_context(&self, ctx: ParseContext) -> Self {
        SftpOutputProducer { tx: self.tx.clone(), ctx }
    }

    /// Push a response packet.
    ///
    /// If the packet can't be encoded, for example a `NAME` too large for
    /// a frame, a `FAILURE` status is sent in its place so the request
    /// still gets one reply.
    pub async fn send_packet(&self, packet: &SftpPacket<'_>) -> Result<()> {
        trace!("Output Producer: Sending packet {:?}", packet);
        match packet.encode_response(&self.ctx) {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => {
                warn!("Couldn't encode {:?}: {e}", packet.sftp_num());
                let req_id = packet.req_id().trap()?;
                self.send_status(req_id, StatusCode::SSH_FX_FAILURE, "Response too large").await
            }
        }
    }

    /// Push a request packet, from a client.
    pub async fn send_request(&self, packet: &SftpPacket<'_>) -> Result<()> {
        trace!("Output Producer: Sending request {:?}", packet);
        let frame = packet.encode_request(&self.ctx)?;
        self.send_frame(frame).await
    }

    /// Sends a status, downgraded to a code the negotiated version defines.
    pub async fn send_status(&self, req_id: ReqId, code: StatusCode, msg: &str) -> Result<()> {
        let code = code.for_version(self.ctx.version);
        let response = SftpPacket::Status(req_id, Status::new(code, msg));
        debug!("Output Producer: Pushing a status message: {:?}", response);
        let frame = response.encode_response(&self.ctx)?;
        self.send_frame(frame).await
    }

    /// Queues a finished frame. Fails once the consumer has gone.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        trace!("Output Producer: Sends {} bytes", frame.len());
        self.tx.send(frame).await.map_err(|_| Error::ConnectionLost)
    }
}
