use crate::config::MAX_PACKET_LEN;
use crate::error::{Error, Result};
use crate::proto::{
    SftpNum, SFTP_FIELD_ID_INDEX, SFTP_FIELD_LEN_LENGTH, SFTP_FIELD_REQ_ID_INDEX,
    SFTP_FIELD_REQ_ID_LEN,
};
use crate::sshwire::{ParseContext, SSHSource, WireError, WireResult};

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use pretty_hex::PrettyHex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// SftpSource implements [`SSHSource`] over a complete frame, and extra
/// functions to inspect the header when the body fails to decode.
///
/// Decoding starts after the length field.
#[derive(Debug)]
pub struct SftpSource<'de, 'c> {
    buffer: &'de [u8],
    index: usize,
    ctx: &'c ParseContext,
}

impl<'de> SSHSource<'de> for SftpSource<'de, '_> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]> {
        if len > self.remaining() {
            return Err(WireError::RanOut);
        }
        let slice = &self.buffer[self.index..self.index + len];
        self.index += len;
        Ok(slice)
    }

    fn pos(&self) -> usize {
        self.index
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.index
    }

    fn ctx(&self) -> &ParseContext {
        self.ctx
    }
}

impl<'de, 'c> SftpSource<'de, 'c> {
    /// Creates a new [`SftpSource`] referencing a frame
    pub fn new(buffer: &'de [u8], ctx: &'c ParseContext) -> Self {
        let index = SFTP_FIELD_LEN_LENGTH.min(buffer.len());
        SftpSource { buffer, index, ctx }
    }

    /// Peeks the buffer for packet type [`SftpNum`]. This does not advance
    /// the reading index
    ///
    /// Useful to observe the packet fields in special conditions where a
    /// `dec(s)` would fail
    pub fn peek_packet_type(&self) -> WireResult<SftpNum> {
        self.buffer
            .get(SFTP_FIELD_ID_INDEX)
            .map(|b| SftpNum::from(*b))
            .ok_or(WireError::RanOut)
    }

    /// Peeks the buffer for packet request id.
    ///
    /// **Warning**: `INIT` and `VERSION` have no request id, the result
    /// will be garbage.
    pub fn peek_packet_req_id(&self) -> WireResult<u32> {
        peek_u32(self.buffer, SFTP_FIELD_REQ_ID_INDEX)
    }
}

fn peek_u32(b: &[u8], index: usize) -> WireResult<u32> {
    let bytes: [u8; 4] = b
        .get(index..index + SFTP_FIELD_REQ_ID_LEN)
        .and_then(|s| s.try_into().ok())
        .ok_or(WireError::RanOut)?;
    Ok(u32::from_be_bytes(bytes))
}

/// Reads one complete frame, including its length field.
///
/// Frames longer than `max_len` are rejected before their body is read.
pub async fn read_packet<R>(r: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; SFTP_FIELD_LEN_LENGTH];
    r.read_exact(&mut len).await?;
    let size = u32::from_be_bytes(len) as usize;
    if size > max_len.min(MAX_PACKET_LEN) {
        return Err(Error::BigPacket { size });
    }
    if size == 0 {
        return Err(Error::RanOut);
    }
    let mut frame = vec![0u8; SFTP_FIELD_LEN_LENGTH + size];
    frame[..SFTP_FIELD_LEN_LENGTH].copy_from_slice(&len);
    r.read_exact(&mut frame[SFTP_FIELD_LEN_LENGTH..]).await?;
    if log::log_enabled!(log::Level::Trace) {
        trace!("read frame {:?}", frame.hex_dump());
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_buffer() -> [u8; 27] {
        [
            0, 0, 0, 23, //                             Packet len
            101, //                                     Packet type
            0, 0, 0, 16, //                             ReqId
            0, 0, 0, 1, //                              Status code: SSH_FX_EOF
            0, 0, 0, 1, //                              string message length
            65, //                                      string message content
            0, 0, 0, 5, //                              string lang length
            101, 110, 45, 85, 83, //                    string lang content
        ]
    }

    #[test]
    fn peeking_header() {
        let ctx = ParseContext::default();
        let buffer_status = status_buffer();
        let source = SftpSource::new(&buffer_status, &ctx);
        assert_eq!(source.peek_packet_type().unwrap(), SftpNum::from(101u8));
        assert_eq!(source.peek_packet_req_id().unwrap(), 16);
        assert_eq!(source.remaining(), 23);
    }

    #[test]
    fn peek_short() {
        let ctx = ParseContext::default();
        let source = SftpSource::new(&[0, 0, 0, 1, 4, 0], &ctx);
        assert_eq!(source.peek_packet_req_id(), Err(WireError::RanOut));
    }

    #[tokio::test]
    async fn read_frames() {
        let b = status_buffer();
        let mut input: Vec<u8> = b.to_vec();
        input.extend_from_slice(&b);
        let mut r = input.as_slice();
        assert_eq!(read_packet(&mut r, MAX_PACKET_LEN).await.unwrap(), b);
        assert_eq!(read_packet(&mut r, MAX_PACKET_LEN).await.unwrap(), b);
        assert!(matches!(read_packet(&mut r, MAX_PACKET_LEN).await, Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn read_too_big() {
        let mut r: &[u8] = &[0, 0, 1, 0, 1, 2, 3];
        assert!(matches!(read_packet(&mut r, 255).await, Err(Error::BigPacket { size: 256 })));
    }
}
