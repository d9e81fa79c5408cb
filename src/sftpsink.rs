use crate::config::MAX_PACKET_LEN;
use crate::proto::SFTP_FIELD_LEN_LENGTH;
use crate::sshwire::{ParseContext, SSHSink, WireError, WireResult};

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

/// A implementation of [`SSHSink`] that produces a complete SFTP frame.
///
/// **Important**: It needs to be [`SftpSink::finalize`]d to add the packet
/// length
pub struct SftpSink<'c> {
    buffer: Vec<u8>,
    ctx: &'c ParseContext,
}

impl<'c> SftpSink<'c> {
    /// Leaves [`SFTP_FIELD_LEN_LENGTH`] bytes at the start of the buffer
    /// for the length field written by [`SftpSink::finalize`].
    pub fn new(ctx: &'c ParseContext) -> Self {
        SftpSink { buffer: vec![0; SFTP_FIELD_LEN_LENGTH], ctx }
    }

    /// Length of the encoded packet, excluding the length field
    pub fn payload_len(&self) -> usize {
        self.buffer.len() - SFTP_FIELD_LEN_LENGTH
    }

    /// Writes the length field and returns the frame.
    pub fn finalize(mut self) -> WireResult<Vec<u8>> {
        if self.payload_len() == 0 {
            warn!("SftpSink finalized before pushing data");
            return Err(WireError::PacketWrong);
        }
        let len = u32::try_from(self.payload_len()).map_err(|_| WireError::NoRoom)?;
        self.buffer[..SFTP_FIELD_LEN_LENGTH].copy_from_slice(&len.to_be_bytes());
        Ok(self.buffer)
    }
}

impl SSHSink for SftpSink<'_> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        if v.len() + self.buffer.len() > MAX_PACKET_LEN + SFTP_FIELD_LEN_LENGTH {
            return Err(WireError::NoRoom);
        }
        self.buffer.extend_from_slice(v);
        Ok(())
    }

    fn ctx(&self) -> &ParseContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sshwire::{BinString, SSHEncode};

    #[test]
    fn length_prefixed() {
        let ctx = ParseContext::default();
        let mut s = SftpSink::new(&ctx);
        7u8.enc(&mut s).unwrap();
        BinString(b"ab").enc(&mut s).unwrap();
        assert_eq!(s.payload_len(), 7);
        assert_eq!(s.finalize().unwrap(), [0, 0, 0, 7, 7, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn empty_is_error() {
        let ctx = ParseContext::default();
        assert_eq!(SftpSink::new(&ctx).finalize(), Err(WireError::PacketWrong));
    }

    #[test]
    fn oversize() {
        let ctx = ParseContext::default();
        let mut s = SftpSink::new(&ctx);
        let big = vec![0u8; MAX_PACKET_LEN + 1];
        assert_eq!(big.as_slice().enc(&mut s), Err(WireError::NoRoom));
    }
}
