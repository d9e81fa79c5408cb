use core::fmt;

use crate::error::{Error, Result};
use crate::proto::FileHandle;
use crate::sshwire::{BinString, WireError, WireResult};

/// Length of the tokens issued by [`HandleToken`]
pub const FILE_HANDLE_LEN: usize = 16;

/// Required methods for the handles given to SFTP clients.
///
/// A handle is only a lookup key, the server never interprets its
/// content.
pub trait OpaqueFileHandle:
    Sized + Clone + core::hash::Hash + PartialEq + Eq + fmt::Debug + Send + Sync
{
    /// A fresh handle, not predictable from previous ones
    fn generate() -> Result<Self>;

    /// Copies the content of a `FileHandle` from the wire
    fn from_file_handle(file_handle: &FileHandle<'_>) -> WireResult<Self>;

    /// Returns a FileHandle pointing to the handle's bytes
    fn to_file_handle(&self) -> FileHandle<'_>;
}

/// Random handle bytes from the system RNG.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleToken {
    data: [u8; FILE_HANDLE_LEN],
}

impl HandleToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let data = bytes.try_into().ok()?;
        Some(Self { data })
    }
}

impl OpaqueFileHandle for HandleToken {
    fn generate() -> Result<Self> {
        let mut data = [0u8; FILE_HANDLE_LEN];
        getrandom::getrandom(&mut data).map_err(|_| Error::bug())?;
        Ok(Self { data })
    }

    fn from_file_handle(file_handle: &FileHandle<'_>) -> WireResult<Self> {
        Self::from_bytes(file_handle.0 .0).ok_or(WireError::BadString)
    }

    fn to_file_handle(&self) -> FileHandle<'_> {
        FileHandle(BinString(&self.data))
    }
}

impl fmt::Display for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.data {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleToken({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_differ() {
        let a = HandleToken::generate().unwrap();
        let b = HandleToken::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wire_conversion() {
        let a = HandleToken::generate().unwrap();
        let fh = a.to_file_handle();
        assert_eq!(fh.0 .0.len(), FILE_HANDLE_LEN);
        assert_eq!(HandleToken::from_file_handle(&fh).unwrap(), a);

        let short = FileHandle(BinString(b"abc"));
        assert_eq!(
            HandleToken::from_file_handle(&short),
            Err(WireError::BadString)
        );
    }
}
