//! SFTP packet definitions, versions 3 to 6.
//!
//! Several packets gained fields in later protocol revisions. Those
//! are decoded according to the [`ParseContext`] version, and trailing
//! optional fields are accepted when absent.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use std::borrow::Cow;

use num_enum::{FromPrimitive, IntoPrimitive};
use paste::paste;

use crate::attrs::Attrs;
use crate::sftpsink::SftpSink;
use crate::sshwire::{
    BinString, DecodeBytes, EncodeVec, ParseContext, SSHDecode, SSHEncode, SSHSink, SSHSource,
    TextString, WireError, WireResult,
};

// Frame layout
pub const SFTP_FIELD_LEN_INDEX: usize = 0;
pub const SFTP_FIELD_LEN_LENGTH: usize = 4;
pub const SFTP_FIELD_ID_INDEX: usize = 4;
pub const SFTP_FIELD_REQ_ID_INDEX: usize = 5;
pub const SFTP_FIELD_REQ_ID_LEN: usize = 4;
/// Length field, type and request id
pub const SFTP_MINIMUM_PACKET_LEN: usize = 9;

// v3 and v4 pflags
pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_APPEND: u32 = 0x0000_0004;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;
pub const SSH_FXF_TEXT: u32 = 0x0000_0040;

// v5+ flags, the low bits are the disposition
pub const SSH_FXF_ACCESS_DISPOSITION: u32 = 0x0000_0007;
pub const SSH_FXF_CREATE_NEW: u32 = 0x0000_0000;
pub const SSH_FXF_CREATE_TRUNCATE: u32 = 0x0000_0001;
pub const SSH_FXF_OPEN_EXISTING: u32 = 0x0000_0002;
pub const SSH_FXF_OPEN_OR_CREATE: u32 = 0x0000_0003;
pub const SSH_FXF_TRUNCATE_EXISTING: u32 = 0x0000_0004;
pub const SSH_FXF_APPEND_DATA: u32 = 0x0000_0008;
pub const SSH_FXF_APPEND_DATA_ATOMIC: u32 = 0x0000_0010;
pub const SSH_FXF_TEXT_MODE: u32 = 0x0000_0020;
pub const SSH_FXF_BLOCK_READ: u32 = 0x0000_0040;
pub const SSH_FXF_BLOCK_WRITE: u32 = 0x0000_0080;
pub const SSH_FXF_BLOCK_DELETE: u32 = 0x0000_0100;

// v5+ desired-access, NFSv4 access mask bits
pub const ACE4_READ_DATA: u32 = 0x0000_0001;
pub const ACE4_WRITE_DATA: u32 = 0x0000_0002;
pub const ACE4_APPEND_DATA: u32 = 0x0000_0004;
pub const ACE4_READ_ATTRIBUTES: u32 = 0x0000_0080;
pub const ACE4_WRITE_ATTRIBUTES: u32 = 0x0000_0100;

// v5+ rename flags
pub const SSH_FXF_RENAME_OVERWRITE: u32 = 0x0000_0001;
pub const SSH_FXF_RENAME_ATOMIC: u32 = 0x0000_0002;
pub const SSH_FXF_RENAME_NATIVE: u32 = 0x0000_0004;

// v6 realpath control byte
pub const SSH_FXP_REALPATH_NO_CHECK: u8 = 0x01;
pub const SSH_FXP_REALPATH_STAT_IF: u8 = 0x02;
pub const SSH_FXP_REALPATH_STAT_ALWAYS: u8 = 0x03;

/// A filename or path, in the session's text encoding on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filename<'a>(pub Cow<'a, str>);

impl<'a> Filename<'a> {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'a> From<&'a str> for Filename<'a> {
    fn from(s: &'a str) -> Self {
        Filename(Cow::Borrowed(s))
    }
}

impl From<String> for Filename<'_> {
    fn from(s: String) -> Self {
        Filename(Cow::Owned(s))
    }
}

impl SSHEncode for Filename<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let b = s.ctx().encoding.encode(&self.0);
        BinString(&b).enc(s)
    }
}

impl<'de> SSHDecode<'de> for Filename<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let t = TextString::dec(s)?;
        Ok(Filename(s.ctx().encoding.decode(t.0)?))
    }
}

/// Opaque handle bytes, as sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle<'a>(pub BinString<'a>);

impl SSHEncode for FileHandle<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for FileHandle<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(FileHandle(BinString::dec(s)?))
    }
}

/// A human readable UTF-8 string. Invalid input is replaced rather than
/// rejected since it is only diagnostic.
fn dec_message<'de, S: SSHSource<'de>>(s: &mut S) -> WireResult<Cow<'de, str>> {
    let t = BinString::dec(s)?;
    Ok(String::from_utf8_lossy(t.0))
}

/// Optional trailing `u32`, present from `min_version` when the sender
/// included it.
fn dec_trailing_u32<'de, S: SSHSource<'de>>(
    s: &mut S,
    min_version: u32,
) -> WireResult<Option<u32>> {
    if s.ctx().version >= min_version && s.remaining() >= 4 {
        Ok(Some(u32::dec(s)?))
    } else {
        Ok(None)
    }
}

fn enc_trailing<T: SSHEncode, S: SSHSink>(
    v: &Option<T>,
    min_version: u32,
    s: &mut S,
) -> WireResult<()> {
    if s.ctx().version >= min_version {
        v.enc(s)?;
    }
    Ok(())
}

/// Generates a struct that is encoded as its fields in order,
/// independent of version.
macro_rules! sftpstruct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident<'a> {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name<'a> {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl SSHEncode for $name<'_> {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where
                S: SSHSink,
            {
                $( self.$field.enc(s)?; )*
                Ok(())
            }
        }

        impl<'de> SSHDecode<'de> for $name<'de> {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where
                S: SSHSource<'de>,
            {
                Ok(Self {
                    $( $field: SSHDecode::dec(s)?, )*
                })
            }
        }
    };
}

/// A name/data pair in `INIT` and `VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtPair<'a> {
    pub name: &'a str,
    pub data: BinString<'a>,
}

impl SSHEncode for ExtPair<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.name.enc(s)?;
        self.data.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ExtPair<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(ExtPair { name: SSHDecode::dec(s)?, data: SSHDecode::dec(s)? })
    }
}

fn dec_ext_pairs<'de, S: SSHSource<'de>>(s: &mut S) -> WireResult<Vec<ExtPair<'de>>> {
    let mut ext = vec![];
    while s.remaining() > 0 {
        ext.push(ExtPair::dec(s)?);
    }
    Ok(ext)
}

/// The client's `SSH_FXP_INIT`. No request id.
#[derive(Debug, Clone)]
pub struct Init<'a> {
    pub version: u32,
    pub extensions: Vec<ExtPair<'a>>,
}

impl SSHEncode for Init<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.version.enc(s)?;
        self.extensions.iter().try_for_each(|e| e.enc(s))
    }
}

impl<'de> SSHDecode<'de> for Init<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(Init { version: u32::dec(s)?, extensions: dec_ext_pairs(s)? })
    }
}

/// The server's `SSH_FXP_VERSION` with its extension advertisements.
#[derive(Debug, Clone)]
pub struct Version<'a> {
    pub version: u32,
    pub extensions: Vec<ExtPair<'a>>,
}

impl SSHEncode for Version<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.version.enc(s)?;
        self.extensions.iter().try_for_each(|e| e.enc(s))
    }
}

impl<'de> SSHDecode<'de> for Version<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(Version { version: u32::dec(s)?, extensions: dec_ext_pairs(s)? })
    }
}

/// Capabilities advertised in the `supported` (version 5) and
/// `supported2` (version 6) `VERSION` extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Supported {
    pub attribute_mask: u32,
    pub attribute_bits: u32,
    pub open_flags: u32,
    pub access_mask: u32,
    /// Zero if the server has no preference
    pub max_read_size: u32,
    /// `supported2` only
    pub open_block_vector: u16,
    /// `supported2` only
    pub block_vector: u16,
    /// `supported2` only
    pub attrib_extensions: Vec<String>,
    pub extensions: Vec<String>,
}

pub const EXT_SUPPORTED: &str = "supported";
pub const EXT_SUPPORTED2: &str = "supported2";
pub const EXT_NEWLINE: &str = "newline";
pub const EXT_VERSIONS: &str = "versions";

impl Supported {
    /// Name of the extension carrying this for a version
    pub fn ext_name(version: u32) -> &'static str {
        if version >= 6 {
            EXT_SUPPORTED2
        } else {
            EXT_SUPPORTED
        }
    }

    /// Encodes the extension data, the `supported2` layout from version 6.
    pub fn to_bytes(&self, version: u32) -> WireResult<Vec<u8>> {
        let ctx = ParseContext::new(version);
        let mut s = EncodeVec::new(&ctx);
        self.attribute_mask.enc(&mut s)?;
        self.attribute_bits.enc(&mut s)?;
        self.open_flags.enc(&mut s)?;
        self.access_mask.enc(&mut s)?;
        self.max_read_size.enc(&mut s)?;
        if version >= 6 {
            self.open_block_vector.enc(&mut s)?;
            self.block_vector.enc(&mut s)?;
            (self.attrib_extensions.len() as u32).enc(&mut s)?;
            for e in &self.attrib_extensions {
                e.enc(&mut s)?;
            }
            (self.extensions.len() as u32).enc(&mut s)?;
        }
        for e in &self.extensions {
            e.enc(&mut s)?;
        }
        Ok(s.buf)
    }

    pub fn from_bytes(b: &[u8], version: u32) -> WireResult<Self> {
        let ctx = ParseContext::new(version);
        let mut s = DecodeBytes::new(b, &ctx);
        let mut sup = Supported {
            attribute_mask: u32::dec(&mut s)?,
            attribute_bits: u32::dec(&mut s)?,
            open_flags: u32::dec(&mut s)?,
            access_mask: u32::dec(&mut s)?,
            max_read_size: u32::dec(&mut s)?,
            ..Default::default()
        };
        if version >= 6 {
            sup.open_block_vector = u16::dec(&mut s)?;
            sup.block_vector = u16::dec(&mut s)?;
            let n = u32::dec(&mut s)?;
            for _ in 0..n {
                sup.attrib_extensions.push(String::dec(&mut s)?);
            }
            let n = u32::dec(&mut s)?;
            for _ in 0..n {
                sup.extensions.push(String::dec(&mut s)?);
            }
        } else {
            while s.remaining() > 0 {
                sup.extensions.push(String::dec(&mut s)?);
            }
        }
        Ok(sup)
    }
}

// Requests

/// `SSH_FXP_OPEN`
///
/// From version 5 `desired_access` is present and `pflags` holds the
/// disposition and append flags rather than read/write bits.
#[derive(Debug, Clone)]
pub struct Open<'a> {
    pub filename: Filename<'a>,
    pub desired_access: Option<u32>,
    pub pflags: u32,
    pub attrs: Attrs,
}

impl SSHEncode for Open<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.filename.enc(s)?;
        if s.ctx().version >= 5 {
            self.desired_access.unwrap_or(0).enc(s)?;
        }
        self.pflags.enc(s)?;
        self.attrs.enc(s)
    }
}

impl<'de> SSHDecode<'de> for Open<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let filename = Filename::dec(s)?;
        let desired_access = if s.ctx().version >= 5 { Some(u32::dec(s)?) } else { None };
        let pflags = u32::dec(s)?;
        let attrs = Attrs::dec(s)?;
        Ok(Open { filename, desired_access, pflags, attrs })
    }
}

sftpstruct! {
    pub struct Close<'a> {
        pub handle: FileHandle<'a>,
    }
}

sftpstruct! {
    pub struct Read<'a> {
        pub handle: FileHandle<'a>,
        pub offset: u64,
        pub len: u32,
    }
}

sftpstruct! {
    pub struct Write<'a> {
        pub handle: FileHandle<'a>,
        pub offset: u64,
        pub data: BinString<'a>,
    }
}

/// Generates a stat request, with the version 4+ trailing attribute flags.
macro_rules! statrequest {
    ($name:ident, $field:ident, $ty:ident) => {
        #[derive(Debug, Clone)]
        pub struct $name<'a> {
            pub $field: $ty<'a>,
            /// Attributes of interest, version 4 onwards
            pub flags: Option<u32>,
        }

        impl SSHEncode for $name<'_> {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where
                S: SSHSink,
            {
                self.$field.enc(s)?;
                enc_trailing(&self.flags, 4, s)
            }
        }

        impl<'de> SSHDecode<'de> for $name<'de> {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where
                S: SSHSource<'de>,
            {
                Ok(Self { $field: SSHDecode::dec(s)?, flags: dec_trailing_u32(s, 4)? })
            }
        }
    };
}

statrequest!(LStat, path, Filename);
statrequest!(FStat, handle, FileHandle);
statrequest!(Stat, path, Filename);

sftpstruct! {
    pub struct SetStat<'a> {
        pub path: Filename<'a>,
        pub attrs: Attrs,
    }
}

sftpstruct! {
    pub struct FSetStat<'a> {
        pub handle: FileHandle<'a>,
        pub attrs: Attrs,
    }
}

sftpstruct! {
    pub struct OpenDir<'a> {
        pub path: Filename<'a>,
    }
}

sftpstruct! {
    pub struct ReadDir<'a> {
        pub handle: FileHandle<'a>,
    }
}

sftpstruct! {
    pub struct Remove<'a> {
        pub filename: Filename<'a>,
    }
}

sftpstruct! {
    pub struct MkDir<'a> {
        pub path: Filename<'a>,
        pub attrs: Attrs,
    }
}

sftpstruct! {
    pub struct RmDir<'a> {
        pub path: Filename<'a>,
    }
}

/// `SSH_FXP_REALPATH`, with the version 6 control byte and compose paths.
#[derive(Debug, Clone)]
pub struct RealPath<'a> {
    pub path: Filename<'a>,
    pub control: Option<u8>,
    /// Appended to `path` in turn, each may be absolute.
    pub compose: Vec<Filename<'a>>,
}

impl SSHEncode for RealPath<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.path.enc(s)?;
        if s.ctx().version >= 6 {
            if let Some(c) = self.control {
                c.enc(s)?;
                for p in &self.compose {
                    p.enc(s)?;
                }
            }
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for RealPath<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let path = Filename::dec(s)?;
        let mut control = None;
        let mut compose = vec![];
        if s.ctx().version >= 6 && s.remaining() > 0 {
            control = Some(u8::dec(s)?);
            while s.remaining() > 0 {
                compose.push(Filename::dec(s)?);
            }
        }
        Ok(RealPath { path, control, compose })
    }
}

/// `SSH_FXP_RENAME`, flags from version 5
#[derive(Debug, Clone)]
pub struct Rename<'a> {
    pub oldpath: Filename<'a>,
    pub newpath: Filename<'a>,
    pub flags: Option<u32>,
}

impl SSHEncode for Rename<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.oldpath.enc(s)?;
        self.newpath.enc(s)?;
        enc_trailing(&self.flags, 5, s)
    }
}

impl<'de> SSHDecode<'de> for Rename<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(Rename {
            oldpath: SSHDecode::dec(s)?,
            newpath: SSHDecode::dec(s)?,
            flags: dec_trailing_u32(s, 5)?,
        })
    }
}

sftpstruct! {
    pub struct ReadLink<'a> {
        pub path: Filename<'a>,
    }
}

sftpstruct! {
    pub struct Symlink<'a> {
        pub linkpath: Filename<'a>,
        pub targetpath: Filename<'a>,
    }
}

sftpstruct! {
    /// Version 6 hard or symbolic link
    pub struct Link<'a> {
        pub new_link_path: Filename<'a>,
        pub existing_path: Filename<'a>,
        pub symlink: bool,
    }
}

sftpstruct! {
    pub struct Block<'a> {
        pub handle: FileHandle<'a>,
        pub offset: u64,
        pub length: u64,
        pub mask: u32,
    }
}

sftpstruct! {
    pub struct Unblock<'a> {
        pub handle: FileHandle<'a>,
        pub offset: u64,
        pub length: u64,
    }
}

/// `SSH_FXP_EXTENDED`. The request specific data is the remainder of the packet.
#[derive(Debug, Clone)]
pub struct Extended<'a> {
    pub request: &'a str,
    pub data: &'a [u8],
}

impl SSHEncode for Extended<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.request.enc(s)?;
        self.data.enc(s)
    }
}

impl<'de> SSHDecode<'de> for Extended<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let request = SSHDecode::dec(s)?;
        let data = s.take(s.remaining())?;
        Ok(Extended { request, data })
    }
}

// Responses

/// `SSH_FXP_STATUS`
#[derive(Debug, Clone)]
pub struct Status<'a> {
    pub code: StatusCode,
    pub message: Cow<'a, str>,
    pub lang: Cow<'a, str>,
}

impl<'a> Status<'a> {
    pub fn new(code: StatusCode, message: impl Into<Cow<'a, str>>) -> Self {
        Status { code, message: message.into(), lang: Cow::Borrowed("en-US") }
    }
}

impl SSHEncode for Status<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.code.enc(s)?;
        BinString(self.message.as_bytes()).enc(s)?;
        BinString(self.lang.as_bytes()).enc(s)
    }
}

impl<'de> SSHDecode<'de> for Status<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let code = StatusCode::dec(s)?;
        // some version 3 servers omit the message and language
        let message = if s.remaining() > 0 { dec_message(s)? } else { Cow::Borrowed("") };
        let lang = if s.remaining() > 0 { dec_message(s)? } else { Cow::Borrowed("") };
        Ok(Status { code, message, lang })
    }
}

sftpstruct! {
    pub struct Handle<'a> {
        pub handle: FileHandle<'a>,
    }
}

/// `SSH_FXP_DATA`, version 6 may flag end of file
#[derive(Debug, Clone)]
pub struct Data<'a> {
    pub data: BinString<'a>,
    pub eof: Option<bool>,
}

impl SSHEncode for Data<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.data.enc(s)?;
        enc_trailing(&self.eof, 6, s)
    }
}

impl<'de> SSHDecode<'de> for Data<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let data = BinString::dec(s)?;
        let eof =
            if s.ctx().version >= 6 && s.remaining() > 0 { Some(bool::dec(s)?) } else { None };
        Ok(Data { data, eof })
    }
}

/// An entry of `SSH_FXP_NAME`
#[derive(Debug, Clone)]
pub struct NameEntry<'a> {
    pub filename: Filename<'a>,
    /// An `ls -l` style line, only sent for version 3. Clients should not parse it.
    pub longname: Filename<'a>,
    pub attrs: Attrs,
}

impl SSHEncode for NameEntry<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.filename.enc(s)?;
        if s.ctx().version <= 3 {
            self.longname.enc(s)?;
        }
        self.attrs.enc(s)
    }
}

impl<'de> SSHDecode<'de> for NameEntry<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let filename = Filename::dec(s)?;
        let longname = if s.ctx().version <= 3 { Filename::dec(s)? } else { Filename::from("") };
        let attrs = Attrs::dec(s)?;
        Ok(NameEntry { filename, longname, attrs })
    }
}

/// `SSH_FXP_NAME`, version 6 may flag the end of a directory listing.
#[derive(Debug, Clone)]
pub struct Name<'a> {
    pub entries: Vec<NameEntry<'a>>,
    pub end_of_list: Option<bool>,
}

impl SSHEncode for Name<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        (self.entries.len() as u32).enc(s)?;
        for e in self.entries.iter() {
            e.enc(s)?;
        }
        enc_trailing(&self.end_of_list, 6, s)
    }
}

impl<'de> SSHDecode<'de> for Name<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let count = u32::dec(s)? as usize;
        // each entry is at least 8 bytes
        let mut entries = Vec::with_capacity(count.min(s.remaining() / 8));
        for _ in 0..count {
            entries.push(NameEntry::dec(s)?);
        }
        let end_of_list =
            if s.ctx().version >= 6 && s.remaining() > 0 { Some(bool::dec(s)?) } else { None };
        Ok(Name { entries, end_of_list })
    }
}

/// `SSH_FXP_ATTRS`
#[derive(Debug, Clone)]
pub struct ResponseAttributes {
    pub attrs: Attrs,
}

impl SSHEncode for ResponseAttributes {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.attrs.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ResponseAttributes {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(ResponseAttributes { attrs: Attrs::dec(s)? })
    }
}

/// `SSH_FXP_EXTENDED_REPLY`, the remainder of the packet.
#[derive(Debug, Clone)]
pub struct ExtendedReply<'a> {
    pub data: &'a [u8],
}

impl SSHEncode for ExtendedReply<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.data.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ExtendedReply<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(ExtendedReply { data: s.take(s.remaining())? })
    }
}

// Requests/Responses data types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId(pub u32);

impl SSHEncode for ReqId {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ReqId {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(ReqId(u32::dec(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum StatusCode {
    SSH_FX_OK = 0,
    SSH_FX_EOF = 1,
    SSH_FX_NO_SUCH_FILE = 2,
    SSH_FX_PERMISSION_DENIED = 3,
    SSH_FX_FAILURE = 4,
    SSH_FX_BAD_MESSAGE = 5,
    SSH_FX_NO_CONNECTION = 6,
    SSH_FX_CONNECTION_LOST = 7,
    SSH_FX_OP_UNSUPPORTED = 8,
    // version 4
    SSH_FX_INVALID_HANDLE = 9,
    SSH_FX_NO_SUCH_PATH = 10,
    SSH_FX_FILE_ALREADY_EXISTS = 11,
    SSH_FX_WRITE_PROTECT = 12,
    SSH_FX_NO_MEDIA = 13,
    // version 5
    SSH_FX_NO_SPACE_ON_FILESYSTEM = 14,
    SSH_FX_QUOTA_EXCEEDED = 15,
    SSH_FX_UNKNOWN_PRINCIPAL = 16,
    SSH_FX_LOCK_CONFLICT = 17,
    SSH_FX_DIR_NOT_EMPTY = 18,
    SSH_FX_NOT_A_DIRECTORY = 19,
    SSH_FX_INVALID_FILENAME = 20,
    SSH_FX_LINK_LOOP = 21,
    // version 6
    SSH_FX_CANNOT_DELETE = 22,
    SSH_FX_INVALID_PARAMETER = 23,
    SSH_FX_FILE_IS_A_DIRECTORY = 24,
    SSH_FX_BYTE_RANGE_LOCK_CONFLICT = 25,
    SSH_FX_BYTE_RANGE_LOCK_REFUSED = 26,
    SSH_FX_DELETE_PENDING = 27,
    SSH_FX_FILE_CORRUPT = 28,
    SSH_FX_OWNER_INVALID = 29,
    SSH_FX_GROUP_INVALID = 30,
    SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK = 31,
    #[num_enum(catch_all)]
    Other(u32),
}

impl StatusCode {
    /// Highest status code defined by a protocol version
    pub fn max_for_version(version: u32) -> u32 {
        match version {
            0..=3 => 8,
            4 => 13,
            5 => 21,
            _ => 31,
        }
    }

    /// Maps a code to one the peer's version defines.
    ///
    /// `NO_SUCH_PATH` becomes `NO_SUCH_FILE`, any other unknown code becomes
    /// `FAILURE`.
    pub fn for_version(self, version: u32) -> StatusCode {
        let n = u32::from(self);
        if n <= Self::max_for_version(version) {
            self
        } else if self == StatusCode::SSH_FX_NO_SUCH_PATH {
            StatusCode::SSH_FX_NO_SUCH_FILE
        } else {
            StatusCode::SSH_FX_FAILURE
        }
    }

    pub fn message(&self) -> &'static str {
        use StatusCode::*;
        match self {
            SSH_FX_OK => "Success",
            SSH_FX_EOF => "End of file",
            SSH_FX_NO_SUCH_FILE => "No such file",
            SSH_FX_PERMISSION_DENIED => "Permission denied",
            SSH_FX_FAILURE => "Failure",
            SSH_FX_BAD_MESSAGE => "Bad message",
            SSH_FX_NO_CONNECTION => "No connection",
            SSH_FX_CONNECTION_LOST => "Connection lost",
            SSH_FX_OP_UNSUPPORTED => "Operation unsupported",
            SSH_FX_INVALID_HANDLE => "Invalid handle",
            SSH_FX_NO_SUCH_PATH => "No such path",
            SSH_FX_FILE_ALREADY_EXISTS => "File already exists",
            SSH_FX_WRITE_PROTECT => "Write protected",
            SSH_FX_NO_MEDIA => "No media",
            SSH_FX_NO_SPACE_ON_FILESYSTEM => "No space on filesystem",
            SSH_FX_QUOTA_EXCEEDED => "Quota exceeded",
            SSH_FX_UNKNOWN_PRINCIPAL => "Unknown principal",
            SSH_FX_LOCK_CONFLICT => "Lock conflict",
            SSH_FX_DIR_NOT_EMPTY => "Directory not empty",
            SSH_FX_NOT_A_DIRECTORY => "Not a directory",
            SSH_FX_INVALID_FILENAME => "Invalid filename",
            SSH_FX_LINK_LOOP => "Link loop",
            SSH_FX_CANNOT_DELETE => "Cannot delete",
            SSH_FX_INVALID_PARAMETER => "Invalid parameter",
            SSH_FX_FILE_IS_A_DIRECTORY => "File is a directory",
            SSH_FX_BYTE_RANGE_LOCK_CONFLICT => "Byte range lock conflict",
            SSH_FX_BYTE_RANGE_LOCK_REFUSED => "Byte range lock refused",
            SSH_FX_DELETE_PENDING => "Delete pending",
            SSH_FX_FILE_CORRUPT => "File corrupt",
            SSH_FX_OWNER_INVALID => "Owner invalid",
            SSH_FX_GROUP_INVALID => "Group invalid",
            SSH_FX_NO_MATCHING_BYTE_RANGE_LOCK => "No matching byte range lock",
            Other(_) => "Unknown error",
        }
    }
}

impl SSHEncode for StatusCode {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        u32::from(*self).enc(s)
    }
}

impl<'de> SSHDecode<'de> for StatusCode {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(StatusCode::from(u32::dec(s)?))
    }
}

macro_rules! sftpmessages {
    (
        init: {
            $( ( $init_message_num:tt,
                $init_packet_variant:ident,
                $init_packet_type:ty,
                $init_ssh_fxp_name:literal
                ),
                 )*
        },
        request: {
            $( ( $request_message_num:tt,
                $request_packet_variant:ident,
                $request_packet_type:ty,
                $request_ssh_fxp_name:literal
                ),
                 )*
        },
        response: {
            $( ( $response_message_num:tt,
                $response_packet_variant:ident,
                $response_packet_type:ty,
                $response_ssh_fxp_name:literal
                ),
                 )*
                },
    ) => {
        paste! {
            /// SFTP packet types, versions 3 to 6
            #[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
            #[repr(u8)]
            #[allow(non_camel_case_types)]
            pub enum SftpNum {
                $(
                    [<$init_ssh_fxp_name:upper>] = $init_message_num,
                )*

                $(
                    [<$request_ssh_fxp_name:upper>] = $request_message_num,
                )*

                $(
                    [<$response_ssh_fxp_name:upper>] = $response_message_num,
                )*

                #[num_enum(catch_all)]
                Other(u8),
            }
        } // paste

        impl SSHEncode for SftpNum {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where
                S: SSHSink,
            {
                u8::from(*self).enc(s)
            }
        }

        impl<'de> SSHDecode<'de> for SftpNum {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where
                S: SSHSource<'de>,
            {
                Ok(SftpNum::from(u8::dec(s)?))
            }
        }

        impl SftpNum {
            pub fn is_init(&self) -> bool {
                matches!(u8::from(*self), 1)
            }

            pub fn is_request(&self) -> bool {
                matches!(u8::from(*self), 3..=23 | 200)
            }

            pub fn is_response(&self) -> bool {
                matches!(u8::from(*self), 2 | 101..=105 | 201)
            }
        }

        /// Top level SFTP packet enum
        ///
        /// Every variant apart from the version exchange (`Init`, `Version`)
        /// carries the request id.
        #[derive(Debug, Clone)]
        pub enum SftpPacket<'a> {
                $(
                    $init_packet_variant($init_packet_type),
                )*
                $(
                    $request_packet_variant(ReqId, $request_packet_type),
                )*
                $(
                    $response_packet_variant(ReqId, $response_packet_type),
                )*
        }

        /// Encodes the type byte, request id and body. Doesn't
        /// include the length field.
        impl SSHEncode for SftpPacket<'_> {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where
                S: SSHSink,
            {
                self.sftp_num().enc(s)?;
                match self {
                    $(
                    SftpPacket::$init_packet_variant(p) => {
                        p.enc(s)?
                    }
                    )*
                    $(
                    SftpPacket::$request_packet_variant(id, p) => {
                        id.enc(s)?;
                        p.enc(s)?
                    }
                    )*
                    $(
                    SftpPacket::$response_packet_variant(id, p) => {
                        id.enc(s)?;
                        p.enc(s)?
                    }
                    )*
                };
                Ok(())
            }
        }

        paste!{
        impl<'a> SSHDecode<'a> for SftpPacket<'a> {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where S: SSHSource<'a> {
                let packet_type_number = u8::dec(s)?;

                let packet_type = SftpNum::from(packet_type_number);

                let decoded_packet = match packet_type {
                    $(
                        SftpNum::[<$init_ssh_fxp_name:upper>] => {
                            let inner_type = <$init_packet_type>::dec(s)?;
                            SftpPacket::$init_packet_variant(inner_type)
                        },
                    )*
                    $(
                        SftpNum::[<$request_ssh_fxp_name:upper>] => {
                            let req_id = <ReqId>::dec(s)?;
                            let inner_type = <$request_packet_type>::dec(s)?;
                            SftpPacket::$request_packet_variant(req_id, inner_type)
                        },
                    )*
                    $(
                        SftpNum::[<$response_ssh_fxp_name:upper>] => {
                            let req_id = <ReqId>::dec(s)?;
                            let inner_type = <$response_packet_type>::dec(s)?;
                            SftpPacket::$response_packet_variant(req_id, inner_type)
                        },
                    )*
                    _ => return Err(WireError::UnknownPacket { number: packet_type_number })
                };
                Ok(decoded_packet)
            }
        }
        } // paste

        impl<'a> SftpPacket<'a> {
            /// Maps `SpecificPacketVariant` to `message_num`
            pub fn sftp_num(&self) -> SftpNum {
                match self {
                    $(
                    SftpPacket::$init_packet_variant(_) => {
                        SftpNum::from($init_message_num as u8)
                    }
                    )*
                    $(
                    SftpPacket::$request_packet_variant(_,_) => {
                        SftpNum::from($request_message_num as u8)
                    }
                    )*
                    $(
                    SftpPacket::$response_packet_variant(_,_) => {
                        SftpNum::from($response_message_num as u8)
                    }
                    )*
                }
            }

            /// The request id, `None` for the version exchange.
            pub fn req_id(&self) -> Option<ReqId> {
                match self {
                    $(
                    SftpPacket::$init_packet_variant(_) => None,
                    )*
                    $(
                    SftpPacket::$request_packet_variant(id, _) => Some(*id),
                    )*
                    $(
                    SftpPacket::$response_packet_variant(id, _) => Some(*id),
                    )*
                }
            }
        }

        $(
        impl<'a> From<$init_packet_type> for SftpPacket<'a> {
            fn from(s: $init_packet_type) -> SftpPacket<'a> {
                SftpPacket::$init_packet_variant(s)
            }
        }
        )*
    }; // main macro

} // sftpmessages macro

sftpmessages! [

        init: {
            (1, Init, Init<'a>, "ssh_fxp_init"),
            (2, Version, Version<'a>, "ssh_fxp_version"),
        },

        request: {
            (3, Open, Open<'a>, "ssh_fxp_open"),
            (4, Close, Close<'a>, "ssh_fxp_close"),
            (5, Read, Read<'a>, "ssh_fxp_read"),
            (6, Write, Write<'a>, "ssh_fxp_write"),
            (7, LStat, LStat<'a>, "ssh_fxp_lstat"),
            (8, FStat, FStat<'a>, "ssh_fxp_fstat"),
            (9, SetStat, SetStat<'a>, "ssh_fxp_setstat"),
            (10, FSetStat, FSetStat<'a>, "ssh_fxp_fsetstat"),
            (11, OpenDir, OpenDir<'a>, "ssh_fxp_opendir"),
            (12, ReadDir, ReadDir<'a>, "ssh_fxp_readdir"),
            (13, Remove, Remove<'a>, "ssh_fxp_remove"),
            (14, MkDir, MkDir<'a>, "ssh_fxp_mkdir"),
            (15, RmDir, RmDir<'a>, "ssh_fxp_rmdir"),
            (16, RealPath, RealPath<'a>, "ssh_fxp_realpath"),
            (17, Stat, Stat<'a>, "ssh_fxp_stat"),
            (18, Rename, Rename<'a>, "ssh_fxp_rename"),
            (19, ReadLink, ReadLink<'a>, "ssh_fxp_readlink"),
            (20, Symlink, Symlink<'a>, "ssh_fxp_symlink"),
            (21, Link, Link<'a>, "ssh_fxp_link"),
            (22, Block, Block<'a>, "ssh_fxp_block"),
            (23, Unblock, Unblock<'a>, "ssh_fxp_unblock"),
            (200, Extended, Extended<'a>, "ssh_fxp_extended"),
        },

        response: {
            (101, Status, Status<'a>, "ssh_fxp_status"),
            (102, Handle, Handle<'a>, "ssh_fxp_handle"),
            (103, Data, Data<'a>, "ssh_fxp_data"),
            (104, Name, Name<'a>, "ssh_fxp_name"),
            (105, Attrs, ResponseAttributes, "ssh_fxp_attrs"),
            (201, ExtendedReply, ExtendedReply<'a>, "ssh_fxp_extended_reply"),
        },
];

impl<'a> SftpPacket<'a> {
    /// Encode a request.
    ///
    /// Used by a SFTP client. Returns the complete frame, including the length field.
    pub fn encode_request(&self, ctx: &ParseContext) -> WireResult<Vec<u8>> {
        if !(self.sftp_num().is_request() || self.sftp_num().is_init()) {
            return Err(WireError::PacketWrong);
        }
        self.encode_frame(ctx)
    }

    /// Encode a response.
    ///
    /// Used by a SFTP server. Returns the complete frame, including the length field.
    pub fn encode_response(&self, ctx: &ParseContext) -> WireResult<Vec<u8>> {
        if !self.sftp_num().is_response() {
            return Err(WireError::PacketWrong);
        }
        self.encode_frame(ctx)
    }

    fn encode_frame(&self, ctx: &ParseContext) -> WireResult<Vec<u8>> {
        let mut s = SftpSink::new(ctx);
        self.enc(&mut s)?;
        s.finalize()
    }

    /// Decode a request. Includes the `INIT` packet.
    ///
    /// Used by a SFTP server. Does not include the length field.
    ///
    /// It will fail if the received packet is a response
    pub fn decode_request<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let p = Self::dec(s)?;
        if !(p.sftp_num().is_request() || p.sftp_num().is_init()) {
            return Err(WireError::PacketWrong);
        }
        Ok(p)
    }

    /// Decode a response, including `VERSION`.
    ///
    /// Used by a SFTP client. Does not include the length field.
    pub fn decode_response<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'a>,
    {
        let p = Self::dec(s)?;
        if !p.sftp_num().is_response() {
            return Err(WireError::PacketWrong);
        }
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::FileType;
    use crate::sftplog::init_test_log;
    use crate::sftpsource::SftpSource;
    use crate::sshwire::{read_ssh, write_ssh};

    fn reparse<'a>(frame: &'a [u8], ctx: &ParseContext) -> SftpPacket<'a> {
        let mut s = SftpSource::new(frame, ctx);
        SftpPacket::dec(&mut s).unwrap()
    }

    #[test]
    fn status_frame_layout() {
        init_test_log();
        let ctx = ParseContext::new(3);
        let p = SftpPacket::Status(ReqId(16), Status::new(StatusCode::SSH_FX_EOF, "A"));
        let frame = p.encode_response(&ctx).unwrap();
        assert_eq!(
            frame,
            [
                0, 0, 0, 23, // len
                101, // type
                0, 0, 0, 16, // id
                0, 0, 0, 1, // SSH_FX_EOF
                0, 0, 0, 1, b'A', // message
                0, 0, 0, 5, b'e', b'n', b'-', b'U', b'S', // lang
            ]
        );
    }

    #[test]
    fn status_without_message() {
        let ctx = ParseContext::new(3);
        let frame = [0u8, 0, 0, 9, 101, 0, 0, 0, 7, 0, 0, 0, 2];
        match reparse(&frame, &ctx) {
            SftpPacket::Status(id, st) => {
                assert_eq!(id, ReqId(7));
                assert_eq!(st.code, StatusCode::SSH_FX_NO_SUCH_FILE);
                assert_eq!(st.message, "");
            }
            p => panic!("{p:?}"),
        }
    }

    #[test]
    fn open_versions() {
        let p = SftpPacket::Open(
            ReqId(1),
            Open {
                filename: "f".into(),
                desired_access: Some(ACE4_READ_DATA),
                pflags: SSH_FXF_OPEN_EXISTING,
                attrs: Attrs::default(),
            },
        );
        let v3 = p.encode_request(&ParseContext::new(3)).unwrap();
        let v5 = p.encode_request(&ParseContext::new(5)).unwrap();
        assert_eq!(v5.len(), v3.len() + 4 + 1, "desired access, type byte");

        match reparse(&v5, &ParseContext::new(5)) {
            SftpPacket::Open(_, o) => {
                assert_eq!(o.desired_access, Some(ACE4_READ_DATA));
                assert_eq!(o.pflags, SSH_FXF_OPEN_EXISTING);
                assert_eq!(o.attrs.file_type, Some(FileType::Unknown));
            }
            p => panic!("{p:?}"),
        }
        match reparse(&v3, &ParseContext::new(3)) {
            SftpPacket::Open(_, o) => assert_eq!(o.desired_access, None),
            p => panic!("{p:?}"),
        }
    }

    #[test]
    fn stat_flags_optional() {
        let ctx = ParseContext::new(4);
        // v4 stat without the trailing flags
        let b = [0u8, 0, 0, 10, 17, 0, 0, 0, 3, 0, 0, 0, 1, b'/'];
        match reparse(&b, &ctx) {
            SftpPacket::Stat(_, st) => {
                assert_eq!(st.path.as_str(), "/");
                assert_eq!(st.flags, None);
            }
            p => panic!("{p:?}"),
        }
    }

    #[test]
    fn name_longname_only_v3() {
        let p = SftpPacket::Name(
            ReqId(2),
            Name {
                entries: vec![NameEntry {
                    filename: "a".into(),
                    longname: "-rw-r--r-- a".into(),
                    attrs: Attrs::default(),
                }],
                end_of_list: Some(true),
            },
        );
        for v in 3..=6 {
            let ctx = ParseContext::new(v);
            let f = p.encode_response(&ctx).unwrap();
            match reparse(&f, &ctx) {
                SftpPacket::Name(_, n) => {
                    assert_eq!(n.entries.len(), 1);
                    let l = &n.entries[0].longname;
                    assert_eq!(l.as_str().is_empty(), v > 3);
                    assert_eq!(n.end_of_list, (v >= 6).then_some(true));
                }
                p => panic!("{p:?}"),
            }
        }
    }

    #[test]
    fn data_eof_v6() {
        let ctx = ParseContext::new(6);
        let p = SftpPacket::Data(ReqId(3), Data { data: BinString(b"xyz"), eof: Some(true) });
        let f = p.encode_response(&ctx).unwrap();
        match reparse(&f, &ctx) {
            SftpPacket::Data(_, d) => {
                assert_eq!(d.data.0, b"xyz");
                assert_eq!(d.eof, Some(true));
            }
            p => panic!("{p:?}"),
        }
        // not sent to version 5
        let f5 = p.encode_response(&ParseContext::new(5)).unwrap();
        assert_eq!(f5.len(), f.len() - 1);
    }

    #[test]
    fn direction_checked() {
        let ctx = ParseContext::new(3);
        let p = SftpPacket::Close(ReqId(1), Close { handle: FileHandle(BinString(b"h")) });
        assert_eq!(p.encode_response(&ctx), Err(WireError::PacketWrong));
        let f = p.encode_request(&ctx).unwrap();
        let mut s = SftpSource::new(&f, &ctx);
        assert!(matches!(SftpPacket::decode_response(&mut s), Err(WireError::PacketWrong)));
    }

    #[test]
    fn unknown_packet() {
        let ctx = ParseContext::new(3);
        let f = [0u8, 0, 0, 5, 99, 0, 0, 0, 1];
        let mut s = SftpSource::new(&f, &ctx);
        assert!(matches!(SftpPacket::dec(&mut s), Err(WireError::UnknownPacket { number: 99 })));
    }

    #[test]
    fn version_extensions() {
        let ctx = ParseContext::new(3);
        let v = Version {
            version: 6,
            extensions: vec![ExtPair { name: "newline", data: BinString(b"\n") }],
        };
        let b = write_ssh(&v, &ctx).unwrap();
        let d: Version = read_ssh(&b, &ctx).unwrap();
        assert_eq!(d.version, 6);
        assert_eq!(d.extensions, v.extensions);
    }

    #[test]
    fn version_has_no_id() {
        let ctx = ParseContext::new(3);
        let p: SftpPacket = Version { version: 3, extensions: vec![] }.into();
        let f = p.encode_response(&ctx).unwrap();
        assert_eq!(f, [0, 0, 0, 5, 2, 0, 0, 0, 3]);
        assert!(p.req_id().is_none());
    }

    #[test]
    fn supported_layouts() {
        let sup = Supported {
            attribute_mask: 0x8000_00fd,
            attribute_bits: 0x7ff,
            max_read_size: 65536,
            block_vector: 3,
            attrib_extensions: vec![],
            extensions: vec!["posix-rename@openssh.com".into()],
            ..Default::default()
        };
        let v6 = sup.to_bytes(6).unwrap();
        assert_eq!(Supported::from_bytes(&v6, 6).unwrap(), sup);

        let v5 = sup.to_bytes(5).unwrap();
        // no block vectors or counts
        assert_eq!(v5.len(), v6.len() - 2 - 2 - 4 - 4);
        let back = Supported::from_bytes(&v5, 5).unwrap();
        assert_eq!(back.attribute_mask, sup.attribute_mask);
        assert_eq!(back.extensions, sup.extensions);
        assert_eq!(back.block_vector, 0);
    }

    #[test]
    fn realpath_compose() {
        let ctx = ParseContext::new(6);
        let p = SftpPacket::RealPath(
            ReqId(9),
            RealPath {
                path: "/a".into(),
                control: Some(SSH_FXP_REALPATH_STAT_IF),
                compose: vec!["b".into(), "c".into()],
            },
        );
        let f = p.encode_request(&ctx).unwrap();
        match reparse(&f, &ctx) {
            SftpPacket::RealPath(_, r) => {
                assert_eq!(r.control, Some(SSH_FXP_REALPATH_STAT_IF));
                assert_eq!(r.compose.len(), 2);
            }
            p => panic!("{p:?}"),
        }
    }

    #[test]
    fn status_downgrade() {
        use StatusCode::*;
        assert_eq!(SSH_FX_NO_SUCH_PATH.for_version(3), SSH_FX_NO_SUCH_FILE);
        assert_eq!(SSH_FX_NO_SUCH_PATH.for_version(4), SSH_FX_NO_SUCH_PATH);
        assert_eq!(SSH_FX_QUOTA_EXCEEDED.for_version(4), SSH_FX_FAILURE);
        assert_eq!(SSH_FX_QUOTA_EXCEEDED.for_version(5), SSH_FX_QUOTA_EXCEEDED);
        assert_eq!(SSH_FX_FILE_IS_A_DIRECTORY.for_version(5), SSH_FX_FAILURE);
        assert_eq!(SSH_FX_FILE_IS_A_DIRECTORY.for_version(6), SSH_FX_FILE_IS_A_DIRECTORY);
        assert_eq!(Other(99).for_version(6), SSH_FX_FAILURE);
        assert_eq!(SSH_FX_OP_UNSUPPORTED.for_version(3), SSH_FX_OP_UNSUPPORTED);
    }
}
