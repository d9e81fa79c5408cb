//! File attributes, as carried by `ATTRS`, `NAME`, `OPEN`, `SETSTAT` etc.
//!
//! The attribute structure changed in every protocol revision from 3 to 6:
//! which fields exist, their order, the width of the time fields, and
//! whether the file type is explicit. [`Attrs`] holds the union of all
//! revisions as optional fields. The flag word is never stored, it is
//! derived from which fields are present when encoding, then masked
//! to what the negotiated version (and the peer's advertised
//! `supported-attribute-mask`) permits.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use num_enum::{FromPrimitive, IntoPrimitive};
use time::OffsetDateTime;

use crate::sshwire::{
    BinString, DecodeBytes, EncodeVec, ParseContext, SSHDecode, SSHEncode, SSHSink,
    SSHSource, WireResult,
};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum AttrsFlags {
    SSH_FILEXFER_ATTR_SIZE = 0x0000_0001,
    /// Version 3 only
    SSH_FILEXFER_ATTR_UIDGID = 0x0000_0002,
    SSH_FILEXFER_ATTR_PERMISSIONS = 0x0000_0004,
    /// `ACMODTIME` in version 3, `ACCESSTIME` afterwards.
    SSH_FILEXFER_ATTR_ACCESSTIME = 0x0000_0008,
    SSH_FILEXFER_ATTR_CREATETIME = 0x0000_0010,
    SSH_FILEXFER_ATTR_MODIFYTIME = 0x0000_0020,
    SSH_FILEXFER_ATTR_ACL = 0x0000_0040,
    SSH_FILEXFER_ATTR_OWNERGROUP = 0x0000_0080,
    SSH_FILEXFER_ATTR_SUBSECOND_TIMES = 0x0000_0100,
    SSH_FILEXFER_ATTR_BITS = 0x0000_0200,
    SSH_FILEXFER_ATTR_ALLOCATION_SIZE = 0x0000_0400,
    SSH_FILEXFER_ATTR_TEXT_HINT = 0x0000_0800,
    SSH_FILEXFER_ATTR_MIME_TYPE = 0x0000_1000,
    SSH_FILEXFER_ATTR_LINK_COUNT = 0x0000_2000,
    SSH_FILEXFER_ATTR_UNTRANSLATED_NAME = 0x0000_4000,
    SSH_FILEXFER_ATTR_CTIME = 0x0000_8000,
    SSH_FILEXFER_ATTR_EXTENDED = 0x8000_0000,
}

use AttrsFlags::*;

/// Version 3 spelling of the access/modify time flag.
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = SSH_FILEXFER_ATTR_ACCESSTIME as u32;

impl core::ops::AddAssign<AttrsFlags> for u32 {
    fn add_assign(&mut self, other: AttrsFlags) {
        *self |= other as u32;
    }
}

impl core::ops::BitAnd<AttrsFlags> for u32 {
    type Output = u32;

    fn bitand(self, rhs: AttrsFlags) -> Self::Output {
        self & rhs as u32
    }
}

const fn mask(f: &[AttrsFlags]) -> u32 {
    let mut m = 0;
    let mut i = 0;
    while i < f.len() {
        m |= f[i] as u32;
        i += 1;
    }
    m
}

pub const VALID_ATTR_FLAGS_V3: u32 = mask(&[
    SSH_FILEXFER_ATTR_SIZE,
    SSH_FILEXFER_ATTR_UIDGID,
    SSH_FILEXFER_ATTR_PERMISSIONS,
    SSH_FILEXFER_ATTR_ACCESSTIME,
    SSH_FILEXFER_ATTR_EXTENDED,
]);

pub const VALID_ATTR_FLAGS_V4: u32 = mask(&[
    SSH_FILEXFER_ATTR_SIZE,
    SSH_FILEXFER_ATTR_PERMISSIONS,
    SSH_FILEXFER_ATTR_ACCESSTIME,
    SSH_FILEXFER_ATTR_CREATETIME,
    SSH_FILEXFER_ATTR_MODIFYTIME,
    SSH_FILEXFER_ATTR_ACL,
    SSH_FILEXFER_ATTR_OWNERGROUP,
    SSH_FILEXFER_ATTR_SUBSECOND_TIMES,
    SSH_FILEXFER_ATTR_EXTENDED,
]);

pub const VALID_ATTR_FLAGS_V5: u32 = VALID_ATTR_FLAGS_V4 | SSH_FILEXFER_ATTR_BITS as u32;

pub const VALID_ATTR_FLAGS_V6: u32 = VALID_ATTR_FLAGS_V5
    | mask(&[
        SSH_FILEXFER_ATTR_ALLOCATION_SIZE,
        SSH_FILEXFER_ATTR_TEXT_HINT,
        SSH_FILEXFER_ATTR_MIME_TYPE,
        SSH_FILEXFER_ATTR_LINK_COUNT,
        SSH_FILEXFER_ATTR_UNTRANSLATED_NAME,
        SSH_FILEXFER_ATTR_CTIME,
    ]);

/// Flags that may appear on the wire for a protocol version.
pub fn valid_attr_flags(version: u32) -> u32 {
    match version {
        0..=3 => VALID_ATTR_FLAGS_V3,
        4 => VALID_ATTR_FLAGS_V4,
        5 => VALID_ATTR_FLAGS_V5,
        _ => VALID_ATTR_FLAGS_V6,
    }
}

/// Flags actually exchanged, after the version and the peer's
/// `supported-attribute-mask`. The extended bit isn't subject to the mask.
fn effective_flags(flags: u32, ctx: &ParseContext) -> u32 {
    let mut f = flags & valid_attr_flags(ctx.version);
    if ctx.version >= 5 {
        if let Some(sup) = ctx.supported_attrs {
            f &= sup | SSH_FILEXFER_ATTR_EXTENDED as u32;
        }
    }
    f
}

// POSIX format bits within permissions
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Special = 4,
    #[num_enum(default)]
    Unknown = 5,
    // Version 5 onwards
    Socket = 6,
    CharDevice = 7,
    BlockDevice = 8,
    Fifo = 9,
}

impl FileType {
    /// Derives the type from the format bits of a POSIX mode
    pub fn from_permissions(perm: u32) -> Self {
        match perm & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFSOCK => FileType::Socket,
            S_IFCHR => FileType::CharDevice,
            S_IFBLK => FileType::BlockDevice,
            S_IFIFO => FileType::Fifo,
            0 => FileType::Unknown,
            _ => FileType::Special,
        }
    }

    /// POSIX format bits, zero when there is no equivalent.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
            FileType::Socket => S_IFSOCK,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Fifo => S_IFIFO,
            FileType::Special | FileType::Unknown => 0,
        }
    }

    /// Version 4 only knows types 1 to 5.
    fn wire_value(&self, version: u32) -> u8 {
        match self {
            FileType::Socket
            | FileType::CharDevice
            | FileType::BlockDevice
            | FileType::Fifo
                if version < 5 =>
            {
                FileType::Special.into()
            }
            t => (*t).into(),
        }
    }

    /// Character used by `ls -l`
    fn ls_char(&self) -> char {
        match self {
            FileType::Regular => '-',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::Socket => 's',
            FileType::CharDevice => 'c',
            FileType::BlockDevice => 'b',
            FileType::Fifo => 'p',
            FileType::Special | FileType::Unknown => '?',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TextHint {
    KnownText = 0,
    GuessedText = 1,
    KnownBinary = 2,
    GuessedBinary = 3,
    #[num_enum(catch_all)]
    Other(u8),
}

/// A timestamp, seconds since the epoch with optional nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileTime {
    pub secs: i64,
    pub nanos: Option<u32>,
}

impl FileTime {
    pub fn new(secs: i64) -> Self {
        Self { secs, nanos: None }
    }

    pub fn with_nanos(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos: Some(nanos) }
    }
}

impl From<std::time::SystemTime> for FileTime {
    fn from(t: std::time::SystemTime) -> Self {
        match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => FileTime::with_nanos(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                // nanoseconds count forwards from the whole second below
                let d = e.duration();
                let secs = -(d.as_secs() as i64);
                match d.subsec_nanos() {
                    0 => FileTime::with_nanos(secs, 0),
                    n => FileTime::with_nanos(secs - 1, 1_000_000_000 - n),
                }
            }
        }
    }
}

/// An NFSv4 style access control entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ace {
    pub ace_type: u32,
    pub flags: u32,
    pub mask: u32,
    pub who: String,
}

pub const ACE4_ACCESS_ALLOWED_ACE_TYPE: u32 = 0;
pub const ACE4_ACCESS_DENIED_ACE_TYPE: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    /// `acl-flags`, only on the wire for version 6
    pub flags: u32,
    pub aces: Vec<Ace>,
}

impl Acl {
    /// The ACL is carried as a length prefixed string, so it is encoded
    /// separately first.
    fn to_blob(&self, ctx: &ParseContext) -> WireResult<Vec<u8>> {
        let mut s = EncodeVec::new(ctx);
        if ctx.version >= 6 {
            self.flags.enc(&mut s)?;
        }
        (self.aces.len() as u32).enc(&mut s)?;
        for a in &self.aces {
            a.ace_type.enc(&mut s)?;
            a.flags.enc(&mut s)?;
            a.mask.enc(&mut s)?;
            a.who.enc(&mut s)?;
        }
        Ok(s.buf)
    }

    /// Parses within the declared ACL length only. Running out inside
    /// it is an error, unparsed trailing bytes are skipped.
    fn from_blob(b: &[u8], ctx: &ParseContext) -> WireResult<Self> {
        let mut s = DecodeBytes::new(b, ctx);
        let flags = if ctx.version >= 6 { u32::dec(&mut s)? } else { 0 };
        let count = u32::dec(&mut s)?;
        // each entry is at least 16 bytes, don't trust count for allocation
        let mut aces = Vec::with_capacity((count as usize).min(s.remaining() / 16));
        for _ in 0..count {
            aces.push(Ace {
                ace_type: u32::dec(&mut s)?,
                flags: u32::dec(&mut s)?,
                mask: u32::dec(&mut s)?,
                who: String::dec(&mut s)?,
            });
        }
        if s.remaining() > 0 {
            trace!("{} trailing bytes in ACL", s.remaining());
        }
        Ok(Acl { flags, aces })
    }
}

/// A named extended attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtAttr {
    pub name: String,
    pub data: Vec<u8>,
}

/// File attributes
///
/// A field being `Some` is what sets its flag when encoded. Fields that
/// don't exist in the negotiated version are silently omitted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attrs {
    /// Always present on the wire from version 4. For version 3 it is
    /// derived from `permissions` when decoding.
    pub file_type: Option<FileType>,
    pub size: Option<u64>,
    pub allocation_size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub permissions: Option<u32>,
    pub atime: Option<FileTime>,
    pub createtime: Option<FileTime>,
    pub mtime: Option<FileTime>,
    /// Attribute change time
    pub ctime: Option<FileTime>,
    pub acl: Option<Acl>,
    pub attrib_bits: Option<u32>,
    /// `attrib-bits-valid`, version 6 only. Defaults to all bits.
    pub attrib_bits_valid: Option<u32>,
    pub text_hint: Option<TextHint>,
    pub mime_type: Option<String>,
    pub link_count: Option<u32>,
    pub untranslated_name: Option<String>,
    pub extended: Vec<ExtAttr>,
}

// Values for attrib-bits
pub const SSH_FILEXFER_ATTR_FLAGS_READONLY: u32 = 0x0000_0001;
pub const SSH_FILEXFER_ATTR_FLAGS_SYSTEM: u32 = 0x0000_0002;
pub const SSH_FILEXFER_ATTR_FLAGS_HIDDEN: u32 = 0x0000_0004;
pub const SSH_FILEXFER_ATTR_FLAGS_CASE_INSENSITIVE: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_FLAGS_ARCHIVE: u32 = 0x0000_0010;
pub const SSH_FILEXFER_ATTR_FLAGS_ENCRYPTED: u32 = 0x0000_0020;
pub const SSH_FILEXFER_ATTR_FLAGS_COMPRESSED: u32 = 0x0000_0040;
pub const SSH_FILEXFER_ATTR_FLAGS_SPARSE: u32 = 0x0000_0080;
pub const SSH_FILEXFER_ATTR_FLAGS_APPEND_ONLY: u32 = 0x0000_0100;
pub const SSH_FILEXFER_ATTR_FLAGS_IMMUTABLE: u32 = 0x0000_0200;
pub const SSH_FILEXFER_ATTR_FLAGS_SYNC: u32 = 0x0000_0400;

impl Attrs {
    pub fn builder() -> AttrsBuilder {
        AttrsBuilder::default()
    }

    /// Owner as a string, falling back to the numeric uid.
    pub fn owner_name(&self) -> Option<String> {
        self.owner.clone().or_else(|| self.uid.map(|u| u.to_string()))
    }

    /// Group as a string, falling back to the numeric gid.
    pub fn group_name(&self) -> Option<String> {
        self.group.clone().or_else(|| self.gid.map(|g| g.to_string()))
    }

    /// The explicit type, otherwise derived from permissions.
    pub fn kind(&self) -> FileType {
        self.file_type
            .or_else(|| self.permissions.map(FileType::from_permissions))
            .unwrap_or(FileType::Unknown)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileType::Directory
    }

    fn has_subsecond(&self) -> bool {
        [self.atime, self.createtime, self.mtime, self.ctime]
            .iter()
            .flatten()
            .any(|t| t.nanos.is_some())
    }

    /// Flags for the fields present, restricted to those defined by `version`.
    pub fn flags(&self, version: u32) -> u32 {
        let mut flags: u32 = 0;
        if self.size.is_some() {
            flags += SSH_FILEXFER_ATTR_SIZE
        }
        if self.permissions.is_some() {
            flags += SSH_FILEXFER_ATTR_PERMISSIONS
        }
        if version <= 3 {
            if self.uid.is_some() && self.gid.is_some() {
                flags += SSH_FILEXFER_ATTR_UIDGID
            }
            // ACMODTIME is a pair, a lone time fills in the other
            if self.atime.is_some() || self.mtime.is_some() {
                flags += SSH_FILEXFER_ATTR_ACCESSTIME
            }
        } else {
            if self.owner_name().is_some() && self.group_name().is_some() {
                flags += SSH_FILEXFER_ATTR_OWNERGROUP
            }
            if self.atime.is_some() {
                flags += SSH_FILEXFER_ATTR_ACCESSTIME
            }
            if self.createtime.is_some() {
                flags += SSH_FILEXFER_ATTR_CREATETIME
            }
            if self.mtime.is_some() {
                flags += SSH_FILEXFER_ATTR_MODIFYTIME
            }
            if self.acl.is_some() {
                flags += SSH_FILEXFER_ATTR_ACL
            }
            if self.has_subsecond() {
                flags += SSH_FILEXFER_ATTR_SUBSECOND_TIMES
            }
            if self.attrib_bits.is_some() {
                flags += SSH_FILEXFER_ATTR_BITS
            }
            if self.allocation_size.is_some() {
                flags += SSH_FILEXFER_ATTR_ALLOCATION_SIZE
            }
            if self.text_hint.is_some() {
                flags += SSH_FILEXFER_ATTR_TEXT_HINT
            }
            if self.mime_type.is_some() {
                flags += SSH_FILEXFER_ATTR_MIME_TYPE
            }
            if self.link_count.is_some() {
                flags += SSH_FILEXFER_ATTR_LINK_COUNT
            }
            if self.untranslated_name.is_some() {
                flags += SSH_FILEXFER_ATTR_UNTRANSLATED_NAME
            }
            if self.ctime.is_some() {
                flags += SSH_FILEXFER_ATTR_CTIME
            }
        }
        if !self.extended.is_empty() {
            flags += SSH_FILEXFER_ATTR_EXTENDED
        }
        flags & valid_attr_flags(version)
    }

    /// Decodes attributes, returning them and the number of bytes consumed.
    pub fn decode(b: &[u8], ctx: &ParseContext) -> WireResult<(Self, usize)> {
        let mut s = DecodeBytes::new(b, ctx);
        let a = Self::dec(&mut s)?;
        Ok((a, s.pos()))
    }

    pub fn encode(&self, ctx: &ParseContext) -> WireResult<Vec<u8>> {
        let mut s = EncodeVec::new(ctx);
        self.enc(&mut s)?;
        Ok(s.buf)
    }

    fn enc_v3<S: SSHSink>(&self, flags: u32, s: &mut S) -> WireResult<()> {
        // IMPORTANT: Order matters in the encoding/decoding since it will be interpreted together with the flags
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            self.size.unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            self.uid.unwrap_or_default().enc(s)?;
            self.gid.unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            let mut perm = self.permissions.unwrap_or_default();
            if perm & S_IFMT == 0 {
                perm |= self.file_type.map(|t| t.mode_bits()).unwrap_or(0);
            }
            perm.enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_ACCESSTIME != 0 {
            // 32 bit times, truncating
            let atime = self.atime.or(self.mtime).unwrap_or_default();
            let mtime = self.mtime.or(self.atime).unwrap_or_default();
            (atime.secs as u32).enc(s)?;
            (mtime.secs as u32).enc(s)?;
        }
        Ok(())
    }

    fn enc_v4<S: SSHSink>(&self, flags: u32, s: &mut S) -> WireResult<()> {
        let version = s.ctx().version;
        self.kind().wire_value(version).enc(s)?;

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            self.size.unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_ALLOCATION_SIZE != 0 {
            self.allocation_size.unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_OWNERGROUP != 0 {
            self.owner_name().unwrap_or_default().enc(s)?;
            self.group_name().unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            self.permissions.unwrap_or_default().enc(s)?;
        }

        let sub = flags & SSH_FILEXFER_ATTR_SUBSECOND_TIMES != 0;
        let times = [
            (SSH_FILEXFER_ATTR_ACCESSTIME, self.atime),
            (SSH_FILEXFER_ATTR_CREATETIME, self.createtime),
            (SSH_FILEXFER_ATTR_MODIFYTIME, self.mtime),
            (SSH_FILEXFER_ATTR_CTIME, self.ctime),
        ];
        for (f, t) in times {
            if flags & f != 0 {
                let t = t.unwrap_or_default();
                t.secs.enc(s)?;
                if sub {
                    t.nanos.unwrap_or(0).enc(s)?;
                }
            }
        }

        if flags & SSH_FILEXFER_ATTR_ACL != 0 {
            let blob = self.acl.clone().unwrap_or_default().to_blob(s.ctx())?;
            BinString(&blob).enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_BITS != 0 {
            let sup = s.ctx().supported_attr_bits.unwrap_or(u32::MAX);
            (self.attrib_bits.unwrap_or_default() & sup).enc(s)?;
            if version >= 6 {
                (self.attrib_bits_valid.unwrap_or(u32::MAX) & sup).enc(s)?;
            }
        }
        if flags & SSH_FILEXFER_ATTR_TEXT_HINT != 0 {
            u8::from(self.text_hint.unwrap_or(TextHint::KnownBinary)).enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_MIME_TYPE != 0 {
            self.mime_type.clone().unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_LINK_COUNT != 0 {
            self.link_count.unwrap_or_default().enc(s)?;
        }
        if flags & SSH_FILEXFER_ATTR_UNTRANSLATED_NAME != 0 {
            self.untranslated_name.clone().unwrap_or_default().enc(s)?;
        }
        Ok(())
    }

    fn dec_v3<'de, S: SSHSource<'de>>(&mut self, flags: u32, s: &mut S) -> WireResult<()> {
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            self.size = Some(u64::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            self.uid = Some(u32::dec(s)?);
            self.gid = Some(u32::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            let perm = u32::dec(s)?;
            self.permissions = Some(perm);
            self.file_type = Some(FileType::from_permissions(perm));
        }
        if flags & SSH_FILEXFER_ATTR_ACCESSTIME != 0 {
            self.atime = Some(FileTime::new(u32::dec(s)? as i64));
            self.mtime = Some(FileTime::new(u32::dec(s)? as i64));
        }
        Ok(())
    }

    fn dec_v4<'de, S: SSHSource<'de>>(&mut self, flags: u32, s: &mut S) -> WireResult<()> {
        let version = s.ctx().version;
        self.file_type = Some(FileType::from(u8::dec(s)?));

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            self.size = Some(u64::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_ALLOCATION_SIZE != 0 {
            self.allocation_size = Some(u64::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_OWNERGROUP != 0 {
            let owner = String::dec(s)?;
            let group = String::dec(s)?;
            // Some servers send numeric ids as the owner string
            self.uid = owner.parse().ok();
            self.gid = group.parse().ok();
            self.owner = Some(owner);
            self.group = Some(group);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            self.permissions = Some(u32::dec(s)?);
        }

        let sub = flags & SSH_FILEXFER_ATTR_SUBSECOND_TIMES != 0;
        let time = |f: AttrsFlags, s: &mut S| -> WireResult<Option<FileTime>> {
            if flags & f == 0 {
                return Ok(None);
            }
            let secs = i64::dec(s)?;
            let nanos = if sub { Some(u32::dec(s)?) } else { None };
            Ok(Some(FileTime { secs, nanos }))
        };
        self.atime = time(SSH_FILEXFER_ATTR_ACCESSTIME, s)?;
        self.createtime = time(SSH_FILEXFER_ATTR_CREATETIME, s)?;
        self.mtime = time(SSH_FILEXFER_ATTR_MODIFYTIME, s)?;
        self.ctime = time(SSH_FILEXFER_ATTR_CTIME, s)?;

        if flags & SSH_FILEXFER_ATTR_ACL != 0 {
            let blob = BinString::dec(s)?;
            self.acl = Some(Acl::from_blob(blob.0, s.ctx())?);
        }
        if flags & SSH_FILEXFER_ATTR_BITS != 0 {
            self.attrib_bits = Some(u32::dec(s)?);
            if version >= 6 {
                self.attrib_bits_valid = Some(u32::dec(s)?);
            }
        }
        if flags & SSH_FILEXFER_ATTR_TEXT_HINT != 0 {
            self.text_hint = Some(TextHint::from(u8::dec(s)?));
        }
        if flags & SSH_FILEXFER_ATTR_MIME_TYPE != 0 {
            self.mime_type = Some(String::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_LINK_COUNT != 0 {
            self.link_count = Some(u32::dec(s)?);
        }
        if flags & SSH_FILEXFER_ATTR_UNTRANSLATED_NAME != 0 {
            self.untranslated_name = Some(String::dec(s)?);
        }
        Ok(())
    }

    /// An `ls -l` style line, used for the version 3 `longname`.
    pub fn longname(&self, filename: &str) -> String {
        let perm = self.permissions.unwrap_or(0);
        let mut mode = String::with_capacity(10);
        mode.push(self.kind().ls_char());
        for shift in [6u32, 3, 0] {
            let bits = (perm >> shift) & 0o7;
            mode.push(if bits & 4 != 0 { 'r' } else { '-' });
            mode.push(if bits & 2 != 0 { 'w' } else { '-' });
            let special = match shift {
                6 => perm & 0o4000 != 0,
                3 => perm & 0o2000 != 0,
                _ => perm & 0o1000 != 0,
            };
            mode.push(match (bits & 1 != 0, special, shift) {
                (true, true, 0) => 't',
                (false, true, 0) => 'T',
                (true, true, _) => 's',
                (false, true, _) => 'S',
                (true, false, _) => 'x',
                (false, false, _) => '-',
            });
        }

        let mtime = self
            .mtime
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t.secs).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let month = mtime.month().to_string();
        let date = format!(
            "{} {:>2} {:02}:{:02}",
            &month[..3],
            mtime.day(),
            mtime.hour(),
            mtime.minute()
        );

        format!(
            "{} {:>4} {:<8} {:<8} {:>8} {} {}",
            mode,
            self.link_count.unwrap_or(1),
            self.owner_name().unwrap_or_else(|| "0".into()),
            self.group_name().unwrap_or_else(|| "0".into()),
            self.size.unwrap_or(0),
            date,
            filename
        )
    }
}

impl SSHEncode for Attrs {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let version = s.ctx().version;
        let flags = effective_flags(self.flags(version), s.ctx());
        flags.enc(s)?;

        if version <= 3 {
            self.enc_v3(flags, s)?;
        } else {
            self.enc_v4(flags, s)?;
        }

        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            (self.extended.len() as u32).enc(s)?;
            for e in &self.extended {
                e.name.as_str().enc(s)?;
                BinString(&e.data).enc(s)?;
            }
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for Attrs {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let mut attrs = Attrs::default();

        // Some peers send a truncated trailing attrs, treat it as empty
        if s.remaining() < 4 {
            trace!("no attribute flags, {} bytes left", s.remaining());
            return Ok(attrs);
        }
        let wire_flags = u32::dec(s)?;
        let flags = effective_flags(wire_flags, s.ctx());
        if flags != wire_flags {
            debug!("attribute flags {wire_flags:#x} restricted to {flags:#x}");
        }

        if s.ctx().version <= 3 {
            attrs.dec_v3(flags, s)?;
        } else {
            attrs.dec_v4(flags, s)?;
        }

        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = u32::dec(s)?;
            for _ in 0..count {
                let name: &str = SSHDecode::dec(s)?;
                let data = BinString::dec(s)?;
                attrs.extended.push(ExtAttr { name: name.into(), data: data.0.to_vec() });
            }
        }
        Ok(attrs)
    }
}

/// Builds an [`Attrs`] by setting fields in pairs where the wire format
/// requires it.
#[derive(Debug, Default, Clone)]
pub struct AttrsBuilder {
    attrs: Attrs,
}

impl AttrsBuilder {
    pub fn file_type(mut self, t: FileType) -> Self {
        self.attrs.file_type = Some(t);
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.attrs.size = Some(size);
        self
    }

    pub fn allocation_size(mut self, size: u64) -> Self {
        self.attrs.allocation_size = Some(size);
        self
    }

    pub fn uid_gid(mut self, uid: u32, gid: u32) -> Self {
        self.attrs.uid = Some(uid);
        self.attrs.gid = Some(gid);
        self
    }

    pub fn owner_group(mut self, owner: impl Into<String>, group: impl Into<String>) -> Self {
        self.attrs.owner = Some(owner.into());
        self.attrs.group = Some(group.into());
        self
    }

    /// Also sets the file type when the format bits are present.
    pub fn permissions(mut self, perm: u32) -> Self {
        self.attrs.permissions = Some(perm);
        if perm & S_IFMT != 0 {
            self.attrs.file_type = Some(FileType::from_permissions(perm));
        }
        self
    }

    pub fn atime(mut self, t: FileTime) -> Self {
        self.attrs.atime = Some(t);
        self
    }

    pub fn createtime(mut self, t: FileTime) -> Self {
        self.attrs.createtime = Some(t);
        self
    }

    pub fn mtime(mut self, t: FileTime) -> Self {
        self.attrs.mtime = Some(t);
        self
    }

    pub fn ctime(mut self, t: FileTime) -> Self {
        self.attrs.ctime = Some(t);
        self
    }

    pub fn acl(mut self, acl: Acl) -> Self {
        self.attrs.acl = Some(acl);
        self
    }

    pub fn attrib_bits(mut self, bits: u32, valid: u32) -> Self {
        self.attrs.attrib_bits = Some(bits);
        self.attrs.attrib_bits_valid = Some(valid);
        self
    }

    pub fn text_hint(mut self, hint: TextHint) -> Self {
        self.attrs.text_hint = Some(hint);
        self
    }

    pub fn mime_type(mut self, mime: impl Into<String>) -> Self {
        self.attrs.mime_type = Some(mime.into());
        self
    }

    pub fn link_count(mut self, n: u32) -> Self {
        self.attrs.link_count = Some(n);
        self
    }

    pub fn untranslated_name(mut self, name: impl Into<String>) -> Self {
        self.attrs.untranslated_name = Some(name.into());
        self
    }

    pub fn extended(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.attrs.extended.push(ExtAttr { name: name.into(), data: data.into() });
        self
    }

    pub fn build(self) -> Attrs {
        self.attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftplog::init_test_log;
    use crate::sshwire::WireError;
    use pretty_hex::PrettyHex;

    fn ctx(version: u32) -> ParseContext {
        ParseContext::new(version)
    }

    fn roundtrip(a: &Attrs, c: &ParseContext) -> Attrs {
        let b = a.encode(c).unwrap();
        trace!("encoded v{} {:?}", c.version, b.hex_dump());
        let (d, used) = Attrs::decode(&b, c).unwrap();
        assert_eq!(used, b.len());
        d
    }

    /// A fully populated set, legal for `version` and in the form the
    /// decoder produces.
    fn full_attrs(version: u32) -> Vec<Attrs> {
        let mut fields = vec![
            Attrs { size: Some(1234567890123), ..Default::default() },
            Attrs { permissions: Some(0o100644), ..Default::default() },
            Attrs { extended: vec![ExtAttr { name: "x@example.com".into(), data: vec![1, 2, 3] }], ..Default::default() },
        ];
        if version <= 3 {
            fields.push(Attrs { uid: Some(1000), gid: Some(100), ..Default::default() });
            fields.push(Attrs { atime: Some(FileTime::new(1_600_000_000)), mtime: Some(FileTime::new(1_700_000_000)), ..Default::default() });
        } else {
            fields.push(Attrs { owner: Some("alice".into()), group: Some("staff".into()), ..Default::default() });
            fields.push(Attrs { atime: Some(FileTime::new(-5)), ..Default::default() });
            fields.push(Attrs { createtime: Some(FileTime::new(1_500_000_000)), ..Default::default() });
            fields.push(Attrs { mtime: Some(FileTime::new(1_700_000_000)), ..Default::default() });
            fields.push(Attrs {
                acl: Some(Acl {
                    flags: if version >= 6 { 3 } else { 0 },
                    aces: vec![Ace { ace_type: ACE4_ACCESS_ALLOWED_ACE_TYPE, flags: 0, mask: 0x7, who: "OWNER@".into() }],
                }),
                ..Default::default()
            });
        }
        if version == 5 {
            fields.push(Attrs { attrib_bits: Some(SSH_FILEXFER_ATTR_FLAGS_HIDDEN), ..Default::default() });
        }
        if version >= 6 {
            fields.push(Attrs { attrib_bits: Some(SSH_FILEXFER_ATTR_FLAGS_HIDDEN), attrib_bits_valid: Some(0xff), ..Default::default() });
            fields.push(Attrs { allocation_size: Some(4096), ..Default::default() });
            fields.push(Attrs { text_hint: Some(TextHint::GuessedText), ..Default::default() });
            fields.push(Attrs { mime_type: Some("text/plain".into()), ..Default::default() });
            fields.push(Attrs { link_count: Some(2), ..Default::default() });
            fields.push(Attrs { untranslated_name: Some("raw".into()), ..Default::default() });
            fields.push(Attrs { ctime: Some(FileTime::new(42)), ..Default::default() });
        }
        fields
    }

    fn merge(a: &mut Attrs, b: &Attrs) {
        macro_rules! m {
            ($($f:ident),*) => { $( if b.$f.is_some() { a.$f = b.$f.clone(); } )* };
        }
        m!(size, allocation_size, uid, gid, owner, group, permissions, atime, createtime,
            mtime, ctime, acl, attrib_bits, attrib_bits_valid, text_hint, mime_type,
            link_count, untranslated_name);
        a.extended.extend(b.extended.iter().cloned());
    }

    #[test]
    fn roundtrip_all_field_combinations() {
        init_test_log();
        for version in 3..=6 {
            let c = ctx(version);
            let fields = full_attrs(version);
            for combo in 0u32..(1 << fields.len()) {
                let mut a = Attrs::default();
                for (i, f) in fields.iter().enumerate() {
                    if combo & (1 << i) != 0 {
                        merge(&mut a, f);
                    }
                }
                // decoded type is always explicit from version 4, or
                // derived from permissions for version 3
                if version > 3 || a.permissions.is_some() {
                    a.file_type = Some(a.kind());
                }
                let d = roundtrip(&a, &c);
                assert_eq!(d, a, "version {version} combination {combo:#x}");
            }
        }
    }

    #[test]
    fn flags_mirror_fields() {
        let a = Attrs::builder().size(10).permissions(0o644).build();
        assert_eq!(a.flags(3), (SSH_FILEXFER_ATTR_SIZE as u32) | SSH_FILEXFER_ATTR_PERMISSIONS as u32);
        let mut a = a;
        a.size = None;
        assert_eq!(a.flags(6), SSH_FILEXFER_ATTR_PERMISSIONS as u32);
        a.permissions = None;
        assert_eq!(a.flags(6), 0);
    }

    #[test]
    fn v6_fields_omitted_for_v3() {
        let a = Attrs::builder()
            .size(5)
            .allocation_size(4096)
            .mime_type("text/plain")
            .link_count(3)
            .ctime(FileTime::new(7))
            .build();
        let c = ctx(3);
        let b = a.encode(&c).unwrap();
        // flags + size only
        assert_eq!(b, [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 5]);

        let c6 = ctx(6);
        let flags = read_flags(&a.encode(&c6).unwrap());
        assert_ne!(flags & SSH_FILEXFER_ATTR_MIME_TYPE, 0);
        assert_ne!(flags & SSH_FILEXFER_ATTR_LINK_COUNT, 0);
    }

    fn read_flags(b: &[u8]) -> u32 {
        u32::from_be_bytes(b[..4].try_into().unwrap())
    }

    #[test]
    fn v3_type_from_permissions() {
        let c = ctx(3);
        for (mode, t) in [
            (S_IFDIR | 0o755, FileType::Directory),
            (S_IFLNK | 0o777, FileType::Symlink),
            (S_IFREG | 0o600, FileType::Regular),
            (S_IFSOCK, FileType::Socket),
            (S_IFCHR, FileType::CharDevice),
            (S_IFBLK, FileType::BlockDevice),
            (S_IFIFO, FileType::Fifo),
            (0o170000 & 0o110000, FileType::Special),
        ] {
            // the explicit type is overridden by the mode
            let a = Attrs { permissions: Some(mode), file_type: Some(FileType::Regular), ..Default::default() };
            let d = roundtrip(&a, &c);
            assert_eq!(d.file_type, Some(t), "mode {mode:o}");
        }
    }

    #[test]
    fn v3_encodes_type_into_mode() {
        let a = Attrs { permissions: Some(0o755), file_type: Some(FileType::Directory), ..Default::default() };
        let d = roundtrip(&a, &ctx(3));
        assert_eq!(d.permissions, Some(S_IFDIR | 0o755));
    }

    #[test]
    fn v4_owner_numeric_fallback() {
        let c = ctx(4);
        let a = Attrs::builder().owner_group("1000", "wheel").build();
        let d = roundtrip(&a, &c);
        assert_eq!(d.uid, Some(1000));
        assert_eq!(d.gid, None);
        assert_eq!(d.owner.as_deref(), Some("1000"));
        assert_eq!(d.group.as_deref(), Some("wheel"));

        // numeric only attributes are sent as strings
        let a = Attrs::builder().uid_gid(5, 6).build();
        let d = roundtrip(&a, &c);
        assert_eq!(d.owner.as_deref(), Some("5"));
        assert_eq!((d.uid, d.gid), (Some(5), Some(6)));
    }

    #[test]
    fn v4_special_types_downgraded() {
        let a = Attrs { file_type: Some(FileType::Fifo), ..Default::default() };
        assert_eq!(roundtrip(&a, &ctx(4)).file_type, Some(FileType::Special));
        assert_eq!(roundtrip(&a, &ctx(5)).file_type, Some(FileType::Fifo));
    }

    #[test]
    fn subsecond_times() {
        let c = ctx(4);
        let a = Attrs { atime: Some(FileTime::with_nanos(10, 500)), mtime: Some(FileTime::new(20)), ..Default::default() };
        let d = roundtrip(&a, &c);
        assert_eq!(d.atime, Some(FileTime::with_nanos(10, 500)));
        // once subsecond is flagged every time carries nanoseconds
        assert_eq!(d.mtime, Some(FileTime::with_nanos(20, 0)));
    }

    #[test]
    fn v3_lone_time_fills_pair() {
        let c = ctx(3);
        let a = Attrs { mtime: Some(FileTime::new(1_700_000_000)), ..Default::default() };
        let d = roundtrip(&a, &c);
        assert_eq!(d.mtime, Some(FileTime::new(1_700_000_000)));
        assert_eq!(d.atime, Some(FileTime::new(1_700_000_000)));

        let a = Attrs { atime: Some(FileTime::new(99)), ..Default::default() };
        let d = roundtrip(&a, &c);
        assert_eq!(d.mtime, Some(FileTime::new(99)));
    }

    #[test]
    fn system_time_before_epoch() {
        use std::time::{Duration, UNIX_EPOCH};
        let t = UNIX_EPOCH - Duration::new(5, 250_000_000);
        assert_eq!(FileTime::from(t), FileTime::with_nanos(-6, 750_000_000));
        let t = UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(FileTime::from(t), FileTime::with_nanos(-5, 0));
        let t = UNIX_EPOCH + Duration::new(5, 250_000_000);
        assert_eq!(FileTime::from(t), FileTime::with_nanos(5, 250_000_000));
    }

    #[test]
    fn short_flags_is_empty() {
        let c = ctx(6);
        let (a, used) = Attrs::decode(&[0, 0], &c).unwrap();
        assert_eq!(a, Attrs::default());
        assert_eq!(used, 0);
    }

    #[test]
    fn truncated_field_is_error() {
        let c = ctx(3);
        // size flagged, only 4 bytes of it
        let r = Attrs::decode(&[0, 0, 0, 1, 0, 0, 0, 0], &c);
        assert_eq!(r, Err(WireError::RanOut));
    }

    #[test]
    fn acl_length_bounds_parse() {
        let c = ctx(4);
        let a = Attrs::builder()
            .acl(Acl { flags: 0, aces: vec![Ace { ace_type: 1, flags: 2, mask: 3, who: "bob".into() }] })
            .size(9)
            .build();
        let mut b = a.encode(&c).unwrap();
        // flags(4) type(1) size(8) then the acl string length
        let len_pos = 4 + 1 + 8;
        let len = u32::from_be_bytes(b[len_pos..len_pos + 4].try_into().unwrap());
        // pad the acl with two junk bytes inside its declared length
        b.splice(len_pos + 4 + len as usize..len_pos + 4 + len as usize, [0xaa, 0xbb]);
        b[len_pos..len_pos + 4].copy_from_slice(&(len + 2).to_be_bytes());
        b.extend_from_slice(&[9, 9, 9]);
        let (d, used) = Attrs::decode(&b, &c).unwrap();
        assert_eq!(d.acl, a.acl);
        assert_eq!(used, b.len() - 3, "trailing bytes belong to the next field");

        // declared length too short for the entries
        let mut short = a.encode(&c).unwrap();
        short[len_pos..len_pos + 4].copy_from_slice(&6u32.to_be_bytes());
        assert!(Attrs::decode(&short, &c).is_err());
    }

    #[test]
    fn supported_mask_intersection() {
        let mut c = ctx(5);
        c.supported_attrs = Some(SSH_FILEXFER_ATTR_SIZE as u32);
        let a = Attrs::builder().size(3).permissions(0o600).build();
        let b = a.encode(&c).unwrap();
        assert_eq!(read_flags(&b), SSH_FILEXFER_ATTR_SIZE as u32);

        // a sender flagging a field we didn't advertise isn't honoured
        let full = a.encode(&ctx(5)).unwrap();
        let (d, _) = Attrs::decode(&full, &c).unwrap();
        assert_eq!(d.size, Some(3));
        assert_eq!(d.permissions, None);
    }

    #[test]
    fn supported_bits_masked() {
        let mut c = ctx(6);
        c.supported_attr_bits = Some(SSH_FILEXFER_ATTR_FLAGS_READONLY);
        let a = Attrs::builder()
            .attrib_bits(SSH_FILEXFER_ATTR_FLAGS_READONLY | SSH_FILEXFER_ATTR_FLAGS_HIDDEN, u32::MAX)
            .build();
        let d = roundtrip(&a, &c);
        assert_eq!(d.attrib_bits, Some(SSH_FILEXFER_ATTR_FLAGS_READONLY));
        assert_eq!(d.attrib_bits_valid, Some(SSH_FILEXFER_ATTR_FLAGS_READONLY));
    }

    #[test]
    fn longname_format() {
        let a = Attrs::builder()
            .permissions(S_IFDIR | 0o755)
            .owner_group("root", "wheel")
            .size(4096)
            .mtime(FileTime::new(0))
            .build();
        let l = a.longname("etc");
        assert!(l.starts_with("drwxr-xr-x    1 root     wheel        4096 Jan  1 00:00 etc"), "{l}");
    }
}
