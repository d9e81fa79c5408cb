//! SSH wire format reading/writing for SFTP.
//!
//! Every [`SSHSink`] and [`SSHSource`] carries a [`ParseContext`] since
//! the SFTP layout of several structures depends on the negotiated
//! protocol version and on capabilities advertised by the peer.

#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::{self, Debug};
use std::borrow::Cow;

use pretty_hex::PrettyHex;

use crate::config::SFTP_VERSION_MIN;

/// A generic destination for serializing, used similarly to `serde::Serializer`
pub trait SSHSink {
    fn push(&mut self, v: &[u8]) -> WireResult<()>;
    fn ctx(&self) -> &ParseContext;
}

/// A generic source for a packet, used similarly to `serde::Deserializer`
pub trait SSHSource<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]>;
    fn pos(&self) -> usize;
    fn remaining(&self) -> usize;
    fn ctx(&self) -> &ParseContext;
}

/// Encodes the type in SSH wire format
pub trait SSHEncode {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink;
}

/// Decodes `struct` and `enum`s
pub trait SSHDecode<'de>: Sized {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>;
}

/// A subset of [`Error`](crate::Error) for `SSHEncode` and `SSHDecode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    NoRoom,

    RanOut,

    BadString,

    PacketWrong,

    UnknownPacket { number: u8 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for WireError {}

pub type WireResult<T> = core::result::Result<T, WireError>;

/// Character set used for filenames and other text fields.
///
/// Version 6 allows the `filename-charset` extension to select something
/// other than UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1, every byte is a code point.
    Latin1,
}

impl TextEncoding {
    pub fn decode<'a>(&self, b: &'a [u8]) -> WireResult<Cow<'a, str>> {
        match self {
            TextEncoding::Utf8 => {
                core::str::from_utf8(b).map(Cow::Borrowed).map_err(|_| WireError::BadString)
            }
            TextEncoding::Latin1 => {
                if b.is_ascii() {
                    // ascii is valid utf8
                    Ok(Cow::Borrowed(core::str::from_utf8(b).map_err(|_| WireError::BadString)?))
                } else {
                    Ok(Cow::Owned(b.iter().map(|&c| c as char).collect()))
                }
            }
        }
    }

    /// Characters outside Latin-1 are replaced with `?`.
    pub fn encode<'a>(&self, s: &'a str) -> Cow<'a, [u8]> {
        match self {
            TextEncoding::Utf8 => Cow::Borrowed(s.as_bytes()),
            TextEncoding::Latin1 if s.is_ascii() => Cow::Borrowed(s.as_bytes()),
            TextEncoding::Latin1 => Cow::Owned(
                s.chars().map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')).collect(),
            ),
        }
    }
}

/// Session state that changes how structures are laid out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContext {
    /// Negotiated protocol version.
    pub version: u32,
    pub encoding: TextEncoding,
    /// `supported-attribute-mask` advertised by the peer (version 5+).
    pub supported_attrs: Option<u32>,
    /// `supported-attribute-bits` advertised by the peer (version 5+).
    pub supported_attr_bits: Option<u32>,
}

impl Default for ParseContext {
    fn default() -> Self {
        Self::new(SFTP_VERSION_MIN)
    }
}

impl ParseContext {
    pub fn new(version: u32) -> Self {
        Self { version, encoding: TextEncoding::Utf8, supported_attrs: None, supported_attr_bits: None }
    }
}

///////////////////////////////////////////////

/// Decodes a `T` from a borrowed buffer. Trailing bytes are not an error.
pub fn read_ssh<'a, T: SSHDecode<'a>>(b: &'a [u8], ctx: &ParseContext) -> WireResult<T> {
    let mut s = DecodeBytes::new(b, ctx);
    T::dec(&mut s)
}

/// Encodes `value` into a new buffer.
pub fn write_ssh<T>(value: &T, ctx: &ParseContext) -> WireResult<Vec<u8>>
where
    T: SSHEncode,
{
    let mut s = EncodeVec::new(ctx);
    value.enc(&mut s)?;
    Ok(s.buf)
}

/// A growable sink.
pub struct EncodeVec<'c> {
    pub buf: Vec<u8>,
    ctx: &'c ParseContext,
}

impl<'c> EncodeVec<'c> {
    pub fn new(ctx: &'c ParseContext) -> Self {
        Self { buf: Vec::new(), ctx }
    }
}

impl SSHSink for EncodeVec<'_> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.buf.extend_from_slice(v);
        Ok(())
    }

    fn ctx(&self) -> &ParseContext {
        self.ctx
    }
}

/// A source over a borrowed buffer.
pub struct DecodeBytes<'a, 'c> {
    input: &'a [u8],
    pos: usize,
    ctx: &'c ParseContext,
}

impl<'a, 'c> DecodeBytes<'a, 'c> {
    pub fn new(input: &'a [u8], ctx: &'c ParseContext) -> Self {
        Self { input, pos: 0, ctx }
    }
}

impl<'de> SSHSource<'de> for DecodeBytes<'de, '_> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]> {
        if len > self.input.len() {
            return Err(WireError::RanOut);
        }
        let t;
        (t, self.input) = self.input.split_at(len);
        self.pos += len;
        Ok(t)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.input.len()
    }

    fn ctx(&self) -> &ParseContext {
        self.ctx
    }
}

///////////////////////////////////////////////

/// A SSH style binary string. Serialized as `u32` length followed by the bytes
/// of the slice.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BinString<'a>(pub &'a [u8]);

impl<'a> AsRef<[u8]> for BinString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl Debug for BinString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinString(len={})", self.0.len())
    }
}

impl SSHEncode for BinString<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let len = u32::try_from(self.0.len()).map_err(|_| WireError::NoRoom)?;
        len.enc(s)?;
        s.push(self.0)
    }
}

impl<'de> SSHDecode<'de> for BinString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let len = u32::dec(s)? as usize;
        Ok(BinString(s.take(len)?))
    }
}

/// A text string such as a filename, held as raw bytes off the wire.
///
/// Conversion to `str` uses the session's [`TextEncoding`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TextString<'a>(pub &'a [u8]);

impl<'a> TextString<'a> {
    pub fn as_str(&self) -> WireResult<&'a str> {
        core::str::from_utf8(self.0).map_err(|_| WireError::BadString)
    }

    pub fn decode(&self, ctx: &ParseContext) -> WireResult<Cow<'a, str>> {
        ctx.encoding.decode(self.0)
    }
}

impl<'a> AsRef<[u8]> for TextString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a str> for TextString<'a> {
    fn from(s: &'a str) -> Self {
        TextString(s.as_bytes())
    }
}

impl Debug for TextString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = core::str::from_utf8(self.0);
        if let Ok(s) = s {
            write!(f, "TextString(\"{}\")", s.escape_default())
        } else {
            write!(f, "TextString(not utf8!, {:#?})", self.0.hex_dump())
        }
    }
}

impl SSHEncode for TextString<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        BinString(self.0).enc(s)
    }
}

impl<'de> SSHDecode<'de> for TextString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let len = u32::dec(s)? as usize;
        Ok(TextString(s.take(len)?))
    }
}

///////////////////////////////////////////////

impl SSHEncode for u8 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&[*self])
    }
}

impl SSHEncode for bool {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        (*self as u8).enc(s)
    }
}

impl SSHEncode for u16 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&self.to_be_bytes())
    }
}

impl SSHEncode for u32 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&self.to_be_bytes())
    }
}

impl SSHEncode for u64 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&self.to_be_bytes())
    }
}

impl SSHEncode for i64 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(&self.to_be_bytes())
    }
}

// no length prefix
impl SSHEncode for &[u8] {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        s.push(self)
    }
}

/// Length prefixed, always UTF-8. Used for protocol names.
impl SSHEncode for &str {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        BinString(self.as_bytes()).enc(s)
    }
}

/// Length prefixed, in the session's text encoding.
impl SSHEncode for String {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        let b = s.ctx().encoding.encode(self);
        BinString(&b).enc(s)
    }
}

impl<T: SSHEncode> SSHEncode for Option<T> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where
        S: SSHSink,
    {
        if let Some(t) = self.as_ref() {
            t.enc(s)?;
        }
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for bool {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(u8::dec(s)? != 0)
    }
}

impl<'de> SSHDecode<'de> for u8 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let t = s.take(1)?;
        Ok(t[0])
    }
}

impl<'de> SSHDecode<'de> for u16 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let t = s.take(core::mem::size_of::<u16>())?;
        let b: [u8; 2] = t.try_into().map_err(|_| WireError::RanOut)?;
        Ok(u16::from_be_bytes(b))
    }
}

impl<'de> SSHDecode<'de> for u32 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let t = s.take(core::mem::size_of::<u32>())?;
        let b: [u8; 4] = t.try_into().map_err(|_| WireError::RanOut)?;
        Ok(u32::from_be_bytes(b))
    }
}

impl<'de> SSHDecode<'de> for u64 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let t = s.take(core::mem::size_of::<u64>())?;
        let b: [u8; 8] = t.try_into().map_err(|_| WireError::RanOut)?;
        Ok(u64::from_be_bytes(b))
    }
}

impl<'de> SSHDecode<'de> for i64 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        Ok(u64::dec(s)? as i64)
    }
}

impl<'de: 'a, 'a> SSHDecode<'de> for &'a str {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let len = u32::dec(s)?;
        let t = s.take(len as usize)?;
        core::str::from_utf8(t).map_err(|_| WireError::BadString)
    }
}

impl<'de> SSHDecode<'de> for String {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where
        S: SSHSource<'de>,
    {
        let t = TextString::dec(s)?;
        Ok(s.ctx().encoding.decode(t.0)?.into_owned())
    }
}
