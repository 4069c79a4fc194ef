//! BER tag-length-value encoding, restricted to what LDAP uses.
//!
//! LDAP messages are encoded with the Basic Encoding Rules with the
//! restrictions from RFC 4511 section 5.1: definite lengths only, single byte
//! tags, minimal integer encodings and `0xFF` for boolean TRUE.

use crate::error::DecodeError;

use bytes::{BufMut, Bytes, BytesMut};

/// Universal and class tag constants.
pub mod tag {
    /// BOOLEAN.
    pub const BOOLEAN: u8 = 0x01;
    /// INTEGER.
    pub const INTEGER: u8 = 0x02;
    /// OCTET STRING.
    pub const OCTET_STRING: u8 = 0x04;
    /// NULL.
    pub const NULL: u8 = 0x05;
    /// ENUMERATED.
    pub const ENUMERATED: u8 = 0x0a;
    /// SEQUENCE / SEQUENCE OF (constructed).
    pub const SEQUENCE: u8 = 0x30;
    /// SET / SET OF (constructed).
    pub const SET: u8 = 0x31;

    /// Application class bits.
    pub const APPLICATION: u8 = 0x40;
    /// Context-specific class bits.
    pub const CONTEXT: u8 = 0x80;
    /// Constructed bit.
    pub const CONSTRUCTED: u8 = 0x20;
    /// Mask of the class bits.
    pub const CLASS_MASK: u8 = 0xc0;
    /// Mask of the tag number bits.
    pub const NUMBER_MASK: u8 = 0x1f;

    /// Application tag with the given number.
    #[must_use]
    pub const fn application(number: u8, constructed: bool) -> u8 {
        APPLICATION | (if constructed { CONSTRUCTED } else { 0 }) | number
    }

    /// Context-specific tag with the given number.
    #[must_use]
    pub const fn context(number: u8, constructed: bool) -> u8 {
        CONTEXT | (if constructed { CONSTRUCTED } else { 0 }) | number
    }
}

/// Largest number of length octets accepted in long form.
const MAX_LENGTH_OCTETS: usize = 4;

/// Tag and length of an element, as read from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The identifier octet.
    pub tag: u8,
    /// Number of bytes taken by tag and length.
    pub header_len: usize,
    /// Number of content bytes that follow the header.
    pub content_len: usize,
}

impl Header {
    /// Total size of the element.
    #[must_use]
    pub const fn element_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Parses the tag and length at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed to know the length.
///
/// # Errors
///
/// Returns an error for multi-byte tags, indefinite lengths and length
/// fields longer than four octets.
pub fn parse_header(buf: &[u8]) -> Result<Option<Header>, DecodeError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    if tag & tag::NUMBER_MASK == tag::NUMBER_MASK {
        return Err(DecodeError::UnsupportedTag(tag));
    }

    let Some(&first) = buf.get(1) else {
        return Ok(None);
    };

    if first < 0x80 {
        return Ok(Some(Header {
            tag,
            header_len: 2,
            content_len: usize::from(first),
        }));
    }

    if first == 0x80 {
        return Err(DecodeError::IndefiniteLength);
    }

    let octets = usize::from(first & 0x7f);
    if octets > MAX_LENGTH_OCTETS {
        return Err(DecodeError::InvalidLength);
    }

    let Some(length_bytes) = buf.get(2..2 + octets) else {
        return Ok(None);
    };

    let content_len = length_bytes
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));

    Ok(Some(Header {
        tag,
        header_len: 2 + octets,
        content_len,
    }))
}

/// Appends BER elements to a buffer.
#[derive(Debug, Default)]
pub struct BerWriter {
    buf: BytesMut,
}

impl BerWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer that appends to an existing buffer.
    #[must_use]
    pub const fn from_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the underlying buffer.
    #[must_use]
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    /// Returns the written bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Write an element with the given raw contents.
    pub fn write_raw(&mut self, tag: u8, contents: &[u8]) {
        self.buf.put_u8(tag);
        self.write_length(contents.len());
        self.buf.put_slice(contents);
    }

    /// Write a BOOLEAN-encoded element.
    pub fn write_bool(&mut self, tag: u8, value: bool) {
        self.write_raw(tag, &[if value { 0xff } else { 0x00 }]);
    }

    /// Write an INTEGER-encoded element using the minimal two's complement form.
    pub fn write_integer(&mut self, tag: u8, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_raw(tag, &bytes[start..]);
    }

    /// Write an OCTET STRING-encoded element.
    pub fn write_octet_string(&mut self, tag: u8, value: &[u8]) {
        self.write_raw(tag, value);
    }

    /// Write a NULL-encoded element.
    pub fn write_null(&mut self, tag: u8) {
        self.write_raw(tag, &[]);
    }

    /// Write a constructed element whose contents are produced by `contents`.
    pub fn write_constructed<F>(&mut self, tag: u8, contents: F)
    where
        F: FnOnce(&mut Self),
    {
        self.buf.put_u8(tag);
        let length_at = self.buf.len();
        self.buf.put_u8(0);
        let start = self.buf.len();

        contents(self);

        let len = self.buf.len() - start;
        if len < 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            let short = len as u8;
            self.buf[length_at] = short;
        } else {
            // Long form needs more length octets than the placeholder.
            let body = self.buf.split_off(start);
            self.buf.truncate(length_at);
            self.write_length(len);
            self.buf.unsplit(body);
        }
    }

    fn write_length(&mut self, len: usize) {
        if len < 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            self.buf.put_u8(len as u8);
            return;
        }

        let bytes = (len as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        #[allow(clippy::cast_possible_truncation)]
        self.buf.put_u8(0x80 | (bytes.len() - skip) as u8);
        self.buf.put_slice(&bytes[skip..]);
    }
}

/// Reads BER elements from a buffer without copying their contents.
#[derive(Debug, Clone, Default)]
pub struct BerReader {
    buf: Bytes,
}

impl BerReader {
    /// Create a reader over `buf`.
    #[must_use]
    pub const fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Whether all elements have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Tag of the next element, if any.
    #[must_use]
    pub fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    /// Whether the next element carries `tag`.
    #[must_use]
    pub fn next_is(&self, tag: u8) -> bool {
        self.peek_tag() == Some(tag)
    }

    /// Read the next element, returning its tag and contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed or truncated.
    pub fn read_element(&mut self) -> Result<(u8, Bytes), DecodeError> {
        let header = parse_header(&self.buf)?.ok_or(DecodeError::Truncated)?;
        if self.buf.len() < header.element_len() {
            return Err(DecodeError::Truncated);
        }

        let mut element = self.buf.split_to(header.element_len());
        let contents = element.split_off(header.header_len);
        Ok((header.tag, contents))
    }

    /// Read the next element, which must carry `tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed or carries another tag.
    pub fn read_tagged(&mut self, tag: u8) -> Result<Bytes, DecodeError> {
        match self.peek_tag() {
            None => Err(DecodeError::Truncated),
            Some(actual) if actual != tag => Err(DecodeError::UnexpectedTag {
                expected: tag,
                actual,
            }),
            Some(_) => self.read_element().map(|(_, contents)| contents),
        }
    }

    /// Read a constructed element and return a reader over its contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed or carries another tag.
    pub fn read_constructed(&mut self, tag: u8) -> Result<Self, DecodeError> {
        self.read_tagged(tag).map(Self::new)
    }

    /// Read a BOOLEAN-encoded element.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed.
    pub fn read_bool(&mut self, tag: u8) -> Result<bool, DecodeError> {
        match self.read_tagged(tag)?.as_ref() {
            [value] => Ok(*value != 0),
            _ => Err(DecodeError::InvalidLength),
        }
    }

    /// Read an INTEGER-encoded element.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed or wider than 64 bits.
    pub fn read_integer(&mut self, tag: u8) -> Result<i64, DecodeError> {
        let contents = self.read_tagged(tag)?;
        if contents.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        if contents.len() > 8 {
            return Err(DecodeError::IntegerOverflow);
        }

        let negative = contents[0] & 0x80 != 0;
        let value = contents
            .iter()
            .fold(if negative { -1i64 } else { 0 }, |acc, &b| {
                (acc << 8) | i64::from(b)
            });
        Ok(value)
    }

    /// Read an INTEGER-encoded element that must fit an `i32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed or out of range.
    pub fn read_i32(&mut self, tag: u8) -> Result<i32, DecodeError> {
        i32::try_from(self.read_integer(tag)?).map_err(|_| DecodeError::IntegerOverflow)
    }

    /// Read an OCTET STRING-encoded element.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed.
    pub fn read_octet_string(&mut self, tag: u8) -> Result<Bytes, DecodeError> {
        self.read_tagged(tag)
    }

    /// Read an OCTET STRING-encoded element holding UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is malformed or not UTF-8.
    pub fn read_string(&mut self, tag: u8) -> Result<String, DecodeError> {
        let contents = self.read_tagged(tag)?;
        Ok(std::str::from_utf8(&contents)?.to_owned())
    }

    /// Read the element if it carries `tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the element is present but malformed.
    pub fn read_optional<T, F>(&mut self, tag: u8, read: F) -> Result<Option<T>, DecodeError>
    where
        F: FnOnce(&mut Self, u8) -> Result<T, DecodeError>,
    {
        if self.next_is(tag) {
            read(self, tag).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Read every remaining element with `read`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by `read`.
    pub fn read_all<T, F>(&mut self, mut read: F) -> Result<Vec<T>, DecodeError>
    where
        F: FnMut(&mut Self) -> Result<T, DecodeError>,
    {
        let mut items = Vec::new();
        while !self.is_empty() {
            items.push(read(self)?);
        }
        Ok(items)
    }
}
