//! Message framing for the LDAP byte stream.
//!
//! LDAP has no framing of its own: each PDU is a single BER `SEQUENCE` whose
//! definite length tells us where it ends. The decoder yields the raw bytes
//! of one message so the pump can peek at the envelope before decoding it.

use super::ber::{parse_header, tag};
use super::message::LdapMessage;
use crate::error::DecodeError;

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum message size (10MB by default).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Codec splitting a byte stream into LDAP messages.
#[derive(Debug, Clone, Copy)]
pub struct LdapCodec {
    max_message_size: usize,
}

impl LdapCodec {
    /// Create a codec with the default size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with a custom size limit.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// The configured size limit.
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for LdapCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_data(error: DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

impl Decoder for LdapCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = parse_header(buf).map_err(invalid_data)? else {
            return Ok(None);
        };

        if header.tag != tag::SEQUENCE {
            return Err(invalid_data(DecodeError::UnexpectedTag {
                expected: tag::SEQUENCE,
                actual: header.tag,
            }));
        }

        let message_len = header.element_len();
        if message_len > self.max_message_size {
            return Err(invalid_data(DecodeError::FrameTooLarge {
                size: message_len,
                max: self.max_message_size,
            }));
        }

        if buf.len() < message_len {
            buf.reserve(message_len - buf.len());
            return Ok(None);
        }

        Ok(Some(buf.split_to(message_len).freeze()))
    }
}

impl Encoder<LdapMessage> for LdapCodec {
    type Error = io::Error;

    fn encode(&mut self, message: LdapMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let start = buf.len();
        message.encode(buf);

        let size = buf.len() - start;
        if size > self.max_message_size {
            buf.truncate(start);
            return Err(invalid_data(DecodeError::FrameTooLarge {
                size,
                max: self.max_message_size,
            }));
        }

        Ok(())
    }
}
