//! The `LDAPMessage` envelope.

use super::ber::{BerReader, BerWriter, tag};
use super::op::{OperationCode, ProtocolOp};
use crate::error::DecodeError;

use bytes::{Bytes, BytesMut};

/// Identifier correlating a request with its responses.
///
/// Valid ids are `0..=i32::MAX`; id 0 is reserved for unsolicited
/// notifications from the server.
pub type MessageId = i32;

const CONTROLS: u8 = tag::context(0, true);

/// A request or response control (RFC 4511 section 4.1.11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// OID of the control.
    pub oid: String,
    /// Whether the server must reject the operation if it cannot honor the control.
    pub criticality: bool,
    /// Control specific value.
    pub value: Option<Bytes>,
}

impl Control {
    /// A non-critical control without a value.
    #[must_use]
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            criticality: false,
            value: None,
        }
    }

    fn encode(&self, writer: &mut BerWriter) {
        writer.write_constructed(tag::SEQUENCE, |w| {
            w.write_octet_string(tag::OCTET_STRING, self.oid.as_bytes());
            if self.criticality {
                w.write_bool(tag::BOOLEAN, true);
            }
            if let Some(value) = &self.value {
                w.write_octet_string(tag::OCTET_STRING, value);
            }
        });
    }

    fn decode(reader: &mut BerReader) -> Result<Self, DecodeError> {
        let mut control = reader.read_constructed(tag::SEQUENCE)?;
        let oid = control.read_string(tag::OCTET_STRING)?;
        let criticality = control
            .read_optional(tag::BOOLEAN, BerReader::read_bool)?
            .unwrap_or(false);
        let value = control.read_optional(tag::OCTET_STRING, BerReader::read_octet_string)?;
        Ok(Self {
            oid,
            criticality,
            value,
        })
    }
}

/// One LDAP protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    /// Correlation id.
    pub message_id: MessageId,
    /// Operation carried by the message.
    pub op: ProtocolOp,
    /// Controls attached to the operation.
    pub controls: Vec<Control>,
}

impl LdapMessage {
    /// A message without controls.
    #[must_use]
    pub const fn new(message_id: MessageId, op: ProtocolOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    /// Attach controls to the message.
    #[must_use]
    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    /// Whether this message ends its response sequence.
    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.op.is_terminating()
    }

    /// Append the encoded message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut writer = BerWriter::from_buffer(std::mem::take(buf));
        writer.write_constructed(tag::SEQUENCE, |w| {
            w.write_integer(tag::INTEGER, i64::from(self.message_id));
            self.op.encode(w);
            if !self.controls.is_empty() {
                w.write_constructed(CONTROLS, |w| {
                    for control in &self.controls {
                        control.encode(w);
                    }
                });
            }
        });
        *buf = writer.into_inner();
    }

    /// Encode the message into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one complete message.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed, carries trailing bytes, has
    /// a negative message id, or holds a request operation.
    pub fn decode(frame: Bytes) -> Result<Self, DecodeError> {
        let mut outer = BerReader::new(frame);
        let mut message = outer.read_constructed(tag::SEQUENCE)?;
        if !outer.is_empty() {
            return Err(DecodeError::InvalidLength);
        }

        let message_id = read_message_id(&mut message)?;
        let (op_tag, contents) = message.read_element()?;
        let op = ProtocolOp::decode(OperationCode::from_tag(op_tag)?, contents)?;
        let controls = message
            .read_optional(CONTROLS, |r, t| {
                r.read_constructed(t)?.read_all(Control::decode)
            })?
            .unwrap_or_default();

        Ok(Self {
            message_id,
            op,
            controls,
        })
    }

    /// Read the message id and operation tag without decoding the operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope or the message id is malformed.
    pub fn peek_header(frame: &Bytes) -> Result<MessageHeader, DecodeError> {
        let mut message = BerReader::new(frame.clone()).read_constructed(tag::SEQUENCE)?;
        let message_id = read_message_id(&mut message)?;
        let tag = message.peek_tag().ok_or(DecodeError::Truncated)?;
        Ok(MessageHeader { message_id, tag })
    }
}

fn read_message_id(reader: &mut BerReader) -> Result<MessageId, DecodeError> {
    let message_id = reader.read_i32(tag::INTEGER)?;
    if message_id < 0 {
        return Err(DecodeError::InvalidValue(format!(
            "negative message id {message_id}"
        )));
    }
    Ok(message_id)
}

/// Envelope fields available without decoding the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Correlation id.
    pub message_id: MessageId,
    /// Identifier octet of the operation.
    pub tag: u8,
}

impl MessageHeader {
    /// Resolve the operation code.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is not a known operation.
    pub fn operation(&self) -> Result<OperationCode, DecodeError> {
        OperationCode::from_tag(self.tag)
    }
}
