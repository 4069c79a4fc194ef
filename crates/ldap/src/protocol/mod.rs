//! Wire protocol for LDAPv3.
//!
//! This module contains:
//! - A minimal BER reader and writer
//! - The `LDAPMessage` envelope and its controls
//! - Protocol operations and search filters
//! - Stream framing for `tokio_util::codec`

pub mod ber;
pub mod filter;
pub mod framing;
pub mod message;
pub mod op;

pub use filter::Filter;
pub use framing::{LdapCodec, MAX_MESSAGE_SIZE};
pub use message::{Control, LdapMessage, MessageHeader, MessageId};
pub use op::{
    AddRequest, Authentication, AttributeValueAssertion, BindRequest, BindResponse, Change,
    CompareRequest, DerefAliases, ExtendedRequest, ExtendedResponse, LdapResult,
    ModifyOperation, ModifyRequest, NOTICE_OF_DISCONNECTION_OID, OperationCode,
    PartialAttribute, ProtocolOp, ResultCode, SearchRequest, SearchResultEntry, SearchScope,
    WHO_AM_I_OID,
};
