//! LDAP protocol operations.
//!
//! Every operation of RFC 4511 that this client speaks is a variant of the
//! closed [`ProtocolOp`] enum. The per-variant behavior (operation code, wire
//! layout, whether a response is expected and whether a message ends a
//! response sequence) lives in one `match` per behavior, so adding a variant
//! forces every table to be extended.

use super::ber::{BerReader, BerWriter, tag};
use super::filter::Filter;
use super::message::MessageId;
use crate::error::{DecodeError, Error, InvalidOperationError};

use std::fmt;

use bytes::Bytes;

/// Wire tag number of each protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationCode {
    /// Bind request.
    BindRequest = 0,
    /// Bind response.
    BindResponse = 1,
    /// Unbind request.
    UnbindRequest = 2,
    /// Search request.
    SearchRequest = 3,
    /// One entry of a search result.
    SearchResultEntry = 4,
    /// Final message of a search.
    SearchResultDone = 5,
    /// Modify request.
    ModifyRequest = 6,
    /// Modify response.
    ModifyResponse = 7,
    /// Add request.
    AddRequest = 8,
    /// Add response.
    AddResponse = 9,
    /// Delete request.
    DelRequest = 10,
    /// Delete response.
    DelResponse = 11,
    /// Compare request.
    CompareRequest = 14,
    /// Compare response.
    CompareResponse = 15,
    /// Abandon request.
    AbandonRequest = 16,
    /// Continuation reference of a search result.
    SearchResultReference = 19,
    /// Extended request.
    ExtendedRequest = 23,
    /// Extended response.
    ExtendedResponse = 24,
}

impl OperationCode {
    /// Whether messages with this code travel from client to server.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::BindRequest
                | Self::UnbindRequest
                | Self::SearchRequest
                | Self::ModifyRequest
                | Self::AddRequest
                | Self::DelRequest
                | Self::CompareRequest
                | Self::AbandonRequest
                | Self::ExtendedRequest
        )
    }

    /// Whether the operation is encoded as a constructed element.
    #[must_use]
    pub const fn is_constructed(self) -> bool {
        !matches!(
            self,
            Self::UnbindRequest | Self::DelRequest | Self::AbandonRequest
        )
    }

    /// The identifier octet used on the wire.
    #[must_use]
    pub const fn tag(self) -> u8 {
        tag::application(self as u8, self.is_constructed())
    }

    /// Resolve an identifier octet read from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is not an application tag of a known
    /// operation, or if its constructed bit does not match the operation.
    pub fn from_tag(wire_tag: u8) -> Result<Self, DecodeError> {
        if wire_tag & tag::CLASS_MASK != tag::APPLICATION {
            return Err(DecodeError::UnknownOperation(wire_tag));
        }
        let code = Self::try_from(wire_tag & tag::NUMBER_MASK)?;
        if code.tag() != wire_tag {
            return Err(DecodeError::UnexpectedTag {
                expected: code.tag(),
                actual: wire_tag,
            });
        }
        Ok(code)
    }
}

impl TryFrom<u8> for OperationCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::BindRequest),
            1 => Ok(Self::BindResponse),
            2 => Ok(Self::UnbindRequest),
            3 => Ok(Self::SearchRequest),
            4 => Ok(Self::SearchResultEntry),
            5 => Ok(Self::SearchResultDone),
            6 => Ok(Self::ModifyRequest),
            7 => Ok(Self::ModifyResponse),
            8 => Ok(Self::AddRequest),
            9 => Ok(Self::AddResponse),
            10 => Ok(Self::DelRequest),
            11 => Ok(Self::DelResponse),
            14 => Ok(Self::CompareRequest),
            15 => Ok(Self::CompareResponse),
            16 => Ok(Self::AbandonRequest),
            19 => Ok(Self::SearchResultReference),
            23 => Ok(Self::ExtendedRequest),
            24 => Ok(Self::ExtendedResponse),
            _ => Err(DecodeError::UnknownOperation(value)),
        }
    }
}

macro_rules! result_codes {
    ($($(#[$doc:meta])* $name:ident = $value:literal,)+) => {
        /// Result code carried by every LDAP response.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResultCode {
            $($(#[$doc])* $name,)+
            /// A code this client does not know by name.
            Unrecognized(i32),
        }

        impl From<i32> for ResultCode {
            fn from(value: i32) -> Self {
                match value {
                    $($value => Self::$name,)+
                    other => Self::Unrecognized(other),
                }
            }
        }

        impl From<ResultCode> for i32 {
            fn from(code: ResultCode) -> Self {
                match code {
                    $(ResultCode::$name => $value,)+
                    ResultCode::Unrecognized(other) => other,
                }
            }
        }
    };
}

result_codes! {
    /// The operation completed.
    Success = 0,
    /// Operation ordering error.
    OperationsError = 1,
    /// The server did not understand the request.
    ProtocolError = 2,
    /// Time limit exceeded.
    TimeLimitExceeded = 3,
    /// Size limit exceeded.
    SizeLimitExceeded = 4,
    /// Compare assertion is false.
    CompareFalse = 5,
    /// Compare assertion is true.
    CompareTrue = 6,
    /// Authentication method not supported.
    AuthMethodNotSupported = 7,
    /// Stronger authentication required.
    StrongerAuthRequired = 8,
    /// Referral to another server.
    Referral = 10,
    /// Administrative limit exceeded.
    AdminLimitExceeded = 11,
    /// A critical control is not supported.
    UnavailableCriticalExtension = 12,
    /// Confidentiality is required.
    ConfidentialityRequired = 13,
    /// SASL bind in progress.
    SaslBindInProgress = 14,
    /// No such attribute.
    NoSuchAttribute = 16,
    /// Undefined attribute type.
    UndefinedAttributeType = 17,
    /// Inappropriate matching.
    InappropriateMatching = 18,
    /// Constraint violation.
    ConstraintViolation = 19,
    /// Attribute or value exists.
    AttributeOrValueExists = 20,
    /// Invalid attribute syntax.
    InvalidAttributeSyntax = 21,
    /// No such object.
    NoSuchObject = 32,
    /// Alias problem.
    AliasProblem = 33,
    /// Invalid DN syntax.
    InvalidDnSyntax = 34,
    /// Alias dereferencing problem.
    AliasDereferencingProblem = 36,
    /// Inappropriate authentication.
    InappropriateAuthentication = 48,
    /// Invalid credentials.
    InvalidCredentials = 49,
    /// Insufficient access rights.
    InsufficientAccessRights = 50,
    /// Server busy.
    Busy = 51,
    /// Server unavailable.
    Unavailable = 52,
    /// Server unwilling to perform.
    UnwillingToPerform = 53,
    /// Loop detected.
    LoopDetect = 54,
    /// Naming violation.
    NamingViolation = 64,
    /// Object class violation.
    ObjectClassViolation = 65,
    /// Not allowed on non-leaf entries.
    NotAllowedOnNonLeaf = 66,
    /// Not allowed on RDN.
    NotAllowedOnRdn = 67,
    /// Entry already exists.
    EntryAlreadyExists = 68,
    /// Object class modifications prohibited.
    ObjectClassModsProhibited = 69,
    /// Affects multiple DSAs.
    AffectsMultipleDsas = 71,
    /// Other error.
    Other = 80,
}

/// The `LDAPResult` components shared by every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    /// Outcome of the operation.
    pub result_code: ResultCode,
    /// Matched DN, for name resolution failures.
    pub matched_dn: String,
    /// Human readable diagnostic from the server.
    pub diagnostic_message: String,
    /// Referral URIs, when the result code is `Referral`.
    pub referral: Vec<String>,
}

impl LdapResult {
    /// A bare result with the given code.
    #[must_use]
    pub const fn new(result_code: ResultCode) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
            referral: Vec::new(),
        }
    }

    /// Whether the result code is `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success
    }

    /// Returns the result if it is a success, or an error carrying it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Result`] for any non-success result code.
    pub fn success(self) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Result(self))
        }
    }

    fn encode(&self, writer: &mut BerWriter) {
        writer.write_integer(tag::ENUMERATED, i64::from(i32::from(self.result_code)));
        writer.write_octet_string(tag::OCTET_STRING, self.matched_dn.as_bytes());
        writer.write_octet_string(tag::OCTET_STRING, self.diagnostic_message.as_bytes());
        if !self.referral.is_empty() {
            writer.write_constructed(REFERRAL, |w| write_strings(w, &self.referral));
        }
    }

    fn decode(reader: &mut BerReader) -> Result<Self, DecodeError> {
        let result_code = ResultCode::from(reader.read_i32(tag::ENUMERATED)?);
        let matched_dn = reader.read_string(tag::OCTET_STRING)?;
        let diagnostic_message = reader.read_string(tag::OCTET_STRING)?;
        let referral = reader
            .read_optional(REFERRAL, |r, t| read_strings(&mut r.read_constructed(t)?))?
            .unwrap_or_default();

        Ok(Self {
            result_code,
            matched_dn,
            diagnostic_message,
            referral,
        })
    }
}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.result_code, i32::from(self.result_code))?;
        if !self.diagnostic_message.is_empty() {
            write!(f, ": {}", self.diagnostic_message)?;
        }
        Ok(())
    }
}

const REFERRAL: u8 = tag::context(3, true);

/// Credentials carried by a bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    /// Simple authentication with a password.
    Simple(Bytes),
    /// SASL authentication.
    Sasl {
        /// SASL mechanism name.
        mechanism: String,
        /// Mechanism specific credentials.
        credentials: Option<Bytes>,
    },
}

/// A bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    /// Protocol version, always 3.
    pub version: u8,
    /// DN (or other name the server accepts) to bind as.
    pub name: String,
    /// Credentials.
    pub authentication: Authentication,
}

impl BindRequest {
    /// A version 3 simple bind.
    #[must_use]
    pub fn simple(name: impl Into<String>, password: impl Into<Bytes>) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: Authentication::Simple(password.into()),
        }
    }

    fn encode(&self, writer: &mut BerWriter) {
        writer.write_integer(tag::INTEGER, i64::from(self.version));
        writer.write_octet_string(tag::OCTET_STRING, self.name.as_bytes());
        match &self.authentication {
            Authentication::Simple(password) => {
                writer.write_octet_string(tag::context(0, false), password);
            }
            Authentication::Sasl {
                mechanism,
                credentials,
            } => writer.write_constructed(tag::context(3, true), |w| {
                w.write_octet_string(tag::OCTET_STRING, mechanism.as_bytes());
                if let Some(credentials) = credentials {
                    w.write_octet_string(tag::OCTET_STRING, credentials);
                }
            }),
        }
    }
}

/// A bind response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    /// Outcome of the bind.
    pub result: LdapResult,
    /// SASL challenge or final data from the server.
    pub server_sasl_creds: Option<Bytes>,
}

const SERVER_SASL_CREDS: u8 = tag::context(7, false);

/// Scope of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    /// Only the base object.
    BaseObject = 0,
    /// Immediate children of the base object.
    SingleLevel = 1,
    /// The base object and its whole subtree.
    #[default]
    WholeSubtree = 2,
}

/// Alias dereferencing policy of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    /// Never dereference aliases.
    #[default]
    Never = 0,
    /// Dereference while searching subordinates.
    InSearching = 1,
    /// Dereference when locating the base object.
    FindingBaseObject = 2,
    /// Always dereference.
    Always = 3,
}

/// A search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Base object of the search.
    pub base: String,
    /// Scope of the search.
    pub scope: SearchScope,
    /// Alias dereferencing policy.
    pub deref_aliases: DerefAliases,
    /// Maximum number of entries, 0 for no client limit.
    pub size_limit: i32,
    /// Maximum time in seconds, 0 for no client limit.
    pub time_limit: i32,
    /// Return attribute descriptions only.
    pub types_only: bool,
    /// Entry filter.
    pub filter: Filter,
    /// Attributes to return; empty for all user attributes.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// A search with default limits returning all user attributes.
    #[must_use]
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base: base.into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }

    /// Restrict the returned attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    fn encode(&self, writer: &mut BerWriter) {
        writer.write_octet_string(tag::OCTET_STRING, self.base.as_bytes());
        writer.write_integer(tag::ENUMERATED, self.scope as i64);
        writer.write_integer(tag::ENUMERATED, self.deref_aliases as i64);
        writer.write_integer(tag::INTEGER, i64::from(self.size_limit));
        writer.write_integer(tag::INTEGER, i64::from(self.time_limit));
        writer.write_bool(tag::BOOLEAN, self.types_only);
        self.filter.encode(writer);
        writer.write_constructed(tag::SEQUENCE, |w| write_strings(w, &self.attributes));
    }
}

/// An attribute description with its values, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    /// Attribute description.
    pub name: String,
    /// Raw attribute values.
    pub values: Vec<Bytes>,
}

impl PartialAttribute {
    /// An attribute with the given values.
    #[must_use]
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn encode(&self, writer: &mut BerWriter) {
        writer.write_constructed(tag::SEQUENCE, |w| {
            w.write_octet_string(tag::OCTET_STRING, self.name.as_bytes());
            w.write_constructed(tag::SET, |w| {
                for value in &self.values {
                    w.write_octet_string(tag::OCTET_STRING, value);
                }
            });
        });
    }

    fn decode(reader: &mut BerReader) -> Result<Self, DecodeError> {
        let mut attribute = reader.read_constructed(tag::SEQUENCE)?;
        let name = attribute.read_string(tag::OCTET_STRING)?;
        let values = attribute
            .read_constructed(tag::SET)?
            .read_all(|r| r.read_octet_string(tag::OCTET_STRING))?;
        Ok(Self { name, values })
    }
}

/// One entry returned by a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    /// DN of the entry.
    pub object_name: String,
    /// Returned attributes.
    pub attributes: Vec<PartialAttribute>,
}

impl SearchResultEntry {
    /// Look up an attribute by description, ignoring case.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&PartialAttribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
    }
}

/// Kind of change in a modify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    /// Add values.
    Add = 0,
    /// Delete values, or the attribute when no values are given.
    Delete = 1,
    /// Replace all values.
    Replace = 2,
}

/// One change of a modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Kind of change.
    pub operation: ModifyOperation,
    /// Attribute and values to apply.
    pub modification: PartialAttribute,
}

/// A modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    /// DN of the entry to modify.
    pub object: String,
    /// Changes, applied in order.
    pub changes: Vec<Change>,
}

/// An add request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    /// DN of the new entry.
    pub entry: String,
    /// Attributes of the new entry.
    pub attributes: Vec<PartialAttribute>,
}

/// An attribute description paired with an assertion value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValueAssertion {
    /// Attribute description.
    pub attribute: String,
    /// Value to compare against.
    pub value: Bytes,
}

impl AttributeValueAssertion {
    /// Create an assertion.
    #[must_use]
    pub fn new(attribute: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub(crate) fn encode_contents(&self, writer: &mut BerWriter) {
        writer.write_octet_string(tag::OCTET_STRING, self.attribute.as_bytes());
        writer.write_octet_string(tag::OCTET_STRING, &self.value);
    }
}

/// A compare request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    /// DN of the entry to compare.
    pub entry: String,
    /// Assertion to evaluate.
    pub assertion: AttributeValueAssertion,
}

/// An extended request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    /// OID of the extended operation.
    pub name: String,
    /// Operation specific value.
    pub value: Option<Bytes>,
}

const EXTENDED_REQUEST_NAME: u8 = tag::context(0, false);
const EXTENDED_REQUEST_VALUE: u8 = tag::context(1, false);

/// An extended response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    /// Outcome of the operation.
    pub result: LdapResult,
    /// OID of the response, if any.
    pub name: Option<String>,
    /// Operation specific value.
    pub value: Option<Bytes>,
}

const EXTENDED_RESPONSE_NAME: u8 = tag::context(10, false);
const EXTENDED_RESPONSE_VALUE: u8 = tag::context(11, false);

/// OID of the unsolicited Notice of Disconnection (RFC 4511 section 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// OID of the "Who am I?" extended operation (RFC 4532).
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// A protocol operation: the body of an LDAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    /// Bind request.
    BindRequest(BindRequest),
    /// Bind response.
    BindResponse(BindResponse),
    /// Unbind request.
    UnbindRequest,
    /// Search request.
    SearchRequest(SearchRequest),
    /// One search result entry.
    SearchResultEntry(SearchResultEntry),
    /// Search continuation reference URIs.
    SearchResultReference(Vec<String>),
    /// End of a search.
    SearchResultDone(LdapResult),
    /// Modify request.
    ModifyRequest(ModifyRequest),
    /// Modify response.
    ModifyResponse(LdapResult),
    /// Add request.
    AddRequest(AddRequest),
    /// Add response.
    AddResponse(LdapResult),
    /// Delete request for the given DN.
    DelRequest(String),
    /// Delete response.
    DelResponse(LdapResult),
    /// Compare request.
    CompareRequest(CompareRequest),
    /// Compare response.
    CompareResponse(LdapResult),
    /// Abandon the operation with the given message id.
    AbandonRequest(MessageId),
    /// Extended request.
    ExtendedRequest(ExtendedRequest),
    /// Extended response.
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    /// The operation code of this variant.
    #[must_use]
    pub const fn code(&self) -> OperationCode {
        match self {
            Self::BindRequest(_) => OperationCode::BindRequest,
            Self::BindResponse(_) => OperationCode::BindResponse,
            Self::UnbindRequest => OperationCode::UnbindRequest,
            Self::SearchRequest(_) => OperationCode::SearchRequest,
            Self::SearchResultEntry(_) => OperationCode::SearchResultEntry,
            Self::SearchResultReference(_) => OperationCode::SearchResultReference,
            Self::SearchResultDone(_) => OperationCode::SearchResultDone,
            Self::ModifyRequest(_) => OperationCode::ModifyRequest,
            Self::ModifyResponse(_) => OperationCode::ModifyResponse,
            Self::AddRequest(_) => OperationCode::AddRequest,
            Self::AddResponse(_) => OperationCode::AddResponse,
            Self::DelRequest(_) => OperationCode::DelRequest,
            Self::DelResponse(_) => OperationCode::DelResponse,
            Self::CompareRequest(_) => OperationCode::CompareRequest,
            Self::CompareResponse(_) => OperationCode::CompareResponse,
            Self::AbandonRequest(_) => OperationCode::AbandonRequest,
            Self::ExtendedRequest(_) => OperationCode::ExtendedRequest,
            Self::ExtendedResponse(_) => OperationCode::ExtendedResponse,
        }
    }

    /// Whether this operation is sent by clients.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        self.code().is_request()
    }

    /// Whether the server answers this operation.
    #[must_use]
    pub const fn has_response(&self) -> bool {
        match self {
            Self::BindRequest(_)
            | Self::SearchRequest(_)
            | Self::ModifyRequest(_)
            | Self::AddRequest(_)
            | Self::DelRequest(_)
            | Self::CompareRequest(_)
            | Self::ExtendedRequest(_) => true,
            Self::UnbindRequest
            | Self::AbandonRequest(_)
            | Self::BindResponse(_)
            | Self::SearchResultEntry(_)
            | Self::SearchResultReference(_)
            | Self::SearchResultDone(_)
            | Self::ModifyResponse(_)
            | Self::AddResponse(_)
            | Self::DelResponse(_)
            | Self::CompareResponse(_)
            | Self::ExtendedResponse(_) => false,
        }
    }

    /// Whether this message is the last of its response sequence.
    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        match self {
            Self::BindResponse(_)
            | Self::SearchResultDone(_)
            | Self::ModifyResponse(_)
            | Self::AddResponse(_)
            | Self::DelResponse(_)
            | Self::CompareResponse(_)
            | Self::ExtendedResponse(_) => true,
            Self::SearchResultEntry(_)
            | Self::SearchResultReference(_)
            | Self::BindRequest(_)
            | Self::UnbindRequest
            | Self::SearchRequest(_)
            | Self::ModifyRequest(_)
            | Self::AddRequest(_)
            | Self::DelRequest(_)
            | Self::CompareRequest(_)
            | Self::AbandonRequest(_)
            | Self::ExtendedRequest(_) => false,
        }
    }

    /// The `LDAPResult` of a response, if this variant carries one.
    #[must_use]
    pub const fn result(&self) -> Option<&LdapResult> {
        match self {
            Self::BindResponse(response) => Some(&response.result),
            Self::ExtendedResponse(response) => Some(&response.result),
            Self::SearchResultDone(result)
            | Self::ModifyResponse(result)
            | Self::AddResponse(result)
            | Self::DelResponse(result)
            | Self::CompareResponse(result) => Some(result),
            _ => None,
        }
    }

    /// Encode the operation, tag included.
    pub fn encode(&self, writer: &mut BerWriter) {
        let op_tag = self.code().tag();
        match self {
            Self::UnbindRequest => writer.write_null(op_tag),
            Self::DelRequest(dn) => writer.write_octet_string(op_tag, dn.as_bytes()),
            Self::AbandonRequest(id) => writer.write_integer(op_tag, i64::from(*id)),
            Self::SearchResultReference(uris) => {
                writer.write_constructed(op_tag, |w| write_strings(w, uris));
            }
            _ => writer.write_constructed(op_tag, |w| self.encode_contents(w)),
        }
    }

    fn encode_contents(&self, writer: &mut BerWriter) {
        match self {
            Self::BindRequest(request) => request.encode(writer),
            Self::BindResponse(response) => {
                response.result.encode(writer);
                if let Some(creds) = &response.server_sasl_creds {
                    writer.write_octet_string(SERVER_SASL_CREDS, creds);
                }
            }
            Self::SearchRequest(request) => request.encode(writer),
            Self::SearchResultEntry(entry) => {
                writer.write_octet_string(tag::OCTET_STRING, entry.object_name.as_bytes());
                writer.write_constructed(tag::SEQUENCE, |w| {
                    for attribute in &entry.attributes {
                        attribute.encode(w);
                    }
                });
            }
            Self::ModifyRequest(request) => {
                writer.write_octet_string(tag::OCTET_STRING, request.object.as_bytes());
                writer.write_constructed(tag::SEQUENCE, |w| {
                    for change in &request.changes {
                        w.write_constructed(tag::SEQUENCE, |w| {
                            w.write_integer(tag::ENUMERATED, change.operation as i64);
                            change.modification.encode(w);
                        });
                    }
                });
            }
            Self::AddRequest(request) => {
                writer.write_octet_string(tag::OCTET_STRING, request.entry.as_bytes());
                writer.write_constructed(tag::SEQUENCE, |w| {
                    for attribute in &request.attributes {
                        attribute.encode(w);
                    }
                });
            }
            Self::CompareRequest(request) => {
                writer.write_octet_string(tag::OCTET_STRING, request.entry.as_bytes());
                writer.write_constructed(tag::SEQUENCE, |w| {
                    request.assertion.encode_contents(w);
                });
            }
            Self::ExtendedRequest(request) => {
                writer.write_octet_string(EXTENDED_REQUEST_NAME, request.name.as_bytes());
                if let Some(value) = &request.value {
                    writer.write_octet_string(EXTENDED_REQUEST_VALUE, value);
                }
            }
            Self::ExtendedResponse(response) => {
                response.result.encode(writer);
                if let Some(name) = &response.name {
                    writer.write_octet_string(EXTENDED_RESPONSE_NAME, name.as_bytes());
                }
                if let Some(value) = &response.value {
                    writer.write_octet_string(EXTENDED_RESPONSE_VALUE, value);
                }
            }
            Self::SearchResultDone(result)
            | Self::ModifyResponse(result)
            | Self::AddResponse(result)
            | Self::DelResponse(result)
            | Self::CompareResponse(result) => result.encode(writer),
            Self::UnbindRequest
            | Self::DelRequest(_)
            | Self::AbandonRequest(_)
            | Self::SearchResultReference(_) => {}
        }
    }

    /// Decode the contents of a response operation.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOperationError::DecodeRequest`] for request codes, and
    /// a decode error if the contents do not match the layout of `code`.
    pub fn decode(code: OperationCode, contents: Bytes) -> Result<Self, DecodeError> {
        if code.is_request() {
            return Err(InvalidOperationError::DecodeRequest(code).into());
        }

        let mut reader = BerReader::new(contents);
        let op = match code {
            OperationCode::BindResponse => {
                let result = LdapResult::decode(&mut reader)?;
                let server_sasl_creds =
                    reader.read_optional(SERVER_SASL_CREDS, BerReader::read_octet_string)?;
                Self::BindResponse(BindResponse {
                    result,
                    server_sasl_creds,
                })
            }
            OperationCode::SearchResultEntry => {
                let object_name = reader.read_string(tag::OCTET_STRING)?;
                let attributes = reader
                    .read_constructed(tag::SEQUENCE)?
                    .read_all(PartialAttribute::decode)?;
                Self::SearchResultEntry(SearchResultEntry {
                    object_name,
                    attributes,
                })
            }
            OperationCode::SearchResultReference => {
                Self::SearchResultReference(read_strings(&mut reader)?)
            }
            OperationCode::SearchResultDone => {
                Self::SearchResultDone(LdapResult::decode(&mut reader)?)
            }
            OperationCode::ModifyResponse => Self::ModifyResponse(LdapResult::decode(&mut reader)?),
            OperationCode::AddResponse => Self::AddResponse(LdapResult::decode(&mut reader)?),
            OperationCode::DelResponse => Self::DelResponse(LdapResult::decode(&mut reader)?),
            OperationCode::CompareResponse => {
                Self::CompareResponse(LdapResult::decode(&mut reader)?)
            }
            OperationCode::ExtendedResponse => {
                let result = LdapResult::decode(&mut reader)?;
                let name = reader.read_optional(EXTENDED_RESPONSE_NAME, BerReader::read_string)?;
                let value =
                    reader.read_optional(EXTENDED_RESPONSE_VALUE, BerReader::read_octet_string)?;
                Self::ExtendedResponse(ExtendedResponse {
                    result,
                    name,
                    value,
                })
            }
            OperationCode::BindRequest
            | OperationCode::UnbindRequest
            | OperationCode::SearchRequest
            | OperationCode::ModifyRequest
            | OperationCode::AddRequest
            | OperationCode::DelRequest
            | OperationCode::CompareRequest
            | OperationCode::AbandonRequest
            | OperationCode::ExtendedRequest => {
                return Err(InvalidOperationError::DecodeRequest(code).into());
            }
        };

        Ok(op)
    }
}

fn write_strings(writer: &mut BerWriter, values: &[String]) {
    for value in values {
        writer.write_octet_string(tag::OCTET_STRING, value.as_bytes());
    }
}

fn read_strings(reader: &mut BerReader) -> Result<Vec<String>, DecodeError> {
    reader.read_all(|r| r.read_string(tag::OCTET_STRING))
}
