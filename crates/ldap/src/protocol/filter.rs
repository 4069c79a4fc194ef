//! Search filters (RFC 4511 section 4.5.1.7).
//!
//! Filters are only ever sent by a client, so this module encodes them and
//! does not parse them back.

use super::ber::{BerWriter, tag};

use bytes::Bytes;

const AND: u8 = tag::context(0, true);
const OR: u8 = tag::context(1, true);
const NOT: u8 = tag::context(2, true);
const EQUALITY_MATCH: u8 = tag::context(3, true);
const SUBSTRINGS: u8 = tag::context(4, true);
const GREATER_OR_EQUAL: u8 = tag::context(5, true);
const LESS_OR_EQUAL: u8 = tag::context(6, true);
const PRESENT: u8 = tag::context(7, false);
const APPROX_MATCH: u8 = tag::context(8, true);
const EXTENSIBLE_MATCH: u8 = tag::context(9, true);

/// A search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// All filters must match.
    And(Vec<Filter>),
    /// Any filter must match.
    Or(Vec<Filter>),
    /// The filter must not match.
    Not(Box<Filter>),
    /// `(attr=value)`
    EqualityMatch {
        /// Attribute description.
        attribute: String,
        /// Assertion value.
        value: Bytes,
    },
    /// `(attr=initial*any*final)`
    Substrings {
        /// Attribute description.
        attribute: String,
        /// Leading substring.
        initial: Option<Bytes>,
        /// Inner substrings, in order.
        any: Vec<Bytes>,
        /// Trailing substring.
        r#final: Option<Bytes>,
    },
    /// `(attr>=value)`
    GreaterOrEqual {
        /// Attribute description.
        attribute: String,
        /// Assertion value.
        value: Bytes,
    },
    /// `(attr<=value)`
    LessOrEqual {
        /// Attribute description.
        attribute: String,
        /// Assertion value.
        value: Bytes,
    },
    /// `(attr=*)`
    Present(String),
    /// `(attr~=value)`
    ApproxMatch {
        /// Attribute description.
        attribute: String,
        /// Assertion value.
        value: Bytes,
    },
    /// `(attr:dn:rule:=value)`
    ExtensibleMatch {
        /// Matching rule OID or name.
        matching_rule: Option<String>,
        /// Attribute description.
        attribute: Option<String>,
        /// Assertion value.
        value: Bytes,
        /// Also match attributes of the entry's DN.
        dn_attributes: bool,
    },
}

impl Filter {
    /// `(attribute=value)`
    #[must_use]
    pub fn equal(attribute: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::EqualityMatch {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// `(attribute=*)`
    #[must_use]
    pub fn present(attribute: impl Into<String>) -> Self {
        Self::Present(attribute.into())
    }

    /// `(&...)`
    #[must_use]
    pub fn and(filters: impl IntoIterator<Item = Self>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    /// `(|...)`
    #[must_use]
    pub fn or(filters: impl IntoIterator<Item = Self>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    /// `(!filter)`
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Self) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Encode the filter, tag included.
    pub fn encode(&self, writer: &mut BerWriter) {
        match self {
            Self::And(filters) => encode_set(writer, AND, filters),
            Self::Or(filters) => encode_set(writer, OR, filters),
            Self::Not(filter) => writer.write_constructed(NOT, |w| filter.encode(w)),
            Self::EqualityMatch { attribute, value } => {
                encode_assertion(writer, EQUALITY_MATCH, attribute, value);
            }
            Self::GreaterOrEqual { attribute, value } => {
                encode_assertion(writer, GREATER_OR_EQUAL, attribute, value);
            }
            Self::LessOrEqual { attribute, value } => {
                encode_assertion(writer, LESS_OR_EQUAL, attribute, value);
            }
            Self::ApproxMatch { attribute, value } => {
                encode_assertion(writer, APPROX_MATCH, attribute, value);
            }
            Self::Present(attribute) => writer.write_octet_string(PRESENT, attribute.as_bytes()),
            Self::Substrings {
                attribute,
                initial,
                any,
                r#final,
            } => writer.write_constructed(SUBSTRINGS, |w| {
                w.write_octet_string(tag::OCTET_STRING, attribute.as_bytes());
                w.write_constructed(tag::SEQUENCE, |w| {
                    if let Some(initial) = initial {
                        w.write_octet_string(tag::context(0, false), initial);
                    }
                    for any in any {
                        w.write_octet_string(tag::context(1, false), any);
                    }
                    if let Some(r#final) = r#final {
                        w.write_octet_string(tag::context(2, false), r#final);
                    }
                });
            }),
            Self::ExtensibleMatch {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => writer.write_constructed(EXTENSIBLE_MATCH, |w| {
                if let Some(rule) = matching_rule {
                    w.write_octet_string(tag::context(1, false), rule.as_bytes());
                }
                if let Some(attribute) = attribute {
                    w.write_octet_string(tag::context(2, false), attribute.as_bytes());
                }
                w.write_octet_string(tag::context(3, false), value);
                // DEFAULT FALSE is omitted
                if *dn_attributes {
                    w.write_bool(tag::context(4, false), true);
                }
            }),
        }
    }
}

impl Default for Filter {
    /// `(objectClass=*)`, which matches every entry.
    fn default() -> Self {
        Self::present("objectClass")
    }
}

fn encode_set(writer: &mut BerWriter, set_tag: u8, filters: &[Filter]) {
    writer.write_constructed(set_tag, |w| {
        for filter in filters {
            filter.encode(w);
        }
    });
}

fn encode_assertion(writer: &mut BerWriter, assertion_tag: u8, attribute: &str, value: &[u8]) {
    writer.write_constructed(assertion_tag, |w| {
        w.write_octet_string(tag::OCTET_STRING, attribute.as_bytes());
        w.write_octet_string(tag::OCTET_STRING, value);
    });
}
