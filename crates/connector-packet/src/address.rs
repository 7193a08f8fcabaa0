//! ILP address and routing-prefix types.
//!
//! Reference: [ILP Addresses - v2.0.0](https://github.com/interledger/rfcs/blob/master/0015-ilp-addresses/0015-ilp-addresses.md).

// Addresses are never empty.
#![allow(clippy::len_without_is_empty)]

use std::convert::TryFrom;
use std::fmt;
use std::ops::Deref;
use std::str::{self, FromStr};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const MAX_ADDRESS_LENGTH: usize = 1023;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address too long: {0} bytes")]
    TooLong(usize),
    #[error("invalid allocation scheme")]
    InvalidScheme,
    #[error("invalid address segment")]
    InvalidSegment,
    #[error("address prefix must not end in a separator")]
    TrailingSeparator,
}

/// A validated ILP address.
///
/// Addresses have at least two dot-separated segments, start with a known
/// allocation scheme and contain only `[A-Za-z0-9_~-]` segment bytes. The
/// bytes are guaranteed valid UTF-8, so an `Address` derefs to `str`.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Address(Bytes);

impl Address {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// The allocation scheme, i.e. the first segment.
    pub fn scheme(&self) -> &str {
        self.segments().next().expect("addresses are never empty")
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.deref().split('.')
    }

    /// Creates a new address with the given segment appended.
    pub fn with_suffix(&self, suffix: &str) -> Result<Address, AddressError> {
        let mut new_address = BytesMut::with_capacity(self.len() + 1 + suffix.len());
        new_address.put_slice(self.as_bytes());
        new_address.put_u8(b'.');
        new_address.put_slice(suffix.as_bytes());
        Address::try_from(new_address.freeze())
    }

    /// The routing prefix covering exactly this address.
    pub fn to_prefix(&self) -> AddressPrefix {
        AddressPrefix(self.0.clone())
    }
}

impl Deref for Address {
    type Target = str;

    fn deref(&self) -> &str {
        str::from_utf8(self.0.as_ref()).expect("addresses are always valid utf8")
    }
}

impl AsRef<[u8]> for Address {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        validate_address(src.as_bytes())?;
        Ok(Address(Bytes::copy_from_slice(src.as_bytes())))
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = AddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        validate_address(bytes)?;
        Ok(Address(Bytes::copy_from_slice(bytes)))
    }
}

impl TryFrom<Bytes> for Address {
    type Error = AddressError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        validate_address(bytes.as_ref())?;
        Ok(Address(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.debug_tuple("Address").field(&self.deref()).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = <&str>::deserialize(deserializer)?;
        Address::from_str(string).map_err(de::Error::custom)
    }
}

/// A routing-table key: a chain of address segments that covers every
/// address extending it on a whole-segment boundary.
///
/// Unlike an `Address`, a prefix may be a single segment (`"example"`) and
/// is not required to use a registered allocation scheme. The root prefix
/// (the empty string) is the catch-all and can only be obtained through
/// [`AddressPrefix::root`]. A prefix never ends in a separator.
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct AddressPrefix(Bytes);

impl AddressPrefix {
    /// The global catch-all prefix, matching every address.
    pub fn root() -> Self {
        AddressPrefix(Bytes::new())
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        str::from_utf8(self.0.as_ref()).expect("prefixes are always valid utf8")
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.as_str().split('.')
    }

    /// Whether this prefix covers the given address, respecting segment
    /// boundaries: `g.bar` covers `g.bar` and `g.bar.alice` but not `g.bart`.
    pub fn is_prefix_of(&self, address: &str) -> bool {
        if self.is_root() {
            return true;
        }
        let prefix = self.as_str();
        address == prefix
            || (address.len() > prefix.len()
                && address.starts_with(prefix)
                && address.as_bytes()[prefix.len()] == b'.')
    }
}

impl Deref for AddressPrefix {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for AddressPrefix {
    type Err = AddressError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        validate_prefix(src.as_bytes())?;
        Ok(AddressPrefix(Bytes::copy_from_slice(src.as_bytes())))
    }
}

impl From<Address> for AddressPrefix {
    fn from(address: Address) -> Self {
        AddressPrefix(address.0)
    }
}

impl fmt::Debug for AddressPrefix {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_tuple("AddressPrefix")
            .field(&self.as_str())
            .finish()
    }
}

impl fmt::Display for AddressPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AddressPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AddressPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = <&str>::deserialize(deserializer)?;
        if string.is_empty() {
            Ok(AddressPrefix::root())
        } else {
            AddressPrefix::from_str(string).map_err(de::Error::custom)
        }
    }
}

/// ```text
/// scheme = "g" / "private" / "example" / "peer" / "self" /
///          "test" / "test1" / "test2" / "test3" / "local"
/// ```
static SCHEMES: &[&[u8]] = &[
    b"g", b"private", b"example", b"peer", b"self", b"test", b"test1", b"test2", b"test3",
    b"local",
];

fn is_scheme(segment: &[u8]) -> bool {
    SCHEMES.contains(&segment)
}

/// <https://github.com/interledger/rfcs/blob/master/0015-ilp-addresses/0015-ilp-addresses.md#address-requirements>
fn is_segment_byte(byte: u8) -> bool {
    byte == b'_'
        || byte == b'-'
        || byte == b'~'
        || byte.is_ascii_uppercase()
        || byte.is_ascii_lowercase()
        || byte.is_ascii_digit()
}

fn validate_address(bytes: &[u8]) -> Result<(), AddressError> {
    if bytes.len() > MAX_ADDRESS_LENGTH {
        return Err(AddressError::TooLong(bytes.len()));
    }
    let mut segments = 0;
    for (i, segment) in bytes.split(|&byte| byte == b'.').enumerate() {
        segments += 1;
        if i == 0 && !is_scheme(segment) {
            return Err(AddressError::InvalidScheme);
        }
        if segment.is_empty() || !segment.iter().all(|&byte| is_segment_byte(byte)) {
            return Err(AddressError::InvalidSegment);
        }
    }
    if segments < 2 {
        return Err(AddressError::InvalidScheme);
    }
    Ok(())
}

fn validate_prefix(bytes: &[u8]) -> Result<(), AddressError> {
    if bytes.len() > MAX_ADDRESS_LENGTH {
        return Err(AddressError::TooLong(bytes.len()));
    }
    if bytes.ends_with(b".") {
        return Err(AddressError::TrailingSeparator);
    }
    if bytes.is_empty() {
        // The root prefix is only constructed explicitly.
        return Err(AddressError::InvalidSegment);
    }
    for segment in bytes.split(|&byte| byte == b'.') {
        if segment.is_empty() || !segment.iter().all(|&byte| is_segment_byte(byte)) {
            return Err(AddressError::InvalidSegment);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test_address {
    use super::*;

    static VALID_ADDRESSES: &[&str] = &[
        "test.alice.XYZ.1234.-_~",
        "g.us-fed.ach.0.acmebank.swx0a0.acmecorp.sales.199.~ipr.cdfa5e16-e759-4ba3-88f6-8b9dc83c1868.2",
        "g.A",
        "private.A",
        "example.A",
        "peer.A",
        "self.A",
        "test.A",
        "test1.A",
        "test2.A",
        "test3.A",
        "local.A",
    ];

    static INVALID_ADDRESSES: &[&str] = &[
        "",
        // Invalid characters.
        "test.alice 123",
        "test.alice!123",
        "test.alice/123",
        // Bad schemes.
        "test",         // only a scheme
        "what.alice",   // unknown scheme
        "test4.alice",  // unknown scheme
        // Invalid separators.
        "test.",        // only a prefix
        "test.alice.",  // ends in a separator
        ".test.alice",  // begins with a separator
        "test..alice",  // double separator
    ];

    fn make_address(length: usize) -> String {
        let mut addr = "test.".to_string();
        while addr.len() < length {
            addr.push('_');
        }
        addr
    }

    #[test]
    fn validates_addresses() {
        for address in VALID_ADDRESSES {
            assert!(Address::from_str(address).is_ok(), "address: {}", address);
        }
        for address in INVALID_ADDRESSES {
            assert!(Address::from_str(address).is_err(), "address: {}", address);
        }

        assert!(Address::from_str(&make_address(1023)).is_ok());
        assert!(Address::from_str(&make_address(1024)).is_err());
    }

    #[test]
    fn returns_scheme() {
        assert_eq!(Address::from_str("test.alice").unwrap().scheme(), "test");
        assert_eq!(Address::from_str("test.alice.1234").unwrap().scheme(), "test");
    }

    #[test]
    fn appends_suffixes() {
        assert_eq!(
            Address::from_str("test.alice")
                .unwrap()
                .with_suffix("1234")
                .unwrap(),
            Address::from_str("test.alice.1234").unwrap(),
        );
        assert!(Address::from_str("test.alice")
            .unwrap()
            .with_suffix("12 34")
            .is_err());
    }

    #[test]
    fn derefs_to_str() {
        let address = Address::from_str("test.alice").unwrap();
        assert!(address.starts_with("test."));
        assert_eq!(&address as &str, "test.alice");
    }

    #[test]
    fn formats() {
        let address = Address::from_str("test.alice").unwrap();
        assert_eq!(format!("{:?}", address), "Address(\"test.alice\")");
        assert_eq!(format!("{}", address), "test.alice");
    }

    #[test]
    fn deserializes() {
        let address: Address = serde_json::from_str("\"test.alice\"").unwrap();
        assert_eq!(address, Address::from_str("test.alice").unwrap());
        assert!(serde_json::from_str::<Address>("\"test.alice \"").is_err());
    }
}

#[cfg(test)]
mod test_address_prefix {
    use super::*;

    #[test]
    fn validates_prefixes() {
        for prefix in &["g", "example.a", "g.foo.bar", "test.alice-1"] {
            assert!(AddressPrefix::from_str(prefix).is_ok(), "prefix: {}", prefix);
        }
        for prefix in &["", "g.", "g..a", ".g", "g.foo bar"] {
            assert!(AddressPrefix::from_str(prefix).is_err(), "prefix: {}", prefix);
        }
    }

    #[test]
    fn root_matches_everything() {
        let root = AddressPrefix::root();
        assert!(root.is_root());
        assert!(root.is_prefix_of("g.alice"));
        assert!(root.is_prefix_of("example.connector.bob"));
    }

    #[test]
    fn matches_on_segment_boundaries() {
        let prefix = AddressPrefix::from_str("g.bar").unwrap();
        assert!(prefix.is_prefix_of("g.bar"));
        assert!(prefix.is_prefix_of("g.bar.alice"));
        assert!(prefix.is_prefix_of("g.bar.bob"));
        assert!(!prefix.is_prefix_of("g.bart"));
        assert!(!prefix.is_prefix_of("g.ba"));
        assert!(!prefix.is_prefix_of("g"));
    }

    #[test]
    fn converts_from_address() {
        let address = Address::from_str("example.alice").unwrap();
        let prefix = AddressPrefix::from(address.clone());
        assert!(prefix.is_prefix_of(&address));
        assert!(prefix.is_prefix_of("example.alice.sub"));
    }
}
