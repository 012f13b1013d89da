//! Public keys as registry identities.
//!
//! Every name served by the registry is keyed by the public key of the
//! node that registered it. Keys travel in two string forms: the canonical
//! HRP form `boa1…` (63 characters) and a bare form with the human readable
//! part and separator stripped (59 characters). Both encode the same
//! 33 octets — a type octet followed by the 32 octet point — under a
//! bech32 checksum.

use core::fmt;
use core::str::FromStr;

use bech32::{Bech32, Hrp};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

//------------ Constants -----------------------------------------------------

/// The human readable part of the canonical key encoding.
const PUBKEY_HRP: &str = "boa";

/// Length of the canonical string form: HRP, separator, data, checksum.
pub const PUBKEY_STR_LEN: usize = 63;

/// Length of the bare string form: the canonical form without `boa1`.
pub const PUBKEY_BARE_STR_LEN: usize = PUBKEY_STR_LEN - 4;

/// Width of the decoded key: one type octet plus the 32 octet point.
const PUBKEY_OCTETS: usize = 33;

//------------ PublicKey -----------------------------------------------------

/// A fixed-width node identity.
///
/// Wraps the raw 33 octets of the encoded key. The registry never
/// interprets the point itself; signature checks are delegated to the
/// host's verifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PublicKey([u8; PUBKEY_OCTETS]);

impl PublicKey {
    pub fn from_bytes(octets: [u8; PUBKEY_OCTETS]) -> Self {
        PublicKey(octets)
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_OCTETS] {
        &self.0
    }

    /// Parses a key from either string form.
    ///
    /// The canonical form carries the `boa1` prefix; the bare form, used
    /// as a DNS label, drops it. Case matters: bech32 data is lower case
    /// and a mixed-case string fails its checksum.
    pub fn parse(s: &str) -> Result<Self, PublicKeyError> {
        let canonical;
        let s = match s.len() {
            PUBKEY_STR_LEN => s,
            PUBKEY_BARE_STR_LEN => {
                canonical = format!("{PUBKEY_HRP}1{s}");
                &canonical
            }
            _ => return Err(PublicKeyError::BadLength(s.len())),
        };
        let (hrp, data) =
            bech32::decode(s).map_err(|_| PublicKeyError::BadEncoding)?;
        if hrp != Hrp::parse(PUBKEY_HRP).expect("valid hrp") {
            return Err(PublicKeyError::BadPrefix);
        }
        let octets: [u8; PUBKEY_OCTETS] = data
            .try_into()
            .map_err(|_| PublicKeyError::BadEncoding)?;
        Ok(PublicKey(octets))
    }

    /// Parses a key from the raw octets of a DNS label.
    ///
    /// DNS name comparison folds case, but key labels are checksummed
    /// base32 and must be matched byte for byte, so the label is taken
    /// as-is rather than lowercased.
    pub fn parse_label(label: &[u8]) -> Result<Self, PublicKeyError> {
        let s = core::str::from_utf8(label)
            .map_err(|_| PublicKeyError::BadEncoding)?;
        Self::parse(s)
    }

    /// The canonical `boa1…` form.
    pub fn to_canonical(&self) -> String {
        let hrp = Hrp::parse(PUBKEY_HRP).expect("valid hrp");
        bech32::encode::<Bech32>(hrp, &self.0).expect("key encoding fits")
    }

    /// The bare form used as a DNS label.
    pub fn to_bare(&self) -> String {
        self.to_canonical().split_off(4)
    }
}

//--- FromStr, Display

impl FromStr for PublicKey {
    type Err = PublicKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

//--- Serialize and Deserialize

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::parse(&s).map_err(D::Error::custom)
    }
}

//------------ Signature -----------------------------------------------------

/// A detached signature over a registration payload.
///
/// The registry treats signatures as opaque 64 octet strings; checking
/// them against `(public_key, seq, addresses)` is the injected verifier's
/// job.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn from_bytes(octets: [u8; 64]) -> Self {
        Signature(octets)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for octet in self.0 {
            write!(f, "{octet:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = PublicKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 128 {
            return Err(PublicKeyError::BadLength(s.len()));
        }
        let mut octets = [0; 64];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| PublicKeyError::BadEncoding)?;
        }
        Ok(Signature(octets))
    }
}

//--- Serialize and Deserialize

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_str(&s).map_err(D::Error::custom)
    }
}

//------------ PublicKeyError ------------------------------------------------

/// An error happened while parsing a key or signature string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublicKeyError {
    /// The string has neither the canonical nor the bare length.
    BadLength(usize),

    /// The checksum failed or the string contains invalid characters.
    BadEncoding,

    /// The human readable part is not `boa`.
    BadPrefix,
}

impl fmt::Display for PublicKeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublicKeyError::BadLength(len) => {
                write!(f, "bad length {len}, expected {PUBKEY_STR_LEN} or {PUBKEY_BARE_STR_LEN}")
            }
            PublicKeyError::BadEncoding => f.write_str("invalid key encoding"),
            PublicKeyError::BadPrefix => f.write_str("key prefix is not 'boa'"),
        }
    }
}

impl std::error::Error for PublicKeyError {}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> PublicKey {
        PublicKey::from_bytes([fill; PUBKEY_OCTETS])
    }

    #[test]
    fn canonical_form_has_hrp_and_length() {
        let s = key(0x42).to_canonical();
        assert_eq!(s.len(), PUBKEY_STR_LEN);
        assert!(s.starts_with("boa1"));
    }

    #[test]
    fn bare_form_round_trips() {
        let k = key(0x17);
        let bare = k.to_bare();
        assert_eq!(bare.len(), PUBKEY_BARE_STR_LEN);
        assert_eq!(PublicKey::parse(&bare).unwrap(), k);
    }

    #[test]
    fn canonical_form_round_trips() {
        let k = key(0xa5);
        assert_eq!(PublicKey::parse(&k.to_canonical()).unwrap(), k);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut s = key(0x42).to_canonical();
        let last = s.pop().unwrap();
        s.push(if last == 'q' { 'p' } else { 'q' });
        assert_eq!(
            PublicKey::parse(&s).unwrap_err(),
            PublicKeyError::BadEncoding
        );
    }

    #[test]
    fn case_is_significant() {
        let upper = key(0x42).to_canonical().to_uppercase();
        // All-uppercase bech32 is legal in general but the registry label
        // form is lower case; mixed case must certainly fail.
        let mut mixed = key(0x42).to_canonical();
        mixed.replace_range(10..11, &mixed[10..11].to_uppercase());
        assert!(PublicKey::parse(&mixed).is_err());
        let _ = upper;
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            PublicKey::parse("boa1abc").unwrap_err(),
            PublicKeyError::BadLength(7)
        );
    }

    #[test]
    fn signature_hex_round_trips() {
        let sig = Signature::from_bytes([0xab; 64]);
        assert_eq!(Signature::from_str(&sig.to_string()).unwrap(), sig);
    }
}
