//! Registration payloads and their DNS projection.
//!
//! A node registers by submitting a signed [`RegistrationPayload`]: its
//! key, a monotonic sequence number, and the URIs it is reachable at.
//! Validation classifies every address by the shape of its host part —
//! IPv4 literal, IPv6 literal or a host name — and that classification
//! decides which resource records the payload turns into: `A`, `AAAA` or
//! `CNAME` records at `{key}.{zone}` plus a `URI` record per address at
//! `_agora._tcp.{key}.{zone}`.

use core::fmt;
use core::str::FromStr;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use domain::base::name::ToLabelIter;
use domain::base::iana::{Class, Rtype};
use domain::base::{Record, Ttl};
use domain::rdata::{Aaaa, Cname, A};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::ledger::{BlockHash, UtxoId};
use crate::pubkey::{PublicKey, PublicKeyError};
use crate::rdata::{RegistryRecordData, StoredName, StoredRecord, Uri};

//------------ Constants -----------------------------------------------------

/// The service and protocol labels URI records live under.
const SERVICE_LABEL: &[u8] = b"_agora";
const PROTO_LABEL: &[u8] = b"_tcp";

//------------ RegistrationPayload -------------------------------------------

/// What a node submits to publish its addresses.
///
/// The out-of-band signature covers `(public_key, seq, addresses)`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegistrationPayload {
    /// The key the registration is filed under.
    pub public_key: PublicKey,

    /// Monotonic sequence number; stale writes are rejected.
    pub seq: u64,

    /// The URIs the node is reachable at. Never empty in a valid payload.
    pub addresses: Vec<String>,

    /// TTL hint in seconds for the projected records.
    pub ttl: u32,
}

//------------ KnownChannel --------------------------------------------------

/// A payment channel descriptor submitted alongside a flash registration.
///
/// Valid iff the chain has a block at `height` whose hash equals `conf`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KnownChannel {
    pub height: u64,
    pub conf: BlockHash,
}

//------------ RecordKind ----------------------------------------------------

/// The DNS projection a payload (or a single address) maps to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RecordKind {
    A,
    Aaaa,
    Cname,
    Uri,
}

impl RecordKind {
    pub fn rtype(self) -> Rtype {
        match self {
            RecordKind::A => Rtype::A,
            RecordKind::Aaaa => Rtype::AAAA,
            RecordKind::Cname => Rtype::CNAME,
            RecordKind::Uri => Rtype::URI,
        }
    }

    pub fn from_rtype(rtype: Rtype) -> Option<Self> {
        match rtype {
            Rtype::A => Some(RecordKind::A),
            Rtype::AAAA => Some(RecordKind::Aaaa),
            Rtype::CNAME => Some(RecordKind::Cname),
            Rtype::URI => Some(RecordKind::Uri),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.rtype().fmt(f)
    }
}

//------------ HostKind ------------------------------------------------------

/// The host part of a registered URI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostKind {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Name(String),
}

impl HostKind {
    pub fn record_kind(&self) -> RecordKind {
        match self {
            HostKind::V4(_) => RecordKind::A,
            HostKind::V6(_) => RecordKind::Aaaa,
            HostKind::Name(_) => RecordKind::Cname,
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostKind::V4(addr) => addr.fmt(f),
            HostKind::V6(addr) => addr.fmt(f),
            HostKind::Name(name) => name.fmt(f),
        }
    }
}

/// Splits a registered URI into its host part.
///
/// Addresses are URIs of the shape `scheme://host[:port][/…]` with an
/// optional bracketed IPv6 literal as the host. Anything else is
/// malformed.
pub fn parse_address(uri: &str) -> Result<HostKind, ApiError> {
    let malformed = || ApiError::AddressMalformed(uri.into());

    let (scheme, rest) = uri.split_once("://").ok_or_else(malformed)?;
    if scheme.is_empty() {
        return Err(malformed());
    }
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    // Strip any userinfo.
    let authority = match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    };

    let host = if let Some(rest) = authority.strip_prefix('[') {
        let (inner, tail) = rest.split_once(']').ok_or_else(malformed)?;
        if !tail.is_empty() && !tail.starts_with(':') {
            return Err(malformed());
        }
        return Ipv6Addr::from_str(inner)
            .map(HostKind::V6)
            .map_err(|_| malformed());
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            Some(_) => return Err(malformed()),
            None => authority,
        }
    };

    if host.is_empty() {
        return Err(malformed());
    }
    if let Ok(addr) = Ipv4Addr::from_str(host) {
        return Ok(HostKind::V4(addr));
    }
    let name_ok = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
    });
    if !name_ok {
        return Err(malformed());
    }
    Ok(HostKind::Name(host.to_ascii_lowercase()))
}

//------------ ensure_valid_payload ------------------------------------------

/// Validates a payload against an optional previous registration.
///
/// Returns the payload's dominant record kind. Where a payload mixes
/// IPv4 and IPv6 addresses the kind of the last address wins; the
/// per-address projection is unaffected by this, only the stored
/// `TypedPayload::kind` tag is. A CNAME address must be the only address
/// (RFC 1034: CNAME cannot coexist with other data).
pub fn ensure_valid_payload(
    payload: &RegistrationPayload,
    previous: Option<&RegistrationPayload>,
) -> Result<RecordKind, ApiError> {
    if let Some(previous) = previous {
        if previous.seq > payload.seq {
            return Err(ApiError::StaleSequence {
                stored: previous.seq,
                received: payload.seq,
            });
        }
    }
    if payload.addresses.is_empty() {
        return Err(ApiError::EmptyAddresses);
    }

    let mut kind = RecordKind::A;
    let mut cnames = 0;
    for address in &payload.addresses {
        kind = parse_address(address)?.record_kind();
        if kind == RecordKind::Cname {
            cnames += 1;
        }
    }
    if cnames > 0 && payload.addresses.len() != 1 {
        return Err(ApiError::CnameExclusivity);
    }
    Ok(kind)
}

//------------ TypedPayload --------------------------------------------------

/// A validated payload together with its derived kind and chain anchor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypedPayload {
    /// The dominant record kind of the payload's addresses.
    pub kind: RecordKind,

    pub payload: RegistrationPayload,

    /// The stake output backing the registration, or the zero id on the
    /// caching path where no chain anchor is known.
    pub utxo: UtxoId,
}

impl TypedPayload {
    pub fn new(
        kind: RecordKind,
        payload: RegistrationPayload,
        utxo: UtxoId,
    ) -> Self {
        TypedPayload {
            kind,
            payload,
            utxo,
        }
    }

    /// The owner name of the payload's address records below `apex`.
    pub fn owner_name(&self, apex: &StoredName) -> StoredName {
        key_owner_name(&self.payload.public_key, apex)
    }

    /// Projects the payload into the resource records DNS serves.
    ///
    /// Every address yields a URI record at the service owner name; each
    /// non-CNAME address additionally yields an A or AAAA record at the
    /// plain owner name, and a CNAME address yields the CNAME record.
    pub fn to_records(
        &self,
        apex: &StoredName,
    ) -> Result<Vec<StoredRecord>, ApiError> {
        let owner = key_owner_name(&self.payload.public_key, apex);
        let service_owner =
            service_owner_name(&self.payload.public_key, apex);
        let ttl = Ttl::from_secs(self.payload.ttl);
        let mut records = Vec::new();

        for address in &self.payload.addresses {
            match parse_address(address)? {
                HostKind::V4(addr) => {
                    records.push(Record::new(
                        owner.clone(),
                        Class::IN,
                        ttl,
                        A::new(addr).into(),
                    ));
                }
                HostKind::V6(addr) => {
                    records.push(Record::new(
                        owner.clone(),
                        Class::IN,
                        ttl,
                        Aaaa::new(addr).into(),
                    ));
                }
                HostKind::Name(host) => {
                    let target = StoredName::from_str(&host).map_err(
                        |_| ApiError::AddressMalformed(address.clone()),
                    )?;
                    records.push(Record::new(
                        owner.clone(),
                        Class::IN,
                        ttl,
                        Cname::new(target).into(),
                    ));
                }
            }
            records.push(Record::new(
                service_owner.clone(),
                Class::IN,
                ttl,
                Uri::new(1, 1, Bytes::copy_from_slice(address.as_bytes()))
                    .into(),
            ));
        }
        Ok(records)
    }

    /// Reconstructs a payload from a URI record set.
    ///
    /// This is the caching path: the kind is always `Uri`, the sequence
    /// number is unknown and set to zero, and there is no chain anchor.
    /// Records that are not URI records are ignored; returns `None` if no
    /// usable URI record is present.
    pub fn make(records: &[StoredRecord]) -> Option<TypedPayload> {
        let mut public_key = None;
        let mut addresses = Vec::new();
        let mut ttl = u32::MAX;

        for record in records {
            let RegistryRecordData::Uri(uri) = record.data() else {
                continue;
            };
            let Some(target) = uri.target_str() else {
                continue;
            };
            if public_key.is_none() {
                public_key = key_from_owner(record.owner()).ok();
            }
            addresses.push(target.to_string());
            ttl = ttl.min(record.ttl().as_secs());
        }

        let public_key = public_key?;
        if addresses.is_empty() {
            return None;
        }
        Some(TypedPayload::new(
            RecordKind::Uri,
            RegistrationPayload {
                public_key,
                seq: 0,
                addresses,
                ttl,
            },
            UtxoId::zero(),
        ))
    }
}

//------------ Name helpers --------------------------------------------------

/// The owner name of a key's address records: `{key}.{apex}`.
pub fn key_owner_name(key: &PublicKey, apex: &StoredName) -> StoredName {
    StoredName::from_str(&format!("{}.{}", key.to_bare(), apex))
        .expect("key label fits in a name")
}

/// The owner name of a key's URI records: `_agora._tcp.{key}.{apex}`.
pub fn service_owner_name(key: &PublicKey, apex: &StoredName) -> StoredName {
    StoredName::from_str(&format!(
        "_agora._tcp.{}.{}",
        key.to_bare(),
        apex
    ))
    .expect("key label fits in a name")
}

/// Extracts the key from an owner name, skipping service labels.
///
/// Accepts both `{key}.{zone}` and `_agora._tcp.{key}.{zone}`. The key
/// label is matched byte for byte; no case folding happens here.
pub fn key_from_owner(name: &StoredName) -> Result<PublicKey, PublicKeyError> {
    let mut labels = name.iter_labels();
    let mut label = labels.next().ok_or(PublicKeyError::BadLength(0))?;
    if label.as_slice().eq_ignore_ascii_case(SERVICE_LABEL) {
        let proto = labels.next().ok_or(PublicKeyError::BadLength(0))?;
        if !proto.as_slice().eq_ignore_ascii_case(PROTO_LABEL) {
            return Err(PublicKeyError::BadEncoding);
        }
        label = labels.next().ok_or(PublicKeyError::BadLength(0))?;
    }
    PublicKey::parse_label(label.as_slice())
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PublicKey {
        PublicKey::from_bytes([0x42; 33])
    }

    fn payload(addresses: &[&str], seq: u64) -> RegistrationPayload {
        RegistrationPayload {
            public_key: key(),
            seq,
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
            ttl: 600,
        }
    }

    fn apex() -> StoredName {
        StoredName::from_str("validators.unittest").unwrap()
    }

    #[test]
    fn classification_by_host_shape() {
        assert_eq!(
            parse_address("agora://1.2.3.4:2826").unwrap(),
            HostKind::V4("1.2.3.4".parse().unwrap())
        );
        assert_eq!(
            parse_address("agora://[2001:db8::1]:2826").unwrap(),
            HostKind::V6("2001:db8::1".parse().unwrap())
        );
        assert_eq!(
            parse_address("https://node.example.com/api").unwrap(),
            HostKind::Name("node.example.com".into())
        );
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for bad in [
            "no-scheme",
            "://1.2.3.4",
            "agora://",
            "agora://[2001:db8::1:2826",
            "agora://bad host:2826",
        ] {
            assert!(parse_address(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn stale_sequence_is_rejected() {
        let stored = payload(&["agora://1.2.3.4:2826"], 3);
        let incoming = payload(&["agora://5.6.7.8:2826"], 2);
        assert!(matches!(
            ensure_valid_payload(&incoming, Some(&stored)),
            Err(ApiError::StaleSequence {
                stored: 3,
                received: 2
            })
        ));
    }

    #[test]
    fn equal_sequence_is_accepted() {
        let stored = payload(&["agora://1.2.3.4:2826"], 3);
        let incoming = payload(&["agora://5.6.7.8:2826"], 3);
        assert!(ensure_valid_payload(&incoming, Some(&stored)).is_ok());
    }

    #[test]
    fn empty_addresses_are_rejected() {
        assert!(matches!(
            ensure_valid_payload(&payload(&[], 1), None),
            Err(ApiError::EmptyAddresses)
        ));
    }

    #[test]
    fn cname_must_stand_alone() {
        let mixed =
            payload(&["agora://host.example:2826", "agora://1.2.3.4"], 1);
        assert!(matches!(
            ensure_valid_payload(&mixed, None),
            Err(ApiError::CnameExclusivity)
        ));
        let single = payload(&["agora://host.example:2826"], 1);
        assert_eq!(
            ensure_valid_payload(&single, None).unwrap(),
            RecordKind::Cname
        );
    }

    #[test]
    fn mixed_families_take_the_last_kind() {
        let v4_last = payload(
            &["agora://[2001:db8::1]:2826", "agora://1.2.3.4:2826"],
            1,
        );
        assert_eq!(
            ensure_valid_payload(&v4_last, None).unwrap(),
            RecordKind::A
        );
        let v6_last = payload(
            &["agora://1.2.3.4:2826", "agora://[2001:db8::1]:2826"],
            1,
        );
        assert_eq!(
            ensure_valid_payload(&v6_last, None).unwrap(),
            RecordKind::Aaaa
        );
    }

    #[test]
    fn projection_emits_address_and_uri_records() {
        let typed = TypedPayload::new(
            RecordKind::A,
            payload(&["agora://1.2.3.4:2826"], 1),
            UtxoId::zero(),
        );
        let records = typed.to_records(&apex()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rtype(), Rtype::A);
        assert_eq!(
            records[0].owner(),
            &key_owner_name(&key(), &apex())
        );
        assert_eq!(records[1].rtype(), Rtype::URI);
        assert_eq!(
            records[1].owner(),
            &service_owner_name(&key(), &apex())
        );
    }

    #[test]
    fn make_reconstructs_from_uri_records() {
        let typed = TypedPayload::new(
            RecordKind::A,
            payload(&["agora://1.2.3.4:2826", "agora://5.6.7.8:2826"], 7),
            UtxoId::from_bytes([9; 32]),
        );
        let records = typed.to_records(&apex()).unwrap();
        let rebuilt = TypedPayload::make(&records).unwrap();
        assert_eq!(rebuilt.kind, RecordKind::Uri);
        assert_eq!(rebuilt.payload.public_key, key());
        assert_eq!(rebuilt.payload.seq, 0);
        assert_eq!(rebuilt.payload.addresses, typed.payload.addresses);
        assert!(rebuilt.utxo.is_zero());
    }

    #[test]
    fn key_extraction_skips_service_labels() {
        assert_eq!(
            key_from_owner(&key_owner_name(&key(), &apex())).unwrap(),
            key()
        );
        assert_eq!(
            key_from_owner(&service_owner_name(&key(), &apex())).unwrap(),
            key()
        );
    }
}
