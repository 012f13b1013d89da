//! Errors of the registry.
//!
//! Failures fall into three families with different audiences: [`ApiError`]
//! is what a registration API caller gets back, [`UpstreamError`] is what
//! the replication machinery logs and retries on, and [`StoreError`] wraps
//! the embedded store. DNS-side failures never surface as Rust errors at
//! all; they become RCODEs in the reply.

use core::fmt;

use crate::pubkey::PublicKey;

//------------ ApiError ------------------------------------------------------

/// A registration API call failed.
///
/// These are surfaced to the caller as descriptive failures and are never
/// retried by the registry itself.
#[derive(Debug)]
pub enum ApiError {
    /// The payload's sequence number is lower than the stored one.
    StaleSequence { stored: u64, received: u64 },

    /// The signature does not verify against the payload.
    SignatureInvalid,

    /// A registration needs at least one address.
    EmptyAddresses,

    /// An address could not be parsed as a URI with a host.
    AddressMalformed(String),

    /// A CNAME address cannot coexist with any other address.
    CnameExclusivity,

    /// The flash channel does not match the chain.
    ChannelInvalid(String),

    /// No stake output entitles this key to register.
    NoStake(PublicKey),

    /// Writes are not accepted on a caching zone.
    ReadOnly,

    /// Write redirection to the primary failed.
    Redirect(String),

    /// The store failed underneath the operation.
    Store(StoreError),

    /// Forwarding a lookup to the upstream registry failed.
    Upstream(UpstreamError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::StaleSequence { stored, received } => write!(
                f,
                "stale sequence number {received}, stored is {stored}"
            ),
            ApiError::SignatureInvalid => {
                f.write_str("signature verification failed")
            }
            ApiError::EmptyAddresses => {
                f.write_str("payload carries no addresses")
            }
            ApiError::AddressMalformed(addr) => {
                write!(f, "malformed address '{addr}'")
            }
            ApiError::CnameExclusivity => f.write_str(
                "a CNAME address cannot be mixed with other addresses",
            ),
            ApiError::ChannelInvalid(reason) => {
                write!(f, "invalid channel: {reason}")
            }
            ApiError::NoStake(key) => {
                write!(f, "no stake found for key {key}")
            }
            ApiError::ReadOnly => {
                f.write_str("zone is caching and does not accept writes")
            }
            ApiError::Redirect(reason) => {
                write!(f, "write redirection failed: {reason}")
            }
            ApiError::Store(err) => write!(f, "store error: {err}"),
            ApiError::Upstream(err) => write!(f, "upstream error: {err}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        ApiError::Upstream(err)
    }
}

//------------ UpstreamError -------------------------------------------------

/// A query towards an upstream server failed.
///
/// Upstream failures drive the retry and expire timers; they are logged
/// and never crash the engine.
#[derive(Debug)]
pub enum UpstreamError {
    /// No upstream servers are configured for this zone.
    NoServers,

    /// The transport could not be set up or the request did not complete.
    Request(String),

    /// The response decoded but did not contain what was asked for.
    Empty,

    /// The response could not be decoded.
    Malformed,

    /// The upstream answered with an error response code.
    Rcode(domain::base::iana::OptRcode),

    /// A transfer ended before the closing SOA.
    IncompleteTransfer,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpstreamError::NoServers => {
                f.write_str("no upstream servers configured")
            }
            UpstreamError::Request(reason) => {
                write!(f, "request failed: {reason}")
            }
            UpstreamError::Empty => f.write_str("empty response"),
            UpstreamError::Malformed => f.write_str("malformed response"),
            UpstreamError::Rcode(rcode) => {
                write!(f, "upstream answered {rcode}")
            }
            UpstreamError::IncompleteTransfer => {
                f.write_str("zone transfer ended prematurely")
            }
        }
    }
}

impl std::error::Error for UpstreamError {}

//------------ StoreError ----------------------------------------------------

/// The embedded store failed.
///
/// Fatal to the current operation only; the engine carries on.
#[derive(Debug)]
pub enum StoreError {
    /// The underlying SQL engine reported an error.
    Sql(rusqlite::Error),

    /// A stored value could not be decoded back into its typed form.
    Decode(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Sql(err) => write!(f, "{err}"),
            StoreError::Decode(what) => {
                write!(f, "stored value undecodable: {what}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sql(err)
    }
}
