//! A name registry for Agora nodes.
//!
//! Validators and flash (payment channel) nodes publish the network
//! addresses they are reachable at, keyed by their public key and signed
//! with the matching private key. Peers discover those addresses two
//! ways: by calling the registration API, or by resolving ordinary DNS
//! queries whose left-most label encodes the public key.
//!
//! The crate serves three zones under the configured realm domain —
//! the realm apex, `validators.{realm}` and `flash.{realm}` — and each
//! zone plays one of three roles derived from its configuration:
//!
//! * **primary**: the authoritative origin. Registrations land here,
//!   bound to on-chain stake, and every write moves the SOA serial.
//! * **secondary**: an authoritative replica, kept fresh by SOA polling
//!   and full zone transfers, expiring when the primary stays
//!   unreachable for too long.
//! * **caching**: a non-authoritative cache filled on demand from
//!   upstream and evicted record by record as TTLs run out.
//!
//! Validator registrations are tied to the chain: a registration needs a
//! stake output, and once that stake's penalty deposit is slashed to
//! zero the validator's records disappear with the next block.
//!
//! The crate is a library. The hosting node decodes transport input —
//! DNS messages via [`Registry::answer_questions`], API calls via the
//! `Registry` methods — and injects its ledger view, signature verifier
//! and upstream API client through the seams in [`ledger`] and
//! [`registry`].
//!
//! [`Registry::answer_questions`]: registry::Registry::answer_questions

pub mod config;
pub mod error;
pub mod ledger;
pub mod payload;
pub mod pubkey;
pub mod rdata;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod timer;
pub mod zone;

pub use self::config::{RegistryConfig, ZoneConfig, ZoneRole};
pub use self::error::{ApiError, StoreError, UpstreamError};
pub use self::ledger::Ledger;
pub use self::payload::{KnownChannel, RegistrationPayload};
pub use self::pubkey::{PublicKey, Signature};
pub use self::registry::{Registry, RegistryClient, SignatureVerifier};
pub use self::store::Store;
pub use self::zone::{Zone, ZoneKind};
