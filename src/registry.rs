//! The registry: three zones and the surfaces over them.
//!
//! [`Registry`] owns the `realm`, `validators.{realm}` and
//! `flash.{realm}` zones, routes registration API calls to the right
//! zone and dispatches DNS questions to the zone whose root is the
//! longest suffix of the question name. It also hosts the chain hook
//! that drops slashed validators.
//!
//! Both outward seams are traits the hosting node injects at start:
//! [`SignatureVerifier`] wraps the cryptographic check of registration
//! signatures, and [`RegistryClient`] is the API client towards an
//! upstream registry, used for write redirection on secondaries and for
//! lookup forwarding on caches.

use core::future::Future;
use core::pin::Pin;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use domain::base::iana::{Class, OptRcode, Rcode, Rtype};
use domain::base::message_builder::AdditionalBuilder;
use domain::base::name::ToName;
use domain::base::opt::{Opt, OptRecord};
use domain::base::{Message, MessageBuilder};
use tracing::{debug, trace};

use crate::config::RegistryConfig;
use crate::error::{ApiError, StoreError};
use crate::ledger::{Ledger, UtxoId};
use crate::payload::{KnownChannel, RegistrationPayload};
use crate::pubkey::{PublicKey, Signature};
use crate::rdata::StoredName;
use crate::resolver::{DnsUpstream, Upstream};
use crate::store::Store;
use crate::zone::{Zone, ZoneAnswer, ZoneKind};
use crate::config::ZoneRole;

//------------ Constants -----------------------------------------------------

/// The lower bound EDNS payload sizes are clamped to (RFC 6891 6.2.3).
const MIN_UDP_PAYLOAD: u16 = 512;

/// The question types the registry serves.
const SUPPORTED_QTYPES: &[Rtype] = &[
    Rtype::A,
    Rtype::AAAA,
    Rtype::CNAME,
    Rtype::AXFR,
    Rtype::ANY,
    Rtype::SOA,
    Rtype::NS,
    Rtype::URI,
];

//------------ SignatureVerifier ---------------------------------------------

/// Checks a registration signature.
///
/// The cryptographic scheme lives with the hosting node; the registry
/// only knows that the signature must cover `(public_key, seq,
/// addresses)`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        payload: &RegistrationPayload,
        signature: &Signature,
    ) -> bool;
}

//------------ RegistryClient ------------------------------------------------

pub type ClientFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// The registration API of an upstream registry.
///
/// A secondary forwards writes to its primary through this; a caching
/// registry forwards lookup misses through it and installs whatever
/// comes back.
pub trait RegistryClient: Send + Sync {
    fn get_validator(
        &self,
        key: PublicKey,
    ) -> ClientFuture<'_, Option<RegistrationPayload>>;

    fn post_validator(
        &self,
        payload: RegistrationPayload,
        signature: Signature,
    ) -> ClientFuture<'_, ()>;

    fn get_flash_node(
        &self,
        key: PublicKey,
    ) -> ClientFuture<'_, Option<RegistrationPayload>>;

    fn post_flash_node(
        &self,
        payload: RegistrationPayload,
        signature: Signature,
        channel: KnownChannel,
    ) -> ClientFuture<'_, ()>;
}

//------------ Registry ------------------------------------------------------

/// The name registry of a node.
pub struct Registry {
    zones: [Arc<Zone>; 3],
    ledger: Arc<dyn Ledger>,
    verifier: Arc<dyn SignatureVerifier>,
    client: Mutex<Option<Arc<dyn RegistryClient>>>,
    max_udp_payload: u16,
}

impl Registry {
    /// Creates the registry and its three zones over one store.
    pub fn new(
        config: &RegistryConfig,
        store: &Store,
        ledger: Arc<dyn Ledger>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, StoreError> {
        let zones = [
            Arc::new(Zone::new(
                ZoneKind::Realm,
                &config.realm,
                config.realm_zone.clone(),
                store,
            )?),
            Arc::new(Zone::new(
                ZoneKind::Validators,
                &config.realm,
                config.validators_zone.clone(),
                store,
            )?),
            Arc::new(Zone::new(
                ZoneKind::Flash,
                &config.realm,
                config.flash_zone.clone(),
                store,
            )?),
        ];
        Ok(Registry {
            zones,
            ledger,
            verifier,
            client: Mutex::new(None),
            max_udp_payload: config.max_udp_payload.max(MIN_UDP_PAYLOAD),
        })
    }

    /// Starts every zone with the default upstream resolver over its
    /// configured query servers.
    ///
    /// The upstream registry client is injected here — not at
    /// construction — which is what breaks the would-be cycle between
    /// the registry and the zones pointing back at it.
    pub fn start(&self, client: Option<Arc<dyn RegistryClient>>) {
        self.start_with(client, |zone| {
            let servers = zone.query_servers();
            if servers.is_empty() {
                None
            } else {
                Some(Arc::new(DnsUpstream::new(servers.to_vec())) as _)
            }
        });
    }

    /// Starts every zone with upstreams from the given factory.
    pub fn start_with<F>(
        &self,
        client: Option<Arc<dyn RegistryClient>>,
        mut upstream_for: F,
    ) where
        F: FnMut(&Zone) -> Option<Arc<dyn Upstream>>,
    {
        *self.client.lock().expect("registry poisoned") = client;
        for zone in &self.zones {
            let upstream = upstream_for(zone);
            zone.start(upstream);
        }
    }

    /// Stops the zones' maintenance tasks.
    pub fn stop(&self) {
        for zone in &self.zones {
            zone.stop();
        }
    }

    pub fn zone(&self, kind: ZoneKind) -> &Arc<Zone> {
        match kind {
            ZoneKind::Realm => &self.zones[0],
            ZoneKind::Validators => &self.zones[1],
            ZoneKind::Flash => &self.zones[2],
        }
    }

    fn client(&self) -> Option<Arc<dyn RegistryClient>> {
        self.client.lock().expect("registry poisoned").clone()
    }

    //--- Zone dispatch

    /// The zone whose root is the longest suffix of the name.
    ///
    /// The boolean says whether the name is the zone's root itself
    /// rather than a name below it. Returns `None` for names outside
    /// every served zone.
    pub fn find_zone(
        &self,
        name: &StoredName,
    ) -> Option<(&Arc<Zone>, bool)> {
        let mut best: Option<&Arc<Zone>> = None;
        for zone in &self.zones {
            if !name.ends_with(zone.apex()) {
                continue;
            }
            best = match best {
                Some(prev)
                    if prev.apex().label_count()
                        >= zone.apex().label_count() =>
                {
                    Some(prev)
                }
                _ => Some(zone),
            };
        }
        best.map(|zone| (zone, *name == *zone.apex()))
    }

    //--- The registration API

    /// `GET /validator/{pubkey}`.
    pub fn get_validator(
        &self,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, ApiError> {
        Ok(self.zone(ZoneKind::Validators).payload(key)?)
    }

    /// Validator lookup with upstream forwarding.
    ///
    /// A local miss is forwarded to the upstream registry; on a caching
    /// zone the returned payload is installed without a signature — the
    /// cache trusts the upstream it was configured with, so the trust
    /// boundary is the transport to that upstream.
    pub async fn get_validator_internal(
        &self,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, ApiError> {
        self.get_internal(ZoneKind::Validators, key).await
    }

    /// `POST /validator`.
    pub async fn post_validator(
        &self,
        payload: RegistrationPayload,
        signature: &Signature,
    ) -> Result<(), ApiError> {
        let zone = self.zone(ZoneKind::Validators);
        match zone.role() {
            ZoneRole::Caching => Err(ApiError::ReadOnly),
            ZoneRole::Secondary => {
                let client = self.client().ok_or_else(|| {
                    ApiError::Redirect("no upstream client".into())
                })?;
                client.post_validator(payload, *signature).await
            }
            ZoneRole::Primary => {
                if !self.verifier.verify(&payload, signature) {
                    return Err(ApiError::SignatureInvalid);
                }
                zone.register_validator(payload, &*self.ledger)
            }
        }
    }

    /// `GET /flash_node/{pubkey}`.
    pub fn get_flash_node(
        &self,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, ApiError> {
        Ok(self.zone(ZoneKind::Flash).payload(key)?)
    }

    /// Flash lookup with upstream forwarding, like the validator one.
    pub async fn get_flash_node_internal(
        &self,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, ApiError> {
        self.get_internal(ZoneKind::Flash, key).await
    }

    /// `POST /flash_node`.
    ///
    /// The channel descriptor must name a block the chain actually has;
    /// its hash anchors the registration in place of a stake output.
    pub async fn post_flash_node(
        &self,
        payload: RegistrationPayload,
        signature: &Signature,
        channel: KnownChannel,
    ) -> Result<(), ApiError> {
        let zone = self.zone(ZoneKind::Flash);
        match zone.role() {
            ZoneRole::Caching => Err(ApiError::ReadOnly),
            ZoneRole::Secondary => {
                let client = self.client().ok_or_else(|| {
                    ApiError::Redirect("no upstream client".into())
                })?;
                client
                    .post_flash_node(payload, *signature, channel)
                    .await
            }
            ZoneRole::Primary => {
                if !self.verifier.verify(&payload, signature) {
                    return Err(ApiError::SignatureInvalid);
                }
                let block = self
                    .ledger
                    .block_at(channel.height)
                    .ok_or_else(|| {
                        ApiError::ChannelInvalid(format!(
                            "no block at height {}",
                            channel.height
                        ))
                    })?;
                if block.hash != channel.conf {
                    return Err(ApiError::ChannelInvalid(format!(
                        "block at height {} does not match",
                        channel.height
                    )));
                }
                zone.register_flash(
                    payload,
                    UtxoId::from_bytes(channel.conf.0),
                )
            }
        }
    }

    async fn get_internal(
        &self,
        kind: ZoneKind,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, ApiError> {
        let zone = self.zone(kind);
        if let Some(payload) = zone.payload(key)? {
            return Ok(Some(payload));
        }
        let Some(client) = self.client() else {
            return Ok(None);
        };
        let fetched = match kind {
            ZoneKind::Flash => client.get_flash_node(*key).await?,
            _ => client.get_validator(*key).await?,
        };
        let Some(payload) = fetched else {
            return Ok(None);
        };
        if zone.role() == ZoneRole::Caching {
            zone.install_cached(payload.clone())?;
        }
        Ok(Some(payload))
    }

    //--- The chain hook

    /// Runs after every externalised block.
    ///
    /// On a primary validator zone this is the slashing sweep: every
    /// payload whose stake lost its penalty deposit vanishes. On a
    /// secondary it models a NOTIFY: a changed validator set cancels
    /// the pending SOA poll and runs one immediately.
    pub fn on_accepted_block(&self) -> Result<(), StoreError> {
        let zone = self.zone(ZoneKind::Validators);
        match zone.role() {
            ZoneRole::Primary => {
                zone.sweep_slashed(&*self.ledger)?;
            }
            ZoneRole::Secondary => {
                if zone.validator_set_changed(&*self.ledger) {
                    debug!("validator set changed, polling upstream SOA");
                    zone.notify_refresh();
                }
            }
            ZoneRole::Caching => {}
        }
        Ok(())
    }

    //--- The DNS responder

    /// Answers the questions of one decoded DNS message.
    ///
    /// The transport hands in the decoded message, the peer address and
    /// whether it arrived over TCP; encoded replies leave through the
    /// sink. Protocol errors terminate processing with the appropriate
    /// RCODE; UDP replies are truncated against the EDNS-negotiated
    /// payload size.
    pub async fn answer_questions<F: FnMut(Message<Bytes>)>(
        &self,
        msg: &Message<Bytes>,
        peer: SocketAddr,
        tcp: bool,
        mut send: F,
    ) {
        // EDNS(0) handling, UDP only: at most one OPT record, version
        // zero, payload size clamped between 512 and our maximum.
        let mut payload_size = usize::MAX;
        let mut echo_opt = false;
        if !tcp {
            payload_size = MIN_UDP_PAYLOAD as usize;
            let Ok(additional) = msg.additional() else {
                send(self.error_reply(msg, OptRcode::FORMERR, false));
                return;
            };
            let mut opts = additional.limit_to::<Opt<_>>();
            if let Some(first) = opts.next() {
                if opts.next().is_some() {
                    debug!("{peer}: more than one OPT record");
                    send(self.error_reply(msg, OptRcode::FORMERR, true));
                    return;
                }
                let Ok(first) = first else {
                    send(self.error_reply(msg, OptRcode::FORMERR, true));
                    return;
                };
                let opt = OptRecord::from(first);
                if opt.version() > 0 {
                    debug!(
                        "{peer}: EDNS version {} unimplemented",
                        opt.version()
                    );
                    send(self.error_reply(msg, OptRcode::BADVERS, true));
                    return;
                }
                echo_opt = true;
                payload_size = opt
                    .udp_payload_size()
                    .clamp(MIN_UDP_PAYLOAD, self.max_udp_payload)
                    as usize;
            }
        }

        // One pass over the questions, stopping at the first protocol
        // error but answering everything before it.
        let mut answered: Vec<(Question, ZoneAnswer)> = Vec::new();
        for question in msg.question() {
            let Ok(question) = question else {
                send(self.error_reply(msg, OptRcode::FORMERR, echo_opt));
                return;
            };
            let Ok(qname) =
                question.qname().try_to_name::<Bytes>()
            else {
                send(self.error_reply(msg, OptRcode::FORMERR, echo_opt));
                return;
            };
            let question = Question {
                qname,
                qtype: question.qtype(),
                qclass: question.qclass(),
            };

            if question.qclass == Class::ANY {
                // Answered, but never authoritatively.
                let mut answer =
                    ZoneAnswer::empty(Rcode::NOERROR);
                answer.authoritative = false;
                answered.push((question, answer));
                continue;
            }
            if question.qclass != Class::IN {
                trace!("{peer}: unsupported class {}", question.qclass);
                answered.push((
                    question,
                    ZoneAnswer::empty(Rcode::NOTIMP),
                ));
                break;
            }
            if !SUPPORTED_QTYPES.contains(&question.qtype) {
                trace!("{peer}: unsupported qtype {}", question.qtype);
                answered.push((
                    question,
                    ZoneAnswer::empty(Rcode::NOTIMP),
                ));
                break;
            }
            let Some((zone, matches)) = self.find_zone(&question.qname)
            else {
                trace!("{peer}: {} outside served zones", question.qname);
                answered.push((
                    question,
                    ZoneAnswer::empty(Rcode::REFUSED),
                ));
                break;
            };
            let answer = zone
                .answer(matches, &question.qname, question.qtype, peer.ip())
                .await;
            answered.push((question, answer));
        }

        // Serialize; on UDP overflow roll back the last question and
        // answer and mark the reply truncated.
        let reply = self.build_reply(msg, &answered, echo_opt, false);
        let reply = if !tcp
            && reply.as_slice().len() > payload_size
            && !answered.is_empty()
        {
            self.build_reply(
                msg,
                &answered[..answered.len() - 1],
                echo_opt,
                true,
            )
        } else {
            reply
        };

        let bytes = Bytes::from(reply.finish());
        send(Message::from_octets(bytes).expect("just built"));
    }

    /// Builds a reply carrying the given question/answer pairs.
    fn build_reply(
        &self,
        msg: &Message<Bytes>,
        answered: &[(Question, ZoneAnswer)],
        echo_opt: bool,
        truncated: bool,
    ) -> AdditionalBuilder<Vec<u8>> {
        let mut builder = MessageBuilder::new_vec().question();
        for (question, _) in answered {
            builder
                .push((
                    &question.qname,
                    question.qtype,
                    question.qclass,
                ))
                .expect("reply question fits");
        }

        let mut builder = builder.answer();
        for (_, answer) in answered {
            for record in &answer.answers {
                builder.push(record.clone()).expect("reply answer fits");
            }
        }

        let mut builder = builder.authority();
        for (_, answer) in answered {
            for record in &answer.authorities {
                builder
                    .push(record.clone())
                    .expect("reply authority fits");
            }
        }

        let mut builder = builder.additional();
        if echo_opt {
            let max = self.max_udp_payload;
            builder
                .opt(|opt| {
                    opt.set_udp_payload_size(max);
                    Ok(())
                })
                .expect("opt fits");
        }

        let header = builder.header_mut();
        header.set_id(msg.header().id());
        header.set_qr(true);
        header.set_opcode(msg.header().opcode());
        header.set_rd(msg.header().rd());
        header.set_tc(truncated);
        if let Some((_, answer)) = answered.last() {
            header.set_rcode(answer.rcode);
            header.set_aa(answer.authoritative);
            header.set_ra(answer.recursion);
        }
        builder
    }

    /// A bare error reply: echoed questions, mirrored header, rcode.
    fn error_reply(
        &self,
        msg: &Message<Bytes>,
        rcode: OptRcode,
        with_opt: bool,
    ) -> Message<Bytes> {
        let mut builder = MessageBuilder::new_vec().question();
        for question in msg.question().flatten() {
            let _ = builder.push(question);
        }
        let mut builder = builder.additional();
        if with_opt {
            let max = self.max_udp_payload;
            let _ = builder.opt(|opt| {
                opt.set_udp_payload_size(max);
                opt.set_rcode(rcode);
                Ok(())
            });
        }
        let header = builder.header_mut();
        header.set_id(msg.header().id());
        header.set_qr(true);
        header.set_opcode(msg.header().opcode());
        header.set_rd(msg.header().rd());
        if !with_opt {
            header.set_rcode(rcode.rcode());
        }
        let bytes = Bytes::from(builder.finish());
        Message::from_octets(bytes).expect("just built")
    }
}

//------------ Question ------------------------------------------------------

/// One decoded question, owned.
#[derive(Clone, Debug)]
struct Question {
    qname: StoredName,
    qtype: Rtype,
    qclass: Class,
}

//--- ZoneAnswer construction helper

impl ZoneAnswer {
    /// An answer with no records, used for dispatch-level rcodes.
    fn empty(rcode: Rcode) -> Self {
        ZoneAnswer {
            rcode,
            authoritative: false,
            recursion: false,
            answers: Vec::new(),
            authorities: Vec::new(),
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SoaConfig, ZoneConfig};
    use crate::ledger::{
        Amount, BlockHash, BlockHeader, StakeOutput, ValidatorInfo,
    };
    use crate::payload::key_owner_name;
    use std::str::FromStr;

    //------------ Test seams ------------------------------------------------

    struct AcceptAll;

    impl SignatureVerifier for AcceptAll {
        fn verify(
            &self,
            _payload: &RegistrationPayload,
            _signature: &Signature,
        ) -> bool {
            true
        }
    }

    struct TestLedger;

    impl Ledger for TestLedger {
        fn height(&self) -> u64 {
            10
        }

        fn validators_at(&self, _height: u64) -> Vec<ValidatorInfo> {
            vec![ValidatorInfo {
                address: PublicKey::from_bytes([1; 33]),
                utxo: UtxoId::from_bytes([1; 32]),
            }]
        }

        fn stakes(&self) -> Vec<StakeOutput> {
            Vec::new()
        }

        fn penalty_deposit(&self, _utxo: &UtxoId) -> Amount {
            Amount(5000)
        }

        fn block_at(&self, height: u64) -> Option<BlockHeader> {
            (height <= 10).then(|| BlockHeader {
                height,
                hash: BlockHash([height as u8; 32]),
            })
        }
    }

    //------------ Helpers ---------------------------------------------------

    fn registry() -> Registry {
        let mut config = RegistryConfig {
            realm: "unittest".into(),
            ..Default::default()
        };
        config.validators_zone = ZoneConfig {
            authoritative: true,
            soa: SoaConfig {
                email: Some("admin@unittest".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        config.realm_zone.authoritative = true;
        config.realm_zone.soa.email = Some("admin@unittest".into());
        config.flash_zone = config.validators_zone.clone();
        Registry::new(
            &config,
            &Store::open_memory().unwrap(),
            Arc::new(TestLedger),
            Arc::new(AcceptAll),
        )
        .unwrap()
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:5353".parse().unwrap()
    }

    fn query(
        name: &str,
        qtype: Rtype,
        opt: Option<(u16, u8)>,
    ) -> Message<Bytes> {
        let mut builder = MessageBuilder::new_vec().question();
        builder
            .push((StoredName::from_str(name).unwrap(), qtype))
            .unwrap();
        let msg = if let Some((size, version)) = opt {
            let mut additional = builder.additional();
            additional
                .opt(|opt| {
                    opt.set_udp_payload_size(size);
                    opt.set_version(version);
                    Ok(())
                })
                .unwrap();
            additional.into_message()
        } else {
            builder.into_message()
        };
        Message::from_octets(Bytes::from(msg.into_octets())).unwrap()
    }

    async fn ask(
        registry: &Registry,
        msg: Message<Bytes>,
        tcp: bool,
    ) -> Message<Bytes> {
        let mut replies = Vec::new();
        registry
            .answer_questions(&msg, peer(), tcp, |reply| {
                replies.push(reply)
            })
            .await;
        assert_eq!(replies.len(), 1);
        replies.pop().unwrap()
    }

    //------------ Tests -----------------------------------------------------

    #[test]
    fn find_zone_takes_the_longest_suffix() {
        let registry = registry();
        let name =
            StoredName::from_str("abc.validators.unittest").unwrap();
        let (zone, matches) = registry.find_zone(&name).unwrap();
        assert_eq!(zone.kind(), ZoneKind::Validators);
        assert!(!matches);

        let name = StoredName::from_str("validators.unittest").unwrap();
        let (zone, matches) = registry.find_zone(&name).unwrap();
        assert_eq!(zone.kind(), ZoneKind::Validators);
        assert!(matches);

        // Not below a more specific zone: the realm answers.
        let name = StoredName::from_str("other.unittest").unwrap();
        let (zone, _) = registry.find_zone(&name).unwrap();
        assert_eq!(zone.kind(), ZoneKind::Realm);

        assert!(registry
            .find_zone(&StoredName::from_str("example.com").unwrap())
            .is_none());
    }

    #[tokio::test]
    async fn register_resolve_round_trip() {
        let registry = registry();
        let key = PublicKey::from_bytes([1; 33]);
        let payload = RegistrationPayload {
            public_key: key,
            seq: 1,
            addresses: vec!["agora://1.2.3.4:2826".into()],
            ttl: 600,
        };
        registry
            .post_validator(payload.clone(), &Signature::from_bytes([0; 64]))
            .await
            .unwrap();
        assert_eq!(
            registry.get_validator(&key).unwrap().unwrap().addresses,
            payload.addresses
        );

        let apex = registry.zone(ZoneKind::Validators).apex().clone();
        let qname = key_owner_name(&key, &apex);
        let reply = ask(
            &registry,
            query(&qname.to_string(), Rtype::A, None),
            false,
        )
        .await;
        assert_eq!(reply.header().rcode(), Rcode::NOERROR);
        assert!(reply.header().aa());
        assert!(reply.header().qr());
        assert_eq!(reply.header_counts().ancount(), 1);
    }

    #[tokio::test]
    async fn queries_outside_served_zones_are_refused() {
        let registry = registry();
        let reply = ask(
            &registry,
            query("host.example.com", Rtype::A, None),
            false,
        )
        .await;
        assert_eq!(reply.header().rcode(), Rcode::REFUSED);
    }

    #[tokio::test]
    async fn unsupported_qtype_is_notimp() {
        let registry = registry();
        let reply = ask(
            &registry,
            query("validators.unittest", Rtype::MX, None),
            false,
        )
        .await;
        assert_eq!(reply.header().rcode(), Rcode::NOTIMP);
    }

    #[tokio::test]
    async fn bad_edns_version_answers_badvers() {
        let registry = registry();
        let reply = ask(
            &registry,
            query("validators.unittest", Rtype::SOA, Some((1232, 1))),
            false,
        )
        .await;
        assert_eq!(reply.opt_rcode(), OptRcode::BADVERS);
        assert!(reply.opt().is_some());
    }

    #[tokio::test]
    async fn opt_is_echoed_for_edns_queries() {
        let registry = registry();
        let reply = ask(
            &registry,
            query("validators.unittest", Rtype::SOA, Some((1232, 0))),
            false,
        )
        .await;
        assert!(reply.opt().is_some());
        let reply = ask(
            &registry,
            query("validators.unittest", Rtype::SOA, None),
            false,
        )
        .await;
        assert!(reply.opt().is_none());
    }

    #[tokio::test]
    async fn oversize_udp_reply_truncates() {
        let registry = registry();
        let key = PublicKey::from_bytes([1; 33]);
        // Enough addresses that the reply cannot fit 512 bytes.
        let addresses: Vec<String> = (0..40)
            .map(|i| format!("agora://10.0.{i}.1:2826"))
            .collect();
        registry
            .post_validator(
                RegistrationPayload {
                    public_key: key,
                    seq: 1,
                    addresses,
                    ttl: 600,
                },
                &Signature::from_bytes([0; 64]),
            )
            .await
            .unwrap();

        let apex = registry.zone(ZoneKind::Validators).apex().clone();
        let qname = key_owner_name(&key, &apex).to_string();

        let reply =
            ask(&registry, query(&qname, Rtype::A, None), false).await;
        assert!(reply.header().tc());
        assert_eq!(reply.header_counts().ancount(), 0);

        // The same query over TCP is never truncated.
        let reply =
            ask(&registry, query(&qname, Rtype::A, None), true).await;
        assert!(!reply.header().tc());
        assert_eq!(reply.header_counts().ancount(), 40);
    }

    #[tokio::test]
    async fn flash_channel_must_match_the_chain() {
        let registry = registry();
        let payload = RegistrationPayload {
            public_key: PublicKey::from_bytes([2; 33]),
            seq: 1,
            addresses: vec!["agora://1.2.3.4:2826".into()],
            ttl: 600,
        };
        let bad = KnownChannel {
            height: 5,
            conf: BlockHash([0xff; 32]),
        };
        let err = registry
            .post_flash_node(
                payload.clone(),
                &Signature::from_bytes([0; 64]),
                bad,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ChannelInvalid(_)));

        let good = KnownChannel {
            height: 5,
            conf: BlockHash([5; 32]),
        };
        registry
            .post_flash_node(payload, &Signature::from_bytes([0; 64]), good)
            .await
            .unwrap();
        assert!(registry
            .get_flash_node(&PublicKey::from_bytes([2; 33]))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn class_any_is_answered_without_authority() {
        let registry = registry();
        let mut builder = MessageBuilder::new_vec().question();
        builder
            .push((
                StoredName::from_str("validators.unittest").unwrap(),
                Rtype::SOA,
                Class::ANY,
            ))
            .unwrap();
        let msg = Message::from_octets(Bytes::from(
            builder.into_message().into_octets(),
        ))
        .unwrap();
        let reply = ask(&registry, msg, false).await;
        assert_eq!(reply.header().rcode(), Rcode::NOERROR);
        assert!(!reply.header().aa());
    }
}
