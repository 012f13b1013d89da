//! The per-zone engine.
//!
//! A [`Zone`] plays one of three roles, fixed at construction: primary
//! (authoritative origin, writes bump the serial), secondary
//! (authoritative replica kept fresh by SOA polling and AXFR) or caching
//! (non-authoritative, filled on demand and evicted by TTL). All three
//! share one data layout — the zone's pair of store tables — and differ
//! in who is allowed to write it and which timers run against it.
//!
//! Secondary and caching zones own a maintenance task driving two
//! timers: the SOA poll timer and the expire/eviction timer. Everything
//! that mutates zone state runs either on that task or under the store's
//! transactions, so readers never observe a half-applied update.

use core::time::Duration;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use domain::base::iana::{Class, Rcode, Rtype};
use domain::base::{Record, Serial, Ttl};
use domain::rdata::{Aaaa, Cname, Ns, Soa, A};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{TransferAcl, ZoneConfig, ZoneRole};
use crate::error::{ApiError, StoreError};
use crate::ledger::{Ledger, UtxoId};
use crate::payload::{
    ensure_valid_payload, key_from_owner, key_owner_name,
    service_owner_name, RegistrationPayload, TypedPayload,
};
use crate::pubkey::PublicKey;
use crate::rdata::{StoredName, StoredRecord, Uri};
use crate::resolver::Upstream;
use crate::store::{unix_now, AddressRow, Store, ZoneStore};
use crate::timer::Timer;

//------------ Constants -----------------------------------------------------

/// Poll intervals of zero are floored to this.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(90);

/// How long an eviction sweep backs off a key whose upstream is down.
const SWEEP_BACKOFF_SECS: i64 = 60;

//------------ ZoneKind ------------------------------------------------------

/// Which of the three registry zones this is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneKind {
    /// The realm apex zone.
    Realm,

    /// `validators.{realm}`, bound to on-chain stake.
    Validators,

    /// `flash.{realm}`, the payment channel nodes.
    Flash,
}

impl ZoneKind {
    /// The infix of the zone's store tables.
    pub fn table_infix(self) -> &'static str {
        match self {
            ZoneKind::Realm => "realm",
            ZoneKind::Validators => "validators",
            ZoneKind::Flash => "flash",
        }
    }

    /// The zone's apex under the configured realm domain.
    pub fn apex(self, realm: &str) -> StoredName {
        let name = match self {
            ZoneKind::Realm => realm.to_string(),
            ZoneKind::Validators => format!("validators.{realm}"),
            ZoneKind::Flash => format!("flash.{realm}"),
        };
        StoredName::from_str(&name).expect("realm domain is a valid name")
    }
}

//------------ ZoneAnswer ----------------------------------------------------

/// A zone's reply to one question.
#[derive(Clone, Debug)]
pub struct ZoneAnswer {
    pub rcode: Rcode,

    /// Whether the answer is authoritative (AA).
    pub authoritative: bool,

    /// Whether recursion-ish service was involved (RA on caching zones).
    pub recursion: bool,

    pub answers: Vec<StoredRecord>,
    pub authorities: Vec<StoredRecord>,
}

impl ZoneAnswer {
    fn new(rcode: Rcode, role: ZoneRole) -> Self {
        ZoneAnswer {
            rcode,
            authoritative: role.is_authoritative(),
            recursion: role == ZoneRole::Caching,
            answers: Vec::new(),
            authorities: Vec::new(),
        }
    }
}

//------------ ZoneCmd -------------------------------------------------------

/// Commands towards a zone's maintenance task.
#[derive(Clone, Copy, Debug)]
enum ZoneCmd {
    /// Cancel a pending SOA poll and run one now.
    Refresh,

    /// The set of eviction deadlines changed; re-arm the TTL timer.
    TtlChanged,

    /// Shut the task down.
    Stop,
}

//------------ ZoneState -----------------------------------------------------

struct ZoneState {
    /// The zone's SOA. A primary seeds it at construction; replicas and
    /// caches learn it from upstream.
    soa: Option<Soa<StoredName>>,

    /// The TTL the SOA is served with.
    soa_ttl: Ttl,

    /// Memoised validator set: the height after which it must be
    /// refreshed, and the set itself.
    validators: Option<(u64, Vec<crate::ledger::ValidatorInfo>)>,
}

//------------ Zone ----------------------------------------------------------

/// One zone of the registry.
pub struct Zone {
    kind: ZoneKind,
    apex: StoredName,
    role: ZoneRole,
    config: ZoneConfig,
    acl: TransferAcl,
    store: ZoneStore,
    state: Mutex<ZoneState>,
    upstream: Mutex<Option<Arc<dyn Upstream>>>,
    cmd_tx: Mutex<Option<mpsc::Sender<ZoneCmd>>>,
}

impl Zone {
    /// Creates the zone and its store tables.
    ///
    /// The role is derived from the config and never changes.
    pub fn new(
        kind: ZoneKind,
        realm: &str,
        config: ZoneConfig,
        store: &Store,
    ) -> Result<Self, StoreError> {
        let apex = kind.apex(realm);
        let role = config.role();
        let zone_store = store.zone(kind.table_infix())?;
        let soa = match role {
            ZoneRole::Primary => Some(Soa::new(
                config.mname(&apex),
                config.soa.rname(&apex),
                Serial::now(),
                Ttl::from_secs(config.soa.refresh),
                Ttl::from_secs(config.soa.retry),
                Ttl::from_secs(config.soa.expire),
                Ttl::from_secs(config.soa.minimum),
            )),
            _ => None,
        };
        let soa_ttl = Ttl::from_secs(config.soa.minimum);
        let acl = TransferAcl::new(&config.allow_transfer);
        Ok(Zone {
            kind,
            apex,
            role,
            config,
            acl,
            store: zone_store,
            state: Mutex::new(ZoneState {
                soa,
                soa_ttl,
                validators: None,
            }),
            upstream: Mutex::new(None),
            cmd_tx: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn apex(&self) -> &StoredName {
        &self.apex
    }

    pub fn role(&self) -> ZoneRole {
        self.role
    }

    pub fn redirect_register(&self) -> Option<&str> {
        self.config.redirect_register.as_deref()
    }

    /// The configured upstream servers.
    pub fn query_servers(&self) -> &[std::net::SocketAddr] {
        &self.config.query_servers
    }

    /// Starts the zone's maintenance.
    ///
    /// The upstream client is injected here rather than at construction
    /// so the registry can build it after all zones exist. Primaries have
    /// nothing to maintain and spawn no task.
    pub fn start(self: &Arc<Self>, upstream: Option<Arc<dyn Upstream>>) {
        *self.upstream.lock().expect("zone poisoned") = upstream;
        if self.role == ZoneRole::Primary {
            return;
        }
        let (tx, rx) = mpsc::channel(8);
        *self.cmd_tx.lock().expect("zone poisoned") = Some(tx);
        tokio::spawn(self.clone().run(rx));
    }

    /// Stops the maintenance task.
    pub fn stop(&self) {
        self.send_cmd(ZoneCmd::Stop);
    }

    /// Asks the maintenance task to cancel any pending SOA poll and run
    /// one immediately. The pull-only rendition of a NOTIFY.
    pub fn notify_refresh(&self) {
        self.send_cmd(ZoneCmd::Refresh);
    }

    fn send_cmd(&self, cmd: ZoneCmd) {
        let tx = self.cmd_tx.lock().expect("zone poisoned").clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(cmd);
        }
    }

    fn upstream(&self) -> Option<Arc<dyn Upstream>> {
        self.upstream.lock().expect("zone poisoned").clone()
    }

    //--- The maintenance task

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ZoneCmd>) {
        let mut soa_timer = Timer::new();
        let mut expire_timer = Timer::new();

        // Both replica roles pull an initial SOA immediately. A
        // secondary also starts its expire clock; it only stops once a
        // poll succeeds. A caching zone may come up with persisted rows,
        // so its eviction timer is armed from the store.
        soa_timer.rearm(Duration::ZERO);
        match self.role {
            ZoneRole::Secondary => {
                expire_timer.rearm(self.expire_interval());
            }
            ZoneRole::Caching => self.arm_ttl_timer(&mut expire_timer),
            ZoneRole::Primary => return,
        }

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(ZoneCmd::Stop) => break,
                    Some(ZoneCmd::Refresh) => {
                        soa_timer.stop();
                        self.update_soa(&mut soa_timer, &mut expire_timer)
                            .await;
                    }
                    Some(ZoneCmd::TtlChanged) => {
                        self.arm_ttl_timer(&mut expire_timer);
                    }
                },

                _ = soa_timer.wait() => {
                    self.update_soa(&mut soa_timer, &mut expire_timer).await;
                }

                _ = expire_timer.wait() => match self.role {
                    ZoneRole::Secondary => self.disable(),
                    ZoneRole::Caching => {
                        self.sweep_expired().await;
                        self.arm_ttl_timer(&mut expire_timer);
                    }
                    ZoneRole::Primary => unreachable!(),
                },
            }
        }
        debug!("zone {} maintenance stopped", self.apex);
    }

    /// One SOA maintenance round.
    ///
    /// On a replica this polls the upstream: a failure re-arms the poll
    /// at the RETRY interval and, on a secondary, starts the expire
    /// clock if it is not already running; a success adopts the
    /// received TTL, transfers the zone if the serial moved (secondary),
    /// re-arms the poll and stops the expire clock.
    pub(crate) async fn update_soa(
        &self,
        soa_timer: &mut Timer,
        expire_timer: &mut Timer,
    ) {
        debug_assert!(self.role != ZoneRole::Primary);
        let Some(upstream) = self.upstream() else {
            warn!("zone {} has no upstream configured", self.apex);
            return;
        };

        match upstream.query_soa(self.apex.clone()).await {
            Err(err) => {
                warn!("zone {}: SOA refresh failed: {err}", self.apex);
                soa_timer.rearm(self.retry_interval());
                if self.role == ZoneRole::Secondary
                    && !expire_timer.pending()
                {
                    expire_timer.rearm(self.expire_interval());
                }
            }

            Ok((soa, ttl)) => {
                let (newer, refresh) = {
                    let mut state = self.state.lock().expect("poisoned");
                    state.soa_ttl = ttl;
                    let newer = match &state.soa {
                        Some(current) => soa.serial() > current.serial(),
                        None => true,
                    };
                    if newer {
                        debug!(
                            "zone {}: serial {} adopted",
                            self.apex,
                            soa.serial()
                        );
                        state.soa = Some(soa.clone());
                    }
                    (newer, soa.refresh())
                };

                if self.role == ZoneRole::Secondary && newer {
                    self.transfer(&upstream).await;
                }

                let next = match self.role {
                    ZoneRole::Secondary => refresh.into_duration(),
                    _ => ttl.into_duration(),
                };
                // A zero interval would poll in a tight loop.
                let next = if next.is_zero() {
                    MIN_POLL_INTERVAL
                } else {
                    next
                };
                soa_timer.rearm(next);
                if self.role == ZoneRole::Secondary {
                    expire_timer.stop();
                }
            }
        }
    }

    /// Pulls the zone by AXFR and replaces the local content.
    ///
    /// The store only changes after the transfer has fully arrived; a
    /// failed transfer leaves the previous content serving.
    async fn transfer(&self, upstream: &Arc<dyn Upstream>) {
        let records = match upstream.transfer(self.apex.clone()).await {
            Ok(records) => records,
            Err(err) => {
                warn!("zone {}: transfer failed: {err}", self.apex);
                return;
            }
        };

        let mut groups: BTreeMap<PublicKey, Vec<StoredRecord>> =
            BTreeMap::new();
        for record in records {
            if record.rtype() != Rtype::URI {
                continue;
            }
            let Ok(key) = key_from_owner(record.owner()) else {
                continue;
            };
            groups.entry(key).or_default().push(record);
        }
        let payloads: Vec<TypedPayload> = groups
            .values()
            .filter_map(|records| TypedPayload::make(records))
            .collect();

        match self.store.replace_all(&payloads) {
            Ok(()) => info!(
                "zone {}: transferred {} registrations",
                self.apex,
                payloads.len()
            ),
            Err(err) => {
                warn!("zone {}: transfer import failed: {err}", self.apex)
            }
        }
    }

    /// The secondary's expire path: the replica is too stale to serve.
    ///
    /// Wipes the address rows so lookups answer name-error, and forgets
    /// the SOA so that the next successful poll transfers the zone
    /// afresh whatever serial the primary then reports. The SOA poll
    /// keeps running, so the zone recovers on its own.
    fn disable(&self) {
        warn!("zone {}: expire elapsed, disabling", self.apex);
        if let Err(err) = self.store.clear_addresses() {
            warn!("zone {}: disable failed: {err}", self.apex);
            return;
        }
        self.state.lock().expect("poisoned").soa = None;
    }

    /// The caching zone's eviction sweep.
    ///
    /// Re-queries upstream for every key with an expired row and either
    /// overwrites the registration or, when upstream no longer has it,
    /// drops the key. An unreachable upstream postpones the key instead
    /// of spinning.
    async fn sweep_expired(&self) {
        let Some(upstream) = self.upstream() else {
            return;
        };
        let now = unix_now();
        let keys = match self.store.expired_keys(now) {
            Ok(keys) => keys,
            Err(err) => {
                warn!("zone {}: expiry scan failed: {err}", self.apex);
                return;
            }
        };

        for key in keys {
            let service = service_owner_name(&key, &self.apex);
            match upstream.query(service, Rtype::URI).await {
                Ok(records) => {
                    match TypedPayload::make(&records) {
                        Some(typed) => {
                            let expires =
                                unix_now() + i64::from(typed.payload.ttl);
                            if let Err(err) =
                                self.store.update(&typed, expires)
                            {
                                warn!(
                                    "zone {}: refresh of {key} failed: {err}",
                                    self.apex
                                );
                            }
                        }
                        None => {
                            debug!(
                                "zone {}: upstream dropped {key}, evicting",
                                self.apex
                            );
                            if let Err(err) = self.store.remove(&key) {
                                warn!(
                                    "zone {}: eviction of {key} failed: {err}",
                                    self.apex
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(
                        "zone {}: upstream unreachable for {key}: {err}",
                        self.apex
                    );
                    let _ = self
                        .store
                        .postpone(&key, now + SWEEP_BACKOFF_SECS);
                }
            }
        }
    }

    /// Re-arms the eviction timer to the earliest pending expiry.
    fn arm_ttl_timer(&self, expire_timer: &mut Timer) {
        match self.store.earliest_expiry() {
            Ok(Some(at)) => {
                let delay = (at - unix_now()).max(1) as u64;
                expire_timer.rearm(Duration::from_secs(delay));
            }
            Ok(None) => expire_timer.stop(),
            Err(err) => {
                warn!("zone {}: expiry scan failed: {err}", self.apex)
            }
        }
    }

    fn retry_interval(&self) -> Duration {
        let state = self.state.lock().expect("poisoned");
        let secs = state
            .soa
            .as_ref()
            .map(|soa| soa.retry().as_secs())
            .unwrap_or(self.config.soa.retry);
        if secs == 0 {
            MIN_POLL_INTERVAL
        } else {
            Duration::from_secs(secs.into())
        }
    }

    fn expire_interval(&self) -> Duration {
        let state = self.state.lock().expect("poisoned");
        let secs = state
            .soa
            .as_ref()
            .map(|soa| soa.expire().as_secs())
            .unwrap_or(self.config.soa.expire);
        Duration::from_secs(secs.into())
    }

    //--- Registration writes

    /// Registers a validator payload on the primary.
    ///
    /// Validates the payload against the stored one, binds it to a stake
    /// output and stores it; the serial moves so replicas pick the
    /// change up.
    pub fn register_validator(
        &self,
        payload: RegistrationPayload,
        ledger: &dyn Ledger,
    ) -> Result<(), ApiError> {
        let previous = self.store.payload(&payload.public_key)?;
        let kind = ensure_valid_payload(&payload, previous.as_ref())?;
        let utxo = self
            .stake_for(&payload.public_key, ledger)
            .ok_or(ApiError::NoStake(payload.public_key))?;
        self.store
            .update(&TypedPayload::new(kind, payload, utxo), 0)?;
        self.bump_serial();
        Ok(())
    }

    /// Registers a flash node payload on the primary.
    ///
    /// The channel was already checked against the ledger; its hash
    /// anchors the registration.
    pub fn register_flash(
        &self,
        payload: RegistrationPayload,
        anchor: UtxoId,
    ) -> Result<(), ApiError> {
        let previous = self.store.payload(&payload.public_key)?;
        let kind = ensure_valid_payload(&payload, previous.as_ref())?;
        self.store
            .update(&TypedPayload::new(kind, payload, anchor), 0)?;
        self.bump_serial();
        Ok(())
    }

    /// Installs a payload learned from upstream into a caching zone.
    ///
    /// No signature and no stake are checked here: the cache trusts the
    /// upstream it was configured with. Rows are dated for eviction.
    pub fn install_cached(
        &self,
        payload: RegistrationPayload,
    ) -> Result<(), ApiError> {
        debug_assert!(self.role == ZoneRole::Caching);
        let kind = ensure_valid_payload(&payload, None)?;
        let expires = unix_now() + i64::from(payload.ttl);
        self.store.update(
            &TypedPayload::new(kind, payload, UtxoId::zero()),
            expires,
        )?;
        self.send_cmd(ZoneCmd::TtlChanged);
        Ok(())
    }

    /// The stored registration of a key, if any.
    pub fn payload(
        &self,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, StoreError> {
        self.store.payload(key)
    }

    /// The number of registered keys, for diagnostics.
    pub fn num_keys(&self) -> Result<usize, StoreError> {
        self.store.len()
    }

    /// Drops a key's registration and moves the serial.
    pub fn remove(&self, key: &PublicKey) -> Result<(), StoreError> {
        self.store.remove(key)?;
        self.bump_serial();
        Ok(())
    }

    /// Moves the primary's serial: `max(now, serial + 1)`.
    fn bump_serial(&self) {
        if self.role != ZoneRole::Primary {
            return;
        }
        let mut state = self.state.lock().expect("poisoned");
        if let Some(soa) = state.soa.take() {
            let now = Serial::now();
            let next = if now > soa.serial() {
                now
            } else {
                soa.serial().add(1)
            };
            state.soa = Some(Soa::new(
                soa.mname().clone(),
                soa.rname().clone(),
                next,
                soa.refresh(),
                soa.retry(),
                soa.expire(),
                soa.minimum(),
            ));
        }
    }

    //--- Chain binding

    /// Finds the stake output entitling a key to register.
    ///
    /// Looks first through the memoised validator set, then through the
    /// general stake outputs. The memo refreshes when the chain has
    /// grown past the memoised height.
    fn stake_for(
        &self,
        key: &PublicKey,
        ledger: &dyn Ledger,
    ) -> Option<UtxoId> {
        let mut state = self.state.lock().expect("poisoned");
        let height = ledger.height();
        let stale = match &state.validators {
            Some((seen, cached)) => height + 1 > *seen || cached.is_empty(),
            None => true,
        };
        if stale {
            state.validators =
                Some((height + 1, ledger.validators_at(height)));
        }
        let (_, validators) = state.validators.as_ref().expect("just set");
        if let Some(info) =
            validators.iter().find(|info| info.address == *key)
        {
            return Some(info.utxo);
        }
        drop(state);
        ledger
            .stakes()
            .into_iter()
            .find(|stake| stake.owner == *key)
            .map(|stake| stake.utxo)
    }

    /// Removes every payload whose stake was slashed.
    ///
    /// The primary validator zone's block hook: a payload is live only
    /// while its stake retains a penalty deposit.
    pub fn sweep_slashed(
        &self,
        ledger: &dyn Ledger,
    ) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (key, _seq, utxo) in self.store.utxo_entries()? {
            if ledger.penalty_deposit(&utxo).is_zero() {
                info!(
                    "zone {}: stake of {key} slashed, removing",
                    self.apex
                );
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.bump_serial();
        }
        Ok(removed)
    }

    /// Whether the active validator set differs from the memoised one.
    ///
    /// Updates the memo as a side effect; used by the secondary
    /// validator zone's block hook to poll early.
    pub fn validator_set_changed(&self, ledger: &dyn Ledger) -> bool {
        let height = ledger.height();
        let current = ledger.validators_at(height);
        let mut state = self.state.lock().expect("poisoned");
        let changed = match &state.validators {
            Some((_, cached)) => *cached != current,
            None => true,
        };
        state.validators = Some((height + 1, current));
        changed
    }

    //--- DNS answers

    /// The zone's SOA as a servable record, if it has one yet.
    pub fn soa_record(&self) -> Option<StoredRecord> {
        let state = self.state.lock().expect("poisoned");
        state.soa.as_ref().map(|soa| {
            Record::new(
                self.apex.clone(),
                Class::IN,
                state.soa_ttl,
                soa.clone().into(),
            )
        })
    }

    /// The zone's NS record.
    pub fn ns_record(&self) -> StoredRecord {
        Record::new(
            self.apex.clone(),
            Class::IN,
            Ttl::from_secs(self.config.soa.minimum),
            Ns::new(self.config.mname(&self.apex)).into(),
        )
    }

    /// Every record of the zone, one registration after another.
    ///
    /// A stable snapshot under the cooperative model; feeds AXFR-out.
    pub fn all_records(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.store.keys()? {
            let owner = key_owner_name(&key, &self.apex);
            let service = service_owner_name(&key, &self.apex);
            for row in self.store.rows(&key)? {
                let owner = if row.rtype == Rtype::URI {
                    &service
                } else {
                    &owner
                };
                if let Some(record) = row_to_record(owner, &row) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Answers one question for a name this zone owns.
    ///
    /// `matches` says the question name is the apex itself rather than a
    /// name below it.
    pub async fn answer(
        &self,
        matches: bool,
        qname: &StoredName,
        qtype: Rtype,
        peer: IpAddr,
    ) -> ZoneAnswer {
        match qtype {
            Rtype::AXFR => self.answer_axfr(matches, peer),
            Rtype::SOA => self.answer_soa(matches),
            Rtype::NS => self.answer_ns(matches),
            _ => self.answer_records(qname, qtype).await,
        }
    }

    /// Serves a full transfer: SOA, every record, SOA again.
    fn answer_axfr(&self, matches: bool, peer: IpAddr) -> ZoneAnswer {
        if !matches
            || self.role == ZoneRole::Caching
            || !self.acl.allows(peer)
        {
            debug!("zone {}: refusing AXFR from {peer}", self.apex);
            return ZoneAnswer::new(Rcode::REFUSED, self.role);
        }
        let Some(soa) = self.soa_record() else {
            return ZoneAnswer::new(Rcode::REFUSED, self.role);
        };
        let mut answer = ZoneAnswer::new(Rcode::NOERROR, self.role);
        answer.answers.push(soa.clone());
        match self.all_records() {
            Ok(records) => answer.answers.extend(records),
            Err(err) => {
                warn!("zone {}: enumeration failed: {err}", self.apex);
                return ZoneAnswer::new(Rcode::SERVFAIL, self.role);
            }
        }
        answer.answers.push(soa);
        answer
    }

    fn answer_soa(&self, matches: bool) -> ZoneAnswer {
        let mut answer = ZoneAnswer::new(Rcode::NOERROR, self.role);
        if let Some(soa) = self.soa_record() {
            if matches {
                answer.answers.push(soa);
            } else {
                answer.authorities.push(soa);
            }
        }
        answer
    }

    fn answer_ns(&self, matches: bool) -> ZoneAnswer {
        if !matches {
            return ZoneAnswer::new(Rcode::REFUSED, self.role);
        }
        let mut answer = ZoneAnswer::new(Rcode::NOERROR, self.role);
        answer.answers.push(self.ns_record());
        answer
    }

    /// Looks up address records below the apex.
    async fn answer_records(
        &self,
        qname: &StoredName,
        qtype: Rtype,
    ) -> ZoneAnswer {
        let Ok(key) = key_from_owner(qname) else {
            return ZoneAnswer::new(Rcode::FORMERR, self.role);
        };

        let mut rows = self.lookup(&key, qtype);
        if rows.as_ref().map_or(false, Vec::is_empty)
            && self.role == ZoneRole::Caching
            && self.get_and_cache(&key).await
        {
            rows = self.lookup(&key, qtype);
        }

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                warn!("zone {}: lookup failed: {err}", self.apex);
                return ZoneAnswer::new(Rcode::SERVFAIL, self.role);
            }
        };
        if rows.is_empty() {
            let mut answer = ZoneAnswer::new(Rcode::NXDOMAIN, self.role);
            if self.role != ZoneRole::Caching {
                if let Some(soa) = self.soa_record() {
                    answer.authorities.push(soa);
                }
            }
            return answer;
        }

        let mut answer = ZoneAnswer::new(Rcode::NOERROR, self.role);
        for row in &rows {
            if let Some(record) = row_to_record(qname, row) {
                answer.answers.push(record);
            }
        }
        if self.role != ZoneRole::Caching {
            if let Some(soa) = self.soa_record() {
                answer.authorities.push(soa);
            }
        }
        answer
    }

    /// Fetches rows of the requested type with the CNAME fallback of
    /// RFC 1034 section 3.6.2.
    fn lookup(
        &self,
        key: &PublicKey,
        qtype: Rtype,
    ) -> Result<Vec<AddressRow>, StoreError> {
        let rows = if qtype == Rtype::ANY {
            self.store.rows(key)?
        } else {
            self.store.rows_of_type(key, qtype)?
        };
        if rows.is_empty()
            && !matches!(qtype, Rtype::CNAME | Rtype::ANY)
        {
            return self.store.rows_of_type(key, Rtype::CNAME);
        }
        Ok(rows)
    }

    /// Fills the cache from upstream on a miss.
    ///
    /// Fetches the key's URI record set, reconstructs the payload and
    /// installs it with dated rows. Returns whether anything landed.
    async fn get_and_cache(&self, key: &PublicKey) -> bool {
        let Some(upstream) = self.upstream() else {
            return false;
        };
        let service = service_owner_name(key, &self.apex);
        let records = match upstream.query(service, Rtype::URI).await {
            Ok(records) => records,
            Err(err) => {
                debug!(
                    "zone {}: upstream fetch for {key} failed: {err}",
                    self.apex
                );
                return false;
            }
        };
        let Some(typed) = TypedPayload::make(&records) else {
            return false;
        };
        let expires = unix_now() + i64::from(typed.payload.ttl);
        match self.store.update(&typed, expires) {
            Ok(()) => {
                self.send_cmd(ZoneCmd::TtlChanged);
                true
            }
            Err(err) => {
                warn!(
                    "zone {}: caching {key} failed: {err}",
                    self.apex
                );
                false
            }
        }
    }
}

//------------ row_to_record -------------------------------------------------

/// Projects one store row into a servable record at the given owner.
fn row_to_record(
    owner: &StoredName,
    row: &AddressRow,
) -> Option<StoredRecord> {
    let ttl = Ttl::from_secs(row.ttl);
    let data = match row.rtype {
        Rtype::A => A::new(row.address.parse().ok()?).into(),
        Rtype::AAAA => Aaaa::new(row.address.parse().ok()?).into(),
        Rtype::CNAME => {
            Cname::new(StoredName::from_str(&row.address).ok()?).into()
        }
        Rtype::URI => Uri::new(
            1,
            1,
            Bytes::copy_from_slice(row.address.as_bytes()),
        )
        .into(),
        _ => return None,
    };
    Some(Record::new(owner.clone(), Class::IN, ttl, data))
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoaConfig;
    use crate::ledger::{
        Amount, BlockHash, BlockHeader, StakeOutput, ValidatorInfo,
    };
    use crate::rdata::RegistryRecordData;
    use std::sync::Mutex as StdMutex;

    //------------ Test ledger -----------------------------------------------

    struct TestLedger {
        height: u64,
        validators: Vec<ValidatorInfo>,
        stakes: Vec<StakeOutput>,
        deposits: StdMutex<std::collections::HashMap<UtxoId, Amount>>,
    }

    impl TestLedger {
        fn with_validator(key: PublicKey, utxo: UtxoId) -> Self {
            let mut deposits = std::collections::HashMap::new();
            deposits.insert(utxo, Amount(10_000));
            TestLedger {
                height: 100,
                validators: vec![ValidatorInfo { address: key, utxo }],
                stakes: Vec::new(),
                deposits: StdMutex::new(deposits),
            }
        }

        fn slash(&self, utxo: UtxoId) {
            self.deposits.lock().unwrap().insert(utxo, Amount::ZERO);
        }
    }

    impl Ledger for TestLedger {
        fn height(&self) -> u64 {
            self.height
        }

        fn validators_at(&self, _height: u64) -> Vec<ValidatorInfo> {
            self.validators.clone()
        }

        fn stakes(&self) -> Vec<StakeOutput> {
            self.stakes.clone()
        }

        fn penalty_deposit(&self, utxo: &UtxoId) -> Amount {
            self.deposits
                .lock()
                .unwrap()
                .get(utxo)
                .copied()
                .unwrap_or(Amount::ZERO)
        }

        fn block_at(&self, height: u64) -> Option<BlockHeader> {
            (height <= self.height).then(|| BlockHeader {
                height,
                hash: BlockHash([height as u8; 32]),
            })
        }
    }

    //------------ Helpers ---------------------------------------------------

    fn key(fill: u8) -> PublicKey {
        PublicKey::from_bytes([fill; 33])
    }

    fn utxo(fill: u8) -> UtxoId {
        UtxoId::from_bytes([fill; 32])
    }

    fn payload(fill: u8, seq: u64, addr: &str) -> RegistrationPayload {
        RegistrationPayload {
            public_key: key(fill),
            seq,
            addresses: vec![addr.into()],
            ttl: 600,
        }
    }

    fn primary_zone() -> Zone {
        let config = ZoneConfig {
            authoritative: true,
            soa: SoaConfig {
                email: Some("admin@unittest".into()),
                ..Default::default()
            },
            allow_transfer: vec!["192.0.2.1".parse().unwrap()],
            ..Default::default()
        };
        Zone::new(
            ZoneKind::Validators,
            "unittest",
            config,
            &Store::open_memory().unwrap(),
        )
        .unwrap()
    }

    fn peer() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    //------------ Tests -----------------------------------------------------

    #[tokio::test]
    async fn register_then_answer_a_and_uri() {
        let zone = primary_zone();
        let ledger = TestLedger::with_validator(key(1), utxo(1));
        zone.register_validator(
            payload(1, 1, "agora://1.2.3.4:2826"),
            &ledger,
        )
        .unwrap();

        let qname = key_owner_name(&key(1), zone.apex());
        let answer = zone.answer(false, &qname, Rtype::A, peer()).await;
        assert_eq!(answer.rcode, Rcode::NOERROR);
        assert!(answer.authoritative);
        assert!(!answer.recursion);
        assert_eq!(answer.answers.len(), 1);
        assert!(matches!(
            answer.answers[0].data(),
            RegistryRecordData::A(a) if a.addr() == "1.2.3.4".parse::<std::net::Ipv4Addr>().unwrap()
        ));
        // Authoritative answers carry the SOA in the authority section.
        assert_eq!(answer.authorities.len(), 1);

        let service = service_owner_name(&key(1), zone.apex());
        let answer =
            zone.answer(false, &service, Rtype::URI, peer()).await;
        assert_eq!(answer.rcode, Rcode::NOERROR);
        assert!(matches!(
            answer.answers[0].data(),
            RegistryRecordData::Uri(uri)
                if uri.target_str() == Some("agora://1.2.3.4:2826")
        ));
    }

    #[tokio::test]
    async fn unknown_key_answers_name_error() {
        let zone = primary_zone();
        let qname = key_owner_name(&key(9), zone.apex());
        let answer = zone.answer(false, &qname, Rtype::A, peer()).await;
        assert_eq!(answer.rcode, Rcode::NXDOMAIN);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test]
    async fn garbage_label_answers_format_error() {
        let zone = primary_zone();
        let qname =
            StoredName::from_str("not-a-key.validators.unittest").unwrap();
        let answer = zone.answer(false, &qname, Rtype::A, peer()).await;
        assert_eq!(answer.rcode, Rcode::FORMERR);
    }

    #[tokio::test]
    async fn cname_fallback_applies() {
        let zone = primary_zone();
        let ledger = TestLedger::with_validator(key(1), utxo(1));
        zone.register_validator(
            payload(1, 1, "agora://host.example:2826"),
            &ledger,
        )
        .unwrap();

        let qname = key_owner_name(&key(1), zone.apex());
        let answer = zone.answer(false, &qname, Rtype::A, peer()).await;
        assert_eq!(answer.rcode, Rcode::NOERROR);
        assert_eq!(answer.answers[0].rtype(), Rtype::CNAME);
    }

    #[tokio::test]
    async fn axfr_is_gated_by_the_acl() {
        let zone = primary_zone();
        let ledger = TestLedger::with_validator(key(1), utxo(1));
        zone.register_validator(
            payload(1, 1, "agora://1.2.3.4:2826"),
            &ledger,
        )
        .unwrap();

        let apex = zone.apex().clone();
        let answer = zone.answer(true, &apex, Rtype::AXFR, peer()).await;
        assert_eq!(answer.rcode, Rcode::NOERROR);
        // SOA, A, URI, SOA.
        assert_eq!(answer.answers.len(), 4);
        assert_eq!(answer.answers[0].rtype(), Rtype::SOA);
        assert_eq!(answer.answers.last().unwrap().rtype(), Rtype::SOA);

        let outsider: IpAddr = "203.0.113.9".parse().unwrap();
        let answer = zone.answer(true, &apex, Rtype::AXFR, outsider).await;
        assert_eq!(answer.rcode, Rcode::REFUSED);
    }

    #[tokio::test]
    async fn slashing_sweep_removes_and_bumps() {
        let zone = primary_zone();
        let ledger = TestLedger::with_validator(key(1), utxo(1));
        zone.register_validator(
            payload(1, 1, "agora://1.2.3.4:2826"),
            &ledger,
        )
        .unwrap();
        let serial_before = zone
            .soa_record()
            .map(|record| match record.data() {
                RegistryRecordData::Soa(soa) => soa.serial(),
                _ => unreachable!(),
            })
            .unwrap();

        ledger.slash(utxo(1));
        assert_eq!(zone.sweep_slashed(&ledger).unwrap(), 1);

        let qname = key_owner_name(&key(1), zone.apex());
        let answer = zone.answer(false, &qname, Rtype::A, peer()).await;
        assert_eq!(answer.rcode, Rcode::NXDOMAIN);

        let serial_after = zone
            .soa_record()
            .map(|record| match record.data() {
                RegistryRecordData::Soa(soa) => soa.serial(),
                _ => unreachable!(),
            })
            .unwrap();
        assert!(serial_after > serial_before);
    }

    #[tokio::test]
    async fn stale_write_leaves_storage_unchanged() {
        let zone = primary_zone();
        let ledger = TestLedger::with_validator(key(1), utxo(1));
        zone.register_validator(
            payload(1, 3, "agora://1.2.3.4:2826"),
            &ledger,
        )
        .unwrap();
        let err = zone
            .register_validator(
                payload(1, 2, "agora://5.6.7.8:2826"),
                &ledger,
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::StaleSequence { .. }));

        let stored = zone.payload(&key(1)).unwrap().unwrap();
        assert_eq!(stored.addresses, vec!["agora://1.2.3.4:2826"]);
        assert_eq!(stored.seq, 3);
    }

    #[tokio::test]
    async fn no_stake_is_rejected() {
        let zone = primary_zone();
        let ledger = TestLedger::with_validator(key(1), utxo(1));
        let err = zone
            .register_validator(
                payload(2, 1, "agora://1.2.3.4:2826"),
                &ledger,
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::NoStake(_)));
    }

    #[tokio::test]
    async fn soa_query_on_apex_and_below() {
        let zone = primary_zone();
        let apex = zone.apex().clone();
        let answer = zone.answer(true, &apex, Rtype::SOA, peer()).await;
        assert_eq!(answer.answers.len(), 1);
        assert!(answer.authorities.is_empty());

        let below = key_owner_name(&key(1), zone.apex());
        let answer = zone.answer(false, &below, Rtype::SOA, peer()).await;
        assert!(answer.answers.is_empty());
        assert_eq!(answer.authorities.len(), 1);
    }
}
