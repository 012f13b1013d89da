//! The persistent store underneath the zones.
//!
//! One SQLite database per process, two tables per zone:
//!
//! ```text
//! registry_{zone}_utxo(pubkey TEXT PK, sequence INTEGER, utxo TEXT)
//! registry_{zone}_addresses(pubkey TEXT, address TEXT, type INTEGER,
//!                           ttl INTEGER, expires INTEGER,
//!                           PRIMARY KEY(pubkey, address))
//! ```
//!
//! The utxo table only ever has rows on a primary. Address rows hold the
//! registered URI verbatim (`type` = URI) plus one row per projected
//! host record (`type` = A/AAAA/CNAME, `address` = the host part).
//! `expires` is a unix timestamp on caching zones and zero on
//! authoritative ones.
//!
//! All queries are parameterised; table names are formatted in from the
//! fixed per-zone infix.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use domain::base::iana::Rtype;
use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::ledger::UtxoId;
use crate::payload::{parse_address, RegistrationPayload, TypedPayload};
use crate::pubkey::PublicKey;

//------------ unix_now ------------------------------------------------------

/// Seconds since the epoch; the store's and the SOA serial's time base.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs() as i64
}

//------------ Store ---------------------------------------------------------

/// The process-wide database handle.
///
/// Opened once and handed to each zone, which scopes itself to its own
/// pair of tables.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens or creates the database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database, for tests.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(())
    }

    /// A handle scoped to the tables of one zone.
    pub fn zone(&self, infix: &str) -> Result<ZoneStore, StoreError> {
        let store = ZoneStore {
            conn: self.conn.clone(),
            utxo_table: format!("registry_{infix}_utxo"),
            addr_table: format!("registry_{infix}_addresses"),
        };
        store.create_tables()?;
        Ok(store)
    }
}

//------------ AddressRow ----------------------------------------------------

/// One row of the addresses table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressRow {
    pub address: String,
    pub rtype: Rtype,
    pub ttl: u32,
    pub expires: i64,
}

//------------ ZoneStore -----------------------------------------------------

/// A zone's view of the store.
#[derive(Clone)]
pub struct ZoneStore {
    conn: Arc<Mutex<Connection>>,
    utxo_table: String,
    addr_table: String,
}

impl ZoneStore {
    fn create_tables(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {utxo} (
                 pubkey TEXT PRIMARY KEY,
                 sequence INTEGER NOT NULL,
                 utxo TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS {addr} (
                 pubkey TEXT NOT NULL,
                 address TEXT NOT NULL,
                 type INTEGER NOT NULL,
                 ttl INTEGER NOT NULL,
                 expires INTEGER NOT NULL,
                 PRIMARY KEY (pubkey, address));",
            utxo = self.utxo_table,
            addr = self.addr_table,
        ))?;
        Ok(())
    }

    //--- The utxo table

    /// The stored sequence number and stake anchor of a key.
    pub fn utxo_entry(
        &self,
        key: &PublicKey,
    ) -> Result<Option<(u64, UtxoId)>, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT sequence, utxo FROM {} WHERE pubkey = ?1",
            self.utxo_table
        ))?;
        let mut rows = stmt.query(params![key.to_canonical()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let seq = row.get::<_, i64>(0)? as u64;
        let utxo = row
            .get::<_, String>(1)?
            .parse::<UtxoId>()
            .map_err(|err| StoreError::Decode(err.into()))?;
        Ok(Some((seq, utxo)))
    }

    /// Every utxo row, for the slashing sweep.
    pub fn utxo_entries(
        &self,
    ) -> Result<Vec<(PublicKey, u64, UtxoId)>, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT pubkey, sequence, utxo FROM {} ORDER BY pubkey",
            self.utxo_table
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(key, seq, utxo)| {
                let key = PublicKey::parse(&key).map_err(|err| {
                    StoreError::Decode(format!("pubkey: {err}"))
                })?;
                let utxo = utxo.parse::<UtxoId>().map_err(|err| {
                    StoreError::Decode(err.into())
                })?;
                Ok((key, seq, utxo))
            })
            .collect()
    }

    //--- Payload writes

    /// Writes a payload, replacing whatever the key had before.
    ///
    /// One URI row per address plus one host row per address, all in a
    /// single transaction. `expires` is zero on authoritative zones and
    /// the eviction timestamp on caching ones. The utxo table is only
    /// touched when the payload carries a chain anchor.
    pub fn update(
        &self,
        typed: &TypedPayload,
        expires: i64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store poisoned");
        let tx = conn.transaction()?;
        Self::insert_payload(
            &tx,
            &self.utxo_table,
            &self.addr_table,
            typed,
            expires,
        )?;
        tx.commit()?;
        Ok(())
    }

    fn insert_payload(
        tx: &rusqlite::Transaction,
        utxo_table: &str,
        addr_table: &str,
        typed: &TypedPayload,
        expires: i64,
    ) -> Result<(), StoreError> {
        let key = typed.payload.public_key.to_canonical();
        tx.execute(
            &format!("DELETE FROM {addr_table} WHERE pubkey = ?1"),
            params![key],
        )?;
        for address in &typed.payload.addresses {
            let host = parse_address(address)
                .map_err(|err| StoreError::Decode(err.to_string()))?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {addr_table}
                     (pubkey, address, type, ttl, expires)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    key,
                    address,
                    Rtype::URI.to_int(),
                    typed.payload.ttl,
                    expires
                ],
            )?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {addr_table}
                     (pubkey, address, type, ttl, expires)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    key,
                    host.to_string(),
                    host.record_kind().rtype().to_int(),
                    typed.payload.ttl,
                    expires
                ],
            )?;
        }
        if !typed.utxo.is_zero() {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {utxo_table}
                     (pubkey, sequence, utxo) VALUES (?1, ?2, ?3)"
                ),
                params![
                    key,
                    typed.payload.seq as i64,
                    typed.utxo.to_string()
                ],
            )?;
        }
        Ok(())
    }

    /// Drops everything stored for a key.
    pub fn remove(&self, key: &PublicKey) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store poisoned");
        let tx = conn.transaction()?;
        let key = key.to_canonical();
        tx.execute(
            &format!("DELETE FROM {} WHERE pubkey = ?1", self.addr_table),
            params![key],
        )?;
        tx.execute(
            &format!("DELETE FROM {} WHERE pubkey = ?1", self.utxo_table),
            params![key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replaces the whole address table in one transaction.
    ///
    /// This is the AXFR import: the previous content only disappears
    /// once the transfer has fully arrived, and no reader ever sees the
    /// half-cleared state.
    pub fn replace_all(
        &self,
        payloads: &[TypedPayload],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store poisoned");
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", self.addr_table), [])?;
        for typed in payloads {
            Self::insert_payload(
                &tx,
                &self.utxo_table,
                &self.addr_table,
                typed,
                0,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Pushes a key's eviction deadline out.
    ///
    /// Used when upstream cannot be asked right now, so the sweep does
    /// not spin on the same key.
    pub fn postpone(
        &self,
        key: &PublicKey,
        until: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            &format!(
                "UPDATE {} SET expires = ?2 WHERE pubkey = ?1",
                self.addr_table
            ),
            params![key.to_canonical(), until],
        )?;
        Ok(())
    }

    /// Wipes all address rows. The secondary's expire path.
    pub fn clear_addresses(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(&format!("DELETE FROM {}", self.addr_table), [])?;
        Ok(())
    }

    //--- Reads

    /// Reconstructs the registration payload of a key.
    ///
    /// Addresses come from the URI rows in insertion order; the sequence
    /// number from the utxo table where one exists (primary), zero
    /// otherwise.
    pub fn payload(
        &self,
        key: &PublicKey,
    ) -> Result<Option<RegistrationPayload>, StoreError> {
        let rows = self.rows_of_type(key, Rtype::URI)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let ttl = rows.iter().map(|row| row.ttl).min().unwrap_or(0);
        let addresses = rows.into_iter().map(|row| row.address).collect();
        let seq = self
            .utxo_entry(key)?
            .map(|(seq, _)| seq)
            .unwrap_or_default();
        Ok(Some(RegistrationPayload {
            public_key: *key,
            seq,
            addresses,
            ttl,
        }))
    }

    /// All address rows of a key, URI rows included.
    pub fn rows(&self, key: &PublicKey) -> Result<Vec<AddressRow>, StoreError> {
        self.select_rows(
            &format!(
                "SELECT address, type, ttl, expires FROM {}
                 WHERE pubkey = ?1 ORDER BY rowid",
                self.addr_table
            ),
            params![key.to_canonical()],
        )
    }

    /// The address rows of a key with the given record type.
    pub fn rows_of_type(
        &self,
        key: &PublicKey,
        rtype: Rtype,
    ) -> Result<Vec<AddressRow>, StoreError> {
        self.select_rows(
            &format!(
                "SELECT address, type, ttl, expires FROM {}
                 WHERE pubkey = ?1 AND type = ?2 ORDER BY rowid",
                self.addr_table
            ),
            params![key.to_canonical(), rtype.to_int()],
        )
    }

    fn select_rows(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AddressRow>, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(AddressRow {
                    address: row.get(0)?,
                    rtype: Rtype::from_int(row.get::<_, i64>(1)? as u16),
                    ttl: row.get::<_, i64>(2)? as u32,
                    expires: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The distinct keys with address rows, a stable snapshot for
    /// enumeration.
    pub fn keys(&self) -> Result<Vec<PublicKey>, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT pubkey FROM {} ORDER BY pubkey",
            self.addr_table
        ))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        keys.into_iter()
            .map(|key| {
                PublicKey::parse(&key).map_err(|err| {
                    StoreError::Decode(format!("pubkey: {err}"))
                })
            })
            .collect()
    }

    /// Keys that have at least one row due for eviction.
    pub fn expired_keys(
        &self,
        now: i64,
    ) -> Result<Vec<PublicKey>, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT pubkey FROM {}
             WHERE expires > 0 AND expires <= ?1 ORDER BY pubkey",
            self.addr_table
        ))?;
        let keys = stmt
            .query_map(params![now], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        keys.into_iter()
            .map(|key| {
                PublicKey::parse(&key).map_err(|err| {
                    StoreError::Decode(format!("pubkey: {err}"))
                })
            })
            .collect()
    }

    /// The earliest pending eviction timestamp, if any.
    pub fn earliest_expiry(&self) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT MIN(expires) FROM {} WHERE expires > 0",
            self.addr_table
        ))?;
        let earliest = stmt.query_row([], |row| row.get::<_, Option<i64>>(0))?;
        Ok(earliest)
    }

    /// The number of keys with address rows.
    pub fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("store poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT COUNT(DISTINCT pubkey) FROM {}",
            self.addr_table
        ))?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::RecordKind;

    fn key(fill: u8) -> PublicKey {
        PublicKey::from_bytes([fill; 33])
    }

    fn typed(fill: u8, seq: u64, addresses: &[&str]) -> TypedPayload {
        TypedPayload::new(
            RecordKind::A,
            RegistrationPayload {
                public_key: key(fill),
                seq,
                addresses: addresses.iter().map(|s| s.to_string()).collect(),
                ttl: 600,
            },
            UtxoId::from_bytes([fill; 32]),
        )
    }

    fn store() -> ZoneStore {
        Store::open_memory().unwrap().zone("validators").unwrap()
    }

    #[test]
    fn update_then_read_round_trips() {
        let store = store();
        let typed = typed(1, 4, &["agora://1.2.3.4:2826"]);
        store.update(&typed, 0).unwrap();

        let payload = store.payload(&key(1)).unwrap().unwrap();
        assert_eq!(payload.seq, 4);
        assert_eq!(payload.addresses, typed.payload.addresses);

        let (seq, utxo) = store.utxo_entry(&key(1)).unwrap().unwrap();
        assert_eq!(seq, 4);
        assert_eq!(utxo, typed.utxo);
    }

    #[test]
    fn host_rows_mirror_uri_rows() {
        let store = store();
        store
            .update(&typed(1, 1, &["agora://1.2.3.4:2826"]), 0)
            .unwrap();
        let a_rows = store.rows_of_type(&key(1), Rtype::A).unwrap();
        assert_eq!(a_rows.len(), 1);
        assert_eq!(a_rows[0].address, "1.2.3.4");
        let uri_rows = store.rows_of_type(&key(1), Rtype::URI).unwrap();
        assert_eq!(uri_rows[0].address, "agora://1.2.3.4:2826");
    }

    #[test]
    fn caching_payloads_have_no_utxo_row() {
        let store = store();
        let mut cached = typed(2, 0, &["agora://1.2.3.4:2826"]);
        cached.utxo = UtxoId::zero();
        store.update(&cached, unix_now() + 5).unwrap();
        assert!(store.utxo_entry(&key(2)).unwrap().is_none());
        // But the payload is served, with sequence zero.
        assert_eq!(store.payload(&key(2)).unwrap().unwrap().seq, 0);
    }

    #[test]
    fn replace_all_swaps_content() {
        let store = store();
        store
            .update(&typed(1, 1, &["agora://1.2.3.4:2826"]), 0)
            .unwrap();
        store
            .replace_all(&[typed(2, 1, &["agora://5.6.7.8:2826"])])
            .unwrap();
        assert!(store.payload(&key(1)).unwrap().is_none());
        assert!(store.payload(&key(2)).unwrap().is_some());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn expiry_queries_see_only_dated_rows() {
        let store = store();
        let now = unix_now();
        store
            .update(&typed(1, 1, &["agora://1.2.3.4:2826"]), now - 1)
            .unwrap();
        store
            .update(&typed(2, 1, &["agora://5.6.7.8:2826"]), now + 60)
            .unwrap();
        assert_eq!(store.expired_keys(now).unwrap(), vec![key(1)]);
        assert_eq!(store.earliest_expiry().unwrap(), Some(now - 1));
        store.remove(&key(1)).unwrap();
        assert_eq!(store.earliest_expiry().unwrap(), Some(now + 60));
    }

    #[test]
    fn clear_addresses_keeps_utxo_rows() {
        let store = store();
        store
            .update(&typed(1, 1, &["agora://1.2.3.4:2826"]), 0)
            .unwrap();
        store.clear_addresses().unwrap();
        assert!(store.payload(&key(1)).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }
}
