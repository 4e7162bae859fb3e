//! Transmission record persistence.
//!
//! The ingestion and report components speak to storage through the
//! [`XmitStore`] trait; [`Db`] is the SQLite implementation.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags, Row};
use tracing::info;

use crate::errors::DcpMonError;
use crate::models::{BaudClass, FailureCodes, Spacecraft, StationAddress, XmitRecord};

/// Which records a report query selects, always combined with a day number.
#[derive(Debug, Clone)]
pub enum QueryScope {
    Address(StationAddress),
    /// Members of a group.
    Addresses(Vec<StationAddress>),
    Channel(u16),
}

/// Write contract for transmission records.
///
/// `write` is upsert-by-key (address, day, second-of-day); the drain
/// worker brackets runs of writes with `begin`/`commit` to limit
/// transaction overhead.
pub trait XmitStore: Send + Sync {
    fn write(&self, rec: &XmitRecord) -> Result<(), DcpMonError>;
    fn query(&self, scope: &QueryScope, day: i32) -> Result<Vec<XmitRecord>, DcpMonError>;
    /// Find a same-day record for `address` within the coalescing window
    /// of `time_ms`.
    fn find(
        &self,
        address: StationAddress,
        day: i32,
        time_ms: i64,
    ) -> Result<Option<XmitRecord>, DcpMonError>;
    /// Delete all records with a day number before `day`; returns the
    /// number of rows removed.
    fn delete_before(&self, day: i32) -> Result<usize, DcpMonError>;
    fn begin(&self) -> Result<(), DcpMonError>;
    fn commit(&self) -> Result<(), DcpMonError>;
}

/// Read access to store-backed station groups.
pub trait GroupStore: Send + Sync {
    /// Last-modified time (unix seconds) of the named group, if present.
    fn group_modified(&self, name: &str) -> Result<Option<i64>, DcpMonError>;
    /// Member entries: address, optional display name, optional description.
    #[allow(clippy::type_complexity)]
    fn group_members(
        &self,
        name: &str,
    ) -> Result<Vec<(StationAddress, Option<String>, Option<String>)>, DcpMonError>;
}

/// SQLite-backed store.
pub struct Db {
    connection: Mutex<Connection>,
}

const XMIT_COLUMNS: &str = "address, day, sec_of_day, channel, failure_codes, \
     signal_strength, freq_offset, mod_index, battery, carrier_start, carrier_stop, \
     msg_length, uplink_carrier, first_xmit_sod, window_start, window_length, \
     xmit_interval, baud, random, spacecraft, long_preamble, not_my_group, \
     carrier_time_msec, raw";

impl Db {
    /// Open or create the database with optimized settings.
    pub fn open(path: &Path) -> Result<Self, DcpMonError> {
        info!("Opening database at {}", path.display());
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_READ_WRITE,
        )?;

        // Configure for performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        Self::create_tables_indices(&conn)?;

        Ok(Self {
            connection: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, DcpMonError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables_indices(&conn)?;
        Ok(Self {
            connection: Mutex::new(conn),
        })
    }

    fn create_tables_indices(conn: &Connection) -> Result<(), DcpMonError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS xmit_record (
                address INTEGER,
                day INTEGER,
                sec_of_day INTEGER,
                channel INTEGER,
                failure_codes TEXT,
                signal_strength INTEGER,
                freq_offset INTEGER,
                mod_index TEXT,
                battery REAL,
                carrier_start INTEGER,
                carrier_stop INTEGER,
                msg_length INTEGER,
                uplink_carrier TEXT,
                first_xmit_sod INTEGER,
                window_start INTEGER,
                window_length INTEGER,
                xmit_interval INTEGER,
                baud INTEGER,
                random INTEGER,
                spacecraft TEXT,
                long_preamble INTEGER,
                not_my_group INTEGER,
                carrier_time_msec INTEGER,
                raw BLOB,
                PRIMARY KEY (address, day, sec_of_day)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_xmit_day_channel
                ON xmit_record(day, channel)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_xmit_day_address
                ON xmit_record(day, address)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS group_list (
                name TEXT PRIMARY KEY,
                modified INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS group_member (
                group_name TEXT,
                address INTEGER,
                station_name TEXT,
                description TEXT,
                PRIMARY KEY (group_name, address)
            )",
            [],
        )?;

        Ok(())
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<XmitRecord> {
        let mod_index: String = row.get("mod_index")?;
        let spacecraft: String = row.get("spacecraft")?;
        let codes: String = row.get("failure_codes")?;
        let mut failure_codes = FailureCodes::new();
        for c in codes.chars() {
            failure_codes.add(c);
        }
        Ok(XmitRecord {
            address: StationAddress::from_value(row.get::<_, u32>("address")?),
            day: row.get("day")?,
            sec_of_day: row.get("sec_of_day")?,
            channel: row.get("channel")?,
            failure_codes,
            signal_strength: row.get("signal_strength")?,
            freq_offset: row.get("freq_offset")?,
            mod_index: mod_index.chars().next().unwrap_or('?'),
            battery: row.get("battery")?,
            carrier_start: row.get("carrier_start")?,
            carrier_stop: row.get("carrier_stop")?,
            msg_length: row.get("msg_length")?,
            uplink_carrier: row.get("uplink_carrier")?,
            first_xmit_sod: row.get("first_xmit_sod")?,
            window_start_sec: row.get("window_start")?,
            window_length_sec: row.get("window_length")?,
            xmit_interval_sec: row.get("xmit_interval")?,
            flags: crate::models::XmitFlags {
                baud: BaudClass::from_baud(row.get::<_, u32>("baud")?),
                random: row.get("random")?,
                spacecraft: match spacecraft.chars().next() {
                    Some('E') => Spacecraft::East,
                    Some('W') => Spacecraft::West,
                    _ => Spacecraft::Unknown,
                },
                long_preamble: row.get("long_preamble")?,
                not_my_group: row.get("not_my_group")?,
                carrier_time_msec: row.get("carrier_time_msec")?,
            },
            raw: row.get("raw")?,
        })
    }
}

impl XmitStore for Db {
    fn write(&self, rec: &XmitRecord) -> Result<(), DcpMonError> {
        let conn = self.connection.lock().unwrap();
        let baud = match rec.flags.baud {
            BaudClass::Unknown => 0,
            other => other.bits_per_sec(),
        };
        let spacecraft = match rec.flags.spacecraft {
            Spacecraft::East => "E",
            Spacecraft::West => "W",
            Spacecraft::Unknown => "U",
        };
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO xmit_record ({XMIT_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
            ),
            params![
                rec.address.value(),
                rec.day,
                rec.sec_of_day,
                rec.channel,
                rec.failure_codes.as_string(),
                rec.signal_strength,
                rec.freq_offset,
                rec.mod_index.to_string(),
                rec.battery,
                rec.carrier_start,
                rec.carrier_stop,
                rec.msg_length,
                rec.uplink_carrier,
                rec.first_xmit_sod,
                rec.window_start_sec,
                rec.window_length_sec,
                rec.xmit_interval_sec,
                baud,
                rec.flags.random,
                spacecraft,
                rec.flags.long_preamble,
                rec.flags.not_my_group,
                rec.flags.carrier_time_msec,
                rec.raw,
            ],
        )?;
        Ok(())
    }

    fn query(&self, scope: &QueryScope, day: i32) -> Result<Vec<XmitRecord>, DcpMonError> {
        let conn = self.connection.lock().unwrap();
        let mut out = Vec::new();
        match scope {
            QueryScope::Address(addr) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {XMIT_COLUMNS} FROM xmit_record WHERE day = ?1 AND address = ?2"
                ))?;
                let rows = stmt.query_map(params![day, addr.value()], Self::row_to_record)?;
                for r in rows {
                    out.push(r?);
                }
            }
            QueryScope::Addresses(addrs) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {XMIT_COLUMNS} FROM xmit_record WHERE day = ?1 AND address = ?2"
                ))?;
                for addr in addrs {
                    let rows = stmt.query_map(params![day, addr.value()], Self::row_to_record)?;
                    for r in rows {
                        out.push(r?);
                    }
                }
            }
            QueryScope::Channel(chan) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {XMIT_COLUMNS} FROM xmit_record WHERE day = ?1 AND channel = ?2"
                ))?;
                let rows = stmt.query_map(params![day, chan], Self::row_to_record)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    fn find(
        &self,
        address: StationAddress,
        day: i32,
        time_ms: i64,
    ) -> Result<Option<XmitRecord>, DcpMonError> {
        let conn = self.connection.lock().unwrap();
        let sec = (time_ms / 1000).rem_euclid(crate::models::SEC_PER_DAY);
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {XMIT_COLUMNS} FROM xmit_record
                WHERE day = ?1 AND address = ?2
                AND sec_of_day BETWEEN ?3 AND ?4
                ORDER BY ABS(sec_of_day - ?5) LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(
            params![day, address.value(), sec - 120, sec + 120, sec],
            Self::row_to_record,
        )?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    fn delete_before(&self, day: i32) -> Result<usize, DcpMonError> {
        let conn = self.connection.lock().unwrap();
        let n = conn.execute("DELETE FROM xmit_record WHERE day < ?1", params![day])?;
        Ok(n)
    }

    fn begin(&self) -> Result<(), DcpMonError> {
        let conn = self.connection.lock().unwrap();
        conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&self) -> Result<(), DcpMonError> {
        let conn = self.connection.lock().unwrap();
        conn.execute_batch("COMMIT")?;
        Ok(())
    }
}

impl GroupStore for Db {
    fn group_modified(&self, name: &str) -> Result<Option<i64>, DcpMonError> {
        let conn = self.connection.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT modified FROM group_list WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], |row| row.get::<_, i64>(0))?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    fn group_members(
        &self,
        name: &str,
    ) -> Result<Vec<(StationAddress, Option<String>, Option<String>)>, DcpMonError> {
        let conn = self.connection.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT address, station_name, description FROM group_member
                WHERE group_name = ?1",
        )?;
        let rows = stmt.query_map(params![name], |row| {
            Ok((
                StationAddress::from_value(row.get::<_, u32>(0)?),
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
