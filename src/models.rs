//! Data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::DcpMonError;

/// Seconds in one UTC day.
pub const SEC_PER_DAY: i64 = 86_400;

/// Milliseconds in one UTC day.
pub const MSEC_PER_DAY: i64 = SEC_PER_DAY * 1000;

/// Raw payloads longer than this are truncated before storage.
pub const MAX_RAW_LEN: usize = 7500;

/// A transmission record holds at most this many distinct failure codes.
pub const MAX_FAILURE_CODES: usize = 8;

/// Day number since the Unix epoch (Jan 1 1970 = day 0).
pub fn day_number(t: DateTime<Utc>) -> i32 {
    (t.timestamp() / SEC_PER_DAY) as i32
}

/// Second of day, 0 = midnight UTC.
pub fn second_of_day(t: DateTime<Utc>) -> u32 {
    (t.timestamp().rem_euclid(SEC_PER_DAY)) as u32
}

/// GOES DCP address
///
/// An eight-hex-digit identifier for a remote field station. Stored as the
/// raw 32-bit value; displayed in the fixed upper-case hex form used
/// throughout the reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StationAddress(u32);

impl TryFrom<&str> for StationAddress {
    type Error = DcpMonError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let s = value.trim();
        if s.is_empty() || s.len() > 8 {
            return Err(DcpMonError::InvalidAddress(value.to_string()));
        }
        u32::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| DcpMonError::InvalidAddress(value.to_string()))
    }
}

impl TryFrom<String> for StationAddress {
    type Error = DcpMonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<StationAddress> for String {
    fn from(addr: StationAddress) -> String {
        addr.to_string()
    }
}

impl std::fmt::Display for StationAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl StationAddress {
    /// Get the raw address value
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Rebuild from a raw value previously obtained with [`Self::value`].
    pub fn from_value(value: u32) -> Self {
        Self(value)
    }
}

/// Set of single-character failure codes on one transmission.
///
/// Codes are not mutually exclusive; a message can be both parity-errored
/// and late. Insertion order is preserved and duplicates are ignored. The
/// set holds at most [`MAX_FAILURE_CODES`] codes; extras are dropped.
///
/// Code legend: `G` good, `?` parity error, `A` correctable address,
/// `B` bad address, `D` duplicate, `I` invalid address, `M` missing,
/// `N` incomplete PDT entry, `Q` bad quality, `T` outside time slice,
/// `U` unexpected, `W` wrong channel, `C` excessive carrier, `S` low
/// signal strength, `F` excessive frequency offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCodes(Vec<char>);

/// Codes that indicate an anomaly rather than a normal receipt.
pub const ERROR_CODES: &str = "?MTUBIQW";

impl FailureCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code; no-op if already present or the set is full.
    pub fn add(&mut self, code: char) {
        if self.0.contains(&code) {
            return;
        }
        if self.0.len() < MAX_FAILURE_CODES {
            self.0.push(code);
        }
    }

    /// Remove a code if present.
    pub fn remove(&mut self, code: char) {
        self.0.retain(|&c| c != code);
    }

    pub fn has(&self, code: char) -> bool {
        self.0.contains(&code)
    }

    /// Union in every code from `other`.
    pub fn union(&mut self, other: &FailureCodes) {
        for &c in &other.0 {
            self.add(c);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_any_error(&self) -> bool {
        self.0.iter().any(|&c| ERROR_CODES.contains(c))
    }

    /// All codes as a display string, `-` when empty.
    pub fn as_string(&self) -> String {
        if self.0.is_empty() {
            "-".to_string()
        } else {
            self.0.iter().collect()
        }
    }
}

impl std::fmt::Display for FailureCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Baud-rate class of a transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudClass {
    B100,
    #[default]
    B300,
    B1200,
    Unknown,
}

impl BaudClass {
    pub fn from_baud(baud: u32) -> Self {
        match baud {
            100 => BaudClass::B100,
            300 => BaudClass::B300,
            1200 => BaudClass::B1200,
            _ => BaudClass::Unknown,
        }
    }

    /// Bits per second, 300 assumed for the unknown class.
    pub fn bits_per_sec(&self) -> u32 {
        match self {
            BaudClass::B100 => 100,
            BaudClass::B300 | BaudClass::Unknown => 300,
            BaudClass::B1200 => 1200,
        }
    }
}

/// Relay spacecraft a transmission came through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Spacecraft {
    East,
    West,
    #[default]
    Unknown,
}

/// Classification flags for one transmission record.
///
/// Named fields rather than a packed flag word; each corresponds to one
/// bit of the wire-level message-flag word supplied by the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmitFlags {
    pub baud: BaudClass,
    /// Random-reporting transmission (not self-timed).
    pub random: bool,
    pub spacecraft: Spacecraft,
    pub long_preamble: bool,
    /// Station is not a member of any configured group.
    pub not_my_group: bool,
    /// Carrier start/stop carry true millisecond resolution, i.e. an
    /// explicit non-estimated carrier stop was received.
    pub carrier_time_msec: bool,
}

/// One observed (or synthesized-missing) DCP transmission.
///
/// Created by the ingestion pipeline, mutated in place while resident in
/// the write-behind queue, immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XmitRecord {
    pub address: StationAddress,
    /// GOES channel number (1..=266).
    pub channel: u16,
    /// Day number since the epoch.
    pub day: i32,
    /// Second of day of the message time.
    pub sec_of_day: u32,
    pub failure_codes: FailureCodes,
    /// Signal strength in dB.
    pub signal_strength: i32,
    /// Frequency offset in units of 50 Hz.
    pub freq_offset: i32,
    /// Modulation index character, `?` when unknown.
    pub mod_index: char,
    /// Decoded battery voltage, 0.0 if no battery sensor was decoded.
    pub battery: f32,
    /// Carrier start, milliseconds since the epoch.
    pub carrier_start: i64,
    /// Carrier stop, milliseconds since the epoch.
    pub carrier_stop: i64,
    pub msg_length: u32,
    /// Receiver source code from the uplink-carrier field.
    pub uplink_carrier: String,
    /// Expected-transmission schedule, copied from the platform table.
    pub first_xmit_sod: i32,
    pub window_start_sec: i32,
    pub window_length_sec: i32,
    pub xmit_interval_sec: i32,
    pub flags: XmitFlags,
    /// Entire raw message including header, truncated at [`MAX_RAW_LEN`].
    pub raw: Vec<u8>,
}

impl XmitRecord {
    pub fn new(address: StationAddress, day: i32, sec_of_day: u32) -> Self {
        Self {
            address,
            channel: 0,
            day,
            sec_of_day,
            failure_codes: FailureCodes::new(),
            signal_strength: 0,
            msg_length: 0,
            freq_offset: 0,
            mod_index: '?',
            battery: 0.0,
            carrier_start: 0,
            carrier_stop: 0,
            uplink_carrier: String::new(),
            first_xmit_sod: -1,
            window_start_sec: -1,
            window_length_sec: 60,
            xmit_interval_sec: 0,
            flags: XmitFlags::default(),
            raw: Vec::new(),
        }
    }

    /// Message time, milliseconds since the epoch.
    pub fn goes_time_ms(&self) -> i64 {
        self.day as i64 * MSEC_PER_DAY + self.sec_of_day as i64 * 1000
    }

    /// Store the raw message, truncating at the storage cap.
    pub fn set_raw(&mut self, data: &[u8]) {
        if data.len() > MAX_RAW_LEN {
            warn!(
                address = %self.address,
                len = data.len(),
                "Raw message exceeds {MAX_RAW_LEN} bytes, truncating"
            );
            self.raw = data[..MAX_RAW_LEN].to_vec();
        } else {
            self.raw = data.to_vec();
        }
    }

    pub fn hour_of_day(&self) -> usize {
        (self.sec_of_day / 3600) as usize % 24
    }
}

/// One sampled value in a decoded sensor time series.
///
/// Values arrive as text; interpretation is up to the consumer. A sample
/// flagged `error` + `missing` is excluded from downstream use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: String,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub missing: bool,
}

/// A decoded sensor time series attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSeries {
    pub name: String,
    /// Sensor data-type code, e.g. `VB` for battery voltage.
    #[serde(default)]
    pub data_type: String,
    pub samples: Vec<Sample>,
}

/// Performance-measurement fields extracted from a message header by the
/// upstream decoder. Any field the decoder could not determine is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfMeasurements {
    pub failure_code: Option<char>,
    pub signal_strength: Option<i32>,
    pub freq_offset: Option<i32>,
    pub mod_index: Option<char>,
    /// Measured carrier start/stop, milliseconds since the epoch.
    pub carrier_start: Option<i64>,
    pub carrier_stop: Option<i64>,
    pub message_length: Option<u32>,
    pub uplink_carrier: Option<String>,
    pub baud: Option<u32>,
    pub spacecraft: Option<char>,
    /// Carrier times are estimates rather than measured to the msec.
    #[serde(default = "default_true")]
    pub carrier_time_estimated: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PerfMeasurements {
    fn default() -> Self {
        Self {
            failure_code: None,
            signal_strength: None,
            freq_offset: None,
            mod_index: None,
            carrier_start: None,
            carrier_stop: None,
            message_length: None,
            uplink_carrier: None,
            baud: None,
            spacecraft: None,
            // Absent information means the times are estimates.
            carrier_time_estimated: true,
        }
    }
}

/// One decoded-message event from the upstream decode pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    /// Transmitter address as it appeared in the header.
    pub address: String,
    pub channel: u16,
    /// Message time stamp from the relay.
    pub timestamp: DateTime<Utc>,
    /// Entire raw message including header.
    #[serde(default)]
    pub raw: Vec<u8>,
    #[serde(default)]
    pub pm: PerfMeasurements,
    #[serde(default)]
    pub sensors: Vec<SensorSeries>,
}
