//! Report generation.
//!
//! Everything here is derived at request time from persisted transmission
//! records plus the reference tables; nothing in this module writes to
//! the store. The message-status fold requires its input sorted by
//! (address, channel, second-of-day), which [`fold_status_rows`]
//! establishes itself rather than trusting the caller.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::config::ThresholdConfig;
use crate::errors::DcpMonError;
use crate::groups::DcpGroupList;
use crate::models::{day_number, FailureCodes, StationAddress, XmitRecord, MSEC_PER_DAY, SEC_PER_DAY};
use crate::pdt::ReferenceData;
use crate::scrub::RetentionScrubber;
use crate::storage::{QueryScope, XmitStore};

/// Slack past the end of the assigned window before a silent slot is
/// declared missing.
pub const MISSING_GRACE_SEC: i32 = 30;

/// Unexpected-transmission times are quantized to this when matching
/// against the expected list.
const MERGE_QUANTUM_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Warning,
    Alarm,
}

impl Status {
    /// Single-char prefix used in report lines, empty for normal.
    pub fn prefix(&self) -> &'static str {
        match self {
            Status::Normal => "",
            Status::Warning => "Y:",
            Status::Alarm => "R:",
        }
    }
}

/// Which side of the thresholds is bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    /// Values below yellow warn, below red alarm (battery, signal).
    AlarmBelow,
    /// Values above yellow warn, above red alarm (frequency offset).
    AlarmAbove,
}

pub fn classify(value: f64, red: f64, yellow: f64, sense: Sense) -> Status {
    match sense {
        Sense::AlarmBelow if value < red => Status::Alarm,
        Sense::AlarmBelow if value < yellow => Status::Warning,
        Sense::AlarmAbove if value > red => Status::Alarm,
        Sense::AlarmAbove if value > yellow => Status::Warning,
        _ => Status::Normal,
    }
}

/// Status of the failure-code field itself.
pub fn code_status(codes: &FailureCodes, thresholds: &ThresholdConfig) -> Status {
    if thresholds.red_failure_codes.chars().any(|c| codes.has(c)) {
        Status::Alarm
    } else if thresholds
        .yellow_failure_codes
        .chars()
        .any(|c| codes.has(c))
    {
        Status::Warning
    } else {
        Status::Normal
    }
}

/// Status of the message time relative to the assigned window: the
/// classified value is the smaller margin to either window edge.
pub fn msg_time_status(rec: &XmitRecord, thresholds: &ThresholdConfig) -> Status {
    if rec.window_start_sec < 0 {
        return Status::Normal;
    }
    let sod = rec.sec_of_day as i32;
    let margin = (sod - rec.window_start_sec)
        .min(rec.window_start_sec + rec.window_length_sec - sod);
    classify(
        margin as f64,
        thresholds.red_msg_time as f64,
        thresholds.yellow_msg_time as f64,
        Sense::AlarmBelow,
    )
}

pub fn battery_status(rec: &XmitRecord, thresholds: &ThresholdConfig) -> Status {
    if rec.battery == 0.0 {
        // No battery telemetry decoded.
        return Status::Normal;
    }
    classify(
        rec.battery as f64,
        thresholds.red_battery,
        thresholds.yellow_battery,
        Sense::AlarmBelow,
    )
}

pub fn signal_status(rec: &XmitRecord, thresholds: &ThresholdConfig) -> Status {
    classify(
        rec.signal_strength as f64,
        thresholds.red_signal_strength as f64,
        thresholds.yellow_signal_strength as f64,
        Sense::AlarmBelow,
    )
}

pub fn freq_offset_status(rec: &XmitRecord, thresholds: &ThresholdConfig) -> Status {
    classify(
        rec.freq_offset.abs() as f64,
        thresholds.red_freq_offset as f64,
        thresholds.yellow_freq_offset as f64,
        Sense::AlarmAbove,
    )
}

/// One row of the message-status report: a (station, channel, day) with
/// the union of failure codes seen in each hour of that day.
#[derive(Debug, Clone)]
pub struct MsgStatusRow {
    pub address: StationAddress,
    pub name: Option<String>,
    pub channel: u16,
    pub day: i32,
    pub hours: [FailureCodes; 24],
}

impl MsgStatusRow {
    fn new(address: StationAddress, name: Option<String>, channel: u16, day: i32) -> Self {
        Self {
            address,
            name,
            channel,
            day,
            hours: Default::default(),
        }
    }
}

/// Fold transmission records into message-status rows, one per
/// (station, channel, day). Codes landing in an occupied hour bucket
/// union with what is there.
pub fn fold_status_rows<F>(mut records: Vec<XmitRecord>, name_of: F) -> Vec<MsgStatusRow>
where
    F: Fn(StationAddress) -> Option<String>,
{
    records.sort_by_key(|r| (r.address, r.channel, r.day, r.sec_of_day));
    let mut rows: Vec<MsgStatusRow> = Vec::new();
    for rec in records {
        let matches_last = rows
            .last()
            .map(|row| (row.address, row.channel, row.day) == (rec.address, rec.channel, rec.day))
            .unwrap_or(false);
        if !matches_last {
            rows.push(MsgStatusRow::new(
                rec.address,
                name_of(rec.address),
                rec.channel,
                rec.day,
            ));
        }
        let row = rows.last_mut().unwrap();
        row.hours[rec.hour_of_day()].union(&rec.failure_codes);
    }
    rows
}

fn merge_key(rec: &XmitRecord) -> (i64, StationAddress) {
    (rec.goes_time_ms() / MERGE_QUANTUM_MS, rec.address)
}

/// Merge unexpected transmissions into an expected list. Both sides are
/// matched on quantized time plus address; an unexpected record with no
/// expected counterpart is inserted in order and tagged `U`, one with a
/// counterpart only contributes its codes.
pub fn merge_unexpected(main: &mut Vec<XmitRecord>, unexpected: Vec<XmitRecord>) {
    main.sort_by_key(merge_key);
    for mut rec in unexpected {
        let key = merge_key(&rec);
        match main.binary_search_by_key(&key, merge_key) {
            Ok(i) => {
                let codes = rec.failure_codes.clone();
                main[i].failure_codes.union(&codes);
            }
            Err(i) => {
                rec.failure_codes.add('U');
                main.insert(i, rec);
            }
        }
    }
}

/// Synthesize `M` records for every scheduled slot on `day` whose
/// deadline (window end plus grace) passed with no observed record.
/// Used by both the status and the detailed report paths.
#[allow(clippy::too_many_arguments)]
pub fn synthesize_missing(
    records: &mut Vec<XmitRecord>,
    address: StationAddress,
    channel: u16,
    day: i32,
    first_sod: i32,
    interval: i32,
    window: i32,
    now_ms: i64,
) {
    if interval <= 0 || first_sod < 0 {
        return;
    }
    // Slot indices already covered by an observed record.
    let covered: HashSet<i32> = records
        .iter()
        .filter(|r| r.address == address && r.day == day)
        .map(|r| (r.sec_of_day as i32 - first_sod + interval / 2).div_euclid(interval))
        .collect();

    let mut sod = first_sod;
    let mut slot = 0;
    while (sod as i64) < SEC_PER_DAY {
        let deadline_ms = day as i64 * MSEC_PER_DAY + (sod + window + MISSING_GRACE_SEC) as i64 * 1000;
        if deadline_ms <= now_ms && !covered.contains(&slot) {
            let mut rec = XmitRecord::new(address, day, sod as u32);
            rec.channel = channel;
            rec.failure_codes.add('M');
            rec.first_xmit_sod = first_sod;
            rec.xmit_interval_sec = interval;
            rec.window_length_sec = window;
            rec.window_start_sec = sod;
            records.push(rec);
        }
        sod += interval;
        slot += 1;
    }
}

/// Sort policies offered by the report commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    AddressChannelTime,
    TimeAscending,
    TimeDescending,
}

pub fn apply_sort(records: &mut [XmitRecord], order: SortOrder) {
    match order {
        SortOrder::AddressChannelTime => {
            records.sort_by_key(|r| (r.address, r.channel, r.day, r.sec_of_day))
        }
        SortOrder::TimeAscending => records.sort_by_key(|r| (r.day, r.sec_of_day, r.address)),
        SortOrder::TimeDescending => {
            records.sort_by_key(|r| std::cmp::Reverse((r.day, r.sec_of_day, r.address)))
        }
    }
}

/// Presentation order of the status report: channel, then scheduled
/// first transmission, then station name. Stations without a platform
/// entry sort after scheduled ones on the same channel.
pub fn sort_status_rows<F>(rows: &mut [MsgStatusRow], first_sod_of: F)
where
    F: Fn(StationAddress) -> Option<i32>,
{
    rows.sort_by(|a, b| {
        let fa = first_sod_of(a.address).unwrap_or(i32::MAX);
        let fb = first_sod_of(b.address).unwrap_or(i32::MAX);
        (a.channel, fa, &a.name, a.day).cmp(&(b.channel, fb, &b.name, b.day))
    });
}

/// Read side of the monitor: answers the report protocol's queries.
pub struct ReportEngine {
    store: Arc<dyn XmitStore>,
    groups: Arc<DcpGroupList>,
    refdata: Arc<ReferenceData>,
    scrubber: Arc<RetentionScrubber>,
    pub thresholds: ThresholdConfig,
}

impl ReportEngine {
    pub fn new(
        store: Arc<dyn XmitStore>,
        groups: Arc<DcpGroupList>,
        refdata: Arc<ReferenceData>,
        scrubber: Arc<RetentionScrubber>,
        thresholds: ThresholdConfig,
    ) -> Self {
        Self {
            store,
            groups,
            refdata,
            scrubber,
            thresholds,
        }
    }

    pub fn groups(&self) -> &DcpGroupList {
        &self.groups
    }

    pub fn refdata(&self) -> &ReferenceData {
        &self.refdata
    }

    /// A station argument is either an 8-hex-digit address or a display
    /// name known to some group.
    pub fn resolve_station(&self, arg: &str) -> Result<StationAddress, DcpMonError> {
        if let Ok(addr) = StationAddress::try_from(arg) {
            return Ok(addr);
        }
        self.groups
            .address_of(arg)
            .ok_or_else(|| DcpMonError::InvalidAddress(arg.to_string()))
    }

    fn day_range(&self, ndays: u32, date: Option<NaiveDate>) -> Result<Vec<i32>, DcpMonError> {
        let last = match date {
            Some(d) => {
                let midnight = d.and_hms_opt(0, 0, 0)
                    .map(|t| t.and_utc())
                    .ok_or_else(|| DcpMonError::ConfigurationError {
                        message: format!("Bad date {d}"),
                    })?;
                day_number(midnight)
            }
            None => day_number(Utc::now()),
        };
        let ndays = ndays.max(1) as i32;
        let first = last - ndays + 1;
        self.scrubber.check_day(first)?;
        self.scrubber.check_day(last)?;
        Ok((first..=last).collect())
    }

    /// Message-status rows for a group or a `Channel_N` scope over the
    /// last `ndays` days.
    pub fn status_report(
        &self,
        scope: &str,
        ndays: u32,
    ) -> Result<Vec<MsgStatusRow>, DcpMonError> {
        let days = self.day_range(ndays, None)?;
        let now_ms = Utc::now().timestamp_millis();
        let pdt = self.refdata.pdt();

        let mut records = Vec::new();
        if let Some(chan) = scope.strip_prefix("Channel_") {
            let channel: u16 = chan
                .parse()
                .map_err(|_| DcpMonError::NoSuchGroup(scope.to_string()))?;
            for &day in &days {
                records.extend(self.store.query(&QueryScope::Channel(channel), day)?);
            }
        } else {
            let group = self
                .groups
                .group(scope)
                .ok_or_else(|| DcpMonError::NoSuchGroup(scope.to_string()))?;
            let addresses: Vec<StationAddress> = group.addresses().collect();
            if !addresses.is_empty() {
                for &day in &days {
                    records.extend(
                        self.store
                            .query(&QueryScope::Addresses(addresses.clone()), day)?,
                    );
                }
            }
            // Off-schedule transmissions fold in as unexpected.
            let (expected, unexpected): (Vec<_>, Vec<_>) = records.drain(..).partition(|r| {
                pdt.get(r.address)
                    .map(|e| e.st_channel == r.channel)
                    .unwrap_or(true)
            });
            records = expected;
            merge_unexpected(&mut records, unexpected);

            for &address in &addresses {
                if let Some(e) = pdt.get(address) {
                    for &day in &days {
                        synthesize_missing(
                            &mut records,
                            address,
                            e.st_channel,
                            day,
                            e.first_xmit_sod,
                            e.xmit_interval,
                            e.xmit_window,
                            now_ms,
                        );
                    }
                }
            }
        }

        let mut rows = fold_status_rows(records, |a| self.groups.name_of(a));
        sort_status_rows(&mut rows, |a| pdt.get(a).map(|e| e.first_xmit_sod));
        Ok(rows)
    }

    /// Detailed performance records for one station over `ndays` days,
    /// optionally anchored at a given date, time ascending.
    pub fn performance_report(
        &self,
        station: &str,
        ndays: u32,
        date: Option<NaiveDate>,
    ) -> Result<Vec<XmitRecord>, DcpMonError> {
        let address = self.resolve_station(station)?;
        let days = self.day_range(ndays, date)?;
        let now_ms = Utc::now().timestamp_millis();

        let mut records = Vec::new();
        for &day in &days {
            records.extend(self.store.query(&QueryScope::Address(address), day)?);
        }

        let pdt = self.refdata.pdt();
        if let Some(e) = pdt.get(address) {
            let (expected, unexpected): (Vec<_>, Vec<_>) =
                records.drain(..).partition(|r| r.channel == e.st_channel);
            records = expected;
            merge_unexpected(&mut records, unexpected);
            for &day in &days {
                synthesize_missing(
                    &mut records,
                    address,
                    e.st_channel,
                    day,
                    e.first_xmit_sod,
                    e.xmit_interval,
                    e.xmit_window,
                    now_ms,
                );
            }
        }

        apply_sort(&mut records, SortOrder::TimeAscending);
        Ok(records)
    }

    /// Fetch one stored message near the given time.
    pub fn find_message(
        &self,
        station: &str,
        time_ms: i64,
    ) -> Result<Option<XmitRecord>, DcpMonError> {
        let address = self.resolve_station(station)?;
        let day = (time_ms / MSEC_PER_DAY) as i32;
        self.scrubber.check_day(day)?;
        self.store.find(address, day, time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> StationAddress {
        StationAddress::try_from(s).unwrap()
    }

    fn record(a: &str, channel: u16, day: i32, sod: u32, code: char) -> XmitRecord {
        let mut r = XmitRecord::new(addr(a), day, sod);
        r.channel = channel;
        r.failure_codes.add(code);
        r
    }

    #[test]
    fn classify_threshold_edges() {
        // Battery style: red 9, yellow 11, alarm below.
        assert_eq!(classify(8.9, 9.0, 11.0, Sense::AlarmBelow), Status::Alarm);
        assert_eq!(classify(9.0, 9.0, 11.0, Sense::AlarmBelow), Status::Warning);
        assert_eq!(classify(11.0, 9.0, 11.0, Sense::AlarmBelow), Status::Normal);
        assert_eq!(classify(20.0, 9.0, 11.0, Sense::AlarmBelow), Status::Normal);

        // Frequency-offset style: red 6, yellow 5, alarm above.
        assert_eq!(classify(6.5, 6.0, 5.0, Sense::AlarmAbove), Status::Alarm);
        assert_eq!(classify(5.5, 6.0, 5.0, Sense::AlarmAbove), Status::Warning);
        assert_eq!(classify(4.0, 6.0, 5.0, Sense::AlarmAbove), Status::Normal);
    }

    #[test]
    fn freq_offset_uses_absolute_value() {
        let mut r = record("CE123456", 98, 19_000, 100, 'G');
        r.freq_offset = -7;
        let t = ThresholdConfig::default();
        assert_eq!(freq_offset_status(&r, &t), Status::Alarm);
    }

    #[test]
    fn fold_unions_codes_by_hour() {
        let records = vec![
            record("CE123456", 98, 19_000, 100, 'G'),
            record("CE123456", 98, 19_000, 200, '?'),
            record("CE123456", 98, 19_000, 3700, 'G'),
            record("CE123457", 98, 19_000, 100, 'G'),
            record("CE123456", 99, 19_000, 100, 'U'),
        ];
        let rows = fold_status_rows(records, |_| None);
        assert_eq!(rows.len(), 3);

        let row = &rows[0];
        assert_eq!(row.address, addr("CE123456"));
        assert_eq!(row.channel, 98);
        assert_eq!(row.hours[0].as_string(), "G?");
        assert_eq!(row.hours[1].as_string(), "G");
        assert_eq!(row.hours[2].as_string(), "-");
    }

    #[test]
    fn merge_unexpected_matches_on_quantized_time() {
        let mut main = vec![record("CE123456", 98, 19_000, 1000, 'G')];
        // 3 seconds later, same 5-second bucket: merges, no new entry.
        let mut dup = record("CE123456", 99, 19_000, 1003, 'W');
        dup.sec_of_day = 1003;
        // A genuinely different transmission.
        let other = record("CE123456", 99, 19_000, 5000, 'G');

        merge_unexpected(&mut main, vec![dup, other]);
        assert_eq!(main.len(), 2);
        assert_eq!(main[0].failure_codes.as_string(), "GW");
        assert!(main[1].failure_codes.has('U'));
    }

    #[test]
    fn missing_slots_respect_deadline() {
        // First slot at midnight, hourly, 60 s window. At 7205 s into the
        // day, slots 0 and 3600 are past deadline, 7200 is not.
        let day = 19_000;
        let now_ms = day as i64 * MSEC_PER_DAY + 7205 * 1000;
        let mut records = Vec::new();
        synthesize_missing(&mut records, addr("CE123456"), 98, day, 0, 3600, 60, now_ms);

        let sods: Vec<u32> = records.iter().map(|r| r.sec_of_day).collect();
        assert_eq!(sods, vec![0, 3600]);
        assert!(records.iter().all(|r| r.failure_codes.has('M')));
    }

    #[test]
    fn observed_slot_is_not_missing() {
        let day = 19_000;
        let now_ms = (day + 1) as i64 * MSEC_PER_DAY;
        // Observed 12 seconds into the second slot.
        let mut records = vec![record("CE123456", 98, day, 3612, 'G')];
        synthesize_missing(&mut records, addr("CE123456"), 98, day, 0, 3600, 60, now_ms);

        let missing: Vec<u32> = records
            .iter()
            .filter(|r| r.failure_codes.has('M'))
            .map(|r| r.sec_of_day)
            .collect();
        assert_eq!(missing.len(), 23);
        assert!(!missing.contains(&3600));
    }

    #[test]
    fn sort_orders() {
        let mut records = vec![
            record("CE123457", 98, 19_000, 200, 'G'),
            record("CE123456", 98, 19_000, 100, 'G'),
            record("CE123456", 98, 19_001, 50, 'G'),
        ];
        apply_sort(&mut records, SortOrder::TimeDescending);
        assert_eq!(
            records
                .iter()
                .map(|r| (r.day, r.sec_of_day))
                .collect::<Vec<_>>(),
            vec![(19_001, 50), (19_000, 200), (19_000, 100)]
        );

        apply_sort(&mut records, SortOrder::AddressChannelTime);
        assert_eq!(records[0].address, addr("CE123456"));
        assert_eq!(records[0].sec_of_day, 100);
    }

    #[test]
    fn status_rows_sort_by_channel_slot_then_name() {
        let mut rows = vec![
            MsgStatusRow::new(addr("CE123458"), Some("ZULU".to_string()), 99, 19_000),
            MsgStatusRow::new(addr("CE123456"), Some("BRAVO".to_string()), 98, 19_000),
            MsgStatusRow::new(addr("CE123457"), Some("ALPHA".to_string()), 98, 19_000),
            MsgStatusRow::new(addr("CE123459"), Some("ECHO".to_string()), 98, 19_000),
        ];
        // BRAVO transmits first, ALPHA later; ECHO has no schedule and
        // sorts after both on the same channel.
        let first_sod = |a: StationAddress| match a {
            a if a == addr("CE123456") => Some(120),
            a if a == addr("CE123457") => Some(1800),
            _ => None,
        };
        sort_status_rows(&mut rows, first_sod);

        let order: Vec<&str> = rows
            .iter()
            .map(|r| r.name.as_deref().unwrap_or("-"))
            .collect();
        assert_eq!(order, vec!["BRAVO", "ALPHA", "ECHO", "ZULU"]);
    }
}
