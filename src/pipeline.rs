//! Validation and enrichment pipeline.
//!
//! Consumes one decoded-message event at a time, builds a canonical
//! transmission record and hands it to the write-behind queue. A second
//! signal for the same transmission (the relay often delivers one per
//! ground receiver) coalesces into the queued or already-stored record
//! instead of producing a duplicate row.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::groups::{DcpGroupList, GroupData};
use crate::models::{
    day_number, second_of_day, BaudClass, DecodedMessage, Spacecraft, StationAddress, XmitRecord,
};
use crate::pdt::ReferenceData;
use crate::queue::WriteQueue;
use crate::scrub::RetentionScrubber;
use crate::storage::XmitStore;

/// Demo/test transmitter addresses, never recorded.
const TEST_ADDRESSES: [u32; 5] = [0xBBBB_BBBB, 0xDADA_DADA, 0x1111_1111, 0x2222_2222, 0x3333_3333];

const ENQUEUE_RETRIES: u32 = 10;
const ENQUEUE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Exclusion groups and reference files are re-checked at most this often.
const RELOAD_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// An explicit carrier start further than this from the message time is
/// a receiver clock artifact and is ignored.
const MAX_CARRIER_SKEW_MS: i64 = 3_600_000;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub discarded: AtomicU64,
}

struct ExcludeCache {
    /// None forces a scan on the next message.
    checked: Option<Instant>,
    groups: Vec<Arc<GroupData>>,
}

pub struct Pipeline {
    queue: Arc<WriteQueue>,
    store: Arc<dyn XmitStore>,
    groups: Arc<DcpGroupList>,
    refdata: Arc<ReferenceData>,
    scrubber: Arc<RetentionScrubber>,
    config: PipelineConfig,
    exclude: Mutex<ExcludeCache>,
    pub stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        queue: Arc<WriteQueue>,
        store: Arc<dyn XmitStore>,
        groups: Arc<DcpGroupList>,
        refdata: Arc<ReferenceData>,
        scrubber: Arc<RetentionScrubber>,
        config: PipelineConfig,
    ) -> Self {
        let exclude = Mutex::new(ExcludeCache {
            checked: None,
            groups: Vec::new(),
        });
        Self {
            queue,
            store,
            groups,
            refdata,
            scrubber,
            config,
            exclude,
            stats: PipelineStats::default(),
        }
    }

    /// Process one decoded message. Disqualified messages are discarded
    /// without error; only infrastructure trouble is logged loudly.
    pub async fn accept(&self, mut msg: DecodedMessage) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.scrubber.maybe_scrub();

        let Some(record) = self.validate(&mut msg) else {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if self.coalesce_or_enqueue(record).await {
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Apply all disqualifying gates, then build the enriched record.
    fn validate(&self, msg: &mut DecodedMessage) -> Option<XmitRecord> {
        let address = match StationAddress::try_from(msg.address.as_str()) {
            Ok(a) => a,
            Err(_) => {
                debug!("Discarding message with unparseable address '{}'", msg.address);
                return None;
            }
        };
        if TEST_ADDRESSES.contains(&address.value()) {
            return None;
        }

        // Only clean and parity-error messages carry usable telemetry. A
        // message with no failure code at all is an input error.
        let failure_code = match msg.pm.failure_code {
            Some(c @ ('G' | '?')) => c,
            Some(c) => {
                debug!(%address, failure_code = %c, "Discarding message by failure code");
                return None;
            }
            None => {
                warn!(%address, "Discarding message without a failure code");
                return None;
            }
        };

        if !self.refdata.is_my_channel(msg.channel) {
            debug!(%address, channel = msg.channel, "Discarding message on unmonitored channel");
            return None;
        }

        if self.is_excluded(address) {
            warn!(%address, "Dropping all decoded output from excluded station");
            return None;
        }

        let now = Utc::now();
        let age = now - msg.timestamp;
        if age > chrono::Duration::hours(self.config.max_age_hours)
            || age < -chrono::Duration::minutes(self.config.max_future_minutes)
        {
            warn!(%address, time = %msg.timestamp, "Discarding message outside the time range");
            return None;
        }
        if self
            .scrubber
            .check_day(day_number(msg.timestamp))
            .is_err()
        {
            warn!(%address, time = %msg.timestamp, "Discarding message outside the retention range");
            return None;
        }

        self.flag_out_of_range_samples(msg);
        Some(self.build_record(address, failure_code, msg))
    }

    /// The time-range policy also applies to individual sensor samples:
    /// a sample dated outside the accepted range is flagged error and
    /// missing so no downstream consumer uses its value.
    fn flag_out_of_range_samples(&self, msg: &mut DecodedMessage) {
        let now = Utc::now();
        let earliest = now - chrono::Duration::hours(self.config.max_age_hours);
        let latest = now + chrono::Duration::minutes(self.config.max_future_minutes);
        for series in &mut msg.sensors {
            for sample in &mut series.samples {
                if sample.time < earliest || sample.time > latest {
                    debug!(
                        sensor = %series.name,
                        time = %sample.time,
                        "Flagging sensor sample outside the time range"
                    );
                    sample.error = true;
                    sample.missing = true;
                }
            }
        }
    }

    fn build_record(
        &self,
        address: StationAddress,
        failure_code: char,
        msg: &DecodedMessage,
    ) -> XmitRecord {
        let mut rec = XmitRecord::new(
            address,
            day_number(msg.timestamp),
            second_of_day(msg.timestamp),
        );
        rec.channel = msg.channel;
        rec.failure_codes.add(failure_code);
        rec.set_raw(&msg.raw);

        let pm = &msg.pm;
        rec.signal_strength = pm.signal_strength.unwrap_or(0);
        rec.freq_offset = pm.freq_offset.unwrap_or(0);
        rec.mod_index = pm.mod_index.unwrap_or('?');
        rec.msg_length = pm.message_length.unwrap_or(msg.raw.len() as u32);
        rec.uplink_carrier = pm.uplink_carrier.clone().unwrap_or_default();
        rec.battery = extract_battery(msg);

        let pdt = self.refdata.pdt();
        let entry = pdt.get(address);
        if let Some(e) = entry {
            rec.first_xmit_sod = e.first_xmit_sod;
            rec.xmit_interval_sec = e.xmit_interval;
            rec.window_length_sec = e.xmit_window;
            if let Some(start) = e.window_start_for(rec.goes_time_ms()) {
                rec.window_start_sec = start;
            }
            rec.flags.long_preamble = e.long_preamble;
            // A transmission off its assigned self-timed channel is a
            // random report.
            rec.flags.random = msg.channel != e.st_channel;
        }

        // Explicit source baud wins, then the platform table, then 300.
        let baud = pm
            .baud
            .or_else(|| entry.map(|e| e.baud as u32))
            .unwrap_or(300);
        rec.flags.baud = BaudClass::from_baud(baud);

        rec.flags.spacecraft = match pm.spacecraft {
            Some('E') | Some('e') => Spacecraft::East,
            Some('W') | Some('w') => Spacecraft::West,
            _ => entry.map(|e| e.spacecraft).unwrap_or_default(),
        };
        rec.flags.not_my_group = !self.groups.is_in_any(address);

        resolve_carrier_times(&mut rec, pm.carrier_start, pm.carrier_stop, pm.carrier_time_estimated);

        for code in self.config.omit_failure_codes.chars() {
            rec.failure_codes.remove(code);
        }
        rec
    }

    /// Fold into an already-queued or already-stored record for the same
    /// transmission, else enqueue a new one. Returns false only when the
    /// record had to be dropped.
    async fn coalesce_or_enqueue(&self, record: XmitRecord) -> bool {
        let time_ms = record.goes_time_ms();
        let merged = self.queue.find_update(record.address, time_ms, |existing| {
            merge_into(existing, &record);
        });
        if merged {
            return true;
        }

        let mut outgoing = record;
        match self.store.find(outgoing.address, outgoing.day, time_ms) {
            Ok(Some(mut stored)) => {
                merge_into(&mut stored, &outgoing);
                outgoing = stored;
            }
            Ok(None) => {}
            Err(e) => error!("Transmission lookup failed: {e}"),
        }

        for attempt in 0..ENQUEUE_RETRIES {
            match self.queue.enqueue(outgoing) {
                Ok(()) => return true,
                Err(rejected) => {
                    outgoing = rejected;
                    if attempt == 0 {
                        warn!(
                            address = %outgoing.address,
                            "Write queue full, waiting for the drain worker"
                        );
                    }
                    tokio::time::sleep(ENQUEUE_RETRY_DELAY).await;
                }
            }
        }
        error!(address = %outgoing.address, "Write queue stayed full, dropping record");
        false
    }

    /// Exclusion-group membership, re-scanned at most once per interval.
    /// The scan also drives hot reload of groups and reference files.
    fn is_excluded(&self, address: StationAddress) -> bool {
        let mut cache = self.exclude.lock().unwrap();
        let due = cache
            .checked
            .map_or(true, |t| t.elapsed() >= RELOAD_CHECK_INTERVAL);
        if due {
            self.groups.check_for_change();
            self.refdata.check_for_change();
            cache.groups = self
                .groups
                .groups_with_prefix(&self.config.exclude_group_prefix);
            cache.checked = Some(Instant::now());
        }
        cache.groups.iter().any(|g| g.contains(address))
    }
}

/// Fold a fresh signal into an existing record for the same transmission.
fn merge_into(existing: &mut XmitRecord, incoming: &XmitRecord) {
    let was_synthesized = existing.failure_codes.has('M');
    if was_synthesized {
        // The transmission showed up after all; the placeholder gives way
        // to the measured record.
        let codes = existing.failure_codes.clone();
        *existing = incoming.clone();
        existing.failure_codes.union(&codes);
        existing.failure_codes.remove('M');
        return;
    }
    existing.failure_codes.union(&incoming.failure_codes);
    if existing.raw.is_empty() {
        existing.raw = incoming.raw.clone();
        existing.msg_length = incoming.msg_length;
    }
    if existing.battery == 0.0 {
        existing.battery = incoming.battery;
    }
}

fn overhead_sec(baud: BaudClass, long_preamble: bool) -> f64 {
    match (baud, long_preamble) {
        (BaudClass::B100, true) => 7.760,
        (BaudClass::B100, false) => 1.44,
        (BaudClass::B1200, _) => 0.298,
        _ => 0.693,
    }
}

/// Resolve carrier start/stop. An explicit stop is trusted only when it
/// lands within an hour after the start; otherwise the stop is estimated
/// from message length, baud and preamble overhead.
fn resolve_carrier_times(
    rec: &mut XmitRecord,
    start: Option<i64>,
    stop: Option<i64>,
    estimated: bool,
) {
    let msg_time = rec.goes_time_ms();
    rec.carrier_start = match start {
        Some(s) if (s - msg_time).abs() <= MAX_CARRIER_SKEW_MS => s,
        _ => msg_time,
    };

    match stop {
        Some(s) if s > rec.carrier_start && s - rec.carrier_start < MAX_CARRIER_SKEW_MS => {
            rec.carrier_stop = s;
            rec.flags.carrier_time_msec = !estimated;
        }
        _ => {
            let bits = rec.msg_length as f64 * 8.0;
            let dursec = bits / rec.flags.baud.bits_per_sec() as f64
                + overhead_sec(rec.flags.baud, rec.flags.long_preamble);
            rec.carrier_stop = rec.carrier_start + (dursec + 0.5) as i64 * 1000;
            rec.flags.carrier_time_msec = false;
        }
    }
}

/// Battery voltage from the decoded sensor data: a sensor named `batt*`
/// wins, else data type `VB`; the most recent good sample is used and
/// 0.0 means no battery telemetry.
fn extract_battery(msg: &DecodedMessage) -> f32 {
    let series = msg
        .sensors
        .iter()
        .find(|s| s.name.to_ascii_lowercase().starts_with("batt"))
        .or_else(|| msg.sensors.iter().find(|s| s.data_type == "VB"));
    let Some(series) = series else {
        return 0.0;
    };
    series
        .samples
        .iter()
        .filter(|s| !s.error && !s.missing)
        .max_by_key(|s| s.time)
        .and_then(|s| s.value.trim().parse().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PerfMeasurements, Sample, SensorSeries};
    use crate::storage::Db;
    use chrono::TimeZone;

    fn addr(s: &str) -> StationAddress {
        StationAddress::try_from(s).unwrap()
    }

    fn test_pipeline() -> (Pipeline, Arc<WriteQueue>, Arc<Db>) {
        let queue = Arc::new(WriteQueue::new(100, Duration::from_secs(5)));
        let store = Arc::new(Db::open_in_memory().unwrap());
        let groups = Arc::new(DcpGroupList::new(&[], &[], None));
        let refdata = Arc::new(ReferenceData::empty());
        let scrubber = Arc::new(RetentionScrubber::new(store.clone(), 30));
        let pipeline = Pipeline::new(
            queue.clone(),
            store.clone(),
            groups,
            refdata,
            scrubber,
            PipelineConfig::default(),
        );
        (pipeline, queue, store)
    }

    fn message(address: &str) -> DecodedMessage {
        DecodedMessage {
            address: address.to_string(),
            channel: 98,
            timestamp: Utc::now(),
            raw: b"CE12345626123190601G44+0NN098EXE00012 data".to_vec(),
            pm: PerfMeasurements {
                failure_code: Some('G'),
                signal_strength: Some(44),
                message_length: Some(42),
                ..Default::default()
            },
            sensors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn accepts_good_message() {
        let (pipeline, queue, _) = test_pipeline();
        pipeline.accept(message("CE123456")).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(pipeline.stats.accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn discards_test_addresses_and_bad_codes() {
        let (pipeline, queue, _) = test_pipeline();
        pipeline.accept(message("BBBBBBBB")).await;

        let mut bad_code = message("CE123456");
        bad_code.pm.failure_code = Some('D');
        pipeline.accept(bad_code).await;

        let mut not_hex = message("CE123456");
        not_hex.address = "NOTANADDR".to_string();
        pipeline.accept(not_hex).await;

        assert!(queue.is_empty());
        assert_eq!(pipeline.stats.discarded.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn discards_message_without_failure_code() {
        let (pipeline, queue, _) = test_pipeline();
        let mut msg = message("CE123456");
        msg.pm.failure_code = None;
        pipeline.accept(msg).await;

        assert!(queue.is_empty());
        assert_eq!(pipeline.stats.discarded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn out_of_range_samples_never_feed_battery() {
        let (pipeline, queue, _) = test_pipeline();
        let now = Utc::now();
        let mut msg = message("CE123456");
        msg.sensors = vec![SensorSeries {
            name: "battery".to_string(),
            data_type: "VB".to_string(),
            samples: vec![
                Sample {
                    time: now,
                    value: "12.4".to_string(),
                    error: false,
                    missing: false,
                },
                // A bogus sample dated a year ahead must not win as the
                // most recent one.
                Sample {
                    time: now + chrono::Duration::days(365),
                    value: "3.1".to_string(),
                    error: false,
                    missing: false,
                },
            ],
        }];
        pipeline.accept(msg).await;

        let found = queue.find_update(addr("CE123456"), now.timestamp() * 1000, |r| {
            assert_eq!(r.battery, 12.4);
        });
        assert!(found);
    }

    #[tokio::test]
    async fn excluded_station_is_dropped_from_the_first_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EXCLUDE-test.nl");
        std::fs::write(&path, "CE123456\n").unwrap();

        let queue = Arc::new(WriteQueue::new(100, Duration::from_secs(5)));
        let store = Arc::new(Db::open_in_memory().unwrap());
        let groups = Arc::new(DcpGroupList::new(&[path], &[], None));
        let scrubber = Arc::new(RetentionScrubber::new(store.clone(), 30));
        let pipeline = Pipeline::new(
            queue.clone(),
            store,
            groups,
            Arc::new(ReferenceData::empty()),
            scrubber,
            PipelineConfig::default(),
        );

        pipeline.accept(message("CE123456")).await;
        assert!(queue.is_empty());
        assert_eq!(pipeline.stats.discarded.load(Ordering::Relaxed), 1);

        // A station outside the exclusion group still gets through.
        pipeline.accept(message("CE123457")).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn discards_messages_outside_time_range() {
        let (pipeline, queue, _) = test_pipeline();
        let mut old = message("CE123456");
        old.timestamp = Utc::now() - chrono::Duration::hours(72);
        pipeline.accept(old).await;

        let mut future = message("CE123456");
        future.timestamp = Utc::now() + chrono::Duration::hours(1);
        pipeline.accept(future).await;

        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn second_signal_coalesces_into_queued_record() {
        let (pipeline, queue, _) = test_pipeline();
        let first = message("CE123456");
        let mut second = first.clone();
        second.pm.failure_code = Some('?');
        // 90 seconds apart, same transmission as far as the monitor cares.
        second.timestamp = first.timestamp + chrono::Duration::seconds(90);

        pipeline.accept(first).await;
        pipeline.accept(second).await;

        assert_eq!(queue.len(), 1);
        let rec = queue.dequeue();
        assert!(rec.is_none(), "record should still be settling");
        let found = queue.find_update(addr("CE123456"), Utc::now().timestamp() * 1000, |r| {
            assert_eq!(r.failure_codes.as_string(), "G?");
        });
        assert!(found);
    }

    #[tokio::test]
    async fn carrier_stop_synthesized_from_length_and_baud() {
        let (pipeline, queue, _) = test_pipeline();
        let mut msg = message("CE123456");
        msg.pm.message_length = Some(75);
        msg.pm.carrier_start = None;
        msg.pm.carrier_stop = None;
        pipeline.accept(msg).await;

        let mut stop = 0;
        let mut start = 0;
        queue.find_update(addr("CE123456"), Utc::now().timestamp() * 1000, |r| {
            start = r.carrier_start;
            stop = r.carrier_stop;
            assert!(!r.flags.carrier_time_msec);
        });
        // 75 bytes at 300 baud: 600/300 + 0.693 = 2.693 s, rounds to 3 s.
        assert_eq!(stop - start, 3000);
    }

    #[tokio::test]
    async fn explicit_carrier_stop_sets_msec_flag() {
        let (pipeline, queue, _) = test_pipeline();
        let mut msg = message("CE123456");
        let t = msg.timestamp.timestamp() * 1000;
        msg.pm.carrier_start = Some(t - 1500);
        msg.pm.carrier_stop = Some(t + 800);
        msg.pm.carrier_time_estimated = false;
        pipeline.accept(msg).await;

        queue.find_update(addr("CE123456"), t, |r| {
            assert_eq!(r.carrier_start, t - 1500);
            assert_eq!(r.carrier_stop, t + 800);
            assert!(r.flags.carrier_time_msec);
        });
    }

    #[test]
    fn battery_prefers_named_sensor_and_latest_sample() {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut msg = message("CE123456");
        msg.sensors = vec![
            SensorSeries {
                name: "stage".to_string(),
                data_type: "HG".to_string(),
                samples: vec![Sample {
                    time: t0,
                    value: "3.2".to_string(),
                    error: false,
                    missing: false,
                }],
            },
            SensorSeries {
                name: "battery".to_string(),
                data_type: "VB".to_string(),
                samples: vec![
                    Sample {
                        time: t0,
                        value: "12.1".to_string(),
                        error: false,
                        missing: false,
                    },
                    Sample {
                        time: t0 + chrono::Duration::hours(1),
                        value: "12.4".to_string(),
                        error: false,
                        missing: false,
                    },
                    Sample {
                        time: t0 + chrono::Duration::hours(2),
                        value: "99.9".to_string(),
                        error: true,
                        missing: false,
                    },
                ],
            },
        ];
        assert_eq!(extract_battery(&msg), 12.4);

        msg.sensors.remove(1);
        assert_eq!(extract_battery(&msg), 0.0);
    }

    #[tokio::test]
    async fn merge_clears_missing_placeholder() {
        let mut placeholder = XmitRecord::new(addr("CE123456"), 19_000, 3600);
        placeholder.failure_codes.add('M');
        let mut real = XmitRecord::new(addr("CE123456"), 19_000, 3610);
        real.failure_codes.add('G');
        real.signal_strength = 44;

        merge_into(&mut placeholder, &real);
        assert!(!placeholder.failure_codes.has('M'));
        assert!(placeholder.failure_codes.has('G'));
        assert_eq!(placeholder.signal_strength, 44);
    }
}
