//! Line-oriented report protocol server.
//!
//! One task per accepted client. A request is a single line, the
//! response is zero or more lines closed by an `END` sentinel; failures
//! come back as a single `-Error: ...` line, also followed by the
//! sentinel, and never tear down the connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::errors::DcpMonError;
use crate::models::{FailureCodes, XmitRecord, MSEC_PER_DAY};
use crate::pipeline::Pipeline;
use crate::queue::WriteQueue;
use crate::report::{
    battery_status, code_status, freq_offset_status, msg_time_status, signal_status,
    MsgStatusRow, ReportEngine,
};

const SENTINEL: &str = "END";

pub struct ReportServer {
    engine: Arc<ReportEngine>,
    pipeline: Arc<Pipeline>,
    queue: Arc<WriteQueue>,
    started: Instant,
}

impl ReportServer {
    pub fn new(engine: Arc<ReportEngine>, pipeline: Arc<Pipeline>, queue: Arc<WriteQueue>) -> Self {
        Self {
            engine,
            pipeline,
            queue,
            started: Instant::now(),
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "Report client connected");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_client(stream).await {
                            debug!(%peer, "Report client dropped: {e}");
                        }
                    });
                }
                Err(e) => error!("Accept failed: {e}"),
            }
        }
    }

    async fn serve_client(&self, stream: TcpStream) -> Result<(), std::io::Error> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut response = match self.dispatch(line) {
                Ok(lines) => lines,
                Err(e) => vec![format!("-Error: {e}")],
            };
            response.push(SENTINEL.to_string());
            let mut out = response.join("\n");
            out.push('\n');
            write_half.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }

    fn dispatch(&self, line: &str) -> Result<Vec<String>, DcpMonError> {
        let mut words = line.split_whitespace();
        let cmd = words.next().unwrap_or("");
        let args: Vec<&str> = words.collect();
        match (cmd, args.as_slice()) {
            ("lg", []) => Ok(self.engine.groups().group_names()),
            ("ld", [group]) => self.list_stations(group),
            ("lc", []) => Ok(self
                .engine
                .refdata()
                .channel_map()
                .numbers()
                .iter()
                .map(|n| n.to_string())
                .collect()),
            ("ms", [scope, ndays]) => {
                let ndays = parse_ndays(ndays)?;
                let rows = self.engine.status_report(scope, ndays)?;
                Ok(rows.iter().map(format_status_row).collect())
            }
            ("pr", [station, ndays]) => self.performance(station, ndays, None),
            ("pr", [station, ndays, date]) => {
                let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                    DcpMonError::BadRequest(format!("Bad date '{date}', expected YYYY-MM-DD"))
                })?;
                self.performance(station, ndays, Some(date))
            }
            ("dm", [station, timestamp]) => self.dump_message(station, timestamp),
            ("md", [station]) => self.station_metadata(station),
            ("st", []) => Ok(self.health_snapshot()),
            ("cm", []) => Ok(self.dump_channel_map()),
            ("rl", []) => Ok(self.dump_receiver_list()),
            _ => Err(DcpMonError::BadRequest(format!(
                "Unrecognized request '{line}'"
            ))),
        }
    }

    fn list_stations(&self, group: &str) -> Result<Vec<String>, DcpMonError> {
        let group = self
            .engine
            .groups()
            .group(group)
            .ok_or_else(|| DcpMonError::NoSuchGroup(group.to_string()))?;
        let mut lines: Vec<String> = group
            .members()
            .map(|(address, info)| {
                format!(
                    "{address} {} {}",
                    info.name.as_deref().unwrap_or("-"),
                    info.description.as_deref().unwrap_or("")
                )
                .trim_end()
                .to_string()
            })
            .collect();
        lines.sort();
        Ok(lines)
    }

    fn performance(
        &self,
        station: &str,
        ndays: &str,
        date: Option<NaiveDate>,
    ) -> Result<Vec<String>, DcpMonError> {
        let ndays = parse_ndays(ndays)?;
        let records = self.engine.performance_report(station, ndays, date)?;
        Ok(records
            .iter()
            .map(|r| format_performance_line(r, &self.engine.thresholds))
            .collect())
    }

    fn dump_message(&self, station: &str, timestamp: &str) -> Result<Vec<String>, DcpMonError> {
        let time_ms = parse_timestamp(timestamp)?;
        let rec = self
            .engine
            .find_message(station, time_ms)?
            .ok_or_else(|| {
                DcpMonError::BadRequest(format!("No message for {station} near {timestamp}"))
            })?;
        let mut lines = vec![format!(
            "{} {} channel={} length={}",
            rec.address,
            format_time(rec.goes_time_ms()),
            rec.channel,
            rec.msg_length
        )];
        if rec.raw.is_empty() {
            lines.push("(no raw data stored)".to_string());
        } else {
            lines.extend(
                String::from_utf8_lossy(&rec.raw)
                    .lines()
                    .map(str::to_string),
            );
        }
        Ok(lines)
    }

    fn station_metadata(&self, station: &str) -> Result<Vec<String>, DcpMonError> {
        let address = self.engine.resolve_station(station)?;
        let pdt = self.engine.refdata().pdt();
        let entry = pdt
            .get(address)
            .ok_or_else(|| DcpMonError::InvalidAddress(format!("{address} not in platform table")))?;
        let mut lines = vec![
            format!("address={address}"),
            format!("channel={}", entry.st_channel),
            format!("first_xmit_sod={}", entry.first_xmit_sod),
            format!("xmit_interval={}", entry.xmit_interval),
            format!("xmit_window={}", entry.xmit_window),
            format!("baud={}", entry.baud),
            format!(
                "preamble={}",
                if entry.long_preamble { "long" } else { "short" }
            ),
            format!("spacecraft={:?}", entry.spacecraft),
        ];
        if let Some(name) = self.engine.groups().name_of(address) {
            lines.insert(1, format!("name={name}"));
        }
        if let Some(desc) = &entry.description {
            lines.push(format!("description={desc}"));
        }
        Ok(lines)
    }

    fn health_snapshot(&self) -> Vec<String> {
        let p = &self.pipeline.stats;
        let q = &self.queue.stats;
        vec![
            format!("uptime_sec={}", self.started.elapsed().as_secs()),
            format!("received={}", p.received.load(Ordering::Relaxed)),
            format!("accepted={}", p.accepted.load(Ordering::Relaxed)),
            format!("discarded={}", p.discarded.load(Ordering::Relaxed)),
            format!("queue_len={}", self.queue.len()),
            format!("queue_capacity={}", self.queue.capacity()),
            format!("queue_enqueued={}", q.enqueued.load(Ordering::Relaxed)),
            format!("queue_coalesced={}", q.coalesced.load(Ordering::Relaxed)),
            format!("queue_written={}", q.written.load(Ordering::Relaxed)),
            format!("queue_dropped={}", q.dropped.load(Ordering::Relaxed)),
        ]
    }

    fn dump_channel_map(&self) -> Vec<String> {
        let map = self.engine.refdata().channel_map();
        map.numbers()
            .iter()
            .filter_map(|n| map.get(*n))
            .map(|c| format!("{} baud={} spacecraft={:?}", c.number, c.baud, c.spacecraft))
            .collect()
    }

    fn dump_receiver_list(&self) -> Vec<String> {
        self.engine
            .refdata()
            .receiver_list()
            .iter()
            .map(|r| {
                format!(
                    "{} {} {}",
                    r.code,
                    r.name,
                    r.location.as_deref().unwrap_or("")
                )
                .trim_end()
                .to_string()
            })
            .collect()
    }
}

fn parse_ndays(arg: &str) -> Result<u32, DcpMonError> {
    arg.parse()
        .map_err(|_| DcpMonError::BadRequest(format!("Bad day count '{arg}'")))
}

/// Accepts RFC 3339 or epoch seconds.
fn parse_timestamp(arg: &str) -> Result<i64, DcpMonError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(arg) {
        return Ok(t.timestamp_millis());
    }
    if let Some(ms) = arg.parse::<i64>().ok().and_then(|s| s.checked_mul(1000)) {
        return Ok(ms);
    }
    Err(DcpMonError::BadRequest(format!(
        "Bad timestamp '{arg}', expected RFC 3339 or epoch seconds"
    )))
}

fn format_time(time_ms: i64) -> String {
    Utc.timestamp_millis_opt(time_ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| time_ms.to_string())
}

fn format_day(day: i32) -> String {
    format_time(day as i64 * MSEC_PER_DAY)
        .split(' ')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Hour bucket: `-` for no traffic, and a clean `G` shown as `_` so real
/// anomalies stand out in the grid.
fn format_hour_bucket(codes: &FailureCodes) -> String {
    if codes.is_empty() {
        return "-".to_string();
    }
    codes
        .as_string()
        .chars()
        .map(|c| if c == 'G' { '_' } else { c })
        .collect()
}

fn format_status_row(row: &MsgStatusRow) -> String {
    let buckets: Vec<String> = row.hours.iter().map(format_hour_bucket).collect();
    format!(
        "{} {} {} {} {}",
        row.address,
        row.name.as_deref().unwrap_or("-"),
        row.channel,
        format_day(row.day),
        buckets.join(" ")
    )
}

fn format_performance_line(rec: &XmitRecord, thresholds: &crate::config::ThresholdConfig) -> String {
    let codes = format!(
        "{}{}",
        code_status(&rec.failure_codes, thresholds).prefix(),
        rec.failure_codes
    );
    if rec.failure_codes.has('M') {
        return format!(
            "{} {} ch={} codes={codes}",
            format_time(rec.goes_time_ms()),
            rec.address,
            rec.channel
        );
    }
    format!(
        "{} {} ch={} codes={codes} time={}{} sig={}{} offs={}{} batt={}{:.1}",
        format_time(rec.goes_time_ms()),
        rec.address,
        rec.channel,
        msg_time_status(rec, thresholds).prefix(),
        rec.sec_of_day,
        signal_status(rec, thresholds).prefix(),
        rec.signal_strength,
        freq_offset_status(rec, thresholds).prefix(),
        rec.freq_offset,
        battery_status(rec, thresholds).prefix(),
        rec.battery
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdConfig;
    use crate::models::StationAddress;

    fn addr(s: &str) -> StationAddress {
        StationAddress::try_from(s).unwrap()
    }

    #[test]
    fn hour_bucket_rendering() {
        let mut codes = FailureCodes::new();
        assert_eq!(format_hour_bucket(&codes), "-");
        codes.add('G');
        assert_eq!(format_hour_bucket(&codes), "_");
        codes.add('?');
        assert_eq!(format_hour_bucket(&codes), "_?");
    }

    #[test]
    fn performance_line_flags_alarms() {
        let mut rec = XmitRecord::new(addr("CE123456"), 19_000, 3612);
        rec.channel = 98;
        rec.failure_codes.add('G');
        rec.signal_strength = 44;
        rec.battery = 8.9;
        rec.window_start_sec = 3600;
        rec.window_length_sec = 60;

        let line = format_performance_line(&rec, &ThresholdConfig::default());
        assert!(line.contains("codes=G"), "{line}");
        assert!(line.contains("batt=R:8.9"), "{line}");
        assert!(line.contains("sig=44"), "{line}");
    }

    #[test]
    fn missing_line_is_abbreviated() {
        let mut rec = XmitRecord::new(addr("CE123456"), 19_000, 3600);
        rec.channel = 98;
        rec.failure_codes.add('M');
        let line = format_performance_line(&rec, &ThresholdConfig::default());
        assert!(line.contains("codes=R:M"), "{line}");
        assert!(!line.contains("batt="), "{line}");
    }

    #[test]
    fn timestamp_parsing() {
        assert_eq!(parse_timestamp("100").unwrap(), 100_000);
        let ms = parse_timestamp("2024-06-01T12:00:00Z").unwrap();
        assert_eq!(ms, 1_717_243_200_000);
        assert!(parse_timestamp("noon").is_err());
        // An epoch value too large for millisecond precision is a bad
        // request, not a panic.
        assert!(parse_timestamp(&i64::MAX.to_string()).is_err());
    }
}
