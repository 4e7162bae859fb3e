//! Read-only reference data, refreshed independently of ingestion.
//!
//! Three tables load from flat files and hot-reload on mtime change:
//! the platform description table (expected transmission schedule and
//! modulation parameters per station), the channel map (which GOES
//! channels this monitor covers), and the receiver identification list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::errors::DcpMonError;
use crate::models::{StationAddress, Spacecraft, SEC_PER_DAY};

/// A station's expected transmission schedule and modulation parameters.
#[derive(Debug, Clone)]
pub struct PdtEntry {
    pub address: StationAddress,
    /// Assigned self-timed GOES channel.
    pub st_channel: u16,
    /// Second-of-day of the first scheduled transmission.
    pub first_xmit_sod: i32,
    /// Seconds between scheduled transmissions.
    pub xmit_interval: i32,
    /// Assigned window length in seconds.
    pub xmit_window: i32,
    pub baud: u16,
    pub long_preamble: bool,
    pub spacecraft: Spacecraft,
    pub description: Option<String>,
}

impl PdtEntry {
    /// Scheduled window start for whichever slot `time_ms` falls nearest.
    pub fn window_start_for(&self, time_ms: i64) -> Option<i32> {
        if self.xmit_interval <= 0 {
            return None;
        }
        let sod = ((time_ms / 1000).rem_euclid(SEC_PER_DAY)) as i32;
        let n = (sod - self.first_xmit_sod + self.xmit_interval / 2) / self.xmit_interval;
        Some(self.first_xmit_sod + n * self.xmit_interval)
    }
}

#[derive(Debug, Default)]
pub struct PdtMap {
    entries: HashMap<StationAddress, PdtEntry>,
}

impl PdtMap {
    pub fn get(&self, address: StationAddress) -> Option<&PdtEntry> {
        self.entries.get(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub number: u16,
    pub baud: u16,
    pub spacecraft: Spacecraft,
}

/// The GOES channels this monitor is responsible for.
#[derive(Debug, Default)]
pub struct ChannelMap {
    channels: HashMap<u16, ChannelInfo>,
}

impl ChannelMap {
    pub fn contains(&self, channel: u16) -> bool {
        self.channels.contains_key(&channel)
    }

    pub fn get(&self, channel: u16) -> Option<&ChannelInfo> {
        self.channels.get(&channel)
    }

    /// Channel numbers in ascending order.
    pub fn numbers(&self) -> Vec<u16> {
        let mut v: Vec<u16> = self.channels.keys().copied().collect();
        v.sort_unstable();
        v
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    pub code: String,
    pub name: String,
    pub location: Option<String>,
}

/// Uplink-carrier code to ground-receiver identification.
#[derive(Debug, Default)]
pub struct ReceiverList {
    receivers: Vec<ReceiverInfo>,
}

impl ReceiverList {
    pub fn name_of(&self, code: &str) -> Option<&str> {
        self.receivers
            .iter()
            .find(|r| r.code == code)
            .map(|r| r.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceiverInfo> {
        self.receivers.iter()
    }
}

/// A table loaded from a file, reloaded when the file's mtime moves.
struct WatchedFile<T> {
    path: PathBuf,
    mtime: RwLock<Option<SystemTime>>,
    data: RwLock<Arc<T>>,
    parse: fn(&Path) -> Result<T, DcpMonError>,
}

impl<T: Default> WatchedFile<T> {
    fn load(path: PathBuf, parse: fn(&Path) -> Result<T, DcpMonError>) -> Self {
        let (mtime, data) = match Self::read(&path, parse) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Could not load {}: {e}", path.display());
                (None, Arc::new(T::default()))
            }
        };
        Self {
            path,
            mtime: RwLock::new(mtime),
            data: RwLock::new(data),
            parse,
        }
    }

    fn read(
        path: &Path,
        parse: fn(&Path) -> Result<T, DcpMonError>,
    ) -> Result<(Option<SystemTime>, Arc<T>), DcpMonError> {
        let mtime = std::fs::metadata(path)?.modified()?;
        let data = parse(path)?;
        Ok((Some(mtime), Arc::new(data)))
    }

    fn snapshot(&self) -> Arc<T> {
        self.data.read().unwrap().clone()
    }

    fn check_for_change(&self) -> bool {
        let current = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if current.is_none() || current == *self.mtime.read().unwrap() {
            return false;
        }
        match Self::read(&self.path, self.parse) {
            Ok((mtime, data)) => {
                info!("Reloaded {}", self.path.display());
                *self.data.write().unwrap() = data;
                *self.mtime.write().unwrap() = mtime;
                true
            }
            Err(e) => {
                warn!(
                    "Reload of {} failed, keeping old data: {e}",
                    self.path.display()
                );
                false
            }
        }
    }
}

/// The reference tables as one injectable collaborator.
pub struct ReferenceData {
    pdt: Option<WatchedFile<PdtMap>>,
    channels: Option<WatchedFile<ChannelMap>>,
    receivers: Option<WatchedFile<ReceiverList>>,
}

impl ReferenceData {
    pub fn load(
        pdt_path: Option<PathBuf>,
        channel_map_path: Option<PathBuf>,
        receiver_list_path: Option<PathBuf>,
    ) -> Self {
        Self {
            pdt: pdt_path.map(|p| WatchedFile::load(p, parse_pdt)),
            channels: channel_map_path.map(|p| WatchedFile::load(p, parse_channel_map)),
            receivers: receiver_list_path.map(|p| WatchedFile::load(p, parse_receiver_list)),
        }
    }

    /// Empty tables, for tests and minimal deployments.
    pub fn empty() -> Self {
        Self {
            pdt: None,
            channels: None,
            receivers: None,
        }
    }

    pub fn check_for_change(&self) {
        if let Some(w) = &self.pdt {
            w.check_for_change();
        }
        if let Some(w) = &self.channels {
            w.check_for_change();
        }
        if let Some(w) = &self.receivers {
            w.check_for_change();
        }
    }

    pub fn pdt(&self) -> Arc<PdtMap> {
        self.pdt
            .as_ref()
            .map(|w| w.snapshot())
            .unwrap_or_default()
    }

    pub fn channel_map(&self) -> Arc<ChannelMap> {
        self.channels
            .as_ref()
            .map(|w| w.snapshot())
            .unwrap_or_default()
    }

    pub fn receiver_list(&self) -> Arc<ReceiverList> {
        self.receivers
            .as_ref()
            .map(|w| w.snapshot())
            .unwrap_or_default()
    }

    /// Whether this monitor covers `channel`. With no channel map
    /// configured every channel is covered.
    pub fn is_my_channel(&self, channel: u16) -> bool {
        match &self.channels {
            Some(w) => w.snapshot().contains(channel),
            None => true,
        }
    }
}

/// Platform description table file: one station per line,
/// `ADDRESS,channel,first_sod,interval,window,baud,preamble,spacecraft[,description]`
/// with `L`/`S` preamble and `E`/`W` spacecraft codes.
fn parse_pdt(path: &Path) -> Result<PdtMap, DcpMonError> {
    let text = std::fs::read_to_string(path)?;
    let mut map = PdtMap::default();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(9, ',').map(str::trim).collect();
        let entry = (|| -> Option<PdtEntry> {
            let address = StationAddress::try_from(*fields.first()?).ok()?;
            Some(PdtEntry {
                address,
                st_channel: fields.get(1)?.parse().ok()?,
                first_xmit_sod: fields.get(2)?.parse().ok()?,
                xmit_interval: fields.get(3)?.parse().ok()?,
                xmit_window: fields.get(4)?.parse().ok()?,
                baud: fields.get(5)?.parse().ok()?,
                long_preamble: matches!(*fields.get(6)?, "L" | "l"),
                spacecraft: match *fields.get(7)? {
                    "E" | "e" => Spacecraft::East,
                    "W" | "w" => Spacecraft::West,
                    _ => Spacecraft::Unknown,
                },
                description: fields.get(8).map(|s| s.to_string()),
            })
        })();
        match entry {
            Some(e) => {
                map.entries.insert(e.address, e);
            }
            None => warn!(
                "{}:{}: skipping malformed platform entry",
                path.display(),
                lineno + 1
            ),
        }
    }
    Ok(map)
}

/// Channel map file: `channel,baud,spacecraft` per line.
fn parse_channel_map(path: &Path) -> Result<ChannelMap, DcpMonError> {
    let text = std::fs::read_to_string(path)?;
    let mut map = ChannelMap::default();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
        let info = (|| -> Option<ChannelInfo> {
            Some(ChannelInfo {
                number: fields.first()?.parse().ok()?,
                baud: fields.get(1)?.parse().ok()?,
                spacecraft: match *fields.get(2)? {
                    "E" | "e" => Spacecraft::East,
                    "W" | "w" => Spacecraft::West,
                    _ => Spacecraft::Unknown,
                },
            })
        })();
        match info {
            Some(i) => {
                map.channels.insert(i.number, i);
            }
            None => warn!(
                "{}:{}: skipping malformed channel entry",
                path.display(),
                lineno + 1
            ),
        }
    }
    Ok(map)
}

/// Receiver list file: `code,name[,location]` per line.
fn parse_receiver_list(path: &Path) -> Result<ReceiverList, DcpMonError> {
    let text = std::fs::read_to_string(path)?;
    let mut list = ReceiverList::default();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
        match (fields.first(), fields.get(1)) {
            (Some(code), Some(name)) if !code.is_empty() && !name.is_empty() => {
                list.receivers.push(ReceiverInfo {
                    code: code.to_string(),
                    name: name.to_string(),
                    location: fields.get(2).map(|s| s.to_string()),
                });
            }
            _ => warn!(
                "{}:{}: skipping malformed receiver entry",
                path.display(),
                lineno + 1
            ),
        }
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, content: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn parse_pdt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdt.csv");
        write_file(
            &path,
            "# address,chan,first_sod,interval,window,baud,preamble,sc\n\
             CE123456,98,120,3600,60,300,S,E,North fork gauge\n\
             CE123457,99,0,14400,120,100,L,W\n\
             BADLINE\n",
        );

        let map = parse_pdt(&path).unwrap();
        assert_eq!(map.len(), 2);
        let e = map
            .get(StationAddress::try_from("CE123456").unwrap())
            .unwrap();
        assert_eq!(e.st_channel, 98);
        assert_eq!(e.first_xmit_sod, 120);
        assert_eq!(e.xmit_interval, 3600);
        assert_eq!(e.baud, 300);
        assert!(!e.long_preamble);
        assert_eq!(e.spacecraft, Spacecraft::East);
        assert_eq!(e.description.as_deref(), Some("North fork gauge"));
    }

    #[test]
    fn window_start_snaps_to_nearest_slot() {
        let e = PdtEntry {
            address: StationAddress::try_from("CE123456").unwrap(),
            st_channel: 98,
            first_xmit_sod: 120,
            xmit_interval: 3600,
            xmit_window: 60,
            baud: 300,
            long_preamble: false,
            spacecraft: Spacecraft::East,
            description: None,
        };
        // 10 seconds after the second slot opens.
        assert_eq!(e.window_start_for((120 + 3600 + 10) * 1000), Some(3720));
        // Just before a slot opens still snaps to that slot.
        assert_eq!(e.window_start_for((120 + 3600 - 5) * 1000), Some(3720));
        // Mid-gap snaps to the nearer neighbour.
        assert_eq!(e.window_start_for((120 + 1000) * 1000), Some(120));
    }

    #[test]
    fn channel_map_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.csv");
        write_file(&path, "98,300,E\n99,100,W\n");

        let refdata = ReferenceData::load(None, Some(path), None);
        assert!(refdata.is_my_channel(98));
        assert!(!refdata.is_my_channel(120));
        assert_eq!(refdata.channel_map().numbers(), vec![98, 99]);

        // No map configured means every channel is ours.
        assert!(ReferenceData::empty().is_my_channel(120));
    }

    #[test]
    fn receiver_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receivers.csv");
        write_file(&path, "E1,Wallops East,Wallops Island VA\nW1,Boise West\n");

        let list = parse_receiver_list(&path).unwrap();
        assert_eq!(list.name_of("E1"), Some("Wallops East"));
        assert_eq!(list.name_of("XX"), None);
        assert_eq!(list.iter().count(), 2);
    }
}
