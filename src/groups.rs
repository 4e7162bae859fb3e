//! Station group resolver.
//!
//! A group is a named set of station addresses used to scope reports and
//! to drive the exclusion policy. Groups load from flat network-list
//! files or from the store, and hot-reload when the source changes. The
//! address maps are only ever replaced wholesale; readers hold an `Arc`
//! snapshot and see either the old or the new map, never a partial one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::errors::DcpMonError;
use crate::models::StationAddress;
use crate::storage::GroupStore;

/// Where a group's membership comes from.
#[derive(Debug, Clone)]
pub enum GroupSource {
    /// Flat network-list file: one `ADDRESS[:name][ description]` entry
    /// per line, `#` starts a comment.
    File(PathBuf),
    /// Row in the store's group tables.
    Store(String),
}

/// Source version stamp recorded at load time for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceStamp {
    FileMtime(SystemTime),
    StoreModified(i64),
    /// Source was unreadable at load time; any readable state is a change.
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct MemberInfo {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Immutable membership snapshot of one group.
#[derive(Debug, Default)]
pub struct GroupData {
    pub name: String,
    members: HashMap<StationAddress, MemberInfo>,
    by_name: HashMap<String, StationAddress>,
}

impl GroupData {
    pub fn contains(&self, address: StationAddress) -> bool {
        self.members.contains_key(&address)
    }

    pub fn name_of(&self, address: StationAddress) -> Option<&str> {
        self.members.get(&address)?.name.as_deref()
    }

    pub fn description_of(&self, address: StationAddress) -> Option<&str> {
        self.members.get(&address)?.description.as_deref()
    }

    pub fn address_of(&self, name: &str) -> Option<StationAddress> {
        self.by_name.get(name).copied()
    }

    pub fn addresses(&self) -> impl Iterator<Item = StationAddress> + '_ {
        self.members.keys().copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (StationAddress, &MemberInfo)> {
        self.members.iter().map(|(a, m)| (*a, m))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn insert(&mut self, address: StationAddress, info: MemberInfo) {
        if let Some(n) = &info.name {
            self.by_name.insert(n.clone(), address);
        }
        self.members.insert(address, info);
    }
}

struct DcpGroup {
    name: String,
    source: GroupSource,
    stamp: RwLock<SourceStamp>,
    data: RwLock<Arc<GroupData>>,
}

impl DcpGroup {
    fn load(
        name: String,
        source: GroupSource,
        store: Option<&dyn GroupStore>,
    ) -> Self {
        let (stamp, data) = match Self::read_source(&name, &source, store) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Could not load group '{name}': {e}");
                (SourceStamp::Unavailable, Arc::new(GroupData::default()))
            }
        };
        Self {
            name,
            source,
            stamp: RwLock::new(stamp),
            data: RwLock::new(data),
        }
    }

    fn read_source(
        name: &str,
        source: &GroupSource,
        store: Option<&dyn GroupStore>,
    ) -> Result<(SourceStamp, Arc<GroupData>), DcpMonError> {
        match source {
            GroupSource::File(path) => {
                let mtime = std::fs::metadata(path)?.modified()?;
                let data = parse_network_list(name, path)?;
                Ok((SourceStamp::FileMtime(mtime), Arc::new(data)))
            }
            GroupSource::Store(group_name) => {
                let store = store.ok_or_else(|| DcpMonError::ConfigurationError {
                    message: format!("No store configured for group '{group_name}'"),
                })?;
                let modified = store
                    .group_modified(group_name)?
                    .ok_or_else(|| DcpMonError::NoSuchGroup(group_name.clone()))?;
                let mut data = GroupData {
                    name: name.to_string(),
                    ..Default::default()
                };
                for (address, station_name, description) in store.group_members(group_name)? {
                    data.insert(
                        address,
                        MemberInfo {
                            name: station_name,
                            description,
                        },
                    );
                }
                Ok((SourceStamp::StoreModified(modified), Arc::new(data)))
            }
        }
    }

    fn current_stamp(&self, store: Option<&dyn GroupStore>) -> SourceStamp {
        match &self.source {
            GroupSource::File(path) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(SourceStamp::FileMtime)
                .unwrap_or(SourceStamp::Unavailable),
            GroupSource::Store(group_name) => store
                .and_then(|s| s.group_modified(group_name).ok().flatten())
                .map(SourceStamp::StoreModified)
                .unwrap_or(SourceStamp::Unavailable),
        }
    }

    /// Reload if the source changed since last load. Returns whether a
    /// reload happened.
    fn check_for_change(&self, store: Option<&dyn GroupStore>) -> bool {
        let current = self.current_stamp(store);
        if current == SourceStamp::Unavailable || current == *self.stamp.read().unwrap() {
            return false;
        }
        match Self::read_source(&self.name, &self.source, store) {
            Ok((stamp, data)) => {
                info!("Group '{}' changed, reloaded {} members", self.name, data.len());
                *self.data.write().unwrap() = data;
                *self.stamp.write().unwrap() = stamp;
                true
            }
            Err(e) => {
                warn!("Reload of group '{}' failed, keeping old data: {e}", self.name);
                false
            }
        }
    }

    fn snapshot(&self) -> Arc<GroupData> {
        self.data.read().unwrap().clone()
    }
}

/// Parse a network-list file. Malformed addresses are skipped with a
/// warning, never fatal to the load.
fn parse_network_list(name: &str, path: &Path) -> Result<GroupData, DcpMonError> {
    let text = std::fs::read_to_string(path)?;
    let mut data = GroupData {
        name: name.to_string(),
        ..Default::default()
    };
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (head, description) = match line.split_once(char::is_whitespace) {
            Some((h, d)) => (h, Some(d.trim().to_string())),
            None => (line, None),
        };
        let (addr_str, station_name) = match head.split_once(':') {
            Some((a, n)) => (a, Some(n.to_string())),
            None => (head, None),
        };
        match StationAddress::try_from(addr_str) {
            Ok(address) => data.insert(
                address,
                MemberInfo {
                    name: station_name,
                    description,
                },
            ),
            Err(_) => warn!(
                "{}:{}: skipping entry with bad address '{addr_str}'",
                path.display(),
                lineno + 1
            ),
        }
    }
    Ok(data)
}

/// All configured groups.
pub struct DcpGroupList {
    groups: Vec<DcpGroup>,
    store: Option<Arc<dyn GroupStore>>,
}

impl DcpGroupList {
    pub fn new(
        files: &[PathBuf],
        store_groups: &[String],
        store: Option<Arc<dyn GroupStore>>,
    ) -> Self {
        let mut groups = Vec::new();
        for path in files {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            groups.push(DcpGroup::load(
                name,
                GroupSource::File(path.clone()),
                store.as_deref(),
            ));
        }
        for name in store_groups {
            groups.push(DcpGroup::load(
                name.clone(),
                GroupSource::Store(name.clone()),
                store.as_deref(),
            ));
        }
        info!("Loaded {} station groups", groups.len());
        Self { groups, store }
    }

    /// Re-check every group source; returns whether any group reloaded.
    pub fn check_for_change(&self) -> bool {
        let mut any = false;
        for g in &self.groups {
            any |= g.check_for_change(self.store.as_deref());
        }
        any
    }

    pub fn group(&self, name: &str) -> Option<Arc<GroupData>> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.snapshot())
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    /// Membership in any configured group.
    pub fn is_in_any(&self, address: StationAddress) -> bool {
        self.groups.iter().any(|g| g.snapshot().contains(address))
    }

    /// Snapshots of every group whose name starts with `prefix`.
    pub fn groups_with_prefix(&self, prefix: &str) -> Vec<Arc<GroupData>> {
        self.groups
            .iter()
            .filter(|g| !prefix.is_empty() && g.name.starts_with(prefix))
            .map(|g| g.snapshot())
            .collect()
    }

    /// Resolve a display name to an address across all groups.
    pub fn address_of(&self, name: &str) -> Option<StationAddress> {
        self.groups
            .iter()
            .find_map(|g| g.snapshot().address_of(name))
    }

    /// Best display name for an address, first group wins.
    pub fn name_of(&self, address: StationAddress) -> Option<String> {
        self.groups
            .iter()
            .find_map(|g| g.snapshot().name_of(address).map(str::to_string))
    }
}
