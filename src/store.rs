//! Per-room configuration and access control, persisted as a TOML file next
//! to the main config. Readers grab a lock-free snapshot; writers serialize
//! behind a mutex, persist to a temp file, rename it into place and only
//! then swap the in-memory table, so readers never observe a half-written
//! state.

use crate::config::GroupAccessSettings;
use crate::error::ConfigError;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Whitelist,
    Blacklist,
    None,
}

impl AccessMode {
    pub fn parse(s: &str) -> Option<AccessMode> {
        match s {
            "whitelist" => Some(AccessMode::Whitelist),
            "blacklist" => Some(AccessMode::Blacklist),
            "none" => Some(AccessMode::None),
            _ => None,
        }
    }
}

/// Per-room overrides on top of the service-wide defaults. `None` fields
/// defer to the global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomOverrides {
    pub output_format: Option<String>,
    pub template_id: Option<String>,
    pub schedule_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessTable {
    pub mode: AccessMode,
    pub list: BTreeSet<String>,
    pub rooms: BTreeMap<String, RoomOverrides>,
}

impl Default for AccessTable {
    fn default() -> Self {
        Self {
            mode: AccessMode::None,
            list: BTreeSet::new(),
            rooms: BTreeMap::new(),
        }
    }
}

impl AccessTable {
    fn from_settings(settings: &GroupAccessSettings) -> Self {
        Self {
            mode: AccessMode::parse(&settings.mode).unwrap_or(AccessMode::None),
            list: settings.list.iter().cloned().collect(),
            rooms: BTreeMap::new(),
        }
    }

    pub fn is_allowed(&self, room_id: &str) -> bool {
        match self.mode {
            AccessMode::Whitelist => self.list.contains(room_id),
            AccessMode::Blacklist => !self.list.contains(room_id),
            AccessMode::None => true,
        }
    }
}

pub struct RoomConfigStore {
    path: PathBuf,
    defaults: GroupAccessSettings,
    table: ArcSwap<AccessTable>,
    write: Mutex<()>,
}

impl RoomConfigStore {
    /// Loads the table from `path`, seeding from the global settings when no
    /// file exists yet.
    pub fn load(path: &Path, defaults: &GroupAccessSettings) -> Result<Self, ConfigError> {
        let table = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no room table on disk, seeding from settings");
                AccessTable::from_settings(defaults)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            defaults: defaults.clone(),
            table: ArcSwap::from_pointee(table),
            write: Mutex::new(()),
        })
    }

    /// Consistent point-in-time view. Cheap; safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<AccessTable> {
        self.table.load_full()
    }

    pub fn is_allowed(&self, room_id: &str) -> bool {
        self.snapshot().is_allowed(room_id)
    }

    pub fn overrides_for(&self, room_id: &str) -> RoomOverrides {
        self.snapshot().rooms.get(room_id).cloned().unwrap_or_default()
    }

    /// Rooms the scheduler should consider: everything the store knows about
    /// that passes the access check and has not opted out.
    pub fn schedulable_rooms(&self) -> Vec<String> {
        let table = self.snapshot();
        let mut known: BTreeSet<&String> = table.rooms.keys().collect();
        if table.mode == AccessMode::Whitelist {
            known.extend(table.list.iter());
        }
        known
            .into_iter()
            .filter(|room| table.is_allowed(room))
            .filter(|room| {
                table
                    .rooms
                    .get(*room)
                    .and_then(|o| o.schedule_enabled)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Grants the room access (mode-aware) and turns its schedule on.
    pub async fn enable(&self, room_id: &str) -> Result<(), ConfigError> {
        self.update(|table| {
            match table.mode {
                AccessMode::Whitelist => {
                    table.list.insert(room_id.to_string());
                }
                AccessMode::Blacklist => {
                    table.list.remove(room_id);
                }
                AccessMode::None => {}
            }
            table.rooms.entry(room_id.to_string()).or_default().schedule_enabled = Some(true);
        })
        .await
    }

    /// Revokes access (mode-aware) and turns the room's schedule off.
    pub async fn disable(&self, room_id: &str) -> Result<(), ConfigError> {
        self.update(|table| {
            match table.mode {
                AccessMode::Whitelist => {
                    table.list.remove(room_id);
                }
                AccessMode::Blacklist => {
                    table.list.insert(room_id.to_string());
                }
                AccessMode::None => {}
            }
            table.rooms.entry(room_id.to_string()).or_default().schedule_enabled = Some(false);
        })
        .await
    }

    pub async fn set_format(&self, room_id: &str, format: &str) -> Result<(), ConfigError> {
        let format = format.to_string();
        self.update(move |table| {
            table.rooms.entry(room_id.to_string()).or_default().output_format = Some(format);
        })
        .await
    }

    pub async fn set_template(&self, room_id: &str, template_id: &str) -> Result<(), ConfigError> {
        let template_id = template_id.to_string();
        self.update(move |table| {
            table.rooms.entry(room_id.to_string()).or_default().template_id = Some(template_id);
        })
        .await
    }

    /// Re-reads the table from disk, discarding in-memory state. Readers see
    /// either the old or the new table, never a mix. A missing file seeds
    /// from the global settings, same as the initial load.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let _guard = self.write.lock().await;
        let table = match std::fs::read_to_string(&self.path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no room table on disk, seeding from settings");
                AccessTable::from_settings(&self.defaults)
            }
            Err(e) => return Err(e.into()),
        };
        self.table.store(Arc::new(table));
        info!(path = %self.path.display(), "room table reloaded");
        Ok(())
    }

    /// Read-modify-write under the writer lock: mutate a copy, persist it,
    /// then publish. A failed persist leaves the old table visible.
    async fn update<F>(&self, apply: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut AccessTable),
    {
        let _guard = self.write.lock().await;
        let mut table = AccessTable::clone(&self.table.load());
        apply(&mut table);
        self.persist(&table)?;
        self.table.store(Arc::new(table));
        Ok(())
    }

    fn persist(&self, table: &AccessTable) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(table)?;
        let tmp = self.path.with_extension("toml.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
