//! Collaborators the coordination core drives but does not own: the config
//! store, the uid map and the puller manager. Each comes with a small
//! in-memory implementation used by the daemon binary and the tests.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::companion::StatsCompanion;
use crate::engine::ConfigKey;
use crate::event::Event;

/// Raw configurations as received at the boundary.
pub trait ConfigStore: Send + Sync {
    fn put(&self, key: ConfigKey, raw: Vec<u8>);

    /// Returns whether `key` was present.
    fn remove(&self, key: ConfigKey) -> bool;

    /// Drops every config owned by `uid`, returning the removed keys.
    fn remove_uid(&self, uid: u32) -> Vec<ConfigKey>;

    fn keys(&self) -> Vec<ConfigKey>;

    /// Every stored config with its raw bytes, in key order.
    fn entries(&self) -> Vec<(ConfigKey, Vec<u8>)>;
}

/// One installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub uid: u32,
    pub version: i64,
    #[serde(default)]
    pub version_string: String,
    #[serde(default)]
    pub installer: String,
}

/// Package ↔ uid mapping fed by the companion.
pub trait UidMap: Send + Sync {
    /// Replaces the whole map.
    fn update_all(&self, packages: Vec<PackageInfo>);

    fn update_package(&self, package: PackageInfo);

    fn remove_package(&self, name: &str, uid: u32);

    fn has_app(&self, uid: u32) -> bool;
}

/// Tuning attached to a pull callback registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullAtomMetadata {
    pub cool_down_ns: i64,
    pub timeout_ns: i64,
    #[serde(default)]
    pub additive_fields: Vec<i32>,
}

impl Default for PullAtomMetadata {
    fn default() -> Self {
        Self {
            cool_down_ns: 1_000_000_000,
            timeout_ns: 2_000_000_000,
            additive_fields: Vec::new(),
        }
    }
}

/// Producer of pulled atoms.
pub trait PullAtomCallback: Send + Sync {
    fn on_pull_atom(&self, atom_tag: u32) -> Vec<Event>;
}

/// Pull-based collection. The core only manages registrations and the
/// companion handle.
pub trait PullerManager: Send + Sync {
    fn set_companion(&self, companion: Option<Arc<dyn StatsCompanion>>);

    fn register_pull_callback(
        &self,
        uid: u32,
        atom_tag: u32,
        metadata: PullAtomMetadata,
        callback: Arc<dyn PullAtomCallback>,
    );

    fn unregister_pull_callback(&self, uid: u32, atom_tag: u32);
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: Mutex<BTreeMap<ConfigKey, Vec<u8>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ConfigKey) -> Option<Vec<u8>> {
        self.lock().get(&key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConfigKey, Vec<u8>>> {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn put(&self, key: ConfigKey, raw: Vec<u8>) {
        self.lock().insert(key, raw);
    }

    fn remove(&self, key: ConfigKey) -> bool {
        self.lock().remove(&key).is_some()
    }

    fn remove_uid(&self, uid: u32) -> Vec<ConfigKey> {
        let mut configs = self.lock();
        let owned: Vec<ConfigKey> = configs.keys().filter(|k| k.uid() == uid).copied().collect();
        for key in &owned {
            configs.remove(key);
        }
        owned
    }

    fn keys(&self) -> Vec<ConfigKey> {
        self.lock().keys().copied().collect()
    }

    fn entries(&self) -> Vec<(ConfigKey, Vec<u8>)> {
        self.lock()
            .iter()
            .map(|(key, raw)| (*key, raw.clone()))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryUidMap {
    packages: Mutex<BTreeMap<(u32, String), PackageInfo>>,
}

impl MemoryUidMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packages_for_uid(&self, uid: u32) -> Vec<PackageInfo> {
        self.lock()
            .values()
            .filter(|package| package.uid == uid)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(u32, String), PackageInfo>> {
        self.packages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UidMap for MemoryUidMap {
    fn update_all(&self, packages: Vec<PackageInfo>) {
        let mut map = self.lock();
        map.clear();
        for package in packages {
            map.insert((package.uid, package.name.clone()), package);
        }
    }

    fn update_package(&self, package: PackageInfo) {
        self.lock().insert((package.uid, package.name.clone()), package);
    }

    fn remove_package(&self, name: &str, uid: u32) {
        self.lock().remove(&(uid, name.to_string()));
    }

    fn has_app(&self, uid: u32) -> bool {
        self.lock().keys().any(|(owner, _)| *owner == uid)
    }
}

struct PullRegistration {
    metadata: PullAtomMetadata,
    callback: Arc<dyn PullAtomCallback>,
}

#[derive(Default)]
pub struct MemoryPullerManager {
    companion: Mutex<Option<Arc<dyn StatsCompanion>>>,
    callbacks: Mutex<HashMap<(u32, u32), PullRegistration>>,
}

impl MemoryPullerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_companion(&self) -> bool {
        self.companion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_registered(&self, uid: u32, atom_tag: u32) -> bool {
        self.registrations().contains_key(&(uid, atom_tag))
    }

    pub fn metadata(&self, uid: u32, atom_tag: u32) -> Option<PullAtomMetadata> {
        self.registrations()
            .get(&(uid, atom_tag))
            .map(|registration| registration.metadata.clone())
    }

    /// Invokes the callback registered for (`uid`, `atom_tag`), if any.
    pub fn pull(&self, uid: u32, atom_tag: u32) -> Option<Vec<Event>> {
        let callback = self
            .registrations()
            .get(&(uid, atom_tag))
            .map(|registration| registration.callback.clone())?;
        Some(callback.on_pull_atom(atom_tag))
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<(u32, u32), PullRegistration>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MemoryPullerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPullerManager")
            .field("has_companion", &self.has_companion())
            .field("registrations", &self.registrations().len())
            .finish()
    }
}

impl PullerManager for MemoryPullerManager {
    fn set_companion(&self, companion: Option<Arc<dyn StatsCompanion>>) {
        *self.companion.lock().unwrap_or_else(PoisonError::into_inner) = companion;
    }

    fn register_pull_callback(
        &self,
        uid: u32,
        atom_tag: u32,
        metadata: PullAtomMetadata,
        callback: Arc<dyn PullAtomCallback>,
    ) {
        self.registrations()
            .insert((uid, atom_tag), PullRegistration { metadata, callback });
    }

    fn unregister_pull_callback(&self, uid: u32, atom_tag: u32) {
        self.registrations().remove(&(uid, atom_tag));
    }
}
