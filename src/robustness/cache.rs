//! Content-addressed label cache.
//!
//! Labels are keyed by a blake3 hash of the scenario identity, the oracle
//! function name, the sample and the simulation settings. The cache can be
//! persisted as a zstd-compressed bincode snapshot guarded by a blake3 hash
//! and stamped with the [`BUILD_ID`] that produced it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::oracle::{Label, SimulationSettings};
use crate::causal::EventLabels;
use crate::error::{ChainError, ChainResult};
use crate::BUILD_ID;

/// Cache key.
pub type CacheKey = [u8; 32];

/// Stored oracle result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntry {
    /// Global label only.
    Label(Label),
    /// Global label with per-event labels.
    WithEvents(Label, EventLabels),
}

/// On-disk snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    /// Build that computed the labels.
    build: String,
    /// Compressed entries.
    data: Vec<u8>,
    /// Blake3 hash of `data`.
    hash: [u8; 32],
}

/// Thread-safe label memo.
#[derive(Debug, Default)]
pub struct LabelCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LabelCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash the inputs of an oracle call.
    #[must_use]
    pub fn key(
        scenario: &[u8; 32],
        function: &str,
        sample: &[f64],
        settings: &SimulationSettings,
    ) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(scenario);
        hasher.update(function.as_bytes());
        hasher.update(&[0]);
        for x in sample {
            hasher.update(&x.to_le_bytes());
        }
        hasher.update(&settings.duration.to_le_bytes());
        hasher.update(&settings.timestep.to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Look up an entry, counting hits and misses.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).cloned());
        let counter = if entry.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Store an entry.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, entry);
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |e| e.len())
    }

    /// True if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookups that found an entry.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Write a compressed snapshot to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, compression or writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P, compression_level: i32) -> ChainResult<()> {
        let mut entries: Vec<(CacheKey, CacheEntry)> = self
            .entries
            .read()
            .map_err(|_| ChainError::serialization("label cache lock poisoned"))?
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let serialized =
            bincode::serialize(&entries).map_err(|e| ChainError::serialization(e.to_string()))?;
        let data = zstd::encode_all(&serialized[..], compression_level)?;
        let hash = *blake3::hash(&data).as_bytes();
        let bytes = bincode::serialize(&Snapshot {
            build: BUILD_ID.to_string(),
            data,
            hash,
        })
            .map_err(|e| ChainError::serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), bytes)?;
        debug!(entries = entries.len(), path = %path.as_ref().display(), "label cache saved");
        Ok(())
    }

    /// Read a snapshot written by [`LabelCache::save`].
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::CacheBuildMismatch`] for a snapshot from another
    /// build, [`ChainError::CacheIntegrity`] if the payload hash does not
    /// match, or an I/O or serialization error.
    pub fn load<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let snapshot: Snapshot =
            bincode::deserialize(&bytes).map_err(|e| ChainError::serialization(e.to_string()))?;
        if snapshot.build != BUILD_ID {
            return Err(ChainError::CacheBuildMismatch {
                expected: BUILD_ID.to_string(),
                found: snapshot.build,
            });
        }
        if blake3::hash(&snapshot.data).as_bytes() != &snapshot.hash {
            return Err(ChainError::CacheIntegrity);
        }
        let decompressed = zstd::decode_all(&snapshot.data[..])?;
        let entries: Vec<(CacheKey, CacheEntry)> = bincode::deserialize(&decompressed)
            .map_err(|e| ChainError::serialization(e.to_string()))?;
        debug!(entries = entries.len(), path = %path.as_ref().display(), "label cache loaded");
        Ok(Self {
            entries: RwLock::new(entries.into_iter().collect()),
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SimulationSettings {
        SimulationSettings::default()
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("chainsim-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_key_depends_on_every_input() {
        let id = [7u8; 32];
        let base = LabelCache::key(&id, "label", &[0.5, 0.25], &settings());
        assert_eq!(base, LabelCache::key(&id, "label", &[0.5, 0.25], &settings()));
        assert_ne!(base, LabelCache::key(&[8u8; 32], "label", &[0.5, 0.25], &settings()));
        assert_ne!(base, LabelCache::key(&id, "label_with_events", &[0.5, 0.25], &settings()));
        assert_ne!(base, LabelCache::key(&id, "label", &[0.5, 0.26], &settings()));
        let slower = SimulationSettings {
            duration: 1.0,
            ..settings()
        };
        assert_ne!(base, LabelCache::key(&id, "label", &[0.5, 0.25], &slower));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = LabelCache::new();
        let key = [1u8; 32];
        assert!(cache.get(&key).is_none());
        cache.insert(key, CacheEntry::Label(Label::Success));
        assert_eq!(cache.get(&key), Some(CacheEntry::Label(Label::Success)));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_save_and_load() {
        let cache = LabelCache::new();
        let mut events = EventLabels::new();
        events.insert("a".into(), Some(true));
        events.insert("b".into(), None);
        cache.insert([1u8; 32], CacheEntry::Label(Label::Failure));
        cache.insert([2u8; 32], CacheEntry::WithEvents(Label::Success, events.clone()));

        let path = temp_path("roundtrip.bin");
        cache.save(&path, 3).unwrap();
        let loaded = LabelCache::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(&[2u8; 32]),
            Some(CacheEntry::WithEvents(Label::Success, events))
        );
    }

    #[test]
    fn test_corrupted_snapshot_is_rejected() {
        let cache = LabelCache::new();
        cache.insert([1u8; 32], CacheEntry::Label(Label::Success));
        let path = temp_path("corrupt.bin");
        cache.save(&path, 3).unwrap();

        let mut snapshot: Snapshot = bincode::deserialize(&std::fs::read(&path).unwrap()).unwrap();
        if let Some(byte) = snapshot.data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&path, bincode::serialize(&snapshot).unwrap()).unwrap();

        let err = LabelCache::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, ChainError::CacheIntegrity));
    }

    #[test]
    fn test_snapshot_from_other_build_is_rejected() {
        let cache = LabelCache::new();
        cache.insert([1u8; 32], CacheEntry::Label(Label::Success));
        let path = temp_path("stale.bin");
        cache.save(&path, 3).unwrap();

        let mut snapshot: Snapshot = bincode::deserialize(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot.build, BUILD_ID);
        snapshot.build = "0.0.0+deadbeef".into();
        std::fs::write(&path, bincode::serialize(&snapshot).unwrap()).unwrap();

        let err = LabelCache::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        match err {
            ChainError::CacheBuildMismatch { expected, found } => {
                assert_eq!(expected, BUILD_ID);
                assert_eq!(found, "0.0.0+deadbeef");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
