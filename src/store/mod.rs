use crate::models::Position;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

const STAGE_FLUSH_RETRIES: u32 = 3;

/// The single persisted document: discovery de-duplication plus every
/// position keyed by asset id. Each mutating call rewrites it whole.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    seen: HashMap<String, bool>,
    #[serde(default)]
    positions: HashMap<String, Position>,
}

/// Durable record of every position and its stage-completion flags.
///
/// Pure data access: no polling, no events. All mutations are flushed
/// write-through before the call returns; on a storage failure the
/// in-memory state is kept ("applied in memory, not yet durable") and the
/// error is surfaced so the caller can retry `flush`, never the logical
/// operation.
pub struct PositionStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
}

impl PositionStore {
    /// Open the store at `path`, loading the existing document if present
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            positions = doc.positions.len(),
            "position store opened"
        );

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Rewrite the whole document durably (write temp file, then rename)
    fn flush_doc(&self, doc: &StoreDocument) -> Result<()> {
        let data = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Retry the durable write of the current in-memory state
    pub fn flush(&self) -> Result<()> {
        let doc = self.doc.lock().unwrap();
        self.flush_doc(&doc)
    }

    pub fn create(
        &self,
        asset_id: &str,
        symbol: &str,
        entry_price: Option<f64>,
        size: f64,
    ) -> Result<Position> {
        let mut doc = self.doc.lock().unwrap();
        if doc.positions.contains_key(asset_id) {
            return Err(format!("position already exists for {}", asset_id).into());
        }

        let position = Position::new(asset_id.to_string(), symbol.to_string(), entry_price, size);
        doc.positions.insert(asset_id.to_string(), position.clone());

        self.flush_doc(&doc)?;
        Ok(position)
    }

    pub fn get(&self, asset_id: &str) -> Option<Position> {
        self.doc.lock().unwrap().positions.get(asset_id).cloned()
    }

    /// Write the entry price acquired after a buy. Set at most once per
    /// activation; a second call is an error.
    pub fn activate(&self, asset_id: &str, entry_price: f64) -> Result<Position> {
        let mut doc = self.doc.lock().unwrap();
        let position = doc
            .positions
            .get_mut(asset_id)
            .ok_or_else(|| format!("no position for {}", asset_id))?;

        if position.entry_price.is_some() {
            return Err(format!("entry price already set for {}", asset_id).into());
        }

        position.entry_price = Some(entry_price);
        position.current_price = entry_price;
        position.highest_price = entry_price;
        position.highest_multiple = 1.0;
        position.last_updated = Utc::now();
        let snapshot = position.clone();

        self.flush_doc(&doc)?;
        Ok(snapshot)
    }

    /// Record a price observation. Returns None (logged) when the entry
    /// price is not yet known, in which case nothing changes.
    pub fn update_price(&self, asset_id: &str, price: f64) -> Result<Option<Position>> {
        let mut doc = self.doc.lock().unwrap();
        let position = doc
            .positions
            .get_mut(asset_id)
            .ok_or_else(|| format!("no position for {}", asset_id))?;

        if position.record_price(price).is_none() {
            tracing::debug!(asset_id, "price update before entry price is known, skipping");
            return Ok(None);
        }
        let snapshot = position.clone();

        self.flush_doc(&doc)?;
        Ok(Some(snapshot))
    }

    /// Flip a stage's completion flag to sold. One-way: the flag never
    /// returns to false, and marking an already-sold stage is a no-op.
    ///
    /// The flush is retried here so the flag is durable before the caller
    /// proceeds past an irreversible sell.
    pub fn mark_stage_sold(&self, asset_id: &str, stage_id: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        let position = doc
            .positions
            .get_mut(asset_id)
            .ok_or_else(|| format!("no position for {}", asset_id))?;

        position.stage_completion.insert(stage_id.to_string(), true);
        position.last_updated = Utc::now();

        let mut last_err = None;
        for attempt in 1..=STAGE_FLUSH_RETRIES {
            match self.flush_doc(&doc) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        asset_id,
                        stage_id,
                        attempt,
                        error = %e,
                        "stage flush failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }

    pub fn pause(&self, asset_id: &str) -> Result<Position> {
        let mut doc = self.doc.lock().unwrap();
        let position = doc
            .positions
            .get_mut(asset_id)
            .ok_or_else(|| format!("no position for {}", asset_id))?;

        position.paused = true;
        position.paused_at = Some(Utc::now());
        let snapshot = position.clone();

        self.flush_doc(&doc)?;
        Ok(snapshot)
    }

    /// Reset a paused position to a fresh lifecycle under the same identity:
    /// stage flags and history cleared, entry and high-water marks set to
    /// the new price, paused state cleared. Prior performance is discarded
    /// deliberately.
    pub fn reactivate(&self, asset_id: &str, new_entry_price: f64) -> Result<Position> {
        let mut doc = self.doc.lock().unwrap();
        let position = doc
            .positions
            .get_mut(asset_id)
            .ok_or_else(|| format!("no position for {}", asset_id))?;

        position.stage_completion.clear();
        position.price_history.clear();
        position.entry_price = Some(new_entry_price);
        position.current_price = new_entry_price;
        position.highest_price = new_entry_price;
        position.highest_multiple = 1.0;
        position.paused = false;
        position.paused_at = None;
        position.last_updated = Utc::now();
        let snapshot = position.clone();

        self.flush_doc(&doc)?;
        Ok(snapshot)
    }

    pub fn list_all(&self) -> Vec<Position> {
        self.doc.lock().unwrap().positions.values().cloned().collect()
    }

    /// All positions not currently paused
    pub fn list_active(&self) -> Vec<Position> {
        self.doc
            .lock()
            .unwrap()
            .positions
            .values()
            .filter(|p| !p.paused)
            .cloned()
            .collect()
    }

    pub fn already_seen(&self, asset_id: &str) -> bool {
        self.doc
            .lock()
            .unwrap()
            .seen
            .get(asset_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn mark_seen(&self, asset_id: &str) -> Result<()> {
        let mut doc = self.doc.lock().unwrap();
        doc.seen.insert(asset_id.to_string(), true);
        self.flush_doc(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> PositionStore {
        PositionStore::open(dir.path().join("positions.json")).unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", Some(1.0), 50.0).unwrap();

        let position = store.get("mint-1").unwrap();
        assert_eq!(position.symbol, "TKN");
        assert_eq!(position.entry_price, Some(1.0));
        assert_eq!(position.entry_size, 50.0);
        assert!(!position.paused);
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", None, 50.0).unwrap();
        let result = store.create("mint-1", "TKN", None, 50.0);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already exists"));
    }

    #[test]
    fn test_activate_sets_entry_once() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", None, 50.0).unwrap();
        let position = store.activate("mint-1", 2.0).unwrap();
        assert_eq!(position.entry_price, Some(2.0));
        assert_eq!(position.highest_price, 2.0);
        assert_eq!(position.highest_multiple, 1.0);

        assert!(store.activate("mint-1", 3.0).is_err());
    }

    #[test]
    fn test_update_price_before_entry_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", None, 50.0).unwrap();
        let updated = store.update_price("mint-1", 5.0).unwrap();

        assert!(updated.is_none());
        assert!(store.get("mint-1").unwrap().price_history.is_empty());
    }

    #[test]
    fn test_update_price_tracks_highs_and_history() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", Some(1.0), 50.0).unwrap();
        store.update_price("mint-1", 3.0).unwrap();
        let position = store.update_price("mint-1", 2.0).unwrap().unwrap();

        assert_eq!(position.current_price, 2.0);
        assert_eq!(position.highest_price, 3.0);
        assert_eq!(position.highest_multiple, 3.0);
        assert_eq!(position.price_history.len(), 2);
    }

    #[test]
    fn test_stage_flag_never_regresses() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", Some(1.0), 50.0).unwrap();
        store.mark_stage_sold("mint-1", "tp1").unwrap();
        assert!(store.get("mint-1").unwrap().stage_sold("tp1"));

        // Marking again is harmless and the flag stays set
        store.mark_stage_sold("mint-1", "tp1").unwrap();
        assert!(store.get("mint-1").unwrap().stage_sold("tp1"));
    }

    #[test]
    fn test_pause_and_reactivate() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.create("mint-1", "TKN", Some(1.0), 50.0).unwrap();
        store.update_price("mint-1", 4.0).unwrap();
        store.mark_stage_sold("mint-1", "tp1").unwrap();

        let paused = store.pause("mint-1").unwrap();
        assert!(paused.paused);
        assert!(paused.paused_at.is_some());
        assert!(store.list_active().is_empty());

        let fresh = store.reactivate("mint-1", 0.5).unwrap();
        assert!(!fresh.paused);
        assert!(fresh.paused_at.is_none());
        assert_eq!(fresh.entry_price, Some(0.5));
        assert_eq!(fresh.highest_price, 0.5);
        assert_eq!(fresh.highest_multiple, 1.0);
        assert!(fresh.stage_completion.is_empty());
        assert!(fresh.price_history.is_empty());
        assert_eq!(store.list_active().len(), 1);
    }

    #[test]
    fn test_document_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("positions.json");

        {
            let store = PositionStore::open(&path).unwrap();
            store.create("mint-1", "TKN", Some(1.0), 50.0).unwrap();
            store.update_price("mint-1", 2.0).unwrap();
            store.mark_stage_sold("mint-1", "tp1").unwrap();
            store.mark_seen("mint-1").unwrap();
        }

        let reopened = PositionStore::open(&path).unwrap();
        let position = reopened.get("mint-1").unwrap();
        assert_eq!(position.current_price, 2.0);
        assert!(position.stage_sold("tp1"));
        assert!(reopened.already_seen("mint-1"));
    }

    #[test]
    fn test_storage_failure_keeps_memory_applied() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.create("mint-1", "TKN", Some(1.0), 50.0).unwrap();

        // Make the directory disappear under the store so the flush fails
        drop(dir);

        let result = store.update_price("mint-1", 2.0);
        assert!(result.is_err());

        // Applied in memory, not yet durable
        assert_eq!(store.get("mint-1").unwrap().current_price, 2.0);
    }

    #[test]
    fn test_seen_map_defaults_false() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert!(!store.already_seen("mint-1"));
        store.mark_seen("mint-1").unwrap();
        assert!(store.already_seen("mint-1"));
    }
}
