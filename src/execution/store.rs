use crate::models::{Position, PositionStatus, Timeframe};
use crate::persistence::{FileStore, POSITIONS_FILE};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// CLOSED positions kept around for the dashboard; older ones are pruned
const CLOSED_RETENTION: usize = 100;

/// In-memory index of positions with a durable checkpoint on every
/// mutation. The single source of truth for position state; all mutators
/// go through the position manager.
pub struct PositionStore {
    positions: RwLock<HashMap<String, Position>>,
    files: Arc<FileStore>,
}

/// Keep every ACTIVE position and the newest `CLOSED_RETENTION` closed ones
fn apply_retention(list: Vec<Position>) -> Vec<Position> {
    let (active, mut closed): (Vec<_>, Vec<_>) =
        list.into_iter().partition(|p| p.is_active());

    closed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    closed.truncate(CLOSED_RETENTION);

    let mut retained = active;
    retained.extend(closed);
    retained.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    retained
}

impl PositionStore {
    pub fn load(files: Arc<FileStore>) -> Result<Self> {
        let list: Vec<Position> = files.load(POSITIONS_FILE)?.unwrap_or_default();
        let retained = apply_retention(list);
        if !retained.is_empty() {
            tracing::info!(
                "Restored {} positions ({} active)",
                retained.len(),
                retained.iter().filter(|p| p.is_active()).count()
            );
        }

        let positions = retained
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect::<HashMap<_, _>>();

        let store = Self {
            positions: RwLock::new(positions),
            files,
        };
        store.persist()?;
        Ok(store)
    }

    /// Insert a new position. Rejects a duplicate id and a second ACTIVE
    /// position on the same timeframe.
    pub fn insert(&self, position: Position) -> Result<()> {
        {
            let mut positions = self.positions.write().unwrap();
            if positions.contains_key(&position.id) {
                bail!("position {} already exists", position.id);
            }
            if position.is_active() {
                if let Some(existing) = positions
                    .values()
                    .find(|p| p.timeframe == position.timeframe && p.is_active())
                {
                    bail!(
                        "timeframe {} already has active position {}",
                        position.timeframe,
                        existing.id
                    );
                }
            }
            positions.insert(position.id.clone(), position);
        }
        self.persist()
    }

    /// Apply a mutation to a position and checkpoint. A CLOSED position is
    /// never mutated; the unchanged record is returned instead.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Option<Position>>
    where
        F: FnOnce(&mut Position),
    {
        let updated = {
            let mut positions = self.positions.write().unwrap();
            match positions.get_mut(id) {
                None => None,
                Some(position) if position.status == PositionStatus::Closed => {
                    Some(position.clone())
                }
                Some(position) => {
                    mutate(position);
                    Some(position.clone())
                }
            }
        };
        if updated.is_some() {
            self.persist()?;
        }
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.positions.read().unwrap().get(id).cloned()
    }

    pub fn active_by_timeframe(&self, timeframe: Timeframe) -> Option<Position> {
        self.positions
            .read()
            .unwrap()
            .values()
            .find(|p| p.timeframe == timeframe && p.is_active())
            .cloned()
    }

    pub fn active_positions(&self) -> Vec<Position> {
        let mut active: Vec<Position> = self
            .positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    /// All positions ordered by creation time, newest first unless
    /// `ascending` is set
    pub fn all_sorted(&self, limit: Option<usize>, ascending: bool) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.read().unwrap().values().cloned().collect();
        if ascending {
            all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        } else {
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        if let Some(limit) = limit {
            all.truncate(limit);
        }
        all
    }

    pub fn counts(&self) -> (usize, usize) {
        let positions = self.positions.read().unwrap();
        let active = positions.values().filter(|p| p.is_active()).count();
        (active, positions.len() - active)
    }

    /// Rewrite the checkpoint, applying retention to memory and disk alike
    fn persist(&self) -> Result<()> {
        let retained = {
            let mut positions = self.positions.write().unwrap();
            let list: Vec<Position> = positions.values().cloned().collect();
            let retained = apply_retention(list);
            *positions = retained
                .iter()
                .map(|p| (p.id.clone(), p.clone()))
                .collect();
            retained
        };
        self.files.save(POSITIONS_FILE, &retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BinRange, PriceRange, Side};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_files() -> Arc<FileStore> {
        let dir = std::env::temp_dir().join(format!(
            "lpbot-store-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        Arc::new(FileStore::new(dir).unwrap())
    }

    fn position(id: &str, tf: Timeframe, status: PositionStatus, age_mins: i64) -> Position {
        Position {
            id: id.to_string(),
            pool_id: "pool".to_string(),
            timeframe: tf,
            side: Side::Buy,
            amount: 1.0,
            entry_price: 150.0,
            created_at: Utc::now() - ChronoDuration::minutes(age_mins),
            status,
            price_range: PriceRange {
                min: 150.0,
                max: 165.0,
                bin_range: BinRange {
                    min_bin: 0,
                    max_bin: 60,
                },
            },
            last_range_check: Utc::now() - ChronoDuration::minutes(age_mins),
            has_been_harvested: false,
            last_harvest_at: None,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = PositionStore::load(test_files()).unwrap();
        store
            .insert(position("a", Timeframe::H1, PositionStatus::Active, 0))
            .unwrap();

        assert!(store.get("a").is_some());
        assert!(store.active_by_timeframe(Timeframe::H1).is_some());
        assert!(store.active_by_timeframe(Timeframe::H4).is_none());
    }

    #[test]
    fn test_one_active_per_timeframe() {
        let store = PositionStore::load(test_files()).unwrap();
        store
            .insert(position("a", Timeframe::H1, PositionStatus::Active, 0))
            .unwrap();

        let second = store.insert(position("b", Timeframe::H1, PositionStatus::Active, 0));
        assert!(second.is_err());

        // A different timeframe is fine, and so is a closed record
        store
            .insert(position("c", Timeframe::H4, PositionStatus::Active, 0))
            .unwrap();
        store
            .insert(position("d", Timeframe::H1, PositionStatus::Closed, 5))
            .unwrap();
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = PositionStore::load(test_files()).unwrap();
        store
            .insert(position("a", Timeframe::H1, PositionStatus::Active, 0))
            .unwrap();
        assert!(store
            .insert(position("a", Timeframe::H4, PositionStatus::Closed, 0))
            .is_err());
    }

    #[test]
    fn test_closed_positions_are_immutable() {
        let store = PositionStore::load(test_files()).unwrap();
        store
            .insert(position("a", Timeframe::H1, PositionStatus::Active, 0))
            .unwrap();

        store
            .update("a", |p| p.status = PositionStatus::Closed)
            .unwrap();

        // A later mutation attempt leaves the record untouched
        let after = store
            .update("a", |p| p.amount = 999.0)
            .unwrap()
            .unwrap();
        assert_eq!(after.amount, 1.0);
        assert_eq!(after.status, PositionStatus::Closed);
    }

    #[test]
    fn test_update_missing_returns_none() {
        let store = PositionStore::load(test_files()).unwrap();
        assert!(store.update("ghost", |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_sorting_and_limit() {
        let store = PositionStore::load(test_files()).unwrap();
        store
            .insert(position("old", Timeframe::H1, PositionStatus::Closed, 60))
            .unwrap();
        store
            .insert(position("new", Timeframe::H4, PositionStatus::Closed, 1))
            .unwrap();

        let desc = store.all_sorted(None, false);
        assert_eq!(desc[0].id, "new");

        let asc = store.all_sorted(None, true);
        assert_eq!(asc[0].id, "old");

        assert_eq!(store.all_sorted(Some(1), false).len(), 1);
    }

    #[test]
    fn test_retention_keeps_active_and_newest_closed() {
        let store = PositionStore::load(test_files()).unwrap();

        store
            .insert(position("active", Timeframe::D1, PositionStatus::Active, 100_000))
            .unwrap();
        for i in 0..120 {
            store
                .insert(position(
                    &format!("closed-{}", i),
                    Timeframe::H1,
                    PositionStatus::Closed,
                    10_000 - i,
                ))
                .unwrap();
        }

        let (active, closed) = store.counts();
        assert_eq!(active, 1);
        assert_eq!(closed, CLOSED_RETENTION);

        // The very old ACTIVE survives, the oldest CLOSED do not
        assert!(store.get("active").is_some());
        assert!(store.get("closed-0").is_none());
        assert!(store.get("closed-119").is_some());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let files = test_files();
        {
            let store = PositionStore::load(files.clone()).unwrap();
            store
                .insert(position("a", Timeframe::H1, PositionStatus::Active, 0))
                .unwrap();
        }
        let restored = PositionStore::load(files).unwrap();
        assert!(restored.get("a").is_some());
        assert!(restored.active_by_timeframe(Timeframe::H1).is_some());
    }
}
