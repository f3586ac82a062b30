use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::state::backend::StateBackend;
use crate::state::models::{MatchRow, MatchTable};

/// One (entity type, selector type) pairing the index can maintain.
pub trait SelectorKind: Send + Sync + 'static {
    type Entity: Clone + Send + Sync;
    type Selector: Clone + Send + Sync;

    /// Mirror table that receives the match rows.
    const TABLE: MatchTable;

    fn entity_id(entity: &Self::Entity) -> &str;
    fn selector_id(selector: &Self::Selector) -> &str;

    /// Must not fail; anything unresolvable is a non-match.
    fn matches(selector: &Self::Selector, entity: &Self::Entity) -> bool;
}

/// Pairs that started or stopped matching because of one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchDelta {
    pub added: Vec<MatchRow>,
    pub removed: Vec<MatchRow>,
}

impl MatchDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Entity ids touched by the delta.
    pub fn entity_ids(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(&self.removed)
            .map(|row| row.entity_id.clone())
            .collect()
    }

    pub fn merge(&mut self, other: MatchDelta) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

struct MatchState<K: SelectorKind> {
    entities: HashMap<String, K::Entity>,
    selectors: HashMap<String, K::Selector>,
    by_entity: HashMap<String, BTreeSet<String>>,
    by_selector: HashMap<String, BTreeSet<String>>,
}

impl<K: SelectorKind> MatchState<K> {
    fn empty() -> Self {
        Self {
            entities: HashMap::new(),
            selectors: HashMap::new(),
            by_entity: HashMap::new(),
            by_selector: HashMap::new(),
        }
    }

    fn link(&mut self, row: &MatchRow) {
        self.by_entity
            .entry(row.entity_id.clone())
            .or_default()
            .insert(row.selector_id.clone());
        self.by_selector
            .entry(row.selector_id.clone())
            .or_default()
            .insert(row.entity_id.clone());
    }

    fn unlink(&mut self, row: &MatchRow) {
        if let Some(set) = self.by_entity.get_mut(&row.entity_id) {
            set.remove(&row.selector_id);
            if set.is_empty() {
                self.by_entity.remove(&row.entity_id);
            }
        }
        if let Some(set) = self.by_selector.get_mut(&row.selector_id) {
            set.remove(&row.entity_id);
            if set.is_empty() {
                self.by_selector.remove(&row.selector_id);
            }
        }
    }

    fn rows(&self) -> BTreeSet<MatchRow> {
        self.by_entity
            .iter()
            .flat_map(|(entity_id, selectors)| {
                selectors.iter().map(move |selector_id| MatchRow {
                    selector_id: selector_id.clone(),
                    entity_id: entity_id.clone(),
                })
            })
            .collect()
    }

    /// Row delta for replacing one entity's row of the matrix.
    fn entity_delta(&self, entity_id: &str, entity: Option<&K::Entity>) -> MatchDelta {
        let before = self.by_entity.get(entity_id).cloned().unwrap_or_default();
        let after: BTreeSet<String> = match entity {
            Some(entity) => self
                .selectors
                .iter()
                .filter(|(_, selector)| K::matches(selector, entity))
                .map(|(id, _)| id.clone())
                .collect(),
            None => BTreeSet::new(),
        };
        let row = |selector_id: &String| MatchRow {
            selector_id: selector_id.clone(),
            entity_id: entity_id.to_string(),
        };
        MatchDelta {
            added: after.difference(&before).map(row).collect(),
            removed: before.difference(&after).map(row).collect(),
        }
    }

    /// Row delta for replacing one selector's column of the matrix.
    fn selector_delta(&self, selector_id: &str, selector: Option<&K::Selector>) -> MatchDelta {
        let before = self.by_selector.get(selector_id).cloned().unwrap_or_default();
        let after: BTreeSet<String> = match selector {
            Some(selector) => self
                .entities
                .iter()
                .filter(|(_, entity)| K::matches(selector, entity))
                .map(|(id, _)| id.clone())
                .collect(),
            None => BTreeSet::new(),
        };
        let row = |entity_id: &String| MatchRow {
            selector_id: selector_id.to_string(),
            entity_id: entity_id.clone(),
        };
        MatchDelta {
            added: after.difference(&before).map(row).collect(),
            removed: before.difference(&after).map(row).collect(),
        }
    }
}

/// Incrementally maintained match matrix between entities and selectors,
/// mirrored to a `computed_*` table.
///
/// Mutations are serialized by a writer mutex. Each one computes its delta
/// under a read lock, writes the delta to the mirror, and only then commits it
/// in memory, so a failed mirror write leaves both views unchanged.
pub struct SelectorIndex<K: SelectorKind> {
    backend: Arc<dyn StateBackend>,
    state: RwLock<MatchState<K>>,
    writer: Mutex<()>,
}

impl<K: SelectorKind> SelectorIndex<K> {
    /// Build the full matrix once and seed the mirror table with it.
    pub async fn load(
        backend: Arc<dyn StateBackend>,
        entities: Vec<K::Entity>,
        selectors: Vec<K::Selector>,
    ) -> Result<Self> {
        let mut state = MatchState::<K>::empty();
        for entity in entities {
            state.entities.insert(K::entity_id(&entity).to_string(), entity);
        }
        for selector in selectors {
            state
                .selectors
                .insert(K::selector_id(&selector).to_string(), selector);
        }

        let mut rows = Vec::new();
        for (entity_id, entity) in &state.entities {
            for (selector_id, selector) in &state.selectors {
                if K::matches(selector, entity) {
                    rows.push(MatchRow {
                        selector_id: selector_id.clone(),
                        entity_id: entity_id.clone(),
                    });
                }
            }
        }
        for row in &rows {
            state.link(row);
        }

        let entity_ids: Vec<String> = state.entities.keys().cloned().collect();
        let selector_ids: Vec<String> = state.selectors.keys().cloned().collect();
        backend
            .replace_matches(K::TABLE, &entity_ids, &selector_ids, &rows)
            .await
            .with_context(|| format!("Failed to seed {}", K::TABLE.table_name()))?;

        tracing::debug!(
            table = K::TABLE.table_name(),
            entities = state.entities.len(),
            selectors = state.selectors.len(),
            matches = rows.len(),
            "selector index loaded"
        );

        Ok(Self {
            backend,
            state: RwLock::new(state),
            writer: Mutex::new(()),
        })
    }

    async fn persist(&self, delta: &MatchDelta) -> Result<()> {
        self.backend
            .apply_match_delta(K::TABLE, &delta.added, &delta.removed)
            .await
            .with_context(|| format!("Failed to update {}", K::TABLE.table_name()))
    }

    pub async fn upsert_entity(&self, entity: K::Entity) -> Result<MatchDelta> {
        let _writer = self.writer.lock().await;
        let entity_id = K::entity_id(&entity).to_string();
        let delta = self.state.read().await.entity_delta(&entity_id, Some(&entity));
        self.persist(&delta).await?;

        let mut state = self.state.write().await;
        state.entities.insert(entity_id, entity);
        delta.removed.iter().for_each(|row| state.unlink(row));
        delta.added.iter().for_each(|row| state.link(row));
        Ok(delta)
    }

    pub async fn remove_entity(&self, entity_id: &str) -> Result<MatchDelta> {
        let _writer = self.writer.lock().await;
        let delta = self.state.read().await.entity_delta(entity_id, None);
        self.persist(&delta).await?;

        let mut state = self.state.write().await;
        state.entities.remove(entity_id);
        delta.removed.iter().for_each(|row| state.unlink(row));
        Ok(delta)
    }

    pub async fn upsert_selector(&self, selector: K::Selector) -> Result<MatchDelta> {
        let _writer = self.writer.lock().await;
        let selector_id = K::selector_id(&selector).to_string();
        let delta = self
            .state
            .read()
            .await
            .selector_delta(&selector_id, Some(&selector));
        self.persist(&delta).await?;

        let mut state = self.state.write().await;
        state.selectors.insert(selector_id, selector);
        delta.removed.iter().for_each(|row| state.unlink(row));
        delta.added.iter().for_each(|row| state.link(row));
        Ok(delta)
    }

    pub async fn remove_selector(&self, selector_id: &str) -> Result<MatchDelta> {
        let _writer = self.writer.lock().await;
        let delta = self.state.read().await.selector_delta(selector_id, None);
        self.persist(&delta).await?;

        let mut state = self.state.write().await;
        state.selectors.remove(selector_id);
        delta.removed.iter().for_each(|row| state.unlink(row));
        Ok(delta)
    }

    pub async fn entities_for_selector(&self, selector_id: &str) -> Vec<K::Entity> {
        let state = self.state.read().await;
        state
            .by_selector
            .get(selector_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entities.get(id).cloned())
            .collect()
    }

    pub async fn entity_ids_for_selector(&self, selector_id: &str) -> BTreeSet<String> {
        let state = self.state.read().await;
        state.by_selector.get(selector_id).cloned().unwrap_or_default()
    }

    pub async fn selectors_for_entity(&self, entity_id: &str) -> Vec<K::Selector> {
        let state = self.state.read().await;
        state
            .by_entity
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.selectors.get(id).cloned())
            .collect()
    }

    pub async fn is_match(&self, entity_id: &str, selector_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .by_entity
            .get(entity_id)
            .is_some_and(|set| set.contains(selector_id))
    }

    pub async fn get_entity(&self, entity_id: &str) -> Option<K::Entity> {
        self.state.read().await.entities.get(entity_id).cloned()
    }

    pub async fn get_selector(&self, selector_id: &str) -> Option<K::Selector> {
        self.state.read().await.selectors.get(selector_id).cloned()
    }

    pub async fn all_entities(&self) -> Vec<K::Entity> {
        self.state.read().await.entities.values().cloned().collect()
    }

    pub async fn all_selectors(&self) -> Vec<K::Selector> {
        self.state.read().await.selectors.values().cloned().collect()
    }

    /// Current in-memory matches.
    pub async fn match_rows(&self) -> BTreeSet<MatchRow> {
        self.state.read().await.rows()
    }

    /// Matches recomputed from scratch over the current entities and selectors.
    pub async fn rescan(&self) -> BTreeSet<MatchRow> {
        let state = self.state.read().await;
        let mut rows = BTreeSet::new();
        for (entity_id, entity) in &state.entities {
            for (selector_id, selector) in &state.selectors {
                if K::matches(selector, entity) {
                    rows.insert(MatchRow {
                        selector_id: selector_id.clone(),
                        entity_id: entity_id.clone(),
                    });
                }
            }
        }
        rows
    }
}
