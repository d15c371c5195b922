//! Per-source state and draw order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::MixerError;
use crate::mixer::compose::Layer;
use crate::mixer::filter::VideoFilter;
use crate::mixer::transform::{Mat4, Orientation};
use crate::pipeline::stage::Source;
use crate::pipeline::types::{SourceId, VideoFrame};

/// Everything the compositor knows about one registered source
pub struct SourceRecord {
    pub(crate) source: Weak<dyn Source>,
    /// Registration sequence number; also breaks ties inside a layer
    pub(crate) generation: u64,
    pub(crate) frame: Option<VideoFrame>,
    pub(crate) updated_at: Option<Instant>,
    pub(crate) transform: Mat4,
    pub(crate) orientation: Orientation,
    pub(crate) layer: i32,
    pub(crate) blends: bool,
    pub(crate) filter: Option<Weak<dyn VideoFilter>>,
    pub(crate) size_hint: usize,
    /// Sequence number of the latest accepted push
    pub(crate) push_seq: u64,
    /// Sequence number of the push that produced `frame`
    pub(crate) applied_seq: u64,
}

impl SourceRecord {
    pub fn layer(&self) -> i32 {
        self.layer
    }

    pub fn frame(&self) -> Option<&VideoFrame> {
        self.frame.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        self.source.strong_count() > 0
    }

    /// Live filter for this source, if any
    pub fn filter(&self) -> Option<Arc<dyn VideoFilter>> {
        self.filter.as_ref().and_then(Weak::upgrade)
    }

    /// Store a frame produced by push `seq`. Older results are discarded so
    /// the latest push always wins.
    pub(crate) fn store(&mut self, seq: u64, frame: VideoFrame, now: Instant) -> bool {
        if seq < self.applied_seq {
            return false;
        }
        self.applied_seq = seq;
        self.frame = Some(frame);
        self.updated_at = Some(now);
        true
    }
}

/// Ordered mapping from layer index to the sources drawn at that layer
#[derive(Debug, Default)]
pub struct LayerMap {
    layers: BTreeMap<i32, BTreeMap<u64, SourceId>>,
}

impl LayerMap {
    fn insert(&mut self, layer: i32, generation: u64, id: SourceId) {
        self.layers.entry(layer).or_default().insert(generation, id);
    }

    fn remove(&mut self, layer: i32, generation: u64) -> Option<SourceId> {
        let slot = self.layers.get_mut(&layer)?;
        let id = slot.remove(&generation);
        if slot.is_empty() {
            self.layers.remove(&layer);
        }
        id
    }

    /// Ids in draw order
    pub fn iter(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.layers.values().flat_map(|slot| slot.values().copied())
    }

    fn entries(&self) -> impl Iterator<Item = (i32, u64, SourceId)> + '_ {
        self.layers
            .iter()
            .flat_map(|(layer, slot)| slot.iter().map(move |(g, id)| (*layer, *g, *id)))
    }

    pub fn top_layer(&self) -> Option<i32> {
        self.layers.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.layers.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// What one mix pass needs, copied out under the state lock
#[derive(Debug, Default)]
pub struct Snapshot {
    /// In draw order
    pub layers: Vec<Layer>,
    /// Sources left out for having no frame or a stale one
    pub skipped: usize,
}

#[derive(Default)]
pub struct SourceTable {
    records: HashMap<SourceId, SourceRecord>,
    layers: LayerMap,
    next_generation: u64,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source on top of every existing layer
    pub fn register(&mut self, source: &Arc<dyn Source>, size_hint: usize) -> Result<(), MixerError> {
        let id = source.id();
        if self.records.contains_key(&id) {
            return Err(MixerError::DuplicateSource(id));
        }

        let layer = self.layers.top_layer().map_or(0, |top| top.saturating_add(1));
        self.next_generation += 1;
        let generation = self.next_generation;

        self.records.insert(
            id,
            SourceRecord {
                source: Arc::downgrade(source),
                generation,
                frame: None,
                updated_at: None,
                transform: Mat4::IDENTITY,
                orientation: Orientation::Up,
                layer,
                blends: false,
                filter: None,
                size_hint,
                push_seq: 0,
                applied_seq: 0,
            },
        );
        self.layers.insert(layer, generation, id);
        Ok(())
    }

    /// Remove a source and release its frame. Returns `false` if unknown.
    pub fn unregister(&mut self, id: SourceId) -> bool {
        match self.records.remove(&id) {
            Some(record) => {
                self.layers.remove(record.layer, record.generation);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: SourceId) -> Option<&SourceRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: SourceId) -> Option<&mut SourceRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.records.contains_key(&id)
    }

    /// Move a source to another layer, keeping its tie-break rank
    pub fn set_layer(&mut self, id: SourceId, layer: i32) -> Result<(), MixerError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(MixerError::UnknownSource(id))?;
        if record.layer == layer {
            return Ok(());
        }
        self.layers.remove(record.layer, record.generation);
        record.layer = layer;
        self.layers.insert(layer, record.generation, id);
        Ok(())
    }

    pub fn draw_order(&self) -> Vec<SourceId> {
        self.layers.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records whose source no longer exists. Returns the reaped ids.
    pub fn reap_dead(&mut self) -> Vec<SourceId> {
        let dead: Vec<SourceId> = self
            .records
            .iter()
            .filter(|(_, record)| !record.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.unregister(*id);
        }
        dead
    }

    /// Copy out every live, fresh frame in draw order
    pub fn snapshot(&self, now: Instant, stale_after: Duration) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for id in self.layers.iter() {
            let Some(record) = self.records.get(&id) else {
                continue;
            };
            let fresh = record
                .updated_at
                .is_some_and(|at| now.saturating_duration_since(at) <= stale_after);
            match (&record.frame, fresh) {
                (Some(frame), true) => snapshot.layers.push(Layer {
                    frame: frame.clone(),
                    transform: record.transform * record.orientation.matrix(),
                    blends: record.blends,
                }),
                _ => snapshot.skipped += 1,
            }
        }
        snapshot
    }

    /// Verify that the layer map and the table describe the same sources
    pub fn check_consistency(&self) -> Result<(), MixerError> {
        if self.layers.len() != self.records.len() {
            return Err(MixerError::CorruptLayerMap(format!(
                "{} layer entries for {} sources",
                self.layers.len(),
                self.records.len()
            )));
        }
        for (layer, generation, id) in self.layers.entries() {
            match self.records.get(&id) {
                Some(record) if record.layer == layer && record.generation == generation => {}
                Some(record) => {
                    return Err(MixerError::CorruptLayerMap(format!(
                        "source {} mapped at layer {} but recorded at layer {}",
                        id, layer, record.layer
                    )));
                }
                None => {
                    return Err(MixerError::CorruptLayerMap(format!(
                        "layer {} references unknown source {}",
                        layer, id
                    )));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self, id: SourceId) {
        self.layers.insert(i32::MIN, u64::MAX, id);
    }
}
