//! Splitting entity streams into duplicate-free batches.
//!
//! The broker's batch update endpoint rejects a batch that mentions the same
//! id twice, while collectors routinely emit several rows for one id (one
//! per day, say). `split_batches` walks the stream once and cuts a new batch
//! whenever the next id is already in the current one, so relative order is
//! preserved and a batch is only as short as the duplicates force it to be.

use std::collections::HashSet;

use serde_json::Value;

use crate::entity::Entity;

/// Anything that carries an entity id.
pub trait EntityId {
    fn entity_id(&self) -> &str;
}

impl EntityId for Entity {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

/// Raw JSON entities; a missing or non-string id counts as the empty id.
impl EntityId for Value {
    fn entity_id(&self) -> &str {
        self.get("id").and_then(Value::as_str).unwrap_or_default()
    }
}

/// Lazily split `entities` into batches with no repeated id.
pub fn split_batches<I>(entities: I) -> SplitBatches<I::IntoIter>
where
    I: IntoIterator,
    I::Item: EntityId,
{
    SplitBatches {
        inner: entities.into_iter(),
        carry: None,
    }
}

/// Iterator returned by [`split_batches`].
#[derive(Debug)]
pub struct SplitBatches<I: Iterator> {
    inner: I,
    // The entity that closed the previous batch; it opens the next one.
    carry: Option<I::Item>,
}

impl<I> Iterator for SplitBatches<I>
where
    I: Iterator,
    I::Item: EntityId,
{
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::new();
        let mut seen = HashSet::new();
        if let Some(first) = self.carry.take() {
            seen.insert(first.entity_id().to_string());
            batch.push(first);
        }
        for item in self.inner.by_ref() {
            if seen.contains(item.entity_id()) {
                self.carry = Some(item);
                return Some(batch);
            }
            seen.insert(item.entity_id().to_string());
            batch.push(item);
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Interleave several streams round-robin: the first item of each stream,
/// then the second of each, and so on, dropping streams as they run dry.
///
/// Feeding one `batch` call from several producers this way mixes their ids,
/// which keeps batches long when each producer repeats its own ids.
pub fn rotate<I>(streams: impl IntoIterator<Item = I>) -> Rotate<I::IntoIter>
where
    I: IntoIterator,
{
    Rotate {
        streams: streams.into_iter().map(IntoIterator::into_iter).collect(),
        cursor: 0,
    }
}

/// Iterator returned by [`rotate`].
#[derive(Debug)]
pub struct Rotate<I> {
    streams: Vec<I>,
    cursor: usize,
}

impl<I: Iterator> Iterator for Rotate<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.streams.is_empty() {
            if self.cursor >= self.streams.len() {
                self.cursor = 0;
            }
            match self.streams[self.cursor].next() {
                Some(item) => {
                    self.cursor += 1;
                    return Some(item);
                }
                None => {
                    self.streams.remove(self.cursor);
                }
            }
        }
        None
    }
}
