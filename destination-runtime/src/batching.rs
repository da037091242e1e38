//! Groups payloads into batches.
//!
//! Items are grouped by (destination, action, settings fingerprint). Groups
//! come out in the order their first item arrived; inside a group arrival
//! order is kept and items are cut greedily into chunks of the batch size.

use actionkit::{Payload, SettingsFingerprint};
use serde_json::Value;

/// Payload key that turns batching on for an event.
pub const ENABLE_BATCHING_FIELD: &str = "enable_batching";
/// Payload key that overrides the batch size.
pub const BATCH_SIZE_FIELD: &str = "batch_size";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub destination: String,
    pub action: String,
    pub fingerprint: SettingsFingerprint,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Batch<T> {
    pub key: BatchKey,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct BatchCoordinator {
    default_batch_size: usize,
}

impl BatchCoordinator {
    pub fn new(default_batch_size: usize) -> Self {
        Self {
            default_batch_size: default_batch_size.max(1),
        }
    }

    /// Splits `arrivals` into batches; `size_for` picks the size of a group
    /// from its first item, falling back to the coordinator default.
    pub fn plan<T, F>(&self, arrivals: Vec<(BatchKey, T)>, size_for: F) -> Vec<Batch<T>>
    where
        F: Fn(&BatchKey, &T) -> Option<usize>,
    {
        plan(arrivals, self.default_batch_size, size_for)
    }
}

fn plan<T, F>(arrivals: Vec<(BatchKey, T)>, default_size: usize, size_for: F) -> Vec<Batch<T>>
where
    F: Fn(&BatchKey, &T) -> Option<usize>,
{
    let mut groups: Vec<(BatchKey, usize, Vec<T>)> = Vec::new();
    for (key, item) in arrivals {
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, items)) => items.push(item),
            None => {
                let size = size_for(&key, &item).unwrap_or(default_size).max(1);
                groups.push((key, size, vec![item]));
            }
        }
    }

    let mut batches = Vec::new();
    for (key, size, items) in groups {
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<T> = items.by_ref().take(size).collect();
            batches.push(Batch {
                key: key.clone(),
                items: chunk,
            });
        }
    }
    batches
}

/// Whether the resolved payload asks for batching.
pub fn batching_enabled(payload: &Payload) -> bool {
    matches!(payload.get(ENABLE_BATCHING_FIELD), Some(Value::Bool(true)))
}

/// Batch size requested by the resolved payload, if any.
pub fn batch_size_of(payload: &Payload) -> Option<usize> {
    payload
        .get(BATCH_SIZE_FIELD)
        .and_then(Value::as_u64)
        .filter(|size| *size > 0)
        .and_then(|size| usize::try_from(size).ok())
}
