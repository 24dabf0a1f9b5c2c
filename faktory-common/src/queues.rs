//! Produces the list of queue names passed to each `FETCH`.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::thread_rng;

/// A single `-q` specification: a bare name (ordered mode) or a
/// `name,weight` pair (weighted mode).
#[derive(Debug, Clone)]
pub enum QueueEntry {
    Named(String),
    Weighted(String, u32),
}

/// Error returned when ordered and weighted queue specifications are mixed.
#[derive(Debug, thiserror::Error)]
#[error("cannot mix ordered and weighted queue specifications")]
pub struct MixedQueueSpecError;

/// Either a fixed, strictly-ordered queue list, or a weighted map shuffled
/// on every call.
#[derive(Debug, Clone)]
pub enum QueueSelector {
    Ordered(Vec<String>),
    Weighted(HashMap<String, u32>),
}

impl QueueSelector {
    /// Build a selector from the repeated `-q` entries a CLI or config
    /// layer collects. An empty list of entries yields `["default"]`.
    /// Mixing `Named` and `Weighted` entries is a configuration error.
    pub fn from_entries(entries: Vec<QueueEntry>) -> Result<Self, MixedQueueSpecError> {
        if entries.is_empty() {
            return Ok(QueueSelector::Ordered(vec!["default".to_owned()]));
        }

        let all_named = entries.iter().all(|e| matches!(e, QueueEntry::Named(_)));
        let all_weighted = entries
            .iter()
            .all(|e| matches!(e, QueueEntry::Weighted(_, _)));

        if all_named {
            Ok(QueueSelector::Ordered(
                entries
                    .into_iter()
                    .map(|e| match e {
                        QueueEntry::Named(name) => name,
                        QueueEntry::Weighted(..) => unreachable!(),
                    })
                    .collect(),
            ))
        } else if all_weighted {
            let mut weights = HashMap::new();
            for entry in entries {
                if let QueueEntry::Weighted(name, weight) = entry {
                    *weights.entry(name).or_insert(0) += weight;
                }
            }
            Ok(QueueSelector::Weighted(weights))
        } else {
            Err(MixedQueueSpecError)
        }
    }

    pub fn ordered(queues: Vec<String>) -> Self {
        if queues.is_empty() {
            QueueSelector::Ordered(vec!["default".to_owned()])
        } else {
            QueueSelector::Ordered(queues)
        }
    }

    pub fn weighted(weights: HashMap<String, u32>) -> Self {
        if weights.is_empty() {
            QueueSelector::Ordered(vec!["default".to_owned()])
        } else {
            QueueSelector::Weighted(weights)
        }
    }

    /// The queue list to pass to the next `FETCH`. In ordered mode this is
    /// always the same list; in weighted mode it is a fresh Fisher–Yates
    /// shuffle of a "drum" containing each queue replicated by its weight,
    /// deduplicated down to first occurrence so relative frequency is
    /// preserved without repeating names in the FETCH argument list.
    pub fn queues(&self) -> Vec<String> {
        match self {
            QueueSelector::Ordered(queues) => queues.clone(),
            QueueSelector::Weighted(weights) => shuffled_unique_order(weights),
        }
    }
}

fn shuffled_unique_order(weights: &HashMap<String, u32>) -> Vec<String> {
    let mut drum: Vec<&str> = Vec::new();
    for (name, weight) in weights {
        for _ in 0..*weight.max(&1) {
            drum.push(name.as_str());
        }
    }
    drum.shuffle(&mut thread_rng());

    let mut seen = std::collections::HashSet::new();
    let mut order = Vec::with_capacity(weights.len());
    for name in drum {
        if seen.insert(name) {
            order.push(name.to_owned());
        }
    }
    order
}
