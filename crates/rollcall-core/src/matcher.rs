//! Matching a live encoding against the enrolled references.

use crate::encodings::EncodingStore;
use crate::types::{Embedding, Identity};

/// Default maximum Euclidean distance for two encodings to be the same person.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Outcome of matching one live encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Known {
        identity: Identity,
        /// Distance to the reference that was selected.
        distance: f32,
        /// Enumeration index of that reference in the store.
        reference: usize,
    },
    Unknown,
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchOutcome::Known { identity, .. } => Some(identity),
            MatchOutcome::Unknown => None,
        }
    }
}

/// Strategy for comparing a live encoding against the store.
pub trait Matcher: Send + Sync {
    fn compare(&self, live: &Embedding, store: &EncodingStore, tolerance: f32) -> MatchOutcome;
}

/// Returns the first reference within tolerance, in enumeration order.
///
/// Known limitation: a closer reference enumerated later is ignored. Kept
/// as the default so attendance recorded by earlier deployments is
/// reproduced exactly.
pub struct FirstMatch;

impl Matcher for FirstMatch {
    fn compare(&self, live: &Embedding, store: &EncodingStore, tolerance: f32) -> MatchOutcome {
        store
            .iter()
            .enumerate()
            .map(|(i, (id, reference))| (i, id, live.euclidean_distance(reference)))
            .find(|(_, _, distance)| *distance <= tolerance)
            .map(|(reference, identity, distance)| MatchOutcome::Known {
                identity: identity.clone(),
                distance,
                reference,
            })
            .unwrap_or(MatchOutcome::Unknown)
    }
}

/// Returns the closest reference within tolerance. Ties keep the earlier one.
pub struct NearestMatch;

impl Matcher for NearestMatch {
    fn compare(&self, live: &Embedding, store: &EncodingStore, tolerance: f32) -> MatchOutcome {
        let mut best: Option<(usize, &Identity, f32)> = None;

        for (i, (id, reference)) in store.iter().enumerate() {
            let distance = live.euclidean_distance(reference);
            if distance > tolerance {
                continue;
            }
            let is_better = match best {
                None => true,
                Some((_, _, d)) => distance < d,
            };
            if is_better {
                best = Some((i, id, distance));
            }
        }

        match best {
            Some((reference, identity, distance)) => MatchOutcome::Known {
                identity: identity.clone(),
                distance,
                reference,
            },
            None => MatchOutcome::Unknown,
        }
    }
}

/// Matcher selection by configured policy name (`first` or `nearest`).
pub fn matcher_for_policy(policy: &str) -> Option<Box<dyn Matcher>> {
    match policy {
        "first" => Some(Box::new(FirstMatch)),
        "nearest" => Some(Box::new(NearestMatch)),
        _ => None,
    }
}
