//! Candidate Selection
//!
//! Turns per-search-term candidate lists into one balanced list for the
//! scheduler, so a single popular term cannot crowd out the others.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use super::task::AcquisitionCandidate;

/// Candidates found for one search term
#[derive(Debug, Clone)]
pub struct CandidateGroup<C> {
    pub term: String,
    pub candidates: Vec<C>,
}

impl<C> CandidateGroup<C> {
    pub fn new(term: impl Into<String>, candidates: Vec<C>) -> Self {
        Self {
            term: term.into(),
            candidates,
        }
    }
}

/// How many candidates each term may contribute.
///
/// Enough for an even share of the target plus one spare, at least one.
pub fn per_term_limit(target: f64, ceiling: f64, terms: usize) -> usize {
    if terms == 0 {
        return 0;
    }
    if ceiling <= 0.0 {
        return usize::MAX;
    }
    let share = (target / ceiling / terms as f64).floor() + 1.0;
    if share.is_finite() && share > 1.0 {
        share as usize
    } else {
        1
    }
}

/// Selects a balanced candidate list, shuffling with the thread RNG if asked
pub fn select_balanced<C: AcquisitionCandidate>(
    groups: Vec<CandidateGroup<C>>,
    target: f64,
    ceiling: f64,
    shuffle: bool,
) -> Vec<C> {
    if shuffle {
        select_balanced_with(groups, target, ceiling, Some(&mut rand::thread_rng()))
    } else {
        select_balanced_with::<C, rand::rngs::ThreadRng>(groups, target, ceiling, None)
    }
}

/// [`select_balanced`] with an explicit RNG
pub fn select_balanced_with<C, R>(
    groups: Vec<CandidateGroup<C>>,
    target: f64,
    ceiling: f64,
    mut rng: Option<&mut R>,
) -> Vec<C>
where
    C: AcquisitionCandidate,
    R: Rng + ?Sized,
{
    // First term to list a key keeps it.
    let mut seen = HashSet::new();
    let groups: Vec<CandidateGroup<C>> = groups
        .into_iter()
        .filter_map(|group| {
            let term = group.term;
            let unique: Vec<C> = group
                .candidates
                .into_iter()
                .filter(|c| seen.insert(c.key().to_string()))
                .collect();
            if unique.is_empty() {
                debug!(term = %term, "No unique candidates");
                None
            } else {
                Some(CandidateGroup::new(term, unique))
            }
        })
        .collect();

    let limit = per_term_limit(target, ceiling, groups.len());
    let mut selected = Vec::new();
    for mut group in groups {
        if let Some(rng) = rng.as_deref_mut() {
            group.candidates.shuffle(rng);
        }
        selected.extend(group.candidates.into_iter().take(limit));
    }

    if let Some(rng) = rng.as_deref_mut() {
        selected.shuffle(rng);
    }

    info!(
        "Selected {} candidates ({} per term max, {} unique keys)",
        selected.len(),
        limit,
        seen.len()
    );
    selected
}
