//! Deterministic, lock-free partitioning of a job's sub-tasks.
//!
//! Agents working the same backlog never coordinate at runtime. Each
//! one takes every element whose position modulo `total` equals its own
//! index, so the slices are disjoint and together cover the input
//! exactly once. A second axis, [`Responsibility`], removes whole
//! categories from an agent; [`plan`] then splits each category only
//! among the agents that cover it.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Modulo split
// ---------------------------------------------------------------------------

/// Every element of `items` whose position modulo `total` equals `index`.
///
/// # Examples
///
/// ```
/// use reelforge_core::partition::assign;
///
/// let scenes = [0, 1, 2, 3, 4, 5, 6];
/// assert_eq!(assign(&scenes, 0, 2), vec![0, 2, 4, 6]);
/// assert_eq!(assign(&scenes, 1, 2), vec![1, 3, 5]);
/// ```
pub fn assign<T: Clone>(items: &[T], index: usize, total: usize) -> Vec<T> {
    if total == 0 {
        return Vec::new();
    }
    items
        .iter()
        .enumerate()
        .filter(|(pos, _)| pos % total == index)
        .map(|(_, item)| item.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Categories and responsibility
// ---------------------------------------------------------------------------

/// What a sub-task produces, derived from its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskCategory {
    Character,
    Location,
    Scene,
}

impl SubtaskCategory {
    /// `nv*` ids are characters, `loc*` locations, anything else a scene.
    pub fn from_id(id: &str) -> Self {
        let lower = id.to_ascii_lowercase();
        if lower.starts_with("nv") {
            SubtaskCategory::Character
        } else if lower.starts_with("loc") {
            SubtaskCategory::Location
        } else {
            SubtaskCategory::Scene
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, SubtaskCategory::Character | SubtaskCategory::Location)
    }
}

/// Which categories an agent is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responsibility {
    #[default]
    All,
    ReferencesOnly,
    ScenesOnly,
}

impl Responsibility {
    pub fn covers(&self, category: SubtaskCategory) -> bool {
        match self {
            Responsibility::All => true,
            Responsibility::ReferencesOnly => category.is_reference(),
            Responsibility::ScenesOnly => !category.is_reference(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Responsibility::All),
            "references" | "references_only" => Some(Responsibility::ReferencesOnly),
            "scenes" | "scenes_only" => Some(Responsibility::ScenesOnly),
            _ => None,
        }
    }
}

/// Split `items` across slots with the given responsibilities.
///
/// Items are pooled by the set of slots covering their category, in
/// input order. Each pool is split by position modulo the number of
/// covering slots, and a slot's index is its rank among those slots.
/// When every slot covers everything this is exactly [`assign`] per
/// slot. Items no slot covers are left out. `id_of` extracts the id used
/// for the category predicate.
///
/// # Examples
///
/// ```
/// use reelforge_core::partition::{plan, Responsibility};
///
/// let ids = ["nv1", "loc1", "1", "2", "3"];
/// let shares = plan(&ids, &[Responsibility::All, Responsibility::ScenesOnly], |s| *s);
/// assert_eq!(shares[0], vec!["nv1", "loc1", "1", "3"]);
/// assert_eq!(shares[1], vec!["2"]);
/// ```
pub fn plan<T, F>(items: &[T], responsibilities: &[Responsibility], id_of: F) -> Vec<Vec<T>>
where
    T: Clone,
    F: Fn(&T) -> &str,
{
    let mut shares: Vec<Vec<T>> = vec![Vec::new(); responsibilities.len()];
    // covering slots -> items seen so far in that pool
    let mut pools: Vec<(Vec<usize>, usize)> = Vec::new();

    for item in items {
        let category = SubtaskCategory::from_id(id_of(item));
        let covering: Vec<usize> = responsibilities
            .iter()
            .enumerate()
            .filter(|(_, r)| r.covers(category))
            .map(|(slot, _)| slot)
            .collect();
        if covering.is_empty() {
            continue;
        }

        let position = match pools.iter_mut().find(|(slots, _)| *slots == covering) {
            Some((_, seen)) => {
                *seen += 1;
                *seen - 1
            }
            None => {
                pools.push((covering.clone(), 1));
                0
            }
        };
        shares[covering[position % covering.len()]].push(item.clone());
    }
    shares
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
