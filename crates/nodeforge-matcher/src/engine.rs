//! Generic constraint matching engine.
//!
//! One scan/sort/bind algorithm serves every resource class. A class plugs
//! in through [`ResourceKind`], which describes its identity pin, its sort
//! threshold and its threshold/equality/relational checks.
//!
//! Ordering is fully deterministic:
//! - requested items: pinned first (by pinned id ascending), then by
//!   threshold ascending with unconstrained items first;
//! - candidates: by id ascending, then by threshold ascending with unknown
//!   values first.
//!
//! Each requested item takes the **first** acceptable candidate in that
//! order, which then leaves the pool. Capacity classes take the shortest
//! acceptable prefix whose cumulative capacity reaches the request.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, trace};

use nodeforge_state::ResourceClass;

use crate::lookup::NeighborLookup;

/// A single declared constraint of a requested item, evaluated against one
/// candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check<'a> {
    /// `offered >= requested`.
    AtLeast {
        field: &'static str,
        requested: Option<u64>,
        offered: Option<u64>,
    },
    /// `offered == requested`.
    Equals {
        field: &'static str,
        requested: Option<&'a str>,
        offered: Option<&'a str>,
        ignore_case: bool,
    },
}

impl Check<'_> {
    pub fn field(&self) -> &'static str {
        match self {
            Check::AtLeast { field, .. } | Check::Equals { field, .. } => *field,
        }
    }

    /// Unconstrained requests always pass; a candidate lacking the attribute
    /// never satisfies a constrained request.
    pub fn passes(&self) -> bool {
        match *self {
            Check::AtLeast {
                requested, offered, ..
            } => match (requested, offered) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(want), Some(have)) => have >= want,
            },
            Check::Equals {
                requested,
                offered,
                ignore_case,
                ..
            } => match (requested, offered) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(want), Some(have)) if ignore_case => want.eq_ignore_ascii_case(have),
                (Some(want), Some(have)) => want == have,
            },
        }
    }
}

/// Outcome of a relational constraint that needs a catalog side lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Satisfied,
    Unsatisfied(&'static str),
}

/// How many candidates one requested item may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Exactly one candidate.
    Single,
    /// Minimal prefix reaching the requested threshold cumulatively.
    Cumulative,
}

/// Per-class constraint table.
pub trait ResourceKind {
    type Requested;
    type Available: Clone;

    const CLASS: ResourceClass;
    const SELECTION: Selection;
    /// Name of the field used as the sort threshold.
    const THRESHOLD_FIELD: &'static str;

    fn pinned(requested: &Self::Requested) -> Option<&str>;
    fn requested_threshold(requested: &Self::Requested) -> Option<u64>;

    fn available_id(available: &Self::Available) -> &str;
    fn offered_threshold(available: &Self::Available) -> Option<u64>;

    /// Threshold and equality checks. For cumulative classes the capacity
    /// threshold is excluded; it is applied across the selected prefix.
    fn checks<'a>(requested: &'a Self::Requested, available: &'a Self::Available) -> Vec<Check<'a>>;

    fn relation(
        _requested: &Self::Requested,
        _available: &Self::Available,
        _lookup: &dyn NeighborLookup,
    ) -> Relation {
        Relation::Satisfied
    }
}

/// Why a requested item found no candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmetConstraint {
    /// The candidate pool was empty.
    NoCandidates,
    /// The pinned resource is not among the free candidates.
    PinnedUnavailable { id: String },
    /// No candidate satisfies this single constraint.
    Field(&'static str),
    /// No candidate satisfies the relational constraint.
    Relation(&'static str),
    /// Each constraint is satisfiable on its own, but no candidate meets all.
    Combined,
    /// Acceptable candidates exist but their total capacity falls short.
    InsufficientCapacity { requested: u64, available: u64 },
}

impl fmt::Display for UnmetConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnmetConstraint::NoCandidates => f.write_str("no free candidates"),
            UnmetConstraint::PinnedUnavailable { id } => {
                write!(f, "pinned resource {id} is not available")
            }
            UnmetConstraint::Field(field) => write!(f, "no candidate satisfies {field}"),
            UnmetConstraint::Relation(what) => write!(f, "no candidate has a {what}"),
            UnmetConstraint::Combined => f.write_str("no candidate satisfies all constraints"),
            UnmetConstraint::InsufficientCapacity {
                requested,
                available,
            } => write!(
                f,
                "requested capacity {requested} exceeds matching capacity {available}"
            ),
        }
    }
}

/// Candidates bound to one requested item.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding<A> {
    /// Position of the item in the caller's request list.
    pub requested_index: usize,
    pub resources: Vec<A>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmatched {
    pub requested_index: usize,
    pub reason: UnmetConstraint,
}

/// Result of one matcher run for one class.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationMapping<A> {
    pub class: ResourceClass,
    /// In the order the items were matched.
    pub bindings: Vec<Binding<A>>,
    /// In the order the items were attempted.
    pub unmatched: Vec<Unmatched>,
}

impl<A> AllocationMapping<A> {
    pub fn is_complete(&self) -> bool {
        self.unmatched.is_empty()
    }

    pub fn first_unmet(&self) -> Option<&Unmatched> {
        self.unmatched.first()
    }

    /// Every bound resource, across all bindings.
    pub fn resources(&self) -> impl Iterator<Item = &A> {
        self.bindings.iter().flat_map(|b| b.resources.iter())
    }

    pub fn binding_for(&self, requested_index: usize) -> Option<&Binding<A>> {
        self.bindings
            .iter()
            .find(|b| b.requested_index == requested_index)
    }
}

/// `None` sorts before any value.
fn cmp_optional(a: Option<u64>, b: Option<u64>) -> Ordering {
    a.cmp(&b)
}

/// Pinned ids ascending, unpinned last.
fn cmp_pins(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Order in which requested items are matched (indices into `requested`).
pub fn requested_order<K: ResourceKind>(requested: &[K::Requested]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..requested.len()).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (&requested[a], &requested[b]);
        cmp_pins(K::pinned(ra), K::pinned(rb))
            .then_with(|| cmp_optional(K::requested_threshold(ra), K::requested_threshold(rb)))
    });
    order
}

/// Sort candidates into scan order.
pub fn sort_candidates<K: ResourceKind>(available: &mut [K::Available]) {
    available.sort_by(|a, b| {
        K::available_id(a)
            .cmp(K::available_id(b))
            .then_with(|| cmp_optional(K::offered_threshold(a), K::offered_threshold(b)))
    });
}

fn acceptable<K: ResourceKind>(
    requested: &K::Requested,
    candidate: &K::Available,
    lookup: &dyn NeighborLookup,
) -> bool {
    K::checks(requested, candidate).iter().all(Check::passes)
        && K::relation(requested, candidate, lookup) == Relation::Satisfied
}

/// Match `requested` items against `available` candidates.
///
/// Never fails: items without a candidate are reported in
/// [`AllocationMapping::unmatched`] and the caller decides the policy.
pub fn match_resources<K: ResourceKind>(
    requested: &[K::Requested],
    mut available: Vec<K::Available>,
    lookup: &dyn NeighborLookup,
) -> AllocationMapping<K::Available> {
    sort_candidates::<K>(&mut available);
    let mut pool = available;
    let mut mapping = AllocationMapping {
        class: K::CLASS,
        bindings: Vec::new(),
        unmatched: Vec::new(),
    };

    for index in requested_order::<K>(requested) {
        let item = &requested[index];
        let outcome = match K::pinned(item) {
            Some(id) => take_pinned::<K>(&mut pool, id),
            None => match K::SELECTION {
                Selection::Single => take_first::<K>(&mut pool, item, lookup),
                Selection::Cumulative => take_prefix::<K>(&mut pool, item, lookup),
            },
        };
        match outcome {
            Ok(resources) => {
                debug!(
                    class = %K::CLASS,
                    requested_index = index,
                    bound = ?resources.iter().map(K::available_id).collect::<Vec<_>>(),
                    "requested item matched"
                );
                mapping.bindings.push(Binding {
                    requested_index: index,
                    resources,
                });
            }
            Err(reason) => {
                debug!(
                    class = %K::CLASS,
                    requested_index = index,
                    %reason,
                    "requested item unmatched"
                );
                mapping.unmatched.push(Unmatched {
                    requested_index: index,
                    reason,
                });
            }
        }
    }

    mapping
}

fn take_pinned<K: ResourceKind>(
    pool: &mut Vec<K::Available>,
    id: &str,
) -> Result<Vec<K::Available>, UnmetConstraint> {
    match pool.iter().position(|c| K::available_id(c) == id) {
        Some(pos) => Ok(vec![pool.remove(pos)]),
        None => Err(UnmetConstraint::PinnedUnavailable { id: id.to_string() }),
    }
}

fn take_first<K: ResourceKind>(
    pool: &mut Vec<K::Available>,
    item: &K::Requested,
    lookup: &dyn NeighborLookup,
) -> Result<Vec<K::Available>, UnmetConstraint> {
    match pool.iter().position(|c| acceptable::<K>(item, c, lookup)) {
        Some(pos) => Ok(vec![pool.remove(pos)]),
        None => Err(diagnose::<K>(pool, item, lookup)),
    }
}

fn take_prefix<K: ResourceKind>(
    pool: &mut Vec<K::Available>,
    item: &K::Requested,
    lookup: &dyn NeighborLookup,
) -> Result<Vec<K::Available>, UnmetConstraint> {
    let Some(needed) = K::requested_threshold(item) else {
        // Unconstrained capacity: at most one candidate.
        return take_first::<K>(pool, item, lookup);
    };

    let mut chosen: Vec<usize> = Vec::new();
    let mut total: u64 = 0;
    for (pos, candidate) in pool.iter().enumerate() {
        if total >= needed {
            break;
        }
        let Some(capacity) = K::offered_threshold(candidate) else {
            continue;
        };
        if !acceptable::<K>(item, candidate, lookup) {
            continue;
        }
        trace!(class = %K::CLASS, candidate = K::available_id(candidate), capacity, "prefix candidate");
        chosen.push(pos);
        total = total.saturating_add(capacity);
    }

    if chosen.is_empty() {
        if pool.iter().any(|c| acceptable::<K>(item, c, lookup)) {
            // Acceptable candidates exist, but none reports a capacity.
            return Err(UnmetConstraint::Field(K::THRESHOLD_FIELD));
        }
        return Err(diagnose::<K>(pool, item, lookup));
    }
    if total < needed {
        return Err(UnmetConstraint::InsufficientCapacity {
            requested: needed,
            available: total,
        });
    }

    // Remove back to front so earlier positions stay valid, then restore
    // scan order.
    let mut taken: Vec<K::Available> = chosen.iter().rev().map(|&pos| pool.remove(pos)).collect();
    taken.reverse();
    Ok(taken)
}

/// Explain why no candidate in `pool` accepts `item`.
fn diagnose<K: ResourceKind>(
    pool: &[K::Available],
    item: &K::Requested,
    lookup: &dyn NeighborLookup,
) -> UnmetConstraint {
    let Some(first) = pool.first() else {
        return UnmetConstraint::NoCandidates;
    };

    let field_count = K::checks(item, first).len();
    for field_index in 0..field_count {
        let satisfiable = pool
            .iter()
            .any(|c| K::checks(item, c).get(field_index).is_some_and(Check::passes));
        if !satisfiable {
            return UnmetConstraint::Field(K::checks(item, first)[field_index].field());
        }
    }

    let mut relation_failure = None;
    for candidate in pool {
        match K::relation(item, candidate, lookup) {
            Relation::Satisfied => {
                relation_failure = None;
                break;
            }
            Relation::Unsatisfied(what) => {
                relation_failure.get_or_insert(what);
            }
        }
    }
    match relation_failure {
        Some(what) => UnmetConstraint::Relation(what),
        None => UnmetConstraint::Combined,
    }
}
