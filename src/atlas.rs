//! Routing atlas (C5, spec §4.5): the cluster's map from `(agent, role)`
//! to the place(s) currently serving it, plus the shard arithmetic used to
//! partition deployments across a fixed number of workers/nodes.
//!
//! Two instantiations share one shape (spec §4.5 "the same index structure
//! at both scopes"): a per-node [`LocalAtlas`] mapping to [`WorkerId`]s,
//! and a cluster-wide [`GlobalAtlas`] mapping to [`NodeId`]s.

use crate::error::SchematError;
use crate::ids::{Fid, NodeId, ObjectId, Role, WorkerId};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// A location an agent's frame can run at: a worker index within a node,
/// or a node index within the cluster.
pub trait Place: Copy + Eq + Hash + Ord + Send + Sync + std::fmt::Debug + 'static {}

impl Place for WorkerId {}
impl Place for NodeId {}

/// One entry in the atlas: where a specific frame for `(object_id, role)`
/// currently lives, and a load estimate used to rank candidates.
///
/// `fid` is `None` for *special* records: the synthetic self-records a
/// [`LocalAtlas`]/[`GlobalAtlas`] seeds for a node's own `$master`/`$worker`
/// pseudo-agents (spec §4.5 "Routing record"). Special records answer
/// lookups but never participate in [`Atlas::rank_places`] and are never
/// removed via [`Atlas::remove_by_fid`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord<P: Place> {
    /// The frame this record describes, or `None` for a special record.
    pub fid: Option<Fid>,
    /// The agent's object id.
    pub object_id: ObjectId,
    /// The role this frame serves.
    pub role: Role,
    /// Where the frame is running.
    pub place: P,
    /// Approximate current load (in-flight call count), used to break
    /// ties when more than one place can serve a request.
    pub load: u32,
}

/// The routing atlas contract shared by [`LocalAtlas`] and [`GlobalAtlas`]
/// (spec §4.5).
pub trait Atlas<P: Place>: Send + Sync {
    /// Registers or replaces a frame's routing record.
    fn insert(&self, record: RoutingRecord<P>);

    /// Removes a frame's record, e.g. once it has fully stopped.
    fn remove_by_fid(&self, fid: Fid);

    /// Looks up a record by frame id.
    fn by_fid(&self, fid: Fid) -> Option<RoutingRecord<P>>;

    /// All records for an agent, across every role.
    fn by_id(&self, object_id: ObjectId) -> Vec<RoutingRecord<P>>;

    /// All records for an agent under a specific role.
    fn by_id_role(&self, object_id: ObjectId, role: &Role) -> Vec<RoutingRecord<P>>;

    /// Candidate places for `(object_id, role)`, ranked least-loaded
    /// first (spec §4.5 "the atlas breaks ties by current load, not
    /// round-robin or hashing"), excluding special (fid-less) self-records.
    fn rank_places(&self, object_id: ObjectId, role: &Role) -> Vec<P> {
        let mut records: Vec<_> = self
            .by_id_role(object_id, role)
            .into_iter()
            .filter(|r| r.fid.is_some())
            .collect();
        records.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.place.cmp(&b.place)));
        records.into_iter().map(|r| r.place).collect()
    }
}

/// An `Atlas` backed by three concurrent indexes, generic over the place
/// type so [`LocalAtlas`] and [`GlobalAtlas`] share one implementation.
/// `home` is this atlas's own place: queries return `home`'s records
/// first (spec §4.5 "Lookups by `(id, role)` return records ordered with
/// the priority place first").
struct IndexedAtlas<P: Place> {
    home: P,
    by_fid: DashMap<Fid, RoutingRecord<P>>,
    by_id: DashMap<ObjectId, DashSet<Fid>>,
    by_id_role: DashMap<(ObjectId, Role), DashSet<Fid>>,
    special: DashMap<(ObjectId, Role), RoutingRecord<P>>,
}

impl<P: Place> IndexedAtlas<P> {
    fn new(home: P) -> Self {
        Self {
            home,
            by_fid: DashMap::new(),
            by_id: DashMap::new(),
            by_id_role: DashMap::new(),
            special: DashMap::new(),
        }
    }

    fn insert(&self, record: RoutingRecord<P>) {
        let Some(fid) = record.fid else {
            self.special.insert((record.object_id, record.role.clone()), record);
            return;
        };
        let object_id = record.object_id;
        let role = record.role.clone();
        self.by_id.entry(object_id).or_default().insert(fid);
        self.by_id_role.entry((object_id, role)).or_default().insert(fid);
        self.by_fid.insert(fid, record);
    }

    fn remove_by_fid(&self, fid: Fid) {
        if let Some((_, record)) = self.by_fid.remove(&fid) {
            if let Some(set) = self.by_id.get(&record.object_id) {
                set.remove(&fid);
            }
            if let Some(set) = self.by_id_role.get(&(record.object_id, record.role.clone())) {
                set.remove(&fid);
            }
        }
    }

    fn by_fid_lookup(&self, fid: Fid) -> Option<RoutingRecord<P>> {
        self.by_fid.get(&fid).map(|e| e.value().clone())
    }

    /// Puts records whose place is this atlas's `home` first, preserving
    /// relative order otherwise (spec §4.5 atlas priority).
    fn priority_first(&self, mut records: Vec<RoutingRecord<P>>) -> Vec<RoutingRecord<P>> {
        records.sort_by_key(|r| r.place != self.home);
        records
    }

    fn by_id_lookup(&self, object_id: ObjectId) -> Vec<RoutingRecord<P>> {
        let mut records: Vec<RoutingRecord<P>> = self
            .by_id
            .get(&object_id)
            .map(|set| set.iter().filter_map(|fid| self.by_fid_lookup(*fid)).collect())
            .unwrap_or_default();
        records.extend(
            self.special
                .iter()
                .filter(|e| e.key().0 == object_id)
                .map(|e| e.value().clone()),
        );
        self.priority_first(records)
    }

    fn by_id_role_lookup(&self, object_id: ObjectId, role: &Role) -> Vec<RoutingRecord<P>> {
        let mut records: Vec<RoutingRecord<P>> = self
            .by_id_role
            .get(&(object_id, role.clone()))
            .map(|set| set.iter().filter_map(|fid| self.by_fid_lookup(*fid)).collect())
            .unwrap_or_default();
        if let Some(special) = self.special.get(&(object_id, role.clone())) {
            records.push(special.value().clone());
        }
        self.priority_first(records)
    }
}

/// Per-node atlas: `(object_id, role)` to the [`WorkerId`] hosting it.
pub struct LocalAtlas(IndexedAtlas<WorkerId>);

impl Default for LocalAtlas {
    fn default() -> Self {
        Self(IndexedAtlas::new(WorkerId::new(0)))
    }
}

impl LocalAtlas {
    /// Seeds a local atlas whose priority place is `worker_id`, with a
    /// fid-less self-record for the node's own `$master` pseudo-agent at
    /// place 0 (spec §4.5 "`LocalAtlas(node)` seeds itself with every
    /// agent row in `node.agents` and additionally adds a synthetic
    /// `{node, worker:0, id:node.id, role:"$master"}` record without
    /// `fid`"). The caller still inserts `node.agents`' own rows via
    /// [`Atlas::insert`] as they start.
    #[must_use]
    pub fn new(worker_id: WorkerId, node_id: NodeId) -> Self {
        let atlas = Self(IndexedAtlas::new(worker_id));
        atlas.insert(RoutingRecord {
            fid: None,
            object_id: ObjectId::new(u64::from(u32::from(node_id))),
            role: Role::master(),
            place: WorkerId::new(0),
            load: 0,
        });
        atlas
    }
}

impl Atlas<WorkerId> for LocalAtlas {
    fn insert(&self, record: RoutingRecord<WorkerId>) {
        self.0.insert(record);
    }

    fn remove_by_fid(&self, fid: Fid) {
        self.0.remove_by_fid(fid);
    }

    fn by_fid(&self, fid: Fid) -> Option<RoutingRecord<WorkerId>> {
        self.0.by_fid_lookup(fid)
    }

    fn by_id(&self, object_id: ObjectId) -> Vec<RoutingRecord<WorkerId>> {
        self.0.by_id_lookup(object_id)
    }

    fn by_id_role(&self, object_id: ObjectId, role: &Role) -> Vec<RoutingRecord<WorkerId>> {
        self.0.by_id_role_lookup(object_id, role)
    }
}

/// Cluster-wide atlas: `(object_id, role)` to the [`NodeId`] hosting it.
pub struct GlobalAtlas(IndexedAtlas<NodeId>);

impl Default for GlobalAtlas {
    fn default() -> Self {
        Self(IndexedAtlas::new(NodeId::new(0)))
    }
}

impl GlobalAtlas {
    /// Seeds a global atlas whose priority place is `home`, with fid-less
    /// self-records for every node in `nodes` under both `$master` and
    /// `$worker` (spec §4.5 "`GlobalAtlas(nodes)` seeds itself with the
    /// union of all nodes' agent rows plus, for each node, synthetic
    /// master/worker self-records").
    #[must_use]
    pub fn new(home: NodeId, nodes: &[NodeId]) -> Self {
        let atlas = Self(IndexedAtlas::new(home));
        for &node in nodes {
            let object_id = ObjectId::new(u64::from(u32::from(node)));
            atlas.insert(RoutingRecord {
                fid: None,
                object_id,
                role: Role::master(),
                place: node,
                load: 0,
            });
            atlas.insert(RoutingRecord {
                fid: None,
                object_id,
                role: Role::worker(),
                place: node,
                load: 0,
            });
        }
        atlas
    }
}

impl Atlas<NodeId> for GlobalAtlas {
    fn insert(&self, record: RoutingRecord<NodeId>) {
        self.0.insert(record);
    }

    fn remove_by_fid(&self, fid: Fid) {
        self.0.remove_by_fid(fid);
    }

    fn by_fid(&self, fid: Fid) -> Option<RoutingRecord<NodeId>> {
        self.0.by_fid_lookup(fid)
    }

    fn by_id(&self, object_id: ObjectId) -> Vec<RoutingRecord<NodeId>> {
        self.0.by_id_lookup(object_id)
    }

    fn by_id_role(&self, object_id: ObjectId, role: &Role) -> Vec<RoutingRecord<NodeId>> {
        self.0.by_id_role_lookup(object_id, role)
    }
}

/// A congruence class `{ n : n % base == offset }`, the unit of static
/// deployment partitioning (spec §4.5 "Shard").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Modulus. Must be positive.
    pub base: u32,
    /// Residue, always stored already reduced mod `base`.
    pub offset: u32,
}

impl Shard {
    /// Builds a shard, reducing `offset` mod `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is zero; a zero-modulus shard is meaningless.
    #[must_use]
    pub fn new(base: u32, offset: u32) -> Self {
        assert!(base > 0, "shard base must be positive");
        Self {
            base,
            offset: offset % base,
        }
    }

    /// The whole-cluster shard (every `n` belongs to it).
    #[must_use]
    pub fn whole() -> Self {
        Self { base: 1, offset: 0 }
    }

    /// Whether `n` belongs to this shard.
    #[must_use]
    pub fn contains(&self, n: u64) -> bool {
        n % u64::from(self.base) == u64::from(self.offset)
    }

    /// The intersection of two shards, i.e. the congruence class
    /// satisfying both, expressed over `lcm(self.base, other.base)`.
    /// Returns `None` when the two congruences have no common solution.
    #[must_use]
    pub fn intersect(&self, other: &Shard) -> Option<Shard> {
        crt_merge(self.base, self.offset, other.base, other.offset).map(|(base, offset)| Shard { base, offset })
    }
}

/// Merges two congruences `n ≡ r1 (mod m1)`, `n ≡ r2 (mod m2)` via the
/// Chinese Remainder Theorem, returning `(lcm(m1,m2), combined residue)`,
/// or `None` if they are incompatible (`gcd(m1,m2)` does not divide
/// `r2 - r1`).
fn crt_merge(m1: u32, r1: u32, m2: u32, r2: u32) -> Option<(u32, u32)> {
    let (a1, a2) = (i64::from(m1), i64::from(m2));
    let (r1, r2) = (i64::from(r1), i64::from(r2));
    let (g, p, _q) = extended_gcd(a1, a2);
    if (r2 - r1) % g != 0 {
        return None;
    }
    let lcm = a1 / g * a2;
    let diff = (r2 - r1) / g;
    let x = r1 + a1 * ((p * diff).rem_euclid(a2 / g));
    let combined = x.rem_euclid(lcm);
    u32::try_from(lcm).ok().map(|lcm| (lcm, combined as u32))
}

/// `(gcd(a,b), x, y)` such that `a*x + b*y == gcd(a,b)`.
fn extended_gcd(a: i64, b: i64) -> (i64, i64, i64) {
    if b == 0 {
        (a, 1, 0)
    } else {
        let (g, x1, y1) = extended_gcd(b, a % b);
        (g, y1, x1 - (a / b) * y1)
    }
}

/// Validates the fatal invariant that two shards sharing a common base
/// assign at most one offset to any placement slot (spec §4.5): if two
/// `Shard`s have equal `base` but also equal `offset`, they describe the
/// exact same slice and must not both be registered as distinct
/// deployments.
///
/// # Errors
///
/// Returns [`SchematError::InvariantViolation`] if any two shards in
/// `shards` share both base and offset.
pub fn assert_no_duplicate_offsets(shards: &[Shard]) -> Result<(), SchematError> {
    for (i, a) in shards.iter().enumerate() {
        for b in &shards[i + 1..] {
            if a.base == b.base && a.offset == b.offset {
                return Err(SchematError::InvariantViolation(format!(
                    "shards {a:?} and {b:?} claim the same (base, offset) slot"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fid: Fid, object_id: u64, role: &str, place: WorkerId, load: u32) -> RoutingRecord<WorkerId> {
        RoutingRecord {
            fid: Some(fid),
            object_id: ObjectId::new(object_id),
            role: Role::try_new(role).unwrap(),
            place,
            load,
        }
    }

    #[test]
    fn rank_places_orders_by_ascending_load() {
        let atlas = LocalAtlas::default();
        atlas.insert(record(Fid::generate(), 1, "$agent", WorkerId::new(2), 5));
        atlas.insert(record(Fid::generate(), 1, "$agent", WorkerId::new(1), 1));
        atlas.insert(record(Fid::generate(), 1, "$agent", WorkerId::new(3), 3));

        let ranked = atlas.rank_places(ObjectId::new(1), &Role::try_new("$agent").unwrap());
        assert_eq!(ranked, vec![WorkerId::new(1), WorkerId::new(3), WorkerId::new(2)]);
    }

    #[test]
    fn remove_by_fid_clears_every_index() {
        let atlas = LocalAtlas::default();
        let fid = Fid::generate();
        atlas.insert(record(fid, 9, "$agent", WorkerId::new(1), 0));
        assert!(atlas.by_fid(fid).is_some());

        atlas.remove_by_fid(fid);
        assert!(atlas.by_fid(fid).is_none());
        assert!(atlas.by_id(ObjectId::new(9)).is_empty());
        assert!(atlas.by_id_role(ObjectId::new(9), &Role::try_new("$agent").unwrap()).is_empty());
    }

    #[test]
    fn by_id_role_returns_home_place_first() {
        let atlas = LocalAtlas::new(WorkerId::new(2), NodeId::new(1));
        atlas.insert(record(Fid::generate(), 400, "$agent", WorkerId::new(7), 0));
        atlas.insert(record(Fid::generate(), 400, "$agent", WorkerId::new(2), 0));
        atlas.insert(record(Fid::generate(), 400, "$agent", WorkerId::new(3), 0));

        let records = atlas.by_id_role(ObjectId::new(400), &Role::try_new("$agent").unwrap());
        assert_eq!(records[0].place, WorkerId::new(2));
    }

    #[test]
    fn rank_places_excludes_special_self_records() {
        let atlas = LocalAtlas::new(WorkerId::new(0), NodeId::new(5));
        let ranked = atlas.rank_places(ObjectId::new(5), &Role::master());
        assert!(ranked.is_empty(), "the synthetic $master self-record must not rank as a candidate");
    }

    #[test]
    fn global_atlas_new_seeds_master_and_worker_self_records_per_node() {
        let nodes = [NodeId::new(1), NodeId::new(2)];
        let atlas = GlobalAtlas::new(NodeId::new(1), &nodes);

        let masters = atlas.by_id_role(ObjectId::new(2), &Role::master());
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].place, NodeId::new(2));
        assert!(masters[0].fid.is_none());

        let workers = atlas.by_id_role(ObjectId::new(1), &Role::worker());
        assert_eq!(workers.len(), 1);
        assert!(workers[0].fid.is_none());
    }

    #[test]
    fn shard_contains_matches_modular_residue() {
        let shard = Shard::new(4, 1);
        assert!(shard.contains(1));
        assert!(shard.contains(5));
        assert!(!shard.contains(2));
    }

    #[test]
    fn shard_intersect_solves_compatible_congruences() {
        let a = Shard::new(4, 1);
        let b = Shard::new(6, 3);
        let merged = a.intersect(&b).unwrap();
        assert_eq!(merged, Shard::new(12, 9));
        assert!(merged.contains(9));
        assert!(merged.contains(21));
    }

    #[test]
    fn shard_intersect_rejects_incompatible_congruences() {
        let a = Shard::new(4, 0);
        let b = Shard::new(6, 1);
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn duplicate_offset_shards_are_a_fatal_invariant() {
        let shards = vec![Shard::new(4, 1), Shard::new(4, 1)];
        assert!(assert_no_duplicate_offsets(&shards).is_err());
        let distinct = vec![Shard::new(4, 1), Shard::new(4, 2)];
        assert!(assert_no_duplicate_offsets(&distinct).is_ok());
    }
}
