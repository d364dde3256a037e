//! Related-edge index: which edges touch a node, optionally at a given
//! argument position

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DagResult;
use crate::model::{DagEdge, DagNode, EdgeId, Literal, NodeArg, NodeId};
use crate::module::DagModule;

/// Bucket key within a node's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    /// The node appears somewhere in the edge.
    Any,
    /// The node appears at this 1-based argument index.
    At(u32),
}

/// One query term. A positive or absent position includes matching edges, a
/// negative position excludes edges with `arg` at `|position|`. Position 0 is
/// treated as absent.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub arg: NodeArg,
    pub position: Option<i32>,
}

impl Constraint {
    pub fn any(arg: impl Into<NodeArg>) -> Self {
        Constraint {
            arg: arg.into(),
            position: None,
        }
    }

    pub fn at(arg: impl Into<NodeArg>, position: u32) -> Self {
        Constraint {
            arg: arg.into(),
            position: Some(clamp_position(position)),
        }
    }

    pub fn not_at(arg: impl Into<NodeArg>, position: u32) -> Self {
        Constraint {
            arg: arg.into(),
            position: Some(-clamp_position(position)),
        }
    }

    fn includes(&self) -> bool {
        self.position.is_none_or(|p| p >= 0)
    }

    /// 1-based position, if one was given.
    fn slot(&self) -> Option<u32> {
        self.position.filter(|p| *p != 0).map(i32::unsigned_abs)
    }
}

/// Positions past `i32::MAX` saturate; no edge is that wide.
fn clamp_position(position: u32) -> i32 {
    i32::try_from(position).unwrap_or(i32::MAX)
}

type Buckets = HashMap<Position, HashSet<EdgeId>>;

#[derive(Default)]
struct IndexInner {
    index: HashMap<NodeId, Buckets>,
    /// Every indexed edge, so queries can hand out edges rather than ids.
    edges: HashMap<EdgeId, Arc<DagEdge>>,
    /// State read from disk, adopted or discarded at initialisation.
    pending: Option<HashMap<NodeId, Buckets>>,
}

impl IndexInner {
    fn index_edge(&mut self, edge: &Arc<DagEdge>) {
        let id = edge.id();
        for (i, arg) in edge.args().iter().enumerate() {
            let NodeArg::Node(node) = arg else {
                continue;
            };
            let buckets = self.index.entry(node.id()).or_default();
            buckets.entry(Position::At(i as u32 + 1)).or_default().insert(id);
            buckets.entry(Position::Any).or_default().insert(id);
        }
        self.edges.insert(id, Arc::clone(edge));
    }

    fn unindex_edge(&mut self, edge: &DagEdge) {
        let id = edge.id();
        if self.edges.remove(&id).is_none() {
            return;
        }
        for (i, arg) in edge.args().iter().enumerate() {
            let NodeArg::Node(node) = arg else {
                continue;
            };
            let Some(buckets) = self.index.get_mut(&node.id()) else {
                continue;
            };
            for key in [Position::At(i as u32 + 1), Position::Any] {
                if let Some(set) = buckets.get_mut(&key) {
                    set.remove(&id);
                    if set.is_empty() {
                        buckets.remove(&key);
                    }
                }
            }
            if buckets.is_empty() {
                self.index.remove(&node.id());
            }
        }
    }

    fn rebuild(&mut self, edges: &[Arc<DagEdge>]) {
        self.index.clear();
        self.edges.clear();
        for edge in edges.iter().filter(|e| !e.is_ephemeral()) {
            self.index_edge(edge);
        }
    }
}

/// Composite index from (node, position) to the set of stored edges.
///
/// Ephemeral edges are not indexed. Every bucket always holds exactly the
/// stored non-ephemeral edges matching it.
pub struct RelatedEdgeModule {
    inner: RwLock<IndexInner>,
}

impl RelatedEdgeModule {
    pub const NAME: &'static str = "RelatedEdgeModule";

    pub fn new() -> Self {
        RelatedEdgeModule {
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Edges satisfying every constraint, ordered by id.
    ///
    /// Inclusion sets are intersected smallest first, then exclusion sets are
    /// subtracted. Literal arguments are not index keys, so they filter the
    /// surviving edges by direct comparison. Without at least one node
    /// inclusion constraint the result is empty.
    pub fn execute(&self, constraints: &[Constraint]) -> Vec<Arc<DagEdge>> {
        let inner = self.inner.read();
        let empty = HashSet::new();

        let mut sets: Vec<(bool, &HashSet<EdgeId>)> = Vec::new();
        let mut literals: Vec<(&Literal, Option<u32>, bool)> = Vec::new();
        for constraint in constraints {
            match &constraint.arg {
                NodeArg::Node(node) => {
                    let key = constraint.slot().map_or(Position::Any, Position::At);
                    let set = inner
                        .index
                        .get(&node.id())
                        .and_then(|buckets| buckets.get(&key))
                        .unwrap_or(&empty);
                    sets.push((constraint.includes(), set));
                }
                NodeArg::Value(literal) => {
                    literals.push((literal, constraint.slot(), constraint.includes()));
                }
            }
        }

        sets.sort_by_key(|(include, set)| (!include, set.len()));

        let mut sets = sets.into_iter();
        let mut result = match sets.next() {
            Some((true, first)) => first.clone(),
            _ => return Vec::new(),
        };
        for (include, set) in sets {
            if result.is_empty() {
                break;
            }
            if include {
                result.retain(|id| set.contains(id));
            } else {
                result.retain(|id| !set.contains(id));
            }
        }

        let mut edges: Vec<Arc<DagEdge>> = result
            .iter()
            .filter_map(|id| inner.edges.get(id))
            .filter(|edge| {
                literals
                    .iter()
                    .all(|(literal, slot, include)| literal_matches(edge, literal, *slot) == *include)
            })
            .cloned()
            .collect();
        edges.sort_by_key(|e| e.id());
        edges
    }

    /// The stored edge whose arguments are exactly `args`, if any.
    pub fn find_edge(&self, args: &[NodeArg]) -> Option<Arc<DagEdge>> {
        let constraints: Vec<Constraint> = args
            .iter()
            .enumerate()
            .map(|(i, arg)| Constraint::at(arg.clone(), i as u32 + 1))
            .collect();
        self.execute(&constraints)
            .into_iter()
            .find(|edge| edge.args() == args)
    }

    /// Number of edges in one bucket.
    pub fn bucket_size(&self, node: NodeId, position: Position) -> usize {
        self.inner
            .read()
            .index
            .get(&node)
            .and_then(|buckets| buckets.get(&position))
            .map_or(0, HashSet::len)
    }

    /// Number of indexed edges.
    pub fn len(&self) -> usize {
        self.inner.read().edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().edges.is_empty()
    }
}

impl Default for RelatedEdgeModule {
    fn default() -> Self {
        Self::new()
    }
}

fn literal_matches(edge: &DagEdge, literal: &Literal, slot: Option<u32>) -> bool {
    let is_literal = |arg: &NodeArg| matches!(arg, NodeArg::Value(value) if value == literal);
    match slot {
        Some(slot) => edge
            .args()
            .get(slot as usize - 1)
            .is_some_and(is_literal),
        None => edge.args().iter().any(is_literal),
    }
}

/// Adopt persisted buckets only if every id is a live non-ephemeral edge and
/// every such edge is covered.
fn resolve_persisted(
    index: &HashMap<NodeId, Buckets>,
    edges: &[Arc<DagEdge>],
) -> Option<HashMap<EdgeId, Arc<DagEdge>>> {
    let live: HashMap<EdgeId, &Arc<DagEdge>> = edges
        .iter()
        .filter(|e| !e.is_ephemeral())
        .map(|e| (e.id(), e))
        .collect();

    let mut indexed = HashMap::with_capacity(live.len());
    for buckets in index.values() {
        for set in buckets.values() {
            for id in set {
                let edge = live.get(id)?;
                indexed.insert(*id, Arc::clone(edge));
            }
        }
    }
    (indexed.len() == live.len()).then_some(indexed)
}

impl DagModule for RelatedEdgeModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_edge(&self, edge: &Arc<DagEdge>) -> bool {
        if !edge.is_ephemeral() {
            self.inner.write().index_edge(edge);
        }
        true
    }

    fn remove_edge(&self, edge: &Arc<DagEdge>) {
        self.inner.write().unindex_edge(edge);
    }

    fn remove_node(&self, node: &Arc<DagNode>) {
        self.inner.write().index.remove(&node.id());
    }

    fn clear(&self) {
        *self.inner.write() = IndexInner::default();
    }

    fn initialisation_complete(
        &self,
        _nodes: &[Arc<DagNode>],
        edges: &[Arc<DagEdge>],
        force_rebuild: bool,
    ) -> bool {
        let mut inner = self.inner.write();
        let pending = inner.pending.take();

        if !force_rebuild {
            match pending {
                Some(index) => {
                    if let Some(indexed) = resolve_persisted(&index, edges) {
                        debug!("Adopted persisted related-edge index ({} edges)", indexed.len());
                        inner.index = index;
                        inner.edges = indexed;
                        return false;
                    }
                    warn!("Persisted related-edge index does not match the edge store, rebuilding");
                }
                None => {
                    if !inner.edges.is_empty() || edges.iter().all(|e| e.is_ephemeral()) {
                        return false;
                    }
                }
            }
        }

        inner.rebuild(edges);
        debug!("Rebuilt related-edge index over {} edges", inner.edges.len());
        true
    }

    fn save_state(&self) -> DagResult<Option<Vec<u8>>> {
        let inner = self.inner.read();
        Ok(Some(bincode::serialize(&inner.index)?))
    }

    fn load_state(&self, bytes: &[u8]) -> DagResult<()> {
        let index: HashMap<NodeId, Buckets> = bincode::deserialize(bytes)?;
        self.inner.write().pending = Some(index);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
