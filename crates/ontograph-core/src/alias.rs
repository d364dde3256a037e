//! Alias index: node names and alias facts mapped to nodes through a
//! character trie

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DagConfig;
use crate::error::DagResult;
use crate::model::{DagEdge, DagNode, EdgeId, Literal, NodeArg, NodeId};
use crate::module::DagModule;
use crate::trie::CharTrie;

#[derive(Default, Serialize, Deserialize)]
struct AliasState {
    trie: CharTrie<NodeId>,
    /// References to an (alias, node) pair beyond the first. A node whose
    /// name is also asserted as an alias is held twice.
    extra: HashMap<(String, NodeId), u32>,
    /// Edges whose alias fact is currently held.
    facts: HashSet<EdgeId>,
}

impl AliasState {
    fn add(&mut self, alias: &str, node: NodeId) {
        if !self.trie.put(alias, node) {
            *self.extra.entry((alias.to_string(), node)).or_insert(0) += 1;
        }
    }

    fn remove(&mut self, alias: &str, node: NodeId) {
        let key = (alias.to_string(), node);
        if let Some(count) = self.extra.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.extra.remove(&key);
            }
            return;
        }
        self.trie.remove(alias, &node);
    }

    fn add_fact(&mut self, edge: EdgeId, alias: &str, node: NodeId) {
        if self.facts.insert(edge) {
            self.add(alias, node);
        }
    }

    fn remove_fact(&mut self, edge: EdgeId, alias: &str, node: NodeId) {
        if self.facts.remove(&edge) {
            self.remove(alias, node);
        }
    }

    fn clear(&mut self) {
        self.trie.clear();
        self.extra.clear();
        self.facts.clear();
    }
}

/// Maps alias strings to the nodes they denote.
///
/// Aliases come from node names and from alias facts: edges shaped
/// `(pred node "alias")` whose predicate is one of the configured alias
/// predicates.
pub struct NodeAliasModule {
    state: RwLock<AliasState>,
    alias_predicates: HashSet<String>,
}

impl NodeAliasModule {
    pub const NAME: &'static str = "NodeAliasModule";

    pub fn new(min_alias_length: usize, alias_predicates: impl IntoIterator<Item = String>) -> Self {
        NodeAliasModule {
            state: RwLock::new(AliasState {
                trie: CharTrie::with_min_key_length(min_alias_length),
                extra: HashMap::new(),
                facts: HashSet::new(),
            }),
            alias_predicates: alias_predicates.into_iter().collect(),
        }
    }

    pub fn from_config(config: &DagConfig) -> Self {
        Self::new(config.min_alias_length, config.alias_predicates.iter().cloned())
    }

    /// If `edge` declares an alias, the aliased node and the alias string.
    pub fn alias_fact(&self, edge: &DagEdge) -> Option<(NodeId, String)> {
        let [NodeArg::Node(predicate), NodeArg::Node(target), NodeArg::Value(Literal::Str(alias))] =
            edge.args()
        else {
            return None;
        };
        let name = predicate.name()?;
        self.alias_predicates
            .contains(name)
            .then(|| (target.id(), alias.clone()))
    }

    /// Nodes known by `alias`, ordered by id.
    pub fn find_nodes(&self, alias: &str, case_sensitive: bool, exact: bool) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .state
            .read()
            .trie
            .get(alias, case_sensitive, exact)
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    /// Number of (alias, node) entries.
    pub fn len(&self) -> usize {
        self.state.read().trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().trie.is_empty()
    }

    pub fn set_min_alias_length(&self, min_alias_length: usize) {
        self.state.write().trie.set_min_key_length(min_alias_length);
    }

    /// Whether `state` holds exactly the names and alias facts of the store.
    /// Only fact ids and entry totals are compared, not the strings.
    fn matches_store(
        &self,
        state: &AliasState,
        nodes: &[Arc<DagNode>],
        edges: &[Arc<DagEdge>],
    ) -> bool {
        let facts: HashSet<EdgeId> = edges
            .iter()
            .filter(|e| !e.is_ephemeral() && self.alias_fact(e).is_some())
            .map(|e| e.id())
            .collect();
        let names = nodes.iter().filter(|n| n.name().is_some()).count();
        let held = state.trie.len() + state.extra.values().map(|c| *c as usize).sum::<usize>();
        facts == state.facts && held == names + facts.len()
    }
}

impl DagModule for NodeAliasModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_node(&self, node: &Arc<DagNode>) -> bool {
        if let Some(name) = node.name() {
            self.state.write().add(name, node.id());
        }
        true
    }

    fn remove_node(&self, node: &Arc<DagNode>) {
        if let Some(name) = node.name() {
            self.state.write().remove(name, node.id());
        }
    }

    fn add_edge(&self, edge: &Arc<DagEdge>) -> bool {
        if edge.is_ephemeral() {
            return true;
        }
        if let Some((node, alias)) = self.alias_fact(edge) {
            self.state.write().add_fact(edge.id(), &alias, node);
        }
        true
    }

    fn remove_edge(&self, edge: &Arc<DagEdge>) {
        if let Some((node, alias)) = self.alias_fact(edge) {
            self.state.write().remove_fact(edge.id(), &alias, node);
        }
    }

    fn clear(&self) {
        self.state.write().clear();
    }

    fn initialisation_complete(
        &self,
        nodes: &[Arc<DagNode>],
        edges: &[Arc<DagEdge>],
        force_rebuild: bool,
    ) -> bool {
        let mut state = self.state.write();
        if !force_rebuild && self.matches_store(&state, nodes, edges) {
            return false;
        }

        state.clear();
        for node in nodes {
            if let Some(name) = node.name() {
                state.add(name, node.id());
            }
        }
        for edge in edges.iter().filter(|e| !e.is_ephemeral()) {
            if let Some((node, alias)) = self.alias_fact(edge) {
                state.add_fact(edge.id(), &alias, node);
            }
        }
        debug!("Rebuilt alias index with {} entries", state.trie.len());
        true
    }

    fn save_state(&self) -> DagResult<Option<Vec<u8>>> {
        let state = self.state.read();
        Ok(Some(bincode::serialize(&*state)?))
    }

    fn load_state(&self, bytes: &[u8]) -> DagResult<()> {
        let mut loaded: AliasState = bincode::deserialize(bytes)?;
        let mut state = self.state.write();
        // The configured threshold wins over the persisted one
        loaded.trie.set_min_key_length(state.trie.min_key_length());
        *state = loaded;
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
