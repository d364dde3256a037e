//! The graph engine: sole owner of the node and edge collections

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::alias::NodeAliasModule;
use crate::config::DagConfig;
use crate::error::{DagError, DagResult, ValidationError};
use crate::model::{
    DagEdge, DagNode, DagObject, EdgeId, NodeArg, NodeId, Properties, Provenance, EPHEMERAL,
};
use crate::module::{create_module, DagModule};
use crate::parse::{is_valid_name, parse_node_spec, split_edge, NodeSpec};
use crate::persist::{self, DagDetails};
use crate::related::{Constraint, RelatedEdgeModule};

/// Random draws from the id space before sampling falls back to a scan.
const SAMPLE_ATTEMPTS: usize = 64;

/// Options for [`Dag::find_or_create_node`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// Create the node if no match exists.
    pub create_new: bool,
    /// Mark a newly created node provisional.
    pub ephemeral: bool,
    /// Reject literal specs.
    pub dag_node_only: bool,
}

impl NodeFlags {
    pub const FIND: NodeFlags = NodeFlags {
        create_new: false,
        ephemeral: false,
        dag_node_only: false,
    };

    pub const CREATE: NodeFlags = NodeFlags {
        create_new: true,
        ephemeral: false,
        dag_node_only: false,
    };
}

/// Options for [`Dag::find_or_create_edge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeFlags {
    pub create_new: bool,
    /// Store the edge provisionally. Modules do not see it until grounded.
    pub ephemeral: bool,
    /// Skip the check that every node argument is live.
    pub skip_validation: bool,
}

impl EdgeFlags {
    pub const FIND: EdgeFlags = EdgeFlags {
        create_new: false,
        ephemeral: false,
        skip_validation: false,
    };

    pub const CREATE: EdgeFlags = EdgeFlags {
        create_new: true,
        ephemeral: false,
        skip_validation: false,
    };
}

/// Result of an edge lookup or assertion.
#[derive(Debug, Clone)]
pub enum EdgeOutcome {
    Existing(Arc<DagEdge>),
    Created(Arc<DagEdge>),
    /// No such edge and creation was not requested.
    NotFound,
    /// A node argument is not in the store.
    MissingNode(NodeId),
    /// A module vetoed the edge. It has been removed again.
    Rejected {
        module: &'static str,
        edge: Arc<DagEdge>,
    },
}

impl EdgeOutcome {
    /// The found or created edge.
    pub fn edge(&self) -> Option<&Arc<DagEdge>> {
        match self {
            EdgeOutcome::Existing(edge) | EdgeOutcome::Created(edge) => Some(edge),
            _ => None,
        }
    }

    pub fn into_edge(self) -> Option<Arc<DagEdge>> {
        match self {
            EdgeOutcome::Existing(edge) | EdgeOutcome::Created(edge) => Some(edge),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.edge().is_some()
    }

    /// Numeric status for a command layer: 0 on success, negative otherwise.
    pub fn status_code(&self) -> i32 {
        match self {
            EdgeOutcome::Existing(_) | EdgeOutcome::Created(_) => 0,
            EdgeOutcome::NotFound => -1,
            EdgeOutcome::MissingNode(_) => -2,
            EdgeOutcome::Rejected { .. } => -3,
        }
    }

    pub fn message(&self) -> String {
        match self {
            EdgeOutcome::Existing(edge) => format!("Edge {} already exists: {}", edge.id(), edge),
            EdgeOutcome::Created(edge) => format!("Created edge {}: {}", edge.id(), edge),
            EdgeOutcome::NotFound => "Edge not found".to_string(),
            EdgeOutcome::MissingNode(id) => format!("Node {} does not exist", id),
            EdgeOutcome::Rejected { module, edge } => {
                format!("Edge {} rejected by {}", edge, module)
            }
        }
    }
}

/// An in-memory knowledge graph with pluggable index modules and optional
/// snapshot persistence.
///
/// Lock order is engine, then node, then edge. Reads take none of them.
pub struct Dag {
    config: DagConfig,
    nodes: DashMap<NodeId, Arc<DagNode>>,
    edges: DashMap<EdgeId, Arc<DagEdge>>,
    /// Live edges carrying the ephemeral marker. Modules never index these.
    ephemeral_edges: DashMap<EdgeId, Arc<DagEdge>>,
    next_node_id: AtomicU64,
    next_edge_id: AtomicU64,
    modules: RwLock<Vec<Arc<dyn DagModule>>>,
    node_lock: Mutex<()>,
    edge_lock: Mutex<()>,
    /// Barrier for property mutation, grounding and module registration.
    engine_lock: Mutex<()>,
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("node_count", &self.nodes.len())
            .field("edge_count", &self.edges.len())
            .field("modules", &self.module_names())
            .finish()
    }
}

impl Dag {
    fn empty(config: DagConfig) -> Self {
        Dag {
            config,
            nodes: DashMap::new(),
            edges: DashMap::new(),
            ephemeral_edges: DashMap::new(),
            next_node_id: AtomicU64::new(0),
            next_edge_id: AtomicU64::new(0),
            modules: RwLock::new(Vec::new()),
            node_lock: Mutex::new(()),
            edge_lock: Mutex::new(()),
            engine_lock: Mutex::new(()),
        }
    }

    /// An empty in-memory store with the configured modules registered.
    pub fn new(config: DagConfig) -> Self {
        let dag = Self::empty(config);
        let names = dag.config.modules.clone();
        dag.instantiate_modules(&names);
        dag
    }

    /// Open the store rooted at `config.root`, loading any snapshot found there.
    /// Without a root this is [`Dag::new`].
    pub fn open(config: DagConfig) -> DagResult<Self> {
        let Some(root) = config.root.clone() else {
            return Ok(Self::new(config));
        };
        std::fs::create_dir_all(&root).map_err(|e| DagError::io(&root, e))?;

        let dag = Self::empty(config);
        let names = persist::read_module_list(&root).unwrap_or_else(|| dag.config.modules.clone());
        dag.instantiate_modules(&names);

        let loaded = persist::load_graph(&root);
        if loaded.placeholders > 0 {
            warn!("Adopted {} placeholder nodes while loading", loaded.placeholders);
        }
        let mut max_node = None;
        for node in loaded.nodes {
            max_node = max_node.max(Some(node.id().0));
            dag.nodes.insert(node.id(), node);
        }
        let mut max_edge = None;
        for edge in loaded.edges {
            max_edge = max_edge.max(Some(edge.id().0));
            if edge.is_ephemeral() {
                dag.ephemeral_edges.insert(edge.id(), Arc::clone(&edge));
            }
            dag.edges.insert(edge.id(), edge);
        }

        // The manifest is written last, so a mismatch means the last save
        // stopped partway and module files may predate the collections.
        let manifest = persist::read_details(&root);
        let torn = match &manifest {
            Some(details) => details.num_nodes != dag.nodes.len() || details.num_edges != dag.edges.len(),
            None => !dag.nodes.is_empty() || !dag.edges.is_empty(),
        };
        if torn {
            warn!(
                "Snapshot at {} does not match its manifest ({} nodes, {} edges loaded), rebuilding modules",
                root.display(),
                dag.nodes.len(),
                dag.edges.len()
            );
        }
        let details = manifest.unwrap_or_default();
        dag.next_node_id.store(
            details.node_id_count.max(max_node.map_or(0, |id| id + 1)),
            Ordering::SeqCst,
        );
        dag.next_edge_id.store(
            details.edge_id_count.max(max_edge.map_or(0, |id| id + 1)),
            Ordering::SeqCst,
        );

        let modules = dag.snapshot_modules();
        for module in &modules {
            match persist::read_module_state(&root, module.name()) {
                Ok(Some(bytes)) => {
                    if let Err(e) = module.load_state(&bytes) {
                        warn!("Discarding saved state of {}: {}", module.name(), e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Could not read state of {}: {}", module.name(), e),
            }
        }

        let nodes = dag.nodes();
        let edges = dag.edges();
        let force_rebuild = dag.config.force_rebuild || torn;
        let mut rebuilt = false;
        for module in &modules {
            if module.initialisation_complete(&nodes, &edges, force_rebuild) {
                debug!("{} rebuilt its state", module.name());
                rebuilt = true;
            }
        }
        if rebuilt {
            if let Err(e) = persist::write_details(&root, &dag.details()) {
                warn!("Could not refresh manifest: {}", e);
            }
        }

        info!(
            "Opened store at {}: {} nodes, {} edges",
            root.display(),
            dag.node_count(),
            dag.edge_count()
        );
        Ok(dag)
    }

    fn instantiate_modules(&self, names: &[String]) {
        let mut modules = self.modules.write();
        for name in names {
            match create_module(name, &self.config) {
                Ok(module) => modules.push(module),
                Err(e) => warn!("Skipping module {}: {}", name, e),
            }
        }
    }

    pub fn config(&self) -> &DagConfig {
        &self.config
    }

    // ── Modules ─────────────────────────────────────────────

    /// Register a module after construction. It is brought up to date with a
    /// forced rebuild. Returns false if a module of the same name is present.
    pub fn register_module(&self, module: Arc<dyn DagModule>) -> bool {
        let _engine = self.engine_lock.lock();
        let _nodes = self.node_lock.lock();
        let _edges = self.edge_lock.lock();
        if self.modules.read().iter().any(|m| m.name() == module.name()) {
            warn!("Module {} is already registered", module.name());
            return false;
        }
        module.initialisation_complete(&self.nodes(), &self.edges(), true);
        debug!("Registered module {}", module.name());
        self.modules.write().push(module);
        true
    }

    /// Registered modules in registration order.
    pub fn modules(&self) -> Vec<Arc<dyn DagModule>> {
        self.snapshot_modules()
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.read().iter().map(|m| m.name()).collect()
    }

    /// The first registered module of concrete type `T`.
    pub fn module<T: DagModule>(&self) -> Option<Arc<T>> {
        self.modules
            .read()
            .iter()
            .find_map(|m| Arc::clone(m).into_any().downcast::<T>().ok())
    }

    pub fn related_edges(&self) -> Option<Arc<RelatedEdgeModule>> {
        self.module::<RelatedEdgeModule>()
    }

    pub fn aliases(&self) -> Option<Arc<NodeAliasModule>> {
        self.module::<NodeAliasModule>()
    }

    fn snapshot_modules(&self) -> Vec<Arc<dyn DagModule>> {
        self.modules.read().clone()
    }

    // ── Reads ───────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<Arc<DagNode>> {
        self.nodes.get(&id).map(|n| Arc::clone(n.value()))
    }

    pub fn edge(&self, id: EdgeId) -> Option<Arc<DagEdge>> {
        self.edges.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Arc<DagNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| Arc::clone(n.value())).collect();
        nodes.sort_by_key(|n| n.id());
        nodes
    }

    /// All edges, ordered by id.
    pub fn edges(&self) -> Vec<Arc<DagEdge>> {
        let mut edges: Vec<_> = self.edges.iter().map(|e| Arc::clone(e.value())).collect();
        edges.sort_by_key(|e| e.id());
        edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn ephemeral_edge_count(&self) -> usize {
        self.ephemeral_edges.len()
    }

    /// Current counters and sizes, as written to the manifest.
    pub fn details(&self) -> DagDetails {
        DagDetails {
            node_id_count: self.next_node_id.load(Ordering::SeqCst),
            edge_id_count: self.next_edge_id.load(Ordering::SeqCst),
            num_nodes: self.nodes.len(),
            num_edges: self.edges.len(),
        }
    }

    /// A uniformly chosen live node.
    pub fn random_node(&self) -> Option<Arc<DagNode>> {
        sample(&self.nodes, self.next_node_id.load(Ordering::SeqCst), NodeId)
    }

    /// A uniformly chosen live edge.
    pub fn random_edge(&self) -> Option<Arc<DagEdge>> {
        sample(&self.edges, self.next_edge_id.load(Ordering::SeqCst), EdgeId)
    }

    /// The live node with the smallest id above `id`.
    pub fn next_node(&self, id: NodeId) -> Option<Arc<DagNode>> {
        let end = self.next_node_id.load(Ordering::SeqCst);
        (id.0.saturating_add(1)..end).find_map(|i| self.node(NodeId(i)))
    }

    /// The live node with the largest id below `id`.
    pub fn previous_node(&self, id: NodeId) -> Option<Arc<DagNode>> {
        (0..id.0).rev().find_map(|i| self.node(NodeId(i)))
    }

    pub fn next_edge(&self, id: EdgeId) -> Option<Arc<DagEdge>> {
        let end = self.next_edge_id.load(Ordering::SeqCst);
        (id.0.saturating_add(1)..end).find_map(|i| self.edge(EdgeId(i)))
    }

    pub fn previous_edge(&self, id: EdgeId) -> Option<Arc<DagEdge>> {
        (0..id.0).rev().find_map(|i| self.edge(EdgeId(i)))
    }

    // ── Nodes ───────────────────────────────────────────────

    /// Resolve a node spec: an id, a quoted string, a `'` primitive, an empty
    /// string for a fresh anonymous node, or a name.
    ///
    /// Returns `None` when the spec does not parse, names nothing and creation
    /// was not requested, or is a literal under `dag_node_only`.
    pub fn find_or_create_node(
        &self,
        spec: &str,
        creator: Option<&Arc<DagNode>>,
        flags: NodeFlags,
    ) -> Option<NodeArg> {
        let parsed = match parse_node_spec(spec) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Unresolvable node spec: {}", e);
                return None;
            }
        };
        match parsed {
            NodeSpec::Literal(value) => (!flags.dag_node_only).then_some(NodeArg::Value(value)),
            NodeSpec::Id(id) => self.node(NodeId(id)).map(NodeArg::Node),
            NodeSpec::Anonymous => flags.create_new.then(|| {
                let _guard = self.node_lock.lock();
                NodeArg::Node(self.create_node(None, creator, flags.ephemeral))
            }),
            NodeSpec::Name(name) => self
                .resolve_name(&name, creator, flags.create_new, flags.ephemeral)
                .map(NodeArg::Node),
        }
    }

    /// Find a node by exact name, creating it if asked and the name is valid.
    pub fn find_or_create_node_by_name(
        &self,
        name: &str,
        creator: Option<&Arc<DagNode>>,
        create_new: bool,
    ) -> Option<Arc<DagNode>> {
        self.resolve_name(name, creator, create_new, false)
    }

    /// The node named exactly `name`.
    pub fn find_node_by_name(&self, name: &str) -> Option<Arc<DagNode>> {
        match self.aliases() {
            Some(aliases) => aliases
                .find_nodes(name, true, true)
                .into_iter()
                .filter_map(|id| self.node(id))
                .find(|node| node.name() == Some(name)),
            None => self
                .nodes
                .iter()
                .filter(|node| node.name() == Some(name))
                .map(|node| Arc::clone(node.value()))
                .min_by_key(|node| node.id()),
        }
    }

    fn resolve_name(
        &self,
        name: &str,
        creator: Option<&Arc<DagNode>>,
        create_new: bool,
        ephemeral: bool,
    ) -> Option<Arc<DagNode>> {
        if let Some(node) = self.find_node_by_name(name) {
            return Some(node);
        }
        if !create_new {
            return None;
        }
        if !is_valid_name(name) {
            debug!("Refusing to create node with invalid name {:?}", name);
            return None;
        }

        let _guard = self.node_lock.lock();
        // Another writer may have created it while we waited
        if let Some(node) = self.find_node_by_name(name) {
            return Some(node);
        }
        Some(self.create_node(Some(name.to_string()), creator, ephemeral))
    }

    /// Caller holds the node lock.
    fn create_node(
        &self,
        name: Option<String>,
        creator: Option<&Arc<DagNode>>,
        ephemeral: bool,
    ) -> Arc<DagNode> {
        let id = NodeId(self.next_node_id.fetch_add(1, Ordering::SeqCst));
        let node = Arc::new(DagNode::new(id, name, Provenance::now(creator.map(|c| c.id()))));
        if ephemeral {
            node.properties_mut().insert(EPHEMERAL.to_string(), "true".to_string());
        }
        self.nodes.insert(id, Arc::clone(&node));
        for module in self.snapshot_modules() {
            if !module.add_node(&node) {
                debug!("{} declined to index node {}", module.name(), id);
            }
        }
        debug!("Created node {} ({})", id, node);
        node
    }

    /// Remove a node and every edge referencing it.
    pub fn remove_node(&self, id: NodeId) -> bool {
        let _nodes = self.node_lock.lock();
        let Some((_, node)) = self.nodes.remove(&id) else {
            return false;
        };
        let _edges = self.edge_lock.lock();
        let referencing = self.edges_referencing(&node);
        for edge in &referencing {
            self.remove_edge_locked(edge);
        }
        for module in self.snapshot_modules() {
            module.remove_node(&node);
        }
        debug!("Removed node {} and {} edges", node, referencing.len());
        true
    }

    /// Every live edge with `node` in any position.
    pub fn edges_referencing(&self, node: &Arc<DagNode>) -> Vec<Arc<DagEdge>> {
        let mut edges = match self.related_edges() {
            Some(related) => related.execute(&[Constraint::any(node)]),
            None => self
                .edges
                .iter()
                .filter(|edge| !edge.is_ephemeral() && edge.references(node.id()))
                .map(|edge| Arc::clone(edge.value()))
                .collect(),
        };
        edges.extend(
            self.ephemeral_edges
                .iter()
                .filter(|edge| edge.references(node.id()))
                .map(|edge| Arc::clone(edge.value())),
        );
        edges.sort_by_key(|e| e.id());
        edges.dedup_by_key(|e| e.id());
        edges
    }

    // ── Edges ───────────────────────────────────────────────

    /// The stored edge with exactly these arguments.
    pub fn find_edge(&self, args: &[NodeArg]) -> Option<Arc<DagEdge>> {
        if let Some(edge) = self
            .ephemeral_edges
            .iter()
            .find(|edge| edge.args() == args)
        {
            return Some(Arc::clone(edge.value()));
        }
        let has_node = args.iter().any(|arg| arg.as_node().is_some());
        match self.related_edges() {
            Some(related) if has_node => related.find_edge(args),
            _ => self
                .edges
                .iter()
                .find(|edge| edge.args() == args)
                .map(|edge| Arc::clone(edge.value())),
        }
    }

    /// Find the edge with these arguments, or create it when asked.
    ///
    /// Arity is checked first and is the only error. Missing nodes and module
    /// vetoes come back as [`EdgeOutcome`] values.
    pub fn find_or_create_edge(
        &self,
        args: Vec<NodeArg>,
        creator: Option<&Arc<DagNode>>,
        flags: EdgeFlags,
    ) -> DagResult<EdgeOutcome> {
        if args.len() < 2 {
            return Err(ValidationError::TooFewArguments(args.len()).into());
        }
        if let Some(edge) = self.find_edge(&args) {
            return Ok(EdgeOutcome::Existing(edge));
        }
        if !flags.create_new {
            return Ok(EdgeOutcome::NotFound);
        }

        let _guard = self.edge_lock.lock();
        if let Some(edge) = self.find_edge(&args) {
            return Ok(EdgeOutcome::Existing(edge));
        }
        if !flags.skip_validation {
            let missing = args
                .iter()
                .filter_map(NodeArg::node_id)
                .find(|id| !self.nodes.contains_key(id));
            if let Some(id) = missing {
                return Ok(EdgeOutcome::MissingNode(id));
            }
        }

        let id = EdgeId(self.next_edge_id.fetch_add(1, Ordering::SeqCst));
        let edge = Arc::new(DagEdge::new(id, args, Provenance::now(creator.map(|c| c.id())))?);
        if flags.ephemeral {
            edge.properties_mut().insert(EPHEMERAL.to_string(), "true".to_string());
            self.ephemeral_edges.insert(id, Arc::clone(&edge));
        }
        self.edges.insert(id, Arc::clone(&edge));

        if !flags.ephemeral {
            if let Some(module) = self.notify_add_edge(&self.snapshot_modules(), &edge) {
                info!("{} rejected edge {}", module, edge);
                self.remove_edge_locked(&edge);
                return Ok(EdgeOutcome::Rejected { module, edge });
            }
        }
        debug!("Created edge {}: {}", id, edge);
        Ok(EdgeOutcome::Created(edge))
    }

    /// Parse `(a b c)` and resolve each argument through
    /// [`Dag::find_or_create_node`] before looking up or creating the edge.
    pub fn find_or_create_edge_text(
        &self,
        text: &str,
        creator: Option<&Arc<DagNode>>,
        flags: EdgeFlags,
    ) -> DagResult<EdgeOutcome> {
        let tokens = split_edge(text)?;
        if tokens.len() < 2 {
            return Err(ValidationError::TooFewArguments(tokens.len()).into());
        }
        let node_flags = NodeFlags {
            create_new: flags.create_new,
            ephemeral: flags.ephemeral,
            dag_node_only: false,
        };
        let mut args = Vec::with_capacity(tokens.len());
        for (index, token) in tokens.into_iter().enumerate() {
            match self.find_or_create_node(&token, creator, node_flags) {
                Some(arg) => args.push(arg),
                None => return Err(ValidationError::UnresolvedArgument { index, token }.into()),
            }
        }
        self.find_or_create_edge(args, creator, flags)
    }

    /// Offer `edge` to each module in order. Returns the first that vetoes.
    fn notify_add_edge(
        &self,
        modules: &[Arc<dyn DagModule>],
        edge: &Arc<DagEdge>,
    ) -> Option<&'static str> {
        for module in modules {
            if !module.add_edge(edge) {
                return Some(module.name());
            }
        }
        None
    }

    pub fn remove_edge(&self, id: EdgeId) -> bool {
        let _guard = self.edge_lock.lock();
        match self.edge(id) {
            Some(edge) => self.remove_edge_locked(&edge),
            None => false,
        }
    }

    /// Caller holds the edge lock.
    fn remove_edge_locked(&self, edge: &Arc<DagEdge>) -> bool {
        if self.edges.remove(&edge.id()).is_none() {
            return false;
        }
        let was_ephemeral = self.ephemeral_edges.remove(&edge.id()).is_some();
        if !was_ephemeral {
            for module in self.snapshot_modules() {
                module.remove_edge(edge);
            }
        }
        true
    }

    // ── Properties ──────────────────────────────────────────

    pub fn property(&self, object: &DagObject, key: &str) -> Option<String> {
        object.property(key)
    }

    pub fn properties(&self, object: &DagObject) -> Properties {
        object.properties()
    }

    /// Set a property and notify every module. Setting the ephemeral marker on
    /// a stored edge withdraws it from the modules through `remove_edge`.
    pub fn add_property(&self, object: &DagObject, key: &str, value: &str) {
        let _guard = self.engine_lock.lock();
        self.set_property_locked(object, key, value);
    }

    /// Remove a property, returning its old value. Modules are notified only
    /// if the key was present.
    ///
    /// Clearing the ephemeral marker on a stored edge offers it to the modules
    /// through `add_edge`, and a veto removes the edge from the store. Edges
    /// no longer in the store only lose the property.
    pub fn remove_property(&self, object: &DagObject, key: &str) -> Option<String> {
        let _guard = self.engine_lock.lock();
        let removed = object.properties_mut().remove(key)?;
        if let (DagObject::Edge(edge), EPHEMERAL) = (object, key) {
            self.promote_edge(edge);
        }
        for module in self.snapshot_modules() {
            module.remove_property(object, key);
        }
        Some(removed)
    }

    /// Caller holds the engine lock.
    fn set_property_locked(&self, object: &DagObject, key: &str, value: &str) {
        object
            .properties_mut()
            .insert(key.to_string(), value.to_string());
        if let (DagObject::Edge(edge), EPHEMERAL) = (object, key) {
            self.withdraw_edge(edge);
        }
        for module in self.snapshot_modules() {
            module.add_property(object, key, value);
        }
    }

    /// Move a stored edge into the ephemeral set and out of every module.
    fn withdraw_edge(&self, edge: &Arc<DagEdge>) {
        let _guard = self.edge_lock.lock();
        if !self.edges.contains_key(&edge.id()) {
            return;
        }
        if self.ephemeral_edges.insert(edge.id(), Arc::clone(edge)).is_none() {
            for module in self.snapshot_modules() {
                module.remove_edge(edge);
            }
        }
    }

    /// Move a stored ephemeral edge back into every module. A veto drops it.
    fn promote_edge(&self, edge: &Arc<DagEdge>) {
        let _guard = self.edge_lock.lock();
        if !self.edges.contains_key(&edge.id()) || self.ephemeral_edges.remove(&edge.id()).is_none() {
            return;
        }
        if let Some(module) = self.notify_add_edge(&self.snapshot_modules(), edge) {
            info!("{} rejected promoted edge {}", module, edge);
            self.remove_edge_locked(edge);
        }
    }

    // ── Maintenance ─────────────────────────────────────────

    /// Make every ephemeral edge permanent and strip provisional properties.
    ///
    /// Edges are re-asserted oldest first. A module veto drops the edge.
    /// Afterwards every module is cleared and rebuilt. Returns the number of
    /// edges grounded.
    pub fn ground_ephemeral(&self) -> usize {
        let _engine = self.engine_lock.lock();
        let _nodes = self.node_lock.lock();
        let _edges = self.edge_lock.lock();

        let modules = self.snapshot_modules();
        let mut transient: HashSet<String> = modules
            .iter()
            .flat_map(|m| m.transient_properties())
            .collect();
        transient.insert(EPHEMERAL.to_string());

        let mut pending: Vec<Arc<DagEdge>> = self
            .ephemeral_edges
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        pending.sort_by_key(|e| (e.provenance().created_at, e.id()));
        self.ephemeral_edges.clear();

        let mut grounded = 0;
        for edge in pending {
            {
                let mut properties = edge.properties_mut();
                for key in &transient {
                    properties.remove(key);
                }
            }
            if let Some(module) = self.notify_add_edge(&modules, &edge) {
                info!("{} rejected grounded edge {}", module, edge);
                self.remove_edge_locked(&edge);
                continue;
            }
            grounded += 1;
        }

        for node in self.nodes.iter() {
            let mut properties = node.properties_mut();
            for key in &transient {
                properties.remove(key);
            }
        }

        let nodes = self.nodes();
        let edges = self.edges();
        for module in &modules {
            module.clear();
            module.initialisation_complete(&nodes, &edges, true);
        }
        info!("Grounded {} ephemeral edges", grounded);
        grounded
    }

    /// Fold `merging` into `base`.
    ///
    /// Every edge referencing `merging` is re-asserted with `base` in its
    /// place, carrying its properties over. Properties of `merging` that
    /// `base` lacks are copied; `base` keeps its own value on a clash.
    /// `merging` is then removed along with its original edges. Returns the
    /// number of edges re-pointed.
    pub fn merge_nodes(&self, base: NodeId, merging: NodeId) -> DagResult<usize> {
        if base == merging {
            return Ok(0);
        }
        let _engine = self.engine_lock.lock();
        let base_node = self.node(base).ok_or(DagError::NodeNotFound(base))?;
        let merging_node = self.node(merging).ok_or(DagError::NodeNotFound(merging))?;

        let mut repointed = 0;
        for edge in self.edges_referencing(&merging_node) {
            let args: Vec<NodeArg> = edge
                .args()
                .iter()
                .map(|arg| match arg {
                    NodeArg::Node(node) if node.id() == merging => NodeArg::Node(Arc::clone(&base_node)),
                    other => other.clone(),
                })
                .collect();
            let creator = edge.provenance().creator.and_then(|id| self.node(id));
            let flags = EdgeFlags {
                create_new: true,
                ephemeral: edge.is_ephemeral(),
                skip_validation: false,
            };
            match self.find_or_create_edge(args, creator.as_ref(), flags)? {
                EdgeOutcome::Created(new_edge) => {
                    let object = DagObject::Edge(new_edge);
                    for (key, value) in edge.properties() {
                        if key != EPHEMERAL {
                            self.set_property_locked(&object, &key, &value);
                        }
                    }
                    repointed += 1;
                }
                EdgeOutcome::Existing(_) => repointed += 1,
                other => warn!("Could not re-point {} onto {}: {}", edge, base_node, other.message()),
            }
        }

        let base_object = DagObject::Node(Arc::clone(&base_node));
        for (key, value) in merging_node.properties() {
            if base_node.property(&key).is_none() {
                self.set_property_locked(&base_object, &key, &value);
            }
        }

        self.remove_node(merging);
        info!("Merged {} into {} ({} edges re-pointed)", merging_node, base_node, repointed);
        Ok(repointed)
    }

    // ── Lifecycle ───────────────────────────────────────────

    /// Write a full snapshot to the configured root. Returns false when there
    /// is no root or the write failed.
    ///
    /// Each file is replaced atomically and `dagDetails` goes last. A save
    /// cut short leaves counts that disagree with the collections, and the
    /// next [`Dag::open`] rebuilds every module instead of trusting its file.
    pub fn save_state(&self) -> bool {
        let Some(root) = self.config.root.as_deref() else {
            debug!("No snapshot root configured, nothing saved");
            return false;
        };
        let _engine = self.engine_lock.lock();
        let _nodes = self.node_lock.lock();
        let _edges = self.edge_lock.lock();
        match self.write_snapshot(root) {
            Ok(()) => {
                info!(
                    "Saved {} nodes and {} edges to {}",
                    self.node_count(),
                    self.edge_count(),
                    root.display()
                );
                true
            }
            Err(e) => {
                error!("Failed to save store to {}: {}", root.display(), e);
                false
            }
        }
    }

    fn write_snapshot(&self, root: &Path) -> DagResult<()> {
        persist::save_graph(root, &self.nodes(), &self.edges(), self.config.max_objects_per_file)?;

        let modules = self.snapshot_modules();
        let names: Vec<&str> = modules.iter().map(|m| m.name()).collect();
        persist::write_module_list(root, &names)?;
        for module in &modules {
            match module.save_state() {
                Ok(Some(bytes)) => persist::write_module_state(root, module.name(), &bytes)?,
                Ok(None) => {}
                Err(e) => warn!("Could not serialize state of {}: {}", module.name(), e),
            }
        }

        persist::write_details(root, &self.details())
    }

    /// Save and drop the store.
    pub fn shutdown(self) -> bool {
        let saved = self.config.root.is_none() || self.save_state();
        info!("Store shut down");
        saved
    }
}

fn sample<K, V>(map: &DashMap<K, Arc<V>>, bound: u64, key: impl Fn(u64) -> K) -> Option<Arc<V>>
where
    K: Eq + std::hash::Hash,
{
    if map.is_empty() || bound == 0 {
        return None;
    }
    let mut rng = rand::thread_rng();
    for _ in 0..SAMPLE_ATTEMPTS {
        if let Some(value) = map.get(&key(rng.gen_range(0..bound))) {
            return Some(Arc::clone(value.value()));
        }
    }
    // Sparse id space: pick among live entries directly
    let skip = rng.gen_range(0..map.len());
    map.iter().nth(skip).map(|entry| Arc::clone(entry.value()))
}
