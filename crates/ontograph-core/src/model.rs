//! Core data structures for the knowledge graph

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Property key marking an entity as provisional.
pub const EPHEMERAL: &str = "ephemeral";

/// String-keyed property bag carried by every stored node and edge.
pub type Properties = HashMap<String, String>;

/// Unique, never-reused identifier for a stored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NodeId(pub u64);

/// Unique edge identifier. Drawn from a sequence disjoint from node ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct EdgeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who created an entity and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub creator: Option<NodeId>,
    /// Unix time in milliseconds.
    pub created_at: i64,
}

impl Provenance {
    pub fn now(creator: Option<NodeId>) -> Self {
        Provenance {
            creator,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A stored node. Equality and hashing use the id only.
#[derive(Debug)]
pub struct DagNode {
    id: NodeId,
    name: Option<String>,
    properties: RwLock<Properties>,
    provenance: Provenance,
}

impl DagNode {
    pub fn new(id: NodeId, name: Option<String>, provenance: Provenance) -> Self {
        DagNode {
            id,
            name,
            properties: RwLock::new(Properties::new()),
            provenance,
        }
    }

    /// Rebuild a node from persisted parts.
    pub fn from_parts(
        id: NodeId,
        name: Option<String>,
        properties: Properties,
        provenance: Provenance,
    ) -> Self {
        DagNode {
            id,
            name,
            properties: RwLock::new(properties),
            provenance,
        }
    }

    /// Identity-only stand-in for a node referenced before its record is known.
    pub fn placeholder(id: NodeId) -> Self {
        DagNode {
            id,
            name: None,
            properties: RwLock::new(Properties::new()),
            provenance: Provenance {
                creator: None,
                created_at: 0,
            },
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_none()
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.read().get(key).cloned()
    }

    /// Snapshot of the property bag.
    pub fn properties(&self) -> Properties {
        self.properties.read().clone()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.properties.read().contains_key(EPHEMERAL)
    }

    pub(crate) fn properties_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Properties> {
        self.properties.write()
    }
}

impl PartialEq for DagNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DagNode {}

impl Hash for DagNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Value node: a literal used as an edge argument. Never stored, never has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Literal::Int(i) => write!(f, "'{}", i),
            Literal::Float(x) => write!(f, "'{:?}", x),
            Literal::Bool(b) => write!(f, "'{}", b),
        }
    }
}

/// One argument slot of an edge.
#[derive(Debug, Clone)]
pub enum NodeArg {
    Node(Arc<DagNode>),
    Value(Literal),
}

impl NodeArg {
    pub fn as_node(&self) -> Option<&Arc<DagNode>> {
        match self {
            NodeArg::Node(node) => Some(node),
            NodeArg::Value(_) => None,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.as_node().map(|n| n.id())
    }

    pub fn string(value: impl Into<String>) -> Self {
        NodeArg::Value(Literal::Str(value.into()))
    }
}

impl PartialEq for NodeArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NodeArg::Node(a), NodeArg::Node(b)) => a.id() == b.id(),
            (NodeArg::Value(a), NodeArg::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Arc<DagNode>> for NodeArg {
    fn from(node: Arc<DagNode>) -> Self {
        NodeArg::Node(node)
    }
}

impl From<&Arc<DagNode>> for NodeArg {
    fn from(node: &Arc<DagNode>) -> Self {
        NodeArg::Node(Arc::clone(node))
    }
}

impl From<Literal> for NodeArg {
    fn from(value: Literal) -> Self {
        NodeArg::Value(value)
    }
}

impl fmt::Display for NodeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeArg::Node(node) => write!(f, "{}", node),
            NodeArg::Value(value) => write!(f, "{}", value),
        }
    }
}

/// A stored fact: an ordered tuple of at least two arguments.
#[derive(Debug)]
pub struct DagEdge {
    id: EdgeId,
    args: Vec<NodeArg>,
    properties: RwLock<Properties>,
    provenance: Provenance,
}

impl DagEdge {
    pub fn new(id: EdgeId, args: Vec<NodeArg>, provenance: Provenance) -> Result<Self, ValidationError> {
        Self::from_parts(id, args, Properties::new(), provenance)
    }

    pub fn from_parts(
        id: EdgeId,
        args: Vec<NodeArg>,
        properties: Properties,
        provenance: Provenance,
    ) -> Result<Self, ValidationError> {
        if args.len() < 2 {
            return Err(ValidationError::TooFewArguments(args.len()));
        }
        Ok(DagEdge {
            id,
            args,
            properties: RwLock::new(properties),
            provenance,
        })
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn args(&self) -> &[NodeArg] {
        &self.args
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// The first argument, conventionally the predicate.
    pub fn predicate(&self) -> &NodeArg {
        &self.args[0]
    }

    /// Whether `node` appears in any argument slot.
    pub fn references(&self, node: NodeId) -> bool {
        self.args.iter().any(|a| a.node_id() == Some(node))
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.read().get(key).cloned()
    }

    pub fn properties(&self) -> Properties {
        self.properties.read().clone()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.properties.read().contains_key(EPHEMERAL)
    }

    pub(crate) fn properties_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Properties> {
        self.properties.write()
    }
}

impl PartialEq for DagEdge {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DagEdge {}

impl Hash for DagEdge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DagEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Handle to a stored entity, passed to property callbacks.
#[derive(Debug, Clone)]
pub enum DagObject {
    Node(Arc<DagNode>),
    Edge(Arc<DagEdge>),
}

impl DagObject {
    pub fn property(&self, key: &str) -> Option<String> {
        match self {
            DagObject::Node(node) => node.property(key),
            DagObject::Edge(edge) => edge.property(key),
        }
    }

    pub fn properties(&self) -> Properties {
        match self {
            DagObject::Node(node) => node.properties(),
            DagObject::Edge(edge) => edge.properties(),
        }
    }

    pub(crate) fn properties_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Properties> {
        match self {
            DagObject::Node(node) => node.properties_mut(),
            DagObject::Edge(edge) => edge.properties_mut(),
        }
    }
}

impl From<&Arc<DagNode>> for DagObject {
    fn from(node: &Arc<DagNode>) -> Self {
        DagObject::Node(Arc::clone(node))
    }
}

impl From<&Arc<DagEdge>> for DagObject {
    fn from(edge: &Arc<DagEdge>) -> Self {
        DagObject::Edge(Arc::clone(edge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, name: &str) -> Arc<DagNode> {
        Arc::new(DagNode::new(NodeId(id), Some(name.to_string()), Provenance::now(None)))
    }

    #[test]
    fn test_edge_arity() {
        let a = node(1, "a");
        let b = node(2, "b");

        assert_eq!(
            DagEdge::new(EdgeId(0), vec![], Provenance::now(None)).unwrap_err(),
            ValidationError::TooFewArguments(0)
        );
        assert_eq!(
            DagEdge::new(EdgeId(0), vec![NodeArg::from(&a)], Provenance::now(None)).unwrap_err(),
            ValidationError::TooFewArguments(1)
        );
        // Repeated nodes are fine
        assert!(DagEdge::new(EdgeId(0), vec![(&a).into(), (&a).into()], Provenance::now(None)).is_ok());
        assert!(DagEdge::new(EdgeId(0), vec![(&a).into(), (&b).into(), NodeArg::string("x")], Provenance::now(None)).is_ok());
    }

    #[test]
    fn test_node_identity_is_by_id() {
        let a = DagNode::new(NodeId(7), Some("a".into()), Provenance::now(None));
        let b = DagNode::new(NodeId(7), Some("b".into()), Provenance::now(None));
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_display() {
        let isa = node(1, "isa");
        let anon = Arc::new(DagNode::new(NodeId(42), None, Provenance::now(None)));
        let edge = DagEdge::new(
            EdgeId(3),
            vec![
                (&isa).into(),
                (&anon).into(),
                NodeArg::string("say \"hi\""),
                Literal::Int(5).into(),
                Literal::Bool(true).into(),
            ],
            Provenance::now(None),
        )
        .unwrap();
        assert_eq!(edge.to_string(), r#"(isa 42 "say \"hi\"" '5 'true)"#);
    }
}
