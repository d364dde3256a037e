//! Ontograph Core: graph knowledge store, index modules and snapshot persistence

pub mod alias;
pub mod config;
pub mod dag;
pub mod error;
pub mod model;
pub mod module;
pub mod parse;
pub mod persist;
pub mod related;
pub mod trie;


#[cfg(test)]
pub mod test_utils;

pub use alias::NodeAliasModule;
pub use config::DagConfig;
pub use dag::{Dag, EdgeFlags, EdgeOutcome, NodeFlags};
pub use error::{DagError, DagResult, ValidationError};
pub use model::{DagEdge, DagNode, DagObject, EdgeId, Literal, NodeArg, NodeId, Properties, Provenance, EPHEMERAL};
pub use module::{create_module, DagModule};
pub use persist::DagDetails;
pub use related::{Constraint, Position, RelatedEdgeModule};
pub use trie::{CharTrie, Trie};
