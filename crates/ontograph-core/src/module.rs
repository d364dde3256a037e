//! Module protocol: derived-state components kept in sync with the base store

use std::any::Any;
use std::sync::Arc;

use crate::alias::NodeAliasModule;
use crate::config::DagConfig;
use crate::error::{DagError, DagResult};
use crate::model::{DagEdge, DagNode, DagObject};
use crate::related::RelatedEdgeModule;

/// A pluggable component maintaining index or derived state.
///
/// The engine calls these hooks synchronously, in registration order, after
/// each accepted structural change. Only [`DagModule::add_edge`] may veto.
/// `remove_edge` can fire for edges the module never accepted (rollback after
/// another module's veto) and must tolerate that.
pub trait DagModule: Send + Sync + 'static {
    /// Type name, used for the module's persisted state file and in the
    /// active module list.
    fn name(&self) -> &'static str;

    /// Informational. The return value is recorded but never vetoes.
    fn add_node(&self, _node: &Arc<DagNode>) -> bool {
        true
    }

    /// Return false to reject the edge. The engine then rolls it back.
    fn add_edge(&self, _edge: &Arc<DagEdge>) -> bool {
        true
    }

    fn remove_node(&self, _node: &Arc<DagNode>) {}

    fn remove_edge(&self, _edge: &Arc<DagEdge>) {}

    fn add_property(&self, _object: &DagObject, _key: &str, _value: &str) {}

    fn remove_property(&self, _object: &DagObject, _key: &str) {}

    /// Drop all derived state.
    fn clear(&self);

    /// Called once the base collections are loaded. Rebuild from them when
    /// the module's own state is empty or stale, or when `force_rebuild` is
    /// set. Returns true if state changed.
    fn initialisation_complete(
        &self,
        nodes: &[Arc<DagNode>],
        edges: &[Arc<DagEdge>],
        force_rebuild: bool,
    ) -> bool;

    /// Property keys this module writes that do not survive grounding.
    fn transient_properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Serialize private state. `None` means nothing worth persisting.
    fn save_state(&self) -> DagResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn load_state(&self, _bytes: &[u8]) -> DagResult<()> {
        Ok(())
    }

    /// Upcast for capability lookups by concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Instantiate a module from its persisted type name.
pub fn create_module(name: &str, config: &DagConfig) -> DagResult<Arc<dyn DagModule>> {
    match name {
        RelatedEdgeModule::NAME => Ok(Arc::new(RelatedEdgeModule::new())),
        NodeAliasModule::NAME => Ok(Arc::new(NodeAliasModule::from_config(config))),
        _ => Err(DagError::UnknownModule(name.to_string())),
    }
}

/// Parse an `activeModules.config` document: one module name per line,
/// blank lines and `%` comments ignored.
pub fn parse_module_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('%'))
        .map(str::to_string)
        .collect()
}

pub fn render_module_list(names: &[&str]) -> String {
    let mut out = String::from("% Active modules, in registration order\n");
    for name in names {
        out.push_str(name);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_modules() {
        let config = DagConfig::default();
        for name in &config.modules {
            let module = create_module(name, &config).unwrap();
            assert_eq!(module.name(), name.as_str());
        }
        assert!(matches!(
            create_module("FullTextAliasModule", &config),
            Err(DagError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_module_list_round_trip() {
        let text = render_module_list(&["RelatedEdgeModule", "NodeAliasModule"]);
        assert_eq!(
            parse_module_list(&text),
            vec!["RelatedEdgeModule", "NodeAliasModule"]
        );
        assert_eq!(
            parse_module_list("% header\n\n  NodeAliasModule  \n%RelatedEdgeModule\n"),
            vec!["NodeAliasModule"]
        );
    }
}
