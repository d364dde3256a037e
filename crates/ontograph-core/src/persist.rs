//! Snapshot directory layout and record encoding
//!
//! Nodes are written in full. Edges refer to their node arguments by id only,
//! so loading runs in two passes: every node record is read into an id table
//! first, then edge arguments are resolved against that table. Every edge
//! referring to a node therefore shares the one loaded instance.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{DagError, DagResult};
use crate::model::{DagEdge, DagNode, EdgeId, Literal, NodeArg, NodeId, Properties, Provenance};
use crate::module::{parse_module_list, render_module_list};

/// Node collection file, or shard prefix when sharded.
pub const NODES_FILE: &str = "nodes.dat";

/// Edge collection file, or shard prefix when sharded.
pub const EDGES_FILE: &str = "edges.dat";

/// Counter manifest
pub const DETAILS_FILE: &str = "dagDetails";

/// Module registration order
pub const ACTIVE_MODULES_FILE: &str = "activeModules.config";

/// Directory of per-module private state
pub const MODULES_DIR: &str = "modules";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: Option<String>,
    pub properties: Properties,
    pub provenance: Provenance,
}

impl From<&DagNode> for NodeRecord {
    fn from(node: &DagNode) -> Self {
        NodeRecord {
            id: node.id(),
            name: node.name().map(str::to_string),
            properties: node.properties(),
            provenance: node.provenance(),
        }
    }
}

/// Persisted edge argument. Stored nodes are written as their id alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgRecord {
    Node(NodeId),
    Value(Literal),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub args: Vec<ArgRecord>,
    pub properties: Properties,
    pub provenance: Provenance,
}

impl From<&DagEdge> for EdgeRecord {
    fn from(edge: &DagEdge) -> Self {
        EdgeRecord {
            id: edge.id(),
            args: edge
                .args()
                .iter()
                .map(|arg| match arg {
                    NodeArg::Node(node) => ArgRecord::Node(node.id()),
                    NodeArg::Value(value) => ArgRecord::Value(value.clone()),
                })
                .collect(),
            properties: edge.properties(),
            provenance: edge.provenance(),
        }
    }
}

/// Contents of the `dagDetails` manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DagDetails {
    /// Next node id to hand out.
    pub node_id_count: u64,
    /// Next edge id to hand out.
    pub edge_id_count: u64,
    pub num_nodes: usize,
    pub num_edges: usize,
}

impl DagDetails {
    pub fn render(&self) -> String {
        format!(
            "% Store counters, rewritten on every save\n\
             nodeIDCount={}\n\
             edgeIDCount={}\n\
             numNodes={}\n\
             numEdges={}\n",
            self.node_id_count, self.edge_id_count, self.num_nodes, self.num_edges
        )
    }

    /// Parse a manifest. Unknown keys are ignored and missing ones read as 0.
    pub fn parse(text: &str) -> DagResult<Self> {
        let mut details = DagDetails::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('%') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(corrupt(DETAILS_FILE, format!("malformed line {line:?}")));
            };
            let value = value.trim();
            let number = || {
                value
                    .parse::<u64>()
                    .map_err(|_| corrupt(DETAILS_FILE, format!("bad value for {key}: {value:?}")))
            };
            match key.trim() {
                "nodeIDCount" => details.node_id_count = number()?,
                "edgeIDCount" => details.edge_id_count = number()?,
                "numNodes" => details.num_nodes = number()? as usize,
                "numEdges" => details.num_edges = number()? as usize,
                other => debug!("Ignoring unknown manifest key {}", other),
            }
        }
        Ok(details)
    }
}

fn corrupt(location: &str, details: String) -> DagError {
    DagError::Corrupt {
        location: location.to_string(),
        details,
    }
}

/// Nodes and edges read back from a snapshot directory.
#[derive(Debug, Default)]
pub struct LoadedGraph {
    pub nodes: Vec<Arc<DagNode>>,
    pub edges: Vec<Arc<DagEdge>>,
    /// Nodes created for ids that edges referenced but no record supplied.
    pub placeholders: usize,
}

/// Path of shard `index` for a collection.
pub fn shard_path(root: &Path, base: &str, index: usize) -> PathBuf {
    root.join(format!("{base}{index}"))
}

/// Write `records` as `base` or, past `max_per_file`, as numbered shards.
/// Files left over from the other layout are removed.
pub fn write_collection<T: Serialize>(
    root: &Path,
    base: &str,
    records: &[T],
    max_per_file: usize,
) -> DagResult<()> {
    let max_per_file = max_per_file.max(1);
    if records.len() <= max_per_file {
        write_atomic(&root.join(base), &bincode::serialize(records)?)?;
        remove_shards_from(root, base, 0)?;
        return Ok(());
    }

    let mut shards = 0;
    for (index, chunk) in records.chunks(max_per_file).enumerate() {
        write_atomic(&shard_path(root, base, index), &bincode::serialize(chunk)?)?;
        shards = index + 1;
    }
    remove_shards_from(root, base, shards)?;
    let single = root.join(base);
    if single.exists() {
        fs::remove_file(&single).map_err(|e| DagError::io(&single, e))?;
    }
    debug!("Wrote {} {} records across {} shards", records.len(), base, shards);
    Ok(())
}

fn remove_shards_from(root: &Path, base: &str, first: usize) -> DagResult<()> {
    let mut index = first;
    loop {
        let path = shard_path(root, base, index);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_file(&path).map_err(|e| DagError::io(&path, e))?;
        index += 1;
    }
}

/// Read a collection written by [`write_collection`]. `Ok(None)` when neither
/// layout is present.
pub fn read_collection<T: DeserializeOwned>(root: &Path, base: &str) -> DagResult<Option<Vec<T>>> {
    let single = root.join(base);
    if single.exists() {
        return read_records(&single).map(Some);
    }

    let mut records = Vec::new();
    let mut index = 0;
    loop {
        let path = shard_path(root, base, index);
        if !path.exists() {
            break;
        }
        records.extend(read_records::<T>(&path)?);
        index += 1;
    }
    Ok((index > 0).then_some(records))
}

fn read_records<T: DeserializeOwned>(path: &Path) -> DagResult<Vec<T>> {
    let file = File::open(path).map_err(|e| DagError::io(path, e))?;
    bincode::deserialize_from(BufReader::new(file)).map_err(|e| corrupt(&path.display().to_string(), e.to_string()))
}

/// Write to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> DagResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| DagError::io(parent, e))?;
    }

    let tmp_path = tmp_write_path(path);
    let written = (|| -> DagResult<()> {
        let file = File::create(&tmp_path).map_err(|e| DagError::io(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes).map_err(|e| DagError::io(&tmp_path, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| DagError::io(&tmp_path, e.into_error()))?;
        file.sync_all().map_err(|e| DagError::io(&tmp_path, e))
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DagError::io(path, e)
    })
}

fn tmp_write_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

/// Persist both collections.
pub fn save_graph(
    root: &Path,
    nodes: &[Arc<DagNode>],
    edges: &[Arc<DagEdge>],
    max_per_file: usize,
) -> DagResult<()> {
    let node_records: Vec<NodeRecord> = nodes.iter().map(|n| NodeRecord::from(n.as_ref())).collect();
    write_collection(root, NODES_FILE, &node_records, max_per_file)?;
    let edge_records: Vec<EdgeRecord> = edges.iter().map(|e| EdgeRecord::from(e.as_ref())).collect();
    write_collection(root, EDGES_FILE, &edge_records, max_per_file)
}

/// Load both collections. A collection that cannot be read is logged and
/// treated as empty.
pub fn load_graph(root: &Path) -> LoadedGraph {
    let node_records: Vec<NodeRecord> = read_or_empty(root, NODES_FILE);
    let edge_records: Vec<EdgeRecord> = read_or_empty(root, EDGES_FILE);

    let mut table: HashMap<NodeId, Arc<DagNode>> = HashMap::with_capacity(node_records.len());
    for record in node_records {
        let node = DagNode::from_parts(record.id, record.name, record.properties, record.provenance);
        if table.insert(record.id, Arc::new(node)).is_some() {
            warn!("Duplicate node record {}, keeping the later one", record.id);
        }
    }

    let mut placeholders = 0;
    let mut edges = Vec::with_capacity(edge_records.len());
    for record in edge_records {
        let args = record
            .args
            .into_iter()
            .map(|arg| match arg {
                ArgRecord::Node(id) => NodeArg::Node(Arc::clone(table.entry(id).or_insert_with(|| {
                    warn!("Edge {} references unknown node {}, adopting a placeholder", record.id, id);
                    placeholders += 1;
                    Arc::new(DagNode::placeholder(id))
                }))),
                ArgRecord::Value(value) => NodeArg::Value(value),
            })
            .collect();
        match DagEdge::from_parts(record.id, args, record.properties, record.provenance) {
            Ok(edge) => edges.push(Arc::new(edge)),
            Err(e) => warn!("Dropping edge record {}: {}", record.id, e),
        }
    }

    let mut nodes: Vec<Arc<DagNode>> = table.into_values().collect();
    nodes.sort_by_key(|n| n.id());
    edges.sort_by_key(|e: &Arc<DagEdge>| e.id());
    debug!("Loaded {} nodes and {} edges from {}", nodes.len(), edges.len(), root.display());
    LoadedGraph {
        nodes,
        edges,
        placeholders,
    }
}

fn read_or_empty<T: DeserializeOwned>(root: &Path, base: &str) -> Vec<T> {
    match read_collection(root, base) {
        Ok(records) => records.unwrap_or_default(),
        Err(e) => {
            error!("Could not read {}, starting with an empty collection: {}", base, e);
            Vec::new()
        }
    }
}

pub fn write_details(root: &Path, details: &DagDetails) -> DagResult<()> {
    write_atomic(&root.join(DETAILS_FILE), details.render().as_bytes())
}

/// The manifest, if present and readable.
pub fn read_details(root: &Path) -> Option<DagDetails> {
    let path = root.join(DETAILS_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            return None;
        }
    };
    DagDetails::parse(&text)
        .inspect_err(|e| warn!("Ignoring manifest: {}", e))
        .ok()
}

pub fn write_module_list(root: &Path, names: &[&str]) -> DagResult<()> {
    write_atomic(&root.join(ACTIVE_MODULES_FILE), render_module_list(names).as_bytes())
}

/// Module names in registration order, if the snapshot records them.
pub fn read_module_list(root: &Path) -> Option<Vec<String>> {
    let path = root.join(ACTIVE_MODULES_FILE);
    fs::read_to_string(&path).ok().map(|text| parse_module_list(&text))
}

pub fn module_state_path(root: &Path, name: &str) -> PathBuf {
    root.join(MODULES_DIR).join(name)
}

pub fn write_module_state(root: &Path, name: &str, bytes: &[u8]) -> DagResult<()> {
    write_atomic(&module_state_path(root, name), bytes)
}

pub fn read_module_state(root: &Path, name: &str) -> DagResult<Option<Vec<u8>>> {
    let path = module_state_path(root, name);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DagError::io(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(id: u64, name: Option<&str>) -> Arc<DagNode> {
        Arc::new(DagNode::new(NodeId(id), name.map(String::from), Provenance::now(None)))
    }

    fn edge(id: u64, args: Vec<NodeArg>) -> Arc<DagEdge> {
        Arc::new(DagEdge::new(EdgeId(id), args, Provenance::now(None)).unwrap())
    }

    #[test]
    fn test_details_manifest() {
        let details = DagDetails {
            node_id_count: 12,
            edge_id_count: 7,
            num_nodes: 10,
            num_edges: 5,
        };
        insta::assert_snapshot!(details.render(), @r"
        % Store counters, rewritten on every save
        nodeIDCount=12
        edgeIDCount=7
        numNodes=10
        numEdges=5
        ");
        assert_eq!(DagDetails::parse(&details.render()).unwrap(), details);
        assert_eq!(
            DagDetails::parse("% only\nnodeIDCount = 3\nfuture=1\n").unwrap(),
            DagDetails {
                node_id_count: 3,
                ..Default::default()
            }
        );
        assert!(DagDetails::parse("nodeIDCount=lots").is_err());
    }

    #[test]
    fn test_edges_share_loaded_nodes() {
        let dir = TempDir::new().unwrap();
        let isa = node(0, Some("isa"));
        let cow = node(1, Some("Cow"));
        let mammal = node(2, Some("Mammal"));
        let animal = node(3, Some("Animal"));
        cow.properties_mut().insert("colour".into(), "brown".into());
        let edges = vec![
            edge(0, vec![(&isa).into(), (&cow).into(), (&mammal).into()]),
            edge(1, vec![(&isa).into(), (&mammal).into(), (&animal).into()]),
            edge(2, vec![(&isa).into(), (&cow).into(), Literal::Int(4).into()]),
        ];

        save_graph(dir.path(), &[isa, cow, mammal, animal], &edges, 100).unwrap();
        let loaded = load_graph(dir.path());

        assert_eq!(loaded.nodes.len(), 4);
        assert_eq!(loaded.edges.len(), 3);
        assert_eq!(loaded.placeholders, 0);
        assert_eq!(loaded.nodes[1].property("colour").as_deref(), Some("brown"));

        let mammal_in_first = loaded.edges[0].args()[2].as_node().unwrap();
        let mammal_in_second = loaded.edges[1].args()[1].as_node().unwrap();
        assert!(Arc::ptr_eq(mammal_in_first, mammal_in_second));
        assert!(Arc::ptr_eq(mammal_in_first, &loaded.nodes[2]));
        assert_eq!(loaded.edges[2].args()[2], NodeArg::Value(Literal::Int(4)));
    }

    #[test]
    fn test_sharded_layout_replaces_single_file() {
        let dir = TempDir::new().unwrap();
        let nodes: Vec<Arc<DagNode>> = (0..5).map(|i| node(i, None)).collect();

        save_graph(dir.path(), &nodes, &[], 100).unwrap();
        assert!(dir.path().join(NODES_FILE).exists());

        save_graph(dir.path(), &nodes, &[], 2).unwrap();
        assert!(!dir.path().join(NODES_FILE).exists());
        for i in 0..3 {
            assert!(shard_path(dir.path(), NODES_FILE, i).exists());
        }
        assert!(!shard_path(dir.path(), NODES_FILE, 3).exists());

        let loaded = load_graph(dir.path());
        let ids: Vec<u64> = loaded.nodes.iter().map(|n| n.id().0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);

        save_graph(dir.path(), &nodes[..1], &[], 2).unwrap();
        assert!(dir.path().join(NODES_FILE).exists());
        assert!(!shard_path(dir.path(), NODES_FILE, 0).exists());
    }

    #[test]
    fn test_missing_node_becomes_placeholder() {
        let dir = TempDir::new().unwrap();
        let isa = node(0, Some("isa"));
        let ghost = node(9, Some("Ghost"));
        let edges = vec![edge(0, vec![(&isa).into(), (&ghost).into()])];
        save_graph(dir.path(), &[isa], &edges, 100).unwrap();

        let loaded = load_graph(dir.path());
        assert_eq!(loaded.placeholders, 1);
        assert_eq!(loaded.nodes.len(), 2);
        let placeholder = loaded.edges[0].args()[1].as_node().unwrap();
        assert_eq!(placeholder.id(), NodeId(9));
        assert!(placeholder.is_anonymous());
    }

    #[test]
    fn test_corrupt_collection_loads_empty() {
        let dir = TempDir::new().unwrap();
        save_graph(dir.path(), &[node(0, Some("isa"))], &[], 100).unwrap();
        fs::write(dir.path().join(EDGES_FILE), b"\xff\xff\xff\xff\xff\xff\xff\xff\x01").unwrap();

        let loaded = load_graph(dir.path());
        assert_eq!(loaded.nodes.len(), 1);
        assert!(loaded.edges.is_empty());
    }

    #[test]
    fn test_module_files() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_module_list(dir.path()), None);
        assert_eq!(read_module_state(dir.path(), "NodeAliasModule").unwrap(), None);

        write_module_list(dir.path(), &["NodeAliasModule"]).unwrap();
        write_module_state(dir.path(), "NodeAliasModule", b"state").unwrap();

        assert_eq!(read_module_list(dir.path()), Some(vec!["NodeAliasModule".to_string()]));
        assert_eq!(
            read_module_state(dir.path(), "NodeAliasModule").unwrap(),
            Some(b"state".to_vec())
        );
        assert!(dir.path().join(MODULES_DIR).join("NodeAliasModule").exists());
    }
}
