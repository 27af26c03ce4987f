//! The asset interface: best-effort persistence of node trees and entities.
//!
//! The core consults an [`AssetManager`] for `load`, `store`,
//! `load_entity`, and `store_entity`; the default implementation is plain
//! file I/O with the format chosen by file extension (`amlg` through the
//! parser, `json` through serde). Permissions gate the calls at the opcode
//! layer; failures surface as null results there, never as panics.

use crate::entity::Entity;
use crate::node::{NodeHandle, NodeManager, NodeRef, NodeType};
use crate::string_pool::string_pool;
use anyhow::{anyhow, Context, Result};
use hashbrown::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

/// Abstract description of a load or store target.
#[derive(Clone, Debug, Default)]
pub struct AssetParameters {
    pub resource_path: String,
    /// File type; derived from the path's extension when empty.
    pub file_type: String,
    /// Optional format-specific key/value parameters.
    pub params: HashMap<String, String>,
}

impl AssetParameters {
    pub fn new(resource_path: &str) -> AssetParameters {
        AssetParameters {
            resource_path: resource_path.to_string(),
            ..AssetParameters::default()
        }
    }

    fn effective_file_type(&self) -> String {
        if !self.file_type.is_empty() {
            return self.file_type.clone();
        }
        Path::new(&self.resource_path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("amlg")
            .to_string()
    }
}

/// Loader and storer of node trees and whole entities.
pub trait AssetManager: Send + Sync {
    /// Loads a node tree into `enm`; the second value carries parse
    /// warnings for the caller to surface.
    fn load(&self, params: &AssetParameters, enm: &NodeManager) -> Result<(NodeRef, Vec<String>)>;

    fn store(&self, params: &AssetParameters, node: NodeHandle) -> Result<()>;

    /// Loads a fully constructed entity, including seed and contained
    /// entity parameters when the format carries them.
    fn load_entity(&self, params: &AssetParameters) -> Result<Arc<Entity>>;

    fn store_entity(&self, params: &AssetParameters, entity: &Arc<Entity>) -> Result<()>;
}

/// The default file-backed asset manager.
#[derive(Default)]
pub struct FileAssetManager;

impl AssetManager for FileAssetManager {
    fn load(&self, params: &AssetParameters, enm: &NodeManager) -> Result<(NodeRef, Vec<String>)> {
        let text = std::fs::read_to_string(&params.resource_path)
            .with_context(|| format!("loading {}", params.resource_path))?;
        match params.effective_file_type().as_str() {
            "json" => {
                let value: serde_json::Value =
                    serde_json::from_str(&text).context("parsing json")?;
                Ok((NodeRef::new(json_to_node(&value, enm), true), Vec::new()))
            }
            _ => {
                let (node, warnings) = crate::code::parse_to_node(&text, enm);
                Ok((node, warnings))
            }
        }
    }

    fn store(&self, params: &AssetParameters, node: NodeHandle) -> Result<()> {
        let text = match params.effective_file_type().as_str() {
            "json" => serde_json::to_string_pretty(&node_to_json(node))?,
            _ => crate::code::unparse_node(node),
        };
        std::fs::write(&params.resource_path, text)
            .with_context(|| format!("storing {}", params.resource_path))?;
        log::debug!("stored asset {}", params.resource_path);
        Ok(())
    }

    fn load_entity(&self, params: &AssetParameters) -> Result<Arc<Entity>> {
        let seed = params.params.get("rand_seed").map(String::as_str).unwrap_or("");
        let entity = Entity::new(seed);
        let (code, warnings) = self.load(params, entity.node_manager())?;
        for warning in warnings {
            log::warn!("loading entity {}: {warning}", params.resource_path);
        }
        if code.is_null() {
            return Err(anyhow!("no code in {}", params.resource_path));
        }
        entity.set_root_directly(code.node);
        Ok(entity)
    }

    fn store_entity(&self, params: &AssetParameters, entity: &Arc<Entity>) -> Result<()> {
        self.store(params, entity.root_node())?;
        // contained entities store beside the root, one file per child id
        if entity.has_contained_entities() {
            let base = Path::new(&params.resource_path);
            let stem = base.file_stem().and_then(|s| s.to_str()).unwrap_or("entity");
            let dir = base.parent().unwrap_or_else(|| Path::new("."));
            for child in entity.contained_entities() {
                let child_path = dir.join(format!("{stem}.{}.amlg", child.id_string()));
                let child_params = AssetParameters {
                    resource_path: child_path.to_string_lossy().into_owned(),
                    file_type: "amlg".to_string(),
                    params: params.params.clone(),
                };
                self.store_entity(&child_params, &child)?;
            }
        }
        Ok(())
    }
}

static ASSET_MANAGER: LazyLock<Arc<dyn AssetManager>> =
    LazyLock::new(|| Arc::new(FileAssetManager));

/// The process-wide asset manager service.
pub fn asset_manager() -> &'static Arc<dyn AssetManager> {
    &ASSET_MANAGER
}

/// Converts a JSON document to a node tree: objects become assocs, arrays
/// lists, scalars their immediate counterparts.
pub fn json_to_node(value: &serde_json::Value, enm: &NodeManager) -> NodeHandle {
    use serde_json::Value;
    match value {
        Value::Null => enm.alloc_node(NodeType::Null),
        Value::Bool(b) => enm.alloc_bool_node(*b),
        Value::Number(n) => enm.alloc_number_node(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => enm.alloc_string_node(s),
        Value::Array(items) => {
            let children: Vec<NodeHandle> =
                items.iter().map(|item| json_to_node(item, enm)).collect();
            enm.alloc_list_node(&children)
        }
        Value::Object(map) => {
            let assoc = enm.alloc_node(NodeType::Assoc);
            let pool = string_pool();
            for (key, item) in map {
                let key_id = pool.create_reference(key);
                assoc.set_mapped_child(key_id, json_to_node(item, enm));
                pool.destroy_reference(key_id);
            }
            assoc
        }
    }
}

/// Converts a node tree to JSON; opcodes without a JSON counterpart render
/// as their unparsed text.
pub fn node_to_json(n: NodeHandle) -> serde_json::Value {
    use serde_json::Value;
    if n.is_null() {
        return Value::Null;
    }
    match n.node_type() {
        NodeType::Null => Value::Null,
        NodeType::True => Value::Bool(true),
        NodeType::False => Value::Bool(false),
        NodeType::Number => serde_json::Number::from_f64(n.number_value())
            .map(Value::Number)
            .unwrap_or(Value::Null),
        NodeType::StringLiteral | NodeType::Symbol => Value::String(n.string_value()),
        NodeType::List => Value::Array(n.ordered_children().iter().map(|&c| node_to_json(c)).collect()),
        NodeType::Assoc => {
            let pool = string_pool();
            let mut map = serde_json::Map::new();
            for (key, child) in n.mapped_children_sorted() {
                map.insert(pool.string(key), node_to_json(child));
            }
            Value::Object(map)
        }
        _ => Value::String(crate::code::unparse_node(n)),
    }
}
