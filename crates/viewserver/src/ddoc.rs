use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, error};

use crate::error::ViewServerError;
use crate::eval::{FunctionHandle, ModuleHandle};

/// One node of a cached design document.
///
/// String leaves start out as [`Source`](DdocNode::Source) and are swapped for
/// a compiled handle the first time they are compiled, so repeated lookups of
/// the same design function or `require` module never recompile.
#[derive(Debug)]
pub enum DdocNode {
    /// Nested object.
    Map(BTreeMap<String, NodeRef>),
    /// Any non-object, non-string leaf.
    Json(Value),
    /// A string leaf; potentially a function or module source.
    Source(String),
    /// Compiled design function.
    Fn(FunctionHandle),
    /// Compiled `require` module.
    Module(ModuleHandle),
}

pub type NodeRef = Rc<RefCell<DdocNode>>;

impl DdocNode {
    pub fn from_value(value: &Value) -> NodeRef {
        let node = match value {
            Value::Object(map) => DdocNode::Map(
                map.iter()
                    .map(|(key, value)| (key.clone(), DdocNode::from_value(value)))
                    .collect(),
            ),
            Value::String(source) => DdocNode::Source(source.clone()),
            other => DdocNode::Json(other.clone()),
        };
        Rc::new(RefCell::new(node))
    }

    /// Child lookup; `None` for leaves and missing keys.
    pub fn child(&self, key: &str) -> Option<NodeRef> {
        match self {
            DdocNode::Map(map) => map.get(key).cloned(),
            _ => None,
        }
    }
}

/// Walks `path` down a design document.
///
/// Every missing step is a recoverable `not_found`; the host asked for a
/// function this design document simply does not have.
pub fn lookup(root: &NodeRef, ddoc_id: &str, path: &[String]) -> Result<NodeRef, ViewServerError> {
    let mut node = root.clone();
    for item in path {
        let next = node.borrow().child(item);
        node = next.ok_or_else(|| {
            let msg = format!(
                "Missed function `{item}` in design doc `{ddoc_id}` by path: {}",
                path.join("/")
            );
            error!("{msg}");
            ViewServerError::error("not_found", msg)
        })?;
    }
    Ok(node)
}

/// Cache of installed design documents, keyed by id.
///
/// Survives `reset`: the host re-installs design documents explicitly via
/// `ddoc new`, never implicitly.
#[derive(Default)]
pub struct DdocCache {
    ddocs: HashMap<String, NodeRef>,
}

impl DdocCache {
    /// Installs (or replaces) a design document under `ddoc_id`.
    ///
    /// The stored tree always carries `_id` equal to the id it was installed
    /// under.
    pub fn insert(&mut self, ddoc_id: &str, ddoc: &Value) {
        debug!(%ddoc_id, "cache design document");
        let root = DdocNode::from_value(ddoc);
        if let DdocNode::Map(map) = &mut *root.borrow_mut() {
            map.insert(
                "_id".to_string(),
                Rc::new(RefCell::new(DdocNode::Source(ddoc_id.to_string()))),
            );
        }
        self.ddocs.insert(ddoc_id.to_string(), root);
    }

    /// Looks up a previously installed design document.
    ///
    /// An unknown id is a protocol violation: the host must install a design
    /// document before invoking functions from it.
    pub fn get(&self, ddoc_id: &str) -> Result<NodeRef, ViewServerError> {
        self.ddocs.get(ddoc_id).cloned().ok_or_else(|| {
            let msg = format!("uncached design doc: {ddoc_id}");
            error!("{msg}");
            ViewServerError::fatal("query_protocol_error", msg)
        })
    }
}
