use std::rc::Rc;

use tracing::debug;

use crate::ddoc::{DdocNode, NodeRef};
use crate::error::ViewServerError;

/// One step of a `require` resolution chain.
///
/// Records form a parent-linked path from the design-document root down to a
/// module leaf; `id` is the slash-joined path traversed so far. The chain is
/// what makes relative requires (`.` and `..`) from inside a module work.
#[derive(Debug)]
pub struct ModuleRecord {
    pub id: String,
    pub parent: Option<Rc<ModuleRecord>>,
    pub node: NodeRef,
}

impl ModuleRecord {
    /// Root record for a design document; the starting point of every
    /// top-level `require` inside a compiled function.
    pub fn root(ddoc: NodeRef) -> Rc<ModuleRecord> {
        Rc::new(ModuleRecord {
            id: String::new(),
            parent: None,
            node: ddoc,
        })
    }
}

fn invalid(reason: String) -> ViewServerError {
    ViewServerError::error("invalid_require_path", reason)
}

fn root_of(record: &Rc<ModuleRecord>) -> Rc<ModuleRecord> {
    let mut cursor = record.clone();
    while let Some(parent) = cursor.parent.clone() {
        cursor = parent;
    }
    cursor
}

/// Resolves a `require` path to a module record.
///
/// Segments name children; `.` stays in the current directory and `..` steps
/// up one. A path whose first segment is a name resolves from the
/// design-document root; a path starting with `.` or `..` resolves relative
/// to `start` (the record of the module currently executing). Empty segments
/// (a leading slash, `//`, or a trailing slash) are illegal, as is a leaf
/// that is not module source.
pub fn resolve(
    path: &str,
    start: &Rc<ModuleRecord>,
) -> Result<Rc<ModuleRecord>, ViewServerError> {
    debug!(%path, from = %start.id, "resolving require path");
    let segments: Vec<&str> = path.split('/').collect();
    let relative = matches!(segments[0], "." | "..");
    let mut cursor = if relative {
        start
            .parent
            .clone()
            .ok_or_else(|| invalid(format!("Object `{}` has no parent.", start.id)))?
    } else {
        root_of(start)
    };
    for segment in segments {
        match segment {
            "" => {
                return Err(invalid(
                    "Required path shouldn't start with slash character \
                     or contain sequence of slashes."
                        .to_string(),
                ))
            }
            "." => {}
            ".." => {
                cursor = cursor
                    .parent
                    .clone()
                    .ok_or_else(|| invalid(format!("Object `{}` has no parent.", cursor.id)))?;
            }
            name => {
                let child = cursor.node.borrow().child(name).ok_or_else(|| {
                    invalid(format!("Object `{}` has no property `{name}`", cursor.id))
                })?;
                let id = if cursor.id.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{name}", cursor.id)
                };
                cursor = Rc::new(ModuleRecord {
                    id,
                    parent: Some(cursor.clone()),
                    node: child,
                });
            }
        }
    }
    match &*cursor.node.borrow() {
        DdocNode::Source(_) | DdocNode::Module(_) => {}
        _ => {
            return Err(invalid(format!(
                "Cannot require `{}`: not a module source",
                cursor.id
            )))
        }
    }
    Ok(cursor)
}
