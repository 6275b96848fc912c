use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::operation::OpMethod;
use crate::ownership::NodeId;
use crate::replicant::Replicant;
use crate::ReplicantError;

/// A value being grafted into a replicant: either detached JSON, or a live
/// handle whose provenance is checked against the target's ownership.
pub enum Graft {
    Value(JsonValue),
    Handle(ValueHandle),
}

impl From<JsonValue> for Graft {
    fn from(value: JsonValue) -> Self {
        Graft::Value(value)
    }
}

impl From<ValueHandle> for Graft {
    fn from(handle: ValueHandle) -> Self {
        Graft::Handle(handle)
    }
}

impl From<&ValueHandle> for Graft {
    fn from(handle: &ValueHandle) -> Self {
        Graft::Handle(handle.clone())
    }
}

impl From<&str> for Graft {
    fn from(value: &str) -> Self {
        Graft::Value(JsonValue::String(value.to_string()))
    }
}

impl From<String> for Graft {
    fn from(value: String) -> Self {
        Graft::Value(JsonValue::String(value))
    }
}

impl From<i64> for Graft {
    fn from(value: i64) -> Self {
        Graft::Value(json!(value))
    }
}

impl From<f64> for Graft {
    fn from(value: f64) -> Self {
        Graft::Value(json!(value))
    }
}

impl From<bool> for Graft {
    fn from(value: bool) -> Self {
        Graft::Value(JsonValue::Bool(value))
    }
}

/// Live handle to one composite inside a replicant's value tree. The handle
/// resolves its current path through the ownership registry at call time, so
/// it follows its subtree when the subtree moves. Reads pass through; writes,
/// deletes, and the sequence mutators are captured as operations.
#[derive(Clone)]
pub struct ValueHandle {
    replicant: Arc<Replicant>,
    node: NodeId,
}

impl ValueHandle {
    pub(crate) fn new(replicant: Arc<Replicant>, node: NodeId) -> Self {
        Self { replicant, node }
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.node
    }

    pub(crate) fn owner_replicant(&self) -> &Arc<Replicant> {
        &self.replicant
    }

    /// Current slash-rooted path of the wrapped composite.
    pub fn path(&self) -> Result<String, ReplicantError> {
        Ok(self.replicant.node_pointer(self.node)?.render())
    }

    /// Navigates to a nested composite. Fails when the member is absent or a
    /// primitive (primitives are read with [`get`](Self::get)).
    pub fn at(&self, key: &str) -> Result<ValueHandle, ReplicantError> {
        let child = self.replicant.child_node(self.node, key)?;
        Ok(ValueHandle::new(Arc::clone(&self.replicant), child))
    }

    pub fn at_index(&self, index: usize) -> Result<ValueHandle, ReplicantError> {
        self.at(&index.to_string())
    }

    /// Deep clone of the wrapped composite.
    pub fn fetch(&self) -> Result<JsonValue, ReplicantError> {
        let pointer = self.replicant.node_pointer(self.node)?;
        self.replicant
            .value_at_pointer(&pointer)
            .ok_or_else(|| ReplicantError::internal("handle no longer resolves"))
    }

    /// Deep clone of one member; `None` when absent.
    pub fn get(&self, key: &str) -> Result<Option<JsonValue>, ReplicantError> {
        let pointer = self.replicant.node_pointer(self.node)?;
        Ok(self
            .replicant
            .value_at_pointer(&pointer.child(key.to_string())))
    }

    pub fn len(&self) -> Result<usize, ReplicantError> {
        match self.fetch()? {
            JsonValue::Array(items) => Ok(items.len()),
            JsonValue::Object(map) => Ok(map.len()),
            _ => Err(ReplicantError::internal("handle target is not a composite")),
        }
    }

    pub fn is_empty(&self) -> Result<bool, ReplicantError> {
        Ok(self.len()? == 0)
    }

    pub fn set(&self, key: &str, graft: impl Into<Graft>) -> Result<(), ReplicantError> {
        let parent = self.replicant.node_pointer(self.node)?;
        self.replicant.stage_assign(&parent, key, graft.into())
    }

    pub fn set_index(&self, index: usize, graft: impl Into<Graft>) -> Result<(), ReplicantError> {
        self.set(&index.to_string(), graft)
    }

    pub fn remove(&self, key: &str) -> Result<(), ReplicantError> {
        let parent = self.replicant.node_pointer(self.node)?;
        self.replicant.stage_remove(&parent, key)
    }

    pub fn push(
        &self,
        items: impl IntoIterator<Item = JsonValue>,
    ) -> Result<(), ReplicantError> {
        self.mutate(OpMethod::Push, items.into_iter().collect())
    }

    pub fn pop(&self) -> Result<(), ReplicantError> {
        self.mutate(OpMethod::Pop, Vec::new())
    }

    pub fn shift(&self) -> Result<(), ReplicantError> {
        self.mutate(OpMethod::Shift, Vec::new())
    }

    pub fn unshift(
        &self,
        items: impl IntoIterator<Item = JsonValue>,
    ) -> Result<(), ReplicantError> {
        self.mutate(OpMethod::Unshift, items.into_iter().collect())
    }

    pub fn reverse(&self) -> Result<(), ReplicantError> {
        self.mutate(OpMethod::Reverse, Vec::new())
    }

    pub fn sort(&self) -> Result<(), ReplicantError> {
        self.mutate(OpMethod::Sort, Vec::new())
    }

    pub fn splice(
        &self,
        start: i64,
        delete_count: Option<i64>,
        items: impl IntoIterator<Item = JsonValue>,
    ) -> Result<(), ReplicantError> {
        let items: Vec<JsonValue> = items.into_iter().collect();
        let mut args = vec![json!(start)];
        match delete_count {
            Some(count) => args.push(json!(count)),
            None => {
                if !items.is_empty() {
                    return Err(ReplicantError::internal(
                        "splice items require an explicit delete count",
                    ));
                }
            }
        }
        args.extend(items);
        self.mutate(OpMethod::Splice, args)
    }

    pub fn fill(
        &self,
        value: JsonValue,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), ReplicantError> {
        let mut args = vec![value];
        match (start, end) {
            (None, None) => {}
            (Some(start), None) => args.push(json!(start)),
            (start, Some(end)) => {
                args.push(json!(start.unwrap_or(0)));
                args.push(json!(end));
            }
        }
        self.mutate(OpMethod::Fill, args)
    }

    pub fn copy_within(
        &self,
        target: i64,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), ReplicantError> {
        let mut args = vec![json!(target)];
        match (start, end) {
            (None, None) => {}
            (Some(start), None) => args.push(json!(start)),
            (start, Some(end)) => {
                args.push(json!(start.unwrap_or(0)));
                args.push(json!(end));
            }
        }
        self.mutate(OpMethod::CopyWithin, args)
    }

    fn mutate(&self, method: OpMethod, args: Vec<JsonValue>) -> Result<(), ReplicantError> {
        let pointer = self.replicant.node_pointer(self.node)?;
        self.replicant.stage_seq(&pointer, method, args)
    }
}
