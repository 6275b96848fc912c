use std::collections::{BTreeMap, HashMap};

use serde_json::Value as JsonValue;

use crate::path::Pointer;
use crate::types::ReplicantIdentity;

/// Stable identity token for one composite node in a replicant's value tree.
/// The token plays the role the raw object identity plays in a runtime with
/// weak maps: it survives moves within the tree and dies on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

#[derive(Debug, Clone)]
pub(crate) struct NodeMeta {
    pub owner: ReplicantIdentity,
    pub path: Pointer,
}

/// Replicator-scoped ownership registry. Entries exist exactly for the
/// composites currently reachable from some replicant's value; `overwrite`
/// and `delete` release the affected subtree.
#[derive(Debug, Default)]
pub(crate) struct OwnerRegistry {
    next_id: u64,
    nodes: HashMap<NodeId, NodeMeta>,
}

impl OwnerRegistry {
    pub fn allocate(&mut self, owner: ReplicantIdentity, path: Pointer) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.nodes.insert(id, NodeMeta { owner, path });
        id
    }

    pub fn meta(&self, id: NodeId) -> Option<&NodeMeta> {
        self.nodes.get(&id)
    }

    pub fn set_path(&mut self, id: NodeId, path: Pointer) {
        if let Some(meta) = self.nodes.get_mut(&id) {
            meta.path = path;
        }
    }

    pub fn remove(&mut self, id: NodeId) {
        self.nodes.remove(&id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Structural mirror of the composite skeleton of one replicant's value.
/// Object nodes track only their composite children; sequence nodes keep one
/// slot per element so indices stay aligned with the raw array.
#[derive(Debug, Clone)]
pub(crate) struct ShadowNode {
    pub id: NodeId,
    pub children: ShadowChildren,
}

#[derive(Debug, Clone)]
pub(crate) enum ShadowChildren {
    Map(BTreeMap<String, ShadowNode>),
    Seq(Vec<Option<ShadowNode>>),
}

impl ShadowNode {
    pub fn descend(&self, segments: &[String]) -> Option<&ShadowNode> {
        let mut current = self;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    pub fn child(&self, segment: &str) -> Option<&ShadowNode> {
        match &self.children {
            ShadowChildren::Map(map) => map.get(segment),
            ShadowChildren::Seq(slots) => slots
                .get(crate::path::parse_index(segment)?)
                .and_then(Option::as_ref),
        }
    }

    pub fn child_mut(&mut self, segment: &str) -> Option<&mut ShadowNode> {
        match &mut self.children {
            ShadowChildren::Map(map) => map.get_mut(segment),
            ShadowChildren::Seq(slots) => slots
                .get_mut(crate::path::parse_index(segment)?)
                .and_then(Option::as_mut),
        }
    }

    pub fn descend_mut(&mut self, segments: &[String]) -> Option<&mut ShadowNode> {
        let mut current = self;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }
}

/// Allocates shadow nodes for every composite reachable from `value`,
/// registering each under `owner` at its path. Primitives are owner-free and
/// get no node.
pub(crate) fn wrap_value(
    registry: &mut OwnerRegistry,
    owner: &ReplicantIdentity,
    path: &Pointer,
    value: &JsonValue,
) -> Option<ShadowNode> {
    match value {
        JsonValue::Object(map) => {
            let id = registry.allocate(owner.clone(), path.clone());
            let mut children = BTreeMap::new();
            for (key, child) in map {
                if let Some(node) = wrap_value(registry, owner, &path.child(key.clone()), child) {
                    children.insert(key.clone(), node);
                }
            }
            Some(ShadowNode {
                id,
                children: ShadowChildren::Map(children),
            })
        }
        JsonValue::Array(items) => {
            let id = registry.allocate(owner.clone(), path.clone());
            let slots = items
                .iter()
                .enumerate()
                .map(|(index, child)| {
                    wrap_value(registry, owner, &path.child(index.to_string()), child)
                })
                .collect();
            Some(ShadowNode {
                id,
                children: ShadowChildren::Seq(slots),
            })
        }
        _ => None,
    }
}

/// Removes the subtree's registry entries. Call when a composite becomes
/// unreachable (overwritten, deleted, or spliced out).
pub(crate) fn release(registry: &mut OwnerRegistry, node: &ShadowNode) {
    registry.remove(node.id);
    match &node.children {
        ShadowChildren::Map(map) => {
            for child in map.values() {
                release(registry, child);
            }
        }
        ShadowChildren::Seq(slots) => {
            for child in slots.iter().flatten() {
                release(registry, child);
            }
        }
    }
}

/// Rewrites the registry paths of `node` and all descendants relative to
/// `path`. This is how a moved subtree's interposers learn their new home.
pub(crate) fn rebind(registry: &mut OwnerRegistry, node: &ShadowNode, path: &Pointer) {
    registry.set_path(node.id, path.clone());
    match &node.children {
        ShadowChildren::Map(map) => {
            for (key, child) in map {
                rebind(registry, child, &path.child(key.clone()));
            }
        }
        ShadowChildren::Seq(slots) => {
            for (index, child) in slots.iter().enumerate() {
                if let Some(child) = child {
                    rebind(registry, child, &path.child(index.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> ReplicantIdentity {
        ReplicantIdentity::new("bundle", "state")
    }

    #[test]
    fn wrap_tracks_only_composites() {
        let mut registry = OwnerRegistry::default();
        let value = json!({"a": {"b": [1, {"c": 2}]}, "n": 7});
        let root = wrap_value(&mut registry, &identity(), &Pointer::root(), &value).unwrap();

        // root, /a, /a/b, /a/b/1
        assert_eq!(registry.len(), 4);
        let nested = root.descend(&["a".into(), "b".into(), "1".into()]).unwrap();
        assert_eq!(
            registry.meta(nested.id).unwrap().path.render(),
            "/a/b/1"
        );
        assert!(root.child("n").is_none());
    }

    #[test]
    fn release_clears_subtree_entries() {
        let mut registry = OwnerRegistry::default();
        let value = json!({"a": {"b": [[1], [2]]}});
        let root = wrap_value(&mut registry, &identity(), &Pointer::root(), &value).unwrap();
        assert_eq!(registry.len(), 5);

        let subtree = root.descend(&["a".into()]).unwrap();
        release(&mut registry, subtree);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rebind_rewrites_descendant_paths() {
        let mut registry = OwnerRegistry::default();
        let value = json!({"inner": [{"k": 1}]});
        let root = wrap_value(&mut registry, &identity(), &Pointer::root(), &value).unwrap();

        let moved = Pointer::parse("/moved").unwrap();
        rebind(&mut registry, &root, &moved);
        let element = root
            .descend(&["inner".into(), "0".into()])
            .unwrap();
        assert_eq!(
            registry.meta(element.id).unwrap().path.render(),
            "/moved/inner/0"
        );
    }
}
