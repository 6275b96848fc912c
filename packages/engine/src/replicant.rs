use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value as JsonValue;

use crate::change_stream::{ChangeBus, ChangeEvent, ChangeStream};
use crate::operation::{
    apply_operation, assign_property, delete_property, seq_mutate, sort_render, OpArgs, OpMethod,
    Operation, OperationEnvelope, ProposalEnvelope,
};
use crate::ownership::{rebind, release, wrap_value, NodeId, OwnerRegistry, ShadowChildren, ShadowNode};
use crate::path::{parse_index, Pointer};
use crate::persistence::PersistedBlob;
use crate::proxy::{Graft, ValueHandle};
use crate::replicator::RuntimeShared;
use crate::schema::{format_issues, ReplicantSchema, ValidationIssue};
use crate::types::{DeclareOpts, ReplicantIdentity, ReplicantStatus, ReplicatorRole};
use crate::ReplicantError;

pub(crate) struct ReplicantState {
    status: ReplicantStatus,
    revision: u64,
    value: Option<JsonValue>,
    shadow: Option<ShadowNode>,
    schema: Option<ReplicantSchema>,
    validation_errors: Vec<ValidationIssue>,
    queue: Vec<Operation>,
    pending_flush: bool,
    turn_old_value: Option<Option<JsonValue>>,
    buffered_inbound: Vec<OperationEnvelope>,
}

/// A named, namespaced, schema-validated, observable state cell. Mutations go
/// through the handle/path surface, are validated and enqueued, and take
/// effect as an ordered operation stream at the next flush.
pub struct Replicant {
    identity: ReplicantIdentity,
    opts: DeclareOpts,
    shared: Arc<RuntimeShared>,
    state: Mutex<ReplicantState>,
    bus: Arc<ChangeBus>,
    suspended: AtomicBool,
}

impl std::fmt::Debug for Replicant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicant")
            .field("identity", &self.identity)
            .field("status", &self.status())
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

enum ResolvedGraft {
    Detached(JsonValue),
    SameOwner { src: Pointer },
}

impl Replicant {
    pub(crate) fn new(
        identity: ReplicantIdentity,
        opts: DeclareOpts,
        schema: Option<ReplicantSchema>,
        shared: Arc<RuntimeShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            opts,
            shared,
            state: Mutex::new(ReplicantState {
                status: ReplicantStatus::Undeclared,
                revision: 0,
                value: None,
                shadow: None,
                schema,
                validation_errors: Vec::new(),
                queue: Vec::new(),
                pending_flush: false,
                turn_old_value: None,
                buffered_inbound: Vec::new(),
            }),
            bus: Arc::new(ChangeBus::default()),
            suspended: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &ReplicantIdentity {
        &self.identity
    }

    pub fn namespace(&self) -> &str {
        &self.identity.namespace
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn opts(&self) -> &DeclareOpts {
        &self.opts
    }

    pub fn status(&self) -> ReplicantStatus {
        self.state.lock().unwrap().status
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().unwrap().revision
    }

    /// Deep clone of the current value (`None` while undefined).
    pub fn get(&self) -> Option<JsonValue> {
        self.state.lock().unwrap().value.clone()
    }

    pub fn value_at(&self, path: &str) -> Result<Option<JsonValue>, ReplicantError> {
        let pointer = Pointer::parse(path)?;
        Ok(self.value_at_pointer(&pointer))
    }

    pub fn schema_sum(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.schema.as_ref().map(|schema| schema.sum().to_string())
    }

    pub fn schema_raw(&self) -> Option<JsonValue> {
        let state = self.state.lock().unwrap();
        state.schema.as_ref().map(|schema| schema.raw().clone())
    }

    /// Most recent validation failure report.
    pub fn validation_errors(&self) -> Vec<ValidationIssue> {
        self.state.lock().unwrap().validation_errors.clone()
    }

    /// Subscribes to flushed change batches. On a declared replicant the
    /// stream is seeded synchronously with the current value; the seed is
    /// delivered exactly once and never re-armed, so consuming a single event
    /// is the one-shot discipline.
    pub fn changes(&self) -> ChangeStream {
        let state = self.state.lock().unwrap();
        let initial = (state.status == ReplicantStatus::Declared).then(|| ChangeEvent {
            revision: state.revision,
            new_value: state.value.clone(),
            old_value: None,
            operations: Vec::new(),
        });
        drop(state);
        self.bus.subscribe(initial)
    }

    /// Runs the compiled schema against `candidate` (the current value when
    /// `None`), recording the failure report and failing on invalid input.
    pub fn validate(&self, candidate: Option<&JsonValue>) -> Result<(), ReplicantError> {
        let mut state = self.state.lock().unwrap();
        let issues = {
            let Some(schema) = state.schema.as_ref() else {
                return Ok(());
            };
            let target = match candidate.or(state.value.as_ref()) {
                Some(target) => target,
                None => return Ok(()),
            };
            schema.check(target)
        };
        if issues.is_empty() {
            state.validation_errors.clear();
            return Ok(());
        }
        let error = schema_failure(&issues);
        state.validation_errors = issues;
        Err(error)
    }

    /// Boolean form of [`validate`](Self::validate); never fails, never
    /// mutates anything beyond the recorded failure report.
    pub fn is_valid(&self, candidate: Option<&JsonValue>) -> bool {
        self.validate(candidate).is_ok()
    }

    /// Live handle to the root composite; the entry point of the mutation
    /// interception surface.
    pub fn root(self: &Arc<Self>) -> Result<ValueHandle, ReplicantError> {
        let state = self.state.lock().unwrap();
        let node = state.shadow.as_ref().map(|node| node.id).ok_or_else(|| {
            ReplicantError::internal(format!(
                "replicant '{}' has no composite value to proxy",
                self.identity
            ))
        })?;
        drop(state);
        Ok(ValueHandle::new(Arc::clone(self), node))
    }

    /// Replaces the whole tree via an `overwrite` operation.
    pub fn replace(&self, new_value: JsonValue) -> Result<(), ReplicantError> {
        let mut state = self.state.lock().unwrap();
        let operation = Operation::overwrite(new_value);
        if self.is_suspended() {
            return self.apply_live(&mut state, &operation);
        }
        let OpArgs::Overwrite { new_value } = &operation.args else {
            unreachable!()
        };
        if state.value.as_ref() == Some(new_value) {
            return Ok(());
        }
        gate_operation(&mut state, &operation, false)?;
        self.enqueue(&mut state, operation.clone());
        if self.shared.role == ReplicatorRole::Authoritative {
            self.apply_live(&mut state, &operation)?;
        }
        Ok(())
    }

    /// Assigns the property named by the last path segment. Emits `update`
    /// when the property already exists, `add` otherwise; a write that is
    /// strictly equal to the current value is a no-op.
    pub fn set(&self, path: &str, graft: impl Into<Graft>) -> Result<(), ReplicantError> {
        let pointer = Pointer::parse(path)?;
        let Some(parent) = pointer.parent() else {
            return Err(ReplicantError::internal(
                "cannot assign the root path; use replace",
            ));
        };
        let prop = pointer.last().unwrap_or_default().to_string();
        self.stage_assign(&parent, &prop, graft.into())
    }

    /// Deletes the property named by the last path segment; trivially Ok when
    /// the property is absent.
    pub fn remove(&self, path: &str) -> Result<(), ReplicantError> {
        let pointer = Pointer::parse(path)?;
        let Some(parent) = pointer.parent() else {
            return Err(ReplicantError::internal(
                "cannot delete the root path; use replace",
            ));
        };
        let prop = pointer.last().unwrap_or_default().to_string();
        self.stage_remove(&parent, &prop)
    }

    /// Invokes one of the recognized sequence mutators on the sequence at
    /// `path`, carrying the literal arguments.
    pub fn mutate_seq(
        &self,
        path: &str,
        method: OpMethod,
        args: Vec<JsonValue>,
    ) -> Result<(), ReplicantError> {
        let pointer = Pointer::parse(path)?;
        self.stage_seq(&pointer, method, args)
    }

    pub(crate) fn stage_assign(
        &self,
        parent: &Pointer,
        prop: &str,
        graft: Graft,
    ) -> Result<(), ReplicantError> {
        let resolved = self.resolve_graft(graft)?;
        let mut state = self.state.lock().unwrap();
        let dest = parent.child(prop.to_string());

        let (new_value, moved_from) = match resolved {
            ResolvedGraft::Detached(value) => (value, None),
            ResolvedGraft::SameOwner { src } => {
                if dest == src {
                    return Ok(());
                }
                if dest.is_under(&src) {
                    return Err(ReplicantError::internal(format!(
                        "cannot graft the composite at '{src}' into its own subtree at '{dest}'"
                    )));
                }
                let root = state.value.as_ref().ok_or_else(|| {
                    ReplicantError::internal("handle no longer resolves: value is undefined")
                })?;
                let value = src
                    .resolve(root)
                    .ok_or_else(|| {
                        ReplicantError::internal(format!("handle path '{src}' no longer resolves"))
                    })?
                    .clone();
                (value, Some(src))
            }
        };

        if self.is_suspended() {
            let operation = Operation::assign(parent, prop, new_value, true);
            return self.apply_live(&mut state, &operation);
        }

        let root = state.value.as_ref().ok_or_else(|| {
            ReplicantError::internal(format!(
                "path '{parent}' does not resolve: value is undefined"
            ))
        })?;
        let target = resolve_required(root, parent)?;
        let existing = match target {
            JsonValue::Object(map) => {
                if map.get(prop) == Some(&new_value) {
                    return Ok(());
                }
                map.contains_key(prop)
            }
            JsonValue::Array(items) => {
                let Some(index) = parse_index(prop) else {
                    return Err(ReplicantError::internal(format!(
                        "'{prop}' is not a valid sequence index at '{parent}'"
                    )));
                };
                if index < items.len() {
                    if items[index] == new_value {
                        return Ok(());
                    }
                    true
                } else if index == items.len() {
                    false
                } else {
                    return Err(ReplicantError::internal(format!(
                        "index {index} is out of bounds at '{parent}'"
                    )));
                }
            }
            _ => {
                return Err(ReplicantError::internal(format!(
                    "cannot assign '{prop}' at '{parent}': target is not a composite"
                )))
            }
        };

        let operation = Operation::assign(parent, prop, new_value, existing);
        gate_operation(&mut state, &operation, false)?;
        self.enqueue(&mut state, operation.clone());
        if self.shared.role == ReplicatorRole::Authoritative {
            match moved_from {
                None => self.apply_live(&mut state, &operation)?,
                Some(src) => self.apply_move(&mut state, &src, &dest, &operation)?,
            }
        }
        Ok(())
    }

    pub(crate) fn stage_remove(&self, parent: &Pointer, prop: &str) -> Result<(), ReplicantError> {
        let mut state = self.state.lock().unwrap();
        let operation = Operation::delete(parent, prop);
        if self.is_suspended() {
            return self.apply_live(&mut state, &operation);
        }
        let Some(root) = state.value.as_ref() else {
            return Ok(());
        };
        let target = resolve_required(root, parent)?;
        match target {
            JsonValue::Object(map) => {
                if !map.contains_key(prop) {
                    return Ok(());
                }
            }
            JsonValue::Array(_) => {
                return Err(ReplicantError::internal(format!(
                    "delete is not supported on sequences at '{parent}'; use splice"
                )))
            }
            _ => {
                return Err(ReplicantError::internal(format!(
                    "cannot delete '{prop}' at '{parent}': target is not a composite"
                )))
            }
        }
        gate_operation(&mut state, &operation, false)?;
        self.enqueue(&mut state, operation.clone());
        if self.shared.role == ReplicatorRole::Authoritative {
            self.apply_live(&mut state, &operation)?;
        }
        Ok(())
    }

    pub(crate) fn stage_seq(
        &self,
        pointer: &Pointer,
        method: OpMethod,
        args: Vec<JsonValue>,
    ) -> Result<(), ReplicantError> {
        if !method.is_sequence_mutator() {
            return Err(ReplicantError::internal(format!(
                "{method:?} is not a sequence mutator"
            )));
        }
        let mut state = self.state.lock().unwrap();
        let operation = Operation::sequence(pointer, method, args);
        if self.is_suspended() {
            return self.apply_live(&mut state, &operation);
        }
        // The dry run always happens for mutators so malformed arguments can
        // never enqueue an operation that later fails to apply.
        gate_operation(&mut state, &operation, true)?;
        self.enqueue(&mut state, operation.clone());
        if self.shared.role == ReplicatorRole::Authoritative {
            self.apply_live(&mut state, &operation)?;
        }
        Ok(())
    }

    /// Flushes the accumulated queue: bumps the revision, broadcasts the
    /// batch, and notifies local listeners (authoritative), or forwards the
    /// batch as proposed mutations (subscriber).
    pub(crate) fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_empty() {
            state.pending_flush = false;
            state.turn_old_value = None;
            return;
        }
        if state.status != ReplicantStatus::Declared {
            // Re-registered when the declaration completes.
            state.pending_flush = false;
            return;
        }
        let operations = std::mem::take(&mut state.queue);
        let old_value = state.turn_old_value.take().flatten();
        state.pending_flush = false;

        match self.shared.role {
            ReplicatorRole::Authoritative => {
                state.revision += 1;
                let revision = state.revision;
                let new_value = state.value.clone();
                drop(state);

                tracing::debug!(
                    replicant = %self.identity,
                    revision,
                    operations = operations.len(),
                    "flush"
                );
                let envelope = OperationEnvelope {
                    namespace: self.identity.namespace.clone(),
                    name: self.identity.name.clone(),
                    revision,
                    operations: operations.clone(),
                };
                self.shared.transport.broadcast(&envelope);
                self.mark_persistence_dirty(new_value.clone(), revision);
                self.bus.emit(ChangeEvent {
                    revision,
                    new_value,
                    old_value: Some(old_value.unwrap_or(JsonValue::Null)),
                    operations,
                });
            }
            ReplicatorRole::Subscriber => {
                drop(state);
                let envelope = ProposalEnvelope {
                    namespace: self.identity.namespace.clone(),
                    name: self.identity.name.clone(),
                    operations,
                };
                self.shared.transport.propose(&envelope);
            }
        }
    }

    /// Inbound path for authoritative broadcasts. Applied with interception
    /// suspended; batches arriving before the declaration completes are
    /// buffered.
    pub(crate) fn receive_envelope(
        &self,
        envelope: OperationEnvelope,
    ) -> Result<(), ReplicantError> {
        let mut state = self.state.lock().unwrap();
        if state.status != ReplicantStatus::Declared {
            state.buffered_inbound.push(envelope);
            return Ok(());
        }
        if envelope.revision <= state.revision {
            // Already reflected in the declared snapshot; applying again would
            // break the at-most-once effect.
            tracing::debug!(
                replicant = %self.identity,
                revision = envelope.revision,
                current = state.revision,
                "ignoring stale operation batch"
            );
            return Ok(());
        }
        let _guard = self.suspend();
        let old_value = state.value.clone();
        for operation in &envelope.operations {
            self.apply_live(&mut state, operation)?;
        }
        state.revision = envelope.revision;
        let new_value = state.value.clone();
        drop(state);
        self.bus.emit(ChangeEvent {
            revision: envelope.revision,
            new_value,
            old_value: Some(old_value.unwrap_or(JsonValue::Null)),
            operations: envelope.operations,
        });
        Ok(())
    }

    /// Authoritative intake of a subscriber's proposed batch. The whole batch
    /// is validated on a clone first; nothing is applied unless every
    /// operation passes.
    pub(crate) fn stage_remote_batch(
        &self,
        operations: Vec<Operation>,
    ) -> Result<(), ReplicantError> {
        let mut state = self.state.lock().unwrap();
        if state.status != ReplicantStatus::Declared {
            return Err(ReplicantError::undeclared_replicant(format!(
                "replicant '{}' is not declared yet",
                self.identity
            )));
        }

        let mut clone = state.value.clone();
        for operation in &operations {
            apply_operation(&mut clone, operation)?;
            let issues = match (state.schema.as_ref(), clone.as_ref()) {
                (Some(schema), Some(candidate)) => schema.check(candidate),
                _ => Vec::new(),
            };
            if !issues.is_empty() {
                let error = schema_failure(&issues);
                state.validation_errors = issues;
                return Err(error);
            }
        }

        let _guard = self.suspend();
        for operation in operations {
            self.enqueue(&mut state, operation.clone());
            self.apply_live(&mut state, &operation)?;
        }
        Ok(())
    }

    pub(crate) fn mark_declaring(&self) {
        self.state.lock().unwrap().status = ReplicantStatus::Declaring;
    }

    /// Completes the declaration with the initial value and revision, drains
    /// operation batches buffered while declaring, and notifies listeners.
    pub(crate) fn promote_declared(
        &self,
        initial: Option<JsonValue>,
        revision: u64,
        schema: Option<ReplicantSchema>,
    ) {
        let buffered;
        let event;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(schema) = schema {
                state.schema = Some(schema);
            }
            {
                let mut registry = self.shared.registry.lock().unwrap();
                let ReplicantState { value, shadow, .. } = &mut *state;
                if let Some(node) = shadow.take() {
                    release(&mut registry, &node);
                }
                *value = initial;
                *shadow = value
                    .as_ref()
                    .and_then(|v| wrap_value(&mut registry, &self.identity, &Pointer::root(), v));
            }
            state.revision = revision;
            state.status = ReplicantStatus::Declared;
            buffered = std::mem::take(&mut state.buffered_inbound);
            if !state.queue.is_empty() && !state.pending_flush {
                state.pending_flush = true;
                self.shared
                    .pending_flush
                    .lock()
                    .unwrap()
                    .push(self.identity.clone());
            }
            event = ChangeEvent {
                revision,
                new_value: state.value.clone(),
                old_value: None,
                operations: Vec::new(),
            };
        }
        tracing::info!(replicant = %self.identity, revision, "declared");
        self.bus.emit(event);
        for envelope in buffered {
            if let Err(error) = self.receive_envelope(envelope) {
                tracing::error!(
                    replicant = %self.identity,
                    error = %error,
                    "failed to apply buffered operation batch"
                );
            }
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Brackets an apply with interception suppressed. Resumption is
    /// guaranteed by `Drop`, including on error paths.
    pub(crate) fn suspend(&self) -> SuspendGuard<'_> {
        let was = self.suspended.swap(true, Ordering::SeqCst);
        debug_assert!(!was, "nested interception suspension is not supported");
        SuspendGuard { replicant: self }
    }

    pub(crate) fn value_at_pointer(&self, pointer: &Pointer) -> Option<JsonValue> {
        let state = self.state.lock().unwrap();
        state
            .value
            .as_ref()
            .and_then(|root| pointer.resolve(root))
            .cloned()
    }

    pub(crate) fn node_pointer(&self, node: NodeId) -> Result<Pointer, ReplicantError> {
        let registry = self.shared.registry.lock().unwrap();
        let meta = registry.meta(node).ok_or_else(|| {
            ReplicantError::internal(
                "handle refers to a value that is no longer part of the replicant",
            )
        })?;
        Ok(meta.path.clone())
    }

    /// Resolves a child composite of a handle's node, for navigation.
    pub(crate) fn child_node(&self, node: NodeId, segment: &str) -> Result<NodeId, ReplicantError> {
        let path = self.node_pointer(node)?;
        let state = self.state.lock().unwrap();
        let shadow_node = state
            .shadow
            .as_ref()
            .and_then(|root| root.descend(path.segments()))
            .ok_or_else(|| ReplicantError::internal("handle is no longer live"))?;
        let child = shadow_node.child(segment).ok_or_else(|| {
            ReplicantError::internal(format!(
                "no composite at '{}' under '{}'",
                segment,
                path.render()
            ))
        })?;
        Ok(child.id)
    }

    fn resolve_graft(&self, graft: Graft) -> Result<ResolvedGraft, ReplicantError> {
        match graft {
            Graft::Value(value) => Ok(ResolvedGraft::Detached(value)),
            Graft::Handle(handle) => {
                let meta = {
                    let registry = self.shared.registry.lock().unwrap();
                    registry.meta(handle.node_id()).cloned()
                };
                let Some(meta) = meta else {
                    return Err(ReplicantError::internal(
                        "handle refers to a value that is no longer part of any replicant",
                    ));
                };
                if meta.owner != self.identity {
                    let offending = handle.owner_replicant().value_at_pointer(&meta.path);
                    return Err(ReplicantError::cross_ownership(
                        format!(
                            "the composite at '{}' belongs to replicant '{}' and cannot be grafted into '{}'",
                            meta.path.render(),
                            meta.owner,
                            self.identity
                        ),
                        serde_json::json!({
                            "owner": meta.owner,
                            "target": self.identity,
                            "path": meta.path.render(),
                            "value": offending,
                        }),
                    ));
                }
                Ok(ResolvedGraft::SameOwner { src: meta.path })
            }
        }
    }

    fn enqueue(&self, state: &mut ReplicantState, operation: Operation) {
        if state.turn_old_value.is_none() {
            state.turn_old_value = Some(state.value.clone());
        }
        if !state.pending_flush {
            state.pending_flush = true;
            self.shared
                .pending_flush
                .lock()
                .unwrap()
                .push(self.identity.clone());
        }
        if operation.method == OpMethod::Overwrite {
            // Earlier operations under the overwritten subtree are redundant
            // and may reference paths the new tree no longer has.
            let overwritten = operation.pointer().unwrap_or_default();
            state.queue.retain(|earlier| {
                Pointer::parse(&earlier.path)
                    .map(|path| !path.is_under(&overwritten))
                    .unwrap_or(false)
            });
        }
        state.queue.push(operation);
    }

    fn apply_live(
        &self,
        state: &mut ReplicantState,
        operation: &Operation,
    ) -> Result<(), ReplicantError> {
        let mut registry = self.shared.registry.lock().unwrap();
        let ReplicantState { value, shadow, .. } = &mut *state;
        apply_live_inner(&mut registry, &self.identity, value, shadow, operation)
    }

    /// Same-owner graft: the value is copied to its new location and the
    /// moved subtree's interposer metadata is rebound to the new path, while
    /// the source location gets fresh tracking.
    fn apply_move(
        &self,
        state: &mut ReplicantState,
        src: &Pointer,
        dest: &Pointer,
        operation: &Operation,
    ) -> Result<(), ReplicantError> {
        let mut registry = self.shared.registry.lock().unwrap();
        let ReplicantState { value, shadow, .. } = &mut *state;
        let OpArgs::Assign { prop, new_value } = &operation.args else {
            return Err(ReplicantError::internal("move must carry an assign payload"));
        };

        let moved = take_shadow_at(shadow, src);
        if let Some(old) = take_shadow_at(shadow, dest) {
            release(&mut registry, &old);
        }

        let parent = dest.parent().ok_or_else(|| {
            ReplicantError::internal("graft destination cannot be the root path")
        })?;
        let root = value
            .as_mut()
            .ok_or_else(|| ReplicantError::internal("value is undefined"))?;
        let target = parent.resolve_mut(root).ok_or_else(|| {
            ReplicantError::internal(format!("path '{parent}' does not resolve"))
        })?;
        assign_property(target, prop, new_value.clone(), &operation.path)?;

        match moved {
            Some(node) => {
                rebind(&mut registry, &node, dest);
                install_shadow_at(shadow, dest, Some(node))?;
            }
            None => {
                let node = wrap_value(&mut registry, &self.identity, dest, new_value);
                install_shadow_at(shadow, dest, node)?;
            }
        }

        // The raw value still lives at the source; it gets new tracking so
        // the single-owner bookkeeping stays complete.
        let fresh = match value.as_ref().and_then(|root| src.resolve(root)) {
            Some(raw) if raw.is_object() || raw.is_array() => {
                wrap_value(&mut registry, &self.identity, src, raw)
            }
            _ => None,
        };
        if fresh.is_some() {
            install_shadow_at(shadow, src, fresh)?;
        }
        Ok(())
    }

    fn mark_persistence_dirty(&self, value: Option<JsonValue>, revision: u64) {
        if !self.opts.persistent {
            return;
        }
        let Some(persistence) = self.shared.persistence.as_ref() else {
            return;
        };
        let blob = PersistedBlob {
            value,
            revision,
            saved_at: Utc::now(),
        };
        persistence
            .lock()
            .unwrap()
            .mark_dirty(&self.identity, blob, self.opts.persistence_interval);
    }
}

pub(crate) struct SuspendGuard<'a> {
    replicant: &'a Replicant,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.replicant.suspended.store(false, Ordering::SeqCst);
    }
}

fn schema_failure(issues: &[ValidationIssue]) -> ReplicantError {
    ReplicantError::schema_validation(
        format_issues(issues),
        serde_json::to_value(issues).unwrap_or(JsonValue::Null),
    )
}

fn gate_operation(
    state: &mut ReplicantState,
    operation: &Operation,
    force_dry_run: bool,
) -> Result<(), ReplicantError> {
    if state.schema.is_none() && !force_dry_run {
        return Ok(());
    }
    let mut clone = state.value.clone();
    apply_operation(&mut clone, operation)?;
    let issues = match (state.schema.as_ref(), clone.as_ref()) {
        (Some(schema), Some(candidate)) => schema.check(candidate),
        _ => Vec::new(),
    };
    if issues.is_empty() {
        state.validation_errors.clear();
        return Ok(());
    }
    let error = schema_failure(&issues);
    state.validation_errors = issues;
    Err(error)
}

fn apply_live_inner(
    registry: &mut OwnerRegistry,
    identity: &ReplicantIdentity,
    value: &mut Option<JsonValue>,
    shadow: &mut Option<ShadowNode>,
    operation: &Operation,
) -> Result<(), ReplicantError> {
    let pointer = operation.pointer()?;

    if operation.method == OpMethod::Overwrite {
        let OpArgs::Overwrite { new_value } = &operation.args else {
            return Err(ReplicantError::internal("overwrite payload mismatch"));
        };
        if !pointer.is_root() {
            return Err(ReplicantError::internal(format!(
                "overwrite is only valid at the root path, got '{}'",
                operation.path
            )));
        }
        if let Some(node) = shadow.take() {
            release(registry, &node);
        }
        *value = Some(new_value.clone());
        *shadow = value
            .as_ref()
            .and_then(|v| wrap_value(registry, identity, &Pointer::root(), v));
        return Ok(());
    }

    let root = value
        .as_mut()
        .ok_or_else(|| ReplicantError::internal("value is undefined"))?;
    let target = pointer.resolve_mut(root).ok_or_else(|| {
        ReplicantError::internal(format!("path '{}' does not resolve", operation.path))
    })?;

    match operation.method {
        OpMethod::Add | OpMethod::Update => {
            let OpArgs::Assign { prop, new_value } = &operation.args else {
                return Err(ReplicantError::internal("assign payload mismatch"));
            };
            assign_property(target, prop, new_value.clone(), &operation.path)?;
            let child_path = pointer.child(prop.clone());
            if let Some(old) = take_shadow_at(shadow, &child_path) {
                release(registry, &old);
            }
            let node = wrap_value(registry, identity, &child_path, new_value);
            install_shadow_at(shadow, &child_path, node)
        }
        OpMethod::Delete => {
            let OpArgs::Delete { prop } = &operation.args else {
                return Err(ReplicantError::internal("delete payload mismatch"));
            };
            delete_property(target, prop, &operation.path)?;
            let child_path = pointer.child(prop.clone());
            if let Some(old) = take_shadow_at(shadow, &child_path) {
                release(registry, &old);
            }
            Ok(())
        }
        method if method.is_sequence_mutator() => {
            let OpArgs::Mutator { mutator_args, .. } = &operation.args else {
                return Err(ReplicantError::internal("mutator payload mismatch"));
            };
            let JsonValue::Array(items) = target else {
                return Err(ReplicantError::internal(format!(
                    "{method:?} target at '{}' is not a sequence",
                    operation.path
                )));
            };
            apply_seq_live(registry, identity, items, shadow, &pointer, method, mutator_args)
        }
        _ => unreachable!("overwrite handled above"),
    }
}

fn apply_seq_live(
    registry: &mut OwnerRegistry,
    identity: &ReplicantIdentity,
    items: &mut Vec<JsonValue>,
    shadow: &mut Option<ShadowNode>,
    pointer: &Pointer,
    method: OpMethod,
    mutator_args: &[JsonValue],
) -> Result<(), ReplicantError> {
    {
        let array_node = shadow
            .as_mut()
            .and_then(|root| root.descend_mut(pointer.segments()))
            .ok_or_else(|| ReplicantError::internal("sequence shadow missing"))?;
        let ShadowChildren::Seq(slots) = &mut array_node.children else {
            return Err(ReplicantError::internal("sequence shadow shape mismatch"));
        };

        let prior: Vec<ShadowNode> = slots.iter().flatten().cloned().collect();
        let raw_items = std::mem::take(items);
        let old_slots = std::mem::take(slots);
        let mut pairs: Vec<(JsonValue, Option<ShadowNode>)> =
            raw_items.into_iter().zip(old_slots).collect();

        let result = seq_mutate(
            &mut pairs,
            method,
            mutator_args,
            |value| (value, None),
            |pair| sort_render(&pair.0),
        );
        let (new_items, new_slots): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        *items = new_items;
        *slots = new_slots;
        result?;

        // Re-proxy pass: wrap inserted composites, give duplicated slots
        // fresh identities, and drop tracking for slots that turned primitive.
        let mut seen: HashSet<NodeId> = HashSet::new();
        for (index, (raw, slot)) in items.iter().zip(slots.iter_mut()).enumerate() {
            let child_path = pointer.child(index.to_string());
            let composite = raw.is_object() || raw.is_array();
            match (composite, slot.as_ref().map(|node| node.id)) {
                (true, Some(id)) => {
                    if !seen.insert(id) {
                        *slot = wrap_value(registry, identity, &child_path, raw);
                    }
                }
                (true, None) => {
                    *slot = wrap_value(registry, identity, &child_path, raw);
                }
                (false, Some(_)) => {
                    if let Some(old) = slot.take() {
                        release(registry, &old);
                    }
                }
                (false, None) => {}
            }
        }

        // Elements the mutator removed are no longer reachable; their
        // registry entries go with them.
        let surviving: HashSet<NodeId> = slots.iter().flatten().map(|node| node.id).collect();
        for node in prior {
            if !surviving.contains(&node.id) {
                release(registry, &node);
            }
        }
    }

    // Index-shifting mutators moved children around; rebind the whole
    // subtree's stored paths.
    if let Some(array_node) = shadow
        .as_ref()
        .and_then(|root| root.descend(pointer.segments()))
    {
        rebind(registry, array_node, pointer);
    }
    Ok(())
}

fn take_shadow_at(shadow: &mut Option<ShadowNode>, path: &Pointer) -> Option<ShadowNode> {
    if path.is_root() {
        return shadow.take();
    }
    let parent = path.parent()?;
    let prop = path.last()?;
    let parent_node = shadow.as_mut()?.descend_mut(parent.segments())?;
    match &mut parent_node.children {
        ShadowChildren::Map(map) => map.remove(prop),
        ShadowChildren::Seq(slots) => {
            let index = parse_index(prop)?;
            slots.get_mut(index)?.take()
        }
    }
}

fn install_shadow_at(
    shadow: &mut Option<ShadowNode>,
    path: &Pointer,
    node: Option<ShadowNode>,
) -> Result<(), ReplicantError> {
    if path.is_root() {
        *shadow = node;
        return Ok(());
    }
    let parent = path.parent().unwrap();
    let prop = path.last().unwrap();
    let parent_node = shadow
        .as_mut()
        .and_then(|root| root.descend_mut(parent.segments()))
        .ok_or_else(|| ReplicantError::internal("shadow parent missing during install"))?;
    match &mut parent_node.children {
        ShadowChildren::Map(map) => {
            match node {
                Some(node) => {
                    map.insert(prop.to_string(), node);
                }
                None => {
                    map.remove(prop);
                }
            }
            Ok(())
        }
        ShadowChildren::Seq(slots) => {
            let index = parse_index(prop).ok_or_else(|| {
                ReplicantError::internal(format!("'{prop}' is not a valid sequence index"))
            })?;
            if index < slots.len() {
                slots[index] = node;
            } else if index == slots.len() {
                slots.push(node);
            } else {
                return Err(ReplicantError::internal(format!(
                    "index {index} is out of bounds during shadow install"
                )));
            }
            Ok(())
        }
    }
}

fn resolve_required<'a>(
    root: &'a JsonValue,
    pointer: &Pointer,
) -> Result<&'a JsonValue, ReplicantError> {
    pointer.resolve(root).ok_or_else(|| {
        ReplicantError::internal(format!("path '{}' does not resolve", pointer.render()))
    })
}
