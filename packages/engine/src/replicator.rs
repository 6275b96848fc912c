use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::operation::{OperationEnvelope, ProposalEnvelope};
use crate::ownership::OwnerRegistry;
use crate::persistence::PersistenceManager;
use crate::replicant::Replicant;
use crate::schema::ReplicantSchema;
use crate::types::{DeclareOpts, ReplicantIdentity, ReplicatorRole};
use crate::ReplicantError;

const MAX_UNROUTED_BATCHES_PER_REPLICANT: usize = 256;

/// Outbound seam. Delivery is fire-and-forget; a reliable in-order channel is
/// assumed for broadcasts.
pub trait Transport: Send + Sync {
    fn broadcast(&self, envelope: &OperationEnvelope);
    fn propose(&self, envelope: &ProposalEnvelope);
    fn declare(&self, request: &DeclareRequest);
}

/// Local-only operation: nothing leaves the process.
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn broadcast(&self, _envelope: &OperationEnvelope) {}
    fn propose(&self, _envelope: &ProposalEnvelope) {}
    fn declare(&self, _request: &DeclareRequest) {}
}

/// Declaration handshake, client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareRequest {
    pub namespace: String,
    pub name: String,
    pub opts: DeclareOptsWire,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareOptsWire {
    pub persistent: bool,
    #[serde(rename = "schemaSum", default, skip_serializing_if = "Option::is_none")]
    pub schema_sum: Option<String>,
    #[serde(rename = "defaultValue", default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<JsonValue>,
}

/// Declaration handshake, server to client. When the client's `schemaSum`
/// disagrees, the client must accept this schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    #[serde(rename = "schemaSum", default, skip_serializing_if = "Option::is_none")]
    pub schema_sum: Option<String>,
}

pub(crate) struct RuntimeShared {
    pub(crate) role: ReplicatorRole,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: Mutex<OwnerRegistry>,
    pub(crate) pending_flush: Mutex<Vec<ReplicantIdentity>>,
    pub(crate) persistence: Option<Mutex<PersistenceManager>>,
}

pub struct ReplicatorArgs {
    pub role: ReplicatorRole,
    pub transport: Arc<dyn Transport>,
    pub store_dir: Option<PathBuf>,
}

impl ReplicatorArgs {
    pub fn new(role: ReplicatorRole, transport: Arc<dyn Transport>) -> Self {
        Self {
            role,
            transport,
            store_dir: None,
        }
    }
}

pub fn boot(args: ReplicatorArgs) -> Replicator {
    let persistence = match (args.role, args.store_dir) {
        (ReplicatorRole::Authoritative, Some(dir)) => {
            Some(Mutex::new(PersistenceManager::new(dir)))
        }
        _ => None,
    };
    Replicator {
        shared: Arc::new(RuntimeShared {
            role: args.role,
            transport: args.transport,
            registry: Mutex::new(OwnerRegistry::default()),
            pending_flush: Mutex::new(Vec::new()),
            persistence,
        }),
        replicants: Mutex::new(HashMap::new()),
        unrouted: Mutex::new(HashMap::new()),
    }
}

/// Maintains the `(namespace, name)` registry, drives the end-of-turn flush
/// cycle, and routes operation traffic between replicants and the transport.
pub struct Replicator {
    shared: Arc<RuntimeShared>,
    replicants: Mutex<HashMap<ReplicantIdentity, Arc<Replicant>>>,
    unrouted: Mutex<HashMap<ReplicantIdentity, VecDeque<OperationEnvelope>>>,
}

impl Replicator {
    pub fn role(&self) -> ReplicatorRole {
        self.shared.role
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Replicant>> {
        let identity = ReplicantIdentity::new(namespace, name);
        self.replicants.lock().unwrap().get(&identity).cloned()
    }

    /// Returns the replicant registered under `(namespace, name)`, declaring
    /// it first when absent. Idempotent: a second call returns the same
    /// instance and leaves its revision alone; conflicting options fail.
    pub fn find_or_declare(
        &self,
        namespace: &str,
        name: &str,
        opts: DeclareOpts,
    ) -> Result<Arc<Replicant>, ReplicantError> {
        if namespace.is_empty() || name.is_empty() {
            return Err(ReplicantError::invalid_declaration(
                "namespace and name must be non-empty",
            ));
        }
        let identity = ReplicantIdentity::new(namespace, name);

        {
            let replicants = self.replicants.lock().unwrap();
            if let Some(existing) = replicants.get(&identity) {
                if existing.opts().conflicts_with(&opts) {
                    return Err(ReplicantError::invalid_declaration(format!(
                        "replicant '{identity}' is already declared with conflicting options"
                    )));
                }
                return Ok(Arc::clone(existing));
            }
        }

        let schema = match opts.schema_path.as_deref() {
            Some(path) => Some(ReplicantSchema::load(path)?),
            None => None,
        };
        let replicant = Replicant::new(
            identity.clone(),
            opts.clone(),
            schema,
            Arc::clone(&self.shared),
        );
        self.replicants
            .lock()
            .unwrap()
            .insert(identity.clone(), Arc::clone(&replicant));

        replicant.mark_declaring();
        match self.shared.role {
            ReplicatorRole::Authoritative => {
                let (initial, revision) = self.resolve_initial(&identity, &opts, &replicant);
                replicant.promote_declared(initial, revision, None);
            }
            ReplicatorRole::Subscriber => {
                let request = DeclareRequest {
                    namespace: identity.namespace.clone(),
                    name: identity.name.clone(),
                    opts: DeclareOptsWire {
                        persistent: opts.persistent,
                        schema_sum: replicant.schema_sum(),
                        default_value: opts.default_value.clone(),
                    },
                };
                self.shared.transport.declare(&request);
            }
        }

        self.drain_unrouted(&identity, &replicant);
        Ok(replicant)
    }

    /// Drains the pending set in enqueue order, flushing each replicant's
    /// queue, then runs the persistence tick. This is the manually-drained
    /// end-of-turn step; call it before releasing control to I/O.
    pub fn flush_pending(&self) {
        loop {
            let drained: Vec<ReplicantIdentity> = {
                let mut pending = self.shared.pending_flush.lock().unwrap();
                if pending.is_empty() {
                    break;
                }
                std::mem::take(&mut *pending)
            };
            for identity in drained {
                if let Some(replicant) = self.get(&identity.namespace, &identity.name) {
                    replicant.flush();
                }
            }
        }
        if let Some(persistence) = self.shared.persistence.as_ref() {
            persistence.lock().unwrap().tick(Instant::now());
        }
    }

    /// Force-writes every dirty persistent blob. Shutdown path.
    pub fn persist_all(&self) {
        if let Some(persistence) = self.shared.persistence.as_ref() {
            persistence.lock().unwrap().persist_all();
        }
    }

    /// Inbound authoritative broadcast. Batches for replicants not yet
    /// present are buffered up to a bounded depth and drained on declaration.
    pub fn receive_broadcast(&self, envelope: OperationEnvelope) -> Result<(), ReplicantError> {
        let identity = ReplicantIdentity::new(&envelope.namespace, &envelope.name);
        match self.get(&identity.namespace, &identity.name) {
            Some(replicant) => replicant.receive_envelope(envelope),
            None => {
                tracing::warn!(replicant = %identity, "broadcast for unknown replicant; buffering");
                let mut unrouted = self.unrouted.lock().unwrap();
                let queue = unrouted.entry(identity).or_default();
                if queue.len() >= MAX_UNROUTED_BATCHES_PER_REPLICANT {
                    queue.pop_front();
                }
                queue.push_back(envelope);
                Ok(())
            }
        }
    }

    /// Inbound subscriber proposal (authoritative side). The batch is
    /// validated and staged through the normal mutation path; on failure
    /// nothing is applied and the error maps onto the ack envelope.
    pub fn receive_proposal(&self, envelope: ProposalEnvelope) -> Result<(), ReplicantError> {
        let identity = ReplicantIdentity::new(&envelope.namespace, &envelope.name);
        let Some(replicant) = self.get(&identity.namespace, &identity.name) else {
            return Err(ReplicantError::unknown_replicant(format!(
                "no replicant registered under '{identity}'"
            )));
        };
        replicant.stage_remote_batch(envelope.operations)
    }

    /// Services a subscriber's declaration handshake (authoritative side),
    /// answering with the full-value + revision snapshot.
    pub fn handle_declare_request(
        &self,
        request: &DeclareRequest,
    ) -> Result<DeclareResponse, ReplicantError> {
        let replicant = match self.get(&request.namespace, &request.name) {
            Some(existing) => existing,
            None => self.find_or_declare(
                &request.namespace,
                &request.name,
                DeclareOpts {
                    persistent: request.opts.persistent,
                    default_value: request.opts.default_value.clone(),
                    ..DeclareOpts::default()
                },
            )?,
        };
        Ok(DeclareResponse {
            value: replicant.get(),
            revision: replicant.revision(),
            schema: replicant.schema_raw(),
            schema_sum: replicant.schema_sum(),
        })
    }

    /// Completes a subscriber-side declaration with the authoritative
    /// snapshot. A schema disagreement is resolved in the server's favor.
    pub fn receive_declare_response(
        &self,
        namespace: &str,
        name: &str,
        response: DeclareResponse,
    ) -> Result<(), ReplicantError> {
        let Some(replicant) = self.get(namespace, name) else {
            return Err(ReplicantError::unknown_replicant(format!(
                "no replicant registered under '{namespace}/{name}'"
            )));
        };
        let schema_override = match (&response.schema, &response.schema_sum) {
            (Some(raw), sum) if *sum != replicant.schema_sum() || replicant.schema_sum().is_none() => {
                Some(ReplicantSchema::compile(raw.clone())?)
            }
            _ => None,
        };
        replicant.promote_declared(response.value, response.revision, schema_override);
        Ok(())
    }

    fn resolve_initial(
        &self,
        identity: &ReplicantIdentity,
        opts: &DeclareOpts,
        replicant: &Arc<Replicant>,
    ) -> (Option<JsonValue>, u64) {
        if !opts.persistent {
            return (opts.default_value.clone(), 0);
        }
        let Some(persistence) = self.shared.persistence.as_ref() else {
            return (opts.default_value.clone(), 0);
        };
        let loaded = persistence.lock().unwrap().load(identity);
        match loaded {
            Ok(Some(blob)) => {
                if let Some(value) = blob.value.as_ref() {
                    if !replicant.is_valid(Some(value)) {
                        tracing::warn!(
                            replicant = %identity,
                            "persisted value fails schema validation; discarding in favor of the default"
                        );
                        return (opts.default_value.clone(), 0);
                    }
                }
                (blob.value, blob.revision)
            }
            Ok(None) => (opts.default_value.clone(), 0),
            Err(error) => {
                tracing::warn!(replicant = %identity, error = %error, "failed to load persisted value");
                (opts.default_value.clone(), 0)
            }
        }
    }

    fn drain_unrouted(&self, identity: &ReplicantIdentity, replicant: &Arc<Replicant>) {
        let buffered = self.unrouted.lock().unwrap().remove(identity);
        let Some(batches) = buffered else {
            return;
        };
        for envelope in batches {
            if let Err(error) = replicant.receive_envelope(envelope) {
                tracing::error!(
                    replicant = %identity,
                    error = %error,
                    "failed to apply buffered operation batch"
                );
            }
        }
    }
}
