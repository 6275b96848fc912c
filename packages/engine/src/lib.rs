mod change_stream;
mod error;
mod operation;
mod ownership;
mod path;
mod persistence;
mod proxy;
mod replicant;
mod replicator;
mod schema;
mod types;

pub use change_stream::{ChangeEvent, ChangeStream};
pub use error::{ErrorEnvelope, ErrorKind, ReplicantError};
pub use operation::{
    apply_operation, OpArgs, OpMethod, Operation, OperationEnvelope, ProposalEnvelope,
};
pub use path::Pointer;
pub use persistence::PersistedBlob;
pub use proxy::{Graft, ValueHandle};
pub use replicant::Replicant;
pub use replicator::{
    boot, DeclareOptsWire, DeclareRequest, DeclareResponse, NoopTransport, Replicator,
    ReplicatorArgs, Transport,
};
pub use schema::{schema_sum, ReplicantSchema, ValidationIssue};
pub use types::{
    DeclareOpts, ReplicantIdentity, ReplicantStatus, ReplicatorRole,
    DEFAULT_PERSISTENCE_INTERVAL,
};
