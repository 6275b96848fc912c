use std::sync::{Arc, Mutex};

use replicant_engine::{
    DeclareRequest, OperationEnvelope, ProposalEnvelope, Transport,
};

/// Captures every outbound envelope so tests can inspect the wire traffic and
/// pump it between replicators by hand.
#[derive(Default)]
pub struct RecordingTransport {
    broadcasts: Mutex<Vec<OperationEnvelope>>,
    proposals: Mutex<Vec<ProposalEnvelope>>,
    declares: Mutex<Vec<DeclareRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_broadcasts(&self) -> Vec<OperationEnvelope> {
        std::mem::take(&mut self.broadcasts.lock().unwrap())
    }

    pub fn take_proposals(&self) -> Vec<ProposalEnvelope> {
        std::mem::take(&mut self.proposals.lock().unwrap())
    }

    pub fn take_declares(&self) -> Vec<DeclareRequest> {
        std::mem::take(&mut self.declares.lock().unwrap())
    }
}

impl Transport for RecordingTransport {
    fn broadcast(&self, envelope: &OperationEnvelope) {
        self.broadcasts.lock().unwrap().push(envelope.clone());
    }

    fn propose(&self, envelope: &ProposalEnvelope) {
        self.proposals.lock().unwrap().push(envelope.clone());
    }

    fn declare(&self, request: &DeclareRequest) {
        self.declares.lock().unwrap().push(request.clone());
    }
}
