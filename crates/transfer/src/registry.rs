//! Live transmitters, keyed by transfer id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::transmitter::FileTransmitter;

/// Tracks the transmitters a session is driving.
#[derive(Default)]
pub struct TransferRegistry {
    transfers: RwLock<HashMap<String, Arc<FileTransmitter>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transmitter`, cancelling any previous one with the same id.
    pub fn insert(&self, transmitter: FileTransmitter) -> Arc<FileTransmitter> {
        let transmitter = Arc::new(transmitter);
        let replaced = self
            .transfers
            .write()
            .insert(transmitter.id().to_string(), Arc::clone(&transmitter));
        if let Some(old) = replaced {
            debug!(transfer = %old.id(), "replacing transmitter");
            old.cancel();
        }
        transmitter
    }

    pub fn get(&self, id: &str) -> Option<Arc<FileTransmitter>> {
        self.transfers.read().get(id).cloned()
    }

    /// Unregisters and cancels the transmitter for `id`.
    pub fn remove(&self, id: &str) -> Option<Arc<FileTransmitter>> {
        let removed = self.transfers.write().remove(id);
        if let Some(t) = &removed {
            t.cancel();
        }
        removed
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.transfers.write().drain().map(|(_, t)| t).collect();
        for t in drained {
            t.cancel();
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.transfers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.transfers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
