//! Per-device replica bookkeeping for a memory block.

use brainflow_foundation::DeviceId;
use indexmap::IndexMap;

use crate::device::DevicePtr;

/// One device-resident copy of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub ptr: DevicePtr,
    /// Size in bytes at allocation time.
    pub len: usize,
    /// Bound to an external pointer; never freed by the block.
    pub external: bool,
}

/// The authoritative replica on the owner device plus lazily created peers.
#[derive(Debug, Default, Clone)]
pub struct ReplicaMap {
    owner: Option<Replica>,
    peers: IndexMap<DeviceId, Replica>,
}

impl ReplicaMap {
    pub fn owner(&self) -> Option<Replica> {
        self.owner
    }

    pub fn set_owner(&mut self, replica: Replica) {
        self.owner = Some(replica);
    }

    pub fn peer(&self, device: DeviceId) -> Option<Replica> {
        self.peers.get(&device).copied()
    }

    pub fn insert_peer(&mut self, device: DeviceId, replica: Replica) {
        self.peers.insert(device, replica);
    }

    pub fn peers(&self) -> impl Iterator<Item = (DeviceId, Replica)> + '_ {
        self.peers.iter().map(|(device, replica)| (*device, *replica))
    }

    /// Remove every replica, owner first, returning them for freeing.
    pub fn drain(&mut self) -> Vec<Replica> {
        self.owner
            .take()
            .into_iter()
            .chain(self.peers.drain(..).map(|(_, replica)| replica))
            .collect()
    }
}
