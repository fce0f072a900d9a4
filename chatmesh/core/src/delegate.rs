//! Delegate contract exposed to the presentation layer.

use chatmesh_wire::{ChatMessage, PeerId};

/// Callbacks fired by the orchestrator toward the (excluded) UI layer.
///
/// All callbacks run on the orchestrator's dispatch path and must return
/// promptly; hand heavy work off to another task.
pub trait MeshDelegate: Send + Sync {
    /// A chat message addressed to this node (or broadcast) was received
    fn on_message(&self, message: ChatMessage);

    /// A new peer was observed on the mesh
    fn on_peer_connected(&self, peer: PeerId);

    /// A peer left or its link dropped
    fn on_peer_disconnected(&self, peer: PeerId);

    /// Peer metadata changed (nickname learned, membership changed)
    fn on_peer_list_changed(&self);
}
