//! Narrow interfaces to game-side collaborators.

use meshsync_core::{CellKey, PeerId};

/// The world's spatial registry of players.
pub trait WorldRegistry {
    /// A player entered `new`, leaving `old` if it had one.
    fn update_player_cell(&mut self, peer_id: &PeerId, old: Option<CellKey>, new: CellKey);

    /// A player left the world from `cell`.
    fn remove_from_registry(&mut self, peer_id: &PeerId, cell: CellKey);
}

/// A source of domain entities seeded onto every new link.
///
/// Each source is sent as one or more entity batches after the full snapshot.
/// Sources with nothing active are skipped.
pub trait EntitySyncSource {
    /// Entity family name carried in the batch, e.g. `"workers"`.
    fn kind(&self) -> &str;

    /// Entities currently active and worth sending to a new peer.
    fn active_for_sync(&self) -> Vec<serde_json::Value>;
}
