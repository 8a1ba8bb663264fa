//! The fixed-capacity player slot table.
//!
//! Slot index is the stable [`PlayerId`]. Exactly one slot belongs to the local player once its
//! id is known; that slot never holds a transport peer. Every other slot is occupied while it
//! holds a peer.
//!
//! Only the control protocol and the reset coordinator mutate the table. The rollback engine
//! reads rollback handles from it when it is created and never writes to it.

use std::fmt;

use crate::transport::PeerId;
use crate::{NetplayError, PlayerHandle, PlayerId, MAX_NICKNAME_LENGTH, MAX_PLAYERS};

/// One entry of the [`PeerTable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerSlot {
    /// The transport peer of a remote player. Always `None` for the local slot.
    pub peer: Option<PeerId>,
    /// Display name, at most [`MAX_NICKNAME_LENGTH`] bytes.
    pub nickname: String,
    /// Handle of the player in the current rollback engine, if one is running.
    pub rollback_handle: Option<PlayerHandle>,
}

/// Truncates `name` to [`MAX_NICKNAME_LENGTH`] bytes without splitting a character.
///
/// ```
/// use rollback_netplay::peers::truncate_nickname;
///
/// assert_eq!(truncate_nickname("ryu"), "ryu");
/// assert_eq!(truncate_nickname(&"é".repeat(20)).len(), 32);
/// ```
#[must_use]
pub fn truncate_nickname(name: &str) -> String {
    if name.len() <= MAX_NICKNAME_LENGTH {
        return name.to_owned();
    }
    let mut end = MAX_NICKNAME_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.get(..end).unwrap_or_default().to_owned()
}

/// Registry mapping player id, transport peer, rollback handle and nickname.
///
/// ```
/// use rollback_netplay::{PeerId, PeerTable, PlayerId};
///
/// let mut table = PeerTable::new(Some(PlayerId::HOST), "host");
/// assert_eq!(table.free_player_id(), Some(PlayerId::new(1)));
///
/// table.assign(PlayerId::new(1), PeerId::new(7))?;
/// assert_eq!(table.player_for_peer(PeerId::new(7)), Some(PlayerId::new(1)));
/// assert_eq!(table.free_player_id(), Some(PlayerId::new(2)));
/// assert_eq!(table.count(), 2);
/// # Ok::<(), rollback_netplay::NetplayError>(())
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PeerTable {
    local: Option<PlayerId>,
    slots: [PlayerSlot; MAX_PLAYERS],
    local_nickname: String,
}

impl fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            local,
            slots,
            local_nickname,
        } = self;

        f.debug_struct("PeerTable")
            .field("local", local)
            .field("local_nickname", local_nickname)
            .field("slots", slots)
            .finish()
    }
}

impl PeerTable {
    /// Creates an empty table. A joiner does not know its id until the host assigns one.
    #[must_use]
    pub fn new(local: Option<PlayerId>, local_nickname: &str) -> Self {
        Self {
            local: local.filter(|id| id.is_valid()),
            slots: Default::default(),
            local_nickname: truncate_nickname(local_nickname),
        }
    }

    /// The local player's id, once known.
    #[must_use]
    pub fn local_player(&self) -> Option<PlayerId> {
        self.local
    }

    /// Sets the local player's id, as assigned by the host.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the id is out of range or its slot holds a
    /// peer.
    pub fn set_local_player(&mut self, id: PlayerId) -> Result<(), NetplayError> {
        let slot = self.slot(id).ok_or_else(|| NetplayError::InvalidRequest {
            info: format!("player id {id} is out of range"),
        })?;
        if let Some(peer) = slot.peer {
            return Err(NetplayError::InvalidRequest {
                info: format!("slot {id} already holds {peer}"),
            });
        }
        self.local = Some(id);
        Ok(())
    }

    /// The local player's nickname.
    #[must_use]
    pub fn local_nickname(&self) -> &str {
        &self.local_nickname
    }

    /// `true` for the local player and for every slot holding a peer.
    #[must_use]
    pub fn is_valid_player(&self, id: PlayerId) -> bool {
        self.local == Some(id) || self.peer_for_player(id).is_some()
    }

    /// The peer of a remote player.
    #[must_use]
    pub fn peer_for_player(&self, id: PlayerId) -> Option<PeerId> {
        self.slot(id).and_then(|slot| slot.peer)
    }

    /// The player a peer belongs to.
    #[must_use]
    pub fn player_for_peer(&self, peer: PeerId) -> Option<PlayerId> {
        self.slots
            .iter()
            .position(|slot| slot.peer == Some(peer))
            .map(PlayerId::new)
    }

    /// The lowest id that is neither local nor held by a peer.
    #[must_use]
    pub fn free_player_id(&self) -> Option<PlayerId> {
        (0..MAX_PLAYERS)
            .map(PlayerId::new)
            .find(|&id| !self.is_valid_player(id))
    }

    /// Stores `peer` in slot `id`. Reassigning the same peer is a no-op.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the id is out of range, is the local player,
    /// the slot holds another peer, or the peer already sits in another slot.
    pub fn assign(&mut self, id: PlayerId, peer: PeerId) -> Result<(), NetplayError> {
        if self.local == Some(id) {
            return Err(NetplayError::InvalidRequest {
                info: format!("slot {id} belongs to the local player"),
            });
        }
        if let Some(other) = self.player_for_peer(peer).filter(|&other| other != id) {
            return Err(NetplayError::InvalidRequest {
                info: format!("{peer} already sits in slot {other}"),
            });
        }
        let slot = self.slot_mut(id)?;
        match slot.peer {
            Some(existing) if existing != peer => Err(NetplayError::InvalidRequest {
                info: format!("slot {id} already holds {existing}"),
            }),
            _ => {
                slot.peer = Some(peer);
                Ok(())
            },
        }
    }

    /// Empties a remote slot and returns what it held.
    pub fn clear(&mut self, id: PlayerId) -> PlayerSlot {
        self.slots
            .get_mut(id.as_usize())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Empties every remote slot.
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            *slot = PlayerSlot::default();
        }
    }

    /// Sets the nickname of a player, truncated to [`MAX_NICKNAME_LENGTH`] bytes.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the id is out of range.
    pub fn set_nickname(&mut self, id: PlayerId, nickname: &str) -> Result<(), NetplayError> {
        let nickname = truncate_nickname(nickname);
        if self.local == Some(id) {
            self.local_nickname = nickname;
        } else {
            self.slot_mut(id)?.nickname = nickname;
        }
        Ok(())
    }

    /// The nickname of a valid player, or `""`.
    #[must_use]
    pub fn nickname(&self, id: PlayerId) -> &str {
        if self.local == Some(id) {
            return &self.local_nickname;
        }
        match self.slot(id) {
            Some(slot) if slot.peer.is_some() => &slot.nickname,
            _ => "",
        }
    }

    /// Records a player's handle in the current rollback engine.
    ///
    /// # Errors
    /// Returns [`NetplayError::InvalidRequest`] if the id is out of range.
    pub fn set_rollback_handle(
        &mut self,
        id: PlayerId,
        handle: Option<PlayerHandle>,
    ) -> Result<(), NetplayError> {
        self.slot_mut(id)?.rollback_handle = handle;
        Ok(())
    }

    /// A player's handle in the current rollback engine.
    #[must_use]
    pub fn rollback_handle(&self, id: PlayerId) -> Option<PlayerHandle> {
        self.slot(id).and_then(|slot| slot.rollback_handle)
    }

    /// Forgets every rollback handle. Called whenever the rollback engine is destroyed.
    pub fn clear_rollback_handles(&mut self) {
        for slot in &mut self.slots {
            slot.rollback_handle = None;
        }
    }

    /// Valid player ids in slot order, the local player included.
    pub fn occupied(&self) -> impl Iterator<Item = PlayerId> + '_ {
        (0..MAX_PLAYERS)
            .map(PlayerId::new)
            .filter(move |&id| self.is_valid_player(id))
    }

    /// Remote players and their peers, in slot order.
    pub fn connected_peers(&self) -> impl Iterator<Item = (PlayerId, PeerId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.peer.map(|peer| (PlayerId::new(i), peer)))
    }

    /// Nicknames of every valid player, in slot order.
    pub fn nicknames(&self) -> impl Iterator<Item = (PlayerId, &str)> + '_ {
        self.occupied().map(move |id| (id, self.nickname(id)))
    }

    /// Number of valid players, the local player included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.occupied().count()
    }

    /// Raw access to a slot.
    #[must_use]
    pub fn slot(&self, id: PlayerId) -> Option<&PlayerSlot> {
        self.slots.get(id.as_usize())
    }

    fn slot_mut(&mut self, id: PlayerId) -> Result<&mut PlayerSlot, NetplayError> {
        self.slots
            .get_mut(id.as_usize())
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!("player id {id} is out of range"),
            })
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn host_table() -> PeerTable {
        PeerTable::new(Some(PlayerId::HOST), "host")
    }

    #[test]
    fn local_player_is_valid_without_a_peer() {
        let table = host_table();
        assert!(table.is_valid_player(PlayerId::HOST));
        assert_eq!(table.peer_for_player(PlayerId::HOST), None);
        assert_eq!(table.nickname(PlayerId::HOST), "host");
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn joiner_has_no_local_id_yet() {
        let mut table = PeerTable::new(None, "guest");
        assert_eq!(table.local_player(), None);
        assert_eq!(table.free_player_id(), Some(PlayerId::HOST));
        table.set_local_player(PlayerId::new(2)).unwrap();
        assert_eq!(table.nickname(PlayerId::new(2)), "guest");
        assert_eq!(table.free_player_id(), Some(PlayerId::HOST));
    }

    #[test]
    fn free_player_id_skips_self_and_occupied_slots() {
        let mut table = PeerTable::new(Some(PlayerId::new(1)), "me");
        assert_eq!(table.free_player_id(), Some(PlayerId::new(0)));
        table.assign(PlayerId::new(0), PeerId::new(10)).unwrap();
        assert_eq!(table.free_player_id(), Some(PlayerId::new(2)));
        table.assign(PlayerId::new(2), PeerId::new(11)).unwrap();
        table.assign(PlayerId::new(3), PeerId::new(12)).unwrap();
        assert_eq!(table.free_player_id(), None);
    }

    #[test]
    fn assign_rejects_local_slot_and_conflicts() {
        let mut table = host_table();
        assert!(table.assign(PlayerId::HOST, PeerId::new(1)).is_err());
        table.assign(PlayerId::new(1), PeerId::new(1)).unwrap();
        table.assign(PlayerId::new(1), PeerId::new(1)).unwrap();
        assert!(table.assign(PlayerId::new(1), PeerId::new(2)).is_err());
        assert!(table.assign(PlayerId::new(2), PeerId::new(1)).is_err());
        assert!(table.assign(PlayerId::new(MAX_PLAYERS), PeerId::new(3)).is_err());
    }

    #[test]
    fn clear_returns_the_old_slot() {
        let mut table = host_table();
        table.assign(PlayerId::new(2), PeerId::new(5)).unwrap();
        table.set_nickname(PlayerId::new(2), "ken").unwrap();
        table
            .set_rollback_handle(PlayerId::new(2), Some(PlayerHandle::new(1)))
            .unwrap();

        let old = table.clear(PlayerId::new(2));
        assert_eq!(old.peer, Some(PeerId::new(5)));
        assert_eq!(old.nickname, "ken");
        assert_eq!(old.rollback_handle, Some(PlayerHandle::new(1)));
        assert!(!table.is_valid_player(PlayerId::new(2)));
        assert_eq!(table.nickname(PlayerId::new(2)), "");
        assert_eq!(table.clear(PlayerId::new(9)), PlayerSlot::default());
    }

    #[test]
    fn nicknames_are_truncated_on_char_boundaries() {
        let mut table = host_table();
        table.assign(PlayerId::new(1), PeerId::new(1)).unwrap();
        let long = "ü".repeat(40);
        table.set_nickname(PlayerId::new(1), &long).unwrap();
        let stored = table.nickname(PlayerId::new(1));
        assert_eq!(stored.len(), MAX_NICKNAME_LENGTH);
        assert!(stored.chars().all(|c| c == 'ü'));

        let odd = format!("a{}", "ü".repeat(40));
        assert_eq!(truncate_nickname(&odd).len(), MAX_NICKNAME_LENGTH - 1);
    }

    #[test]
    fn iterators_follow_slot_order() {
        let mut table = PeerTable::new(Some(PlayerId::new(1)), "one");
        table.assign(PlayerId::new(3), PeerId::new(30)).unwrap();
        table.assign(PlayerId::new(0), PeerId::new(0)).unwrap();
        table.set_nickname(PlayerId::new(0), "zero").unwrap();
        table.set_nickname(PlayerId::new(3), "three").unwrap();

        let ids: Vec<_> = table.occupied().map(PlayerId::as_usize).collect();
        assert_eq!(ids, [0, 1, 3]);

        let peers: Vec<_> = table.connected_peers().collect();
        assert_eq!(
            peers,
            [
                (PlayerId::new(0), PeerId::new(0)),
                (PlayerId::new(3), PeerId::new(30))
            ]
        );

        let names: Vec<_> = table.nicknames().map(|(_, n)| n.to_owned()).collect();
        assert_eq!(names, ["zero", "one", "three"]);
    }

    #[test]
    fn rollback_handles_are_cleared_together() {
        let mut table = host_table();
        table.assign(PlayerId::new(1), PeerId::new(1)).unwrap();
        table
            .set_rollback_handle(PlayerId::new(1), Some(PlayerHandle::new(1)))
            .unwrap();
        table
            .set_rollback_handle(PlayerId::HOST, Some(PlayerHandle::new(0)))
            .unwrap();
        table.clear_rollback_handles();
        assert_eq!(table.rollback_handle(PlayerId::new(1)), None);
        assert_eq!(table.rollback_handle(PlayerId::HOST), None);
        assert_eq!(table.peer_for_player(PlayerId::new(1)), Some(PeerId::new(1)));
    }

    #[test]
    fn set_local_player_refuses_occupied_slot() {
        let mut table = PeerTable::new(None, "guest");
        table.assign(PlayerId::HOST, PeerId::new(4)).unwrap();
        assert!(table.set_local_player(PlayerId::HOST).is_err());
        assert!(table.set_local_player(PlayerId::new(MAX_PLAYERS)).is_err());
        table.set_local_player(PlayerId::new(1)).unwrap();
    }

    proptest! {
        /// Filling the table one join at a time hands out every id once, never the local one.
        #[test]
        fn free_ids_are_unique_and_never_local(local in 0..MAX_PLAYERS) {
            let mut table = PeerTable::new(Some(PlayerId::new(local)), "local");
            let mut handed_out = Vec::new();
            let mut next_peer = 0;
            while let Some(id) = table.free_player_id() {
                prop_assert!(id.is_valid());
                prop_assert_ne!(id.as_usize(), local);
                prop_assert!(!handed_out.contains(&id));
                table.assign(id, PeerId::new(next_peer)).unwrap();
                handed_out.push(id);
                next_peer += 1;
            }
            prop_assert_eq!(handed_out.len(), MAX_PLAYERS - 1);
            prop_assert_eq!(table.count(), MAX_PLAYERS);
        }

        /// Truncation never exceeds the limit and always yields a prefix.
        #[test]
        fn truncation_yields_a_bounded_prefix(name in "\\PC{0,64}") {
            let truncated = truncate_nickname(&name);
            prop_assert!(truncated.len() <= MAX_NICKNAME_LENGTH);
            prop_assert!(name.starts_with(&truncated));
        }
    }
}
