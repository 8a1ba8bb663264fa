//! Host-authoritative resynchronization data.
//!
//! A reset realigns every participant to a bit-identical starting point after the membership
//! changes. The host tags each round with a fresh cookie ([`ResetEpoch`]), broadcasts a
//! snapshot plus a [`Roster`], and waits until every listed player acknowledged that cookie.
//! Each client reconciles its connections against the roster with [`plan_reconciliation`].
//!
//! Within each pair of clients, only the player with the lower id opens the connection; the
//! higher id waits for it. The host is player 0 and is always reached directly.

use std::net::SocketAddr;

use crate::peers::PeerTable;
use crate::transport::PeerId;
use crate::{PlayerId, MAX_PLAYERS};

/// Why an acknowledgment was not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckRejection {
    /// The cookie belongs to another reset round.
    StaleCookie {
        /// Cookie carried by the acknowledgment.
        received: u32,
        /// Cookie of the current round.
        current: u32,
    },
    /// The player already acknowledged this round.
    Duplicate,
    /// The id does not address a slot.
    InvalidPlayer,
}

impl std::fmt::Display for AckRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaleCookie { received, current } => {
                write!(f, "stale reset cookie {received} (current {current})")
            },
            Self::Duplicate => write!(f, "duplicate reset acknowledgment"),
            Self::InvalidPlayer => write!(f, "acknowledgment from an invalid player id"),
        }
    }
}

/// The current reset round: its cookie and who has acknowledged it.
///
/// ```
/// use rollback_netplay::reset::{AckRejection, ResetEpoch};
/// use rollback_netplay::PlayerId;
///
/// let mut epoch = ResetEpoch::default();
/// let cookie = epoch.begin_next(PlayerId::HOST);
/// assert_eq!(cookie, 1);
///
/// assert!(epoch.acknowledge(PlayerId::new(1), 1).is_ok());
/// assert_eq!(epoch.acknowledge(PlayerId::new(1), 1), Err(AckRejection::Duplicate));
/// assert!(matches!(epoch.acknowledge(PlayerId::new(2), 0), Err(AckRejection::StaleCookie { .. })));
/// assert_eq!(epoch.ack_count(), 2);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetEpoch {
    cookie: u32,
    acks: u8,
}

impl ResetEpoch {
    /// Cookie of the current round. `0` before the first reset.
    #[must_use]
    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    /// Starts a new round on the host. Only `local` has acknowledged it.
    pub fn begin_next(&mut self, local: PlayerId) -> u32 {
        self.cookie = self.cookie.wrapping_add(1);
        self.acks = 0;
        self.mark(local);
        self.cookie
    }

    /// Joins the host's round on a client. Only `local` has acknowledged it.
    pub fn adopt(&mut self, cookie: u32, local: PlayerId) {
        self.cookie = cookie;
        self.acks = 0;
        self.mark(local);
    }

    /// Forgets every acknowledgment, keeping the cookie.
    pub fn clear_acks(&mut self) {
        self.acks = 0;
    }

    /// Counts `player`'s acknowledgment of `cookie`.
    ///
    /// # Errors
    /// Rejects stale cookies, duplicates and invalid ids; the ack set is unchanged then.
    pub fn acknowledge(&mut self, player: PlayerId, cookie: u32) -> Result<(), AckRejection> {
        if !player.is_valid() {
            return Err(AckRejection::InvalidPlayer);
        }
        if self.is_acked(player) {
            return Err(AckRejection::Duplicate);
        }
        if cookie != self.cookie {
            return Err(AckRejection::StaleCookie {
                received: cookie,
                current: self.cookie,
            });
        }
        self.mark(player);
        Ok(())
    }

    /// Marks `player` as done without a cookie check. Clients use this to count the peers
    /// they are connected to. Returns `true` if the player was not marked yet.
    pub fn mark(&mut self, player: PlayerId) -> bool {
        if !player.is_valid() || self.is_acked(player) {
            return false;
        }
        self.acks |= 1 << player.as_usize();
        true
    }

    /// `true` if `player` acknowledged the current round.
    #[must_use]
    pub fn is_acked(&self, player: PlayerId) -> bool {
        player.is_valid() && self.acks & (1 << player.as_usize()) != 0
    }

    /// Number of players that acknowledged the current round.
    #[must_use]
    pub fn ack_count(&self) -> usize {
        self.acks.count_ones() as usize
    }
}

/// One listed player of a [`Roster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// Controller port the player drives.
    pub controller_port: u16,
    /// Where the player can be reached, as seen by the host.
    pub address: SocketAddr,
    /// The player's nickname.
    pub nickname: String,
}

/// The player list broadcast with every reset, indexed by player id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: [Option<RosterEntry>; MAX_PLAYERS],
}

impl Roster {
    /// An empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lists `player`. Out-of-range ids are ignored.
    pub fn insert(&mut self, player: PlayerId, entry: RosterEntry) {
        if let Some(slot) = self.entries.get_mut(player.as_usize()) {
            *slot = Some(entry);
        }
    }

    /// The entry of a player, if listed.
    #[must_use]
    pub fn entry(&self, player: PlayerId) -> Option<&RosterEntry> {
        self.entries.get(player.as_usize()).and_then(Option::as_ref)
    }

    /// `true` if the player is listed.
    #[must_use]
    pub fn contains(&self, player: PlayerId) -> bool {
        self.entry(player).is_some()
    }

    /// Number of listed players.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Listed players in id order.
    pub fn players(&self) -> impl Iterator<Item = (PlayerId, &RosterEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| entry.as_ref().map(|e| (PlayerId::new(i), e)))
    }

    /// All slots in id order, empty ones included.
    pub fn slots(&self) -> impl Iterator<Item = Option<&RosterEntry>> + '_ {
        self.entries.iter().map(Option::as_ref)
    }
}

/// What a client does with one slot to match a new roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The player is no longer listed: force-disconnect its peer and clear the slot.
    Disconnect {
        /// The dropped player.
        player: PlayerId,
        /// Its peer.
        peer: PeerId,
    },
    /// The existing connection stays.
    Preserve {
        /// The player.
        player: PlayerId,
    },
    /// Open a connection to the player.
    Connect {
        /// The player.
        player: PlayerId,
        /// Where to connect.
        address: SocketAddr,
        /// A connection to a stale address that must be reset first.
        stale: Option<PeerId>,
    },
    /// We should connect, but the roster has no usable address for the player.
    Unreachable {
        /// The player.
        player: PlayerId,
        /// A connection to a stale address that must be reset first.
        stale: Option<PeerId>,
    },
    /// The player will connect to us.
    Await {
        /// The player.
        player: PlayerId,
        /// A connection to a stale address that must be reset first.
        stale: Option<PeerId>,
    },
}

/// Works out, slot by slot, how a client's connections must change to match `roster`.
///
/// `peer_addr` resolves the current remote address of a peer. Listed players whose peer already
/// points at the listed address are preserved, as is the host. For everyone else the lower id
/// connects and the higher id waits.
pub fn plan_reconciliation<F>(
    table: &PeerTable,
    roster: &Roster,
    local: PlayerId,
    host: PlayerId,
    peer_addr: F,
) -> Vec<ReconcileAction>
where
    F: Fn(PeerId) -> Option<SocketAddr>,
{
    let mut actions = Vec::new();
    for (i, entry) in roster.slots().enumerate() {
        let player = PlayerId::new(i);
        let current = table.peer_for_player(player);
        let Some(entry) = entry else {
            if let Some(peer) = current {
                actions.push(ReconcileAction::Disconnect { player, peer });
            }
            continue;
        };
        if player == local {
            continue;
        }
        // The host lists its own wildcard address; the existing link is the one to keep.
        if player == host {
            actions.push(ReconcileAction::Preserve { player });
            continue;
        }
        if current.is_some_and(|peer| peer_addr(peer) == Some(entry.address)) {
            actions.push(ReconcileAction::Preserve { player });
            continue;
        }
        if local < player && !is_dialable(entry.address) {
            actions.push(ReconcileAction::Unreachable {
                player,
                stale: current,
            });
        } else if local < player {
            actions.push(ReconcileAction::Connect {
                player,
                address: entry.address,
                stale: current,
            });
        } else {
            actions.push(ReconcileAction::Await {
                player,
                stale: current,
            });
        }
    }
    actions
}

/// Whether an address from a roster can be connected to.
#[must_use]
pub fn is_dialable(address: SocketAddr) -> bool {
    !address.ip().is_unspecified() && address.port() != 0
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
    use std::collections::BTreeMap;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn entry(port: u16, nick: &str) -> RosterEntry {
        RosterEntry {
            controller_port: 0,
            address: addr(port),
            nickname: nick.to_owned(),
        }
    }

    #[test]
    fn begin_next_increments_and_acks_self() {
        let mut epoch = ResetEpoch::default();
        assert_eq!(epoch.cookie(), 0);
        assert_eq!(epoch.begin_next(PlayerId::HOST), 1);
        assert_eq!(epoch.begin_next(PlayerId::HOST), 2);
        assert!(epoch.is_acked(PlayerId::HOST));
        assert_eq!(epoch.ack_count(), 1);
    }

    #[test]
    fn stale_ack_leaves_bitset_unchanged() {
        let mut epoch = ResetEpoch::default();
        epoch.begin_next(PlayerId::HOST);
        epoch.begin_next(PlayerId::HOST);
        let before = epoch;
        assert_eq!(
            epoch.acknowledge(PlayerId::new(1), 1),
            Err(AckRejection::StaleCookie {
                received: 1,
                current: 2
            })
        );
        assert_eq!(epoch, before);
    }

    #[test]
    fn adopt_takes_the_host_cookie() {
        let mut epoch = ResetEpoch::default();
        epoch.mark(PlayerId::new(3));
        epoch.adopt(17, PlayerId::new(2));
        assert_eq!(epoch.cookie(), 17);
        assert!(epoch.is_acked(PlayerId::new(2)));
        assert!(!epoch.is_acked(PlayerId::new(3)));
    }

    #[test]
    fn invalid_ids_are_never_counted() {
        let mut epoch = ResetEpoch::default();
        assert!(!epoch.mark(PlayerId::new(MAX_PLAYERS)));
        assert_eq!(
            epoch.acknowledge(PlayerId::new(MAX_PLAYERS), 0),
            Err(AckRejection::InvalidPlayer)
        );
        assert_eq!(epoch.ack_count(), 0);
    }

    #[test]
    fn roster_counts_listed_players() {
        let mut roster = Roster::new();
        roster.insert(PlayerId::new(0), entry(1, "a"));
        roster.insert(PlayerId::new(2), entry(3, "c"));
        roster.insert(PlayerId::new(MAX_PLAYERS), entry(9, "ignored"));
        assert_eq!(roster.num_players(), 2);
        assert!(!roster.contains(PlayerId::new(1)));
        let ids: Vec<_> = roster.players().map(|(id, _)| id.as_usize()).collect();
        assert_eq!(ids, [0, 2]);
    }

    #[test]
    fn lower_id_connects_and_higher_id_waits() {
        let mut roster = Roster::new();
        for (i, port) in [(0, 100), (1, 101), (2, 102), (3, 103)] {
            roster.insert(PlayerId::new(i), entry(port, "p"));
        }
        let mut table = PeerTable::new(Some(PlayerId::new(2)), "me");
        table.assign(PlayerId::HOST, PeerId::new(0)).unwrap();

        let actions = plan_reconciliation(&table, &roster, PlayerId::new(2), PlayerId::HOST, |_| {
            Some(addr(1))
        });
        assert_eq!(
            actions,
            [
                ReconcileAction::Preserve {
                    player: PlayerId::HOST
                },
                ReconcileAction::Await {
                    player: PlayerId::new(1),
                    stale: None
                },
                ReconcileAction::Connect {
                    player: PlayerId::new(3),
                    address: addr(103),
                    stale: None
                },
            ]
        );
    }

    #[test]
    fn unlisted_peers_are_disconnected_and_moved_peers_replaced() {
        let mut roster = Roster::new();
        roster.insert(PlayerId::new(0), entry(100, "host"));
        roster.insert(PlayerId::new(1), entry(101, "me"));
        roster.insert(PlayerId::new(3), entry(203, "moved"));

        let mut table = PeerTable::new(Some(PlayerId::new(1)), "me");
        table.assign(PlayerId::HOST, PeerId::new(0)).unwrap();
        table.assign(PlayerId::new(2), PeerId::new(2)).unwrap();
        table.assign(PlayerId::new(3), PeerId::new(3)).unwrap();
        let addrs: BTreeMap<_, _> = [(PeerId::new(2), addr(102)), (PeerId::new(3), addr(103))]
            .into_iter()
            .collect();

        let actions = plan_reconciliation(&table, &roster, PlayerId::new(1), PlayerId::HOST, |p| {
            addrs.get(&p).copied()
        });
        assert!(actions.contains(&ReconcileAction::Disconnect {
            player: PlayerId::new(2),
            peer: PeerId::new(2)
        }));
        assert!(actions.contains(&ReconcileAction::Connect {
            player: PlayerId::new(3),
            address: addr(203),
            stale: Some(PeerId::new(3))
        }));
    }

    #[test]
    fn unknown_addresses_are_never_dialed() {
        let mut roster = Roster::new();
        roster.insert(PlayerId::new(0), entry(100, "host"));
        roster.insert(PlayerId::new(1), entry(101, "me"));
        roster.insert(
            PlayerId::new(2),
            RosterEntry {
                controller_port: 2,
                address: SocketAddr::from(([0, 0, 0, 0], 0)),
                nickname: "lost".to_owned(),
            },
        );
        let mut table = PeerTable::new(Some(PlayerId::new(1)), "me");
        table.assign(PlayerId::new(2), PeerId::new(2)).unwrap();

        let actions = plan_reconciliation(&table, &roster, PlayerId::new(1), PlayerId::HOST, |_| {
            Some(addr(102))
        });
        assert!(actions.contains(&ReconcileAction::Unreachable {
            player: PlayerId::new(2),
            stale: Some(PeerId::new(2))
        }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, ReconcileAction::Connect { .. })));
        assert!(!is_dialable(SocketAddr::from(([127, 0, 0, 1], 0))));
        assert!(is_dialable(addr(102)));
    }

    #[test]
    fn matching_address_is_preserved() {
        let mut roster = Roster::new();
        roster.insert(PlayerId::new(0), entry(100, "host"));
        roster.insert(PlayerId::new(1), entry(101, "one"));
        roster.insert(PlayerId::new(2), entry(102, "me"));
        let mut table = PeerTable::new(Some(PlayerId::new(2)), "me");
        table.assign(PlayerId::new(1), PeerId::new(1)).unwrap();

        let actions = plan_reconciliation(&table, &roster, PlayerId::new(2), PlayerId::HOST, |_| {
            Some(addr(101))
        });
        assert!(actions.contains(&ReconcileAction::Preserve {
            player: PlayerId::new(1)
        }));
    }

    proptest! {
        /// Between any two clients in a roster exactly one side opens the connection.
        #[test]
        fn exactly_one_side_of_each_pair_connects(listed in proptest::collection::vec(any::<bool>(), MAX_PLAYERS)) {
            let mut roster = Roster::new();
            roster.insert(PlayerId::HOST, entry(100, "host"));
            for (i, &on) in listed.iter().enumerate().skip(1) {
                if on {
                    roster.insert(PlayerId::new(i), entry(100 + i as u16, "p"));
                }
            }
            let clients: Vec<_> = roster.players().map(|(id, _)| id).filter(|&id| id != PlayerId::HOST).collect();
            for &a in &clients {
                for &b in &clients {
                    if a >= b {
                        continue;
                    }
                    let plan = |local: PlayerId| {
                        let table = PeerTable::new(Some(local), "x");
                        plan_reconciliation(&table, &roster, local, PlayerId::HOST, |_| None)
                    };
                    let a_connects = plan(a).iter().any(|act| matches!(act, ReconcileAction::Connect { player, .. } if *player == b));
                    let b_connects = plan(b).iter().any(|act| matches!(act, ReconcileAction::Connect { player, .. } if *player == a));
                    prop_assert!(a_connects ^ b_connects);
                }
            }
        }
    }
}
