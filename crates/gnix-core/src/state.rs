//! Virtual channel connection state and mode flags

use core::fmt;

/// Connection state of a VC
///
/// ```text
/// None -> Connecting -> Connected -> Terminating -> Terminated
///   |         |              |             |
///   +---------+----> Error <-+-------------+
/// ```
///
/// `Error` is entered from any non-terminal state on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VcState {
    /// Allocated, no handshake posted
    None = 1,

    /// Handshake posted, waiting for the peer
    Connecting = 2,

    /// Mailbox and hardware endpoint established
    Connected = 3,

    /// Teardown started, waiting for outstanding requests to drain
    Terminating = 4,

    /// Hardware resources released
    Terminated = 5,

    /// Handshake or hardware failure
    Error = 6,
}

impl VcState {
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, VcState::Terminated | VcState::Error)
    }

    /// States from which the VC may be returned to its freelist
    #[inline]
    pub const fn is_destroyable(&self) -> bool {
        matches!(self, VcState::None | VcState::Terminated | VcState::Error)
    }

    /// Edges of the state graph
    pub const fn can_transition_to(&self, next: VcState) -> bool {
        match (self, next) {
            (VcState::None, VcState::Connecting) => true,
            (VcState::Connecting, VcState::Connected) => true,
            (VcState::Connected, VcState::Terminating) => true,
            (VcState::Terminating, VcState::Terminated) => true,
            (from, VcState::Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for VcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VcState::None => "NONE",
            VcState::Connecting => "CONNECTING",
            VcState::Connected => "CONNECTED",
            VcState::Terminating => "CONN_TERMINATING",
            VcState::Terminated => "CONN_TERMINATED",
            VcState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Auxiliary VC bookkeeping, orthogonal to `VcState`
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct VcModes(u8);

impl VcModes {
    /// Queued on the NIC progress work queue
    pub const IN_WQ: VcModes = VcModes(1);
    /// Registered in the NIC lookup table
    pub const IN_TABLE: VcModes = VcModes(1 << 1);
    /// Connection datagram posted and not yet answered
    pub const DGRAM_POSTED: VcModes = VcModes(1 << 2);
    /// Send queue holds messages that could not be delivered yet
    pub const PENDING_MSGS: VcModes = VcModes(1 << 3);

    pub const fn empty() -> Self {
        VcModes(0)
    }

    #[inline]
    pub const fn contains(self, other: VcModes) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: VcModes) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: VcModes) {
        self.0 &= !other.0;
    }

    /// Set `other`, reporting whether it was clear before.
    #[inline]
    pub fn test_and_set(&mut self, other: VcModes) -> bool {
        let was_clear = !self.contains(other);
        self.insert(other);
        was_clear
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn in_wq(self) -> bool {
        self.contains(Self::IN_WQ)
    }

    pub fn in_table(self) -> bool {
        self.contains(Self::IN_TABLE)
    }

    pub fn dgram_posted(self) -> bool {
        self.contains(Self::DGRAM_POSTED)
    }

    pub fn pending_msgs(self) -> bool {
        self.contains(Self::PENDING_MSGS)
    }
}

impl fmt::Debug for VcModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::IN_WQ, "IN_WQ"),
            (Self::IN_TABLE, "IN_TABLE"),
            (Self::DGRAM_POSTED, "DGRAM_POSTED"),
            (Self::PENDING_MSGS, "PENDING_MSGS"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [VcState; 6] = [
        VcState::None,
        VcState::Connecting,
        VcState::Connected,
        VcState::Terminating,
        VcState::Terminated,
        VcState::Error,
    ];

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_forward_edges() {
        assert!(VcState::None.can_transition_to(VcState::Connecting));
        assert!(VcState::Connecting.can_transition_to(VcState::Error));
        assert!(VcState::Terminating.can_transition_to(VcState::Error));
        assert!(!VcState::Connecting.can_transition_to(VcState::Terminating));
        assert!(!VcState::None.can_transition_to(VcState::Connected));
        assert!(!VcState::Connected.can_transition_to(VcState::Connecting));
    }

    #[test]
    fn test_destroyable() {
        assert!(VcState::None.is_destroyable());
        assert!(VcState::Error.is_destroyable());
        assert!(!VcState::Connected.is_destroyable());
        assert!(!VcState::Terminating.is_destroyable());
    }

    #[test]
    fn test_modes_are_independent() {
        let mut m = VcModes::empty();
        assert!(m.test_and_set(VcModes::IN_WQ));
        assert!(!m.test_and_set(VcModes::IN_WQ));
        m.insert(VcModes::PENDING_MSGS);
        m.remove(VcModes::IN_WQ);
        assert!(!m.in_wq());
        assert!(m.pending_msgs());
        assert!(!m.in_table());
        assert_eq!(format!("{:?}", m), "{\"PENDING_MSGS\"}");
    }
}
