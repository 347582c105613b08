//! Positions in the client call lifecycle where filters run.
//!
//! Points come in matched pairs: the "pre" member has an even ordinal and its
//! "post" partner the next odd ordinal. The chain engine relies on that
//! layout to find the slot in `RequestContext::filter_exec_index` shared by a
//! pair.

use serde::{Deserialize, Serialize};

/// Number of pre/post pairs, i.e. the length of the per-context exec index.
pub const NUM_POINT_PAIRS: usize = 5;

/// A filter point. Discriminants encode the pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum FilterPoint {
    /// Before anything else happens for the call.
    ClientPreRpcInvoke = 0,
    /// After the call has a final status.
    ClientPostRpcInvoke = 1,
    /// After encoding, right before handing the request to the transport.
    ClientPreSendMsg = 2,
    /// After the transport returned (or failed), before decoding.
    ClientPostRecvMsg = 3,
    /// Transport collaborator: before a request is queued for sending.
    ClientPreSchedSend = 4,
    /// Transport collaborator: after the queued request was picked up.
    ClientPostSchedSend = 5,
    /// Transport collaborator: before a response is queued to the caller.
    ClientPreSchedRecv = 6,
    /// Transport collaborator: after the queued response was picked up.
    ClientPostSchedRecv = 7,
    /// Transport collaborator: before bytes are written to the socket.
    ClientPreIoSend = 8,
    /// Transport collaborator: after bytes were written to the socket.
    ClientPostIoSend = 9,
}

impl FilterPoint {
    /// Every point, in ordinal order.
    pub const ALL: [FilterPoint; NUM_POINT_PAIRS * 2] = [
        Self::ClientPreRpcInvoke,
        Self::ClientPostRpcInvoke,
        Self::ClientPreSendMsg,
        Self::ClientPostRecvMsg,
        Self::ClientPreSchedSend,
        Self::ClientPostSchedSend,
        Self::ClientPreSchedRecv,
        Self::ClientPostSchedRecv,
        Self::ClientPreIoSend,
        Self::ClientPostIoSend,
    ];

    #[must_use]
    pub const fn ordinal(self) -> usize {
        self as usize
    }

    /// Inverse of [`FilterPoint::ordinal`].
    #[must_use]
    pub const fn from_ordinal(ordinal: usize) -> Option<Self> {
        if ordinal < Self::ALL.len() {
            Some(Self::ALL[ordinal])
        } else {
            None
        }
    }

    #[must_use]
    pub const fn is_pre(self) -> bool {
        self.ordinal() % 2 == 0
    }

    #[must_use]
    pub const fn is_post(self) -> bool {
        !self.is_pre()
    }

    /// The other member of this point's pair.
    #[must_use]
    pub const fn partner(self) -> Self {
        let ordinal = self.ordinal();
        let partner = if ordinal % 2 == 0 { ordinal + 1 } else { ordinal - 1 };
        Self::ALL[partner]
    }

    /// Index of this point's pair, shared by both members.
    #[must_use]
    pub const fn pair_index(self) -> usize {
        self.ordinal() / 2
    }
}
