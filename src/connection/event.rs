//! Inputs and events of the connection actor.

use tokio::time::Instant;

use crate::{
    envelope::Envelope,
    error::WsError,
    frame::Decoded,
    limits::{LimitExceeded, PendingSlot},
};

/// Item queued by [`super::ConnectionHandle::deliver`].
#[derive(Debug)]
pub(crate) enum Ingress {
    /// Heartbeat, pong or abort. Holds no pending slot.
    Control(Decoded),
    /// An accepted frame holding its pending slot until settled.
    Work(Work),
    /// First of a run of frames refused at ingress. Later refusals are
    /// counted on the connection until the actor reports this one.
    Rejected(LimitExceeded),
}

/// Pipeline work, in arrival order. Control frames never become work.
#[derive(Debug)]
pub(crate) enum Work {
    Message {
        envelope: Envelope,
        received_at: Instant,
        slot: PendingSlot,
    },
    /// A frame that failed to decode.
    Invalid { error: WsError, slot: PendingSlot },
}

/// Events returned by [`super::ConnectionActor::next_event`].
#[derive(Debug)]
pub(super) enum Event {
    Shutdown,
    ServerShutdown,
    Heartbeat,
    Sweep,
    Settled,
    Inbound(Option<Ingress>),
}
