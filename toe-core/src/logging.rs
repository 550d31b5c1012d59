use crate::{
    address::FourTuple,
    types::{SegmentMeta, SessionId, TcpState},
};
use tracing::{event, Level};

/// Logging holds wrapper functions for structured engine events.
/// Each function corresponds to one kind of record (segments, sessions, aborts)
/// and is called from inside the pipeline stages. Installing a subscriber is
/// left to the binary.

/// Segment event handler.
/// Used to log a validated segment entering state processing. Captures the
/// following data: local, remote, seq, ack, length, flags
pub fn segment_event(tuple: FourTuple, meta: &SegmentMeta) {
    event!(
        target: "SEGMENT",
        Level::DEBUG,
        local = %tuple.local,
        remote = %tuple.remote,
        seq = meta.seq,
        ack = meta.ack,
        length = meta.length,
        flags = format!("{:?}", meta.ctl)
    );
}

/// Session transition handler.
/// Used to log a session changing state. Captures the following data:
/// session, from, to
pub fn transition_event(session: SessionId, from: TcpState, to: TcpState) {
    if from != to {
        event!(
            target: "SESSION",
            Level::INFO,
            session = session.into_inner(),
            from = format!("{:?}", from),
            to = format!("{:?}", to)
        );
    }
}

/// Session creation handler.
/// Captures the following data: session, local, remote
pub fn session_created_event(session: SessionId, tuple: FourTuple) {
    event!(
        target: "SESSION",
        Level::INFO,
        session = session.into_inner(),
        local = %tuple.local,
        remote = %tuple.remote,
        created = true
    );
}

/// Session release handler.
/// Captures the following data: session, local, remote
pub fn session_released_event(session: SessionId, tuple: FourTuple) {
    event!(
        target: "SESSION",
        Level::INFO,
        session = session.into_inner(),
        local = %tuple.local,
        remote = %tuple.remote,
        released = true
    );
}

/// Abort handler.
/// Used when the retransmission timer gives up on a session. Captures the
/// following data: session, retries
pub fn abort_event(session: SessionId, retries: u8) {
    event!(
        target: "SESSION",
        Level::WARN,
        session = session.into_inner(),
        retries = retries,
        aborted = true
    );
}
