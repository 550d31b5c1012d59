//! The core of a TCP offload engine: the receive and transmit pipelines, the
//! per-session tables and timers, and the buffer memory they share.
//!
//! The engine moves segments and application data through a set of stages
//! connected by bounded queues. Everything a stage knows about a connection
//! lives in a table owned by another stage and is reached by request and
//! reply, so stages never share state directly.
//!
//! # Organization
//! - [`Engine`] owns every stage and table and is driven one step at a time
//! - [`Runtime`] drives an engine from a tokio task and hands out
//!   [`ToeHandle`]s to talk to it
//! - [`rx`], [`tx`] and [`timers`] hold the stages
//! - [`tables`] holds the per-session stores
//! - [`memory`] holds the buffer memory and its command contract
//! - [`wire`] holds the TCP header codec and the word streams carrying data
//!
//! # Connection handling
//!
//! Received segments are checksummed, matched to a session (or to a listening
//! port, creating the session), and run through the TCP state machine. The
//! state machine decides which payload bytes to keep and which segments the
//! segment builder should send back. Kept bytes are written to the session's
//! receive buffer and the application is told how many arrived. Segments are
//! not built here: the engine emits [`Event`]s and the segment builder
//! reports back what it sent.

mod logging;

pub mod address;
pub use address::{Endpoint, FourTuple, Ipv4Address};

pub mod channels;
pub use channels::{Channels, ListenReply};

pub mod config;
pub use config::{ConfigError, ToeConfig};

pub mod engine;
pub use engine::{Engine, Stage, SubmitError};

pub mod event_engine;
pub use event_engine::EventEngine;

pub mod fifo;
pub use fifo::Fifo;

pub mod memory;
pub use memory::{Dram, MemCommand, MemStatus};

pub mod runtime;
pub use runtime::{Runtime, RuntimeError, RuntimeOutputs, ToeHandle};

pub mod rx;
pub mod seq;
pub mod tables;
pub mod timers;
pub mod tx;

pub mod types;
pub use types::{
    AppNotification, Event, EventKind, EventTarget, NotificationStatus, OpenStatus, ReadRequest,
    RxPacket, SessionId, TcpState, TxSent, WriteReply, WriteStatus,
};

pub mod wire;
