//! Per-session stores. Each table is owned by one stage and reached by its
//! clients only through request/reply queues, served in a fixed client order.

pub mod port_table;
pub use port_table::{EphemeralRequest, PortClients, PortReply, PortTable, EPHEMERAL_BASE};

pub mod rx_window;
pub use rx_window::{RxWindow, RxWindowClients, RxWindowReply, RxWindowRequest, RxWindowTable};

pub mod session_lookup;
pub use session_lookup::{
    LookupClients, LookupOp, LookupReply, LookupRequest, LookupUpdate, ReverseReply,
    SessionLookup,
};

pub mod session_table;
pub use session_table::{SessionTable, StateClients, StateReply, StateRequest};

pub mod tx_window;
pub use tx_window::{AckUpdate, TxWindow, TxWindowClients, TxWindowReply, TxWindowRequest, TxWindowTable};
