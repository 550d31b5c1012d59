//! The application's transmit side: connection management and writes into
//! the transmit buffers.

mod app_writer;
pub use app_writer::AppWriter;

mod tx_app;
pub use tx_app::TxAppInterface;
