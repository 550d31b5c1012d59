//! The receive pipeline, from validated segments to data in the receive
//! buffers and notifications for the application.

mod app_notifier;
pub use app_notifier::AppNotifier;

mod buffer_reader;
pub use buffer_reader::BufferReader;

mod buffer_writer;
pub use buffer_writer::BufferWriter;

mod checksum_validator;
pub use checksum_validator::ChecksumValidator;

mod dropper;
pub use dropper::SegmentDropper;

mod resolver;
pub use resolver::PortSessionResolver;

mod state_machine;
pub use state_machine::TcpStateMachine;
