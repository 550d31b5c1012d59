//! Wire formats: the TCP header codec, its checksum, and the word streams
//! that carry payload between stages.

pub mod checksum;
pub use checksum::Checksum;

pub mod tcp_header;
pub use tcp_header::{BuildHeaderError, Control, ParseError, TcpHeader, TcpHeaderBuilder};

pub mod word;
pub use word::{from_words, to_words, Realigner, Word, WORD_BYTES};
