//! Inbound message framing.
//!
//! A [`ReceiveFilter`] turns the raw byte stream of one session into discrete
//! messages. [`FixedSizeReceiveFilter`] frames fixed-size messages and
//! [`FixedHeaderReceiveFilter`] builds on it for header plus body formats.
//! The `packet` module is a concrete 36-byte header format used by the demo
//! server.

pub use filter::{drain, Drained, FilterState, Filtered, ReceiveFilter, ReceiveFilterFactory};
pub use fixed_header::{FixedHeaderReceiveFilter, HeaderFormat};
pub use fixed_size::{FixedSizeFormat, FixedSizeReceiveFilter};
pub use packet::{
    Packet, PacketFilterFactory, PacketFormat, PacketHeader, PacketReceiveFilter, FLAG_REPLY,
    PACKET_HEADER_SIZE,
};

mod filter;
mod fixed_header;
mod fixed_size;
mod packet;
