//! Frame synthesis: checksum primitives plus the Ethernet/IPv4/UDP [`PacketBuilder`].

mod checksum;
mod packet;

pub use packet::{PacketBuilder, FRAME_OVERHEAD};
