//! Framing and wire types shared by the RPC endpoint and the reverse channel.

pub mod codec;
pub mod protocol;
pub mod transport;
