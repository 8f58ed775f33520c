//! Takion wire protocol: constants, the control/data packet codec, the
//! protobuf-wire control messages, and AV unit parsing.

pub mod av;
pub mod codec;
pub mod constants;
pub mod messages;
pub mod wire;

pub use av::{AudioCodec, AvPacket, Codec, VideoCodec};
pub use codec::{Packet, PacketCodec};
