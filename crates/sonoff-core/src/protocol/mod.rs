//! Wire protocol: frame types, the JSON codec, sequence numbering and the
//! session handshake.

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod sequence;

pub use codec::{decode_frame, decode_frame_bytes, encode_frame, ProtocolError};
pub use frame::{Frame, HelloConfig, HelloFrame, UpdateFrame, UserAgent, UserOnlineFrame};
pub use handshake::{generate_nonce, unix_millis, unix_seconds, user_online};
pub use sequence::SequenceCounter;
