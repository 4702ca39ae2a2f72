#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;
pub mod relay;

pub use codec::{CodecError, EnvelopeCodec, MAX_FRAME_SIZE, NONCE_LEN, TokenKey};
pub use envelope::{Dispatch, Envelope};
pub use relay::TokenRelay;
