#![forbid(unsafe_code)]

use crate::codec::{CodecError, EnvelopeCodec, TokenKey};
use crate::envelope::Envelope;

/// Re-encrypts messages crossing from one token domain into another.
///
/// Used in both directions: client→backend with (client key, tenant key) and
/// backend→client with (tenant key, client key). A decrypt failure under the
/// source key aborts before any output bytes exist, so ambiguous or
/// partially-decoded content is never forwarded.
#[derive(Debug, Clone)]
pub struct TokenRelay {
	from: EnvelopeCodec,
	to: EnvelopeCodec,
}

impl TokenRelay {
	pub fn new(from: TokenKey, to: TokenKey) -> Self {
		Self {
			from: EnvelopeCodec::new(from),
			to: EnvelopeCodec::new(to),
		}
	}

	/// Decode under the source key, re-encode under the destination key.
	///
	/// Returns the re-encrypted bytes together with the decoded envelope so
	/// the caller can route on module/method/userID without decrypting twice.
	pub fn swap(&self, raw: &[u8]) -> Result<(Vec<u8>, Envelope), CodecError> {
		let envelope = self.from.decode(raw)?;
		let out = self.to.encode(&envelope)?;
		Ok((out, envelope))
	}
}
