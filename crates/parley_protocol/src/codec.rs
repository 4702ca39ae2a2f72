#![forbid(unsafe_code)]

use core::fmt;

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum size of one wire frame (matches the inbound socket read limit).
pub const MAX_FRAME_SIZE: usize = 20 * 1024;

/// Length of the random nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length.
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("ciphertext truncated: len={0}")]
	Truncated(usize),

	#[error("decrypt failed under the provided key")]
	Crypto,

	#[error("malformed envelope: {0}")]
	Protocol(#[from] serde_json::Error),
}

/// 256-bit symmetric token keying one encryption domain (the client-facing
/// domain or one tenant's domain).
#[derive(Clone, PartialEq, Eq)]
pub struct TokenKey([u8; 32]);

impl TokenKey {
	/// Derive a key from a configured secret string.
	pub fn derive(secret: &str) -> Self {
		let digest = Sha256::digest(secret.as_bytes());
		Self(digest.into())
	}

	pub const fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Debug for TokenKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Never log key material.
		f.write_str("TokenKey(..)")
	}
}

/// Encrypts/decrypts envelopes within one token domain.
///
/// Wire format: `nonce (24 bytes) || XChaCha20-Poly1305 ciphertext`.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
	key: TokenKey,
}

impl EnvelopeCodec {
	pub fn new(key: TokenKey) -> Self {
		Self { key }
	}

	/// Serialize deterministically, then encrypt with a fresh random nonce.
	pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
		let plaintext = serde_json::to_vec(envelope)?;
		self.seal(&plaintext)
	}

	/// Decrypt, then parse. Fails without partial results.
	pub fn decode(&self, raw: &[u8]) -> Result<Envelope, CodecError> {
		let plaintext = self.open(raw)?;
		Ok(serde_json::from_slice(&plaintext)?)
	}

	/// Decrypt and parse a backend response that is either one envelope or an
	/// ordered list of per-user reply envelopes.
	pub fn decode_batch(&self, raw: &[u8]) -> Result<Vec<Envelope>, CodecError> {
		let plaintext = self.open(raw)?;
		let value: serde_json::Value = serde_json::from_slice(&plaintext)?;

		match value {
			serde_json::Value::Array(items) => items
				.into_iter()
				.map(|item| serde_json::from_value(item).map_err(CodecError::from))
				.collect(),
			other => Ok(vec![serde_json::from_value(other)?]),
		}
	}

	/// Encrypt raw plaintext bytes.
	pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
		if plaintext.len() + NONCE_LEN + TAG_LEN > MAX_FRAME_SIZE {
			return Err(CodecError::FrameTooLarge {
				len: plaintext.len() + NONCE_LEN + TAG_LEN,
				max: MAX_FRAME_SIZE,
			});
		}

		let cipher = XChaCha20Poly1305::new(self.key.as_bytes().into());

		let mut nonce = [0u8; NONCE_LEN];
		OsRng.fill_bytes(&mut nonce);

		let ciphertext = cipher
			.encrypt(XNonce::from_slice(&nonce), plaintext)
			.map_err(|_| CodecError::Crypto)?;

		let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		out.extend_from_slice(&nonce);
		out.extend_from_slice(&ciphertext);
		Ok(out)
	}

	/// Decrypt raw frame bytes produced by `seal`.
	pub fn open(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
		if raw.len() > MAX_FRAME_SIZE {
			return Err(CodecError::FrameTooLarge {
				len: raw.len(),
				max: MAX_FRAME_SIZE,
			});
		}
		if raw.len() < NONCE_LEN + TAG_LEN {
			return Err(CodecError::Truncated(raw.len()));
		}

		let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
		let cipher = XChaCha20Poly1305::new(self.key.as_bytes().into());

		cipher
			.decrypt(XNonce::from_slice(nonce), ciphertext)
			.map_err(|_| CodecError::Crypto)
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;
	use serde_json::json;

	use super::*;
	use crate::envelope::Envelope;

	fn codec(secret: &str) -> EnvelopeCodec {
		EnvelopeCodec::new(TokenKey::derive(secret))
	}

	fn representative_envelope() -> Envelope {
		let mut env = Envelope::new("chat", "message");
		env.lang = Some("zh-cn".to_string());
		env.user_id = Some(7);
		env.params = Some(json!([[1, 2, 3], "群组", true]));
		env.data = Some(json!({
			"gid": "abc-123",
			"content": "héllo — 世界 🦀",
			"nested": {"depth": [{"k": "v"}]},
		}));
		env
	}

	#[test]
	fn encode_decode_roundtrip() {
		let codec = codec("secret-a");
		let env = representative_envelope();

		let raw = codec.encode(&env).expect("encode");
		let decoded = codec.decode(&raw).expect("decode");
		assert_eq!(decoded, env);
	}

	#[test]
	fn nonces_are_fresh_per_encode() {
		let codec = codec("secret-a");
		let env = Envelope::new("chat", "ping");

		let a = codec.encode(&env).expect("encode");
		let b = codec.encode(&env).expect("encode");
		assert_ne!(a, b, "two encodings of the same envelope must not repeat a nonce");
	}

	#[test]
	fn decode_fails_under_wrong_key() {
		let raw = codec("secret-a").encode(&representative_envelope()).expect("encode");

		match codec("secret-b").decode(&raw) {
			Err(CodecError::Crypto) => {}
			other => panic!("expected Crypto error, got: {other:?}"),
		}
	}

	#[test]
	fn decode_fails_on_tampered_ciphertext() {
		let codec = codec("secret-a");
		let mut raw = codec.encode(&representative_envelope()).expect("encode");
		let last = raw.len() - 1;
		raw[last] ^= 0x01;

		match codec.decode(&raw) {
			Err(CodecError::Crypto) => {}
			other => panic!("expected Crypto error, got: {other:?}"),
		}
	}

	#[test]
	fn decode_rejects_truncated_input() {
		match codec("secret-a").decode(&[0u8; NONCE_LEN]) {
			Err(CodecError::Truncated(_)) => {}
			other => panic!("expected Truncated error, got: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_oversized_payload() {
		let codec = codec("secret-a");
		let mut env = Envelope::new("chat", "message");
		env.data = Some(json!({"blob": "x".repeat(MAX_FRAME_SIZE)}));

		match codec.encode(&env) {
			Err(CodecError::FrameTooLarge { len, max }) => assert!(len > max),
			other => panic!("expected FrameTooLarge error, got: {other:?}"),
		}
	}

	#[test]
	fn plaintext_garbage_is_a_protocol_error() {
		let codec = codec("secret-a");
		let raw = codec.seal(b"not json at all").expect("seal");

		match codec.decode(&raw) {
			Err(CodecError::Protocol(_)) => {}
			other => panic!("expected Protocol error, got: {other:?}"),
		}
	}

	#[test]
	fn decode_batch_accepts_single_and_list() {
		let codec = codec("secret-a");

		let single = codec
			.seal(br#"{"module":"chat","method":"login","result":"success"}"#)
			.expect("seal");
		assert_eq!(codec.decode_batch(&single).expect("batch").len(), 1);

		let list = codec
			.seal(
				br#"[{"module":"chat","method":"login","users":[5]},
				     {"module":"chat","method":"usergetlist","users":[]}]"#,
			)
			.expect("seal");
		let envelopes = codec.decode_batch(&list).expect("batch");
		assert_eq!(envelopes.len(), 2);
		assert_eq!(envelopes[1].method, "usergetlist");
	}

	proptest! {
		#[test]
		fn roundtrip_arbitrary_fields(
			module in "[a-z]{1,12}",
			method in "[a-zA-Z]{1,16}",
			lang in proptest::option::of("[a-z]{2}(-[a-z]{2})?"),
			user_id in proptest::option::of(any::<i64>()),
			text in "\\PC{0,64}",
		) {
			let codec = codec("prop-secret");
			let mut env = Envelope::new(module, method);
			env.lang = lang;
			env.user_id = user_id;
			env.data = Some(json!({"text": text}));

			let raw = codec.encode(&env).expect("encode");
			prop_assert_eq!(codec.decode(&raw).expect("decode"), env);
		}
	}
}
