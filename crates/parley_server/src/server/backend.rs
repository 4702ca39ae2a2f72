#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use parley_domain::UserId;
use parley_protocol::{CodecError, Envelope, EnvelopeCodec};

use crate::server::error::RelayError;
use crate::server::state::TenantContext;

/// Transport to a tenant backend. Request and response bodies are opaque
/// ciphertext in the tenant's token domain.
#[async_trait]
pub trait BackendTransport: Send + Sync {
	async fn exchange(&self, addr: &str, body: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

/// HTTP POST transport, one request per exchanged frame.
pub struct HttpBackend {
	client: reqwest::Client,
}

impl HttpBackend {
	pub fn new(timeout: Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("build http client")?;
		Ok(Self { client })
	}
}

#[async_trait]
impl BackendTransport for HttpBackend {
	async fn exchange(&self, addr: &str, body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
		let response = self
			.client
			.post(addr)
			.body(body)
			.send()
			.await
			.with_context(|| format!("post to {addr}"))?
			.error_for_status()
			.with_context(|| format!("backend {addr} returned an error status"))?;

		let bytes = response.bytes().await.with_context(|| format!("read body from {addr}"))?;
		Ok(bytes.to_vec())
	}
}

/// One backend reply, re-encrypted for clients and routed by recipient list.
#[derive(Debug)]
pub struct BackendReply {
	/// Empty means broadcast to the whole tenant.
	pub users: Vec<UserId>,
	/// Ciphertext in the client token domain.
	pub message: Vec<u8>,
	pub envelope: Envelope,
}

/// Encrypt an envelope for a tenant and exchange it with that tenant's
/// backend.
pub async fn exchange_envelope(
	backend: &dyn BackendTransport,
	tenant: &TenantContext,
	envelope: &Envelope,
) -> Result<Vec<u8>, RelayError> {
	let body = tenant.codec.encode(envelope)?;
	backend
		.exchange(&tenant.descriptor.addr, body)
		.await
		.map_err(RelayError::Backend)
}

/// Split a backend response into per-recipient replies in the client domain.
///
/// The response is either a single envelope or an ordered list. Each entry's
/// `users` key names its recipients and is stripped before re-encryption so
/// clients never see routing metadata.
pub fn replies_for_client(
	tenant_codec: &EnvelopeCodec,
	client_codec: &EnvelopeCodec,
	raw: &[u8],
) -> Result<Vec<BackendReply>, CodecError> {
	let envelopes = tenant_codec.decode_batch(raw)?;

	let mut replies = Vec::with_capacity(envelopes.len());
	for mut envelope in envelopes {
		let users = envelope.take_send_users().into_iter().map(UserId::new).collect();
		let message = client_codec.encode(&envelope)?;
		replies.push(BackendReply {
			users,
			message,
			envelope,
		});
	}
	Ok(replies)
}
