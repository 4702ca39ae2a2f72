#![forbid(unsafe_code)]

use parley_protocol::CodecError;
use thiserror::Error;

/// Failure modes of relaying a client request to a tenant backend.
///
/// `Auth` and `Capacity` are request-scoped: they are reported to the client
/// as an encrypted error envelope and the connection stays open. `Codec`
/// failures on an inbound client frame terminate the connection.
#[derive(Debug, Error)]
pub enum RelayError {
	#[error("login rejected by backend")]
	Auth,

	#[error("tenant online-user cap reached")]
	Capacity,

	#[error("unknown tenant or platform: {0}")]
	Routing(String),

	#[error("backend exchange failed: {0}")]
	Backend(anyhow::Error),

	#[error(transparent)]
	Codec(#[from] CodecError),
}
