#![forbid(unsafe_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parley_domain::{Platform, TenantName, UserId};
use parley_protocol::{Dispatch, Envelope, EnvelopeCodec, MAX_FRAME_SIZE};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tracing::{debug, warn};

use crate::server::backend::{BackendTransport, exchange_envelope, replies_for_client};
use crate::server::error::RelayError;
use crate::server::hub::{ConnHandle, Hub, Registered};
use crate::server::ledger::Ledger;
use crate::server::session::SessionStore;
use crate::server::state::{LanguageRegistry, Tenants};

/// Idle-read deadline, reset by every inbound frame and pong.
const IDLE_READ: Duration = Duration::from_secs(20);
/// Keepalive interval, 9/10 of the idle deadline.
const PING_INTERVAL: Duration = Duration::from_secs(18);
const OUTBOUND_QUEUE: usize = 256;

const WS_PATH: &str = "/ws";
const DEFAULT_LANG: &str = "en";

/// Everything a connection actor needs, shared by all connections.
pub struct ConnectionContext {
	pub hub: Hub,
	pub tenants: Arc<Tenants>,
	pub backend: Arc<dyn BackendTransport>,
	pub ledger: Ledger,
	pub sessions: SessionStore,
	pub languages: LanguageRegistry,
	pub client_codec: EnvelopeCodec,
	/// 0 means unlimited.
	pub max_online_users: u64,
}

/// Fixed after a successful login.
#[derive(Debug)]
struct Identity {
	tenant: TenantName,
	user_id: UserId,
	lang: String,
}

struct ConnState {
	conn_id: u64,
	platform: Platform,
	outbound: mpsc::Sender<Vec<u8>>,
	close: Arc<watch::Sender<bool>>,
	identity: Arc<OnceLock<Identity>>,
	handle: Option<ConnHandle>,
}

enum Flow {
	Continue,
	Close,
}

struct ActiveConnection;

impl ActiveConnection {
	fn track() -> Self {
		gauge!("parley_server_active_connections").increment(1.0);
		Self
	}
}

impl Drop for ActiveConnection {
	fn drop(&mut self) {
		gauge!("parley_server_active_connections").decrement(1.0);
	}
}

/// Run one connection: websocket handshake, inbound duty inline, outbound
/// duty spawned, one-time cleanup on any termination path.
pub async fn serve(
	ctx: Arc<ConnectionContext>,
	stream: TcpStream,
	conn_id: u64,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let _active = ActiveConnection::track();

	let mut client_version: Option<String> = None;
	let mut platform = Platform::Desktop;

	let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
		if req.uri().path() != WS_PATH {
			let mut reject = ErrorResponse::new(Some("not found".to_string()));
			*reject.status_mut() = StatusCode::NOT_FOUND;
			return Err(reject);
		}

		client_version = req
			.headers()
			.get("version")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		if let Some(value) = req.headers().get("platform").and_then(|v| v.to_str().ok()) {
			platform = value.parse().unwrap_or(Platform::Desktop);
		}

		resp.headers_mut().insert("server", HeaderValue::from_static("parley"));
		resp.headers_mut()
			.insert("parley-version", HeaderValue::from_static(env!("CARGO_PKG_VERSION")));
		Ok(resp)
	};

	let config = WebSocketConfig::default()
		.max_message_size(Some(MAX_FRAME_SIZE))
		.max_frame_size(Some(MAX_FRAME_SIZE));
	let ws = accept_hdr_async_with_config(stream, callback, Some(config))
		.await
		.context("websocket handshake")?;

	debug!(conn_id, ?client_version, platform = %platform, "connection established");

	let (ws_tx, mut ws_rx) = ws.split();
	let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
	let (close_tx, _) = watch::channel(false);
	let close = Arc::new(close_tx);
	let identity: Arc<OnceLock<Identity>> = Arc::new(OnceLock::new());

	let writer = tokio::spawn(outbound_duty(
		ctx.clone(),
		ws_tx,
		outbound_rx,
		close.clone(),
		shutdown.clone(),
		identity.clone(),
	));

	let mut state = ConnState {
		conn_id,
		platform,
		outbound: outbound_tx,
		close: close.clone(),
		identity: identity.clone(),
		handle: None,
	};

	let mut close_rx = close.subscribe();
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			changed = close_rx.changed() => {
				if changed.is_err() || *close_rx.borrow() {
					break;
				}
			}
			frame = timeout(IDLE_READ, ws_rx.next()) => {
				let Ok(frame) = frame else {
					debug!(conn_id, "idle-read deadline reached");
					break;
				};
				match frame {
					None => break,
					Some(Err(err)) => {
						debug!(conn_id, error = %err, "socket read failed");
						break;
					}
					Some(Ok(Message::Binary(data))) => {
						counter!("parley_server_frames_in_total").increment(1);
						match handle_frame(&ctx, &mut state, &data).await {
							Flow::Continue => {}
							Flow::Close => break,
						}
					}
					Some(Ok(Message::Close(_))) => break,
					// Pings and pongs only reset the idle deadline.
					Some(Ok(_)) => {}
				}
			}
		}
	}

	let _ = close.send_replace(true);
	cleanup(&ctx, &state).await;
	let _ = writer.await;

	Ok(())
}

/// Sole socket writer: drains the bounded queue (coalescing whatever is
/// already queued), keeps the peer alive with pings, flushes pending frames
/// before honoring a close request.
async fn outbound_duty(
	ctx: Arc<ConnectionContext>,
	mut ws_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
	mut queue: mpsc::Receiver<Vec<u8>>,
	close: Arc<watch::Sender<bool>>,
	mut shutdown: watch::Receiver<bool>,
	identity: Arc<OnceLock<Identity>>,
) {
	let mut close_rx = close.subscribe();
	let mut ping = interval(PING_INTERVAL);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	'duty: loop {
		tokio::select! {
			changed = close_rx.changed() => {
				if changed.is_err() || *close_rx.borrow() {
					while let Ok(frame) = queue.try_recv() {
						if ws_tx.send(Message::binary(frame)).await.is_err() {
							break;
						}
					}
					let _ = ws_tx.send(Message::Close(None)).await;
					break 'duty;
				}
			}
			_ = shutdown.changed() => {
				let _ = ws_tx.send(Message::Close(None)).await;
				break 'duty;
			}
			next = queue.recv() => {
				let Some(frame) = next else { break 'duty };
				if let Err(err) = ws_tx.send(Message::binary(frame.clone())).await {
					debug!(error = %err, "socket write failed");
					record_send_fail(&ctx, &identity, &frame).await;
					let _ = close.send_replace(true);
					break 'duty;
				}
				// Coalesce whatever the hub already queued behind this frame.
				while let Ok(frame) = queue.try_recv() {
					if let Err(err) = ws_tx.send(Message::binary(frame.clone())).await {
						debug!(error = %err, "socket write failed");
						record_send_fail(&ctx, &identity, &frame).await;
						let _ = close.send_replace(true);
						break 'duty;
					}
				}
			}
			_ = ping.tick() => {
				if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
					let _ = close.send_replace(true);
					break 'duty;
				}
			}
		}
	}
}

/// A lost `chat.message` frame is retried later through the ledger.
async fn record_send_fail(ctx: &ConnectionContext, identity: &OnceLock<Identity>, frame: &[u8]) {
	let Some(identity) = identity.get() else { return };
	let Ok(envelope) = ctx.client_codec.decode(frame) else { return };
	if envelope.module != "chat" || envelope.method != "message" {
		return;
	}

	let gids: Vec<String> = match &envelope.data {
		Some(Value::Array(items)) => items
			.iter()
			.filter_map(|item| item.get("gid").and_then(Value::as_str).map(str::to_string))
			.collect(),
		Some(Value::Object(map)) => map
			.get("gid")
			.and_then(Value::as_str)
			.map(str::to_string)
			.into_iter()
			.collect(),
		_ => Vec::new(),
	};

	for gid in gids {
		if let Err(err) = ctx.ledger.insert_send_fail(&identity.tenant, identity.user_id, &gid).await {
			warn!(error = %err, gid, "failed to record undelivered message");
		}
	}
}

async fn handle_frame(ctx: &ConnectionContext, state: &mut ConnState, raw: &[u8]) -> Flow {
	let envelope = match ctx.client_codec.decode(raw) {
		Ok(envelope) => envelope,
		Err(err) => {
			warn!(conn_id = state.conn_id, error = %err, "undecodable frame, closing");
			return Flow::Close;
		}
	};

	match envelope.dispatch() {
		Dispatch::Login => handle_login(ctx, state, envelope).await,
		Dispatch::Typing => handle_typing(ctx, state, envelope).await,
		// Cleanup performs the best-effort backend logout.
		Dispatch::Logout => Flow::Close,
		Dispatch::Relay => handle_relay(ctx, state, envelope).await,
	}
}

async fn handle_login(ctx: &ConnectionContext, state: &mut ConnState, envelope: Envelope) -> Flow {
	// The identity is fixed for the life of the socket. A relogin here would
	// leave the first registry slot dangling with no offline record, so it is
	// refused; clients reconnect to switch accounts.
	if state.identity.get().is_some() {
		warn!(conn_id = state.conn_id, "login on an already logged-in connection");
		enqueue(ctx, state, &Envelope::error("0", "already logged in")).await;
		return Flow::Continue;
	}

	let tenant_ctx = match ctx.tenants.resolve(envelope.param_str(0)) {
		Ok(tenant) => tenant,
		Err(err) => {
			warn!(conn_id = state.conn_id, error = %err, "login to unknown tenant");
			enqueue(ctx, state, &Envelope::error("0", "unknown tenant")).await;
			return Flow::Continue;
		}
	};
	let tenant = tenant_ctx.name().clone();

	if ctx.max_online_users > 0 {
		let online = ctx.hub.online_count(tenant.clone()).await;
		if online >= ctx.max_online_users {
			warn!(tenant = %tenant, online, cap = ctx.max_online_users, error = %RelayError::Capacity, "login rejected");
			enqueue(ctx, state, &Envelope::blocked()).await;
			return Flow::Continue;
		}
	}

	let lang = envelope.lang.clone().unwrap_or_else(|| DEFAULT_LANG.to_string());
	ctx.languages.observe(&lang);

	let raw_reply = match exchange_envelope(ctx.backend.as_ref(), tenant_ctx, &envelope).await {
		Ok(raw) => raw,
		Err(err) => {
			warn!(tenant = %tenant, error = %err, "login exchange failed");
			enqueue(ctx, state, &Envelope::error("0", "time out")).await;
			return Flow::Continue;
		}
	};
	let replies = match replies_for_client(&tenant_ctx.codec, &ctx.client_codec, &raw_reply) {
		Ok(replies) => replies,
		Err(err) => {
			warn!(tenant = %tenant, error = %err, "unreadable login reply");
			enqueue(ctx, state, &Envelope::error("0", "time out")).await;
			return Flow::Continue;
		}
	};

	let Some(user_id) = replies.first().and_then(|reply| reply.envelope.login_user_id()) else {
		warn!(tenant = %tenant, error = %RelayError::Auth, "login rejected");
		// Backend rejected the credentials, forward its payload verbatim.
		for reply in &replies {
			let _ = state.outbound.send(reply.message.clone()).await;
		}
		if replies.is_empty() {
			enqueue(ctx, state, &Envelope::error("0", "login failed")).await;
		}
		return Flow::Continue;
	};
	let user_id = UserId::new(user_id);

	for reply in &replies {
		let _ = state.outbound.send(reply.message.clone()).await;
	}

	let sid = match ctx.sessions.create(&tenant, user_id).await {
		Ok(sid) => sid,
		Err(err) => {
			warn!(tenant = %tenant, user = user_id.as_i64(), error = %err, "session create failed");
			return Flow::Close;
		}
	};
	enqueue(ctx, state, &Envelope::session(Some(&lang), &sid)).await;

	// Announce the login to the tenant's other connections. This connection
	// is not registered yet, so it never receives its own announcement.
	if let Some(first) = replies.first() {
		ctx.hub.broadcast(tenant.clone(), first.message.clone()).await;
	}

	let identity = Identity {
		tenant: tenant.clone(),
		user_id,
		lang,
	};
	if state.identity.set(identity).is_err() {
		return Flow::Close;
	}

	let handle = ConnHandle::new(
		state.conn_id,
		tenant,
		state.platform,
		user_id,
		state.outbound.clone(),
		state.close.clone(),
	);
	match ctx.hub.register(handle.clone()).await {
		Registered::Admitted => {
			state.handle = Some(handle);
			Flow::Continue
		}
		Registered::Replaced(previous) => {
			// Kick exactly once, then force the superseded connection closed.
			// The relogin guard means the previous handle is never our own.
			if previous.conn_id != state.conn_id {
				if let Ok(kick) = ctx.client_codec.encode(&Envelope::kicked()) {
					let _ = previous.outbound.try_send(kick);
				}
				previous.close();
			}
			state.handle = Some(handle);
			Flow::Continue
		}
		Registered::Refused => Flow::Close,
	}
}

async fn handle_typing(ctx: &ConnectionContext, state: &mut ConnState, envelope: Envelope) -> Flow {
	let Some(identity) = state.identity.get() else {
		warn!(conn_id = state.conn_id, "typing before login");
		return Flow::Close;
	};

	let users: Vec<UserId> = envelope
		.param(0)
		.and_then(Value::as_array)
		.map(|items| items.iter().filter_map(Value::as_i64).map(UserId::new).collect())
		.unwrap_or_default();

	let mut notice = Envelope::new("chat", "typing");
	notice.result = Some("success".to_string());
	notice.data = Some(json!({
		"cgid": envelope.param(1).cloned().unwrap_or(Value::Null),
		"typing": envelope.param(2).cloned().unwrap_or(Value::Null),
		"user": envelope.user_id,
	}));

	match ctx.client_codec.encode(&notice) {
		Ok(raw) => deliver(ctx, identity.tenant.clone(), users, raw).await,
		Err(err) => warn!(error = %err, "typing notice encode failed"),
	}
	Flow::Continue
}

async fn handle_relay(ctx: &ConnectionContext, state: &mut ConnState, envelope: Envelope) -> Flow {
	let Some(identity) = state.identity.get() else {
		warn!(conn_id = state.conn_id, "relay before login");
		return Flow::Close;
	};
	if envelope.user_id != Some(identity.user_id.as_i64()) {
		warn!(
			conn_id = state.conn_id,
			user = identity.user_id.as_i64(),
			claimed = ?envelope.user_id,
			"frame user id does not match the logged-in user"
		);
		return Flow::Continue;
	}

	let Some(tenant_ctx) = ctx.tenants.get(&identity.tenant) else {
		return Flow::Close;
	};

	let raw_reply = match exchange_envelope(ctx.backend.as_ref(), tenant_ctx, &envelope).await {
		Ok(raw) => raw,
		Err(err) => {
			warn!(tenant = %identity.tenant, error = %err, "relay exchange failed");
			enqueue(ctx, state, &Envelope::error("0", "time out")).await;
			return Flow::Continue;
		}
	};

	let replies = match replies_for_client(&tenant_ctx.codec, &ctx.client_codec, &raw_reply) {
		Ok(replies) => replies,
		Err(err) => {
			warn!(tenant = %identity.tenant, error = %err, "unreadable relay reply");
			enqueue(ctx, state, &Envelope::error("0", "time out")).await;
			return Flow::Continue;
		}
	};

	for reply in replies {
		deliver(ctx, identity.tenant.clone(), reply.users, reply.message).await;
	}
	Flow::Continue
}

/// Empty recipient list means broadcast to the whole tenant.
async fn deliver(ctx: &ConnectionContext, tenant: TenantName, users: Vec<UserId>, message: Vec<u8>) {
	if users.is_empty() {
		ctx.hub.broadcast(tenant, message).await;
	} else {
		ctx.hub.multicast(tenant, users, message).await;
	}
}

/// Reply to this connection only.
async fn enqueue(ctx: &ConnectionContext, state: &ConnState, envelope: &Envelope) {
	match ctx.client_codec.encode(envelope) {
		Ok(raw) => {
			let _ = state.outbound.send(raw).await;
		}
		Err(err) => warn!(error = %err, "reply encode failed"),
	}
}

/// Runs exactly once per connection, on any termination path.
async fn cleanup(ctx: &ConnectionContext, state: &ConnState) {
	if let Some(handle) = &state.handle {
		ctx.hub.unregister(handle.clone()).await;
	}

	let Some(identity) = state.identity.get() else { return };

	// A newer login owns the slot and the session now.
	if state.handle.as_ref().is_some_and(ConnHandle::superseded) {
		return;
	}

	if let Some(tenant_ctx) = ctx.tenants.get(&identity.tenant) {
		let mut logout = Envelope::new("chat", "logout");
		logout.user_id = Some(identity.user_id.as_i64());
		logout.lang = Some(identity.lang.clone());

		match exchange_envelope(ctx.backend.as_ref(), tenant_ctx, &logout).await {
			Ok(raw) => {
				if let Ok(replies) = replies_for_client(&tenant_ctx.codec, &ctx.client_codec, &raw) {
					for reply in replies {
						deliver(ctx, identity.tenant.clone(), reply.users, reply.message).await;
					}
				}
			}
			Err(err) => debug!(tenant = %identity.tenant, error = %err, "logout exchange failed"),
		}
	}

	if let Err(err) = ctx.sessions.delete(&identity.tenant, identity.user_id).await {
		warn!(tenant = %identity.tenant, error = %err, "session delete failed");
	}
}

#[cfg(test)]
mod tests {
	use anyhow::anyhow;
	use async_trait::async_trait;
	use parley_protocol::TokenKey;
	use tokio::net::TcpListener;
	use tokio_tungstenite::MaybeTlsStream;

	use super::*;
	use crate::server::state::TenantDescriptor;

	struct UnreachableBackend;

	#[async_trait]
	impl BackendTransport for UnreachableBackend {
		async fn exchange(&self, _addr: &str, _body: Vec<u8>) -> anyhow::Result<Vec<u8>> {
			Err(anyhow!("backend is down"))
		}
	}

	fn tenant() -> TenantName {
		TenantName::new("alpha").expect("tenant name")
	}

	fn context() -> Arc<ConnectionContext> {
		let ledger = Ledger::in_memory();
		let tenants = Arc::new(
			Tenants::new(
				vec![TenantDescriptor {
					name: tenant(),
					addr: "http://alpha.example/api".to_string(),
					token: TokenKey::derive("tenant-secret"),
				}],
				tenant(),
			)
			.expect("tenants"),
		);

		Arc::new(ConnectionContext {
			hub: Hub::spawn(vec![tenant()], ledger.clone()),
			tenants,
			backend: Arc::new(UnreachableBackend),
			ledger,
			sessions: SessionStore::in_memory(),
			languages: LanguageRegistry::default(),
			client_codec: EnvelopeCodec::new(TokenKey::derive("client-secret")),
			max_online_users: 0,
		})
	}

	fn logged_in() -> OnceLock<Identity> {
		let identity = OnceLock::new();
		identity
			.set(Identity {
				tenant: tenant(),
				user_id: UserId::new(7),
				lang: "en".to_string(),
			})
			.expect("set identity");
		identity
	}

	async fn recorded_gids(ctx: &ConnectionContext) -> Vec<String> {
		ctx.ledger
			.send_failures(&tenant())
			.await
			.expect("send_failures")
			.into_iter()
			.map(|record| record.gid)
			.collect()
	}

	#[tokio::test]
	async fn lost_chat_messages_are_recorded_by_gid() {
		let ctx = context();
		let identity = logged_in();

		let mut message = Envelope::new("chat", "message");
		message.data = Some(json!([{"gid": "g-1"}, {"gid": "g-2"}]));
		let frame = ctx.client_codec.encode(&message).expect("encode");
		record_send_fail(&ctx, &identity, &frame).await;

		assert_eq!(recorded_gids(&ctx).await, vec!["g-1".to_string(), "g-2".to_string()]);
	}

	#[tokio::test]
	async fn only_chat_messages_from_a_logged_in_peer_are_recorded() {
		let ctx = context();

		// Before login there is nobody to attribute the loss to.
		let mut message = Envelope::new("chat", "message");
		message.data = Some(json!({"gid": "g-1"}));
		let frame = ctx.client_codec.encode(&message).expect("encode");
		record_send_fail(&ctx, &OnceLock::new(), &frame).await;

		// A typing notice carries nothing worth retrying.
		let identity = logged_in();
		let mut typing = Envelope::new("chat", "typing");
		typing.data = Some(json!({"gid": "g-9"}));
		let typing_frame = ctx.client_codec.encode(&typing).expect("encode");
		record_send_fail(&ctx, &identity, &typing_frame).await;

		assert!(recorded_gids(&ctx).await.is_empty());
	}

	#[tokio::test]
	async fn a_failed_socket_write_records_the_message_and_closes() {
		let ctx = context();
		let identity = Arc::new(logged_in());

		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		let client = tokio::spawn(tokio_tungstenite::connect_async(format!("ws://{addr}/")));
		let (stream, _) = listener.accept().await.expect("accept");
		let ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
		let (ws_tx, _ws_rx) = ws.split();

		// Abort the peer with a reset so the next server-side write fails.
		let (client_ws, _) = client.await.expect("join").expect("connect");
		if let MaybeTlsStream::Plain(tcp) = client_ws.get_ref() {
			tcp.set_linger(Some(Duration::ZERO)).expect("set linger");
		}
		drop(client_ws);
		tokio::time::sleep(Duration::from_millis(100)).await;

		let mut message = Envelope::new("chat", "message");
		message.data = Some(json!([{"gid": "g-lost"}]));
		let frame = ctx.client_codec.encode(&message).expect("encode");

		let (queue_tx, queue_rx) = mpsc::channel(OUTBOUND_QUEUE);
		queue_tx.send(frame).await.expect("queue");
		let (close_tx, _) = watch::channel(false);
		let close = Arc::new(close_tx);
		let mut close_rx = close.subscribe();
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);

		outbound_duty(ctx.clone(), ws_tx, queue_rx, close.clone(), shutdown_rx, identity).await;

		assert!(*close_rx.borrow_and_update(), "failed write must request close");
		assert_eq!(recorded_gids(&ctx).await, vec!["g-lost".to_string()]);
	}
}
