#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::counter;
use parley_domain::{Platform, TenantName, UserId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::server::ledger::Ledger;

const HUB_QUEUE: usize = 1024;

/// Non-owning handle to one live connection, held by the hub registry.
///
/// The connection actor keeps ownership of the socket. The hub only pushes
/// encrypted frames into `outbound` and can request shutdown through `close`.
#[derive(Debug, Clone)]
pub struct ConnHandle {
	pub conn_id: u64,
	pub tenant: TenantName,
	pub platform: Platform,
	pub user_id: UserId,
	pub outbound: mpsc::Sender<Vec<u8>>,
	/// Set when a newer login takes over this slot. The superseded connection
	/// must then skip backend logout and keep the new session intact.
	pub repeat_login: Arc<AtomicBool>,
	close: Arc<watch::Sender<bool>>,
}

impl ConnHandle {
	pub fn new(
		conn_id: u64,
		tenant: TenantName,
		platform: Platform,
		user_id: UserId,
		outbound: mpsc::Sender<Vec<u8>>,
		close: Arc<watch::Sender<bool>>,
	) -> Self {
		Self {
			conn_id,
			tenant,
			platform,
			user_id,
			outbound,
			repeat_login: Arc::new(AtomicBool::new(false)),
			close,
		}
	}

	/// Ask the connection actor to shut down. Idempotent.
	pub fn close(&self) {
		let _ = self.close.send_replace(true);
	}

	pub fn superseded(&self) -> bool {
		self.repeat_login.load(Ordering::SeqCst)
	}
}

/// Outcome of registering a freshly authenticated connection.
#[derive(Debug)]
pub enum Registered {
	Admitted,
	/// Same (tenant, platform, user) was already connected. The previous
	/// handle is returned so the caller can notify and close it.
	Replaced(ConnHandle),
	/// The tenant or platform slot does not exist.
	Refused,
}

enum HubOp {
	Register {
		handle: ConnHandle,
		reply: oneshot::Sender<Registered>,
	},
	Unregister {
		handle: ConnHandle,
	},
	Multicast {
		tenant: TenantName,
		users: Vec<UserId>,
		message: Vec<u8>,
	},
	Broadcast {
		tenant: TenantName,
		message: Vec<u8>,
	},
	OnlineCount {
		tenant: TenantName,
		reply: oneshot::Sender<u64>,
	},
}

/// Clonable handle to the hub registry actor.
#[derive(Clone)]
pub struct Hub {
	ops: mpsc::Sender<HubOp>,
}

impl Hub {
	/// Spawn the registry actor seeded with one slot per (tenant, platform).
	pub fn spawn(tenants: Vec<TenantName>, ledger: Ledger) -> Self {
		let (ops, rx) = mpsc::channel(HUB_QUEUE);
		tokio::spawn(run(tenants, ledger, rx));
		Self { ops }
	}

	pub async fn register(&self, handle: ConnHandle) -> Registered {
		let (reply, rx) = oneshot::channel();
		if self.ops.send(HubOp::Register { handle, reply }).await.is_err() {
			return Registered::Refused;
		}
		rx.await.unwrap_or(Registered::Refused)
	}

	pub async fn unregister(&self, handle: ConnHandle) {
		let _ = self.ops.send(HubOp::Unregister { handle }).await;
	}

	/// Deliver a client-domain frame to each listed user, on every platform.
	pub async fn multicast(&self, tenant: TenantName, users: Vec<UserId>, message: Vec<u8>) {
		let _ = self.ops.send(HubOp::Multicast { tenant, users, message }).await;
	}

	/// Deliver a client-domain frame to every connection of a tenant.
	pub async fn broadcast(&self, tenant: TenantName, message: Vec<u8>) {
		let _ = self.ops.send(HubOp::Broadcast { tenant, message }).await;
	}

	pub async fn online_count(&self, tenant: TenantName) -> u64 {
		let (reply, rx) = oneshot::channel();
		if self.ops.send(HubOp::OnlineCount { tenant, reply }).await.is_err() {
			return 0;
		}
		rx.await.unwrap_or(0)
	}
}

type Registry = HashMap<TenantName, HashMap<Platform, HashMap<UserId, ConnHandle>>>;

async fn run(tenants: Vec<TenantName>, ledger: Ledger, mut rx: mpsc::Receiver<HubOp>) {
	let mut registry: Registry = HashMap::new();
	for tenant in tenants {
		let slots = registry.entry(tenant).or_default();
		for platform in Platform::ALL {
			slots.entry(platform).or_default();
		}
	}

	while let Some(op) = rx.recv().await {
		match op {
			HubOp::Register { handle, reply } => {
				let _ = reply.send(register(&mut registry, &ledger, handle));
			}
			HubOp::Unregister { handle } => {
				unregister(&mut registry, &ledger, handle);
			}
			HubOp::Multicast { tenant, users, message } => {
				multicast(&mut registry, &tenant, &users, &message);
			}
			HubOp::Broadcast { tenant, message } => {
				broadcast(&mut registry, &tenant, &message);
			}
			HubOp::OnlineCount { tenant, reply } => {
				let _ = reply.send(online_count(&registry, &tenant));
			}
		}
	}
}

fn register(registry: &mut Registry, ledger: &Ledger, handle: ConnHandle) -> Registered {
	let Some(slot) = registry
		.get_mut(&handle.tenant)
		.and_then(|slots| slots.get_mut(&handle.platform))
	else {
		warn!(tenant = %handle.tenant, "register refused for unknown slot");
		return Registered::Refused;
	};

	// The user is live again, pending offline records are stale.
	let ledger = ledger.clone();
	let (tenant, user) = (handle.tenant.clone(), handle.user_id);
	tokio::spawn(async move {
		if let Err(err) = ledger.mark_login(&tenant, user).await {
			warn!(error = %err, "failed to clear offline records on login");
		}
	});

	match slot.insert(handle.user_id, handle.clone()) {
		None => {
			debug!(tenant = %handle.tenant, user = handle.user_id.as_i64(), "connection registered");
			Registered::Admitted
		}
		Some(previous) => {
			previous.repeat_login.store(true, Ordering::SeqCst);
			counter!("parley_server_kicks_total").increment(1);
			debug!(
				tenant = %handle.tenant,
				user = handle.user_id.as_i64(),
				"login takeover, previous connection superseded"
			);
			Registered::Replaced(previous)
		}
	}
}

fn unregister(registry: &mut Registry, ledger: &Ledger, handle: ConnHandle) {
	// A superseded connection no longer owns its slot.
	if handle.superseded() {
		return;
	}

	let Some(slot) = registry
		.get_mut(&handle.tenant)
		.and_then(|slots| slots.get_mut(&handle.platform))
	else {
		return;
	};

	// Only the registered connection may vacate the slot.
	let owns_slot = slot.get(&handle.user_id).is_some_and(|cur| cur.conn_id == handle.conn_id);
	if !owns_slot {
		return;
	}
	slot.remove(&handle.user_id);

	let ledger = ledger.clone();
	tokio::spawn(async move {
		if let Err(err) = ledger.insert_offline(&handle.tenant, handle.user_id).await {
			warn!(error = %err, "failed to record offline user");
		}
	});
}

fn multicast(registry: &mut Registry, tenant: &TenantName, users: &[UserId], message: &[u8]) {
	let Some(slots) = registry.get_mut(tenant) else {
		return;
	};

	for slot in slots.values_mut() {
		for user in users {
			let Some(handle) = slot.get(user) else { continue };
			if handle.outbound.try_send(message.to_vec()).is_err() {
				counter!("parley_server_hub_dropped_total").increment(1);
				handle.close();
				slot.remove(user);
			}
		}
	}
}

fn broadcast(registry: &mut Registry, tenant: &TenantName, message: &[u8]) {
	let Some(slots) = registry.get_mut(tenant) else {
		return;
	};

	for slot in slots.values_mut() {
		slot.retain(|_, handle| {
			if handle.outbound.try_send(message.to_vec()).is_err() {
				counter!("parley_server_hub_dropped_total").increment(1);
				handle.close();
				false
			} else {
				true
			}
		});
	}
}

fn online_count(registry: &Registry, tenant: &TenantName) -> u64 {
	registry
		.get(tenant)
		.map(|slots| slots.values().map(|slot| slot.len() as u64).sum())
		.unwrap_or(0)
}
