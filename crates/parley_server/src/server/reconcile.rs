#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parley_domain::UserId;
use parley_protocol::{Envelope, EnvelopeCodec, TokenKey, TokenRelay};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::server::backend::BackendTransport;
use crate::server::hub::Hub;
use crate::server::ledger::Ledger;
use crate::server::state::{LanguageRegistry, TenantContext, Tenants};

/// Periodic offline/failure reporting and roster-change polling, per tenant
/// and per observed client language.
///
/// Ledger records are cleared only after the report round trip succeeds.
/// A failed tick is logged and retried whole on the next interval.
pub struct Reconciler {
	tenants: Arc<Tenants>,
	hub: Hub,
	ledger: Ledger,
	backend: Arc<dyn BackendTransport>,
	client_codec: EnvelopeCodec,
	client_key: TokenKey,
	languages: LanguageRegistry,
	report_interval: Duration,
	change_interval: Duration,
}

impl Reconciler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		tenants: Arc<Tenants>,
		hub: Hub,
		ledger: Ledger,
		backend: Arc<dyn BackendTransport>,
		client_key: TokenKey,
		languages: LanguageRegistry,
		report_interval: Duration,
		change_interval: Duration,
	) -> Self {
		Self {
			tenants,
			hub,
			ledger,
			backend,
			client_codec: EnvelopeCodec::new(client_key.clone()),
			client_key,
			languages,
			report_interval,
			change_interval,
		}
	}

	/// Tell every configured tenant the relay is up. Per-tenant failures are
	/// logged; an unreachable tenant simply starts cold.
	pub async fn announce_start(&self) {
		for tenant in self.tenants.iter() {
			let announce = Envelope::new("chat", "serverStart");
			match self.exchange(tenant, &announce).await {
				Ok(_) => info!(tenant = %tenant.name(), "announced server start"),
				Err(err) => warn!(tenant = %tenant.name(), error = %err, "server start announce failed"),
			}
		}
	}

	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut report = interval(self.report_interval);
		let mut change = interval(self.change_interval);
		report.set_missed_tick_behavior(MissedTickBehavior::Delay);
		change.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// Both intervals fire immediately once; consume that so the first
		// real tick lands one full period after startup.
		report.tick().await;
		change.tick().await;

		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = report.tick() => self.report_tick().await,
				_ = change.tick() => self.change_tick().await,
			}
		}
	}

	async fn report_tick(&self) {
		for lang in self.languages.snapshot() {
			for tenant in self.tenants.iter() {
				if let Err(err) = self.report_one(tenant, &lang).await {
					counter!("parley_server_reconcile_errors_total").increment(1);
					warn!(tenant = %tenant.name(), lang, error = %err, "report tick failed");
				}
			}
		}
	}

	async fn change_tick(&self) {
		for lang in self.languages.snapshot() {
			for tenant in self.tenants.iter() {
				if let Err(err) = self.change_one(tenant, &lang).await {
					counter!("parley_server_reconcile_errors_total").increment(1);
					warn!(tenant = %tenant.name(), lang, error = %err, "change tick failed");
				}
			}
		}
	}

	/// Report offline users and undelivered message ids, fan the returned
	/// per-user notifications out, then clear exactly what was reported.
	pub async fn report_one(&self, tenant: &TenantContext, lang: &str) -> anyhow::Result<()> {
		let name = tenant.name().clone();
		let offline = self.ledger.offline_users(&name).await?;
		let failures = self.ledger.send_failures(&name).await?;
		let gids: Vec<String> = failures.into_iter().map(|record| record.gid).collect();

		let mut request = Envelope::new("chat", "notify");
		request.lang = Some(lang.to_string());
		request.params = Some(json!({
			"offline": offline.iter().map(|user| user.as_i64()).collect::<Vec<_>>(),
			"sendfail": gids,
		}));

		let raw = self.exchange(tenant, &request).await?;
		let reply = tenant.codec.decode(&raw)?;
		if !reply.is_success() {
			anyhow::bail!("notify reply result was {:?}", reply.result);
		}

		if let Some(Value::Object(per_user)) = &reply.data {
			for (user, messages) in per_user {
				let Ok(user_id) = user.parse::<i64>() else {
					debug!(tenant = %name, user, "non-numeric user key in notify reply");
					continue;
				};
				if messages.is_null() {
					continue;
				}

				let mut notify = Envelope::new("chat", "notify");
				notify.data = Some(messages.clone());
				let message = self.client_codec.encode(&notify)?;
				self.hub.multicast(name.clone(), vec![UserId::new(user_id)], message).await;
			}
		}

		// Clear-after-success, and only what this round trip carried.
		self.ledger.clear_offline(&name, &offline).await?;
		self.ledger.clear_send_failures(&name, &gids).await?;
		Ok(())
	}

	/// Ask whether the tenant roster changed; when it did, fetch the list,
	/// swap it into the client token domain, and broadcast it.
	pub async fn change_one(&self, tenant: &TenantContext, lang: &str) -> anyhow::Result<()> {
		let mut probe = Envelope::new("chat", "checkUserChange");
		probe.lang = Some(lang.to_string());
		probe.params = Some(json!([""]));

		let raw = self.exchange(tenant, &probe).await?;
		let reply = tenant.codec.decode(&raw)?;
		if !reply.is_success() {
			anyhow::bail!("checkUserChange reply result was {:?}", reply.result);
		}
		if reply.data == Some(json!("no")) {
			return Ok(());
		}

		let mut fetch = Envelope::new("chat", "usergetlist");
		fetch.lang = Some(lang.to_string());
		fetch.user_id = Some(0);
		fetch.params = Some(json!([""]));

		let raw = self.exchange(tenant, &fetch).await?;
		let relay = TokenRelay::new(tenant.descriptor.token.clone(), self.client_key.clone());
		let (roster, _) = relay.swap(&raw)?;
		self.hub.broadcast(tenant.name().clone(), roster).await;
		Ok(())
	}

	async fn exchange(&self, tenant: &TenantContext, envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
		let body = tenant.codec.encode(envelope)?;
		self.backend.exchange(&tenant.descriptor.addr, body).await
	}
}
