#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use metrics::counter;
use parley_protocol::{EnvelopeCodec, TokenKey};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::RelayConfig;
use crate::server::backend::HttpBackend;
use crate::server::connection::{ConnectionContext, serve};
use crate::server::hub::Hub;
use crate::server::ledger::Ledger;
use crate::server::reconcile::Reconciler;
use crate::server::session::SessionStore;
use crate::server::state::{LanguageRegistry, Tenants};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--config path] [--bind host:port]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.parley/config.toml)\n\
\t--bind    Websocket listen address, overrides the config file\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	config_path: Option<PathBuf>,
	bind: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: None,
		bind: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config_path = Some(PathBuf::from(v));
			}
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing(default_filter: Option<&str>) {
	let filter = std::env::var("RUST_LOG")
		.ok()
		.or_else(|| default_filter.map(str::to_string))
		.unwrap_or_else(|| "info,parley_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let config_file = crate::config::read_relay_config(&config_path)?;

	// Subscriber first, so the load's tenant warnings are not dropped.
	init_tracing(config_file.log_filter());

	let mut cfg: RelayConfig = config_file.into_relay_config();
	if let Some(bind) = args.bind {
		cfg.listen = bind;
	}
	info!(path = %config_path.display(), "loaded relay config (toml + env overrides)");
	init_metrics(cfg.metrics_bind.as_deref());

	let client_token = cfg
		.client_token
		.as_deref()
		.ok_or_else(|| anyhow!("client token not configured (set token= or PARLEY_TOKEN)"))?;
	let client_key = TokenKey::derive(client_token);

	let default_tenant = cfg
		.default_tenant
		.clone()
		.or_else(|| cfg.tenants.first().map(|t| t.name.to_string()))
		.ok_or_else(|| anyhow!("no tenants configured"))?;
	let tenants = Arc::new(Tenants::new(
		cfg.tenants.clone(),
		default_tenant.parse().map_err(|e| anyhow!("default tenant: {e}"))?,
	)?);
	info!(
		tenants = tenants.names().count(),
		default = %default_tenant,
		"tenant set loaded"
	);

	let (ledger, sessions) = match cfg.database_url.as_deref() {
		Some(url) => (
			Ledger::connect(url).await.context("open ledger store")?,
			SessionStore::connect(url).await.context("open session store")?,
		),
		None => {
			warn!("no database_url configured, ledger and sessions are in-memory only");
			(Ledger::in_memory(), SessionStore::in_memory())
		}
	};

	let backend = Arc::new(HttpBackend::new(cfg.backend_timeout)?);
	let languages = LanguageRegistry::default();
	let hub = Hub::spawn(tenants.names().cloned().collect(), ledger.clone());

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let reconciler = Reconciler::new(
		tenants.clone(),
		hub.clone(),
		ledger.clone(),
		backend.clone(),
		client_key.clone(),
		languages.clone(),
		cfg.report_interval,
		cfg.change_interval,
	);
	reconciler.announce_start().await;
	tokio::spawn(reconciler.run(shutdown_rx.clone()));

	let ctx = Arc::new(ConnectionContext {
		hub,
		tenants,
		backend,
		ledger,
		sessions,
		languages,
		client_codec: EnvelopeCodec::new(client_key),
		max_online_users: cfg.max_online_users,
	});

	let listener = TcpListener::bind(&cfg.listen)
		.await
		.with_context(|| format!("bind {}", cfg.listen))?;
	info!(listen = %cfg.listen, "parley_server: websocket endpoint ready");

	let mut next_conn_id: u64 = 0;
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(pair) => pair,
					Err(err) => {
						warn!(error = %err, "accept failed");
						tokio::time::sleep(Duration::from_millis(50)).await;
						continue;
					}
				};

				next_conn_id += 1;
				let conn_id = next_conn_id;
				counter!("parley_server_connections_total").increment(1);

				let ctx = ctx.clone();
				let shutdown = shutdown_rx.clone();
				tokio::spawn(async move {
					if let Err(err) = serve(ctx, stream, conn_id, shutdown).await {
						warn!(conn_id, %peer, error = %err, "connection ended with error");
					}
				});
			}
			_ = tokio::signal::ctrl_c() => {
				info!("shutdown signal received");
				let _ = shutdown_tx.send(true);
				break;
			}
		}
	}

	// Give duty loops a moment to flush close frames.
	tokio::time::sleep(Duration::from_millis(200)).await;
	Ok(())
}
