#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_domain::TenantName;
use parley_protocol::TokenKey;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::state::TenantDescriptor;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Config file parsed but not yet turned into a [`RelayConfig`].
///
/// The load is split in two so the tracing subscriber can be seeded from
/// `log_filter` before [`ConfigFile::into_relay_config`] emits its tenant
/// warnings and env-override notices.
pub struct ConfigFile {
	file: FileConfig,
}

/// First phase: parse the TOML. Emits no log events.
pub fn read_relay_config(path: &Path) -> anyhow::Result<ConfigFile> {
	let file = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();
	Ok(ConfigFile { file })
}

impl ConfigFile {
	pub fn log_filter(&self) -> Option<&str> {
		self.file.log_filter.as_deref().map(str::trim).filter(|s| !s.is_empty())
	}

	/// Second phase: validate tenants and apply `PARLEY_*` env overrides,
	/// logging skipped entries and overrides as it goes.
	pub fn into_relay_config(self) -> RelayConfig {
		let mut cfg = RelayConfig::from_file(self.file);
		apply_env_overrides(&mut cfg);
		cfg
	}
}

/// Relay config (v1).
#[derive(Debug, Clone)]
pub struct RelayConfig {
	/// Websocket listen address (host:port).
	pub listen: String,
	/// Client-facing token secret; required to start.
	pub client_token: Option<String>,
	/// Tenant used when a login names none; defaults to the first tenant.
	pub default_tenant: Option<String>,
	pub tenants: Vec<TenantDescriptor>,
	/// 0 means unlimited.
	pub max_online_users: u64,
	/// sqlite: URL for the ledger and session store; in-memory when unset.
	pub database_url: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Default log filter when RUST_LOG is unset.
	pub log_filter: Option<String>,
	pub backend_timeout: Duration,
	pub report_interval: Duration,
	pub change_interval: Duration,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	listen: Option<String>,
	token: Option<String>,
	default_tenant: Option<String>,
	max_online_users: Option<u64>,
	database_url: Option<String>,
	metrics_bind: Option<String>,
	log_filter: Option<String>,

	backend_timeout_secs: Option<u64>,
	report_interval_secs: Option<u64>,
	change_interval_secs: Option<u64>,

	#[serde(default)]
	tenants: BTreeMap<String, FileTenant>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileTenant {
	addr: String,
	token: String,
}

impl RelayConfig {
	fn from_file(file: FileConfig) -> Self {
		let mut tenants = Vec::new();
		for (name, tenant) in file.tenants {
			let name = match TenantName::new(&name) {
				Ok(name) => name,
				Err(err) => {
					warn!(tenant = %name, error = %err, "skipping tenant with invalid name");
					continue;
				}
			};
			if tenant.addr.trim().is_empty() || tenant.token.trim().is_empty() {
				warn!(tenant = %name, "skipping tenant with blank addr or token");
				continue;
			}
			tenants.push(TenantDescriptor {
				name,
				addr: tenant.addr,
				token: TokenKey::derive(&tenant.token),
			});
		}

		Self {
			listen: file
				.listen
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| "0.0.0.0:11444".to_string()),
			client_token: file.token.filter(|s| !s.trim().is_empty()),
			default_tenant: file.default_tenant.filter(|s| !s.trim().is_empty()),
			tenants,
			max_online_users: file.max_online_users.unwrap_or(0),
			database_url: file.database_url.filter(|s| !s.trim().is_empty()),
			metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
			log_filter: file.log_filter.filter(|s| !s.trim().is_empty()),
			backend_timeout: Duration::from_secs(file.backend_timeout_secs.unwrap_or(10)),
			report_interval: Duration::from_secs(file.report_interval_secs.unwrap_or(60)),
			change_interval: Duration::from_secs(file.change_interval_secs.unwrap_or(60)),
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut RelayConfig) {
	if let Ok(v) = std::env::var("PARLEY_LISTEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.listen = v;
			info!("relay config: listen overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.client_token = Some(v);
			info!("relay config: client token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_DEFAULT_TENANT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.default_tenant = Some(v);
			info!("relay config: default_tenant overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_ONLINE_USERS")
		&& let Ok(cap) = v.trim().parse::<u64>()
	{
		cfg.max_online_users = cap;
		info!(cap, "relay config: max_online_users overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database_url = Some(v);
			info!("relay config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("relay config: metrics_bind overridden by env");
		}
	}
}
