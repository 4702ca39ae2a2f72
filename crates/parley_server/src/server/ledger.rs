#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context as _;
use parley_domain::{TenantName, UserId};
use sqlx::Row as _;
use tokio::sync::Mutex;

/// One failed outbound chat message, identified by its group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailRecord {
	pub user_id: UserId,
	pub gid: String,
}

/// Offline-delivery / send-failure ledger.
///
/// Records accumulate per tenant and are cleared only after the
/// reconciliation loop reports them to the backend successfully
/// (clear-after-success, never clear-before-send).
#[derive(Clone)]
pub struct Ledger {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Memory(Arc<Mutex<MemoryStore>>),
	Sqlite(sqlx::SqlitePool),
}

#[derive(Debug, Default)]
struct MemoryStore {
	offline: Vec<(TenantName, UserId)>,
	send_fail: Vec<(TenantName, SendFailRecord)>,
}

/// An in-memory sqlite database lives and dies with its connection, so it
/// must be pinned to a single pooled connection.
pub(crate) async fn open_pool(database_url: &str) -> anyhow::Result<sqlx::SqlitePool> {
	let options = if database_url.contains(":memory:") {
		sqlx::sqlite::SqlitePoolOptions::new()
			.max_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
	} else {
		sqlx::sqlite::SqlitePoolOptions::new().max_connections(5)
	};
	options.connect(database_url).await.context("connect sqlite")
}

impl Ledger {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = open_pool(database_url).await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS offline_records (\
			 tenant TEXT NOT NULL, user_id INTEGER NOT NULL, \
			 created_at INTEGER NOT NULL DEFAULT (strftime('%s','now')))",
		)
		.execute(&pool)
		.await
		.context("create offline_records")?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS send_fail_records (\
			 tenant TEXT NOT NULL, user_id INTEGER NOT NULL, gid TEXT NOT NULL, \
			 created_at INTEGER NOT NULL DEFAULT (strftime('%s','now')))",
		)
		.execute(&pool)
		.await
		.context("create send_fail_records")?;

		Ok(Self {
			backend: Backend::Sqlite(pool),
		})
	}

	pub fn in_memory() -> Self {
		Self {
			backend: Backend::Memory(Arc::new(Mutex::new(MemoryStore::default()))),
		}
	}

	/// Record that a user went offline with deliveries possibly pending.
	pub async fn insert_offline(&self, tenant: &TenantName, user: UserId) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Memory(store) => {
				store.lock().await.offline.push((tenant.clone(), user));
				Ok(())
			}
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO offline_records (tenant, user_id) VALUES (?, ?)")
					.bind(tenant.as_str())
					.bind(user.as_i64())
					.execute(pool)
					.await
					.context("insert offline_records")?;
				Ok(())
			}
		}
	}

	/// Record a chat message whose socket write failed, for later retry.
	pub async fn insert_send_fail(&self, tenant: &TenantName, user: UserId, gid: &str) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Memory(store) => {
				store.lock().await.send_fail.push((
					tenant.clone(),
					SendFailRecord {
						user_id: user,
						gid: gid.to_string(),
					},
				));
				Ok(())
			}
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO send_fail_records (tenant, user_id, gid) VALUES (?, ?, ?)")
					.bind(tenant.as_str())
					.bind(user.as_i64())
					.bind(gid)
					.execute(pool)
					.await
					.context("insert send_fail_records")?;
				Ok(())
			}
		}
	}

	/// A fresh login supersedes any offline records accumulated for the user.
	pub async fn mark_login(&self, tenant: &TenantName, user: UserId) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Memory(store) => {
				store.lock().await.offline.retain(|(t, u)| !(t == tenant && *u == user));
				Ok(())
			}
			Backend::Sqlite(pool) => {
				sqlx::query("DELETE FROM offline_records WHERE tenant = ? AND user_id = ?")
					.bind(tenant.as_str())
					.bind(user.as_i64())
					.execute(pool)
					.await
					.context("delete offline_records on login")?;
				Ok(())
			}
		}
	}

	/// Distinct users with pending offline records for a tenant.
	pub async fn offline_users(&self, tenant: &TenantName) -> anyhow::Result<Vec<UserId>> {
		match &self.backend {
			Backend::Memory(store) => {
				let store = store.lock().await;
				let users: BTreeSet<UserId> = store
					.offline
					.iter()
					.filter(|(t, _)| t == tenant)
					.map(|(_, u)| *u)
					.collect();
				Ok(users.into_iter().collect())
			}
			Backend::Sqlite(pool) => {
				let rows = sqlx::query("SELECT DISTINCT user_id FROM offline_records WHERE tenant = ? ORDER BY user_id")
					.bind(tenant.as_str())
					.fetch_all(pool)
					.await
					.context("select offline_records")?;
				Ok(rows.iter().map(|row| UserId::new(row.get::<i64, _>(0))).collect())
			}
		}
	}

	/// Pending send failures for a tenant.
	pub async fn send_failures(&self, tenant: &TenantName) -> anyhow::Result<Vec<SendFailRecord>> {
		match &self.backend {
			Backend::Memory(store) => {
				let store = store.lock().await;
				Ok(store
					.send_fail
					.iter()
					.filter(|(t, _)| t == tenant)
					.map(|(_, record)| record.clone())
					.collect())
			}
			Backend::Sqlite(pool) => {
				let rows = sqlx::query("SELECT user_id, gid FROM send_fail_records WHERE tenant = ? ORDER BY created_at")
					.bind(tenant.as_str())
					.fetch_all(pool)
					.await
					.context("select send_fail_records")?;
				Ok(rows
					.iter()
					.map(|row| SendFailRecord {
						user_id: UserId::new(row.get::<i64, _>(0)),
						gid: row.get::<String, _>(1),
					})
					.collect())
			}
		}
	}

	/// Remove exactly the offline records that were reported successfully.
	pub async fn clear_offline(&self, tenant: &TenantName, users: &[UserId]) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Memory(store) => {
				let mut store = store.lock().await;
				store.offline.retain(|(t, u)| !(t == tenant && users.contains(u)));
				Ok(())
			}
			Backend::Sqlite(pool) => {
				for user in users {
					sqlx::query("DELETE FROM offline_records WHERE tenant = ? AND user_id = ?")
						.bind(tenant.as_str())
						.bind(user.as_i64())
						.execute(pool)
						.await
						.context("delete offline_records")?;
				}
				Ok(())
			}
		}
	}

	/// Remove exactly the send-failure records that were reported successfully.
	pub async fn clear_send_failures(&self, tenant: &TenantName, gids: &[String]) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Memory(store) => {
				let mut store = store.lock().await;
				store.send_fail.retain(|(t, record)| !(t == tenant && gids.contains(&record.gid)));
				Ok(())
			}
			Backend::Sqlite(pool) => {
				for gid in gids {
					sqlx::query("DELETE FROM send_fail_records WHERE tenant = ? AND gid = ?")
						.bind(tenant.as_str())
						.bind(gid)
						.execute(pool)
						.await
						.context("delete send_fail_records")?;
				}
				Ok(())
			}
		}
	}
}
