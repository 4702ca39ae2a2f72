#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use parley_domain::{TenantName, UserId};
use sqlx::Row as _;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Server-minted session ids, one per (tenant, user).
///
/// A repeat login overwrites the previous sid, so the surviving connection
/// always holds the freshest one.
#[derive(Clone)]
pub struct SessionStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Memory(Arc<Mutex<HashMap<(TenantName, i64), String>>>),
	Sqlite(sqlx::SqlitePool),
}

impl SessionStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = crate::server::ledger::open_pool(database_url).await?;

		sqlx::query(
			"CREATE TABLE IF NOT EXISTS sessions (\
			 tenant TEXT NOT NULL, user_id INTEGER NOT NULL, sid TEXT NOT NULL, \
			 PRIMARY KEY (tenant, user_id))",
		)
		.execute(&pool)
		.await
		.context("create sessions")?;

		Ok(Self {
			backend: Backend::Sqlite(pool),
		})
	}

	pub fn in_memory() -> Self {
		Self {
			backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
		}
	}

	/// Mint a fresh sid for the user, replacing any previous one.
	pub async fn create(&self, tenant: &TenantName, user: UserId) -> anyhow::Result<String> {
		let sid = Uuid::new_v4().simple().to_string();
		match &self.backend {
			Backend::Memory(store) => {
				store.lock().await.insert((tenant.clone(), user.as_i64()), sid.clone());
			}
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT OR REPLACE INTO sessions (tenant, user_id, sid) VALUES (?, ?, ?)")
					.bind(tenant.as_str())
					.bind(user.as_i64())
					.bind(&sid)
					.execute(pool)
					.await
					.context("insert session")?;
			}
		}
		Ok(sid)
	}

	#[cfg(test)]
	pub async fn get(&self, tenant: &TenantName, user: UserId) -> anyhow::Result<Option<String>> {
		match &self.backend {
			Backend::Memory(store) => Ok(store.lock().await.get(&(tenant.clone(), user.as_i64())).cloned()),
			Backend::Sqlite(pool) => {
				let row = sqlx::query("SELECT sid FROM sessions WHERE tenant = ? AND user_id = ?")
					.bind(tenant.as_str())
					.bind(user.as_i64())
					.fetch_optional(pool)
					.await
					.context("select session")?;
				Ok(row.map(|row| row.get::<String, _>(0)))
			}
		}
	}

	pub async fn delete(&self, tenant: &TenantName, user: UserId) -> anyhow::Result<()> {
		match &self.backend {
			Backend::Memory(store) => {
				store.lock().await.remove(&(tenant.clone(), user.as_i64()));
				Ok(())
			}
			Backend::Sqlite(pool) => {
				sqlx::query("DELETE FROM sessions WHERE tenant = ? AND user_id = ?")
					.bind(tenant.as_str())
					.bind(user.as_i64())
					.execute(pool)
					.await
					.context("delete session")?;
				Ok(())
			}
		}
	}
}
