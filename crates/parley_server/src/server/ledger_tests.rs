use parley_domain::{TenantName, UserId};

use crate::server::ledger::Ledger;
use crate::server::session::SessionStore;

fn tenant(name: &str) -> TenantName {
	TenantName::new(name).expect("tenant name")
}

#[tokio::test]
async fn offline_records_accumulate_and_clear_exactly() {
	let ledger = Ledger::in_memory();
	let alpha = tenant("alpha");

	ledger.insert_offline(&alpha, UserId::new(1)).await.expect("insert");
	ledger.insert_offline(&alpha, UserId::new(2)).await.expect("insert");
	ledger.insert_offline(&alpha, UserId::new(2)).await.expect("insert");
	ledger.insert_offline(&tenant("beta"), UserId::new(9)).await.expect("insert");

	// Distinct per tenant.
	assert_eq!(ledger.offline_users(&alpha).await.expect("read"), vec![UserId::new(1), UserId::new(2)]);

	// Clearing only user 1 keeps user 2 and the other tenant untouched.
	ledger.clear_offline(&alpha, &[UserId::new(1)]).await.expect("clear");
	assert_eq!(ledger.offline_users(&alpha).await.expect("read"), vec![UserId::new(2)]);
	assert_eq!(ledger.offline_users(&tenant("beta")).await.expect("read"), vec![UserId::new(9)]);

	// Clearing with an empty list is a no-op.
	ledger.clear_offline(&alpha, &[]).await.expect("clear");
	assert_eq!(ledger.offline_users(&alpha).await.expect("read"), vec![UserId::new(2)]);
}

#[tokio::test]
async fn send_failures_clear_by_gid() {
	let ledger = Ledger::in_memory();
	let alpha = tenant("alpha");

	ledger.insert_send_fail(&alpha, UserId::new(1), "g-1").await.expect("insert");
	ledger.insert_send_fail(&alpha, UserId::new(1), "g-2").await.expect("insert");

	let pending = ledger.send_failures(&alpha).await.expect("read");
	assert_eq!(pending.len(), 2);

	ledger.clear_send_failures(&alpha, &["g-1".to_string()]).await.expect("clear");
	let pending = ledger.send_failures(&alpha).await.expect("read");
	assert_eq!(pending.len(), 1);
	assert_eq!(pending[0].gid, "g-2");
}

#[tokio::test]
async fn mark_login_removes_only_that_user() {
	let ledger = Ledger::in_memory();
	let alpha = tenant("alpha");

	ledger.insert_offline(&alpha, UserId::new(1)).await.expect("insert");
	ledger.insert_offline(&alpha, UserId::new(2)).await.expect("insert");

	ledger.mark_login(&alpha, UserId::new(1)).await.expect("mark");
	assert_eq!(ledger.offline_users(&alpha).await.expect("read"), vec![UserId::new(2)]);

	// Idempotent for a user with no records.
	ledger.mark_login(&alpha, UserId::new(1)).await.expect("mark");
	assert_eq!(ledger.offline_users(&alpha).await.expect("read"), vec![UserId::new(2)]);
}

#[tokio::test]
async fn sqlite_backend_round_trips() {
	let ledger = Ledger::connect("sqlite::memory:").await.expect("connect");
	let alpha = tenant("alpha");

	ledger.insert_offline(&alpha, UserId::new(5)).await.expect("insert");
	ledger.insert_send_fail(&alpha, UserId::new(5), "g-9").await.expect("insert");

	assert_eq!(ledger.offline_users(&alpha).await.expect("read"), vec![UserId::new(5)]);
	assert_eq!(ledger.send_failures(&alpha).await.expect("read")[0].gid, "g-9");

	ledger.clear_offline(&alpha, &[UserId::new(5)]).await.expect("clear");
	ledger.clear_send_failures(&alpha, &["g-9".to_string()]).await.expect("clear");
	assert!(ledger.offline_users(&alpha).await.expect("read").is_empty());
	assert!(ledger.send_failures(&alpha).await.expect("read").is_empty());
}

#[tokio::test]
async fn sessions_replace_on_relogin_and_delete_on_logout() {
	let sessions = SessionStore::in_memory();
	let alpha = tenant("alpha");

	let first = sessions.create(&alpha, UserId::new(7)).await.expect("create");
	let second = sessions.create(&alpha, UserId::new(7)).await.expect("create");
	assert_ne!(first, second);
	assert_eq!(sessions.get(&alpha, UserId::new(7)).await.expect("get"), Some(second));

	sessions.delete(&alpha, UserId::new(7)).await.expect("delete");
	assert_eq!(sessions.get(&alpha, UserId::new(7)).await.expect("get"), None);
}

#[tokio::test]
async fn sqlite_sessions_round_trip() {
	let sessions = SessionStore::connect("sqlite::memory:").await.expect("connect");
	let alpha = tenant("alpha");

	let sid = sessions.create(&alpha, UserId::new(3)).await.expect("create");
	assert_eq!(sessions.get(&alpha, UserId::new(3)).await.expect("get"), Some(sid));

	sessions.delete(&alpha, UserId::new(3)).await.expect("delete");
	assert_eq!(sessions.get(&alpha, UserId::new(3)).await.expect("get"), None);
}
