#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Decrypted wire message.
///
/// The protocol is deliberately semi-structured: `module` + `method` select
/// dispatch, the remaining fields vary per method. Unknown keys are kept in
/// `extra` so a message survives the token swap loss-free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub module: String,
	pub method: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lang: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<String>,

	#[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<i64>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sid: Option<String>,

	#[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,

	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Closed dispatch table keyed by `module + "." + method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
	Login,
	Typing,
	Logout,
	/// Anything else is relayed to the tenant backend verbatim.
	Relay,
}

impl Envelope {
	pub fn new(module: impl Into<String>, method: impl Into<String>) -> Self {
		Self {
			module: module.into(),
			method: method.into(),
			lang: None,
			params: None,
			data: None,
			result: None,
			user_id: None,
			sid: None,
			version: None,
			extra: Map::new(),
		}
	}

	pub fn dispatch(&self) -> Dispatch {
		match format!("{}.{}", self.module, self.method).as_str() {
			"chat.login" => Dispatch::Login,
			"chat.typing" => Dispatch::Typing,
			"chat.logout" => Dispatch::Logout,
			_ => Dispatch::Relay,
		}
	}

	pub fn is_success(&self) -> bool {
		self.result.as_deref() == Some("success")
	}

	/// Positional parameter, when `params` is an array.
	pub fn param(&self, index: usize) -> Option<&Value> {
		self.params.as_ref()?.as_array()?.get(index)
	}

	pub fn param_str(&self, index: usize) -> Option<&str> {
		self.param(index)?.as_str()
	}

	/// Remove and return the per-reply recipient list a backend attaches as
	/// a top-level `users` key. Absent or empty means "broadcast".
	pub fn take_send_users(&mut self) -> Vec<i64> {
		let Some(value) = self.extra.remove("users") else {
			return Vec::new();
		};

		match value {
			Value::Array(items) => items.iter().filter_map(Value::as_i64).collect(),
			_ => Vec::new(),
		}
	}

	/// User id assigned by a successful backend login reply (`data.id`).
	pub fn login_user_id(&self) -> Option<i64> {
		if self.module != "chat" || self.method != "login" || !self.is_success() {
			return None;
		}
		self.data.as_ref()?.get("id")?.as_i64()
	}

	/// Notice sent to a connection superseded by a newer login.
	pub fn kicked() -> Self {
		let mut env = Envelope::new("chat", "kickoff");
		env.extra
			.insert("message".to_string(), json!("This account signed in from another client."));
		env
	}

	/// Notice sent when the tenant's online-user cap is reached.
	pub fn blocked() -> Self {
		let mut env = Envelope::new("chat", "blockLogin");
		env.extra
			.insert("message".to_string(), json!("Online users exceed the configured limit."));
		env
	}

	/// Request-scoped error reported back to the requesting client.
	pub fn error(code: &str, message: &str) -> Self {
		let mut env = Envelope::new("chat", "error");
		env.extra.insert("code".to_string(), json!(code));
		env.extra.insert("message".to_string(), json!(message));
		env
	}

	/// Session identifier issued after login, used by file endpoints.
	pub fn session(lang: Option<&str>, sid: &str) -> Self {
		let mut env = Envelope::new("chat", "sessionID");
		env.lang = lang.map(str::to_string);
		env.sid = Some(sid.to_string());
		env
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dispatch_is_keyed_on_module_and_method() {
		assert_eq!(Envelope::new("chat", "login").dispatch(), Dispatch::Login);
		assert_eq!(Envelope::new("chat", "typing").dispatch(), Dispatch::Typing);
		assert_eq!(Envelope::new("chat", "logout").dispatch(), Dispatch::Logout);
		assert_eq!(Envelope::new("chat", "message").dispatch(), Dispatch::Relay);
		assert_eq!(Envelope::new("im", "login").dispatch(), Dispatch::Relay);
	}

	#[test]
	fn unknown_keys_survive_a_roundtrip() {
		let raw = r#"{"module":"chat","method":"message","userID":9,"gid":"abc","users":[1,2]}"#;
		let mut env: Envelope = serde_json::from_str(raw).expect("parse");

		assert_eq!(env.user_id, Some(9));
		assert_eq!(env.extra.get("gid"), Some(&json!("abc")));

		assert_eq!(env.take_send_users(), vec![1, 2]);
		assert!(env.extra.get("users").is_none());

		let back = serde_json::to_value(&env).expect("serialize");
		assert_eq!(back.get("gid"), Some(&json!("abc")));
		assert!(back.get("users").is_none());
	}

	#[test]
	fn take_send_users_handles_absent_and_malformed() {
		let mut env = Envelope::new("chat", "message");
		assert!(env.take_send_users().is_empty());

		env.extra.insert("users".to_string(), json!("not-a-list"));
		assert!(env.take_send_users().is_empty());
	}

	#[test]
	fn login_user_id_requires_success() {
		let mut env = Envelope::new("chat", "login");
		env.data = Some(json!({"id": 42, "account": "demo"}));
		assert_eq!(env.login_user_id(), None);

		env.result = Some("success".to_string());
		assert_eq!(env.login_user_id(), Some(42));

		env.method = "logout".to_string();
		assert_eq!(env.login_user_id(), None);
	}

	#[test]
	fn positional_params() {
		let mut env = Envelope::new("chat", "login");
		env.params = Some(json!(["main", "demo", "secret", "online"]));
		assert_eq!(env.param_str(0), Some("main"));
		assert_eq!(env.param_str(3), Some("online"));
		assert_eq!(env.param_str(4), None);
	}
}
