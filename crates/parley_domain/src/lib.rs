#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client platforms a user can be registered on. A user may hold one live
/// connection per platform at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Desktop,
	Mobile,
}

impl Platform {
	/// All platforms, in registry iteration order.
	pub const ALL: [Platform; 2] = [Platform::Desktop, Platform::Mobile];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Desktop => "desktop",
			Platform::Mobile => "mobile",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"desktop" => Ok(Platform::Desktop),
			"mobile" => Ok(Platform::Mobile),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Name of a configured tenant backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantName(String);

impl TenantName {
	/// Create a non-empty `TenantName`.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for TenantName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for TenantName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TenantName::new(s.to_string())
	}
}

/// Backend-assigned user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
	pub const fn new(id: i64) -> Self {
		Self(id)
	}

	pub const fn as_i64(self) -> i64 {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<i64> for UserId {
	fn from(id: i64) -> Self {
		Self(id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn platform_parse_and_display() {
		assert_eq!("desktop".parse::<Platform>(), Ok(Platform::Desktop));
		assert_eq!(" Mobile ".parse::<Platform>(), Ok(Platform::Mobile));
		assert_eq!(Platform::Desktop.to_string(), "desktop");

		assert_eq!("".parse::<Platform>(), Err(ParseIdError::Empty));
		assert_eq!(
			"web".parse::<Platform>(),
			Err(ParseIdError::UnknownPlatform("web".to_string()))
		);
	}

	#[test]
	fn tenant_name_rejects_empty() {
		assert_eq!(TenantName::new("  "), Err(ParseIdError::Empty));
		assert_eq!(TenantName::new("main").unwrap().as_str(), "main");
	}

	#[test]
	fn user_id_roundtrip() {
		let id = UserId::new(7);
		assert_eq!(id.as_i64(), 7);
		assert_eq!(UserId::from(7), id);
		assert_eq!(id.to_string(), "7");
	}
}
