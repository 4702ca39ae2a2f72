#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use parley_domain::TenantName;
use parley_protocol::{EnvelopeCodec, TokenKey};

use crate::server::error::RelayError;

/// One configured tenant backend: name, HTTP address, and its token domain.
#[derive(Debug, Clone)]
pub struct TenantDescriptor {
	pub name: TenantName,
	pub addr: String,
	pub token: TokenKey,
}

/// A tenant descriptor plus its ready-made envelope codec.
#[derive(Debug)]
pub struct TenantContext {
	pub descriptor: TenantDescriptor,
	pub codec: EnvelopeCodec,
}

impl TenantContext {
	fn new(descriptor: TenantDescriptor) -> Self {
		let codec = EnvelopeCodec::new(descriptor.token.clone());
		Self { descriptor, codec }
	}

	pub fn name(&self) -> &TenantName {
		&self.descriptor.name
	}
}

/// Immutable tenant set, fixed at startup.
#[derive(Debug)]
pub struct Tenants {
	by_name: BTreeMap<TenantName, TenantContext>,
	default_name: TenantName,
}

impl Tenants {
	pub fn new(descriptors: Vec<TenantDescriptor>, default_name: TenantName) -> anyhow::Result<Self> {
		let mut by_name = BTreeMap::new();
		for descriptor in descriptors {
			by_name.insert(descriptor.name.clone(), TenantContext::new(descriptor));
		}

		if by_name.is_empty() {
			return Err(anyhow!("no tenants configured"));
		}
		if !by_name.contains_key(&default_name) {
			return Err(anyhow!("default tenant {default_name} is not configured"));
		}

		Ok(Self { by_name, default_name })
	}

	/// Resolve an explicit tenant name, or fall back to the default.
	pub fn resolve(&self, name: Option<&str>) -> Result<&TenantContext, RelayError> {
		match name.filter(|n| !n.trim().is_empty()) {
			None => Ok(&self.by_name[&self.default_name]),
			Some(name) => {
				let key = TenantName::new(name).map_err(|_| RelayError::Routing(name.to_string()))?;
				self.by_name.get(&key).ok_or_else(|| RelayError::Routing(name.to_string()))
			}
		}
	}

	pub fn get(&self, name: &TenantName) -> Option<&TenantContext> {
		self.by_name.get(name)
	}

	pub fn names(&self) -> impl Iterator<Item = &TenantName> {
		self.by_name.keys()
	}

	pub fn iter(&self) -> impl Iterator<Item = &TenantContext> {
		self.by_name.values()
	}
}

/// Client languages observed at login, consumed by the reconciliation loop.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
	inner: Arc<Mutex<BTreeSet<String>>>,
}

impl LanguageRegistry {
	pub fn observe(&self, lang: &str) {
		let lang = lang.trim();
		if lang.is_empty() {
			return;
		}
		self.inner.lock().expect("language registry lock").insert(lang.to_string());
	}

	pub fn snapshot(&self) -> Vec<String> {
		self.inner.lock().expect("language registry lock").iter().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn descriptor(name: &str) -> TenantDescriptor {
		TenantDescriptor {
			name: TenantName::new(name).expect("name"),
			addr: format!("http://{name}.example"),
			token: TokenKey::derive(name),
		}
	}

	#[test]
	fn resolve_explicit_and_default() {
		let tenants = Tenants::new(
			vec![descriptor("alpha"), descriptor("beta")],
			TenantName::new("alpha").expect("name"),
		)
		.expect("tenants");

		assert_eq!(tenants.resolve(None).expect("default").name().as_str(), "alpha");
		assert_eq!(tenants.resolve(Some("beta")).expect("beta").name().as_str(), "beta");
		assert_eq!(tenants.resolve(Some("")).expect("blank falls back").name().as_str(), "alpha");
		assert!(matches!(tenants.resolve(Some("gamma")), Err(RelayError::Routing(_))));
	}

	#[test]
	fn default_must_be_configured() {
		let err = Tenants::new(vec![descriptor("alpha")], TenantName::new("beta").expect("name"));
		assert!(err.is_err());
	}

	#[test]
	fn language_registry_deduplicates() {
		let languages = LanguageRegistry::default();
		languages.observe("en");
		languages.observe("zh-cn");
		languages.observe("en");
		languages.observe("  ");

		assert_eq!(languages.snapshot(), vec!["en".to_string(), "zh-cn".to_string()]);
	}
}
