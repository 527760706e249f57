//! Configuration file support for kube-reclaim.
//!
//! An optional TOML file tunes the escalation timings and the proxy tunnel.
//! Every key is optional; missing keys keep their defaults and command-line
//! flags override whatever the file sets.

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::reclaim::{engine::EscalationSettings, proxy::ProxySettings};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "KUBE_RECLAIM_CONFIG";

/// Proxy binary used when none is configured.
pub const DEFAULT_PROXY_BINARY: &str = "oc";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {}", path.display())]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {}", path.display())]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("proxy port range {start}..={end} is empty")]
	EmptyPortRange { start: u16, end: u16 },

	#[error("proxy.health_attempts must be at least 1")]
	NoHealthAttempts,

	#[error("proxy.binary must not be empty")]
	EmptyBinary,
}

/// Root of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReclaimConfig {
	#[serde(default)]
	pub escalation: EscalationConfig,
	#[serde(default)]
	pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
	/// Seconds to wait for a normal or forced delete call to return.
	pub delete_timeout_secs: Option<u64>,
	/// Pause between a mutating call and its verification read.
	pub settle_millis: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
	/// `oc` or `kubectl`, or a path to either.
	pub binary: Option<String>,
	pub port_range_start: Option<u16>,
	pub port_range_end: Option<u16>,
	pub health_interval_millis: Option<u64>,
	pub health_attempts: Option<u32>,
	pub shutdown_grace_millis: Option<u64>,
}

impl ReclaimConfig {
	/// Load from `path`, or return defaults when no path is given.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let Some(path) = path else {
			return Ok(Self::default());
		};
		let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})?;
		tracing::debug!(path = %path.display(), "loaded config file");
		config.validate()?;
		Ok(config)
	}

	pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(content)
	}

	/// Reject settings the proxy manager cannot work with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let proxy = self.proxy_settings();
		if proxy.ports.is_empty() {
			return Err(ConfigError::EmptyPortRange {
				start: *proxy.ports.start(),
				end: *proxy.ports.end(),
			});
		}
		if proxy.health_attempts == 0 {
			return Err(ConfigError::NoHealthAttempts);
		}
		if self.proxy.binary.as_deref().is_some_and(str::is_empty) {
			return Err(ConfigError::EmptyBinary);
		}
		Ok(())
	}

	/// Escalation timings, with `delete_timeout` taking precedence over the file.
	pub fn escalation_settings(&self, delete_timeout: Option<Duration>) -> EscalationSettings {
		let defaults = EscalationSettings::default();
		EscalationSettings {
			delete_timeout: delete_timeout
				.or_else(|| self.escalation.delete_timeout_secs.map(Duration::from_secs))
				.unwrap_or(defaults.delete_timeout),
			settle: self
				.escalation
				.settle_millis
				.map_or(defaults.settle, Duration::from_millis),
		}
	}

	pub fn proxy_settings(&self) -> ProxySettings {
		let defaults = ProxySettings::default();
		let proxy = &self.proxy;
		let millis = |value: Option<u64>, default| value.map_or(default, Duration::from_millis);
		ProxySettings {
			ports: proxy.port_range_start.unwrap_or(*defaults.ports.start())
				..=proxy.port_range_end.unwrap_or(*defaults.ports.end()),
			health_interval: millis(proxy.health_interval_millis, defaults.health_interval),
			health_attempts: proxy.health_attempts.unwrap_or(defaults.health_attempts),
			shutdown_grace: millis(proxy.shutdown_grace_millis, defaults.shutdown_grace),
		}
	}

	pub fn proxy_binary(&self) -> &str {
		self.proxy.binary.as_deref().unwrap_or(DEFAULT_PROXY_BINARY)
	}
}
