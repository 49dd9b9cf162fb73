//! wireview: the interception core of a host-local traffic inspector.
//!
//! The OS integration claims outbound flows and hands them to
//! [`proxy::FlowRouter`]; everything after that lives here: TLS
//! termination with minted per-host certificates, HTTP/1.1 capture,
//! DNS-over-HTTPS diversion, and the in-memory capture store the consumer
//! UI reads deltas from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

pub mod ca;
pub mod capture;
pub mod dns;
pub mod http;
pub mod proxy;
pub mod telemetry;
#[cfg(test)]
mod testutil;
pub mod tls;
pub mod transport;

use ca::{CertAuthority, CertMinter};
use capture::CaptureStore;
use dns::doh::{DohClient, DohProvider};
use proxy::{FlowRouter, ResolvingDialer, Timeouts};

/// User-facing configuration surface. Everything is optional; missing
/// fields fall back to the fixed defaults in [`Config`].
#[derive(serde::Deserialize, Default, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Root CA certificate (PEM). Without a CA the interceptor still runs;
	/// port-443 flows degrade to opaque passthrough.
	ca_cert_path: Option<PathBuf>,
	/// Root CA private key (PEM, RSA).
	ca_key_path: Option<PathBuf>,

	doh_provider: Option<DohProvider>,

	connect_timeout_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
	max_lifetime_secs: Option<u64>,

	/// Log filter in `tracing` EnvFilter syntax.
	logging: Option<String>,
}

impl RawConfig {
	pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
		serde_yaml::from_str(contents).context("failed to parse configuration")
	}
}

#[derive(Clone, Debug)]
pub struct Config {
	pub ca_cert_path: Option<PathBuf>,
	pub ca_key_path: Option<PathBuf>,
	pub doh_provider: DohProvider,
	pub timeouts: Timeouts,
	pub logging: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Self::resolve(RawConfig::default())
	}
}

impl Config {
	pub fn resolve(raw: RawConfig) -> Self {
		let defaults = Timeouts::default();
		Self {
			ca_cert_path: raw.ca_cert_path,
			ca_key_path: raw.ca_key_path,
			doh_provider: raw.doh_provider.unwrap_or_default(),
			timeouts: Timeouts {
				connect: raw
					.connect_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.connect),
				idle: raw
					.idle_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.idle),
				max_lifetime: raw
					.max_lifetime_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.max_lifetime),
			},
			logging: raw.logging,
		}
	}
}

/// The assembled interception core: one capture store, one router. The
/// integrating extension drives it by feeding claimed flows to the router
/// and serving consumer fetches from the store.
pub struct Inspector {
	pub store: Arc<CaptureStore>,
	pub router: Arc<FlowRouter>,
}

impl Inspector {
	pub fn new(config: &Config) -> anyhow::Result<Self> {
		let ca = load_ca(config)?;
		let store = Arc::new(CaptureStore::new());
		let minter = ca.map(|ca| Arc::new(CertMinter::new(Arc::new(ca))));
		let dns = Arc::new(DohClient::new(config.doh_provider)?);
		let dialer = Arc::new(ResolvingDialer::new());
		let router = Arc::new(FlowRouter::new(
			store.clone(),
			minter,
			dns,
			dialer,
			config.timeouts,
		));
		Ok(Self { store, router })
	}
}

fn load_ca(config: &Config) -> anyhow::Result<Option<CertAuthority>> {
	let (Some(cert_path), Some(key_path)) = (&config.ca_cert_path, &config.ca_key_path) else {
		info!("no CA configured, https interception disabled");
		return Ok(None);
	};
	let cert = std::fs::read_to_string(cert_path)
		.with_context(|| format!("reading {}", cert_path.display()))?;
	let key =
		std::fs::read_to_string(key_path).with_context(|| format!("reading {}", key_path.display()))?;
	let ca = CertAuthority::from_pem(&cert, &key)?;
	info!("loaded interception CA");
	Ok(Some(ca))
}
