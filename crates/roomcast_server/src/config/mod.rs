#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::engine::EngineSettings;
use crate::server::flood::WindowLimit;
use crate::server::moderation::ModerationSettings;
use crate::server::relay::RelayNode;
use crate::server::session_cache::SessionSettings;

/// Default config path: `~/.roomcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomcast").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<RoomcastConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = RoomcastConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

/// A string that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

#[derive(Debug, Clone)]
pub struct RoomcastConfig {
	pub server: ServerSettings,
	pub session: SessionSettings,
	pub flood: WindowLimit,
	pub reports: ReportSettings,
	pub moderation: ModerationSettings,
	pub relay_nodes: Vec<RelayNode>,
	pub persistence: PersistenceSettings,
	pub notify_concurrency: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Secret for verifying account tokens presented on join.
	pub auth_hmac_secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
	pub limit: WindowLimit,
	pub evidence_dir: PathBuf,
}

impl Default for ReportSettings {
	fn default() -> Self {
		Self {
			limit: WindowLimit::reports_default(),
			evidence_dir: PathBuf::from("evidence"),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (`sqlite:` or `postgres:`).
	pub database_url: Option<String>,
}

impl Default for RoomcastConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl RoomcastConfig {
	pub fn engine_settings(&self) -> EngineSettings {
		EngineSettings {
			session: self.session.clone(),
			flood: self.flood,
			reports: self.reports.limit,
			moderation: self.moderation.clone(),
			relay_nodes: self.relay_nodes.clone(),
			notify_concurrency: self.notify_concurrency,
			..EngineSettings::default()
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	flood: FileWindowSettings,

	#[serde(default)]
	reports: FileReportSettings,

	#[serde(default)]
	moderation: FileModerationSettings,

	#[serde(default)]
	relay: Vec<RelayNode>,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	notify: FileNotifySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	connected_ttl_secs: Option<u64>,
	disconnected_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWindowSettings {
	limit: Option<u32>,
	window_secs: Option<u64>,
	cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReportSettings {
	#[serde(flatten)]
	window: FileWindowSettings,
	evidence_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileModerationSettings {
	default_closure_hours: Option<u32>,
	default_site_ban_hours: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotifySettings {
	concurrency: Option<usize>,
}

impl FileWindowSettings {
	fn resolve(&self, defaults: WindowLimit) -> WindowLimit {
		WindowLimit {
			limit: self.limit.filter(|v| *v > 0).unwrap_or(defaults.limit),
			window: self
				.window_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.window),
			cooldown: self
				.cooldown_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.cooldown),
		}
	}
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl RoomcastConfig {
	fn from_file(file: FileConfig) -> Self {
		let session_defaults = SessionSettings::default();
		let moderation_defaults = ModerationSettings::default();
		let report_defaults = ReportSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
			},
			session: SessionSettings {
				connected_ttl: file
					.session
					.connected_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(session_defaults.connected_ttl),
				disconnected_ttl: file
					.session
					.disconnected_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(session_defaults.disconnected_ttl),
			},
			flood: file.flood.resolve(WindowLimit::flood_default()),
			reports: ReportSettings {
				limit: file.reports.window.resolve(report_defaults.limit),
				evidence_dir: non_blank(file.reports.evidence_dir)
					.map(PathBuf::from)
					.unwrap_or(report_defaults.evidence_dir),
			},
			moderation: ModerationSettings {
				default_closure_hours: file
					.moderation
					.default_closure_hours
					.filter(|v| *v > 0)
					.unwrap_or(moderation_defaults.default_closure_hours),
				default_site_ban_hours: file
					.moderation
					.default_site_ban_hours
					.filter(|v| *v > 0)
					.unwrap_or(moderation_defaults.default_site_ban_hours),
			},
			relay_nodes: file
				.relay
				.into_iter()
				.filter(|n| !n.id.trim().is_empty() && !n.url.trim().is_empty())
				.collect(),
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
			},
			notify_concurrency: file.notify.concurrency.filter(|v| *v > 0).unwrap_or(4),
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

/// `id=url,id=url`; malformed entries are skipped.
fn parse_relay_nodes(v: &str) -> Vec<RelayNode> {
	v.split(',')
		.filter_map(|entry| {
			let (id, url) = entry.split_once('=')?;
			let (id, url) = (id.trim(), url.trim());
			(!id.is_empty() && !url.is_empty()).then(|| RelayNode {
				id: id.to_string(),
				url: url.to_string(),
			})
		})
		.collect()
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

fn apply_env_overrides(cfg: &mut RoomcastConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("ROOMCAST_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = var("ROOMCAST_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = var("ROOMCAST_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("ROOMCAST_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("ROOMCAST_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(limit) = var("ROOMCAST_FLOOD_LIMIT").and_then(|v| v.parse::<u32>().ok()) {
		cfg.flood.limit = limit;
		info!(limit, "flood config: limit overridden by env");
	}

	if let Some(secs) = var("ROOMCAST_FLOOD_WINDOW_SECS").and_then(|v| v.parse::<u64>().ok()) {
		cfg.flood.window = Duration::from_secs(secs);
		info!(secs, "flood config: window overridden by env");
	}

	if let Some(secs) = var("ROOMCAST_FLOOD_COOLDOWN_SECS").and_then(|v| v.parse::<u64>().ok()) {
		cfg.flood.cooldown = Duration::from_secs(secs);
		info!(secs, "flood config: cooldown overridden by env");
	}

	if let Some(limit) = var("ROOMCAST_REPORT_LIMIT").and_then(|v| v.parse::<u32>().ok()) {
		cfg.reports.limit.limit = limit;
		info!(limit, "reports config: limit overridden by env");
	}

	if let Some(v) = var("ROOMCAST_EVIDENCE_DIR") {
		cfg.reports.evidence_dir = PathBuf::from(v);
		info!("reports config: evidence_dir overridden by env");
	}

	if let Some(enabled) = var("ROOMCAST_PERSISTENCE_ENABLED").and_then(|v| parse_env_bool(&v)) {
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("ROOMCAST_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = var("ROOMCAST_RELAY_NODES") {
		cfg.relay_nodes = parse_relay_nodes(&v);
		info!(nodes = cfg.relay_nodes.len(), "relay config: nodes overridden by env");
	}

	if let Some(n) = var("ROOMCAST_NOTIFY_CONCURRENCY").and_then(|v| v.parse::<usize>().ok()) {
		cfg.notify_concurrency = n.max(1);
		info!(concurrency = cfg.notify_concurrency, "notify config: concurrency overridden by env");
	}

	if cfg.flood.limit == 0 {
		warn!("flood config: limit 0 rejects every action; using the default");
		cfg.flood.limit = WindowLimit::flood_default().limit;
	}

	if cfg.relay_nodes.is_empty() {
		warn!("relay config: no relay nodes configured; rooms will have no media relay");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> RoomcastConfig {
		RoomcastConfig::from_file(toml::from_str(toml_src).unwrap())
	}

	#[test]
	fn empty_file_gives_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.flood, WindowLimit::flood_default());
		assert_eq!(cfg.reports.limit, WindowLimit::reports_default());
		assert_eq!(cfg.session.connected_ttl, Duration::from_secs(120));
		assert_eq!(cfg.session.disconnected_ttl, Duration::from_secs(6 * 3600));
		assert_eq!(cfg.moderation.default_closure_hours, 24);
		assert_eq!(cfg.moderation.default_site_ban_hours, 24);
		assert_eq!(cfg.notify_concurrency, 4);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.relay_nodes.is_empty());
	}

	#[test]
	fn sections_are_read() {
		let cfg = parse(
			r#"
			[server]
			health_bind = "127.0.0.1:9000"
			auth_hmac_secret = "k"

			[flood]
			limit = 5
			window_secs = 2

			[reports]
			limit = 1
			evidence_dir = "/tmp/ev"

			[[relay]]
			id = "a"
			url = "http://a"

			[[relay]]
			id = "b"
			url = "http://b"
			"#,
		);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9000"));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(SecretString::expose), Some("k"));
		assert_eq!(cfg.flood.limit, 5);
		assert_eq!(cfg.flood.window, Duration::from_secs(2));
		assert_eq!(cfg.flood.cooldown, Duration::from_secs(60));
		assert_eq!(cfg.reports.limit.limit, 1);
		assert_eq!(cfg.reports.evidence_dir, PathBuf::from("/tmp/ev"));
		let ids: Vec<_> = cfg.relay_nodes.iter().map(|n| n.id.as_str()).collect();
		assert_eq!(ids, vec!["a", "b"]);
	}

	#[test]
	fn env_overrides_win() {
		let mut cfg = parse("[flood]\nlimit = 5\n");
		let env: HashMap<&str, &str> = HashMap::from([
			("ROOMCAST_FLOOD_LIMIT", "7"),
			("ROOMCAST_PERSISTENCE_ENABLED", "yes"),
			("ROOMCAST_DATABASE_URL", " sqlite::memory: "),
			("ROOMCAST_RELAY_NODES", "a=http://a, broken ,b=http://b"),
			("ROOMCAST_METRICS_BIND", "   "),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.flood.limit, 7);
		assert!(cfg.persistence.enabled);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!(cfg.relay_nodes.len(), 2);
		assert_eq!(cfg.server.metrics_bind, None);
	}

	#[test]
	fn secrets_are_redacted() {
		assert_eq!(format!("{:?}", SecretString::new("hunter2")), "SecretString(<redacted>)");
	}
}
