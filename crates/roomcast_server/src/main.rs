#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use roomcast_domain::ConnectionId;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::engine::{Engine, EngineBackends};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::relay::HttpRelayControl;
use crate::server::reports::{FsEvidenceStore, LogNotifier};
use crate::server::store::{DocumentStore, MemoryDocuments, MemoryKv, SqlDocuments, spawn_purge_task};

const KV_PURGE_PERIOD: Duration = Duration::from_secs(60);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind address (default: 127.0.0.1:18203)\n\
\t--config  Config file (default: ~/.roomcast/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind = "127.0.0.1:18203".to_string();
	let mut config = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				bind = v.trim().trim_start_matches("quic://").to_string();
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = bind.parse::<SocketAddr>().unwrap_or_else(|e| {
		eprintln!("invalid --bind {bind:?} (expected host:port): {e}");
		usage_and_exit();
	});

	Args { bind, config }
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("roomcast_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let docs: Arc<dyn DocumentStore> = if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		Arc::new(SqlDocuments::connect(database_url).await?)
	} else {
		warn!("persistence disabled; rooms and moderation records live in memory only");
		Arc::new(MemoryDocuments::new())
	};

	let kv = Arc::new(MemoryKv::new());
	spawn_purge_task(Arc::clone(&kv), KV_PURGE_PERIOD);

	let engine = Arc::new(Engine::new(
		cfg.engine_settings(),
		EngineBackends {
			docs,
			kv,
			relay: Arc::new(HttpRelayControl::new()),
			evidence: Arc::new(FsEvidenceStore::new(cfg.reports.evidence_dir.clone())),
			notifier: Arc::new(LogNotifier),
		},
	));

	let quic_cfg = QuicServerConfig::new(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) =
		(cfg.server.tls_cert_path.as_deref(), cfg.server.tls_key_path.as_deref())
	{
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"roomcast_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	let conn_settings = ConnectionSettings {
		auth_hmac_secret: cfg.server.auth_hmac_secret.clone(),
		..ConnectionSettings::default()
	};

	health_state.mark_ready();

	while let Some(incoming) = endpoint.accept().await {
		metrics::counter!("roomcast_server_connections_total").increment(1);
		let engine = Arc::clone(&engine);
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			let conn_id = ConnectionId::generate();
			match incoming.await {
				Ok(connection) => {
					info!(conn_id = %conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id.clone(), connection, engine, conn_settings).await {
						warn!(conn_id = %conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id = %conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
