#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod store;
mod util;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, ServerContext, serve};
use crate::server::health::{HealthState, spawn_health_server};
use crate::store::RecordStore;
use crate::store::memory::MemoryRecordStore;
use crate::store::sqlite::SqliteRecordStore;

const DEFAULT_BIND: &str = "quic://127.0.0.1:18203";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: pairhelp_server [--bind quic://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: server.bind from config, else {DEFAULT_BIND})\n\
\t         Format: quic://host:port or host:port\n\
\t--config  Config file (default: ~/.pairhelp/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut bind: Option<String> = None;
	let mut config_path: Option<PathBuf> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	Args { bind, config_path }
}

/// Resolve `quic://host:port` or `host:port` to a socket address.
fn resolve_bind(endpoint: &str) -> anyhow::Result<SocketAddr> {
	let trimmed = endpoint.trim();
	let hostport = trimmed.strip_prefix("quic://").unwrap_or(trimmed);
	hostport
		.to_socket_addrs()
		.with_context(|| format!("invalid bind endpoint {endpoint:?} (expected quic://host:port)"))?
		.next()
		.ok_or_else(|| anyhow::anyhow!("bind endpoint {endpoint:?} resolved to no addresses"))
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pairhelp_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("pairhelp_server");
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

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_endpoint = args
		.bind
		.or_else(|| server_cfg.server.bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let bind_addr = resolve_bind(&bind_endpoint)?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn RecordStore> = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		info!("using sqlite record store");
		Arc::new(SqliteRecordStore::connect(database_url).await?)
	} else {
		info!("using in-memory record store");
		Arc::new(MemoryRecordStore::new())
	};

	let conn_settings = ConnectionSettings {
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		auth_hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
		..ConnectionSettings::default()
	};
	if conn_settings.auth_hmac_secret.is_none() {
		warn!("no auth_hmac_secret configured; hello tokens are not verified");
	}

	let ctx = ServerContext::new(store, server_cfg.matching.to_settings(), conn_settings);

	let health_state = HealthState::new().with_stats(Arc::new(ctx.clone()));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"pairhelp_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();

	serve(endpoint, ctx).await;

	Ok(())
}
