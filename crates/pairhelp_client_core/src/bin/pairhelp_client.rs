#![forbid(unsafe_code)]

use std::time::Duration;

use pairhelp_client_core::{ClientConfig, ClientSession};
use pairhelp_protocol::{Envelope, Msg};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_ENDPOINT: &str = "quic://127.0.0.1:18203";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: pairhelp_client --key contact [--connect quic://host:port] [--name display] [--tags a,b]\n\
\n\
Options:\n\
	--connect   Server endpoint (alias: --endpoint) (default: {DEFAULT_ENDPOINT})\n\
	--key       Contact key announced in hello (required)\n\
	--token     Bearer token (default: $PAIRHELP_CLIENT_AUTH_TOKEN)\n\
	--name      Register a profile with this display name after connecting\n\
	--tags      Comma-separated skill tags for --name\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Each stdin line is sent as one request; it must be a JSON message,\n\
	e.g. {{\"type\":\"find_helper\",\"data\":{{\"question_id\":\"q1\"}}}}.\n\
	The server validates it and answers bad ones with an error reply.\n\
	Every inbound reply and event is printed to stdout as JSON.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pairhelp_client_core=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	cfg: ClientConfig,
	display_name: Option<String>,
	skill_tags: Vec<String>,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_ENDPOINT.to_string();
	let mut key: Option<String> = None;
	let mut token: Option<String> = std::env::var("PAIRHELP_CLIENT_AUTH_TOKEN").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});
	let mut display_name: Option<String> = None;
	let mut skill_tags: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--key" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--key must be non-empty");
					usage_and_exit();
				}
				key = Some(v);
			}
			"--token" => token = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--name" => display_name = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--tags" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				skill_tags.extend(v.split(',').map(str::trim).filter(|t| !t.is_empty()).map(str::to_string));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let key = key.unwrap_or_else(|| {
		eprintln!("--key is required");
		usage_and_exit()
	});

	let mut cfg = ClientConfig::from_quic_endpoint(&endpoint, key).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {endpoint}\n{e}");
		usage_and_exit()
	});
	cfg.auth_token = token;
	cfg.client_name = format!("pairhelp-client-cli/{}", env!("CARGO_PKG_VERSION"));

	Args {
		cfg,
		display_name,
		skill_tags,
	}
}

fn print_envelope(env: &Envelope) {
	match serde_json::to_string(env) {
		Ok(line) => println!("{line}"),
		Err(e) => warn!(error = %e, "failed to encode inbound envelope"),
	}
}

enum Step {
	Outbound(Option<Value>),
	Inbound(Option<Envelope>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let Args {
		cfg,
		display_name,
		skill_tags,
	} = parse_args();

	let resolved = cfg.server_addr.map(|a| a.to_string()).unwrap_or_else(|| "<dns>".to_string());
	info!(server = %resolved, sni = %cfg.server_host, "connecting");

	let (mut session, welcome) = ClientSession::connect(cfg).await?;
	info!(server = %welcome.server_name, registered = welcome.registered, "session established");

	if let Some(display_name) = display_name {
		let reply = session
			.request(
				Msg::RegisterProfile {
					display_name,
					skill_tags,
					avatar_url: None,
				},
				Duration::from_secs(10),
			)
			.await?;
		print_envelope(&Envelope::event(reply));
	}

	let (out_tx, mut out_rx) = mpsc::channel::<Value>(32);
	tokio::spawn(async move {
		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		loop {
			let line = match lines.next_line().await {
				Ok(Some(line)) => line,
				Ok(None) => return,
				Err(e) => {
					warn!(error = %e, "stdin read failed");
					return;
				}
			};
			if line.trim().is_empty() {
				continue;
			}
			match serde_json::from_str::<Value>(&line) {
				Ok(msg) => {
					if out_tx.send(msg).await.is_err() {
						return;
					}
				}
				Err(e) => eprintln!("not JSON: {e}"),
			}
		}
	});

	loop {
		let step = tokio::select! {
			msg = out_rx.recv() => Step::Outbound(msg),
			env = session.recv() => Step::Inbound(env),
		};

		match step {
			Step::Outbound(Some(msg)) => {
				session.send_value(msg).await?;
			}
			Step::Outbound(None) => {
				info!("stdin closed; disconnecting");
				break;
			}
			Step::Inbound(Some(env)) => print_envelope(&env),
			Step::Inbound(None) => {
				info!("server closed the session");
				break;
			}
		}
	}

	session.close(0, "bye");
	Ok(())
}
