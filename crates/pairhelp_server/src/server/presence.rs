#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use pairhelp_domain::ContactKey;
use pairhelp_protocol::{Envelope, Msg};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::store::{RecordStore, StoreError, update_user_with_retry};

pub type ConnId = u64;

/// Attempts for an online-flag write that keeps hitting revision conflicts.
const FLUSH_ATTEMPTS: u32 = 3;

/// Outbound handle to one live connection.
///
/// Delivery never waits: the per-connection queue is bounded and a full or
/// closed queue drops the event.
#[derive(Debug, Clone)]
pub struct ConnHandle {
	conn_id: ConnId,
	tx: mpsc::Sender<Envelope>,
}

impl ConnHandle {
	pub fn new(conn_id: ConnId, tx: mpsc::Sender<Envelope>) -> Self {
		Self { conn_id, tx }
	}

	pub fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	/// Push a server event. Returns whether it was queued.
	pub fn deliver(&self, msg: Msg) -> bool {
		let kind = msg.kind();
		match self.tx.try_send(Envelope::event(msg)) {
			Ok(()) => {
				metrics::counter!("pairhelp_server_events_delivered_total").increment(1);
				true
			}
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(conn_id = self.conn_id, kind, "outbound queue full; event dropped");
				metrics::counter!("pairhelp_server_events_dropped_total", "reason" => "full").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!(conn_id = self.conn_id, kind, "outbound queue closed; event dropped");
				metrics::counter!("pairhelp_server_events_dropped_total", "reason" => "closed").increment(1);
				false
			}
		}
	}
}

enum FlushOp {
	Online { key: ContactKey, online: bool },
	Barrier(oneshot::Sender<()>),
}

/// Contact key -> live connection, with best-effort online-flag persistence.
#[derive(Clone)]
pub struct PresenceRegistry {
	inner: Arc<Inner>,
}

struct Inner {
	entries: RwLock<HashMap<ContactKey, ConnHandle>>,
	flush_tx: mpsc::UnboundedSender<FlushOp>,
}

impl PresenceRegistry {
	/// Create the registry and spawn its flusher task (requires a tokio runtime).
	pub fn new(store: Arc<dyn RecordStore>) -> Self {
		let (flush_tx, flush_rx) = mpsc::unbounded_channel();
		tokio::spawn(run_flusher(store, flush_rx));

		Self {
			inner: Arc::new(Inner {
				entries: RwLock::new(HashMap::new()),
				flush_tx,
			}),
		}
	}

	/// Bind `key` to `handle`. Returns the superseded binding, if any.
	pub async fn register(&self, key: ContactKey, handle: ConnHandle) -> Option<ConnHandle> {
		let conn_id = handle.conn_id();
		let previous = {
			let mut entries = self.inner.entries.write().await;
			let previous = entries.insert(key.clone(), handle);
			metrics::gauge!("pairhelp_server_online_users").set(entries.len() as f64);
			previous
		};

		if let Some(prev) = previous.as_ref() {
			info!(contact_key = %key, conn_id, superseded = prev.conn_id(), "presence superseded");
		} else {
			debug!(contact_key = %key, conn_id, "presence registered");
		}

		self.queue(FlushOp::Online { key, online: true });
		previous
	}

	/// Remove the binding for `key`. Idempotent.
	pub async fn unregister(&self, key: &ContactKey) -> Option<ConnHandle> {
		let removed = {
			let mut entries = self.inner.entries.write().await;
			let removed = entries.remove(key);
			metrics::gauge!("pairhelp_server_online_users").set(entries.len() as f64);
			removed
		};

		if removed.is_some() {
			debug!(contact_key = %key, "presence unregistered");
			self.queue(FlushOp::Online {
				key: key.clone(),
				online: false,
			});
		}
		removed
	}

	/// Remove the binding only if it still belongs to `conn_id`.
	pub async fn release(&self, key: &ContactKey, conn_id: ConnId) -> bool {
		let released = {
			let mut entries = self.inner.entries.write().await;
			let owned = entries.get(key).is_some_and(|h| h.conn_id() == conn_id);
			if owned {
				entries.remove(key);
				metrics::gauge!("pairhelp_server_online_users").set(entries.len() as f64);
			}
			owned
		};

		if released {
			debug!(contact_key = %key, conn_id, "presence released");
			self.queue(FlushOp::Online {
				key: key.clone(),
				online: false,
			});
		} else {
			debug!(contact_key = %key, conn_id, "presence release skipped; binding superseded");
		}
		released
	}

	pub async fn lookup(&self, key: &ContactKey) -> Option<ConnHandle> {
		self.inner.entries.read().await.get(key).cloned()
	}

	pub async fn online_count(&self) -> usize {
		self.inner.entries.read().await.len()
	}

	/// Wait until every queued online-flag transition has been applied.
	pub async fn flush(&self) {
		let (tx, rx) = oneshot::channel();
		if self.inner.flush_tx.send(FlushOp::Barrier(tx)).is_ok() {
			let _ = rx.await;
		}
	}

	fn queue(&self, op: FlushOp) {
		if self.inner.flush_tx.send(op).is_err() {
			warn!("presence flusher stopped; online flag not persisted");
		}
	}
}

async fn run_flusher(store: Arc<dyn RecordStore>, mut rx: mpsc::UnboundedReceiver<FlushOp>) {
	while let Some(op) = rx.recv().await {
		match op {
			FlushOp::Online { key, online } => {
				match update_user_with_retry(&store, &key, FLUSH_ATTEMPTS, |u| u.online = online).await {
					Ok(_) => {
						debug!(contact_key = %key, online, "online flag persisted");
					}
					Err(StoreError::NotFound) => {
						debug!(contact_key = %key, online, "no user record for presence key");
					}
					Err(e) => {
						warn!(contact_key = %key, online, error = %e, "failed to persist online flag");
						metrics::counter!("pairhelp_server_presence_flush_errors_total").increment(1);
					}
				}
			}
			FlushOp::Barrier(done) => {
				let _ = done.send(());
			}
		}
	}
}
