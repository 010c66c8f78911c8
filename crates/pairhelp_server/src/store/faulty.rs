#![forbid(unsafe_code)]

//! Test-only store wrapper with switchable failures and a one-shot read hold.

use std::sync::atomic::{AtomicBool, Ordering};

use pairhelp_domain::{ContactKey, Question, QuestionId, Revision, User, UserId};
use tokio::sync::{Mutex, oneshot};

use super::{CandidateRef, MemoryRecordStore, PageToken, QuestionPage, RecordStore, StoreError, StoredRef, UserFilter};

struct ReadHold {
	question_id: QuestionId,
	entered: oneshot::Sender<()>,
	release: oneshot::Receiver<()>,
}

/// Signals for a held question read: `entered` fires once the read has taken
/// its snapshot, and sending on `release` lets it return that snapshot.
pub struct HeldRead {
	pub entered: oneshot::Receiver<()>,
	pub release: oneshot::Sender<()>,
}

#[derive(Default)]
pub struct FaultyRecordStore {
	inner: MemoryRecordStore,
	fail_find_users: AtomicBool,
	fail_question_writes: AtomicBool,
	fail_user_writes: AtomicBool,
	hold: Mutex<Option<ReadHold>>,
}

fn injected() -> StoreError {
	StoreError::Backend("injected failure".to_string())
}

impl FaultyRecordStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fail_find_users(&self, on: bool) {
		self.fail_find_users.store(on, Ordering::SeqCst);
	}

	pub fn fail_question_writes(&self, on: bool) {
		self.fail_question_writes.store(on, Ordering::SeqCst);
	}

	pub fn fail_user_writes(&self, on: bool) {
		self.fail_user_writes.store(on, Ordering::SeqCst);
	}

	/// Hold the next read of `question_id` after it has read the record.
	pub async fn hold_next_read(&self, question_id: QuestionId) -> HeldRead {
		let (entered_tx, entered) = oneshot::channel();
		let (release, release_rx) = oneshot::channel();
		*self.hold.lock().await = Some(ReadHold {
			question_id,
			entered: entered_tx,
			release: release_rx,
		});
		HeldRead { entered, release }
	}
}

#[async_trait::async_trait]
impl RecordStore for FaultyRecordStore {
	async fn find_users(&self, filter: &UserFilter, limit: usize) -> Result<Vec<CandidateRef>, StoreError> {
		if self.fail_find_users.load(Ordering::SeqCst) {
			return Err(injected());
		}
		self.inner.find_users(filter, limit).await
	}

	async fn find_user_by_contact_key(&self, key: &ContactKey) -> Result<Option<User>, StoreError> {
		self.inner.find_user_by_contact_key(key).await
	}

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
		self.inner.find_user_by_id(id).await
	}

	async fn insert_or_update_user(&self, user: &User) -> Result<Revision, StoreError> {
		if self.fail_user_writes.load(Ordering::SeqCst) {
			return Err(injected());
		}
		self.inner.insert_or_update_user(user).await
	}

	async fn find_question_by_id(&self, id: QuestionId) -> Result<Option<Question>, StoreError> {
		let snapshot = self.inner.find_question_by_id(id).await?;

		let hold = {
			let mut slot = self.hold.lock().await;
			match slot.take() {
				Some(hold) if hold.question_id == id => Some(hold),
				other => {
					*slot = other;
					None
				}
			}
		};
		if let Some(hold) = hold {
			let _ = hold.entered.send(());
			let _ = hold.release.await;
		}

		Ok(snapshot)
	}

	async fn insert_or_update_question(&self, question: &Question) -> Result<StoredRef, StoreError> {
		if self.fail_question_writes.load(Ordering::SeqCst) {
			return Err(injected());
		}
		self.inner.insert_or_update_question(question).await
	}

	async fn delete_question(&self, id: QuestionId, rev: Revision) -> Result<(), StoreError> {
		self.inner.delete_question(id, rev).await
	}

	async fn find_questions_by_author(
		&self,
		author_id: UserId,
		page_token: Option<PageToken>,
		page_size: usize,
	) -> Result<QuestionPage, StoreError> {
		self.inner.find_questions_by_author(author_id, page_token, page_size).await
	}
}
