#![forbid(unsafe_code)]

//! Record store gateway.
//!
//! Every record carries a revision. Writes are conditional on the caller's
//! revision matching the stored one; `rev == 0` means "insert". The in-memory
//! backend is the default; the SQLite backend is used when persistence is
//! enabled.

#[cfg(test)]
pub mod faulty;
pub mod memory;
pub mod sqlite;

use core::fmt;
use std::str::FromStr;
use std::sync::Arc;

use pairhelp_domain::{ContactKey, Question, QuestionId, Revision, SkillTag, User, UserId};
use thiserror::Error;
use tracing::debug;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

/// Page size used by author question history.
pub const QUESTION_PAGE_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("record not found")]
	NotFound,

	#[error("revision conflict: expected {expected}, stored {stored}")]
	Conflict {
		expected: Revision,
		stored: Revision,
	},

	#[error("store backend error: {0}")]
	Backend(String),
}

impl From<sqlx::Error> for StoreError {
	fn from(e: sqlx::Error) -> Self {
		match e {
			sqlx::Error::RowNotFound => StoreError::NotFound,
			other => StoreError::Backend(other.to_string()),
		}
	}
}

/// Candidate query filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserFilter {
	pub skill_tag: SkillTag,
	pub online: bool,
}

/// Minimal projection returned by candidate queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRef {
	pub id: UserId,
	pub contact_key: ContactKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRef {
	pub id: QuestionId,
	pub rev: Revision,
}

/// Opaque continuation for author history pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken {
	after_seq: u64,
}

impl PageToken {
	pub(crate) fn after(after_seq: u64) -> Self {
		Self { after_seq }
	}

	pub(crate) fn after_seq(self) -> u64 {
		self.after_seq
	}
}

impl fmt::Display for PageToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "p{:x}", self.after_seq)
	}
}

impl FromStr for PageToken {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let hex = s.trim().strip_prefix('p').ok_or(())?;
		u64::from_str_radix(hex, 16).map(PageToken::after).map_err(|_| ())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionPage {
	pub docs: Vec<Question>,
	pub next_page_token: Option<PageToken>,
}

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
	/// Users matching `filter`, in store order, at most `limit`.
	async fn find_users(&self, filter: &UserFilter, limit: usize) -> Result<Vec<CandidateRef>, StoreError>;

	async fn find_user_by_contact_key(&self, key: &ContactKey) -> Result<Option<User>, StoreError>;

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError>;

	/// Insert (`rev == 0`) or conditionally update a user. Returns the new revision.
	async fn insert_or_update_user(&self, user: &User) -> Result<Revision, StoreError>;

	async fn find_question_by_id(&self, id: QuestionId) -> Result<Option<Question>, StoreError>;

	/// Insert (`rev == 0`) or conditionally update a question.
	async fn insert_or_update_question(&self, question: &Question) -> Result<StoredRef, StoreError>;

	async fn delete_question(&self, id: QuestionId, rev: Revision) -> Result<(), StoreError>;

	async fn find_questions_by_author(
		&self,
		author_id: UserId,
		page_token: Option<PageToken>,
		page_size: usize,
	) -> Result<QuestionPage, StoreError>;
}

/// Read-modify-write a user by contact key, retrying on revision conflicts.
pub async fn update_user_with_retry<F>(
	store: &Arc<dyn RecordStore>,
	key: &ContactKey,
	attempts: u32,
	mut apply: F,
) -> Result<User, StoreError>
where
	F: FnMut(&mut User) + Send,
{
	let attempts = attempts.max(1);
	let mut last_err = StoreError::NotFound;

	for attempt in 1..=attempts {
		let Some(mut user) = store.find_user_by_contact_key(key).await? else {
			return Err(StoreError::NotFound);
		};

		apply(&mut user);

		match store.insert_or_update_user(&user).await {
			Ok(rev) => {
				user.rev = rev;
				return Ok(user);
			}
			Err(e @ StoreError::Conflict { .. }) => {
				debug!(contact_key = %key, attempt, error = %e, "user update conflicted; retrying");
				last_err = e;
			}
			Err(e) => return Err(e),
		}
	}

	Err(last_err)
}
