#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use pairhelp_domain::{ContactKey, Question, QuestionId, Revision, User, UserId};
use tokio::sync::Mutex;

use super::{CandidateRef, PageToken, QuestionPage, RecordStore, StoreError, StoredRef, UserFilter};

/// In-process record store. Store order is insertion order.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
	inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	next_seq: u64,
	users: BTreeMap<u64, User>,
	user_seq_by_id: HashMap<UserId, u64>,
	questions: BTreeMap<u64, Question>,
	question_seq_by_id: HashMap<QuestionId, u64>,
}

impl Inner {
	fn next_seq(&mut self) -> u64 {
		self.next_seq += 1;
		self.next_seq
	}

	fn user_by_key(&self, key: &ContactKey) -> Option<&User> {
		self.users.values().find(|u| &u.contact_key == key)
	}
}

impl MemoryRecordStore {
	pub fn new() -> Self {
		Self::default()
	}
}

fn check_rev(expected: Revision, stored: Revision) -> Result<(), StoreError> {
	if expected == stored {
		Ok(())
	} else {
		Err(StoreError::Conflict { expected, stored })
	}
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
	async fn find_users(&self, filter: &UserFilter, limit: usize) -> Result<Vec<CandidateRef>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.users
			.values()
			.filter(|u| u.online == filter.online && u.has_skill(&filter.skill_tag))
			.take(limit)
			.map(|u| CandidateRef {
				id: u.id,
				contact_key: u.contact_key.clone(),
			})
			.collect())
	}

	async fn find_user_by_contact_key(&self, key: &ContactKey) -> Result<Option<User>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.user_by_key(key).cloned())
	}

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.user_seq_by_id
			.get(&id)
			.and_then(|seq| inner.users.get(seq))
			.cloned())
	}

	async fn insert_or_update_user(&self, user: &User) -> Result<Revision, StoreError> {
		let mut inner = self.inner.lock().await;

		match inner.user_seq_by_id.get(&user.id).copied() {
			Some(seq) => {
				let stored = inner.users.get(&seq).map(|u| u.rev).unwrap_or(0);
				check_rev(user.rev, stored)?;
				if inner
					.user_by_key(&user.contact_key)
					.is_some_and(|other| other.id != user.id)
				{
					return Err(StoreError::Conflict {
						expected: user.rev,
						stored,
					});
				}

				let mut next = user.clone();
				next.rev = stored + 1;
				inner.users.insert(seq, next);
				Ok(stored + 1)
			}
			None => {
				if user.rev != 0 {
					return Err(StoreError::NotFound);
				}
				if let Some(existing) = inner.user_by_key(&user.contact_key) {
					return Err(StoreError::Conflict {
						expected: 0,
						stored: existing.rev,
					});
				}

				let seq = inner.next_seq();
				let mut next = user.clone();
				next.rev = 1;
				inner.users.insert(seq, next);
				inner.user_seq_by_id.insert(user.id, seq);
				Ok(1)
			}
		}
	}

	async fn find_question_by_id(&self, id: QuestionId) -> Result<Option<Question>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.question_seq_by_id
			.get(&id)
			.and_then(|seq| inner.questions.get(seq))
			.cloned())
	}

	async fn insert_or_update_question(&self, question: &Question) -> Result<StoredRef, StoreError> {
		let mut inner = self.inner.lock().await;

		let seq = match inner.question_seq_by_id.get(&question.id).copied() {
			Some(seq) => {
				let stored = inner.questions.get(&seq).map(|q| q.rev).unwrap_or(0);
				check_rev(question.rev, stored)?;
				seq
			}
			None => {
				if question.rev != 0 {
					return Err(StoreError::NotFound);
				}
				let seq = inner.next_seq();
				inner.question_seq_by_id.insert(question.id, seq);
				seq
			}
		};

		let mut next = question.clone();
		next.rev = question.rev + 1;
		let rev = next.rev;
		inner.questions.insert(seq, next);

		Ok(StoredRef { id: question.id, rev })
	}

	async fn delete_question(&self, id: QuestionId, rev: Revision) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;

		let Some(seq) = inner.question_seq_by_id.get(&id).copied() else {
			return Err(StoreError::NotFound);
		};
		let stored = inner.questions.get(&seq).map(|q| q.rev).unwrap_or(0);
		check_rev(rev, stored)?;

		inner.questions.remove(&seq);
		inner.question_seq_by_id.remove(&id);
		Ok(())
	}

	async fn find_questions_by_author(
		&self,
		author_id: UserId,
		page_token: Option<PageToken>,
		page_size: usize,
	) -> Result<QuestionPage, StoreError> {
		let inner = self.inner.lock().await;
		let after = page_token.map(PageToken::after_seq).unwrap_or(0);

		let mut matching = inner
			.questions
			.range(after.saturating_add(1)..)
			.filter(|(_, q)| q.author_id == author_id);

		let docs: Vec<(u64, Question)> = matching
			.by_ref()
			.take(page_size)
			.map(|(seq, q)| (*seq, q.clone()))
			.collect();

		let next_page_token = match (docs.last(), matching.next()) {
			(Some((last_seq, _)), Some(_)) => Some(PageToken::after(*last_seq)),
			_ => None,
		};

		Ok(QuestionPage {
			docs: docs.into_iter().map(|(_, q)| q).collect(),
			next_page_token,
		})
	}
}

#[cfg(test)]
mod tests {
	use pairhelp_domain::{QuestionDraft, QuestionState, SkillTag};

	use super::*;

	fn user(key: &str, tags: &[&str], online: bool) -> User {
		let mut u = User::new(
			ContactKey::new(key).expect("key"),
			key,
			tags.iter().map(|t| SkillTag::new(*t).expect("tag")).collect(),
		);
		u.online = online;
		u
	}

	fn question(author: &User, title: &str) -> Question {
		Question::open(
			author,
			QuestionDraft {
				title: title.to_string(),
				details: String::new(),
				code: String::new(),
				skill_tag: SkillTag::new("rust").expect("tag"),
			},
			0,
		)
	}

	#[tokio::test]
	async fn find_users_filters_and_keeps_store_order() {
		let store = MemoryRecordStore::new();
		for u in [
			user("h1@x", &["rust"], true),
			user("h2@x", &["go"], true),
			user("h3@x", &["rust", "go"], false),
			user("h4@x", &["rust"], true),
		] {
			store.insert_or_update_user(&u).await.expect("insert");
		}

		let filter = UserFilter {
			skill_tag: SkillTag::new("rust").expect("tag"),
			online: true,
		};
		let found = store.find_users(&filter, 10).await.expect("find");
		let keys: Vec<&str> = found.iter().map(|c| c.contact_key.as_str()).collect();
		assert_eq!(keys, vec!["h1@x", "h4@x"]);

		let limited = store.find_users(&filter, 1).await.expect("find");
		assert_eq!(limited.len(), 1);
	}

	#[tokio::test]
	async fn stale_revision_is_a_conflict() {
		let store = MemoryRecordStore::new();
		let mut u = user("a@x", &["rust"], false);
		u.rev = store.insert_or_update_user(&u).await.expect("insert");

		let mut first = u.clone();
		first.online = true;
		store.insert_or_update_user(&first).await.expect("update");

		let mut stale = u.clone();
		stale.display_name = "stale".into();
		let err = store.insert_or_update_user(&stale).await.unwrap_err();
		assert!(matches!(err, StoreError::Conflict { expected: 1, stored: 2 }));
	}

	#[tokio::test]
	async fn duplicate_contact_key_is_rejected() {
		let store = MemoryRecordStore::new();
		store
			.insert_or_update_user(&user("a@x", &[], false))
			.await
			.expect("insert");
		let err = store
			.insert_or_update_user(&user("A@x", &[], false))
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::Conflict { .. }));
	}

	#[tokio::test]
	async fn delete_requires_current_revision() {
		let store = MemoryRecordStore::new();
		let author = user("a@x", &[], true);
		let mut q = question(&author, "t");
		q.rev = store.insert_or_update_question(&q).await.expect("insert").rev;
		q.state = QuestionState::Matching;
		let stored = store.insert_or_update_question(&q).await.expect("update");

		assert!(matches!(
			store.delete_question(q.id, q.rev).await,
			Err(StoreError::Conflict { .. })
		));
		store.delete_question(q.id, stored.rev).await.expect("delete");
		assert!(store.find_question_by_id(q.id).await.expect("find").is_none());
		assert!(matches!(
			store.delete_question(q.id, stored.rev).await,
			Err(StoreError::NotFound)
		));
	}

	#[tokio::test]
	async fn author_pages_follow_insertion_order() {
		let store = MemoryRecordStore::new();
		let author = user("a@x", &[], true);
		let other = user("b@x", &[], true);

		for i in 0..23 {
			let q = question(&author, &format!("q{i}"));
			store.insert_or_update_question(&q).await.expect("insert");
			if i % 5 == 0 {
				let q = question(&other, "noise");
				store.insert_or_update_question(&q).await.expect("insert");
			}
		}

		let mut titles = Vec::new();
		let mut token = None;
		let mut pages = 0;
		loop {
			let page = store
				.find_questions_by_author(author.id, token, 10)
				.await
				.expect("page");
			pages += 1;
			titles.extend(page.docs.iter().map(|q| q.title.clone()));
			match page.next_page_token {
				Some(next) => token = Some(next),
				None => break,
			}
		}

		assert_eq!(pages, 3);
		assert_eq!(titles.len(), 23);
		assert_eq!(titles.first().map(String::as_str), Some("q0"));
		assert_eq!(titles.last().map(String::as_str), Some("q22"));
	}
}
