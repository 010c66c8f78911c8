#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context as _, anyhow};
use pairhelp_domain::{
	ContactKey, HelperStats, Level, Question, QuestionId, QuestionState, Revision, SkillTag, User, UserId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use super::{CandidateRef, PageToken, QuestionPage, RecordStore, StoreError, StoredRef, UserFilter};

/// SQLite-backed record store (sqlx, embedded migrations).
#[derive(Clone)]
pub struct SqliteRecordStore {
	pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
	id: String,
	rev: i64,
	contact_key: String,
	display_name: String,
	avatar_url: Option<String>,
	online: bool,
	helped: i64,
	stars: i64,
	level: String,
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
	seq: i64,
	id: String,
	rev: i64,
	author_id: String,
	author_key: String,
	author_name: String,
	title: String,
	details: String,
	code: String,
	skill_tag: String,
	state: String,
	helper_key: Option<String>,
	helper_name: Option<String>,
	answer: Option<String>,
	created_at_unix_ms: i64,
}

const USER_COLUMNS: &str = "id, rev, contact_key, display_name, avatar_url, online, helped, stars, level";
const QUESTION_COLUMNS: &str = "seq, id, rev, author_id, author_key, author_name, title, details, code, skill_tag, \
	state, helper_key, helper_name, answer, created_at_unix_ms";

fn corrupt(what: &str, e: impl std::fmt::Display) -> StoreError {
	StoreError::Backend(format!("corrupt {what} row: {e}"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
	matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl UserRow {
	fn into_user(self, skill_tags: Vec<String>) -> Result<User, StoreError> {
		let stars = self.stars.max(0) as u64;
		Ok(User {
			id: self.id.parse().map_err(|e| corrupt("user", e))?,
			rev: self.rev.max(0) as Revision,
			contact_key: ContactKey::new(self.contact_key).map_err(|e| corrupt("user", e))?,
			display_name: self.display_name,
			avatar_url: self.avatar_url,
			skill_tags: skill_tags
				.into_iter()
				.map(SkillTag::new)
				.collect::<Result<Vec<_>, _>>()
				.map_err(|e| corrupt("user skill", e))?,
			online: self.online,
			helper_stats: HelperStats {
				helped: self.helped.max(0) as u64,
				stars,
				level: Level::from_str(&self.level).unwrap_or_else(|_| Level::from_stars(stars)),
			},
		})
	}
}

impl QuestionRow {
	fn into_question(self) -> Result<Question, StoreError> {
		Ok(Question {
			id: self.id.parse().map_err(|e| corrupt("question", e))?,
			rev: self.rev.max(0) as Revision,
			author_id: self.author_id.parse().map_err(|e| corrupt("question", e))?,
			author: ContactKey::new(self.author_key).map_err(|e| corrupt("question", e))?,
			author_name: self.author_name,
			title: self.title,
			details: self.details,
			code: self.code,
			skill_tag: SkillTag::new(self.skill_tag).map_err(|e| corrupt("question", e))?,
			state: QuestionState::from_str(&self.state).map_err(|e| corrupt("question", e))?,
			helper: self
				.helper_key
				.map(ContactKey::new)
				.transpose()
				.map_err(|e| corrupt("question", e))?,
			helper_name: self.helper_name,
			answer: self.answer,
			created_at_unix_ms: self.created_at_unix_ms,
		})
	}
}

impl SqliteRecordStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (use sqlite:)"));
		}

		let options = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite url")?
			.create_if_missing(true)
			.foreign_keys(true);

		// Each connection to `:memory:` is its own database.
		let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect_with(options)
			.await
			.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		info!(database_url, "sqlite record store ready");
		Ok(Self { pool })
	}

	async fn skills_for(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
		let rows: Vec<(String,)> =
			sqlx::query_as("SELECT skill_tag FROM user_skills WHERE user_id = ? ORDER BY position ASC")
				.bind(user_id)
				.fetch_all(&self.pool)
				.await?;
		Ok(rows.into_iter().map(|(t,)| t).collect())
	}

	async fn load_user(&self, row: Option<UserRow>) -> Result<Option<User>, StoreError> {
		let Some(row) = row else {
			return Ok(None);
		};
		let skills = self.skills_for(&row.id).await?;
		row.into_user(skills).map(Some)
	}

	async fn replace_skills(tx: &mut Transaction<'_, Sqlite>, user: &User) -> Result<(), StoreError> {
		let user_id = user.id.to_string();
		sqlx::query("DELETE FROM user_skills WHERE user_id = ?")
			.bind(&user_id)
			.execute(&mut **tx)
			.await?;

		for (position, tag) in user.skill_tags.iter().enumerate() {
			sqlx::query("INSERT OR IGNORE INTO user_skills (user_id, position, skill_tag) VALUES (?, ?, ?)")
				.bind(&user_id)
				.bind(position as i64)
				.bind(tag.as_str())
				.execute(&mut **tx)
				.await?;
		}
		Ok(())
	}

	async fn stored_user_rev(tx: &mut Transaction<'_, Sqlite>, user: &User) -> Result<Option<Revision>, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT rev FROM users WHERE id = ? OR contact_key = ? LIMIT 1")
			.bind(user.id.to_string())
			.bind(user.contact_key.as_str())
			.fetch_optional(&mut **tx)
			.await?;
		Ok(row.map(|(r,)| r.max(0) as Revision))
	}

	async fn stored_question_rev(&self, id: QuestionId) -> Result<Option<Revision>, StoreError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT rev FROM questions WHERE id = ?")
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.map(|(r,)| r.max(0) as Revision))
	}
}

#[async_trait::async_trait]
impl RecordStore for SqliteRecordStore {
	async fn find_users(&self, filter: &UserFilter, limit: usize) -> Result<Vec<CandidateRef>, StoreError> {
		let rows: Vec<(String, String)> = sqlx::query_as(
			"SELECT u.id, u.contact_key FROM users u \
			JOIN user_skills s ON s.user_id = u.id \
			WHERE s.skill_tag = ? AND u.online = ? \
			ORDER BY u.seq ASC LIMIT ?",
		)
		.bind(filter.skill_tag.as_str())
		.bind(filter.online)
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter()
			.map(|(id, key)| -> Result<CandidateRef, StoreError> {
				Ok(CandidateRef {
					id: id.parse::<UserId>().map_err(|e| corrupt("user", e))?,
					contact_key: ContactKey::new(key).map_err(|e| corrupt("user", e))?,
				})
			})
			.collect()
	}

	async fn find_user_by_contact_key(&self, key: &ContactKey) -> Result<Option<User>, StoreError> {
		let row: Option<UserRow> = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE contact_key = ?"))
			.bind(key.as_str())
			.fetch_optional(&self.pool)
			.await?;
		self.load_user(row).await
	}

	async fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StoreError> {
		let row: Option<UserRow> = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await?;
		self.load_user(row).await
	}

	async fn insert_or_update_user(&self, user: &User) -> Result<Revision, StoreError> {
		let mut tx = self.pool.begin().await?;
		let stats = user.helper_stats;

		let new_rev = if user.rev == 0 {
			let res = sqlx::query(
				"INSERT INTO users (id, rev, contact_key, display_name, avatar_url, online, helped, stars, level) \
				VALUES (?, 1, ?, ?, ?, ?, ?, ?, ?)",
			)
			.bind(user.id.to_string())
			.bind(user.contact_key.as_str())
			.bind(&user.display_name)
			.bind(user.avatar_url.as_deref())
			.bind(user.online)
			.bind(stats.helped as i64)
			.bind(stats.stars as i64)
			.bind(stats.level.as_str())
			.execute(&mut *tx)
			.await;

			match res {
				Ok(_) => 1,
				Err(e) if is_unique_violation(&e) => {
					let stored = Self::stored_user_rev(&mut tx, user).await?.unwrap_or(0);
					return Err(StoreError::Conflict { expected: 0, stored });
				}
				Err(e) => return Err(e.into()),
			}
		} else {
			let res = sqlx::query(
				"UPDATE users SET rev = rev + 1, contact_key = ?, display_name = ?, avatar_url = ?, online = ?, \
				helped = ?, stars = ?, level = ? WHERE id = ? AND rev = ?",
			)
			.bind(user.contact_key.as_str())
			.bind(&user.display_name)
			.bind(user.avatar_url.as_deref())
			.bind(user.online)
			.bind(stats.helped as i64)
			.bind(stats.stars as i64)
			.bind(stats.level.as_str())
			.bind(user.id.to_string())
			.bind(user.rev as i64)
			.execute(&mut *tx)
			.await;

			match res {
				Ok(done) if done.rows_affected() == 1 => user.rev + 1,
				Ok(_) => {
					return match Self::stored_user_rev(&mut tx, user).await? {
						Some(stored) => Err(StoreError::Conflict {
							expected: user.rev,
							stored,
						}),
						None => Err(StoreError::NotFound),
					};
				}
				Err(e) if is_unique_violation(&e) => {
					return Err(StoreError::Conflict {
						expected: user.rev,
						stored: user.rev,
					});
				}
				Err(e) => return Err(e.into()),
			}
		};

		Self::replace_skills(&mut tx, user).await?;
		tx.commit().await?;
		Ok(new_rev)
	}

	async fn find_question_by_id(&self, id: QuestionId) -> Result<Option<Question>, StoreError> {
		let row: Option<QuestionRow> =
			sqlx::query_as(&format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&self.pool)
				.await?;
		row.map(QuestionRow::into_question).transpose()
	}

	async fn insert_or_update_question(&self, q: &Question) -> Result<StoredRef, StoreError> {
		let helper = q.helper.as_ref().map(ContactKey::as_str);

		if q.rev == 0 {
			let res = sqlx::query(
				"INSERT INTO questions (id, rev, author_id, author_key, author_name, title, details, code, skill_tag, \
				state, helper_key, helper_name, answer, created_at_unix_ms) \
				VALUES (?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
			)
			.bind(q.id.to_string())
			.bind(q.author_id.to_string())
			.bind(q.author.as_str())
			.bind(&q.author_name)
			.bind(&q.title)
			.bind(&q.details)
			.bind(&q.code)
			.bind(q.skill_tag.as_str())
			.bind(q.state.as_str())
			.bind(helper)
			.bind(q.helper_name.as_deref())
			.bind(q.answer.as_deref())
			.bind(q.created_at_unix_ms)
			.execute(&self.pool)
			.await;

			return match res {
				Ok(_) => Ok(StoredRef { id: q.id, rev: 1 }),
				Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict {
					expected: 0,
					stored: self.stored_question_rev(q.id).await?.unwrap_or(0),
				}),
				Err(e) => Err(e.into()),
			};
		}

		let done = sqlx::query(
			"UPDATE questions SET rev = rev + 1, title = ?, details = ?, code = ?, skill_tag = ?, state = ?, \
			helper_key = ?, helper_name = ?, answer = ? WHERE id = ? AND rev = ?",
		)
		.bind(&q.title)
		.bind(&q.details)
		.bind(&q.code)
		.bind(q.skill_tag.as_str())
		.bind(q.state.as_str())
		.bind(helper)
		.bind(q.helper_name.as_deref())
		.bind(q.answer.as_deref())
		.bind(q.id.to_string())
		.bind(q.rev as i64)
		.execute(&self.pool)
		.await?;

		if done.rows_affected() == 1 {
			return Ok(StoredRef { id: q.id, rev: q.rev + 1 });
		}

		match self.stored_question_rev(q.id).await? {
			Some(stored) => Err(StoreError::Conflict {
				expected: q.rev,
				stored,
			}),
			None => Err(StoreError::NotFound),
		}
	}

	async fn delete_question(&self, id: QuestionId, rev: Revision) -> Result<(), StoreError> {
		let done = sqlx::query("DELETE FROM questions WHERE id = ? AND rev = ?")
			.bind(id.to_string())
			.bind(rev as i64)
			.execute(&self.pool)
			.await?;

		if done.rows_affected() == 1 {
			return Ok(());
		}

		match self.stored_question_rev(id).await? {
			Some(stored) => Err(StoreError::Conflict { expected: rev, stored }),
			None => Err(StoreError::NotFound),
		}
	}

	async fn find_questions_by_author(
		&self,
		author_id: UserId,
		page_token: Option<PageToken>,
		page_size: usize,
	) -> Result<QuestionPage, StoreError> {
		let after = page_token.map(PageToken::after_seq).unwrap_or(0);

		let mut rows: Vec<QuestionRow> = sqlx::query_as(&format!(
			"SELECT {QUESTION_COLUMNS} FROM questions WHERE author_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?"
		))
		.bind(author_id.to_string())
		.bind(after as i64)
		.bind(page_size as i64 + 1)
		.fetch_all(&self.pool)
		.await?;

		let has_more = rows.len() > page_size;
		rows.truncate(page_size);

		let next_page_token = match rows.last() {
			Some(last) if has_more => Some(PageToken::after(last.seq.max(0) as u64)),
			_ => None,
		};

		let docs = rows
			.into_iter()
			.map(QuestionRow::into_question)
			.collect::<Result<Vec<_>, _>>()?;

		Ok(QuestionPage { docs, next_page_token })
	}
}
