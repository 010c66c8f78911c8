#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stars added to a helper's total when the session ends with an answer.
pub const DEFAULT_ANSWER_REWARD: u64 = 10;

/// Store revision of a record. `0` means "never stored".
pub type Revision = u64;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown value: {0}")]
	Unknown(String),
}

/// Presence key of a user (email-like). Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContactKey(String);

impl ContactKey {
	pub fn new(key: impl Into<String>) -> Result<Self, ParseIdError> {
		let key = key.into();
		let key = key.trim();
		if key.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if key.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("contact key contains whitespace: {key}")));
		}
		Ok(Self(key.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ContactKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ContactKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ContactKey::new(s)
	}
}

impl TryFrom<String> for ContactKey {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ContactKey::new(value)
	}
}

impl From<ContactKey> for String {
	fn from(value: ContactKey) -> Self {
		value.0
	}
}

/// Skill tag shared by questions and helpers (e.g. a programming language).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SkillTag(String);

impl SkillTag {
	pub fn new(tag: impl Into<String>) -> Result<Self, ParseIdError> {
		let tag = tag.into();
		let tag = tag.trim();
		if tag.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(tag.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SkillTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SkillTag {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SkillTag::new(s)
	}
}

impl TryFrom<String> for SkillTag {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		SkillTag::new(value)
	}
}

impl From<SkillTag> for String {
	fn from(value: SkillTag) -> Self {
		value.0
	}
}

macro_rules! uuid_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub uuid::Uuid);

		impl $name {
			pub fn new_v4() -> Self {
				Self(uuid::Uuid::new_v4())
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				uuid::Uuid::parse_str(s)
					.map(Self)
					.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
			}
		}
	};
}

uuid_id!(
	/// Durable user identifier.
	UserId
);

uuid_id!(
	/// Durable question identifier; also the session scope key once matched.
	QuestionId
);

/// Helper level derived from the stars total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
	Beginner,
	Amateur,
	Advanced,
	Expert,
}

impl Level {
	/// Level thresholds, highest first.
	const THRESHOLDS: [(u64, Level); 3] = [(10_000, Level::Expert), (5_000, Level::Advanced), (2_000, Level::Amateur)];

	pub fn from_stars(stars: u64) -> Self {
		Self::THRESHOLDS
			.iter()
			.find(|(min, _)| stars >= *min)
			.map(|(_, level)| *level)
			.unwrap_or(Level::Beginner)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Level::Beginner => "beginner",
			Level::Amateur => "amateur",
			Level::Advanced => "advanced",
			Level::Expert => "expert",
		}
	}
}

impl fmt::Display for Level {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Level {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"beginner" => Ok(Level::Beginner),
			"amateur" => Ok(Level::Amateur),
			"advanced" => Ok(Level::Advanced),
			"expert" => Ok(Level::Expert),
			"" => Err(ParseIdError::Empty),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// Accumulated helper statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperStats {
	pub helped: u64,
	pub stars: u64,
	pub level: Level,
}

impl Default for HelperStats {
	fn default() -> Self {
		Self {
			helped: 0,
			stars: 0,
			level: Level::Beginner,
		}
	}
}

impl HelperStats {
	/// Apply one finished session: count it, add the rating, add `answer_reward`
	/// when an answer was given, then recompute the level.
	pub fn record_session(&mut self, rating: u32, answered: bool, answer_reward: u64) {
		self.helped = self.helped.saturating_add(1);
		self.stars = self.stars.saturating_add(u64::from(rating));
		if answered {
			self.stars = self.stars.saturating_add(answer_reward);
		}
		self.level = Level::from_stars(self.stars);
	}
}

/// Durable user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub rev: Revision,
	pub contact_key: ContactKey,
	pub display_name: String,
	pub avatar_url: Option<String>,
	pub skill_tags: Vec<SkillTag>,
	pub online: bool,
	pub helper_stats: HelperStats,
}

impl User {
	/// A fresh, never-stored user.
	pub fn new(contact_key: ContactKey, display_name: impl Into<String>, skill_tags: Vec<SkillTag>) -> Self {
		Self {
			id: UserId::new_v4(),
			rev: 0,
			contact_key,
			display_name: display_name.into(),
			avatar_url: None,
			skill_tags,
			online: false,
			helper_stats: HelperStats::default(),
		}
	}

	pub fn has_skill(&self, tag: &SkillTag) -> bool {
		self.skill_tags.iter().any(|t| t == tag)
	}
}

/// Question lifecycle as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
	Open,
	Matching,
	Matched,
	Archived,
}

impl QuestionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			QuestionState::Open => "open",
			QuestionState::Matching => "matching",
			QuestionState::Matched => "matched",
			QuestionState::Archived => "archived",
		}
	}
}

impl fmt::Display for QuestionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for QuestionState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"open" => Ok(QuestionState::Open),
			"matching" => Ok(QuestionState::Matching),
			"matched" => Ok(QuestionState::Matched),
			"archived" => Ok(QuestionState::Archived),
			"" => Err(ParseIdError::Empty),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// Author-supplied question content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionDraft {
	pub title: String,
	#[serde(default)]
	pub details: String,
	#[serde(default)]
	pub code: String,
	pub skill_tag: SkillTag,
}

/// Durable question record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
	pub id: QuestionId,
	pub rev: Revision,
	pub author_id: UserId,
	pub author: ContactKey,
	pub author_name: String,
	pub title: String,
	pub details: String,
	pub code: String,
	pub skill_tag: SkillTag,
	pub state: QuestionState,
	pub helper: Option<ContactKey>,
	pub helper_name: Option<String>,
	pub answer: Option<String>,
	pub created_at_unix_ms: i64,
}

impl Question {
	/// A fresh, never-stored `Open` question authored by `author`.
	pub fn open(author: &User, draft: QuestionDraft, created_at_unix_ms: i64) -> Self {
		Self {
			id: QuestionId::new_v4(),
			rev: 0,
			author_id: author.id,
			author: author.contact_key.clone(),
			author_name: author.display_name.clone(),
			title: draft.title,
			details: draft.details,
			code: draft.code,
			skill_tag: draft.skill_tag,
			state: QuestionState::Open,
			helper: None,
			helper_name: None,
			answer: None,
			created_at_unix_ms,
		}
	}

	pub fn is_archived(&self) -> bool {
		self.state == QuestionState::Archived
	}

	/// Whether `who` is the author or the assigned helper.
	pub fn is_party(&self, who: &ContactKey) -> bool {
		&self.author == who || self.helper.as_ref() == Some(who)
	}
}
