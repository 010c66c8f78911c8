#![forbid(unsafe_code)]

//! Wire vocabulary carried inside frames.
//!
//! Every frame holds one [`Envelope`]. Replies echo the request's
//! `request_id`; server-pushed events carry an empty one. User-supplied
//! identifiers travel as strings and are validated by the server so a bad
//! value produces an `error` reply instead of an undecodable frame.

use pairhelp_domain::{HelperStats, Question, QuestionId, QuestionState, SkillTag, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::version::PROTOCOL_MAJOR;

/// Wire error codes carried by [`Msg::Error`].
pub mod codes {
	pub const NOT_FOUND: &str = "NOT_FOUND";
	pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
	pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
	pub const INVALID_STATE: &str = "INVALID_STATE";
	pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub version: u32,
	#[serde(default)]
	pub request_id: String,
	pub msg: Msg,
}

impl Envelope {
	pub fn request(request_id: impl Into<String>, msg: Msg) -> Self {
		Self {
			version: PROTOCOL_MAJOR,
			request_id: request_id.into(),
			msg,
		}
	}

	/// A server-pushed event (no correlation id).
	pub fn event(msg: Msg) -> Self {
		Self::request(String::new(), msg)
	}

	pub fn reply(&self, msg: Msg) -> Self {
		Self::request(self.request_id.clone(), msg)
	}

	/// Decode an envelope from a frame body that is already known to be JSON.
	///
	/// On failure the `request_id` is still recovered when the body carries
	/// one, so the sender can be answered with an error.
	pub fn from_value(value: Value) -> Result<Self, MalformedEnvelope> {
		let request_id = value
			.get("request_id")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();

		let env: Envelope = serde_json::from_value(value).map_err(|e| MalformedEnvelope {
			request_id: request_id.clone(),
			reason: e.to_string(),
		})?;

		if env.version != PROTOCOL_MAJOR {
			return Err(MalformedEnvelope {
				request_id,
				reason: format!("unsupported protocol version {} (expected {PROTOCOL_MAJOR})", env.version),
			});
		}
		Ok(env)
	}
}

/// A JSON frame that is not a usable [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed envelope: {reason}")]
pub struct MalformedEnvelope {
	pub request_id: String,
	pub reason: String,
}

/// Outcome of `find_helper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
	Searching,
	Archived,
	AlreadyMatched,
}

/// Outcome of `answer_invitation` as seen by the answering helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationOutcome {
	Won,
	RaceLost,
	Declined,
}

/// Public view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub display_name: String,
	pub avatar_url: Option<String>,
	pub skill_tags: Vec<SkillTag>,
	pub helper_stats: HelperStats,
}

/// One row of an author's question history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSummary {
	pub id: QuestionId,
	pub title: String,
	pub state: QuestionState,
}

/// An archived question together with its helper's user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedQuestion {
	pub question: Question,
	pub helper_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Msg {
	// client -> server
	Hello {
		contact_key: String,
		#[serde(default)]
		auth_token: String,
		#[serde(default)]
		client_name: String,
	},
	Ping {
		client_time_unix_ms: i64,
	},
	RegisterProfile {
		display_name: String,
		#[serde(default)]
		skill_tags: Vec<String>,
		#[serde(default)]
		avatar_url: Option<String>,
	},
	SubmitQuestion {
		title: String,
		#[serde(default)]
		details: String,
		#[serde(default)]
		code: String,
		skill_tag: String,
	},
	FindHelper {
		question_id: String,
	},
	AnswerInvitation {
		question_id: String,
		accepted: bool,
		#[serde(default)]
		display_name: String,
	},
	JoinSession {
		question_id: String,
		#[serde(default)]
		display_name: String,
		#[serde(default)]
		avatar_url: Option<String>,
	},
	ChatSend {
		question_id: String,
		payload: Value,
	},
	UpdateEditor {
		question_id: String,
		payload: Value,
	},
	EndRequest {
		question_id: String,
		#[serde(default)]
		payload: Value,
	},
	ChatEnded {
		question_id: String,
		#[serde(default)]
		answer: Option<String>,
		/// Whole stars. Fractional or negative ratings make the envelope malformed.
		rating: u32,
	},
	LeaveSession {
		question_id: String,
	},
	ListQuestions {
		#[serde(default)]
		page_token: Option<String>,
	},
	ViewQuestion {
		question_id: String,
	},
	GetProfile {
		user_id: String,
	},

	// server -> client
	Welcome {
		server_name: String,
		server_time_unix_ms: i64,
		max_frame_bytes: u32,
		registered: bool,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
	Error {
		code: String,
		message: String,
	},
	ProfileSaved {
		profile: UserProfile,
	},
	QuestionSubmitted {
		question: Question,
	},
	SearchStarted {
		question_id: QuestionId,
		status: SearchStatus,
	},
	InvitationAnswered {
		question_id: QuestionId,
		outcome: InvitationOutcome,
	},
	AskHelp {
		question: Question,
	},
	AlreadyAccepted {
		question_id: QuestionId,
	},
	HelperFound {
		question_id: QuestionId,
	},
	Accept {
		question_id: QuestionId,
	},
	Timeout {
		question_id: QuestionId,
	},
	ErrorWhileFinding {
		question_id: QuestionId,
	},
	SessionJoined {
		question: Question,
		peer_present: bool,
	},
	ChatReceived {
		question_id: QuestionId,
		payload: Value,
	},
	Update {
		question_id: QuestionId,
		payload: Value,
	},
	UserConnected {
		question_id: QuestionId,
		display_name: String,
		avatar_url: Option<String>,
	},
	UserLeft {
		question_id: QuestionId,
	},
	AskHelperForAnswer {
		question_id: QuestionId,
		payload: Value,
	},
	EndChat {
		question_id: QuestionId,
	},
	SessionEnded {
		question_id: QuestionId,
		archived: bool,
		helper_stats_updated: bool,
	},
	QuestionPage {
		questions: Vec<QuestionSummary>,
		next_page_token: Option<String>,
	},
	QuestionView {
		view: ArchivedQuestion,
	},
	Profile {
		profile: UserProfile,
	},
}

impl Msg {
	pub fn error(code: &str, message: impl Into<String>) -> Self {
		Msg::Error {
			code: code.to_string(),
			message: message.into(),
		}
	}

	/// Stable name used in logs and metrics labels.
	pub fn kind(&self) -> &'static str {
		match self {
			Msg::Hello { .. } => "hello",
			Msg::Ping { .. } => "ping",
			Msg::RegisterProfile { .. } => "register_profile",
			Msg::SubmitQuestion { .. } => "submit_question",
			Msg::FindHelper { .. } => "find_helper",
			Msg::AnswerInvitation { .. } => "answer_invitation",
			Msg::JoinSession { .. } => "join_session",
			Msg::ChatSend { .. } => "chat_send",
			Msg::UpdateEditor { .. } => "update_editor",
			Msg::EndRequest { .. } => "end_request",
			Msg::ChatEnded { .. } => "chat_ended",
			Msg::LeaveSession { .. } => "leave_session",
			Msg::ListQuestions { .. } => "list_questions",
			Msg::ViewQuestion { .. } => "view_question",
			Msg::GetProfile { .. } => "get_profile",
			Msg::Welcome { .. } => "welcome",
			Msg::Pong { .. } => "pong",
			Msg::Error { .. } => "error",
			Msg::ProfileSaved { .. } => "profile_saved",
			Msg::QuestionSubmitted { .. } => "question_submitted",
			Msg::SearchStarted { .. } => "search_started",
			Msg::InvitationAnswered { .. } => "invitation_answered",
			Msg::AskHelp { .. } => "ask_help",
			Msg::AlreadyAccepted { .. } => "already_accepted",
			Msg::HelperFound { .. } => "helper_found",
			Msg::Accept { .. } => "accept",
			Msg::Timeout { .. } => "timeout",
			Msg::ErrorWhileFinding { .. } => "error_while_finding",
			Msg::SessionJoined { .. } => "session_joined",
			Msg::ChatReceived { .. } => "chat_received",
			Msg::Update { .. } => "update",
			Msg::UserConnected { .. } => "user_connected",
			Msg::UserLeft { .. } => "user_left",
			Msg::AskHelperForAnswer { .. } => "ask_helper_for_answer",
			Msg::EndChat { .. } => "end_chat",
			Msg::SessionEnded { .. } => "session_ended",
			Msg::QuestionPage { .. } => "question_page",
			Msg::QuestionView { .. } => "question_view",
			Msg::Profile { .. } => "profile",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tagged_layout_on_the_wire() {
		let env = Envelope::request("r1", Msg::FindHelper { question_id: "q".into() });
		let v = serde_json::to_value(&env).expect("to_value");
		assert_eq!(v["request_id"], "r1");
		assert_eq!(v["msg"]["type"], "find_helper");
		assert_eq!(v["msg"]["data"]["question_id"], "q");
	}

	#[test]
	fn optional_fields_default_when_absent() {
		let raw = r#"{"version":1,"msg":{"type":"hello","data":{"contact_key":"a@x"}}}"#;
		let env: Envelope = serde_json::from_str(raw).expect("parse");
		assert_eq!(env.request_id, "");
		match env.msg {
			Msg::Hello {
				contact_key,
				auth_token,
				client_name,
			} => {
				assert_eq!(contact_key, "a@x");
				assert!(auth_token.is_empty());
				assert!(client_name.is_empty());
			}
			other => panic!("unexpected msg: {other:?}"),
		}
	}

	#[test]
	fn reply_keeps_request_id() {
		let req = Envelope::request("abc", Msg::Ping { client_time_unix_ms: 1 });
		let rep = req.reply(Msg::Pong {
			client_time_unix_ms: 1,
			server_time_unix_ms: 2,
		});
		assert_eq!(rep.request_id, "abc");
		assert_eq!(rep.msg.kind(), "pong");
		assert!(Envelope::event(Msg::UserLeft { question_id: QuestionId::new_v4() }).request_id.is_empty());
	}

	#[test]
	fn malformed_envelope_keeps_request_id() {
		let raw = serde_json::json!({
			"version": 1,
			"request_id": "r7",
			"msg": {"type": "chat_ended", "data": {"question_id": "q", "rating": 4.5}},
		});
		let err = Envelope::from_value(raw).expect_err("fractional rating");
		assert_eq!(err.request_id, "r7");
		assert!(err.reason.contains("4.5"), "reason: {}", err.reason);

		let unknown = serde_json::json!({"version": 1, "msg": {"type": "teleport", "data": {}}});
		let err = Envelope::from_value(unknown).expect_err("unknown type");
		assert!(err.request_id.is_empty());
	}

	#[test]
	fn other_protocol_versions_are_rejected() {
		let mut raw = serde_json::to_value(Envelope::request("r1", Msg::Ping { client_time_unix_ms: 1 })).expect("to_value");
		assert!(Envelope::from_value(raw.clone()).is_ok());

		raw["version"] = serde_json::json!(2);
		let err = Envelope::from_value(raw).expect_err("v2");
		assert_eq!(err.request_id, "r1");
		assert!(err.reason.contains("version 2"));
	}
}
