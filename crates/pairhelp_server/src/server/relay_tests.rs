#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pairhelp_domain::{ContactKey, Level, Question, QuestionDraft, QuestionId, QuestionState, SkillTag, User};
use pairhelp_protocol::{Envelope, Msg};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::coordinator::MatchingSettings;
use crate::server::error::ServiceError;
use crate::server::presence::ConnHandle;
use crate::server::relay::{Participant, SessionRelay};
use crate::store::faulty::{FaultyRecordStore, HeldRead};
use crate::store::{MemoryRecordStore, RecordStore, StoreError};

const AUTHOR_CONN: u64 = 1;
const HELPER_CONN: u64 = 2;

fn key(s: &str) -> ContactKey {
	ContactKey::new(s).expect("valid contact key")
}

fn handle(conn_id: u64) -> (ConnHandle, mpsc::Receiver<Envelope>) {
	let (tx, rx) = mpsc::channel(32);
	(ConnHandle::new(conn_id, tx), rx)
}

fn participant(name: &str) -> Participant {
	Participant {
		display_name: name.to_string(),
		avatar_url: Some(format!("https://img.example/{name}.png")),
	}
}

async fn next_msg(rx: &mut mpsc::Receiver<Envelope>) -> Msg {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
		.msg
}

fn assert_quiet(rx: &mut mpsc::Receiver<Envelope>) {
	if let Ok(env) = rx.try_recv() {
		panic!("unexpected event: {:?}", env.msg);
	}
}

struct Fixture {
	store: Arc<dyn RecordStore>,
	relay: SessionRelay,
	question_id: QuestionId,
}

async fn question_in_state(store: &Arc<dyn RecordStore>, author: &User, state: QuestionState) -> QuestionId {
	let draft = QuestionDraft {
		title: "lifetimes".to_string(),
		details: String::new(),
		code: String::new(),
		skill_tag: SkillTag::new("rust").expect("tag"),
	};
	let mut question = Question::open(author, draft, 0);
	question.state = state;
	if state != QuestionState::Open {
		question.helper = Some(key("helper@x"));
		question.helper_name = Some("Helper".to_string());
	}
	store.insert_or_update_question(&question).await.expect("insert question");
	question.id
}

async fn fixture() -> Fixture {
	fixture_with(Arc::new(MemoryRecordStore::new())).await
}

async fn fixture_with(store: Arc<dyn RecordStore>) -> Fixture {
	let author = User::new(key("author@x"), "Author", vec![]);
	store.insert_or_update_user(&author).await.expect("insert author");
	let helper = User::new(key("helper@x"), "Helper", vec![SkillTag::new("rust").expect("tag")]);
	store.insert_or_update_user(&helper).await.expect("insert helper");
	let outsider = User::new(key("outsider@x"), "Outsider", vec![]);
	store.insert_or_update_user(&outsider).await.expect("insert outsider");

	let question_id = question_in_state(&store, &author, QuestionState::Matched).await;
	let relay = SessionRelay::new(Arc::clone(&store), &MatchingSettings::default());

	Fixture {
		store,
		relay,
		question_id,
	}
}

async fn joined_pair(fx: &Fixture) -> (mpsc::Receiver<Envelope>, mpsc::Receiver<Envelope>) {
	let (ah, mut arx) = handle(AUTHOR_CONN);
	let (hh, mut hrx) = handle(HELPER_CONN);

	let joined = fx
		.relay
		.join(fx.question_id, &key("author@x"), ah, participant("Author"))
		.await
		.expect("author joins");
	assert!(!joined.peer_present);

	let joined = fx
		.relay
		.join(fx.question_id, &key("helper@x"), hh, participant("Helper"))
		.await
		.expect("helper joins");
	assert!(joined.peer_present);
	assert_eq!(joined.question.id, fx.question_id);

	match next_msg(&mut arx).await {
		Msg::UserConnected { display_name, .. } => assert_eq!(display_name, "Helper"),
		other => panic!("expected user_connected, got {other:?}"),
	}
	match next_msg(&mut hrx).await {
		Msg::UserConnected {
			display_name,
			avatar_url,
			..
		} => {
			assert_eq!(display_name, "Author");
			assert_eq!(avatar_url.as_deref(), Some("https://img.example/Author.png"));
		}
		other => panic!("expected user_connected, got {other:?}"),
	}

	(arx, hrx)
}

#[tokio::test]
async fn join_rejects_unknown_unmatched_archived_and_outsiders() {
	let fx = fixture().await;
	let author = fx
		.store
		.find_user_by_contact_key(&key("author@x"))
		.await
		.expect("store ok")
		.expect("author");

	let (h, _rx) = handle(9);
	let err = fx
		.relay
		.join(QuestionId::new_v4(), &key("author@x"), h.clone(), participant("Author"))
		.await
		.expect_err("unknown question");
	assert!(matches!(err, ServiceError::NotFound(_)), "got {err:?}");

	let open = question_in_state(&fx.store, &author, QuestionState::Open).await;
	let err = fx
		.relay
		.join(open, &key("author@x"), h.clone(), participant("Author"))
		.await
		.expect_err("no helper yet");
	assert!(matches!(err, ServiceError::InvalidState(_)), "got {err:?}");

	let archived = question_in_state(&fx.store, &author, QuestionState::Archived).await;
	let err = fx
		.relay
		.join(archived, &key("helper@x"), h.clone(), participant("Helper"))
		.await
		.expect_err("archived");
	assert!(matches!(err, ServiceError::InvalidState(_)), "got {err:?}");

	let err = fx
		.relay
		.join(fx.question_id, &key("outsider@x"), h, participant("Outsider"))
		.await
		.expect_err("not a party");
	assert!(matches!(err, ServiceError::Unauthorized(_)), "got {err:?}");
	assert_eq!(fx.relay.scope_count().await, 0);
}

#[tokio::test]
async fn relays_reach_the_peer_and_are_not_echoed() {
	let fx = fixture().await;
	let (mut arx, mut hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	let delivered = fx
		.relay
		.relay_chat(qid, &key("author@x"), AUTHOR_CONN, json!({"text": "hi"}))
		.await
		.expect("chat");
	assert!(delivered);
	match next_msg(&mut hrx).await {
		Msg::ChatReceived { question_id, payload } => {
			assert_eq!(question_id, qid);
			assert_eq!(payload["text"], "hi");
		}
		other => panic!("expected chat_received, got {other:?}"),
	}
	assert_quiet(&mut arx);

	fx.relay
		.relay_editor(qid, &key("helper@x"), HELPER_CONN, json!({"code": "let x = 1;"}))
		.await
		.expect("editor");
	match next_msg(&mut arx).await {
		Msg::Update { payload, .. } => assert_eq!(payload["code"], "let x = 1;"),
		other => panic!("expected update, got {other:?}"),
	}
	assert_quiet(&mut hrx);

	let err = fx
		.relay
		.relay_chat(qid, &key("author@x"), 77, json!({"text": "spoof"}))
		.await
		.expect_err("wrong connection");
	assert!(matches!(err, ServiceError::Unauthorized(_)));
	assert_quiet(&mut hrx);
}

#[tokio::test]
async fn end_request_is_author_only() {
	let fx = fixture().await;
	let (mut arx, mut hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	let err = fx
		.relay
		.end_request(qid, &key("helper@x"), HELPER_CONN, json!({}))
		.await
		.expect_err("helper cannot request an answer");
	assert!(matches!(err, ServiceError::Unauthorized(_)));
	assert_quiet(&mut arx);

	fx.relay
		.end_request(qid, &key("author@x"), AUTHOR_CONN, json!({"note": "wrap up"}))
		.await
		.expect("author end request");
	assert!(matches!(next_msg(&mut hrx).await, Msg::AskHelperForAnswer { question_id, .. } if question_id == qid));
}

#[tokio::test]
async fn disconnect_notifies_peer_and_last_leave_frees_scope() {
	let fx = fixture().await;
	let (mut arx, _hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	assert_eq!(fx.relay.disconnect(HELPER_CONN).await, 1);
	assert!(matches!(next_msg(&mut arx).await, Msg::UserLeft { question_id } if question_id == qid));
	assert_eq!(fx.relay.member_count(qid).await, 1);

	let delivered = fx
		.relay
		.relay_chat(qid, &key("author@x"), AUTHOR_CONN, json!({"text": "anyone?"}))
		.await
		.expect("chat with absent peer");
	assert!(!delivered);

	assert!(!fx.relay.leave(qid, &key("author@x"), 99).await, "wrong connection");
	assert!(fx.relay.leave(qid, &key("author@x"), AUTHOR_CONN).await);
	assert_eq!(fx.relay.scope_count().await, 0);
	assert_eq!(fx.relay.disconnect(AUTHOR_CONN).await, 0);
}

#[tokio::test]
async fn end_chat_archives_and_credits_helper_once() {
	let fx = fixture().await;
	let (_arx, mut hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	let report = fx
		.relay
		.end_chat(qid, &key("author@x"), AUTHOR_CONN, Some("  use Rc<RefCell<T>>  ".to_string()), 4)
		.await
		.expect("end chat");
	assert!(report.is_complete());
	let stats = report.helper_stats.expect("stats");
	assert_eq!(stats.helped, 1);
	assert_eq!(stats.stars, 4 + MatchingSettings::default().answer_reward);
	assert_eq!(stats.level, Level::Beginner);

	assert!(matches!(next_msg(&mut hrx).await, Msg::EndChat { question_id } if question_id == qid));

	let stored = fx.store.find_question_by_id(qid).await.expect("store ok").expect("question");
	assert_eq!(stored.state, QuestionState::Archived);
	assert_eq!(stored.answer.as_deref(), Some("use Rc<RefCell<T>>"));
	assert_eq!(fx.relay.scope_count().await, 0);

	let err = fx
		.relay
		.end_chat(qid, &key("helper@x"), HELPER_CONN, None, 5)
		.await
		.expect_err("second termination");
	assert!(matches!(err, ServiceError::InvalidState(_)), "got {err:?}");

	let helper = fx
		.store
		.find_user_by_contact_key(&key("helper@x"))
		.await
		.expect("store ok")
		.expect("helper");
	assert_eq!(helper.helper_stats.helped, 1, "stats are applied exactly once");

	let (h, _rx) = handle(5);
	let err = fx
		.relay
		.join(qid, &key("helper@x"), h, participant("Helper"))
		.await
		.expect_err("archived scope cannot be rejoined");
	assert!(matches!(err, ServiceError::InvalidState(_)));
}

#[tokio::test]
async fn blank_answer_earns_rating_only() {
	let fx = fixture().await;
	let (_arx, _hrx) = joined_pair(&fx).await;

	let report = fx
		.relay
		.end_chat(fx.question_id, &key("helper@x"), HELPER_CONN, Some("   ".to_string()), 3)
		.await
		.expect("end chat");
	assert_eq!(report.helper_stats.expect("stats").stars, 3);

	let stored = fx
		.store
		.find_question_by_id(fx.question_id)
		.await
		.expect("store ok")
		.expect("question");
	assert!(stored.answer.is_none());
}

#[tokio::test]
async fn end_chat_requires_membership() {
	let fx = fixture().await;

	let err = fx
		.relay
		.end_chat(fx.question_id, &key("author@x"), AUTHOR_CONN, None, 5)
		.await
		.expect_err("nobody joined");
	assert!(matches!(err, ServiceError::Unauthorized(_)), "got {err:?}");

	let err = fx
		.relay
		.end_chat(QuestionId::new_v4(), &key("author@x"), AUTHOR_CONN, None, 5)
		.await
		.expect_err("unknown question");
	assert!(matches!(err, ServiceError::NotFound(_)));
}

async fn helper_stats_of(fx: &Fixture, k: &str) -> pairhelp_domain::HelperStats {
	fx.store
		.find_user_by_contact_key(&key(k))
		.await
		.expect("store ok")
		.expect("user")
		.helper_stats
}

#[tokio::test]
async fn join_racing_termination_cannot_reopen_the_session() {
	let faulty = Arc::new(FaultyRecordStore::new());
	let fx = fixture_with(faulty.clone()).await;
	let (_arx, _hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	// The helper re-joins from a new connection; its read of the record stalls.
	let HeldRead { entered, release } = faulty.hold_next_read(qid).await;
	let relay = fx.relay.clone();
	let (late_handle, _late_rx) = handle(7);
	let late_join = tokio::spawn(async move {
		relay
			.join(qid, &key("helper@x"), late_handle, participant("Helper"))
			.await
	});
	timeout(Duration::from_secs(2), entered)
		.await
		.expect("join reached the store")
		.expect("hold signalled");

	let report = fx
		.relay
		.end_chat(qid, &key("author@x"), AUTHOR_CONN, Some("move the clone".to_string()), 5)
		.await
		.expect("end chat");
	assert!(report.is_complete());

	let _ = release.send(());
	let err = late_join
		.await
		.expect("join task")
		.expect_err("join with a stale record after termination");
	assert!(matches!(err, ServiceError::InvalidState(_)), "got {err:?}");
	assert_eq!(fx.relay.scope_count().await, 0);

	let err = fx
		.relay
		.end_chat(qid, &key("helper@x"), 7, None, 5)
		.await
		.expect_err("no second termination");
	assert!(matches!(err, ServiceError::InvalidState(_)), "got {err:?}");

	let stats = helper_stats_of(&fx, "helper@x").await;
	assert_eq!(stats.helped, 1);
	assert_eq!(stats.stars, 5 + MatchingSettings::default().answer_reward);
}

#[tokio::test]
async fn termination_of_an_already_archived_question_credits_nobody() {
	let fx = fixture().await;
	let (_arx, _hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	let mut question = fx.store.find_question_by_id(qid).await.expect("store ok").expect("question");
	question.state = QuestionState::Archived;
	fx.store.insert_or_update_question(&question).await.expect("archive");

	let err = fx
		.relay
		.end_chat(qid, &key("author@x"), AUTHOR_CONN, None, 5)
		.await
		.expect_err("already archived");
	assert!(matches!(err, ServiceError::InvalidState(_)), "got {err:?}");
	assert_eq!(helper_stats_of(&fx, "helper@x").await.helped, 0);
	assert_eq!(fx.relay.scope_count().await, 0);
}

#[tokio::test]
async fn failed_helper_update_keeps_the_archive() {
	let faulty = Arc::new(FaultyRecordStore::new());
	let fx = fixture_with(faulty.clone()).await;
	let (_arx, mut hrx) = joined_pair(&fx).await;
	let qid = fx.question_id;

	faulty.fail_user_writes(true);
	let report = fx
		.relay
		.end_chat(qid, &key("author@x"), AUTHOR_CONN, Some("use a scoped thread".to_string()), 5)
		.await
		.expect("end chat");
	assert!(!report.is_complete());
	assert!(report.archived.is_ok());
	assert!(matches!(report.helper_stats, Err(StoreError::Backend(_))), "got {:?}", report.helper_stats);
	assert!(matches!(next_msg(&mut hrx).await, Msg::EndChat { question_id } if question_id == qid));

	let stored = fx.store.find_question_by_id(qid).await.expect("store ok").expect("question");
	assert_eq!(stored.state, QuestionState::Archived);
	assert_eq!(stored.answer.as_deref(), Some("use a scoped thread"));
	assert_eq!(helper_stats_of(&fx, "helper@x").await.helped, 0);
}

#[tokio::test]
async fn missing_helper_record_still_archives() {
	let fx = fixture().await;
	let author = fx
		.store
		.find_user_by_contact_key(&key("author@x"))
		.await
		.expect("store ok")
		.expect("author");

	let draft = QuestionDraft {
		title: "pinning".to_string(),
		details: String::new(),
		code: String::new(),
		skill_tag: SkillTag::new("rust").expect("tag"),
	};
	let mut question = Question::open(&author, draft, 0);
	question.state = QuestionState::Matched;
	question.helper = Some(key("ghost@x"));
	fx.store.insert_or_update_question(&question).await.expect("insert");
	let qid = question.id;

	let (ah, _arx) = handle(AUTHOR_CONN);
	let (gh, _grx) = handle(HELPER_CONN);
	fx.relay.join(qid, &key("author@x"), ah, participant("Author")).await.expect("author joins");
	fx.relay.join(qid, &key("ghost@x"), gh, participant("Ghost")).await.expect("ghost joins");

	let report = fx
		.relay
		.end_chat(qid, &key("author@x"), AUTHOR_CONN, None, 4)
		.await
		.expect("end chat");
	assert!(report.archived.is_ok());
	assert!(matches!(report.helper_stats, Err(StoreError::NotFound)));

	let stored = fx.store.find_question_by_id(qid).await.expect("store ok").expect("question");
	assert_eq!(stored.state, QuestionState::Archived);
}
