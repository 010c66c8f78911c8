use bytes::BytesMut;
use pairhelp_domain::QuestionId;
use pairhelp_protocol::{
	DEFAULT_MAX_FRAME_SIZE, Envelope, FramingError, Msg, decode_frame, encode_frame, encode_frame_default,
	encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

fn chat(question_id: QuestionId, text: &str) -> Envelope {
	Envelope::event(Msg::ChatReceived {
		question_id,
		payload: serde_json::json!({ "text": text }),
	})
}

#[test]
fn encode_decode_envelope_slice() {
	let env = Envelope::request(
		"7",
		Msg::ChatEnded {
			question_id: QuestionId::new_v4().to_string(),
			answer: Some("use a BTreeMap".into()),
			rating: 4,
		},
	);

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, env);
}

#[test]
fn encode_frame_default_matches_explicit_default_limit() {
	let env = chat(QuestionId::new_v4(), "abc");

	let a = encode_frame_default(&env).expect("encode_frame_default");
	let b = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");

	assert_eq!(a, b);
}

#[test]
fn try_decode_from_buffer_incremental() {
	let env = chat(QuestionId::new_v4(), "hello");
	let frame = encode_frame_default(&env).expect("encode");

	let mut buf = BytesMut::new();

	buf.extend_from_slice(&frame[..2]);
	assert!(
		try_decode_frame_from_buffer::<Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[2..8]);
	assert!(
		try_decode_frame_from_buffer::<Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[8..]);
	let decoded = try_decode_frame_from_buffer::<Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");

	assert_eq!(decoded, env);
	assert!(buf.is_empty());
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let q = QuestionId::new_v4();
	let first = chat(q, "one");
	let second = Envelope::event(Msg::UserLeft { question_id: q });

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &first, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into first");
	encode_frame_into(&mut buf, &second, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into second");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (d1, used1) = decode_frame::<Envelope>(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode first");
	assert_eq!(d1, first);

	let (d2, used2) = decode_frame::<Envelope>(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode second");
	assert_eq!(d2, second);

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn frame_len_helper_is_correct() {
	let env = chat(QuestionId::new_v4(), "hello");

	let payload_len = serde_json::to_vec(&env).expect("json").len();
	let frame = encode_frame_default(&env).expect("encode");

	assert_eq!(frame_len_from_payload_len(payload_len), frame.len());
}

#[test]
fn decode_rejects_too_large_prefix() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_decode_frame_from_buffer::<Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn unknown_message_type_is_a_decode_error() {
	let body = br#"{"version":1,"request_id":"1","msg":{"type":"subscribe","data":{}}}"#;
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
	buf.extend_from_slice(body);

	let err = try_decode_frame_from_buffer::<Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, FramingError::Decode(_)));
	assert!(buf.is_empty());
}

proptest! {
	#[test]
	fn arbitrary_chunking_yields_every_frame(texts in prop::collection::vec(".{0,40}", 1..6), cut in 1usize..17) {
		let q = QuestionId::new_v4();
		let envs: Vec<Envelope> = texts.iter().map(|t| chat(q, t)).collect();

		let mut wire = BytesMut::new();
		for env in &envs {
			encode_frame_into(&mut wire, env, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		}

		let mut buf = BytesMut::new();
		let mut out = Vec::new();
		for chunk in wire.chunks(cut) {
			buf.extend_from_slice(chunk);
			while let Some(env) = try_decode_frame_from_buffer::<Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				out.push(env);
			}
		}

		prop_assert_eq!(out, envs);
		prop_assert!(buf.is_empty());
	}
}
