#![forbid(unsafe_code)]

pub mod framing;
pub mod messages;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};
pub use messages::{
	ArchivedQuestion, Envelope, InvitationOutcome, MalformedEnvelope, Msg, QuestionSummary, SearchStatus, UserProfile,
	codes,
};

/// ALPN identifier negotiated on the QUIC handshake.
pub const ALPN: &[u8] = b"pairhelp-v1";

/// Protocol version constants.
pub mod version {
	/// Protocol major version carried in every envelope. Envelopes with any
	/// other value are rejected.
	pub const PROTOCOL_MAJOR: u32 = 1;
}
