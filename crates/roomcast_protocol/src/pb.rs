//! Wire messages (`roomcast.v1`).
//!
//! Declared with prost derives; field tags are part of the wire contract and must not be reused.

/// Client -> server envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientEnvelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	/// Echoed back on the matching `Ack`/`Error`.
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(
		oneof = "client_envelope::Event",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34"
	)]
	pub event: Option<client_envelope::Event>,
}

pub mod client_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		Join(super::Join),
		#[prost(message, tag = "11")]
		Leave(super::Leave),
		#[prost(message, tag = "12")]
		Chat(super::Chat),
		#[prost(message, tag = "13")]
		PrivateMessage(super::SendPrivateMessage),
		#[prost(message, tag = "14")]
		ChangeHandle(super::ChangeHandle),
		#[prost(message, tag = "15")]
		ChangeColor(super::ChangeColor),
		#[prost(message, tag = "16")]
		SetTopic(super::SetTopic),
		#[prost(message, tag = "17")]
		SetBroadcasting(super::SetBroadcasting),
		#[prost(message, tag = "18")]
		Kick(super::Kick),
		#[prost(message, tag = "19")]
		Ban(super::Ban),
		#[prost(message, tag = "20")]
		Unban(super::Unban),
		#[prost(message, tag = "21")]
		Silence(super::Silence),
		#[prost(message, tag = "22")]
		PlayMedia(super::PlayMedia),
		#[prost(message, tag = "23")]
		Report(super::FileReport),
		#[prost(message, tag = "24")]
		AssignRole(super::AssignRole),
		#[prost(message, tag = "25")]
		UnassignRole(super::UnassignRole),
		#[prost(message, tag = "26")]
		CreateRole(super::CreateRole),
		#[prost(message, tag = "27")]
		SiteBan(super::SiteBan),
		#[prost(message, tag = "28")]
		CloseRoom(super::CloseRoom),
		#[prost(message, tag = "29")]
		ResolveReport(super::ResolveReport),
		#[prost(message, tag = "30")]
		ClaimRoom(super::ClaimRoom),
		#[prost(message, tag = "31")]
		SetPassword(super::SetPassword),
		#[prost(message, tag = "32")]
		UpdateRole(super::UpdateRole),
		#[prost(message, tag = "33")]
		DeleteRole(super::DeleteRole),
		#[prost(message, tag = "34")]
		RegisterPush(super::RegisterPush),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub handle: String,
	#[prost(string, tag = "3")]
	pub color: String,
	#[prost(string, tag = "4")]
	pub password: String,
	/// Client-held session id; identifies anonymous participants together with the ip.
	#[prost(string, tag = "5")]
	pub session_id: String,
	/// Signed account token (`v1.<payload>.<sig>`), empty for anonymous joins.
	#[prost(string, tag = "6")]
	pub auth_token: String,
	/// Previous connection id, for grace-period resume.
	#[prost(string, tag = "7")]
	pub resume_connection_id: String,
	#[prost(string, tag = "8")]
	pub list_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Leave {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Chat {
	#[prost(string, tag = "1")]
	pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendPrivateMessage {
	#[prost(string, tag = "1")]
	pub to_connection_id: String,
	#[prost(string, tag = "2")]
	pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeHandle {
	#[prost(string, tag = "1")]
	pub handle: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangeColor {
	#[prost(string, tag = "1")]
	pub color: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTopic {
	#[prost(string, tag = "1")]
	pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetBroadcasting {
	#[prost(bool, tag = "1")]
	pub broadcasting: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Kick {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ban {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
	#[prost(string, tag = "2")]
	pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Unban {
	#[prost(string, tag = "1")]
	pub ban_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Silence {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
	#[prost(bool, tag = "2")]
	pub silenced: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlayMedia {
	#[prost(string, tag = "1")]
	pub url: String,
	#[prost(string, tag = "2")]
	pub title: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileReport {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
	#[prost(string, tag = "2")]
	pub reason: String,
	#[prost(message, repeated, tag = "3")]
	pub chat_context: Vec<ChatLine>,
	/// Optional screenshot bytes.
	#[prost(bytes = "vec", tag = "4")]
	pub evidence: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatLine {
	#[prost(string, tag = "1")]
	pub handle: String,
	#[prost(string, tag = "2")]
	pub text: String,
	#[prost(int64, tag = "3")]
	pub at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignRole {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
	#[prost(string, tag = "2")]
	pub role_tag: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnassignRole {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
	#[prost(string, tag = "2")]
	pub role_tag: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateRole {
	#[prost(string, tag = "1")]
	pub name: String,
	#[prost(string, repeated, tag = "2")]
	pub capabilities: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SiteBan {
	#[prost(string, tag = "1")]
	pub target_connection_id: String,
	#[prost(bool, tag = "2")]
	pub restrict_broadcast: bool,
	#[prost(bool, tag = "3")]
	pub restrict_join: bool,
	/// 0 selects the configured default.
	#[prost(uint32, tag = "4")]
	pub duration_hours: u32,
	#[prost(string, tag = "5")]
	pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseRoom {
	#[prost(string, tag = "1")]
	pub reason: String,
	/// 0 selects the configured default.
	#[prost(uint32, tag = "2")]
	pub duration_hours: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResolveReport {
	#[prost(string, tag = "1")]
	pub report_id: String,
	/// `dismissed`, `warned`, `kicked`, `banned` or `room_closed`.
	#[prost(string, tag = "2")]
	pub outcome: String,
}

/// Take ownership of the current room. Needs a signed-in account.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClaimRoom {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetPassword {
	/// Empty removes the password.
	#[prost(string, tag = "1")]
	pub password: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRole {
	#[prost(string, tag = "1")]
	pub role_tag: String,
	/// Empty keeps the current name.
	#[prost(string, tag = "2")]
	pub name: String,
	#[prost(string, repeated, tag = "3")]
	pub capabilities: Vec<String>,
	/// Replace the permission map with `capabilities`; otherwise it is left alone.
	#[prost(bool, tag = "4")]
	pub set_capabilities: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRole {
	#[prost(string, tag = "1")]
	pub role_tag: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterPush {
	#[prost(string, tag = "1")]
	pub endpoint: String,
	#[prost(string, tag = "2")]
	pub p256dh: String,
	#[prost(string, tag = "3")]
	pub auth: String,
}

/// Server -> client envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerEnvelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,
	#[prost(string, tag = "2")]
	pub request_id: String,
	#[prost(int64, tag = "3")]
	pub server_time_unix_ms: i64,
	#[prost(
		oneof = "server_envelope::Event",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24"
	)]
	pub event: Option<server_envelope::Event>,
}

pub mod server_envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Event {
		#[prost(message, tag = "10")]
		Ack(super::Ack),
		#[prost(message, tag = "11")]
		Error(super::Error),
		#[prost(message, tag = "12")]
		Joined(super::Joined),
		#[prost(message, tag = "13")]
		ParticipantJoined(super::ParticipantJoined),
		#[prost(message, tag = "14")]
		ParticipantLeft(super::ParticipantLeft),
		#[prost(message, tag = "15")]
		ParticipantUpdated(super::ParticipantUpdated),
		#[prost(message, tag = "16")]
		ChatMessage(super::ChatMessage),
		#[prost(message, tag = "17")]
		PrivateMessage(super::PrivateMessage),
		#[prost(message, tag = "18")]
		TopicChanged(super::TopicChanged),
		#[prost(message, tag = "19")]
		ForcedBan(super::ForcedBan),
		#[prost(message, tag = "20")]
		StopBroadcasting(super::StopBroadcasting),
		#[prost(message, tag = "21")]
		Kicked(super::Kicked),
		#[prost(message, tag = "22")]
		RoomClosed(super::RoomClosed),
		#[prost(message, tag = "23")]
		MediaQueued(super::MediaQueued),
		#[prost(message, tag = "24")]
		BroadcastSession(super::BroadcastSession),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
	#[prost(string, tag = "1")]
	pub detail: String,
	/// Id of the record the request created, if any (role tag, ban id, report id).
	#[prost(string, tag = "2")]
	pub created_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
	/// Set for `FLOOD` and `LIMIT`.
	#[prost(uint64, tag = "3")]
	pub retry_after_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Participant {
	#[prost(string, tag = "1")]
	pub connection_id: String,
	#[prost(string, tag = "2")]
	pub handle: String,
	#[prost(string, tag = "3")]
	pub color: String,
	#[prost(bool, tag = "4")]
	pub broadcasting: bool,
	#[prost(bool, tag = "5")]
	pub silenced: bool,
	#[prost(string, repeated, tag = "6")]
	pub roles: Vec<String>,
	#[prost(bool, tag = "7")]
	pub is_admin: bool,
	#[prost(bool, tag = "8")]
	pub is_site_mod: bool,
	#[prost(bool, tag = "9")]
	pub has_account: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Joined {
	#[prost(string, tag = "1")]
	pub room: String,
	#[prost(string, tag = "2")]
	pub connection_id: String,
	#[prost(message, repeated, tag = "3")]
	pub participants: Vec<Participant>,
	#[prost(string, tag = "4")]
	pub topic: String,
	/// Capabilities the joining participant holds.
	#[prost(string, repeated, tag = "5")]
	pub capabilities: Vec<String>,
	#[prost(string, tag = "6")]
	pub relay_node_id: String,
	#[prost(string, tag = "7")]
	pub relay_room_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantJoined {
	#[prost(message, optional, tag = "1")]
	pub participant: Option<Participant>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantLeft {
	#[prost(string, tag = "1")]
	pub connection_id: String,
	#[prost(string, tag = "2")]
	pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantUpdated {
	#[prost(message, optional, tag = "1")]
	pub participant: Option<Participant>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub from_connection_id: String,
	#[prost(string, tag = "2")]
	pub handle: String,
	#[prost(string, tag = "3")]
	pub color: String,
	#[prost(string, tag = "4")]
	pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrivateMessage {
	#[prost(string, tag = "1")]
	pub from_connection_id: String,
	#[prost(string, tag = "2")]
	pub handle: String,
	#[prost(string, tag = "3")]
	pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicChanged {
	#[prost(string, tag = "1")]
	pub text: String,
	#[prost(string, tag = "2")]
	pub updated_by: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ForcedBan {
	#[prost(string, tag = "1")]
	pub reason: String,
	#[prost(bool, tag = "2")]
	pub restrict_join: bool,
	#[prost(bool, tag = "3")]
	pub restrict_broadcast: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopBroadcasting {
	#[prost(string, tag = "1")]
	pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Kicked {
	#[prost(string, tag = "1")]
	pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RoomClosed {
	#[prost(string, tag = "1")]
	pub reason: String,
	#[prost(int64, tag = "2")]
	pub expires_at_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaQueued {
	#[prost(string, tag = "1")]
	pub url: String,
	#[prost(string, tag = "2")]
	pub title: String,
	#[prost(string, tag = "3")]
	pub added_by: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastSession {
	#[prost(string, tag = "1")]
	pub relay_node_id: String,
	#[prost(string, tag = "2")]
	pub relay_room_id: String,
	#[prost(string, tag = "3")]
	pub relay_session_id: String,
}
