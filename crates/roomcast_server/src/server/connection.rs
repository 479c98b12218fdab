#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chrono::{DateTime, Utc};
use roomcast_domain::{Capability, ChatLine, ConnectionId, Identity, ReportOutcome, Restrictions, RoomName, UserId};
use roomcast_protocol::pb::client_envelope::Event as ClientEvent;
use roomcast_protocol::pb::server_envelope::Event;
use roomcast_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, PROTOCOL_VERSION, encode_frame, pb};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SecretString;
use crate::server::auth::verify_hmac_token;
use crate::server::engine::Engine;
use crate::server::errors::{EngineError, EngineResult};
use crate::server::hub::{HubItem, HubSubscription};
use crate::server::presence::{JoinOutcome, JoinRequest, wire_participant};
use crate::server::session_cache::PushSubscription;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	pub inbound_channel_capacity: usize,

	pub auth_hmac_secret: Option<SecretString>,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			inbound_channel_capacity: 256,
			auth_hmac_secret: None,
		}
	}
}

/// What the dispatcher knows about the connection a request came in on.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
	pub conn: ConnectionId,
	pub ip: String,
	pub auth_hmac_secret: Option<SecretString>,
}

pub async fn handle_connection(
	conn_id: ConnectionId,
	connection: quinn::Connection,
	engine: Arc<Engine>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("roomcast_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("roomcast_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<pb::ClientEnvelope>(settings.inbound_channel_capacity);
	let max_frame = settings.max_frame_bytes;
	let reader_task = tokio::spawn(async move {
		let mut decoder = FrameDecoder::new(max_frame);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};
			metrics::counter!("roomcast_server_control_bytes_in_total").increment(n as u64);
			decoder.extend(&tmp[..n]);

			loop {
				match decoder.next_message::<pb::ClientEnvelope>() {
					Ok(Some(msg)) => {
						metrics::counter!("roomcast_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(msg).await.is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("roomcast_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let ctx = ConnectionContext {
		conn: conn_id,
		ip: connection.remote_address().ip().to_string(),
		auth_hmac_secret: settings.auth_hmac_secret.clone(),
	};
	let HubSubscription { mut events, mut close } = engine.hub.register(&ctx.conn).await;
	info!(conn_id = %ctx.conn, remote = %connection.remote_address(), "control stream open");

	let mut keepalive = tokio::time::interval(keepalive_period(engine.sessions.settings().connected_ttl));
	keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	let result: anyhow::Result<()> = loop {
		tokio::select! {
			biased;

			reason = &mut close => {
				while let Ok(item) = events.try_recv() {
					if forward_hub_item(&mut control_send, &ctx.conn, item).await.is_err() {
						break;
					}
				}
				let reason = reason.unwrap_or_else(|_| "closed".to_string());
				info!(conn_id = %ctx.conn, reason = %reason, "closing connection at server request");
				let _ = control_send.finish();
				connection.close(0u32.into(), reason.as_bytes());
				break Ok(());
			}

			item = events.recv() => {
				let Some(item) = item else {
					break Ok(());
				};
				if let Err(e) = forward_hub_item(&mut control_send, &ctx.conn, item).await {
					break Err(e);
				}
			}

			_ = keepalive.tick() => {
				if let Err(err) = engine.presence.keep_alive(&ctx.conn).await {
					warn!(conn_id = %ctx.conn, error = %err, "session keepalive failed");
				}
			}

			msg = ctrl_rx.recv() => {
				let Some(env) = msg else {
					break Ok(());
				};
				let reply = handle_envelope(&engine, &ctx, env).await;
				if let Err(e) = send_envelope(&mut control_send, reply).await {
					break Err(e);
				}
			}
		}
	};

	reader_task.abort();
	if let Err(err) = engine.presence.leave(&ctx.conn, "disconnected").await {
		warn!(conn_id = %ctx.conn, error = %err, "leave on disconnect failed");
	}
	engine.hub.unregister(&ctx.conn).await;
	debug!(conn_id = %ctx.conn, "connection closed");

	result
}

/// How often a live connection refreshes its session: three times per connected TTL.
pub fn keepalive_period(connected_ttl: Duration) -> Duration {
	(connected_ttl / 3).max(Duration::from_secs(1))
}

async fn forward_hub_item(send: &mut quinn::SendStream, conn: &ConnectionId, item: HubItem) -> anyhow::Result<()> {
	match item {
		HubItem::Event(event) => send_envelope(send, envelope(String::new(), *event)).await,
		HubItem::Lagged { dropped } => {
			warn!(conn_id = %conn, dropped, "outbound queue overflowed, events dropped");
			metrics::counter!("roomcast_server_lagged_total").increment(dropped);
			Ok(())
		}
	}
}

fn envelope(request_id: String, event: Event) -> pb::ServerEnvelope {
	pb::ServerEnvelope {
		version: PROTOCOL_VERSION,
		request_id,
		server_time_unix_ms: unix_ms_now(),
		event: Some(event),
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::ServerEnvelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("roomcast_server_envelopes_out_total").increment(1);
	metrics::counter!("roomcast_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

/// Run one client request and build the reply envelope, echoing its request id.
pub async fn handle_envelope(engine: &Engine, ctx: &ConnectionContext, env: pb::ClientEnvelope) -> pb::ServerEnvelope {
	if env.version != PROTOCOL_VERSION {
		return envelope(
			env.request_id,
			Event::Error(pb::Error {
				code: "UNSUPPORTED_VERSION".to_string(),
				message: format!("protocol version {} is not supported", env.version),
				retry_after_ms: 0,
			}),
		);
	}

	let reply = match env.event {
		Some(event) => dispatch(engine, ctx, event).await,
		None => Err(EngineError::validation("empty request")),
	};

	let event = reply.unwrap_or_else(|err| {
		if matches!(err, EngineError::Internal(_)) {
			warn!(conn_id = %ctx.conn, error = ?err, "request failed");
		} else {
			debug!(conn_id = %ctx.conn, code = err.code(), error = %err, "request rejected");
		}
		error_event(&err)
	});
	envelope(env.request_id, event)
}

pub fn error_event(err: &EngineError) -> Event {
	Event::Error(pb::Error {
		code: err.code().to_string(),
		message: err.to_string(),
		retry_after_ms: err.retry_after().map_or(0, |d| d.as_millis() as u64),
	})
}

fn ack(detail: &str, created_id: impl Into<String>) -> Event {
	Event::Ack(pb::Ack {
		detail: detail.to_string(),
		created_id: created_id.into(),
	})
}

fn target(id: &str) -> EngineResult<ConnectionId> {
	Ok(ConnectionId::new(id.trim())?)
}

fn parse_uuid(id: &str, what: &str) -> EngineResult<Uuid> {
	Uuid::parse_str(id.trim()).map_err(|_| EngineError::validation(format!("invalid {what} id")))
}

fn parse_capabilities(names: &[String]) -> EngineResult<Vec<Capability>> {
	Ok(names
		.iter()
		.map(|s| Capability::from_str(s.trim()))
		.collect::<Result<Vec<_>, _>>()?)
}

fn hours(n: u32) -> Option<u32> {
	(n > 0).then_some(n)
}

fn non_empty(s: String) -> Option<String> {
	let s = s.trim();
	(!s.is_empty()).then(|| s.to_string())
}

fn joined_event(outcome: &JoinOutcome) -> Event {
	let room = &outcome.room;
	Event::Joined(pb::Joined {
		room: room.name.to_string(),
		connection_id: outcome.participant.connection_id.to_string(),
		participants: room.participants.iter().map(wire_participant).collect(),
		topic: room.settings.topic.as_ref().map(|t| t.text.clone()).unwrap_or_default(),
		capabilities: outcome.permissions.granted().map(str::to_string).collect(),
		relay_node_id: room.relay.as_ref().map(|r| r.node_id.clone()).unwrap_or_default(),
		relay_room_id: room.relay.as_ref().map(|r| r.relay_room_id.clone()).unwrap_or_default(),
	})
}

async fn join(engine: &Engine, ctx: &ConnectionContext, j: pb::Join) -> EngineResult<Event> {
	let room = RoomName::new(j.room)?;
	let session_id = non_empty(j.session_id).unwrap_or_else(|| ctx.conn.to_string());

	let mut identity = Identity::anonymous(ctx.ip.clone(), session_id);
	let (mut is_admin, mut is_site_mod) = (false, false);
	if !j.auth_token.trim().is_empty() {
		let secret = ctx
			.auth_hmac_secret
			.as_ref()
			.ok_or_else(|| EngineError::validation("account sign-in is not enabled on this server"))?;
		let claims = verify_hmac_token(j.auth_token.trim(), secret.expose()).map_err(|e| {
			debug!(conn_id = %ctx.conn, error = %e, "account token rejected");
			EngineError::validation("invalid or expired account token")
		})?;
		identity.user_id = Some(UserId::new(claims.sub)?);
		is_admin = claims.admin;
		is_site_mod = claims.site_mod;
	}

	let resume_from = non_empty(j.resume_connection_id).map(ConnectionId::new).transpose()?;

	let outcome = engine
		.presence
		.join(JoinRequest {
			room,
			conn: ctx.conn.clone(),
			identity,
			handle: j.handle,
			color: j.color,
			password: non_empty(j.password),
			list_id: non_empty(j.list_id),
			is_admin,
			is_site_mod,
			resume_from,
		})
		.await?;
	Ok(joined_event(&outcome))
}

/// Map one client event onto the engine.
pub async fn dispatch(engine: &Engine, ctx: &ConnectionContext, event: ClientEvent) -> EngineResult<Event> {
	let conn = &ctx.conn;
	match event {
		ClientEvent::Join(j) => join(engine, ctx, j).await,
		ClientEvent::Leave(_) => {
			engine.presence.leave(conn, "left").await?;
			Ok(ack("left", ""))
		}
		ClientEvent::Chat(c) => {
			engine.presence.chat(conn, &c.text).await?;
			Ok(ack("sent", ""))
		}
		ClientEvent::PrivateMessage(m) => {
			engine
				.presence
				.private_message(conn, &target(&m.to_connection_id)?, &m.text)
				.await?;
			Ok(ack("sent", ""))
		}
		ClientEvent::ChangeHandle(h) => {
			engine.presence.change_handle(conn, &h.handle).await?;
			Ok(ack("handle changed", ""))
		}
		ClientEvent::ChangeColor(c) => {
			engine.presence.change_color(conn, &c.color).await?;
			Ok(ack("color changed", ""))
		}
		ClientEvent::SetTopic(t) => {
			let changed = engine.presence.set_topic(conn, &t.text).await?;
			Ok(ack(if changed { "topic changed" } else { "topic unchanged" }, ""))
		}
		ClientEvent::SetBroadcasting(b) => {
			engine.presence.set_broadcasting(conn, b.broadcasting).await?;
			Ok(ack(if b.broadcasting { "broadcasting" } else { "stopped broadcasting" }, ""))
		}
		ClientEvent::Kick(k) => {
			engine.presence.kick(conn, &target(&k.target_connection_id)?).await?;
			Ok(ack("kicked", ""))
		}
		ClientEvent::Ban(b) => {
			let entry = engine
				.moderation
				.ban(conn, &target(&b.target_connection_id)?, &b.reason)
				.await?;
			Ok(ack("banned", entry.id.to_string()))
		}
		ClientEvent::Unban(u) => {
			engine.moderation.unban(conn, parse_uuid(&u.ban_id, "ban")?).await?;
			Ok(ack("unbanned", ""))
		}
		ClientEvent::Silence(s) => {
			engine
				.moderation
				.silence(conn, &target(&s.target_connection_id)?, s.silenced)
				.await?;
			Ok(ack(if s.silenced { "silenced" } else { "unsilenced" }, ""))
		}
		ClientEvent::PlayMedia(m) => {
			let title = non_empty(m.title);
			let item = engine.presence.play_media(conn, &m.url, title.as_deref()).await?;
			Ok(ack("queued", item.id.to_string()))
		}
		ClientEvent::Report(r) => {
			let chat_context = r
				.chat_context
				.into_iter()
				.map(|line| ChatLine {
					handle: line.handle,
					text: line.text,
					at: DateTime::from_timestamp_millis(line.at_unix_ms).unwrap_or_else(Utc::now),
				})
				.collect();
			let evidence = (!r.evidence.is_empty()).then_some(r.evidence);
			let report = engine
				.reports
				.file_report(conn, &target(&r.target_connection_id)?, &r.reason, chat_context, evidence)
				.await?;
			Ok(ack("reported", report.id.to_string()))
		}
		ClientEvent::AssignRole(a) => {
			engine
				.presence
				.assign_role(conn, &target(&a.target_connection_id)?, a.role_tag.trim())
				.await?;
			Ok(ack("role assigned", ""))
		}
		ClientEvent::UnassignRole(a) => {
			engine
				.presence
				.unassign_role(conn, &target(&a.target_connection_id)?, a.role_tag.trim())
				.await?;
			Ok(ack("role unassigned", ""))
		}
		ClientEvent::CreateRole(c) => {
			let capabilities = parse_capabilities(&c.capabilities)?;
			let role = engine.presence.create_role(conn, &c.name, &capabilities).await?;
			Ok(ack("role created", role.tag.to_string()))
		}
		ClientEvent::SiteBan(b) => {
			let ban = engine
				.moderation
				.site_ban_participant(
					conn,
					&target(&b.target_connection_id)?,
					Restrictions {
						broadcast: b.restrict_broadcast,
						join: b.restrict_join,
					},
					hours(b.duration_hours),
					non_empty(b.reason),
				)
				.await?;
			Ok(ack("site ban applied", ban.id.to_string()))
		}
		ClientEvent::CloseRoom(c) => {
			let closure = engine
				.moderation
				.close_current_room(conn, &c.reason, hours(c.duration_hours))
				.await?;
			Ok(ack("room closed", closure.id.to_string()))
		}
		ClientEvent::ResolveReport(r) => {
			let outcome = ReportOutcome::from_str(&r.outcome)?;
			let report = engine
				.reports
				.resolve(conn, parse_uuid(&r.report_id, "report")?, outcome)
				.await?;
			Ok(ack("report resolved", report.id.to_string()))
		}
		ClientEvent::ClaimRoom(_) => {
			let room = engine.presence.claim_current_room(conn).await?;
			Ok(ack("room claimed", room.name.to_string()))
		}
		ClientEvent::SetPassword(p) => {
			let password = non_empty(p.password);
			engine.presence.set_password(conn, password.as_deref()).await?;
			Ok(ack(if password.is_some() { "password set" } else { "password removed" }, ""))
		}
		ClientEvent::UpdateRole(u) => {
			let capabilities = if u.set_capabilities {
				Some(parse_capabilities(&u.capabilities)?)
			} else {
				None
			};
			let name = non_empty(u.name);
			let role = engine
				.presence
				.update_role(conn, u.role_tag.trim(), name.as_deref(), capabilities.as_deref())
				.await?;
			Ok(ack("role updated", role.tag.to_string()))
		}
		ClientEvent::DeleteRole(d) => {
			engine.presence.delete_role(conn, d.role_tag.trim()).await?;
			Ok(ack("role deleted", ""))
		}
		ClientEvent::RegisterPush(r) => {
			engine
				.presence
				.register_push(
					conn,
					PushSubscription {
						endpoint: r.endpoint.trim().to_string(),
						p256dh: r.p256dh,
						auth: r.auth,
					},
				)
				.await?;
			Ok(ack("push registered", ""))
		}
	}
}
