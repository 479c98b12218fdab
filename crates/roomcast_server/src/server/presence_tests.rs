#![forbid(unsafe_code)]

use std::time::Duration;

use roomcast_domain::Capability;
use roomcast_protocol::pb::server_envelope::Event;

use crate::server::engine::EngineSettings;
use crate::server::errors::EngineError;
use crate::server::flood::WindowLimit;
use crate::server::session_cache::SessionLookup;
use crate::server::store::{DocumentStore, Page};
use crate::server::testkit::{Harness, conn, harness, harness_with, nodes, room, user};

async fn owned_room(h: &Harness, name: &str, owner: &str) {
	h.engine.presence.claim_room(&room(name), &user(owner)).await.unwrap();
}

#[tokio::test]
async fn owner_delegates_kick_to_a_custom_role() {
	let h = harness();
	owned_room(&h, "foo", "alice").await;

	let alice = h.user_client("alice-conn", "alice").await;
	let mut bob = h.anon_client("bob-conn").await;
	let mut carol = h.anon_client("carol-conn").await;
	h.join(&alice, "foo", "alice").await.unwrap();
	h.join(&bob, "foo", "bob").await.unwrap();
	h.join(&carol, "foo", "carol").await.unwrap();

	// Nobody but the owner can kick yet.
	let err = h.engine.presence.kick(&bob.conn, &carol.conn).await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));

	let role = h
		.engine
		.presence
		.create_role(&alice.conn, "Bouncer", &[Capability::Kick])
		.await
		.unwrap();
	assert_eq!(role.tag.as_str(), "bouncer");

	let updated = h.engine.presence.assign_role(&alice.conn, &bob.conn, "bouncer").await.unwrap();
	assert_eq!(updated.roles, vec!["bouncer".to_string()]);
	bob.drain();

	h.engine.presence.kick(&bob.conn, &carol.conn).await.unwrap();

	let events = carol.drain();
	assert!(events.iter().any(|e| matches!(e, Event::Kicked(k) if k.reason == "kicked by bob")));
	assert_eq!(carol.closed_with().as_deref(), Some("kicked"));

	assert!(bob.drain().iter().any(
		|e| matches!(e, Event::ParticipantLeft(l) if l.connection_id == "carol-conn" && l.reason == "kicked")
	));
	assert_eq!(h.participants("foo").await, vec!["alice", "bob"]);

	let activity = h.docs.activity(Page::default()).await.unwrap();
	assert!(activity.iter().any(|a| a.action == "kick"));
}

#[tokio::test]
async fn kicked_session_cannot_be_resumed() {
	let h = harness();
	owned_room(&h, "foo", "alice").await;
	let alice = h.user_client("alice-conn", "alice").await;
	let carol = h.anon_client("carol-conn").await;
	h.join(&alice, "foo", "alice").await.unwrap();
	h.join(&carol, "foo", "carol").await.unwrap();

	h.engine.presence.kick(&alice.conn, &carol.conn).await.unwrap();

	let again = h.client("carol-2", carol.identity.clone()).await;
	let mut req = h.request(&again, "foo", "newname");
	req.resume_from = Some(carol.conn.clone());
	let outcome = h.engine.presence.join(req).await.unwrap();
	assert!(!outcome.resumed);
	assert_eq!(outcome.participant.handle, "newname");
}

#[tokio::test]
async fn last_leave_deletes_an_ownerless_room_and_its_relay() {
	let h = harness();
	let mut a = h.anon_client("a").await;
	let b = h.anon_client("b").await;

	let joined = h.join(&a, "tmp", "sam").await.unwrap();
	let relay = joined.room.relay.clone().expect("relay attached on first join");
	h.join(&b, "tmp", "kim").await.unwrap();

	h.engine.presence.leave(&b.conn, "disconnected").await.unwrap();
	assert!(a.drain().iter().any(|e| matches!(e, Event::ParticipantLeft(l) if l.connection_id == "b")));
	assert!(h.engine.rooms.find(&room("tmp")).await.unwrap().is_some());

	h.engine.presence.leave(&a.conn, "disconnected").await.unwrap();
	assert!(h.engine.rooms.find(&room("tmp")).await.unwrap().is_none());

	let destroy = format!("destroy_room {} {}", relay.node_id, relay.relay_room_id);
	assert!(h.relay.calls().contains(&destroy), "calls: {:?}", h.relay.calls());
}

#[tokio::test]
async fn owned_room_survives_empty_but_releases_relay() {
	let h = harness();
	owned_room(&h, "home", "alice").await;
	let alice = h.user_client("alice-conn", "alice").await;

	let joined = h.join(&alice, "home", "alice").await.unwrap();
	assert!(joined.room.relay.is_some());
	assert!(joined.permissions.allows(Capability::ManageRoles));

	h.engine.presence.leave(&alice.conn, "disconnected").await.unwrap();

	let stored = h.engine.rooms.load(&room("home")).await.unwrap();
	assert!(stored.participants.is_empty());
	assert_eq!(stored.owner, Some(user("alice")));
	assert!(stored.relay.is_none());
	assert!(h.relay.calls().iter().any(|c| c.starts_with("destroy_room")));

	// Next join attaches a fresh relay room.
	let again = h.join(&alice, "home", "alice").await.unwrap();
	assert!(again.room.relay.is_some());
}

#[tokio::test]
async fn rooms_work_without_relay_nodes() {
	let h = harness_with(EngineSettings::default());
	let a = h.anon_client("a").await;

	let joined = h.join(&a, "quiet", "sam").await.unwrap();
	assert!(joined.room.relay.is_none());

	let p = h.engine.presence.set_broadcasting(&a.conn, true).await.unwrap();
	assert!(p.broadcasting);
	assert!(h.relay.calls().is_empty());
}

#[tokio::test]
async fn handles_are_unique_ignoring_case() {
	let h = harness();
	let a = h.anon_client("a").await;
	let b = h.anon_client("b").await;

	h.join(&a, "foo", "Sam").await.unwrap();
	let err = h.join(&b, "foo", "sAM").await.unwrap_err();
	assert!(matches!(err, EngineError::Validation(ref m) if m.contains("taken")));

	h.join(&b, "foo", "kim").await.unwrap();
	let err = h.engine.presence.change_handle(&b.conn, "SAM").await.unwrap_err();
	assert!(matches!(err, EngineError::Validation(_)));

	let renamed = h.engine.presence.change_handle(&b.conn, "kimmy").await.unwrap();
	assert_eq!(renamed.handle, "kimmy");
	assert_eq!(h.participants("foo").await, vec!["Sam", "kimmy"]);
}

#[tokio::test]
async fn password_protected_rooms() {
	let h = harness();
	owned_room(&h, "vault", "alice").await;
	let alice = h.user_client("alice-conn", "alice").await;
	let b = h.anon_client("b").await;

	h.join(&alice, "vault", "alice").await.unwrap();
	h.engine.presence.set_password(&alice.conn, Some("hunter2")).await.unwrap();

	let err = h.join(&b, "vault", "bob").await.unwrap_err();
	assert!(matches!(err, EngineError::Validation(ref m) if m.contains("password")));

	let mut req = h.request(&b, "vault", "bob");
	req.password = Some("wrong".to_string());
	assert!(h.engine.presence.join(req.clone()).await.is_err());

	req.password = Some("hunter2".to_string());
	h.engine.presence.join(req).await.unwrap();
	assert_eq!(h.participants("vault").await, vec!["alice", "bob"]);

	// Anyone else lacks roomDetails.
	let err = h.engine.presence.set_password(&b.conn, None).await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));
}

#[tokio::test]
async fn chat_flood_is_rejected_past_the_limit() {
	let h = harness_with(EngineSettings {
		relay_nodes: nodes(),
		flood: WindowLimit {
			limit: 3,
			window: Duration::from_secs(5),
			cooldown: Duration::from_secs(60),
		},
		..EngineSettings::default()
	});
	let mut a = h.anon_client("a").await;
	h.join(&a, "foo", "sam").await.unwrap();

	for i in 0..3 {
		h.engine.presence.chat(&a.conn, &format!("msg {i}")).await.unwrap();
	}
	let err = h.engine.presence.chat(&a.conn, "one too many").await.unwrap_err();
	assert!(matches!(err, EngineError::Flood { retry_after } if retry_after == Duration::from_secs(60)));

	let chats = a
		.drain()
		.into_iter()
		.filter(|e| matches!(e, Event::ChatMessage(_)))
		.count();
	assert_eq!(chats, 3);
}

#[tokio::test]
async fn chat_is_validated_and_private_messages_stay_private() {
	let h = harness();
	let a = h.anon_client("a").await;
	let mut b = h.anon_client("b").await;
	let mut c = h.anon_client("c").await;
	h.join(&a, "foo", "sam").await.unwrap();
	h.join(&b, "foo", "kim").await.unwrap();
	h.join(&c, "foo", "lee").await.unwrap();
	b.drain();
	c.drain();

	assert!(matches!(
		h.engine.presence.chat(&a.conn, "   ").await,
		Err(EngineError::Validation(_))
	));

	h.engine.presence.private_message(&a.conn, &b.conn, "psst").await.unwrap();
	assert!(b.drain().iter().any(|e| matches!(e, Event::PrivateMessage(m) if m.text == "psst" && m.handle == "sam")));
	assert!(c.drain().is_empty());

	let err = h
		.engine
		.presence
		.private_message(&a.conn, &conn("nobody"), "hello?")
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn reconnect_resumes_handle_and_drops_old_session() {
	let h = harness();
	let old = h.anon_client("old").await;
	h.join(&old, "foo", "sam").await.unwrap();
	h.engine.presence.leave(&old.conn, "disconnected").await.unwrap();

	let fresh = h.client("fresh", old.identity.clone()).await;
	let mut req = h.request(&fresh, "foo", "someone-else");
	req.resume_from = Some(old.conn.clone());
	let outcome = h.engine.presence.join(req).await.unwrap();

	assert!(outcome.resumed);
	assert_eq!(outcome.participant.handle, "sam");
	assert_eq!(h.engine.sessions.get(&old.conn).await.unwrap(), SessionLookup::NoSession);
}

#[tokio::test]
async fn resume_requires_the_same_session() {
	let h = harness();
	let old = h.anon_client("old").await;
	h.join(&old, "foo", "sam").await.unwrap();
	h.engine.presence.leave(&old.conn, "disconnected").await.unwrap();

	let stranger = h.anon_client("stranger").await;
	let mut req = h.request(&stranger, "foo", "kim");
	req.resume_from = Some(old.conn.clone());
	let outcome = h.engine.presence.join(req).await.unwrap();

	assert!(!outcome.resumed);
	assert_eq!(outcome.participant.handle, "kim");
}

#[tokio::test]
async fn switching_rooms_leaves_the_previous_one() {
	let h = harness();
	let a = h.anon_client("a").await;
	let b = h.anon_client("b").await;
	h.join(&a, "one", "sam").await.unwrap();
	h.join(&b, "one", "kim").await.unwrap();

	h.join(&a, "two", "sam").await.unwrap();

	assert_eq!(h.participants("one").await, vec!["kim"]);
	assert_eq!(h.participants("two").await, vec!["sam"]);
	assert_eq!(h.engine.hub.room_members(&room("one")).await, vec![b.conn.clone()]);
}

#[tokio::test]
async fn topic_needs_room_details_and_skips_no_ops() {
	let h = harness();
	owned_room(&h, "foo", "alice").await;
	let alice = h.user_client("alice-conn", "alice").await;
	let mut b = h.anon_client("b").await;
	h.join(&alice, "foo", "alice").await.unwrap();
	h.join(&b, "foo", "bob").await.unwrap();

	let err = h.engine.presence.set_topic(&b.conn, "mine now").await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { ref capability } if capability == "roomDetails"));

	assert!(h.engine.presence.set_topic(&alice.conn, "  welcome  ").await.unwrap());
	assert!(!h.engine.presence.set_topic(&alice.conn, "welcome").await.unwrap());

	let topics: Vec<_> = b
		.drain()
		.into_iter()
		.filter_map(|e| match e {
			Event::TopicChanged(t) => Some(t.text),
			_ => None,
		})
		.collect();
	assert_eq!(topics, vec!["welcome"]);

	let stored = h.engine.rooms.load(&room("foo")).await.unwrap();
	assert_eq!(stored.settings.topic.map(|t| t.text).as_deref(), Some("welcome"));
}

#[tokio::test]
async fn broadcasting_opens_and_closes_a_relay_session() {
	let h = harness();
	let mut a = h.anon_client("a").await;
	let joined = h.join(&a, "foo", "sam").await.unwrap();
	let relay = joined.room.relay.expect("relay attached");
	a.drain();

	let p = h.engine.presence.set_broadcasting(&a.conn, true).await.unwrap();
	assert!(p.broadcasting);

	let session = a
		.drain()
		.into_iter()
		.find_map(|e| match e {
			Event::BroadcastSession(s) => Some(s),
			_ => None,
		})
		.expect("broadcast session event");
	assert_eq!(session.relay_node_id, relay.node_id);
	assert_eq!(session.relay_room_id, relay.relay_room_id);

	let p = h.engine.presence.set_broadcasting(&a.conn, false).await.unwrap();
	assert!(!p.broadcasting);

	let closed = format!(
		"destroy_session {} {} {}",
		relay.node_id, relay.relay_room_id, session.relay_session_id
	);
	assert!(h.relay.calls().contains(&closed), "calls: {:?}", h.relay.calls());
}

#[tokio::test]
async fn relay_failure_on_first_join_is_internal() {
	let h = harness();
	h.relay.fail.store(true, std::sync::atomic::Ordering::Relaxed);
	let a = h.anon_client("a").await;

	let err = h.join(&a, "foo", "sam").await.unwrap_err();
	assert_eq!(err.code(), "INTERNAL");
	assert!(h.engine.rooms.find(&room("foo")).await.unwrap().is_none());
}

#[tokio::test]
async fn media_queue_needs_play_media() {
	let h = harness();
	owned_room(&h, "foo", "alice").await;
	let alice = h.user_client("alice-conn", "alice").await;
	let mut b = h.anon_client("b").await;
	h.join(&alice, "foo", "alice").await.unwrap();
	h.join(&b, "foo", "bob").await.unwrap();
	b.drain();

	assert!(matches!(
		h.engine.presence.play_media(&b.conn, "https://example.com/v", None).await,
		Err(EngineError::Permission { .. })
	));
	assert!(matches!(
		h.engine.presence.play_media(&alice.conn, "ftp://example.com/v", None).await,
		Err(EngineError::Validation(_))
	));

	let item = h
		.engine
		.presence
		.play_media(&alice.conn, "https://example.com/v", Some(" intro "))
		.await
		.unwrap();
	assert_eq!(item.title.as_deref(), Some("intro"));
	assert_eq!(h.docs.playlist(&room("foo")).await.unwrap().len(), 1);
	assert!(b.drain().iter().any(|e| matches!(e, Event::MediaQueued(m) if m.added_by == "alice")));
}

#[tokio::test]
async fn claiming_someone_elses_room_is_forbidden() {
	let h = harness();
	owned_room(&h, "foo", "alice").await;

	let err = h
		.engine
		.presence
		.claim_room(&room("foo"), &user("mallory"))
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));

	// Claiming again as the owner is idempotent.
	owned_room(&h, "foo", "alice").await;
}

#[tokio::test(start_paused = true)]
async fn leaving_after_the_session_expired_still_empties_the_room() {
	let h = harness();
	let a = h.anon_client("a").await;
	let b = h.anon_client("b").await;
	h.join(&a, "tmp", "sam").await.unwrap();
	h.join(&b, "tmp", "kim").await.unwrap();

	tokio::time::advance(Duration::from_secs(121)).await;
	assert!(matches!(
		h.engine.sessions.get(&a.conn).await.unwrap(),
		SessionLookup::NoSession
	));

	h.engine.presence.leave(&a.conn, "disconnected").await.unwrap();
	assert_eq!(h.participants("tmp").await, vec!["kim"]);

	h.engine.presence.leave(&b.conn, "disconnected").await.unwrap();
	assert!(h.engine.rooms.find(&room("tmp")).await.unwrap().is_none());
	assert!(h.relay.calls().iter().any(|c| c.starts_with("destroy_room")));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_holds_an_idle_session() {
	let h = harness();
	let a = h.anon_client("a").await;
	let b = h.anon_client("b").await;
	h.join(&a, "foo", "sam").await.unwrap();
	h.join(&b, "foo", "kim").await.unwrap();

	for _ in 0..4 {
		tokio::time::advance(Duration::from_secs(40)).await;
		assert!(h.engine.presence.keep_alive(&a.conn).await.unwrap());
	}

	h.engine.presence.chat(&a.conn, "still here").await.unwrap();
	let err = h.engine.presence.chat(&b.conn, "hello?").await.unwrap_err();
	assert!(matches!(err, EngineError::NotFound { .. }));
	assert!(!h.engine.presence.keep_alive(&b.conn).await.unwrap());
}

#[tokio::test]
async fn revoked_role_cannot_finish_a_queued_kick() {
	let h = harness();
	owned_room(&h, "foo", "alice").await;
	let alice = h.user_client("alice-conn", "alice").await;
	let bob = h.anon_client("bob-conn").await;
	let carol = h.anon_client("carol-conn").await;
	h.join(&alice, "foo", "alice").await.unwrap();
	h.join(&bob, "foo", "bob").await.unwrap();
	h.join(&carol, "foo", "carol").await.unwrap();
	h.engine
		.presence
		.create_role(&alice.conn, "Bouncer", &[Capability::Kick])
		.await
		.unwrap();
	h.engine.presence.assign_role(&alice.conn, &bob.conn, "bouncer").await.unwrap();

	// Queue the revocation ahead of the kick on the room lock.
	let guard = h.engine.rooms.lock(&room("foo")).await;
	let revoke = {
		let engine = h.engine.clone();
		let (alice, bob) = (alice.conn.clone(), bob.conn.clone());
		tokio::spawn(async move { engine.presence.unassign_role(&alice, &bob, "bouncer").await })
	};
	for _ in 0..5 {
		tokio::task::yield_now().await;
	}
	let kick = {
		let engine = h.engine.clone();
		let (bob, carol) = (bob.conn.clone(), carol.conn.clone());
		tokio::spawn(async move { engine.presence.kick(&bob, &carol).await })
	};
	for _ in 0..5 {
		tokio::task::yield_now().await;
	}
	drop(guard);

	let updated = revoke.await.unwrap().unwrap();
	assert!(updated.roles.is_empty());
	let err = kick.await.unwrap().unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));
	assert_eq!(h.participants("foo").await, vec!["alice", "bob", "carol"]);
}

#[tokio::test]
async fn join_queued_behind_a_closure_is_refused() {
	let h = harness();
	let sam = h.anon_client("sam-conn").await;
	let kim = h.anon_client("kim-conn").await;
	h.join(&sam, "foo", "sam").await.unwrap();

	let guard = h.engine.rooms.lock(&room("foo")).await;
	let close = {
		let engine = h.engine.clone();
		tokio::spawn(async move { engine.moderation.close_room("admin", &room("foo"), "raid", Some(1)).await })
	};
	for _ in 0..5 {
		tokio::task::yield_now().await;
	}
	let join = {
		let engine = h.engine.clone();
		let req = h.request(&kim, "foo", "kim");
		tokio::spawn(async move { engine.presence.join(req).await })
	};
	for _ in 0..5 {
		tokio::task::yield_now().await;
	}
	drop(guard);

	let closure = close.await.unwrap().unwrap();
	assert_eq!(closure.affected.len(), 1);
	let err = join.await.unwrap().unwrap_err();
	assert!(matches!(err, EngineError::RoomClosed { .. }));
	assert!(h.participants("foo").await.is_empty());
}
