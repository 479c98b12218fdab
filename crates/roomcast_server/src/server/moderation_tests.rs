#![forbid(unsafe_code)]

use chrono::Utc;
use roomcast_domain::{BanLookup, Restrictions};
use roomcast_protocol::pb::server_envelope::Event;

use crate::server::errors::EngineError;
use crate::server::store::Page;
use crate::server::testkit::{Client, Harness, harness, room, user};

const JOIN: Restrictions = Restrictions {
	broadcast: false,
	join: true,
};

const BROADCAST: Restrictions = Restrictions {
	broadcast: true,
	join: false,
};

/// `foo` owned by alice, with alice and an anonymous bob inside.
async fn owned_room_with_guest(h: &Harness) -> (Client, Client) {
	h.engine.presence.claim_room(&room("foo"), &user("alice")).await.unwrap();
	let alice = h.user_client("alice-conn", "alice").await;
	let bob = h.anon_client("bob-conn").await;
	h.join(&alice, "foo", "alice").await.unwrap();
	h.join(&bob, "foo", "bob").await.unwrap();
	(alice, bob)
}

#[tokio::test]
async fn room_ban_removes_and_blocks_until_unbanned() {
	let h = harness();
	let (alice, mut bob) = owned_room_with_guest(&h).await;

	let entry = h.engine.moderation.ban(&alice.conn, &bob.conn, " spam ").await.unwrap();
	assert_eq!(entry.handle, "bob");
	assert_eq!(entry.session_id.as_deref(), Some("sess-bob-conn"));

	assert!(bob.drain().iter().any(|e| matches!(
		e,
		Event::ForcedBan(b) if b.reason == "spam" && b.restrict_join && !b.restrict_broadcast
	)));
	assert_eq!(bob.closed_with().as_deref(), Some("banned"));
	assert_eq!(h.participants("foo").await, vec!["alice"]);

	let retry = h.client("bob-again", bob.identity.clone()).await;
	let err = h.join(&retry, "foo", "bob").await.unwrap_err();
	assert!(matches!(err, EngineError::Banned { .. }));

	h.engine.moderation.unban(&alice.conn, entry.id).await.unwrap();
	h.join(&retry, "foo", "bob").await.unwrap();

	let err = h.engine.moderation.unban(&alice.conn, entry.id).await.unwrap_err();
	assert!(matches!(err, EngineError::NotFound { .. }));

	let actions: Vec<_> = h
		.engine
		.moderation
		.list_activity(Page::default())
		.await
		.unwrap()
		.into_iter()
		.map(|a| a.action)
		.collect();
	assert!(actions.contains(&"ban".to_string()));
	assert!(actions.contains(&"unban".to_string()));
}

#[tokio::test]
async fn ban_checks_capability_self_and_staff() {
	let h = harness();
	let (alice, bob) = owned_room_with_guest(&h).await;
	let admin = h.user_client("admin-conn", "root").await;
	h.join_staff(&admin, "foo", "root").await.unwrap();

	let err = h.engine.moderation.ban(&bob.conn, &alice.conn, "no").await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { ref capability } if capability == "ban"));

	let err = h.engine.moderation.ban(&alice.conn, &alice.conn, "oops").await.unwrap_err();
	assert!(matches!(err, EngineError::Validation(_)));

	let err = h.engine.moderation.ban(&alice.conn, &admin.conn, "nope").await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));

	let err = h.engine.presence.kick(&alice.conn, &admin.conn).await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));
	assert_eq!(h.participants("foo").await, vec!["alice", "bob", "root"]);
}

#[tokio::test]
async fn silenced_participants_cannot_chat() {
	let h = harness();
	let (alice, mut bob) = owned_room_with_guest(&h).await;
	bob.drain();

	h.engine.moderation.silence(&alice.conn, &bob.conn, true).await.unwrap();
	assert!(bob.drain().iter().any(|e| matches!(
		e,
		Event::ParticipantUpdated(u) if u.participant.as_ref().is_some_and(|p| p.silenced)
	)));

	let err = h.engine.presence.chat(&bob.conn, "hello?").await.unwrap_err();
	assert!(matches!(err, EngineError::Silenced));

	let err = h.engine.moderation.silence(&bob.conn, &alice.conn, true).await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { ref capability } if capability == "muteUserChat"));

	h.engine.moderation.silence(&alice.conn, &bob.conn, false).await.unwrap();
	h.engine.presence.chat(&bob.conn, "thanks").await.unwrap();
}

#[tokio::test]
async fn staff_cannot_be_silenced() {
	let h = harness();
	let (alice, _bob) = owned_room_with_guest(&h).await;
	let admin = h.user_client("admin-conn", "root").await;
	h.join_staff(&admin, "foo", "root").await.unwrap();

	let err = h.engine.moderation.silence(&alice.conn, &admin.conn, true).await.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));
}

#[tokio::test]
async fn repeated_site_bans_extend_one_record() {
	let h = harness();
	let admin = h.user_client("admin-conn", "root").await;
	let mut target = h.anon_client("target").await;
	h.join_staff(&admin, "foo", "root").await.unwrap();
	h.join(&target, "foo", "troll").await.unwrap();
	h.engine.presence.set_broadcasting(&target.conn, true).await.unwrap();
	target.drain();

	let first = h
		.engine
		.moderation
		.site_ban_participant(&admin.conn, &target.conn, BROADCAST, None, Some("rude".to_string()))
		.await
		.unwrap();

	// Broadcast-only bans leave the target in the room but stop the stream.
	let events = target.drain();
	assert!(events.iter().any(|e| matches!(e, Event::ForcedBan(b) if b.restrict_broadcast && !b.restrict_join)));
	assert!(events.iter().any(|e| matches!(e, Event::StopBroadcasting(_))));
	let stored = h.engine.rooms.load(&room("foo")).await.unwrap();
	let troll = stored.participant(&target.conn).expect("still in the room");
	assert!(!troll.broadcasting);

	let err = h
		.engine
		.presence
		.set_broadcasting(&target.conn, true)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Banned { ref reason } if reason.as_deref() == Some("rude")));

	let second = h
		.engine
		.moderation
		.site_ban_participant(&admin.conn, &target.conn, JOIN, Some(48), None)
		.await
		.unwrap();

	assert_eq!(second.id, first.id);
	assert_eq!(
		second.restrictions,
		Restrictions {
			broadcast: true,
			join: true
		}
	);
	assert_eq!(second.reason.as_deref(), Some("rude"));
	assert!(second.expires_at > first.expires_at);
	assert_eq!(h.engine.moderation.list_site_bans(Page::default()).await.unwrap().len(), 1);

	assert_eq!(target.closed_with().as_deref(), Some("site banned"));
	assert_eq!(h.participants("foo").await, vec!["root"]);

	let retry = h.client("target-again", target.identity.clone()).await;
	let err = h.join(&retry, "elsewhere", "troll").await.unwrap_err();
	assert!(matches!(err, EngineError::Banned { ref reason } if reason.as_deref() == Some("rude")));
}

#[tokio::test]
async fn site_ban_by_ip_blocks_unconnected_identities() {
	let h = harness();
	h.engine
		.moderation
		.create_or_extend_site_ban(
			"admin",
			BanLookup {
				ip: Some("ip-lurker".to_string()),
				..BanLookup::default()
			},
			JOIN,
			None,
			None,
		)
		.await
		.unwrap();

	let lurker = h.anon_client("lurker").await;
	assert!(matches!(
		h.join(&lurker, "foo", "lurk").await,
		Err(EngineError::Banned { reason: None })
	));

	let other = h.anon_client("other").await;
	h.join(&other, "foo", "fine").await.unwrap();
}

#[tokio::test]
async fn site_ban_needs_keys_restrictions_and_staff() {
	let h = harness();
	let (alice, bob) = owned_room_with_guest(&h).await;

	let err = h
		.engine
		.moderation
		.create_or_extend_site_ban("admin", BanLookup::default(), JOIN, None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Validation(_)));

	let lookup = BanLookup {
		ip: Some("1.2.3.4".to_string()),
		..BanLookup::default()
	};
	let err = h
		.engine
		.moderation
		.create_or_extend_site_ban("admin", lookup, Restrictions::default(), None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Validation(_)));

	// Room owners are not site staff.
	let err = h
		.engine
		.moderation
		.site_ban_participant(&alice.conn, &bob.conn, JOIN, None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));
	assert!(h.engine.moderation.list_site_bans(Page::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn closing_a_room_removes_everyone_and_blocks_joins() {
	let h = harness();
	let mut admin = h.user_client("admin-conn", "root").await;
	let mut a = h.anon_client("a").await;
	let mut b = h.anon_client("b").await;
	h.join_staff(&admin, "foo", "root").await.unwrap();
	h.join(&a, "foo", "sam").await.unwrap();
	h.join(&b, "foo", "kim").await.unwrap();

	let closure = h
		.engine
		.moderation
		.close_current_room(&admin.conn, "raid", Some(2))
		.await
		.unwrap();
	assert_eq!(closure.duration_hours, 2);
	assert_eq!(closure.affected.len(), 3);

	for client in [&mut admin, &mut a, &mut b] {
		assert!(client.drain().iter().any(|e| matches!(e, Event::RoomClosed(c) if c.reason == "raid")));
		assert_eq!(client.closed_with().as_deref(), Some("room closed"));
	}
	assert!(h.engine.rooms.find(&room("foo")).await.unwrap().is_none());
	assert!(h.engine.moderation.closure(&room("foo"), Utc::now()).await.unwrap().is_some());

	let late = h.anon_client("late").await;
	let err = h.join(&late, "foo", "late").await.unwrap_err();
	assert!(matches!(err, EngineError::RoomClosed { ref reason, .. } if reason == "raid"));
}

#[tokio::test]
async fn closure_rules() {
	let h = harness();
	let (alice, _bob) = owned_room_with_guest(&h).await;

	let err = h
		.engine
		.moderation
		.close_current_room(&alice.conn, "mine", None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Permission { .. }));

	let err = h
		.engine
		.moderation
		.close_room("admin", &room("foo"), "   ", None)
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::Validation(_)));

	// Rooms that do not exist yet can be closed ahead of time.
	let closure = h
		.engine
		.moderation
		.close_room("admin", &room("ghost"), "reserved", None)
		.await
		.unwrap();
	assert_eq!(closure.duration_hours, 24);
	assert!(closure.affected.is_empty());
}

#[tokio::test]
async fn active_room_listing_skips_empty_rooms() {
	let h = harness();
	let (_alice, _bob) = owned_room_with_guest(&h).await;
	h.engine.presence.claim_room(&room("empty"), &user("carol")).await.unwrap();

	let rooms = h.engine.moderation.list_active_rooms(Page::default()).await.unwrap();
	assert_eq!(rooms.len(), 1);
	assert_eq!(rooms[0].name, room("foo"));
	assert_eq!(rooms[0].participants, 2);
	assert_eq!(rooms[0].owner, Some(user("alice")));
	assert!(rooms[0].relay_node.is_some());
}
