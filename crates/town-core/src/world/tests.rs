use super::*;

use contracts::constants::{
    AWKWARD_CONVERSATION_TIMEOUT, INVITE_TIMEOUT, MAX_CONVERSATION_MESSAGES, TICK, TYPING_TIMEOUT,
};
use contracts::geometry::{PathComponent, Point, Vector};
use contracts::{InputError, InputPayload};

fn empty_town() -> AiTown {
    AiTown::seed(WorldConfig {
        personas: Vec::new(),
        blocked_tiles: vec![(10, 10)],
        ..WorldConfig::default()
    })
}

fn place_player(town: &mut AiTown, name: &str, at: Point) -> Id {
    let location_id = town.allocate_id("locations");
    town.locations.insert(LocationDoc {
        id: location_id.clone(),
        x: at.x,
        y: at.y,
        dx: 0.0,
        dy: 1.0,
        velocity: 0.0,
        history: None,
    });
    let player_id = town.allocate_id("players");
    town.players.insert(PlayerDoc {
        id: player_id.clone(),
        world_id: town.world.id.clone(),
        name: name.to_string(),
        description: format!("{name} of the tests"),
        character: "f1".to_string(),
        location_id,
        active: true,
        human: false,
        path: None,
        destination: None,
        pathfinding_started: None,
        next_pathfinding_ts: None,
    });
    let agent_id = town.allocate_id("agents");
    town.agents.insert(AgentDoc {
        id: agent_id,
        world_id: town.world.id.clone(),
        player_id: player_id.clone(),
        identity: format!("{name} identity"),
        plan: "wander".to_string(),
        next_decision_ts: 0.0,
        last_conversation_ts: None,
        last_invite_ts: None,
        conversation_cooldowns: BTreeMap::new(),
    });
    player_id
}

fn start_conversation(town: &mut AiTown, a: &str, b: &str, now: f64) -> Id {
    let value = town
        .apply_input(
            &InputPayload::StartConversation {
                player_id: a.to_string(),
                invitee_id: b.to_string(),
            },
            now,
        )
        .expect("start conversation");
    value
        .get("conversationId")
        .and_then(serde_json::Value::as_str)
        .expect("conversation id")
        .to_string()
}

fn make_participating(town: &mut AiTown, a: &str, b: &str, now: f64) -> Id {
    let conversation_id = start_conversation(town, a, b, now);
    town.apply_input(
        &InputPayload::AcceptInvite {
            player_id: b.to_string(),
            conversation_id: conversation_id.clone(),
        },
        now,
    )
    .expect("accept");
    town.tick(now + TICK);
    conversation_id
}

#[test]
fn join_allocates_player_and_location() {
    let mut town = empty_town();
    let value = town
        .apply_input(
            &InputPayload::Join {
                name: "Wren".to_string(),
                character: "f6".to_string(),
                description: "a visitor".to_string(),
            },
            100.0,
        )
        .expect("join");

    let player_id = value
        .get("playerId")
        .and_then(serde_json::Value::as_str)
        .expect("player id");
    let player = town.players.lookup(player_id).expect("player active");
    assert!(town.locations.get(&player.location_id).is_some());
    assert!(player.human);
}

#[test]
fn duplicate_join_is_rejected() {
    let mut town = empty_town();
    place_player(
        &mut town,
        "Wren",
        Point { x: 4.0, y: 4.0 },
    );
    let result = town.apply_input(
        &InputPayload::Join {
            name: "Wren".to_string(),
            character: "f6".to_string(),
            description: "again".to_string(),
        },
        100.0,
    );
    assert!(matches!(result, Err(InputError::DuplicateJoin { .. })));
}

#[test]
fn move_to_a_blocked_tile_is_a_typed_error() {
    let mut town = empty_town();
    let player = place_player(&mut town, "Wren", Point { x: 4.0, y: 4.0 });
    let result = town.apply_input(
        &InputPayload::MoveTo {
            player_id: player,
            destination: Some(Point { x: 10.2, y: 10.9 }),
        },
        0.0,
    );
    assert!(matches!(result, Err(InputError::BlockedDestination { .. })));
}

#[test]
fn ticking_moves_a_player_toward_its_destination() {
    let mut town = empty_town();
    let player = place_player(&mut town, "Wren", Point { x: 2.0, y: 2.0 });
    town.apply_input(
        &InputPayload::MoveTo {
            player_id: player.clone(),
            destination: Some(Point { x: 6.0, y: 2.0 }),
        },
        0.0,
    )
    .expect("move accepted");

    let mut now = 0.0;
    for _ in 0..80 {
        now += TICK;
        town.tick(now);
    }

    let doc = town.players.get(&player).expect("player");
    let point = town.player_point(doc).expect("location");
    assert!(point.x > 2.0, "expected progress, at {point:?}");
    let location = town.locations.get(&doc.location_id).expect("location row");
    if doc.path.is_some() {
        assert!(location.velocity > 0.0);
    }
}

#[test]
fn stopping_mid_path_plants_at_the_interpolated_position() {
    let mut town = empty_town();
    let player = place_player(&mut town, "Wren", Point { x: 2.0, y: 2.0 });
    town.apply_input(
        &InputPayload::MoveTo {
            player_id: player.clone(),
            destination: Some(Point { x: 6.0, y: 2.0 }),
        },
        0.0,
    )
    .expect("move accepted");
    town.tick(TICK);

    town.apply_input(
        &InputPayload::MoveTo {
            player_id: player.clone(),
            destination: None,
        },
        816.0,
    )
    .expect("stop accepted");

    let doc = town.players.get(&player).expect("player");
    assert!(doc.path.is_none());
    assert!(doc.destination.is_none());
    let location = town.locations.get(&doc.location_id).expect("location");
    assert!(location.x > 2.0 && location.x < 6.0);
    assert_eq!(location.velocity, 0.0);
}

#[test]
fn stopping_an_exhausted_path_is_a_typed_error() {
    let mut town = empty_town();
    let player = place_player(&mut town, "Wren", Point { x: 3.0, y: 3.0 });
    town.players
        .update(&player, |p| {
            p.path = Some(vec![
                PathComponent {
                    position: Point { x: 3.0, y: 3.0 },
                    facing: Vector { dx: 1.0, dy: 0.0 },
                    t: 100.0,
                },
                PathComponent {
                    position: Point { x: 4.0, y: 3.0 },
                    facing: Vector { dx: 1.0, dy: 0.0 },
                    t: 200.0,
                },
            ]);
        })
        .expect("plant a finished walk");

    let result = town.apply_input(
        &InputPayload::MoveTo {
            player_id: player,
            destination: None,
        },
        5000.0,
    );
    assert!(matches!(result, Err(InputError::PathExhausted)));
}

#[test]
fn invite_accept_promotes_to_participating_within_range() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 6.0, y: 5.0 });

    let conversation_id = start_conversation(&mut town, &a, &b, 100.0);
    let members = town.members_of(&conversation_id);
    assert!(matches!(members[0].status, MemberStatus::WalkingOver));
    assert!(matches!(members[1].status, MemberStatus::Invited { .. }));

    town.apply_input(
        &InputPayload::AcceptInvite {
            player_id: b.clone(),
            conversation_id: conversation_id.clone(),
        },
        120.0,
    )
    .expect("accept");

    // One tile apart is inside conversation range, so one tick promotes.
    town.tick(136.0);
    let members = town.members_of(&conversation_id);
    assert!(members.iter().all(|m| m.status.is_participating()));
}

#[test]
fn rejecting_an_invite_finishes_the_conversation() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 6.0, y: 5.0 });

    let conversation_id = start_conversation(&mut town, &a, &b, 100.0);
    town.apply_input(
        &InputPayload::RejectInvite {
            player_id: b,
            conversation_id: conversation_id.clone(),
        },
        150.0,
    )
    .expect("reject");

    let conversation = town.conversations.get(&conversation_id).expect("doc");
    assert!(conversation.finished.is_some());
}

#[test]
fn unanswered_invites_expire_during_ticks() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 9.0, y: 5.0 });

    let conversation_id = start_conversation(&mut town, &a, &b, 0.0);
    town.tick(INVITE_TIMEOUT + TICK);

    let conversation = town.conversations.get(&conversation_id).expect("doc");
    assert!(conversation.finished.is_some());
}

#[test]
fn message_cap_finishes_and_later_sends_fail() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 6.0, y: 5.0 });
    let conversation_id = make_participating(&mut town, &a, &b, 100.0);

    let mut now = 200.0;
    for n in 0..MAX_CONVERSATION_MESSAGES {
        let speaker = if n % 2 == 0 { &a } else { &b };
        now += 100.0;
        town.apply_input(
            &InputPayload::SendMessage {
                player_id: speaker.clone(),
                conversation_id: conversation_id.clone(),
                text: format!("message {n}"),
            },
            now,
        )
        .expect("send within cap");
    }

    let conversation = town.conversations.get(&conversation_id).expect("doc");
    assert!(conversation.finished.is_some());
    assert_eq!(conversation.num_messages, MAX_CONVERSATION_MESSAGES);

    let result = town.apply_input(
        &InputPayload::SendMessage {
            player_id: a,
            conversation_id: conversation_id.clone(),
            text: "one more".to_string(),
        },
        now + 100.0,
    );
    assert!(matches!(
        result,
        Err(InputError::ConversationFinished { .. })
    ));
}

#[test]
fn finishing_stamps_cooldowns_on_both_agents() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 6.0, y: 5.0 });
    let conversation_id = make_participating(&mut town, &a, &b, 100.0);

    town.apply_input(
        &InputPayload::LeaveConversation {
            player_id: a.clone(),
            conversation_id,
        },
        500.0,
    )
    .expect("leave");

    let agent_a = town.agents.find(|agent| agent.player_id == a).expect("a");
    let agent_b = town.agents.find(|agent| agent.player_id == b).expect("b");
    assert_eq!(agent_a.last_conversation_ts, Some(500.0));
    assert_eq!(agent_a.conversation_cooldowns.get(&b), Some(&500.0));
    assert_eq!(agent_b.conversation_cooldowns.get(&a), Some(&500.0));
}

#[test]
fn typing_claims_are_exclusive_until_cleared() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 6.0, y: 5.0 });
    let conversation_id = make_participating(&mut town, &a, &b, 100.0);

    let claimed = town
        .apply_input(
            &InputPayload::StartTyping {
                player_id: a.clone(),
                conversation_id: conversation_id.clone(),
            },
            200.0,
        )
        .expect("first claim");
    assert_eq!(claimed, serde_json::Value::Bool(true));

    let contested = town
        .apply_input(
            &InputPayload::StartTyping {
                player_id: b.clone(),
                conversation_id: conversation_id.clone(),
            },
            300.0,
        )
        .expect("second claim");
    assert_eq!(contested, serde_json::Value::Bool(false));

    // The claim expires during ticks and the other side can then take it.
    town.tick(200.0 + TYPING_TIMEOUT + TICK);
    let reclaimed = town
        .apply_input(
            &InputPayload::StartTyping {
                player_id: b,
                conversation_id,
            },
            200.0 + TYPING_TIMEOUT + 2.0 * TICK,
        )
        .expect("claim after expiry");
    assert_eq!(reclaimed, serde_json::Value::Bool(true));
}

#[test]
fn moving_while_participating_is_rejected() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let b = place_player(&mut town, "Brin", Point { x: 6.0, y: 5.0 });
    make_participating(&mut town, &a, &b, 100.0);

    let result = town.apply_input(
        &InputPayload::MoveTo {
            player_id: a,
            destination: Some(Point { x: 1.0, y: 1.0 }),
        },
        400.0,
    );
    assert!(matches!(result, Err(InputError::InConversation { .. })));
}

#[test]
fn leave_deactivates_but_keeps_the_location_row() {
    let mut town = empty_town();
    let a = place_player(&mut town, "Ada", Point { x: 5.0, y: 5.0 });
    let location_id = town
        .players
        .get(&a)
        .map(|p| p.location_id.clone())
        .expect("location id");

    town.apply_input(&InputPayload::Leave { player_id: a.clone() }, 600.0)
        .expect("leave");

    assert!(matches!(
        town.players.lookup(&a),
        Err(crate::game_table::TableError::Inactive { .. })
    ));
    assert!(town.locations.get(&location_id).is_some());
}

#[test]
fn awkward_silence_constant_is_longer_than_a_cooldown() {
    // Guard against the timeout pair inverting; the policy depends on it.
    assert!(AWKWARD_CONVERSATION_TIMEOUT > contracts::constants::MESSAGE_COOLDOWN);
}

#[test]
fn history_blobs_appear_after_movement_flush() {
    let mut town = empty_town();
    let player = place_player(&mut town, "Wren", Point { x: 2.0, y: 2.0 });
    town.apply_input(
        &InputPayload::MoveTo {
            player_id: player.clone(),
            destination: Some(Point { x: 6.0, y: 2.0 }),
        },
        0.0,
    )
    .expect("move");

    let mut now = 0.0;
    for _ in 0..20 {
        now += TICK;
        town.tick(now);
    }
    let flush = town.flush();

    let location_id = town
        .players
        .get(&player)
        .map(|p| p.location_id.clone())
        .expect("loc id");
    let location = flush
        .locations
        .replaced
        .iter()
        .find(|l| l.id == location_id)
        .expect("location flushed");
    let blob = location.history.as_ref().expect("history packed");
    let fields = contracts::history::unpack(blob).expect("blob decodes");
    assert!(!fields["x"].samples.is_empty());
    for pair in fields["x"].samples.windows(2) {
        assert!(pair[0].time < pair[1].time);
    }
}
