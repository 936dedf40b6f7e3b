use super::*;

use contracts::constants::TYPING_TIMEOUT;
use contracts::geometry;
use contracts::{InputError, InputPayload, TypingClaim};
use serde_json::{json, Value};

impl AiTown {
    /// Apply one drained input at world time `now`. Handlers are total:
    /// every outcome is an ok value or a typed error, and the engine keeps
    /// ticking either way.
    pub fn apply_input(&mut self, payload: &InputPayload, now: f64) -> Result<Value, InputError> {
        match payload.clone() {
            InputPayload::Join {
                name,
                character,
                description,
            } => self.join(name, character, description, now),
            InputPayload::Leave { player_id } => self.leave(&player_id, now),
            InputPayload::MoveTo {
                player_id,
                destination,
            } => self.move_to(&player_id, destination, now),
            InputPayload::StartConversation {
                player_id,
                invitee_id,
            } => self.start_conversation(&player_id, &invitee_id, now),
            InputPayload::AcceptInvite {
                player_id,
                conversation_id,
            } => self.accept_invite(&player_id, &conversation_id),
            InputPayload::RejectInvite {
                player_id,
                conversation_id,
            } => self.reject_invite(&player_id, &conversation_id, now),
            InputPayload::LeaveConversation {
                player_id,
                conversation_id,
            } => self.leave_conversation(&player_id, &conversation_id, now),
            InputPayload::SendMessage {
                player_id,
                conversation_id,
                text,
            } => self.send_message(&player_id, &conversation_id, text, now),
            InputPayload::StartTyping {
                player_id,
                conversation_id,
            } => self.start_typing(&player_id, &conversation_id, now),
        }
    }

    fn join(
        &mut self,
        name: String,
        character: String,
        description: String,
        now: f64,
    ) -> Result<Value, InputError> {
        if self.players.find(|p| p.name == name).is_some() {
            return Err(InputError::DuplicateJoin { name });
        }

        let spawn = self
            .free_spawn_tile(
                mix_seed(self.config.seed, stable_str_salt(&name)),
                self.next_doc_number,
            )
            .ok_or(InputError::NoRoute)?;

        let location_id = self.allocate_id("locations");
        self.locations.insert(LocationDoc {
            id: location_id.clone(),
            x: spawn.x,
            y: spawn.y,
            dx: 0.0,
            dy: 1.0,
            velocity: 0.0,
            history: None,
        });

        let player_id = self.allocate_id("players");
        self.players.insert(PlayerDoc {
            id: player_id.clone(),
            world_id: self.world.id.clone(),
            name,
            description,
            character,
            location_id,
            active: true,
            human: true,
            path: None,
            destination: None,
            pathfinding_started: None,
            next_pathfinding_ts: None,
        });
        self.world.last_viewed = now;

        Ok(json!({ "playerId": player_id }))
    }

    fn leave(&mut self, player_id: &str, now: f64) -> Result<Value, InputError> {
        self.require_active_player(player_id)?;

        if let Some(member) = self.active_member(player_id) {
            let conversation_id = member.conversation_id.clone();
            let member_id = member.id.clone();
            self.settle_member(&member_id, &conversation_id, now);
        }

        let location_id = self
            .players
            .update(player_id, |player| {
                player.active = false;
                player.path = None;
                player.destination = None;
                player.pathfinding_started = None;
                player.next_pathfinding_ts = None;
                player.location_id.clone()
            })
            .map_err(|_| InputError::InvalidId {
                id: player_id.to_string(),
            })?;

        let _ = self.locations.update(&location_id, |loc| {
            loc.velocity = 0.0;
        });

        Ok(Value::Null)
    }

    fn move_to(
        &mut self,
        player_id: &str,
        destination: Option<Point>,
        now: f64,
    ) -> Result<Value, InputError> {
        self.require_active_player(player_id)?;

        if let Some(member) = self.active_member(player_id) {
            if member.status.is_participating() {
                return Err(InputError::InConversation {
                    player_id: player_id.to_string(),
                });
            }
        }

        let destination = match destination {
            None => return self.stop_moving(player_id, now),
            Some(point) => Point {
                x: point.x.floor(),
                y: point.y.floor(),
            },
        };

        if self
            .map
            .tile_blocked(destination.x as i64, destination.y as i64)
        {
            return Err(InputError::BlockedDestination {
                x: destination.x,
                y: destination.y,
            });
        }

        let _ = self.players.update(player_id, |player| {
            player.destination = Some(destination);
            player.path = None;
            player.pathfinding_started = Some(now);
            player.next_pathfinding_ts = Some(now);
        });

        Ok(json!({ "destination": destination }))
    }

    /// A null-destination move request: plant the traveller wherever its
    /// path puts it right now. A path whose final timestamp has already
    /// passed cannot be consulted; the walk is over and the next tick
    /// settles the arrival.
    fn stop_moving(&mut self, player_id: &str, now: f64) -> Result<Value, InputError> {
        let Some(player) = self.players.get(player_id) else {
            return Err(InputError::InvalidId {
                id: player_id.to_string(),
            });
        };
        let location_id = player.location_id.clone();

        if let Some(path) = player.path.clone() {
            if !geometry::path_overlaps(&path, now) {
                return Err(InputError::PathExhausted);
            }
            if let Ok(step) = geometry::path_position(&path, now) {
                let _ = self.locations.update(&location_id, |loc| {
                    loc.x = step.position.x;
                    loc.y = step.position.y;
                    loc.dx = step.facing.dx;
                    loc.dy = step.facing.dy;
                    loc.velocity = 0.0;
                });
            }
        }

        let _ = self.players.update(player_id, |player| {
            player.path = None;
            player.destination = None;
            player.pathfinding_started = None;
            player.next_pathfinding_ts = None;
        });
        Ok(Value::Null)
    }

    fn start_conversation(
        &mut self,
        player_id: &str,
        invitee_id: &str,
        now: f64,
    ) -> Result<Value, InputError> {
        self.require_active_player(player_id)?;
        self.require_active_player(invitee_id)?;
        if player_id == invitee_id {
            return Err(InputError::InvalidId {
                id: invitee_id.to_string(),
            });
        }

        for busy in [player_id, invitee_id] {
            if let Some(member) = self.active_member(busy) {
                return Err(InputError::ConversationFull {
                    conversation_id: member.conversation_id.clone(),
                });
            }
        }

        let conversation_id = self.allocate_id("conversations");
        self.conversations.insert(ConversationDoc {
            id: conversation_id.clone(),
            world_id: self.world.id.clone(),
            creator_id: player_id.to_string(),
            created_ts: now,
            num_messages: 0,
            last_message_ts: None,
            typing: None,
            finished: None,
        });

        let creator_member = self.allocate_id("members");
        self.members.insert(MemberDoc {
            id: creator_member,
            conversation_id: conversation_id.clone(),
            player_id: player_id.to_string(),
            status: MemberStatus::WalkingOver,
        });
        let invitee_member = self.allocate_id("members");
        self.members.insert(MemberDoc {
            id: invitee_member,
            conversation_id: conversation_id.clone(),
            player_id: invitee_id.to_string(),
            status: MemberStatus::Invited { invited_ts: now },
        });

        if let Some(agent) = self
            .agents
            .find(|a| a.player_id == player_id)
            .map(|a| a.id.clone())
        {
            let _ = self.agents.update(&agent, |a| a.last_invite_ts = Some(now));
        }

        Ok(json!({ "conversationId": conversation_id }))
    }

    fn accept_invite(
        &mut self,
        player_id: &str,
        conversation_id: &str,
    ) -> Result<Value, InputError> {
        self.require_unfinished_conversation(conversation_id)?;
        let member = self
            .member_row(player_id, conversation_id)
            .ok_or_else(|| InputError::NotInConversation {
                player_id: player_id.to_string(),
            })?;

        match member.status {
            MemberStatus::Invited { .. } => {
                let member_id = member.id.clone();
                let _ = self
                    .members
                    .update(&member_id, |m| m.status = MemberStatus::WalkingOver);
                Ok(Value::Null)
            }
            MemberStatus::WalkingOver | MemberStatus::Participating { .. } => Ok(Value::Null),
            MemberStatus::Left => Err(InputError::NotInConversation {
                player_id: player_id.to_string(),
            }),
        }
    }

    fn reject_invite(
        &mut self,
        player_id: &str,
        conversation_id: &str,
        now: f64,
    ) -> Result<Value, InputError> {
        self.require_unfinished_conversation(conversation_id)?;
        let member = self
            .member_row(player_id, conversation_id)
            .ok_or_else(|| InputError::NotInConversation {
                player_id: player_id.to_string(),
            })?;

        let member_id = member.id.clone();
        self.settle_member(&member_id, conversation_id, now);
        Ok(Value::Null)
    }

    fn leave_conversation(
        &mut self,
        player_id: &str,
        conversation_id: &str,
        now: f64,
    ) -> Result<Value, InputError> {
        self.require_unfinished_conversation(conversation_id)?;
        let member = self
            .member_row(player_id, conversation_id)
            .ok_or_else(|| InputError::NotInConversation {
                player_id: player_id.to_string(),
            })?;
        if member.status.has_left() {
            return Err(InputError::NotInConversation {
                player_id: player_id.to_string(),
            });
        }

        let member_id = member.id.clone();
        self.settle_member(&member_id, conversation_id, now);
        Ok(Value::Null)
    }

    fn send_message(
        &mut self,
        player_id: &str,
        conversation_id: &str,
        text: String,
        now: f64,
    ) -> Result<Value, InputError> {
        self.require_unfinished_conversation(conversation_id)?;
        let member = self
            .member_row(player_id, conversation_id)
            .ok_or_else(|| InputError::NotInConversation {
                player_id: player_id.to_string(),
            })?;
        if !member.status.is_participating() {
            return Err(InputError::NotInConversation {
                player_id: player_id.to_string(),
            });
        }

        let message_id = self.allocate_id("messages");
        self.messages.insert(MessageDoc {
            id: message_id.clone(),
            conversation_id: conversation_id.to_string(),
            author_id: player_id.to_string(),
            text,
            ts: now,
        });

        let num_messages = self
            .conversations
            .update(conversation_id, |conversation| {
                conversation.num_messages += 1;
                conversation.last_message_ts = Some(now);
                if let Some(claim) = &conversation.typing {
                    if claim.player_id == player_id {
                        conversation.typing = None;
                    }
                }
                conversation.num_messages
            })
            .map_err(|_| InputError::ConversationFinished {
                conversation_id: conversation_id.to_string(),
            })?;

        if num_messages >= contracts::constants::MAX_CONVERSATION_MESSAGES {
            self.finish_conversation(conversation_id, now);
        }

        Ok(json!({ "messageId": message_id }))
    }

    fn start_typing(
        &mut self,
        player_id: &str,
        conversation_id: &str,
        now: f64,
    ) -> Result<Value, InputError> {
        self.require_unfinished_conversation(conversation_id)?;
        let member = self
            .member_row(player_id, conversation_id)
            .ok_or_else(|| InputError::NotInConversation {
                player_id: player_id.to_string(),
            })?;
        if !member.status.is_participating() {
            return Err(InputError::NotInConversation {
                player_id: player_id.to_string(),
            });
        }

        let claimed = self
            .conversations
            .update(conversation_id, |conversation| {
                let stale = conversation
                    .typing
                    .as_ref()
                    .map(|claim| claim.started_ts + TYPING_TIMEOUT <= now)
                    .unwrap_or(true);
                let mine = conversation
                    .typing
                    .as_ref()
                    .map(|claim| claim.player_id == player_id)
                    .unwrap_or(false);
                if stale || mine {
                    conversation.typing = Some(TypingClaim {
                        player_id: player_id.to_string(),
                        started_ts: now,
                    });
                    true
                } else {
                    false
                }
            })
            .map_err(|_| InputError::ConversationFinished {
                conversation_id: conversation_id.to_string(),
            })?;

        Ok(Value::Bool(claimed))
    }

    pub(super) fn require_active_player(&self, player_id: &str) -> Result<(), InputError> {
        match self.players.get(player_id) {
            None => Err(InputError::InvalidId {
                id: player_id.to_string(),
            }),
            Some(player) if !player.active => Err(InputError::InactiveId {
                id: player_id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    pub(super) fn require_unfinished_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<(), InputError> {
        match self.conversations.get(conversation_id) {
            None => Err(InputError::InvalidId {
                id: conversation_id.to_string(),
            }),
            Some(conversation) if conversation.finished.is_some() => {
                Err(InputError::ConversationFinished {
                    conversation_id: conversation_id.to_string(),
                })
            }
            Some(_) => Ok(()),
        }
    }

    pub(super) fn member_row(&self, player_id: &str, conversation_id: &str) -> Option<&MemberDoc> {
        self.members
            .find(|m| m.player_id == player_id && m.conversation_id == conversation_id)
    }
}
