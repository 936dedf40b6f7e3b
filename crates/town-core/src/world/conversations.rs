use super::*;

use contracts::constants::{
    CONVERSATION_DISTANCE, INVITE_TIMEOUT, MAX_CONVERSATION_DURATION, MAX_CONVERSATION_MESSAGES,
    TYPING_TIMEOUT,
};
use contracts::geometry::distance;
use contracts::ConversationFinished;

impl AiTown {
    pub(super) fn tick_conversations(&mut self, now: f64) {
        let conversation_ids: Vec<Id> = self
            .conversations
            .iter_active()
            .map(|c| c.id.clone())
            .collect();

        for conversation_id in conversation_ids {
            self.expire_typing(&conversation_id, now);
            self.expire_invites(&conversation_id, now);
            self.promote_walkers(&conversation_id, now);
            self.enforce_lifetimes(&conversation_id, now);
        }
    }

    fn expire_typing(&mut self, conversation_id: &str, now: f64) {
        let _ = self.conversations.update(conversation_id, |conversation| {
            let stale = conversation
                .typing
                .as_ref()
                .map(|claim| claim.started_ts + TYPING_TIMEOUT <= now)
                .unwrap_or(false);
            if stale {
                conversation.typing = None;
            }
        });
    }

    fn expire_invites(&mut self, conversation_id: &str, now: f64) {
        let overdue: Vec<Id> = self
            .members_of(conversation_id)
            .into_iter()
            .filter(|member| match member.status {
                MemberStatus::Invited { invited_ts } => invited_ts + INVITE_TIMEOUT <= now,
                _ => false,
            })
            .map(|member| member.id.clone())
            .collect();

        for member_id in overdue {
            self.settle_member(&member_id, conversation_id, now);
        }
    }

    /// Both members walking over and close enough start participating, and
    /// plant themselves for the duration.
    fn promote_walkers(&mut self, conversation_id: &str, now: f64) {
        if self.conversations.lookup(conversation_id).is_err() {
            return;
        }

        let members = self.members_of(conversation_id);
        let Some((a, b)) = member_pair(&members) else {
            return;
        };
        let both_walking = matches!(a.status, MemberStatus::WalkingOver)
            && matches!(b.status, MemberStatus::WalkingOver);
        if !both_walking {
            return;
        }

        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        let (a_player, b_player) = (a.player_id.clone(), b.player_id.clone());
        let close_enough = match (
            self.players.get(&a_player).and_then(|p| self.player_point(p)),
            self.players.get(&b_player).and_then(|p| self.player_point(p)),
        ) {
            (Some(pa), Some(pb)) => distance(pa, pb) <= CONVERSATION_DISTANCE,
            _ => false,
        };
        if !close_enough {
            return;
        }

        for member_id in [a_id, b_id] {
            let _ = self.members.update(&member_id, |member| {
                member.status = MemberStatus::Participating { started_ts: now };
            });
        }
        for player_id in [a_player, b_player] {
            let location_id = self.players.get(&player_id).map(|p| p.location_id.clone());
            let _ = self.players.update(&player_id, |player| {
                player.path = None;
                player.destination = None;
                player.pathfinding_started = None;
                player.next_pathfinding_ts = None;
            });
            if let Some(location_id) = location_id {
                let _ = self.locations.update(&location_id, |loc| {
                    loc.velocity = 0.0;
                });
            }
        }
    }

    fn enforce_lifetimes(&mut self, conversation_id: &str, now: f64) {
        let Some(conversation) = self.conversations.get(conversation_id) else {
            return;
        };
        if conversation.finished.is_some() {
            return;
        }
        let over_messages = conversation.num_messages >= MAX_CONVERSATION_MESSAGES;

        let members = self.members_of(conversation_id);
        let active_members = members
            .iter()
            .filter(|member| !member.status.has_left())
            .count();
        let over_duration = earliest_participation(&members)
            .map(|started| started + MAX_CONVERSATION_DURATION <= now)
            .unwrap_or(false);

        if over_messages || over_duration || active_members < 2 {
            self.finish_conversation(conversation_id, now);
        }
    }

    /// Mark one member as gone; the conversation finishes as soon as fewer
    /// than two members remain.
    pub(super) fn settle_member(&mut self, member_id: &str, conversation_id: &str, now: f64) {
        let _ = self.members.update(member_id, |member| {
            member.status = MemberStatus::Left;
        });

        let remaining = self
            .members_of(conversation_id)
            .into_iter()
            .filter(|member| !member.status.has_left())
            .count();
        if remaining < 2 {
            self.finish_conversation(conversation_id, now);
        }
    }

    pub(super) fn finish_conversation(&mut self, conversation_id: &str, now: f64) {
        let already_finished = self
            .conversations
            .get(conversation_id)
            .map(|c| c.finished.is_some())
            .unwrap_or(true);
        if already_finished {
            return;
        }

        let _ = self.conversations.update_any(conversation_id, |conversation| {
            conversation.finished = Some(ConversationFinished { ended_at: now });
            conversation.typing = None;
        });

        let member_rows: Vec<(Id, Id)> = self
            .members_of(conversation_id)
            .into_iter()
            .map(|member| (member.id.clone(), member.player_id.clone()))
            .collect();

        for (member_id, _) in &member_rows {
            let _ = self.members.update(member_id, |member| {
                member.status = MemberStatus::Left;
            });
        }

        // Stamp cooldowns on both agents so neither immediately re-invites.
        let player_ids: Vec<Id> = member_rows.into_iter().map(|(_, p)| p).collect();
        for player_id in &player_ids {
            let Some(agent_id) = self
                .agents
                .find(|agent| agent.player_id == *player_id)
                .map(|agent| agent.id.clone())
            else {
                continue;
            };
            let partners: Vec<Id> = player_ids
                .iter()
                .filter(|other| *other != player_id)
                .cloned()
                .collect();
            let _ = self.agents.update(&agent_id, |agent| {
                agent.last_conversation_ts = Some(now);
                for partner in &partners {
                    agent.conversation_cooldowns.insert(partner.clone(), now);
                }
            });
        }
    }
}
