//! Cooperative tasks around the engine: the step driver that honours the
//! engine's self-schedule, the idle-world sweep, and one task per agent.
//! Agents read the world under the lock, call the LLM outside it, and touch
//! the world only by submitting inputs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use contracts::constants::{ACTION_TIMEOUT, WORLD_HEARTBEAT_INTERVAL};
use contracts::{make_id, Id, InputPayload};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use town_core::agent::AgentDecision;

use crate::llm::{ChatMessage, LlmClient};
use crate::{AgentMemoryRow, EngineApi};

pub type SharedApi = Arc<Mutex<EngineApi>>;

/// How many remembered conversations a prompt may cite.
const MEMORY_LIMIT: usize = 3;
/// Pause between agent actions so the queue never floods.
const ACTION_PAUSE_MS: u64 = 200;
const MAX_WAIT_MS: u64 = 5_000;

pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Run engine steps when their self-schedule comes due, sweep idle worlds
/// on the heartbeat cadence, and wake early when an input kicks.
pub async fn drive_engine(api: SharedApi, step_notify: Arc<Notify>) {
    let mut last_idle_sweep = now_ms();
    loop {
        let now = now_ms();
        let (due, next_scheduled) = {
            let guard = api.lock().await;
            (guard.due_generation(now), guard.next_scheduled_ts())
        };

        if let Some(generation) = due {
            let mut guard = api.lock().await;
            let committed = guard.run_step(generation, now_ms());
            if let Some(err) = guard.last_persistence_error() {
                warn!(error = err, "step persisted with errors");
            }
            debug!(committed, generation, "engine step");
            continue;
        }

        if now - last_idle_sweep >= WORLD_HEARTBEAT_INTERVAL {
            last_idle_sweep = now;
            let mut guard = api.lock().await;
            if guard.stop_if_idle(now) {
                info!(world = guard.world_id(), "stopped idle world");
            }
        }

        let sleep_ms = next_scheduled
            .map(|ts| (ts - now).clamp(10.0, WORLD_HEARTBEAT_INTERVAL))
            .unwrap_or(WORLD_HEARTBEAT_INTERVAL) as u64;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            _ = step_notify.notified() => {}
        }
    }
}

/// One task per seeded agent.
pub async fn spawn_agents(
    api: SharedApi,
    llm: Option<Arc<LlmClient>>,
    step_notify: Arc<Notify>,
) -> Vec<JoinHandle<()>> {
    let agent_ids = { api.lock().await.agent_ids() };
    agent_ids
        .into_iter()
        .map(|agent_id| {
            tokio::spawn(run_agent(
                api.clone(),
                llm.clone(),
                step_notify.clone(),
                agent_id,
            ))
        })
        .collect()
}

async fn run_agent(
    api: SharedApi,
    llm: Option<Arc<LlmClient>>,
    step_notify: Arc<Notify>,
    agent_id: Id,
) {
    loop {
        let now = now_ms();
        let decision = { api.lock().await.decide(&agent_id, now) };

        match decision {
            None => {
                // The agent's player is gone; nothing to drive.
                tokio::time::sleep(Duration::from_millis(MAX_WAIT_MS)).await;
            }
            Some(AgentDecision::Wait { until }) => {
                let ms = ((until - now).max(50.0) as u64).min(MAX_WAIT_MS);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Some(AgentDecision::Submit(payload)) => {
                let ended_conversation = match &payload {
                    InputPayload::LeaveConversation {
                        conversation_id, ..
                    }
                    | InputPayload::RejectInvite {
                        conversation_id, ..
                    } => Some(conversation_id.clone()),
                    _ => None,
                };

                {
                    let mut guard = api.lock().await;
                    guard.send_input(payload, now_ms());
                }
                step_notify.notify_one();

                if let Some(conversation_id) = ended_conversation {
                    memorize_conversation(&api, llm.as_deref(), &agent_id, &conversation_id)
                        .await;
                }
                tokio::time::sleep(Duration::from_millis(ACTION_PAUSE_MS)).await;
            }
            Some(AgentDecision::ComposeMessage {
                conversation_id,
                player_id,
                partner_id,
            }) => {
                let mut materials = {
                    let mut guard = api.lock().await;
                    guard.send_input(
                        InputPayload::StartTyping {
                            player_id: player_id.clone(),
                            conversation_id: conversation_id.clone(),
                        },
                        now_ms(),
                    );
                    gather_prompt(&guard, &player_id, &partner_id, &conversation_id)
                };
                step_notify.notify_one();

                // Embed the partner's last line outside the lock and use it
                // to pick which remembered conversations the prompt cites.
                let query_embedding = match (llm.as_deref(), materials.query_text.as_deref()) {
                    (Some(client), Some(text)) => client
                        .embed(&[text.to_string()])
                        .await
                        .ok()
                        .and_then(|mut vectors| vectors.pop()),
                    _ => None,
                };
                let memory_candidates = materials.memory_candidates.clone();
                let remembered = rank_memories(&memory_candidates, query_embedding.as_deref());
                inject_memories(&mut materials, &remembered);

                let text = compose_text(llm.as_deref(), &materials).await;

                {
                    let mut guard = api.lock().await;
                    guard.send_input(
                        InputPayload::SendMessage {
                            player_id,
                            conversation_id,
                            text,
                        },
                        now_ms(),
                    );
                }
                step_notify.notify_one();
                tokio::time::sleep(Duration::from_millis(ACTION_PAUSE_MS)).await;
            }
        }
    }
}

#[derive(Debug)]
struct PromptMaterials {
    my_name: String,
    partner_name: String,
    messages: Vec<ChatMessage>,
    stop_words: Vec<String>,
    memory_candidates: Vec<AgentMemoryRow>,
    /// The partner's latest line, embedded to rank memories by relevance.
    query_text: Option<String>,
}

fn gather_prompt(
    api: &EngineApi,
    player_id: &str,
    partner_id: &str,
    conversation_id: &str,
) -> PromptMaterials {
    let town = api.town();
    let me = town.players.get(player_id);
    let partner = town.players.get(partner_id);
    let my_name = me.map(|p| p.name.clone()).unwrap_or_default();
    let partner_name = partner.map(|p| p.name.clone()).unwrap_or_default();

    let agent = town.agents.find(|a| a.player_id == player_id);
    let identity = agent.map(|a| a.identity.clone()).unwrap_or_default();
    let plan = agent.map(|a| a.plan.clone()).unwrap_or_default();
    let partner_description = partner.map(|p| p.description.clone()).unwrap_or_default();

    let system = format!(
        "You are {my_name}, a townsperson. {identity}\n\
         Your current plan: {plan}\n\
         You are talking with {partner_name}. {partner_description}\n\
         Reply with a single short conversational line, in character."
    );

    let mut messages = vec![ChatMessage::system(system)];
    let mut query_text = None;
    for message in town.messages_of(conversation_id) {
        let author = town
            .players
            .get(&message.author_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| message.author_id.clone());
        if message.author_id == partner_id {
            query_text = Some(message.text.clone());
        }
        messages.push(ChatMessage::user(format!("{author}: {}", message.text)));
    }

    let memory_candidates = api
        .memories_for(player_id)
        .into_iter()
        .filter(|memory| memory.partner_id == partner_id)
        .cloned()
        .collect();

    PromptMaterials {
        stop_words: vec![format!("{partner_name}:"), format!("{my_name}:")],
        my_name,
        partner_name,
        messages,
        memory_candidates,
        query_text,
    }
}

/// Order memory candidates by cosine similarity to the query embedding when
/// one is available, otherwise by recency, and keep the top few.
fn rank_memories<'a>(
    candidates: &'a [AgentMemoryRow],
    query: Option<&[f32]>,
) -> Vec<&'a AgentMemoryRow> {
    let mut ranked: Vec<&AgentMemoryRow> = candidates.iter().collect();
    match query {
        Some(query) if !query.is_empty() => {
            ranked.sort_by(|a, b| {
                cosine_similarity(&b.embedding, query)
                    .total_cmp(&cosine_similarity(&a.embedding, query))
            });
        }
        _ => ranked.sort_by(|a, b| b.created_ts.total_cmp(&a.created_ts)),
    }
    ranked.truncate(MEMORY_LIMIT);
    ranked
}

fn inject_memories(materials: &mut PromptMaterials, remembered: &[&AgentMemoryRow]) {
    if remembered.is_empty() {
        return;
    }
    let Some(system) = materials.messages.first_mut() else {
        return;
    };
    system.content.push_str("\nYou remember:");
    for memory in remembered {
        system.content.push_str("\n- ");
        system.content.push_str(&memory.summary);
    }
}

async fn compose_text(llm: Option<&LlmClient>, materials: &PromptMaterials) -> String {
    let fallback = format!(
        "{} nods at {}.",
        materials.my_name, materials.partner_name
    );
    let Some(client) = llm else {
        return fallback;
    };

    let attempt = tokio::time::timeout(
        Duration::from_millis(ACTION_TIMEOUT as u64),
        client.chat(&materials.messages, &materials.stop_words, true),
    )
    .await;

    match attempt {
        Ok(Ok(text)) if !text.trim().is_empty() => strip_speaker_prefix(&text, &materials.my_name),
        Ok(Ok(_)) => fallback,
        Ok(Err(err)) => {
            warn!(error = %err, "chat completion failed");
            fallback
        }
        Err(_) => {
            warn!("chat completion timed out");
            fallback
        }
    }
}

/// Models often lead with their own name; the transcript stores bare text.
fn strip_speaker_prefix(text: &str, name: &str) -> String {
    let trimmed = text.trim();
    trimmed
        .strip_prefix(&format!("{name}:"))
        .map(str::trim)
        .unwrap_or(trimmed)
        .to_string()
}

/// Summarise a finished conversation, embed the summary, and store it for
/// future prompts with the same partner.
async fn memorize_conversation(
    api: &SharedApi,
    llm: Option<&LlmClient>,
    agent_id: &str,
    conversation_id: &str,
) {
    let (player_id, partner_id, transcript, partner_name) = {
        let guard = api.lock().await;
        let town = guard.town();
        let Some(agent) = town.agents.get(agent_id) else {
            return;
        };
        let player_id = agent.player_id.clone();
        let partner_id = town
            .members_of(conversation_id)
            .into_iter()
            .map(|m| m.player_id.clone())
            .find(|id| *id != player_id);
        let Some(partner_id) = partner_id else {
            return;
        };
        let partner_name = town
            .players
            .get(&partner_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| partner_id.clone());
        let transcript: Vec<String> = town
            .messages_of(conversation_id)
            .into_iter()
            .map(|m| {
                let author = town
                    .players
                    .get(&m.author_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| m.author_id.clone());
                format!("{author}: {}", m.text)
            })
            .collect();
        (player_id, partner_id, transcript, partner_name)
    };

    if transcript.is_empty() {
        return;
    }

    let summary = match llm {
        Some(client) => {
            let prompt = vec![
                ChatMessage::system(
                    "Summarise this conversation in one sentence, from the first speaker's \
                     point of view.",
                ),
                ChatMessage::user(transcript.join("\n")),
            ];
            match client.chat(&prompt, &[], false).await {
                Ok(text) if !text.trim().is_empty() => text,
                _ => format!("Talked with {partner_name}."),
            }
        }
        None => format!("Talked with {partner_name}."),
    };

    let embedding = match llm {
        Some(client) => client
            .embed(&[summary.clone()])
            .await
            .ok()
            .and_then(|mut vectors| vectors.pop())
            .unwrap_or_default(),
        None => Vec::new(),
    };

    let created_ts = now_ms();
    let mut guard = api.lock().await;
    guard.store_memory(AgentMemoryRow {
        id: make_id("memories", created_ts as u64),
        player_id,
        partner_id,
        summary,
        embedding,
        created_ts,
    });
}

/// Cosine similarity for memory ranking when query embeddings are present.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::WorldConfig;

    #[test]
    fn cosine_similarity_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let same = cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!((same - 1.0).abs() < 1e-6);
        let opposite = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((opposite + 1.0).abs() < 1e-6);
    }

    #[test]
    fn speaker_prefix_is_stripped_from_replies() {
        assert_eq!(strip_speaker_prefix("Maren: hello there", "Maren"), "hello there");
        assert_eq!(strip_speaker_prefix("hello there", "Maren"), "hello there");
        assert_eq!(strip_speaker_prefix("  Toby: hm  ", "Toby"), "hm");
    }

    fn memory(n: u64, ts: f64, embedding: Vec<f32>) -> AgentMemoryRow {
        AgentMemoryRow {
            id: make_id("memories", n),
            player_id: "players:1".to_string(),
            partner_id: "players:2".to_string(),
            summary: format!("memory {n}"),
            embedding,
            created_ts: ts,
        }
    }

    #[test]
    fn memories_rank_by_recency_without_a_query() {
        let candidates = vec![
            memory(1, 100.0, Vec::new()),
            memory(2, 300.0, Vec::new()),
            memory(3, 200.0, Vec::new()),
            memory(4, 250.0, Vec::new()),
        ];
        let ranked = rank_memories(&candidates, None);
        let summaries: Vec<&str> = ranked.iter().map(|m| m.summary.as_str()).collect();
        assert_eq!(summaries, vec!["memory 2", "memory 4", "memory 3"]);
    }

    #[test]
    fn memories_rank_by_similarity_with_a_query() {
        let candidates = vec![
            memory(1, 300.0, vec![0.0, 1.0]),
            memory(2, 100.0, vec![1.0, 0.0]),
        ];
        let ranked = rank_memories(&candidates, Some(&[1.0, 0.1]));
        assert_eq!(ranked[0].summary, "memory 2");
    }

    #[test]
    fn prompt_contains_identity_transcript_and_stop_words() {
        let api = EngineApi::from_config(WorldConfig::default());
        let snapshot = api.snapshot();
        let a = &snapshot.players[0];
        let b = &snapshot.players[1];

        let materials = gather_prompt(&api, &a.id, &b.id, "conversations:404");
        assert_eq!(materials.my_name, a.name);
        assert!(materials.stop_words.contains(&format!("{}:", b.name)));
        let system = &materials.messages[0].content;
        assert!(system.contains(&a.name));
        assert!(system.contains(&b.name));
        assert!(materials.query_text.is_none());

        let mut materials = materials;
        let remembered = vec![memory(1, 100.0, Vec::new())];
        let refs: Vec<&AgentMemoryRow> = remembered.iter().collect();
        inject_memories(&mut materials, &refs);
        assert!(materials.messages[0].content.contains("memory 1"));
    }
}
