//! The engine state machine: an ordered input queue drained into the world
//! under a step window, sub-stepped tick advancement, and generation fencing
//! so a superseded self-schedule can never commit.

use contracts::constants::{INPUT_DELAY, MAX_STEP, STEP_INTERVAL, TICK};
use contracts::{make_id, EngineDoc, EngineState, Id, InputDoc, InputPayload, InputReturn};

use crate::world::{AiTown, WorldFlush};

/// Pending and processed inputs for one engine, keyed by their dense number.
#[derive(Debug, Default)]
pub struct InputQueue {
    engine_id: Id,
    inputs: std::collections::BTreeMap<u64, InputDoc>,
    next_number: u64,
}

impl InputQueue {
    pub fn new(engine_id: Id) -> Self {
        Self {
            engine_id,
            inputs: std::collections::BTreeMap::new(),
            next_number: 0,
        }
    }

    pub fn hydrate(engine_id: Id, rows: impl IntoIterator<Item = InputDoc>) -> Self {
        let mut queue = Self::new(engine_id);
        for row in rows {
            queue.next_number = queue.next_number.max(row.number + 1);
            queue.inputs.insert(row.number, row);
        }
        queue
    }

    pub fn insert(&mut self, payload: InputPayload, received_ts: f64) -> InputDoc {
        let number = self.next_number;
        self.next_number += 1;
        let doc = InputDoc {
            id: make_id("inputs", number),
            engine_id: self.engine_id.clone(),
            number,
            payload,
            received_ts,
            return_value: None,
        };
        self.inputs.insert(number, doc.clone());
        doc
    }

    pub fn get(&self, number: u64) -> Option<&InputDoc> {
        self.inputs.get(&number)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&InputDoc> {
        self.inputs.values().find(|input| input.id == id)
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    fn set_return(&mut self, number: u64, value: InputReturn) -> Option<&InputDoc> {
        let input = self.inputs.get_mut(&number)?;
        if input.return_value.is_none() {
            input.return_value = Some(value);
        }
        Some(input)
    }
}

/// What one `run_step` call produced. `committed` is false for fenced and
/// empty steps; a committed outcome carries the write set the caller must
/// persist atomically with the engine document.
#[derive(Debug)]
pub struct StepOutcome {
    pub committed: bool,
    pub processed_inputs: Vec<InputDoc>,
    pub flush: Option<WorldFlush>,
    pub next_scheduled_ts: Option<f64>,
}

#[derive(Debug)]
pub struct Engine {
    pub id: Id,
    pub generation_number: u64,
    pub state: EngineState,
    pub current_time: Option<f64>,
    pub last_step_ts: Option<f64>,
    pub processed_input_number: Option<u64>,
}

impl Engine {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            generation_number: 0,
            state: EngineState::Stopped,
            current_time: None,
            last_step_ts: None,
            processed_input_number: None,
        }
    }

    pub fn from_doc(doc: EngineDoc) -> Self {
        Self {
            id: doc.id,
            generation_number: doc.generation_number,
            state: doc.state,
            current_time: doc.current_time,
            last_step_ts: doc.last_step_ts,
            processed_input_number: doc.processed_input_number,
        }
    }

    pub fn doc(&self) -> EngineDoc {
        EngineDoc {
            id: self.id.clone(),
            generation_number: self.generation_number,
            state: self.state.clone(),
            current_time: self.current_time,
            last_step_ts: self.last_step_ts,
            processed_input_number: self.processed_input_number,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Stopped -> running. Each resume takes a fresh generation so steps
    /// scheduled before the stop stay dead.
    pub fn start(&mut self, now: f64) {
        if self.state.is_running() {
            return;
        }
        self.generation_number += 1;
        self.last_step_ts = Some(now);
        self.current_time = Some(now);
        self.state = EngineState::Running {
            scheduled_self_ts: now,
        };
    }

    pub fn stop(&mut self) {
        self.state = EngineState::Stopped;
    }

    /// Cancel the pending self-schedule and run as soon as possible.
    pub fn kick(&mut self, now: f64) {
        if !self.state.is_running() {
            return;
        }
        self.generation_number += 1;
        self.state = EngineState::Running {
            scheduled_self_ts: now,
        };
    }

    /// Whether an input arriving at `now` should kick rather than wait for
    /// the pending schedule.
    pub fn wants_kick(&self, now: f64) -> bool {
        match self.state.scheduled_self_ts() {
            Some(scheduled) => scheduled - now > INPUT_DELAY,
            None => false,
        }
    }

    /// One engine step. Fenced or stopped invocations return without
    /// touching the world; empty windows only reschedule.
    pub fn run_step(
        &mut self,
        town: &mut AiTown,
        inputs: &mut InputQueue,
        generation: u64,
        now: f64,
    ) -> StepOutcome {
        if generation != self.generation_number || !self.state.is_running() {
            return StepOutcome {
                committed: false,
                processed_inputs: Vec::new(),
                flush: None,
                next_scheduled_ts: None,
            };
        }

        let last_step_ts = self.last_step_ts.unwrap_or(now);
        let step_window = (now - last_step_ts).clamp(0.0, MAX_STEP);
        let window_end = last_step_ts + step_window;

        let next_number = self.processed_input_number.map(|n| n + 1).unwrap_or(0);
        let input_due = inputs
            .get(next_number)
            .map(|input| input.received_ts <= window_end)
            .unwrap_or(false);

        if step_window < TICK && !input_due {
            let next_scheduled_ts = now + STEP_INTERVAL;
            self.state = EngineState::Running {
                scheduled_self_ts: next_scheduled_ts,
            };
            return StepOutcome {
                committed: false,
                processed_inputs: Vec::new(),
                flush: None,
                next_scheduled_ts: Some(next_scheduled_ts),
            };
        }

        let mut processed_inputs = Vec::new();
        let mut number = next_number;
        while let Some(input) = inputs.get(number) {
            if input.received_ts > window_end {
                break;
            }
            let applied_at = input.received_ts.max(last_step_ts);
            let value = match town.apply_input(&input.payload, applied_at) {
                Ok(value) => InputReturn::ok(value),
                Err(err) => InputReturn::error(err.to_string()),
            };
            if let Some(updated) = inputs.set_return(number, value) {
                processed_inputs.push(updated.clone());
            }
            self.processed_input_number = Some(number);
            number += 1;
        }

        let mut t = last_step_ts;
        while t + TICK <= window_end {
            t += TICK;
            town.tick(t);
        }

        let flush = town.flush();

        self.current_time = Some(window_end);
        self.last_step_ts = Some(window_end);
        let next_scheduled_ts = window_end + STEP_INTERVAL;
        self.state = EngineState::Running {
            scheduled_self_ts: next_scheduled_ts,
        };

        StepOutcome {
            committed: true,
            processed_inputs,
            flush: Some(flush),
            next_scheduled_ts: Some(next_scheduled_ts),
        }
    }
}
