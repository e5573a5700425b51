//! Meter Poller
//!
//! Sequences the step handlers through one read cycle:
//!
//! ```text
//! Idle -> LinkReset -> Associate -> Read(0) -> ... -> Read(n-1) -> Idle
//! ```
//!
//! [`update`](MeterPoller::update) starts a cycle, [`advance`](MeterPoller::advance)
//! is called every tick. Any failure returns straight to Idle; the next
//! `update` starts over with a link reset.

mod sink;

pub use sink::SensorSink;

use serde::Serialize;
use std::fmt;

use crate::protocol::{
    AttributeRef, Codec, CommunicationEngine, ProtocolError, Step, StepHandler, StepResult,
    Transport,
};

/// Position in the read cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    /// Waiting for the next update
    Idle,
    /// Resetting the data link
    LinkReset,
    /// Opening the application association
    Associate,
    /// Index into the configured reads
    Read(usize),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::LinkReset => write!(f, "link reset"),
            State::Associate => write!(f, "associate"),
            State::Read(i) => write!(f, "read #{i}"),
        }
    }
}

/// One configured register read
pub struct ReadStep {
    /// Human readable name, used in logs
    pub name: String,
    /// Register attribute to read
    pub attribute: AttributeRef,
    /// Multiplier applied to the raw integer before publishing
    pub scale: f64,
    /// Receiver of the scaled value, if any
    pub sink: Option<Box<dyn SensorSink>>,
}

impl ReadStep {
    /// Read without a sink
    pub fn new(name: impl Into<String>, attribute: AttributeRef, scale: f64) -> Self {
        Self {
            name: name.into(),
            attribute,
            scale,
            sink: None,
        }
    }

    /// Bind a sink for the scaled value
    pub fn with_sink(mut self, sink: impl SensorSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }
}

impl fmt::Debug for ReadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadStep")
            .field("name", &self.name)
            .field("attribute", &self.attribute)
            .field("scale", &self.scale)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Cycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    /// Cycles that read every register
    pub completed_cycles: u64,
    /// Cycles abandoned on a failed step
    pub failed_cycles: u64,
    /// Failures caused by the link rather than the meter's answer
    pub link_faults: u64,
    /// Values handed to sinks
    pub published: u64,
}

/// Read-cycle state machine over a [`CommunicationEngine`]
pub struct MeterPoller<T, C: Codec> {
    engine: CommunicationEngine<T, C>,
    reads: Vec<ReadStep>,
    state: State,
    handler: Option<StepHandler>,
    stats: PollerStats,
}

impl<T: Transport, C: Codec> MeterPoller<T, C> {
    /// Idle poller running `reads` in order after each association
    pub fn new(engine: CommunicationEngine<T, C>, reads: Vec<ReadStep>) -> Self {
        Self {
            engine,
            reads,
            state: State::Idle,
            handler: None,
            stats: PollerStats::default(),
        }
    }

    /// Current position in the cycle
    pub fn state(&self) -> State {
        self.state
    }

    /// State with the read's configured name
    pub fn state_name(&self) -> String {
        match self.state {
            State::Read(i) => self
                .reads
                .get(i)
                .map_or_else(|| self.state.to_string(), |r| format!("read {}", r.name)),
            state => state.to_string(),
        }
    }

    /// Engine driving the steps
    pub fn engine(&self) -> &CommunicationEngine<T, C> {
        &self.engine
    }

    /// Engine driving the steps, mutably
    pub fn engine_mut(&mut self) -> &mut CommunicationEngine<T, C> {
        &mut self.engine
    }

    /// Configured reads
    pub fn reads(&self) -> &[ReadStep] {
        &self.reads
    }

    /// Handler of the step in progress (none while idle)
    pub fn handler(&self) -> Option<&StepHandler> {
        self.handler.as_ref()
    }

    /// Counters since construction
    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    /// True between cycles
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Start a read cycle; ignored while one is running
    pub fn update(&mut self) {
        if self.state == State::Idle {
            self.transition(State::LinkReset);
        } else {
            tracing::trace!("update ignored in state {}", self.state_name());
        }
    }

    /// Do one tick of work on the current step
    pub fn advance(&mut self) {
        if self.state == State::Idle {
            return;
        }
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        self.engine.tick(handler);
        let result = handler.result();
        let value = handler.value();

        match result {
            StepResult::Pending => {}
            StepResult::Success(_) => {
                if let State::Read(i) = self.state {
                    self.publish(i, value.unwrap_or_default());
                }
                let next = self.next_state();
                if next == State::Idle {
                    self.stats.completed_cycles += 1;
                    tracing::debug!("read cycle complete");
                }
                self.transition(next);
            }
            StepResult::Failure(code) => {
                let reason = match self.engine.fault() {
                    Some(fault) => {
                        if fault.is_link_fault() {
                            self.stats.link_faults += 1;
                        }
                        fault.to_string()
                    }
                    None => ProtocolError::Parse(code).to_string(),
                };
                tracing::error!("{} failed with code {code}: {reason}", self.state_name());
                self.stats.failed_cycles += 1;
                self.transition(State::Idle);
            }
        }
    }

    /// Log the configured reads and engine settings
    pub fn log_config(&self) {
        let config = self.engine.config();
        tracing::info!(
            "meter poller: timeout {}ms, send chunk {} bytes, frame end {:#04x}",
            config.timeout_ms,
            config.send_chunk,
            config.frame_end_marker
        );
        for read in &self.reads {
            tracing::info!(
                "  {}: {} x{}{}",
                read.name,
                read.attribute,
                read.scale,
                if read.sink.is_some() { "" } else { " (no sensor)" }
            );
        }
    }

    fn next_state(&self) -> State {
        let read_or_idle = |i: usize| {
            if i < self.reads.len() {
                State::Read(i)
            } else {
                State::Idle
            }
        };
        match self.state {
            State::Idle => State::Idle,
            State::LinkReset => State::Associate,
            State::Associate => read_or_idle(0),
            State::Read(i) => read_or_idle(i + 1),
        }
    }

    fn step_for(&self, state: State) -> Option<Step> {
        match state {
            State::Idle => None,
            State::LinkReset => Some(Step::LinkReset),
            State::Associate => Some(Step::Associate),
            State::Read(i) => self
                .reads
                .get(i)
                .map(|r| Step::AttributeRead(r.attribute.clone())),
        }
    }

    fn transition(&mut self, next: State) {
        tracing::debug!("{} -> {}", self.state, next);
        self.engine.reset();
        self.handler = self.step_for(next).map(StepHandler::new);
        if let Some(handler) = self.handler.as_mut() {
            self.engine.begin(handler);
        }
        self.state = if self.handler.is_some() { next } else { State::Idle };
    }

    fn publish(&mut self, index: usize, raw: i64) {
        let Some(read) = self.reads.get_mut(index) else {
            return;
        };
        let value = raw as f64 * read.scale;
        tracing::info!("{}: {value}", read.name);
        if let Some(sink) = read.sink.as_mut() {
            sink.publish(value);
            self.stats.published += 1;
        }
    }
}
