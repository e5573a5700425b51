//! Step handlers
//!
//! A step is one request/response exchange. The set of step kinds is fixed,
//! so a handler is a plain value dispatched by `match`.

use std::fmt;

use super::{AttributeRef, Codec, OutboundQueue};

/// Code stored by [`StepHandler::error`]
pub const ERROR_CODE: i32 = -1;

/// Tri-state outcome of a step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepResult {
    /// No verdict yet
    #[default]
    Pending,
    /// The meter accepted the request
    Success(i32),
    /// The attempt failed with the given code
    Failure(i32),
}

impl StepResult {
    /// Map a codec return code: 0 is success, anything else failure
    pub fn from_code(code: i32) -> Self {
        if code == 0 {
            StepResult::Success(code)
        } else {
            StepResult::Failure(code)
        }
    }

    /// True while no verdict has been reached
    pub fn is_pending(&self) -> bool {
        matches!(self, StepResult::Pending)
    }
}

/// What a step does on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Data link reset (SNRM/UA)
    LinkReset,
    /// Application association (AARQ/AARE)
    Associate,
    /// Read one attribute
    AttributeRead(AttributeRef),
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::LinkReset => write!(f, "link reset"),
            Step::Associate => write!(f, "associate"),
            Step::AttributeRead(attr) => write!(f, "read {attr}"),
        }
    }
}

/// The handler of the step currently being attempted
#[derive(Debug, Clone)]
pub struct StepHandler {
    step: Step,
    result: StepResult,
    value: Option<i64>,
}

impl StepHandler {
    /// Fresh pending handler for `step`
    pub fn new(step: Step) -> Self {
        Self {
            step,
            result: StepResult::Pending,
            value: None,
        }
    }

    /// Step this handler runs
    pub fn step(&self) -> &Step {
        &self.step
    }

    /// Verdict so far
    pub fn result(&self) -> StepResult {
        self.result
    }

    /// Last decoded value of an attribute read
    pub fn value(&self) -> Option<i64> {
        self.value
    }

    /// Reset the verdict and queue this step's messages
    ///
    /// A builder failure leaves the queue empty; the engine then aborts the
    /// attempt.
    pub fn start<C: Codec>(&mut self, codec: &mut C, queue: &mut OutboundQueue) {
        self.result = StepResult::Pending;
        self.value = None;

        let built = match &self.step {
            Step::LinkReset => codec.build_link_reset(),
            Step::Associate => codec.build_associate(),
            Step::AttributeRead(attr) => codec.build_attribute_read(attr),
        };
        match built {
            Ok(messages) => {
                for (i, message) in messages.iter().enumerate() {
                    tracing::debug!("{}: message {} size {}", self.step, i, message.len());
                }
                queue.extend(messages);
            }
            Err(e) => tracing::error!("{}: could not build request: {e}", self.step),
        }
    }

    /// Judge a complete reply
    pub fn parse<C: Codec>(&mut self, codec: &mut C, reply: &C::Reply) {
        if !self.result.is_pending() {
            return;
        }
        self.result = match &self.step {
            Step::LinkReset => StepResult::from_code(codec.parse_link_reset_reply(reply)),
            Step::Associate => StepResult::from_code(codec.parse_associate_reply(reply)),
            Step::AttributeRead(attr) => {
                let (code, value) = codec.parse_attribute_reply(attr, reply);
                if code == 0 {
                    self.value = Some(value);
                }
                StepResult::from_code(code)
            }
        };
        tracing::trace!("{}: parsed reply -> {:?}", self.step, self.result);
    }

    /// Force a failure (timeout, malformed frame, link error)
    pub fn error(&mut self) {
        self.result = StepResult::Failure(ERROR_CODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_from_code() {
        assert_eq!(StepResult::from_code(0), StepResult::Success(0));
        assert_eq!(StepResult::from_code(3), StepResult::Failure(3));
        assert_eq!(StepResult::from_code(-1), StepResult::Failure(-1));
    }

    #[test]
    fn test_error_overrides_success() {
        let mut handler = StepHandler::new(Step::Associate);
        handler.result = StepResult::Success(0);
        handler.error();
        assert_eq!(handler.result(), StepResult::Failure(ERROR_CODE));
    }

    #[test]
    fn test_step_display() {
        let step = Step::AttributeRead(AttributeRef::new("1.0.1.8.0.255", 2));
        assert_eq!(step.to_string(), "read 1.0.1.8.0.255/2");
    }
}
