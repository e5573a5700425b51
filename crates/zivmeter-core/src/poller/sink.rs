//! Sensor sinks
//!
//! Where scaled readings go. Any `FnMut(f64)` closure is a sink.

/// Receiver of published readings
pub trait SensorSink {
    /// Accept one scaled value
    fn publish(&mut self, value: f64);
}

impl<F: FnMut(f64)> SensorSink for F {
    fn publish(&mut self, value: f64) {
        self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_a_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |v: f64| seen.push(v);
            sink.publish(1.5);
            sink.publish(-2.0);
        }
        assert_eq!(seen, vec![1.5, -2.0]);
    }
}
