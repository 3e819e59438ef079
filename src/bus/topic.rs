//! Topic names and per-topic delivery guarantees.
//!
//! Every bench has its own namespace:
//!
//! | topic                | direction | payload                         | qos            |
//! |----------------------|-----------|---------------------------------|----------------|
//! | `benchX/step`        | inbound   | integer 1–9                     | at-least-once  |
//! | `benchX/bms/data`    | inbound   | 27 comma-separated numbers      | at-most-once   |
//! | `benchX/ri/results`  | inbound   | JSON averages                   | at-least-once  |
//! | `benchX/security`    | outbound  | free-text alert                 | at-least-once  |
//! | `benchX/command`     | outbound  | JSON resume state, or `"end"`   | at-least-once  |
//! | `printer/test_done`  | outbound  | JSON serial + timestamp         | at-least-once  |

use super::Qos;

pub const TEST_DONE_TOPIC: &str = "printer/test_done";

/// Command payload asking every controller to stop in an orderly way.
pub const END_COMMAND: &str = "end";

/// Topic set of one bench.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchTopics {
    pub step: String,
    pub bms_data: String,
    pub ri_results: String,
    pub security: String,
    pub command: String,
}

impl BenchTopics {
    pub fn new(bench: &str) -> Self {
        Self {
            step: format!("{bench}/step"),
            bms_data: format!("{bench}/bms/data"),
            ri_results: format!("{bench}/ri/results"),
            security: format!("{bench}/security"),
            command: format!("{bench}/command"),
        }
    }

    /// Topics a running test consumes.
    pub fn inbound(&self) -> Vec<String> {
        vec![
            self.step.clone(),
            self.bms_data.clone(),
            self.ri_results.clone(),
        ]
    }
}

/// Delivery guarantee used for `topic`.
///
/// Sensor samples are high-rate and superseded by the next one; everything
/// else must not be lost.
pub fn qos_for(topic: &str) -> Qos {
    if topic.ends_with("/bms/data") {
        Qos::AtMostOnce
    } else {
        Qos::AtLeastOnce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_namespace() {
        let t = BenchTopics::new("bench2");
        assert_eq!(t.step, "bench2/step");
        assert_eq!(t.bms_data, "bench2/bms/data");
        assert_eq!(t.ri_results, "bench2/ri/results");
        assert_eq!(t.security, "bench2/security");
        assert_eq!(t.command, "bench2/command");
        assert_eq!(t.inbound().len(), 3);
    }

    #[test]
    fn test_qos_per_topic() {
        assert_eq!(qos_for("bench1/bms/data"), Qos::AtMostOnce);
        assert_eq!(qos_for("bench1/step"), Qos::AtLeastOnce);
        assert_eq!(qos_for(TEST_DONE_TOPIC), Qos::AtLeastOnce);
    }
}
