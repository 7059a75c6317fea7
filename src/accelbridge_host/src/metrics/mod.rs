/*
Copyright 2025  The Accelbridge Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Once;
use std::time::Duration;

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric to the underlying metrics system.
    /// The first time this is called for a given metric variant, it will
    /// also describe the metric to the underlying metrics system.
    fn emit(self);
}

#[derive(Clone, Debug)]
pub(crate) enum CounterMetric {
    /// A task was carried through its full lifecycle and its slot released.
    TasksHandled,
    /// A contiguous bulk-data packet was issued to the device.
    BulkPacketsIssued,
}

#[derive(Clone, Debug)]
pub(crate) enum HistogramMetric {
    /// Time a task spent in one pipeline phase, labelled by phase name
    /// (`pre_submit`, `submit`, `collect`, `response`, `hardware`).
    FlowPhase {
        phase: &'static str,
        duration: Duration,
    },
    /// Number of tasks coalesced into one wire packet, labelled by
    /// direction (`request`, `response`, `bulk`).
    BatchSize {
        direction: &'static str,
        tasks: usize,
    },
    /// Duration of one blocking transport transfer, labelled by direction
    /// (`read`, `write`).
    TransportTransfer {
        direction: &'static str,
        duration: Duration,
    },
}

static LABEL_PHASE: &str = "phase";
static LABEL_DIRECTION: &str = "direction";

impl CounterMetric {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            CounterMetric::TasksHandled => "tasks_handled_total",
            CounterMetric::BulkPacketsIssued => "bulk_packets_issued_total",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            CounterMetric::TasksHandled => "Number of tasks carried to slot release",
            CounterMetric::BulkPacketsIssued => "Number of contiguous bulk-data packets issued",
        }
    }
}

impl HistogramMetric {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            HistogramMetric::FlowPhase { .. } => "task_flow_phase_seconds",
            HistogramMetric::BatchSize { .. } => "wire_batch_tasks",
            HistogramMetric::TransportTransfer { .. } => "transport_transfer_seconds",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            HistogramMetric::FlowPhase { .. } => "Time a task spent in one pipeline phase",
            HistogramMetric::BatchSize { .. } => "Tasks coalesced into one wire packet",
            HistogramMetric::TransportTransfer { .. } => "Duration of one blocking transfer",
        }
    }
}

impl EmittableMetric for CounterMetric {
    /// Increases the counter represented by `self` by 1
    fn emit(self) {
        let name = self.name();
        let description = self.description();

        match self {
            CounterMetric::TasksHandled => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, metrics::Unit::Count, description);
                });

                metrics::counter!(name).increment(1);
            }
            CounterMetric::BulkPacketsIssued => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, metrics::Unit::Count, description);
                });

                metrics::counter!(name).increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        let metric_name = self.name();
        let description = self.description();

        match self {
            HistogramMetric::FlowPhase { phase, duration } => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_histogram!(metric_name, metrics::Unit::Seconds, description);
                });

                metrics::histogram!(metric_name, LABEL_PHASE => phase).record(duration);
            }
            HistogramMetric::BatchSize { direction, tasks } => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_histogram!(metric_name, metrics::Unit::Count, description);
                });

                metrics::histogram!(metric_name, LABEL_DIRECTION => direction).record(tasks as f64);
            }
            HistogramMetric::TransportTransfer {
                direction,
                duration,
            } => {
                // Describe each metric variant only once
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_histogram!(metric_name, metrics::Unit::Seconds, description);
                });

                metrics::histogram!(metric_name, LABEL_DIRECTION => direction).record(duration);
            }
        }
    }
}
