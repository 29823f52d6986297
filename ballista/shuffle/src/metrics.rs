// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Shuffle write metrics, registered on a DataFusion metrics set.

use datafusion::physical_plan::metrics::{self, ExecutionPlanMetricsSet, MetricBuilder};

/// Metrics reported by both shuffle writers for one map task.
#[derive(Debug, Clone)]
pub struct ShuffleWriteMetrics {
    /// Time spent writing sorted runs, merging and concatenating
    pub write_time: metrics::Time,
    /// Records written to spill files or the final output
    pub records_written: metrics::Count,
    /// Bytes in the committed output. A gauge because the merge corrects
    /// the estimate made while the last run was written.
    pub bytes_written: metrics::Gauge,
    /// Number of spills
    pub spill_count: metrics::Count,
    /// In-memory bytes released by spills
    pub spilled_bytes: metrics::Count,
    /// Bytes written to spill files
    pub spilled_disk_bytes: metrics::Count,
    /// Largest amount of memory held by the writer
    pub peak_mem_used: metrics::Gauge,
}

impl ShuffleWriteMetrics {
    /// Registers the metrics of `partition` in `metrics`.
    pub fn new(partition: usize, metrics: &ExecutionPlanMetricsSet) -> Self {
        Self {
            write_time: MetricBuilder::new(metrics).subset_time("write_time", partition),
            records_written: MetricBuilder::new(metrics).output_rows(partition),
            bytes_written: MetricBuilder::new(metrics).gauge("bytes_written", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            spilled_bytes: MetricBuilder::new(metrics).spilled_bytes(partition),
            spilled_disk_bytes: MetricBuilder::new(metrics)
                .counter("spilled_disk_bytes", partition),
            peak_mem_used: MetricBuilder::new(metrics).gauge("peak_mem_used", partition),
        }
    }
}
