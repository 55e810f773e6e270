// Copyright 2024-2025 Weft Compute
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec, Registry};

lazy_static! {
    static ref FORWARDED_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "weft_edge_forwarded_requests_total",
        "Requests forwarded to coordinators",
        &["outcome"]
    )
    .unwrap();
}

/// `outcome` is one of `success`, `failure`, `no_coordinator`.
pub fn record_forward(outcome: &str) {
    FORWARDED_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn register_all() -> Registry {
    let registry = Registry::new();
    registry
        .register(Box::new(FORWARDED_REQUESTS_TOTAL.clone()))
        .expect("metric registration must not fail at startup");
    registry
}
