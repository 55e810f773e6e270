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
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge, Registry,
};

lazy_static! {
    static ref WORKER_REGISTRATIONS_TOTAL: IntCounter = register_int_counter!(
        "weft_worker_registrations_total",
        "Number of accepted worker registrations"
    )
    .unwrap();
    static ref WORKER_HEARTBEATS_TOTAL: IntCounter = register_int_counter!(
        "weft_worker_heartbeats_total",
        "Number of accepted worker heartbeats"
    )
    .unwrap();
    static ref WORKERS_ONLINE: IntGauge = register_int_gauge!(
        "weft_workers_online",
        "Number of non-stale workers in the registry"
    )
    .unwrap();
    static ref PROXY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "weft_proxy_attempts_total",
        "Reverse-proxy attempts against workers",
        &["service", "outcome"]
    )
    .unwrap();
}

pub fn record_worker_registration() {
    WORKER_REGISTRATIONS_TOTAL.inc();
}

pub fn record_worker_heartbeat() {
    WORKER_HEARTBEATS_TOTAL.inc();
}

pub fn set_workers_online(count: i64) {
    WORKERS_ONLINE.set(count);
}

pub fn record_proxy_attempt(service: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    PROXY_ATTEMPTS_TOTAL
        .with_label_values(&[service, outcome])
        .inc();
}

/// Registers every coordinator metric into a fresh registry for the
/// `/metrics` exporter. The metrics themselves live in the default
/// registry as well, so recording does not need this handle.
pub fn register_all() -> Registry {
    let registry = Registry::new();
    registry
        .register(Box::new(WORKER_REGISTRATIONS_TOTAL.clone()))
        .expect("metric registration must not fail at startup");
    registry
        .register(Box::new(WORKER_HEARTBEATS_TOTAL.clone()))
        .expect("metric registration must not fail at startup");
    registry
        .register(Box::new(WORKERS_ONLINE.clone()))
        .expect("metric registration must not fail at startup");
    registry
        .register(Box::new(PROXY_ATTEMPTS_TOTAL.clone()))
        .expect("metric registration must not fail at startup");
    registry
}
