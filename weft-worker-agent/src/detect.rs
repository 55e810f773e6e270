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

use crate::config::WorkerAgentConfig;
use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::{debug, info};
use weft_common::model::Capabilities;

/// Inspects the host and builds the capability report sent to the
/// coordinator. The configured worker type is passed through; `auto` is
/// resolved by the shared capability rules once the hardware fields are
/// filled in.
pub async fn detect_capabilities(config: &WorkerAgentConfig) -> Capabilities {
    let mut system = System::new_all();
    system.refresh_all();

    let cpu_cores = system.cpus().len() as u32;
    let ram_gb = (system.total_memory() / (1024 * 1024 * 1024)) as u32;
    let storage_gb = total_disk_gb();
    let gpu_type = probe_nvidia_gpu().await;

    let capabilities = Capabilities {
        worker_type: config.worker_type,
        has_gpu: gpu_type.is_some(),
        gpu_type,
        cpu_cores: Some(cpu_cores),
        ram_gb: Some(ram_gb),
        storage_gb: Some(storage_gb),
        public_ip: config.public_ip.clone(),
    };

    info!(
        worker_type = %capabilities.resolved_type(),
        cpu_cores,
        ram_gb,
        storage_gb,
        has_gpu = capabilities.has_gpu,
        "Detected host capabilities"
    );
    capabilities
}

fn total_disk_gb() -> u32 {
    let disks = Disks::new_with_refreshed_list();
    let total: u64 = disks.list().iter().map(|disk| disk.total_space()).sum();
    (total / (1024 * 1024 * 1024)) as u32
}

/// Asks `nvidia-smi` for the GPU model. Any failure just means "no
/// usable GPU" as far as assignment is concerned.
async fn probe_nvidia_gpu() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("nvidia-smi exited with {}", output.status);
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let name = stdout.lines().next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
