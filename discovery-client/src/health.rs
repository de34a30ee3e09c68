use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sysinfo::{Disks, System};

/// Usage of one logical CPU, or the average over all of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuUsage {
    pub model: String,
    /// Frequency in MHz, absent on the average entry.
    pub speed: Option<u64>,
    /// Percentage, 0 to 100.
    pub usage: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub caption: String,
    pub size: u64,
    pub free: u64,
    pub used: u64,
    pub usage: f64,
}

/// A point-in-time view of the resources used by the host, served at the health check URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub cpu_usage: Vec<CpuUsage>,
    pub memory_usage: MemoryUsage,
    pub disk_usage: Vec<DiskUsage>,
    /// Seconds since the sampler was created.
    pub uptime: u64,
    pub status: &'static str,
}

impl IntoResponse for HealthSnapshot {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

pub struct HealthSampler {
    system: Mutex<System>,
    started: time::Instant,
}

impl HealthSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            started: time::Instant::now(),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_all();
        system.refresh_memory();

        let mut cpu_usage: Vec<CpuUsage> = system
            .cpus()
            .iter()
            .map(|cpu| CpuUsage {
                model: cpu.brand().to_owned(),
                speed: Some(cpu.frequency()),
                usage: cpu.cpu_usage(),
            })
            .collect();
        cpu_usage.push(CpuUsage {
            model: "Average".to_owned(),
            speed: None,
            usage: system.global_cpu_usage(),
        });

        let total = system.total_memory();
        let available = system.available_memory();
        let memory_usage = MemoryUsage {
            total,
            available,
            used: system.used_memory(),
            usage: percent(total.saturating_sub(available), total),
        };
        drop(system);

        let disk_usage = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .map(|disk| {
                let size = disk.total_space();
                let free = disk.available_space();
                let used = size.saturating_sub(free);
                DiskUsage {
                    caption: disk.mount_point().to_string_lossy().into_owned(),
                    size,
                    free,
                    used,
                    usage: percent(used, size),
                }
            })
            .collect();

        HealthSnapshot {
            cpu_usage,
            memory_usage,
            disk_usage,
            uptime: self.started.elapsed().as_secs(),
            status: "OK",
        }
    }
}

impl Default for HealthSampler {
    fn default() -> Self {
        Self::new()
    }
}

async fn health(State(sampler): State<Arc<HealthSampler>>) -> Result<HealthSnapshot, StatusCode> {
    // Sampling refreshes every CPU and disk, keep it off the async workers.
    tokio::task::spawn_blocking(move || sampler.snapshot())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serve health snapshots at `path`.
pub fn health_routes(path: &str, sampler: Arc<HealthSampler>) -> Router {
    Router::new().route(path, get(health)).with_state(sampler)
}
