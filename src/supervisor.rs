//! Queue-and-health gate for the backend process.
//!
//! The supervisor decides when the backend is ready to accept work and drives
//! the reboot recovery path. Liveness is "the stats call answers"; health
//! additionally requires free RAM and VRAM above configurable fractions of
//! the totals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{Client, StatsResp};
use crate::error::{Error, Result};

const ALIVE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Health thresholds, as fractions of the respective totals.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub ram_free: f64,
    pub vram_free: f64,
    pub torch_vram_free: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ram_free: 0.1,
            vram_free: 0.2,
            torch_vram_free: 0.1,
        }
    }
}

/// Backend health supervisor.
pub struct Supervisor {
    client: Arc<Client>,
    thresholds: Thresholds,
}

impl Supervisor {
    pub fn new(client: Arc<Client>, thresholds: Thresholds) -> Self {
        Self { client, thresholds }
    }

    /// Return immediately when the queue is empty and the system healthy;
    /// otherwise reboot and wait for the backend to come back.
    pub async fn keep_system_healthy(&self, token: &CancellationToken) -> Result<()> {
        if self.is_queue_empty().await && self.is_system_healthy().await {
            return Ok(());
        }
        self.waiting_for_reboot(token).await
    }

    /// Fire a reboot (ignoring any response or network error) and wait for
    /// the backend to answer again.
    pub async fn waiting_for_reboot(&self, token: &CancellationToken) -> Result<()> {
        info!("system start reboot...");
        let _ = self.client.reboot().await;
        self.waiting_for_system_alive(token).await
    }

    /// Poll until the stats call answers. Only cancellation ends the loop.
    pub async fn waiting_for_system_alive(&self, token: &CancellationToken) -> Result<()> {
        for i in 0u64.. {
            if self.is_system_alive().await {
                info!("system is alive");
                return Ok(());
            }
            info!("waiting for system up... {i}");
            tokio::select! {
                _ = token.cancelled() => {
                    warn!("waiting for system up canceled");
                    return Err(Error::Canceled);
                }
                _ = tokio::time::sleep(ALIVE_POLL_INTERVAL) => {}
            }
        }
        unreachable!()
    }

    pub async fn is_system_alive(&self) -> bool {
        self.client.system_stats().await.is_ok()
    }

    pub async fn is_system_healthy(&self) -> bool {
        let stats = match self.client.system_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("system stats: {e}");
                return false;
            }
        };
        self.check_stats(&stats)
    }

    fn check_stats(&self, stats: &StatsResp) -> bool {
        let system = &stats.system;
        if (system.ram_free as f64) < system.ram_total as f64 * self.thresholds.ram_free {
            warn!(
                "system ram is low: {}/{}",
                system.ram_free, system.ram_total
            );
            return false;
        }

        let mut vram_total = 0u64;
        let mut vram_free = 0u64;
        let mut torch_total = 0u64;
        let mut torch_free = 0u64;
        for device in &stats.devices {
            vram_total += device.vram_total;
            vram_free += device.vram_free;
            torch_total += device.torch_vram_total;
            torch_free += device.torch_vram_free;
        }

        if (vram_free as f64) < vram_total as f64 * self.thresholds.vram_free {
            warn!("system vram is low: {vram_free}/{vram_total}");
            return false;
        }
        if (torch_free as f64) < torch_total as f64 * self.thresholds.torch_vram_free {
            warn!("system torch vram is low: {torch_free}/{torch_total}");
            return false;
        }

        info!(
            "system is healthy, free vram: {vram_free}/{vram_total}, free torch vram: {torch_free}/{torch_total}"
        );
        true
    }

    pub async fn is_queue_empty(&self) -> bool {
        let resp = match self.client.get_prompt().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("queue empty check: {e}");
                return false;
            }
        };
        let remaining = resp.exec_info.queue_remaining;
        if remaining != 0 {
            warn!("queue empty check: not empty, remain: {remaining}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DeviceInfo, SystemInfo};
    use crate::config::ClientConfig;

    fn supervisor(thresholds: Thresholds) -> Supervisor {
        let client = Arc::new(Client::new(ClientConfig::default()).unwrap());
        Supervisor::new(client, thresholds)
    }

    fn stats(ram: (u64, u64), devices: &[((u64, u64), (u64, u64))]) -> StatsResp {
        StatsResp {
            system: SystemInfo {
                ram_total: ram.0,
                ram_free: ram.1,
                ..Default::default()
            },
            devices: devices
                .iter()
                .map(|((vram_total, vram_free), (torch_total, torch_free))| DeviceInfo {
                    vram_total: *vram_total,
                    vram_free: *vram_free,
                    torch_vram_total: *torch_total,
                    torch_vram_free: *torch_free,
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn healthy_when_all_thresholds_hold() {
        let sv = supervisor(Thresholds::default());
        let good = stats((100, 50), &[((100, 80), (10, 5))]);
        assert!(sv.check_stats(&good));
    }

    #[test]
    fn low_ram_fails() {
        let sv = supervisor(Thresholds::default());
        let low = stats((100, 5), &[((100, 80), (0, 0))]);
        assert!(!sv.check_stats(&low));
    }

    #[test]
    fn vram_sums_across_devices() {
        let sv = supervisor(Thresholds::default());
        // one starved device compensated by another
        let split = stats((100, 50), &[((100, 0), (0, 0)), ((100, 60), (0, 0))]);
        assert!(sv.check_stats(&split));

        let starved = stats((100, 50), &[((100, 10), (0, 0)), ((100, 5), (0, 0))]);
        assert!(!sv.check_stats(&starved));
    }

    #[test]
    fn low_torch_vram_fails() {
        let sv = supervisor(Thresholds::default());
        let low = stats((100, 50), &[((100, 80), (100, 2))]);
        assert!(!sv.check_stats(&low));
    }
}
