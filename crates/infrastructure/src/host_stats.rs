use std::sync::{Arc, Mutex};

use sysinfo::System;

use fleet_core::{NodeCapabilities, NodeStats, StatsProvider};

/// 运行中任务数与容量的来源（Agent 的准入控制实现它）
pub trait SlotReporter: Send + Sync {
    fn running(&self) -> u32;
    fn capacity(&self) -> u32;
}

/// 读取本机主机名
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

/// 基于 sysinfo 的本机资源采集
pub struct HostStatsProvider {
    hostname: String,
    system: Mutex<System>,
    slots: Option<Arc<dyn SlotReporter>>,
}

impl HostStatsProvider {
    pub fn new(hostname: Option<String>) -> Self {
        let mut system = System::new_all();
        system.refresh_memory();
        Self {
            hostname: hostname.unwrap_or_else(local_hostname),
            system: Mutex::new(system),
            slots: None,
        }
    }

    /// 附带槽位信息，stats 中会带上 runningTasks/maxTasks/availableSlots
    pub fn with_slots(mut self, slots: Arc<dyn SlotReporter>) -> Self {
        self.slots = Some(slots);
        self
    }

    fn cpu_count(system: &System) -> u32 {
        let count = system.cpus().len() as u32;
        if count > 0 {
            count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        }
    }
}

impl StatsProvider for HostStatsProvider {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn capabilities(&self) -> NodeCapabilities {
        let system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        NodeCapabilities {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: Self::cpu_count(&system),
            total_memory_bytes: system.total_memory(),
        }
    }

    fn stats(&self) -> NodeStats {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        let free = system.available_memory();
        let usage = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let (running, max, available) = match &self.slots {
            Some(slots) => {
                let running = slots.running();
                let max = slots.capacity();
                (
                    Some(running),
                    Some(max),
                    Some(max.saturating_sub(running)),
                )
            }
            None => (None, None, None),
        };

        NodeStats {
            load_average_1m: System::load_average().one,
            memory_used_bytes: used,
            memory_free_bytes: free,
            memory_total_bytes: total,
            memory_usage_percent: usage,
            uptime_seconds: System::uptime(),
            running_task_count: running,
            max_task_count: max,
            available_slot_count: available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSlots;

    impl SlotReporter for FixedSlots {
        fn running(&self) -> u32 {
            3
        }
        fn capacity(&self) -> u32 {
            4
        }
    }

    #[test]
    fn test_host_stats_without_slots() {
        let provider = HostStatsProvider::new(Some("test-host".to_string()));
        assert_eq!(provider.hostname(), "test-host");
        let caps = provider.capabilities();
        assert!(caps.cpu_count >= 1);
        assert_eq!(caps.platform, std::env::consts::OS);
        let stats = provider.stats();
        assert!(stats.running_task_count.is_none());
        assert!(stats.memory_usage_percent >= 0.0 && stats.memory_usage_percent <= 100.0);
    }

    #[test]
    fn test_host_stats_reports_slots() {
        let provider = HostStatsProvider::new(None).with_slots(Arc::new(FixedSlots));
        let stats = provider.stats();
        assert_eq!(stats.running_task_count, Some(3));
        assert_eq!(stats.max_task_count, Some(4));
        assert_eq!(stats.available_slot_count, Some(1));
        assert!(!provider.hostname().is_empty());
    }
}
