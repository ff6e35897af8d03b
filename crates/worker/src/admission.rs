use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use tracing::debug;

use fleet_config::AgentConfig;
use fleet_core::StatsProvider;
use fleet_errors::{FleetError, FleetResult};
use fleet_infrastructure::SlotReporter;

/// 运行中任务计数器，准入控制的唯一闸门
#[derive(Debug)]
pub struct SlotCounter {
    running: AtomicUsize,
    capacity: usize,
}

impl SlotCounter {
    pub fn new(capacity: usize) -> Self {
        Self {
            running: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn capacity_count(&self) -> usize {
        self.capacity
    }

    /// 占用一个槽位，已满时返回 `None`
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let capacity = self.capacity;
        self.running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()
            .map(|previous| {
                gauge!("fleet_agent_running_jobs").set((previous + 1) as f64);
                SlotGuard {
                    counter: Arc::clone(self),
                }
            })
    }
}

impl SlotReporter for SlotCounter {
    fn running(&self) -> u32 {
        self.running_count() as u32
    }

    fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}

/// 槽位占用凭证，drop 时归还槽位
///
/// 无论任务以何种方式结束，计数器都只会减一次。
#[derive(Debug)]
pub struct SlotGuard {
    counter: Arc<SlotCounter>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let previous = self.counter.running.fetch_sub(1, Ordering::SeqCst);
        gauge!("fleet_agent_running_jobs").set(previous.saturating_sub(1) as f64);
    }
}

/// 准入控制：槽位上限 + 内存与 CPU 负载上限
pub struct AdmissionController {
    slots: Arc<SlotCounter>,
    stats: Arc<dyn StatsProvider>,
    max_memory_percent: f64,
    max_cpu_percent: f64,
}

impl AdmissionController {
    pub fn new(
        config: &AgentConfig,
        slots: Arc<SlotCounter>,
        stats: Arc<dyn StatsProvider>,
    ) -> Self {
        Self {
            slots,
            stats,
            max_memory_percent: config.max_memory_percent,
            max_cpu_percent: config.max_cpu_percent,
        }
    }

    pub fn slots(&self) -> &Arc<SlotCounter> {
        &self.slots
    }

    /// 负载按核数归一化后的百分比
    pub fn cpu_percent(load_average_1m: f64, cpu_count: u32) -> f64 {
        load_average_1m / cpu_count.max(1) as f64 * 100.0
    }

    pub fn admit(&self) -> FleetResult<SlotGuard> {
        let stats = self.stats.stats();
        let memory = stats.memory_usage();
        if memory > self.max_memory_percent {
            counter!("fleet_agent_admission_rejected_total", "reason" => "memory").increment(1);
            return Err(FleetError::Admission(format!(
                "内存使用率 {memory:.1}% 超过上限 {:.1}%",
                self.max_memory_percent
            )));
        }

        let cpu = Self::cpu_percent(stats.load_average_1m, self.stats.capabilities().cpu_count);
        if cpu > self.max_cpu_percent {
            counter!("fleet_agent_admission_rejected_total", "reason" => "cpu").increment(1);
            return Err(FleetError::Admission(format!(
                "CPU 负载 {cpu:.1}% 超过上限 {:.1}%",
                self.max_cpu_percent
            )));
        }

        match self.slots.try_acquire() {
            Some(guard) => {
                debug!(
                    running = self.slots.running_count(),
                    capacity = self.slots.capacity_count(),
                    "准入通过"
                );
                Ok(guard)
            }
            None => {
                counter!("fleet_agent_admission_rejected_total", "reason" => "capacity")
                    .increment(1);
                Err(FleetError::Admission(format!(
                    "已达到最大并发任务数 {}",
                    self.slots.capacity_count()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{NodeCapabilities, NodeStats};

    struct FixedStats {
        load: f64,
        memory_percent: f64,
    }

    impl StatsProvider for FixedStats {
        fn hostname(&self) -> String {
            "agent".into()
        }

        fn capabilities(&self) -> NodeCapabilities {
            NodeCapabilities {
                platform: "linux".into(),
                arch: "x86_64".into(),
                cpu_count: 4,
                total_memory_bytes: 1024,
            }
        }

        fn stats(&self) -> NodeStats {
            NodeStats {
                load_average_1m: self.load,
                memory_usage_percent: self.memory_percent,
                memory_total_bytes: 100,
                memory_used_bytes: self.memory_percent as u64,
                ..NodeStats::default()
            }
        }
    }

    fn controller(capacity: usize, load: f64, memory_percent: f64) -> AdmissionController {
        AdmissionController::new(
            &AgentConfig::default(),
            Arc::new(SlotCounter::new(capacity)),
            Arc::new(FixedStats {
                load,
                memory_percent,
            }),
        )
    }

    #[test]
    fn test_capacity_limit_and_release() {
        let admission = controller(2, 0.0, 10.0);
        let a = admission.admit().unwrap();
        let b = admission.admit().unwrap();
        assert!(matches!(admission.admit(), Err(FleetError::Admission(_))));
        assert_eq!(admission.slots().running_count(), 2);

        drop(a);
        assert_eq!(admission.slots().running_count(), 1);
        let c = admission.admit().unwrap();
        drop(b);
        drop(c);
        assert_eq!(admission.slots().running_count(), 0);
    }

    #[test]
    fn test_memory_ceiling_rejects() {
        let admission = controller(4, 0.0, 95.0);
        assert!(matches!(admission.admit(), Err(FleetError::Admission(_))));
        assert_eq!(admission.slots().running_count(), 0);
    }

    #[test]
    fn test_cpu_ceiling_is_normalized_by_cores() {
        // 4 核，load 3.0 = 75%
        assert!(controller(4, 3.0, 10.0).admit().is_ok());
        // 4 核，load 3.8 = 95%
        assert!(controller(4, 3.8, 10.0).admit().is_err());
        assert_eq!(AdmissionController::cpu_percent(2.0, 0), 200.0);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_capacity() {
        let slots = Arc::new(SlotCounter::new(3));
        let guards: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let slots = Arc::clone(&slots);
                    scope.spawn(move || slots.try_acquire())
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(guards.len(), 3);
        assert_eq!(slots.running_count(), 3);
        drop(guards);
        assert_eq!(slots.running_count(), 0);
    }
}
