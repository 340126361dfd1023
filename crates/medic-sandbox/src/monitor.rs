//! Resource-usage monitoring against configured thresholds.

use medic_config::ResourceThresholds;

use crate::{ResourceStats, Sandbox, SandboxResult};

/// Health classification of a stats sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceHealth {
    Ok,
    /// Above a warning threshold; names the offending dimensions.
    Warning(Vec<String>),
    /// Above a critical threshold; the iteration should abort.
    Critical(Vec<String>),
}

impl ResourceHealth {
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }
}

/// Stateless evaluator over sandbox stats.
#[derive(Debug, Clone, Copy)]
pub struct ResourceMonitor {
    thresholds: ResourceThresholds,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify one sample.
    #[must_use]
    pub fn evaluate(&self, stats: ResourceStats) -> ResourceHealth {
        let t = &self.thresholds;
        let mut critical = Vec::new();
        let mut warning = Vec::new();

        if stats.cpu_percent >= t.cpu_crit {
            critical.push(format!("cpu {:.1}%", stats.cpu_percent));
        } else if stats.cpu_percent >= t.cpu_warn {
            warning.push(format!("cpu {:.1}%", stats.cpu_percent));
        }

        if stats.memory_percent >= t.mem_crit {
            critical.push(format!("memory {:.1}%", stats.memory_percent));
        } else if stats.memory_percent >= t.mem_warn {
            warning.push(format!("memory {:.1}%", stats.memory_percent));
        }

        if stats.pids >= t.pids_crit {
            critical.push(format!("pids {}", stats.pids));
        } else if stats.pids >= t.pids_warn {
            warning.push(format!("pids {}", stats.pids));
        }

        if !critical.is_empty() {
            ResourceHealth::Critical(critical)
        } else if !warning.is_empty() {
            ResourceHealth::Warning(warning)
        } else {
            ResourceHealth::Ok
        }
    }

    /// Sample the sandbox and classify. `Ok(None)` when the backend has
    /// nothing to report.
    pub async fn check(&self, sandbox: &dyn Sandbox) -> SandboxResult<Option<ResourceHealth>> {
        match sandbox.resource_stats().await? {
            Some(stats) => {
                let health = self.evaluate(stats);
                if let ResourceHealth::Warning(dims) = &health {
                    tracing::warn!(backend = sandbox.backend(), ?dims, "sandbox under pressure");
                }
                Ok(Some(health))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(ResourceThresholds::default())
    }

    #[test]
    fn test_healthy_sample() {
        let health = monitor().evaluate(ResourceStats {
            cpu_percent: 20.0,
            memory_percent: 35.0,
            pids: 40,
        });
        assert_eq!(health, ResourceHealth::Ok);
    }

    #[test]
    fn test_warning_at_80_percent() {
        let health = monitor().evaluate(ResourceStats {
            cpu_percent: 81.0,
            memory_percent: 10.0,
            pids: 10,
        });
        assert!(matches!(health, ResourceHealth::Warning(dims) if dims.len() == 1));
    }

    #[test]
    fn test_critical_wins_over_warning() {
        let health = monitor().evaluate(ResourceStats {
            cpu_percent: 96.0,
            memory_percent: 85.0,
            pids: 1500,
        });
        let ResourceHealth::Critical(dims) = health else {
            panic!("expected critical");
        };
        assert_eq!(dims.len(), 1);
        assert!(dims[0].starts_with("cpu"));
    }

    #[test]
    fn test_pid_thresholds() {
        let warn = monitor().evaluate(ResourceStats {
            pids: 1000,
            ..Default::default()
        });
        assert!(matches!(warn, ResourceHealth::Warning(_)));

        let crit = monitor().evaluate(ResourceStats {
            pids: 2000,
            ..Default::default()
        });
        assert!(crit.is_critical());
    }
}
