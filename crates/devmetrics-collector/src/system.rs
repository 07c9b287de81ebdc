use crate::{Collector, GaugeSample};
use anyhow::Result;
use sysinfo::System;

/// Host memory totals and per-core CPU utilization
/// (`CPUutilization1` .. `CPUutilizationN`).
pub struct SystemCollector {
    system: System,
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    fn collect(&mut self) -> Result<Vec<GaugeSample>> {
        self.system.refresh_memory();
        self.system.refresh_cpu_all();

        let mut samples = vec![
            GaugeSample::new("TotalMemory", self.system.total_memory() as f64),
            GaugeSample::new("FreeMemory", self.system.free_memory() as f64),
        ];
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            samples.push(GaugeSample::new(
                format!("CPUutilization{}", i + 1),
                f64::from(cpu.cpu_usage()),
            ));
        }
        Ok(samples)
    }
}
