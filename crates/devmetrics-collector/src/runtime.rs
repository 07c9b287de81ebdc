use crate::{Collector, GaugeSample};
use anyhow::{anyhow, Result};
use rand::Rng;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Statistics of the agent process itself, plus a `RandomValue` gauge.
pub struct RuntimeCollector {
    system: System,
    pid: Pid,
}

impl RuntimeCollector {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("cannot resolve own pid: {e}"))?;
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(Self { system, pid })
    }
}

impl Collector for RuntimeCollector {
    fn name(&self) -> &str {
        "runtime"
    }

    fn collect(&mut self) -> Result<Vec<GaugeSample>> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} disappeared", self.pid))?;

        let disk = process.disk_usage();
        Ok(vec![
            GaugeSample::new("ResidentMemory", process.memory() as f64),
            GaugeSample::new("VirtualMemory", process.virtual_memory() as f64),
            GaugeSample::new("ProcessCPU", f64::from(process.cpu_usage())),
            GaugeSample::new("ProcessUptime", process.run_time() as f64),
            GaugeSample::new("DiskReadBytes", disk.total_read_bytes as f64),
            GaugeSample::new("DiskWrittenBytes", disk.total_written_bytes as f64),
            GaugeSample::new("RandomValue", rand::thread_rng().gen::<f64>()),
        ])
    }
}
