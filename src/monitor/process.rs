//! Serving-process telemetry.

use std::fs;
use std::thread;

use crate::message::Message;

#[derive(Debug, Default)]
pub(crate) struct ProcessReport {
    valid: bool,
    resident_bytes: u64,
    virtual_bytes: u64,
    threads: u64,
    cpus: u64,
    error: Option<String>,
}

impl ProcessReport {
    pub(crate) fn fill(&self, message: &mut Message) {
        message.put_dotted("monitor.process.valid", self.valid);
        if !self.valid {
            if let Some(error) = &self.error {
                message.put_dotted("monitor.process.errorMessage", error.clone());
            }
            return;
        }
        message.put_dotted("monitor.process.residentBytes", self.resident_bytes);
        message.put_dotted("monitor.process.virtualBytes", self.virtual_bytes);
        message.put_dotted("monitor.process.threads", self.threads);
        message.put_dotted("monitor.process.cpus", self.cpus);
    }
}

pub(crate) fn collect() -> ProcessReport {
    let cpus = thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(0);

    let status = match fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(err) => {
            return ProcessReport {
                valid: false,
                cpus,
                error: Some(format!("could not read process status: {err}")),
                ..ProcessReport::default()
            };
        }
    };

    let mut report = ProcessReport {
        valid: true,
        cpus,
        ..ProcessReport::default()
    };
    for line in status.lines() {
        if let Some(value) = kb_field(line, "VmRSS:") {
            report.resident_bytes = value * 1024;
        } else if let Some(value) = kb_field(line, "VmSize:") {
            report.virtual_bytes = value * 1024;
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            report.threads = rest.trim().parse().unwrap_or(0);
        }
    }
    report
}

fn kb_field(line: &str, prefix: &str) -> Option<u64> {
    let rest = line.strip_prefix(prefix)?;
    rest.split_whitespace().next()?.parse().ok()
}
