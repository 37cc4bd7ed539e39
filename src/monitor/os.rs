//! Operating system telemetry for Linux and macOS.

use std::thread;
use std::time::Duration;

use crate::message::Message;

use super::run_command;

#[derive(Debug, Default)]
pub(crate) struct OsReport {
    valid: bool,
    os: Option<&'static str>,
    host_name: String,
    kernel_name: String,
    kernel_version: String,
    architecture: String,
    total_memory: u64,
    used_memory: u64,
    free_memory: u64,
    cpu_busy_pct: f64,
    cpu_idle_pct: f64,
    error: Option<String>,
}

impl OsReport {
    pub(crate) fn fill(&self, message: &mut Message) {
        message.put_dotted("monitor.os.valid", self.valid);
        if !self.valid {
            if let Some(error) = &self.error {
                message.put_dotted("monitor.os.errorMessage", error.clone());
            }
            return;
        }
        message.put_dotted("monitor.os.os", self.os.unwrap_or("Linux"));
        message.put_dotted("monitor.os.hostName", self.host_name.clone());
        message.put_dotted("monitor.os.kernelName", self.kernel_name.clone());
        message.put_dotted("monitor.os.kernelVersion", self.kernel_version.clone());
        message.put_dotted("monitor.os.architecture", self.architecture.clone());
        message.put_dotted("monitor.os.totalMemory", self.total_memory);
        message.put_dotted("monitor.os.usedMemory", self.used_memory);
        message.put_dotted("monitor.os.freeMemory", self.free_memory);
        message.put_dotted("monitor.os.cpuBusyPct", self.cpu_busy_pct);
        message.put_dotted("monitor.os.cpuIdlePct", self.cpu_idle_pct);
    }

    fn fail(message: impl Into<String>) -> OsReport {
        OsReport {
            valid: false,
            error: Some(message.into()),
            ..OsReport::default()
        }
    }
}

pub(crate) fn collect() -> OsReport {
    let Some(uname) = run_command("uname -mnrs") else {
        return OsReport::fail("command uname failed");
    };
    // kernel name, host name, kernel release, machine
    let fields: Vec<&str> = uname.split_whitespace().collect();
    if fields.len() < 4 {
        return OsReport::fail(format!("unrecognized uname output: {uname}"));
    }

    let mut report = OsReport {
        kernel_name: fields[0].to_string(),
        host_name: fields[1].to_string(),
        kernel_version: fields[2].to_string(),
        architecture: fields[3].to_string(),
        ..OsReport::default()
    };

    match fields[0] {
        "Linux" => {
            report.os = Some("Linux");
            collect_linux(&mut report);
        }
        "Darwin" => {
            report.os = Some("OSX");
            collect_osx(&mut report);
        }
        other => return OsReport::fail(format!("unrecognized kernel name: {other}")),
    }
    report
}

fn collect_linux(report: &mut OsReport) {
    let Some(free) = run_command("free -b") else {
        report.error = Some("command free failed".into());
        return;
    };
    let Some((total, used)) = parse_free(&free) else {
        report.error = Some(format!("unrecognized free output: {free}"));
        return;
    };
    report.total_memory = total;
    report.used_memory = used;
    report.free_memory = total.saturating_sub(used);

    // sample /proc/stat twice, a second apart
    let Some(start) = linux_cpu_times() else {
        report.error = Some("could not read /proc/stat".into());
        return;
    };
    thread::sleep(Duration::from_secs(1));
    let Some(stop) = linux_cpu_times() else {
        report.error = Some("could not read /proc/stat".into());
        return;
    };

    let total = stop.0.saturating_sub(start.0);
    let idle = stop.1.saturating_sub(start.1);
    if total == 0 {
        report.error = Some("cpu sample produced no ticks".into());
        return;
    }
    report.cpu_idle_pct = 100.0 * idle as f64 / total as f64;
    report.cpu_busy_pct = 100.0 - report.cpu_idle_pct;
    report.valid = true;
}

// `free -b` second line: Mem: total used free shared buff/cache available
fn parse_free(output: &str) -> Option<(u64, u64)> {
    let line = output.lines().find(|line| line.starts_with("Mem:"))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    let total = fields.get(1)?.parse().ok()?;
    let used = fields.get(2)?.parse().ok()?;
    Some((total, used))
}

// (total ticks, idle ticks) from the aggregate cpu line of /proc/stat
fn linux_cpu_times() -> Option<(u64, u64)> {
    let stat = run_command("cat /proc/stat")?;
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(7)
        .filter_map(|field| field.parse().ok())
        .collect();
    if ticks.len() < 7 {
        return None;
    }
    Some((ticks.iter().sum(), ticks[3]))
}

fn collect_osx(report: &mut OsReport) {
    let Some(memsize) = run_command("sysctl hw.memsize") else {
        report.error = Some("command sysctl failed".into());
        return;
    };
    let Some(vm_stat) = run_command("vm_stat") else {
        report.error = Some("command vm_stat failed".into());
        return;
    };

    let total = memsize
        .split_whitespace()
        .last()
        .and_then(|field| field.parse::<u64>().ok());
    let Some(total) = total else {
        report.error = Some(format!("unrecognized sysctl output: {memsize}"));
        return;
    };
    let Some(used) = parse_vm_stat(&vm_stat) else {
        report.error = Some(format!("unrecognized vm_stat output: {vm_stat}"));
        return;
    };
    report.total_memory = total;
    report.used_memory = used;
    report.free_memory = total.saturating_sub(used);

    let Some(iostat) = run_command("iostat -C") else {
        report.error = Some("command iostat failed".into());
        return;
    };
    let Some((busy, idle)) = parse_iostat(&iostat) else {
        report.error = Some(format!("unrecognized iostat output: {iostat}"));
        return;
    };
    report.cpu_busy_pct = busy;
    report.cpu_idle_pct = idle;
    report.valid = true;
}

// active + wired pages, scaled by the reported page size
fn parse_vm_stat(output: &str) -> Option<u64> {
    let page_size: u64 = output
        .lines()
        .next()?
        .split_whitespace()
        .find_map(|field| field.parse().ok())?;
    let mut active = None;
    let mut wired = None;
    for line in output.lines() {
        let value = || {
            line.split_whitespace()
                .last()
                .and_then(|field| field.trim_end_matches('.').parse::<u64>().ok())
        };
        if line.starts_with("Pages active") {
            active = value();
        } else if line.starts_with("Pages wired down") {
            wired = value();
        }
    }
    Some((active? + wired?) * page_size)
}

// last data line carries `us sy id` after the disk columns
fn parse_iostat(output: &str) -> Option<(f64, f64)> {
    let line = output.lines().filter(|line| !line.trim().is_empty()).last()?;
    let fields: Vec<f64> = line
        .split_whitespace()
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 6 {
        return None;
    }
    let us = fields[3];
    let sy = fields[4];
    let id = fields[5];
    Some((us + sy, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modern_free_output() {
        let output = "               total        used        free\n\
                      Mem:      16384000000  8192000000  8192000000\n\
                      Swap:      1024000000           0  1024000000\n";
        assert_eq!(parse_free(output), Some((16_384_000_000, 8_192_000_000)));
        assert_eq!(parse_free("garbage"), None);
    }

    #[test]
    fn parses_vm_stat_pages() {
        let output = "Mach Virtual Memory Statistics: (page size of 16384 bytes)\n\
                      Pages free:                              100000.\n\
                      Pages active:                            200000.\n\
                      Pages wired down:                         50000.\n";
        assert_eq!(parse_vm_stat(output), Some(250_000 * 16384));
    }

    #[test]
    fn parses_iostat_cpu_line() {
        let output = "              disk0       cpu    load average\n\
                      KB/t  tps  MB/s  us sy id   1m   5m   15m\n\
                      24.84    5  0.13   4  3 93  1.71 1.56 1.55\n";
        let (busy, idle) = parse_iostat(output).unwrap();
        assert!((busy - 7.0).abs() < f64::EPSILON);
        assert!((idle - 93.0).abs() < f64::EPSILON);
    }
}
