//! Process and machine CPU accounting.
//!
//! Reads the OS accounting files (`/proc/stat`, `/proc/<pid>/stat`,
//! `/proc/cpuinfo`) plus `getrusage(2)` for the controller itself, and
//! turns before/after snapshots into attributable usage. The
//! interference policy decides whether a trial window was clean enough
//! to keep: hypervisor steal or too much unattributed machine-wide CPU
//! invalidates the sample, which the caller retries.

use crate::timing::Timing;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(target_os = "linux")]
use std::fs;

/// Machine-wide CPU tick counters from the aggregate `cpu` line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    /// Ticks stolen by the hypervisor while this guest was runnable.
    pub steal: u64,
}

/// Clock/core facts parsed from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    pub model_name: String,
    pub cpu_mhz: f64,
    pub cores: usize,
}

/// Ticks per second for /proc counters (`sysconf(_SC_CLK_TCK)`).
pub fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat` contents.
pub fn parse_machine_stat(content: &str) -> Result<CpuStat, String> {
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("cpu") {
            continue;
        }
        let mut ticks = [0u64; 8];
        for slot in ticks.iter_mut() {
            *slot = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| format!("short cpu line in /proc/stat: {}", line))?;
        }
        // user nice system idle iowait irq softirq steal
        return Ok(CpuStat {
            user: ticks[0],
            nice: ticks[1],
            system: ticks[2],
            idle: ticks[3],
            steal: ticks[7],
        });
    }
    Err("no aggregate cpu line in /proc/stat".to_string())
}

/// Parse utime/stime ticks out of `/proc/<pid>/stat` contents. The
/// comm field may contain spaces, so fields are counted from the last
/// closing parenthesis.
pub fn parse_process_stat(content: &str) -> Result<(u64, u64), String> {
    let after_comm = content
        .rfind(')')
        .map(|i| &content[i + 1..])
        .ok_or("missing comm field in process stat")?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // After comm: state is field 0, utime field 11, stime field 12.
    if fields.len() < 13 {
        return Err(format!("short process stat line: {} fields", fields.len()));
    }
    let utime = fields[11]
        .parse()
        .map_err(|_| format!("bad utime field: {}", fields[11]))?;
    let stime = fields[12]
        .parse()
        .map_err(|_| format!("bad stime field: {}", fields[12]))?;
    Ok((utime, stime))
}

/// Parse model name, clock rate, and core count from `/proc/cpuinfo`
/// contents.
pub fn parse_cpuinfo(content: &str) -> MachineInfo {
    let mut info = MachineInfo::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "processor" => {
                if let Ok(num) = value.parse::<usize>() {
                    if info.cores <= num {
                        info.cores = num + 1;
                    }
                }
            }
            "model name" => info.model_name = value.to_string(),
            "cpu MHz" => {
                if let Ok(num) = value.parse::<f64>() {
                    info.cpu_mhz = num;
                }
            }
            _ => {}
        }
    }
    info
}

#[cfg(target_os = "linux")]
pub fn machine_cpu_stat() -> CpuStat {
    fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|c| parse_machine_stat(&c).ok())
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
pub fn machine_cpu_stat() -> CpuStat {
    CpuStat::default()
}

#[cfg(target_os = "linux")]
pub fn read_machine_info() -> MachineInfo {
    let mut info = fs::read_to_string("/proc/cpuinfo")
        .map(|c| parse_cpuinfo(&c))
        .unwrap_or_default();
    if info.cores == 0 {
        info.cores = num_cpus::get();
    }
    info
}

#[cfg(not(target_os = "linux"))]
pub fn read_machine_info() -> MachineInfo {
    MachineInfo {
        cores: num_cpus::get(),
        ..Default::default()
    }
}

/// CPU time the client process has consumed so far, in seconds.
/// Returns zero when there is no process or no /proc support, so
/// development hosts without procfs still run the protocol.
pub fn child_usage(pid: Option<u32>) -> Timing {
    let Some(pid) = pid else {
        return Timing::default();
    };
    child_usage_for(pid)
}

#[cfg(target_os = "linux")]
fn child_usage_for(pid: u32) -> Timing {
    let path = format!("/proc/{}/stat", pid);
    match fs::read_to_string(&path).map_err(|e| e.to_string()) {
        Ok(content) => match parse_process_stat(&content) {
            Ok((utime, stime)) => {
                let tps = clock_ticks_per_sec();
                Timing {
                    wall: 0.0,
                    user: utime as f64 / tps,
                    sys: stime as f64 / tps,
                }
            }
            Err(e) => {
                tracing::warn!("could not parse {}: {}", path, e);
                Timing::default()
            }
        },
        Err(_) => Timing::default(),
    }
}

#[cfg(not(target_os = "linux"))]
fn child_usage_for(_pid: u32) -> Timing {
    Timing::default()
}

/// The controller's own CPU usage via `getrusage(RUSAGE_SELF)`.
pub fn self_usage() -> Timing {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return Timing::default();
    }
    let tv = |t: libc::timeval| t.tv_sec as f64 + t.tv_usec as f64 * 1e-6;
    Timing {
        wall: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as f64 / 1e9,
        user: tv(usage.ru_utime),
        sys: tv(usage.ru_stime),
    }
}

/// One trial-boundary snapshot of child, controller, and machine usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub child: Timing,
    pub controller: Timing,
    pub machine: CpuStat,
}

pub fn snapshot_usage(pid: Option<u32>) -> UsageSnapshot {
    UsageSnapshot {
        child: child_usage(pid),
        controller: self_usage(),
        machine: machine_cpu_stat(),
    }
}

/// Interference policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct InterferenceParams {
    /// Minimum attributed user time before the checks apply; below this
    /// the clock quantization makes the ratios meaningless.
    pub min_time_slice: f64,
    /// Maximum tolerated unattributed share of machine user time.
    pub user_threshold: f64,
    /// Maximum tolerated unattributed machine sys time relative to the
    /// client's user time.
    pub sys_threshold: f64,
    /// Tick rate used to convert machine counters to seconds.
    pub ticks_per_sec: f64,
}

impl Default for InterferenceParams {
    fn default() -> Self {
        InterferenceParams {
            min_time_slice: 0.05,
            user_threshold: 0.01,
            sys_threshold: 0.02,
            ticks_per_sec: clock_ticks_per_sec(),
        }
    }
}

/// Why a trial window was invalidated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// The hypervisor preempted this guest during the window.
    CpuStolen { ticks: i64 },
    /// Unattributed machine-wide user time exceeded the threshold.
    UserInterference { share: f64 },
    /// Unattributed machine-wide sys time exceeded the threshold.
    SysInterference { share: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::CpuStolen { ticks } => write!(f, "cpu steal: {} ticks", ticks),
            Rejection::UserInterference { share } => {
                write!(f, "user interference: {:.1}%", share * 100.0)
            }
            Rejection::SysInterference { share } => {
                write!(f, "sys interference: {:.1}%", share * 100.0)
            }
        }
    }
}

/// Attributable usage for an accepted trial window.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    /// CPU time attributed to the client.
    pub child: Timing,
    /// The controller's own overhead during the window.
    pub controller: Timing,
}

/// Result of judging a trial window.
#[derive(Debug, Clone, Copy)]
pub enum UsageJudgment {
    Accepted(Usage),
    Rejected(Rejection),
}

/// Apply the interference policy to a before/after snapshot pair.
pub fn judge_usage(
    before: &UsageSnapshot,
    after: &UsageSnapshot,
    params: &InterferenceParams,
) -> UsageJudgment {
    let child = after.child.sub(before.child);
    let controller = after.controller.sub(before.controller);

    // Only meaningful once the client used at least a full time slice.
    if child.user > params.min_time_slice {
        let tps = params.ticks_per_sec;
        let machine_user =
            (after.machine.user + after.machine.nice) as f64 / tps
                - (before.machine.user + before.machine.nice) as f64 / tps;
        let machine_sys = (after.machine.system as f64 - before.machine.system as f64) / tps;

        let stolen = after.machine.steal as i64 - before.machine.steal as i64;
        if stolen != 0 {
            return UsageJudgment::Rejected(Rejection::CpuStolen { ticks: stolen });
        }

        let du = machine_user - child.user - controller.user;
        if machine_user > 0.0 && du / machine_user > params.user_threshold {
            return UsageJudgment::Rejected(Rejection::UserInterference {
                share: du / machine_user,
            });
        }

        let ds = machine_sys - child.sys - controller.sys;
        if child.user > 0.0 && ds / child.user > params.sys_threshold {
            return UsageJudgment::Rejected(Rejection::SysInterference {
                share: ds / child.user,
            });
        }
    }

    UsageJudgment::Accepted(Usage { child, controller })
}
