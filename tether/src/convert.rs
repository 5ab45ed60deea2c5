//! Conversion from runc's output formats into protocol records.
//!
//! Every path that reports containers, stats, events, `ps` tables or the
//! runtime version goes through here; the RPC layer carries the resulting
//! records unchanged.

use std::collections::BTreeMap;

use serde::Deserialize;
use tether_proto::{
    Blkio, BlkioEntry, Container, Cpu, Event, Hugetlb, Memory, MemoryEntry, NetworkInterface,
    Pids, Stats, TopResults, Version,
};

use crate::{Error, Result};

/// `runc state` / `runc list --format json` entry.
#[derive(Debug, Deserialize)]
struct RuncState {
    id: String,
    #[serde(default)]
    pid: i32,
    status: String,
    #[serde(default)]
    bundle: String,
    #[serde(default)]
    rootfs: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
}

impl From<RuncState> for Container {
    fn from(s: RuncState) -> Self {
        Self {
            id: s.id,
            pid: s.pid,
            status: s.status,
            bundle: s.bundle,
            rootfs: s.rootfs,
            created: s.created,
            annotations: s.annotations.unwrap_or_default(),
        }
    }
}

/// One line of `runc events`.
#[derive(Debug, Deserialize)]
struct RuncEvent {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuncStats {
    cpu: RuncCpu,
    memory: RuncMemory,
    pids: Pids,
    blkio: RuncBlkio,
    hugetlb: BTreeMap<String, Hugetlb>,
    network_interfaces: Option<Vec<NetworkInterface>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuncCpu {
    usage: RuncCpuUsage,
    throttling: RuncThrottling,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuncCpuUsage {
    total: u64,
    percpu: Option<Vec<u64>>,
    kernel: u64,
    user: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RuncThrottling {
    periods: u64,
    throttled_periods: u64,
    throttled_time: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuncMemory {
    cache: u64,
    usage: MemoryEntry,
    swap: MemoryEntry,
    kernel: MemoryEntry,
    #[serde(rename = "kernelTCP")]
    kernel_tcp: MemoryEntry,
    raw: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RuncBlkio {
    io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
    io_serviced_recursive: Option<Vec<BlkioEntry>>,
    io_queued_recursive: Option<Vec<BlkioEntry>>,
    io_service_time_recursive: Option<Vec<BlkioEntry>>,
    io_wait_time_recursive: Option<Vec<BlkioEntry>>,
    io_merged_recursive: Option<Vec<BlkioEntry>>,
    io_time_recursive: Option<Vec<BlkioEntry>>,
    sectors_recursive: Option<Vec<BlkioEntry>>,
}

impl From<RuncStats> for Stats {
    fn from(s: RuncStats) -> Self {
        let b = s.blkio;
        Self {
            cpu: Cpu {
                total: s.cpu.usage.total,
                percpu: s.cpu.usage.percpu.unwrap_or_default(),
                kernel: s.cpu.usage.kernel,
                user: s.cpu.usage.user,
                throttling_periods: s.cpu.throttling.periods,
                throttled_periods: s.cpu.throttling.throttled_periods,
                throttled_time: s.cpu.throttling.throttled_time,
            },
            memory: Memory {
                cache: s.memory.cache,
                usage: s.memory.usage,
                swap: s.memory.swap,
                kernel: s.memory.kernel,
                kernel_tcp: s.memory.kernel_tcp,
                raw: s.memory.raw.unwrap_or_default(),
            },
            pids: s.pids,
            blkio: Blkio {
                io_service_bytes_recursive: b.io_service_bytes_recursive.unwrap_or_default(),
                io_serviced_recursive: b.io_serviced_recursive.unwrap_or_default(),
                io_queued_recursive: b.io_queued_recursive.unwrap_or_default(),
                io_service_time_recursive: b.io_service_time_recursive.unwrap_or_default(),
                io_wait_time_recursive: b.io_wait_time_recursive.unwrap_or_default(),
                io_merged_recursive: b.io_merged_recursive.unwrap_or_default(),
                io_time_recursive: b.io_time_recursive.unwrap_or_default(),
                sectors_recursive: b.sectors_recursive.unwrap_or_default(),
            },
            hugetlb: s.hugetlb,
            network_interfaces: s.network_interfaces.unwrap_or_default(),
        }
    }
}

/// Parses `runc state <id>`.
pub fn container(json: &[u8]) -> Result<Container> {
    Ok(serde_json::from_slice::<RuncState>(json)?.into())
}

/// Parses `runc list --format json`. runc prints `null` when empty.
pub fn containers(json: &[u8]) -> Result<Vec<Container>> {
    let list: Option<Vec<RuncState>> = serde_json::from_slice(json)?;
    Ok(list
        .unwrap_or_default()
        .into_iter()
        .map(Container::from)
        .collect())
}

/// Parses `runc ps --format json <id>`.
pub fn pids(json: &[u8]) -> Result<Vec<i32>> {
    let pids: Option<Vec<i32>> = serde_json::from_slice(json)?;
    Ok(pids.unwrap_or_default())
}

/// Parses one `runc events` line. Only `stats` events carry a sample.
pub fn event(line: &[u8]) -> Result<Event> {
    let raw: RuncEvent = serde_json::from_slice(line)?;
    let stats = match (raw.kind.as_str(), raw.data) {
        ("stats", Some(data)) => Some(serde_json::from_value::<RuncStats>(data)?.into()),
        _ => None,
    };
    Ok(Event {
        kind: raw.kind,
        id: raw.id,
        stats,
    })
}

/// Parses a `runc events --stats` line into its sample.
pub fn stats(line: &[u8]) -> Result<Stats> {
    event(line)?
        .stats
        .ok_or_else(|| Error::Runtime {
            op: "events",
            message: "stats event carried no data".to_owned(),
        })
}

/// Parses `runc --version`:
///
/// ```text
/// runc version 1.1.12
/// commit: v1.1.12-0-g51d5e94
/// spec: 1.0.2-dev
/// ```
pub fn version(text: &str) -> Version {
    let mut v = Version::default();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("runc version ") {
            rest.trim().clone_into(&mut v.runtime);
        } else if let Some(rest) = line.strip_prefix("commit:") {
            rest.trim().clone_into(&mut v.commit);
        } else if let Some(rest) = line.strip_prefix("spec:") {
            rest.trim().clone_into(&mut v.spec);
        }
    }
    v
}

/// Splits `ps` table output into headers and rows.
///
/// Columns are whitespace separated; the last column (the command line) may
/// itself contain spaces and takes the remainder of the row.
pub fn top(table: &str) -> Result<TopResults> {
    let mut lines = table.lines().filter(|l| !l.trim().is_empty());
    let headers: Vec<String> = lines
        .next()
        .ok_or_else(|| Error::Runtime {
            op: "ps",
            message: "empty ps output".to_owned(),
        })?
        .split_whitespace()
        .map(str::to_owned)
        .collect();
    let width = headers.len();

    let processes = lines
        .map(|line| {
            let mut fields: Vec<String> = Vec::with_capacity(width);
            let mut rest = line.trim_start();
            while fields.len() + 1 < width {
                let Some((field, tail)) = rest.split_once(char::is_whitespace) else {
                    break;
                };
                fields.push(field.to_owned());
                rest = tail.trim_start();
            }
            if !rest.is_empty() {
                fields.push(rest.trim_end().to_owned());
            }
            fields
        })
        .collect();

    Ok(TopResults { headers, processes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_maps_every_field() {
        let json = br#"{
            "ociVersion": "1.0.2-dev",
            "id": "web",
            "pid": 4242,
            "status": "running",
            "bundle": "/run/bundles/web",
            "rootfs": "/run/bundles/web/rootfs",
            "created": "2024-05-01T10:00:00.000000000Z",
            "owner": "",
            "annotations": {"io.kubernetes.pod": "p1"}
        }"#;
        let c = container(json).unwrap();
        assert_eq!(c.id, "web");
        assert_eq!(c.pid, 4242);
        assert_eq!(c.status, "running");
        assert_eq!(c.rootfs, "/run/bundles/web/rootfs");
        assert_eq!(c.annotations["io.kubernetes.pod"], "p1");
    }

    #[test]
    fn empty_list_is_null() {
        assert!(containers(b"null").unwrap().is_empty());
        let two = containers(
            br#"[{"id":"a","pid":1,"status":"created","bundle":"/a","rootfs":"/a/r","created":"t","annotations":null},
                 {"id":"b","pid":0,"status":"stopped","bundle":"/b","rootfs":"/b/r","created":"t"}]"#,
        )
        .unwrap();
        assert_eq!(
            two.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );
    }

    #[test]
    fn stats_event_is_converted() {
        let line = br#"{"type":"stats","id":"web","data":{
            "cpu":{"usage":{"total":900,"percpu":[400,500],"kernel":100,"user":800},
                   "throttling":{"periods":10,"throttledPeriods":2,"throttledTime":77}},
            "memory":{"cache":5,"usage":{"limit":1024,"usage":512,"max":600,"failcnt":1},
                      "kernelTCP":{"usage":3},"raw":{"pgfault":9}},
            "pids":{"current":3,"limit":100},
            "blkio":{"ioServiceBytesRecursive":[{"major":8,"minor":0,"op":"Read","value":4096}]},
            "hugetlb":{"2MB":{"usage":2,"max":4,"failcnt":0}},
            "network_interfaces":[{"name":"eth0","rx_bytes":10,"tx_bytes":20}]
        }}"#;
        let ev = event(line).unwrap();
        assert_eq!(ev.kind, "stats");
        assert_eq!(ev.id, "web");
        let s = ev.stats.unwrap();
        assert_eq!(s.cpu.percpu, [400, 500]);
        assert_eq!(s.cpu.throttled_time, 77);
        assert_eq!(s.memory.usage.limit, 1024);
        assert_eq!(s.memory.kernel_tcp.usage, 3);
        assert_eq!(s.memory.raw["pgfault"], 9);
        assert_eq!(s.pids.current, 3);
        assert_eq!(s.blkio.io_service_bytes_recursive[0].value, 4096);
        assert!(s.blkio.sectors_recursive.is_empty());
        assert_eq!(s.hugetlb["2MB"].max, 4);
        assert_eq!(s.network_interfaces[0].tx_bytes, 20);
    }

    #[test]
    fn oom_event_has_no_stats() {
        let ev = event(br#"{"type":"oom","id":"web"}"#).unwrap();
        assert_eq!(ev.kind, "oom");
        assert!(ev.stats.is_none());
        assert!(stats(br#"{"type":"oom","id":"web"}"#).is_err());
    }

    #[test]
    fn version_text() {
        let v = version("runc version 1.1.12\ncommit: v1.1.12-0-g51d5e94\nspec: 1.0.2-dev\ngo: go1.20.13\n");
        assert_eq!(v.runtime, "1.1.12");
        assert_eq!(v.commit, "v1.1.12-0-g51d5e94");
        assert_eq!(v.spec, "1.0.2-dev");
    }

    #[test]
    fn ps_table_keeps_command_whole() {
        let table = "UID   PID  PPID  C STIME TTY  TIME     CMD\n\
                     root  1    0     0 10:00 ?    00:00:00 sh -c sleep 100\n\
                     root  7    1     0 10:00 ?    00:00:00 sleep 100\n";
        let top = top(table).unwrap();
        assert_eq!(top.headers.len(), 8);
        assert_eq!(top.processes.len(), 2);
        assert_eq!(top.processes[0][1], "1");
        assert_eq!(top.processes[0][7], "sh -c sleep 100");
        assert_eq!(top.processes[1][7], "sleep 100");
        assert!(super::top("").is_err());
    }

    #[test]
    fn pids_json() {
        assert_eq!(pids(b"[1,7,9]").unwrap(), [1, 7, 9]);
        assert!(pids(b"null").unwrap().is_empty());
    }
}
