//! Types that mirror the monitoring service's JSON schema.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the six metric categories carried by a [`Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    System,
    Cpu,
    Memory,
    Disk,
    Network,
    Processes,
}

impl Module {
    pub const ALL: [Module; 6] = [
        Module::System,
        Module::Cpu,
        Module::Memory,
        Module::Disk,
        Module::Network,
        Module::Processes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Module::System => "system",
            Module::Cpu => "cpu",
            Module::Memory => "memory",
            Module::Disk => "disk",
            Module::Network => "network",
            Module::Processes => "processes",
        }
    }

    /// Path of the module's endpoint, relative to the API base URL.
    pub fn endpoint(self) -> &'static str {
        match self {
            Module::System => "/system",
            Module::Cpu => "/cpu",
            Module::Memory => "/memory",
            Module::Disk => "/disk",
            Module::Network => "/network",
            Module::Processes => "/processes",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Module {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Module::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown module `{s}`"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub platform: String,
    pub uptime: u64,
    pub load_average: Vec<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CpuInfo {
    pub usage: f64,
    pub cores: Vec<f64>,
    pub frequency: f64,
    pub temperature: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapInfo {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: f64,
    pub swap: SwapInfo,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
    // bytes/s as computed by the service
    pub read_speed: f64,
    pub write_speed: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub is_up: bool,
    // Mbps
    pub speed: u64,
    pub mtu: u32,
    pub ip_address: String,
    pub mac_address: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub errors_received: u64,
    pub errors_sent: u64,
}

/// Socket counts by protocol/state. Fields are optional because the service
/// may send only the counters that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConnections {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_listen: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_established: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_time_wait: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenPort {
    pub port: u16,
    // "tcp" | "udp"
    pub protocol: String,
    // "listening" | "established" | "time_wait"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Network slot. Updates may be partial, so every field is optional and the
/// store deep-merges incoming values into what it already holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<NetworkConnections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<NetworkInterface>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_ports: Option<Vec<OpenPort>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

fn merge_field<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

impl NetworkConnections {
    pub fn merge(&mut self, incoming: NetworkConnections) {
        merge_field(&mut self.tcp, incoming.tcp);
        merge_field(&mut self.udp, incoming.udp);
        merge_field(&mut self.tcp_listen, incoming.tcp_listen);
        merge_field(&mut self.tcp_established, incoming.tcp_established);
        merge_field(&mut self.tcp_time_wait, incoming.tcp_time_wait);
    }
}

impl NetworkInfo {
    /// Key-wise deep merge: nested objects merge field by field, while lists
    /// and scalars present in `incoming` replace the current value.
    pub fn merge(&mut self, incoming: NetworkInfo) {
        merge_field(&mut self.upload_speed, incoming.upload_speed);
        merge_field(&mut self.download_speed, incoming.download_speed);
        merge_field(&mut self.total_sent, incoming.total_sent);
        merge_field(&mut self.total_received, incoming.total_received);
        match (&mut self.connections, incoming.connections) {
            (Some(current), Some(next)) => current.merge(next),
            (slot, Some(next)) => *slot = Some(next),
            (_, None) => {}
        }
        merge_field(&mut self.interfaces, incoming.interfaces);
        merge_field(&mut self.open_ports, incoming.open_ports);
        merge_field(&mut self.timestamp, incoming.timestamp);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub status: String,
}

/// Composite snapshot. Each slot is independent; an absent slot means
/// "no news", never "cleared".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<ProcessInfo>>,
}

impl Snapshot {
    /// Modules whose slot is populated, in canonical order.
    pub fn modules(&self) -> Vec<Module> {
        Module::ALL
            .into_iter()
            .filter(|m| self.has(*m))
            .collect()
    }

    pub fn has(&self, module: Module) -> bool {
        match module {
            Module::System => self.system.is_some(),
            Module::Cpu => self.cpu.is_some(),
            Module::Memory => self.memory.is_some(),
            Module::Disk => self.disk.is_some(),
            Module::Network => self.network.is_some(),
            Module::Processes => self.processes.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules().is_empty()
    }
}

/// A single module's data, as delivered by a per-module endpoint or frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ModulePayload {
    System(SystemInfo),
    Cpu(CpuInfo),
    Memory(MemoryInfo),
    Disk(DiskInfo),
    Network(NetworkInfo),
    Processes(Vec<ProcessInfo>),
}

impl ModulePayload {
    pub fn module(&self) -> Module {
        match self {
            ModulePayload::System(_) => Module::System,
            ModulePayload::Cpu(_) => Module::Cpu,
            ModulePayload::Memory(_) => Module::Memory,
            ModulePayload::Disk(_) => Module::Disk,
            ModulePayload::Network(_) => Module::Network,
            ModulePayload::Processes(_) => Module::Processes,
        }
    }

    /// Decode the JSON `data` of a module into its typed payload.
    pub fn from_value(module: Module, data: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match module {
            Module::System => ModulePayload::System(serde_json::from_value(data)?),
            Module::Cpu => ModulePayload::Cpu(serde_json::from_value(data)?),
            Module::Memory => ModulePayload::Memory(serde_json::from_value(data)?),
            Module::Disk => ModulePayload::Disk(serde_json::from_value(data)?),
            Module::Network => ModulePayload::Network(serde_json::from_value(data)?),
            Module::Processes => ModulePayload::Processes(serde_json::from_value(data)?),
        })
    }

    /// Wrap as a snapshot with exactly one populated slot.
    pub fn into_snapshot(self) -> Snapshot {
        let mut snap = Snapshot::default();
        match self {
            ModulePayload::System(v) => snap.system = Some(v),
            ModulePayload::Cpu(v) => snap.cpu = Some(v),
            ModulePayload::Memory(v) => snap.memory = Some(v),
            ModulePayload::Disk(v) => snap.disk = Some(v),
            ModulePayload::Network(v) => snap.network = Some(v),
            ModulePayload::Processes(v) => snap.processes = Some(v),
        }
        snap
    }
}
