//! The state held by the store and the pure merge rules applied to it.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ConnectionType;
use crate::history::{CpuPoint, DiskPoint, History, MemoryPoint, NetworkPoint};
use crate::types::{Module, Snapshot};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    pub loading: bool,
    pub error: Option<String>,
    pub connection_type: ConnectionType,
}

impl ConnectionState {
    pub fn new(connection_type: ConnectionType) -> Self {
        Self {
            connected: false,
            loading: false,
            error: None,
            connection_type,
        }
    }
}

/// Chart series, one per metric. They are appended independently, so indices
/// do not line up across series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Histories {
    pub cpu: History<CpuPoint>,
    pub memory: History<MemoryPoint>,
    pub network: History<NetworkPoint>,
    pub disk: History<DiskPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorState {
    pub data: Snapshot,
    pub connection: ConnectionState,
    /// Wall-clock millis of the last ingest that carried data.
    pub last_update: Option<i64>,
    pub history: Histories,
    pub module_loading: BTreeMap<Module, bool>,
    pub module_errors: BTreeMap<Module, Option<String>>,
}

impl MonitorState {
    pub fn new(connection_type: ConnectionType) -> Self {
        Self {
            data: Snapshot::default(),
            connection: ConnectionState::new(connection_type),
            last_update: None,
            history: Histories::default(),
            module_loading: Module::ALL.into_iter().map(|m| (m, false)).collect(),
            module_errors: Module::ALL.into_iter().map(|m| (m, None)).collect(),
        }
    }

    /// Merge `snap` into the current data, stamping history points with `now`
    /// (millis). Slots absent from `snap` are left untouched.
    pub fn ingest_at(&mut self, snap: Snapshot, now: i64) {
        let arrived = snap.modules();
        if arrived.is_empty() {
            return;
        }
        let Snapshot {
            system,
            cpu,
            memory,
            disk,
            network,
            processes,
        } = snap;

        if let Some(v) = system {
            self.data.system = Some(v);
        }
        if let Some(v) = cpu {
            self.history.cpu.push(CpuPoint::sample(now, &v));
            self.data.cpu = Some(v);
        }
        if let Some(v) = memory {
            self.history.memory.push(MemoryPoint::sample(now, &v));
            self.data.memory = Some(v);
        }
        if let Some(v) = disk {
            self.history.disk.push(DiskPoint::sample(now, &v));
            self.data.disk = Some(v);
        }
        if let Some(v) = network {
            let slot = self.data.network.get_or_insert_with(Default::default);
            slot.merge(v);
            self.history.network.push(NetworkPoint::sample(now, slot));
        }
        if let Some(v) = processes {
            self.data.processes = Some(v);
        }

        for m in arrived {
            self.module_loading.insert(m, false);
            self.module_errors.insert(m, None);
        }
        self.last_update = Some(now);
        self.connection.error = None;
    }

    pub fn is_module_loading(&self, module: Module) -> bool {
        self.module_loading.get(&module).copied().unwrap_or(false)
    }

    pub fn module_error(&self, module: Module) -> Option<&str> {
        self.module_errors.get(&module).and_then(|e| e.as_deref())
    }

    pub fn set_module_loading(&mut self, module: Module, loading: bool) {
        self.module_loading.insert(module, loading);
    }

    pub fn set_module_error(&mut self, module: Module, error: Option<String>) {
        self.module_errors.insert(module, error);
    }

    /// Fresh connection attempt: everything is loading and no error stands.
    pub fn begin_loading(&mut self) {
        self.connection.loading = true;
        self.connection.error = None;
        for loading in self.module_loading.values_mut() {
            *loading = true;
        }
    }

    /// Mark every module as settled with `message` as its error.
    pub fn fail_all_modules(&mut self, message: &str) {
        for m in Module::ALL {
            self.module_loading.insert(m, false);
            self.module_errors.insert(m, Some(message.to_string()));
        }
    }
}
