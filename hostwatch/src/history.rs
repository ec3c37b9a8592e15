//! Bounded chart histories: one FIFO series per metric.

use std::collections::VecDeque;

use serde::Serialize;

use crate::types::{CpuInfo, DiskInfo, MemoryInfo, NetworkInfo};

/// Points kept per metric series.
pub const HISTORY_CAPACITY: usize = 30;

pub fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if cap == 0 {
        return;
    }
    while dq.len() >= cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

/// Fixed-capacity FIFO series; the oldest point is dropped once full.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct History<T> {
    points: VecDeque<T>,
    #[serde(skip)]
    cap: usize,
}

impl<T> History<T> {
    /// A series holds at least one point.
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            points: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, point: T) {
        push_capped(&mut self.points, point, self.cap);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn latest(&self) -> Option<&T> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.points.iter()
    }
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuPoint {
    pub timestamp: i64,
    pub usage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryPoint {
    pub timestamp: i64,
    pub percent: f64,
    pub used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPoint {
    pub timestamp: i64,
    pub upload_speed: f64,
    pub download_speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskPoint {
    pub timestamp: i64,
    pub read_speed: f64,
    pub write_speed: f64,
    pub percent: f64,
}

impl CpuPoint {
    pub fn sample(timestamp: i64, cpu: &CpuInfo) -> Self {
        Self {
            timestamp,
            usage: cpu.usage,
        }
    }
}

impl MemoryPoint {
    pub fn sample(timestamp: i64, mem: &MemoryInfo) -> Self {
        Self {
            timestamp,
            percent: mem.percent,
            used: mem.used,
        }
    }
}

impl NetworkPoint {
    // Missing speeds (partial update never carried them) chart as zero
    pub fn sample(timestamp: i64, net: &NetworkInfo) -> Self {
        Self {
            timestamp,
            upload_speed: net.upload_speed.unwrap_or(0.0),
            download_speed: net.download_speed.unwrap_or(0.0),
        }
    }
}

impl DiskPoint {
    pub fn sample(timestamp: i64, disk: &DiskInfo) -> Self {
        Self {
            timestamp,
            read_speed: disk.read_speed,
            write_speed: disk.write_speed,
            percent: disk.percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_after_capacity() {
        let mut h = History::new(HISTORY_CAPACITY);
        for i in 0..31 {
            h.push(i);
        }
        assert_eq!(h.len(), 30);
        assert_eq!(h.iter().next(), Some(&1));
        assert_eq!(h.latest(), Some(&30));
    }

    #[test]
    fn push_capped_handles_small_caps() {
        let mut dq = VecDeque::new();
        push_capped(&mut dq, 1, 1);
        push_capped(&mut dq, 2, 1);
        assert_eq!(dq, VecDeque::from(vec![2]));

        let mut dq = VecDeque::new();
        push_capped(&mut dq, 1, 0);
        assert!(dq.is_empty());
    }

    #[test]
    fn zero_capacity_keeps_the_latest_point() {
        let mut h = History::new(0);
        assert_eq!(h.capacity(), 1);
        h.push(1);
        h.push(2);
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest(), Some(&2));
    }
}
