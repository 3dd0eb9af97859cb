use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use ember_core::HostMetrics;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub agent_id: Uuid,
    pub at: DateTime<Utc>,
    pub cpu_load: f64,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub disk_free_bytes: u64,
}

impl MetricSample {
    pub fn from_report(agent_id: Uuid, at: DateTime<Utc>, m: &HostMetrics) -> Self {
        Self {
            agent_id,
            at,
            cpu_load: m.cpu_load_1m,
            mem_used_bytes: m.mem_used_bytes,
            mem_total_bytes: m.mem_total_bytes,
            disk_free_bytes: m.disk_free_bytes,
        }
    }
}

#[derive(Debug)]
struct Ring {
    max: usize,
    samples: VecDeque<MetricSample>,
}

impl Ring {
    fn push(&mut self, sample: MetricSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.max {
            self.samples.pop_front();
        }
    }
}

/// Bounded in-process history per agent. Nothing here is persisted.
#[derive(Debug)]
pub struct MetricsStore {
    capacity: usize,
    rings: Mutex<HashMap<Uuid, Ring>>,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, sample: MetricSample) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings
            .entry(sample.agent_id)
            .or_insert_with(|| Ring {
                max: self.capacity,
                samples: VecDeque::new(),
            })
            .push(sample);
    }

    /// Up to `limit` most recent samples, oldest first.
    pub fn recent(&self, agent_id: Uuid, limit: usize) -> Vec<MetricSample> {
        let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ring) = rings.get(&agent_id) else {
            return Vec::new();
        };
        let skip = ring.samples.len().saturating_sub(limit);
        ring.samples.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self, agent_id: Uuid) -> Option<MetricSample> {
        let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.get(&agent_id).and_then(|r| r.samples.back().cloned())
    }

    pub fn forget(&self, agent_id: Uuid) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.remove(&agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(agent_id: Uuid, n: u64) -> MetricSample {
        MetricSample {
            agent_id,
            at: Utc::now(),
            cpu_load: n as f64,
            mem_used_bytes: n,
            mem_total_bytes: 100,
            disk_free_bytes: 0,
        }
    }

    #[test]
    fn evicts_oldest_first_at_capacity() {
        let store = MetricsStore::new(3);
        let id = Uuid::new_v4();
        for n in 1..=5 {
            store.record(sample(id, n));
        }
        let kept: Vec<u64> = store.recent(id, 10).iter().map(|s| s.mem_used_bytes).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(store.latest(id).unwrap().mem_used_bytes, 5);
        assert_eq!(store.recent(id, 2).len(), 2);
    }

    #[test]
    fn agents_are_independent() {
        let store = MetricsStore::new(2);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.record(sample(a, 1));
        assert!(store.recent(b, 10).is_empty());
        store.forget(a);
        assert!(store.latest(a).is_none());
    }
}
