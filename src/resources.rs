//! Resource and capability-tag value types
//!
//! The numeric request/capacity model shared by providers, nodes, and
//! the scheduler: CPU in millicores, memory in bytes, GPUs as a unit
//! count, plus a small set of boolean capability bits describing what
//! kinds of work a node can host independent of numeric headroom.

use serde::{Deserialize, Serialize};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A resource triple with opaque request tags.
///
/// Used both as a request ("I need this much") and as one leg of a
/// [`Capacity`] ("this much exists / is used / is free").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// CPU in millicores
    pub cpu: i64,
    /// Memory in bytes
    pub memory: i64,
    /// GPU unit count
    pub gpu: i64,
    /// Ordered labels carried opaquely alongside the numeric request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ResourceInfo {
    /// Create a resource triple with no tags
    pub fn new(cpu: i64, memory: i64, gpu: i64) -> Self {
        Self { cpu, memory, gpu, tags: Vec::new() }
    }

    /// True when every axis of `request` fits inside `self`.
    pub fn fits(&self, request: &ResourceInfo) -> bool {
        self.cpu >= request.cpu && self.memory >= request.memory && self.gpu >= request.gpu
    }

    /// Component-wise sum
    pub fn plus(&self, other: &ResourceInfo) -> ResourceInfo {
        ResourceInfo {
            cpu: self.cpu.saturating_add(other.cpu),
            memory: self.memory.saturating_add(other.memory),
            gpu: self.gpu.saturating_add(other.gpu),
            tags: self.tags.clone(),
        }
    }

    /// Component-wise difference, floored at zero on every axis
    pub fn minus(&self, other: &ResourceInfo) -> ResourceInfo {
        ResourceInfo {
            cpu: (self.cpu - other.cpu).max(0),
            memory: (self.memory - other.memory).max(0),
            gpu: (self.gpu - other.gpu).max(0),
            tags: self.tags.clone(),
        }
    }

    /// True when all three axes are zero
    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0 && self.gpu == 0
    }

    /// Ranking score used wherever nodes are ordered by headroom:
    /// `cpu + memory/GiB + gpu*1000`. Memory is normalised to
    /// gigabytes so all three dimensions share a scale. The weights
    /// are a hand-tuned heuristic and are authoritative as-is.
    pub fn availability_score(&self) -> f64 {
        self.cpu as f64 + self.memory as f64 / GIB + self.gpu as f64 * 1000.0
    }
}

/// The total/used/available triple of a node or provider.
///
/// Invariant at rest: `available = total - used`, all components
/// nonnegative. Sums of capacities are taken component-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    /// Everything the backing hardware offers
    pub total: ResourceInfo,
    /// Currently committed
    pub used: ResourceInfo,
    /// `total - used`
    pub available: ResourceInfo,
}

impl Capacity {
    /// Build a capacity from total and used, deriving `available`.
    pub fn new(total: ResourceInfo, used: ResourceInfo) -> Self {
        let available = total.minus(&used);
        Self { total, used, available }
    }

    /// Component-wise sum of two capacities
    pub fn plus(&self, other: &Capacity) -> Capacity {
        Capacity {
            total: self.total.plus(&other.total),
            used: self.used.plus(&other.used),
            available: self.available.plus(&other.available),
        }
    }

    /// Commit a request, growing `used` and shrinking `available`.
    pub fn reserve(&mut self, request: &ResourceInfo) {
        self.used = self.used.plus(request);
        self.available = self.total.minus(&self.used);
    }

    /// Release a prior commitment.
    pub fn release(&mut self, request: &ResourceInfo) {
        self.used = self.used.minus(request);
        self.available = self.total.minus(&self.used);
    }
}

/// Boolean capability bits describing what classes of work a node or
/// provider can host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTags {
    /// General CPU-bound work
    pub cpu: bool,
    /// GPU-accelerated work
    pub gpu: bool,
    /// Memory-heavy work
    pub memory: bool,
    /// Work requiring an attached camera
    pub camera: bool,
}

impl CapabilityTags {
    /// Parse a label list. Matching is case-insensitive; unknown
    /// tokens are silently dropped.
    pub fn parse(labels: &[String]) -> Self {
        let mut tags = Self::default();
        for label in labels {
            match label.to_ascii_lowercase().as_str() {
                "cpu" => tags.cpu = true,
                "gpu" => tags.gpu = true,
                "memory" => tags.memory = true,
                "camera" => tags.camera = true,
                _ => {}
            }
        }
        tags
    }

    /// Derive the capability bits a placement request implies: any
    /// axis the request asks for, plus whatever its labels name.
    pub fn for_request(request: &ResourceInfo) -> Self {
        let mut tags = Self::parse(&request.tags);
        if request.cpu > 0 {
            tags.cpu = true;
        }
        if request.gpu > 0 {
            tags.gpu = true;
        }
        if request.memory > 0 {
            tags.memory = true;
        }
        tags
    }

    /// True when `self` offers every bit `required` asks for.
    pub fn superset_of(&self, required: &CapabilityTags) -> bool {
        (!required.cpu || self.cpu)
            && (!required.gpu || self.gpu)
            && (!required.memory || self.memory)
            && (!required.camera || self.camera)
    }

    /// Bitwise OR of two tag sets
    pub fn union(&self, other: &CapabilityTags) -> CapabilityTags {
        CapabilityTags {
            cpu: self.cpu || other.cpu,
            gpu: self.gpu || other.gpu,
            memory: self.memory || other.memory,
            camera: self.camera || other.camera,
        }
    }

    /// No bit set
    pub fn is_empty(&self) -> bool {
        !(self.cpu || self.gpu || self.memory || self.camera)
    }

    /// The set bits as lowercase labels, in declaration order.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        if self.cpu {
            labels.push("cpu".to_string());
        }
        if self.gpu {
            labels.push("gpu".to_string());
        }
        if self.memory {
            labels.push("memory".to_string());
        }
        if self.camera {
            labels.push("camera".to_string());
        }
        labels
    }
}
