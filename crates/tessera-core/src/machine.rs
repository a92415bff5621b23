use std::collections::BTreeMap;
use std::fmt;

use num_enum::TryFromPrimitive;

use crate::error::{CoreError, CoreResult};

/// A processor kind that task variants target.
/// The declaration order is the preference order: GPU, then OpenMP, then CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskTarget {
    Gpu,
    Omp,
    Cpu,
}

impl TaskTarget {
    pub fn variant(&self) -> VariantCode {
        match self {
            TaskTarget::Gpu => VariantCode::Gpu,
            TaskTarget::Omp => VariantCode::Omp,
            TaskTarget::Cpu => VariantCode::Cpu,
        }
    }
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTarget::Gpu => write!(f, "GPU"),
            TaskTarget::Omp => write!(f, "OMP"),
            TaskTarget::Cpu => write!(f, "CPU"),
        }
    }
}

/// The code of a task variant, used as the launch tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive)]
#[num_enum(error_type(name = CoreError, constructor = VariantCode::invalid))]
#[repr(i64)]
pub enum VariantCode {
    Cpu = 1,
    Gpu = 2,
    Omp = 3,
}

impl VariantCode {
    fn invalid(value: i64) -> CoreError {
        CoreError::invalid(format!("variant code: {value}"))
    }

    pub fn target(&self) -> TaskTarget {
        match self {
            VariantCode::Cpu => TaskTarget::Cpu,
            VariantCode::Gpu => TaskTarget::Gpu,
            VariantCode::Omp => TaskTarget::Omp,
        }
    }
}

/// A memory kind that can hold store data or external allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreTarget {
    Sysmem,
    Fbmem,
    Zcmem,
    Socketmem,
}

impl StoreTarget {
    /// Whether a task running on `target` can access this memory directly.
    pub fn is_accessible_from(&self, target: TaskTarget) -> bool {
        match self {
            StoreTarget::Sysmem => target != TaskTarget::Gpu,
            StoreTarget::Socketmem => target == TaskTarget::Omp,
            StoreTarget::Fbmem => target == TaskTarget::Gpu,
            StoreTarget::Zcmem => true,
        }
    }
}

impl fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTarget::Sysmem => write!(f, "SYSMEM"),
            StoreTarget::Fbmem => write!(f, "FBMEM"),
            StoreTarget::Zcmem => write!(f, "ZCMEM"),
            StoreTarget::Socketmem => write!(f, "SOCKETMEM"),
        }
    }
}

/// A half-open range `low..high` of processor indices of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorRange {
    pub low: u32,
    pub high: u32,
    pub per_node_count: u32,
}

impl ProcessorRange {
    pub fn new(low: u32, high: u32, per_node_count: u32) -> Self {
        if high <= low {
            Self::empty()
        } else {
            Self {
                low,
                high,
                per_node_count: per_node_count.max(1),
            }
        }
    }

    pub fn empty() -> Self {
        Self {
            low: 0,
            high: 0,
            per_node_count: 1,
        }
    }

    pub fn count(&self) -> u32 {
        self.high.saturating_sub(self.low)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn intersect(&self, other: &ProcessorRange) -> ProcessorRange {
        if self.per_node_count != other.per_node_count {
            return ProcessorRange::empty();
        }
        ProcessorRange::new(
            self.low.max(other.low),
            self.high.min(other.high),
            self.per_node_count,
        )
    }

    /// Selects processors `from..to` relative to the start of this range.
    pub fn slice(&self, from: u32, to: u32) -> ProcessorRange {
        let low = self.low.saturating_add(from).min(self.high);
        let high = self.low.saturating_add(to).min(self.high);
        ProcessorRange::new(low, high, self.per_node_count)
    }
}

impl fmt::Display for ProcessorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proc([{}, {}], {} per node)", self.low, self.high, self.per_node_count)
    }
}

/// The processors available to an operation, per task target.
/// Only non-empty ranges are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Machine {
    ranges: BTreeMap<TaskTarget, ProcessorRange>,
}

impl Machine {
    pub fn new(ranges: impl IntoIterator<Item = (TaskTarget, ProcessorRange)>) -> Self {
        Self {
            ranges: ranges
                .into_iter()
                .filter(|(_, range)| !range.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The targets with processors, in preference order.
    pub fn valid_targets(&self) -> Vec<TaskTarget> {
        self.ranges.keys().copied().collect()
    }

    pub fn preferred_target(&self) -> CoreResult<TaskTarget> {
        self.ranges
            .keys()
            .next()
            .copied()
            .ok_or_else(|| CoreError::invalid("machine has no processors"))
    }

    pub fn processor_range(&self, target: TaskTarget) -> ProcessorRange {
        self.ranges
            .get(&target)
            .copied()
            .unwrap_or_else(ProcessorRange::empty)
    }

    pub fn count(&self, target: TaskTarget) -> u32 {
        self.processor_range(target).count()
    }

    /// The number of processors of the preferred target.
    pub fn preferred_count(&self) -> u32 {
        self.ranges.values().next().map(|x| x.count()).unwrap_or(0)
    }

    pub fn only(&self, targets: &[TaskTarget]) -> Machine {
        Machine {
            ranges: self
                .ranges
                .iter()
                .filter(|(t, _)| targets.contains(t))
                .map(|(t, r)| (*t, *r))
                .collect(),
        }
    }

    /// Keeps processors `from..to` of the preferred target only.
    pub fn slice(&self, from: u32, to: u32) -> CoreResult<Machine> {
        let target = self.preferred_target()?;
        Ok(Machine::new([(
            target,
            self.processor_range(target).slice(from, to),
        )]))
    }

    pub fn intersect(&self, other: &Machine) -> Machine {
        Machine::new(
            self.ranges
                .iter()
                .filter_map(|(t, r)| other.ranges.get(t).map(|o| (*t, r.intersect(o)))),
        )
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Machine(")?;
        for (i, (target, range)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{target}: {range}")?;
        }
        write!(f, ")")
    }
}
