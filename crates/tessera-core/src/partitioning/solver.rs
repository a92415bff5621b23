use indexmap::IndexMap;
use log::debug;
use num::Integer;

use crate::data::store::LogicalStore;
use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::mapping::ArgumentKind;
use crate::partitioning::constraint::{Constraint, ImageComputationHint, Variable};
use crate::partitioning::launch_shape::PartitionManager;
use crate::partitioning::partition::{
    join_restrictions, Image, Partition, Restriction, Tiling,
};

/// A store argument of a task together with its partition symbol.
#[derive(Debug, Clone)]
pub(crate) struct SolverArgument {
    pub variable: Variable,
    pub store: LogicalStore,
    pub kind: ArgumentKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Launch {
    /// A store of the launch is empty, so no task runs.
    Empty,
    Single,
    Index(Domain),
}

/// The solution of the constraints of one task.
#[derive(Debug, Clone)]
pub(crate) struct Strategy {
    partitions: IndexMap<Variable, Partition>,
    launch: Launch,
    single_dim: usize,
}

impl Strategy {
    pub fn partition(&self, variable: &Variable) -> &Partition {
        self.partitions
            .get(variable)
            .unwrap_or(&Partition::NoPartition)
    }

    pub fn launch(&self) -> &Launch {
        &self.launch
    }

    /// The dimension of the index a single task observes.
    pub fn single_dim(&self) -> usize {
        self.single_dim
    }
}

/// Combines the color spaces of the partitions of a task into a launch domain.
#[derive(Debug, Default)]
pub(crate) struct LaunchDomainResolver {
    domains: Vec<Domain>,
    volumes: Vec<u64>,
    unbound_dim: Option<usize>,
    must_be_sequential: bool,
    must_be_1d: bool,
}

impl LaunchDomainResolver {
    pub fn record_launch_domain(&mut self, domain: Domain) {
        if !self.volumes.contains(&domain.volume()) {
            self.volumes.push(domain.volume());
        }
        if !self.domains.contains(&domain) {
            self.domains.push(domain);
        }
        if self.domains.len() > 1 {
            self.must_be_1d = true;
        }
        if self.volumes.len() > 1 {
            self.must_be_sequential = true;
        }
    }

    pub fn record_unbound_store(&mut self, dim: usize) {
        match self.unbound_dim {
            Some(x) if x != dim => self.must_be_sequential = true,
            _ => self.unbound_dim = Some(dim),
        }
    }

    pub fn set_must_be_sequential(&mut self) {
        self.must_be_sequential = true;
    }

    pub fn resolve(&self) -> Option<Domain> {
        if self.must_be_sequential || self.domains.is_empty() {
            return None;
        }
        let volume = self.volumes[0];
        if self.must_be_1d {
            if self.unbound_dim.is_some_and(|x| x > 1) {
                return None;
            }
            return Some(Domain::from_extents(&[volume]));
        }
        let domain = &self.domains[0];
        match self.unbound_dim {
            Some(x) if x != domain.ndim() => Some(Domain::from_extents(&[volume])),
            _ => Some(domain.clone()),
        }
    }
}

#[derive(Debug)]
struct UnionFind {
    parents: IndexMap<Variable, Variable>,
}

impl UnionFind {
    fn new(variables: impl Iterator<Item = Variable>) -> Self {
        Self {
            parents: variables.map(|v| (v, v)).collect(),
        }
    }

    fn find(&self, variable: Variable) -> Variable {
        let mut current = variable;
        while let Some(parent) = self.parents.get(&current) {
            if *parent == current {
                break;
            }
            current = *parent;
        }
        current
    }

    fn union(&mut self, lhs: Variable, rhs: Variable) {
        let (lhs, rhs) = (self.find(lhs), self.find(rhs));
        if lhs != rhs {
            let positions = (
                self.parents.get_index_of(&lhs),
                self.parents.get_index_of(&rhs),
            );
            let (root, child) = match positions {
                (Some(l), Some(r)) if r < l => (rhs, lhs),
                _ => (lhs, rhs),
            };
            self.parents.insert(child, root);
        }
    }
}

#[derive(Debug, Clone)]
enum DependentRule {
    Image {
        func: Variable,
        hint: ImageComputationHint,
    },
    Scale {
        factors: Vec<u64>,
        smaller: Variable,
    },
    Bloat {
        source: Variable,
        low: Vec<u64>,
        high: Vec<u64>,
    },
    ScaleThenBloat {
        factors: Vec<u64>,
        smaller: Variable,
        low: Vec<u64>,
        high: Vec<u64>,
    },
}

impl DependentRule {
    fn sources(&self) -> Vec<Variable> {
        match self {
            DependentRule::Image { func, .. } => vec![*func],
            DependentRule::Scale { smaller, .. }
            | DependentRule::ScaleThenBloat { smaller, .. } => {
                vec![*smaller]
            }
            DependentRule::Bloat { source, .. } => vec![*source],
        }
    }

    fn combine(self, other: DependentRule) -> CoreResult<DependentRule> {
        let (scale, bloat) = match (self, other) {
            (x @ DependentRule::Scale { .. }, y @ DependentRule::Bloat { .. })
            | (y @ DependentRule::Bloat { .. }, x @ DependentRule::Scale { .. }) => (x, y),
            (x, y) => {
                return Err(CoreError::invalid(format!(
                    "a partition cannot be derived by both {x:?} and {y:?}"
                )))
            }
        };
        let (
            DependentRule::Scale { factors, smaller },
            DependentRule::Bloat { low, high, .. },
        ) = (scale, bloat)
        else {
            return Err(CoreError::internal("unexpected dependent rules"));
        };
        let coprime = factors
            .iter()
            .zip(low.iter().zip(&high))
            .all(|(f, (l, h))| f.gcd(l) == 1 && f.gcd(h) == 1);
        if !coprime {
            return Err(CoreError::invalid(format!(
                "scaling by {factors:?} and bloating by {low:?} and {high:?} \
                 cannot be combined unless the factors are coprime with the halos"
            )));
        }
        Ok(DependentRule::ScaleThenBloat {
            factors,
            smaller,
            low,
            high,
        })
    }
}

/// Infers a partition for every variable of a task and the launch domain of the task.
pub(crate) struct ConstraintSolver<'a> {
    arguments: &'a [SolverArgument],
    constraints: &'a [Constraint],
    log_decisions: bool,
}

impl<'a> ConstraintSolver<'a> {
    pub fn new(
        arguments: &'a [SolverArgument],
        constraints: &'a [Constraint],
        log_decisions: bool,
    ) -> Self {
        Self {
            arguments,
            constraints,
            log_decisions,
        }
    }

    fn collect_variables(&self) -> IndexMap<Variable, Vec<&'a SolverArgument>> {
        let mut variables: IndexMap<Variable, Vec<&SolverArgument>> = IndexMap::new();
        for argument in self.arguments {
            variables
                .entry(argument.variable)
                .or_default()
                .push(argument);
        }
        variables
    }

    fn check_aligned(lhs: &SolverArgument, rhs: &SolverArgument) -> CoreResult<()> {
        match (lhs.store.is_unbound(), rhs.store.is_unbound()) {
            (true, true) => {
                if lhs.store.dim() != rhs.store.dim() {
                    return Err(CoreError::invalid(format!(
                        "unbound stores of {} and {} have different dimensions",
                        lhs.variable, rhs.variable
                    )));
                }
                Ok(())
            }
            (false, false) => {
                let (l, r) = (lhs.store.extents()?, rhs.store.extents()?);
                if l != r {
                    return Err(CoreError::invalid(format!(
                        "aligned stores of {} and {} have different extents {l:?} and {r:?}",
                        lhs.variable, rhs.variable
                    )));
                }
                Ok(())
            }
            _ => Err(CoreError::invalid(format!(
                "an unbound store can only be aligned with unbound stores ({} and {})",
                lhs.variable, rhs.variable
            ))),
        }
    }

    pub fn solve(
        &self,
        num_pieces: u32,
        manager: &mut PartitionManager,
    ) -> CoreResult<Strategy> {
        let variables = self.collect_variables();
        for constraint in self.constraints {
            if self.log_decisions {
                debug!("constraint: {constraint}");
            }
            if let Some(v) = constraint
                .variables()
                .into_iter()
                .find(|v| !variables.contains_key(v))
            {
                return Err(CoreError::invalid(format!(
                    "constraint {constraint} refers to {v} which has no store in the task"
                )));
            }
        }

        for arguments in variables.values() {
            for pair in arguments.windows(2) {
                Self::check_aligned(pair[0], pair[1])?;
            }
        }
        let mut classes = UnionFind::new(variables.keys().copied());
        for constraint in self.constraints {
            if let Constraint::Alignment { lhs, rhs } = constraint {
                Self::check_aligned(variables[lhs][0], variables[rhs][0])?;
                classes.union(*lhs, *rhs);
            }
        }

        let (class_restrictions, broadcasts) = self.compute_restrictions(&variables, &classes)?;
        let dependents = self.collect_dependents(&classes)?;

        let mut class_partitions: IndexMap<Variable, Partition> = IndexMap::new();
        let mut empty = false;
        let mut single_dim = None;
        for (variable, arguments) in variables.iter() {
            let root = classes.find(*variable);
            if dependents.contains_key(&root) || class_partitions.contains_key(&root) {
                continue;
            }
            let members = variables
                .iter()
                .filter(|(v, _)| classes.find(**v) == root)
                .flat_map(|(_, x)| x.iter().copied())
                .collect::<Vec<_>>();
            let representative = Self::find_representative(&members).unwrap_or(arguments[0]);
            if single_dim.is_none() {
                single_dim = Some(representative.store.dim());
            }
            let partition = if members
                .iter()
                .any(|x| x.store.is_unbound() || x.store.has_scalar_storage())
            {
                Partition::NoPartition
            } else {
                let extents = representative.store.extents()?;
                if extents.iter().product::<u64>() == 0 {
                    empty = true;
                }
                let restrictions = &class_restrictions[&root];
                Self::initial_partition(
                    &representative.store,
                    &extents,
                    restrictions,
                    num_pieces,
                    manager,
                )
            };
            if self.log_decisions {
                debug!(
                    "{} (representative of {root}) -> {partition}",
                    representative.variable
                );
            }
            class_partitions.insert(root, partition);
        }

        self.resolve_dependents(&variables, &classes, &dependents, &mut class_partitions)?;

        let partitions = variables
            .keys()
            .map(|v| {
                let partition = class_partitions
                    .get(&classes.find(*v))
                    .cloned()
                    .unwrap_or(Partition::NoPartition);
                (*v, partition)
            })
            .collect::<IndexMap<_, _>>();

        for (variable, axes) in broadcasts.iter() {
            let partition = &partitions[variable];
            let dim = variables[variable][0].store.dim();
            let mut restrictions = vec![Restriction::Allow; dim];
            axes.iter().for_each(|d| restrictions[*d] = Restriction::Forbid);
            if !partition.satisfies_restrictions(&restrictions) {
                return Err(CoreError::invalid(format!(
                    "{variable} is broadcast on axes {axes:?} but is partitioned as {partition}"
                )));
            }
        }

        let launch = if empty {
            Launch::Empty
        } else {
            let mut resolver = LaunchDomainResolver::default();
            for (variable, arguments) in variables.iter() {
                let partition = &partitions[variable];
                match partition.launch_domain() {
                    Some(domain) => resolver.record_launch_domain(domain),
                    None => {
                        for argument in arguments {
                            if argument.store.is_unbound() {
                                resolver.record_unbound_store(argument.store.dim());
                            } else if argument.kind == ArgumentKind::Output {
                                resolver.set_must_be_sequential();
                            }
                        }
                    }
                }
            }
            match resolver.resolve() {
                Some(domain) if domain.volume() > 1 => Launch::Index(domain),
                _ => Launch::Single,
            }
        };
        if self.log_decisions {
            debug!("launch: {launch:?}");
        }
        Ok(Strategy {
            partitions,
            launch,
            single_dim: single_dim.unwrap_or_default(),
        })
    }

    #[allow(clippy::type_complexity)]
    fn compute_restrictions(
        &self,
        variables: &IndexMap<Variable, Vec<&SolverArgument>>,
        classes: &UnionFind,
    ) -> CoreResult<(IndexMap<Variable, Vec<Restriction>>, IndexMap<Variable, Vec<usize>>)> {
        let mut restrictions: IndexMap<Variable, Vec<Restriction>> = IndexMap::new();
        for (variable, arguments) in variables.iter() {
            let dim = arguments[0].store.dim();
            let mut joined = vec![Restriction::Allow; dim];
            for argument in arguments {
                if argument.store.is_unbound() {
                    continue;
                }
                join_restrictions(&mut joined, &argument.store.restrictions());
            }
            restrictions.insert(*variable, joined);
        }
        let mut broadcasts: IndexMap<Variable, Vec<usize>> = IndexMap::new();
        for constraint in self.constraints {
            let Constraint::Broadcast { variable, axes } = constraint else {
                continue;
            };
            let entry = &mut restrictions[variable];
            let axes = match axes {
                Some(axes) => {
                    if let Some(d) = axes.iter().find(|d| **d >= entry.len()) {
                        return Err(CoreError::invalid(format!(
                            "cannot broadcast axis {d} of {}-D {variable}",
                            entry.len()
                        )));
                    }
                    axes.clone()
                }
                None => (0..entry.len()).collect(),
            };
            axes.iter().for_each(|d| entry[*d] = Restriction::Forbid);
            broadcasts.entry(*variable).or_default().extend(axes);
        }
        let mut class_restrictions: IndexMap<Variable, Vec<Restriction>> = IndexMap::new();
        for (variable, r) in restrictions.into_iter() {
            let root = classes.find(variable);
            match class_restrictions.get_mut(&root) {
                Some(joined) => join_restrictions(joined, &r),
                None => {
                    class_restrictions.insert(root, r);
                }
            }
        }
        Ok((class_restrictions, broadcasts))
    }

    fn collect_dependents(
        &self,
        classes: &UnionFind,
    ) -> CoreResult<IndexMap<Variable, DependentRule>> {
        let mut dependents: IndexMap<Variable, DependentRule> = IndexMap::new();
        for constraint in self.constraints {
            let (target, rule) = match constraint {
                Constraint::Image { func, range, hint } => (
                    *range,
                    DependentRule::Image {
                        func: *func,
                        hint: *hint,
                    },
                ),
                Constraint::Scale {
                    factors,
                    smaller,
                    bigger,
                } => (
                    *bigger,
                    DependentRule::Scale {
                        factors: factors.clone(),
                        smaller: *smaller,
                    },
                ),
                Constraint::Bloat {
                    source,
                    bloat,
                    low,
                    high,
                } => (
                    *bloat,
                    DependentRule::Bloat {
                        source: *source,
                        low: low.clone(),
                        high: high.clone(),
                    },
                ),
                Constraint::Alignment { .. } | Constraint::Broadcast { .. } => continue,
            };
            let root = classes.find(target);
            if rule.sources().iter().any(|s| classes.find(*s) == root) {
                return Err(CoreError::invalid(format!(
                    "{constraint} derives a partition from the partition itself"
                )));
            }
            let rule = match dependents.shift_remove(&root) {
                Some(existing) => existing.combine(rule)?,
                None => rule,
            };
            dependents.insert(root, rule);
        }
        Ok(dependents)
    }

    /// The highest-dimensional output, or the highest-dimensional store if there is no output.
    fn find_representative<'b>(members: &[&'b SolverArgument]) -> Option<&'b SolverArgument> {
        let pick = |kind: Option<ArgumentKind>| {
            let mut best: Option<&SolverArgument> = None;
            for member in members
                .iter()
                .filter(|x| kind.is_none_or(|k| x.kind == k))
            {
                if best.is_none_or(|b| member.store.dim() > b.store.dim()) {
                    best = Some(member);
                }
            }
            best
        };
        pick(Some(ArgumentKind::Output)).or_else(|| pick(None))
    }

    fn initial_partition(
        store: &LogicalStore,
        extents: &[u64],
        restrictions: &[Restriction],
        num_pieces: u32,
        manager: &mut PartitionManager,
    ) -> Partition {
        if let Some(partition @ Partition::Tiling(_)) = store.key_partition() {
            let colors = partition
                .color_shape()
                .map(|x| x.iter().product::<u64>())
                .unwrap_or_default();
            if colors > 1
                && colors <= u64::from(num_pieces)
                && partition.satisfies_restrictions(restrictions)
            {
                return partition;
            }
        }
        match manager.compute_launch_shape(num_pieces, restrictions, extents) {
            Some(launch_shape) => {
                let tile_shape = PartitionManager::compute_tile_shape(extents, &launch_shape);
                let color_shape = PartitionManager::compute_tile_shape(extents, &tile_shape);
                Partition::Tiling(Tiling::new(
                    tile_shape,
                    color_shape,
                    vec![0; extents.len()],
                ))
            }
            None => Partition::NoPartition,
        }
    }

    fn resolve_dependents(
        &self,
        variables: &IndexMap<Variable, Vec<&SolverArgument>>,
        classes: &UnionFind,
        dependents: &IndexMap<Variable, DependentRule>,
        partitions: &mut IndexMap<Variable, Partition>,
    ) -> CoreResult<()> {
        let mut pending = dependents.keys().copied().collect::<Vec<_>>();
        while !pending.is_empty() {
            let mut progress = false;
            let mut remaining = vec![];
            for root in pending {
                let rule = &dependents[&root];
                let sources = rule
                    .sources()
                    .iter()
                    .map(|s| partitions.get(&classes.find(*s)).cloned())
                    .collect::<Option<Vec<_>>>();
                let Some(sources) = sources else {
                    remaining.push(root);
                    continue;
                };
                let partition = match rule {
                    DependentRule::Image { func, hint } => {
                        let range = variables[&root][0];
                        Self::compute_image(
                            &variables[func][0].store,
                            &sources[0],
                            &range.store,
                            *hint,
                        )?
                    }
                    DependentRule::Scale { factors, .. } => sources[0].scale(factors)?,
                    DependentRule::Bloat { low, high, .. } => sources[0].bloat(low, high)?,
                    DependentRule::ScaleThenBloat {
                        factors, low, high, ..
                    } => sources[0].scale(factors)?.bloat(low, high)?,
                };
                if self.log_decisions {
                    debug!("{root} derived by {rule:?} -> {partition}");
                }
                partitions.insert(root, partition);
                progress = true;
            }
            if !progress {
                return Err(CoreError::invalid(format!(
                    "the partitions of {remaining:?} depend on each other"
                )));
            }
            pending = remaining;
        }
        Ok(())
    }

    /// Computes the rectangles of `range` that the points or rectangles stored in each
    /// piece of `func` refer to.
    fn compute_image(
        func: &LogicalStore,
        func_partition: &Partition,
        range: &LogicalStore,
        hint: ImageComputationHint,
    ) -> CoreResult<Partition> {
        let range_dim = range.dim();
        let Some(colors) = func_partition.launch_domain() else {
            return Ok(Partition::NoPartition);
        };
        if func.volume()? == 0 {
            return Ok(Partition::NoPartition);
        }
        let is_rect = match (func.ty().as_point(), func.ty().as_rect()) {
            (Some(n), _) if n == range_dim => false,
            (_, Some(n)) if n == range_dim => true,
            _ => {
                return Err(CoreError::invalid(format!(
                    "an image of a {range_dim}-D store needs points or rectangles of that \
                     dimension, but the function store has type {}",
                    func.ty()
                )))
            }
        };
        let physical = func.get_physical_store()?;
        let bounds = Domain::from_extents(&func.extents()?);
        let mut rects = Vec::with_capacity(colors.volume() as usize);
        for color in colors.points() {
            let piece = func_partition.child_domain(&color, &bounds)?;
            let mut corners = vec![];
            for point in piece.points() {
                let bytes = physical.read_bytes(&point)?;
                let values = bytes
                    .chunks_exact(8)
                    .map(|x| {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(x);
                        i64::from_ne_bytes(buf)
                    })
                    .collect::<Vec<_>>();
                let (lo, hi) = if is_rect {
                    (values[..range_dim].to_vec(), values[range_dim..].to_vec())
                } else {
                    (values.clone(), values)
                };
                if lo.iter().zip(&hi).any(|(l, h)| h < l) {
                    continue;
                }
                corners.push((lo, hi));
            }
            rects.push(Self::bounding_rect(&corners, range_dim, hint)?);
        }
        Ok(Partition::Image(Image::new(colors.extents(), rects)?))
    }

    fn bounding_rect(
        corners: &[(Vec<i64>, Vec<i64>)],
        ndim: usize,
        hint: ImageComputationHint,
    ) -> CoreResult<Domain> {
        let (Some(first), Some(last)) = (corners.first(), corners.last()) else {
            return Ok(Domain::empty(ndim));
        };
        match hint {
            ImageComputationHint::FirstLast => {
                Domain::new(Point::new(first.0.clone()), Point::new(last.1.clone()))
            }
            ImageComputationHint::MinMax | ImageComputationHint::None => {
                let mut lo = first.0.clone();
                let mut hi = first.1.clone();
                for (l, h) in corners {
                    for d in 0..ndim {
                        lo[d] = lo[d].min(l[d]);
                        hi[d] = hi[d].max(h[d]);
                    }
                }
                Domain::new(Point::new(lo), Point::new(hi))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_single_domain() {
        let mut resolver = LaunchDomainResolver::default();
        resolver.record_launch_domain(Domain::from_extents(&[2, 2]));
        resolver.record_launch_domain(Domain::from_extents(&[2, 2]));
        assert_eq!(resolver.resolve(), Some(Domain::from_extents(&[2, 2])));
    }

    #[test]
    fn test_resolver_conflicting_domains() {
        let mut resolver = LaunchDomainResolver::default();
        resolver.record_launch_domain(Domain::from_extents(&[2, 2]));
        resolver.record_launch_domain(Domain::from_extents(&[4]));
        assert_eq!(resolver.resolve(), Some(Domain::from_extents(&[4])));
        resolver.record_unbound_store(2);
        assert_eq!(resolver.resolve(), None);
    }

    #[test]
    fn test_resolver_unequal_volumes() {
        let mut resolver = LaunchDomainResolver::default();
        resolver.record_launch_domain(Domain::from_extents(&[2]));
        resolver.record_launch_domain(Domain::from_extents(&[3]));
        assert_eq!(resolver.resolve(), None);
    }

    #[test]
    fn test_resolver_unbound() {
        let mut resolver = LaunchDomainResolver::default();
        resolver.record_launch_domain(Domain::from_extents(&[2, 2]));
        resolver.record_unbound_store(1);
        assert_eq!(resolver.resolve(), Some(Domain::from_extents(&[4])));
        let mut sequential = LaunchDomainResolver::default();
        sequential.record_unbound_store(1);
        sequential.record_unbound_store(2);
        sequential.record_launch_domain(Domain::from_extents(&[4]));
        assert_eq!(sequential.resolve(), None);
        assert_eq!(LaunchDomainResolver::default().resolve(), None);
    }

    #[test]
    fn test_bounding_rect() -> CoreResult<()> {
        let corners = vec![
            (vec![3, 1], vec![3, 1]),
            (vec![0, 5], vec![0, 5]),
            (vec![2, 2], vec![2, 2]),
        ];
        assert_eq!(
            ConstraintSolver::bounding_rect(&corners, 2, ImageComputationHint::MinMax)?,
            Domain::new(Point::from([0, 1]), Point::from([3, 5]))?
        );
        let sorted = vec![(vec![1], vec![1]), (vec![4], vec![4])];
        assert_eq!(
            ConstraintSolver::bounding_rect(&sorted, 1, ImageComputationHint::FirstLast)?,
            Domain::new(Point::from([1]), Point::from([4]))?
        );
        assert!(ConstraintSolver::bounding_rect(&[], 2, ImageComputationHint::None)?.is_empty());
        Ok(())
    }
}
