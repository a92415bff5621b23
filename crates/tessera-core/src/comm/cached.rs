use std::hash::BuildHasherDefault;

use indexmap::IndexMap;
use log::debug;
use twox_hash::XxHash64;

use crate::comm::{CommunicatorFactory, CoreLauncher};
use crate::domain::Domain;
use crate::error::CoreResult;
use crate::machine::{Machine, ProcessorRange, TaskTarget};
use crate::substrate::FutureMap;

/// Hashes cache keys the same way in every process.
type StableHasher = BuildHasherDefault<XxHash64>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey<D> {
    desc: D,
    target: TaskTarget,
    range: ProcessorRange,
}

impl<D> CacheKey<D> {
    fn machine(&self) -> Machine {
        Machine::new([(self.target, self.range)])
    }
}

/// Base communicators are keyed by the number of participants.
type CommKey = CacheKey<u32>;
/// Aliases are keyed by the launch domain they were reprojected onto.
type AliasKey = CacheKey<Domain>;

/// How often a factory did real work, for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommunicatorStats {
    pub initializations: usize,
    pub finalizations: usize,
    pub live_communicators: usize,
    pub live_aliases: usize,
}

/// A factory wrapped with the communicator cache.
pub(crate) struct CachedFactory {
    factory: Box<dyn CommunicatorFactory>,
    communicators: IndexMap<CommKey, FutureMap, StableHasher>,
    aliases: IndexMap<AliasKey, FutureMap, StableHasher>,
    initializations: usize,
    finalizations: usize,
}

impl CachedFactory {
    pub fn new(factory: Box<dyn CommunicatorFactory>) -> Self {
        Self {
            factory,
            communicators: IndexMap::default(),
            aliases: IndexMap::default(),
            initializations: 0,
            finalizations: 0,
        }
    }

    pub fn needs_barrier(&self) -> bool {
        self.factory.needs_barrier()
    }

    pub fn is_supported_target(&self, target: TaskTarget) -> bool {
        self.factory.is_supported_target(target)
    }

    /// Returns the communicator for a launch over `launch_domain`.
    ///
    /// The base communicator is created once per number of participants. A launch over
    /// the domain of the base communicator uses it directly. Any other launch, including
    /// an offset 1-D launch, gets a cached alias that matches points to participants
    /// in C order.
    pub fn find_or_create(
        &mut self,
        launcher: &CoreLauncher<'_>,
        target: TaskTarget,
        range: ProcessorRange,
        launch_domain: &Domain,
    ) -> CoreResult<FutureMap> {
        let num_tasks = launch_domain.volume() as u32;
        let base = self.find_or_create_base(launcher, target, range, num_tasks)?;
        if base.domain() == launch_domain {
            return Ok(base);
        }
        let key = AliasKey {
            desc: launch_domain.clone(),
            target,
            range,
        };
        if let Some(alias) = self.aliases.get(&key) {
            return Ok(alias.clone());
        }
        let alias = base.reproject(launch_domain.clone())?;
        self.aliases.insert(key, alias.clone());
        Ok(alias)
    }

    fn find_or_create_base(
        &mut self,
        launcher: &CoreLauncher<'_>,
        target: TaskTarget,
        range: ProcessorRange,
        num_tasks: u32,
    ) -> CoreResult<FutureMap> {
        let key = CommKey {
            desc: num_tasks,
            target,
            range,
        };
        if let Some(communicator) = self.communicators.get(&key) {
            return Ok(communicator.clone());
        }
        let communicator = self
            .factory
            .initialize(launcher, &key.machine(), num_tasks)?;
        self.initializations += 1;
        self.communicators.insert(key, communicator.clone());
        Ok(communicator)
    }

    /// Finalizes every base communicator, newest first. Later calls do nothing.
    pub fn destroy(&mut self, launcher: &CoreLauncher<'_>) -> CoreResult<()> {
        self.aliases.clear();
        while let Some((key, communicator)) = self.communicators.pop() {
            debug!("destroying communicator over {} tasks on {}", key.desc, key.machine());
            self.factory
                .finalize(launcher, &key.machine(), key.desc, &communicator)?;
            self.finalizations += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> CommunicatorStats {
        CommunicatorStats {
            initializations: self.initializations,
            finalizations: self.finalizations,
            live_communicators: self.communicators.len(),
            live_aliases: self.aliases.len(),
        }
    }
}
