use indexmap::IndexMap;
use log::{debug, error};

use crate::comm::cached::{CachedFactory, CommunicatorStats};
use crate::comm::{CommunicatorFactory, CoreLauncher};

/// The registered communicator factories, by backend name.
#[derive(Default)]
pub(crate) struct CommunicatorManager {
    factories: IndexMap<String, CachedFactory>,
}

impl CommunicatorManager {
    pub fn register_factory(
        &mut self,
        name: impl Into<String>,
        factory: Box<dyn CommunicatorFactory>,
    ) {
        let name = name.into();
        debug!("registering communicator factory {name}");
        self.factories.insert(name, CachedFactory::new(factory));
    }

    pub fn find_factory(&mut self, name: &str) -> Option<&mut CachedFactory> {
        self.factories.get_mut(name)
    }

    pub fn stats(&self, name: &str) -> Option<CommunicatorStats> {
        self.factories.get(name).map(|x| x.stats())
    }

    /// Destroys the communicators of every factory. Failures are logged and do not stop
    /// the remaining factories from being destroyed.
    pub fn destroy(&mut self, launcher: &CoreLauncher<'_>) {
        for (name, factory) in self.factories.iter_mut().rev() {
            if let Err(e) = factory.destroy(launcher) {
                error!("failed to destroy {name} communicators: {e}");
            }
        }
    }
}
