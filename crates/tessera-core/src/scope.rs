//! The execution context of the submitting thread.
//!
//! Each thread carries its own priority, provenance, exception mode and machine.
//! A [`Scope`] guard changes any of them and restores the previous values when it is dropped,
//! including during unwinding.

use std::cell::RefCell;

use crate::error::{CoreError, CoreResult};
use crate::machine::Machine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExceptionMode {
    /// Exceptions raised by tasks are returned by the submitting call.
    #[default]
    Immediate,
    /// Exceptions are queued until [`crate::runtime::Runtime::raise_pending_exception`].
    Deferred,
    /// Exceptions are logged and dropped.
    Ignored,
}

#[derive(Debug, Default)]
struct ScopeState {
    priority: i32,
    provenance: Option<String>,
    exception_mode: ExceptionMode,
    machine: Option<Machine>,
}

thread_local! {
    static SCOPE: RefCell<ScopeState> = RefCell::new(ScopeState::default());
}

pub fn priority() -> i32 {
    SCOPE.with(|s| s.borrow().priority)
}

pub fn provenance() -> Option<String> {
    SCOPE.with(|s| s.borrow().provenance.clone())
}

pub fn exception_mode() -> ExceptionMode {
    SCOPE.with(|s| s.borrow().exception_mode)
}

/// The machine of the current scope, or `None` if no runtime has installed one on this thread.
pub fn machine() -> Option<Machine> {
    SCOPE.with(|s| s.borrow().machine.clone())
}

pub fn exchange_priority(priority: i32) -> i32 {
    SCOPE.with(|s| std::mem::replace(&mut s.borrow_mut().priority, priority))
}

pub fn exchange_provenance(provenance: Option<String>) -> Option<String> {
    SCOPE.with(|s| std::mem::replace(&mut s.borrow_mut().provenance, provenance))
}

pub fn exchange_exception_mode(mode: ExceptionMode) -> ExceptionMode {
    SCOPE.with(|s| std::mem::replace(&mut s.borrow_mut().exception_mode, mode))
}

pub fn exchange_machine(machine: Option<Machine>) -> Option<Machine> {
    SCOPE.with(|s| std::mem::replace(&mut s.borrow_mut().machine, machine))
}

/// A guard that overrides parts of the current scope until it is dropped.
#[derive(Debug, Default)]
#[must_use = "the scope is restored as soon as the guard is dropped"]
pub struct Scope {
    priority: Option<i32>,
    provenance: Option<Option<String>>,
    exception_mode: Option<ExceptionMode>,
    machine: Option<Option<Machine>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        let old = exchange_priority(priority);
        self.priority.get_or_insert(old);
        self
    }

    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        let old = exchange_provenance(Some(provenance.into()));
        self.provenance.get_or_insert(old);
        self
    }

    pub fn with_exception_mode(mut self, mode: ExceptionMode) -> Self {
        let old = exchange_exception_mode(mode);
        self.exception_mode.get_or_insert(old);
        self
    }

    /// Narrows the machine to its intersection with the current one.
    pub fn with_machine(mut self, machine: &Machine) -> CoreResult<Self> {
        let narrowed = match crate::scope::machine() {
            Some(current) => current.intersect(machine),
            None => machine.clone(),
        };
        if narrowed.is_empty() {
            return Err(CoreError::invalid(format!(
                "empty machine in scope: {machine} does not overlap with the current machine"
            )));
        }
        let old = exchange_machine(Some(narrowed));
        self.machine.get_or_insert(old);
        Ok(self)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(priority) = self.priority.take() {
            exchange_priority(priority);
        }
        if let Some(provenance) = self.provenance.take() {
            exchange_provenance(provenance);
        }
        if let Some(mode) = self.exception_mode.take() {
            exchange_exception_mode(mode);
        }
        if let Some(machine) = self.machine.take() {
            exchange_machine(machine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{ProcessorRange, TaskTarget};

    #[test]
    fn test_scope_restores_values() {
        let before = priority();
        {
            let _scope = Scope::new()
                .with_priority(10)
                .with_provenance("test.rs:1")
                .with_exception_mode(ExceptionMode::Deferred);
            assert_eq!(priority(), 10);
            assert_eq!(provenance().as_deref(), Some("test.rs:1"));
            assert_eq!(exception_mode(), ExceptionMode::Deferred);
            {
                let _inner = Scope::new().with_priority(20);
                assert_eq!(priority(), 20);
            }
            assert_eq!(priority(), 10);
        }
        assert_eq!(priority(), before);
        assert_eq!(provenance(), None);
        assert_eq!(exception_mode(), ExceptionMode::Immediate);
    }

    #[test]
    fn test_scope_restores_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _scope = Scope::new().with_priority(7).with_provenance("panicking");
            panic!("task construction failed");
        });
        assert!(result.is_err());
        assert_eq!(priority(), 0);
        assert_eq!(provenance(), None);
    }

    #[test]
    fn test_machine_scope_intersects() -> CoreResult<()> {
        let root = Machine::new([
            (TaskTarget::Cpu, ProcessorRange::new(0, 4, 4)),
            (TaskTarget::Gpu, ProcessorRange::new(0, 2, 2)),
        ]);
        let old = exchange_machine(Some(root.clone()));
        {
            let _scope = Scope::new().with_machine(&root.only(&[TaskTarget::Cpu]))?;
            assert_eq!(machine().map(|m| m.valid_targets()), Some(vec![TaskTarget::Cpu]));
            let disjoint = Scope::new().with_machine(&root.only(&[TaskTarget::Gpu]));
            assert!(matches!(disjoint, Err(CoreError::InvalidArgument(_))));
            assert_eq!(machine().map(|m| m.valid_targets()), Some(vec![TaskTarget::Cpu]));
        }
        assert_eq!(machine(), Some(root));
        exchange_machine(old);
        Ok(())
    }
}
