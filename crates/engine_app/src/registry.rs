//! System registry: the engine's systems, in registration order.
//!
//! [`SystemRegistry::start_order`] puts every system after the systems it
//! depends on, otherwise keeping registration order. Systems are stopped in
//! the reverse of that order. Names are unique; a second system with the same
//! name is rejected.

use std::collections::HashMap;

use engine_system::{ManagedSystem, SystemState};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Ordered, name-indexed collection of type-erased systems.
#[derive(Default)]
pub struct SystemRegistry {
    /// Systems in registration order.
    systems: Vec<Box<dyn ManagedSystem>>,
    /// Name -> index into `systems`.
    by_name: HashMap<String, usize>,
}

impl SystemRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a system.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateSystem`] if the name is taken.
    pub fn insert(&mut self, system: Box<dyn ManagedSystem>) -> Result<(), EngineError> {
        let name = system.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(EngineError::DuplicateSystem { name });
        }
        self.by_name.insert(name, self.systems.len());
        self.systems.push(system);
        Ok(())
    }

    /// Whether a system called `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Returns a system by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn ManagedSystem> {
        let index = *self.by_name.get(name)?;
        self.systems.get(index).map(|system| &**system)
    }

    /// Returns a system by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn ManagedSystem + 'static)> {
        let index = *self.by_name.get(name)?;
        self.systems.get_mut(index).map(|system| &mut **system)
    }

    /// Returns the system at `index` in registration order, mutably.
    pub fn get_index_mut(&mut self, index: usize) -> Option<&mut (dyn ManagedSystem + 'static)> {
        self.systems.get_mut(index).map(|system| &mut **system)
    }

    /// Indices of all systems such that each comes after its dependencies.
    /// Ties keep registration order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingDependency`] for a dependency on an
    /// unregistered name, or [`EngineError::DependencyCycle`].
    pub fn start_order(&self) -> Result<Vec<usize>, EngineError> {
        let mut marks = vec![Mark::Unvisited; self.systems.len()];
        let mut order = Vec::with_capacity(self.systems.len());
        let mut path = Vec::new();
        for index in 0..self.systems.len() {
            self.visit(index, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        index: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), EngineError> {
        match marks[index] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = path.iter().position(|&i| i == index).unwrap_or_default();
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| self.systems[i].name().to_string())
                    .collect();
                cycle.push(self.systems[index].name().to_string());
                return Err(EngineError::DependencyCycle { cycle });
            }
            Mark::Unvisited => {}
        }

        marks[index] = Mark::Visiting;
        path.push(index);
        let system = &self.systems[index];
        for dependency in system.dependencies() {
            let Some(&target) = self.by_name.get(dependency) else {
                return Err(EngineError::MissingDependency {
                    system: system.name().to_string(),
                    dependency: dependency.clone(),
                });
            };
            self.visit(target, marks, path, order)?;
        }
        path.pop();
        marks[index] = Mark::Done;
        order.push(index);
        Ok(())
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &dyn ManagedSystem> {
        self.systems.iter().map(|system| &**system)
    }

    /// Iterate mutably in registration order. Reverse it for shutdown order.
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut (dyn ManagedSystem + 'static)> {
        self.systems.iter_mut().map(|system| &mut **system)
    }

    /// Returns the number of registered systems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.systems.len()
    }

    /// Whether no systems are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Returns the number of systems in `state`.
    #[must_use]
    pub fn count_in(&self, state: SystemState) -> usize {
        self.systems.iter().filter(|system| system.state() == state).count()
    }
}

impl std::fmt::Debug for SystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.systems.iter().map(|system| (system.name(), system.state())))
            .finish()
    }
}
