use std::collections::HashMap;

use crate::error::{ManagerError, Result};
use crate::observer::Observer;

/// Observers keyed by their unique name.
#[derive(Debug, Default)]
pub struct ObserverRegistry {
    observers: HashMap<String, Observer>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, observer: Observer) -> Result<()> {
        if self.observers.contains_key(observer.name()) {
            return Err(ManagerError::NameConflict {
                name: observer.name().to_string(),
            });
        }
        self.observers.insert(observer.name().to_string(), observer);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.observers.contains_key(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Observer> {
        self.observers
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownObserver {
                name: name.to_string(),
            })
    }

    pub fn remove(&mut self, name: &str) -> Result<Observer> {
        self.observers
            .remove(name)
            .ok_or_else(|| ManagerError::UnknownObserver {
                name: name.to_string(),
            })
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.observers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
