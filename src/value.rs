use std::any::Any;
use std::sync::RwLock;

use crate::error::ContractError;
use crate::name::ServiceName;

/// A named slot a controller writes into during `start` and clears during
/// `stop`. Undefined (`None`) outside the owner's STARTING/STOPPING window.
///
/// Values are type-erased because a single container hosts services that
/// produce values of unrelated types; callers recover the concrete type via
/// [`ValueCell::get`], which downcasts and reports a [`ContractError`] on
/// mismatch rather than panicking.
pub struct ValueCell {
    name: ServiceName,
    slot: RwLock<Option<Box<dyn Any + Send + Sync>>>,
}

impl ValueCell {
    pub fn new(name: ServiceName) -> Self {
        Self {
            name,
            slot: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    /// Write a value into the cell. Callers are responsible for only calling
    /// this inside the owning controller's start/stop window (§4.4); the
    /// cell itself has no way to check the caller's state.
    pub fn set<V: Any + Send + Sync>(&self, value: V) {
        *self.slot.write().expect("value cell lock poisoned") = Some(Box::new(value));
    }

    /// Clear the cell back to undefined. Called on stop and on any start
    /// failure, before failure fan-out (§4.4).
    pub fn clear(&self) {
        *self.slot.write().expect("value cell lock poisoned") = None;
    }

    pub fn is_defined(&self) -> bool {
        self.slot.read().expect("value cell lock poisoned").is_some()
    }

    /// Read a clone of the held value, downcast to `V`.
    pub fn get<V: Clone + Any + Send + Sync>(&self) -> Result<V, ContractError> {
        let guard = self.slot.read().expect("value cell lock poisoned");
        match guard.as_ref() {
            Some(boxed) => boxed
                .downcast_ref::<V>()
                .cloned()
                .ok_or_else(|| ContractError::ValueTypeMismatch {
                    name: self.name.clone(),
                    expected: std::any::type_name::<V>(),
                }),
            None => Err(ContractError::ValueWrittenOutsideWindow(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_until_set() {
        let cell = ValueCell::new(ServiceName::single("db"));
        assert!(!cell.is_defined());
        cell.set(42i32);
        assert!(cell.is_defined());
        assert_eq!(cell.get::<i32>().unwrap(), 42);
    }

    #[test]
    fn clear_returns_to_undefined() {
        let cell = ValueCell::new(ServiceName::single("db"));
        cell.set("conn".to_string());
        cell.clear();
        assert!(!cell.is_defined());
        assert!(cell.get::<String>().is_err());
    }

    #[test]
    fn type_mismatch_is_reported_not_panicked() {
        let cell = ValueCell::new(ServiceName::single("db"));
        cell.set(42i32);
        match cell.get::<String>() {
            Err(ContractError::ValueTypeMismatch { .. }) => {}
            other => panic!("expected type mismatch, got {other:?}"),
        }
    }
}
