//! Capability extensions.
//!
//! An extension attaches additional methods to existing unit types without touching their
//! definitions. Methods are registered as values of some method type `M` for a concrete unit
//! type `U`, under an extension name; they are only visible through the registry while that
//! extension is active. Callers probe for capabilities with [`Registry::get`] or
//! [`Registry::supports`] rather than assuming them.
//!
//! There is no process-wide registry. A `Registry` is an ordinary value, owned by whoever drives
//! the computation (for example a [`ParallelFlow`](crate::parallel::ParallelFlow)) and passed
//! explicitly to every capability probe.

use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::ExtensionError;
use crate::unit::Unit;

/// Methods contributed by one extension, keyed by unit type and method type.
#[derive(Clone, Default)]
struct Extension {
    methods: HashMap<(TypeId, TypeId), Arc<dyn Any + Send + Sync>>,
}

/// A set of named extensions, and which of them are active.
#[derive(Clone, Default)]
pub struct Registry {
    extensions: BTreeMap<String, Extension>,
    active: BTreeSet<String>,
}

impl Registry {

    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `methods` to the unit type `U` under `extension`, creating the extension if needed.
    ///
    /// Newly created extensions are inactive.
    pub fn register<U: Unit, M: Any + Send + Sync>(&mut self, extension: &str, methods: M) -> Result<(), ExtensionError> {
        let key = (TypeId::of::<U>(), TypeId::of::<M>());
        let entry = self.extensions.entry(extension.to_owned()).or_default();
        if entry.methods.contains_key(&key) {
            return Err(ExtensionError::Duplicate {
                extension: extension.to_owned(),
                unit: type_name::<U>().to_owned(),
            });
        }
        entry.methods.insert(key, Arc::new(methods));
        Ok(())
    }

    /// Attaches `methods` to `U` under `extension`, overwriting any attached before.
    pub(crate) fn replace<U: Unit, M: Any + Send + Sync>(&mut self, extension: &str, methods: M) {
        let key = (TypeId::of::<U>(), TypeId::of::<M>());
        self.extensions.entry(extension.to_owned()).or_default().methods.insert(key, Arc::new(methods));
    }

    /// Activates `extension`, creating it empty if it is unknown.
    pub(crate) fn enable(&mut self, extension: &str) {
        self.extensions.entry(extension.to_owned()).or_default();
        self.active.insert(extension.to_owned());
    }

    /// Activates an extension. Activating an active extension does nothing.
    pub fn activate(&mut self, extension: &str) -> Result<(), ExtensionError> {
        if !self.extensions.contains_key(extension) {
            return Err(ExtensionError::Unknown(extension.to_owned()));
        }
        self.active.insert(extension.to_owned());
        Ok(())
    }

    /// Activates several extensions, or none of them if any is unknown.
    pub fn activate_all<'a, I: IntoIterator<Item = &'a str>>(&mut self, extensions: I) -> Result<(), ExtensionError> {
        let extensions = extensions.into_iter().collect::<Vec<_>>();
        if let Some(unknown) = extensions.iter().find(|name| !self.extensions.contains_key(**name)) {
            return Err(ExtensionError::Unknown((*unknown).to_owned()));
        }
        self.active.extend(extensions.into_iter().map(str::to_owned));
        Ok(())
    }

    /// Deactivates an active extension.
    pub fn deactivate(&mut self, extension: &str) -> Result<(), ExtensionError> {
        if !self.extensions.contains_key(extension) {
            return Err(ExtensionError::Unknown(extension.to_owned()));
        }
        if !self.active.remove(extension) {
            return Err(ExtensionError::NotActive(extension.to_owned()));
        }
        Ok(())
    }

    /// Deactivates several extensions, or none of them if any is not active.
    pub fn deactivate_all<'a, I: IntoIterator<Item = &'a str>>(&mut self, extensions: I) -> Result<(), ExtensionError> {
        let extensions = extensions.into_iter().collect::<Vec<_>>();
        for name in extensions.iter() {
            if !self.extensions.contains_key(*name) {
                return Err(ExtensionError::Unknown((*name).to_owned()));
            }
            if !self.active.contains(*name) {
                return Err(ExtensionError::NotActive((*name).to_owned()));
            }
        }
        for name in extensions {
            self.active.remove(name);
        }
        Ok(())
    }

    /// Runs `logic` with `extensions` additionally active, restoring the previous active set after.
    pub fn with_active<'a, I, T, F>(&mut self, extensions: I, logic: F) -> Result<T, ExtensionError>
    where
        I: IntoIterator<Item = &'a str>,
        F: FnOnce(&Registry) -> T,
    {
        let previous = self.active.clone();
        self.activate_all(extensions)?;
        let result = logic(self);
        self.active = previous;
        Ok(result)
    }

    /// True if `extension` is active.
    pub fn is_active(&self, extension: &str) -> bool {
        self.active.contains(extension)
    }

    /// Names of active extensions, in name order.
    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    /// Names of registered extensions, in name order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.keys().map(String::as_str)
    }

    /// Methods of type `M` for the concrete type of `unit`, from the active extensions.
    ///
    /// Should several active extensions provide them, the one with the least name is used, so the
    /// result does not depend on the order in which extensions were activated.
    pub fn get<M: Any + Send + Sync>(&self, unit: &dyn Unit) -> Option<&M> {
        self.active
            .iter()
            .find_map(|name| self.get_from::<M>(name, unit))
    }

    /// Methods of type `M` for the concrete type of `unit`, from one named active extension.
    pub fn get_from<M: Any + Send + Sync>(&self, extension: &str, unit: &dyn Unit) -> Option<&M> {
        if !self.is_active(extension) {
            return None;
        }
        let key = (Any::type_id(unit.as_any()), TypeId::of::<M>());
        self.extensions
            .get(extension)?
            .methods
            .get(&key)?
            .downcast_ref::<M>()
    }

    /// True if methods of type `M` are currently available for `unit`.
    pub fn supports<M: Any + Send + Sync>(&self, unit: &dyn Unit) -> bool {
        self.get::<M>(unit).is_some()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {

    use crate::error::ExtensionError;
    use crate::unit::{Node, Unit};
    use crate::units::{Centering, QuadraticExpansion};
    use super::Registry;

    #[derive(Debug, PartialEq)]
    struct Describe(&'static str);

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register::<Node<Centering>, _>("loud", Describe("CENTERING")).unwrap();
        registry.register::<Node<Centering>, _>("quiet", Describe("centering")).unwrap();
        registry.register::<Node<QuadraticExpansion>, _>("quiet", Describe("quadratic")).unwrap();
        registry
    }

    #[test]
    fn inactive_methods_are_hidden() {
        let mut registry = registry();
        let unit: Box<dyn Unit> = Box::new(Node::new(Centering::new()));
        assert!(!registry.supports::<Describe>(&*unit));

        registry.activate("quiet").unwrap();
        assert_eq!(registry.get::<Describe>(&*unit), Some(&Describe("centering")));

        registry.deactivate("quiet").unwrap();
        assert_eq!(registry.get::<Describe>(&*unit), None);
    }

    #[test]
    fn activation_misuse() {
        let mut registry = registry();
        assert_eq!(registry.activate("missing"), Err(ExtensionError::Unknown("missing".to_owned())));
        assert_eq!(registry.deactivate("quiet"), Err(ExtensionError::NotActive("quiet".to_owned())));
        registry.activate("quiet").unwrap();
        registry.activate("quiet").unwrap();
        assert_eq!(registry.active().collect::<Vec<_>>(), vec!["quiet"]);
        assert!(registry.activate_all(vec!["loud", "missing"]).is_err());
        assert!(!registry.is_active("loud"));
        assert!(registry.deactivate_all(vec!["quiet", "loud"]).is_err());
        assert!(registry.is_active("quiet"));
    }

    #[test]
    fn duplicate_registration() {
        let mut registry = registry();
        let again = registry.register::<Node<Centering>, _>("quiet", Describe("again"));
        assert!(matches!(again, Err(ExtensionError::Duplicate { .. })));
    }

    #[test]
    fn activation_order_irrelevant() {
        let unit = Node::new(Centering::new());

        let mut first = registry();
        first.activate("loud").unwrap();
        first.activate("quiet").unwrap();

        let mut second = registry();
        second.activate("quiet").unwrap();
        second.activate("loud").unwrap();

        assert_eq!(first.get::<Describe>(&unit), second.get::<Describe>(&unit));
        assert_eq!(first.get_from::<Describe>("quiet", &unit), Some(&Describe("centering")));
    }

    #[test]
    fn scoped_activation() {
        let mut registry = registry();
        let unit = Node::new(QuadraticExpansion);
        let seen = registry.with_active(vec!["quiet"], |registry| registry.supports::<Describe>(&unit)).unwrap();
        assert!(seen);
        assert!(!registry.is_active("quiet"));
    }
}
