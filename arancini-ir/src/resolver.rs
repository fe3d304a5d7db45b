//! Named host-callable helper functions, typed by signature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::IrError;
use crate::value_type::ValueType;

/// Signature of an internal function: return type plus argument types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    ret: ValueType,
    args: Vec<ValueType>,
}

impl FunctionType {
    /// Construct a signature.
    pub fn new(ret: ValueType, args: Vec<ValueType>) -> Self {
        Self { ret, args }
    }

    /// Return type.
    pub const fn ret(&self) -> ValueType {
        self.ret
    }

    /// Argument types in order.
    pub fn args(&self) -> &[ValueType] {
        &self.args
    }
}

/// A named host helper callable from emitted code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalFunction {
    name: String,
    ty: FunctionType,
}

impl InternalFunction {
    /// Construct a helper description.
    pub fn new(name: impl Into<String>, ty: FunctionType) -> Self {
        Self { name: name.into(), ty }
    }

    /// Helper name; also the key under which it resolves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signature.
    pub const fn ty(&self) -> &FunctionType {
        &self.ty
    }
}

/// Provider consulted the first time a name is resolved.
pub trait InternalFunctionProvider {
    /// Materialize the signature for `name`, or `None` if unknown.
    fn create(&self, name: &str) -> Option<InternalFunction>;
}

/// Memoizing name → function table.
///
/// The first `resolve` of a name consults the provider and caches the
/// outcome; later resolutions return the same `Arc`. An unknown name is a
/// sticky failure: the miss is cached and every later resolution of that
/// name fails without consulting the provider again.
#[derive(Debug)]
pub struct InternalFunctionRegistry<P> {
    provider: P,
    cache: Mutex<HashMap<String, Option<Arc<InternalFunction>>>>,
}

impl<P> InternalFunctionRegistry<P>
where
    P: InternalFunctionProvider,
{
    /// Construct a registry over a provider.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `name` to its signature.
    pub fn resolve(&self, name: &str) -> Result<Arc<InternalFunction>, IrError> {
        let mut cache = self.cache.lock().expect("internal function cache poisoned");

        let entry = cache
            .entry(name.to_owned())
            .or_insert_with(|| self.provider.create(name).map(Arc::new));

        entry
            .clone()
            .ok_or_else(|| IrError::UnresolvedFunction(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneFunction;

    impl InternalFunctionProvider for OneFunction {
        fn create(&self, name: &str) -> Option<InternalFunction> {
            (name == "known").then(|| {
                InternalFunction::new("known", FunctionType::new(ValueType::void(), vec![ValueType::u32()]))
            })
        }
    }

    #[test]
    fn resolution_is_idempotent() {
        let registry = InternalFunctionRegistry::new(OneFunction);

        let a = registry.resolve("known").unwrap();
        let b = registry.resolve("known").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ty().args(), &[ValueType::u32()]);
    }

    #[test]
    fn unknown_name_fails_sticky() {
        let registry = InternalFunctionRegistry::new(OneFunction);

        let first = registry.resolve("missing").unwrap_err();
        let second = registry.resolve("missing").unwrap_err();

        assert_eq!(first, IrError::UnresolvedFunction("missing".into()));
        assert_eq!(first, second);
    }
}
