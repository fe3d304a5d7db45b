//! Internal functions the x86 front end can emit calls to.

use arancini_ir::{FunctionType, InternalFunction, InternalFunctionProvider, ValueType};

/// Provider for the host helpers x86 lifting needs: interrupt and syscall
/// entry, the poison marker for un-liftable side effects, and halt.
#[derive(Debug, Default)]
pub struct X86InternalFunctions;

impl InternalFunctionProvider for X86InternalFunctions {
    fn create(&self, name: &str) -> Option<InternalFunction> {
        match name {
            "handle_int" => Some(InternalFunction::new(
                "handle_int",
                FunctionType::new(ValueType::void(), vec![ValueType::u32()]),
            )),
            "handle_syscall" => Some(InternalFunction::new(
                "handle_syscall",
                FunctionType::new(ValueType::void(), vec![]),
            )),
            // Takes any value; the argument only identifies the poisoned
            // operation.
            "handle_poison" => Some(InternalFunction::new(
                "handle_poison",
                FunctionType::new(ValueType::void(), vec![ValueType::void()]),
            )),
            "hlt" => Some(InternalFunction::new(
                "hlt",
                FunctionType::new(ValueType::void(), vec![]),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arancini_ir::InternalFunctionRegistry;

    #[test]
    fn known_helpers_resolve() {
        let registry = InternalFunctionRegistry::new(X86InternalFunctions);

        for name in ["handle_int", "handle_syscall", "handle_poison", "hlt"] {
            let f = registry.resolve(name).unwrap();
            assert_eq!(f.name(), name);
            assert!(f.ty().ret().is_void());
        }

        assert!(registry.resolve("handle_nothing").is_err());
    }
}
