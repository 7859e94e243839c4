// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! A tiered WebAssembly runtime.
//!
//! The engine turns a binary module into running native behavior in
//! stages: a decoder/validator produces a typed, checked module; a
//! predecoded fixed-width IR (PIR) feeds a stack-semantics interpreter; a
//! register IR (RIR) built by eliminating the operand stack feeds the
//! default interpreter tier; and hot functions are compiled to ARM64 or
//! x86_64 machine code with guard-page-backed memory safety.
//!
//! The embedding surface is small:
//!
//! ```no_run
//! use lamina::{Imports, Instance, Module, Options, Value};
//!
//! let bytes = std::fs::read("module.wasm").unwrap();
//! let module = Module::decode(&bytes).unwrap();
//! let mut instance =
//!     Instance::instantiate(&module, Imports::new(), Options::default()).unwrap();
//! let mut results = Vec::new();
//! instance
//!     .invoke("fib", &[Value::I32(35)], &mut results)
//!     .unwrap();
//! ```

pub mod decode;
mod interp;
mod jit;
mod pir;
mod rir;
mod runtime;
pub mod types;
pub mod validate;

use std::sync::Arc;

use thiserror::Error;

use types::ModuleInner;

pub use decode::{DecodeError, ImportRecord};
pub use jit::TierConfig;
pub use runtime::{
    Capabilities, Extern, HostContext, HostFunc, Imports, Instance, LinearMemoryView, LinkError,
    MAX_CALL_DEPTH, OPERAND_STACK_SLOTS, Options, Trap, TrapKind, Value,
};
pub use validate::ValidateError;

/// Errors from [`Module::decode`]: the decode layer or the validation
/// layer, both reported before any runtime state exists.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Validate(#[from] ValidateError),
}

/// A decoded, validated module: immutable, and shareable across instances.
#[derive(Clone, Debug)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    /// Decodes and validates a binary module.
    pub fn decode(bytes: &[u8]) -> Result<Module, ModuleError> {
        let mut inner = decode::decode_module(bytes)?;
        inner.canonicalize_types();
        validate::validate_module(&inner)?;
        Ok(Module {
            inner: Arc::new(inner),
        })
    }

    /// The number of functions in the module's index space.
    pub fn function_count(&self) -> usize {
        self.inner.functions.len()
    }

    /// The names of the module's exports.
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.inner.exports.iter().map(|export| &*export.field)
    }

    pub(crate) fn inner(&self) -> &Arc<ModuleInner> {
        &self.inner
    }
}

/// Describes a binary module's imports without instantiating it. The input
/// is fully decoded but not validated.
pub fn inspect_imports(bytes: &[u8]) -> Result<Vec<ImportRecord>, DecodeError> {
    decode::decode_imports_only(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // (module (func (export "answer") (result i32) i32.const 42))
    const ANSWER: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f, // type: [] -> [i32]
        0x03, 0x02, 0x01, 0x00, // function
        0x07, 0x0a, 0x01, 0x06, b'a', b'n', b's', b'w', b'e', b'r', 0x00, 0x00, // export
        0x0a, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2a, 0x0b, // code: i32.const 42
    ];

    #[test]
    fn decode_and_invoke_end_to_end() {
        let module = Module::decode(ANSWER).unwrap();
        assert_eq!(module.function_count(), 1);
        assert_eq!(module.export_names().collect::<Vec<_>>(), vec!["answer"]);

        let mut instance =
            Instance::instantiate(&module, Imports::new(), Options::default()).unwrap();
        let mut results = Vec::new();
        instance.invoke("answer", &[], &mut results).unwrap();
        assert_eq!(results, vec![Value::I32(42)]);
    }

    #[test]
    fn invoking_a_missing_export_is_an_error() {
        let module = Module::decode(ANSWER).unwrap();
        let mut instance =
            Instance::instantiate(&module, Imports::new(), Options::default()).unwrap();
        let mut results = Vec::new();
        assert!(instance.invoke("nope", &[], &mut results).is_err());
    }

    #[test]
    fn inspect_imports_reports_kinds() {
        // (module (import "env" "f" (func (param i32))))
        let bytes = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
            0x01, 0x05, 0x01, 0x60, 0x01, 0x7f, 0x00, // type: [i32] -> []
            0x02, 0x09, 0x01, 0x03, b'e', b'n', b'v', 0x01, b'f', 0x00, 0x00,
        ];
        let imports = inspect_imports(&bytes).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].module, "env");
        assert_eq!(imports[0].name, "f");
        assert_eq!(imports[0].kind, types::ExternKind::Function);
        let signature = imports[0].signature.as_ref().unwrap();
        assert_eq!(signature.params, vec![types::ValType::I32]);
    }
}
