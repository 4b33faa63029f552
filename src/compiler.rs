use std::{fmt, sync::Arc};

use crate::{
    cache::FvmCodeId,
    types::{FvmReturnCode, FvmRevision},
    vm::FvmExecSite,
};

type FvmRoutineFn = dyn Fn(&mut FvmExecSite<'_>) -> FvmReturnCode + Send + Sync;

/// Directly callable form of a program. Cheap to clone; a routine obtained
/// from the cache stays valid across engine resets.
#[derive(Clone)]
pub struct FvmRoutine(Arc<FvmRoutineFn>);

impl FvmRoutine {
    pub fn new(f: impl Fn(&mut FvmExecSite<'_>) -> FvmReturnCode + Send + Sync + 'static) -> Self {
        FvmRoutine(Arc::new(f))
    }

    pub fn invoke(&self, site: &mut FvmExecSite<'_>) -> FvmReturnCode {
        (self.0)(site)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FvmRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FvmRoutine({:p})", Arc::as_ptr(&self.0))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FvmCompileRequest<'a> {
    pub code: &'a [u8],
    pub revision: FvmRevision,
    pub is_static: bool,
    pub code_id: &'a FvmCodeId,
}

/// Backend turning bytecode into routines.
pub trait FvmCompiler: Send + Sync {
    /// `None` means the program could not be compiled.
    fn compile(&self, request: &FvmCompileRequest<'_>) -> Option<FvmRoutine>;
    /// Bytes of generated code currently held by the backend.
    fn code_memory_size(&self) -> u64 {
        0
    }
    /// Drops all generated code and starts over. Never runs concurrently
    /// with `compile`.
    fn reset(&self) {}
}
