//! Seams to the profiling host and the external IL rewriter.
//!
//! The managed runtime's profiling API and the component that physically
//! emits modified bytecode are external collaborators. This module names the
//! capabilities the profiler needs from them; the export layer provides the
//! FFI-backed implementations, tests provide mocks.

use widestring::U16String;

use crate::{
    rewrite::SignatureTokens,
    runtime::{ProbeTable, ThreadId},
    Result, Token,
};

/// Opaque function identifier assigned by the profiling host.
pub type FunctionId = usize;

/// Opaque module identifier assigned by the profiling host.
pub type ModuleId = usize;

/// What the host knows about a function picked up for JIT compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Module the function is defined in
    pub module: ModuleId,
    /// `MethodDef` token of the function within that module
    pub token: Token,
}

/// Identity of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module name (UTF-16)
    pub module_name: U16String,
    /// Simple name of the owning assembly (UTF-16)
    pub assembly_name: U16String,
}

/// Introspection and control surface of the managed runtime's profiling API.
///
/// Every method maps onto one host call; failing HRESULTs surface as
/// [`Error::Host`](crate::Error::Host) with the operation name preserved.
pub trait ProfilingHost: Send + Sync {
    /// Resolves a JIT-compiled function to its module and metadata token.
    fn function_info(&self, function: FunctionId) -> Result<FunctionInfo>;

    /// Resolves a module to its name and owning assembly name.
    fn module_info(&self, module: ModuleId) -> Result<ModuleInfo>;

    /// Obtains a signature token for `blob` from the module's metadata emitter.
    fn signature_token(&self, module: ModuleId, blob: &[u8]) -> Result<Token>;

    /// Asks the runtime to recompile the given methods so instrumentation can
    /// be applied on the second pass.
    fn request_rejit(&self, targets: &[(ModuleId, Token)]) -> Result<()>;

    /// OS identifier of the thread the call is made on.
    fn current_thread(&self) -> ThreadId;
}

/// Everything the external IL rewriter needs to instrument one method body.
#[derive(Debug)]
pub struct RewriteRequest<'a> {
    /// Module of the method being rewritten
    pub module: ModuleId,
    /// Token of the method being rewritten
    pub method: Token,
    /// Interned id the inserted probes must report
    pub method_id: u32,
    /// Whether this method is the configured entry method and receives the
    /// `EnterMain`/`LeaveMain` pair instead of plain `Enter`/`Leave`
    pub is_main: bool,
    /// Probe entry-point addresses, in the frozen export order
    pub probes: &'a ProbeTable,
    /// Callsite signature tokens for this module, by probe arity
    pub signatures: &'a SignatureTokens,
}

/// The external IL rewriter.
///
/// Given a rewrite request it inserts probe calls at the method prologue,
/// branch targets, call sites and epilogues, then installs the new body with
/// the host. The profiler never sees the bytecode.
pub trait Rewriter: Send + Sync {
    /// Rewrites one method body.
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<()>;
}
