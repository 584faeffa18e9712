//! Method rewriting: the JIT-event gate, the host and rewriter seams, and
//! the callsite signature machinery.

mod host;
mod instrumenter;
mod signatures;

pub use host::{
    FunctionId, FunctionInfo, ModuleId, ModuleInfo, ProfilingHost, RewriteRequest, Rewriter,
};
pub use instrumenter::{Instrumented, Instrumenter};
pub use signatures::{
    callsite_blob, SignatureCache, SignatureTokens, CALLCONV_STDCALL, ELEMENT_TYPE, PROBE_ARITIES,
};
