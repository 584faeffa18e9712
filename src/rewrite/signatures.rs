//! Callsite signature tokens for inserted probe calls.
//!
//! Every probe call the rewriter inserts needs a standalone signature token
//! valid in the module being rewritten. The probes come in four shapes (zero
//! to three `int32` arguments, all returning void with the stdcall unmanaged
//! convention), so each module needs exactly four tokens, obtained from the
//! host's metadata emitter on first use and memoized per module.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    rewrite::{ModuleId, ProfilingHost},
    Result, Token,
};

/// Signature element types, per ECMA-335 §II.23.1.16.
///
/// Only the subset the probe signatures use; the profiler encodes nothing
/// else.
#[allow(non_snake_case, dead_code)]
pub mod ELEMENT_TYPE {
    /// Marks the end of a list in signatures
    pub const END: u8 = 0x00;
    /// Void type (no return value)
    pub const VOID: u8 = 0x01;
    /// Signed 32-bit integer
    pub const I4: u8 = 0x08;
    /// Unsigned 32-bit integer
    pub const U4: u8 = 0x09;
    /// Native integer type (System.IntPtr)
    pub const I: u8 = 0x18;
}

/// Unmanaged stdcall calling convention byte of a standalone signature,
/// per ECMA-335 §II.23.2.3.
pub const CALLCONV_STDCALL: u8 = 0x02;

/// Number of distinct probe arities, and thus tokens per module.
pub const PROBE_ARITIES: usize = 4;

/// Builds the callsite signature blob for a probe taking `arity` `int32`
/// arguments and returning void.
#[must_use]
pub fn callsite_blob(arity: usize) -> Vec<u8> {
    debug_assert!(arity < PROBE_ARITIES);
    let mut blob = Vec::with_capacity(3 + arity);
    blob.push(CALLCONV_STDCALL);
    #[allow(clippy::cast_possible_truncation)]
    blob.push(arity as u8);
    blob.push(ELEMENT_TYPE::VOID);
    for _ in 0..arity {
        blob.push(ELEMENT_TYPE::I4);
    }
    blob
}

/// The four signature tokens of one module, indexed by probe arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureTokens {
    by_arity: [Token; PROBE_ARITIES],
}

impl SignatureTokens {
    /// Token for a probe taking `arity` arguments.
    #[must_use]
    pub fn for_arity(&self, arity: usize) -> Token {
        self.by_arity[arity]
    }

    /// Raw token values in arity order, for handing across the FFI boundary.
    #[must_use]
    pub fn raw(&self) -> [u32; PROBE_ARITIES] {
        self.by_arity.map(|t| t.value())
    }
}

/// Per-module memoized signature-token table.
#[derive(Debug, Default)]
pub struct SignatureCache {
    modules: DashMap<ModuleId, Arc<SignatureTokens>>,
}

impl SignatureCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The signature tokens of `module`, emitting them through `host` on
    /// first use.
    ///
    /// # Errors
    /// Propagates host failures; nothing is cached for the module in that
    /// case, so a later call retries.
    pub fn tokens_for(
        &self,
        host: &dyn ProfilingHost,
        module: ModuleId,
    ) -> Result<Arc<SignatureTokens>> {
        if let Some(tokens) = self.modules.get(&module) {
            return Ok(Arc::clone(&tokens));
        }
        let mut by_arity = [Token(0); PROBE_ARITIES];
        for (arity, slot) in by_arity.iter_mut().enumerate() {
            *slot = host.signature_token(module, &callsite_blob(arity))?;
        }
        let tokens = Arc::new(SignatureTokens { by_arity });
        self.modules.insert(module, Arc::clone(&tokens));
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::{FunctionInfo, ModuleInfo};
    use crate::runtime::ThreadId;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHost {
        emitted: AtomicU32,
    }

    impl ProfilingHost for CountingHost {
        fn function_info(&self, _function: usize) -> Result<FunctionInfo> {
            unreachable!()
        }
        fn module_info(&self, _module: ModuleId) -> Result<ModuleInfo> {
            unreachable!()
        }
        fn signature_token(&self, _module: ModuleId, blob: &[u8]) -> Result<Token> {
            let n = self.emitted.fetch_add(1, Ordering::SeqCst);
            // shape check: stdcall, argc, void return, i4 args
            assert_eq!(blob[0], CALLCONV_STDCALL);
            assert_eq!(blob[1] as usize, blob.len() - 3);
            assert_eq!(blob[2], ELEMENT_TYPE::VOID);
            assert!(blob[3..].iter().all(|b| *b == ELEMENT_TYPE::I4));
            Ok(Token(0x1100_0001 + n))
        }
        fn request_rejit(&self, _targets: &[(ModuleId, Token)]) -> Result<()> {
            unreachable!()
        }
        fn current_thread(&self) -> ThreadId {
            0
        }
    }

    #[test]
    fn blob_shapes() {
        assert_eq!(callsite_blob(0), vec![CALLCONV_STDCALL, 0, ELEMENT_TYPE::VOID]);
        assert_eq!(
            callsite_blob(2),
            vec![
                CALLCONV_STDCALL,
                2,
                ELEMENT_TYPE::VOID,
                ELEMENT_TYPE::I4,
                ELEMENT_TYPE::I4
            ]
        );
    }

    #[test]
    fn cache_memoizes_per_module() {
        let host = CountingHost {
            emitted: AtomicU32::new(0),
        };
        let cache = SignatureCache::new();
        let first = cache.tokens_for(&host, 1).unwrap();
        let again = cache.tokens_for(&host, 1).unwrap();
        assert_eq!(first.raw(), again.raw());
        assert_eq!(host.emitted.load(Ordering::SeqCst), PROBE_ARITIES as u32);

        cache.tokens_for(&host, 2).unwrap();
        assert_eq!(host.emitted.load(Ordering::SeqCst), 2 * PROBE_ARITIES as u32);
    }

    #[test]
    fn tokens_are_indexed_by_arity() {
        let host = CountingHost {
            emitted: AtomicU32::new(0),
        };
        let cache = SignatureCache::new();
        let tokens = cache.tokens_for(&host, 7).unwrap();
        for arity in 0..PROBE_ARITIES {
            assert_eq!(tokens.for_arity(arity).value(), 0x1100_0001 + arity as u32);
        }
    }
}
