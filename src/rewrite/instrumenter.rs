//! The per-method instrumentation gate.
//!
//! The host reports every function it is about to JIT-compile; this module
//! decides whether the method gets instrumented, interns its identity, makes
//! sure the module's callsite signature tokens exist, and dispatches the
//! actual bytecode rewrite to the external [`Rewriter`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use dashmap::DashMap;

use crate::{
    config::ProfilerConfig,
    coverage::MethodTable,
    rewrite::{
        FunctionId, ModuleId, ProfilingHost, RewriteRequest, Rewriter, SignatureCache,
    },
    runtime::ProbeTable,
    Error, Result, Token,
};

/// Outcome of instrumenting one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instrumented {
    /// Id the method was interned under
    pub method_id: u32,
    /// Whether the method is the configured entry method
    pub is_main: bool,
}

/// Orchestrates method rewriting across JIT events.
pub struct Instrumenter {
    host: Arc<dyn ProfilingHost>,
    rewriter: RwLock<Option<Arc<dyn Rewriter>>>,
    probes: ProbeTable,
    signatures: SignatureCache,
    instrumented: DashMap<(u32, u64), ()>,
    skipped: DashMap<(usize, u32), ()>,
    main_reached: AtomicBool,
}

impl Instrumenter {
    /// Creates the gate around a host connection and the process probe table.
    #[must_use]
    pub fn new(host: Arc<dyn ProfilingHost>, probes: ProbeTable) -> Self {
        Self {
            host,
            rewriter: RwLock::new(None),
            probes,
            signatures: SignatureCache::new(),
            instrumented: DashMap::new(),
            skipped: DashMap::new(),
            main_reached: AtomicBool::new(false),
        }
    }

    /// Injects the external IL-rewriter callback. Until this happens every
    /// instrumentation attempt fails with [`Error::RewriterUnavailable`].
    pub fn set_rewriter(&self, rewriter: Arc<dyn Rewriter>) {
        *write_lock!(self.rewriter) = Some(rewriter);
    }

    /// True once a rewriter has been injected.
    #[must_use]
    pub fn rewriter_available(&self) -> bool {
        read_lock!(self.rewriter).is_some()
    }

    /// The probe address table handed to every rewrite.
    #[must_use]
    pub fn probes(&self) -> &ProbeTable {
        &self.probes
    }

    /// True once the configured entry method has been JIT-compiled.
    #[must_use]
    pub fn main_reached(&self) -> bool {
        self.main_reached.load(Ordering::SeqCst)
    }

    /// Handles one JIT-compilation event.
    ///
    /// Returns `Ok(None)` when the method was skipped (already instrumented,
    /// or deferred by the main-only policy) and the interned identity
    /// otherwise.
    ///
    /// # Errors
    /// Host introspection failures, signature emission failures and rewriter
    /// errors propagate; the caller decides whether they are fatal.
    pub fn instrument(
        &self,
        function: FunctionId,
        methods: &MethodTable,
        config: &ProfilerConfig,
    ) -> Result<Option<Instrumented>> {
        let info = self.host.function_info(function)?;
        if !info.token.is_method_def() {
            return Err(malformed_error!(
                "JIT reported a non-MethodDef token {}",
                info.token
            ));
        }

        if self
            .instrumented
            .contains_key(&(info.token.value(), info.module as u64))
        {
            log::warn!("repeated JIT of {} in module {}; skipped", info.token, info.module);
            return Ok(None);
        }

        let module = self.host.module_info(info.module)?;
        let is_main = config
            .entry_main
            .as_ref()
            .is_some_and(|main| main.matches(&module.module_name, info.token));

        if config.main_only && !is_main && !self.main_reached() {
            self.skipped.insert((info.module, info.token.value()), ());
            log::debug!("deferring {} until the entry method is compiled", info.token);
            return Ok(None);
        }
        if is_main && !self.main_reached.swap(true, Ordering::SeqCst) && config.main_only {
            self.rejit_skipped()?;
        }

        let (method_id, first_time) =
            methods.intern(info.token, info.module, &module.module_name, &module.assembly_name);
        if first_time {
            log::debug!(
                "interned {} of {} as method {method_id}",
                info.token,
                module.module_name.to_string_lossy()
            );
        }

        let signatures = self.signatures.tokens_for(self.host.as_ref(), info.module)?;
        let rewriter = read_lock!(self.rewriter)
            .as_ref()
            .cloned()
            .ok_or(Error::RewriterUnavailable)?;
        rewriter.rewrite(&RewriteRequest {
            module: info.module,
            method: info.token,
            method_id,
            is_main,
            probes: &self.probes,
            signatures: &*signatures,
        })?;

        self.instrumented
            .insert((info.token.value(), info.module as u64), ());
        Ok(Some(Instrumented { method_id, is_main }))
    }

    /// Requests recompilation of every method deferred before the entry
    /// method was reached.
    fn rejit_skipped(&self) -> Result<()> {
        let targets: Vec<(ModuleId, Token)> = self
            .skipped
            .iter()
            .map(|entry| (entry.key().0, Token(entry.key().1)))
            .collect();
        self.skipped.clear();
        if targets.is_empty() {
            return Ok(());
        }
        log::debug!("requesting ReJIT of {} deferred methods", targets.len());
        self.host.request_rejit(&targets)
    }
}

impl std::fmt::Debug for Instrumenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumenter")
            .field("instrumented", &self.instrumented.len())
            .field("skipped", &self.skipped.len())
            .field("main_reached", &self.main_reached())
            .finish_non_exhaustive()
    }
}
