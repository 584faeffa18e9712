//! Host-called C ABI entry points.
//!
//! These are the stable names the managed-side driver resolves from the
//! loaded profiler library: configuration delivery (`SetEntryMain`,
//! `SetExpectedCoverage`, `SyncInfoGettersPointers`) and the drain surface
//! (`GetProbes`, `GetHistory`, `GetThreadMapping`). Buffers handed out by the
//! drain calls transfer ownership to the caller, who returns them through
//! `ReleaseHistory`.
//!
//! Every entry point is a no-op (with a warning) until the profiler has been
//! installed by the library attach path.

// exported names are part of the frozen host contract
#![allow(non_snake_case)]

use std::sync::Arc;

use widestring::U16String;

use crate::{
    config::EntryMain,
    rewrite::{RewriteRequest, Rewriter, PROBE_ARITIES},
    runtime::{profiler, PROBE_COUNT},
    wire, Error, Result, Token,
};

/// Shape of the external IL-rewrite callback injected through
/// [`SyncInfoGettersPointers`].
///
/// The callback receives the identity of the method to rewrite plus the probe
/// address vector and the module's callsite signature tokens, and returns an
/// HRESULT-style status (negative on failure).
pub type InstrumentFn = unsafe extern "system" fn(
    module_id: usize,
    method_token: u32,
    method_id: u32,
    is_main: u8,
    probes: *const u64,
    probe_count: u32,
    signature_tokens: *const u32,
    signature_token_count: u32,
) -> i32;

/// [`Rewriter`] backed by the injected callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackRewriter {
    callback: InstrumentFn,
}

impl CallbackRewriter {
    /// Wraps a callback delivered by the host process.
    #[must_use]
    pub fn new(callback: InstrumentFn) -> Self {
        Self { callback }
    }
}

impl Rewriter for CallbackRewriter {
    fn rewrite(&self, request: &RewriteRequest<'_>) -> Result<()> {
        let probes = request.probes.addresses();
        let signatures = request.signatures.raw();
        #[allow(clippy::cast_possible_truncation)]
        let hr = unsafe {
            (self.callback)(
                request.module,
                request.method.value(),
                request.method_id,
                u8::from(request.is_main),
                probes.as_ptr(),
                PROBE_COUNT as u32,
                signatures.as_ptr(),
                PROBE_ARITIES as u32,
            )
        };
        if hr < 0 {
            return Err(Error::Host {
                context: "external IL rewrite",
                hr,
            });
        }
        Ok(())
    }
}

/// Copies a UTF-16 buffer delivered over the FFI boundary.
unsafe fn utf16_arg(data: *const u16, length: i32) -> Option<U16String> {
    if data.is_null() || length < 0 {
        return None;
    }
    #[allow(clippy::cast_sign_loss)]
    let length = length as usize;
    Some(U16String::from_ptr(data, length))
}

/// Hands `buffer` to the caller through an out-pointer pair. The caller owns
/// the allocation afterwards and must return it via [`ReleaseHistory`].
unsafe fn hand_over(buffer: Vec<u8>, size: *mut u64, bytes: *mut *mut u8) {
    if size.is_null() || bytes.is_null() {
        log::warn!("drain request with null out-pointers");
        return;
    }
    let length = buffer.len() as u64;
    let ptr = Box::into_raw(buffer.into_boxed_slice()).cast::<u8>();
    *size = length;
    *bytes = ptr;
}

/// Configures the entry-method identity. Called exactly once before any JIT
/// event.
///
/// # Safety
/// `assembly_name` and `module_name` must point to valid UTF-16 buffers of at
/// least the given lengths.
#[no_mangle]
pub unsafe extern "system" fn SetEntryMain(
    assembly_name: *const u16,
    assembly_name_length: i32,
    module_name: *const u16,
    module_name_length: i32,
    method_token: i32,
) {
    let Some(profiler) = profiler() else {
        log::warn!("SetEntryMain before install; ignored");
        return;
    };
    let (Some(assembly_name), Some(module_name)) = (
        utf16_arg(assembly_name, assembly_name_length),
        utf16_arg(module_name, module_name_length),
    ) else {
        log::warn!("SetEntryMain with invalid name buffers; ignored");
        return;
    };
    #[allow(clippy::cast_sign_loss)]
    profiler.set_entry_main(EntryMain {
        assembly_name,
        module_name,
        token: Token(method_token as u32),
    });
}

/// Injects the external IL-rewriter callback.
///
/// # Safety
/// `instrument_ptr` must be the address of a function with the
/// [`InstrumentFn`] ABI, or zero.
#[no_mangle]
pub unsafe extern "system" fn SyncInfoGettersPointers(instrument_ptr: usize) {
    let Some(profiler) = profiler() else {
        log::warn!("SyncInfoGettersPointers before install; ignored");
        return;
    };
    if instrument_ptr == 0 {
        log::warn!("null instrument callback; ignored");
        return;
    }
    let callback: InstrumentFn = std::mem::transmute(instrument_ptr);
    profiler
        .instrumenter()
        .set_rewriter(Arc::new(CallbackRewriter::new(callback)));
    log::debug!("instrument callback injected");
}

/// Returns the probe address vector.
///
/// The returned pointer refers to storage owned by the profiler and stays
/// valid for the process lifetime; repeated calls return identical bytes.
///
/// # Safety
/// `bytes_count` must be a valid out-pointer.
#[no_mangle]
pub unsafe extern "system" fn GetProbes(bytes_count: *mut u32) -> *const u8 {
    let Some(profiler) = profiler() else {
        if !bytes_count.is_null() {
            *bytes_count = 0;
        }
        return std::ptr::null();
    };
    let table = profiler.probe_table().as_bytes();
    if !bytes_count.is_null() {
        #[allow(clippy::cast_possible_truncation)]
        {
            *bytes_count = table.len() as u32;
        }
    }
    table.as_ptr()
}

/// Drains the accumulated coverage history into a caller-owned buffer.
///
/// # Safety
/// `size` and `bytes` must be valid out-pointers.
#[no_mangle]
pub unsafe extern "system" fn GetHistory(size: *mut u64, bytes: *mut *mut u8) {
    let buffer = match profiler() {
        Some(profiler) => profiler.drain_history(),
        None => wire::empty_history(),
    };
    hand_over(buffer, size, bytes);
}

/// Returns a buffer previously handed out by [`GetHistory`] or
/// [`GetThreadMapping`] to the allocator.
///
/// # Safety
/// `bytes`/`size` must be exactly the pair a drain call produced, and the
/// buffer must not be released twice.
#[no_mangle]
pub unsafe extern "system" fn ReleaseHistory(bytes: *mut u8, size: u64) {
    if bytes.is_null() {
        return;
    }
    #[allow(clippy::cast_possible_truncation)]
    let slice = std::ptr::slice_from_raw_parts_mut(bytes, size as usize);
    drop(Box::from_raw(slice));
}

/// Installs the expected-coverage list for path-divergence checking.
///
/// # Safety
/// `bytes` must point to `size` readable bytes.
#[no_mangle]
pub unsafe extern "system" fn SetExpectedCoverage(bytes: *const u8, size: u64) {
    let Some(profiler) = profiler() else {
        log::warn!("SetExpectedCoverage before install; ignored");
        return;
    };
    if bytes.is_null() {
        log::warn!("SetExpectedCoverage with null buffer; ignored");
        return;
    }
    #[allow(clippy::cast_possible_truncation)]
    let data = std::slice::from_raw_parts(bytes, size as usize);
    match wire::deserialize_expected(data) {
        Ok(steps) => profiler.set_expected_coverage(steps),
        Err(e) => log::warn!("malformed expected coverage; ignored: {e}"),
    }
}

/// Records the statically resolved callee of a call site.
///
/// The external rewriter calls this while instrumenting, once per call site
/// it could resolve: `caller_method_id` is the id it was handed in the
/// rewrite request, `offset` the call site's IL offset, and the callee is
/// identified by module and token. Unresolvable call sites are simply not
/// reported.
#[no_mangle]
pub extern "system" fn RegisterCallTarget(
    caller_method_id: u32,
    offset: u32,
    callee_module: usize,
    callee_token: u32,
) {
    let Some(profiler) = profiler() else {
        log::warn!("RegisterCallTarget before install; ignored");
        return;
    };
    profiler.register_call_target(caller_method_id, offset, callee_module, Token(callee_token));
}

/// Attaches the consumer's label to the calling thread.
#[no_mangle]
pub extern "system" fn MapCurrentThread(map_id: i32) {
    let Some(profiler) = profiler() else {
        log::warn!("MapCurrentThread before install; ignored");
        return;
    };
    profiler.map_current_thread(map_id);
}

/// Drains the thread-label table into a caller-owned buffer.
///
/// # Safety
/// `size` and `bytes` must be valid out-pointers.
#[no_mangle]
pub unsafe extern "system" fn GetThreadMapping(size: *mut u64, bytes: *mut *mut u8) {
    let buffer = match profiler() {
        Some(profiler) => {
            wire::serialize_thread_mapping(&profiler.snapshot_thread_mapping())
        }
        None => wire::serialize_thread_mapping(&[]),
    };
    hand_over(buffer, size, bytes);
}
