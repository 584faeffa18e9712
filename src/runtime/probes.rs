//! Native probe entry points reachable from instrumented IL.
//!
//! Each probe is a thin `extern "system"` shim: look up the installed
//! profiler, check the probe gate, delegate to the runtime. The shims never
//! unwind and are no-ops both before install and while probes are disabled.
//!
//! The address table handed to the external rewriter freezes these functions
//! in a fixed order; the rewriter indexes into it blindly, so the order is
//! wire compatibility and must never change.

use crate::runtime::profiler::profiler;

/// Number of exported probe addresses.
pub const PROBE_COUNT: usize = 9;

/// The probe address vector, in the frozen export order:
/// coverage, branch, enter, enter-main, leave, leave-main, finalize-call,
/// call, tailcall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTable {
    addresses: [u64; PROBE_COUNT],
}

impl ProbeTable {
    /// Collects the addresses of the probe entry points.
    #[must_use]
    pub fn collect() -> Self {
        ProbeTable {
            addresses: [
                track_coverage as usize as u64,
                branch as usize as u64,
                track_enter as usize as u64,
                track_enter_main as usize as u64,
                track_leave as usize as u64,
                track_leave_main as usize as u64,
                finalize_call as usize as u64,
                track_call as usize as u64,
                track_tailcall as usize as u64,
            ],
        }
    }

    /// The addresses in export order.
    #[must_use]
    pub fn addresses(&self) -> &[u64; PROBE_COUNT] {
        &self.addresses
    }

    /// Byte view of the address vector for the `GetProbes` export.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // u64 array viewed as bytes; length is exact and the source outlives
        // the borrow
        unsafe {
            std::slice::from_raw_parts(
                self.addresses.as_ptr().cast::<u8>(),
                PROBE_COUNT * std::mem::size_of::<u64>(),
            )
        }
    }
}

/// Path-validation probe without an event payload.
pub extern "system" fn track_coverage() {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_coverage_point();
}

/// A branch at `offset` inside method `method_id` was taken.
pub extern "system" fn branch(offset: i32, method_id: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_branch(offset as u32, method_id as u32);
}

/// An instrumented method was entered.
pub extern "system" fn track_enter(offset: i32, method_id: i32, is_spontaneous: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        log::trace!("probes are disabled; enter skipped");
        return;
    }
    profiler.on_enter(offset as u32, method_id as u32, is_spontaneous != 0);
}

/// The configured entry method was entered. Not gated: this is what enables
/// the probes.
pub extern "system" fn track_enter_main(offset: i32, method_id: i32, _is_spontaneous: i32) {
    let Some(profiler) = profiler() else { return };
    profiler.on_enter_main(offset as u32, method_id as u32);
}

/// An instrumented method is returning.
pub extern "system" fn track_leave(offset: i32, method_id: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_leave(offset as u32, method_id as u32);
}

/// The entry method is returning; closes the trace and disables probes.
pub extern "system" fn track_leave_main(offset: i32, _method_id: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_leave_main(offset as u32);
}

/// A call site completed. Pops the frame of an unmanaged callee whose `Enter`
/// never fired.
pub extern "system" fn finalize_call(_offset: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_finalize_call();
}

/// A call site was reached.
pub extern "system" fn track_call(offset: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_call(offset as u32);
}

/// A tail call is consuming the current frame.
pub extern "system" fn track_tailcall(offset: i32, _method_id: i32) {
    let Some(profiler) = profiler() else { return };
    if !profiler.probes_enabled() {
        return;
    }
    profiler.on_tailcall(offset as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_stable_across_collections() {
        let first = ProbeTable::collect();
        let second = ProbeTable::collect();
        assert_eq!(first, second);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn table_has_distinct_nonzero_addresses() {
        let table = ProbeTable::collect();
        let addresses = table.addresses();
        for (i, a) in addresses.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &addresses[i + 1..] {
                assert_ne!(*a, *b);
            }
        }
    }

    #[test]
    fn byte_view_is_little_endian_addresses() {
        let table = ProbeTable::collect();
        let bytes = table.as_bytes();
        assert_eq!(bytes.len(), PROBE_COUNT * 8);
        let first = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        assert_eq!(first, table.addresses()[0]);
    }

    #[test]
    fn probes_without_installed_profiler_are_no_ops() {
        // must not crash; nothing is installed in unit-test builds
        track_coverage();
        branch(4, 1);
        track_enter(0, 1, 0);
        track_leave(8, 1);
        finalize_call(0);
        track_call(2);
        track_tailcall(6, 1);
    }
}
