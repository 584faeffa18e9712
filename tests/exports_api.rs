//! End-to-end exercise of the C ABI surface: install, configuration
//! delivery, probe dispatch through the exported address table, and the
//! consumer drain calls.
//!
//! Everything lives in one test because the exports operate on the
//! process-global profiler slot.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};

use dotprobe::{
    exports::{
        GetHistory, GetProbes, GetThreadMapping, MapCurrentThread, RegisterCallTarget,
        ReleaseHistory, SetEntryMain, SyncInfoGettersPointers,
    },
    prelude::*,
    wire::deserialize_history,
    Result, Token,
};
use widestring::U16String;

#[derive(Default)]
struct TestHost {
    functions: Mutex<HashMap<FunctionId, FunctionInfo>>,
    modules: Mutex<HashMap<ModuleId, ModuleInfo>>,
}

impl TestHost {
    fn add_function(&self, function: FunctionId, module: ModuleId, token: u32) {
        self.functions
            .lock()
            .unwrap()
            .insert(function, FunctionInfo { module, token: Token(token) });
    }

    fn add_module(&self, module: ModuleId, module_name: &str, assembly_name: &str) {
        self.modules.lock().unwrap().insert(
            module,
            ModuleInfo {
                module_name: U16String::from_str(module_name),
                assembly_name: U16String::from_str(assembly_name),
            },
        );
    }
}

impl ProfilingHost for TestHost {
    fn function_info(&self, function: FunctionId) -> Result<FunctionInfo> {
        self.functions
            .lock()
            .unwrap()
            .get(&function)
            .copied()
            .ok_or(dotprobe::Error::Host { context: "function info", hr: -1 })
    }

    fn module_info(&self, module: ModuleId) -> Result<ModuleInfo> {
        self.modules
            .lock()
            .unwrap()
            .get(&module)
            .cloned()
            .ok_or(dotprobe::Error::Host { context: "module info", hr: -1 })
    }

    fn signature_token(&self, _module: ModuleId, blob: &[u8]) -> Result<Token> {
        Ok(Token(0x1100_0000 | u32::from(blob[1])))
    }

    fn request_rejit(&self, _targets: &[(ModuleId, Token)]) -> Result<()> {
        Ok(())
    }

    fn current_thread(&self) -> ThreadId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        thread_local! {
            static ID: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
        }
        ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT.fetch_add(1, Ordering::SeqCst));
            }
            id.get()
        })
    }
}

static REWRITES: AtomicU32 = AtomicU32::new(0);

unsafe extern "system" fn instrument_callback(
    _module_id: usize,
    _method_token: u32,
    _method_id: u32,
    _is_main: u8,
    probes: *const u64,
    probe_count: u32,
    signature_tokens: *const u32,
    signature_token_count: u32,
) -> i32 {
    assert!(!probes.is_null());
    assert!(!signature_tokens.is_null());
    assert_eq!(probe_count as usize, PROBE_COUNT);
    assert_eq!(signature_token_count, 4);
    REWRITES.fetch_add(1, Ordering::SeqCst);
    0
}

fn utf16(s: &str) -> U16String {
    U16String::from_str(s)
}

type Probe0 = unsafe extern "system" fn();
type Probe1 = unsafe extern "system" fn(i32);
type Probe2 = unsafe extern "system" fn(i32, i32);
type Probe3 = unsafe extern "system" fn(i32, i32, i32);

#[test]
fn c_abi_surface_end_to_end() {
    let host = Arc::new(TestHost::default());
    host.add_module(1, "M.dll", "M");
    host.add_function(10, 1, 0x0600_0001);
    host.add_function(11, 1, 0x0600_0002);

    let profiler = Profiler::install(
        Arc::clone(&host) as Arc<dyn ProfilingHost>,
        ProfilerConfig::default(),
    );

    // configuration arrives over the C ABI
    let assembly = utf16("M");
    let module = utf16("M.dll");
    unsafe {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        SetEntryMain(
            assembly.as_ptr(),
            assembly.len() as i32,
            module.as_ptr(),
            module.len() as i32,
            0x0600_0001,
        );
        SyncInfoGettersPointers(instrument_callback as usize);
    }

    // JIT events route through the gate and reach the injected callback
    profiler.on_jit_compilation_started(10).unwrap();
    profiler.on_jit_compilation_started(11).unwrap();
    assert_eq!(REWRITES.load(Ordering::SeqCst), 2);
    assert!(profiler.is_main_function(10));

    // the probe table is stable across calls and readable as addresses
    let (first_ptr, addresses) = unsafe {
        let mut len = 0u32;
        let ptr = GetProbes(&mut len);
        assert!(!ptr.is_null());
        assert_eq!(len as usize, PROBE_COUNT * 8);
        let bytes = std::slice::from_raw_parts(ptr, len as usize);
        let mut addresses = [0u64; PROBE_COUNT];
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            addresses[i] = u64::from_le_bytes(chunk.try_into().unwrap());
        }

        let mut len_again = 0u32;
        let again = GetProbes(&mut len_again);
        assert_eq!(ptr, again);
        assert_eq!(
            std::slice::from_raw_parts(again, len_again as usize),
            bytes
        );
        (ptr, addresses)
    };
    assert!(!first_ptr.is_null());

    // drive the run through the exported probe addresses, the way
    // instrumented IL would; the two interned methods carry ids 0 (main)
    // and 1
    MapCurrentThread(5);
    RegisterCallTarget(1, 16, 1, 0x0600_0001);
    unsafe {
        let enter_main: Probe3 = std::mem::transmute(addresses[3]);
        let enter: Probe3 = std::mem::transmute(addresses[2]);
        let branch: Probe2 = std::mem::transmute(addresses[1]);
        let leave: Probe2 = std::mem::transmute(addresses[4]);
        let leave_main: Probe2 = std::mem::transmute(addresses[5]);
        let call: Probe1 = std::mem::transmute(addresses[7]);
        let finalize: Probe1 = std::mem::transmute(addresses[6]);
        let coverage: Probe0 = std::mem::transmute(addresses[0]);

        enter_main(0, 0, 0);
        coverage();
        enter(10, 1, 0);
        branch(14, 1);
        call(16);
        finalize(16);
        leave(20, 1);
        leave_main(30, 0);
    }

    // consumer drain over the C ABI
    unsafe {
        let mut size = 0u64;
        let mut bytes: *mut u8 = std::ptr::null_mut();
        GetHistory(&mut size, &mut bytes);
        assert!(!bytes.is_null());
        let data = std::slice::from_raw_parts(bytes, size as usize).to_vec();
        ReleaseHistory(bytes, size);

        let traces = deserialize_history(&data).unwrap();
        assert_eq!(traces.len(), 1);
        let kinds: Vec<CoverageKind> = traces[0].events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CoverageKind::EnterMain,
                CoverageKind::Enter,
                CoverageKind::BranchHit,
                CoverageKind::Call,
                CoverageKind::Leave,
                CoverageKind::LeaveMain,
            ]
        );

        // a second drain observes nothing
        let mut size = 0u64;
        let mut bytes: *mut u8 = std::ptr::null_mut();
        GetHistory(&mut size, &mut bytes);
        let data = std::slice::from_raw_parts(bytes, size as usize).to_vec();
        ReleaseHistory(bytes, size);
        assert!(deserialize_history(&data).unwrap().is_empty());
    }

    // the thread label drains once
    unsafe {
        let mut size = 0u64;
        let mut bytes: *mut u8 = std::ptr::null_mut();
        GetThreadMapping(&mut size, &mut bytes);
        let data = std::slice::from_raw_parts(bytes, size as usize).to_vec();
        ReleaseHistory(bytes, size);
        let mut reader = dotprobe::wire::WireReader::new(&data);
        assert_eq!(reader.read::<i32>().unwrap(), 1);
        let _thread = reader.read::<u64>().unwrap();
        assert_eq!(reader.read::<i32>().unwrap(), 5);
    }

    profiler.shutdown();
    assert!(!profiler.probes_enabled());
    assert!(!profiler.instrumentation_enabled());
}
