// Copyright 2025-2026 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
// - 'runtime/probes.rs' views the probe address array as bytes for export
// - 'exports.rs' is the C ABI boundary and handles raw host pointers

//! # dotprobe
//!
//! A coverage-instrumentation profiler core for CLR-style managed runtimes.
//! `dotprobe` attaches to a runtime's JIT, rewrites method bodies so that
//! inserted probes report control-flow events (method entry and leave,
//! branches, calls) back into native code, and records them as an ordered,
//! per-thread coverage history an out-of-process consumer drains over a
//! binary wire format.
//!
//! # Architecture
//!
//! Three tightly coupled subsystems make up the core:
//!
//! - **Method rewriting** ([`crate::rewrite`]) - decides which methods get
//!   instrumented, interns method identities, obtains per-module callsite
//!   signature tokens and dispatches the bytecode rewrite to the external
//!   IL rewriter.
//! - **Probe runtime** ([`crate::runtime`]) - the native entry points invoked
//!   from instrumented code: per-thread stack balance, shadow call frames,
//!   the `EnterMain`/`LeaveMain` lifecycle and the global probe gate.
//! - **Coverage recording and wire** ([`crate::coverage`], [`crate::wire`]) -
//!   the append-only trace log, the method table, and the little-endian
//!   serialization the consumer parses.
//!
//! The managed runtime's profiling API and the component that physically
//! emits rewritten bytecode stay outside the crate; they appear as the
//! [`crate::rewrite::ProfilingHost`] and [`crate::rewrite::Rewriter`] seams.
//! The [`crate::exports`] module is the C ABI the host process drives.
//!
//! # Usage Examples
//!
//! ## Consumer side: parsing a drained history
//!
//! ```rust
//! use dotprobe::wire;
//!
//! // a drain of an idle profiler encodes zero traces
//! let bytes = wire::empty_history();
//! let traces = wire::deserialize_history(&bytes)?;
//! assert!(traces.is_empty());
//! # Ok::<(), dotprobe::Error>(())
//! ```
//!
//! ## Embedding: installing the profiler
//!
//! ```rust,no_run
//! use dotprobe::prelude::*;
//! use std::sync::Arc;
//!
//! # struct MyHost;
//! # impl ProfilingHost for MyHost {
//! #     fn function_info(&self, _: FunctionId) -> dotprobe::Result<FunctionInfo> { unimplemented!() }
//! #     fn module_info(&self, _: ModuleId) -> dotprobe::Result<ModuleInfo> { unimplemented!() }
//! #     fn signature_token(&self, _: ModuleId, _: &[u8]) -> dotprobe::Result<dotprobe::Token> { unimplemented!() }
//! #     fn request_rejit(&self, _: &[(ModuleId, dotprobe::Token)]) -> dotprobe::Result<()> { unimplemented!() }
//! #     fn current_thread(&self) -> ThreadId { unimplemented!() }
//! # }
//! // at library attach: publish the profiler for the probe entry points
//! let profiler = Profiler::install(Arc::new(MyHost), ProfilerConfig::default());
//!
//! // route the host's JIT notifications into the rewrite gate
//! profiler.on_jit_compilation_started(42)?;
//! # Ok::<(), dotprobe::Error>(())
//! ```
//!
//! # Concurrency
//!
//! Probes may fire concurrently from arbitrary managed threads. A single
//! coarse mutex inside [`crate::runtime::Profiler`] guards trace mutation,
//! shadow-stack mutation and tracker slot lifecycle; the enable gates are
//! atomics readable without it. The order of events in a drained history is
//! the order in which probes acquired that lock, a total order consistent
//! with every per-thread program order.
//!
//! # Error Handling
//!
//! Recoverable failures return [`Result<T, Error>`](Result). Conditions the
//! runtime cannot survive (stack imbalance at `LeaveMain`, path divergence,
//! coverage with no open trace) abort the process with a diagnostic instead
//! of unwinding into managed code.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
pub mod prelude;

/// Profiler configuration: entry-method identity, policies, stack heuristics.
pub mod config;

/// Coverage recording: the method table, traces and the expected-coverage
/// checker.
pub mod coverage;

/// Host-called C ABI entry points and the callback-backed rewriter.
pub mod exports;

/// Method rewriting: the JIT-event gate and the host/rewriter seams.
pub mod rewrite;

/// The probe runtime: thread tracking, shadow frames, probe entry points and
/// the profiler value.
pub mod runtime;

/// Binary wire formats and history-drain helpers.
pub mod wire;

mod token;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;
pub use token::Token;
