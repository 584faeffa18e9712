//! Serialization of the coverage history and its configuration side channels.
//!
//! The drained history travels as: `i32` trace count, then each trace. A
//! trace is its visited method records (ids remapped to a dense `0..N` range
//! in ascending original order) followed by its events. The remapping happens
//! entirely inside the output buffer; recorded events are never touched, so a
//! drain cannot corrupt a trace that is still being appended to.
//!
//! ```text
//! history     := i32 trace_count, trace*
//! trace       := i32 visited_count, method_record*, i32 event_count, event*
//! method_rec  := u32 token, u32 assembly_len, u16*, u32 module_len, u16*
//! event       := u32 offset, u32 kind, i32 method_id   (-1 = no method)
//! ```

use rustc_hash::FxHashMap;

use crate::{
    coverage::{CoverageKind, CoverageTrace, ExpectedStep, MethodRecord, MethodTable},
    runtime::ThreadId,
    wire::io::{WireReader, WireWriter},
    Result,
};

impl MethodRecord {
    /// Exact encoded size of this record.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        4 + 4 + 2 * self.assembly_name.len() + 4 + 2 * self.module_name.len()
    }

    /// Encodes the record.
    pub fn serialize(&self, out: &mut WireWriter) {
        out.write(self.token.value());
        #[allow(clippy::cast_possible_truncation)]
        out.write(self.assembly_name.len() as u32);
        out.write_utf16(&self.assembly_name);
        #[allow(clippy::cast_possible_truncation)]
        out.write(self.module_name.len() as u32);
        out.write_utf16(&self.module_name);
    }

    /// Decodes one record.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`](crate::Error::OutOfBounds) on truncated input.
    pub fn deserialize(reader: &mut WireReader<'_>) -> Result<MethodRecord> {
        let token = reader.read::<u32>()?.into();
        let assembly_len = reader.read::<u32>()? as usize;
        let assembly_name = reader.read_utf16(assembly_len)?;
        let module_len = reader.read::<u32>()? as usize;
        let module_name = reader.read_utf16(module_len)?;
        Ok(MethodRecord {
            token,
            module_name,
            assembly_name,
        })
    }
}

/// Encoded size of one event.
const EVENT_SIZE: usize = 4 + 4 + 4;

impl CoverageTrace {
    /// Exact encoded size of this trace.
    ///
    /// # Errors
    /// [`Error::Malformed`](crate::Error::Malformed) if a visited id has no
    /// record in `methods`, which means the intern invariant was broken.
    pub fn size_bytes(&self, methods: &MethodTable) -> Result<usize> {
        let mut size = 4; // visited count
        for id in self.visited_methods() {
            let record = methods
                .get(*id)
                .ok_or_else(|| malformed_error!("visited method {id} was never interned"))?;
            size += record.wire_size();
        }
        size += 4; // event count
        size += EVENT_SIZE * self.events().len();
        Ok(size)
    }

    /// Encodes the trace, remapping method ids into dense visited order.
    ///
    /// # Errors
    /// [`Error::Malformed`](crate::Error::Malformed) if a visited id has no
    /// record in `methods`.
    pub fn serialize(&self, methods: &MethodTable, out: &mut WireWriter) -> Result<()> {
        let visited = self.visited_methods();
        #[allow(clippy::cast_possible_truncation)]
        out.write(visited.len() as i32);

        // sending only visited methods; events refer to them by their
        // position in this list
        let mut remap = FxHashMap::default();
        for (dense, id) in visited.iter().enumerate() {
            let record = methods
                .get(*id)
                .ok_or_else(|| malformed_error!("visited method {id} was never interned"))?;
            record.serialize(out);
            #[allow(clippy::cast_possible_truncation)]
            remap.insert(*id, dense as i32);
        }

        #[allow(clippy::cast_possible_truncation)]
        out.write(self.events().len() as i32);
        for event in self.events() {
            out.write(event.offset);
            out.write(event.kind as u32);
            out.write(event.method.and_then(|id| remap.get(&id).copied()).unwrap_or(-1));
        }
        Ok(())
    }
}

/// Serializes a drained history: `i32` count, then each trace in order.
///
/// # Errors
/// [`Error::Malformed`](crate::Error::Malformed) if a trace references a
/// method the table does not hold.
pub fn serialize_history(traces: &[CoverageTrace], methods: &MethodTable) -> Result<Vec<u8>> {
    let mut size = 4;
    for trace in traces {
        size += trace.size_bytes(methods)?;
    }
    let mut out = WireWriter::with_capacity(size);
    #[allow(clippy::cast_possible_truncation)]
    out.write(traces.len() as i32);
    for trace in traces {
        trace.serialize(methods, &mut out)?;
    }
    debug_assert_eq!(out.len(), size);
    Ok(out.into_bytes())
}

/// A history buffer encoding zero traces.
#[must_use]
pub fn empty_history() -> Vec<u8> {
    let mut out = WireWriter::with_capacity(4);
    out.write(0i32);
    out.into_bytes()
}

/// One event as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedEvent {
    /// IL offset
    pub offset: u32,
    /// Event kind
    pub kind: CoverageKind,
    /// Dense index into the owning trace's method list, `-1` when absent
    pub method: i32,
}

/// One trace as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTrace {
    /// Visited method records, in remapped id order
    pub methods: Vec<MethodRecord>,
    /// Recorded events
    pub events: Vec<DecodedEvent>,
}

/// Decodes a history buffer produced by [`serialize_history`].
///
/// # Errors
/// [`Error::OutOfBounds`](crate::Error::OutOfBounds) on truncation,
/// [`Error::Malformed`](crate::Error::Malformed) on counts or kinds that make
/// no sense.
pub fn deserialize_history(bytes: &[u8]) -> Result<Vec<DecodedTrace>> {
    let mut reader = WireReader::new(bytes);
    let trace_count = reader.read::<i32>()?;
    if trace_count < 0 {
        return Err(malformed_error!("negative trace count {trace_count}"));
    }
    let mut traces = Vec::new();
    for _ in 0..trace_count {
        let visited_count = reader.read::<i32>()?;
        if visited_count < 0 {
            return Err(malformed_error!("negative visited count {visited_count}"));
        }
        let mut methods = Vec::new();
        for _ in 0..visited_count {
            methods.push(MethodRecord::deserialize(&mut reader)?);
        }
        let event_count = reader.read::<i32>()?;
        if event_count < 0 {
            return Err(malformed_error!("negative event count {event_count}"));
        }
        // counts come from an untrusted buffer; grow as reads succeed
        let mut events = Vec::new();
        for _ in 0..event_count {
            let offset = reader.read::<u32>()?;
            let raw_kind = reader.read::<u32>()?;
            let kind = CoverageKind::from_u32(raw_kind)
                .ok_or_else(|| malformed_error!("unknown event kind {raw_kind}"))?;
            let method = reader.read::<i32>()?;
            events.push(DecodedEvent {
                offset,
                kind,
                method,
            });
        }
        traces.push(DecodedTrace { methods, events });
    }
    Ok(traces)
}

/// Encodes an expected-coverage step list: `i32` count, then
/// `u32 method | u32 offset | i32 thread` per step.
#[must_use]
pub fn serialize_expected(steps: &[ExpectedStep]) -> Vec<u8> {
    let mut out = WireWriter::with_capacity(4 + steps.len() * 12);
    #[allow(clippy::cast_possible_truncation)]
    out.write(steps.len() as i32);
    for step in steps {
        out.write(step.method);
        out.write(step.offset);
        out.write(step.thread);
    }
    out.into_bytes()
}

/// Decodes an expected-coverage step list.
///
/// # Errors
/// [`Error::OutOfBounds`](crate::Error::OutOfBounds) on truncation,
/// [`Error::Malformed`](crate::Error::Malformed) on a negative count.
pub fn deserialize_expected(bytes: &[u8]) -> Result<Vec<ExpectedStep>> {
    let mut reader = WireReader::new(bytes);
    let count = reader.read::<i32>()?;
    if count < 0 {
        return Err(malformed_error!("negative step count {count}"));
    }
    let mut steps = Vec::new();
    for _ in 0..count {
        steps.push(ExpectedStep {
            method: reader.read::<u32>()?,
            offset: reader.read::<u32>()?,
            thread: reader.read::<i32>()?,
        });
    }
    Ok(steps)
}

/// Encodes the drained thread-label table: `i32` count, then
/// `u64 os thread | i32 label` per pair.
#[must_use]
pub fn serialize_thread_mapping(pairs: &[(ThreadId, i32)]) -> Vec<u8> {
    let mut out = WireWriter::with_capacity(4 + pairs.len() * 12);
    #[allow(clippy::cast_possible_truncation)]
    out.write(pairs.len() as i32);
    for (thread, label) in pairs {
        out.write(*thread);
        out.write(*label);
    }
    out.into_bytes()
}
