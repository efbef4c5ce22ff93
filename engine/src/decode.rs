use std::collections::HashMap;

use byteorder::{LittleEndian, ReadBytesExt};

use shared::{QueryResult, SignalQueryResult, TimeNs, ValueChange};

use crate::error::EngineError;
use crate::parser::{RawResultDescriptor, SharedMemoryView};

// ===== BINARY RESULT DECODING =====
//
// The engine flushes query results as fixed-size little-endian records in
// its shared buffer. Scalar (1-bit) records are 16 bytes: u64 timestamp,
// u32 signal index, u8 value code, 3 pad. Vector (multi-bit) records are
// 24 bytes: u64 timestamp, u32 signal index, u32 pool offset, u32 pool
// length, 4 pad; the pool bytes are UTF-8 decoded on demand.

pub const SCALAR_RECORD_BYTES: usize = 16;
pub const VECTOR_RECORD_BYTES: usize = 24;

/// Value in effect before any boundary record arrives for a signal.
pub const UNKNOWN_VALUE: &str = "x";

fn scalar_value(code: u8) -> &'static str {
    match code {
        0 => "0",
        1 => "1",
        2 => "x",
        3 => "z",
        // unknown codes decode defensively to unknown state
        _ => "x",
    }
}

/// Running per-signal result of one query, fed by successive flush decodes.
///
/// A record at or before the window start defines the value in effect at
/// the start: it overwrites `initial_value` and clears any transitions
/// accumulated so far for that signal, so a later boundary record within
/// the same query supersedes earlier ones. Records after the window start
/// append, strictly increasing; a re-sent timestamp overwrites the value
/// already recorded for it.
pub struct QueryAccumulator {
    t_begin: TimeNs,
    t_end: TimeNs,
    slots: Vec<SignalQueryResult>,
    slot_of: HashMap<u32, usize>,
}

impl QueryAccumulator {
    /// `requested` pairs each signal index with its display name, in
    /// request order; the result preserves that order.
    pub fn new(t_begin: TimeNs, t_end: TimeNs, requested: &[(u32, String)]) -> Self {
        let mut slots = Vec::with_capacity(requested.len());
        let mut slot_of = HashMap::with_capacity(requested.len());
        for (position, (index, name)) in requested.iter().enumerate() {
            slot_of.insert(*index, position);
            slots.push(SignalQueryResult {
                index: *index,
                name: name.clone(),
                initial_value: UNKNOWN_VALUE.to_string(),
                transitions: Vec::new(),
            });
        }
        QueryAccumulator {
            t_begin,
            t_end,
            slots,
            slot_of,
        }
    }

    /// Decode one flush into the running result. Returns true when any
    /// signal gained a new transition (progress worth emitting).
    pub fn apply(
        &mut self,
        raw: &RawResultDescriptor,
        view: &SharedMemoryView<'_>,
    ) -> Result<bool, EngineError> {
        let mut gained = false;

        let scalar_bytes = view.slice(
            raw.scalar_offset,
            raw.scalar_count
                .checked_mul(SCALAR_RECORD_BYTES as u32)
                .ok_or_else(|| EngineError::Engine("scalar region overflows".to_string()))?,
        )?;
        for record in scalar_bytes.chunks_exact(SCALAR_RECORD_BYTES) {
            let mut cursor = record;
            let time = TimeNs::from_nanos(read_u64(&mut cursor)?);
            let index = read_u32(&mut cursor)?;
            let code = cursor
                .read_u8()
                .map_err(|e| EngineError::Engine(e.to_string()))?;
            gained |= self.apply_record(time, index, scalar_value(code).to_string());
        }

        let vector_bytes = view.slice(
            raw.vector_offset,
            raw.vector_count
                .checked_mul(VECTOR_RECORD_BYTES as u32)
                .ok_or_else(|| EngineError::Engine("vector region overflows".to_string()))?,
        )?;
        let pool = view.slice(raw.pool_offset, raw.pool_len)?;
        for record in vector_bytes.chunks_exact(VECTOR_RECORD_BYTES) {
            let mut cursor = record;
            let time = TimeNs::from_nanos(read_u64(&mut cursor)?);
            let index = read_u32(&mut cursor)?;
            let offset = read_u32(&mut cursor)? as usize;
            let len = read_u32(&mut cursor)? as usize;
            let bytes = pool.get(offset..offset + len).ok_or_else(|| {
                EngineError::Engine(format!(
                    "string pool reference [{offset}, {}) exceeds pool of {} bytes",
                    offset + len,
                    pool.len()
                ))
            })?;
            let value = std::str::from_utf8(bytes)
                .map_err(|e| EngineError::Engine(format!("non-UTF-8 value string: {e}")))?
                .to_string();
            gained |= self.apply_record(time, index, value);
        }

        Ok(gained)
    }

    fn apply_record(&mut self, time: TimeNs, index: u32, value: String) -> bool {
        // Records for unrequested signals should not occur; ignore them.
        let Some(&slot) = self.slot_of.get(&index) else {
            return false;
        };
        let signal = &mut self.slots[slot];

        if time <= self.t_begin {
            signal.initial_value = value;
            signal.transitions.clear();
            return false;
        }

        match signal.transitions.last_mut() {
            Some(last) if time < last.time => false,
            Some(last) if time == last.time => {
                last.value = value;
                false
            }
            _ => {
                signal.transitions.push(ValueChange { time, value });
                true
            }
        }
    }

    /// Accumulated result so far, for progress emission.
    pub fn snapshot(&self) -> QueryResult {
        QueryResult {
            t_begin: self.t_begin,
            t_end: self.t_end,
            signals: self.slots.clone(),
        }
    }

    pub fn into_result(self) -> QueryResult {
        QueryResult {
            t_begin: self.t_begin,
            t_end: self.t_end,
            signals: self.slots,
        }
    }
}

/// Single-shot decode of one flush against a fresh accumulator.
pub fn decode(
    raw: &RawResultDescriptor,
    view: &SharedMemoryView<'_>,
    t_begin: TimeNs,
    t_end: TimeNs,
    requested: &[(u32, String)],
) -> Result<QueryResult, EngineError> {
    let mut accumulator = QueryAccumulator::new(t_begin, t_end, requested);
    accumulator.apply(raw, view)?;
    Ok(accumulator.into_result())
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64, EngineError> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|e| EngineError::Engine(e.to_string()))
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, EngineError> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| EngineError::Engine(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    struct RawBuffer {
        bytes: Vec<u8>,
        descriptor: RawResultDescriptor,
    }

    /// Encode scalar records, vector records, and the pool the way the
    /// engine lays them out.
    fn build_buffer(
        scalars: &[(u64, u32, u8)],
        vectors: &[(u64, u32, &str)],
    ) -> RawBuffer {
        let mut bytes = Vec::new();
        let scalar_offset = 0u32;
        for &(time, index, code) in scalars {
            bytes.write_u64::<LittleEndian>(time).unwrap();
            bytes.write_u32::<LittleEndian>(index).unwrap();
            bytes.write_u8(code).unwrap();
            bytes.extend_from_slice(&[0u8; 3]);
        }

        let mut pool = Vec::new();
        let vector_offset = bytes.len() as u32;
        for &(time, index, value) in vectors {
            bytes.write_u64::<LittleEndian>(time).unwrap();
            bytes.write_u32::<LittleEndian>(index).unwrap();
            bytes.write_u32::<LittleEndian>(pool.len() as u32).unwrap();
            bytes
                .write_u32::<LittleEndian>(value.len() as u32)
                .unwrap();
            bytes.extend_from_slice(&[0u8; 4]);
            pool.extend_from_slice(value.as_bytes());
        }

        let pool_offset = bytes.len() as u32;
        bytes.extend_from_slice(&pool);

        RawBuffer {
            descriptor: RawResultDescriptor {
                scalar_offset,
                scalar_count: scalars.len() as u32,
                vector_offset,
                vector_count: vectors.len() as u32,
                pool_offset,
                pool_len: pool.len() as u32,
            },
            bytes,
        }
    }

    fn requested(indices: &[u32]) -> Vec<(u32, String)> {
        indices.iter().map(|&i| (i, format!("sig{i}"))).collect()
    }

    #[test]
    fn decodes_scalar_records() {
        let buffer = build_buffer(&[(0, 0, 0), (500, 0, 1)], &[]);
        let view = SharedMemoryView::new(&buffer.bytes);

        let result = decode(
            &buffer.descriptor,
            &view,
            TimeNs::from_nanos(0),
            TimeNs::from_nanos(1000),
            &requested(&[0]),
        )
        .unwrap();

        let signal = &result.signals[0];
        assert_eq!(signal.initial_value, "0");
        assert_eq!(signal.transitions.len(), 1);
        assert_eq!(signal.transitions[0].time.nanos(), 500);
        assert_eq!(signal.transitions[0].value, "1");
    }

    #[test]
    fn decodes_vector_records_from_pool() {
        let buffer = build_buffer(&[], &[(0, 2, "1010"), (300, 2, "1100")]);
        let view = SharedMemoryView::new(&buffer.bytes);

        let result = decode(
            &buffer.descriptor,
            &view,
            TimeNs::from_nanos(100),
            TimeNs::from_nanos(1000),
            &requested(&[2]),
        )
        .unwrap();

        let signal = &result.signals[0];
        assert_eq!(signal.initial_value, "1010");
        assert_eq!(signal.transitions.len(), 1);
        assert_eq!(signal.transitions[0].value, "1100");
    }

    #[test]
    fn later_boundary_record_supersedes_earlier_flush() {
        // Two flushes both reporting t=0; the engine re-sent the boundary
        // record with a corrected value. The later one must win.
        let mut accumulator = QueryAccumulator::new(
            TimeNs::from_nanos(0),
            TimeNs::from_nanos(1000),
            &requested(&[0]),
        );

        let first = build_buffer(&[(0, 0, 0), (400, 0, 1)], &[]);
        accumulator
            .apply(&first.descriptor, &SharedMemoryView::new(&first.bytes))
            .unwrap();

        let second = build_buffer(&[(0, 0, 1)], &[]);
        accumulator
            .apply(&second.descriptor, &SharedMemoryView::new(&second.bytes))
            .unwrap();

        let result = accumulator.into_result();
        assert_eq!(result.signals[0].initial_value, "1");
        // The boundary record cleared the transitions recorded before it.
        assert!(result.signals[0].transitions.is_empty());
    }

    #[test]
    fn transitions_stay_strictly_increasing() {
        let buffer = build_buffer(&[(200, 0, 1), (200, 0, 0), (150, 0, 1), (300, 0, 1)], &[]);
        let view = SharedMemoryView::new(&buffer.bytes);

        let result = decode(
            &buffer.descriptor,
            &view,
            TimeNs::from_nanos(100),
            TimeNs::from_nanos(1000),
            &requested(&[0]),
        )
        .unwrap();

        let times: Vec<u64> = result.signals[0]
            .transitions
            .iter()
            .map(|t| t.time.nanos())
            .collect();
        assert_eq!(times, vec![200, 300]);
        // The same-timestamp re-send overwrote the value.
        assert_eq!(result.signals[0].transitions[0].value, "0");
    }

    #[test]
    fn unrequested_indices_are_ignored() {
        let buffer = build_buffer(&[(500, 9, 1)], &[]);
        let view = SharedMemoryView::new(&buffer.bytes);

        let result = decode(
            &buffer.descriptor,
            &view,
            TimeNs::from_nanos(0),
            TimeNs::from_nanos(1000),
            &requested(&[0]),
        )
        .unwrap();

        assert!(result.signals[0].transitions.is_empty());
        assert_eq!(result.signals[0].initial_value, UNKNOWN_VALUE);
    }

    #[test]
    fn apply_reports_whether_transitions_were_gained() {
        let mut accumulator = QueryAccumulator::new(
            TimeNs::from_nanos(0),
            TimeNs::from_nanos(1000),
            &requested(&[0]),
        );

        let boundary_only = build_buffer(&[(0, 0, 1)], &[]);
        let gained = accumulator
            .apply(
                &boundary_only.descriptor,
                &SharedMemoryView::new(&boundary_only.bytes),
            )
            .unwrap();
        assert!(!gained);

        let with_transition = build_buffer(&[(250, 0, 0)], &[]);
        let gained = accumulator
            .apply(
                &with_transition.descriptor,
                &SharedMemoryView::new(&with_transition.bytes),
            )
            .unwrap();
        assert!(gained);
    }

    #[test]
    fn bad_pool_reference_is_an_engine_error() {
        let mut buffer = build_buffer(&[], &[(300, 0, "1010")]);
        // Corrupt the pool length so the reference dangles.
        buffer.descriptor.pool_len = 1;
        let view = SharedMemoryView::new(&buffer.bytes);

        let error = decode(
            &buffer.descriptor,
            &view,
            TimeNs::from_nanos(0),
            TimeNs::from_nanos(1000),
            &requested(&[0]),
        )
        .unwrap_err();
        assert!(matches!(error, EngineError::Engine(_)));
    }
}
