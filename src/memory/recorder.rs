//! Allocation event recording.
//!
//! The allocator reports every allocation and deallocation to an
//! [`EventSink`]. The default [`NoopSink`] compiles to nothing; a
//! [`TraceRecorder`] buffers events per thread slot and writes them out as
//! fixed-size binary records.
//!
//! Record layout (48 bytes, little-endian):
//!
//! | offset | field       | type |
//! |--------|-------------|------|
//! | 0      | op          | u8   |
//! | 1      | (padding)   | 3B   |
//! | 4      | thread id   | u32  |
//! | 8      | pointer     | u64  |
//! | 16     | size        | u64  |
//! | 24     | alignment   | u64  |
//! | 32     | caller      | u64  |
//! | 40     | timestamp   | i64  |

use std::io::{self, Read, Write};
use std::sync::PoisonError;
use std::time::Instant;

use super::arena::{arena_index, current_thread_id};
#[cfg(not(loom))]
use crate::sync::atomic::{AtomicBool, Ordering};
use crate::sync::{Arc, Mutex};

pub const RECORD_SIZE: usize = 48;

/// Buffer slots in a [`TraceRecorder`]; threads hash onto them.
pub const RECORDER_SLOTS: usize = 8;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocOp {
    New = 0,
    NewArray = 1,
    Delete = 2,
    DeleteArray = 3,
}

impl AllocOp {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::New,
            1 => Self::NewArray,
            2 => Self::Delete,
            3 => Self::DeleteArray,
            _ => return None,
        })
    }

    pub fn is_allocation(self) -> bool {
        matches!(self, Self::New | Self::NewArray)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocEvent {
    pub op: AllocOp,
    pub thread_id: u32,
    pub ptr: u64,
    pub size: u64,
    pub align: u64,
    /// Address identifying the call site.
    pub caller: u64,
    /// Nanoseconds since the recorder was created.
    pub timestamp_nanos: i64,
}

impl AllocEvent {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0] = self.op as u8;
        out[4..8].copy_from_slice(&self.thread_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.ptr.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..32].copy_from_slice(&self.align.to_le_bytes());
        out[32..40].copy_from_slice(&self.caller.to_le_bytes());
        out[40..48].copy_from_slice(&self.timestamp_nanos.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; RECORD_SIZE]) -> Option<Self> {
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let mut tid = [0u8; 4];
        tid.copy_from_slice(&raw[4..8]);
        Some(Self {
            op: AllocOp::from_raw(raw[0])?,
            thread_id: u32::from_le_bytes(tid),
            ptr: u64_at(8),
            size: u64_at(16),
            align: u64_at(24),
            caller: u64_at(32),
            timestamp_nanos: u64_at(40).cast_signed(),
        })
    }
}

/// Receiver of allocation events.
///
/// Implementations must not allocate through the allocator that reports to
/// them.
pub trait EventSink: Send + Sync {
    /// `false` lets the allocator skip event construction entirely.
    const ENABLED: bool = true;

    fn record(&self, op: AllocOp, ptr: usize, size: usize, align: usize, caller: usize);
}

/// Discards every event at compile time.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    const ENABLED: bool = false;

    #[inline(always)]
    fn record(&self, _op: AllocOp, _ptr: usize, _size: usize, _align: usize, _caller: usize) {}
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    const ENABLED: bool = T::ENABLED;

    #[inline]
    fn record(&self, op: AllocOp, ptr: usize, size: usize, align: usize, caller: usize) {
        (**self).record(op, ptr, size, align, caller);
    }
}

/// Buffers events in per-thread-slot append-only logs.
///
/// Events from one thread always land in the same slot, so per-thread order
/// is preserved; no order is defined across threads.
pub struct TraceRecorder {
    slots: Box<[Mutex<Vec<AllocEvent>>]>,
    epoch: Instant,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            slots: (0..RECORDER_SLOTS).map(|_| Mutex::new(Vec::new())).collect(),
            epoch: Instant::now(),
        }
    }

    /// Events currently buffered across all slots.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Remove and return every buffered event, slot by slot.
    pub fn drain(&self) -> Vec<AllocEvent> {
        let mut out = Vec::new();
        for slot in self.slots.iter() {
            out.append(&mut slot.lock().unwrap_or_else(PoisonError::into_inner));
        }
        out
    }

    /// Drain buffered events into `out` as binary records. Returns the number
    /// of records written.
    ///
    /// On a write error the record that failed and everything after it go
    /// back to the front of their slot. The failed record may already be
    /// partly in `out`.
    pub fn flush_to<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        let mut written = 0;
        for slot in self.slots.iter() {
            let mut events =
                std::mem::take(&mut *slot.lock().unwrap_or_else(PoisonError::into_inner));
            let failure = events
                .iter()
                .enumerate()
                .find_map(|(i, event)| out.write_all(&event.to_bytes()).err().map(|e| (i, e)));
            if let Some((sent, e)) = failure {
                events.drain(..sent);
                let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                events.append(&mut guard);
                *guard = events;
                return Err(e);
            }
            written += events.len();
        }
        out.flush()?;
        Ok(written)
    }

    /// Periodically append buffered events to the file at `path` from a
    /// background thread. The returned handle performs a final flush when
    /// stopped or dropped.
    #[cfg(not(loom))]
    pub fn spawn_flusher(
        self: &Arc<Self>,
        path: impl AsRef<std::path::Path>,
        interval: std::time::Duration,
    ) -> io::Result<Flusher> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut out = io::BufWriter::new(file);
        let recorder = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("alloc-trace-flusher".into())
            .spawn(move || -> io::Result<()> {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::park_timeout(interval);
                    recorder.flush_to(&mut out)?;
                }
                recorder.flush_to(&mut out)?;
                Ok(())
            })?;

        Ok(Flusher {
            stop,
            thread: Some(thread),
        })
    }
}

impl EventSink for TraceRecorder {
    fn record(&self, op: AllocOp, ptr: usize, size: usize, align: usize, caller: usize) {
        let thread_id = current_thread_id();
        let timestamp_nanos = i64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(i64::MAX);
        let event = AllocEvent {
            op,
            thread_id: trace_thread_id(thread_id),
            ptr: ptr as u64,
            size: size as u64,
            align: align as u64,
            caller: caller as u64,
            timestamp_nanos,
        };
        self.slots[arena_index(thread_id, RECORDER_SLOTS)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Thread ids past `u32::MAX` share the saturated value in records.
fn trace_thread_id(thread_id: u64) -> u32 {
    u32::try_from(thread_id).unwrap_or(u32::MAX)
}

/// Handle to a background trace flusher.
#[cfg(not(loom))]
pub struct Flusher {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<io::Result<()>>>,
}

#[cfg(not(loom))]
impl Flusher {
    /// Stop the thread after a final flush and report its I/O outcome.
    pub fn stop(mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        thread.thread().unpark();
        thread
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("trace flusher panicked")))
    }
}

#[cfg(not(loom))]
impl Drop for Flusher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            eprintln!("[memory] trace flusher failed: {e}");
        }
    }
}

/// Decode a stream of binary records.
pub fn read_trace<R: Read>(mut reader: R) -> io::Result<Vec<AllocEvent>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if !bytes.len().is_multiple_of(RECORD_SIZE) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("trace length {} is not a multiple of {RECORD_SIZE}", bytes.len()),
        ));
    }
    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; RECORD_SIZE];
            raw.copy_from_slice(chunk);
            AllocEvent::from_bytes(&raw).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad op byte {}", raw[0]))
            })
        })
        .collect()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let event = AllocEvent {
            op: AllocOp::DeleteArray,
            thread_id: 7,
            ptr: 0x1000,
            size: 64,
            align: 16,
            caller: 0xdead_beef,
            timestamp_nanos: -1,
        };
        let raw = event.to_bytes();
        assert_eq!(raw[0], 3);
        assert_eq!(&raw[1..4], &[0, 0, 0]);
        assert_eq!(&raw[4..8], &7u32.to_le_bytes());
        assert_eq!(&raw[40..48], &(-1i64).to_le_bytes());
        assert_eq!(AllocEvent::from_bytes(&raw), Some(event));
    }

    #[test]
    fn test_flush_preserves_per_thread_order() {
        let recorder = TraceRecorder::new();
        for i in 0..10 {
            recorder.record(AllocOp::New, 0x1000 + i, 32, 16, 0);
        }
        assert_eq!(recorder.pending(), 10);

        let mut buf = Vec::new();
        assert_eq!(recorder.flush_to(&mut buf).unwrap(), 10);
        assert_eq!(buf.len(), 10 * RECORD_SIZE);
        assert_eq!(recorder.pending(), 0);

        let events = read_trace(&buf[..]).unwrap();
        let ptrs: Vec<u64> = events.iter().map(|e| e.ptr).collect();
        assert_eq!(ptrs, (0x1000..0x100a).collect::<Vec<u64>>());
        assert!(events.windows(2).all(|w| w[0].timestamp_nanos <= w[1].timestamp_nanos));
        assert!(events.iter().all(|e| e.thread_id == events[0].thread_id));
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortWriter {
        buf: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "disk full"));
            }
            let n = data.len().min(self.budget);
            self.buf.extend_from_slice(&data[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_flush_keeps_unwritten_events() {
        let recorder = TraceRecorder::new();
        for i in 0..10 {
            recorder.record(AllocOp::New, 0x1000 + i, 32, 16, 0);
        }

        let mut short = ShortWriter {
            buf: Vec::new(),
            budget: 3 * RECORD_SIZE + 10,
        };
        let err = recorder.flush_to(&mut short).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(recorder.pending(), 7);

        // Events recorded after the failure queue behind the requeued ones.
        recorder.record(AllocOp::Delete, 0x2000, 32, 16, 0);
        let mut buf = Vec::new();
        assert_eq!(recorder.flush_to(&mut buf).unwrap(), 8);
        let ptrs: Vec<u64> = read_trace(&buf[..]).unwrap().iter().map(|e| e.ptr).collect();
        let mut expected: Vec<u64> = (0x1003..0x100a).collect();
        expected.push(0x2000);
        assert_eq!(ptrs, expected);
    }

    #[test]
    fn test_thread_id_saturates_in_records() {
        assert_eq!(trace_thread_id(7), 7);
        assert_eq!(trace_thread_id(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(trace_thread_id(u64::from(u32::MAX) + 1), u32::MAX);
        assert_eq!(trace_thread_id(u64::MAX), u32::MAX);
    }

    #[test]
    fn test_threads_keep_their_own_order() {
        let recorder = Arc::new(TraceRecorder::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let recorder = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        recorder.record(AllocOp::New, ((t << 32) | i) as usize, 8, 8, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let events = recorder.drain();
        assert_eq!(events.len(), 400);
        for t in 0..4u64 {
            let mine: Vec<u64> = events
                .iter()
                .filter(|e| e.ptr >> 32 == t)
                .map(|e| e.ptr & 0xffff_ffff)
                .collect();
            assert_eq!(mine, (0..100).collect::<Vec<u64>>());
        }
    }

    #[test]
    fn test_read_trace_rejects_torn_record() {
        let mut raw = AllocEvent {
            op: AllocOp::New,
            thread_id: 1,
            ptr: 1,
            size: 1,
            align: 1,
            caller: 1,
            timestamp_nanos: 1,
        }
        .to_bytes()
        .to_vec();
        raw.pop();
        assert_eq!(read_trace(&raw[..]).unwrap_err().kind(), io::ErrorKind::InvalidData);

        let mut bad_op = [0u8; RECORD_SIZE];
        bad_op[0] = 9;
        assert_eq!(read_trace(&bad_op[..]).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_background_flusher_writes_file() {
        let path = std::env::temp_dir().join(format!(
            "jalloc-trace-{}-{}.bin",
            std::process::id(),
            current_thread_id()
        ));
        let _ = std::fs::remove_file(&path);

        let recorder = Arc::new(TraceRecorder::new());
        let flusher = recorder
            .spawn_flusher(&path, std::time::Duration::from_millis(5))
            .unwrap();
        recorder.record(AllocOp::New, 0x10, 16, 16, 0);
        recorder.record(AllocOp::Delete, 0x10, 16, 16, 0);
        flusher.stop().unwrap();

        let events = read_trace(std::fs::File::open(&path).unwrap()).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, AllocOp::New);
        assert_eq!(events[1].op, AllocOp::Delete);
    }

    #[test]
    fn test_noop_sink_is_disabled() {
        const { assert!(!NoopSink::ENABLED) };
        const { assert!(TraceRecorder::ENABLED) };
        const { assert!(!<Arc<NoopSink> as EventSink>::ENABLED) };
    }
}
