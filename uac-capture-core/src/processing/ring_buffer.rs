use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Lock-free single-producer/single-consumer byte ring for captured audio.
///
/// The acquisition thread owns the [`RingProducer`], the persistence thread owns
/// the [`RingConsumer`]; neither handle is `Clone`, so there is exactly one of each.
///
/// Overflow behavior: drops the oldest unread bytes, rounded up to whole frames
/// (`alignment`), and counts one overrun per write that had to drop. The
/// producer never blocks.
///
/// Cursors are monotonically increasing byte positions. The producer moves the
/// read cursor forward with a CAS *before* overwriting; the consumer publishes
/// its progress with a CAS *after* copying, so a copy that raced with an
/// overwrite fails its CAS and is retried from the new position.
#[derive(Debug)]
pub struct CaptureRingBuffer {
    storage: Box<[AtomicU8]>,
    capacity: usize,
    alignment: usize,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    overruns: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl CaptureRingBuffer {
    /// Allocate a ring of `capacity` bytes (rounded down to a multiple of
    /// `alignment`, minimum one frame) and split it into its two handles.
    pub fn new(capacity: usize, alignment: usize) -> (RingProducer, RingConsumer) {
        let alignment = alignment.max(1);
        let capacity = (capacity / alignment).max(1) * alignment;
        let storage = (0..capacity).map(|_| AtomicU8::new(0)).collect::<Vec<_>>().into_boxed_slice();

        let shared = Arc::new(Self {
            storage,
            capacity,
            alignment,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
        });

        (
            RingProducer {
                shared: Arc::clone(&shared),
                write_pos: 0,
            },
            RingConsumer { shared },
        )
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frame size every drop and read is rounded to.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes written but not yet consumed. Never exceeds `capacity()`.
    pub fn available_to_read(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        (write.saturating_sub(read) as usize).min(self.capacity)
    }

    /// Number of writes that had to discard unread data.
    pub fn overrun_count(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Total bytes discarded by overruns.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }

    fn store_at(&self, position: u64, data: &[u8]) {
        let start = (position % self.capacity as u64) as usize;
        let first = data.len().min(self.capacity - start);
        for (slot, &byte) in self.storage[start..start + first].iter().zip(&data[..first]) {
            slot.store(byte, Ordering::Relaxed);
        }
        for (slot, &byte) in self.storage[..data.len() - first].iter().zip(&data[first..]) {
            slot.store(byte, Ordering::Relaxed);
        }
    }

    fn load_at(&self, position: u64, out: &mut [u8]) {
        let start = (position % self.capacity as u64) as usize;
        let first = out.len().min(self.capacity - start);
        let (head, tail) = out.split_at_mut(first);
        for (byte, slot) in head.iter_mut().zip(&self.storage[start..start + first]) {
            *byte = slot.load(Ordering::Relaxed);
        }
        for (byte, slot) in tail.iter_mut().zip(&self.storage[..]) {
            *byte = slot.load(Ordering::Relaxed);
        }
    }

    fn align_up(&self, bytes: u64) -> u64 {
        let align = self.alignment as u64;
        bytes.div_ceil(align) * align
    }
}

/// Write half of a [`CaptureRingBuffer`]. Never blocks and never allocates.
#[derive(Debug)]
pub struct RingProducer {
    shared: Arc<CaptureRingBuffer>,
    // Only this handle advances the write cursor, so a local copy is authoritative.
    write_pos: u64,
}

impl RingProducer {
    /// Write `data`, overwriting the oldest unread bytes if the consumer lags.
    ///
    /// Writes should be whole frames. If `data` is larger than the ring, only
    /// the last `capacity()` bytes are kept. Returns the number of bytes stored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let ring = &*self.shared;
        let capacity = ring.capacity as u64;
        let mut dropped = 0u64;

        // If more data than capacity, only keep the tail
        let data = if data.len() > ring.capacity {
            dropped += (data.len() - ring.capacity) as u64;
            &data[data.len() - ring.capacity..]
        } else {
            data
        };

        let new_write = self.write_pos + data.len() as u64;

        // Move the read cursor past everything this write is about to overwrite
        loop {
            let read = ring.read_pos.load(Ordering::Acquire);
            if new_write - read <= capacity {
                break;
            }
            let target = (read + ring.align_up(new_write - capacity - read)).min(self.write_pos);
            if ring
                .read_pos
                .compare_exchange(read, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                dropped += target - read;
                break;
            }
        }

        if dropped > 0 {
            ring.overruns.fetch_add(1, Ordering::Relaxed);
            ring.dropped_bytes.fetch_add(dropped, Ordering::Relaxed);
        }

        ring.store_at(self.write_pos, data);
        self.write_pos = new_write;
        ring.write_pos.store(new_write, Ordering::Release);
        data.len()
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn overrun_count(&self) -> u64 {
        self.shared.overrun_count()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Shared view for statistics.
    pub fn ring(&self) -> Arc<CaptureRingBuffer> {
        Arc::clone(&self.shared)
    }
}

/// Read half of a [`CaptureRingBuffer`].
#[derive(Debug)]
pub struct RingConsumer {
    shared: Arc<CaptureRingBuffer>,
}

impl RingConsumer {
    /// Read up to `out.len()` bytes (rounded down to whole frames) without allocating.
    ///
    /// Returns the number of bytes copied into `out`.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let ring = &*self.shared;
        let max = out.len() - out.len() % ring.alignment;

        loop {
            let read = ring.read_pos.load(Ordering::Acquire);
            let write = ring.write_pos.load(Ordering::Acquire);
            let available = write.saturating_sub(read) as usize;
            let count = available.min(max);
            if count == 0 {
                return 0;
            }

            ring.load_at(read, &mut out[..count]);

            // A failed CAS means the producer dropped part of what we just copied.
            if ring
                .read_pos
                .compare_exchange(read, read + count as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return count;
            }
        }
    }

    /// Read and remove up to `max_bytes` bytes (whole frames only).
    pub fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_bytes.min(self.shared.capacity)];
        let count = self.read_into(&mut out);
        out.truncate(count);
        out
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn overrun_count(&self) -> u64 {
        self.shared.overrun_count()
    }

    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Shared view for statistics.
    pub fn ring(&self) -> Arc<CaptureRingBuffer> {
        Arc::clone(&self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn basic_write_read() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(10, 1);
        assert_eq!(tx.write(&[1, 2, 3]), 3);

        assert_eq!(rx.available_to_read(), 3);
        assert_eq!(rx.read(3), vec![1, 2, 3]);
        assert!(rx.is_empty());
        assert_eq!(rx.overrun_count(), 0);
    }

    #[test]
    fn read_partial() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(10, 1);
        tx.write(&[1, 2, 3, 4, 5]);

        assert_eq!(rx.read(3), vec![1, 2, 3]);
        assert_eq!(rx.available_to_read(), 2);

        let rest = rx.read(10); // request more than available
        assert_eq!(rest, vec![4, 5]);
        assert!(rx.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_and_counts_once() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(4, 1);
        tx.write(&[1, 2, 3, 4]);
        tx.write(&[5, 6]); // overflow: drops 1, 2

        assert_eq!(rx.available_to_read(), 4);
        assert_eq!(rx.overrun_count(), 1);
        assert_eq!(rx.ring().dropped_bytes(), 2);
        assert_eq!(rx.read(4), vec![3, 4, 5, 6]);
    }

    #[test]
    fn write_larger_than_capacity_keeps_tail() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(3, 1);
        assert_eq!(tx.write(&[1, 2, 3, 4, 5]), 3);

        assert_eq!(rx.overrun_count(), 1);
        assert_eq!(rx.ring().dropped_bytes(), 2);
        assert_eq!(rx.read(3), vec![3, 4, 5]);
    }

    #[test]
    fn wraparound() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(4, 1);

        tx.write(&[1, 2, 3]);
        rx.read(2); // discard 1, 2

        tx.write(&[4, 5, 6]); // wraps around

        assert_eq!(rx.available_to_read(), 4);
        assert_eq!(rx.overrun_count(), 0);
        assert_eq!(rx.read(4), vec![3, 4, 5, 6]);
    }

    #[test]
    fn drops_and_reads_stay_frame_aligned() {
        // 3-byte frames, room for 4 frames
        let (mut tx, mut rx) = CaptureRingBuffer::new(13, 3);
        assert_eq!(tx.capacity(), 12);

        tx.write(&[1, 1, 1, 2, 2, 2, 3, 3, 3]);
        tx.write(&[4, 4, 4, 5, 5, 5]); // needs 3 bytes of room, drops one frame

        assert_eq!(rx.ring().dropped_bytes(), 3);
        // A 5-byte request only yields one whole frame
        assert_eq!(rx.read(5), vec![2, 2, 2]);
        assert_eq!(rx.read(12), vec![3, 3, 3, 4, 4, 4, 5, 5, 5]);
    }

    #[test]
    fn empty_operations() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(10, 1);

        assert!(rx.is_empty());
        assert!(rx.read(5).is_empty());

        assert_eq!(tx.write(&[]), 0);
        assert!(rx.is_empty());
    }

    #[test]
    fn available_never_exceeds_capacity_and_overruns_are_monotonic() {
        let (mut tx, mut rx) = CaptureRingBuffer::new(64, 4);
        let mut seed: u32 = 0x1234_5678;
        let mut last_overruns = 0;

        for _ in 0..2000 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let frames = (seed >> 24) as usize % 24;
            if seed & 1 == 0 {
                let data = vec![0xAB; frames * 4];
                let before = rx.ring().dropped_bytes();
                tx.write(&data);
                let overruns = rx.overrun_count();
                let dropped = rx.ring().dropped_bytes() > before;
                assert_eq!(overruns - last_overruns, dropped as u64);
                last_overruns = overruns;
            } else {
                let got = rx.read(frames * 4);
                assert_eq!(got.len() % 4, 0);
            }
            assert!(rx.available_to_read() <= rx.capacity());
        }
    }

    #[test]
    fn concurrent_producer_and_consumer_preserve_order() {
        const FRAMES: u32 = 200_000;
        let (mut tx, mut rx) = CaptureRingBuffer::new(4 * 1024, 4);
        let ring = tx.ring();

        let producer = thread::spawn(move || {
            for chunk in (0..FRAMES).collect::<Vec<_>>().chunks(37) {
                let bytes: Vec<u8> = chunk.iter().flat_map(|n| n.to_le_bytes()).collect();
                tx.write(&bytes);
            }
        });

        let mut received = 0u64;
        let mut last: Option<u32> = None;
        let mut buf = vec![0u8; 512];
        loop {
            let n = rx.read_into(&mut buf);
            for frame in buf[..n].chunks_exact(4) {
                let value = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                if let Some(prev) = last {
                    assert!(value > prev, "frame {value} after {prev}");
                }
                last = Some(value);
                received += 1;
            }
            if n == 0 && producer.is_finished() && rx.is_empty() {
                break;
            }
        }
        producer.join().unwrap();

        assert_eq!(last, Some(FRAMES - 1));
        assert_eq!(received * 4 + ring.dropped_bytes(), FRAMES as u64 * 4);
    }
}
