//! # Frame Cache
//!
//! A small cache of whole physical frames in front of the [`PhysicalStore`].
//!
//! - **Write-back**: writes land in the cached line and mark it dirty; the
//!   store is updated when the line is flushed, evicted, or the background
//!   [`FlushDaemon`] runs.
//! - **Write-through**: writes update the store immediately and refresh any
//!   cached copy.
//!
//! Reads allocate a line on miss. Lines are spread over independently locked
//! shards by frame number, so transfers to frames in different shards do not
//! wait on each other; each shard evicts its own least-recently-used line.
//!
//! Anything that reads a frame behind the cache's back (swap-out, the
//! copy-on-write copy, compaction, dumps) must call [`WriteBackCache::evict`]
//! or [`WriteBackCache::flush`] for that frame first, and every path that
//! frees a frame must [`WriteBackCache::discard`] it so a line never outlives
//! its frame.
//!
//! Lock order: a shard mutex is taken before any frame lock of the store, and
//! at most one shard is held at a time.

use kernel_alloc::{PhysicalStore, StoreError};
use kernel_info::WritePolicy;
use kernel_memory_addresses::FrameNumber;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug)]
struct Line {
    data: Box<[u8]>,
    dirty: bool,
}

/// Upper bound on the number of shards; a small cache gets one line per shard.
const MAX_SHARDS: usize = 8;

#[derive(Debug, Default)]
struct Lines {
    capacity: usize,
    lines: HashMap<FrameNumber, Line>,
    /// Most recently used at the back.
    order: VecDeque<FrameNumber>,
    hits: u64,
    misses: u64,
    write_backs: u64,
}

impl Lines {
    fn promote(&mut self, frame: FrameNumber) {
        if let Some(pos) = self.order.iter().position(|f| *f == frame) {
            self.order.remove(pos);
        }
        self.order.push_back(frame);
    }

    fn remove(&mut self, frame: FrameNumber) -> Option<Line> {
        let line = self.lines.remove(&frame)?;
        if let Some(pos) = self.order.iter().position(|f| *f == frame) {
            self.order.remove(pos);
        }
        Some(line)
    }
}

/// Counters of a [`WriteBackCache`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub write_backs: u64,
    pub lines: usize,
    pub dirty_lines: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct WriteBackCache {
    store: Arc<PhysicalStore>,
    policy: WritePolicy,
    capacity: usize,
    shards: Box<[Mutex<Lines>]>,
}

impl WriteBackCache {
    /// A cache of `capacity` lines. A capacity of zero passes every access
    /// straight to the store.
    #[must_use]
    pub fn new(store: Arc<PhysicalStore>, policy: WritePolicy, capacity: usize) -> Self {
        let count = capacity.min(MAX_SHARDS);
        let shards = (0..count)
            .map(|i| {
                let extra = usize::from(i < capacity % count);
                Mutex::new(Lines {
                    capacity: capacity / count + extra,
                    ..Lines::default()
                })
            })
            .collect();
        Self {
            store,
            policy,
            capacity,
            shards,
        }
    }

    /// The shard holding `frame`'s line; `None` for a zero-capacity cache.
    fn shard(&self, frame: FrameNumber) -> Option<&Mutex<Lines>> {
        let index = frame.as_u64().checked_rem(self.shards.len() as u64)?;
        self.shards.get(usize::try_from(index).ok()?)
    }

    #[inline]
    #[must_use]
    pub const fn policy(&self) -> WritePolicy {
        self.policy
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<PhysicalStore> {
        &self.store
    }

    /// Make room for one more line, writing back the victim if dirty.
    fn make_room(&self, lines: &mut Lines) -> Result<(), StoreError> {
        while lines.lines.len() >= lines.capacity {
            let Some(victim) = lines.order.front().copied() else {
                break;
            };
            if let Some(line) = lines.remove(victim)
                && line.dirty
            {
                self.store.write_frame(victim, 0, &line.data)?;
                lines.write_backs += 1;
            }
        }
        Ok(())
    }

    /// Load `frame` into the cache if absent.
    fn fill<'a>(&self, lines: &'a mut Lines, frame: FrameNumber) -> Result<&'a mut Line, StoreError> {
        if lines.lines.contains_key(&frame) {
            lines.hits += 1;
        } else {
            lines.misses += 1;
            self.make_room(lines)?;
            let data = self.store.frame_bytes(frame)?.into_boxed_slice();
            lines.lines.insert(frame, Line { data, dirty: false });
        }
        lines.promote(frame);
        lines
            .lines
            .get_mut(&frame)
            .ok_or(StoreError::InvalidFrame(frame))
    }

    /// Read `buf.len()` bytes at `offset` within `frame`.
    ///
    /// # Errors
    /// The frame does not exist or the range leaves it.
    pub fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let Some(shard) = self.shard(frame) else {
            return self.store.read_frame(frame, offset, buf);
        };
        let mut lines = shard.lock();
        let line = self.fill(&mut lines, frame)?;
        let src = line
            .data
            .get(offset..offset + buf.len())
            .ok_or(StoreError::InvalidFrame(frame))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Write `data` at `offset` within `frame` under the configured policy.
    ///
    /// # Errors
    /// The frame does not exist or the range leaves it.
    pub fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let Some(shard) = self.shard(frame) else {
            return self.store.write_frame(frame, offset, data);
        };
        let mut lines = shard.lock();
        match self.policy {
            WritePolicy::WriteBack => {
                let line = self.fill(&mut lines, frame)?;
                line.data
                    .get_mut(offset..offset + data.len())
                    .ok_or(StoreError::InvalidFrame(frame))?
                    .copy_from_slice(data);
                line.dirty = true;
                Ok(())
            }
            WritePolicy::WriteThrough => {
                self.store.write_frame(frame, offset, data)?;
                if let Some(line) = lines.lines.get_mut(&frame)
                    && let Some(dst) = line.data.get_mut(offset..offset + data.len())
                {
                    dst.copy_from_slice(data);
                }
                Ok(())
            }
        }
    }

    /// Write `frame`'s line back if dirty, keeping it cached. Returns whether it was written.
    ///
    /// # Errors
    /// The store rejected the write.
    pub fn flush(&self, frame: FrameNumber) -> Result<bool, StoreError> {
        let Some(shard) = self.shard(frame) else {
            return Ok(false);
        };
        let mut lines = shard.lock();
        let Some(line) = lines.lines.get_mut(&frame) else {
            return Ok(false);
        };
        if !line.dirty {
            return Ok(false);
        }
        self.store.write_frame(frame, 0, &line.data)?;
        line.dirty = false;
        lines.write_backs += 1;
        Ok(true)
    }

    /// Write back every dirty line. Returns how many were written.
    ///
    /// # Errors
    /// The store rejected a write; lines after it stay dirty.
    pub fn flush_all(&self) -> Result<usize, StoreError> {
        let mut written = 0;
        for shard in &self.shards {
            let mut lines = shard.lock();
            let Lines {
                lines: map,
                write_backs,
                ..
            } = &mut *lines;
            for (frame, line) in map.iter_mut().filter(|(_, l)| l.dirty) {
                self.store.write_frame(*frame, 0, &line.data)?;
                line.dirty = false;
                *write_backs += 1;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write back and drop `frame`'s line.
    ///
    /// # Errors
    /// The store rejected the write; the line is kept.
    pub fn evict(&self, frame: FrameNumber) -> Result<(), StoreError> {
        let Some(shard) = self.shard(frame) else {
            return Ok(());
        };
        let mut lines = shard.lock();
        if let Some(line) = lines.lines.get(&frame)
            && line.dirty
        {
            self.store.write_frame(frame, 0, &line.data)?;
            lines.write_backs += 1;
        }
        lines.remove(frame);
        Ok(())
    }

    /// Drop `frame`'s line without writing it back.
    pub fn discard(&self, frame: FrameNumber) {
        if let Some(shard) = self.shard(frame) {
            shard.lock().remove(frame);
        }
    }

    /// Drop every line without writing anything back.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut lines = shard.lock();
            lines.lines.clear();
            lines.order.clear();
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.shards.iter().fold(
            CacheStats {
                capacity: self.capacity,
                ..CacheStats::default()
            },
            |mut stats, shard| {
                let lines = shard.lock();
                stats.hits += lines.hits;
                stats.misses += lines.misses;
                stats.write_backs += lines.write_backs;
                stats.lines += lines.lines.len();
                stats.dirty_lines += lines.lines.values().filter(|l| l.dirty).count();
                stats
            },
        )
    }
}

/// Background thread that periodically flushes a [`WriteBackCache`].
///
/// Stopped by [`FlushDaemon::stop`] or on drop; a final flush runs on the way out.
#[derive(Debug)]
pub struct FlushDaemon {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    /// # Errors
    /// The thread could not be spawned.
    pub fn spawn(cache: Arc<WriteBackCache>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("vm-flush".into())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                let mut stopped = lock.lock();
                while !*stopped {
                    cvar.wait_for(&mut stopped, interval);
                    match cache.flush_all() {
                        Ok(0) => {}
                        Ok(n) => log::trace!("flushed {n} cache lines"),
                        Err(e) => log::warn!("background flush failed: {e}"),
                    }
                }
            })?;
        log::info!("write-back flusher started ({}ms)", interval.as_millis());
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if handle.join().is_err() {
            log::warn!("write-back flusher panicked");
        } else {
            log::info!("write-back flusher stopped");
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PageSize;

    const PS: usize = 512;

    fn cache(policy: WritePolicy, capacity: usize) -> WriteBackCache {
        let store = Arc::new(PhysicalStore::new(4, PageSize::new(PS as u64).unwrap()));
        WriteBackCache::new(store, policy, capacity)
    }

    fn stored(c: &WriteBackCache, frame: u64) -> Vec<u8> {
        c.store().frame_bytes(FrameNumber::new(frame)).unwrap()
    }

    #[test]
    fn write_back_defers_until_flush() {
        let c = cache(WritePolicy::WriteBack, 2);
        let f = FrameNumber::new(1);
        c.write(f, 10, &[7, 7]).unwrap();
        assert_eq!(stored(&c, 1)[10], 0);
        let mut buf = [0u8; 2];
        c.read(f, 10, &mut buf).unwrap();
        assert_eq!(buf, [7, 7]);
        assert_eq!(c.stats().dirty_lines, 1);
        assert!(c.flush(f).unwrap());
        assert!(!c.flush(f).unwrap());
        assert_eq!(stored(&c, 1)[10], 7);
    }

    #[test]
    fn write_through_hits_the_store_immediately() {
        let c = cache(WritePolicy::WriteThrough, 2);
        let f = FrameNumber::new(0);
        let mut buf = [0u8; 1];
        c.read(f, 0, &mut buf).unwrap();
        c.write(f, 0, &[9]).unwrap();
        assert_eq!(stored(&c, 0)[0], 9);
        c.read(f, 0, &mut buf).unwrap();
        assert_eq!(buf, [9]);
        assert_eq!(c.stats().dirty_lines, 0);
    }

    #[test]
    fn lru_line_is_written_back_on_eviction() {
        let c = cache(WritePolicy::WriteBack, 2);
        c.write(FrameNumber::new(0), 0, &[1]).unwrap();
        c.write(FrameNumber::new(1), 0, &[2]).unwrap();
        c.write(FrameNumber::new(2), 0, &[3]).unwrap();
        assert_eq!(stored(&c, 0)[0], 1);
        assert_eq!(stored(&c, 1)[0], 0);
        let s = c.stats();
        assert_eq!(s.lines, 2);
        assert_eq!(s.write_backs, 1);
        assert_eq!(c.flush_all().unwrap(), 2);
        assert_eq!(stored(&c, 2)[0], 3);
    }

    #[test]
    fn discard_drops_dirty_data() {
        let c = cache(WritePolicy::WriteBack, 2);
        c.write(FrameNumber::new(3), 0, &[5]).unwrap();
        c.discard(FrameNumber::new(3));
        assert_eq!(stored(&c, 3)[0], 0);
        c.write(FrameNumber::new(3), 0, &[6]).unwrap();
        c.evict(FrameNumber::new(3)).unwrap();
        assert_eq!(stored(&c, 3)[0], 6);
        assert_eq!(c.stats().lines, 0);
    }

    #[test]
    fn capacity_is_split_across_shards() {
        let store = Arc::new(PhysicalStore::new(24, PageSize::new(PS as u64).unwrap()));
        let c = WriteBackCache::new(store, WritePolicy::WriteBack, 10);
        assert_eq!(c.shards.len(), MAX_SHARDS);
        let per_shard: Vec<usize> = c.shards.iter().map(|s| s.lock().capacity).collect();
        assert_eq!(per_shard.iter().sum::<usize>(), 10);
        assert_eq!(per_shard[..3], [2, 2, 1]);

        c.write(FrameNumber::new(0), 0, &[1]).unwrap();
        c.write(FrameNumber::new(8), 0, &[2]).unwrap();
        c.write(FrameNumber::new(1), 0, &[3]).unwrap();
        assert_eq!(c.stats().lines, 3);

        // Frames 0, 8 and 16 share a two-line shard; frame 1 is left alone.
        c.write(FrameNumber::new(16), 0, &[4]).unwrap();
        let s = c.stats();
        assert_eq!(s.lines, 3);
        assert_eq!(s.write_backs, 1);
        assert_eq!(stored(&c, 0)[0], 1);
        assert_eq!(stored(&c, 1)[0], 0);
    }

    #[test]
    fn zero_capacity_passes_through() {
        let c = cache(WritePolicy::WriteBack, 0);
        c.write(FrameNumber::new(2), 5, &[4]).unwrap();
        assert_eq!(stored(&c, 2)[5], 4);
    }

    #[test]
    fn daemon_flushes_and_stops() {
        let c = Arc::new(cache(WritePolicy::WriteBack, 2));
        c.write(FrameNumber::new(0), 0, &[8]).unwrap();
        let d = FlushDaemon::spawn(Arc::clone(&c), Duration::from_millis(5)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stored(&c, 0)[0] != 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        d.stop();
        assert_eq!(stored(&c, 0)[0], 8);
    }
}
