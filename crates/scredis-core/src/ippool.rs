//! Host-wide pool of container address identifiers.
//!
//! The pool hands out host ids `2..=254` of the managed /24 subnet. The set
//! of outstanding ids lives in a JSON array on disk so that independent
//! launcher processes on the same host see each other's leases. Every
//! read-modify-write of that record runs under an exclusive `flock(2)` held
//! on the record itself, so concurrent launches cannot double-assign an id.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use scredis_common::constants::POOL_SLOTS;
use scredis_common::error::{Result, ScredisError};
use scredis_common::types::{IpLease, LeaseId};

/// File mode of a freshly created pool record (subject to the umask).
const POOL_FILE_MODE: u32 = 0o666;

/// Fixed arena of pool slots, one per leasable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotArena {
    slots: [bool; POOL_SLOTS],
}

impl SlotArena {
    /// Creates an arena with every slot free.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            slots: [false; POOL_SLOTS],
        }
    }

    /// Builds an arena from a list of outstanding ids.
    #[must_use]
    pub fn from_ids(ids: &[LeaseId]) -> Self {
        let mut arena = Self::empty();
        for id in ids {
            arena.slots[id.slot()] = true;
        }
        arena
    }

    /// Returns the lowest free id, if any.
    #[must_use]
    pub fn first_free(&self) -> Option<LeaseId> {
        self.slots
            .iter()
            .position(|in_use| !in_use)
            .and_then(LeaseId::from_slot)
    }

    /// Returns whether `id` is leased.
    #[must_use]
    pub const fn is_occupied(&self, id: LeaseId) -> bool {
        self.slots[id.slot()]
    }

    /// Marks `id` as leased. Returns `false` if it already was.
    pub const fn occupy(&mut self, id: LeaseId) -> bool {
        let was_free = !self.slots[id.slot()];
        self.slots[id.slot()] = true;
        was_free
    }

    /// Marks `id` as free. Returns `false` if it was not leased.
    pub const fn vacate(&mut self, id: LeaseId) -> bool {
        let was_used = self.slots[id.slot()];
        self.slots[id.slot()] = false;
        was_used
    }

    /// Returns the outstanding ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<LeaseId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, in_use)| **in_use)
            .filter_map(|(slot, _)| LeaseId::from_slot(slot))
            .collect()
    }
}

impl Default for SlotArena {
    fn default() -> Self {
        Self::empty()
    }
}

/// Handle to the durable pool record.
#[derive(Debug, Clone)]
pub struct IpPool {
    path: PathBuf,
}

impl IpPool {
    /// Opens the pool backed by the record at `path`.
    ///
    /// The record is created lazily on first use.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the record path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leases the lowest free id.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::PoolExhausted`] if all ids are outstanding,
    /// or an I/O error if the record cannot be locked, read, or written.
    pub fn allocate(&self) -> Result<IpLease> {
        let id = self.with_record(|arena| {
            let id = arena.first_free().ok_or(ScredisError::PoolExhausted)?;
            let _ = arena.occupy(id);
            Ok(id)
        })?;
        tracing::info!(id = %id, pool = %self.path.display(), "ip id leased");
        Ok(IpLease::now(id))
    }

    /// Leases one specific id.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::AddressInUse`] if `id` is already outstanding,
    /// or an I/O error if the record cannot be locked, read, or written.
    pub fn acquire(&self, id: LeaseId) -> Result<IpLease> {
        self.with_record(|arena| {
            if arena.occupy(id) {
                Ok(())
            } else {
                Err(ScredisError::AddressInUse { id: id.get() })
            }
        })?;
        tracing::info!(id = %id, pool = %self.path.display(), "requested ip id leased");
        Ok(IpLease::now(id))
    }

    /// Returns `id` to the pool.
    ///
    /// Releasing an id that is not outstanding is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record cannot be locked, read, or written.
    pub fn release(&self, id: LeaseId) -> Result<()> {
        let released = self.with_record(|arena| Ok(arena.vacate(id)))?;
        if released {
            tracing::info!(id = %id, "ip id released");
        } else {
            tracing::debug!(id = %id, "ip id was not leased, nothing to release");
        }
        Ok(())
    }

    /// Returns the outstanding ids in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record cannot be locked or read.
    pub fn outstanding(&self) -> Result<Vec<LeaseId>> {
        self.with_record(|arena| Ok(arena.ids()))
    }

    /// Runs `f` over the record under an exclusive lock, persisting the
    /// arena afterwards if `f` changed it or the record was still blank.
    fn with_record<T>(&self, f: impl FnOnce(&mut SlotArena) -> Result<T>) -> Result<T> {
        let mut file = self.lock()?;
        let (before, blank) = self.load(&mut file)?;
        let mut arena = before.clone();
        let value = f(&mut arena)?;
        if blank || arena != before {
            self.persist(&mut file, &arena)?;
        }
        Ok(value)
    }

    fn lock(&self) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(POOL_FILE_MODE)
            .open(&self.path)
            .map_err(|e| ScredisError::io(&self.path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| ScredisError::io(&self.path, errno.into()))
    }

    /// Reads the record; the flag is set when the file held no JSON yet.
    fn load(&self, file: &mut File) -> Result<(SlotArena, bool)> {
        let mut raw = String::new();
        let _ = file
            .read_to_string(&mut raw)
            .map_err(|e| ScredisError::io(&self.path, e))?;
        if raw.trim().is_empty() {
            return Ok((SlotArena::empty(), true));
        }

        let recorded: Vec<i64> = serde_json::from_str(&raw)?;
        let mut arena = SlotArena::empty();
        for raw_id in recorded {
            match u32::try_from(raw_id).ok().map(LeaseId::new) {
                Some(Ok(id)) => {
                    let _ = arena.occupy(id);
                }
                _ => tracing::warn!(
                    id = raw_id,
                    pool = %self.path.display(),
                    "ignoring out-of-range id in pool record"
                ),
            }
        }
        Ok((arena, false))
    }

    fn persist(&self, file: &mut File, arena: &SlotArena) -> Result<()> {
        let ids: Vec<u32> = arena.ids().into_iter().map(u32::from).collect();
        let mut raw = serde_json::to_vec(&ids)?;
        raw.push(b'\n');
        let rewrite = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            let _ = file.seek(SeekFrom::Start(0))?;
            file.write_all(&raw)?;
            file.sync_data()
        };
        rewrite(file).map_err(|e| ScredisError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn pool_in(dir: &tempfile::TempDir) -> IpPool {
        IpPool::open(dir.path().join("ips.json"))
    }

    #[test]
    fn missing_record_is_an_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        assert!(pool.outstanding().unwrap().is_empty());
        assert!(pool.path().exists(), "record should be created lazily");
    }

    #[test]
    fn fresh_record_is_written_as_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        assert!(pool.outstanding().unwrap().is_empty());
        let raw = std::fs::read_to_string(pool.path()).unwrap();
        assert_eq!(raw, "[]\n");
        let ids: Vec<u32> = serde_json::from_str(&raw).unwrap();
        assert!(ids.is_empty());

        let other = IpPool::open(dir.path().join("other.json"));
        other.release(LeaseId::new(9).unwrap()).unwrap();
        let ids: Vec<u32> =
            serde_json::from_str(&std::fs::read_to_string(other.path()).unwrap()).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn allocate_returns_lowest_free_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        assert_eq!(pool.allocate().unwrap().id.get(), 2);
        assert_eq!(pool.allocate().unwrap().id.get(), 3);
        pool.release(LeaseId::new(2).unwrap()).unwrap();
        assert_eq!(pool.allocate().unwrap().id.get(), 2);
    }

    #[test]
    fn record_is_a_json_array_of_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        let _ = pool.allocate().unwrap();
        let _ = pool.acquire(LeaseId::new(22).unwrap()).unwrap();
        let raw = std::fs::read_to_string(pool.path()).unwrap();
        let ids: Vec<u32> = serde_json::from_str(&raw).unwrap();
        assert_eq!(ids, vec![2, 22]);
    }

    #[test]
    fn pool_exhausts_after_all_slots() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        let mut seen = HashSet::new();
        for _ in 0..POOL_SLOTS {
            let lease = pool.allocate().unwrap();
            assert!((2..=254).contains(&lease.id.get()));
            assert!(seen.insert(lease.id), "duplicate id {}", lease.id);
        }
        assert!(matches!(pool.allocate(), Err(ScredisError::PoolExhausted)));

        pool.release(LeaseId::new(100).unwrap()).unwrap();
        assert_eq!(pool.allocate().unwrap().id.get(), 100);
    }

    #[test]
    fn acquire_rejects_outstanding_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        let id = LeaseId::new(22).unwrap();
        let _ = pool.acquire(id).unwrap();
        assert!(matches!(
            pool.acquire(id),
            Err(ScredisError::AddressInUse { id: 22 })
        ));
    }

    #[test]
    fn release_of_unknown_id_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        let id = LeaseId::new(40).unwrap();
        pool.release(id).unwrap();
        let _ = pool.acquire(id).unwrap();
        pool.release(id).unwrap();
        pool.release(id).unwrap();
        assert!(pool.outstanding().unwrap().is_empty());
    }

    #[test]
    fn bogus_ids_in_record_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        std::fs::write(pool.path(), "[0, 1, 5, 5, 255, -3]").unwrap();
        assert_eq!(pool.outstanding().unwrap(), vec![LeaseId::new(5).unwrap()]);
        assert_eq!(pool.allocate().unwrap().id.get(), 2);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir);
        std::fs::write(pool.path(), "{not json").unwrap();
        assert!(matches!(
            pool.allocate(),
            Err(ScredisError::Serialization { .. })
        ));
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ips.json");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = IpPool::open(path.clone());
                std::thread::spawn(move || {
                    (0..8)
                        .map(|_| pool.allocate().unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 128);
        assert_eq!(IpPool::open(path).outstanding().unwrap().len(), 128);
    }

    #[test]
    fn arena_tracks_occupancy() {
        let id = LeaseId::new(7).unwrap();
        let mut arena = SlotArena::from_ids(&[id]);
        assert!(arena.is_occupied(id));
        assert!(!arena.occupy(id));
        assert!(arena.vacate(id));
        assert!(!arena.vacate(id));
        assert_eq!(arena.first_free().unwrap().get(), 2);
    }
}
