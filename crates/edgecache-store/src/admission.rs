//! Disk admission control.
//!
//! Admission compares device free space, minus the bytes promised to
//! downloads still in flight, against a safety threshold. Checking and
//! reserving happen in one compare-and-swap on the in-flight total, so two
//! concurrent downloads cannot both be admitted into the same headroom.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of device free space.
pub trait SpaceProbe: Send + Sync {
    fn free_bytes(&self) -> io::Result<u64>;
}

/// Free space of the filesystem holding `path`, as seen by unprivileged users.
#[derive(Debug, Clone)]
pub struct StatvfsProbe {
    path: PathBuf,
}

impl StatvfsProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpaceProbe for StatvfsProbe {
    fn free_bytes(&self) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.path).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(free)
    }
}

/// A settable free-space figure, for tests and dry runs.
#[derive(Debug, Default)]
pub struct FixedSpace(AtomicU64);

impl FixedSpace {
    pub fn new(bytes: u64) -> Self {
        Self(AtomicU64::new(bytes))
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpace {
    fn free_bytes(&self) -> io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

pub struct DiskAdmission {
    probe: Arc<dyn SpaceProbe>,
    in_flight: AtomicU64,
}

impl std::fmt::Debug for DiskAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskAdmission")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl DiskAdmission {
    pub fn new(probe: Arc<dyn SpaceProbe>) -> Self {
        Self {
            probe,
            in_flight: AtomicU64::new(0),
        }
    }

    /// Bytes currently promised to in-flight downloads.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn add_in_flight(&self, bytes: u64) {
        self.in_flight.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Saturates at zero so an unmatched remove cannot wrap the total.
    pub fn remove_in_flight(&self, bytes: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Advisory snapshot: free space minus in-flight bytes, after taking
    /// `candidate` out, must stay at or above `threshold`.
    pub fn has_available_space(&self, threshold: u64, candidate: Option<u64>) -> io::Result<bool> {
        let free = self.probe.free_bytes()?;
        Ok(fits(free, self.in_flight(), threshold, candidate.unwrap_or(0)))
    }

    /// Check headroom and, if granted, add `size` to the in-flight total in
    /// the same atomic step. The returned [`Reservation`] gives the bytes
    /// back when dropped.
    pub fn reserve(
        self: &Arc<Self>,
        threshold: u64,
        size: Option<u64>,
    ) -> io::Result<Option<Reservation>> {
        let bytes = size.unwrap_or(0);
        if !self.try_add(threshold, bytes)? {
            return Ok(None);
        }
        Ok(Some(Reservation {
            admission: Arc::clone(self),
            bytes,
        }))
    }

    fn try_add(&self, threshold: u64, bytes: u64) -> io::Result<bool> {
        let free = self.probe.free_bytes()?;
        let mut current = self.in_flight();
        loop {
            if !fits(free, current, threshold, bytes) {
                return Ok(false);
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
    }
}

fn fits(free: u64, in_flight: u64, threshold: u64, candidate: u64) -> bool {
    free.saturating_sub(in_flight)
        .checked_sub(candidate)
        .is_some_and(|left| left >= threshold)
}

/// In-flight bytes held for one download.
#[derive(Debug)]
pub struct Reservation {
    admission: Arc<DiskAdmission>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Extend the reservation by `additional` bytes if headroom allows.
    pub fn grow(&mut self, threshold: u64, additional: u64) -> io::Result<bool> {
        if !self.admission.try_add(threshold, additional)? {
            return Ok(false);
        }
        self.bytes += additional;
        Ok(true)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.admission.remove_in_flight(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    fn admission(free: u64) -> Arc<DiskAdmission> {
        Arc::new(DiskAdmission::new(Arc::new(FixedSpace::new(free))))
    }

    #[test]
    fn test_admits_when_headroom_remains() {
        let adm = admission(GIB);
        assert!(adm.has_available_space(512 * MIB, Some(300 * MIB)).unwrap());
        assert!(adm.has_available_space(512 * MIB, None).unwrap());
    }

    #[test]
    fn test_in_flight_bytes_count_against_free_space() {
        let adm = admission(GIB);
        adm.add_in_flight(512 * MIB);
        assert!(!adm.has_available_space(512 * MIB, Some(300 * MIB)).unwrap());
        assert!(adm.has_available_space(512 * MIB, None).unwrap());

        adm.remove_in_flight(512 * MIB);
        assert_eq!(adm.in_flight(), 0);
        assert!(adm.has_available_space(512 * MIB, Some(300 * MIB)).unwrap());
    }

    #[test]
    fn test_exact_threshold_is_admitted() {
        let adm = admission(GIB);
        assert!(adm.has_available_space(GIB - 100, Some(100)).unwrap());
        assert!(!adm.has_available_space(GIB - 100, Some(101)).unwrap());
    }

    #[test]
    fn test_candidate_larger_than_free_space_is_denied() {
        let adm = admission(100);
        assert!(!adm.has_available_space(0, Some(101)).unwrap());
    }

    #[test]
    fn test_remove_saturates() {
        let adm = admission(GIB);
        adm.add_in_flight(10);
        adm.remove_in_flight(20);
        assert_eq!(adm.in_flight(), 0);
    }

    #[test]
    fn test_reservation_is_released_on_drop() {
        let adm = admission(GIB);
        {
            let r = adm.reserve(512 * MIB, Some(300 * MIB)).unwrap().unwrap();
            assert_eq!(r.bytes(), 300 * MIB);
            assert_eq!(adm.in_flight(), 300 * MIB);
        }
        assert_eq!(adm.in_flight(), 0);
    }

    #[test]
    fn test_second_reservation_cannot_share_headroom() {
        let adm = admission(GIB);
        let first = adm.reserve(512 * MIB, Some(300 * MIB)).unwrap();
        assert!(first.is_some());
        assert!(adm.reserve(512 * MIB, Some(300 * MIB)).unwrap().is_none());

        drop(first);
        assert!(adm.reserve(512 * MIB, Some(300 * MIB)).unwrap().is_some());
    }

    #[test]
    fn test_reservation_grows_until_headroom_is_gone() {
        let adm = admission(GIB);
        let mut r = adm.reserve(512 * MIB, None).unwrap().unwrap();
        assert!(r.grow(512 * MIB, 256 * MIB).unwrap());
        assert!(r.grow(512 * MIB, 256 * MIB).unwrap());
        assert!(!r.grow(512 * MIB, 1).unwrap());
        assert_eq!(adm.in_flight(), 512 * MIB);

        drop(r);
        assert_eq!(adm.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let adm = admission(GIB);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let adm = Arc::clone(&adm);
                std::thread::spawn(move || adm.reserve(0, Some(100 * MIB)).unwrap())
            })
            .collect();

        let granted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(granted.len(), 10);
        assert_eq!(adm.in_flight(), 1000 * MIB);
    }

    #[test]
    fn test_statvfs_probe_reports_space() {
        let probe = StatvfsProbe::new(std::env::temp_dir());
        assert!(probe.free_bytes().unwrap() > 0);
    }
}
