//! # Slab Allocator
//!
//! Fixed-size object caches in the style of Bonwick's slab allocator, with a
//! per-core magazine layer on top.
//!
//! ```text
//!            allocate / free
//!                  │
//!   ┌──────────────▼──────────────┐  per core, IRQ-masked spin lock
//!   │ loaded magazine │ previous  │
//!   └──────────────┬──────────────┘
//!                  │ exchange whole magazines
//!   ┌──────────────▼──────────────┐  per cache, spin locks
//!   │  full depot  │  empty depot │
//!   └──────────────┬──────────────┘
//!                  │ one object at a time
//!   ┌──────────────▼──────────────┐  per cache, sleeping mutex
//!   │ full │ partial │ free slabs │
//!   └──────────────┬──────────────┘
//!                  │ whole slabs
//!              PageSource
//! ```
//!
//! Objects in magazines are *constructed*: the constructor runs when an
//! object leaves the slab layer and the destructor when it goes back. The
//! fast path therefore hands out ready objects without touching the slab
//! lists or running any hook.
//!
//! All magazines are created with the cache; the fast path never allocates
//! and never sleeps, so [`SlabCache::allocate_fast_only`] may be called where
//! sleeping is forbidden.

mod magazine;
mod slab;
mod source;

pub use crate::slab::source::{DirectMapPageSource, PageSource};

use crate::cpu::CpuId;
use crate::slab::magazine::{CpuMagazines, Magazine};
use crate::slab::slab::{Geometry, SlabLists};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::{DEPOT_MAGAZINES_PER_CPU, MAX_CPUS};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_sync::{SleepMutex, SpinLock};

/// Constructor or destructor run on an object as it leaves or enters the
/// slab layer.
pub type ObjectHook = fn(NonNull<u8>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SlabError {
    #[error("invalid object size {0}")]
    InvalidSize(usize),
    #[error("invalid object alignment {0}")]
    InvalidAlignment(usize),
    #[error("invalid core count {0}")]
    InvalidCpuCount(usize),
    #[error("the page source is exhausted")]
    OutOfMemory,
    #[error("no constructed object is cached for this core")]
    FastPathExhausted,
}

/// A point-in-time view of a cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SlabStats {
    pub object_size: usize,
    pub real_size: usize,
    pub slab_size: usize,
    pub objects_per_slab: usize,
    pub full_slabs: usize,
    pub partial_slabs: usize,
    pub free_slabs: usize,
    /// Slabs ever obtained from the page source.
    pub slabs_created: usize,
    /// Objects handed out and not yet freed.
    pub outstanding: usize,
    /// Constructed objects parked in magazines.
    pub cached: usize,
}

/// A cache of equally sized objects.
pub struct SlabCache<S: PageSource> {
    name: &'static str,
    geo: Geometry,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    source: S,
    cpus: Box<[SpinLock<CpuMagazines>]>,
    full: SpinLock<Vec<Magazine>>,
    empty: SpinLock<Vec<Magazine>>,
    slabs: SleepMutex<SlabLists>,
    outstanding: AtomicUsize,
}

impl<S: PageSource> SlabCache<S> {
    /// Create a cache for objects of `size` bytes aligned to `align`.
    ///
    /// An alignment of zero means byte alignment. `cpus` sizes the per-core
    /// magazine table; [`CpuId`]s passed later must be below it.
    ///
    /// # Errors
    /// - [`SlabError::InvalidSize`] for zero or unrepresentable sizes.
    /// - [`SlabError::InvalidAlignment`] unless `align` is a power of two no
    ///   larger than a page.
    /// - [`SlabError::InvalidCpuCount`] for zero or more than [`MAX_CPUS`].
    pub fn new(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        source: S,
        cpus: usize,
    ) -> Result<Self, SlabError> {
        let align = align.max(1);
        #[allow(clippy::cast_possible_truncation)]
        let page = PAGE_SIZE as usize;
        if !align.is_power_of_two() || align > page {
            return Err(SlabError::InvalidAlignment(align));
        }
        if cpus == 0 || cpus > MAX_CPUS {
            return Err(SlabError::InvalidCpuCount(cpus));
        }
        let geo = Geometry::new(size, align).ok_or(SlabError::InvalidSize(size))?;

        let magazines = DEPOT_MAGAZINES_PER_CPU * cpus;
        let mut empty = Vec::with_capacity(magazines);
        empty.extend((0..magazines).map(|_| Magazine::new()));

        log::debug!(
            "slab cache {name}: {} byte objects, {} per {} byte slab, {} magazines",
            geo.real_size,
            geo.objects,
            geo.slab_size,
            magazines
        );

        Ok(Self {
            name,
            geo,
            ctor,
            dtor,
            source,
            cpus: (0..cpus)
                .map(|_| SpinLock::new(CpuMagazines::new()))
                .collect(),
            full: SpinLock::new(Vec::with_capacity(magazines)),
            empty: SpinLock::new(empty),
            slabs: SleepMutex::new(SlabLists::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Requested object size.
    #[inline]
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.geo.size
    }

    #[inline]
    #[must_use]
    pub const fn align(&self) -> usize {
        self.geo.align
    }

    #[inline]
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    fn magazines(&self, cpu: CpuId) -> &SpinLock<CpuMagazines> {
        let Some(m) = self.cpus.get(cpu.index()) else {
            panic!(
                "slab cache {}: {cpu:?} outside the {} cores it was created for",
                self.name,
                self.cpus.len()
            );
        };
        m
    }

    /// Allocate one constructed object.
    ///
    /// # Errors
    /// [`SlabError::OutOfMemory`] when a new slab is needed and the page
    /// source is exhausted.
    ///
    /// # Panics
    /// If `cpu` is not below the core count the cache was created with.
    pub fn allocate(&self, cpu: CpuId) -> Result<NonNull<u8>, SlabError> {
        if let Some(obj) = self.allocate_fast(cpu) {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }

        let obj = self
            .slabs
            .lock()
            .allocate(&self.geo, &self.source)
            .ok_or_else(|| {
                log::warn!("slab cache {}: out of memory", self.name);
                SlabError::OutOfMemory
            })?;
        if let Some(ctor) = self.ctor {
            ctor(obj);
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(obj)
    }

    /// Allocate from the magazine layer only; never takes the slab lock and
    /// never sleeps.
    ///
    /// # Errors
    /// [`SlabError::FastPathExhausted`] if neither this core nor the depot
    /// holds a constructed object.
    pub fn allocate_fast_only(&self, cpu: CpuId) -> Result<NonNull<u8>, SlabError> {
        let obj = self
            .allocate_fast(cpu)
            .ok_or(SlabError::FastPathExhausted)?;
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(obj)
    }

    fn allocate_fast(&self, cpu: CpuId) -> Option<NonNull<u8>> {
        let mut guard = self.magazines(cpu).lock_irq();
        let m = &mut *guard;

        if let Some(obj) = m.loaded.as_mut().and_then(Magazine::pop) {
            return Some(obj);
        }

        if m.previous.as_ref().is_some_and(|p| !p.is_empty()) {
            core::mem::swap(&mut m.loaded, &mut m.previous);
            return m.loaded.as_mut().and_then(Magazine::pop);
        }

        // Both magazines are empty (or absent): trade for a full one.
        let full = self.full.lock_irq().pop()?;
        if let Some(previous) = m.previous.take() {
            self.empty.lock_irq().push(previous);
        }
        m.previous = m.loaded.replace(full);
        m.loaded.as_mut().and_then(Magazine::pop)
    }

    /// Return `obj` to the cache.
    ///
    /// # Safety
    /// `obj` must come from [`allocate`](Self::allocate) or
    /// [`allocate_fast_only`](Self::allocate_fast_only) of this cache, must not
    /// have been freed since, and must not be used afterwards.
    ///
    /// # Panics
    /// If the object reaches the slab layer and turns out not to belong to
    /// this cache or to be free already.
    pub unsafe fn free(&self, cpu: CpuId, obj: NonNull<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if let Err(obj) = self.free_fast(cpu, obj) {
            self.free_slow(obj);
        }
    }

    fn free_fast(&self, cpu: CpuId, obj: NonNull<u8>) -> Result<(), NonNull<u8>> {
        let mut guard = self.magazines(cpu).lock_irq();
        let m = &mut *guard;

        let obj = match m.loaded.as_mut() {
            Some(loaded) => match loaded.push(obj) {
                Ok(()) => return Ok(()),
                Err(obj) => obj,
            },
            None => obj,
        };

        if m.previous.as_ref().is_some_and(|p| !p.is_full()) {
            core::mem::swap(&mut m.loaded, &mut m.previous);
            if let Some(loaded) = m.loaded.as_mut() {
                return loaded.push(obj);
            }
        }

        // Both magazines are full (or absent): trade for an empty one.
        let Some(empty) = self.empty.lock_irq().pop() else {
            return Err(obj);
        };
        if let Some(previous) = m.previous.take() {
            if previous.is_empty() {
                self.empty.lock_irq().push(previous);
            } else {
                self.full.lock_irq().push(previous);
            }
        }
        m.previous = m.loaded.replace(empty);
        match m.loaded.as_mut() {
            Some(loaded) => loaded.push(obj),
            None => Err(obj),
        }
    }

    fn free_slow(&self, obj: NonNull<u8>) {
        if let Some(dtor) = self.dtor {
            dtor(obj);
        }
        self.slabs.lock().free(obj, &self.geo, &self.source);
    }

    /// Occupancy counters.
    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let (full_slabs, partial_slabs, free_slabs, slabs_created) = {
            let slabs = self.slabs.lock();
            let (f, p, e) = slabs.counts();
            (f, p, e, slabs.created())
        };
        let in_cpus: usize = self.cpus.iter().map(|c| c.lock_irq().rounds()).sum();
        let in_depot = self.full.lock_irq().iter().map(Magazine::len).sum::<usize>();

        SlabStats {
            object_size: self.geo.size,
            real_size: self.geo.real_size,
            slab_size: self.geo.slab_size,
            objects_per_slab: self.geo.objects,
            full_slabs,
            partial_slabs,
            free_slabs,
            slabs_created,
            outstanding: self.outstanding.load(Ordering::Relaxed),
            cached: in_cpus + in_depot,
        }
    }

    /// Log the cache's state.
    pub fn dump(&self) {
        let s = self.stats();
        log::info!(
            "slab cache {}: size {} (real {}), {} per {} byte slab",
            self.name,
            s.object_size,
            s.real_size,
            s.objects_per_slab,
            s.slab_size
        );
        log::info!(
            "  slabs: {} full, {} partial, {} free ({} created); objects: {} out, {} cached",
            s.full_slabs,
            s.partial_slabs,
            s.free_slabs,
            s.slabs_created,
            s.outstanding,
            s.cached
        );
    }

    /// Tear the cache down, returning all of its pages.
    ///
    /// # Panics
    /// If any object is still allocated.
    pub fn destroy(self) {
        let outstanding = self.outstanding.load(Ordering::Acquire);
        if outstanding != 0 {
            log::error!(
                "destroying slab cache {} with {outstanding} live object(s)",
                self.name
            );
            self.dump();
            panic!("slab cache destroyed with live objects");
        }
        log::debug!("destroying slab cache {}", self.name);
    }

    /// Push every magazined object, on every core and in the depot, back
    /// through the slab layer. Returns how many objects were returned.
    ///
    /// Meant for memory pressure: afterwards every allocation takes the slow
    /// path until magazines fill up again, and slabs emptied here beyond the
    /// retained free ones go back to the page source.
    pub fn reap(&self) -> usize {
        let mut returned = 0;
        loop {
            // The depot lock is dropped before the slab lock is taken.
            let Some(magazine) = self.full.lock_irq().pop() else {
                break;
            };
            returned += self.empty_magazine(magazine);
        }
        for cpu in self.cpus.iter() {
            let (loaded, previous) = {
                let mut m = cpu.lock_irq();
                (m.loaded.take(), m.previous.take())
            };
            for magazine in [loaded, previous].into_iter().flatten() {
                returned += self.empty_magazine(magazine);
            }
        }
        if returned != 0 {
            log::debug!("slab cache {}: reaped {returned} object(s)", self.name);
        }
        returned
    }

    /// Free every round of `magazine` and park it in the empty depot.
    fn empty_magazine(&self, mut magazine: Magazine) -> usize {
        let mut rounds = 0;
        while let Some(obj) = magazine.pop() {
            self.free_slow(obj);
            rounds += 1;
        }
        self.empty.lock_irq().push(magazine);
        rounds
    }

    /// Reap the magazines and release all free slabs.
    fn reclaim(&mut self) {
        self.reap();
        let live = self.slabs.get_mut().release_all(&self.geo, &self.source);
        if live != 0 {
            log::warn!(
                "slab cache {}: leaking {live} slab(s) with live objects",
                self.name
            );
        }
    }
}

impl<S: PageSource> Drop for SlabCache<S> {
    fn drop(&mut self) {
        self.reclaim();
    }
}

impl<S: PageSource> fmt::Debug for SlabCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabCache")
            .field("name", &self.name)
            .field("geometry", &self.geo)
            .field("cpus", &self.cpus.len())
            .finish_non_exhaustive()
    }
}
