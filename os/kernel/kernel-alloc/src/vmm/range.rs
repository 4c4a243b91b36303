//! Memory ranges and the ordered, non-overlapping list a context keeps them in.
//!
//! List nodes come from a [`RangeNodes`] slab cache over the direct map, so
//! editing a context's ranges under its lock never reaches the global heap
//! or the kernel context.

use crate::cpu::CpuId;
use crate::slab::{DirectMapPageSource, PageSource, SlabCache, SlabError};
use crate::vmm::{VmmError, VmmFlags};
use alloc::sync::Arc;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_vmem::{MmuFlags, PhysMapper};

/// Content provider for file-backed ranges.
///
/// Invoked by the fault path, with the owning context locked, to fill a fresh
/// frame.
pub trait MappedFile: Send + Sync {
    /// Fill `page` with the file content starting at byte `offset`. Bytes past
    /// the end of the file must be zeroed.
    ///
    /// # Errors
    /// When the content cannot be read.
    fn populate(&self, offset: u64, page: &mut [u8]) -> Result<(), PopulateError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("could not read mapped file content at offset {offset:#x}")]
pub struct PopulateError {
    pub offset: u64,
}

/// The file behind a range and the file offset of the range's first byte.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn MappedFile>,
    pub offset: u64,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish_non_exhaustive()
    }
}

/// A `[start, end)` span of one context with uniform flags.
#[derive(Clone, Debug)]
pub struct MemoryRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmmFlags,
    /// Protection every resident page of the range is mapped with, unless it
    /// is temporarily write-protected for copy-on-write.
    pub protection: MmuFlags,
    pub file: Option<FileBacking>,
}

impl MemoryRange {
    #[must_use]
    pub const fn new(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: VmmFlags,
        protection: MmuFlags,
    ) -> Self {
        Self {
            start,
            end,
            flags,
            protection,
            file: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }

    /// Base addresses of every page in the range.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        (self.start.as_u64()..self.end.as_u64())
            .step_by(PAGE_SIZE as usize)
            .map(VirtualAddress::new)
    }

    /// File offset backing `page`, if file-backed.
    #[must_use]
    pub fn file_offset(&self, page: VirtualAddress) -> Option<u64> {
        self.file
            .as_ref()
            .map(|f| f.offset + (page.as_u64() - self.start.as_u64()))
    }

    /// The part of this range inside `[start, end)`, keeping the file offset
    /// consistent.
    fn clipped(&self, start: u64, end: u64) -> Self {
        let lo = start.max(self.start.as_u64());
        let hi = end.min(self.end.as_u64());
        let mut piece = self.clone();
        piece.start = VirtualAddress::new(lo);
        piece.end = VirtualAddress::new(hi);
        if let Some(f) = piece.file.as_mut() {
            f.offset += lo - self.start.as_u64();
        }
        piece
    }
}

/// Range nodes share one magazine pair; callers of the VMM do not name the
/// core they run on.
const NODE_CPU: CpuId = CpuId::BSP;

struct RangeNode {
    range: MemoryRange,
    next: Option<NonNull<RangeNode>>,
}

/// The slab cache every context's range nodes come from.
pub struct RangeNodes<S: PageSource> {
    cache: SlabCache<S>,
}

impl<S: PageSource> RangeNodes<S> {
    /// Create the cache and its first slab.
    ///
    /// # Errors
    /// [`SlabError::OutOfMemory`] if `source` cannot back one slab.
    pub fn new(source: S) -> Result<Self, SlabError> {
        let cache = SlabCache::new(
            "vmm ranges",
            size_of::<RangeNode>(),
            align_of::<RangeNode>(),
            None,
            None,
            source,
            1,
        )?;
        // The first slab stays for the life of the cache.
        let first = cache.allocate(NODE_CPU)?;
        unsafe { cache.free(NODE_CPU, first) };
        Ok(Self { cache })
    }

    fn allocate(
        &self,
        range: MemoryRange,
        next: Option<NonNull<RangeNode>>,
    ) -> Result<NonNull<RangeNode>, VmmError> {
        let node = self.cache.allocate(NODE_CPU)?.cast::<RangeNode>();
        unsafe { node.write(RangeNode { range, next }) };
        Ok(node)
    }

    /// # Safety
    /// `node` must come from [`allocate`](Self::allocate) and be on no list.
    unsafe fn free(&self, node: NonNull<RangeNode>) -> MemoryRange {
        let RangeNode { range, .. } = unsafe { node.read() };
        unsafe { self.cache.free(NODE_CPU, node.cast()) };
        range
    }

    #[cfg(test)]
    fn stats(&self) -> crate::slab::SlabStats {
        self.cache.stats()
    }
}

impl<P: PhysMapper + Send + Sync> RangeNodes<DirectMapPageSource<P>> {
    /// The direct map the nodes live in.
    pub const fn mapper(&self) -> &P {
        self.cache.source().mapper()
    }
}

/// Address-sorted, non-overlapping ranges in a singly linked list.
///
/// Nodes are taken from and returned to the [`RangeNodes`] passed to each
/// edit. Ranges still listed when the map is dropped stay allocated.
pub struct RangeMap {
    head: Option<NonNull<RangeNode>>,
    len: usize,
}

// The map owns its nodes and hands out references only through `&self`.
unsafe impl Send for RangeMap {}

impl RangeMap {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn nodes(&self) -> impl Iterator<Item = NonNull<RangeNode>> + '_ {
        // Listed nodes are live while the map is borrowed.
        core::iter::successors(self.head, |n| unsafe { (*n.as_ptr()).next })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRange> {
        self.nodes().map(|n| unsafe { &(*n.as_ptr()).range })
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn containing(&self, va: VirtualAddress) -> Option<&MemoryRange> {
        self.iter()
            .take_while(|r| r.start <= va)
            .find(|r| r.contains(va))
    }

    /// Whether any range intersects `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.iter()
            .take_while(|r| r.start.as_u64() < end)
            .any(|r| r.end.as_u64() > start)
    }

    /// # Errors
    /// - [`VmmError::Overlap`] if the range intersects an existing one.
    /// - [`VmmError::Slab`] if no node can be allocated.
    pub fn insert<S: PageSource>(
        &mut self,
        range: MemoryRange,
        nodes: &RangeNodes<S>,
    ) -> Result<(), VmmError> {
        let (start, end) = (range.start.as_u64(), range.end.as_u64());
        debug_assert!(start < end);
        if self.overlaps(start, end) {
            return Err(VmmError::Overlap {
                start: range.start,
                end: range.end,
            });
        }

        let mut link = &mut self.head;
        while let Some(node) = *link {
            if unsafe { (*node.as_ptr()).range.start.as_u64() } > start {
                break;
            }
            link = unsafe { &mut (*node.as_ptr()).next };
        }
        let next = *link;
        *link = Some(nodes.allocate(range, next)?);
        self.len += 1;
        Ok(())
    }

    /// First address at or after `hint` (or `lo`) where `size` bytes fit
    /// between existing ranges and below `hi`.
    ///
    /// # Errors
    /// [`VmmError::NoSpace`] when no gap is large enough.
    pub fn find_free(
        &self,
        lo: u64,
        hi: u64,
        hint: Option<u64>,
        size: u64,
    ) -> Result<u64, VmmError> {
        let mut candidate = hint.filter(|h| (lo..hi).contains(h)).unwrap_or(lo);
        for r in self.iter() {
            let (start, end) = (r.start.as_u64(), r.end.as_u64());
            if end <= candidate {
                continue;
            }
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = end;
        }

        match candidate.checked_add(size) {
            Some(end) if end <= hi => Ok(candidate),
            _ => Err(VmmError::NoSpace { size }),
        }
    }

    /// Unlink the range starting exactly at `start`.
    pub fn remove<S: PageSource>(
        &mut self,
        start: VirtualAddress,
        nodes: &RangeNodes<S>,
    ) -> Option<MemoryRange> {
        let mut link = &mut self.head;
        while let Some(node) = *link {
            let at = unsafe { (*node.as_ptr()).range.start };
            if at > start {
                break;
            }
            if at == start {
                *link = unsafe { (*node.as_ptr()).next };
                self.len -= 1;
                return Some(unsafe { nodes.free(node) });
            }
            link = unsafe { &mut (*node.as_ptr()).next };
        }
        None
    }

    /// Cut `[start, end)` out of the map, shrinking or splitting ranges that
    /// straddle its edges, and hand each removed piece to `removed`.
    ///
    /// Returns the number of pieces.
    ///
    /// # Errors
    /// [`VmmError::Slab`] if a split needs a node and none is available; the
    /// map is then unchanged.
    pub fn remove_span<S: PageSource>(
        &mut self,
        start: u64,
        end: u64,
        nodes: &RangeNodes<S>,
        mut removed: impl FnMut(&MemoryRange),
    ) -> Result<usize, VmmError> {
        let mut pieces = 0;
        let mut link = &mut self.head;
        while let Some(node) = *link {
            let ptr = node.as_ptr();
            let (lo, hi) = unsafe { ((*ptr).range.start.as_u64(), (*ptr).range.end.as_u64()) };
            if lo >= end {
                break;
            }
            if hi <= start {
                link = unsafe { &mut (*ptr).next };
                continue;
            }

            let piece = unsafe { (*ptr).range.clipped(start, end) };
            pieces += 1;
            match (lo < start, hi > end) {
                (false, false) => {
                    *link = unsafe { (*ptr).next };
                    self.len -= 1;
                    drop(unsafe { nodes.free(node) });
                    removed(&piece);
                }
                (true, false) => {
                    unsafe { (*ptr).range = (*ptr).range.clipped(lo, start) };
                    removed(&piece);
                    link = unsafe { &mut (*ptr).next };
                }
                (false, true) => {
                    unsafe { (*ptr).range = (*ptr).range.clipped(end, hi) };
                    removed(&piece);
                    break;
                }
                (true, true) => {
                    // The only range touching the span, so nothing has been
                    // cut yet if the tail node cannot be had.
                    let (tail, next) = unsafe { ((*ptr).range.clipped(end, hi), (*ptr).next) };
                    let tail = nodes.allocate(tail, next)?;
                    unsafe {
                        (*ptr).range = (*ptr).range.clipped(lo, start);
                        (*ptr).next = Some(tail);
                    }
                    self.len += 1;
                    removed(&piece);
                    break;
                }
            }
        }
        Ok(pieces)
    }

    /// Empty the map, handing every range to `f` in address order.
    pub fn drain<S: PageSource>(&mut self, nodes: &RangeNodes<S>, mut f: impl FnMut(MemoryRange)) {
        while let Some(node) = self.head {
            self.head = unsafe { (*node.as_ptr()).next };
            self.len -= 1;
            f(unsafe { nodes.free(node) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const LO: u64 = 0x1_0000;
    const HI: u64 = 0x10_0000;

    struct HeapPages;

    impl PageSource for HeapPages {
        fn allocate_pages(&self, bytes: usize) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(bytes, 4096).ok()?;
            NonNull::new(unsafe { alloc_zeroed(layout) })
        }

        unsafe fn release_pages(&self, ptr: NonNull<u8>, bytes: usize) {
            unsafe { dealloc(ptr.as_ptr(), Layout::from_size_align(bytes, 4096).unwrap()) }
        }
    }

    fn nodes() -> RangeNodes<HeapPages> {
        RangeNodes::new(HeapPages).unwrap()
    }

    fn range(start: u64, end: u64) -> MemoryRange {
        MemoryRange::new(
            VirtualAddress::new(start),
            VirtualAddress::new(end),
            VmmFlags::empty(),
            MmuFlags::WRITABLE,
        )
    }

    fn spans(map: &RangeMap) -> Vec<(u64, u64)> {
        map.iter()
            .map(|r| (r.start.as_u64(), r.end.as_u64()))
            .collect()
    }

    fn remove_span(
        map: &mut RangeMap,
        nodes: &RangeNodes<HeapPages>,
        start: u64,
        end: u64,
    ) -> Vec<MemoryRange> {
        let mut removed = Vec::new();
        let n = map
            .remove_span(start, end, nodes, |piece| removed.push(piece.clone()))
            .unwrap();
        assert_eq!(n, removed.len());
        removed
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let nodes = nodes();
        let mut map = RangeMap::new();
        map.insert(range(0x2_0000, 0x3_0000), &nodes).unwrap();
        for (s, e) in [
            (0x2_0000, 0x3_0000),
            (0x1_f000, 0x2_1000),
            (0x2_f000, 0x4_0000),
            (0x2_1000, 0x2_2000),
            (0x1_0000, 0x5_0000),
        ] {
            assert!(
                matches!(map.insert(range(s, e), &nodes), Err(VmmError::Overlap { .. })),
                "{s:#x}..{e:#x}"
            );
        }
        // Touching is fine.
        map.insert(range(0x1_f000, 0x2_0000), &nodes).unwrap();
        map.insert(range(0x3_0000, 0x3_1000), &nodes).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(
            spans(&map),
            [(0x1_f000, 0x2_0000), (0x2_0000, 0x3_0000), (0x3_0000, 0x3_1000)]
        );
        map.drain(&nodes, drop);
    }

    #[test]
    fn find_free_takes_first_gap_after_hint() {
        let nodes = nodes();
        let mut map = RangeMap::new();
        map.insert(range(LO, 0x2_0000), &nodes).unwrap();
        map.insert(range(0x2_1000, 0x3_0000), &nodes).unwrap();

        assert_eq!(map.find_free(LO, HI, None, 0x1000), Ok(0x2_0000));
        assert_eq!(map.find_free(LO, HI, None, 0x2000), Ok(0x3_0000));
        assert_eq!(map.find_free(LO, HI, Some(0x2_8000), 0x1000), Ok(0x3_0000));
        assert_eq!(map.find_free(LO, HI, Some(0x8_0000), 0x1000), Ok(0x8_0000));
        // A hint outside the window falls back to its start.
        assert_eq!(map.find_free(LO, HI, Some(0x1000), 0x1000), Ok(0x2_0000));
        assert_eq!(
            map.find_free(LO, HI, Some(0xF_F000), 0x2000),
            Err(VmmError::NoSpace { size: 0x2000 })
        );
        map.drain(&nodes, drop);
    }

    #[test]
    fn find_free_never_overlaps() {
        let nodes = nodes();
        let mut map = RangeMap::new();
        let mut hint = LO;
        for i in 0..20u64 {
            let size = (i % 3 + 1) * PAGE_SIZE;
            let at = map.find_free(LO, HI, Some(hint), size).unwrap();
            assert!(!map.overlaps(at, at + size));
            map.insert(range(at, at + size), &nodes).unwrap();
            hint = LO + (i * 7 % 5) * PAGE_SIZE;
        }
        let s = spans(&map);
        assert!(s.windows(2).all(|w| w[0].1 <= w[1].0));
        map.drain(&nodes, drop);
    }

    #[test]
    fn removing_the_middle_splits() {
        let nodes = nodes();
        let mut map = RangeMap::new();
        let mut r = range(0x2_0000, 0x2_5000);
        r.file = Some(FileBacking {
            file: Arc::new(Zeroes),
            offset: 0x100_0000,
        });
        map.insert(r, &nodes).unwrap();

        let removed = remove_span(&mut map, &nodes, 0x2_1000, 0x2_3000);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start.as_u64(), 0x2_1000);
        assert_eq!(removed[0].file.as_ref().unwrap().offset, 0x100_1000);

        assert_eq!(spans(&map), [(0x2_0000, 0x2_1000), (0x2_3000, 0x2_5000)]);
        assert_eq!(map.len(), 2);
        let tail = map.containing(VirtualAddress::new(0x2_4000)).unwrap();
        assert_eq!(tail.file_offset(VirtualAddress::new(0x2_4000)), Some(0x100_4000));
        map.drain(&nodes, drop);
    }

    #[test]
    fn removing_across_ranges_shrinks_edges() {
        let nodes = nodes();
        let mut map = RangeMap::new();
        map.insert(range(0x2_0000, 0x2_4000), &nodes).unwrap();
        map.insert(range(0x2_4000, 0x2_6000), &nodes).unwrap();
        map.insert(range(0x3_0000, 0x3_2000), &nodes).unwrap();

        let removed = remove_span(&mut map, &nodes, 0x2_2000, 0x3_1000);
        assert_eq!(removed.len(), 3);
        assert_eq!(spans(&map), [(0x2_0000, 0x2_2000), (0x3_1000, 0x3_2000)]);
        assert!(remove_span(&mut map, &nodes, 0x5_0000, 0x6_0000).is_empty());
        map.drain(&nodes, drop);
    }

    #[test]
    fn nodes_go_back_to_their_cache() {
        let nodes = nodes();
        let mut map = RangeMap::new();
        for i in 0..100u64 {
            let at = LO + 2 * i * PAGE_SIZE;
            map.insert(range(at, at + PAGE_SIZE), &nodes).unwrap();
        }
        assert_eq!(nodes.stats().outstanding, 100);

        let second = map.remove(VirtualAddress::new(LO + 2 * PAGE_SIZE), &nodes);
        assert_eq!(second.map(|r| r.len()), Some(PAGE_SIZE));
        assert!(map.remove(VirtualAddress::new(LO + PAGE_SIZE), &nodes).is_none());
        remove_span(&mut map, &nodes, LO, LO + 20 * PAGE_SIZE);
        assert_eq!(map.len(), 90);
        assert_eq!(nodes.stats().outstanding, 90);

        let mut drained = 0;
        map.drain(&nodes, |_| drained += 1);
        assert_eq!(drained, 90);
        assert_eq!(map.len(), 0);
        assert_eq!(nodes.stats().outstanding, 0);
    }

    struct Zeroes;

    impl MappedFile for Zeroes {
        fn populate(&self, _offset: u64, page: &mut [u8]) -> Result<(), PopulateError> {
            page.fill(0);
            Ok(())
        }
    }
}
