//! The slab layer: page-sized chunks carved into equal object slots.
//!
//! All bookkeeping lives inside the slabs themselves, so this layer never
//! touches the global heap:
//!
//! ```text
//! base                                               base + slab_size
//! ├────────┬────────┬─────┬──────────┬──────────────┬────────┬─────┤
//! │ slot 0 │ slot 1 │ ... │ slot n-1 │ next[0..n]   │ header │ pad │
//! └────────┴────────┴─────┴──────────┴──────────────┴────────┴─────┘
//! ```
//!
//! `next[i]` chains the free slots starting at the header's `free_head`; a
//! slot in use holds [`IN_USE`] instead. Headers link the slabs of a cache
//! into its full, partial and free lists.

use crate::slab::PageSource;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::{SLAB_MAX_FREE, SLAB_MIN_OBJECTS};
use kernel_memory_addresses::{PAGE_SIZE, page_align_up};

/// Ends a slab's free-slot chain.
const FREE_END: u32 = u32::MAX;
/// Marks a slot that is handed out.
const IN_USE: u32 = u32::MAX - 1;

/// Room for the header and the padding in front of it and the index array.
const HEADER_RESERVE: usize =
    size_of::<SlabHeader>() + align_of::<SlabHeader>() + align_of::<u32>();

/// Owner tags of caches; zero marks a released slab.
static NEXT_TAG: AtomicUsize = AtomicUsize::new(1);

/// Object and slab sizes of one cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// Requested object size.
    pub size: usize,
    pub align: usize,
    /// Size rounded up to the alignment; the stride between slots.
    pub real_size: usize,
    /// Bytes per slab, a whole number of pages.
    pub slab_size: usize,
    /// Slots per slab.
    pub objects: usize,
    /// Offset of the free-slot index array.
    links: usize,
    /// Offset of the [`SlabHeader`].
    header: usize,
}

impl Geometry {
    /// Lay out slabs holding at least [`SLAB_MIN_OBJECTS`] objects of `size`
    /// bytes at `align`, plus their in-slab bookkeeping.
    ///
    /// `None` for a zero size or one that does not fit the address space.
    pub fn new(size: usize, align: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let real_size = size.checked_next_multiple_of(align)?;
        let per_object = real_size.checked_add(size_of::<u32>())?;
        let bytes = per_object
            .checked_mul(SLAB_MIN_OBJECTS)?
            .checked_add(HEADER_RESERVE)?;
        let slab_size = usize::try_from(page_align_up(u64::try_from(bytes).ok()?)).ok()?;
        if slab_size < bytes {
            return None;
        }

        let objects = (slab_size - HEADER_RESERVE) / per_object;
        if !u32::try_from(objects).is_ok_and(|n| n < IN_USE) {
            return None;
        }
        let links = (objects * real_size).next_multiple_of(align_of::<u32>());
        let header =
            (links + objects * size_of::<u32>()).next_multiple_of(align_of::<SlabHeader>());
        debug_assert!(header + size_of::<SlabHeader>() <= slab_size);

        Some(Self {
            size,
            align,
            real_size,
            slab_size,
            objects,
            links,
            header,
        })
    }

    /// Bytes of a slab covered by object slots.
    const fn span(&self) -> usize {
        self.objects * self.real_size
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Occupancy {
    Free,
    Partial,
    Full,
}

impl Occupancy {
    fn of(in_use: u32, geo: &Geometry) -> Self {
        match in_use as usize {
            0 => Self::Free,
            n if n == geo.objects => Self::Full,
            _ => Self::Partial,
        }
    }
}

/// Bookkeeping at the tail of every slab.
#[repr(C)]
struct SlabHeader {
    /// Tag of the owning cache's [`SlabLists`].
    owner: usize,
    base: NonNull<u8>,
    next: Option<NonNull<SlabHeader>>,
    prev: Option<NonNull<SlabHeader>>,
    in_use: u32,
    free_head: u32,
    occupancy: Occupancy,
}

impl SlabHeader {
    fn links(&self, geo: &Geometry) -> NonNull<u32> {
        // The index array lies within the slab.
        unsafe { self.base.add(geo.links).cast() }
    }
}

/// An intrusive list of slab headers.
struct SlabList {
    head: Option<NonNull<SlabHeader>>,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// # Safety
    /// `hdr` must be a live header on no list.
    unsafe fn push(&mut self, hdr: NonNull<SlabHeader>) {
        unsafe {
            let h = &mut *hdr.as_ptr();
            h.prev = None;
            h.next = self.head;
            if let Some(old) = self.head {
                (*old.as_ptr()).prev = Some(hdr);
            }
        }
        self.head = Some(hdr);
        self.len += 1;
    }

    /// # Safety
    /// `hdr` must be a live header on this list.
    unsafe fn unlink(&mut self, hdr: NonNull<SlabHeader>) {
        unsafe {
            let (prev, next) = {
                let h = &*hdr.as_ptr();
                (h.prev, h.next)
            };
            match prev {
                Some(p) => (*p.as_ptr()).next = next,
                None => self.head = next,
            }
            if let Some(n) = next {
                (*n.as_ptr()).prev = prev;
            }
            let h = &mut *hdr.as_ptr();
            h.next = None;
            h.prev = None;
        }
        self.len -= 1;
    }

    fn iter(&self) -> impl Iterator<Item = NonNull<SlabHeader>> + '_ {
        // Headers on a list are live while the list is borrowed.
        core::iter::successors(self.head, |h| unsafe { h.as_ref().next })
    }
}

/// Every slab of a cache, filed by occupancy.
///
/// ### Invariants
/// - Each live slab is on exactly one of `full`, `partial`, `free`.
/// - `full` slabs have no free slot; `free` slabs have no slot in use.
/// - At most [`SLAB_MAX_FREE`] slabs sit in `free`.
pub struct SlabLists {
    tag: usize,
    full: SlabList,
    partial: SlabList,
    free: SlabList,
    created: usize,
}

// The lists own their slabs; headers are reached only through `&mut self`.
unsafe impl Send for SlabLists {}

impl SlabLists {
    pub fn new() -> Self {
        Self {
            tag: NEXT_TAG.fetch_add(1, Ordering::Relaxed),
            full: SlabList::new(),
            partial: SlabList::new(),
            free: SlabList::new(),
            created: 0,
        }
    }

    const fn list_mut(&mut self, occupancy: Occupancy) -> &mut SlabList {
        match occupancy {
            Occupancy::Free => &mut self.free,
            Occupancy::Partial => &mut self.partial,
            Occupancy::Full => &mut self.full,
        }
    }

    fn refile(&mut self, hdr: NonNull<SlabHeader>, to: Occupancy) {
        let from = unsafe { hdr.as_ref().occupancy };
        if from == to {
            return;
        }
        unsafe {
            self.list_mut(from).unlink(hdr);
            (*hdr.as_ptr()).occupancy = to;
            self.list_mut(to).push(hdr);
        }
    }

    fn grow<S: PageSource>(
        &mut self,
        geo: &Geometry,
        source: &S,
    ) -> Option<NonNull<SlabHeader>> {
        let base = source.allocate_pages(geo.slab_size)?;
        let hdr = unsafe { base.add(geo.header).cast::<SlabHeader>() };
        unsafe {
            hdr.write(SlabHeader {
                owner: self.tag,
                base,
                next: None,
                prev: None,
                in_use: 0,
                free_head: 0,
                occupancy: Occupancy::Free,
            });
            let links = hdr.as_ref().links(geo);
            for i in 0..geo.objects {
                #[allow(clippy::cast_possible_truncation)]
                let next = if i + 1 == geo.objects { FREE_END } else { i as u32 + 1 };
                links.add(i).write(next);
            }
            self.free.push(hdr);
        }
        self.created += 1;
        Some(hdr)
    }

    fn release<S: PageSource>(&mut self, hdr: NonNull<SlabHeader>, geo: &Geometry, source: &S) {
        let (occupancy, base) = unsafe {
            let h = hdr.as_ref();
            (h.occupancy, h.base)
        };
        unsafe {
            self.list_mut(occupancy).unlink(hdr);
            (*hdr.as_ptr()).owner = 0;
            source.release_pages(base, geo.slab_size);
        }
    }

    /// The slab holding `obj`, if it is one of ours.
    ///
    /// Single-page slabs are found from the object's page; larger ones by
    /// walking the lists.
    fn find(&self, obj: NonNull<u8>, geo: &Geometry) -> Option<NonNull<SlabHeader>> {
        let addr = obj.as_ptr() as usize;
        let holds = |h: NonNull<SlabHeader>| {
            let base = unsafe { h.as_ref().base.as_ptr() as usize };
            addr >= base && addr - base < geo.span()
        };

        #[allow(clippy::cast_possible_truncation)]
        let page = PAGE_SIZE as usize;
        if geo.slab_size == page {
            let base = addr & !(page - 1);
            let hdr = obj.as_ptr().with_addr(base + geo.header).cast::<SlabHeader>();
            // The header slot of the object's page; only trusted once the
            // owner tag matches.
            let owner = unsafe { (&raw const (*hdr).owner).read() };
            if owner != self.tag {
                return None;
            }
            let hdr = NonNull::new(hdr)?;
            let at_base = unsafe { hdr.as_ref().base.as_ptr() as usize } == base;
            return (at_base && holds(hdr)).then_some(hdr);
        }

        self.partial
            .iter()
            .chain(self.full.iter())
            .chain(self.free.iter())
            .find(|&h| holds(h))
    }

    /// Take one slot, preferring partially used slabs, then free ones, and
    /// only then growing the cache.
    pub fn allocate<S: PageSource>(&mut self, geo: &Geometry, source: &S) -> Option<NonNull<u8>> {
        let hdr = match self.partial.head.or(self.free.head) {
            Some(hdr) => hdr,
            None => self.grow(geo, source)?,
        };

        let (obj, occupancy) = unsafe {
            let h = &mut *hdr.as_ptr();
            let index = h.free_head;
            assert!(
                index != FREE_END,
                "slab {:p} listed as allocatable but has no free slot",
                h.base
            );
            let slot = h.links(geo).add(index as usize);
            h.free_head = slot.read();
            slot.write(IN_USE);
            h.in_use += 1;
            (
                h.base.add(index as usize * geo.real_size),
                Occupancy::of(h.in_use, geo),
            )
        };
        self.refile(hdr, occupancy);
        Some(obj)
    }

    /// Return the slot at `obj`. Releases the slab to `source` when more than
    /// [`SLAB_MAX_FREE`] slabs are completely free.
    ///
    /// # Panics
    /// If `obj` is not a slot start of this cache, or the slot is already free.
    pub fn free<S: PageSource>(&mut self, obj: NonNull<u8>, geo: &Geometry, source: &S) {
        let Some(hdr) = self.find(obj, geo) else {
            panic!("freeing {obj:p} which belongs to no slab of this cache");
        };

        let occupancy = unsafe {
            let h = &mut *hdr.as_ptr();
            let offset = obj.as_ptr() as usize - h.base.as_ptr() as usize;
            assert!(
                offset.is_multiple_of(geo.real_size),
                "freeing {obj:p} which is not the start of an object"
            );
            #[allow(clippy::cast_possible_truncation)]
            let index = (offset / geo.real_size) as u32;
            let slot = h.links(geo).add(index as usize);
            assert!(slot.read() == IN_USE, "double free of slab object {obj:p}");
            slot.write(h.free_head);
            h.free_head = index;
            h.in_use -= 1;
            Occupancy::of(h.in_use, geo)
        };

        self.refile(hdr, occupancy);
        if occupancy == Occupancy::Free && self.free.len > SLAB_MAX_FREE {
            self.release(hdr, geo, source);
        }
    }

    /// Release every free slab. Returns the number of slabs that still hold
    /// objects and were left alone.
    pub fn release_all<S: PageSource>(&mut self, geo: &Geometry, source: &S) -> usize {
        while let Some(hdr) = self.free.head {
            self.release(hdr, geo, source);
        }
        self.full.len + self.partial.len
    }

    /// `(full, partial, free)` slab counts.
    pub const fn counts(&self) -> (usize, usize, usize) {
        (self.full.len, self.partial.len, self.free.len)
    }

    /// Slabs obtained from the page source over the cache's lifetime.
    pub const fn created(&self) -> usize {
        self.created
    }
}
