use core::ptr::NonNull;
use kernel_info::memory::MAGAZINE_SIZE;

/// A fixed-capacity stack of constructed objects.
///
/// Magazines move between a core's `loaded`/`previous` slots and the cache's
/// depots. They never allocate; the set of magazines of a cache is fixed at
/// creation.
pub struct Magazine {
    rounds: [Option<NonNull<u8>>; MAGAZINE_SIZE],
    len: usize,
}

// Rounds are exclusively owned by whoever holds the magazine.
unsafe impl Send for Magazine {}

impl Magazine {
    pub const fn new() -> Self {
        Self {
            rounds: [None; MAGAZINE_SIZE],
            len: 0,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.len == MAGAZINE_SIZE
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        self.rounds[self.len].take()
    }

    /// Push `obj`, handing it back if the magazine is full.
    pub fn push(&mut self, obj: NonNull<u8>) -> Result<(), NonNull<u8>> {
        if self.len == MAGAZINE_SIZE {
            return Err(obj);
        }
        self.rounds[self.len] = Some(obj);
        self.len += 1;
        Ok(())
    }
}

/// A core's two magazines.
///
/// Keeping a second magazine means a core alternating between allocation
/// and free at a magazine boundary does not hit the depot on every call.
pub struct CpuMagazines {
    pub loaded: Option<Magazine>,
    pub previous: Option<Magazine>,
}

impl CpuMagazines {
    pub const fn new() -> Self {
        Self {
            loaded: None,
            previous: None,
        }
    }

    /// Rounds held by this core.
    pub fn rounds(&self) -> usize {
        self.loaded.as_ref().map_or(0, Magazine::len)
            + self.previous.as_ref().map_or(0, Magazine::len)
    }
}
