//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, physical frame numbers
//! and virtual page bases used by the memory-management core.
//!
//! ## Overview
//!
//! The types prevent mixing virtual and physical addresses at compile time
//! while remaining zero-cost wrappers around `u64` values:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`PhysicalFrame`] | The number of a [`PAGE_SIZE`] frame of physical memory. |
//! | [`VirtualAddress`] | A byte address in some address space. |
//! | [`VirtualPage`] | The page-aligned base of a virtual page. |
//!
//! Only the 4 KiB base granularity is modeled. The allocators never hand out
//! larger pages.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! let frame = pa.frame();
//! assert_eq!(frame.number(), 0x102);
//! assert_eq!(frame.base().as_u64(), 0x0010_2000);
//!
//! let va = VirtualAddress::new(0x4000_1234);
//! assert_eq!(va.page().base().as_u64(), 0x4000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//! ```
//!
//! ## Alignment Helpers
//!
//! [`align_down`] and [`align_up`] work on any power-of-two alignment;
//! [`page_align_down`] and [`page_align_up`] fix it to [`PAGE_SIZE`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod physical_address;
mod physical_frame;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_frame::PhysicalFrame;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Size of one page / frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to `align`.
///
/// `align` must be a power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to `align`.
///
/// `align` must be a power of two. Saturates at the highest aligned value
/// instead of wrapping.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}

/// Align `x` down to the page size.
#[inline]
#[must_use]
pub const fn page_align_down(x: u64) -> u64 {
    align_down(x, PAGE_SIZE)
}

/// Align `x` up to the page size.
#[inline]
#[must_use]
pub const fn page_align_up(x: u64) -> u64 {
    align_up(x, PAGE_SIZE)
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    page_align_up(bytes) >> PAGE_SHIFT
}
