//! # Kernel Memory Configuration and Boot Interface
//!
//! This crate is the authoritative source for the memory-management core's
//! compile-time configuration: the virtual address space layout, allocator
//! tuning constants, and the boot-time physical memory region list handed to
//! the frame allocator.
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! * **Region List**: [`MemoryRegion`](boot::MemoryRegion) spans tagged with a
//!   [`MemoryRegionKind`](boot::MemoryRegionKind), as discovered by the loader.
//!   Only [`Available`](boot::MemoryRegionKind::Available) spans ever become
//!   allocatable.
//!
//! ### Memory Layout ([`memory`])
//! * **User Window**: the span in which user contexts place ranges and in
//!   which page faults may be resolved on demand.
//! * **Kernel Context Window**: the span managed by the kernel context. One
//!   top-level page-table slot, shared by every address space.
//! * **Direct Map**: the HHDM through which the kernel touches physical frames.
//! * **Allocator Tuning**: magazine capacity, free-slab retention and friends.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Null guard                    │
//! USERSPACE_START       ├─────────────────────────────────┤ 0x0000_0000_0001_0000
//!                       │   User Window                   │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_7000_0000_0000
//!                       │   (non-canonical hole)          │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNELSPACE_START     ├─────────────────────────────────┤ 0xffff_ff00_0000_0000
//!                       │   Kernel Context Window         │
//! KERNELSPACE_END       ├─────────────────────────────────┤ 0xffff_ff80_0000_0000
//!                       │   Kernel Text & Data            │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use kernel_info::memory::{USERSPACE_START, USERSPACE_END, MAGAZINE_SIZE};
//!
//! assert!(USERSPACE_START < USERSPACE_END);
//! assert!(MAGAZINE_SIZE > 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
