//! # Kernel Memory Management Core
//!
//! Physical frames, kernel objects and address spaces, layered bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Virtual Memory Manager ([`vmm`])         │
//! │    • contexts, ranges, map / unmap / find_free      │
//! │    • demand paging and copy-on-write faults         │
//! │    • context clone, switch, MMIO and DMA mappings   │
//! └───────┬──────────────────────┬──────────────────────┘
//!         │                      │
//! ┌───────▼──────────┐   ┌───────▼─────────────────────┐
//! │ Slab ([`slab`])  │   │ Frame refcounts             │
//! │ • magazines      │   │ ([`refcount`])              │
//! │ • depot, slabs   │   │ • saturating, per frame     │
//! └───────┬──────────┘   └─────────────────────────────┘
//!         │
//! ┌───────▼─────────────────────────────────────────────┐
//! │        Physical Memory Manager ([`pmm`])            │
//! │    • sectioned bitmaps, first-free hints            │
//! │    • contiguous runs within one section             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The page-table format is not known here: the VMM drives any
//! [`kernel_vmem::Mmu`] and reaches physical memory through a
//! [`kernel_vmem::PhysMapper`] ([`phys_mapper::HhdmPhysMapper`] in the
//! kernel, a heap buffer in tests).
//!
//! ## Locking
//!
//! | Lock | Kind | Protects |
//! |------|------|----------|
//! | PMM section | sleep | one bitmap and its first-free hint |
//! | refcount table | spin, IRQs masked | every frame count |
//! | slab per-core magazines | spin, IRQs masked | one core's loaded/previous pair |
//! | slab depot | spin, IRQs masked | full and empty magazine stacks |
//! | slab lists | sleep | slab bookkeeping of one cache |
//! | context | sleep | range list and page tables of one address space |
//! | range nodes | slab locks above | nodes of every context's range list |
//!
//! A context lock is taken before PMM, refcount, range-node and page-table
//! frame locks.
//!
//! No path enters the global heap while holding a slab or context lock.
//! Slab headers and free-slot lists live in the slabs' own pages, and range
//! nodes come from a slab cache over the direct map. A cache growing through
//! [`vmm::Vmm`] as its page source takes the kernel context lock under its
//! slab-list lock; the range-node cache never reaches a context, so the two
//! orders cannot meet.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod cpu;
pub mod phys_mapper;
pub mod pmm;
pub mod refcount;
pub mod slab;
pub mod vmm;
