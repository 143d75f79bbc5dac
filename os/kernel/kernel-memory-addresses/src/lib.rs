//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page numbers and frame
//! numbers used by the simulated MMU.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u64` values.
//!
//! | Concept | Description |
//! |----------|-------------|
//! | [`PageSize`] | Runtime page geometry (power of two, default 4 KiB). |
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`PageOffset`] | An offset within one page. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`PageNumber`] | Refer to a process's virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`FrameNumber`] | Refer to a byte / frame of the physical store. |
//!
//! ## Page Sizes
//!
//! The page size is picked once, when the memory subsystem is initialized, and
//! every split/join takes it as an argument. A 64-bit address is divided as
//!
//! ```text
//! | 63 ................ shift | shift-1 ...... 0 |
//! |        page number        |      offset      |
//! ```
//!
//! With the default 4096-byte page the offset is 12 bits wide.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let ps = PageSize::default();
//!
//! // Split a virtual address into page number and in-page offset
//! let va = VirtualAddress::new(0x0040_2abc);
//! let (page, off) = va.split(ps);
//! assert!(off.as_u64() < ps.bytes());
//!
//! // Join them back to the same address
//! assert_eq!(page.join(off, ps), va);
//!
//! // Physical addresses are frame_number * page_size + offset
//! let pa = FrameNumber::new(7).join(off, ps);
//! assert_eq!(pa.as_u64(), 7 * 4096 + 0xabc);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys.
//! - All alignment and offset calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::memory_address::MemoryAddress;
pub use crate::memory_address_offset::PageOffset;
pub use crate::page_size::PageSize;
pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::FrameNumber;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::PageNumber;
