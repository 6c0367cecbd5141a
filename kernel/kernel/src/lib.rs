//! # Kernel memory-management core
//!
//! Composition of the memory subsystems into the running kernel: the boot
//! handoff facade, the architectural pre-init, the virtual-memory bootstrap
//! dance, the per-CPU table and the global allocator adapter.
//!
//! ## Bring-up order
//!
//! 1. [`arch::preinit`] — enable no-execute, build the early direct-mapped
//!    window in the loader's page table, rebase the GDT through it.
//! 2. [`vm::init`] — parse the memory map, bootstrap the page-table pool
//!    from the early allocator, build the kernel address space from the
//!    bootstrap mappings, switch to it, arm the buddy allocator and the
//!    universal allocator.
//! 3. [`percpu::init`] — pin one page per CPU for CPU-local state.
//!
//! After step 2 every allocation flows through [`vm::kalloc`] (or the
//! `alloc` crate via the installed [`galloc::KernelAllocator`]), address
//! ranges come from the kernel heap, and physical frames from the buddy
//! allocator.
//!
//! This crate is a library: the bootable image (loader, linker script,
//! interrupt plumbing, drivers) links against it and calls the three init
//! steps from its entry point.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod arch;
pub mod boot;
pub mod galloc;
pub mod percpu;
pub mod vm;
