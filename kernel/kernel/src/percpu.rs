//! # Per-CPU table
//!
//! One page-pinned record per logical processor, laid out contiguously and
//! indexed by CPU id. Pinning each record to its own page keeps the records
//! from sharing cache lines or pages, and gives hardware (`GS` base) a
//! cheap, stable address to point at.

use core::ptr::NonNull;
use core::sync::atomic::AtomicU64;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_sync::SyncOnceCell;
use log::info;

/// CPU-local state. One page each; add fields freely, the size assertion
/// below guards the layout.
#[repr(C, align(4096))]
pub struct PerCpu {
    /// Logical index of the owning CPU.
    pub cpu_index: u32,
    /// Top of this CPU's kernel stack.
    pub kernel_stack_top: VirtualAddress,
    /// Scheduler tick counter.
    pub ticks: AtomicU64,
    /// Opaque slot for the task layer.
    pub current_task: AtomicU64,
}

const _: () = {
    assert!(size_of::<PerCpu>() == Size4K::SIZE as usize);
};

/// The contiguous per-CPU records.
pub struct PerCpuTable {
    base: NonNull<PerCpu>,
    count: u32,
}

// Safety: records are only handed out as shared references; their mutable
// fields are atomics.
unsafe impl Send for PerCpuTable {}
unsafe impl Sync for PerCpuTable {}

impl PerCpuTable {
    /// Initialize `count` records over `memory`.
    ///
    /// # Safety
    /// `memory` must point at `count` exclusively owned, page-aligned,
    /// writable pages that stay mapped for the table's lifetime.
    #[must_use]
    pub unsafe fn new(memory: NonNull<u8>, count: u32) -> Self {
        assert!(count > 0);
        let base = memory.cast::<PerCpu>();
        for cpu in 0..count {
            // SAFETY: one whole page per record, per the caller contract.
            unsafe {
                base.add(cpu as usize).write(PerCpu {
                    cpu_index: cpu,
                    kernel_stack_top: VirtualAddress::zero(),
                    ticks: AtomicU64::new(0),
                    current_task: AtomicU64::new(0),
                });
            }
        }
        Self { base, count }
    }

    /// The record of `cpu`.
    #[must_use]
    pub fn get(&self, cpu: u32) -> &PerCpu {
        assert!(cpu < self.count, "CPU index out of range");
        // SAFETY: initialized in `new`, never moved.
        unsafe { self.base.add(cpu as usize).as_ref() }
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }
}

static TABLE: SyncOnceCell<PerCpuTable> = SyncOnceCell::new();

/// Allocate and initialize the global table for `cpu_count` CPUs.
///
/// Backing comes from the buddy allocator through the window; call after
/// [`vm::init`](crate::vm::init). Returns `false` when memory is exhausted
/// or the table already exists.
pub fn init(cpu_count: u32) -> bool {
    let Some(bpa) = crate::vm::frames() else {
        return false;
    };
    let pages = cpu_count.next_power_of_two();
    let Some(base) = bpa.alloc_pages(pages.trailing_zeros() as u8) else {
        return false;
    };
    let memory = crate::vm::virt_dma(base);
    // SAFETY: a fresh run of `pages >= cpu_count` pages, window mapped.
    let table = unsafe {
        PerCpuTable::new(
            NonNull::new_unchecked(memory.as_mut_ptr()),
            cpu_count,
        )
    };
    info!("per-CPU table for {cpu_count} CPUs at {memory}");
    TABLE.set(table).is_ok()
}

/// The record of `cpu`, once [`init`] ran.
#[must_use]
pub fn get(cpu: u32) -> Option<&'static PerCpu> {
    TABLE.get().map(|table| table.get(cpu))
}

/// Point `IA32_GS_BASE` at this CPU's record so interrupt paths can reach
/// it without a table walk.
///
/// # Safety
/// Requires CPL0; `cpu` must be the executing CPU's index and [`init`]
/// must have run.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub unsafe fn install_gs(cpu: u32) {
    let record = get(cpu).expect("per-CPU table is not initialized");
    // SAFETY: CPL0 per the caller contract.
    unsafe {
        kernel_registers::msr::wrmsr(
            kernel_registers::msr::IA32_GS_BASE,
            core::ptr::from_ref(record) as u64,
        );
    }
}
