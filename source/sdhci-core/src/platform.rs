//! The seam between the driver core and the surrounding system.
//!
//! Everything the driver needs beyond the SDHCI register file itself comes in
//! through the [`Platform`] trait: DMA pinning, cache maintenance, delays,
//! interrupt delivery, and controller quirks. Register access is a separate
//! seam, [`crate::regs::Mmio`], so that the two can be faked independently in
//! tests.

use core::ptr::NonNull;

use crate::{req::Direction, Error};

/// The maximum number of physical pages a single request may span.
pub const MAX_REQUEST_PAGES: usize = 512;

/// Platform services required by the [`Sdhci`](crate::Sdhci) driver.
pub trait Platform {
    /// Returns the quirks of this controller instance.
    ///
    /// Called once during initialization; the returned value is cached.
    fn quirks(&self) -> Quirks;

    /// Returns the controller's base clock frequency in Hz, or 0 if the
    /// platform does not know it.
    ///
    /// Only consulted when the capabilities register reports a base clock of
    /// zero.
    fn base_clock_hz(&self) -> u32;

    /// Returns the size in bytes of a physical page on this platform.
    fn page_size(&self) -> usize;

    /// Performs a platform-specific hardware reset of the controller, such as
    /// toggling a reset GPIO. May be a no-op.
    fn hw_reset(&self);

    /// Busy-waits for at least `us` microseconds.
    fn delay_us(&self, us: u32);

    /// Pins `page_count` pages of `region` for DMA and returns their physical
    /// addresses along with a handle that keeps the pinning alive.
    fn pin(
        &self,
        region: &DmaRegion,
        direction: Direction,
        page_count: usize,
    ) -> Result<PinnedPages, Error>;

    /// Releases a pinning previously established by [`Platform::pin`].
    fn unpin(&self, pmt: Pmt);

    /// Performs a cache maintenance operation on `len` bytes of `region`
    /// starting at `offset`.
    fn cache_op(&self, region: &DmaRegion, op: CacheOp, offset: u64, len: usize);

    /// Waits until the controller raises its interrupt line.
    ///
    /// The driver calls this in a loop from [`Sdhci::interrupt_task`], calling
    /// [`Sdhci::handle_interrupt`] after each completion. Returning
    /// [`Error::Canceled`] ends the loop, which is how a platform shuts the
    /// interrupt task down.
    ///
    /// [`Sdhci::interrupt_task`]: crate::Sdhci::interrupt_task
    /// [`Sdhci::handle_interrupt`]: crate::Sdhci::handle_interrupt
    fn wait_for_interrupt(&self) -> impl core::future::Future<Output = Result<(), Error>>;
}

/// Deviations of a concrete controller from the SDHCI specification.
#[derive(Debug, Copy, Clone, Default)]
pub struct Quirks {
    /// The controller strips the CRC from 136-bit responses and returns the
    /// 120 remaining bits in reversed register order.
    pub strip_response_crc: bool,
    /// The controller strips the CRC from 136-bit responses but keeps the
    /// register order.
    pub strip_response_crc_preserve_order: bool,
    /// The controller's DMA engine is broken; use PIO only.
    pub no_dma: bool,
    /// The controller cannot do double-data-rate timings.
    pub no_ddr: bool,
    /// The controller uses a non-standard tuning procedure, so standard
    /// HS200 tuning must not be attempted.
    pub non_standard_tuning: bool,
    /// DMA chunks must not cross an address boundary of this alignment (a
    /// power of two). `None` means chunks may be placed anywhere.
    pub dma_boundary_alignment: Option<u64>,
}

/// A DMA-capable memory region, identified by a platform-specific handle and
/// an offset within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DmaRegion {
    /// Platform-specific handle naming the memory object.
    pub handle: u32,
    /// Byte offset of the transfer within the memory object.
    pub offset: u64,
}

/// A handle representing a live DMA pinning, returned by [`Platform::pin`]
/// and consumed by [`Platform::unpin`].
#[derive(Debug, Eq, PartialEq)]
pub struct Pmt(pub u64);

/// The result of pinning a region for DMA.
#[derive(Debug)]
pub struct PinnedPages {
    /// Physical base addresses of the pinned pages, in order.
    pub pages: heapless::Vec<u64, MAX_REQUEST_PAGES>,
    /// Handle that keeps the pinning alive.
    pub pmt: Pmt,
}

/// A cache maintenance operation, from the point of view of the CPU cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheOp {
    /// Write dirty lines back to memory.
    Clean,
    /// Write dirty lines back and discard them.
    CleanInvalidate,
}

/// A physically-contiguous buffer holding the ADMA2 descriptor table.
///
/// The buffer must be DMA-coherent or covered by [`Platform::cache_op`]; the
/// driver cleans it after writing descriptors and before starting a transfer.
#[derive(Debug)]
pub struct DescriptorBuffer {
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
    region: DmaRegion,
}

// Safety: the buffer is only ever accessed while holding the driver's state
// lock.
unsafe impl Send for DescriptorBuffer {}

impl DescriptorBuffer {
    /// Returns a new `DescriptorBuffer` over `len` bytes at `virt`.
    ///
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the driver, must not be aliased, and must be mapped to the
    /// physically-contiguous range beginning at `phys`. `region` must name
    /// the same memory.
    pub unsafe fn new(virt: NonNull<u8>, phys: u64, len: usize, region: DmaRegion) -> Self {
        Self {
            virt,
            phys,
            len,
            region,
        }
    }

    /// The virtual address of the table.
    pub fn virt(&self) -> NonNull<u8> {
        self.virt
    }

    /// The physical address of the table, as programmed into the ADMA system
    /// address register.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// The table's length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the table has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The DMA region covering the table, for cache maintenance.
    pub fn region(&self) -> &DmaRegion {
        &self.region
    }
}
