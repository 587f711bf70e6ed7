//! The SDHCI host driver.
//!
//! [`Sdhci`] owns one controller's register set and drives requests through
//! it. A request proceeds in two stages tracked separately: the command
//! stage, ended by the command-complete interrupt, and the data stage, ended
//! by the transfer-complete interrupt (or, for tuning commands, the first
//! buffer-read-ready). One request is in flight at a time; a second caller
//! gets [`Error::ShouldWait`] without any register traffic.
//!
//! Completion is interrupt driven. The platform delivers interrupts by
//! calling [`Sdhci::handle_interrupt`], either directly from its interrupt
//! handler or by spawning [`Sdhci::interrupt_task`]. The handler and the
//! request path share [`HostState`] under a spinlock, and the handler wakes
//! the waiting [`Sdhci::request`] future through a [`WaitCell`] once both
//! stages of its request are done.

use core::ptr::NonNull;

use maitake::sync::WaitCell;
use mycelium_util::sync::spin::Mutex;

use crate::{
    adma::{self, AdmaDescriptor, AdmaDescriptor64, AdmaDescriptor96, PhysChunks, MAX_DESCRIPTORS},
    platform::{CacheOp, DescriptorBuffer, DmaRegion, Platform, MAX_REQUEST_PAGES},
    regs::{
        Capabilities0, Capabilities1, ClockControl, Command, HostControl1, HostControl2,
        HostControllerVersion, Interrupt, Mmio, PowerControl, PresentState, Registers,
        SoftwareReset, TimeoutControl, TransferMode,
    },
    req::{
        AutoCmd, CommandType, DataTransfer, Direction, Request, RequestBuffer, ResponseType,
        MAX_COMMAND_INDEX,
    },
    Error,
};

/// The clock frequency used for card identification, per the SD physical
/// layer specification.
const SETUP_CLOCK_HZ: u32 = 400_000;

/// Granularity of bounded hardware handshake polls.
const POLL_INTERVAL_US: u32 = 10;
const RESET_TIMEOUT_US: u32 = 1_000_000;
const CLOCK_STABLE_TIMEOUT_US: u32 = 150_000;
const INHIBIT_TIMEOUT_US: u32 = 100_000;
/// Settling time after a signal voltage switch before the result is checked.
const VOLTAGE_STABILIZATION_US: u32 = 5_000;

/// Transfer-size limit reported when no limit applies.
pub const MAX_TRANSFER_UNBOUNDED: u32 = u32::MAX;

const TUNING_MAX_ITERATIONS: u32 = 40;
const TUNING_BLOCK_SIZE_4BIT: u16 = 64;
const TUNING_BLOCK_SIZE_8BIT: u16 = 128;

/// The data bus width between controller and card.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

/// The signalling voltage on the data lines.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SignalVoltage {
    V180,
    V330,
}

/// SD/MMC bus timing modes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timing {
    Legacy,
    HighSpeed,
    /// MMC high-speed double data rate.
    HsDdr,
    Hs200,
    Hs400,
    Sdr12,
    Sdr25,
    Sdr50,
    Sdr104,
    Ddr50,
}

/// Capabilities and preferences of a controller instance, derived from its
/// capabilities registers and [`Quirks`](crate::Quirks) during
/// initialization.
#[derive(Debug, Copy, Clone, Default)]
pub struct HostInfo {
    /// The largest transfer the driver will attempt, in bytes.
    /// [`MAX_TRANSFER_UNBOUNDED`] on a PIO-only controller.
    pub max_transfer_bytes: u32,
    /// The largest transfer when DMA is not used. PIO moves data one block
    /// register at a time, so no limit applies.
    pub max_transfer_bytes_non_dma: u32,
    pub bus_width_8: bool,
    pub dma: bool,
    pub voltage_330: bool,
    pub auto_cmd12: bool,
    pub sdr50: bool,
    pub sdr104: bool,
    pub ddr50: bool,
    /// SDR50 may be used without tuning first.
    pub no_tuning_sdr50: bool,
    /// The card layer should not attempt HS200.
    pub disable_hs200: bool,
    /// The card layer should not attempt HS400.
    pub disable_hs400: bool,
    /// The card layer should not attempt high-speed DDR.
    pub disable_hsddr: bool,
}

/// State shared between the request path and the interrupt handler.
struct HostState {
    /// The request whose command stage is outstanding.
    cmd: Option<NonNull<Request<'static>>>,
    /// The request whose data stage is outstanding.
    data: Option<NonNull<Request<'static>>>,
    /// The next block to move on the PIO path.
    block_idx: u32,
    descriptors: Option<DescriptorBuffer>,
    interrupt_cb: Option<fn()>,
    /// Set while a card interrupt is awaiting acknowledgement; the card
    /// interrupt is masked until then so it cannot storm.
    card_interrupt_masked: bool,
}

// Safety: the raw request pointers are only dereferenced while holding the
// lock around this state, and the future that owns each request keeps it
// alive for as long as it is in flight (see `InFlightGuard`).
unsafe impl Send for HostState {}

/// An SDHCI-compliant SD/MMC host controller.
pub struct Sdhci<M, P> {
    regs: Registers<M>,
    platform: P,
    state: Mutex<HostState>,
    /// Woken by the interrupt handler when the in-flight request completes.
    completion: WaitCell,
    info: HostInfo,
    quirks: crate::Quirks,
    base_clock_hz: u32,
    /// Transfers go through the ADMA2 engine rather than PIO.
    dma: bool,
    /// The descriptor table uses the 96-bit (64-bit address) layout.
    use_64bit_descriptors: bool,
}

impl<M: Mmio, P: Platform> Sdhci<M, P> {
    /// Initializes the controller behind `mmio`.
    ///
    /// `descriptors` backs the ADMA2 descriptor table; passing `None`
    /// restricts the driver to PIO transfers. Fails with
    /// [`Error::NotSupported`] for controllers below SDHCI version 3.00.
    pub fn new(mmio: M, platform: P, descriptors: Option<DescriptorBuffer>) -> Result<Self, Error> {
        let regs = Registers::new(mmio);
        let quirks = platform.quirks();
        if let Some(boundary) = quirks.dma_boundary_alignment {
            if boundary == 0 || !boundary.is_power_of_two() {
                tracing::error!(boundary, "DMA boundary alignment must be a nonzero power of two");
                return Err(Error::OutOfRange);
            }
        }

        let version: HostControllerVersion = regs.read();
        let spec_version = version.get(HostControllerVersion::SPECIFICATION_VERSION);
        if spec_version < HostControllerVersion::SPECIFICATION_VERSION_3_00 {
            tracing::error!(spec_version, "SDHCI version 3.00 or later required");
            return Err(Error::NotSupported);
        }

        let caps0: Capabilities0 = regs.read();
        let caps1: Capabilities1 = regs.read();

        let mut base_clock_hz = caps0.base_clock_frequency_hz();
        if base_clock_hz == 0 {
            // some controllers leave the capability zeroed
            base_clock_hz = platform.base_clock_hz();
        }
        if base_clock_hz == 0 {
            tracing::error!("controller base clock frequency unknown");
            return Err(Error::Internal);
        }

        let dma = caps0.get(Capabilities0::ADMA2_SUPPORT) && !quirks.no_dma && descriptors.is_some();
        let use_64bit_descriptors =
            dma && caps0.get(Capabilities0::V3_64_BIT_SYSTEM_ADDRESS_SUPPORT);

        let max_transfer_bytes = if dma {
            (MAX_REQUEST_PAGES * platform.page_size()) as u32
        } else {
            MAX_TRANSFER_UNBOUNDED
        };
        let info = HostInfo {
            max_transfer_bytes,
            max_transfer_bytes_non_dma: MAX_TRANSFER_UNBOUNDED,
            bus_width_8: caps0.get(Capabilities0::BUS_WIDTH_8_SUPPORT),
            dma,
            voltage_330: caps0.get(Capabilities0::VOLTAGE_3V3_SUPPORT),
            auto_cmd12: true,
            sdr50: caps1.get(Capabilities1::SDR50_SUPPORT),
            sdr104: caps1.get(Capabilities1::SDR104_SUPPORT),
            ddr50: caps1.get(Capabilities1::DDR50_SUPPORT) && !quirks.no_ddr,
            no_tuning_sdr50: !caps1.get(Capabilities1::USE_TUNING_FOR_SDR50),
            disable_hs200: quirks.non_standard_tuning,
            disable_hs400: quirks.non_standard_tuning,
            disable_hsddr: quirks.no_ddr,
        };

        let host = Self {
            regs,
            platform,
            state: Mutex::new(HostState {
                cmd: None,
                data: None,
                block_idx: 0,
                descriptors,
                interrupt_cb: None,
                card_interrupt_masked: false,
            }),
            completion: WaitCell::new(),
            info,
            quirks,
            base_clock_hz,
            dma,
            use_64bit_descriptors,
        };
        host.init_controller()?;
        Ok(host)
    }

    fn init_controller(&self) -> Result<(), Error> {
        self.reset(SoftwareReset::new().with(SoftwareReset::RESET_ALL, true))?;
        {
            let state = self.state.lock();
            self.disable_interrupts(&state);
        }
        self.regs.set_interrupt_status(Interrupt::from_bits(u32::MAX));

        if self.dma {
            let mut hc1: HostControl1 = self.regs.read();
            let select = if self.use_64bit_descriptors {
                HostControl1::DMA_SELECT_ADMA2_64BIT
            } else {
                HostControl1::DMA_SELECT_ADMA2_32BIT
            };
            hc1.set(HostControl1::DMA_SELECT, select);
            self.regs.write(hc1);
        }

        let caps0: Capabilities0 = self.regs.read();
        let voltage = if caps0.get(Capabilities0::VOLTAGE_3V3_SUPPORT) {
            PowerControl::BUS_VOLTAGE_3V3
        } else if caps0.get(Capabilities0::VOLTAGE_3V0_SUPPORT) {
            PowerControl::BUS_VOLTAGE_3V0
        } else {
            PowerControl::BUS_VOLTAGE_1V8
        };
        self.regs.write(
            PowerControl::new()
                .with(PowerControl::SD_BUS_VOLTAGE, voltage)
                .with(PowerControl::SD_BUS_POWER, true),
        );

        self.regs.write(
            TimeoutControl::new()
                .with(TimeoutControl::DATA_TIMEOUT_COUNTER, TimeoutControl::MAX_DATA_TIMEOUT),
        );

        self.set_bus_frequency(SETUP_CLOCK_HZ)?;

        tracing::info!(
            base_clock_hz = self.base_clock_hz,
            dma = self.dma,
            adma_64bit = self.use_64bit_descriptors,
            "SDHCI controller initialized",
        );
        Ok(())
    }

    /// Returns the controller's capabilities and preferences.
    pub fn info(&self) -> HostInfo {
        self.info
    }

    /// Performs a platform-level hardware reset of the controller, if the
    /// platform supports one.
    pub fn hw_reset(&self) {
        let _guard = self.state.lock();
        self.platform.hw_reset();
    }

    /// Executes `req` on the bus, filling in its response (and, for PIO
    /// reads, its buffer) on success.
    ///
    /// Returns [`Error::ShouldWait`] without touching the hardware if
    /// another request is in flight. If the returned future is dropped
    /// before completion, the command and data lines are reset and any DMA
    /// pinning is released.
    #[tracing::instrument(level = "debug", skip(self, req), fields(index = req.index))]
    pub async fn request(&self, req: &mut Request<'_>) -> Result<(), Error> {
        self.validate(req)?;
        let ptr = NonNull::from(&mut *req).cast::<Request<'static>>();

        {
            let mut state = self.state.lock();
            if state.cmd.is_some() || state.data.is_some() {
                return Err(Error::ShouldWait);
            }
            if let Err(error) = self.start_request(req, &mut state) {
                state.cmd = None;
                state.data = None;
                state.block_idx = 0;
                drop(state);
                self.finish_request(req);
                return Err(error);
            }
        }

        let mut guard = InFlightGuard {
            host: self,
            ptr,
            armed: true,
        };
        loop {
            let _ = self.completion.wait().await;
            let state = self.state.lock();
            if state.cmd != Some(ptr) && state.data != Some(ptr) {
                break;
            }
        }
        guard.armed = false;
        drop(guard);

        let result = req.status.take().unwrap_or(Err(Error::Internal));
        self.finish_request(req);
        if let Err(error) = result {
            tracing::debug!(index = req.index, %error, "request failed");
        }
        result
    }

    fn validate(&self, req: &Request<'_>) -> Result<(), Error> {
        if req.index > MAX_COMMAND_INDEX {
            return Err(Error::InvalidArgs);
        }
        let Some(data) = &req.data else { return Ok(()) };
        if data.block_size == 0 || data.block_count == 0 {
            return Err(Error::InvalidArgs);
        }
        match &data.buffer {
            RequestBuffer::Pio(buf) => {
                // tuning reads are consumed by the controller; no buffer needed
                if !req.is_tuning() {
                    if data.block_size % 4 != 0 {
                        return Err(Error::InvalidArgs);
                    }
                    if buf.len() != data.len() {
                        return Err(Error::InvalidArgs);
                    }
                }
            }
            RequestBuffer::Dma(_) => {
                if !self.dma {
                    return Err(Error::NotSupported);
                }
                if data.len() > self.info.max_transfer_bytes as usize {
                    return Err(Error::NotSupported);
                }
            }
        }
        Ok(())
    }

    fn start_request(&self, req: &mut Request<'_>, state: &mut HostState) -> Result<(), Error> {
        let ptr = NonNull::from(&mut *req).cast::<Request<'static>>();

        let mut inhibit = PresentState::new().with(PresentState::COMMAND_INHIBIT_CMD, true);
        if req.busy() && req.command_type != CommandType::Abort {
            inhibit.set(PresentState::COMMAND_INHIBIT_DAT, true);
        }
        self.wait_until(INHIBIT_TIMEOUT_US, || {
            self.regs.read::<PresentState>().bits() & inhibit.bits() == 0
        })?;

        let (mut mode, cmd) = prepare_cmd(req);
        let mut dma_xfer = None;
        if let Some(data) = &req.data {
            self.regs.set_block_size(data.block_size);
            self.regs.set_block_count(data.block_count);
            if let RequestBuffer::Dma(region) = data.buffer {
                dma_xfer = Some((region, data.direction, data.len()));
            }
        }
        if let Some((region, direction, len)) = dma_xfer {
            self.setup_dma(req, state, region, direction, len)?;
            mode.set(TransferMode::DMA_ENABLE, true);
        }

        self.regs.set_argument(req.argument);
        // drop any stale latched status before enabling delivery
        self.regs.set_interrupt_status(Interrupt::from_bits(u32::MAX));
        self.enable_interrupts(state);

        tracing::trace!(index = req.index, argument = req.argument, "issuing command");
        self.regs.write(mode);
        self.regs.write(cmd);

        state.cmd = Some(ptr);
        // busy commands hold DAT0 until transfer-complete, even without data
        if req.has_data() || req.busy() {
            state.data = Some(ptr);
            state.block_idx = 0;
        }
        Ok(())
    }

    fn setup_dma(
        &self,
        req: &mut Request<'_>,
        state: &mut HostState,
        region: DmaRegion,
        direction: Direction,
        len: usize,
    ) -> Result<(), Error> {
        let page_size = self.platform.page_size();
        let page_offset = (region.offset % page_size as u64) as usize;
        let page_count = (page_offset + len + page_size - 1) / page_size;
        if page_count > MAX_REQUEST_PAGES {
            tracing::warn!(page_count, len, "transfer spans too many pages for DMA");
            return Err(Error::InvalidArgs);
        }

        let pinned = self.platform.pin(&region, direction, page_count)?;
        req.pmt = Some(pinned.pmt);

        let op = match direction {
            Direction::Read => CacheOp::CleanInvalidate,
            Direction::Write => CacheOp::Clean,
        };
        self.platform.cache_op(&region, op, region.offset, len);

        let Some(table) = state.descriptors.as_ref() else {
            return Err(Error::NoMemory);
        };
        let chunks = PhysChunks::new(&pinned.pages, page_size, page_offset, len);
        let table_bytes = if self.use_64bit_descriptors {
            write_table::<AdmaDescriptor96>(table, chunks, self.quirks.dma_boundary_alignment)?
        } else {
            write_table::<AdmaDescriptor64>(table, chunks, self.quirks.dma_boundary_alignment)?
        };
        self.platform
            .cache_op(table.region(), CacheOp::Clean, table.region().offset, table_bytes);
        self.regs.set_adma_address(table.phys());
        Ok(())
    }

    /// Post-request cleanup: DMA unpinning, cache maintenance for reads, and
    /// the CMD/DAT line reset required after abort commands.
    fn finish_request(&self, req: &mut Request<'_>) {
        if let Some(pmt) = req.pmt.take() {
            if let Some(data) = &req.data {
                if let RequestBuffer::Dma(region) = &data.buffer {
                    if data.direction == Direction::Read {
                        self.platform.cache_op(
                            region,
                            CacheOp::CleanInvalidate,
                            region.offset,
                            data.len(),
                        );
                    }
                }
            }
            self.platform.unpin(pmt);
        }

        if req.command_type == CommandType::Abort {
            let reset = SoftwareReset::new()
                .with(SoftwareReset::RESET_CMD, true)
                .with(SoftwareReset::RESET_DAT, true);
            if let Err(error) = self.reset(reset) {
                tracing::warn!(%error, "reset after abort command failed");
            }
        }
    }

    /// Services the controller's interrupt status register.
    ///
    /// Safe to call spuriously; a status with no in-flight request is
    /// ignored.
    pub fn handle_interrupt(&self) {
        let status = self.regs.interrupt_status();
        // write-one-to-clear acknowledge
        self.regs.set_interrupt_status(status);
        if status.bits() == 0 {
            return;
        }
        tracing::trace!(%status, "interrupt");

        let card_cb = {
            let mut state = self.state.lock();
            let card_cb = if status.get(Interrupt::CARD_INTERRUPT) {
                state.card_interrupt_masked = true;
                self.update_card_interrupt(&state);
                state.interrupt_cb
            } else {
                None
            };

            if status.is_error() {
                self.error_recovery(&mut state, status);
            } else {
                if status.get(Interrupt::COMMAND_COMPLETE) {
                    self.cmd_stage_complete(&mut state);
                }
                if status.get(Interrupt::BUFFER_READ_READY) {
                    self.data_stage_read_ready(&mut state);
                }
                if status.get(Interrupt::BUFFER_WRITE_READY) {
                    self.data_stage_write_ready(&mut state);
                }
                if status.get(Interrupt::TRANSFER_COMPLETE) {
                    self.transfer_complete(&mut state);
                }
            }
            card_cb
        };
        // the callback may re-enter the driver, so call it unlocked
        if let Some(cb) = card_cb {
            cb();
        }
    }

    /// Runs [`handle_interrupt`](Self::handle_interrupt) every time the
    /// platform's interrupt future completes, until it returns
    /// [`Error::Canceled`].
    pub async fn interrupt_task(&self) {
        loop {
            match self.platform.wait_for_interrupt().await {
                Ok(()) => self.handle_interrupt(),
                Err(Error::Canceled) => return,
                Err(error) => {
                    tracing::error!(%error, "interrupt wait failed");
                    return;
                }
            }
        }
    }

    fn cmd_stage_complete(&self, state: &mut HostState) {
        let Some(ptr) = state.cmd else {
            tracing::trace!("spurious command-complete interrupt");
            return;
        };
        // Safety: the request is in flight and we hold the state lock.
        let req = unsafe { &mut *ptr.as_ptr() };

        let r = [
            self.regs.response(0),
            self.regs.response(1),
            self.regs.response(2),
            self.regs.response(3),
        ];
        match req.response_type {
            ResponseType::Len136 if self.quirks.strip_response_crc => {
                // the controller drops the response CRC and returns the
                // remaining 120 bits shifted, in reversed register order
                req.response[0] = (r[3] << 8) | ((r[2] >> 24) & 0xff);
                req.response[1] = (r[2] << 8) | ((r[1] >> 24) & 0xff);
                req.response[2] = (r[1] << 8) | ((r[0] >> 24) & 0xff);
                req.response[3] = r[0] << 8;
            }
            ResponseType::Len136 if self.quirks.strip_response_crc_preserve_order => {
                req.response[0] = r[0] << 8;
                req.response[1] = (r[1] << 8) | ((r[0] >> 24) & 0xff);
                req.response[2] = (r[2] << 8) | ((r[1] >> 24) & 0xff);
                req.response[3] = (r[3] << 8) | ((r[2] >> 24) & 0xff);
            }
            ResponseType::Len136 => req.response = r,
            ResponseType::Len48 | ResponseType::Len48Busy => req.response[0] = r[0],
            ResponseType::None => {}
        }

        state.cmd = None;
        if state.data.is_none() {
            self.complete_request(state, ptr, Ok(()));
        }
    }

    fn data_stage_read_ready(&self, state: &mut HostState) {
        let Some(ptr) = state.data else {
            tracing::trace!("spurious buffer-read-ready interrupt");
            return;
        };
        // Safety: the request is in flight and we hold the state lock.
        let req = unsafe { &mut *ptr.as_ptr() };

        if req.is_tuning() {
            // the tuning block is consumed by the controller; one read-ready
            // is the whole data stage
            self.complete_request(state, ptr, Ok(()));
            return;
        }

        let Some(data) = &mut req.data else { return };
        let block_size = usize::from(data.block_size);
        let RequestBuffer::Pio(buf) = &mut data.buffer else { return };
        let start = state.block_idx as usize * block_size;
        let Some(block) = buf.get_mut(start..start + block_size) else {
            tracing::warn!(start, block_size, "read-ready past end of buffer");
            return;
        };
        for word in block.chunks_exact_mut(4) {
            word.copy_from_slice(&self.regs.buffer_data().to_le_bytes());
        }
        state.block_idx += 1;
    }

    fn data_stage_write_ready(&self, state: &mut HostState) {
        let Some(ptr) = state.data else {
            tracing::trace!("spurious buffer-write-ready interrupt");
            return;
        };
        // Safety: the request is in flight and we hold the state lock.
        let req = unsafe { &mut *ptr.as_ptr() };

        let Some(data) = &mut req.data else { return };
        let block_size = usize::from(data.block_size);
        let RequestBuffer::Pio(buf) = &mut data.buffer else { return };
        let start = state.block_idx as usize * block_size;
        let Some(block) = buf.get(start..start + block_size) else {
            tracing::warn!(start, block_size, "write-ready past end of buffer");
            return;
        };
        for word in block.chunks_exact(4) {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(word);
            self.regs.set_buffer_data(u32::from_le_bytes(bytes));
        }
        state.block_idx += 1;
    }

    fn transfer_complete(&self, state: &mut HostState) {
        let Some(ptr) = state.data else {
            tracing::trace!("spurious transfer-complete interrupt");
            return;
        };
        state.data = None;
        // if the command stage is still pending, its completion finishes the
        // request
        if state.cmd.is_none() {
            self.complete_request(state, ptr, Ok(()));
        }
    }

    fn error_recovery(&self, state: &mut HostState, status: Interrupt) {
        tracing::warn!(%status, "controller reported an error interrupt");
        if status.get(Interrupt::ADMA_ERROR) {
            tracing::warn!(
                adma_error_status = self.regs.adma_error_status(),
                "ADMA fault",
            );
        }

        let _ = self.reset(SoftwareReset::new().with(SoftwareReset::RESET_CMD, true));
        let _ = self.reset(SoftwareReset::new().with(SoftwareReset::RESET_DAT, true));

        match state.cmd.or(state.data) {
            Some(ptr) => self.complete_request(state, ptr, Err(Error::Io)),
            None => tracing::trace!("error interrupt with no request in flight"),
        }
    }

    fn complete_request(
        &self,
        state: &mut HostState,
        ptr: NonNull<Request<'static>>,
        result: Result<(), Error>,
    ) {
        state.cmd = None;
        state.data = None;
        state.block_idx = 0;
        self.disable_interrupts(state);
        // Safety: the pointer was in flight, so its owning future has not
        // returned and the request is still alive.
        let req = unsafe { &mut *ptr.as_ptr() };
        req.status = Some(result);
        self.completion.wake();
    }

    /// Gates the SD clock and reprograms its divider for `frequency_hz`.
    ///
    /// A frequency of 0 leaves the SD clock gated.
    pub fn set_bus_frequency(&self, frequency_hz: u32) -> Result<(), Error> {
        let _guard = self.state.lock();

        let inhibit = PresentState::new()
            .with(PresentState::COMMAND_INHIBIT_CMD, true)
            .with(PresentState::COMMAND_INHIBIT_DAT, true);
        self.wait_until(INHIBIT_TIMEOUT_US, || {
            self.regs.read::<PresentState>().bits() & inhibit.bits() == 0
        })?;

        let mut clock: ClockControl = self.regs.read();
        clock.set(ClockControl::SD_CLOCK_ENABLE, false);
        self.regs.write(clock);
        if frequency_hz == 0 {
            return Ok(());
        }
        // gate the internal clock too; the divider must not change while it
        // is running
        clock.set(ClockControl::INTERNAL_CLOCK_ENABLE, false);
        self.regs.write(clock);

        let divider = clock_divider(self.base_clock_hz, frequency_hz);
        let clock = clock
            .with_frequency_select(divider)
            .with(ClockControl::INTERNAL_CLOCK_ENABLE, true);
        self.regs.write(clock);
        self.wait_until(CLOCK_STABLE_TIMEOUT_US, || {
            self.regs
                .read::<ClockControl>()
                .get(ClockControl::INTERNAL_CLOCK_STABLE)
        })?;
        self.regs.write(clock.with(ClockControl::SD_CLOCK_ENABLE, true));

        tracing::debug!(frequency_hz, divider, "set SD clock frequency");
        Ok(())
    }

    /// Sets the data bus width.
    pub fn set_bus_width(&self, width: BusWidth) -> Result<(), Error> {
        if width == BusWidth::Eight && !self.info.bus_width_8 {
            return Err(Error::NotSupported);
        }
        let _guard = self.state.lock();
        let mut hc1: HostControl1 = self.regs.read();
        match width {
            BusWidth::One => {
                hc1.set(HostControl1::DATA_TRANSFER_WIDTH_4BIT, false);
                hc1.set(HostControl1::EXTENDED_DATA_TRANSFER_WIDTH, false);
            }
            BusWidth::Four => {
                hc1.set(HostControl1::DATA_TRANSFER_WIDTH_4BIT, true);
                hc1.set(HostControl1::EXTENDED_DATA_TRANSFER_WIDTH, false);
            }
            BusWidth::Eight => {
                hc1.set(HostControl1::DATA_TRANSFER_WIDTH_4BIT, false);
                hc1.set(HostControl1::EXTENDED_DATA_TRANSFER_WIDTH, true);
            }
        }
        self.regs.write(hc1);
        tracing::debug!(?width, "set bus width");
        Ok(())
    }

    /// Switches the signalling voltage, verifying that the switch took
    /// effect.
    ///
    /// If the controller rejects the switch, bus power is cut and
    /// [`Error::Internal`] is returned.
    pub fn set_signal_voltage(&self, voltage: SignalVoltage) -> Result<(), Error> {
        if voltage == SignalVoltage::V330 && !self.info.voltage_330 {
            return Err(Error::NotSupported);
        }
        let _guard = self.state.lock();

        let enable_1v8 = voltage == SignalVoltage::V180;
        let mut ctrl2: HostControl2 = self.regs.read();
        ctrl2.set(HostControl2::VOLTAGE_1V8_SIGNALLING_ENABLE, enable_1v8);
        self.regs.write(ctrl2);

        self.platform.delay_us(VOLTAGE_STABILIZATION_US);

        let ctrl2: HostControl2 = self.regs.read();
        if ctrl2.get(HostControl2::VOLTAGE_1V8_SIGNALLING_ENABLE) != enable_1v8 {
            let mut power: PowerControl = self.regs.read();
            power.set(PowerControl::SD_BUS_POWER, false);
            self.regs.write(power);
            tracing::error!(?voltage, "voltage switch did not take effect; bus power cut");
            return Err(Error::Internal);
        }
        tracing::debug!(?voltage, "switched signal voltage");
        Ok(())
    }

    /// Selects a bus timing mode.
    pub fn set_timing(&self, timing: Timing) -> Result<(), Error> {
        match timing {
            Timing::Sdr50 if !self.info.sdr50 => return Err(Error::NotSupported),
            Timing::Sdr104 | Timing::Hs200 if !self.info.sdr104 => {
                return Err(Error::NotSupported)
            }
            Timing::Ddr50 | Timing::HsDdr if !self.info.ddr50 => return Err(Error::NotSupported),
            Timing::Hs400 if !(self.info.sdr104 && self.info.ddr50) => {
                return Err(Error::NotSupported)
            }
            _ => {}
        }
        let _guard = self.state.lock();

        let mut hc1: HostControl1 = self.regs.read();
        hc1.set(
            HostControl1::HIGH_SPEED_ENABLE,
            matches!(
                timing,
                Timing::HighSpeed | Timing::HsDdr | Timing::Hs200 | Timing::Hs400
            ),
        );
        self.regs.write(hc1);

        let uhs_mode = match timing {
            Timing::Hs400 => HostControl2::UHS_MODE_HS400,
            Timing::Hs200 | Timing::Sdr104 => HostControl2::UHS_MODE_SDR104,
            Timing::Sdr50 => HostControl2::UHS_MODE_SDR50,
            Timing::HsDdr | Timing::Ddr50 => HostControl2::UHS_MODE_DDR50,
            Timing::HighSpeed | Timing::Sdr25 => HostControl2::UHS_MODE_SDR25,
            Timing::Legacy | Timing::Sdr12 => HostControl2::UHS_MODE_SDR12,
        };
        let mut ctrl2: HostControl2 = self.regs.read();
        ctrl2.set(HostControl2::UHS_MODE_SELECT, uhs_mode);
        self.regs.write(ctrl2);

        tracing::debug!(?timing, "set bus timing");
        Ok(())
    }

    /// Runs the standard tuning procedure using `tuning_index` (CMD19 for
    /// SD, CMD21 for MMC HS200).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn perform_tuning(&self, tuning_index: u8) -> Result<(), Error> {
        let block_size = {
            let _guard = self.state.lock();
            let hc1: HostControl1 = self.regs.read();
            let block_size = if hc1.get(HostControl1::EXTENDED_DATA_TRANSFER_WIDTH) {
                TUNING_BLOCK_SIZE_8BIT
            } else {
                TUNING_BLOCK_SIZE_4BIT
            };
            let mut ctrl2: HostControl2 = self.regs.read();
            ctrl2.set(HostControl2::EXECUTE_TUNING, true);
            self.regs.write(ctrl2);
            block_size
        };

        for _ in 0..TUNING_MAX_ITERATIONS {
            let mut req = Request::new(tuning_index, 0, ResponseType::Len48).with_data(
                DataTransfer {
                    direction: Direction::Read,
                    block_size,
                    block_count: 1,
                    auto_cmd: AutoCmd::Disabled,
                    buffer: RequestBuffer::Pio(&mut []),
                },
            );
            self.request(&mut req).await?;

            let ctrl2: HostControl2 = {
                let _guard = self.state.lock();
                self.regs.read()
            };
            if !ctrl2.get(HostControl2::EXECUTE_TUNING) {
                return if ctrl2.get(HostControl2::USE_TUNED_CLOCK) {
                    tracing::info!("tuning complete");
                    Ok(())
                } else {
                    tracing::error!("tuning failed; tuned clock not in use");
                    Err(Error::Io)
                };
            }
        }
        tracing::error!(iterations = TUNING_MAX_ITERATIONS, "tuning did not converge");
        Err(Error::Io)
    }

    /// Registers `callback` to be invoked on card (in-band) interrupts.
    ///
    /// After the callback fires, the card interrupt stays masked until
    /// [`ack_in_band_interrupt`](Self::ack_in_band_interrupt) is called. If
    /// a card interrupt is already pending, the callback fires immediately.
    pub fn register_in_band_interrupt(&self, callback: fn()) {
        let fire = {
            let mut state = self.state.lock();
            state.interrupt_cb = Some(callback);
            state.card_interrupt_masked = false;
            self.update_card_interrupt(&state);
            if self.regs.interrupt_status().get(Interrupt::CARD_INTERRUPT) {
                state.card_interrupt_masked = true;
                self.update_card_interrupt(&state);
                true
            } else {
                false
            }
        };
        if fire {
            callback();
        }
    }

    /// Re-enables the card interrupt after its callback has been handled.
    pub fn ack_in_band_interrupt(&self) {
        let mut state = self.state.lock();
        state.card_interrupt_masked = false;
        self.update_card_interrupt(&state);
    }

    fn update_card_interrupt(&self, state: &HostState) {
        let enabled = state.interrupt_cb.is_some() && !state.card_interrupt_masked;
        let status = self
            .regs
            .interrupt_status_enable()
            .with(Interrupt::CARD_INTERRUPT, enabled);
        self.regs.set_interrupt_status_enable(status);
        let signal = self
            .regs
            .interrupt_signal_enable()
            .with(Interrupt::CARD_INTERRUPT, enabled);
        self.regs.set_interrupt_signal_enable(signal);
    }

    fn enable_interrupts(&self, state: &HostState) {
        let irq = Interrupt::new().enable_normal().enable_errors().with(
            Interrupt::CARD_INTERRUPT,
            state.interrupt_cb.is_some() && !state.card_interrupt_masked,
        );
        self.regs.set_interrupt_status_enable(irq);
        self.regs.set_interrupt_signal_enable(irq);
    }

    fn disable_interrupts(&self, state: &HostState) {
        let irq = Interrupt::new().with(
            Interrupt::CARD_INTERRUPT,
            state.interrupt_cb.is_some() && !state.card_interrupt_masked,
        );
        self.regs.set_interrupt_status_enable(irq);
        self.regs.set_interrupt_signal_enable(irq);
    }

    fn reset(&self, mask: SoftwareReset) -> Result<(), Error> {
        self.regs.write(mask);
        let result = self.wait_until(RESET_TIMEOUT_US, || {
            self.regs.read::<SoftwareReset>().bits() & mask.bits() == 0
        });
        if result.is_err() {
            tracing::error!(reset = %mask, "controller failed to clear reset bits");
        }
        result
    }

    fn wait_until(&self, budget_us: u32, mut done: impl FnMut() -> bool) -> Result<(), Error> {
        let mut waited = 0;
        loop {
            if done() {
                return Ok(());
            }
            if waited >= budget_us {
                return Err(Error::Timeout);
            }
            self.platform.delay_us(POLL_INTERVAL_US);
            waited += POLL_INTERVAL_US;
        }
    }
}

/// Resets the controller and releases DMA pinnings if the future executing
/// [`Sdhci::request`] is dropped while its request is in flight, so that the
/// hardware cannot touch the request's memory after it goes away.
struct InFlightGuard<'a, M: Mmio, P: Platform> {
    host: &'a Sdhci<M, P>,
    ptr: NonNull<Request<'static>>,
    armed: bool,
}

impl<M: Mmio, P: Platform> Drop for InFlightGuard<'_, M, P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pmt = {
            let mut state = self.host.state.lock();
            if state.cmd != Some(self.ptr) && state.data != Some(self.ptr) {
                return;
            }
            // stop any in-progress transfer before the request memory goes
            // away
            let reset = SoftwareReset::new()
                .with(SoftwareReset::RESET_CMD, true)
                .with(SoftwareReset::RESET_DAT, true);
            let _ = self.host.reset(reset);
            state.cmd = None;
            state.data = None;
            state.block_idx = 0;
            self.host.disable_interrupts(&state);
            // Safety: the markers matched, so the interrupt handler has not
            // completed this request, and the dropping future still owns it.
            let req = unsafe { &mut *self.ptr.as_ptr() };
            req.pmt.take()
        };
        if let Some(pmt) = pmt {
            self.host.platform.unpin(pmt);
        }
        tracing::debug!("in-flight request canceled");
    }
}

/// Computes the 10-bit SD clock divider: the smallest `n` such that
/// `base / (2n) <= target`, or 0 (divider bypass) if the base clock is
/// already slow enough.
fn clock_divider(base_clock_hz: u32, target_hz: u32) -> u16 {
    if target_hz >= base_clock_hz {
        return 0;
    }
    let divider = base_clock_hz.div_ceil(2 * target_hz);
    divider.min(u32::from(ClockControl::MAX_FREQUENCY_SELECT)) as u16
}

fn prepare_cmd(req: &Request<'_>) -> (TransferMode, Command) {
    let response_type = match req.response_type {
        ResponseType::None => Command::RESPONSE_TYPE_NONE,
        ResponseType::Len136 => Command::RESPONSE_TYPE_136_BITS,
        ResponseType::Len48 => Command::RESPONSE_TYPE_48_BITS,
        ResponseType::Len48Busy => Command::RESPONSE_TYPE_48_BITS_WITH_BUSY,
    };
    let command_type = match req.command_type {
        CommandType::Normal => Command::COMMAND_TYPE_NORMAL,
        CommandType::Suspend => Command::COMMAND_TYPE_SUSPEND,
        CommandType::Resume => Command::COMMAND_TYPE_RESUME,
        CommandType::Abort => Command::COMMAND_TYPE_ABORT,
    };
    let cmd = Command::new()
        .with(Command::COMMAND_INDEX, u16::from(req.index))
        .with(Command::RESPONSE_TYPE, response_type)
        .with(Command::COMMAND_TYPE, command_type)
        .with(Command::COMMAND_CRC_CHECK, req.crc_check)
        .with(Command::COMMAND_INDEX_CHECK, req.index_check)
        .with(Command::DATA_PRESENT, req.has_data());

    let mut mode = TransferMode::new();
    if let Some(data) = &req.data {
        let auto_cmd = match data.auto_cmd {
            AutoCmd::Disabled => TransferMode::AUTO_CMD_DISABLED,
            AutoCmd::Cmd12 => TransferMode::AUTO_CMD12,
            AutoCmd::Cmd23 => TransferMode::AUTO_CMD23,
        };
        mode = mode
            .with(TransferMode::READ, data.direction == Direction::Read)
            .with(TransferMode::MULTI_BLOCK, data.multi_block())
            .with(TransferMode::BLOCK_COUNT_ENABLE, data.multi_block())
            .with(TransferMode::AUTO_CMD_ENABLE, auto_cmd);
    }
    (mode, cmd)
}

fn write_table<D: AdmaDescriptor>(
    table: &DescriptorBuffer,
    chunks: PhysChunks<'_>,
    boundary_alignment: Option<u64>,
) -> Result<usize, Error> {
    let capacity = (table.len() / core::mem::size_of::<D>()).min(MAX_DESCRIPTORS);
    if capacity == 0 {
        return Err(Error::NoMemory);
    }
    // Safety: `DescriptorBuffer::new` requires the memory to be valid,
    // unaliased, and aligned; the slice only lives while the state lock is
    // held.
    let descriptors =
        unsafe { core::slice::from_raw_parts_mut(table.virt().as_ptr().cast::<D>(), capacity) };
    let count = adma::build_descriptors(chunks, boundary_alignment, descriptors)?;
    Ok(count * core::mem::size_of::<D>())
}
