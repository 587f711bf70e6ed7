//! The SDHCI register file.
//!
//! Offsets and bit layouts follow the SD Host Controller Standard
//! Specification, version 3.00. Registers are modeled as
//! [`mycelium_bitfield`] bitfields and accessed through [`Registers`], which
//! is generic over an [`Mmio`] implementation so that tests can substitute an
//! in-memory register file for real hardware.

use core::fmt;

use mycelium_bitfield::bitfield;

/// The size in bytes of one SDHCI register set.
pub const REGISTER_SET_SIZE: usize = 0x100;

mod offset {
    pub const BLOCK_SIZE: usize = 0x04;
    pub const BLOCK_COUNT: usize = 0x06;
    pub const ARGUMENT: usize = 0x08;
    pub const TRANSFER_MODE: usize = 0x0c;
    pub const COMMAND: usize = 0x0e;
    pub const RESPONSE: usize = 0x10;
    pub const BUFFER_DATA: usize = 0x20;
    pub const PRESENT_STATE: usize = 0x24;
    pub const HOST_CONTROL1: usize = 0x28;
    pub const POWER_CONTROL: usize = 0x29;
    pub const CLOCK_CONTROL: usize = 0x2c;
    pub const TIMEOUT_CONTROL: usize = 0x2e;
    pub const SOFTWARE_RESET: usize = 0x2f;
    pub const INTERRUPT_STATUS: usize = 0x30;
    pub const INTERRUPT_STATUS_ENABLE: usize = 0x34;
    pub const INTERRUPT_SIGNAL_ENABLE: usize = 0x38;
    pub const HOST_CONTROL2: usize = 0x3e;
    pub const CAPABILITIES0: usize = 0x40;
    pub const CAPABILITIES1: usize = 0x44;
    pub const ADMA_ERROR_STATUS: usize = 0x54;
    pub const ADMA_SYSTEM_ADDRESS: usize = 0x58;
    pub const HOST_CONTROLLER_VERSION: usize = 0xfe;
}

/// Raw register access.
///
/// Implemented by [`DeviceMmio`] for real hardware; tests implement it over
/// plain memory. All offsets passed by the driver are naturally aligned and
/// within [`REGISTER_SET_SIZE`].
pub trait Mmio {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
}

/// [`Mmio`] over a memory-mapped hardware register set.
pub struct DeviceMmio {
    base: *mut u8,
}

// Safety: MMIO reads and writes are individually atomic, and the driver
// serializes accesses that must not interleave.
unsafe impl Send for DeviceMmio {}
unsafe impl Sync for DeviceMmio {}

impl DeviceMmio {
    /// Returns a new `DeviceMmio` over the register set at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to the first register of an SDHCI register set,
    /// mapped uncached, valid for volatile reads and writes of
    /// [`REGISTER_SET_SIZE`] bytes for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }
}

impl Mmio for DeviceMmio {
    fn read8(&self, offset: usize) -> u8 {
        unsafe { (self.base.add(offset) as *const u8).read_volatile() }
    }

    fn read16(&self, offset: usize) -> u16 {
        unsafe { (self.base.add(offset) as *const u16).read_volatile() }
    }

    fn read32(&self, offset: usize) -> u32 {
        unsafe { (self.base.add(offset) as *const u32).read_volatile() }
    }

    fn write8(&self, offset: usize, value: u8) {
        unsafe { (self.base.add(offset) as *mut u8).write_volatile(value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        unsafe { (self.base.add(offset) as *mut u16).write_volatile(value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { (self.base.add(offset) as *mut u32).write_volatile(value) }
    }
}

/// An integer width a register can be read or written at.
pub trait Word: Copy {
    fn read(mmio: &impl Mmio, offset: usize) -> Self;
    fn write(self, mmio: &impl Mmio, offset: usize);
}

impl Word for u8 {
    fn read(mmio: &impl Mmio, offset: usize) -> Self {
        mmio.read8(offset)
    }

    fn write(self, mmio: &impl Mmio, offset: usize) {
        mmio.write8(offset, self)
    }
}

impl Word for u16 {
    fn read(mmio: &impl Mmio, offset: usize) -> Self {
        mmio.read16(offset)
    }

    fn write(self, mmio: &impl Mmio, offset: usize) {
        mmio.write16(offset, self)
    }
}

impl Word for u32 {
    fn read(mmio: &impl Mmio, offset: usize) -> Self {
        mmio.read32(offset)
    }

    fn write(self, mmio: &impl Mmio, offset: usize) {
        mmio.write32(offset, self)
    }
}

/// A register with a fixed offset in the SDHCI register set.
pub trait Register: Sized {
    type Word: Word;
    const OFFSET: usize;

    fn from_word(word: Self::Word) -> Self;
    fn to_word(&self) -> Self::Word;
}

macro_rules! impl_register {
    ($Reg:ty, $Word:ty, $offset:expr) => {
        impl Register for $Reg {
            type Word = $Word;
            const OFFSET: usize = $offset;

            fn from_word(word: $Word) -> Self {
                Self::from_bits(word)
            }

            fn to_word(&self) -> $Word {
                self.bits()
            }
        }
    };
}

/// The SDHCI register set, accessed through an [`Mmio`] implementation.
pub struct Registers<M> {
    mmio: M,
}

impl<M: Mmio> Registers<M> {
    pub(crate) const fn new(mmio: M) -> Self {
        Self { mmio }
    }

    pub(crate) fn read<R: Register>(&self) -> R {
        R::from_word(R::Word::read(&self.mmio, R::OFFSET))
    }

    pub(crate) fn write<R: Register>(&self, value: R) {
        value.to_word().write(&self.mmio, R::OFFSET)
    }

    pub(crate) fn set_block_size(&self, bytes: u16) {
        self.mmio.write16(offset::BLOCK_SIZE, bytes)
    }

    pub(crate) fn set_block_count(&self, blocks: u16) {
        self.mmio.write16(offset::BLOCK_COUNT, blocks)
    }

    pub(crate) fn set_argument(&self, arg: u32) {
        self.mmio.write32(offset::ARGUMENT, arg)
    }

    /// Reads the `idx`th 32-bit word of the response register.
    pub(crate) fn response(&self, idx: usize) -> u32 {
        debug_assert!(idx < 4);
        self.mmio.read32(offset::RESPONSE + idx * 4)
    }

    pub(crate) fn buffer_data(&self) -> u32 {
        self.mmio.read32(offset::BUFFER_DATA)
    }

    pub(crate) fn set_buffer_data(&self, word: u32) {
        self.mmio.write32(offset::BUFFER_DATA, word)
    }

    pub(crate) fn interrupt_status(&self) -> Interrupt {
        Interrupt::from_bits(self.mmio.read32(offset::INTERRUPT_STATUS))
    }

    /// Writing a 1 to a status bit clears it.
    pub(crate) fn set_interrupt_status(&self, irq: Interrupt) {
        self.mmio.write32(offset::INTERRUPT_STATUS, irq.bits())
    }

    pub(crate) fn interrupt_status_enable(&self) -> Interrupt {
        Interrupt::from_bits(self.mmio.read32(offset::INTERRUPT_STATUS_ENABLE))
    }

    pub(crate) fn set_interrupt_status_enable(&self, irq: Interrupt) {
        self.mmio.write32(offset::INTERRUPT_STATUS_ENABLE, irq.bits())
    }

    pub(crate) fn interrupt_signal_enable(&self) -> Interrupt {
        Interrupt::from_bits(self.mmio.read32(offset::INTERRUPT_SIGNAL_ENABLE))
    }

    pub(crate) fn set_interrupt_signal_enable(&self, irq: Interrupt) {
        self.mmio.write32(offset::INTERRUPT_SIGNAL_ENABLE, irq.bits())
    }

    pub(crate) fn adma_error_status(&self) -> u32 {
        self.mmio.read32(offset::ADMA_ERROR_STATUS)
    }

    /// Programs the 64-bit ADMA system address register pair.
    pub(crate) fn set_adma_address(&self, addr: u64) {
        self.mmio
            .write32(offset::ADMA_SYSTEM_ADDRESS, addr as u32);
        self.mmio
            .write32(offset::ADMA_SYSTEM_ADDRESS + 4, (addr >> 32) as u32);
    }
}

impl<M> fmt::Debug for Registers<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers").finish_non_exhaustive()
    }
}

bitfield! {
    /// The Transfer Mode register (offset `0x0C`).
    #[derive(PartialEq, Eq)]
    pub struct TransferMode<u16> {
        pub const DMA_ENABLE: bool;
        pub const BLOCK_COUNT_ENABLE: bool;
        pub const AUTO_CMD_ENABLE = 2;
        pub const READ: bool;
        pub const MULTI_BLOCK: bool;
    }
}

impl TransferMode {
    pub const AUTO_CMD_DISABLED: u16 = 0b00;
    pub const AUTO_CMD12: u16 = 0b01;
    pub const AUTO_CMD23: u16 = 0b10;
}

bitfield! {
    /// The Command register (offset `0x0E`).
    ///
    /// Writing this register starts command execution, so it must be written
    /// after [`TransferMode`] and every other transfer parameter.
    #[derive(PartialEq, Eq)]
    pub struct Command<u16> {
        pub const RESPONSE_TYPE = 2;
        const _RESERVED0 = 1;
        pub const COMMAND_CRC_CHECK: bool;
        pub const COMMAND_INDEX_CHECK: bool;
        pub const DATA_PRESENT: bool;
        pub const COMMAND_TYPE = 2;
        pub const COMMAND_INDEX = 6;
    }
}

impl Command {
    pub const RESPONSE_TYPE_NONE: u16 = 0b00;
    pub const RESPONSE_TYPE_136_BITS: u16 = 0b01;
    pub const RESPONSE_TYPE_48_BITS: u16 = 0b10;
    pub const RESPONSE_TYPE_48_BITS_WITH_BUSY: u16 = 0b11;

    pub const COMMAND_TYPE_NORMAL: u16 = 0b00;
    pub const COMMAND_TYPE_SUSPEND: u16 = 0b01;
    pub const COMMAND_TYPE_RESUME: u16 = 0b10;
    pub const COMMAND_TYPE_ABORT: u16 = 0b11;
}

bitfield! {
    /// The Present State register (offset `0x24`).
    #[derive(PartialEq, Eq)]
    pub struct PresentState<u32> {
        pub const COMMAND_INHIBIT_CMD: bool;
        pub const COMMAND_INHIBIT_DAT: bool;
    }
}

bitfield! {
    /// The Host Control 1 register (offset `0x28`).
    #[derive(PartialEq, Eq)]
    pub struct HostControl1<u8> {
        pub const LED_ON: bool;
        pub const DATA_TRANSFER_WIDTH_4BIT: bool;
        pub const HIGH_SPEED_ENABLE: bool;
        pub const DMA_SELECT = 2;
        pub const EXTENDED_DATA_TRANSFER_WIDTH: bool;
    }
}

impl HostControl1 {
    pub const DMA_SELECT_SDMA: u8 = 0b00;
    pub const DMA_SELECT_ADMA2_32BIT: u8 = 0b10;
    pub const DMA_SELECT_ADMA2_64BIT: u8 = 0b11;
}

bitfield! {
    /// The Power Control register (offset `0x29`).
    #[derive(PartialEq, Eq)]
    pub struct PowerControl<u8> {
        pub const SD_BUS_POWER: bool;
        pub const SD_BUS_VOLTAGE = 3;
    }
}

impl PowerControl {
    pub const BUS_VOLTAGE_1V8: u8 = 0b101;
    pub const BUS_VOLTAGE_3V0: u8 = 0b110;
    pub const BUS_VOLTAGE_3V3: u8 = 0b111;
}

bitfield! {
    /// The Clock Control register (offset `0x2C`).
    ///
    /// The 10-bit SD clock divider is split across two fields, with its upper
    /// two bits below its lower eight; use
    /// [`frequency_select`](Self::frequency_select) and
    /// [`with_frequency_select`](Self::with_frequency_select) rather than the
    /// raw fields.
    #[derive(PartialEq, Eq)]
    pub struct ClockControl<u16> {
        pub const INTERNAL_CLOCK_ENABLE: bool;
        pub const INTERNAL_CLOCK_STABLE: bool;
        pub const SD_CLOCK_ENABLE: bool;
        const _RESERVED0 = 3;
        pub const FREQUENCY_SELECT_UPPER = 2;
        pub const FREQUENCY_SELECT = 8;
    }
}

impl ClockControl {
    /// The largest divider value the 10-bit field can hold.
    pub const MAX_FREQUENCY_SELECT: u16 = 0x3ff;

    /// Returns the full 10-bit divider value.
    pub fn frequency_select(&self) -> u16 {
        self.get(Self::FREQUENCY_SELECT) | (self.get(Self::FREQUENCY_SELECT_UPPER) << 8)
    }

    /// Returns `self` with the full 10-bit divider set to `divider`.
    ///
    /// Values above [`MAX_FREQUENCY_SELECT`](Self::MAX_FREQUENCY_SELECT) are
    /// truncated.
    pub fn with_frequency_select(self, divider: u16) -> Self {
        self.with(Self::FREQUENCY_SELECT, divider & 0xff)
            .with(Self::FREQUENCY_SELECT_UPPER, (divider >> 8) & 0b11)
    }
}

bitfield! {
    /// The Timeout Control register (offset `0x2E`).
    #[derive(PartialEq, Eq)]
    pub struct TimeoutControl<u8> {
        pub const DATA_TIMEOUT_COUNTER = 4;
    }
}

impl TimeoutControl {
    /// The longest timeout the counter can express (TMCLK * 2^27).
    pub const MAX_DATA_TIMEOUT: u8 = 0xe;
}

bitfield! {
    /// The Software Reset register (offset `0x2F`).
    ///
    /// The controller clears each bit once the corresponding reset finishes.
    #[derive(PartialEq, Eq)]
    pub struct SoftwareReset<u8> {
        pub const RESET_ALL: bool;
        pub const RESET_CMD: bool;
        pub const RESET_DAT: bool;
    }
}

bitfield! {
    /// Shared layout of the Interrupt Status (offset `0x30`), Interrupt
    /// Status Enable (offset `0x34`), and Interrupt Signal Enable (offset
    /// `0x38`) registers.
    #[derive(PartialEq, Eq)]
    pub struct Interrupt<u32> {
        pub const COMMAND_COMPLETE: bool;
        pub const TRANSFER_COMPLETE: bool;
        pub const BLOCK_GAP_EVENT: bool;
        pub const DMA_INTERRUPT: bool;
        pub const BUFFER_WRITE_READY: bool;
        pub const BUFFER_READ_READY: bool;
        pub const CARD_INSERTION: bool;
        pub const CARD_REMOVAL: bool;
        pub const CARD_INTERRUPT: bool;
        const _RESERVED0 = 6;
        pub const ERROR: bool;
        pub const COMMAND_TIMEOUT_ERROR: bool;
        pub const COMMAND_CRC_ERROR: bool;
        pub const COMMAND_END_BIT_ERROR: bool;
        pub const COMMAND_INDEX_ERROR: bool;
        pub const DATA_TIMEOUT_ERROR: bool;
        pub const DATA_CRC_ERROR: bool;
        pub const DATA_END_BIT_ERROR: bool;
        pub const CURRENT_LIMIT_ERROR: bool;
        pub const AUTO_CMD_ERROR: bool;
        pub const ADMA_ERROR: bool;
        pub const TUNING_ERROR: bool;
    }
}

impl Interrupt {
    /// Returns `self` with the normal interrupts the driver consumes set.
    pub fn enable_normal(self) -> Self {
        self.with(Self::COMMAND_COMPLETE, true)
            .with(Self::TRANSFER_COMPLETE, true)
            .with(Self::BUFFER_WRITE_READY, true)
            .with(Self::BUFFER_READ_READY, true)
    }

    /// Returns `self` with every error interrupt set.
    pub fn enable_errors(self) -> Self {
        self.with(Self::COMMAND_TIMEOUT_ERROR, true)
            .with(Self::COMMAND_CRC_ERROR, true)
            .with(Self::COMMAND_END_BIT_ERROR, true)
            .with(Self::COMMAND_INDEX_ERROR, true)
            .with(Self::DATA_TIMEOUT_ERROR, true)
            .with(Self::DATA_CRC_ERROR, true)
            .with(Self::DATA_END_BIT_ERROR, true)
            .with(Self::CURRENT_LIMIT_ERROR, true)
            .with(Self::AUTO_CMD_ERROR, true)
            .with(Self::ADMA_ERROR, true)
            .with(Self::TUNING_ERROR, true)
    }

    /// Returns `true` if any error bit is set in this status value.
    pub fn is_error(&self) -> bool {
        self.get(Self::ERROR) || (self.bits() & Self::ERROR_MASK) != 0
    }

    const ERROR_MASK: u32 = 0x07ff_0000;
}

bitfield! {
    /// The Host Control 2 register (offset `0x3E`).
    #[derive(PartialEq, Eq)]
    pub struct HostControl2<u16> {
        pub const UHS_MODE_SELECT = 3;
        pub const VOLTAGE_1V8_SIGNALLING_ENABLE: bool;
        const _RESERVED0 = 2;
        pub const EXECUTE_TUNING: bool;
        pub const USE_TUNED_CLOCK: bool;
    }
}

impl HostControl2 {
    pub const UHS_MODE_SDR12: u16 = 0b000;
    pub const UHS_MODE_SDR25: u16 = 0b001;
    pub const UHS_MODE_SDR50: u16 = 0b010;
    pub const UHS_MODE_SDR104: u16 = 0b011;
    pub const UHS_MODE_DDR50: u16 = 0b100;
    pub const UHS_MODE_HS400: u16 = 0b101;
}

bitfield! {
    /// The first Capabilities register (offset `0x40`).
    #[derive(PartialEq, Eq)]
    pub struct Capabilities0<u32> {
        const _RESERVED0 = 8;
        pub const BASE_CLOCK_FREQUENCY_MHZ = 8;
        const _RESERVED1 = 2;
        pub const BUS_WIDTH_8_SUPPORT: bool;
        pub const ADMA2_SUPPORT: bool;
        const _RESERVED2 = 1;
        pub const HIGH_SPEED_SUPPORT: bool;
        pub const SDMA_SUPPORT: bool;
        pub const SUSPEND_RESUME_SUPPORT: bool;
        pub const VOLTAGE_3V3_SUPPORT: bool;
        pub const VOLTAGE_3V0_SUPPORT: bool;
        pub const VOLTAGE_1V8_SUPPORT: bool;
        pub const V3_64_BIT_SYSTEM_ADDRESS_SUPPORT: bool;
    }
}

impl Capabilities0 {
    /// The base clock frequency in Hz, or 0 if the controller does not
    /// report one.
    pub fn base_clock_frequency_hz(&self) -> u32 {
        self.get(Self::BASE_CLOCK_FREQUENCY_MHZ) * 1_000_000
    }
}

bitfield! {
    /// The second Capabilities register (offset `0x44`).
    #[derive(PartialEq, Eq)]
    pub struct Capabilities1<u32> {
        pub const SDR50_SUPPORT: bool;
        pub const SDR104_SUPPORT: bool;
        pub const DDR50_SUPPORT: bool;
        const _RESERVED0 = 10;
        pub const USE_TUNING_FOR_SDR50: bool;
    }
}

bitfield! {
    /// The Host Controller Version register (offset `0xFE`).
    #[derive(PartialEq, Eq)]
    pub struct HostControllerVersion<u16> {
        pub const SPECIFICATION_VERSION = 8;
        pub const VENDOR_VERSION = 8;
    }
}

impl HostControllerVersion {
    /// The encoding of SDHCI version 3.00, the minimum this driver supports.
    pub const SPECIFICATION_VERSION_3_00: u16 = 2;
}

impl_register!(TransferMode, u16, offset::TRANSFER_MODE);
impl_register!(Command, u16, offset::COMMAND);
impl_register!(PresentState, u32, offset::PRESENT_STATE);
impl_register!(HostControl1, u8, offset::HOST_CONTROL1);
impl_register!(PowerControl, u8, offset::POWER_CONTROL);
impl_register!(ClockControl, u16, offset::CLOCK_CONTROL);
impl_register!(TimeoutControl, u8, offset::TIMEOUT_CONTROL);
impl_register!(SoftwareReset, u8, offset::SOFTWARE_RESET);
impl_register!(HostControl2, u16, offset::HOST_CONTROL2);
impl_register!(Capabilities0, u32, offset::CAPABILITIES0);
impl_register!(Capabilities1, u32, offset::CAPABILITIES1);
impl_register!(HostControllerVersion, u16, offset::HOST_CONTROLLER_VERSION);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    #[test]
    fn layouts_valid() {
        TransferMode::assert_valid();
        Command::assert_valid();
        PresentState::assert_valid();
        HostControl1::assert_valid();
        PowerControl::assert_valid();
        ClockControl::assert_valid();
        TimeoutControl::assert_valid();
        SoftwareReset::assert_valid();
        Interrupt::assert_valid();
        HostControl2::assert_valid();
        Capabilities0::assert_valid();
        Capabilities1::assert_valid();
        HostControllerVersion::assert_valid();
    }

    #[test]
    fn command_encoding() {
        let cmd = Command::new()
            .with(Command::COMMAND_INDEX, 17)
            .with(Command::RESPONSE_TYPE, Command::RESPONSE_TYPE_48_BITS)
            .with(Command::COMMAND_CRC_CHECK, true)
            .with(Command::COMMAND_INDEX_CHECK, true)
            .with(Command::DATA_PRESENT, true);
        assert_eq!(cmd.bits(), (17 << 8) | 0b11_1010);
    }

    #[test]
    fn interrupt_error_detection() {
        assert!(!Interrupt::new()
            .with(Interrupt::COMMAND_COMPLETE, true)
            .is_error());
        assert!(Interrupt::new().with(Interrupt::ERROR, true).is_error());
        assert!(Interrupt::new()
            .with(Interrupt::DATA_CRC_ERROR, true)
            .is_error());
        assert!(Interrupt::new()
            .with(Interrupt::TUNING_ERROR, true)
            .is_error());
    }

    #[test]
    fn error_enable_mask_matches_bits() {
        assert_eq!(
            Interrupt::new().enable_errors().bits(),
            Interrupt::ERROR_MASK
        );
    }

    proptest! {
        #[test]
        fn clock_divider_field_roundtrips(divider in 0u16..=ClockControl::MAX_FREQUENCY_SELECT) {
            let clock = ClockControl::new().with_frequency_select(divider);
            prop_assert_eq!(clock.frequency_select(), divider);
            // the split must not disturb neighboring fields
            prop_assert_eq!(clock.get(ClockControl::SD_CLOCK_ENABLE), false);
            prop_assert_eq!(clock.bits() & 0b111, 0);
        }
    }

    #[test]
    fn base_clock_capability() {
        let caps = Capabilities0::new().with(Capabilities0::BASE_CLOCK_FREQUENCY_MHZ, 200);
        assert_eq!(caps.base_clock_frequency_hz(), 200_000_000);
        assert_eq!(Capabilities0::new().base_clock_frequency_hz(), 0);
    }
}
