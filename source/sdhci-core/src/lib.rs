//! A platform-independent driver core for SD Host Controller Interface
//! (SDHCI) compliant SD/MMC host controllers.
//!
//! The [SDHCI specification] defines a standard register interface implemented
//! by most SD/MMC host controllers. This crate implements the host-side
//! protocol against that register file: command issue, PIO and ADMA2 data
//! transfers, bus configuration (clock, width, voltage, timing), tuning, and
//! error recovery. It contains no platform integration of its own; a platform
//! provides MMIO access through the [`regs::Mmio`] trait and DMA, cache, and
//! interrupt plumbing through the [`Platform`] trait, and drives the
//! controller through [`Sdhci`].
//!
//! [SDHCI specification]: https://www.sdcard.org/developers/sd-standard-overview/host-controller/
#![cfg_attr(not(test), no_std)]

use core::fmt;

pub mod adma;
pub mod host;
pub mod platform;
pub mod regs;
pub mod req;

pub use self::{
    host::{BusWidth, HostInfo, Sdhci, SignalVoltage, Timing, MAX_TRANSFER_UNBOUNDED},
    platform::{Platform, Quirks},
    req::Request,
};

/// Errors returned by the driver.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A hardware handshake (reset, clock stabilization, inhibit release)
    /// did not complete within its deadline.
    Timeout,
    /// The controller reported an error interrupt for the request (timeout
    /// on the bus, CRC, end bit, ADMA fault, ...).
    Io,
    /// The controller does not support the requested operation.
    NotSupported,
    /// The request itself is malformed.
    InvalidArgs,
    /// A request is already in flight; retry once it completes.
    ShouldWait,
    /// The controller misbehaved in a way that is not attributable to the
    /// request (e.g. a voltage switch that did not take effect).
    Internal,
    /// A configuration value is outside the range the hardware can express.
    OutOfRange,
    /// Insufficient descriptor or buffer memory for the request.
    NoMemory,
    /// The operation was canceled, e.g. because the driver is shutting down.
    Canceled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Timeout => "operation timed out",
            Self::Io => "transfer error",
            Self::NotSupported => "not supported by this controller",
            Self::InvalidArgs => "invalid request",
            Self::ShouldWait => "a request is already in flight",
            Self::Internal => "controller misbehaved",
            Self::OutOfRange => "value out of range",
            Self::NoMemory => "out of descriptor or buffer memory",
            Self::Canceled => "operation canceled",
        };
        f.write_str(msg)
    }
}
