//! MFRC522 contactless reader driver.
//!
//! Drives the register-addressed reader chip over a pluggable byte bus
//! ([`Com`], with SPI and I2C transports included) to run the ISO/IEC
//! 14443-3 Type A protocol: REQA/WUPA, cascade-level anticollision and
//! selection, CRC_A through the chip's coprocessor, and the MIFARE
//! Classic/Ultralight command set on top of the transceive primitive.
//!
//! Everything is synchronous and blocking. Busy-polls run against an
//! injected microsecond [`Clock`], so completion and timeout behavior is
//! testable without hardware.
#![cfg_attr(not(test), no_std)]

pub mod com;
pub mod com_i2c;
pub mod com_spi;
pub mod mfrc522;
pub mod picc;

pub use com::{Clock, Com};
pub use com_i2c::ComI2c;
pub use com_spi::ComSpi;
pub use mfrc522::{Answer, Mfrc522};
pub use picc::{MifareKey, Uid};

use thiserror::Error;

/// Every failing reader operation resolves to exactly one of these.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// The register bus itself failed; the protocol outcome is unknown.
    #[error("register bus fault")]
    Bus(E),
    /// The exchange was rejected or corrupted (parity, protocol, overflow).
    #[error("error in communication")]
    Communication,
    /// More than one PICC answered. Recoverable inside anticollision,
    /// where partial response bytes stay in the caller's buffer.
    #[error("collision detected")]
    Collision,
    /// Nothing happened before the hardware timer or software deadline.
    #[error("timeout in communication")]
    Timeout,
    /// A caller-supplied buffer is not big enough.
    #[error("buffer is not big enough")]
    NoRoom,
    /// A state the protocol engine can only reach through a bug.
    #[error("internal error in the code")]
    InternalError,
    /// Invalid argument, rejected before any bus activity.
    #[error("invalid argument")]
    Invalid,
    /// The CRC_A of a response does not match.
    #[error("CRC_A does not match")]
    CrcWrong,
    /// A MIFARE PICC answered with NAK instead of the 4 bit ACK.
    #[error("MIFARE PICC responded with NAK")]
    MifareNack,
}
