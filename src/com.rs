//! Contracts between the driver and its environment: a byte-oriented
//! register bus and a monotonic microsecond clock.

/// Register bus of the MFRC522. Implementations capture the device address
/// (I2C) or chip select (SPI) themselves; the driver only names registers.
pub trait Com {
    type Error;

    /// Reads one register.
    fn read_register(&mut self, reg: u8) -> Result<u8, Self::Error>;

    /// Burst read from `reg` into `buf`. With a non-zero `rx_align`, bit
    /// positions `rx_align..7` of the first byte come from the wire while
    /// positions below keep the buffer's prior content.
    fn read_bytes(&mut self, reg: u8, buf: &mut [u8], rx_align: u8) -> Result<(), Self::Error>;

    /// Writes one register.
    fn write_register(&mut self, reg: u8, value: u8) -> Result<(), Self::Error>;

    /// Burst write of `values` to `reg`.
    fn write_bytes(&mut self, reg: u8, values: &[u8]) -> Result<(), Self::Error>;
}

/// Monotonic microsecond clock backing the driver's software deadlines.
pub trait Clock {
    fn now_us(&mut self) -> u64;
}

/// First-byte merge for aligned burst reads: keeps bits `0..rx_align` of
/// `previous` and takes the rest from `received`.
pub fn merge_rx_align(previous: u8, received: u8, rx_align: u8) -> u8 {
    let mask = 0xFFu8 << rx_align;
    (previous & !mask) | (received & mask)
}
