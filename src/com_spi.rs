//! SPI transport. Address framing per datasheet section 8.1.2: bit 7 set
//! for reads, the register in bits 6..1, bit 0 low. During a burst read the
//! address byte is repeated so the chip keeps shifting out the same
//! register, with a trailing zero byte to clock out the final value.

use embedded_hal::blocking::spi;
use embedded_hal::digital::v2::OutputPin;

use crate::com::{merge_rx_align, Com};

/// Fault from the SPI bus or from the chip-select line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiError<E, P> {
    Spi(E),
    Pin(P),
}

pub struct ComSpi<SPI, NSS> {
    spi: SPI,
    nss: NSS,
}

impl<SPI, NSS> ComSpi<SPI, NSS> {
    pub fn new(spi: SPI, nss: NSS) -> Self {
        Self { spi, nss }
    }

    pub fn release(self) -> (SPI, NSS) {
        (self.spi, self.nss)
    }
}

fn read_address(reg: u8) -> u8 {
    ((reg << 1) | 0b1000_0000) & 0b1111_1110
}

fn write_address(reg: u8) -> u8 {
    (reg << 1) & 0b0111_1110
}

impl<SPI, NSS, E, P> ComSpi<SPI, NSS>
where
    SPI: spi::Transfer<u8, Error = E> + spi::Write<u8, Error = E>,
    NSS: OutputPin<Error = P>,
{
    fn with_nss_low<F, T>(&mut self, f: F) -> Result<T, SpiError<E, P>>
    where
        F: FnOnce(&mut SPI) -> Result<T, E>,
    {
        self.nss.set_low().map_err(SpiError::Pin)?;
        let result = f(&mut self.spi);
        self.nss.set_high().map_err(SpiError::Pin)?;
        result.map_err(SpiError::Spi)
    }
}

impl<SPI, NSS, E, P> Com for ComSpi<SPI, NSS>
where
    SPI: spi::Transfer<u8, Error = E> + spi::Write<u8, Error = E>,
    NSS: OutputPin<Error = P>,
{
    type Error = SpiError<E, P>;

    fn read_register(&mut self, reg: u8) -> Result<u8, Self::Error> {
        let mut frame = [read_address(reg), 0x00];
        self.with_nss_low(|spi| spi.transfer(&mut frame).map(|_| ()))?;
        Ok(frame[1])
    }

    fn read_bytes(&mut self, reg: u8, buf: &mut [u8], rx_align: u8) -> Result<(), Self::Error> {
        if buf.is_empty() {
            return Ok(());
        }
        let addr = read_address(reg);
        let first = buf[0];
        // One FIFO's worth per transfer; the register pointer survives
        // the chip-select gap.
        let mut frame = [0u8; 65];
        for chunk in buf.chunks_mut(64) {
            let n = chunk.len();
            frame[..n].fill(addr);
            frame[n] = 0x00;
            self.with_nss_low(|spi| {
                let rx = spi.transfer(&mut frame[..=n])?;
                chunk.copy_from_slice(&rx[1..]);
                Ok(())
            })?;
        }
        if rx_align != 0 {
            buf[0] = merge_rx_align(first, buf[0], rx_align);
        }
        Ok(())
    }

    fn write_register(&mut self, reg: u8, value: u8) -> Result<(), Self::Error> {
        let frame = [write_address(reg), value];
        self.with_nss_low(|spi| spi.write(&frame))
    }

    fn write_bytes(&mut self, reg: u8, values: &[u8]) -> Result<(), Self::Error> {
        let addr = [write_address(reg)];
        self.with_nss_low(|spi| {
            spi.write(&addr)?;
            spi.write(values)
        })
    }
}
