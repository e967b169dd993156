//! I2C transport. The MFRC522 takes the raw register address as a pointer
//! byte; burst access keeps re-addressing the same register, which is what
//! FIFO streaming needs.

use embedded_hal::blocking::i2c;

use crate::com::{merge_rx_align, Com};

pub struct ComI2c<I2C> {
    i2c: I2C,
    addr: u8,
}

impl<I2C> ComI2c<I2C> {
    pub fn new(i2c: I2C, addr: u8) -> Self {
        Self { i2c, addr }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C, E> Com for ComI2c<I2C>
where
    I2C: i2c::Write<Error = E> + i2c::Read<Error = E>,
{
    type Error = E;

    fn read_register(&mut self, reg: u8) -> Result<u8, E> {
        let mut value = [0u8];
        self.i2c.write(self.addr, &[reg])?;
        self.i2c.read(self.addr, &mut value)?;
        Ok(value[0])
    }

    fn read_bytes(&mut self, reg: u8, buf: &mut [u8], rx_align: u8) -> Result<(), E> {
        if buf.is_empty() {
            return Ok(());
        }
        let first = buf[0];
        self.i2c.write(self.addr, &[reg])?;
        self.i2c.read(self.addr, buf)?;
        if rx_align != 0 {
            buf[0] = merge_rx_align(first, buf[0], rx_align);
        }
        Ok(())
    }

    fn write_register(&mut self, reg: u8, value: u8) -> Result<(), E> {
        self.i2c.write(self.addr, &[reg, value])
    }

    fn write_bytes(&mut self, reg: u8, values: &[u8]) -> Result<(), E> {
        // The pointer byte plus at most one FIFO's worth of data per frame.
        let mut frame = [0u8; 65];
        frame[0] = reg;
        for chunk in values.chunks(64) {
            frame[1..=chunk.len()].copy_from_slice(chunk);
            self.i2c.write(self.addr, &frame[..=chunk.len()])?;
        }
        Ok(())
    }
}
