//! The MFRC522 driver proper: PCD command sequencing, the hardware CRC
//! coprocessor, ISO/IEC 14443-3 Type A selection and the MIFARE command
//! set, all expressed against the [`Com`] register bus.

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, warn};

use crate::com::{Clock, Com};
use crate::picc::{self, MifareKey, Uid};
use crate::Error;

type Result<T, E> = core::result::Result<T, Error<E>>;

/// Register addresses, datasheet section 9.2. The CRC result, timer reload
/// and timer counter pairs keep the datasheet order: the lower address
/// holds the high byte.
#[derive(Debug, Clone, Copy)]
pub enum Register {
    CommandReg = 0x01,
    ComlEnReg = 0x02,
    DivlEnReg = 0x03,
    ComIrqReg = 0x04,
    DivIrqReg = 0x05,
    ErrorReg = 0x06,
    Status1Reg = 0x07,
    Status2Reg = 0x08,
    FIFODataReg = 0x09,
    FIFOLevelReg = 0x0A,
    WaterLevelReg = 0x0B,
    ControlReg = 0x0C,
    BitFramingReg = 0x0D,
    CollReg = 0x0E,
    ModeReg = 0x11,
    TxModeReg = 0x12,
    RxModeReg = 0x13,
    TxControlReg = 0x14,
    TxASKReg = 0x15,
    TxSelReg = 0x16,
    RxSelReg = 0x17,
    RxThresholdReg = 0x18,
    DemodReg = 0x19,
    MfTxReg = 0x1C,
    MfRxReg = 0x1D,
    SerialSpeedReg = 0x1F,
    CRCResultRegHigh = 0x21,
    CRCResultRegLow = 0x22,
    ModWidthReg = 0x24,
    RFCfgReg = 0x26,
    GsNReg = 0x27,
    CWGsPReg = 0x28,
    ModGsPReg = 0x29,
    TModeReg = 0x2A,
    TPrescalerReg = 0x2B,
    TReloadRegHigh = 0x2C,
    TReloadRegLow = 0x2D,
    TCounterValRegHigh = 0x2E,
    TCounterValRegLow = 0x2F,
    TestSel1Reg = 0x31,
    TestSel2Reg = 0x32,
    TestPinEnReg = 0x33,
    TestPinValueReg = 0x34,
    TestBusReg = 0x35,
    AutoTestReg = 0x36,
    VersionReg = 0x37,
    AnalogTestReg = 0x38,
    TestDAC1Reg = 0x39,
    TestDAC2Reg = 0x3A,
    TestADCReg = 0x3B,
}

/// PCD command set, datasheet section 10.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Idle = 0b0000,
    Mem = 0b0001,
    GenerateRandomId = 0b0010,
    CalcCRC = 0b0011,
    Transmit = 0b0100,
    NoCmdChange = 0b0111,
    Receive = 0b1000,
    Transceive = 0b1100,
    MFAuthent = 0b1110,
    SoftReset = 0b1111,
}

// Software guards on the busy-poll loops. The chip's own 25 ms timer covers
// a silent card; these cover a chip that never raises any flag at all.
const TRANSCEIVE_DEADLINE_US: u64 = 35_700;
const CRC_DEADLINE_US: u64 = 89_000;

// Self test FIFO images, datasheet section 16.1, keyed on VersionReg.
// Version 0.0 (0x90), Philips preliminary specification revision 2.0.
const SELF_TEST_V0_0: [u8; 64] = [
    0x00, 0x87, 0x98, 0x0F, 0x49, 0xFF, 0x07, 0x19, 0xBF, 0x22, 0x30, 0x49, 0x59, 0x63, 0xAD,
    0xCA, 0x7F, 0xE3, 0x4E, 0x03, 0x5C, 0x4E, 0x49, 0x50, 0x47, 0x9A, 0x37, 0x61, 0xE7, 0xE2,
    0xC6, 0x2E, 0x75, 0x5A, 0xED, 0x04, 0x3D, 0x02, 0x4B, 0x78, 0x32, 0xFF, 0x58, 0x3B, 0x7C,
    0xE9, 0x00, 0x94, 0xB4, 0x4A, 0x59, 0x5B, 0xFD, 0xC9, 0x29, 0xDF, 0x35, 0x96, 0x98, 0x9E,
    0x4F, 0x30, 0x32, 0x8D,
];
// Version 1.0 (0x91).
const SELF_TEST_V1_0: [u8; 64] = [
    0x00, 0xC6, 0x37, 0xD5, 0x32, 0xB7, 0x57, 0x5C, 0xC2, 0xD8, 0x7C, 0x4D, 0xD9, 0x70, 0xC7,
    0x73, 0x10, 0xE6, 0xD2, 0xAA, 0x5E, 0xA1, 0x3E, 0x5A, 0x14, 0xAF, 0x30, 0x61, 0xC9, 0x70,
    0xDB, 0x2E, 0x64, 0x22, 0x72, 0xB5, 0xBD, 0x65, 0xF4, 0xEC, 0x22, 0xBC, 0xD3, 0x72, 0x35,
    0xCD, 0xAA, 0x41, 0x1F, 0xA7, 0xF3, 0x53, 0x14, 0xDE, 0x7D, 0xE0, 0x2D, 0x7B, 0x43, 0xA4,
    0x9A, 0x25, 0x17, 0xE1,
];
// Version 2.0 (0x92).
const SELF_TEST_V2_0: [u8; 64] = [
    0x00, 0xEB, 0x66, 0xBA, 0x57, 0xBF, 0x23, 0x95, 0xD0, 0xE3, 0x0D, 0x3D, 0x27, 0x89, 0x5C,
    0xDE, 0x9D, 0x3B, 0xA7, 0x00, 0x21, 0x5B, 0x89, 0x82, 0x51, 0x3A, 0xEB, 0x02, 0x0C, 0xA5,
    0x00, 0x49, 0x7C, 0x84, 0x4D, 0xB3, 0xCC, 0xD2, 0x1B, 0x81, 0x5D, 0x48, 0x76, 0xD5, 0x71,
    0x61, 0x21, 0xA9, 0x86, 0x96, 0x83, 0x38, 0xCF, 0x9D, 0x5B, 0x6D, 0xDC, 0x15, 0xBA, 0x3E,
    0x7D, 0x95, 0x3B, 0x2F,
];

/// What a completed exchange left in the caller's receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Answer {
    /// Bytes written to the buffer.
    pub len: usize,
    /// Valid bits in the last byte; 0 means all eight.
    pub valid_bits: u8,
}

/// MIFARE value block image: the little-endian value and its complement
/// each stored twice, then the address and its complement each twice.
fn value_block(value: i32, block: u8) -> [u8; 16] {
    let v = value.to_le_bytes();
    let mut out = [0u8; 16];
    out[..4].copy_from_slice(&v);
    for i in 0..4 {
        out[4 + i] = !v[i];
    }
    out[8..12].copy_from_slice(&v);
    out[12] = block;
    out[13] = !block;
    out[14] = block;
    out[15] = !block;
    out
}

pub struct Mfrc522<C, CLK, D> {
    com: C,
    clock: CLK,
    delay: D,
}

impl<C, CLK, D, E> Mfrc522<C, CLK, D>
where
    C: Com<Error = E>,
    CLK: Clock,
    D: DelayMs<u16>,
{
    pub fn new(com: C, clock: CLK, delay: D) -> Self {
        Self { com, clock, delay }
    }

    /// Hands the bus, clock and delay back.
    pub fn release(self) -> (C, CLK, D) {
        (self.com, self.clock, self.delay)
    }

    pub fn read_register(&mut self, reg: Register) -> Result<u8, E> {
        self.com.read_register(reg as u8).map_err(Error::Bus)
    }

    pub fn read_bytes(&mut self, reg: Register, buf: &mut [u8], rx_align: u8) -> Result<(), E> {
        self.com
            .read_bytes(reg as u8, buf, rx_align)
            .map_err(Error::Bus)
    }

    pub fn write_register(&mut self, reg: Register, value: u8) -> Result<(), E> {
        self.com.write_register(reg as u8, value).map_err(Error::Bus)
    }

    pub fn write_bytes(&mut self, reg: Register, values: &[u8]) -> Result<(), E> {
        self.com.write_bytes(reg as u8, values).map_err(Error::Bus)
    }

    pub fn set_register_bitmask(&mut self, reg: Register, mask: u8) -> Result<(), E> {
        let value = self.read_register(reg)?;
        self.write_register(reg, value | mask)
    }

    pub fn clear_register_bitmask(&mut self, reg: Register, mask: u8) -> Result<(), E> {
        let value = self.read_register(reg)?;
        self.write_register(reg, value & !mask)
    }

    /// Resets the chip and applies the ISO/IEC 14443-3 Type A baseline.
    pub fn init(&mut self) -> Result<(), E> {
        self.reset()?;

        self.write_register(Register::TxModeReg, 0x00)?;
        self.write_register(Register::RxModeReg, 0x00)?;
        self.write_register(Register::ModWidthReg, 0x26)?;
        // TAuto=1: the timer starts automatically at the end of every
        // transmission. f_timer = 13.56 MHz / (2 * TPreScaler + 1).
        self.write_register(Register::TModeReg, 0x80)?;
        // TPreScaler = TModeReg[3..0]:TPrescalerReg = 0x0A9 = 169, a 25 us tick.
        self.write_register(Register::TPrescalerReg, 0xA9)?;
        // Reload 0x03E8 = 1000 ticks: 25 ms until the timer interrupt.
        self.write_register(Register::TReloadRegHigh, 0x03)?;
        self.write_register(Register::TReloadRegLow, 0xE8)?;
        // Force a 100 % ASK modulation independent of ModGsPReg.
        self.write_register(Register::TxASKReg, 0x40)?;
        // CRC coprocessor preset 0x6363, the CRC_A of ISO 14443-3 6.2.4.
        self.write_register(Register::ModeReg, 0x3D)?;
        self.antenna_on()?;

        let version = self.version()?;
        debug!("mfrc522 initialized, version {:#04x}", version);
        Ok(())
    }

    /// Soft reset. The power-down bit must clear within three settle
    /// rounds, otherwise the chip is wedged and the caller gets `Timeout`.
    pub fn reset(&mut self) -> Result<(), E> {
        self.write_register(Register::CommandReg, Command::SoftReset as u8)?;
        for _ in 0..3 {
            self.delay.delay_ms(50);
            let cmd = self.read_register(Register::CommandReg)?;
            if cmd & (1 << 4) == 0 {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    pub fn antenna_on(&mut self) -> Result<(), E> {
        let control = self.read_register(Register::TxControlReg)?;
        if control & 0x03 != 0x03 {
            self.write_register(Register::TxControlReg, control | 0x03)?;
        }
        Ok(())
    }

    pub fn antenna_off(&mut self) -> Result<(), E> {
        self.clear_register_bitmask(Register::TxControlReg, 0x03)
    }

    /// Receiver gain, the three documented bits of RFCfgReg.
    pub fn antenna_gain(&mut self) -> Result<u8, E> {
        Ok(self.read_register(Register::RFCfgReg)? & 0x70)
    }

    pub fn set_antenna_gain(&mut self, mask: u8) -> Result<(), E> {
        if self.antenna_gain()? != mask & 0x70 {
            self.clear_register_bitmask(Register::RFCfgReg, 0x70)?;
            self.set_register_bitmask(Register::RFCfgReg, mask & 0x70)?;
        }
        Ok(())
    }

    /// Firmware version byte; 0x91 and 0x92 are production silicon.
    pub fn version(&mut self) -> Result<u8, E> {
        self.read_register(Register::VersionReg)
    }

    /// Executes one chip command against the PICC and collects the answer.
    ///
    /// Loads `send_data` (the last byte holding `valid_bits` bits, 0 for
    /// all eight) into the FIFO, starts `command` and polls ComIrqReg until
    /// a bit of `wait_irq` is set. The hardware timer bit or the software
    /// deadline end the wait with `Timeout`. Received bytes land in
    /// `back_data` with the first byte aligned at `rx_align`; on a
    /// collision the bytes received so far stay there. No retries.
    pub fn communicate_with_picc(
        &mut self,
        command: Command,
        wait_irq: u8,
        send_data: &[u8],
        mut back_data: Option<&mut [u8]>,
        valid_bits: u8,
        rx_align: u8,
        check_crc: bool,
    ) -> Result<Answer, E> {
        // RxAlign = BitFramingReg[6..4], TxLastBits = BitFramingReg[2..0].
        let bit_framing = (rx_align << 4) + valid_bits;

        self.write_register(Register::CommandReg, Command::Idle as u8)?;
        self.write_register(Register::ComIrqReg, 0x7F)?;
        self.write_register(Register::FIFOLevelReg, 0x80)?;
        self.write_bytes(Register::FIFODataReg, send_data)?;
        self.write_register(Register::BitFramingReg, bit_framing)?;
        self.write_register(Register::CommandReg, command as u8)?;
        if command == Command::Transceive {
            // StartSend kicks off the transmission.
            self.set_register_bitmask(Register::BitFramingReg, 0x80)?;
        }

        let deadline = self.clock.now_us() + TRANSCEIVE_DEADLINE_US;
        loop {
            let irq = self.read_register(Register::ComIrqReg)?;
            if irq & wait_irq != 0 {
                break;
            }
            if irq & 0x01 != 0 {
                // The 25 ms hardware timer: nothing received.
                return Err(Error::Timeout);
            }
            if self.clock.now_us() >= deadline {
                // No flag at all; the chip itself may be gone.
                return Err(Error::Timeout);
            }
        }

        // BufferOvfl, ParityErr or ProtocolErr spoil the exchange.
        let error_reg = self.read_register(Register::ErrorReg)?;
        if error_reg & 0x13 != 0 {
            return Err(Error::Communication);
        }

        let mut answer = Answer::default();
        if let Some(back) = back_data.as_deref_mut() {
            let fifo_level = self.read_register(Register::FIFOLevelReg)? as usize;
            if fifo_level > back.len() {
                return Err(Error::NoRoom);
            }
            answer.len = fifo_level;
            self.read_bytes(Register::FIFODataReg, &mut back[..fifo_level], rx_align)?;
            // RxLastBits is the number of valid bits in the final byte.
            answer.valid_bits = self.read_register(Register::ControlReg)? & 0x07;
        }

        if error_reg & 0x08 != 0 {
            // CollErr. The caller's buffer keeps what arrived before it.
            return Err(Error::Collision);
        }

        if check_crc {
            if let Some(back) = back_data.as_deref() {
                // A lone 4 bit byte is the MIFARE NAK, not a CRC problem.
                if answer.len == 1 && answer.valid_bits == 4 {
                    return Err(Error::MifareNack);
                }
                if answer.len < 2 || answer.valid_bits != 0 {
                    return Err(Error::CrcWrong);
                }
                let crc = self.calculate_crc(&back[..answer.len - 2])?;
                if back[answer.len - 2] != crc[0] || back[answer.len - 1] != crc[1] {
                    return Err(Error::CrcWrong);
                }
            }
        }

        Ok(answer)
    }

    /// Transceive alias of [`communicate_with_picc`]: RxIRq or IdleIRq end
    /// the wait.
    ///
    /// [`communicate_with_picc`]: Self::communicate_with_picc
    pub fn transceive_data(
        &mut self,
        send_data: &[u8],
        back_data: Option<&mut [u8]>,
        valid_bits: u8,
        rx_align: u8,
        check_crc: bool,
    ) -> Result<Answer, E> {
        self.communicate_with_picc(
            Command::Transceive,
            0x30,
            send_data,
            back_data,
            valid_bits,
            rx_align,
            check_crc,
        )
    }

    /// Runs `data` through the CRC coprocessor and returns CRC_A, low byte
    /// first, as it is appended to frames on the wire.
    pub fn calculate_crc(&mut self, data: &[u8]) -> Result<[u8; 2], E> {
        self.write_register(Register::CommandReg, Command::Idle as u8)?;
        self.write_register(Register::DivIrqReg, 0x04)?;
        self.write_register(Register::FIFOLevelReg, 0x80)?;
        self.write_bytes(Register::FIFODataReg, data)?;
        self.write_register(Register::CommandReg, Command::CalcCRC as u8)?;

        let deadline = self.clock.now_us() + CRC_DEADLINE_US;
        loop {
            let irq = self.read_register(Register::DivIrqReg)?;
            if irq & 0x04 != 0 {
                self.write_register(Register::CommandReg, Command::Idle as u8)?;
                let low = self.read_register(Register::CRCResultRegLow)?;
                let high = self.read_register(Register::CRCResultRegHigh)?;
                return Ok([low, high]);
            }
            if self.clock.now_us() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Vendor self test, datasheet section 16.1.1. `Ok(true)` when the 64
    /// byte FIFO image matches the reference for this firmware version;
    /// unknown versions fail. A passing chip is re-initialized, since it
    /// does not come back from the test on its own.
    pub fn self_test(&mut self) -> Result<bool, E> {
        self.reset()?;

        // Clear the internal buffer with 25 zero bytes.
        self.write_register(Register::FIFOLevelReg, 0x80)?;
        self.write_bytes(Register::FIFODataReg, &[0u8; 25])?;
        self.write_register(Register::CommandReg, Command::Mem as u8)?;

        // Enable the self test and start it through CalcCRC.
        self.write_register(Register::AutoTestReg, 0x09)?;
        self.write_register(Register::FIFODataReg, 0x00)?;
        self.write_register(Register::CommandReg, Command::CalcCRC as u8)?;

        // CRCIRq is not reliable during the self test; poll the FIFO level
        // for the 64 byte image instead, bounded in case the test wedges.
        for _ in 0..0xFF {
            if self.read_register(Register::FIFOLevelReg)? >= 64 {
                break;
            }
        }
        self.write_register(Register::CommandReg, Command::Idle as u8)?;

        let mut result = [0u8; 64];
        self.read_bytes(Register::FIFODataReg, &mut result, 0)?;
        self.write_register(Register::AutoTestReg, 0x00)?;

        let version = self.version()?;
        let reference: &[u8; 64] = match version {
            0x90 => &SELF_TEST_V0_0,
            0x91 => &SELF_TEST_V1_0,
            0x92 => &SELF_TEST_V2_0,
            _ => {
                warn!("self test: no reference for version {:#04x}", version);
                return Ok(false);
            }
        };
        if result != *reference {
            warn!("self test: FIFO image mismatch on version {:#04x}", version);
            return Ok(false);
        }

        self.init()?;
        Ok(true)
    }

    /// REQA probe. Invites idle PICCs; the ATQA lands in `atqa`.
    pub fn request_a(&mut self, atqa: &mut [u8]) -> Result<(), E> {
        self.request_a_or_wakeup_a(picc::Command::REQA, atqa)
    }

    /// WUPA probe. Like REQA but also brings halted PICCs back.
    pub fn wakeup_a(&mut self, atqa: &mut [u8]) -> Result<(), E> {
        self.request_a_or_wakeup_a(picc::Command::WUPA, atqa)
    }

    pub fn request_a_or_wakeup_a(
        &mut self,
        command: picc::Command,
        atqa: &mut [u8],
    ) -> Result<(), E> {
        // The ATQA is two bytes.
        if atqa.len() < 2 {
            return Err(Error::NoRoom);
        }
        // ValuesAfterColl=0: bits received after a collision are cleared.
        self.clear_register_bitmask(Register::CollReg, 0x80)?;

        // Short frame format: only 7 bits of the single byte go out.
        let answer = self.transceive_data(&[command as u8], Some(atqa), 7, 0, false)?;
        if answer.len != 2 || answer.valid_bits != 0 {
            return Err(Error::Communication);
        }
        Ok(())
    }

    /// Resolves one PICC among several and selects it, walking up to three
    /// cascade levels. `valid_bits` of `uid` are taken as already known
    /// (0 starts from scratch); on success `uid` holds the complete UID
    /// and the SAK of the final level.
    pub fn select(&mut self, uid: &mut Uid, valid_bits: u8) -> Result<(), E> {
        // A UID has at most 80 bits.
        if valid_bits > 80 {
            return Err(Error::Invalid);
        }

        // One SELECT/ANTICOLLISION frame:
        //   byte 0      SEL, the cascade level command
        //   byte 1      NVB, whole bytes in the high nibble, extra bits low
        //   bytes 2..5  UID data for this level, byte 2 may be the cascade tag
        //   byte 6      BCC, XOR of bytes 2..5
        //   bytes 7..8  CRC_A, only with a full SELECT
        // Responses land in the tail of the same frame image, continuing a
        // partial byte in place through rx alignment; the transmit side
        // goes out through a scratch copy.
        let mut buffer = [0u8; 9];
        let mut tx = [0u8; 9];

        self.clear_register_bitmask(Register::CollReg, 0x80)?;

        let mut cascade_level: u8 = 1;
        loop {
            let (sel, uid_index, use_cascade_tag) = match cascade_level {
                1 => (picc::Command::SelCl1, 0usize, valid_bits != 0 && uid.size > 4),
                2 => (picc::Command::SelCl2, 3usize, valid_bits != 0 && uid.size > 7),
                3 => (picc::Command::SelCl3, 6usize, false),
                _ => return Err(Error::InternalError),
            };
            buffer[0] = sel as u8;

            // How many bits of this level are already known?
            let mut current_level_known_bits = valid_bits as i16 - (8 * uid_index) as i16;
            if current_level_known_bits < 0 {
                current_level_known_bits = 0;
            }

            let mut index = 2usize;
            if use_cascade_tag {
                buffer[index] = picc::Command::CT as u8;
                index += 1;
            }
            let mut bytes_to_copy = (current_level_known_bits / 8) as usize
                + if current_level_known_bits % 8 == 0 { 0 } else { 1 };
            if bytes_to_copy > 0 {
                // Only three level bytes remain next to a cascade tag.
                let max_bytes = if use_cascade_tag { 3 } else { 4 };
                if bytes_to_copy > max_bytes {
                    bytes_to_copy = max_bytes;
                }
                buffer[index..index + bytes_to_copy]
                    .copy_from_slice(&uid.bytes[uid_index..uid_index + bytes_to_copy]);
            }
            if use_cascade_tag {
                // The tag's bits count toward this level.
                current_level_known_bits += 8;
            }

            // Anticollision rounds until all 32 level bits are known, then
            // the full SELECT closes the level with a SAK.
            let answer = loop {
                let (buffer_used, rx_index, tx_last_bits) = if current_level_known_bits >= 32 {
                    buffer[1] = 0x70; // NVB: seven whole bytes
                    buffer[6] = buffer[2] ^ buffer[3] ^ buffer[4] ^ buffer[5];
                    let crc = self.calculate_crc(&buffer[..7])?;
                    buffer[7] = crc[0];
                    buffer[8] = crc[1];
                    // The SAK response may overwrite BCC and CRC_A.
                    (9usize, 6usize, 0u8)
                } else {
                    let tx_last_bits = (current_level_known_bits % 8) as u8;
                    // Whole bytes so far: SEL + NVB + complete UID bytes.
                    let whole_bytes = 2 + (current_level_known_bits / 8) as usize;
                    buffer[1] = ((whole_bytes as u8) << 4) + tx_last_bits;
                    let buffer_used = whole_bytes + if tx_last_bits != 0 { 1 } else { 0 };
                    (buffer_used, whole_bytes, tx_last_bits)
                };

                // Received bits continue the frame at the split position.
                let rx_align = tx_last_bits;
                self.write_register(Register::BitFramingReg, (rx_align << 4) + tx_last_bits)?;

                tx[..buffer_used].copy_from_slice(&buffer[..buffer_used]);
                match self.transceive_data(
                    &tx[..buffer_used],
                    Some(&mut buffer[rx_index..]),
                    tx_last_bits,
                    rx_align,
                    false,
                ) {
                    Ok(answer) => {
                        if current_level_known_bits >= 32 {
                            break answer;
                        }
                        // A clean anticollision answer completes the level;
                        // run the loop again for the SELECT.
                        current_level_known_bits = 32;
                    }
                    Err(Error::Collision) => {
                        let coll = self.read_register(Register::CollReg)?;
                        if coll & 0x20 != 0 {
                            // CollPosNotValid: nothing to resolve on.
                            return Err(Error::Collision);
                        }
                        let mut collision_pos = (coll & 0x1F) as i16;
                        if collision_pos == 0 {
                            // CollPos 0 means bit 32.
                            collision_pos = 32;
                        }
                        if collision_pos <= current_level_known_bits {
                            return Err(Error::InternalError);
                        }
                        // Keep the branch with the divergent bit set.
                        current_level_known_bits = collision_pos;
                        let check_bit = ((current_level_known_bits - 1) % 8) as u8;
                        let byte_index = (1
                            + current_level_known_bits / 8
                            + if current_level_known_bits % 8 != 0 { 1 } else { 0 })
                            as usize;
                        buffer[byte_index] |= 1 << check_bit;
                    }
                    Err(e) => return Err(e),
                }
            };

            // Move the resolved level bytes into the UID, skipping a
            // leading cascade tag. The BCC was ours, no need to check it.
            let (src, bytes_to_copy) = if buffer[2] == picc::Command::CT as u8 {
                (3usize, 3usize)
            } else {
                (2usize, 4usize)
            };
            uid.bytes[uid_index..uid_index + bytes_to_copy]
                .copy_from_slice(&buffer[src..src + bytes_to_copy]);

            // The SAK is exactly one byte plus CRC_A.
            if answer.len != 3 || answer.valid_bits != 0 {
                return Err(Error::Communication);
            }
            let crc = self.calculate_crc(&buffer[6..7])?;
            if crc[0] != buffer[7] || crc[1] != buffer[8] {
                return Err(Error::CrcWrong);
            }

            if buffer[6] & 0x04 != 0 {
                // Cascade bit set: the UID goes on at the next level.
                cascade_level += 1;
            } else {
                uid.sak = buffer[6];
                uid.size = 3 * cascade_level + 1;
                return Ok(());
            }
        }
    }

    /// HLTA. Silence within the timeout is the acknowledgment; a card that
    /// answers has refused the halt.
    pub fn halt_a(&mut self) -> Result<(), E> {
        let mut buffer = [picc::Command::HLTA as u8, 0, 0, 0];
        let crc = self.calculate_crc(&buffer[..2])?;
        buffer[2] = crc[0];
        buffer[3] = crc[1];

        match self.transceive_data(&buffer, None, 0, 0, false) {
            Err(Error::Timeout) => Ok(()),
            Ok(_) => Err(Error::Communication),
            Err(e) => Err(e),
        }
    }

    /// REQA probe with the baseline restored first. `Ok` means something
    /// answered, collisions included.
    pub fn new_card_present(&mut self) -> Result<(), E> {
        // Undo a possible previous baud or modulation change.
        self.write_register(Register::TxModeReg, 0x00)?;
        self.write_register(Register::RxModeReg, 0x00)?;
        self.write_register(Register::ModWidthReg, 0x26)?;

        let mut atqa = [0u8; 2];
        match self.request_a(&mut atqa) {
            Ok(()) => Ok(()),
            Err(Error::Collision) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Full anticollision run on whatever card answered the probe.
    pub fn read_card_serial(&mut self) -> Result<Uid, E> {
        let mut uid = Uid::default();
        self.select(&mut uid, 0)?;
        Ok(uid)
    }

    /// MFAuthent with key A or B for the sector holding `block`, opening a
    /// crypto1 session. A card that rejects the key stays silent, so a
    /// wrong key surfaces as `Timeout`.
    pub fn authenticate(
        &mut self,
        command: picc::Command,
        block: u8,
        key: MifareKey,
        uid: &Uid,
    ) -> Result<(), E> {
        if uid.size < 4 {
            return Err(Error::Invalid);
        }
        let mut frame = [0u8; 12];
        frame[0] = command as u8;
        frame[1] = block;
        frame[2..8].copy_from_slice(&key);
        // The last four UID bytes, per AN10927.
        let offset = uid.size as usize - 4;
        frame[8..12].copy_from_slice(&uid.bytes[offset..offset + 4]);

        // IdleIRq signals the authentication has finished.
        self.communicate_with_picc(Command::MFAuthent, 0x10, &frame, None, 0, 0, false)?;
        Ok(())
    }

    /// Ends the crypto1 session. Required before any raw exchange or a
    /// fresh authentication.
    pub fn stop_crypto1(&mut self) -> Result<(), E> {
        // Status2Reg MFCrypto1On.
        self.clear_register_bitmask(Register::Status2Reg, 0x08)
    }

    /// Sends `data` plus CRC_A and expects the 4 bit MIFARE ACK back. With
    /// `accept_timeout`, a silent card counts as acknowledged; the value
    /// commands confirm their data phase that way.
    pub fn mifare_transceive(&mut self, data: &[u8], accept_timeout: bool) -> Result<(), E> {
        // Room for 16 payload bytes plus CRC_A.
        if data.is_empty() || data.len() > 16 {
            return Err(Error::Invalid);
        }
        let mut frame = [0u8; 18];
        frame[..data.len()].copy_from_slice(data);
        let crc = self.calculate_crc(data)?;
        frame[data.len()] = crc[0];
        frame[data.len() + 1] = crc[1];
        let frame_len = data.len() + 2;

        let mut response = [0u8; 18];
        let answer = match self.communicate_with_picc(
            Command::Transceive,
            0x30,
            &frame[..frame_len],
            Some(&mut response),
            0,
            0,
            false,
        ) {
            Err(Error::Timeout) if accept_timeout => return Ok(()),
            other => other?,
        };

        if answer.len != 1 || answer.valid_bits != 4 {
            return Err(Error::Communication);
        }
        if response[0] != picc::MF_ACK {
            return Err(Error::MifareNack);
        }
        Ok(())
    }

    /// Reads one 16 byte block into `buffer`. On Ultralight this returns
    /// four pages starting at `block`.
    pub fn mifare_read(&mut self, block: u8, buffer: &mut [u8]) -> Result<(), E> {
        if buffer.len() < 16 {
            return Err(Error::NoRoom);
        }
        let mut frame = [picc::Command::MfRead as u8, block, 0, 0];
        let crc = self.calculate_crc(&frame[..2])?;
        frame[2] = crc[0];
        frame[3] = crc[1];

        // The card answers 16 data bytes followed by CRC_A.
        let mut response = [0u8; 18];
        let answer = self.transceive_data(&frame, Some(&mut response), 0, 0, true)?;
        if answer.len != 18 {
            return Err(Error::Communication);
        }
        buffer[..16].copy_from_slice(&response[..16]);
        Ok(())
    }

    /// MIFARE Classic write: announce the block, then ship 16 bytes, each
    /// phase acknowledged. Works on Ultralight as the compatibility write.
    /// The two phases are not atomic; a failure between them leaves the
    /// block content undefined.
    pub fn mifare_write(&mut self, block: u8, data: &[u8]) -> Result<(), E> {
        if data.len() < 16 {
            return Err(Error::Invalid);
        }
        self.mifare_transceive(&[picc::Command::MfWrite as u8, block], false)?;
        self.mifare_transceive(&data[..16], false)
    }

    /// MIFARE Ultralight native write of one 4 byte page, a single frame.
    pub fn ultralight_write(&mut self, page: u8, data: &[u8]) -> Result<(), E> {
        if data.len() < 4 {
            return Err(Error::Invalid);
        }
        let mut frame = [0u8; 6];
        frame[0] = picc::Command::UlWrite as u8;
        frame[1] = page;
        frame[2..6].copy_from_slice(&data[..4]);
        self.mifare_transceive(&frame, false)
    }

    /// Adds `delta` to the value block, into the card's internal register.
    /// Commit with [`mifare_transfer`](Self::mifare_transfer).
    pub fn mifare_increment(&mut self, block: u8, delta: i32) -> Result<(), E> {
        self.two_step_helper(picc::Command::MfIncrement, block, delta)
    }

    /// Subtracts `delta` from the value block, into the internal register.
    pub fn mifare_decrement(&mut self, block: u8, delta: i32) -> Result<(), E> {
        self.two_step_helper(picc::Command::MfDecrement, block, delta)
    }

    /// Loads the value block into the internal register.
    pub fn mifare_restore(&mut self, block: u8) -> Result<(), E> {
        // Restore needs a data phase too; the card ignores its content.
        self.two_step_helper(picc::Command::MfRestore, block, 0)
    }

    fn two_step_helper(&mut self, command: picc::Command, block: u8, data: i32) -> Result<(), E> {
        self.mifare_transceive(&[command as u8, block], false)?;
        // The card acknowledges the data phase by staying silent.
        self.mifare_transceive(&data.to_le_bytes(), true)
    }

    /// Writes the internal register back to a value block.
    pub fn mifare_transfer(&mut self, block: u8) -> Result<(), E> {
        self.mifare_transceive(&[picc::Command::MfTransfer as u8, block], false)
    }

    /// Reads `block` as a value block and returns the signed value.
    pub fn mifare_get_value(&mut self, block: u8) -> Result<i32, E> {
        let mut buffer = [0u8; 16];
        self.mifare_read(block, &mut buffer)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buffer[..4]);
        Ok(i32::from_le_bytes(raw))
    }

    /// Writes the full value block image for `value` to `block`.
    pub fn mifare_set_value(&mut self, block: u8, value: i32) -> Result<(), E> {
        self.mifare_write(block, &value_block(value, block))
    }

    /// Gen1 magic-card unlock: halt, then the raw 7 bit 0x40 frame and a
    /// full 0x43 byte, each answered with the MIFARE ACK. Afterwards
    /// block 0 accepts unauthenticated writes.
    pub fn open_uid_backdoor(&mut self) -> Result<(), E> {
        // The sequence starts from a halted card; the halt outcome itself
        // does not matter.
        let _ = self.halt_a();

        let mut response = [0u8; 32];
        let answer = match self.transceive_data(&[0x40], Some(&mut response), 7, 0, false) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("uid backdoor: no response to raw 0x40, not a gen1 card?");
                return Err(e);
            }
        };
        if answer.len != 1 || response[0] != picc::MF_ACK {
            warn!("uid backdoor: bad ack on 0x40");
            return Err(Error::MifareNack);
        }

        let answer = self.transceive_data(&[0x43], Some(&mut response), 0, 0, false)?;
        if answer.len != 1 || response[0] != picc::MF_ACK {
            warn!("uid backdoor: bad ack on 0x43");
            return Err(Error::MifareNack);
        }
        Ok(())
    }

    /// Rewrites block 0 of a gen1 magic card with `new_uid` and a matching
    /// BCC, keeping the rest of the block. Re-selects and retries once when
    /// no crypto1 session is live. The card ends up outside the field
    /// protocol; a closing WUPA brings it back.
    pub fn set_uid(&mut self, new_uid: &[u8], uid: &Uid) -> Result<(), E> {
        // UID plus BCC must fit the 16 byte block.
        if new_uid.is_empty() || new_uid.len() > 15 {
            return Err(Error::Invalid);
        }

        let key: MifareKey = [0xFF; 6];
        match self.authenticate(picc::Command::MfAuthKeyA, 1, key, uid) {
            Ok(()) => {}
            Err(Error::Timeout) => {
                // No live session; select whatever card is in the field.
                self.new_card_present()?;
                let fresh = self.read_card_serial()?;
                self.authenticate(picc::Command::MfAuthKeyA, 1, key, &fresh)?;
            }
            Err(e) => return Err(e),
        }

        let mut block0 = [0u8; 16];
        self.mifare_read(0, &mut block0)?;

        let mut bcc = 0;
        for (dst, &src) in block0.iter_mut().zip(new_uid) {
            *dst = src;
            bcc ^= src;
        }
        block0[new_uid.len()] = bcc;

        // Raw frames from here on.
        self.stop_crypto1()?;
        self.open_uid_backdoor()?;
        self.mifare_write(0, &block0)?;

        // Bring the card back from halt; best effort.
        let mut atqa = [0u8; 2];
        let _ = self.wakeup_a(&mut atqa);
        Ok(())
    }

    /// Restores a factory-style block 0 (UID 01 02 03 04 with matching
    /// BCC) on a gen1 card whose sector 0 became unreadable.
    pub fn unbrick_uid_sector(&mut self) -> Result<(), E> {
        self.open_uid_backdoor()?;
        let block0 = [
            0x01, 0x02, 0x03, 0x04, 0x04, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        self.mifare_write(0, &block0)
    }
}
