//! PICC (card side) command bytes and identity types.

/// Commands sent to the PICC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// REQuest command, Type A. Invites idle PICCs to READY. 7 bit frame.
    REQA = 0x26,
    /// Wake-UP command, Type A. Like REQA but also wakes halted PICCs. 7 bit frame.
    WUPA = 0x52,
    /// Cascade Tag, used during anticollision for UIDs longer than 4 bytes.
    CT = 0x88,
    /// Anticollision/Select, cascade level 1.
    SelCl1 = 0x93,
    /// Anticollision/Select, cascade level 2.
    SelCl2 = 0x95,
    /// Anticollision/Select, cascade level 3.
    SelCl3 = 0x97,
    /// HaLT command, Type A. Sends an active PICC to the HALT state.
    HLTA = 0x50,
    /// Request for Answer To Select, ISO/IEC 14443-4.
    RATS = 0xE0,
    /// MIFARE Classic authentication with key A.
    MfAuthKeyA = 0x60,
    /// MIFARE Classic authentication with key B.
    MfAuthKeyB = 0x61,
    /// Reads one 16 byte block. On Ultralight this returns four pages.
    MfRead = 0x30,
    /// Writes one 16 byte block; the Ultralight "compatibility write".
    MfWrite = 0xA0,
    /// Subtracts the operand from a value block into the internal register.
    MfDecrement = 0xC0,
    /// Adds the operand to a value block into the internal register.
    MfIncrement = 0xC1,
    /// Loads a value block into the internal register.
    MfRestore = 0xC2,
    /// Writes the internal register back to a value block.
    MfTransfer = 0xB0,
    /// MIFARE Ultralight native write of one 4 byte page.
    UlWrite = 0xA2,
}

/// The 4 bit MIFARE acknowledge. Anything else is a NAK.
pub const MF_ACK: u8 = 0x0A;

/// MIFARE Crypto1 key, 6 bytes.
pub type MifareKey = [u8; 6];

/// PICC classification derived from the SAK byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Unknown,
    /// PICC compliant with ISO/IEC 14443-4.
    Iso14443_4,
    /// PICC compliant with ISO/IEC 18092 (NFC).
    Iso18092,
    /// MIFARE Classic protocol, 320 bytes.
    MifareMini,
    /// MIFARE Classic protocol, 1 KB.
    Mifare1k,
    /// MIFARE Classic protocol, 4 KB.
    Mifare4k,
    /// MIFARE Ultralight or Ultralight C.
    MifareUL,
    /// MIFARE Plus.
    MifarePlus,
    /// Named in NXP AN10833 only.
    TNP3XXX,
    /// SAK says the UID is not complete.
    NotComplete,
}

impl Type {
    /// SAK decoding per AN10833 section 3.2. Bit 8 is masked off; Infineon
    /// cards set it despite carrying ISO14443-3 meaning in the low bits.
    pub fn from_sak(sak: u8) -> Type {
        match sak & 0x7F {
            0x04 => Type::NotComplete,
            0x09 => Type::MifareMini,
            0x08 => Type::Mifare1k,
            0x18 => Type::Mifare4k,
            0x00 => Type::MifareUL,
            0x10 | 0x11 => Type::MifarePlus,
            0x01 => Type::TNP3XXX,
            0x20 => Type::Iso14443_4,
            0x40 => Type::Iso18092,
            _ => Type::Unknown,
        }
    }
}

/// A selected PICC: 4, 7 or 10 UID bytes plus the SAK of the final cascade
/// level. Valid until the next select or an explicit halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uid {
    /// UID storage; only the first `size` bytes are meaningful.
    pub bytes: [u8; 10],
    /// 4, 7 or 10.
    pub size: u8,
    /// Select acknowledge of the final cascade level.
    pub sak: u8,
}

impl Uid {
    /// The UID as a slice of its actual length.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    pub fn picc_type(&self) -> Type {
        Type::from_sak(self.sak)
    }
}
