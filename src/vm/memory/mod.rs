pub mod constants;

use crate::error::{VmError, VmResult};
use constants::*;

/// The byte-addressed arena backing a running story file.
///
/// Dynamic, static and high memory are all slices of the same buffer; only
/// the cached bounds below distinguish them. Addresses are `usize` rather
/// than `u16` because packed (routine/string) addresses are unpacked by
/// doubling a word value and can therefore reach past the first 64 KiB.
pub struct Memory {
    bytes: Vec<u8>,
    version: u8,
    dynamic_end: u16,
    high_start: u16,
}

impl Memory {
    /// Takes ownership of the raw story file bytes and validates the version byte.
    pub fn new(bytes: Vec<u8>) -> VmResult<Self> {
        let version = *bytes
            .first()
            .ok_or(VmError::AddressOutOfRange(HEADER_VERSION as u32))?;
        if version == 0 || version > 3 {
            return Err(VmError::UnsupportedVersion(version));
        }
        let mut memory = Memory {
            bytes,
            version,
            dynamic_end: 0,
            high_start: 0,
        };
        memory.dynamic_end = memory.word(HEADER_DYNAMIC_END as usize)?;
        memory.high_start = memory.word(HEADER_HIGH_MEMORY_BASE as usize)?;
        Ok(memory)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn dynamic_end(&self) -> u16 {
        self.dynamic_end
    }

    pub fn high_start(&self) -> u16 {
        self.high_start
    }

    /// Reads a single byte. Panics on out-of-range access; callers within
    /// the decoder/dispatcher only ever address bytes already validated by
    /// a preceding `word`/`unpack_address` computation.
    pub fn byte(&self, addr: usize) -> u8 {
        self.bytes[addr]
    }

    pub fn set_byte(&mut self, addr: usize, value: u8) {
        self.bytes[addr] = value;
    }

    /// Reads the big-endian word at `addr`. Fails once `addr+1` runs past
    /// the end of the loaded image.
    pub fn word(&self, addr: usize) -> VmResult<u16> {
        let lo = addr + 1;
        if lo >= self.bytes.len() {
            return Err(VmError::AddressOutOfRange(addr as u32));
        }
        Ok((self.bytes[addr] as u16) << 8 | self.bytes[lo] as u16)
    }

    /// Writes a big-endian word. Permitted anywhere; enforcing that guest
    /// code only writes dynamic memory is the caller's contract, not this
    /// accessor's.
    pub fn set_word(&mut self, addr: usize, value: u16) {
        self.bytes[addr] = (value >> 8) as u8;
        self.bytes[addr + 1] = value as u8;
    }

    pub fn slice(&self, start: usize, len: usize) -> &[u8] {
        &self.bytes[start..start + len]
    }

    pub fn dynamic_slice(&self) -> &[u8] {
        &self.bytes[..=self.dynamic_end as usize]
    }

    pub fn set_dynamic_slice(&mut self, data: &[u8]) {
        self.bytes[..data.len()].copy_from_slice(data);
    }

    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    pub fn serial(&self) -> &[u8] {
        self.slice(HEADER_SERIAL_START as usize, HEADER_SERIAL_LEN)
    }

    pub fn release(&self) -> VmResult<u16> {
        self.word(HEADER_RELEASE as usize)
    }

    pub fn checksum(&self) -> VmResult<u16> {
        self.word(HEADER_CHECKSUM as usize)
    }

    /// `2 * packed` — the only unpacking rule for versions 1-3.
    pub fn unpack_address(packed: u16) -> usize {
        2 * packed as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(version: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x40];
        bytes[HEADER_VERSION as usize] = version;
        bytes[HEADER_DYNAMIC_END as usize] = 0x00;
        bytes[HEADER_DYNAMIC_END as usize + 1] = 0x30;
        bytes
    }

    #[test]
    fn rejects_unsupported_version() {
        assert!(matches!(
            Memory::new(story(4)),
            Err(VmError::UnsupportedVersion(4))
        ));
    }

    #[test]
    fn word_round_trips_through_set_word() {
        let mut memory = Memory::new(story(3)).unwrap();
        memory.set_word(0x20, 0xBEEF);
        assert_eq!(memory.word(0x20).unwrap(), 0xBEEF);
    }

    #[test]
    fn word_out_of_range_is_an_error() {
        let memory = Memory::new(story(3)).unwrap();
        let last = memory.len() - 1;
        assert!(memory.word(last).is_err());
    }
}
