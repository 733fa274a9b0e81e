//! End-device addressing.

use serde::Deserialize;
use std::fmt;

const NWK_ID_BITS: u32 = 7;
const NWK_ADDR_BITS: u32 = 32 - NWK_ID_BITS;
const NWK_ADDR_MASK: u32 = (1 << NWK_ADDR_BITS) - 1;
const NWK_ID_MASK: u8 = (1 << NWK_ID_BITS) - 1;

/// 32-bit device address: a 7-bit network identifier followed by a 25-bit
/// network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress(u32);

impl DeviceAddress {
    /// Build an address from its parts. Out-of-range bits are masked off.
    pub fn new(nwk_id: u8, nwk_addr: u32) -> Self {
        let nwk_id = (nwk_id & NWK_ID_MASK) as u32;
        Self((nwk_id << NWK_ADDR_BITS) | (nwk_addr & NWK_ADDR_MASK))
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }

    pub fn nwk_id(self) -> u8 {
        (self.0 >> NWK_ADDR_BITS) as u8
    }

    pub fn nwk_addr(self) -> u32 {
        self.0 & NWK_ADDR_MASK
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:07x}", self.nwk_id(), self.nwk_addr())
    }
}

/// Hands out sequential addresses inside one network.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AddressGenerator {
    pub nwk_id: u8,
    pub nwk_addr: u32,
}

impl Default for AddressGenerator {
    fn default() -> Self {
        Self { nwk_id: 54, nwk_addr: 1864 }
    }
}

impl AddressGenerator {
    pub fn new(nwk_id: u8, first_nwk_addr: u32) -> Self {
        Self {
            nwk_id,
            nwk_addr: first_nwk_addr,
        }
    }

    pub fn next_address(&mut self) -> DeviceAddress {
        let address = DeviceAddress::new(self.nwk_id, self.nwk_addr);
        self.nwk_addr = (self.nwk_addr + 1) & NWK_ADDR_MASK;
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_packed_into_one_word() {
        let address = DeviceAddress::new(54, 1864);
        assert_eq!(address.to_u32(), (54 << 25) | 1864);
        assert_eq!(address.nwk_id(), 54);
        assert_eq!(address.nwk_addr(), 1864);
        assert_eq!(DeviceAddress::from_u32(address.to_u32()), address);
    }

    #[test]
    fn oversized_parts_are_masked() {
        let address = DeviceAddress::new(0xff, u32::MAX);
        assert_eq!(address.nwk_id(), 0x7f);
        assert_eq!(address.nwk_addr(), NWK_ADDR_MASK);
    }

    #[test]
    fn generator_is_sequential_from_its_seed() {
        let mut generator = AddressGenerator::default();
        let first = generator.next_address();
        let second = generator.next_address();
        assert_eq!(first, DeviceAddress::new(54, 1864));
        assert_eq!(second, DeviceAddress::new(54, 1865));
        assert_eq!(first.to_string(), "36:0000748");
    }
}
