//! LoRaWAN protocol data: addresses, frame codec and MAC commands.

pub mod address;
pub mod frame;
pub mod mac_command;

pub use address::{AddressGenerator, DeviceAddress};
pub use frame::{Direction, Frame, FrameError, FrameHeader, MacHeader, MessageType, Packet};
pub use mac_command::MacCommand;
