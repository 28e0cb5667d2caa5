//! Host-side tools for the USB ISP mode of SPMP8000-based devices.
//!
//! When the SPMP8000 boot ROM finds nothing bootable (or is forced into ISP mode), it enumerates
//! as a USB device and accepts mass-storage-style command blocks that read and write RAM and NAND
//! flash. This crate layers:
//!
//! - [transport]: the CBW/data/CSW command exchange over any byte [Channel](transport::Channel)
//! - [device]: the ISP command set and the flash configuration record
//! - [nand]: flash geometry arithmetic, plus a simulated NAND
//! - [format]: verified random-access flash writes and the PAT bootfile format
//! - [sim]: a simulated ISP agent for exercising all of the above without hardware

pub mod device;
pub mod error;
pub mod format;
pub mod nand;
pub mod sim;
pub mod transport;
pub mod util;

pub use error::{ChannelError, IspError};
