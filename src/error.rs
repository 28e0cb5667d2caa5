//! Error types shared by every layer of the ISP stack.

use thiserror::Error;

/// Failures of the underlying bulk channel. These are fatal to the transaction in progress.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("no ISP device found")]
    NotFound,

    #[error("bulk transfer timed out")]
    Timeout,

    #[error("short transfer: expected {expected} bytes, moved {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("device disconnected")]
    Disconnected,

    #[error(transparent)]
    Usb(rusb::Error),
}

/// Reasons a status block (CSW) is rejected
#[derive(Error, Debug, Eq, PartialEq)]
pub enum ProtocolError {
    #[error("status block too short ({0} bytes)")]
    ShortStatus(usize),

    #[error("status block signature {0:#010x} does not match")]
    Signature(u32),
}

/// Problems with the flash geometry held by a session
#[derive(Error, Debug, Eq, PartialEq)]
pub enum GeometryError {
    #[error("flash geometry has not been read from the device")]
    Unknown,

    #[error("device reported an unusable geometry: {0}")]
    Invalid(&'static str),

    #[error("{len} bytes at {offset:#x} do not fit in {size} bytes of flash")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("{count} pages from page {first:#x} run past the last page number")]
    PageOverflow { first: u32, count: u32 },
}

#[derive(Error, Debug)]
pub enum IspError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error("verification of page {page:#x} failed at byte {offset:#x}")]
    VerifyMismatch { page: u32, offset: usize },

    #[error("page {page:#x} is not a PAT page")]
    Format { page: u32 },

    #[error("bootfile needs {pages} pages but one PAT page only lists {max}")]
    Capacity { pages: usize, max: usize },

    #[error("bootfile image is empty")]
    EmptyImage,

    #[error("PAT page {pat_page:#x} shares block {block} with the bootfile data")]
    Overlap { pat_page: u32, block: u32 },

    #[error("buffer of {actual} bytes cannot hold a {needed} byte transfer")]
    Buffer { needed: usize, actual: usize },

    #[error("aborted after {completed} units")]
    Aborted {
        completed: u32,
        #[source]
        source: Box<IspError>,
    },

    #[error("malformed binary record: {0}")]
    Codec(#[from] deku::DekuError),
}

impl IspError {
    /// The error of the unit that actually failed, looking through any `Aborted` wrappers.
    pub fn root(&self) -> &IspError {
        match self {
            IspError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T, E = IspError> = std::result::Result<T, E>;

#[test]
fn test_root_unwraps_aborted() {
    let err = IspError::Aborted {
        completed: 3,
        source: Box::new(IspError::Aborted {
            completed: 0,
            source: Box::new(IspError::Channel(ChannelError::Timeout)),
        }),
    };

    assert!(matches!(
        err.root(),
        IspError::Channel(ChannelError::Timeout)
    ));
    assert_eq!(err.to_string(), "aborted after 3 units");
}
