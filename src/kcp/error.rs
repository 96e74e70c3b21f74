use std::io;

use thiserror::Error;

/// KCP protocol errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("conv inconsistent, expected {0}, found {1}")]
    ConvInconsistent(u32, u32),

    #[error("invalid mtu {0}")]
    InvalidMtu(usize),

    #[error("invalid segment size of {0}")]
    InvalidSegmentSize(usize),

    #[error("invalid segment data size, expected {0}, found {1}")]
    InvalidSegmentDataSize(usize, usize),

    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error("flush updated() must be called at least once")]
    NeedUpdate,

    #[error("receive queue is empty")]
    RecvQueueEmpty,

    #[error("expecting other fragments")]
    ExpectingFragment,

    #[error("cmd {0} is not supported")]
    UnsupportedCmd(u8),

    #[error("user's buffer is too big")]
    UserBufTooBig,

    #[error("user's buffer is too small")]
    UserBufTooSmall,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::IoError(err) => return err,
            Error::RecvQueueEmpty | Error::ExpectingFragment => io::ErrorKind::WouldBlock,
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, err)
    }
}

/// KCP result
pub type KcpResult<T> = Result<T, Error>;
