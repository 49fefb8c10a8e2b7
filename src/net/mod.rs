//! Client- and backend-facing transports

mod error;
mod packet_io;

pub use error::PacketIoError;
pub use packet_io::{AsyncStream, BoxedStream, CloseHandle, PacketIo};
