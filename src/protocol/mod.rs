//! Wire protocols layered on top of the link transceiver.

pub mod bisynch;

pub use bisynch::{BisynchAddress, BisynchClient, BisynchCodec, ReplyKind};
