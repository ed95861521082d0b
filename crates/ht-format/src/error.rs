use thiserror::Error;


/// Framing/format errors for a single block: a truncated or malformed header, a magic or
/// checksum mismatch, a failed inflate, or an unrecognized compression tag.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("block header was truncated or malformed")]
    BadHeader,
    #[error("block header magic did not match the expected value")]
    BadMagic,
    #[error("checksum mismatch while verifying a block")]
    ChecksumMismatch,
    #[error("failed to inflate a compressed block")]
    InflateError,
    #[error("compression type `{0}` is not supported by this build")]
    UnsupportedType(u8),
}
