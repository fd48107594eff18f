use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// The packet cannot be represented in a 16-bit length field. The caller
    /// must re-chunk upstream; the session itself is unaffected.
    #[error("audio frame of {len} bytes exceeds the {max}-byte gateway limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("corrupt gateway frame: {0}")]
    FrameCorrupt(String),

    #[error("frame sink error: {0}")]
    Sink(String),
}
