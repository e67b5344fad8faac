use thiserror::Error;

/// Errors raised while walking a descriptor chain or servicing a request.
/// Per the error-handling design, most of these never reach the guest: the
/// chain is dropped and `last_avail_idx` stays advanced so the queue
/// doesn't deadlock (see callers in `block.rs`/`net.rs`).
#[derive(Debug, Error)]
pub enum VirtioError {
    #[error("descriptor chain exceeds queue size {0}")]
    ChainTooLong(u16),
    #[error("descriptor {0} address {1:#x} is outside guest memory")]
    InvalidDescriptorAddress(u16, u64),
    #[error("queue index {0} selected but device only has {1} queues")]
    QueueIndexOutOfBounds(u32, usize),
    #[error("block request chain malformed: {0}")]
    MalformedBlockChain(&'static str),
    #[error("address_space translation failed")]
    Memory(#[from] address_space::Error),
    #[error("bridge I/O failed")]
    Bridge(#[from] bridge::Error),
    #[error("backing file operation failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VirtioError>;
