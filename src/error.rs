use thiserror::Error;

/// Errors the interpreter can raise while decoding or executing a story file.
///
/// Most variants are fatal: the caller should stop driving the machine and
/// report the error. The four `Save`-prefixed variants are the exception —
/// they are caught at the `save`/`restore` opcode boundary and turned into a
/// failed branch rather than propagated further.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("story file version {0} is not supported (only versions 1-3 are)")]
    UnsupportedVersion(u8),

    #[error("address {0:#06x} is out of range")]
    AddressOutOfRange(u32),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack overflow")]
    StackOverflow,

    #[error("routine at {0:#06x} declares more than 15 locals")]
    InvalidRoutine(u32),

    #[error("division by zero")]
    DivisionByZero,

    #[error("attempt to access the null object")]
    NullObjectAccess,

    #[error("attribute {0} is out of range (must be < 32)")]
    InvalidAttribute(u8),

    #[error("put_prop on property of size greater than two")]
    IllegalPutProp,

    #[error("save file does not match the running story")]
    SaveWrongGame,

    #[error("save file is malformed: {0}")]
    SaveFormatError(String),

    #[error("save file is truncated")]
    SaveTruncated,

    #[error("save data overruns dynamic memory")]
    SaveDynamicOverrun,

    #[error("input channel closed while a read was pending")]
    InputClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// True for the save/restore failure kinds that must not abort the machine.
    pub fn is_save_recoverable(&self) -> bool {
        matches!(
            self,
            VmError::SaveWrongGame
                | VmError::SaveFormatError(_)
                | VmError::SaveTruncated
                | VmError::SaveDynamicOverrun
                | VmError::Io(_)
        )
    }
}

pub type VmResult<T> = Result<T, VmError>;
