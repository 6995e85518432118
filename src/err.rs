use std::io;
use std::time::Duration;

use iced_x86::IcedError;
use thiserror::Error;

use crate::call::CallConv;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors of remote memory access, remote calls and patching.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParameter,

    /// An OS primitive failed. `code` is the last-error value (`errno` on unix).
    #[error("{op} failed, code:{code}")]
    Os {
        /// Name of the failing primitive
        op: &'static str,
        /// OS error code
        code: u32,
    },

    /// The region is a guard region; access is refused instead of overriding it.
    #[error("guard page at {addr:#x}")]
    GuardPage {
        /// Accessed address
        addr: usize,
    },

    /// The address is not backed by committed memory.
    #[error("address {addr:#x} is not committed")]
    Unmapped {
        /// Accessed address
        addr: usize,
    },

    /// Can't disassemble in the specified address
    #[error("disassemble error at {0:#x}")]
    Disassemble(usize),

    /// The instruction at the address can't be moved to the trampoline.
    #[error("instruction at {0:#x} can't be relocated")]
    UnsupportedInstruction(usize),

    /// Encoding generated code failed
    #[error("encode error: {0}")]
    Encode(#[from] IcedError),

    /// The relocated prologue doesn't fit into the trampoline.
    #[error("trampoline needs {needed} bytes, capacity is {capacity}")]
    TrampolineOverflow {
        /// Bytes required
        needed: usize,
        /// Bytes available
        capacity: usize,
    },

    /// The calling convention is not valid for the architecture.
    #[error("calling convention {0:?} is not supported on this architecture")]
    UnsupportedCallConv(CallConv),

    /// Batch arrays of a multi-call differ in length.
    #[error("batch length mismatch: {addresses} addresses, {convs} conventions, {args} argument lists")]
    BatchLengthMismatch {
        /// Number of addresses
        addresses: usize,
        /// Number of calling conventions
        convs: usize,
        /// Number of argument lists
        args: usize,
    },

    /// The remote thread didn't finish in time.
    #[error("remote thread did not finish within {0:?}")]
    RemoteTimeout(Duration),

    /// A remote function reported failure.
    #[error("remote call to {function} failed, last error:{last_error}")]
    RemoteCall {
        /// Name of the remote function
        function: &'static str,
        /// Last-error value observed after the call
        last_error: u32,
    },

    /// No module with that name or base exists in the process.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// The module has no such export.
    #[error("export not found: {0}")]
    ExportNotFound(String),

    /// A patch with that name is already registered.
    #[error("patch already registered: {0}")]
    DuplicatePatch(String),

    /// Some io error
    #[error("io error")]
    Io(#[from] io::Error),
}
