//! Calling functions inside another process.
//!
//! A batch of calls is compiled into one stub that runs on a single new
//! thread in the target. Each call gets a result record holding every view of
//! the return registers plus the thread's last-error value right after the
//! call returned.
//!
//! ```
//! use remotehook::{CallArg, call_args};
//!
//! let args = call_args![0x1234u32, 2.5f32, 1.0f64, -1i8];
//! assert_eq!(args[0], CallArg::Int32(0x1234));
//! assert_eq!(args[1], CallArg::Float(2.5));
//! assert_eq!(args[3], CallArg::Int32(0xffff_ffff));
//! ```

use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::alloc::RemoteAlloc;
use crate::arch::{Arch, Native};
use crate::emit;
use crate::err::{Error, Result};
use crate::memory;
use crate::process::{Protection, RemoteProcess};

/// Calling convention of a remote function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConv {
    /// The platform's default: cdecl on x86, the x64 convention on x64
    #[default]
    Default,
    /// The convention of Windows API functions: stdcall on x86
    WinApi,
    /// Caller cleans the stack (x86)
    Cdecl,
    /// Callee cleans the stack (x86)
    StdCall,
    /// `this` in ECX, callee cleans the stack (x86)
    ThisCall,
    /// First two 32-bit arguments in ECX and EDX, callee cleans the stack (x86)
    FastCall,
    /// The Microsoft x64 convention
    X64,
}

/// A call argument. The variant is fixed by the Rust type it was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallArg {
    /// An integer or pointer of at most 32 bits
    Int32(u32),
    /// A 64-bit integer, or a pointer on x64
    Int64(u64),
    /// A single precision float
    Float(f32),
    /// A double precision float
    Double(f64),
}

/// How an argument is stored for a given pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Fits a general purpose register or stack slot
    General,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// 64-bit integer split over two slots
    WideInt,
}

/// Receives the arguments of a call, one method per representation.
pub(crate) trait ArgVisitor {
    fn visit_int32(&mut self, index: usize, value: u32) -> Result<()>;
    fn visit_int64(&mut self, index: usize, value: u64) -> Result<()>;
    fn visit_float(&mut self, index: usize, value: f32) -> Result<()>;
    fn visit_double(&mut self, index: usize, value: f64) -> Result<()>;
}

impl CallArg {
    /// Storage class on the build target.
    pub fn storage_class(&self) -> StorageClass {
        self.storage_class_for(Native::POINTER_SIZE)
    }

    /// Storage class for a target with `pointer_size`-byte pointers.
    pub fn storage_class_for(&self, pointer_size: usize) -> StorageClass {
        match self {
            CallArg::Int32(_) => StorageClass::General,
            CallArg::Int64(_) if pointer_size >= 8 => StorageClass::General,
            CallArg::Int64(_) => StorageClass::WideInt,
            CallArg::Float(_) => StorageClass::Float32,
            CallArg::Double(_) => StorageClass::Float64,
        }
    }

    pub(crate) fn accept<V: ArgVisitor>(&self, index: usize, visitor: &mut V) -> Result<()> {
        match *self {
            CallArg::Int32(v) => visitor.visit_int32(index, v),
            CallArg::Int64(v) => visitor.visit_int64(index, v),
            CallArg::Float(v) => visitor.visit_float(index, v),
            CallArg::Double(v) => visitor.visit_double(index, v),
        }
    }
}

macro_rules! impl_arg_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for CallArg {
            fn from(v: $t) -> Self {
                if size_of::<$t>() == 8 {
                    CallArg::Int64(v as u64)
                } else {
                    CallArg::Int32(v as u32)
                }
            }
        }
    )*};
}
impl_arg_from_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl From<bool> for CallArg {
    fn from(v: bool) -> Self {
        CallArg::Int32(v as u32)
    }
}

impl From<f32> for CallArg {
    fn from(v: f32) -> Self {
        CallArg::Float(v)
    }
}

impl From<f64> for CallArg {
    fn from(v: f64) -> Self {
        CallArg::Double(v)
    }
}

impl<T> From<*const T> for CallArg {
    fn from(v: *const T) -> Self {
        CallArg::from(v as usize)
    }
}

impl<T> From<*mut T> for CallArg {
    fn from(v: *mut T) -> Self {
        CallArg::from(v as usize)
    }
}

/// Builds a `Vec<CallArg>` from integers, pointers and floats.
#[macro_export]
macro_rules! call_args {
    () => { ::std::vec::Vec::<$crate::CallArg>::new() };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::CallArg::from($arg)),+]
    };
}

/// One call of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    /// Function address in the target
    pub address: usize,
    /// Calling convention of the function
    pub conv: CallConv,
    /// Arguments, first to last
    pub args: Vec<CallArg>,
}

impl CallDescriptor {
    /// Describes a call of `address`.
    pub fn new(address: usize, conv: CallConv, args: Vec<CallArg>) -> Self {
        Self {
            address,
            conv,
            args,
        }
    }
}

/// Byte offsets of the fields of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultLayout {
    /// Size of one record
    pub size: usize,
    /// Pointer-sized return value
    pub ret_ptr: usize,
    /// 32-bit view
    pub ret32: usize,
    /// 64-bit view
    pub ret64: usize,
    /// Float view
    pub ret_float: usize,
    /// Double view
    pub ret_double: usize,
    /// Last-error value
    pub last_error: usize,
    /// Bytes of the pointer-sized value
    pub pointer_size: usize,
}

fn le_bytes<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = buf.get(off..off + N) {
        out.copy_from_slice(src);
    }
    out
}

/// The return views and last-error value of one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CallResultRaw {
    ret_ptr: u64,
    ret32: u32,
    ret64: u64,
    ret_float: f32,
    ret_double: f64,
    last_error: u32,
}

impl CallResultRaw {
    /// Decodes a record written by a call stub.
    pub fn from_record(layout: &ResultLayout, record: &[u8]) -> Result<Self> {
        if record.len() < layout.size {
            return Err(Error::InvalidParameter);
        }
        let ret_ptr = match layout.pointer_size {
            4 => u32::from_le_bytes(le_bytes(record, layout.ret_ptr)) as u64,
            _ => u64::from_le_bytes(le_bytes(record, layout.ret_ptr)),
        };
        Ok(Self {
            ret_ptr,
            ret32: u32::from_le_bytes(le_bytes(record, layout.ret32)),
            ret64: u64::from_le_bytes(le_bytes(record, layout.ret64)),
            ret_float: f32::from_le_bytes(le_bytes(record, layout.ret_float)),
            ret_double: f64::from_le_bytes(le_bytes(record, layout.ret_double)),
            last_error: u32::from_le_bytes(le_bytes(record, layout.last_error)),
        })
    }

    /// Pointer-sized return value.
    pub fn return_value(&self) -> usize {
        self.ret_ptr as usize
    }

    /// Low 32 bits of the integer return register.
    pub fn return_value_32(&self) -> u32 {
        self.ret32
    }

    /// 64-bit integer return value (EDX:EAX on x86).
    pub fn return_value_64(&self) -> u64 {
        self.ret64
    }

    /// Float return value.
    pub fn return_value_float(&self) -> f32 {
        self.ret_float
    }

    /// Double return value.
    pub fn return_value_double(&self) -> f64 {
        self.ret_double
    }

    /// Last-error value right after the call.
    pub fn last_error(&self) -> u32 {
        self.last_error
    }

    /// The return value as `T`.
    pub fn value<T: CallReturn>(&self) -> T {
        T::from_raw(self)
    }

    /// The return value as `T` together with the last-error value.
    pub fn typed<T: CallReturn>(&self) -> CallResult<T> {
        CallResult {
            value: T::from_raw(self),
            last_error: self.last_error,
        }
    }
}

/// A typed return value and the last-error value observed after the call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallResult<T> {
    value: T,
    last_error: u32,
}

impl<T: Copy> CallResult<T> {
    /// Return value.
    pub fn value(&self) -> T {
        self.value
    }

    /// Last-error value right after the call.
    pub fn last_error(&self) -> u32 {
        self.last_error
    }
}

/// Types a remote function may return.
pub trait CallReturn: Sized {
    /// Picks the matching view of `raw`.
    fn from_raw(raw: &CallResultRaw) -> Self;
}

macro_rules! impl_return_int {
    ($($t:ty),*) => {$(
        impl CallReturn for $t {
            fn from_raw(raw: &CallResultRaw) -> Self {
                if size_of::<$t>() == 8 {
                    raw.ret64 as $t
                } else {
                    raw.ret32 as $t
                }
            }
        }
    )*};
}
impl_return_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl CallReturn for usize {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret_ptr as usize
    }
}

impl CallReturn for isize {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret_ptr as isize
    }
}

impl CallReturn for bool {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret32 != 0
    }
}

impl CallReturn for f32 {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret_float
    }
}

impl CallReturn for f64 {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret_double
    }
}

impl CallReturn for () {
    fn from_raw(_: &CallResultRaw) -> Self {}
}

impl<T> CallReturn for *const T {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret_ptr as usize as *const T
    }
}

impl<T> CallReturn for *mut T {
    fn from_raw(raw: &CallResultRaw) -> Self {
        raw.ret_ptr as usize as *mut T
    }
}

bitflags! {
    /// Call stub generation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallFlags: u32 {
        /// Don't break into an attached debugger before the calls
        const SKIP_DEBUGGER_CHECK = 1;
    }
}

/// Default time to wait for a call stub thread.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Options of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Time to wait for the stub thread; `None` waits forever
    pub timeout: Option<Duration>,
    /// Stub generation flags
    pub flags: CallFlags,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_CALL_TIMEOUT),
            flags: CallFlags::empty(),
        }
    }
}

/// Calls `address` with `args` and waits for the result.
pub fn call<P: RemoteProcess + ?Sized>(
    process: &P,
    address: usize,
    conv: CallConv,
    args: &[CallArg],
) -> Result<CallResultRaw> {
    let calls = [CallDescriptor::new(address, conv, args.to_vec())];
    let mut results = call_batch(process, &calls, &CallOptions::default())?;
    results.pop().ok_or(Error::InvalidParameter)
}

/// Performs several calls on one remote thread, in order.
///
/// The three slices must have the same length.
pub fn call_multi<P: RemoteProcess + ?Sized>(
    process: &P,
    addresses: &[usize],
    convs: &[CallConv],
    args: &[Vec<CallArg>],
) -> Result<Vec<CallResultRaw>> {
    if addresses.len() != convs.len() || addresses.len() != args.len() {
        return Err(Error::BatchLengthMismatch {
            addresses: addresses.len(),
            convs: convs.len(),
            args: args.len(),
        });
    }
    let calls: Vec<_> = addresses
        .iter()
        .zip(convs)
        .zip(args)
        .map(|((&address, &conv), args)| CallDescriptor::new(address, conv, args.clone()))
        .collect();
    call_batch(process, &calls, &CallOptions::default())
}

/// Performs `calls` on one remote thread, in order, returning one result per call.
pub fn call_batch<P: RemoteProcess + ?Sized>(
    process: &P,
    calls: &[CallDescriptor],
    options: &CallOptions,
) -> Result<Vec<CallResultRaw>> {
    call_batch_with::<Native, P>(process, calls, options)
}

pub(crate) fn call_batch_with<A: Arch, P: RemoteProcess + ?Sized>(
    process: &P,
    calls: &[CallDescriptor],
    options: &CallOptions,
) -> Result<Vec<CallResultRaw>> {
    if calls.is_empty() {
        return Ok(vec![]);
    }
    for call in calls {
        A::check_call_conv(call.conv)?;
    }

    let helpers = process.helper_routines()?;
    let layout = A::RESULT_LAYOUT;
    let results = RemoteAlloc::new(process, layout.size * calls.len(), Protection::READWRITE)?;

    let insts = A::emit_call_stub(calls, &helpers, results.base() as u64, options.flags)?;
    let size = emit::assemble(A::BITNESS, &insts, 0)?.len();
    let stub = RemoteAlloc::new(process, size, Protection::EXECUTE_READWRITE)?;
    let code = emit::assemble(A::BITNESS, &insts, stub.base() as u64)?;
    memory::write(process, stub.base(), &code)?;
    process.flush_instruction_cache(stub.base(), code.len())?;
    debug!(
        stub = stub.base(),
        size = code.len(),
        calls = calls.len(),
        "running call stub"
    );

    match process.run_thread(stub.base(), 0, options.timeout) {
        Ok(_) => {}
        Err(e @ Error::RemoteTimeout(_)) => {
            // the thread may still be running the stub
            warn!(stub = stub.base(), "call stub timed out, leaking its memory");
            stub.leak();
            results.leak();
            return Err(e);
        }
        Err(e) => return Err(e),
    }

    let raw = memory::read_vec(process, results.base(), layout.size * calls.len())?;
    raw.chunks_exact(layout.size)
        .map(|record| CallResultRaw::from_record(&layout, record))
        .collect()
}

/// Collects calls and runs them as one batch.
pub struct MultiCall<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    calls: Vec<CallDescriptor>,
    options: CallOptions,
}

impl<'a, P: RemoteProcess + ?Sized> MultiCall<'a, P> {
    /// Starts an empty batch.
    pub fn new(process: &'a P) -> Self {
        Self {
            process,
            calls: vec![],
            options: CallOptions::default(),
        }
    }

    /// Replaces the call options.
    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Appends a call.
    pub fn add(&mut self, address: usize, conv: CallConv, args: Vec<CallArg>) -> &mut Self {
        self.calls.push(CallDescriptor::new(address, conv, args));
        self
    }

    /// Number of queued calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is queued.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Runs the queued calls.
    pub fn call(&self) -> Result<Vec<CallResultRaw>> {
        call_batch(self.process, &self.calls, &self.options)
    }
}
