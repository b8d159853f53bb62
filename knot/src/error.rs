use std::{
    io,
    panic::{self, AssertUnwindSafe},
};

use thiserror::Error;

use crate::{Address, Handle, Index, Location, Response, Slot};

/// Recoverable failures of the heap model and its mutator API.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),
    #[error("handle {0} does not exist")]
    InvalidHandle(Handle),
    #[error("no live object at {0}")]
    StaleAddress(Address),
    #[error("class {class} has no field `{field}`")]
    UnknownField { class: String, field: String },
    #[error("object at {address} has no field slot {slot}")]
    FieldOutOfRange { address: Address, slot: usize },
    #[error("{0:?} does not hold a reference")]
    NotAReference(Location),
    #[error("value does not fit field `{field}` ({signature})")]
    TypeMismatch { field: String, signature: String },
}

/// Transport failures between a server-side table and its client.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] postcard::Error),
    #[error("peer closed the channel")]
    Closed,
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("expected a {expected} reply, got {got:?}")]
    UnexpectedResponse {
        expected: &'static str,
        got: Response,
    },
}

/// Internal-consistency violations.
///
/// None of these can be handled by the caller: they are raised through
/// [`fatal`] and end the compilation that hit them.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("index {index} must be in range 0..{end}")]
    IndexOutOfRange { index: Index, end: Index },
    #[error("{operation} is not safe at the server, the object pointer could have become stale at the client")]
    ForbiddenOnServer { operation: &'static str },
    #[error("server slot {index} holds {server:?} but the client reported {client:?}")]
    HandleMismatch { index: Index, server: Slot, client: Slot },
    #[error("index {index} from the client is greater than the next index {next} at the server")]
    IndexAhead { index: Index, next: Index },
    #[error("client rejected the request: {0}")]
    ClientRejected(String),
    #[error("heap access token belongs to a different heap")]
    ForeignToken,
    #[error("known object table is full")]
    TableExhausted,
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation {id} aborted: {fatal}")]
    Aborted { id: u64, fatal: Fatal },
}

/// Abort the current compilation.
///
/// Unwinds with the [`Fatal`] as payload; [`catch_fatal`] turns it back into a
/// value at the compilation boundary. Guards held on the way (heap access
/// tokens in particular) are released by the unwind.
#[track_caller]
pub fn fatal(error: Fatal) -> ! {
    log::error!("fatal: {error}");
    panic::panic_any(error)
}

/// Runs `f`, converting a [`fatal`] abort into `Err`. Any other panic keeps
/// unwinding.
pub fn catch_fatal<T>(f: impl FnOnce() -> T) -> Result<T, Fatal> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Fatal>() {
            Ok(error) => Err(*error),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

pub trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T, E: Into<Fatal>> OrFatal<T> for Result<T, E> {
    #[track_caller]
    #[inline]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(error) => fatal(error.into()),
        }
    }
}
