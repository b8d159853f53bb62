//! Message contract between a server-side table and its client.
//!
//! One channel per compilation. Requests are answered strictly in the order
//! they are sent, which the server's reconciliation relies on.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Address, ChannelError, ClientTable, Index, Location, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    GetIndex { object: Address },
    GetIndexAt { location: Location },
    GetExistingIndexAt { location: Location },
    GetPointer { index: Index },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// reply to `GetIndex` and `GetIndexAt`: the index and the client's slot
    Index { index: Index, slot: Slot },
    ExistingIndex(Index),
    Pointer(Address),
    /// the client could not answer, e.g. a location that holds no reference
    Error(String),
}

/// Synchronous request/response transport.
pub trait Channel {
    fn call(&mut self, request: Request) -> Result<Response, ChannelError>;
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn call(&mut self, request: Request) -> Result<Response, ChannelError> {
        (**self).call(request)
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn call(&mut self, request: Request) -> Result<Response, ChannelError> {
        (**self).call(request)
    }
}

/// Calls straight into a client table on the same thread.
#[derive(Debug)]
pub struct Loopback<'c> {
    client: &'c mut ClientTable,
}

impl<'c> Loopback<'c> {
    pub fn new(client: &'c mut ClientTable) -> Self {
        Self { client }
    }
}

impl Channel for Loopback<'_> {
    fn call(&mut self, request: Request) -> Result<Response, ChannelError> {
        Ok(self.client.serve(request))
    }
}

pub const MAX_FRAME: usize = 64 * 1024;

/// Writes one length-prefixed `postcard` frame.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), ChannelError> {
    let bytes = postcard::to_stdvec(message)?;
    if bytes.len() > MAX_FRAME {
        return Err(ChannelError::FrameTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean end of stream before a frame starts.
pub fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, ChannelError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(ChannelError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(postcard::from_bytes(&body)?))
}

/// Server end of a byte stream to the client.
#[derive(Debug)]
pub struct StreamChannel<S> {
    stream: S,
}

impl<S: Read + Write> StreamChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: Read + Write> Channel for StreamChannel<S> {
    fn call(&mut self, request: Request) -> Result<Response, ChannelError> {
        write_frame(&mut self.stream, &request)?;
        read_frame(&mut self.stream)?.ok_or(ChannelError::Closed)
    }
}

/// Answers requests from `stream` in arrival order until the server hangs up.
/// Returns the number of requests served.
pub fn serve_stream<S: Read + Write>(
    client: &mut ClientTable,
    mut stream: S,
) -> Result<usize, ChannelError> {
    let mut served = 0;
    while let Some(request) = read_frame::<_, Request>(&mut stream)? {
        let response = client.serve(request);
        write_frame(&mut stream, &response)?;
        served += 1;
    }
    log::debug!("client channel closed after {served} requests");
    Ok(served)
}
