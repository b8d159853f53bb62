mod client;
mod compilation;
mod dump;
mod error;
mod heap;
mod index;
mod protocol;
mod remote;
mod slots;
mod table;

pub use client::ClientTable;
pub use compilation::{Compilation, Finished};
pub use dump::DumpOptions;
pub use error::*;
pub use heap::*;
pub use index::*;
pub use protocol::*;
pub use remote::RemoteTable;
pub use slots::*;
pub use table::*;
