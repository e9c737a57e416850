//! Socket layer: pooled buffers, pooled operation contexts, the socket capability
//! interface and the byte stream built on top of it.

pub mod buffer_list;
pub mod buffer_pool;
pub mod context;
#[cfg(test)]
pub mod memory;
pub mod socket;
pub mod stream;

pub use buffer_list::BufferList;
pub use buffer_pool::{Buffer, BufferPool, BUFFER_LEN};
pub use context::{AcceptContext, ContextState, DataContext, Pooled};
#[cfg(test)]
pub use memory::{MemoryConnector, MemoryPeer, MemorySocket};
pub use socket::{NativeSocket, Socket};
pub use stream::{ConnectionStream, CLOSE_LINGER};
