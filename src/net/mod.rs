//! Socket-address plumbing and the owning socket handle.

pub(crate) mod addr;
pub(crate) mod socket;

pub(crate) use socket::Socket;
