//! `frameio`: message framing for the master/instance control channel.
//!
//! The fleet protocol assumes a reliable, ordered, message-oriented link.
//! We get that from TCP plus a `u32` little-endian length prefix per message;
//! this crate implements exactly that and nothing more. Decoders downstream
//! receive the payload as `bytes::Bytes` sliced out of the read buffer, so a
//! frame is never copied after it leaves the socket.

pub mod frame;
