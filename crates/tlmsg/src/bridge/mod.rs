//! Wire layer for the native-messaging pipe.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed framing plus JSON encoding for AsyncRead/AsyncWrite
//! - **protocol**: request, response and progress message shapes

pub mod codec;
pub mod protocol;
