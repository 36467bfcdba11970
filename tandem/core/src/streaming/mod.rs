//! Streaming Infrastructure
//!
//! Decoding of one turn's chunked response body into protocol events.
//!
//! # Architecture
//!
//! ```text
//!   ChatTransport::open_stream()
//!              │
//!              ▼
//!   ByteStream (Bytes fragments, arbitrary boundaries)
//!              │
//!        decode(body, lanes)
//!              │
//!              ▼
//!   StreamEvent { Content | Complete | Error }  ──▶  Reconciler
//! ```
//!
//! The decoder never fails: malformed records are dropped, and a body that
//! ends before every lane terminated yields one synthetic [`StreamEvent::Error`].
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use tandem_core::streaming::decode;
//!
//! let body = transport.open_stream(&request).await?;
//! let mut events = Box::pin(decode(body, 1));
//! while let Some(event) = events.next().await {
//!     reconciler.apply(&mut store, event);
//! }
//! ```

mod decoder;

pub use decoder::{decode, decode_record, failure_text, Decoder, StreamEvent, MAX_LINE_BYTES};
