//! HTTP protocol subset.
//!
//! This module implements the minimal slice of HTTP/1.x the server speaks:
//! `GET` requests terminated by `\r\n\r\n`, and responses consisting of a
//! status line, `Content-Length`, `Content-Type`, `Connection`, a blank
//! line and a body.
//!
//! # Submodules
//!
//! - **`parser`**: Parses the request line from an accumulating byte buffer
//! - **`response`**: Status codes and header/error-body construction
//! - **`mime`**: Content-type detection based on file extensions
//!
//! # Connection State Machine
//!
//! Each client connection in the reactor backends goes through a fixed
//! sequence of states, never regressing:
//!
//! ```text
//!        ┌─────────────────┐
//!        │ ReadingRequest  │ ← Accumulate bytes until \r\n\r\n
//!        └────────┬────────┘
//!                 │ Request parsed (or rejected)
//!                 ▼
//!        ┌─────────────────┐
//!        │ SendingHeader   │ ← Drain status line + headers (+ error body)
//!        └────────┬────────┘
//!                 │ Header sent
//!                 ├─ File attached → SendingFile
//!                 └─ No file      → Closing
//!                 ▼
//!        ┌─────────────────┐
//!        │  SendingFile    │ ← Positional chunk reads, partial-write safe
//!        └────────┬────────┘
//!                 │ file_offset == file_size
//!                 ▼
//!              Closing
//! ```
//!
//! The worker-thread backend serves the same contract with blocking calls
//! and keep-alive instead of explicit states.

pub mod mime;
pub mod parser;
pub mod response;
