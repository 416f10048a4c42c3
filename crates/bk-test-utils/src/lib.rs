// bk-test-utils: shared test utilities for the kit's integration suites.
//
// Provides an SSE test client that speaks the event-stream wire format,
// for exercising the broker end-to-end through a live HTTP server.

pub mod sse_client;

pub use sse_client::{ConnectOptions, SseClient, SseClientError, SseFrame};
