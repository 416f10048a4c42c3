pub mod broadcast;
pub mod response;
pub mod sse;
pub mod stats;
