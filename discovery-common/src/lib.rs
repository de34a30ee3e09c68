//! Building blocks shared by discovery clients: the retrying request pipeline,
//! the retry policy it follows, registry snapshot types and metrics serving.
pub mod endpoint;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod transport;
