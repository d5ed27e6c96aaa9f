pub mod eventstream;
pub(crate) mod http;
pub mod sse;

#[doc(hidden)]
pub mod test_support;
