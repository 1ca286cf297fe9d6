// hsm-common - Wire format shared by the HSM client and simulator
//
// This crate defines the length-prefixed ASCII framing and the response
// field convention every HSM command relies on.

pub mod error;
pub mod frame;
pub mod response;

// Re-export for convenience
pub use error::*;
pub use frame::*;
pub use response::*;
