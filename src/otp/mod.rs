//! Code verification: the pure time-step engine and the out-of-band
//! delivery-window issuer. Neither mutates registrations or stored keys.

pub mod oob;
pub mod totp;

pub use oob::{OobCodeIssuer, OobDispatcher};
pub use totp::TotpEngine;
