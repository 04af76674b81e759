//! Rate limiting logic and state management.

mod admission;
mod interval;
mod keyed;
mod window;

pub use admission::{client_key, AdmissionGate, AdmissionRequest, Admitted};
pub use interval::IntervalLimiter;
pub use keyed::{CleanupHandle, KeyedLimiter};
pub use window::{Decision, WindowCounter};
