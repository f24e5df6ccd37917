//! Token bucket rate limiting and supporting primitives.

mod backend;
mod bucket;
mod cancel;
mod clock;
mod keyed;

pub use backend::AdmissionControl;
pub use bucket::{Admission, TokenBucket};
pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use keyed::KeyedBuckets;

pub(crate) use bucket::validate_parameters;
