//! rollcall-core: face encodings, matching and the per-day attendance gate.
//!
//! Holds the encoding and identity types, the distance matcher, the per-day
//! session dedupe gate, and the boundary to the external face encoder.

pub mod clock;
pub mod dedupe;
pub mod encoder;
pub mod types;

pub use clock::DayClock;
pub use dedupe::SessionDeduper;
pub use encoder::{
    CommandEncoder, EncodedFace, EncoderError, FaceEncoder, NoEncoder, DEFAULT_REPLY_TIMEOUT,
};
pub use types::{
    BoundingBox, Detection, DistanceMatcher, DistanceMetric, Encoding, EncodingError, Identity,
    IdentityId, MatchResult, Matcher,
};
