// netblast-stream: traffic streams and pacing
//
// A stream is a pre-built template frame plus a token bucket. The egress
// scheduler asks the table for the next eligible stream and materializes
// one frame per admitted packet; the template itself is never mutated.

pub mod bucket;
pub mod bytes;
pub mod stream;
pub mod table;

pub use bucket::TokenBucket;
pub use stream::{MutationDescriptor, Stream, StreamError, StreamStats};
pub use table::StreamTable;
