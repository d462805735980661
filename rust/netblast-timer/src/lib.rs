// netblast-timer: monotonic clock and cooperative timer wheel
//
// One timer root drives all I/O jobs of a thread. Callbacks fired in the
// same tick share a single timestamp so every frame produced in that tick
// carries the same clock value.

pub mod clock;
pub mod wheel;

pub use clock::Timestamp;
pub use wheel::{TimerHandle, TimerRoot};
