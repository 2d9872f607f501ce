mod tracing;

pub use self::tracing::{LogFormat, init, init_tracing, init_with};
