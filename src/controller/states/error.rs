use async_trait::async_trait;

use super::State;

/// Error: something went wrong.  No specific outputs; the periodic tick
/// recovers once the workloads run again.
pub struct Error;

#[async_trait]
impl State for Error {}
