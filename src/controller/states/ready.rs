use async_trait::async_trait;

use super::State;

/// Ready: steady state.  The periodic tick re-validates health.
pub struct Ready;

#[async_trait]
impl State for Ready {}
