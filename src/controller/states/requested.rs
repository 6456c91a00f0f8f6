use async_trait::async_trait;

use super::State;

/// Requested: accepted, nothing provisioned yet.
pub struct Requested;

#[async_trait]
impl State for Requested {}
