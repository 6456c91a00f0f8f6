//! Entry hooks for each BeibootState.
//!
//! Each state is a zero-sized struct that implements [`State`].  The
//! `state_for()` function maps a runtime state value to a `&'static dyn State`.
//! States without side effects keep the default no-op hook.

use async_trait::async_trait;

use crate::crd::beiboot::BeibootState;
use crate::error::Result;

use super::state_machine::BeibootMachine;

mod creating;
mod error;
mod pending;
mod ready;
mod requested;
mod running;
mod terminating;

pub use creating::Creating;
pub use error::Error;
pub use pending::Pending;
pub use ready::Ready;
pub use requested::Requested;
pub use running::{add_kubeconfig_context, Running};
pub use terminating::Terminating;

/// Side effects of entering a state.  Runs once per transition, and again
/// when a tick resumes a sequence that stopped inside the hook.  Must be
/// safe to repeat.
#[async_trait]
pub trait State: Send + Sync {
    async fn on_enter(&self, _machine: &BeibootMachine<'_>) -> Result<()> {
        Ok(())
    }
}

/// Map a runtime state value to a static state implementation.
pub fn state_for(state: BeibootState) -> &'static dyn State {
    match state {
        BeibootState::Requested => &Requested,
        BeibootState::Creating => &Creating,
        BeibootState::Pending => &Pending,
        BeibootState::Running => &Running,
        BeibootState::Ready => &Ready,
        BeibootState::Error => &Error,
        BeibootState::Terminating => &Terminating,
    }
}
