//! Activation records and their promoted full frames.

mod activation;
mod full_frame;

pub use activation::{
    Activation, ActivationEvent, ActivationId, ActivationKind, ActivationState, RootLatch,
    RootOutcome,
};
pub use full_frame::FullFrame;
