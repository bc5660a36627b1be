mod record;
mod state;
mod store;

pub use record::{RotationOutcome, RotationStateRecord};
pub use state::{
    DEFAULT_PATTERNS, InvalidTransition, RotationError, RotationState, RotationStateMachine,
    STYLE_CODES, TRANSITIONS, style_name,
};
pub use store::{InMemoryRotationStore, JsonFileRotationStore, RotationStore, StoreError};
