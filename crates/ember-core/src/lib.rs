//! Domain model shared by the ember control plane and agent.

mod status;

mod game;
mod heartbeat;
mod model;
mod validation;

pub use game::*;
pub use heartbeat::*;
pub use model::*;
pub use status::*;
pub use validation::ValidationErrors;
