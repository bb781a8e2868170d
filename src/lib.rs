//! Interactive object segmentation sessions: prompts in, layered masks and
//! preview composites out.

pub mod compose;
pub mod error;
pub mod history;
pub mod input;
pub mod mask;
pub mod output;
pub mod prompt;
pub mod segmentation;
pub mod session;
pub mod view;

pub use error::{Result, SessionError};
pub use session::{Action, InputMode, Session, SessionConfig, SessionId, SessionRegistry};
pub use view::ViewMode;
