//! Application state shared by the terminal front end.

mod state;

pub use state::{default_username, ChatState};
