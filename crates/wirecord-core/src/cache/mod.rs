//! Server (guild) cache mutated by dispatch events

mod guild;
mod store;

pub use guild::{merge, user_id_of, Guild};
pub use store::{GuildCache, DEFAULT_MAX_MESSAGES};
