//! Local control socket for clients on the same host

mod protocol;
mod server;

pub use protocol::{Notification, Request, Response};
pub use server::Server;
