//! Sessions, users and the hub routing between them

mod hub;
#[allow(clippy::module_inception)]
mod session;
mod user;

pub use hub::{Hub, ROOM_TYPE_CONFERENCE, ROOM_TYPE_ROOM};
pub use session::{random_id, Session, SESSION_ID_LENGTH};
pub use user::User;
