pub mod alert;
pub mod location;
pub mod request;
pub mod ride;
pub mod session;
pub mod user;
