pub(crate) mod admin;
pub(crate) mod dispatch;
pub(crate) mod session;
