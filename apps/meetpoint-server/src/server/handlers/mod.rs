pub(crate) mod auth;
pub(crate) mod chats;
pub(crate) mod events;
pub(crate) mod friends;
pub(crate) mod messages;
pub(crate) mod notifications;
pub(crate) mod participation;
pub(crate) mod users;
