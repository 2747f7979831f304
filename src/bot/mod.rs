/// Command and message handlers
pub mod handlers;
/// Reply sink writing into Telegram chats
pub mod responder;
/// Dispatcher setup
pub mod runner;
