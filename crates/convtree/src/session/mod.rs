pub mod binder;
pub use binder::SessionBinding;

mod save;
pub mod schema;
pub mod sqlite_storage;
pub use sqlite_storage::SqliteConversationStore;
pub mod store;
pub use store::{ConversationStore, SaveMessageRequest, Session};
