//! File-backed tests: persistence across reopen and concurrent sibling allocation from several
//! store handles sharing one database file.

use convtree::{
    ConversationError, ConversationStore, MessageInput, MessagePart, Role, SaveMessageRequest,
    SessionBinding, SqliteConversationStore, StoreConfig, load_config,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn open_store(db_path: &Path) -> SqliteConversationStore {
    SqliteConversationStore::connect(StoreConfig::default().with_db(db_path))
        .await
        .expect("Failed to open conversation store")
}

fn user_message(text: &str) -> MessageInput {
    MessageInput::new(Uuid::now_v7().to_string(), Role::User).with_part(MessagePart::text(text))
}

#[tokio::test]
async fn test_tree_survives_reopen() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("conversations.db");
    let session_id = Uuid::new_v4().to_string();

    let root = user_message("What is a materialized path?");
    let root_id = root.id.clone();
    {
        let store = open_store(&db_path).await;
        store
            .save_message_node(
                SaveMessageRequest::new(&session_id, root)
                    .with_binding(SessionBinding::default().workspace("w1")),
            )
            .await
            .unwrap();
        store
            .save_message_node(
                SaveMessageRequest::new(
                    &session_id,
                    MessageInput::new("reply-1", Role::Assistant)
                        .with_part(MessagePart::text("A path string per node.")),
                )
                .with_parent(&root_id),
            )
            .await
            .unwrap();
    }

    let store = open_store(&db_path).await;
    let nodes = store.list_messages(&session_id).await.unwrap();
    let paths: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();
    assert_eq!(paths, vec!["01", "01/01"]);

    let session = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.title, "What is a materi");
    assert_eq!(session.workspace_id.as_deref(), Some("w1"));
    assert_eq!(
        store
            .resolve_rightmost_leaf_id(&session_id)
            .await
            .unwrap()
            .as_deref(),
        Some("reply-1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_siblings_get_distinct_paths() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("conversations.db");
    let session_id = Uuid::new_v4().to_string();

    // Two handles means two connections, standing in for two processes.
    let first = Arc::new(open_store(&db_path).await);
    let second = Arc::new(open_store(&db_path).await);

    let parent = user_message("Regenerate me");
    let parent_id = parent.id.clone();
    first
        .save_message_node(SaveMessageRequest::new(&session_id, parent))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..24 {
        let store = if i % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        let session_id = session_id.clone();
        let parent_id = parent_id.clone();
        handles.push(tokio::spawn(async move {
            let reply = MessageInput::new(Uuid::now_v7().to_string(), Role::Assistant)
                .with_part(MessagePart::text(format!("variant {i}")));
            store
                .save_message_node(SaveMessageRequest::new(session_id, reply).with_parent(parent_id))
                .await
        }));
    }

    let mut paths = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap().expect("sibling insert failed");
        let node = outcome.node().expect("assistant reply with text is persisted");
        assert!(paths.insert(node.path.clone()), "duplicate path {}", node.path);
    }

    let expected: HashSet<String> = (1..=24).map(|seq| format!("01/{seq:02}")).collect();
    assert_eq!(paths, expected);

    let children = second
        .list_children(&session_id, Some(&parent_id))
        .await
        .unwrap();
    assert_eq!(children.len(), 24);
}

#[tokio::test]
async fn test_cross_session_reuse_is_rejected_across_handles() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("conversations.db");

    let first = open_store(&db_path).await;
    let second = open_store(&db_path).await;

    let message = user_message("hello");
    first
        .save_message_node(SaveMessageRequest::new("session-a", message.clone()))
        .await
        .unwrap();

    let err = second
        .save_message_node(SaveMessageRequest::new("session-b", message))
        .await
        .unwrap_err();
    assert!(matches!(err, ConversationError::CrossSessionConflict { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_store_from_config_file() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("convtree.toml");
    std::fs::write(
        &config_path,
        "[store]\ndb = \"data.db\"\nbusy_timeout_ms = 2000\ndefault_title = \"Untitled\"\n",
    )
    .unwrap();

    let config = load_config(&config_path).await.unwrap();
    assert_eq!(config.db.as_deref(), Some(temp_dir.path().join("data.db").as_path()));

    let store = SqliteConversationStore::connect(config).await.unwrap();
    let session = store
        .ensure_session("s1", SessionBinding::default())
        .await
        .unwrap();
    assert_eq!(session.title, "Untitled");
    assert!(temp_dir.path().join("data.db").exists());
}
