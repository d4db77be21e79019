//! Session Store Integration Tests
//!
//! Tests for session persistence across store instances.

use rambobot::history::ChatMessage;
use rambobot::models::ModelClass;
use rambobot::session::{CurrentCommand, Session, SessionStore};
use rambobot::HistoryStore;
use tempfile::TempDir;

fn create_test_store(name: &str) -> (SessionStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join(format!("{}.db", name));
    let store = SessionStore::open(&db_path).expect("Failed to create store");
    (store, temp_dir)
}

#[test]
fn test_lazy_default_session() {
    let (store, _temp) = create_test_store("lazy");

    let session = store.load(12345).unwrap();
    assert!(session.current_command.is_none());
    assert!(session.text_history.is_empty());
    assert!(session.code_history.is_empty());
    assert!(session.available_models.is_empty());
}

#[test]
fn test_persistence_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("reopen.db");
    let chat_id = 12345;

    {
        let store = SessionStore::open(&db_path).unwrap();
        let mut session = Session::default();
        session.text_history.push(ChatMessage::user("remember me"));
        session.current_command = Some(CurrentCommand::new("config"));
        store.save(chat_id, &session).unwrap();
    }

    let store = SessionStore::open(&db_path).unwrap();
    let session = store.load(chat_id).unwrap();
    assert_eq!(session.text_history.len(), 1);
    assert_eq!(
        session.current_command.as_ref().map(|c| c.id.as_str()),
        Some("config")
    );
}

#[test]
fn test_save_after_every_event_pattern() {
    let (store, _temp) = create_test_store("events");
    let history = HistoryStore::new(3);
    let chat_id = 777;

    // Each "event": load, mutate, save
    for i in 0..5 {
        let mut session = store.load(chat_id).unwrap();
        history.append(
            &mut session,
            ModelClass::Text,
            ChatMessage::user(format!("event {}", i)),
        );
        store.save(chat_id, &session).unwrap();
    }

    let session = store.load(chat_id).unwrap();
    // Cap of 3 applied on every append, oldest dropped first
    assert_eq!(session.text_history.len(), 3);
}

#[test]
fn test_chats_are_isolated() {
    let (store, _temp) = create_test_store("isolation");

    let mut a = Session::default();
    a.text_history.push(ChatMessage::user("chat A"));
    store.save(111, &a).unwrap();

    let mut b = Session::default();
    b.code_history.push(ChatMessage::user("chat B"));
    store.save(222, &b).unwrap();

    let a = store.load(111).unwrap();
    let b = store.load(222).unwrap();
    assert_eq!(a.text_history.len(), 1);
    assert!(a.code_history.is_empty());
    assert_eq!(b.code_history.len(), 1);
    assert!(b.text_history.is_empty());
}

#[test]
fn test_multi_part_content_round_trips() {
    let (store, _temp) = create_test_store("multipart");
    let chat_id = 55;

    let mut session = Session::default();
    session.text_history.push(ChatMessage::user_with_image(
        Some("what is in this photo"),
        "https://api.telegram.org/file/bot123/photos/p.jpg",
    ));
    store.save(chat_id, &session).unwrap();

    let loaded = store.load(chat_id).unwrap();
    assert_eq!(loaded.text_history, session.text_history);
    assert!(loaded.text_history[0].content.has_image());
}
