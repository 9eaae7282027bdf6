//! Integration tests for media persistence through the relay.
//!
//! Verifies that images, the current-image pointer and trails written
//! through relay commands survive a relay restart on the same RocksDB
//! directory, and that store failures only reach the originating client.

use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;
use vitra_relay::protocol::{ClientEvent, ConnectionId, ServerEvent};
use vitra_relay::registry::Mailbox;
use vitra_relay::relay::{Relay, IMAGE_NOT_FOUND};
use vitra_relay::storage::{ImageRecord, MediaStore, StoreError, TrailSample};
use vitra_relay::RelayConfig;

fn config(dir: &TempDir) -> RelayConfig {
    RelayConfig {
        storage_path: Some(dir.path().to_path_buf()),
        ..RelayConfig::default()
    }
}

async fn connect(relay: &Relay) -> (ConnectionId, Mailbox) {
    let (id, mut mailbox) = relay.connect().await;
    mailbox.drain();
    (id, mailbox)
}

fn events(mailbox: &mut Mailbox) -> Vec<ServerEvent> {
    mailbox.drain().iter().map(|e| (**e).clone()).collect()
}

async fn upload(relay: &Relay, id: ConnectionId, mailbox: &mut Mailbox, name: &str) -> ImageRecord {
    relay
        .handle(
            id,
            ClientEvent::UploadImage {
                data: format!("data:{name}"),
                name: name.to_string(),
                mime_type: "image/png".to_string(),
            },
        )
        .await
        .unwrap();
    relay.settle().await;
    match events(mailbox).as_slice() {
        [ServerEvent::NewImage { image }] => image.clone(),
        other => panic!("Expected NewImage, got {other:?}"),
    }
}

#[tokio::test]
async fn test_media_survives_restart() {
    let dir = TempDir::new().unwrap();

    let (first, second) = {
        let relay = Relay::new(config(&dir)).unwrap();
        let (a, mut rx_a) = connect(&relay).await;

        let first = upload(&relay, a, &mut rx_a, "one.png").await;
        let second = upload(&relay, a, &mut rx_a, "two.png").await;
        relay
            .handle(a, ClientEvent::SetCurrentImage { image_id: second.id })
            .await
            .unwrap();
        relay.settle().await;
        relay
            .handle(
                a,
                ClientEvent::TrailData {
                    file_name: "alice trail".into(),
                    sample: TrailSample {
                        time_component: vec![1.0],
                        current_point: vec![3.0, 4.0],
                    },
                },
            )
            .await
            .unwrap();
        relay.settle().await;
        (first, second)
    };

    let relay = Relay::new(config(&dir)).unwrap();
    let store = relay.store().unwrap();

    let names: Vec<String> = store.images().unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["one.png", "two.png"]);
    assert_eq!(store.current_image().unwrap().map(|i| i.id), Some(second.id));
    assert_eq!(store.trail("alicetrail").unwrap().len(), 1);

    // Ids remain addressable after the restart.
    let (b, mut rx_b) = connect(&relay).await;
    relay
        .handle(b, ClientEvent::DeleteImage { image_id: first.id })
        .await
        .unwrap();
    relay.settle().await;
    assert_eq!(
        events(&mut rx_b),
        vec![ServerEvent::ImageDeleted { image_id: first.id }]
    );
}

#[tokio::test]
async fn test_delete_unknown_image_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let relay = Relay::new(config(&dir)).unwrap();
        let (a, mut rx_a) = connect(&relay).await;
        upload(&relay, a, &mut rx_a, "keep.png").await;
    }

    let relay = Relay::new(config(&dir)).unwrap();
    let (a, mut rx_a) = connect(&relay).await;
    let (_b, mut rx_b) = connect(&relay).await;

    relay
        .handle(a, ClientEvent::DeleteImage { image_id: Uuid::new_v4() })
        .await
        .unwrap();
    relay.settle().await;

    assert_eq!(
        events(&mut rx_a),
        vec![ServerEvent::ErrorMessage {
            message: IMAGE_NOT_FOUND.to_string()
        }]
    );
    assert!(rx_b.drain().is_empty());
    assert_eq!(relay.store().unwrap().images().unwrap().len(), 1);
}

/// A store whose writes always fail.
struct BrokenStore;

impl MediaStore for BrokenStore {
    fn insert_image(&self, _image: ImageRecord) -> Result<ImageRecord, StoreError> {
        Err(StoreError::DatabaseError("disk full".into()))
    }

    fn images(&self) -> Result<Vec<ImageRecord>, StoreError> {
        Ok(Vec::new())
    }

    fn delete_image(&self, _id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        Err(StoreError::DatabaseError("disk full".into()))
    }

    fn set_current_image(&self, _id: Uuid) -> Result<Option<ImageRecord>, StoreError> {
        Err(StoreError::DatabaseError("disk full".into()))
    }

    fn current_image(&self) -> Result<Option<ImageRecord>, StoreError> {
        Ok(None)
    }

    fn append_trail(&self, _file_name: &str, _sample: TrailSample) -> Result<usize, StoreError> {
        Err(StoreError::DatabaseError("disk full".into()))
    }

    fn trail(&self, _file_name: &str) -> Result<Vec<TrailSample>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_store_failures_reach_origin_only() {
    let store: Arc<dyn MediaStore> = Arc::new(BrokenStore);
    let relay = Relay::with_store(RelayConfig::default(), Some(store));
    let (a, mut rx_a) = connect(&relay).await;
    let (b, mut rx_b) = connect(&relay).await;
    relay.join(a, "r1").await.unwrap();
    relay.join(b, "r1").await.unwrap();
    rx_a.drain();
    rx_b.drain();

    relay
        .handle(a, ClientEvent::DeleteImage { image_id: Uuid::new_v4() })
        .await
        .unwrap();
    relay.settle().await;
    relay
        .handle(
            a,
            ClientEvent::UploadImage {
                data: "x".into(),
                name: "x.png".into(),
                mime_type: "image/png".into(),
            },
        )
        .await
        .unwrap();
    relay.settle().await;

    let a_events = events(&mut rx_a);
    assert_eq!(a_events.len(), 2);
    assert!(a_events
        .iter()
        .all(|e| matches!(e, ServerEvent::ErrorMessage { .. })));
    assert_eq!(
        a_events[0],
        ServerEvent::ErrorMessage {
            message: "Error deleting image.".to_string()
        }
    );
    assert!(rx_b.drain().is_empty());

    // Room state is untouched by collaborator failures.
    assert_eq!(relay.members("r1").await.unwrap().len(), 2);
}
