use courier_common::MessageId;
use courier_spool::{BackingStore, SpoolConfig, SpoolError};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Record {
    Waiting { attempts: u32 },
    Parked(String),
}

#[test]
fn parse_file_config() {
    let config: SpoolConfig = ron::from_str(r#"File(path: "/var/tmp/courier")"#).unwrap();
    assert_eq!(config.path().unwrap().to_str(), Some("/var/tmp/courier"));
    assert!(config.is_durable());
}

#[test]
fn parse_memory_config() {
    let config: SpoolConfig = ron::from_str("Memory(capacity: Some(4))").unwrap();
    assert_eq!(config, SpoolConfig::Memory { capacity: Some(4) });
    assert!(!config.is_durable());
    assert!(config.path().is_none());
}

#[tokio::test]
async fn file_stores_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = SpoolConfig::File {
        path: dir.path().to_path_buf(),
    };

    let first = MessageId::generate();
    let second = MessageId::generate();
    {
        let queue = config.open::<Record>("queue").unwrap();
        queue.write(&first, &Record::Waiting { attempts: 0 }).await.unwrap();
        queue
            .write(&second, &Record::Parked("later".to_string()))
            .await
            .unwrap();
        queue.update(&first, &Record::Waiting { attempts: 2 }).await.unwrap();
    }

    let queue = config.open::<Record>("queue").unwrap();
    assert_eq!(queue.list().await.unwrap(), vec![first, second]);
    assert_eq!(
        queue.read(&first).await.unwrap(),
        Record::Waiting { attempts: 2 }
    );

    let dead = config.open::<Record>("dead").unwrap();
    assert!(dead.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_write_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    for config in [
        SpoolConfig::Memory { capacity: None },
        SpoolConfig::File {
            path: dir.path().to_path_buf(),
        },
    ] {
        let store = config.open::<Record>("queue").unwrap();
        let id = MessageId::generate();
        store.write(&id, &Record::Parked("a".into())).await.unwrap();

        assert!(matches!(
            store.write(&id, &Record::Parked("b".into())).await,
            Err(SpoolError::AlreadyExists(_))
        ));
    }
}
