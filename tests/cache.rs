use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quickstep::cache::{self, embedded::EmbeddedCache, filesystem::FilesystemCache, memory::MemoryCache, Cache};
use quickstep::coalesce::Registry;
use quickstep::config;
use quickstep::timeseries::{MatrixData, MatrixEnvelope, SamplePair, SampleStream, TagSet};

fn sample_matrix() -> MatrixEnvelope {
    let mut metric = TagSet::new();
    metric.insert("__name__".to_string(), "test_metric".to_string());
    MatrixEnvelope {
        status: "success".to_string(),
        data: MatrixData {
            result_type: "matrix".to_string(),
            result: vec![SampleStream {
                metric,
                values: vec![SamplePair::new(1000, 1.5), SamplePair::new(2000, 2.5)],
            }],
        },
    }
}

#[test]
fn test_payload_roundtrip_uncompressed() {
    let matrix = sample_matrix();
    let payload = cache::encode_payload(&matrix, false).unwrap();
    assert_eq!(payload[0], b'{');
    let decoded = cache::decode_payload(&payload).unwrap();
    assert_eq!(decoded, matrix);
}

#[test]
fn test_payload_roundtrip_compressed() {
    let matrix = sample_matrix();
    let payload = cache::encode_payload(&matrix, true).unwrap();
    // Compressed bytes must not look like a JSON object, or sniffing
    // would misread them.
    assert_ne!(payload[0], b'{');
    let decoded = cache::decode_payload(&payload).unwrap();
    assert_eq!(decoded, matrix);
}

#[test]
fn test_payload_decode_rejects_garbage() {
    assert!(cache::decode_payload(b"").is_err());
    assert!(cache::decode_payload(&[0x42, 0x13, 0x37]).is_err());
    assert!(cache::decode_payload(b"{not json").is_err());
}

#[tokio::test]
async fn test_memory_cache_roundtrip() {
    let store = MemoryCache::new(Duration::from_secs(60), Arc::new(Registry::new()));
    store.connect().await.unwrap();

    assert!(store.retrieve("missing").await.is_err());

    store
        .store("k1", Bytes::from_static(b"payload"), 60)
        .await
        .unwrap();
    assert_eq!(store.retrieve("k1").await.unwrap(), Bytes::from_static(b"payload"));

    store.remove("k1").await.unwrap();
    assert!(store.retrieve("k1").await.is_err());
}

#[tokio::test]
async fn test_memory_cache_reaps_expired_entries() {
    let store = MemoryCache::new(Duration::from_millis(50), Arc::new(Registry::new()));
    store.connect().await.unwrap();

    store.store("gone", Bytes::from_static(b"x"), -1).await.unwrap();
    store.store("kept", Bytes::from_static(b"y"), 600).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(store.retrieve("gone").await.is_err());
    assert!(store.retrieve("kept").await.is_ok());
}

#[tokio::test]
async fn test_filesystem_cache_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config::FilesystemCache {
        cache_path: dir.path().to_string_lossy().to_string(),
    };
    let store = FilesystemCache::new(&cfg, Duration::from_secs(60), Arc::new(Registry::new()));
    store.connect().await.unwrap();

    store
        .store("abc.def", Bytes::from_static(b"payload"), 60)
        .await
        .unwrap();
    assert!(dir.path().join("abc.def.data").exists());
    assert!(dir.path().join("abc.def.expiration").exists());
    assert_eq!(
        store.retrieve("abc.def").await.unwrap(),
        Bytes::from_static(b"payload")
    );

    store.remove("abc.def").await.unwrap();
    assert!(store.retrieve("abc.def").await.is_err());
}

#[tokio::test]
async fn test_filesystem_cache_reaps_expired_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config::FilesystemCache {
        cache_path: dir.path().to_string_lossy().to_string(),
    };
    let store = FilesystemCache::new(&cfg, Duration::from_millis(50), Arc::new(Registry::new()));
    store.connect().await.unwrap();

    store.store("gone", Bytes::from_static(b"x"), -1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(store.retrieve("gone").await.is_err());
    assert!(!dir.path().join("gone.data").exists());
    assert!(!dir.path().join("gone.expiration").exists());
}

#[tokio::test]
async fn test_embedded_cache_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config::EmbeddedCache {
        path: dir.path().join("db").to_string_lossy().to_string(),
    };
    let store =
        EmbeddedCache::new(&cfg, Duration::from_secs(60), Arc::new(Registry::new())).unwrap();
    store.connect().await.unwrap();

    store
        .store("k1", Bytes::from_static(b"payload"), 60)
        .await
        .unwrap();
    assert_eq!(store.retrieve("k1").await.unwrap(), Bytes::from_static(b"payload"));

    store.remove("k1").await.unwrap();
    assert!(store.retrieve("k1").await.is_err());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_embedded_cache_reaps_expired_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config::EmbeddedCache {
        path: dir.path().join("db").to_string_lossy().to_string(),
    };
    let store =
        EmbeddedCache::new(&cfg, Duration::from_millis(50), Arc::new(Registry::new())).unwrap();
    store.connect().await.unwrap();

    store.store("gone", Bytes::from_static(b"x"), -1).await.unwrap();
    store.store("kept", Bytes::from_static(b"y"), 600).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(store.retrieve("gone").await.is_err());
    assert!(store.retrieve("kept").await.is_ok());
}
