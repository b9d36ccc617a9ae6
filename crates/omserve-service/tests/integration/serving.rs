use std::fs;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use omserve_service::config::Config;
use omserve_service::service::{ByteRange, FileService, ReadOutcome};
use omserve_test::OriginServer;

fn array_file(fill: u8, len: usize) -> Vec<u8> {
    let mut data = vec![fill; len];
    data[..3].copy_from_slice(b"OM\x03");
    data
}

fn data_of(outcome: ReadOutcome) -> Vec<u8> {
    match outcome {
        ReadOutcome::Slice(slice) => slice.data.to_vec(),
        other => panic!("expected a slice, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_remote_reads() {
    omserve_test::setup();
    let dir = omserve_test::tempdir();
    let server = OriginServer::new().await;
    server.put("dwd_icon/chunk_1.om", array_file(7, 4096), "v1");
    server.set_delay(Duration::from_millis(50));

    let yaml = format!(
        r#"
        data_dir: {}
        remote_url: {}
        caches:
          blocks:
            block_size: 256
        "#,
        dir.path().display(),
        server.base_url(),
    );
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let service = Arc::new(FileService::create(&config).unwrap());
    let key = service.key("dwd_icon/chunk_1.om").unwrap();

    let reads = (0..16u64).map(|i| {
        let service = Arc::clone(&service);
        let key = key.clone();
        tokio::spawn(async move {
            let range = ByteRange::Bounded(i * 200, i * 200 + 99);
            service.read(&key, range).await
        })
    });
    for result in join_all(reads).await {
        let data = data_of(result.unwrap().unwrap());
        assert_eq!(data.len(), 100);
        assert!(data.iter().skip(3).all(|b| *b == 7));
    }

    // all reads shared a single resolution
    assert_eq!(server.heads(), 1);
}

#[tokio::test]
async fn test_local_files_shadow_remote() {
    omserve_test::setup();
    let dir = omserve_test::tempdir();
    let server = OriginServer::new().await;
    server.put("meta.json", &b"{\"remote\": true}"[..], "v1");
    fs::write(dir.path().join("meta.json"), b"{\"local\": true}").unwrap();

    let config = Config {
        data_dir: dir.path().to_owned(),
        remote_url: Some(server.base_url()),
        ..Default::default()
    };
    let service = FileService::create(&config).unwrap();
    let key = service.key("meta.json").unwrap();

    let data = data_of(service.read(&key, ByteRange::Full).await.unwrap());
    assert_eq!(data, b"{\"local\": true}");
    assert_eq!(server.heads(), 0);

    let other = service.key("other.json").unwrap();
    assert_eq!(
        service.read(&other, ByteRange::Full).await,
        Ok(ReadOutcome::Missing)
    );
    assert_eq!(server.heads(), 1);
}
