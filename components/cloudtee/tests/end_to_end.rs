use cloudtee::helpers::load_config::{CloudwatchSettings, S3Settings, Settings};
use cloudtee::log_service::memory::MemoryLogService;
use cloudtee::tee::tee::{Tee, TeeClients};
use object_store::memory::InMemory;
use object_store::{GetOptions, ObjectStore, path::Path};
use std::sync::Arc;
use std::time::Duration;

fn settings() -> Settings {
    Settings {
        s3: Some(S3Settings::parse("s3://bucket/prefix/").unwrap()),
        cloudwatch: Some(CloudwatchSettings {
            log_group: "/g".to_string(),
            flush_interval: Duration::from_secs(5),
            buffer_lines: 50,
            create_log_group: false,
        }),
        ..Settings::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn input_reaches_stdout_object_and_log_stream() {
    let store = Arc::new(InMemory::new());
    let service = Arc::new(MemoryLogService::new().with_stream("/g", "out", None));
    let tee = Tee::with_clients(
        settings(),
        TeeClients {
            object_store: Some(store.clone()),
            log_service: Some(service.clone()),
        },
    );

    let input: &[u8] = b"a\nb\n";
    let mut reader = tee.tee_reader(input, "out.log").await.unwrap();
    assert_eq!(
        reader.destinations(),
        ["s3://bucket/prefix/out.log", "LogGroup=/g, LogStream=out"]
    );

    let mut stdout = Vec::new();
    reader.copy_to(&mut stdout).await.unwrap();
    assert_eq!(stdout, input);

    // Two lines are below the buffer size and the interval has not elapsed.
    assert!(service.put_calls().is_empty());

    reader.close().await.unwrap();

    let object = store
        .get_opts(&Path::from("prefix/out.log"), GetOptions::default())
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(object.as_ref(), input);

    let calls = service.put_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].sequence_token, None);
    let messages: Vec<&str> = calls[0].events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, ["a", "b"]);
    assert!(calls[0].events[0].timestamp <= calls[0].events[1].timestamp);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_destination_does_not_stop_the_others() {
    let store = Arc::new(InMemory::new());
    let service = Arc::new(MemoryLogService::new().with_stream("/g", "out", None));
    service.fail_next_put(cloudtee::log_service::LogServiceError::Service {
        operation: "PutLogEvents",
        message: "access denied".to_string(),
    });
    let tee = Tee::with_clients(
        settings(),
        TeeClients {
            object_store: Some(store.clone()),
            log_service: Some(service.clone()),
        },
    );

    let input: &[u8] = b"only line\n";
    let mut reader = tee.tee_reader(input, "out.log").await.unwrap();
    let mut stdout = Vec::new();
    reader.copy_to(&mut stdout).await.unwrap();
    let err = reader.close().await.unwrap_err();

    assert_eq!(stdout, input);
    assert!(err.to_string().contains("LogGroup=/g, LogStream=out"));
    let object = store
        .get_opts(&Path::from("prefix/out.log"), GetOptions::default())
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(object.as_ref(), input);
}
