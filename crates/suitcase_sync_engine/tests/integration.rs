//! End-to-end tests of download, upload and reset against the mock session.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use suitcase_protocol::{ColumnDefinition, ColumnType, Outcome, RowResource, TableSchema};
use suitcase_sync_engine::{
    CsvConfig, DownloadParams, MockOp, MockSession, Progress, ResetParams, RetryConfig, RowError,
    SyncConfig, SyncError, SyncResult, Task, TaskOutcome, TaskRunner, UploadParams,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn schema() -> TableSchema {
    TableSchema {
        table_id: "census".into(),
        schema_etag: "s1".into(),
        data_version: "1".into(),
        columns: vec![
            ColumnDefinition::leaf("name", ColumnType::String),
            ColumnDefinition::leaf("age", ColumnType::Integer),
            ColumnDefinition::leaf("photo", ColumnType::Rowpath),
        ],
    }
}

fn row(id: &str, values: Value) -> RowResource {
    match values {
        Value::Object(map) => RowResource::new(id, map),
        _ => RowResource::new(id, Map::new()),
    }
}

fn people(ids: std::ops::Range<usize>) -> Vec<RowResource> {
    ids.map(|i| row(&format!("uuid:{i}"), json!({"name": format!("person {i}"), "age": i})))
        .collect()
}

fn config() -> SyncConfig {
    SyncConfig::new()
        .with_page_size(100)
        .with_timeout(Duration::from_secs(2))
        .with_retry(
            RetryConfig::new(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
}

fn runner(mock: &Arc<MockSession>, config: SyncConfig) -> TaskRunner {
    TaskRunner::new(mock.clone(), config)
}

fn download(csv: CsvConfig, out: &Path) -> Task {
    Task::Download(DownloadParams::new("census", csv, Some(out)).unwrap())
}

fn csv_path(root: &Path) -> std::path::PathBuf {
    root.join("default").join("census").join("census.csv")
}

fn read_csv(root: &Path) -> String {
    std::fs::read_to_string(csv_path(root)).unwrap()
}

#[tokio::test]
async fn two_pages_of_100_rows() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![people(0..100), people(100..200)]);
    let dir = tempfile::tempdir().unwrap();

    let outcome = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TaskOutcome::Completed(SyncResult {
            rows_processed: 200,
            attachments_fetched: 0,
            attachments_skipped: 0,
            attachments_failed: 0,
            errors: vec![],
        })
    );
    let content = read_csv(dir.path());
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 201);
    assert_eq!(lines[0], "_id,name,age,photo");
    assert_eq!(lines[1], "uuid:0,person 0,0,");
    assert_eq!(lines[200], "uuid:199,person 199,199,");
    assert_eq!(mock.page_requests(), vec![None, Some("page-1".to_string())]);
}

#[tokio::test]
async fn rerun_with_present_attachments_fetches_nothing() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    let rows: Vec<RowResource> = (0..3)
        .map(|i| row(&format!("uuid:{i}"), json!({"name": "x", "photo": "photo.jpg"})))
        .collect();
    for r in &rows {
        mock.add_attachment(&r.row_id, "photo.jpg", vec![7u8; 64]);
    }
    mock.set_pages(vec![rows]);
    let dir = tempfile::tempdir().unwrap();
    let csv = CsvConfig::new(true, false, false);

    let first = runner(&mock, config())
        .run(&download(csv, dir.path()))
        .await
        .unwrap();
    assert_eq!(first.result().attachments_fetched, 3);
    let bytes_after_first = mock.bytes_downloaded();
    assert_eq!(bytes_after_first, 192);

    let second = runner(&mock, config().with_force_overwrite(true))
        .run(&download(csv, dir.path()))
        .await
        .unwrap();
    assert_eq!(second.result().attachments_fetched, 0);
    assert_eq!(second.result().attachments_skipped, 3);
    assert_eq!(mock.bytes_downloaded(), bytes_after_first);

    let content = read_csv(dir.path());
    assert!(content.contains("uuid:1,x,,instances/uuid%3A1/photo.jpg"));
    assert!(dir
        .path()
        .join("default/census/instances/uuid%3A2/photo.jpg")
        .is_file());
}

#[tokio::test]
async fn existing_output_is_refused_without_force() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![people(0..2)]);
    let dir = tempfile::tempdir().unwrap();

    runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap();
    let err = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::OutputExists(_)));
    assert_eq!(mock.calls(MockOp::FetchPage), 1);
}

#[tokio::test]
async fn one_failed_attachment_among_many() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    let rows: Vec<RowResource> = (0..4)
        .map(|i| row(&format!("uuid:{i}"), json!({"name": format!("p{i}"), "photo": "a.jpg"})))
        .collect();
    let mut urls = Vec::new();
    for r in &rows {
        urls.push(mock.add_attachment(&r.row_id, "a.jpg", b"data".to_vec()));
    }
    mock.fail_url(urls[2].clone());
    mock.set_pages(vec![rows]);
    let dir = tempfile::tempdir().unwrap();

    let result = runner(&mock, config())
        .run(&download(CsvConfig::new(true, false, false), dir.path()))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.rows_processed, 4);
    assert_eq!(result.attachments_fetched, 3);
    assert_eq!(result.attachments_failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].row_id, "uuid:2");

    let content = read_csv(dir.path());
    assert!(content.contains("uuid:2,p2,,instances/uuid%3A2/a.jpg"));
    assert!(!dir
        .path()
        .join("default/census/instances/uuid%3A2/a.jpg")
        .exists());
}

#[tokio::test]
async fn scan_formatting_output_is_byte_exact() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![vec![row(
        "r1",
        json!({"name": "say \"hi\"\r\nthen\tleave", "age": 7}),
    )]]);
    let dir = tempfile::tempdir().unwrap();

    runner(&mock, config())
        .run(&download(CsvConfig::new(false, true, false), dir.path()))
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(csv_path(dir.path())).unwrap(),
        b"_id,name,age,photo\r\nr1,say 'hi' then leave,7,\r\n"
    );
}

#[tokio::test]
async fn metadata_columns_are_appended() {
    let mock = Arc::new(MockSession::new("default", schema()));
    let mut r = row("r1", json!({"name": "a"}));
    r.metadata.savepoint_type = Some("COMPLETE".into());
    r.metadata.row_etag = Some("etag-1".into());
    mock.set_pages(vec![vec![r]]);
    let dir = tempfile::tempdir().unwrap();

    runner(&mock, config())
        .run(&download(CsvConfig::new(false, false, true), dir.path()))
        .await
        .unwrap();

    let content = read_csv(dir.path());
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(
        lines[0],
        "_id,name,age,photo,_form_id,_locale,_savepoint_type,_savepoint_timestamp,\
         _savepoint_creator,_create_user,_last_update_user,_row_etag"
    );
    assert_eq!(lines[1], "r1,a,,,,,COMPLETE,,,,,etag-1");
}

#[tokio::test]
async fn cancel_after_first_page() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![people(0..100), people(100..200), people(200..300)]);
    let dir = tempfile::tempdir().unwrap();

    let runner = runner(&mock, config());
    let handle = runner.cancel_handle();
    let runner = runner.with_listener(move |progress: &Progress| {
        if progress.pages == 1 {
            handle.cancel();
        }
    });

    let outcome = runner
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.result().rows_processed, 100);
    assert_eq!(outcome.result().attachments_fetched, 0);
    assert_eq!(mock.calls(MockOp::FetchPage), 1);
    assert_eq!(read_csv(dir.path()).lines().count(), 101);
    assert!(matches!(outcome.into_result(), Err(SyncError::Cancelled)));
}

#[tokio::test]
async fn transient_page_failures_are_retried() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![people(0..3), people(3..5)]);
    mock.fail_call(MockOp::FetchPage, 0, SyncError::ServerError("HTTP 503".into()));
    mock.fail_call(MockOp::FetchPage, 2, SyncError::Timeout);
    let dir = tempfile::tempdir().unwrap();

    let outcome = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap();

    assert_eq!(outcome.result().rows_processed, 5);
    assert_eq!(
        mock.page_requests(),
        vec![
            None,
            None,
            Some("page-1".to_string()),
            Some("page-1".to_string())
        ]
    );
}

#[tokio::test]
async fn fatal_error_keeps_flushed_pages() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![people(0..100), people(100..200)]);
    mock.fail_call(MockOp::FetchPage, 1, SyncError::from_status(400, "bad cursor"));
    let dir = tempfile::tempdir().unwrap();

    let err = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(mock.calls(MockOp::FetchPage), 2);
    assert_eq!(read_csv(dir.path()).lines().count(), 101);
}

#[tokio::test]
async fn auth_failure_writes_nothing() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.fail_call(MockOp::FetchSchema, 0, SyncError::from_status(401, ""));
    let dir = tempfile::tempdir().unwrap();

    let err = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    assert_eq!(mock.calls(MockOp::FetchSchema), 1);
    assert!(!csv_path(dir.path()).exists());
}

#[tokio::test]
async fn missing_table_is_not_found() {
    let mock = Arc::new(MockSession::without_table("default"));
    let dir = tempfile::tempdir().unwrap();

    let err = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn repeated_cursor_is_a_protocol_error() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_pages(vec![people(0..1), people(1..2)]);
    mock.set_cursor_after(1, "page-1");
    let dir = tempfile::tempdir().unwrap();

    let err = runner(&mock, config())
        .run(&download(CsvConfig::default(), dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
    assert_eq!(mock.calls(MockOp::FetchPage), 2);
}

fn write_upload_csv(root: &Path, content: &str) -> std::path::PathBuf {
    let path = root.join("upload.csv");
    std::fs::write(&path, content).unwrap();
    path
}

fn upload(input: &Path, version: &str) -> Task {
    Task::Upload(UploadParams::new("census", Some(input), Some(version)).unwrap())
}

#[tokio::test]
async fn stale_version_posts_nothing() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_data_version("2");
    let dir = tempfile::tempdir().unwrap();
    let input = write_upload_csv(dir.path(), "_id,name\nr1,a\n");

    let err = runner(&mock, config())
        .run(&upload(&input, "1"))
        .await
        .unwrap_err();

    match err {
        SyncError::VersionConflict { supplied, server } => {
            assert_eq!(supplied, "1");
            assert_eq!(server, "2");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mock.calls(MockOp::PostRows), 0);
    assert!(mock.posted().is_empty());
}

#[tokio::test]
async fn unknown_column_posts_nothing() {
    let mock = Arc::new(MockSession::new("default", schema()));
    let dir = tempfile::tempdir().unwrap();
    let input = write_upload_csv(dir.path(), "_id,name,shoe_size\nr1,a,44\n");

    let err = runner(&mock, config())
        .run(&upload(&input, "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Schema(_)));
    assert!(mock.posted().is_empty());
}

#[tokio::test]
async fn upload_batches_rows_and_records_outcomes() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_outcome("r4", Outcome::Denied);
    let dir = tempfile::tempdir().unwrap();
    let input = write_upload_csv(
        dir.path(),
        "_id,name,age\nr1,a,1\nr2,b,2\nr3,c,not-a-number\nr4,d,4\nr5,e,5\n",
    );

    let result = runner(&mock, config().with_upload_batch(2, 1 << 20))
        .run(&upload(&input, "1"))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let batches = mock.posted();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].rows.len(), 2);
    assert_eq!(batches[0].data_version, "1");
    assert_eq!(batches[1].rows[0].row_id, "r4");
    assert_eq!(batches[0].rows[1].values["age"], json!(2));

    assert_eq!(result.rows_processed, 3);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(result.errors[0].row_id, "r3");
    assert!(result.errors[0].message.contains("age"));
    assert_eq!(result.errors[1], RowError::new("r4", "denied"));
}

#[tokio::test]
async fn download_then_upload_round_trip() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    let rows = vec![
        row("uuid:a", json!({"name": "Ada", "age": 36, "photo": "a.jpg"})),
        row("uuid:b", json!({"name": "Bo", "age": 7})),
    ];
    mock.add_attachment("uuid:a", "a.jpg", b"jpeg-bytes".to_vec());
    mock.set_pages(vec![rows.clone()]);
    let dir = tempfile::tempdir().unwrap();

    runner(&mock, config())
        .run(&download(CsvConfig::new(true, false, true), dir.path()))
        .await
        .unwrap();

    let result = runner(&mock, config())
        .run(&upload(dir.path(), "1"))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.rows_processed, 2);
    assert_eq!(result.attachments_fetched, 1);
    let posted = &mock.posted()[0].rows;
    assert_eq!(posted[0].row_id, "uuid:a");
    assert_eq!(posted[0].values, rows[0].values);
    assert_eq!(posted[1].values, rows[1].values);

    let uploads = mock.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].row_id, "uuid:a");
    assert_eq!(uploads[0].file_name, "a.jpg");
    assert_eq!(uploads[0].content, b"jpeg-bytes");
}

#[tokio::test]
async fn missing_input_is_io_error() {
    let mock = Arc::new(MockSession::new("default", schema()));
    let dir = tempfile::tempdir().unwrap();

    let err = runner(&mock, config())
        .run(&upload(&dir.path().join("nothing.csv"), "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Io(_)));
}

#[tokio::test]
async fn reset_requires_current_version() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.set_data_version("5");

    let err = runner(&mock, config())
        .run(&Task::Reset(ResetParams::new("census", Some("4")).unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::VersionConflict { .. }));
    assert_eq!(mock.calls(MockOp::Reset), 0);

    let outcome = runner(&mock, config())
        .run(&Task::Reset(ResetParams::new("census", Some("5")).unwrap()))
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Completed(SyncResult::default()));
    assert_eq!(mock.resets(), vec!["5".to_string()]);
}

#[tokio::test]
async fn reset_conflict_is_not_retried() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.fail_call(MockOp::Reset, 0, SyncError::ServerError("HTTP 500".into()));

    let err = runner(&mock, config())
        .run(&Task::Reset(ResetParams::new("census", Some("1")).unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ServerError(_)));
    assert_eq!(mock.calls(MockOp::Reset), 1);
}

#[tokio::test]
async fn similar_row_ids_keep_separate_attachments() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    let first = row("uuid:1", json!({"photo": "photo.jpg"}));
    let second = row("uuid_1", json!({"photo": "photo.jpg"}));
    mock.add_attachment(&first.row_id, "photo.jpg", b"AAAA".to_vec());
    mock.add_attachment(&second.row_id, "photo.jpg", b"BBBB".to_vec());
    mock.set_pages(vec![vec![first], vec![second]]);
    let dir = tempfile::tempdir().unwrap();

    let result = runner(&mock, config())
        .run(&download(CsvConfig::new(true, false, false), dir.path()))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.attachments_fetched, 2);
    assert_eq!(result.attachments_skipped, 0);
    assert_eq!(mock.bytes_downloaded(), 8);
    let instances = dir.path().join("default/census/instances");
    assert_eq!(std::fs::read(instances.join("uuid%3A1/photo.jpg")).unwrap(), b"AAAA");
    assert_eq!(std::fs::read(instances.join("uuid_1/photo.jpg")).unwrap(), b"BBBB");

    let content = read_csv(dir.path());
    assert!(content.contains("uuid:1,,,instances/uuid%3A1/photo.jpg"));
    assert!(content.contains("uuid_1,,,instances/uuid_1/photo.jpg"));
}

#[tokio::test]
async fn attachment_cells_cannot_leave_the_row_folder() {
    let mock = Arc::new(MockSession::new("default", schema()));
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("secret.txt"), b"top-secret").unwrap();
    let table_dir = dir.path().join("census");
    std::fs::create_dir_all(&table_dir).unwrap();
    let input = write_upload_csv(
        &table_dir,
        "_id,name,photo\nr1,a,../secret.txt\nr2,b,\nr3,c,instances/r2/x.jpg\n",
    );

    let result = runner(&mock, config())
        .run(&upload(&input, "1"))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(mock.uploads().is_empty());
    let posted = mock.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].rows.len(), 1);
    assert_eq!(posted[0].rows[0].row_id, "r2");
    assert_eq!(result.rows_processed, 1);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(result.errors[0].row_id, "r1");
    assert!(result.errors[0].message.contains("photo"));
    assert_eq!(result.errors[1].row_id, "r3");
}

#[tokio::test]
async fn cancel_upload_after_first_batch() {
    init_tracing();
    let mock = Arc::new(MockSession::new("default", schema()));
    let dir = tempfile::tempdir().unwrap();
    let input = write_upload_csv(dir.path(), "_id,name\nr1,a\nr2,b\nr3,c\nr4,d\n");

    let runner = runner(&mock, config().with_upload_batch(2, 1 << 20));
    let handle = runner.cancel_handle();
    let runner = runner.with_listener(move |progress: &Progress| {
        if progress.pages == 1 {
            handle.cancel();
        }
    });

    let outcome = runner.run(&upload(&input, "1")).await.unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.result().rows_processed, 2);
    let posted = mock.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].rows[1].row_id, "r2");
}

#[tokio::test]
async fn unavailable_manifest_is_a_row_error() {
    let mock = Arc::new(MockSession::new("default", schema()));
    mock.add_attachment("r2", "b.jpg", b"b".to_vec());
    mock.fail_call(MockOp::FetchManifest, 0, SyncError::from_status(404, ""));
    mock.set_pages(vec![vec![
        row("r1", json!({"photo": "a.jpg"})),
        row("r2", json!({"photo": "b.jpg"})),
    ]]);
    let dir = tempfile::tempdir().unwrap();

    let result = runner(&mock, config())
        .run(&download(CsvConfig::new(true, false, false), dir.path()))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.rows_processed, 2);
    assert_eq!(result.attachments_fetched, 1);
    assert_eq!(result.attachments_failed, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].row_id, "r1");
    assert!(result.errors[0].message.contains("attachment manifest"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn csv_rows_match_server_pages(sizes in proptest::collection::vec(0usize..30, 1..5)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mock = Arc::new(MockSession::new("default", schema()));
        let mut start = 0;
        let pages: Vec<Vec<RowResource>> = sizes
            .iter()
            .map(|&n| {
                let page = people(start..start + n);
                start += n;
                page
            })
            .collect();
        let total: usize = sizes.iter().sum();
        mock.set_pages(pages);
        let dir = tempfile::tempdir().unwrap();

        let outcome = runtime
            .block_on(runner(&mock, config()).run(&download(CsvConfig::default(), dir.path())))
            .unwrap();

        prop_assert_eq!(outcome.result().rows_processed, total as u64);
        let content = read_csv(dir.path());
        let lines: Vec<&str> = content.lines().collect();
        prop_assert_eq!(lines.len(), total + 1);
        prop_assert_eq!(lines[0], "_id,name,age,photo");
        for (i, line) in lines[1..].iter().enumerate() {
            let expected = format!("uuid:{i},person {i},{i},");
            prop_assert_eq!(*line, expected.as_str());
        }
    }
}
