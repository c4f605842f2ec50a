mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use common::{is_settled, remote_weights, Harness, MISSING_MODEL, MISSING_URL, MODEL, REMOTE_MODEL, SMALL_MODEL};
use folder_index::error::ErrorKind;
use folder_index::manager::{FolderManager, ModelChangeOutcome};
use folder_index::models::FolderSnapshot;
use folder_index::search::{ChunkQuery, DocumentQuery};

const WAIT: Duration = Duration::from_secs(30);

async fn settle(manager: &FolderManager, folder: &Path) -> FolderSnapshot {
    tokio::time::timeout(WAIT, manager.wait_for(folder, |s| is_settled(&s.state)))
        .await
        .expect("folder did not settle in time")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn added_folder_becomes_active_and_searchable() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let manager = h.manager().await;

    let added = manager.add_folder(&folder, None).await.unwrap();
    assert_eq!(added.model_id, MODEL);

    let done = settle(&manager, &folder).await;
    assert_eq!(done.state, "active");
    assert_eq!(done.progress.files_indexed, 3);
    assert!(done.error.is_none());

    let page = manager
        .search_chunks(
            &folder,
            &ChunkQuery {
                terms: vec!["Kubernetes".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.items[0].path, "notes/gamma.txt");

    let docs = manager
        .find_documents(
            &folder,
            &DocumentQuery {
                query: "Rust cargo crates".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(docs.items[0].path, "alpha.md");

    let doc = manager.get_document(&folder, "beta.md").await.unwrap();
    assert!(doc.text.contains("PyTorch"));

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_download_is_reported_before_indexing() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let manager = h.manager().await;
    let mut events = manager.subscribe();

    manager.add_folder(&folder, Some(REMOTE_MODEL)).await.unwrap();

    let mut states: Vec<String> = Vec::new();
    let mut percents: Vec<f32> = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = events.recv().await.unwrap();
            if snapshot.state == "downloading_model" {
                percents.extend(snapshot.download_percent);
            }
            if states.last() != Some(&snapshot.state) && snapshot.state != "pending" {
                states.push(snapshot.state.clone());
            }
            if is_settled(&snapshot.state) {
                break;
            }
        }
    })
    .await
    .expect("folder did not settle in time");

    assert_eq!(
        states,
        vec!["scanning", "downloading_model", "indexing", "active"]
    );
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert_eq!(percents.last().copied(), Some(100.0));
    assert!(manager.registry().is_ready(REMOTE_MODEL).await);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_folders_are_rejected() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let manager = h.manager().await;
    manager.add_folder(&folder, None).await.unwrap();

    let nested = folder.join("notes");
    let err = manager.add_folder(&nested, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = manager.add_folder(&h.root, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = manager.add_folder(&folder, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = manager
        .add_folder(&h.root.join("does-not-exist"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let other = h.folder("other");
    let err = manager.add_folder(&other, Some("no-such-model")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(manager.get_snapshot().await.len(), 1);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_folder_deletes_its_storage() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let manager = h.manager().await;
    manager.add_folder(&folder, None).await.unwrap();
    settle(&manager, &folder).await;

    let report = manager.remove_folder(&folder).await.unwrap();
    assert_eq!(report.removed_rows.documents, 3);
    assert!(report.removed_rows.chunks > 0);
    assert!(!report.storage_dir.exists());
    assert!(manager.get_snapshot().await.is_empty());

    let err = manager
        .search_chunks(
            &folder,
            &ChunkQuery {
                terms: vec!["alpha".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // The folder itself is untouched and can be added again from scratch.
    assert!(folder.join("alpha.md").exists());
    manager.add_folder(&folder, None).await.unwrap();
    assert_eq!(settle(&manager, &folder).await.state, "active");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_model_change_keeps_the_index() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let manager = h.manager().await;
    manager.add_folder(&folder, None).await.unwrap();
    settle(&manager, &folder).await;
    let calls = h.factory.embed_calls();

    let mut seen = None;
    let outcome = manager
        .change_model(&folder, SMALL_MODEL, |impact| {
            seen = Some(impact.clone());
            false
        })
        .await
        .unwrap();

    assert!(matches!(outcome, ModelChangeOutcome::Declined));
    let impact = seen.unwrap();
    assert_eq!(impact.from_model, MODEL);
    assert_eq!(impact.to_dims, 32);
    assert_eq!(impact.documents, 3);

    let snapshot = manager.folder(&folder).await.unwrap();
    assert_eq!(snapshot.model_id, MODEL);
    assert_eq!(snapshot.state, "active");
    assert_eq!(h.factory.embed_calls(), calls);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_model_change_rebuilds_the_index() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let manager = h.manager().await;
    manager.add_folder(&folder, None).await.unwrap();
    settle(&manager, &folder).await;

    let outcome = manager
        .change_model(&folder, SMALL_MODEL, |_| true)
        .await
        .unwrap();
    assert!(matches!(outcome, ModelChangeOutcome::Applied(_)));

    let done = tokio::time::timeout(
        WAIT,
        manager.wait_for(&folder, |s| s.model_id == SMALL_MODEL && is_settled(&s.state)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.state, "active");
    assert_eq!(done.progress.files_indexed, 3);

    let page = manager
        .search_chunks(
            &folder,
            &ChunkQuery {
                concepts: vec!["machine learning".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.items[0].path, "beta.md");

    let same = manager.change_model(&folder, SMALL_MODEL, |_| true).await.unwrap();
    assert!(matches!(same, ModelChangeOutcome::Unchanged));

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_download_is_isolated_and_retryable() {
    let h = Harness::new();
    let healthy = h.sample_folder("healthy");
    let broken = h.sample_folder("broken");
    let manager = h.manager().await;

    manager.add_folder(&healthy, None).await.unwrap();
    manager.add_folder(&broken, Some(MISSING_MODEL)).await.unwrap();

    let failed = settle(&manager, &broken).await;
    assert_eq!(failed.state, "error");
    let error = failed.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ModelAcquisition);
    assert!(error.retryable);

    assert_eq!(settle(&manager, &healthy).await.state, "active");

    h.fetcher.insert(MISSING_URL, remote_weights());
    manager.retry_folder(&broken).await.unwrap();
    let recovered = tokio::time::timeout(
        WAIT,
        manager.wait_for(&broken, |s| s.state == "active"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(recovered.progress.files_indexed, 3);

    let err = manager.retry_folder(&healthy).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_resumes_without_reembedding() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");

    let manager = h.manager().await;
    manager.add_folder(&folder, None).await.unwrap();
    settle(&manager, &folder).await;
    manager.shutdown().await;
    drop(manager);
    let texts = h.factory.texts_embedded();

    h.write(&folder, "delta.md", "A fourth document added while nothing was running.");

    let manager = h.manager().await;
    assert_eq!(manager.start().await.unwrap(), 1);
    let done = settle(&manager, &folder).await;
    assert_eq!(done.state, "active");
    assert_eq!(done.progress.files_indexed, 4);

    let reembedded = h.factory.texts_embedded() - texts;
    assert_eq!(reembedded, 1, "only the new document's chunk is embedded");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_folder_operations_are_rejected() {
    let h = Harness::new();
    let folder = h.folder("never-added");
    let manager = h.manager().await;

    for err in [
        manager.remove_folder(&folder).await.unwrap_err(),
        manager.retry_folder(&folder).await.unwrap_err(),
        manager.folder(&folder).await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    manager.shutdown().await;
}

async fn until(what: &str, cond: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_a_busy_folder_leaves_others_running() {
    let h = Harness::new();
    let busy = h.sample_folder("busy");
    h.write(&busy, "stall.md", "This page mentions quagmire and takes forever to embed.");
    let calm = h.sample_folder("calm");
    h.factory.faults.hold_batches_with("quagmire");
    let manager = h.manager().await;

    manager.add_folder(&busy, None).await.unwrap();
    until("a held batch", || h.factory.faults.held.load(Ordering::SeqCst) >= 1).await;
    manager.add_folder(&calm, None).await.unwrap();
    assert_eq!(settle(&manager, &calm).await.state, "active");
    assert_eq!(manager.folder(&busy).await.unwrap().state, "indexing");

    let report = tokio::time::timeout(WAIT, manager.remove_folder(&busy))
        .await
        .expect("removal waited on the held batch")
        .unwrap();
    assert!(!report.storage_dir.exists());
    assert_eq!(manager.get_snapshot().await.len(), 1);

    h.write(&calm, "delta.md", "A fourth document for the folder that kept running.");
    manager.reindex(&calm).await.unwrap();
    let done = tokio::time::timeout(
        WAIT,
        manager.wait_for(&calm, |s| s.state == "active" && s.progress.files_indexed == 4),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(done.error.is_none());

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn triggers_during_a_run_coalesce_into_one_more_pass() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    h.write(&folder, "stall.md", "This page mentions quagmire and takes forever to embed.");
    h.factory.faults.hold_batches_with("quagmire");
    let manager = h.manager().await;
    let mut events = manager.subscribe();

    manager.add_folder(&folder, None).await.unwrap();
    until("a held batch", || h.factory.faults.held.load(Ordering::SeqCst) >= 1).await;
    for _ in 0..3 {
        manager.reindex(&folder).await.unwrap();
    }
    h.factory.faults.release();

    let mut scans = 0;
    let mut completions = 0;
    let mut previous = String::new();
    tokio::time::timeout(WAIT, async {
        while completions < 2 {
            let snapshot = events.recv().await.unwrap();
            if snapshot.state != previous {
                match snapshot.state.as_str() {
                    "scanning" => scans += 1,
                    "active" => completions += 1,
                    _ => {}
                }
                previous = snapshot.state.clone();
            }
        }
    })
    .await
    .expect("folder did not finish two passes");
    assert_eq!(scans, 2);

    let another = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if events.recv().await.unwrap().state == "scanning" {
                break;
            }
        }
    })
    .await;
    assert!(another.is_err(), "a third pass started");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistently_failing_batch_is_retried_then_reported() {
    let mut h = Harness::new();
    h.config.embedding.batch_size = 1;
    let folder = h.sample_folder("docs");
    h.factory.faults.fail_batches_with("Kubernetes");
    let manager = h.manager().await;

    manager.add_folder(&folder, None).await.unwrap();
    let done = settle(&manager, &folder).await;

    assert_eq!(done.state, "active");
    assert!(done.error.is_none());
    assert_eq!(done.progress.files_indexed, 2);
    let failed: Vec<&str> = done.progress.failed.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(failed, vec!["notes/gamma.txt"]);
    assert_eq!(
        h.factory.faults.failures.load(Ordering::SeqCst),
        h.config.embedding.max_retries as usize + 1
    );

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cataloged_folder_is_removed_without_a_running_worker() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");

    let manager = h.manager().await;
    manager.add_folder(&folder, None).await.unwrap();
    settle(&manager, &folder).await;
    manager.shutdown().await;
    drop(manager);

    // Never started: the folder is only in the catalog.
    let manager = h.manager().await;
    let report = manager.remove_folder(&folder).await.unwrap();
    assert_eq!(report.removed_rows.documents, 3);
    assert!(!report.storage_dir.exists());
    assert_eq!(manager.start().await.unwrap(), 0);

    let err = manager.remove_folder(&folder).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn other_folders_answer_while_a_model_change_awaits_confirmation() {
    let h = Harness::new();
    let changing = h.sample_folder("changing");
    let other = h.sample_folder("other");
    let manager = Arc::new(h.manager().await);
    manager.add_folder(&changing, None).await.unwrap();
    manager.add_folder(&other, None).await.unwrap();
    settle(&manager, &changing).await;
    settle(&manager, &other).await;

    let (asked_tx, asked_rx) = mpsc::channel::<()>();
    let (answer_tx, answer_rx) = mpsc::channel::<bool>();
    let change = tokio::spawn({
        let manager = manager.clone();
        let changing = changing.clone();
        async move {
            manager
                .change_model(&changing, SMALL_MODEL, move |_| {
                    asked_tx.send(()).unwrap();
                    answer_rx.recv().unwrap()
                })
                .await
        }
    });
    tokio::task::spawn_blocking(move || asked_rx.recv().unwrap())
        .await
        .unwrap();

    let snapshot = tokio::time::timeout(Duration::from_secs(5), manager.folder(&other))
        .await
        .expect("folder map locked during confirmation")
        .unwrap();
    assert_eq!(snapshot.state, "active");
    let page = tokio::time::timeout(
        Duration::from_secs(5),
        manager.search_chunks(
            &other,
            &ChunkQuery {
                terms: vec!["Kubernetes".into()],
                ..Default::default()
            },
        ),
    )
    .await
    .expect("search blocked during confirmation")
    .unwrap();
    assert_eq!(page.items[0].path, "notes/gamma.txt");

    answer_tx.send(true).unwrap();
    let outcome = change.await.unwrap().unwrap();
    assert!(matches!(outcome, ModelChangeOutcome::Applied(_)));

    manager.shutdown().await;
}
