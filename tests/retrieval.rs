mod common;

use std::collections::HashSet;
use std::path::Path;

use common::{Harness, MODEL};
use folder_index::cancel::CancelToken;
use folder_index::error::ErrorKind;
use folder_index::models::FolderProgress;
use folder_index::search::{ChunkQuery, DocumentQuery, FolderScope, QueryEngine};
use folder_index::store::FolderStorage;

struct Indexed {
    h: Harness,
    folder: std::path::PathBuf,
    storage: FolderStorage,
    engine: QueryEngine,
}

impl Indexed {
    fn scope(&self) -> FolderScope<'_> {
        FolderScope {
            folder: &self.folder,
            store: &self.storage.vectors,
            model_id: MODEL,
            dims: 64,
        }
    }
}

async fn index(h: Harness, folder: &Path) -> Indexed {
    let pool = h.pool();
    let storage = h.storage("folder").await;
    h.orchestrator(pool.clone())
        .run(folder, &storage, MODEL, &CancelToken::new(), &|_: &FolderProgress| {})
        .await
        .unwrap();
    Indexed {
        engine: h.engine(pool),
        folder: folder.to_path_buf(),
        storage,
        h,
    }
}

fn terms(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn query_without_concepts_or_terms_is_rejected() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let ix = index(h, &folder).await;

    let err = ix
        .engine
        .search_chunks(
            &ix.scope(),
            &ChunkQuery {
                concepts: terms(&["  "]),
                terms: vec![],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = ix
        .engine
        .find_documents(&ix.scope(), &DocumentQuery::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn exact_only_query_does_not_embed() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let ix = index(h, &folder).await;
    let calls = ix.h.factory.embed_calls();

    let page = ix
        .engine
        .search_chunks(
            &ix.scope(),
            &ChunkQuery {
                terms: terms(&["PyTorch"]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(ix.h.factory.embed_calls(), calls);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].path, "beta.md");
    assert_eq!(page.items[0].matched_terms, terms(&["PyTorch"]));
    assert!(page.items[0].semantic_score.is_none());
}

#[tokio::test]
async fn exact_terms_are_case_sensitive() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let ix = index(h, &folder).await;

    let page = ix
        .engine
        .search_chunks(
            &ix.scope(),
            &ChunkQuery {
                terms: terms(&["pytorch"]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total, 0);
    assert!(page.continuation.is_none());
}

#[tokio::test]
async fn literal_match_outranks_pure_semantic_match() {
    let h = Harness::new();
    let folder = h.folder("app");
    h.write(
        &folder,
        "src/Counter.tsx",
        "export function Counter() {\n  const [count, setCount] = useState(0);\n  return <button onClick={() => setCount(count + 1)}>{count}</button>;\n}",
    );
    h.write(
        &folder,
        "docs/state.md",
        "Thoughts on state management in large front end applications, covering stores, reducers, context providers and selectors.",
    );
    h.write(
        &folder,
        "docs/ops.md",
        "Runbook for rotating database credentials and restarting the ingestion service.",
    );
    let ix = index(h, &folder).await;

    let page = ix
        .engine
        .search_chunks(
            &ix.scope(),
            &ChunkQuery {
                concepts: terms(&["state management"]),
                terms: terms(&["useState"]),
                limit: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.items[0].path, "src/Counter.tsx");
    assert_eq!(page.items[0].matched_terms, terms(&["useState"]));
    assert!(page.items[0].score > page.items[1].score);
    let semantic_only = page.items.iter().find(|hit| hit.path == "docs/state.md").unwrap();
    assert!(semantic_only.matched_terms.is_empty());
    assert!(semantic_only.score > 0.0);
}

#[tokio::test]
async fn pages_cover_every_hit_once() {
    let h = Harness::new();
    let folder = h.folder("book");
    let chapter: String = (0..40)
        .map(|i| format!("Paragraph {} talks about indexing folders and ranking chunks.\n\n", i))
        .collect();
    h.write(&folder, "chapter1.md", &chapter);
    h.write(&folder, "chapter2.md", &chapter.replace("ranking", "sorting"));
    let ix = index(h, &folder).await;

    let query = |continuation: Option<String>, limit: usize| ChunkQuery {
        concepts: terms(&["ranking chunks"]),
        terms: vec![],
        limit: Some(limit),
        continuation,
    };

    let everything = ix.engine.search_chunks(&ix.scope(), &query(None, 100)).await.unwrap();
    assert!(everything.total > 7, "expected many chunks, got {}", everything.total);
    assert!(everything.continuation.is_none());

    let mut paged = Vec::new();
    let mut token = None;
    loop {
        let page = ix.engine.search_chunks(&ix.scope(), &query(token, 3)).await.unwrap();
        assert!(page.items.len() <= 3);
        assert_eq!(page.total, everything.total);
        paged.extend(page.items.into_iter().map(|hit| hit.chunk_id));
        match page.continuation {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    let expected: Vec<String> = everything.items.into_iter().map(|hit| hit.chunk_id).collect();
    assert_eq!(paged, expected);
    assert_eq!(paged.iter().collect::<HashSet<_>>().len(), paged.len());
}

#[tokio::test]
async fn token_from_another_query_is_rejected() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let ix = index(h, &folder).await;

    let first = ix
        .engine
        .search_chunks(
            &ix.scope(),
            &ChunkQuery {
                concepts: terms(&["document"]),
                limit: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let token = first.continuation.unwrap();

    let err = ix
        .engine
        .search_chunks(
            &ix.scope(),
            &ChunkQuery {
                concepts: terms(&["something else"]),
                limit: Some(1),
                continuation: Some(token.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = ix
        .engine
        .find_documents(
            &ix.scope(),
            &DocumentQuery {
                query: "document".into(),
                limit: Some(1),
                continuation: Some(token),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn similar_documents_rank_first() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let ix = index(h, &folder).await;

    let page = ix
        .engine
        .find_documents(
            &ix.scope(),
            &DocumentQuery {
                query: "Kubernetes clusters and Docker images for deployment".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.total, 3);
    assert_eq!(page.items[0].path, "notes/gamma.txt");
    assert!(page.items.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(page.items.iter().all(|hit| (0.0..=1.0).contains(&hit.score)));
}

#[tokio::test]
async fn zero_limit_is_rejected() {
    let h = Harness::new();
    let folder = h.sample_folder("docs");
    let ix = index(h, &folder).await;

    let err = ix
        .engine
        .find_documents(
            &ix.scope(),
            &DocumentQuery {
                query: "rust".into(),
                limit: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
