//! End-to-end consolidation scenarios
//!
//! Drives the full pipeline — batch run, clustering, promotion, commit,
//! rollback, checkpoint resume — over in-memory collaborators with
//! deterministic mocks, and checks the invariants the engine promises:
//! promoted concepts absorb every member keyword, near-root categories
//! never win a match, commits apply parent-before-child, rollback restores
//! the exact pre-commit inventory, and identical runs replay identically.

use ontomerge::candidate::cluster::{ClusterEngine, ClusterParams};
use ontomerge::{
    BatchRunner, CandidateRepository, CheckpointManager, ConceptMatcher, ConceptRecord,
    ConsolidationConfig, Coordinator, Embedder, EmbeddingStore, GraphStore, MemoryGraphStore,
    MockOracle, OntologyGraphManager, StagedConcept, StagingChangeSet, StubEmbedder,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn record(id: &str, parent: Option<&str>) -> ConceptRecord {
    ConceptRecord {
        id: id.to_string(),
        label: id.to_string(),
        parent_id: parent.map(|p| p.to_string()),
        description: format!("about {}", id),
    }
}

fn seed_records() -> Vec<ConceptRecord> {
    vec![
        record("Root", None),
        record("Applications", Some("Root")),
        record("Models", Some("Root")),
        record("Transformer", Some("Models")),
    ]
}

fn seeded_manager() -> OntologyGraphManager {
    OntologyGraphManager::from_records(seed_records(), "Root")
}

fn item_line(concept: &str) -> String {
    format!(
        r#"{{"concept":"{}","section_id":"s1","section_title":"Background","chunk_text":"Context for {}."}}"#,
        concept, concept
    )
}

fn write_batch(dir: &Path, concepts: &[&str]) -> PathBuf {
    let path = dir.join("batch.jsonl");
    let lines: Vec<String> = concepts.iter().map(|c| item_line(c)).collect();
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn build_runner(dir: &Path, oracle: MockOracle, config: ConsolidationConfig) -> BatchRunner {
    let matcher = ConceptMatcher::new(
        Arc::new(EmbeddingStore::open(dir.join("vectors.db")).unwrap()),
        Arc::new(CandidateRepository::open(dir.join("candidates.db")).unwrap()),
        ClusterEngine::new(ClusterParams {
            epsilon: config.cluster_epsilon,
            min_neighbors: config.cluster_min_neighbors,
            resplit_epsilon: config.resplit_epsilon,
            max_cluster_size: config.max_cluster_size,
        }),
        Arc::new(StubEmbedder::new(8)),
        Arc::new(oracle),
        config,
    );
    BatchRunner::new(
        matcher,
        CheckpointManager::new(dir.join("checkpoints")),
        dir.join("out"),
    )
}

const RAG_KEYWORDS: [&str; 6] = [
    "RAG",
    "retrieval augmented generation",
    "rag pipeline",
    "retrieval-augmented LLM",
    "RAG system",
    "grounded generation",
];

fn rag_oracle() -> MockOracle {
    let mut oracle = MockOracle::new().with_default_parent("Applications");
    for keyword in RAG_KEYWORDS {
        oracle = oracle.with_noun_phrases(keyword, &["retrieval augmented generation"]);
    }
    oracle
}

#[tokio::test]
async fn promoted_concept_absorbs_every_member_keyword() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_batch(dir.path(), &RAG_KEYWORDS);
    let runner = build_runner(dir.path(), rag_oracle(), ConsolidationConfig::default());
    let mut manager = seeded_manager();

    let report = runner.run(&mut manager, &input, false).await.unwrap();
    assert_eq!(report.processed, 6);
    assert_eq!(report.promoted, vec!["retrieval_augmented_generation"]);

    let staged: Vec<StagedConcept> =
        serde_json::from_str(&std::fs::read_to_string(&report.staging_path).unwrap()).unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].parent_id, "Applications");
    for keyword in RAG_KEYWORDS {
        assert!(
            staged[0].original_keywords.contains(&keyword.to_string()),
            "promoted concept must absorb keyword '{}'",
            keyword
        );
    }
}

#[tokio::test]
async fn near_root_categories_never_win_a_match() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_batch(dir.path(), &["applications"]);

    // The Oracle would happily match the near-root category, and the vector
    // store holds an exact-distance row for it. Exclusion must still win.
    let embedder = StubEmbedder::new(8);
    let query = embedder.embed("applications").unwrap();
    let store = EmbeddingStore::open(dir.path().join("vectors.db")).unwrap();
    store
        .upsert("Applications", "top-level category", query, false)
        .unwrap();
    drop(store);

    let oracle = MockOracle::new().with_match("applications", "Applications", "obvious match");
    let runner = build_runner(dir.path(), oracle, ConsolidationConfig::default());
    let mut manager = seeded_manager();
    let report = runner.run(&mut manager, &input, false).await.unwrap();

    assert_eq!(report.matched_total, 0);
    let output = std::fs::read_to_string(&report.output_path).unwrap();
    assert!(output.contains(r#""matched_concepts":[]"#));
}

#[tokio::test]
async fn commit_orders_parents_first_and_rollback_restores_inventory() {
    let dir = tempfile::tempdir().unwrap();
    let graph = Arc::new(MemoryGraphStore::seeded(seed_records()));
    let coordinator = Coordinator::new(
        Arc::new(EmbeddingStore::open(dir.path().join("vectors.db")).unwrap()),
        Arc::new(CandidateRepository::open(dir.path().join("candidates.db")).unwrap()),
        graph.clone(),
        dir.path().join("backups"),
    );
    let before = graph.all_concepts().unwrap();

    // Child listed first; its runner-up parent becomes a related edge.
    let staged = vec![
        StagedConcept {
            concept_id: "VectorIndex".into(),
            label: "VectorIndex".into(),
            description: "index structures for vectors".into(),
            parent_id: "Retrieval".into(),
            original_keywords: vec!["vector index".into()],
            parent_candidates: vec!["Retrieval".into(), "Models".into()],
            parent_reason: String::new(),
        },
        StagedConcept {
            concept_id: "Retrieval".into(),
            label: "Retrieval".into(),
            description: "finding relevant documents".into(),
            parent_id: "Applications".into(),
            original_keywords: vec!["retrieval".into()],
            parent_candidates: vec!["Applications".into()],
            parent_reason: String::new(),
        },
    ];
    let change_set = StagingChangeSet::from_staged(&staged);
    let report = coordinator
        .commit(&change_set, &StubEmbedder::new(8), None)
        .await
        .unwrap();

    assert_eq!(report.applied, vec!["Retrieval", "VectorIndex"]);
    assert!(report.skipped.is_empty());
    assert_eq!(report.relations_added, 1);
    assert!(graph.exists("VectorIndex").unwrap());

    coordinator.rollback(None).unwrap();
    assert_eq!(graph.all_concepts().unwrap(), before);
    assert_eq!(graph.relation_count(), 0);
}

#[tokio::test]
async fn resume_continues_from_the_checkpointed_index() {
    let dir = tempfile::tempdir().unwrap();
    let concepts: Vec<String> = (0..20).map(|i| format!("concept number {}", i)).collect();
    let refs: Vec<&str> = concepts.iter().map(|s| s.as_str()).collect();
    let input = write_batch(dir.path(), &refs);

    let embeddings = Arc::new(EmbeddingStore::open(dir.path().join("vectors.db")).unwrap());
    let candidates = Arc::new(CandidateRepository::open(dir.path().join("candidates.db")).unwrap());
    let config = ConsolidationConfig::default();
    let checkpoints = CheckpointManager::new(dir.path().join("checkpoints"));

    // Process the first 8 items by hand, then checkpoint at index 7 as an
    // interrupted run would have.
    let matcher = ConceptMatcher::new(
        embeddings.clone(),
        candidates.clone(),
        ClusterEngine::new(ClusterParams::default()),
        Arc::new(StubEmbedder::new(8)),
        Arc::new(MockOracle::new()),
        config.clone(),
    );
    let mut manager = seeded_manager();
    let mut results = Vec::new();
    for concept in refs.iter().take(8) {
        let item: ontomerge::BatchItem = serde_json::from_str(&item_line(concept)).unwrap();
        let outcome = matcher.process_item(&mut manager, &item).await.unwrap();
        results.push(ontomerge::pipeline::OutputRecord {
            item,
            matched_concepts: outcome.matched_ids,
        });
    }
    checkpoints
        .save(
            &ontomerge::CheckpointState {
                processed_index: 7,
                batch_source: input.to_string_lossy().into_owned(),
                staged: manager.staged_concepts().to_vec(),
                accumulated_results: results,
                config: config.clone(),
                created_at: chrono::Utc::now(),
            },
            &embeddings,
            &candidates,
        )
        .unwrap();

    // A fresh runner sharing the same stores resumes at item 8.
    let resumed_matcher = ConceptMatcher::new(
        embeddings,
        candidates.clone(),
        ClusterEngine::new(ClusterParams::default()),
        Arc::new(StubEmbedder::new(8)),
        Arc::new(MockOracle::new()),
        config,
    );
    let runner = BatchRunner::new(
        resumed_matcher,
        CheckpointManager::new(dir.path().join("checkpoints")),
        dir.path().join("out"),
    );
    let mut resumed_manager = seeded_manager();
    let report = runner.run(&mut resumed_manager, &input, true).await.unwrap();

    assert_eq!(report.processed, 12);
    // Every item was processed exactly once across the two runs.
    assert_eq!(candidates.count().unwrap(), 20);
    // The final artifact covers the whole batch, not just the resumed tail.
    let written = std::fs::read_to_string(&report.output_path).unwrap();
    assert_eq!(written.lines().count(), 20);
}

#[tokio::test]
async fn identical_runs_replay_identically() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut batch: Vec<&str> = RAG_KEYWORDS.to_vec();
    batch.push("quantum error correction");
    batch.push("symbolic planning");

    let mut outputs = Vec::new();
    for dir in [&dir_a, &dir_b] {
        let input = write_batch(dir.path(), &batch);
        let runner = build_runner(dir.path(), rag_oracle(), ConsolidationConfig::default());
        let mut manager = seeded_manager();
        let report = runner.run(&mut manager, &input, false).await.unwrap();
        outputs.push((
            std::fs::read_to_string(&report.output_path).unwrap(),
            std::fs::read_to_string(&report.staging_path).unwrap(),
            report.promoted.clone(),
        ));
    }

    assert_eq!(outputs[0].0, outputs[1].0, "annotated outputs must agree");
    assert_eq!(outputs[0].1, outputs[1].1, "staging artifacts must agree");
    assert_eq!(outputs[0].2, outputs[1].2, "promotions must agree");
}

#[tokio::test]
async fn full_lifecycle_run_commit_then_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_batch(dir.path(), &RAG_KEYWORDS);
    let embeddings = Arc::new(EmbeddingStore::open(dir.path().join("vectors.db")).unwrap());
    let candidates = Arc::new(CandidateRepository::open(dir.path().join("candidates.db")).unwrap());
    let graph = Arc::new(MemoryGraphStore::seeded(seed_records()));
    let config = ConsolidationConfig::default();

    let matcher = ConceptMatcher::new(
        embeddings.clone(),
        candidates.clone(),
        ClusterEngine::new(ClusterParams::default()),
        Arc::new(StubEmbedder::new(8)),
        Arc::new(rag_oracle()),
        config,
    );
    let runner = BatchRunner::new(
        matcher,
        CheckpointManager::new(dir.path().join("checkpoints")),
        dir.path().join("out"),
    );
    let mut manager = OntologyGraphManager::load(graph.as_ref(), "Root").unwrap();
    let report = runner.run(&mut manager, &input, false).await.unwrap();
    assert_eq!(report.promoted.len(), 1);

    // Commit the run's staging artifact, as the CLI would after review.
    let staged: Vec<StagedConcept> =
        serde_json::from_str(&std::fs::read_to_string(&report.staging_path).unwrap()).unwrap();
    let coordinator = Coordinator::new(
        embeddings.clone(),
        candidates,
        graph.clone(),
        dir.path().join("backups"),
    );
    let commit = coordinator
        .commit(
            &StagingChangeSet::from_staged(&staged),
            &StubEmbedder::new(8),
            None,
        )
        .await
        .unwrap();
    assert_eq!(commit.applied, vec!["retrieval_augmented_generation"]);

    // The committed concept is durable and visible to a fresh manager.
    assert!(graph.exists("retrieval_augmented_generation").unwrap());
    let reloaded = OntologyGraphManager::load(graph.as_ref(), "Root").unwrap();
    assert!(reloaded.contains(
        "retrieval_augmented_generation",
        ontomerge::View::Committed
    ));
    assert_eq!(embeddings.count(false).unwrap(), 1);

    coordinator.rollback(None).unwrap();
    assert!(!graph.exists("retrieval_augmented_generation").unwrap());
    assert_eq!(embeddings.count(false).unwrap(), 0);
}
