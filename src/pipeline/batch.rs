//! Batch driver — runs a JSONL input through the matcher with checkpoints
//!
//! Malformed lines are skipped with a warning; infrastructure failures
//! checkpoint and abort; an interrupt checkpoints and returns cleanly.
//! Completed runs leave two artifacts next to the checkpoints: the input
//! records annotated with their matched concepts, and the staged concepts
//! awaiting review and commit.

use super::matcher::ConceptMatcher;
use super::{BatchItem, PipelineResult};
use crate::checkpoint::{CheckpointManager, CheckpointState};
use crate::graph::OntologyGraphManager;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const OUTPUT_FILE: &str = "output_with_concepts.jsonl";
const STAGING_FILE: &str = "staging_concepts.json";

/// An input record annotated with the concepts it mapped to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(flatten)]
    pub item: BatchItem,
    pub matched_concepts: Vec<String>,
}

/// What one batch run did.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub processed: usize,
    pub skipped_malformed: usize,
    pub matched_total: usize,
    pub promoted: Vec<String>,
    pub rematched: usize,
    pub interrupted: bool,
    pub checkpoints_written: usize,
    pub output_path: PathBuf,
    pub staging_path: PathBuf,
}

/// Drives a batch input file through the matching state machine.
pub struct BatchRunner {
    matcher: ConceptMatcher,
    checkpoints: CheckpointManager,
    interrupt: Arc<AtomicBool>,
    output_dir: PathBuf,
}

impl BatchRunner {
    pub fn new(
        matcher: ConceptMatcher,
        checkpoints: CheckpointManager,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            matcher,
            checkpoints,
            interrupt: Arc::new(AtomicBool::new(false)),
            output_dir: output_dir.into(),
        }
    }

    /// Flag checked between items; setting it checkpoints and stops the run.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Process a JSONL batch file. With `resume`, the newest checkpoint for
    /// this input is restored and processing picks up at the item after its
    /// recorded index.
    pub async fn run(
        &self,
        manager: &mut OntologyGraphManager,
        input: &Path,
        resume: bool,
    ) -> PipelineResult<BatchReport> {
        let mut report = BatchReport::default();
        let items = self.read_items(input, &mut report)?;

        let mut start = 0;
        let mut outputs: Vec<OutputRecord> = Vec::new();
        if resume {
            if let Some(checkpoint) = self.checkpoints.load_latest()? {
                if checkpoint.state.batch_source == input.to_string_lossy() {
                    checkpoint
                        .restore_stores(self.matcher.embeddings(), self.matcher.candidates())?;
                    manager.set_staged(checkpoint.state.staged.clone());
                    outputs = checkpoint.state.accumulated_results.clone();
                    start = checkpoint.state.processed_index + 1;
                    info!(
                        checkpoint = %checkpoint.name,
                        resume_at = start,
                        restored_results = outputs.len(),
                        "resuming from checkpoint"
                    );
                } else {
                    warn!(
                        checkpoint = %checkpoint.name,
                        source = %checkpoint.state.batch_source,
                        "newest checkpoint is for a different input; starting fresh"
                    );
                }
            }
        }

        let interval = self.matcher.config().checkpoint_interval;
        // Which output rows each saved phrase came from, for rematch back-fill.
        let mut phrase_rows: HashMap<String, Vec<usize>> = HashMap::new();
        let mut last_processed: Option<usize> = None;

        for (i, item) in items.iter().enumerate().skip(start) {
            match self.matcher.process_item(manager, item).await {
                Ok(outcome) => {
                    report.matched_total += outcome.matched_ids.len();
                    report.promoted.extend(outcome.promoted);
                    let row = outputs.len();
                    for phrase in &outcome.saved_phrases {
                        phrase_rows.entry(phrase.clone()).or_default().push(row);
                    }
                    outputs.push(OutputRecord {
                        item: item.clone(),
                        matched_concepts: outcome.matched_ids,
                    });
                    report.processed += 1;
                    last_processed = Some(i);
                }
                Err(e) => {
                    error!(item = i, error = %e, "fatal error; checkpointing before abort");
                    if let Some(index) = last_processed {
                        self.save_checkpoint(manager, input, index, &outputs)?;
                    }
                    return Err(e);
                }
            }

            if self.interrupt.load(Ordering::SeqCst) {
                info!(item = i, "interrupt requested; checkpointing");
                self.save_checkpoint(manager, input, i, &outputs)?;
                report.checkpoints_written += 1;
                report.interrupted = true;
                break;
            }
            if (i + 1 - start) % interval == 0 {
                self.save_checkpoint(manager, input, i, &outputs)?;
                report.checkpoints_written += 1;
            }
        }

        if !report.interrupted && self.matcher.config().rematch_after_batch {
            let rematch = match self.matcher.rematch_pass(manager).await {
                Ok(rematch) => rematch,
                Err(e) => {
                    error!(error = %e, "fatal error in rematch; checkpointing before abort");
                    if let Some(index) = last_processed {
                        self.save_checkpoint(manager, input, index, &outputs)?;
                    }
                    return Err(e);
                }
            };
            for (text, concept_id) in &rematch.rematched {
                for &row in phrase_rows.get(text).into_iter().flatten() {
                    if !outputs[row].matched_concepts.contains(concept_id) {
                        outputs[row].matched_concepts.push(concept_id.clone());
                    }
                }
            }
            report.rematched = rematch.rematched.len();
        }

        // Items whose keyword fed a cluster before its promotion still map
        // to the promoted concept.
        self.backfill_from_staged(manager, &mut outputs);

        if !report.interrupted {
            if let Some(index) = last_processed {
                self.save_checkpoint(manager, input, index, &outputs)?;
                report.checkpoints_written += 1;
            }
        }

        self.write_artifacts(manager, &outputs, &mut report)?;
        info!(
            processed = report.processed,
            skipped = report.skipped_malformed,
            promoted = report.promoted.len(),
            rematched = report.rematched,
            interrupted = report.interrupted,
            "batch run finished"
        );
        Ok(report)
    }

    fn read_items(&self, input: &Path, report: &mut BatchReport) -> PipelineResult<Vec<BatchItem>> {
        let raw = std::fs::read_to_string(input)?;
        let mut items = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BatchItem>(line) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping malformed input line");
                    report.skipped_malformed += 1;
                }
            }
        }
        Ok(items)
    }

    /// Append each staged concept's id to every output record whose keyword
    /// is among that concept's original keywords.
    fn backfill_from_staged(&self, manager: &OntologyGraphManager, outputs: &mut [OutputRecord]) {
        let max_ids = self.matcher.config().max_matched_ids;
        let mut by_keyword: HashMap<&str, &str> = HashMap::new();
        for staged in manager.staged_concepts() {
            for keyword in &staged.original_keywords {
                by_keyword
                    .entry(keyword.as_str())
                    .or_insert(staged.concept_id.as_str());
            }
        }
        for output in outputs.iter_mut() {
            if let Some(&concept_id) = by_keyword.get(output.item.concept.as_str()) {
                if output.matched_concepts.len() < max_ids
                    && !output.matched_concepts.iter().any(|c| c == concept_id)
                {
                    output.matched_concepts.push(concept_id.to_string());
                }
            }
        }
    }

    fn save_checkpoint(
        &self,
        manager: &OntologyGraphManager,
        input: &Path,
        processed_index: usize,
        outputs: &[OutputRecord],
    ) -> PipelineResult<()> {
        let state = CheckpointState {
            processed_index,
            batch_source: input.to_string_lossy().into_owned(),
            staged: manager.staged_concepts().to_vec(),
            accumulated_results: outputs.to_vec(),
            config: self.matcher.config().clone(),
            created_at: Utc::now(),
        };
        self.checkpoints
            .save(&state, self.matcher.embeddings(), self.matcher.candidates())?;
        Ok(())
    }

    fn write_artifacts(
        &self,
        manager: &OntologyGraphManager,
        outputs: &[OutputRecord],
        report: &mut BatchReport,
    ) -> PipelineResult<()> {
        std::fs::create_dir_all(&self.output_dir)?;

        let output_path = self.output_dir.join(OUTPUT_FILE);
        let mut lines = String::new();
        for record in outputs {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        std::fs::write(&output_path, lines)?;

        let staging_path = self.output_dir.join(STAGING_FILE);
        std::fs::write(
            &staging_path,
            serde_json::to_string_pretty(manager.staged_concepts())?,
        )?;

        report.output_path = output_path;
        report.staging_path = staging_path;
        Ok(())
    }
}
