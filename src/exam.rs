use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::config::ExamConfig;
use crate::corpus::{Question, QuestionSource};
use crate::db::Database;
use crate::error::{Result, TrainerError};
use crate::models::ReviewRecord;

pub const DEFAULT_BOOK_TEST_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamKind {
    Full,
    /// The corpus was smaller than the exam; every question is returned.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct MockExam {
    pub kind: ExamKind,
    pub total_questions: usize,
    pub from_errors: usize,
    pub from_weak_modules: usize,
    pub from_fill: usize,
    pub questions: Vec<Question>,
}

/// Builds a mock exam from three pools: the user's most-missed questions,
/// questions from weak modules, and a random fill. No question appears twice.
///
/// A pool that runs short contributes fewer than its quota. The error and
/// weak pools do not cover for each other; only the fill pool grows.
#[derive(Debug, Clone, Default)]
pub struct ExamAssembler {
    config: ExamConfig,
}

impl ExamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_config(config: ExamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExamConfig {
        &self.config
    }

    /// How many error records to fetch for the error pool.
    pub fn error_fetch_limit(&self) -> usize {
        self.config.error_quota() * 2
    }

    pub fn assemble<R: Rng + ?Sized>(
        &self,
        corpus: &[Question],
        errors: &[ReviewRecord],
        weak_modules: &[(i64, i64)],
        rng: &mut R,
    ) -> MockExam {
        let corpus = dedup_by_id(corpus);
        let size = self.config.size;

        if corpus.len() < size {
            warn!(
                "Corpus has {} questions, fewer than the exam size {}; returning all of them",
                corpus.len(),
                size
            );
            let mut questions: Vec<Question> = corpus.into_iter().cloned().collect();
            questions.shuffle(rng);
            return MockExam {
                kind: ExamKind::Degraded,
                total_questions: questions.len(),
                from_errors: 0,
                from_weak_modules: 0,
                from_fill: questions.len(),
                questions,
            };
        }

        let mut consumed: HashSet<&str> = HashSet::new();
        let mut selected: Vec<&Question> = Vec::with_capacity(size);

        // Pool A: previously missed questions still in the corpus
        let by_id: HashMap<&str, &Question> =
            corpus.iter().map(|q| (q.question_id.as_str(), *q)).collect();
        let error_pool: Vec<&Question> = errors
            .iter()
            .filter_map(|e| by_id.get(e.question_id.as_str()).copied())
            .collect();
        let from_errors = take_sample(&error_pool, self.config.error_quota(), &mut consumed, &mut selected, rng);

        // Pool B: questions from weak modules
        let weak: HashSet<(i64, i64)> = weak_modules.iter().copied().collect();
        let weak_pool: Vec<&Question> = corpus
            .iter()
            .copied()
            .filter(|q| weak.contains(&(q.book_id, q.module_id)))
            .filter(|q| !consumed.contains(q.question_id.as_str()))
            .collect();
        let from_weak_modules = take_sample(&weak_pool, self.config.weak_quota(), &mut consumed, &mut selected, rng);

        // Pool C: everything else fills the remainder
        let fill_pool: Vec<&Question> = corpus
            .iter()
            .copied()
            .filter(|q| !consumed.contains(q.question_id.as_str()))
            .collect();
        let remaining = size.saturating_sub(selected.len());
        let from_fill = take_sample(&fill_pool, remaining, &mut consumed, &mut selected, rng);

        let mut questions: Vec<Question> = selected.into_iter().cloned().collect();
        questions.shuffle(rng);

        debug!(
            "Assembled mock exam: {} from errors, {} from weak modules, {} fill",
            from_errors, from_weak_modules, from_fill
        );

        MockExam {
            kind: ExamKind::Full,
            total_questions: questions.len(),
            from_errors,
            from_weak_modules,
            from_fill,
            questions,
        }
    }
}

/// Samples up to `quota` questions from `pool` without replacement, skipping
/// anything already consumed. Returns how many were taken.
fn take_sample<'q, R: Rng + ?Sized>(
    pool: &[&'q Question],
    quota: usize,
    consumed: &mut HashSet<&'q str>,
    selected: &mut Vec<&'q Question>,
    rng: &mut R,
) -> usize {
    let mut taken = 0;
    for &q in pool.choose_multiple(rng, quota.min(pool.len())) {
        if consumed.insert(q.question_id.as_str()) {
            selected.push(q);
            taken += 1;
        }
    }
    taken
}

fn dedup_by_id(corpus: &[Question]) -> Vec<&Question> {
    let mut seen = HashSet::new();
    corpus
        .iter()
        .filter(|q| seen.insert(q.question_id.as_str()))
        .collect()
}

/// Assembles a mock exam for `user_id` from stored history.
pub fn mock_exam<R: Rng + ?Sized>(
    db: &Database,
    corpus: &dyn QuestionSource,
    assembler: &ExamAssembler,
    user_id: i64,
    rng: &mut R,
) -> Result<MockExam> {
    let errors = db.list_reviews_by_errors(user_id, None, Some(assembler.error_fetch_limit()))?;
    let weak_modules: Vec<(i64, i64)> = db
        .list_progress_below(user_id, assembler.config().weak_cutoff)?
        .into_iter()
        .map(|p| (p.book_id, p.module_id))
        .collect();

    Ok(assembler.assemble(&corpus.all_questions(), &errors, &weak_modules, rng))
}

/// One module's questions, optionally shuffled, then cut to `limit`.
/// A zero limit means no limit.
pub fn module_test<R: Rng + ?Sized>(
    corpus: &dyn QuestionSource,
    book_id: i64,
    module_id: i64,
    shuffle: bool,
    limit: Option<usize>,
    rng: &mut R,
) -> Result<Vec<Question>> {
    let mut questions = corpus.module_questions(book_id, module_id)?;
    if questions.is_empty() {
        return Err(TrainerError::not_found(format!(
            "questions for book {} module {}",
            book_id, module_id
        )));
    }

    if shuffle {
        questions.shuffle(rng);
    }
    if let Some(limit) = limit.filter(|&l| l > 0) {
        questions.truncate(limit);
    }
    Ok(questions)
}

/// A random sample of `count` questions across a book's modules.
pub fn book_test<R: Rng + ?Sized>(
    corpus: &dyn QuestionSource,
    book_id: i64,
    count: usize,
    rng: &mut R,
) -> Result<Vec<Question>> {
    let questions = corpus.book_questions(book_id)?;
    if questions.is_empty() {
        return Err(TrainerError::not_found(format!("questions for book {}", book_id)));
    }

    Ok(questions
        .choose_multiple(rng, count.min(questions.len()))
        .cloned()
        .collect())
}
