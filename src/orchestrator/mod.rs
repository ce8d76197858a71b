//! Request lifecycle: retrieve, synthesize, approve, execute, refresh.
//!
//! [`Assistant`] moves through `Uninitialized → Ready → (Processing → Ready)*`.
//! [`Session`] runs requests one at a time on a blocking thread. A Ctrl-C
//! cancels the request in flight: nothing is synthesized, approved or
//! executed after it. A step that is already running is allowed to finish.


use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use console::{Term, style};
use dialoguer::Confirm;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::action::ActionDescriptor;
use crate::config::Config;
use crate::corpus::CorpusBuilder;
use crate::embeddings::create_embedder;
use crate::executor::ActionExecutor;
use crate::index::{BuildReport, IndexStore, PathIndex, SharedIndex, UpdateReport};
use crate::synthesis::ActionSynthesizer;
use crate::{PilotError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantState {
    Uninitialized,
    Ready,
    Processing,
}

impl fmt::Display for AssistantState {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Processing => "processing a request",
        })
    }
}

/// What the approver decided about a synthesized action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Declined,
    /// Show the action without running it.
    DryRun,
}

/// Gate between synthesis and execution.
pub trait Approval: Send {
    fn review(&mut self, descriptor: &ActionDescriptor) -> anyhow::Result<Verdict>;
}

/// Asks on the terminal. Without a terminal nothing is approved.
#[derive(Debug)]
pub struct ConsoleApproval {
    term: Term,
}

impl ConsoleApproval {
    #[inline]
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl Default for ConsoleApproval {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Approval for ConsoleApproval {
    #[inline]
    fn review(&mut self, descriptor: &ActionDescriptor) -> anyhow::Result<Verdict> {
        eprintln!("{}", describe(descriptor));

        if !self.term.is_term() {
            warn!("No terminal available to confirm the action; declining");
            return Ok(Verdict::Declined);
        }

        let approved = Confirm::new()
            .with_prompt("Execute this action?")
            .default(false)
            .interact_on(&self.term)
            .context("Failed to read confirmation")?;

        Ok(if approved {
            Verdict::Approved
        } else {
            Verdict::Declined
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl Approval for AutoApprove {
    #[inline]
    fn review(&mut self, descriptor: &ActionDescriptor) -> anyhow::Result<Verdict> {
        debug!("Auto-approving: {}", descriptor.explanation);
        Ok(Verdict::Approved)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRun;

impl Approval for DryRun {
    #[inline]
    fn review(&mut self, _descriptor: &ActionDescriptor) -> anyhow::Result<Verdict> {
        Ok(Verdict::DryRun)
    }
}

/// Human-readable plan for `descriptor`.
#[inline]
pub fn describe(descriptor: &ActionDescriptor) -> String {
    let mut text = format!("{} {}\n", style("Plan:").bold(), descriptor.explanation);
    for (step, operation) in descriptor.operations.iter().enumerate() {
        let _ = writeln!(text, "  {}. {}", step + 1, operation);
    }
    let _ = write!(
        text,
        "  {} {}",
        style("Capabilities:").dim(),
        descriptor.capabilities.iter().join(", ")
    );
    text
}

/// How the index was brought in line with the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    Updated { report: UpdateReport, stale: usize },
    Rebuilt { report: BuildReport, stale: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// A persisted index was loaded, then refreshed.
    Loaded {
        paths: usize,
        refresh: std::result::Result<Refresh, String>,
    },
    Built(BuildReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Nothing in the index resembled the request; the model was not asked.
    NoContext,
    Declined(ActionDescriptor),
    DryRun(ActionDescriptor),
    Executed {
        explanation: String,
        steps: usize,
        /// A failed refresh does not undo the executed action.
        refresh: std::result::Result<Refresh, String>,
    },
    /// Stopped by a cancellation before anything was executed.
    Cancelled,
}

pub struct Assistant {
    index: SharedIndex,
    corpus: CorpusBuilder,
    synthesizer: ActionSynthesizer,
    executor: ActionExecutor,
    approval: Box<dyn Approval>,
    top_k: usize,
    rebuild_stale_ratio: f64,
    state: AssistantState,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for Assistant {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assistant")
            .field("index", &self.index)
            .field("corpus", &self.corpus)
            .field("synthesizer", &self.synthesizer)
            .field("executor", &self.executor)
            .field("top_k", &self.top_k)
            .field("rebuild_stale_ratio", &self.rebuild_stale_ratio)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Assistant {
    const DEFAULT_TOP_K: usize = 5;
    const DEFAULT_REBUILD_STALE_RATIO: f64 = 0.25;

    #[inline]
    pub fn new(
        index: SharedIndex,
        corpus: CorpusBuilder,
        synthesizer: ActionSynthesizer,
        executor: ActionExecutor,
    ) -> Self {
        Self {
            index,
            corpus,
            synthesizer,
            executor,
            approval: Box::new(ConsoleApproval::new()),
            top_k: Self::DEFAULT_TOP_K,
            rebuild_stale_ratio: Self::DEFAULT_REBUILD_STALE_RATIO,
            state: AssistantState::Uninitialized,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire every component from `config`.
    #[inline]
    pub fn from_config(config: &Config, approval: Box<dyn Approval>) -> anyhow::Result<Self> {
        let embedder = create_embedder(config).context("Failed to create embedder")?;
        let index = PathIndex::new(
            embedder,
            IndexStore::new(config.index_dir()),
            config.index.batch_size,
        )
        .with_progress(Term::stderr().is_term());

        let corpus =
            CorpusBuilder::from_config(&config.corpus).context("Invalid corpus configuration")?;
        let synthesizer =
            ActionSynthesizer::from_config(config).context("Failed to create language model")?;
        let executor = ActionExecutor::new(&config.sandbox_roots());

        Ok(Self::new(SharedIndex::new(index), corpus, synthesizer, executor)
            .with_approval(approval)
            .with_top_k(config.index.top_k)
            .with_rebuild_stale_ratio(config.index.rebuild_stale_ratio))
    }

    #[inline]
    pub fn with_approval(mut self, approval: Box<dyn Approval>) -> Self {
        self.approval = approval;
        self
    }

    #[inline]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    #[inline]
    pub fn with_rebuild_stale_ratio(mut self, ratio: f64) -> Self {
        self.rebuild_stale_ratio = ratio;
        self
    }

    #[inline]
    pub fn state(&self) -> AssistantState {
        self.state
    }

    #[inline]
    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    /// Flag that cancels the request being handled once set. It stays set
    /// until cleared, so later requests are cancelled too.
    #[inline]
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        let cancelled = self.cancelled.load(Ordering::SeqCst);
        if cancelled {
            info!("Request cancelled");
        }
        cancelled
    }

    /// Load the persisted index, or scan and build one when none is usable.
    #[inline]
    pub fn initialize(&mut self) -> Result<Startup> {
        if self.state != AssistantState::Uninitialized {
            return Err(PilotError::NotReady(self.state));
        }

        let startup = if self.index.load()? {
            let paths = self.index.lock()?.len();
            info!("Loaded index with {} paths", paths);
            let refresh = self.refresh().map_err(|e| {
                warn!("Refreshing the loaded index failed: {e:#}");
                e.to_string()
            });
            Startup::Loaded { paths, refresh }
        } else {
            info!("No usable index found, building from scratch");
            let corpus = self.corpus.scan()?;
            Startup::Built(self.index.build(&corpus)?)
        };

        self.state = AssistantState::Ready;
        Ok(startup)
    }

    /// Run one request through the pipeline. The assistant is `Ready` again
    /// afterwards whatever the result.
    #[inline]
    pub fn handle_request(&mut self, request: &str) -> Result<RequestOutcome> {
        if self.state != AssistantState::Ready {
            return Err(PilotError::NotReady(self.state));
        }

        self.state = AssistantState::Processing;
        let outcome = self.process(request);
        self.state = AssistantState::Ready;

        if let Err(e) = &outcome {
            warn!("Request failed: {e}");
        }
        outcome
    }

    fn process(&mut self, request: &str) -> Result<RequestOutcome> {
        if self.is_cancelled() {
            return Ok(RequestOutcome::Cancelled);
        }

        let context = self.index.search(request, self.top_k)?;
        if context.is_empty() {
            info!("No indexed paths to ground the request on");
            return Ok(RequestOutcome::NoContext);
        }

        if self.is_cancelled() {
            return Ok(RequestOutcome::Cancelled);
        }
        let descriptor = self.synthesizer.synthesize(request, &context)?;

        if self.is_cancelled() {
            return Ok(RequestOutcome::Cancelled);
        }
        let verdict = self.approval.review(&descriptor)?;

        // Approval may wait on the user for a long time.
        if self.is_cancelled() {
            return Ok(RequestOutcome::Cancelled);
        }

        match verdict {
            Verdict::Approved => {}
            Verdict::Declined => {
                info!("Action declined");
                return Ok(RequestOutcome::Declined(descriptor));
            }
            Verdict::DryRun => return Ok(RequestOutcome::DryRun(descriptor)),
        }

        let explanation = descriptor.explanation.clone();
        let steps = descriptor.operations.len();
        self.executor.execute(descriptor)?;

        let refresh = self.refresh().map_err(|e| {
            warn!("Index refresh after execution failed: {e:#}");
            e.to_string()
        });

        Ok(RequestOutcome::Executed {
            explanation,
            steps,
            refresh,
        })
    }

    /// Rescan the corpus and rebuild when too many indexed paths vanished,
    /// otherwise append what is new.
    #[inline]
    pub fn refresh(&mut self) -> Result<Refresh> {
        let corpus = self.corpus.scan()?;

        let mut index = self.index.lock()?;
        let present: HashSet<&str> = corpus.iter().map(String::as_str).collect();
        let stale = index
            .paths()
            .iter()
            .filter(|path| !present.contains(path.as_str()))
            .count();
        let ratio = if index.is_empty() {
            0.0
        } else {
            stale as f64 / index.len() as f64
        };

        debug!(
            "Refresh found {} stale of {} indexed paths ({:.2})",
            stale,
            index.len(),
            ratio
        );

        if !index.is_ready() || ratio > self.rebuild_stale_ratio {
            info!("Rebuilding index ({} stale paths)", stale);
            let report = index.build(&corpus)?;
            Ok(Refresh::Rebuilt { report, stale })
        } else {
            let report = index.update(&corpus)?;
            Ok(Refresh::Updated { report, stale })
        }
    }
}

/// Owns the assistant and serialises requests.
#[derive(Debug, Clone)]
pub struct Session {
    assistant: Arc<Mutex<Assistant>>,
    cancelled: Arc<AtomicBool>,
}

impl Session {
    #[inline]
    pub fn new(assistant: Assistant) -> Self {
        Self {
            cancelled: assistant.cancellation(),
            assistant: Arc::new(Mutex::new(assistant)),
        }
    }

    #[inline]
    pub async fn initialize(&self) -> Result<Startup> {
        let assistant = Arc::clone(&self.assistant);
        tokio::task::spawn_blocking(move || -> Result<Startup> {
            let mut assistant = assistant
                .lock()
                .map_err(|_| anyhow::anyhow!("Assistant lock poisoned"))?;
            assistant.initialize()
        })
        .await
        .map_err(|e| PilotError::Other(anyhow::anyhow!("Initialization task failed: {e}")))?
    }

    /// Cancel the request in flight. It returns
    /// [`RequestOutcome::Cancelled`] at its next checkpoint.
    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Handle `request` on a blocking thread.
    ///
    /// A Ctrl-C cancels the request, then waits for it to stop so that no
    /// work outlives the call.
    #[inline]
    pub async fn submit(&self, request: String) -> Result<RequestOutcome> {
        self.cancelled.store(false, Ordering::SeqCst);

        let assistant = Arc::clone(&self.assistant);
        let mut task = tokio::task::spawn_blocking(move || -> Result<RequestOutcome> {
            let mut assistant = assistant
                .lock()
                .map_err(|_| anyhow::anyhow!("Assistant lock poisoned"))?;
            assistant.handle_request(&request)
        });

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling the current request");
                self.cancel();
                task.await
            }
        };

        joined.map_err(|e| PilotError::Other(anyhow::anyhow!("Request task failed: {e}")))?
    }
}
