use std::io::{BufReader, stdin};

use anyhow::Context;
use console::{Term, style};
use tracing::{info, warn};

use crate::config::Config;
use crate::corpus::CorpusBuilder;
use crate::embeddings::create_embedder;
use crate::index::{IndexStore, PathIndex};
use crate::input::{ConsoleSource, LineSource, RequestSource};
use crate::orchestrator::{
    Approval, Assistant, AutoApprove, ConsoleApproval, DryRun, Refresh, RequestOutcome, Session,
    Startup, describe,
};
use crate::{PilotError, Result};

/// Pick how synthesized actions get approved.
#[inline]
pub fn approval_for(config: &Config, yes: bool, dry_run: bool) -> Box<dyn Approval> {
    if dry_run {
        Box::new(DryRun)
    } else if yes || !config.executor.confirm {
        Box::new(AutoApprove)
    } else {
        Box::new(ConsoleApproval::new())
    }
}

fn open_index(config: &Config) -> Result<PathIndex> {
    let embedder = create_embedder(config).context("Failed to create embedder")?;
    Ok(PathIndex::new(
        embedder,
        IndexStore::new(config.index_dir()),
        config.index.batch_size,
    )
    .with_progress(Term::stderr().is_term()))
}

fn scan_corpus(config: &Config) -> Result<Vec<String>> {
    let corpus = CorpusBuilder::from_config(&config.corpus)?;
    if corpus.roots().is_empty() {
        warn!("No directories to index; configure corpus.roots");
    }

    let paths = corpus.scan()?;
    info!("Scanned {} paths", paths.len());
    Ok(paths)
}

/// Scan the corpus and build a fresh index generation
#[inline]
pub fn build_index(config: &Config) -> Result<()> {
    let paths = scan_corpus(config)?;
    let mut index = open_index(config)?;

    let report = index.build(&paths)?;
    println!(
        "{} Indexed {} paths in {:.1?} (generation {})",
        style("✓").green(),
        report.indexed,
        report.elapsed,
        report.generation
    );
    if report.duplicates > 0 {
        println!("  Skipped {} duplicate paths", report.duplicates);
    }
    Ok(())
}

/// Append paths that appeared since the last build
#[inline]
pub fn update_index(config: &Config) -> Result<()> {
    let mut index = open_index(config)?;
    if !index.load() {
        println!(
            "No usable index found. Run {} first.",
            style("pathpilot index build").cyan()
        );
        return Ok(());
    }

    let paths = scan_corpus(config)?;
    let report = index.update(&paths)?;
    println!(
        "{} Added {} paths ({} already indexed, {} total)",
        style("✓").green(),
        report.added,
        report.duplicates,
        index.len()
    );
    Ok(())
}

#[inline]
pub fn show_index_status(config: &Config) -> Result<()> {
    let store = IndexStore::new(config.index_dir());

    println!("{}", style("📊 Index Status").bold().cyan());
    println!("  Location: {}", store.dir().display());

    let Some(manifest) = store.read_manifest()? else {
        println!("  {}", style("No index has been built yet").yellow());
        return Ok(());
    };

    println!("  Generation: {}", manifest.generation);
    println!("  Paths: {}", manifest.count);
    println!("  Model: {} ({} dimensions)", manifest.model, manifest.dimension);
    println!(
        "  Updated: {}",
        manifest.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let dimension = config.embedding_dimension();
    let model = create_embedder(config).map(|embedder| embedder.model_id().to_string());
    match model {
        Ok(model) if model == manifest.model && dimension == manifest.dimension => {
            println!("  Compatible with current embedder: {}", style("yes").green());
        }
        Ok(model) => println!(
            "  Compatible with current embedder: {} (configured {} with {} dimensions, rebuild needed)",
            style("no").red(),
            model,
            dimension
        ),
        Err(e) => println!("  Current embedder unavailable: {e}"),
    }
    Ok(())
}

/// Print the paths closest to `query`
#[inline]
pub fn search_paths(config: &Config, query: &str, k: Option<usize>) -> Result<()> {
    let mut index = open_index(config)?;
    let k = k.unwrap_or(config.index.top_k);

    let hits = index.search(query, k)?;
    if hits.is_empty() {
        println!("No indexed paths. Run {} first.", style("pathpilot index build").cyan());
        return Ok(());
    }

    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>3}. {} {}",
            rank + 1,
            hit.path,
            style(format!("({:.2})", hit.similarity())).dim()
        );
    }
    Ok(())
}

/// Handle a single request and exit
#[inline]
pub async fn ask(config: &Config, request: String, approval: Box<dyn Approval>) -> Result<()> {
    let session = Session::new(Assistant::from_config(config, approval)?);
    report_startup(&session.initialize().await?);

    report_outcome(&session.submit(request).await?);
    Ok(())
}

/// Interactive loop: read requests until the user says exit
#[inline]
pub async fn run_session(config: &Config, approval: Box<dyn Approval>) -> Result<()> {
    let session = Session::new(Assistant::from_config(config, approval)?);
    report_startup(&session.initialize().await?);

    if Term::stderr().is_term() {
        eprintln!(
            "\n{} Describe what to do, or type 'exit' to quit.",
            style("🤖 PathPilot is ready!").bold().green()
        );
        drive(&session, &mut ConsoleSource::new()).await
    } else {
        drive(&session, &mut LineSource::new(BufReader::new(stdin()))).await
    }
}

async fn drive<S: RequestSource + Send>(session: &Session, source: &mut S) -> Result<()> {
    loop {
        let request = match source.next_request() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) if e.is_retryable() => {
                eprintln!("{} {e}. Please try again.", style("⚠").yellow());
                continue;
            }
            Err(e) => return Err(PilotError::Transcription(e)),
        };

        match session.submit(request).await {
            Ok(RequestOutcome::Cancelled) => {
                report_outcome(&RequestOutcome::Cancelled);
                break;
            }
            Ok(outcome) => report_outcome(&outcome),
            Err(e) => {
                warn!("{e:?}");
                eprintln!("{} {}", style("✗").red(), e.user_message());
            }
        }
    }

    eprintln!("Goodbye!");
    Ok(())
}

fn report_startup(startup: &Startup) {
    match startup {
        Startup::Built(report) => eprintln!(
            "{} Indexed {} paths",
            style("✓").green(),
            report.indexed
        ),
        Startup::Loaded { paths, refresh } => {
            eprintln!("{} Loaded index with {} paths", style("✓").green(), paths);
            report_refresh(refresh);
        }
    }
}

fn report_refresh(refresh: &std::result::Result<Refresh, String>) {
    match refresh {
        Ok(Refresh::Updated { report, .. }) if report.added > 0 => {
            eprintln!("  Indexed {} new paths", report.added);
        }
        Ok(Refresh::Updated { .. }) => {}
        Ok(Refresh::Rebuilt { report, stale }) => eprintln!(
            "  Rebuilt index after {} paths disappeared ({} paths)",
            stale, report.indexed
        ),
        Err(e) => eprintln!(
            "{} The index could not be refreshed: {e}",
            style("⚠").yellow()
        ),
    }
}

fn report_outcome(outcome: &RequestOutcome) {
    match outcome {
        RequestOutcome::NoContext => eprintln!(
            "{} Nothing in the index relates to that request.",
            style("⚠").yellow()
        ),
        RequestOutcome::Declined(_) => eprintln!("Action cancelled."),
        RequestOutcome::Cancelled => eprintln!(
            "\n{} Nothing was executed.",
            style("Interrupted.").yellow()
        ),
        RequestOutcome::DryRun(descriptor) => {
            eprintln!("{}", describe(descriptor));
            eprintln!("{}", style("Dry run: nothing was executed.").dim());
        }
        RequestOutcome::Executed {
            explanation,
            steps,
            refresh,
        } => {
            eprintln!(
                "{} {} ({} steps)",
                style("✓").green(),
                explanation,
                steps
            );
            report_refresh(refresh);
        }
    }
}
