use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;

use cadence::agent::{AgentId, Capability, Worker};
use cadence::config::Config;
use cadence::core::{Chunk, ChunkDependency, ChunkKind, Metadata, TaskId};
use cadence::orchestration::{Orchestrator, TacticalAction};
use cadence::store::{FileStore, MemoryStore, RecordStore};
use cadence::{clog, Error, Result};

/// Cadence - phase-oscillating scheduler for decomposed work
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CADENCE_DEBUG=1     Enable debug logging (alternative to --debug)\n    CADENCE_LOG=<lvl>   Explicit log level")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.cadence/cadence.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.cadence/cadence.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Schedule a workload file with an echo worker and print the outcome
    Run {
        /// TOML file declaring agents and chunks
        workload: PathBuf,

        /// Give up if the workload has not drained after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Keep records in memory instead of the store directory
        #[arg(long)]
        memory: bool,
    },

    /// Show phase, chunk and task state recorded in the store directory
    Status,

    /// Print the effective configuration
    Config {
        /// Write the defaults to the config path
        #[arg(long)]
        init: bool,
    },
}

/// Workload file layout.
#[derive(Debug, Deserialize)]
struct Workload {
    #[serde(default)]
    agents: Vec<AgentSpec>,
    #[serde(default)]
    chunks: Vec<ChunkSpec>,
}

#[derive(Debug, Deserialize)]
struct AgentSpec {
    id: String,
    capabilities: Vec<Capability>,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct ChunkSpec {
    key: String,
    #[serde(default)]
    kind: ChunkKind,
    content: String,
    /// Chunks sharing a task name belong to the same task.
    task: Option<String>,
    /// Key of the chunk this one was decomposed from.
    parent: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    informed_by: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
}

/// Worker that echoes the chosen action and the chunk content.
struct EchoWorker;

impl Worker for EchoWorker {
    fn process(&self, chunk: Chunk, action: TacticalAction) -> BoxFuture<'static, Result<String>> {
        async move { Ok(format!("[{}] {}", action.action, chunk.content())) }.boxed()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cadence::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            workload,
            timeout_secs,
            memory,
        } => run_workload(&config, &workload, Duration::from_secs(timeout_secs), memory),
        Command::Status => run_status(&config),
        Command::Config { init } => run_config(&config, init),
    }
}

fn open_store(config: &Config, memory: bool) -> Result<Arc<dyn RecordStore>> {
    if memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let dir = config.store_dir()?;
    clog!("Using store at {}", dir.display());
    Ok(Arc::new(FileStore::open(dir)?))
}

/// Turn the workload's keyed chunks into graph chunks and edges.
fn build_workload(workload: &Workload) -> Result<(Vec<Chunk>, Vec<ChunkDependency>, HashMap<String, Chunk>)> {
    let mut tasks: HashMap<String, TaskId> = HashMap::new();
    let mut by_key: HashMap<String, Chunk> = HashMap::new();
    let mut chunks = Vec::new();

    for spec in &workload.chunks {
        if by_key.contains_key(&spec.key) {
            return Err(Error::Validation(format!("duplicate chunk key '{}'", spec.key)));
        }
        let mut chunk = Chunk::new(spec.kind, spec.content.clone());
        chunk.metadata = spec.metadata.clone();
        if let Some(task) = &spec.task {
            let task_id = *tasks.entry(task.clone()).or_default();
            chunk = chunk.with_task(task_id);
        }
        by_key.insert(spec.key.clone(), chunk.clone());
        chunks.push(chunk);
    }

    let lookup = |key: &str| {
        by_key
            .get(key)
            .map(|c| c.id)
            .ok_or_else(|| Error::not_found("chunk key", key))
    };

    let mut dependencies = Vec::new();
    for (spec, chunk) in workload.chunks.iter().zip(chunks.iter_mut()) {
        if let Some(parent) = &spec.parent {
            chunk.parent_chunk_id = Some(lookup(parent)?);
        }
        for key in &spec.depends_on {
            dependencies.push(ChunkDependency::blocks(lookup(key)?, chunk.id));
        }
        for key in &spec.informed_by {
            dependencies.push(ChunkDependency::informs(lookup(key)?, chunk.id, 0.5));
        }
    }
    let by_key = workload
        .chunks
        .iter()
        .zip(chunks.iter())
        .map(|(spec, chunk)| (spec.key.clone(), chunk.clone()))
        .collect();
    Ok((chunks, dependencies, by_key))
}

fn run_workload(config: &Config, path: &Path, timeout: Duration, memory: bool) -> Result<()> {
    let workload: Workload = toml::from_str(&std::fs::read_to_string(path)?)?;
    let (chunks, dependencies, by_key) = build_workload(&workload)?;
    clog!(
        "Run workload {}: {} agents, {} chunks, {} edges",
        path.display(),
        workload.agents.len(),
        chunks.len(),
        dependencies.len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    let output = rt.block_on(async {
        let store = open_store(config, memory)?;
        let orchestrator = Orchestrator::new(config, store, Arc::new(EchoWorker))?;
        for agent in &workload.agents {
            let caps: BTreeSet<Capability> = agent.capabilities.iter().copied().collect();
            orchestrator
                .register_agent(AgentId::new(agent.id.clone()), caps, agent.max_concurrent)
                .await?;
        }
        if !chunks.is_empty() {
            orchestrator.submit_batch(chunks, dependencies).await?;
        }

        let report = orchestrator.run_until_idle(timeout).await?;

        let mut results = BTreeMap::new();
        for (key, chunk) in &by_key {
            if let Some(current) = orchestrator.get_chunk(&chunk.id).await {
                results.insert(
                    key.clone(),
                    serde_json::json!({
                        "id": current.id.to_string(),
                        "state": current.state.name(),
                        "agent": current.agent_id.as_ref().map(|a| a.to_string()),
                        "attempts": current.attempts,
                        "output": current.processed_content,
                    }),
                );
            }
        }
        let status = orchestrator.get_phase_status().await;
        Ok::<_, Error>(serde_json::json!({
            "chunks": results,
            "dispatched": report.dispatched.len(),
            "failed": report.failed.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            "transitions": report.transitions.len(),
            "phase": status,
        }))
    })?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let output = rt.block_on(async {
        let store = open_store(config, false)?;
        let orchestrator = Orchestrator::restore(config, store, Arc::new(EchoWorker)).await?;
        let snapshot = orchestrator.snapshot().await;

        let mut by_state: BTreeMap<&'static str, usize> = BTreeMap::new();
        for chunk in &snapshot.chunks {
            *by_state.entry(chunk.state.name()).or_default() += 1;
        }
        let tasks = orchestrator.records().load_tasks().await?;
        let decisions = orchestrator.records().decisions().await?;
        let status = orchestrator.get_phase_status().await;
        Ok::<_, Error>(serde_json::json!({
            "phase": status,
            "chunks": by_state,
            "dependencies": snapshot.dependencies.len(),
            "agents": orchestrator.agents().await,
            "tasks": tasks,
            "decisions": decisions.len(),
        }))
    })?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_config(config: &Config, init: bool) -> Result<()> {
    if init {
        Config::default().save()?;
        println!("Wrote defaults to {}", Config::config_path()?.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["cadence", "--debug", "run", "work.toml", "--memory"]).unwrap();
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Command::Run {
                workload: PathBuf::from("work.toml"),
                timeout_secs: 60,
                memory: true,
            }
        );
    }

    #[test]
    fn test_build_workload_links_keys() {
        let workload: Workload = toml::from_str(
            r#"
            [[agents]]
            id = "p"
            capabilities = ["planning"]

            [[chunks]]
            key = "a"
            content = "first"
            task = "t"

            [[chunks]]
            key = "b"
            kind = "note"
            content = "second"
            task = "t"
            parent = "a"
            depends_on = ["a"]
            "#,
        )
        .unwrap();
        let (chunks, deps, by_key) = build_workload(&workload).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(deps, vec![ChunkDependency::blocks(chunks[0].id, chunks[1].id)]);
        assert_eq!(chunks[1].parent_chunk_id, Some(chunks[0].id));
        assert_eq!(chunks[0].parent_task_id, chunks[1].parent_task_id);
        assert_eq!(by_key["b"].kind, ChunkKind::Note);
        assert_eq!(workload.agents[0].max_concurrent, 1);
    }

    #[test]
    fn test_build_workload_unknown_key() {
        let workload: Workload = toml::from_str(
            r#"
            [[chunks]]
            key = "a"
            content = "x"
            depends_on = ["missing"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            build_workload(&workload),
            Err(Error::NotFound { .. })
        ));
    }
}
