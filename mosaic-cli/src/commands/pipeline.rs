//! Pipeline command handlers
//!
//! Handles all bulk-pipeline CLI commands: cost estimates, submission,
//! status, cancellation, flags and ambiguity resolution.

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::*;
use mosaic_client::OrchestratorClient;
use mosaic_core::domain::pipeline::PipelineStatus;
use mosaic_core::domain::step::StepStatus;
use mosaic_core::dto::cost::CostEstimate;
use mosaic_core::dto::pipeline::{
    AmbiguityResolution, CreateBulkPipeline, PipelineView, StepView, UpdateFlags,
};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::id_resolver::resolve_step_id;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Estimate the cost of a bulk request file without submitting it
    Estimate {
        /// Path to a JSON bulk request
        file: String,
    },
    /// Submit a bulk request file
    Submit {
        /// Path to a JSON bulk request
        file: String,

        /// Follow progress until the pipeline finishes
        #[arg(short, long)]
        watch: bool,
    },
    /// Show a pipeline's aggregate status
    Status {
        /// Pipeline ID
        id: Uuid,

        /// List every step
        #[arg(short, long)]
        steps: bool,
    },
    /// Follow a pipeline until it finishes
    Watch {
        /// Pipeline ID
        id: Uuid,

        /// Seconds between refreshes
        #[arg(short, long, default_value = "5")]
        interval: u64,
    },
    /// Cancel a running pipeline
    Cancel {
        /// Pipeline ID
        id: Uuid,
    },
    /// Set favorite/hidden flags
    Flags {
        /// Pipeline ID
        id: Uuid,

        #[arg(long)]
        favorite: Option<bool>,

        #[arg(long)]
        hidden: Option<bool>,
    },
    /// Decide what to do with a step whose submission outcome is unknown
    Resolve {
        /// Pipeline ID
        id: Uuid,

        /// Step ID or unambiguous prefix
        step: String,

        #[arg(value_enum)]
        action: Resolution,
    },
}

/// Operator resolution for an ambiguous step
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Resolution {
    /// Submit again, accepting a possible duplicate charge
    Resubmit,
    /// Keep the step failed
    Abandon,
}

impl From<Resolution> for AmbiguityResolution {
    fn from(value: Resolution) -> Self {
        match value {
            Resolution::Resubmit => AmbiguityResolution::Resubmit,
            Resolution::Abandon => AmbiguityResolution::Abandon,
        }
    }
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        PipelineCommands::Estimate { file } => estimate(&client, &file).await,
        PipelineCommands::Submit { file, watch } => submit(&client, &file, watch).await,
        PipelineCommands::Status { id, steps } => status(&client, id, steps).await,
        PipelineCommands::Watch { id, interval } => {
            watch_pipeline(&client, id, Duration::from_secs(interval.max(1))).await
        }
        PipelineCommands::Cancel { id } => cancel(&client, id).await,
        PipelineCommands::Flags {
            id,
            favorite,
            hidden,
        } => flags(&client, id, UpdateFlags { favorite, hidden }).await,
        PipelineCommands::Resolve { id, step, action } => {
            resolve(&client, id, &step, action.into()).await
        }
    }
}

fn read_bulk_request(path: &str) -> Result<CreateBulkPipeline> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bulk request file: {}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse bulk request file: {}", path))
}

async fn estimate(client: &OrchestratorClient, path: &str) -> Result<()> {
    let req = read_bulk_request(path)?;
    let estimate = client.estimate(&req).await?;

    println!("{}", format!("Cost estimate for '{}':", req.name).bold());
    print_estimate(&estimate);
    Ok(())
}

async fn submit(client: &OrchestratorClient, path: &str, watch: bool) -> Result<()> {
    let req = read_bulk_request(path)?;
    let created = client.submit_bulk(&req).await?;

    println!("{}", "✓ Pipeline submitted successfully!".green().bold());
    println!("  ID:    {}", created.pipeline_id.to_string().cyan());
    println!("  Name:  {}", req.name.bold());
    println!("  Steps: {}", created.step_count);

    if watch {
        println!();
        watch_pipeline(client, created.pipeline_id, Duration::from_secs(5)).await?;
    }
    Ok(())
}

async fn status(client: &OrchestratorClient, id: Uuid, steps: bool) -> Result<()> {
    let view = client.get_pipeline(id).await?;
    print_pipeline(&view);

    if steps {
        println!();
        print_steps(&view);
    }
    Ok(())
}

async fn watch_pipeline(client: &OrchestratorClient, id: Uuid, interval: Duration) -> Result<()> {
    loop {
        let view = client.get_pipeline(id).await?;
        println!(
            "{}  {}",
            colored_pipeline_status(view.status),
            counts_line(&view).dimmed()
        );

        if view.status.is_terminal() {
            println!();
            print_steps(&view);
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
}

async fn cancel(client: &OrchestratorClient, id: Uuid) -> Result<()> {
    client.cancel_pipeline(id).await?;
    println!(
        "{}",
        format!("✓ Cancellation requested for pipeline {}", id)
            .green()
            .bold()
    );
    Ok(())
}

async fn flags(client: &OrchestratorClient, id: Uuid, flags: UpdateFlags) -> Result<()> {
    if flags.favorite.is_none() && flags.hidden.is_none() {
        anyhow::bail!("Nothing to update: pass --favorite and/or --hidden");
    }

    let view = client.update_flags(id, &flags).await?;
    println!("{}", "✓ Flags updated".green().bold());
    println!("  Favorite: {}", view.favorite);
    println!("  Hidden:   {}", view.hidden);
    Ok(())
}

async fn resolve(
    client: &OrchestratorClient,
    id: Uuid,
    step: &str,
    resolution: AmbiguityResolution,
) -> Result<()> {
    let view = client.get_pipeline(id).await?;
    let step_id = resolve_step_id(&view, step)?;

    client
        .resolve_step(id, step_id, resolution)
        .await
        .with_context(|| format!("Failed to resolve step {}", step_id))?;

    println!(
        "{}",
        format!("✓ Step {} resolved: {:?}", step_id, resolution)
            .green()
            .bold()
    );
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_estimate(estimate: &CostEstimate) {
    for (step_type, line) in &estimate.per_step_type {
        println!(
            "  {:<16} {:>5} × {:>8.4} = {:>10.4}",
            step_type.as_str().cyan(),
            line.unit_count,
            line.unit_price,
            line.total
        );
    }
    println!("  {:<16} {:>29.4}", "total".bold(), estimate.grand_total);
}

fn print_pipeline(view: &PipelineView) {
    println!("{}", "Pipeline Details:".bold());
    println!("  ID:      {}", view.id.to_string().cyan());
    println!("  Name:    {}", view.name.bold());
    println!("  Status:  {}", colored_pipeline_status(view.status));
    println!("  Steps:   {}", counts_line(view));
    println!(
        "  Created: {}",
        view.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if !view.tags.is_empty() {
        println!("  Tags:    {}", view.tags.join(", "));
    }
    if view.favorite {
        println!("  {}", "★ favorite".yellow());
    }
}

fn print_steps(view: &PipelineView) {
    for (source, steps) in view.by_source() {
        println!("{}", format!("Source #{}", source).bold());
        for step in steps {
            print_step(step);
        }
    }
}

fn print_step(step: &StepView) {
    let short_id: String = step.id.to_string().chars().take(8).collect();
    let parent = step
        .parent
        .map(|p| format!(" ← #{}[{}]", p.step_order, p.output_index))
        .unwrap_or_default();

    println!(
        "  {:>3} {} {:<15} {}{}",
        step.step_order,
        short_id.dimmed(),
        colored_step_status(step.status),
        step.step_type.as_str(),
        parent.dimmed()
    );

    if step.retry_count > 0 {
        println!("        retries: {}", step.retry_count);
    }
    if let Some(error) = &step.last_error {
        println!("        {} {}", format!("[{}]", error.category).red(), error.message);
    }
    for output in &step.outputs {
        println!("        → {}", output.cyan());
    }
}

fn counts_line(view: &PipelineView) -> String {
    view.counts
        .iter()
        .map(|(status, count)| format!("{} {}", count, status))
        .collect::<Vec<_>>()
        .join(", ")
}

fn colored_pipeline_status(status: PipelineStatus) -> ColoredString {
    match status {
        PipelineStatus::Running => status.as_str().yellow(),
        PipelineStatus::Completed => status.as_str().green(),
        PipelineStatus::Failed => status.as_str().red(),
        PipelineStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn colored_step_status(status: StepStatus) -> ColoredString {
    match status {
        StepStatus::Pending => status.as_str().normal(),
        StepStatus::Submitting | StepStatus::InProgress => status.as_str().yellow(),
        StepStatus::Completed => status.as_str().green(),
        StepStatus::Failed => status.as_str().red(),
        StepStatus::Cancelled => status.as_str().dimmed(),
    }
}
