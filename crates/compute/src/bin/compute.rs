//! Compute CLI - submit training jobs and manage inference deployments across
//! GPU providers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use compute::queue::HttpProbe;
use compute::{
    ComputeService, DeploymentConfig, DeploymentId, DeploymentStatus, EnvCredentialStore, JobConfig,
    JobId, JobStatus, ManagerConfig, MetricsReport, OrchestratorConfig, ScalingConfig, Settings,
    SubmitOutcome,
};

/// Compute CLI - Orchestrate training jobs and deployments across GPU providers.
#[derive(Parser)]
#[command(name = "compute")]
#[command(about = "Submit fine-tuning jobs and manage inference endpoints across GPU providers")]
struct Cli {
    /// Settings file (providers, state directory).
    #[arg(long, short, env = "COMPUTE_CONFIG", default_value = "compute.yaml")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a provider's GPU resources.
    Resources {
        /// Provider name from the settings file.
        #[arg(long)]
        provider: String,
    },

    /// Show the price of one resource.
    Pricing {
        /// Provider name.
        #[arg(long)]
        provider: String,

        /// Resource ID (from `resources`).
        #[arg(long)]
        resource: String,
    },

    /// Submit a training job.
    Submit {
        /// Provider name.
        #[arg(long)]
        provider: String,

        /// Job name.
        #[arg(long)]
        name: String,

        /// Preferred resource ID.
        #[arg(long)]
        resource: String,

        /// Fallback resource IDs tried in order (comma-separated).
        #[arg(long, value_delimiter = ',')]
        fallback: Vec<String>,

        /// Base model to fine-tune.
        #[arg(long)]
        base_model: String,

        /// Dataset location.
        #[arg(long)]
        dataset: String,

        /// Command run on the remote machine (session providers).
        #[arg(long)]
        entrypoint: Option<String>,

        /// Idempotency key; generated when omitted.
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Queue the submission instead of sending it.
        #[arg(long, default_value = "false")]
        offline: bool,

        /// Wait for the job to finish (seconds, 0 = don't wait).
        #[arg(long, default_value = "0")]
        wait: u64,
    },

    /// Show one job.
    Status {
        /// Job ID.
        #[arg(long)]
        id: String,
    },

    /// List jobs.
    List {
        /// Only jobs in this status (repeatable).
        #[arg(long)]
        status: Vec<JobStatus>,
    },

    /// Cancel a job.
    Cancel {
        /// Job ID.
        #[arg(long)]
        id: String,
    },

    /// Stream a job's log.
    Logs {
        /// Job ID.
        #[arg(long)]
        id: String,

        /// Cursor to resume from.
        #[arg(long, default_value = "0")]
        from: u64,
    },

    /// Download a completed job's artifact.
    Artifact {
        /// Job ID.
        #[arg(long)]
        id: String,

        /// Output file.
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Inspect or drain the offline queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Deploy a model or adapter.
    Deploy {
        /// Provider name.
        #[arg(long)]
        provider: String,

        /// Endpoint name.
        #[arg(long)]
        name: String,

        /// Model or adapter reference.
        #[arg(long)]
        model: String,

        /// Resource ID.
        #[arg(long)]
        resource: String,

        /// Minimum replicas.
        #[arg(long, default_value = "1")]
        min_replicas: u32,

        /// Maximum replicas.
        #[arg(long, default_value = "1")]
        max_replicas: u32,

        /// Wait for the endpoint to serve (seconds, 0 = don't wait).
        #[arg(long, default_value = "0")]
        wait: u64,
    },

    /// Change a deployment's scaling.
    Scale {
        /// Deployment ID.
        #[arg(long)]
        id: String,

        /// Minimum replicas.
        #[arg(long)]
        min_replicas: u32,

        /// Maximum replicas.
        #[arg(long)]
        max_replicas: u32,

        /// Requests per replica before scaling out.
        #[arg(long, default_value = "8")]
        target_concurrency: u32,
    },

    /// Stop a deployment.
    Stop {
        /// Deployment ID.
        #[arg(long)]
        id: String,
    },

    /// List deployments.
    Deployments {
        /// Only live deployments.
        #[arg(long, default_value = "false")]
        live: bool,
    },

    /// Show rolling metrics of a deployment.
    Metrics {
        /// Deployment ID.
        #[arg(long)]
        id: String,
    },

    /// Supervise live jobs and deployments and drain the queue on reconnect.
    Run {
        /// Connectivity probe interval in seconds.
        #[arg(long, default_value = "15")]
        probe_interval: u64,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show queued submissions.
    List,
    /// Submit queued entries now.
    Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = if cli.config.exists() {
        Settings::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        warn!(path = %cli.config.display(), "Settings file not found, using defaults");
        Settings::default()
    };

    let service = ComputeService::from_settings(
        &settings,
        OrchestratorConfig::from_env(),
        ManagerConfig::from_env(),
    )
    .await
    .context("Failed to initialize compute service")?;
    let credentials = EnvCredentialStore::new();

    match cli.command {
        Commands::Resources { provider } => {
            service.connect(&provider, &credentials).await?;
            let resources = service.list_resources(&provider).await?;

            println!(
                "\n{:<28} {:<12} {:>6} {:>10} {:<12}",
                "RESOURCE", "GPU", "VRAM", "$/HR", "STOCK"
            );
            println!("{}", "-".repeat(72));
            for r in resources {
                println!(
                    "{:<28} {:<12} {:>4}GB {:>10.2} {:<12}",
                    r.resource_id, r.gpu_type, r.vram_gb, r.hourly_rate, r.availability
                );
            }
            println!();
        }

        Commands::Pricing { provider, resource } => {
            service.connect(&provider, &credentials).await?;
            let pricing = service.get_pricing(&provider, &resource).await?;
            println!(
                "{}: {:.4} {}/hr (billed per {}s)",
                pricing.resource_id, pricing.hourly_rate, pricing.currency, pricing.billing_increment_secs
            );
        }

        Commands::Submit {
            provider,
            name,
            resource,
            fallback,
            base_model,
            dataset,
            entrypoint,
            idempotency_key,
            offline,
            wait,
        } => {
            let mut config = JobConfig::new(name, resource, base_model, dataset);
            config.fallback_resource_ids = fallback;
            config.entrypoint = entrypoint;

            if offline {
                service.set_online(false);
            } else {
                service.connect(&provider, &credentials).await?;
            }

            match service.submit(&provider, config, idempotency_key).await? {
                SubmitOutcome::Queued(entry) => {
                    println!("📥 Queued {} (key {})", entry.local_id, entry.idempotency_key);
                }
                SubmitOutcome::Submitted(job) => {
                    println!("🚀 Job {} is {}", job.id, job.status);
                    if let Some(message) = &job.error_message {
                        println!("   {message}");
                    }
                    if wait > 0 && !job.status.is_terminal() {
                        let done = service
                            .orchestrator()
                            .wait_for_terminal(&job.id, Duration::from_secs(wait))
                            .await?;
                        print_job(&done);
                    }
                }
            }
        }

        Commands::Status { id } => {
            let job = service.job_status(&JobId::new(id)).await?;
            print_job(&job);
        }

        Commands::List { status } => {
            let jobs = service.list_jobs(&status).await?;
            println!(
                "\n{:<42} {:<10} {:<14} {:<20} {:<20}",
                "ID", "PROVIDER", "STATUS", "RESOURCE", "CREATED"
            );
            println!("{}", "-".repeat(108));
            for job in jobs {
                println!(
                    "{:<42} {:<10} {:<14} {:<20} {:<20}",
                    job.id,
                    job.provider,
                    job.status,
                    job.resource_id,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
        }

        Commands::Cancel { id } => {
            let id = JobId::new(id);
            let job = service.job_status(&id).await?;
            service.connect(&job.provider, &credentials).await?;
            let job = service.cancel_job(&id).await?;
            print_job(&job);
        }

        Commands::Logs { id, from } => {
            let id = JobId::new(id);
            let job = service.job_status(&id).await?;
            service.connect(&job.provider, &credentials).await?;

            let mut lines = service.stream_logs(&id, from).await?;
            let mut cursor = from;
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        cursor = line.next_offset;
                        println!("{}", line.message);
                    }
                    Err(e) => {
                        eprintln!("log stream interrupted: {e}; resume with --from {cursor}");
                        break;
                    }
                }
            }
        }

        Commands::Artifact { id, output } => {
            let id = JobId::new(id);
            let job = service.job_status(&id).await?;
            service.connect(&job.provider, &credentials).await?;
            let bytes = service.fetch_artifact(&id).await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("✅ Wrote {} bytes to {}", bytes.len(), output.display());
        }

        Commands::Queue { action } => match action {
            QueueAction::List => {
                let entries = service.queued().await;
                if entries.is_empty() {
                    println!("Queue is empty");
                }
                for entry in entries {
                    println!(
                        "{:<24} {:<10} {:<24} attempts={} {}",
                        entry.local_id,
                        entry.provider,
                        entry.config.name,
                        entry.attempts,
                        entry.last_error.unwrap_or_default()
                    );
                }
            }
            QueueAction::Drain => {
                let report = service.drain_queue().await?;
                for (local_id, job_id) in &report.submitted {
                    println!("🚀 {local_id} → {job_id}");
                }
                for (local_id, job_id) in &report.rejected {
                    println!("❌ {local_id} → {job_id} (failed)");
                }
                if let Some(reason) = report.deferred {
                    println!("⏸️  Stopped early: {reason}");
                }
                println!("{} still queued", report.remaining);
            }
        },

        Commands::Deploy {
            provider,
            name,
            model,
            resource,
            min_replicas,
            max_replicas,
            wait,
        } => {
            service.connect(&provider, &credentials).await?;
            let config = DeploymentConfig {
                name,
                model_ref: model,
                resource_id: resource,
                scaling: ScalingConfig {
                    min_replicas,
                    max_replicas,
                    ..ScalingConfig::default()
                },
            };
            let deployment = service.deploy(&provider, config).await?;
            println!("🚀 Deployment {} is {}", deployment.id, deployment.status);

            if wait > 0 && !deployment.status.is_terminal() {
                let ready = service
                    .deployments()
                    .wait_for_status(
                        &deployment.id,
                        &[DeploymentStatus::Active, DeploymentStatus::Failed, DeploymentStatus::Stopped],
                        Duration::from_secs(wait),
                    )
                    .await?;
                match ready.endpoint_url {
                    Some(url) if ready.status == DeploymentStatus::Active => println!("✅ Serving at {url}"),
                    _ => bail!(
                        "deployment {} ended {}: {}",
                        ready.id,
                        ready.status,
                        ready.error_message.unwrap_or_default()
                    ),
                }
            }
        }

        Commands::Scale {
            id,
            min_replicas,
            max_replicas,
            target_concurrency,
        } => {
            let id = DeploymentId::new(id);
            let deployment = service.deployment_status(&id).await?;
            service.connect(&deployment.platform, &credentials).await?;
            let scaling = ScalingConfig {
                min_replicas,
                max_replicas,
                target_concurrency,
            };
            let deployment = service.scale(&id, scaling).await?;
            println!(
                "✅ {} scaled to {}..{} replicas",
                deployment.id, deployment.config.scaling.min_replicas, deployment.config.scaling.max_replicas
            );
        }

        Commands::Stop { id } => {
            let id = DeploymentId::new(id);
            let deployment = service.deployment_status(&id).await?;
            service.connect(&deployment.platform, &credentials).await?;
            let deployment = service.stop_deployment(&id).await?;
            println!("🛑 {} is {}", deployment.id, deployment.status);
            if let Some(message) = deployment.error_message {
                println!("   {message}");
            }
        }

        Commands::Deployments { live } => {
            let statuses: &[DeploymentStatus] = if live { &DeploymentStatus::LIVE } else { &[] };
            let deployments = service.list_deployments(statuses).await?;
            println!(
                "\n{:<42} {:<10} {:<10} {:<40}",
                "ID", "PLATFORM", "STATUS", "ENDPOINT"
            );
            println!("{}", "-".repeat(104));
            for d in deployments {
                println!(
                    "{:<42} {:<10} {:<10} {:<40}",
                    d.id,
                    d.platform,
                    d.status,
                    d.endpoint_url.as_deref().unwrap_or("-")
                );
            }
            println!();
        }

        Commands::Metrics { id } => match service.get_metrics(&DeploymentId::new(id)).await? {
            MetricsReport::NoData => println!("No samples in the window"),
            MetricsReport::Stats(s) => {
                println!("\n📊 Metrics ({} → {})", s.window_start, s.window_end);
                println!("{}", "=".repeat(60));
                println!(
                    "Requests: {} ({} ok, {} failed, {:.1}% success)",
                    s.total_requests,
                    s.successful_requests,
                    s.failed_requests,
                    s.success_rate * 100.0
                );
                println!(
                    "Latency: avg {:.1}ms | p50 {:.1}ms | p95 {:.1}ms | p99 {:.1}ms",
                    s.avg_latency_ms, s.p50_latency_ms, s.p95_latency_ms, s.p99_latency_ms
                );
                println!(
                    "Tokens: {} in / {} out | Cost: ${:.4} | Throughput: {:.2} req/s",
                    s.total_tokens_in, s.total_tokens_out, s.total_cost, s.throughput_rps
                );
                println!();
            }
        },

        Commands::Run { probe_interval } => {
            for name in settings.providers.iter().map(|p| p.name.as_str()) {
                if let Err(e) = service.connect(name, &credentials).await {
                    warn!(provider = %name, error = %e, "Provider unavailable");
                }
            }
            let (jobs, deployments) = service.resume().await?;
            info!(jobs, deployments, "Supervising");

            let monitor = match &settings.connectivity_probe_url {
                Some(url) => {
                    let probe = HttpProbe::new(url, Duration::from_secs(5))
                        .context("Failed to build connectivity probe")?;
                    Some(service.watch_connectivity(
                        Arc::new(probe),
                        Duration::from_secs(probe_interval),
                    ))
                }
                None => None,
            };

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            if let Some(monitor) = monitor {
                monitor.stop().await;
            }
            service.shutdown().await;
        }
    }

    Ok(())
}

fn print_job(job: &compute::Job) {
    println!("\n📋 Job {}", job.id);
    println!("   Provider: {} ({})", job.provider, job.resource_id);
    println!("   Status:   {}", job.status);
    if let Some(remote) = &job.remote_id {
        println!("   Remote:   {remote}");
    }
    if let Some(artifact) = &job.artifact_ref {
        println!("   Artifact: {artifact}");
    }
    if let Some(cost) = job.estimated_cost {
        println!("   Cost:     ${cost:.4}");
    }
    if let (Some(kind), Some(message)) = (&job.error_kind, &job.error_message) {
        println!("   Error:    [{kind}] {message}");
    }
    if !job.attempts.is_empty() {
        println!("   Retries:  {}", job.attempts.len());
    }
    println!();
}
