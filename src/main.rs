use anyhow::Context;
use ctr_inject::cli::{Args, ConfigDiscovery, CopyConfig, ExecutionMode, InjectConfig, RunConfig};
use ctr_inject::container::{
    Container, ContainerRequest, ContainerRuntime, DockerRuntime, MemoryRuntime,
};
use ctr_inject::inject::{CopyContext, LiveCopier};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "ctr_inject=debug"
    } else {
        "ctr_inject=info"
    };
    let filter = std::env::var(ctr_inject::env::LOG_ENV_VAR)
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let config = ConfigDiscovery::load(args.config.as_deref())?;

    match mode {
        ExecutionMode::Copy(copy) => run_copy(copy, &config).await,
        ExecutionMode::Run(run) => run_container(run, &config).await,
        ExecutionMode::ShowConfig => ConfigDiscovery::show_discovery_info(&config),
    }
}

async fn run_copy(copy: CopyConfig, config: &InjectConfig) -> anyhow::Result<()> {
    let runtime = DockerRuntime::with_config(config.runtime.docker_config())
        .await
        .context("Failed to connect to the container runtime")?;
    let ctx = CopyContext::with_timeout(copy.timeout.unwrap_or_else(|| config.runtime.timeout()));

    let copier = LiveCopier::new(&runtime, &copy.container, config.copy.clone());
    let copied = if copy.directory {
        copier
            .copy_directory(&ctx, &copy.host_path, &copy.container_path, copy.mode)
            .await
    } else {
        copier
            .copy_file(&ctx, &copy.host_path, &copy.container_path, copy.mode)
            .await
    };
    let placed = copied.with_context(|| {
        format!(
            "Failed to copy {} into {}",
            copy.host_path.display(),
            copy.container
        )
    })?;

    println!("{}:{}", copy.container, placed);
    Ok(())
}

async fn run_container(run: RunConfig, config: &InjectConfig) -> anyhow::Result<()> {
    let mut builder = ContainerRequest::builder()
        .image(&run.image)
        .files(run.files.clone())
        .copy_options(config.copy.clone())
        .started(run.start && !run.dry_run);
    if let Some(name) = &run.name {
        builder = builder.name(name);
    }
    if !run.cmd.is_empty() {
        builder = builder.cmd(run.cmd.clone());
    }
    let request = builder.build()?;
    let ctx = CopyContext::with_timeout(config.runtime.timeout());

    if run.dry_run {
        let runtime = Arc::new(MemoryRuntime::new());
        let container = Container::create(runtime.clone(), request, &ctx).await?;
        for path in runtime.tree(container.id(), "/").await {
            if let Some(node) = runtime.node(container.id(), &path).await {
                println!("{:o}\t{}", node.mode(), path);
            }
        }
        return Ok(());
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::with_config(config.runtime.docker_config())
            .await
            .context("Failed to connect to the container runtime")?,
    );
    let container = Container::create(runtime, request, &ctx)
        .await
        .with_context(|| format!("Failed to create container from {}", run.image))?;

    info!("Container {} ready", container.id());
    println!("{}", container.id());
    Ok(())
}
