use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use workbench_core::config::{apply_runtime_env, Settings};
use workbench_core::permissions::{ApprovalDefaults, PolicyEngine};
use workbench_core::runner::Runner;
use workbench_core::scheduler::start_scheduler;
use workbench_core::{DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use workbench_providers::OpenAiCompatProvider;
use workbench_server::{adopt_mcp_servers, resolve_admin_token, serve, AppState};
use workbench_store::{EventBus, Store};
use workbench_tools::{register_builtin_tools, ShellOptions, ToolRegistry};

#[derive(Parser, Debug)]
#[command(name = "workbench-engine")]
#[command(about = "Local-first agent orchestrator engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP engine service.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        /// Overrides DATA_DIR for this invocation.
        #[arg(long)]
        data_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            hostname,
            port,
            data_dir,
        } => {
            if let Some(dir) = data_dir {
                std::env::set_var("DATA_DIR", dir);
            }
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            run_serve(addr).await
        }
    }
}

async fn run_serve(addr: SocketAddr) -> anyhow::Result<()> {
    // Persisted runtime overrides apply before Settings snapshots the env.
    let bootstrap = Settings::from_env();
    apply_runtime_env(&bootstrap.data_dir);
    let settings = Arc::new(Settings::from_env());
    settings.ensure_dirs()?;

    let (_log_guard, log_info) = workbench_observability::init_logging(
        &settings.logs_dir,
        settings.log_retention_days,
    )?;
    info!(
        "logging to {} (prefix {}, retention {}d)",
        log_info.logs_dir, log_info.prefix, log_info.retention_days
    );

    let event_bus = EventBus::new();
    let store = Arc::new(Store::open(&settings.db_path, event_bus.clone()).await?);

    let tools = ToolRegistry::new();
    register_builtin_tools(
        &tools,
        ShellOptions {
            enabled: settings.shell_allow,
            container_image: settings.shell_container_image.clone(),
            timeout: std::time::Duration::from_secs(120),
        },
    )
    .await?;
    match adopt_mcp_servers(&store, &tools).await {
        Ok(adopted) if adopted > 0 => info!("adopted {adopted} mcp tools"),
        Ok(_) => {}
        Err(err) => tracing::warn!("mcp adoption failed: {err}"),
    }

    let provider = Arc::new(OpenAiCompatProvider::new(
        settings.llm_base_url.clone(),
        settings.llm_api_key.clone(),
    ));
    let policy = Arc::new(PolicyEngine::new(
        store.clone(),
        ApprovalDefaults {
            shell: settings.require_approval_shell,
            fs_write: settings.require_approval_fs_write,
            fs_delete: settings.require_approval_fs_delete,
            browser_click: settings.require_approval_browser_click,
        },
    ));
    let runner = Runner::new(
        store.clone(),
        tools.clone(),
        policy,
        provider.clone(),
        settings.clone(),
    );

    let scheduler_cancel = CancellationToken::new();
    let scheduler_handle = if settings.scheduler_enabled {
        Some(start_scheduler(
            runner.clone(),
            settings.scheduler_tick_seconds,
            scheduler_cancel.clone(),
        ))
    } else {
        None
    };

    let admin_token = resolve_admin_token(&settings)?;
    let state = AppState {
        store,
        event_bus,
        settings: settings.clone(),
        tools,
        runner,
        provider,
        admin_token,
    };

    info!(
        "data dir {} (db {})",
        settings.data_dir.display(),
        settings.db_path.display()
    );
    let result = serve(addr, state).await;

    scheduler_cancel.cancel();
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    result
}
