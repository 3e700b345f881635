//! aioclone - Clone an Azure IoT Operations instance to another cluster.

use aioclone_analyzer::{analyze_instance, AnalyzeOptions};
use aioclone_arm::{ArmClient, AzCliCredential, Env, ReqwestTransport, StaticToken, TokenCredential};
use aioclone_common::{Error, Timestamp};
use aioclone_restore::{
    bundle_name, write_template, ParameterOverrides, RestoreDriver, RestoreOptions, TemplateMode,
    WriteOptions,
};
use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "aioclone")]
#[command(
    author,
    version,
    about = "Capture an Azure IoT Operations instance as an ARM template and replay it"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone an instance to a directory and/or a target cluster
    Clone(CloneArgs),
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("destination")
        .required(true)
        .multiple(true)
        .args(["to_dir", "to_cluster_id"])
))]
struct CloneArgs {
    /// Subscription of the source instance
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    subscription: String,

    /// Resource group of the source instance
    #[arg(short = 'g', long)]
    resource_group: String,

    /// Name of the source instance
    #[arg(short = 'n', long)]
    name: String,

    /// Directory to write the clone template to
    #[arg(long)]
    to_dir: Option<PathBuf>,

    /// Template layout on disk (nested, linked)
    #[arg(long, default_value = "nested")]
    template_mode: String,

    /// Base URI linked templates will be served from
    #[arg(long)]
    linked_base_uri: Option<String>,

    /// Resource id of the connected cluster to deploy to
    #[arg(long)]
    to_cluster_id: Option<String>,

    /// Template parameter overrides as key=value
    #[arg(long, num_args = 1..)]
    to_cluster_params: Vec<String>,

    /// YAML or JSON file with template parameter overrides
    #[arg(long)]
    to_cluster_params_file: Option<PathBuf>,

    /// Federate with the cluster's self-hosted OIDC issuer
    #[arg(long)]
    use_self_hosted_issuer: bool,

    /// Do not deploy schema registry role assignments
    #[arg(long)]
    skip_role_assignments: bool,

    /// Do not create federated identity credentials
    #[arg(long)]
    skip_identity_federation: bool,

    /// Clone even when the instance version is not supported
    #[arg(long)]
    force: bool,

    /// Bearer token to use instead of the Azure CLI
    #[arg(long, env = "AZURE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Microsoft Graph bearer token to pair with --access-token
    #[arg(
        long,
        env = "AZURE_GRAPH_ACCESS_TOKEN",
        hide_env_values = true,
        requires = "access_token"
    )]
    graph_access_token: Option<String>,
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| {
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        }))
        .with(filter)
        .init();
}

fn build_env(args: &CloneArgs, cancel: CancellationToken) -> anyhow::Result<Arc<Env>> {
    let transport = ReqwestTransport::new(CONNECT_TIMEOUT)?;
    let credential: Arc<dyn TokenCredential> = match &args.access_token {
        Some(token) => {
            let mut credential = StaticToken::new(token.clone());
            match &args.graph_access_token {
                Some(graph) => credential = credential.with_graph_token(graph.clone()),
                None if args.to_cluster_id.is_some() && !args.skip_role_assignments => warn!(
                    "No Microsoft Graph token given; the K8 Bridge lookup will use the ARM token and role assignments will likely be skipped"
                ),
                None => {}
            }
            Arc::new(credential)
        }
        None => Arc::new(AzCliCredential::new()),
    };
    Ok(Arc::new(
        Env::new(args.subscription.clone(), Arc::new(transport), credential)
            .with_cancellation(cancel),
    ))
}

async fn run_clone(args: CloneArgs, env: Arc<Env>) -> anyhow::Result<()> {
    let mode: TemplateMode = args.template_mode.parse()?;
    let mut overrides = ParameterOverrides::new();
    if let Some(path) = &args.to_cluster_params_file {
        overrides = ParameterOverrides::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
    }
    overrides = overrides.merge(ParameterOverrides::from_pairs(args.to_cluster_params.as_slice())?);

    let arm = ArmClient::new(env);

    // Step 1: Analyze the source instance
    info!(
        "Analyzing instance {} in resource group {}",
        args.name, args.resource_group
    );
    let analysis = analyze_instance(
        &arm,
        &args.resource_group,
        &args.name,
        AnalyzeOptions { force: args.force },
    )
    .await?;
    let bundle = bundle_name(analysis.instance_name(), &Timestamp::now());

    // Step 2: Write the template
    if let Some(out_dir) = &args.to_dir {
        let written = write_template(
            &analysis.template,
            &WriteOptions {
                out_dir: out_dir.clone(),
                bundle_name: bundle.clone(),
                mode,
                base_uri: args.linked_base_uri.clone(),
            },
        )?;
        println!("Template bundle: {}", bundle);
        for path in written.all() {
            println!("  wrote {}", path.display());
        }
    } else if args.linked_base_uri.is_some() || mode == TemplateMode::Linked {
        warn!("Template layout options have no effect without --to-dir");
    }

    // Step 3: Deploy to the target cluster
    if let Some(cluster_id) = &args.to_cluster_id {
        let outcome = RestoreDriver::new(&arm)
            .restore(
                &analysis.template,
                analysis.user_assigned_identities(),
                &RestoreOptions {
                    target_cluster_id: cluster_id.clone(),
                    bundle_name: bundle.clone(),
                    overrides,
                    use_self_hosted_issuer: args.use_self_hosted_issuer,
                    skip_role_assignments: args.skip_role_assignments,
                    skip_identity_federation: args.skip_identity_federation,
                },
            )
            .await?;

        println!("Deployed {} to {}", outcome.bundle_name, cluster_id);
        for deployment in &outcome.deployments {
            println!("  {}: {}", deployment.name, deployment.portal_url);
        }
        if let Some(federation) = &outcome.federation {
            println!(
                "  federated credentials: {} created, {} already present",
                federation.created.len(),
                federation.existing.len()
            );
        }
        if !outcome.role_assignments_applied {
            println!("  role assignments were not applied");
        }
    }

    Ok(())
}

/// One-line reason, followed by the provider body when the failure carries one.
fn render_error(e: &anyhow::Error) -> String {
    let mut rendered = format!("Error: {:#}", e);
    let body = e
        .chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .and_then(Error::provider_body);
    if let Some(pretty) = body.and_then(|b| serde_json::to_string_pretty(b).ok()) {
        rendered.push('\n');
        rendered.push_str(&pretty);
    }
    rendered
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current request");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Clone(args) => {
            let env = match build_env(&args, cancel) {
                Ok(env) => env,
                Err(e) => {
                    eprintln!("{}", render_error(&e));
                    return ExitCode::FAILURE;
                }
            };
            let correlation_id = env.correlation_id;
            if let Err(e) = run_clone(args, env).await {
                eprintln!("{}", render_error(&e));
                eprintln!("Correlation id: {}", correlation_id);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
