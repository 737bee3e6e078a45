//! sdewan-operator: reconciles Mwan3Policy and Mwan3Rule resources onto the
//! CNF replicas serving their `sdewanPurpose`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sdewan_operator::clients::{CnfCredentials, OpenWrtClient, RemoteClient};
use sdewan_operator::controller;
use sdewan_operator::resolver::{InstanceResolver, KubeResolver};
use sdewan_operator::store::KubeStore;
use sdewan_operator::{Context, Mwan3Policy, Mwan3Rule, PolicyHandler, RuleHandler};

/// SD-EWAN mwan3 operator
#[derive(Parser, Debug)]
#[command(name = "sdewan-operator", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Namespace to watch (all namespaces if unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Delay before a failed reconcile is retried, in seconds
    #[arg(long, env = "SDEWAN_RETRY_DELAY_SECS", default_value = "5")]
    retry_delay_secs: u64,

    /// Username for the CNF configuration API
    #[arg(long, env = "SDEWAN_CNF_USERNAME", default_value = "root")]
    cnf_username: String,

    /// Password for the CNF configuration API
    #[arg(long, env = "SDEWAN_CNF_PASSWORD", default_value = "", hide_env_values = true)]
    cnf_password: String,

    /// Port of the CNF configuration API
    #[arg(long, env = "SDEWAN_CNF_PORT", default_value = "80")]
    cnf_port: u16,

    /// Timeout for a single CNF API request, in seconds
    #[arg(long, env = "SDEWAN_REQUEST_TIMEOUT_SECS", default_value = "10")]
    request_timeout_secs: u64,

    /// Log as JSON lines
    #[arg(long, env = "SDEWAN_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controllers (default)
    Run,
    /// Print the CustomResourceDefinitions as YAML
    Crd,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sdewan_operator=info,kube=warn,tower=warn,hyper=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn print_crds() -> Result<()> {
    let policy = serde_yaml::to_string(&Mwan3Policy::crd()).context("serialize Mwan3Policy CRD")?;
    let rule = serde_yaml::to_string(&Mwan3Rule::crd()).context("serialize Mwan3Rule CRD")?;
    print!("{}---\n{}", policy, rule);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Crd) = args.command {
        return print_crds();
    }

    init_logging(args.log_json);

    info!("Starting sdewan-operator");
    match &args.namespace {
        Some(ns) => info!("Watching namespace {}", ns),
        None => info!("Watching all namespaces"),
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let credentials = CnfCredentials {
        username: args.cnf_username,
        password: args.cnf_password,
        port: args.cnf_port,
    };
    let remote: Arc<dyn RemoteClient> = Arc::new(
        OpenWrtClient::new(credentials, Duration::from_secs(args.request_timeout_secs))
            .context("Failed to create CNF client")?,
    );
    let store = Arc::new(KubeStore::new(client.clone()));
    let resolver: Arc<dyn InstanceResolver> = Arc::new(KubeResolver::new(client.clone()));
    let retry_delay = Duration::from_secs(args.retry_delay_secs);

    let policies = Arc::new(
        Context::new(
            PolicyHandler::new(Arc::clone(&remote)),
            store.clone(),
            Arc::clone(&resolver),
        )
        .with_retry_delay(retry_delay),
    );
    let rules = Arc::new(
        Context::new(RuleHandler::new(remote), store, resolver).with_retry_delay(retry_delay),
    );

    let namespace = args.namespace.as_deref();
    tokio::join!(
        controller::run(client.clone(), namespace, policies),
        controller::run(client, namespace, rules),
    );

    info!("sdewan-operator stopped");
    Ok(())
}
