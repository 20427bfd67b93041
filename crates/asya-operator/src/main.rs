// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context as _, Result};
use asya_operator::runtime_configmap::{ensure_configmap, load_script};
use asya_operator::{AsyncActor, Context, OperatorConfig, run_controller};
use clap::Parser;
use kube::CustomResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asya-operator", version, about = "Asya AsyncActor operator")]
struct Args {
    /// Path to the mounted operator configuration.
    #[arg(long, default_value = "/etc/asya/config.yaml")]
    config: PathBuf,

    /// Print the AsyncActor CRD as YAML and exit.
    #[arg(long)]
    print_crd: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&AsyncActor::crd())?);
        return Ok(());
    }

    let filter = if args.debug {
        EnvFilter::new("asya_operator=debug,kube=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asya_operator=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = OperatorConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    let config = Arc::new(config);

    let client = kube::Client::try_default()
        .await
        .context("connect to the cluster")?;
    info!("connected to the cluster");

    // The authoritative runtime ConfigMap is written once at startup; a
    // config change means an operator rollout, which lands here again.
    let script = load_script(&config.runtime_script)
        .await
        .context("load runtime script")?;
    ensure_configmap(client.clone(), &config.runtime_namespace, &script)
        .await
        .context("write runtime configmap")?;
    info!(
        namespace = %config.runtime_namespace,
        bytes = script.len(),
        "runtime script distributed"
    );

    let ctx = Arc::new(Context::new(client, config, script));
    info!("starting AsyncActor controller");
    run_controller(ctx).await;
    info!("controller stopped");
    Ok(())
}
