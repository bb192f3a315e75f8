use crate::cloner::RegistryCloner;
use crate::config::Args;
use crate::controller::Context;
use crate::predicates::TemplateTracker;
use clap::Parser;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use std::sync::Arc;
use tracing::info;

mod cloner;
mod config;
mod controller;
mod finalizers;
mod image_reference;
mod predicates;
mod secret_string;
mod webserver;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-cloner {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let client = controller::create_client().await?;

    let credentials =
        config::fetch_registry_credentials(&client, &args.namespace, &args.docker_creds_secret)
            .await?;
    let mirror_prefix = credentials.username.clone();
    info!("Mirroring images under registry prefix {}", mirror_prefix);

    let cloner = RegistryCloner::new(credentials)?;
    let ctx = Arc::new(Context {
        client,
        cloner,
        mirror_prefix,
        templates: TemplateTracker::default(),
    });

    tokio::select! {
        _ = async {
            tokio::join!(
                controller::run::<Deployment, _>(ctx.clone()),
                controller::run::<DaemonSet, _>(ctx.clone()),
            )
        } => {
            info!("Controllers shut down, exiting");
        }
        result = webserver::serve(8080) => {
            result?;
        }
    }

    Ok(())
}
