use std::sync::Arc;

use clap::Parser;
use kube::client::Client;
use skyhook_common::Config;

mod skyhook;
mod util;

/// Main entrypoint that sets up the environment before running the
/// controller. Mirrors the teacher's `main` shape: init, client, run,
/// panic-as-exit.
#[tokio::main]
async fn main() {
    skyhook_common::init();

    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the controller or metrics server may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let config = Arc::new(Config::parse());

    tokio::spawn(skyhook_common::metrics::run_metrics_server(config.metrics_port));
    tokio::spawn(skyhook_common::metrics::run_probe_server(config.probe_port));

    // Create a kubernetes client using the default configuration.
    // In-cluster, the kubeconfig will be set by the service account.
    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    skyhook::reconciler::run(client, config)
        .await
        .expect("controller exited with an error");

    // This is an unreachable branch. The controller and metrics servers
    // should never exit without a panic.
    panic!("exited prematurely");
}
