use clap::Parser;

/// Process-wide configuration, one field per key recognized by spec.md
/// §6. Parsed once at startup with `clap`'s `env` feature, the same way
/// the teacher's `*Args` structs in its `common` crate are built.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Root directory on the host the agent image's filesystem is
    /// staged under inside the runner pod.
    #[arg(long, env = "COPY_DIR_ROOT", default_value = "/var/lib/skyhook")]
    pub copy_dir_root: String,

    #[arg(long, env = "AGENT_LOG_ROOT", default_value = "/var/log/skyhook")]
    pub agent_log_root: String,

    #[arg(long, env = "LEADER_ELECTION", default_value_t = true)]
    pub leader_election: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    #[arg(long, env = "PROBE_PORT", default_value_t = 8081)]
    pub probe_port: u16,

    #[arg(long, env = "ENABLE_WEBHOOKS", default_value_t = true)]
    pub enable_webhooks: bool,

    #[arg(long, env = "NAMESPACE", default_value = "skyhook")]
    pub namespace: String,

    #[arg(long, env = "IMAGE_PULL_SECRET")]
    pub image_pull_secret: Option<String>,

    #[arg(long, env = "REAPPLY_ON_REBOOT", default_value_t = false)]
    pub reapply_on_reboot: bool,

    #[arg(
        long,
        env = "RUNTIME_REQUIRED_TAINT",
        default_value = "skyhook.nvidia.com/runtime-required"
    )]
    pub runtime_required_taint: String,

    #[arg(long, env = "PAUSE_IMAGE", default_value = "registry.k8s.io/pause:3.9")]
    pub pause_image: String,

    #[arg(long, env = "AGENT_IMAGE")]
    pub agent_image: String,

    #[arg(
        long,
        env = "KUBERNETES_CLUSTER_DOMAIN",
        default_value = "cluster.local"
    )]
    pub kubernetes_cluster_domain: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
