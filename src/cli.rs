use crate::context::Settings;
use crate::observe::ObserveMethod;
use crate::rancher::client::RancherAuth;

use clap::builder::TypedValueParser;
use clap::Parser;
use tokio::time::Duration;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level
    #[arg(
        long,
        default_value_t = LevelFilter::INFO,
        value_parser = clap::builder::PossibleValuesParser::new(["trace", "debug", "info", "warn", "error"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
    )]
    pub log_level: LevelFilter,

    /// Base URL of the Rancher API
    #[arg(long, env = "RANCHER__URL")]
    pub rancher_url: String,

    /// Long-lived Rancher API token. Mutually exclusive with username/password
    #[arg(
        long,
        env = "RANCHER__TOKEN",
        conflicts_with_all = ["rancher_username", "rancher_password"]
    )]
    pub rancher_token: Option<String>,

    /// Rancher username, exchanged for an automatically refreshed token
    #[arg(long, env = "RANCHER__USERNAME", requires = "rancher_password")]
    pub rancher_username: Option<String>,

    /// Rancher password
    #[arg(long, env = "RANCHER__PASSWORD", requires = "rancher_username")]
    pub rancher_password: Option<String>,

    /// Disable TLS certificate verification towards Rancher
    #[arg(long, env = "RANCHER__ALLOWINSECURESSL", default_value_t = false)]
    pub rancher_allow_insecure_ssl: bool,

    /// Arm namespace deletion under the Delete policy. Without this flag
    /// namespaces are detached from their project but never deleted
    #[arg(long, env = "CLEANUP_NAMESPACES", default_value_t = false)]
    pub cleanup_namespaces: bool,

    /// How the observe loop follows downstream clusters
    #[arg(long, env = "OBSERVE_METHOD", value_enum, default_value_t = ObserveMethod::Watch)]
    pub observe_method: ObserveMethod,

    /// Minutes between refreshes of the set of observed clusters
    #[arg(long, env = "CLUSTER_CHECK_INTERVAL", default_value_t = 5)]
    pub cluster_check_interval: u64,

    /// Minutes between full namespace sweeps in poll mode
    #[arg(long, env = "POLLING_INTERVAL", default_value_t = 2)]
    pub polling_interval: u64,

    /// Port serving /metrics and /health
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            cleanup_namespaces: self.cleanup_namespaces,
            observe_method: self.observe_method,
            cluster_check_interval: Duration::from_secs(self.cluster_check_interval * 60),
            polling_interval: Duration::from_secs(self.polling_interval * 60),
        }
    }

    pub fn rancher_auth(&self) -> anyhow::Result<RancherAuth> {
        match (
            &self.rancher_token,
            &self.rancher_username,
            &self.rancher_password,
        ) {
            (Some(token), _, _) => Ok(RancherAuth::Token(token.clone())),
            (None, Some(username), Some(password)) => Ok(RancherAuth::UsernamePassword {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => anyhow::bail!(
                "either --rancher-token or --rancher-username and --rancher-password are required"
            ),
        }
    }
}
