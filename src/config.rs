//! Runtime configuration, taken from flags or the environment.

use clap::Args;
use std::time::Duration;
use tracing::{info, warn};

const METADATA_HOSTNAME_URL: &str = "http://169.254.169.254/latest/meta-data/public-hostname";

/// Options for the `serve` subcommand.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "BROKER_PORT", default_value = "8080")]
    pub port: u16,

    /// Idle time after which a session's sandbox is reclaimed
    #[arg(long, env = "SESSION_TTL_SECS", default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    pub session_ttl_secs: u64,

    /// Wall-clock limit for a single worker run
    #[arg(long, env = "WORKER_DEADLINE_SECS", default_value = "120", value_parser = clap::value_parser!(u64).range(1..))]
    pub worker_deadline_secs: u64,

    /// How often the reaper sweeps for idle sessions
    #[arg(long, env = "REAP_INTERVAL_SECS", default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub reap_interval_secs: u64,

    /// Shared store; without it sessions live in this process only
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Image used for new sandboxes
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "abhipi04/custom-chrome-novnc")]
    pub sandbox_image: String,

    /// Password the sandbox's VNC server expects
    #[arg(long, env = "VNC_PASSWORD", default_value = "12345678")]
    pub vnc_password: String,

    /// Host name used in endpoint URLs handed to workers and viewers
    #[arg(long, env = "PUBLIC_DNS")]
    pub public_dns: Option<String>,

    /// Delay between container start and the first reachability probe
    #[arg(long, env = "SANDBOX_SETTLE_DELAY_MS", default_value = "2000")]
    pub settle_delay_ms: u64,

    /// Worker program and leading arguments; the task payload is appended
    #[arg(long, env = "WORKER_COMMAND", default_value = "pipenv run python -u browsing_agent.py")]
    pub worker_command: String,

    /// Host the broker dials to check a sandbox's published control port,
    /// used when the port is bound on all interfaces
    #[arg(long, env = "SANDBOX_DIAL_HOST", default_value = "127.0.0.1")]
    pub dial_host: String,

    /// Grace period between SIGTERM and SIGKILL for a worker's process group
    #[arg(long, env = "WORKER_KILL_GRACE_MS", default_value = "2000")]
    pub kill_grace_ms: u64,

    /// Bind each caller to at most one live session
    #[arg(long, env = "ENFORCE_AFFINITY", default_value = "true", action = clap::ArgAction::Set)]
    pub enforce_affinity: bool,
}

/// Immutable settings shared by every component.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub session_ttl: Duration,
    pub worker_deadline: Duration,
    pub reap_interval: Duration,
    pub sandbox_image: String,
    pub vnc_password: String,
    pub public_host: String,
    pub settle_delay: Duration,
    pub dial_host: String,
    pub worker_command: Vec<String>,
    pub kill_grace: Duration,
    pub enforce_affinity: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(300),
            worker_deadline: Duration::from_secs(120),
            reap_interval: Duration::from_secs(60),
            sandbox_image: "abhipi04/custom-chrome-novnc".to_string(),
            vnc_password: "12345678".to_string(),
            public_host: "localhost".to_string(),
            settle_delay: Duration::from_secs(2),
            dial_host: "127.0.0.1".to_string(),
            worker_command: split_command("pipenv run python -u browsing_agent.py"),
            kill_grace: Duration::from_secs(2),
            enforce_affinity: true,
        }
    }
}

impl BrokerConfig {
    /// Build the config, resolving the public host when none was given.
    pub async fn from_args(args: &ServeArgs) -> Self {
        let public_host = match &args.public_dns {
            Some(host) => host.clone(),
            None => lookup_public_hostname().await,
        };
        info!(public_host = %public_host, "Resolved public host");

        Self {
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            worker_deadline: Duration::from_secs(args.worker_deadline_secs),
            reap_interval: Duration::from_secs(args.reap_interval_secs),
            sandbox_image: args.sandbox_image.clone(),
            vnc_password: args.vnc_password.clone(),
            public_host,
            settle_delay: Duration::from_millis(args.settle_delay_ms),
            dial_host: args.dial_host.clone(),
            worker_command: split_command(&args.worker_command),
            kill_grace: Duration::from_millis(args.kill_grace_ms),
            enforce_affinity: args.enforce_affinity,
        }
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Ask the EC2 metadata service for this instance's public host name,
/// falling back to `localhost` off AWS.
async fn lookup_public_hostname() -> String {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot build metadata client: {}", e);
            return "localhost".to_string();
        }
    };

    match client.get(METADATA_HOSTNAME_URL).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => "localhost".to_string(),
        },
        Ok(resp) => {
            warn!(status = %resp.status(), "Metadata lookup refused");
            "localhost".to_string()
        }
        Err(e) => {
            warn!("Metadata lookup failed: {}", e);
            "localhost".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_command_is_split_on_whitespace() {
        assert_eq!(
            split_command("  pipenv run  python -u agent.py "),
            vec!["pipenv", "run", "python", "-u", "agent.py"]
        );
        assert!(split_command("   ").is_empty());
    }

    #[tokio::test]
    async fn explicit_public_dns_skips_lookup() {
        let args = ServeArgs {
            port: 8080,
            session_ttl_secs: 60,
            worker_deadline_secs: 80,
            reap_interval_secs: 10,
            redis_url: None,
            sandbox_image: "img".to_string(),
            vnc_password: "pw".to_string(),
            public_dns: Some("sandbox.example.com".to_string()),
            settle_delay_ms: 0,
            dial_host: "10.0.0.5".to_string(),
            worker_command: "sh -c true".to_string(),
            kill_grace_ms: 100,
            enforce_affinity: false,
        };
        let config = BrokerConfig::from_args(&args).await;
        assert_eq!(config.public_host, "sandbox.example.com");
        assert_eq!(config.session_ttl, Duration::from_secs(60));
        assert_eq!(config.worker_deadline, Duration::from_secs(80));
        assert_eq!(config.worker_command, vec!["sh", "-c", "true"]);
        assert_eq!(config.dial_host, "10.0.0.5");
        assert!(!config.enforce_affinity);
    }

    #[derive(clap::Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn zero_durations_are_rejected() {
        use clap::Parser;
        for flag in ["--reap-interval-secs", "--session-ttl-secs", "--worker-deadline-secs"] {
            assert!(Cli::try_parse_from(["broker", flag, "0"]).is_err(), "{} accepted 0", flag);
        }
        let cli = Cli::try_parse_from(["broker", "--reap-interval-secs", "1"]).unwrap();
        assert_eq!(cli.serve.reap_interval_secs, 1);
    }
}
