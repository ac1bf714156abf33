use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pgtde::config::{ProxySettings, UpstreamSsl};
use pgtde::crypto::{CryptoProvider, RustCryptoProvider};
use pgtde::security::{AuditConfig, SecurityAuditLogger};
use pgtde::server::ProxyServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pgtde")]
#[command(about = "Transparent column encryption proxy for PostgreSQL", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `pgtde=debug`
    #[arg(long, env = "PGTDE_LOG", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy
    Serve(ServeArgs),
    /// Print a random 256-bit key, hex encoded
    GenKey,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// TOML, YAML or JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept clients on
    #[arg(long)]
    listen: Option<String>,

    /// Address of the PostgreSQL server
    #[arg(long)]
    upstream: Option<String>,

    #[arg(long, value_enum)]
    upstream_ssl: Option<UpstreamSsl>,

    /// Terminate client TLS in the proxy
    #[arg(long)]
    terminate_ssl: bool,

    /// Forward queries the parser rejects instead of failing them
    #[arg(long)]
    permissive: bool,
}

impl ServeArgs {
    fn settings(&self) -> anyhow::Result<ProxySettings> {
        let mut settings = ProxySettings::load(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(listen) = &self.listen {
            settings.listen = listen.clone();
        }
        if let Some(upstream) = &self.upstream {
            settings.upstream = upstream.clone();
        }
        if let Some(mode) = self.upstream_ssl {
            settings.upstream_ssl = mode;
        }
        settings.terminate_ssl |= self.terminate_ssl;
        settings.permissive_parsing |= self.permissive;
        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::GenKey => {
            println!("{}", hex::encode(RustCryptoProvider::new().generate_aes_key()));
            Ok(())
        }
        Command::Serve(args) => {
            let settings = args.settings()?;
            info!(
                "{} protected tables, sql parsing {}",
                settings.tables.len(),
                if settings.enable_sql_parsing { "enabled" } else { "disabled" }
            );
            let audit = Arc::new(SecurityAuditLogger::with_config(AuditConfig::from_env()));
            let server = ProxyServer::new(settings, audit)?;

            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
            Ok(())
        }
    }
}
