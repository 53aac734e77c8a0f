use std::sync::Arc;

use mail_gate::channels::{ImapConnector, OutboundTransport, SmtpOutbound};
use mail_gate::config::GateConfig;
use mail_gate::error::{Error, Result};
use mail_gate::pipeline::Notifier;
use mail_gate::worker::ConnectionSupervisor;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage. Another component
    // may already have installed one; either way a provider is in place.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let result = tokio::select! {
        result = run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            std::process::exit(0);
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Mail gate stopped");
        eprintln!("Error: {e}");
        if matches!(e, Error::Config(_)) {
            eprintln!("  export EMAIL_USER=gate@example.com");
            eprintln!("  export EMAIL_PASS=...");
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Load config, check SMTP, then supervise the mailbox until giving up.
async fn run() -> Result<()> {
    let config = GateConfig::from_env()?;

    eprintln!("📬 Mail Gate v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Account: {}", config.own_address);
    eprintln!("   IMAP: {}:{}", config.imap.host, config.imap.port);
    eprintln!("   SMTP: {}:{}", config.smtp.host, config.smtp.port);
    eprintln!("   Subject must contain: {}", config.rules.required_subject);
    eprintln!(
        "   Poll: every {:?} (new mail settles {:?})\n",
        config.poll.check_interval, config.poll.new_mail_delay
    );

    // ── Outbound ────────────────────────────────────────────────────────
    let smtp = SmtpOutbound::new(&config.smtp)?;
    smtp.verify_connection().await?;
    tracing::info!(host = %config.smtp.host, "SMTP connection verified");

    let notifier = Arc::new(Notifier::new(
        Arc::new(smtp),
        config.own_address.clone(),
        config.rules.success_link.clone(),
    ));

    // ── Inbound ─────────────────────────────────────────────────────────
    let connector = ImapConnector::new(config.imap.clone());
    let supervisor = ConnectionSupervisor::new(connector, notifier, &config);
    supervisor.run().await
}
