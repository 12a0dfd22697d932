use anyhow::{bail, Context};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use yakphone::{
    AnswerOptions, CallDecision, DialEvents, DialOptions, Phone, PhoneConfig, ReferState,
    RegisterOptions, SipUri,
};

const USAGE: &str = "usage: yakphone [-c config.toml] register | dial <extension> | answer";

/// Logs call progress and follows transfers
struct ConsoleEvents;

impl DialEvents for ConsoleEvents {
    fn on_response(&self, response: &yakphone::infrastructure::protocols::sip::SipResponse) {
        info!(status = response.status_code(), reason = %response.reason(), "Call progress");
    }

    fn handles_refer(&self) -> bool {
        true
    }

    fn on_refer(&self, state: ReferState) {
        match state {
            ReferState::Initiated => info!("Transfer requested"),
            ReferState::Confirmed(session) => info!(dialog = %session.id(), "Transferred"),
            ReferState::Ended => warn!("Transfer failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match args.iter().position(|a| a == "-c" || a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = args.remove(i + 1);
            args.remove(i);
            Some(path)
        }
        Some(_) => bail!(USAGE),
        None => None,
    };

    // Load configuration
    let mut config = PhoneConfig::load(config_path.as_deref()).context("loading configuration")?;
    apply_env_overrides(&mut config);
    info!("Configuration loaded: listen={:?} user_agent={}", config.listen, config.user_agent);

    let phone = Phone::from_config(&config);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    match args.first().map(String::as_str) {
        Some("register") => {
            let (registrar, options) = register_settings(&config)?;
            phone.register(&cancel, registrar, options).await?;
        }
        Some("dial") => {
            let extension = args.get(1).context(USAGE)?;
            let dial = DialOptions {
                events: Some(Arc::new(ConsoleEvents)),
                ..Default::default()
            };

            let session = match register_settings(&config) {
                Ok((registrar, options)) => {
                    let recipient = SipUri::new(Some(extension.clone()), registrar.host(), registrar.port());
                    let dial = DialOptions {
                        username: options.username.clone(),
                        password: options.password.clone(),
                        ..dial
                    };
                    phone
                        .register_and_dial(&cancel, registrar, recipient, options, dial)
                        .await?
                }
                Err(_) => {
                    let recipient = SipUri::parse(extension).context("dial target must be a SIP URI without a registrar")?;
                    phone.dial(&cancel, recipient, dial).await?
                }
            };

            info!(dialog = %session.id(), "Call established, hang up with ctrl-c");
            let lifetime = session.lifetime();
            tokio::select! {
                _ = lifetime.cancelled() => info!("Remote side hung up"),
                _ = cancel.cancelled() => {}
            }
            session.close().await?;
        }
        Some("answer") => {
            let mut options = AnswerOptions {
                events: Some(Arc::new(|invite: &yakphone::infrastructure::protocols::sip::SipRequest| {
                    info!(from = ?invite.header("from"), "Ringing");
                    CallDecision::Continue
                })),
                ringtime: std::time::Duration::from_secs(1),
                ..Default::default()
            };
            if let Ok((registrar, register)) = register_settings(&config) {
                options.register_addr = Some(registrar.to_string());
                options.username = register.username;
                options.password = register.password;
                options.expiry = register.expiry;
            }

            let session = phone.answer(&cancel, options).await?;
            info!(dialog = %session.id(), "Call answered, hang up with ctrl-c");
            let lifetime = session.lifetime();
            tokio::select! {
                _ = lifetime.cancelled() => info!("Remote side hung up"),
                _ = cancel.cancelled() => {}
            }
            session.close().await?;
        }
        _ => bail!(USAGE),
    }

    Ok(())
}

/// `YAKPHONE_SERVER`, `YAKPHONE_USERNAME` and `YAKPHONE_PASSWORD` win over the file
fn apply_env_overrides(config: &mut PhoneConfig) {
    let server = std::env::var("YAKPHONE_SERVER").ok();
    let username = std::env::var("YAKPHONE_USERNAME").ok();
    let password = std::env::var("YAKPHONE_PASSWORD").ok();

    if let Some(server) = server {
        let uri = if server.starts_with("sip:") || server.starts_with("sips:") {
            server
        } else {
            format!("sip:{}", server)
        };
        let register = config.register.get_or_insert_with(|| yakphone::config::RegisterConfig {
            uri: uri.clone(),
            username: String::new(),
            password: String::new(),
            expiry: 3600,
        });
        register.uri = uri;
    }
    if let Some(register) = config.register.as_mut() {
        if let Some(username) = username {
            register.username = username;
        }
        if let Some(password) = password {
            register.password = password;
        }
    }
}

fn register_settings(config: &PhoneConfig) -> anyhow::Result<(SipUri, RegisterOptions)> {
    let register = config.register.as_ref().context("no registrar configured")?;
    let registrar = SipUri::parse(&register.uri).context("invalid registrar URI")?;
    Ok((
        registrar,
        RegisterOptions {
            username: register.username.clone(),
            password: register.password.clone(),
            expiry: register.expiry,
            ..Default::default()
        },
    ))
}
