use std::error::Error;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use log::{error, info, warn};
use simplelog::{ColorChoice, LevelFilter, SimpleLogger, TermLogger, TerminalMode};

use coap_exchange::message::{ContentFormat, HttpProxy, Message, Method, ObserveOption};
use coap_exchange::{CoAPClient, ExchangeEvent, ExchangeOptions};

/// A simple utility for interacting with CoAP services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Target URL (coap://host:port/resource?query)
    pub target: String,

    /// Operation to perform
    #[arg(value_enum)]
    pub command: Command,

    /// Request payload
    #[arg(short, long)]
    pub payload: Option<String>,

    /// Send the request as non-confirmable
    #[arg(long)]
    pub non_confirmable: bool,

    /// Carry the request through an HTTP proxy (host:port)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Local UDP port to bind
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Configure app logging levels (warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: LevelFilter,
}

#[derive(ValueEnum, PartialEq, Clone, Copy, Debug)]
pub enum Command {
    /// Perform a GET request
    Get,
    /// Perform a PUT request
    Put,
    /// Perform a POST request
    Post,
    /// Perform a DELETE request
    Delete,
    /// Register an observer on the provided resource
    Observe,
}

fn parse_proxy(proxy: &str) -> Result<HttpProxy, Box<dyn Error>> {
    let (host, port) = proxy
        .rsplit_once(':')
        .ok_or_else(|| format!("proxy {} is not host:port", proxy))?;
    Ok(HttpProxy {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port: port.parse()?,
    })
}

fn describe(message: &Message) -> String {
    let payload = match message.content_format() {
        Some(ContentFormat::TextPlain) | Some(ContentFormat::ApplicationJSON) | None => {
            String::from_utf8_lossy(&message.payload).into_owned()
        }
        Some(cf) => format!("<{} bytes of {}>", message.payload.len(), cf.media_type()),
    };
    match message.observe() {
        Some(seq) => format!("{} (observe {}) {}", message.code_str(), seq, payload),
        None => format!("{} {}", message.code_str(), payload),
    }
}

fn init_logging(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let log_config = simplelog::ConfigBuilder::new().build();
    let term = TermLogger::init(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
    if term.is_err() {
        SimpleLogger::init(level, log_config)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load options
    let opts = Options::parse();

    // Initialise logging
    init_logging(opts.log_level)?;

    let method = match opts.command {
        Command::Get | Command::Observe => Method::Get,
        Command::Put => Method::Put,
        Command::Post => Method::Post,
        Command::Delete => Method::Delete,
    };

    let mut request = Message::from_url(method, &opts.target)?;
    if opts.non_confirmable {
        request.message_type = coap_exchange::MessageType::NonConfirmable;
    }
    if let Some(payload) = &opts.payload {
        request.payload = payload.as_bytes().to_vec();
    }
    if let Some(proxy) = &opts.proxy {
        request.proxy = Some(parse_proxy(proxy)?);
    }
    let observing = opts.command == Command::Observe;
    if observing {
        request.set_observe(ObserveOption::Register as u32);
    }

    let options = ExchangeOptions {
        local_port: opts.local_port,
        ..ExchangeOptions::default()
    };
    let mut client = CoAPClient::new(options);

    info!("Sending {:?} to {}", opts.command, opts.target);
    client.send(request).await?;

    loop {
        tokio::select! {
            event = client.next() => match event {
                Some(ExchangeEvent::MessageReceived(message)) => {
                    info!("Received: {}", describe(&message));
                    if !observing {
                        break;
                    }
                }
                Some(ExchangeEvent::Retransmitted { attempt, is_final, .. }) => {
                    warn!("Retransmission {}{}", attempt, if is_final { " (final)" } else { "" });
                }
                Some(ExchangeEvent::Failed(e)) => {
                    error!("Request failed: {}", e);
                    client.close().await;
                    return Err(e.into());
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if observing => {
                info!("Cancelling observation");
                client.cancel_observe();
                // wait for the answer to the deregistration
                if let Some(ExchangeEvent::MessageReceived(message)) = client.next().await {
                    info!("Received: {}", describe(&message));
                }
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_proxy() {
        let proxy = parse_proxy("[fe80::1]:8080").unwrap();
        assert_eq!(proxy.host, "fe80::1");
        assert_eq!(proxy.port, 8080);

        assert!(parse_proxy("proxy.local").is_err());
        assert!(parse_proxy("proxy.local:http").is_err());
    }

    #[test]
    fn test_options_and_logging() {
        let opts = Options::try_parse_from([
            "coap-client",
            "coap://127.0.0.1/sensors",
            "observe",
            "--log-level",
            "warn",
        ])
        .unwrap();
        assert_eq!(opts.command, Command::Observe);
        assert_eq!(opts.log_level, LevelFilter::Warn);

        init_logging(opts.log_level).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Warn);
    }
}
