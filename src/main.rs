use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use log::{error, info};

use captchouli::config::Config;
use captchouli::service::Service;
use captchouli::web;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = Config::from_env()?;
    let (addr, explicit, tags) = parse_args(std::env::args().skip(1));
    config.apply_cli_overrides(addr, explicit, tags);

    let socket_addr = parse_listen_addr(&config.listen_addr)?;

    info!("captchouli: starting on {socket_addr}");
    info!("captchouli: root dir {}", config.root_dir.display());
    info!("captchouli: tags {:?}", config.tags);
    info!("captchouli: source {}", config.source);

    if !is_port_available(socket_addr) {
        error!("captchouli: port {} is already in use", socket_addr.port());
        return Err(format!("port {} is already in use", socket_addr.port()).into());
    }

    let service = Arc::new(Service::bootstrap(config).await?);
    let routes = web::routes(service);

    info!("captchouli: ready, listening on http://{socket_addr}");
    warp::serve(routes).run(socket_addr).await;

    Ok(())
}

fn is_port_available(addr: SocketAddr) -> bool {
    TcpListener::bind(addr).is_ok()
}

/// Resolves the `-a`/`CAPTCHOULI_ADDR` address string into a socket
/// address. A bare `:port` (the original CLI's default form) binds every
/// interface.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let with_host = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };
    Ok(with_host.parse()?)
}

/// Minimal hand-rolled flag parser for the three CLI override names
/// (`-a`, `-e`, `-t`); the crate carries no argument-parsing dependency,
/// so this mirrors the original CLI's flag set directly rather than
/// pulling one in just for three flags.
fn parse_args(
    args: impl Iterator<Item = String>,
) -> (Option<String>, bool, Option<Vec<String>>) {
    let mut addr = None;
    let mut explicit = false;
    let mut tags: Vec<String> = Vec::new();

    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-a" | "--addr" => addr = args.next(),
            "-e" | "--explicit" => explicit = true,
            "-t" | "--tag" => {
                if let Some(tag) = args.next() {
                    tags.push(tag);
                }
            }
            _ => {}
        }
    }

    let tags = if tags.is_empty() { None } else { Some(tags) };
    (addr, explicit, tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_addr_binds_all_interfaces_for_bare_port() {
        let addr = parse_listen_addr(":8512").unwrap();
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert_eq!(addr.port(), 8512);
    }

    #[test]
    fn parse_args_collects_repeated_tag_flags() {
        let args = vec![
            "-a".to_string(),
            ":9000".to_string(),
            "-e".to_string(),
            "-t".to_string(),
            "cirno".to_string(),
            "-t".to_string(),
            "reimu".to_string(),
        ];
        let (addr, explicit, tags) = parse_args(args.into_iter());
        assert_eq!(addr, Some(":9000".to_string()));
        assert!(explicit);
        assert_eq!(tags, Some(vec!["cirno".to_string(), "reimu".to_string()]));
    }

    #[test]
    fn parse_args_returns_none_for_tags_when_absent() {
        let (addr, explicit, tags) = parse_args(std::iter::empty());
        assert_eq!(addr, None);
        assert!(!explicit);
        assert_eq!(tags, None);
    }
}
