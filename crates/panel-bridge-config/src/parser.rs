//! KDL configuration parser

use std::path::Path;

use crate::error::ConfigError;
use crate::model::*;

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Load the configuration, falling back to defaults when the file is absent
///
/// The daemon is usable without any configuration file, so a missing file
/// is not an error. Any other IO or parse failure is.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::info!(
            "No configuration file at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    parse_config(path)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl uses an older miette version, so we need to extract offset/len manually
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => {
                config.global = parse_global(node)?;
            }
            "server" => {
                config.server = parse_server(node)?;
            }
            "compositor" => {
                config.compositor = parse_compositor(node)?;
            }
            "events" => {
                config.events = parse_events(node)?;
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(config)
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalConfig, ConfigError> {
    let mut global = GlobalConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "log-level" => {
                global.log_level = string_arg(child)?
                    .parse()
                    .map_err(|message| ConfigError::Invalid { message })?;
            }
            name => {
                tracing::warn!("Unknown global config option: {}", name);
            }
        }
    }

    Ok(global)
}

fn parse_server(node: &kdl::KdlNode) -> Result<ServerConfig, ConfigError> {
    let mut server = ServerConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "socket-name" => {
                let name = string_arg(child)?;
                if name.is_empty() || name.contains('/') {
                    return Err(ConfigError::Invalid {
                        message: format!(
                            "socket-name must be a plain file name, got {:?}",
                            name
                        ),
                    });
                }
                server.socket_name = name.trim_end_matches(".sock").to_string();
            }
            "socket-path" => {
                let path = string_arg(child)?;
                server.socket_path = Some(shellexpand::tilde(path).into_owned().into());
            }
            "max-request-bytes" => {
                server.max_request_bytes = positive_int_arg(child)? as usize;
            }
            name => {
                tracing::warn!("Unknown server config option: {}", name);
            }
        }
    }

    Ok(server)
}

fn parse_compositor(node: &kdl::KdlNode) -> Result<CompositorConfig, ConfigError> {
    let mut compositor = CompositorConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "backend" => {
                compositor.backend = string_arg(child)?
                    .parse()
                    .map_err(|message| ConfigError::Invalid { message })?;
            }
            "liveness-interval-ms" => {
                compositor.liveness_interval_ms = positive_int_arg(child)?;
            }
            "request-timeout-ms" => {
                compositor.request_timeout_ms = positive_int_arg(child)?;
            }
            name => {
                tracing::warn!("Unknown compositor config option: {}", name);
            }
        }
    }

    Ok(compositor)
}

fn parse_events(node: &kdl::KdlNode) -> Result<EventsConfig, ConfigError> {
    let mut events = EventsConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "queue-capacity" => {
                events.queue_capacity = positive_int_arg(child)? as usize;
            }
            "backpressure" => {
                events.backpressure = string_arg(child)?
                    .parse()
                    .map_err(|message| ConfigError::Invalid { message })?;
            }
            "reconnect-backoff-ms" => {
                events.reconnect_backoff_ms = positive_int_arg(child)?;
            }
            "read-failure-backoff-ms" => {
                events.read_failure_backoff_ms = positive_int_arg(child)?;
            }
            name => {
                tracing::warn!("Unknown events config option: {}", name);
            }
        }
    }

    Ok(events)
}

fn child_nodes(node: &kdl::KdlNode) -> impl Iterator<Item = &kdl::KdlNode> {
    node.children()
        .map(|children| children.nodes())
        .unwrap_or_default()
        .iter()
}

fn string_arg(node: &kdl::KdlNode) -> Result<&str, ConfigError> {
    node.entries()
        .first()
        .and_then(|entry| entry.value().as_string())
        .ok_or_else(|| ConfigError::MissingValue {
            field: node.name().value().to_string(),
        })
}

fn positive_int_arg(node: &kdl::KdlNode) -> Result<u64, ConfigError> {
    let field = node.name().value();
    let value = node
        .entries()
        .first()
        .and_then(|entry| entry.value().as_i64())
        .ok_or_else(|| ConfigError::MissingValue {
            field: field.to_string(),
        })?;

    if value <= 0 {
        return Err(ConfigError::Invalid {
            message: format!("{} must be a positive integer, got {}", field, value),
        });
    }

    Ok(value as u64)
}
