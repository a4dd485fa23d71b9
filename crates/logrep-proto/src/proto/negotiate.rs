//! Startup handshake: version, parameter format and wire format selection.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    init_api, ProtoApi, ProtoFormat, PROTO_MIN_VERSION_NUM, PROTO_VERSION_NUM,
    STARTUP_PARAMS_FORMAT_FLAT, STARTUP_REPLY_FORMAT_FLAT,
};
use crate::error::{ProtoError, ProtoResult};

/// The only encoding the stream is produced in.
pub const SERVER_ENCODING: &str = "UTF8";

/// Startup parameters sent by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupParams {
    pub startup_params_format: u32,
    pub min_proto_version: u32,
    pub max_proto_version: u32,
    pub proto_format: ProtoFormat,
    pub forward_changeset_origins: bool,
    pub expected_encoding: Option<String>,
}

impl Default for StartupParams {
    fn default() -> Self {
        Self {
            startup_params_format: STARTUP_PARAMS_FORMAT_FLAT,
            min_proto_version: PROTO_MIN_VERSION_NUM,
            max_proto_version: PROTO_VERSION_NUM,
            proto_format: ProtoFormat::Native,
            forward_changeset_origins: false,
            expected_encoding: None,
        }
    }
}

impl StartupParams {
    /// Parse a flat key/value parameter list.
    ///
    /// The parameter format is checked first since it decides how the rest
    /// is read. Unknown keys are ignored.
    pub fn parse(pairs: &[(String, String)]) -> ProtoResult<Self> {
        let mut params = Self::default();

        if let Some((_, value)) = pairs.iter().find(|(k, _)| k == "startup_params_format") {
            let format = parse_u32("startup_params_format", value)?;
            if format != STARTUP_PARAMS_FORMAT_FLAT {
                return Err(ProtoError::UnsupportedStartupFormat(format));
            }
            params.startup_params_format = format;
        }

        for (key, value) in pairs {
            match key.as_str() {
                "startup_params_format" => {}
                "min_proto_version" => params.min_proto_version = parse_u32(key, value)?,
                "max_proto_version" => params.max_proto_version = parse_u32(key, value)?,
                "proto_format" => params.proto_format = value.parse()?,
                "forward_changeset_origins" => {
                    params.forward_changeset_origins = parse_bool(key, value)?
                }
                "expected_encoding" => params.expected_encoding = Some(value.clone()),
                _ => debug!(key = %key, "Ignoring unknown startup parameter"),
            }
        }

        Ok(params)
    }

    /// Flat key/value form, as sent on the wire.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            pair("startup_params_format", self.startup_params_format),
            pair("min_proto_version", self.min_proto_version),
            pair("max_proto_version", self.max_proto_version),
            pair("proto_format", self.proto_format),
            pair("forward_changeset_origins", self.forward_changeset_origins),
        ];
        if let Some(encoding) = &self.expected_encoding {
            pairs.push(pair("expected_encoding", encoding));
        }
        pairs
    }
}

/// What the sending side supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub min_proto_version: u32,
    pub max_proto_version: u32,
    pub server_version: String,
    /// Whether the sender may forward changes that arrived from other
    /// origins.
    pub forward_origins: bool,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            min_proto_version: PROTO_MIN_VERSION_NUM,
            max_proto_version: PROTO_VERSION_NUM,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            forward_origins: true,
        }
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub proto_version: u32,
    pub proto_format: ProtoFormat,
    pub forward_changeset_origins: bool,
    pub min_proto_version: u32,
    pub max_proto_version: u32,
    pub server_version: String,
}

impl Negotiated {
    /// Writer for the selected format.
    pub fn api(&self) -> Arc<dyn ProtoApi> {
        init_api(self.proto_format)
    }

    /// Parameters of the startup reply message.
    pub fn reply_params(&self) -> Vec<(String, String)> {
        vec![
            pair("proto_version", self.proto_version),
            pair("proto_format", self.proto_format),
            pair("startup_reply_format", STARTUP_REPLY_FORMAT_FLAT),
            pair("min_proto_version", self.min_proto_version),
            pair("max_proto_version", self.max_proto_version),
            pair("encoding", SERVER_ENCODING),
            pair("forward_changeset_origins", self.forward_changeset_origins),
            pair("server_version", &self.server_version),
        ]
    }
}

/// Highest version inside both ranges, if the ranges overlap.
pub fn select_version(
    client_min: u32,
    client_max: u32,
    server_min: u32,
    server_max: u32,
) -> Option<u32> {
    let selected = client_max.min(server_max);
    (selected >= client_min.max(server_min)).then_some(selected)
}

/// Run the startup handshake.
pub fn negotiate(client: &StartupParams, server: &ServerCapabilities) -> ProtoResult<Negotiated> {
    if client.startup_params_format != STARTUP_PARAMS_FORMAT_FLAT {
        return Err(ProtoError::UnsupportedStartupFormat(
            client.startup_params_format,
        ));
    }

    let proto_version = select_version(
        client.min_proto_version,
        client.max_proto_version,
        server.min_proto_version,
        server.max_proto_version,
    )
    .ok_or_else(|| {
        warn!(
            client_min = client.min_proto_version,
            client_max = client.max_proto_version,
            server_min = server.min_proto_version,
            server_max = server.max_proto_version,
            "No common protocol version"
        );
        ProtoError::UnsupportedVersion {
            client_min: client.min_proto_version,
            client_max: client.max_proto_version,
            server_min: server.min_proto_version,
            server_max: server.max_proto_version,
        }
    })?;

    if let Some(encoding) = &client.expected_encoding {
        if !encoding.eq_ignore_ascii_case(SERVER_ENCODING) {
            return Err(ProtoError::UnsupportedEncoding(encoding.clone()));
        }
    }

    let negotiated = Negotiated {
        proto_version,
        proto_format: client.proto_format,
        forward_changeset_origins: client.forward_changeset_origins && server.forward_origins,
        min_proto_version: server.min_proto_version,
        max_proto_version: server.max_proto_version,
        server_version: server.server_version.clone(),
    };

    info!(
        proto_version,
        proto_format = %negotiated.proto_format,
        forward_origins = negotiated.forward_changeset_origins,
        "Negotiated protocol"
    );

    Ok(negotiated)
}

fn pair(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn parse_u32(key: &str, value: &str) -> ProtoResult<u32> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> ProtoResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "t" | "true" | "on" | "1" | "yes" => Ok(true),
        "f" | "false" | "off" | "0" | "no" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ProtoError {
    ProtoError::InvalidParam {
        key: key.to_string(),
        value: value.to_string(),
    }
}
