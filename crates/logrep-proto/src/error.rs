use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error(
        "unsupported protocol version: client supports {client_min}..={client_max}, \
         server supports {server_min}..={server_max}"
    )]
    UnsupportedVersion {
        client_min: u32,
        client_max: u32,
        server_min: u32,
        server_max: u32,
    },

    #[error("unsupported startup parameter format {0}")]
    UnsupportedStartupFormat(u32),

    #[error("unsupported encoding '{0}', only UTF8 is supported")]
    UnsupportedEncoding(String),

    #[error("unknown protocol format '{0}'")]
    UnknownProtoFormat(String),

    #[error("invalid startup parameter {key}='{value}'")]
    InvalidParam { key: String, value: String },

    #[error("column {index} does not exist in relation {relation} ({natts} columns)")]
    UnknownColumn {
        relation: String,
        index: usize,
        natts: usize,
    },

    #[error("row has {found} values but relation {relation} has {expected} columns")]
    RowShape {
        relation: String,
        expected: usize,
        found: usize,
    },

    #[error("name '{0}' is too long for the wire format")]
    NameTooLong(String),

    #[error("cannot encode {0}")]
    Unrepresentable(String),

    #[error("invalid change event: {0}")]
    InvalidEvent(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("relation {0} not found in cache")]
    RelationNotFound(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] logrep_core::Error),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
