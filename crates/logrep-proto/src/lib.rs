pub mod decode;
pub mod error;
pub mod proto;
pub mod relation_cache;
pub mod session;

pub use decode::{BeginMessage, CommitMessage, DecodedMessage, Decoder, OriginMessage};
pub use error::{ProtoError, ProtoResult};
pub use proto::negotiate::{
    negotiate, select_version, Negotiated, ServerCapabilities, StartupParams, SERVER_ENCODING,
};
pub use proto::{
    init_api, JsonProto, NativeProto, ProtoApi, ProtoFormat, PROTO_MIN_VERSION_NUM,
    PROTO_VERSION_NUM, STARTUP_PARAMS_FORMAT_FLAT, STARTUP_REPLY_FORMAT_FLAT,
};
pub use relation_cache::RelationCache;
pub use session::{ApplyOutcome, ApplyProgress, ApplySession, MemorySink, OutputSession, RowSink};
