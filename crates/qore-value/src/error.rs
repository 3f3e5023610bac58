//! Errors surfaced directly to embedding Rust code, as opposed to
//! in-language failures which travel through [`crate::ExceptionSink`]
//! (see spec §7: "errors are values" routed through the sink; this type
//! is reserved for the handful of embedding-API calls that fail before
//! there is a sink to report into, e.g. registering a duplicate encoding).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("unknown encoding tag: {tag}")]
    UnknownEncoding { tag: String },

    #[error("encoding {tag} already registered")]
    DuplicateEncoding { tag: String },

    #[error("cannot convert {from} to {to}: {reason}")]
    EncodingConversion {
        from: String,
        to: String,
        reason: String,
    },
}
