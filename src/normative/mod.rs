//! Normative code detection and the supersession resolver.

mod codes;
mod resolver;

pub use codes::{code_spans, detect_codes, normalize_code};
pub use resolver::{
    CodeStatus, NormativeCheck, NormativeResolver, ResolverError, load_normative_table,
};
