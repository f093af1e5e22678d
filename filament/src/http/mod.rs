//! HTTP request model: streaming header parser, request header fields,
//! MIME inference and the multipart/form-data body parser.

pub mod header;
pub mod mime;
pub mod multipart;
pub mod parser;
pub mod types;
