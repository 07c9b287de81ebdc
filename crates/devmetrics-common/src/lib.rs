//! Shared building blocks for the devmetrics agent and server.
//!
//! The metric data model lives in [`types`], message authentication in
//! [`sign`], and the transport envelope (gzip + optional RSA) in [`codec`].
//! Both processes speak the same gRPC contract, generated into [`proto`].

pub mod codec;
pub mod error;
pub mod settings;
pub mod sign;
pub mod types;

pub mod proto {
    #![allow(clippy::pedantic)]
    #![allow(clippy::missing_errors_doc)]
    #![allow(clippy::doc_markdown)]
    #![allow(clippy::default_trait_access)]
    tonic::include_proto!("devmetrics");
}
