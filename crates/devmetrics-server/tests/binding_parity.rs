//! The same input must land in the same status family on both bindings.

mod common;

use axum::http::StatusCode;
use common::*;
use devmetrics_common::codec;
use devmetrics_common::proto::metric_collector_server::MetricCollector;
use devmetrics_common::proto::{EnvelopeRequest, UpdateRequest};
use devmetrics_common::types::{MetricKind, MetricRecord, MetricValue};
use tonic::Code;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Family {
    Ok,
    Rejected,
    NotImplemented,
    NotFound,
    Internal,
}

fn http_family(status: StatusCode) -> Family {
    match status {
        StatusCode::OK => Family::Ok,
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => Family::Rejected,
        StatusCode::NOT_IMPLEMENTED => Family::NotImplemented,
        StatusCode::NOT_FOUND => Family::NotFound,
        StatusCode::INTERNAL_SERVER_ERROR => Family::Internal,
        other => panic!("unexpected HTTP status {other}"),
    }
}

fn grpc_family<T>(result: Result<T, tonic::Status>) -> Family {
    match result {
        Ok(_) => Family::Ok,
        Err(status) => match status.code() {
            Code::PermissionDenied => Family::Rejected,
            Code::Unimplemented => Family::NotImplemented,
            Code::NotFound => Family::NotFound,
            Code::Internal => Family::Internal,
            other => panic!("unexpected gRPC code {other:?}"),
        },
    }
}

fn contexts() -> (TestContext, TestContext) {
    let configure = |cfg: &mut devmetrics_server::config::ServerConfig| {
        cfg.key = Some(SECRET.to_string());
    };
    (
        build_test_context_with(configure).unwrap(),
        build_test_context_with(configure).unwrap(),
    )
}

#[tokio::test]
async fn plain_update_parity() {
    let cases = [
        ("gauge", "Alloc", "1.5", Family::Ok),
        ("counter", "PollCount", "3", Family::Ok),
        ("counter", "PollCount", "non", Family::Rejected),
        ("gauge", "Alloc", "1e", Family::Rejected),
        ("histogram", "Latency", "1", Family::NotImplemented),
    ];
    let (http, grpc) = contexts();

    for (mtype, name, value, expected) in cases {
        let resp = request_no_body(
            &http.app,
            "POST",
            &format!("/update/{mtype}/{name}/{value}"),
        )
        .await;
        let grpc_result = grpc
            .grpc
            .update(grpc_request(
                UpdateRequest {
                    metric_type: mtype.to_string(),
                    name: name.to_string(),
                    value: value.to_string(),
                },
                &[],
            ))
            .await;

        assert_eq!(http_family(resp.status), expected, "{mtype}/{name}/{value} over HTTP");
        assert_eq!(grpc_family(grpc_result), expected, "{mtype}/{name}/{value} over gRPC");
    }

    assert_eq!(http.service.list().len(), grpc.service.list().len());
}

#[tokio::test]
async fn batch_parity() {
    let signer = signer();
    let mut tampered = MetricValue::Gauge(1.0).to_record("Alloc", &signer);
    tampered.value = Some(9.0);
    let unknown = MetricRecord {
        id: "Odd".to_string(),
        mtype: "histogram".to_string(),
        delta: None,
        value: Some(1.0),
        hash: String::new(),
    };

    let cases: Vec<(&str, Vec<u8>, Vec<(&'static str, String)>, Family)> = vec![
        {
            let env = codec::encode_batch(
                &[MetricValue::Counter(2).to_record("PollCount", &signer)],
                None,
            )
            .unwrap();
            ("signed batch", env.body, env.headers.pairs(), Family::Ok)
        },
        {
            let env = codec::encode_batch(&[tampered], None).unwrap();
            ("tampered batch", env.body, env.headers.pairs(), Family::Rejected)
        },
        {
            let env = codec::encode_batch(&[unknown], None).unwrap();
            ("unknown type", env.body, env.headers.pairs(), Family::NotImplemented)
        },
        (
            "truncated json",
            b"[{\"id\":".to_vec(),
            Vec::new(),
            Family::Rejected,
        ),
        (
            "bad gzip",
            b"plain bytes".to_vec(),
            vec![("content-encoding", "gzip".to_string())],
            Family::Internal,
        ),
        {
            let env = codec::encode_batch(&[], Some(&encryptor())).unwrap();
            ("encrypted without key", env.body, env.headers.pairs(), Family::Internal)
        },
    ];
    let (http, grpc) = contexts();

    for (label, body, pairs, expected) in cases {
        let headers: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let resp = post_bytes(&http.app, "/updates", &headers, body.clone()).await;
        let grpc_result = grpc
            .grpc
            .updates_json(grpc_request(EnvelopeRequest { body }, &headers))
            .await;

        assert_eq!(http_family(resp.status), expected, "{label} over HTTP");
        assert_eq!(grpc_family(grpc_result), expected, "{label} over gRPC");
    }
}

#[tokio::test]
async fn value_json_parity() {
    let (http, grpc) = contexts();
    for ctx in [&http, &grpc] {
        ctx.service.update("gauge", "Alloc", "4").unwrap();
    }

    let cases = [
        (MetricRecord::query("Alloc", MetricKind::Gauge), Family::Ok),
        (MetricRecord::query("Alloc", MetricKind::Counter), Family::NotFound),
        (MetricRecord::query("Missing", MetricKind::Gauge), Family::NotFound),
    ];
    for (query, expected) in cases {
        let body = serde_json::to_vec(&query).unwrap();
        let resp = post_bytes(&http.app, "/value", &[], body.clone()).await;
        let grpc_result = grpc
            .grpc
            .value_json(grpc_request(EnvelopeRequest { body }, &[]))
            .await;

        assert_eq!(http_family(resp.status), expected, "{} over HTTP", query.id);
        assert_eq!(grpc_family(grpc_result), expected, "{} over gRPC", query.id);
    }
}

#[tokio::test]
async fn trusted_subnet_parity() {
    let configure = |cfg: &mut devmetrics_server::config::ServerConfig| {
        cfg.trusted_subnet = Some("10.0.0.0/8".parse().unwrap());
    };
    let http = build_test_context_with(configure).unwrap();
    let grpc = build_test_context_with(configure).unwrap();

    for (real_ip, expected) in [
        (None, Family::Rejected),
        (Some("garbage"), Family::Rejected),
        (Some("11.0.0.1"), Family::Rejected),
        (Some("10.20.30.40"), Family::Ok),
    ] {
        let headers: Vec<(&str, &str)> = real_ip.iter().map(|ip| ("x-real-ip", *ip)).collect();
        let resp = post_bytes(&http.app, "/updates", &headers, b"[]".to_vec()).await;
        let grpc_result = grpc
            .grpc
            .updates_json(grpc_request(EnvelopeRequest { body: b"[]".to_vec() }, &headers))
            .await;

        assert_eq!(http_family(resp.status), expected, "{real_ip:?} over HTTP");
        assert_eq!(grpc_family(grpc_result), expected, "{real_ip:?} over gRPC");
    }
}
