use crate::service::MetricsService;
use devmetrics_common::codec::{EnvelopeHeaders, REAL_IP};
use devmetrics_common::error::{ErrorKind, MetricError};
use devmetrics_common::proto::metric_collector_server::MetricCollector;
use devmetrics_common::proto::{
    EmptyRequest, EnvelopeRequest, EnvelopeResponse, ListResponse, StatusResponse, UpdateRequest,
    ValueRequest, ValueResponse,
};
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};

/// gRPC status for each failure class.
///
/// Value-format and signature failures map to `PermissionDenied`, where the
/// HTTP binding answers 400.
pub fn status_for(err: &MetricError) -> Status {
    let kind = err.kind();
    let message = kind.as_str();
    match kind {
        ErrorKind::BadRequest | ErrorKind::IpNotAllowed => Status::permission_denied(message),
        ErrorKind::NotImplemented => Status::unimplemented(message),
        ErrorKind::NotFound => Status::not_found(message),
        ErrorKind::InternalServer | ErrorKind::Decrypt | ErrorKind::Decompress => {
            Status::internal(message)
        }
    }
}

fn to_status(err: MetricError) -> Status {
    let status = status_for(&err);
    if status.code() == tonic::Code::Internal {
        tracing::error!(error = %err, "gRPC call failed");
    } else {
        tracing::debug!(error = %err, "gRPC call rejected");
    }
    status
}

pub fn envelope_headers(metadata: &MetadataMap) -> EnvelopeHeaders {
    EnvelopeHeaders::from_lookup(|name: &str| metadata.get(name).and_then(|v| v.to_str().ok()))
}

pub struct MetricCollectorImpl {
    service: Arc<MetricsService>,
}

impl MetricCollectorImpl {
    pub fn new(service: Arc<MetricsService>) -> Self {
        Self { service }
    }

    fn check_origin(&self, metadata: &MetadataMap) -> Result<(), Status> {
        let real_ip = metadata.get(REAL_IP).and_then(|v| v.to_str().ok());
        self.service.check_origin(real_ip).map_err(|e| {
            tracing::warn!(real_ip = real_ip.unwrap_or("-"), "gRPC call rejected: origin outside trusted subnet");
            to_status(e)
        })
    }
}

fn ok() -> StatusResponse {
    StatusResponse {
        result: "ok".to_string(),
    }
}

fn encode_record(record: &devmetrics_common::types::MetricRecord) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(record).map_err(|e| to_status(MetricError::Internal(e.to_string())))
}

#[tonic::async_trait]
impl MetricCollector for MetricCollectorImpl {
    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        self.check_origin(request.metadata())?;
        let req = request.into_inner();
        self.service
            .update(&req.metric_type, &req.name, &req.value)
            .map_err(to_status)?;
        self.service.persist_after_ingest().await;
        Ok(Response::new(ok()))
    }

    async fn update_json(
        &self,
        request: Request<EnvelopeRequest>,
    ) -> Result<Response<EnvelopeResponse>, Status> {
        self.check_origin(request.metadata())?;
        let headers = envelope_headers(request.metadata());
        let req = request.into_inner();
        let record = self
            .service
            .update_json(&req.body, &headers)
            .map_err(to_status)?;
        self.service.persist_after_ingest().await;
        Ok(Response::new(EnvelopeResponse {
            body: encode_record(&record)?,
        }))
    }

    async fn updates_json(
        &self,
        request: Request<EnvelopeRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        self.check_origin(request.metadata())?;
        let headers = envelope_headers(request.metadata());
        let req = request.into_inner();
        self.service
            .updates_json(&req.body, &headers)
            .map_err(to_status)?;
        self.service.persist_after_ingest().await;
        Ok(Response::new(ok()))
    }

    /// Plain value query. An unknown metric is reported as `Internal`,
    /// unlike `ValueJson`.
    async fn value(
        &self,
        request: Request<ValueRequest>,
    ) -> Result<Response<ValueResponse>, Status> {
        let req = request.into_inner();
        match self.service.value(&req.metric_type, &req.name) {
            Ok(value) => Ok(Response::new(ValueResponse { value })),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(error = %e, "gRPC value lookup missed");
                Err(Status::internal(e.kind().as_str()))
            }
            Err(e) => Err(to_status(e)),
        }
    }

    async fn value_json(
        &self,
        request: Request<EnvelopeRequest>,
    ) -> Result<Response<EnvelopeResponse>, Status> {
        let headers = envelope_headers(request.metadata());
        let req = request.into_inner();
        let record = self
            .service
            .value_json(&req.body, &headers)
            .map_err(to_status)?;
        Ok(Response::new(EnvelopeResponse {
            body: encode_record(&record)?,
        }))
    }

    async fn ping(
        &self,
        request: Request<EmptyRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        self.check_origin(request.metadata())?;
        self.service.ping().map_err(to_status)?;
        Ok(Response::new(ok()))
    }

    async fn list_metrics(
        &self,
        _request: Request<EmptyRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let mut metrics = self.service.list();
        metrics.sort();
        Ok(Response::new(ListResponse { metrics }))
    }
}
